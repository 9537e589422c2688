use async_trait::async_trait;
use rand::Rng;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::domain::executor::adapter::{AdapterHandle, CancelHandle, DeviceAdapter, Observation, StepDispatch};
use crate::error::Result;

/// Parameter key a test or demo can set to pin the value a simulated
/// producing operation returns.
pub const PARAM_SIM_VALUE: &str = "sim_value";

/// Parameter key that overrides how long the simulated operation actually
/// takes (model seconds), e.g. to exercise deviation handling.
pub const PARAM_SIM_DURATION: &str = "sim_duration_s";

/// Adapter substituted for every device kind while simulation is active.
///
/// Sleeps for the scheduled duration divided by the speed factor, then
/// reports `ok` with a synthesized value. Honors cooperative cancellation
/// immediately.
#[derive(Debug, Clone)]
pub struct SimulatedAdapter {
    /// Time acceleration; 1.0 simulates in real time.
    speed: f64,
}

impl SimulatedAdapter {
    pub fn new(speed: f64) -> SimulatedAdapter {
        SimulatedAdapter { speed: speed.max(0.001) }
    }

    fn synthesize_value(dispatch: &StepDispatch) -> Option<serde_json::Value> {
        if let Some(pinned) = dispatch.params.get(PARAM_SIM_VALUE) {
            return Some(pinned.clone());
        }
        // Measurement-style operations produce a reading; everything else
        // produces nothing.
        if dispatch.fct.starts_with("measure") || dispatch.fct.starts_with("read") {
            let mut rng = rand::rng();
            return Some(serde_json::json!(rng.random_range(0.0..1.0)));
        }
        None
    }

    fn model_duration(dispatch: &StepDispatch) -> i64 {
        dispatch
            .params
            .get(PARAM_SIM_DURATION)
            .and_then(|v| v.as_i64())
            .unwrap_or(dispatch.scheduled_duration)
            .max(0)
    }
}

#[async_trait]
impl DeviceAdapter for SimulatedAdapter {
    async fn submit(&self, dispatch: StepDispatch) -> Result<AdapterHandle> {
        let (obs_tx, obs_rx) = mpsc::channel(8);
        let (canceller, mut cancel_rx) = CancelHandle::pair();

        let sleep_ms = ((Self::model_duration(&dispatch) as f64) * 1000.0 / self.speed) as u64;
        let value = Self::synthesize_value(&dispatch);

        tokio::spawn(async move {
            let _ = obs_tx.send(Observation::started()).await;

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(sleep_ms)) => {
                    log::debug!("Simulated step '{}' on '{}' finished after {}ms.", dispatch.step_id, dispatch.device.id, sleep_ms);
                    let _ = obs_tx.send(Observation::ok(value)).await;
                }
                _ = cancel_rx.recv() => {
                    log::info!("Simulated step '{}' on '{}' cancelled.", dispatch.step_id, dispatch.device.id);
                    let _ = obs_tx.send(Observation::cancelled()).await;
                }
            }
        });

        Ok(AdapterHandle { observations: obs_rx, canceller })
    }
}

/// Simulated adapter that never honors cancellation: the operation always
/// runs to completion. Used to exercise the "completion wins" path.
#[derive(Debug, Clone)]
pub struct StubbornSimulatedAdapter {
    speed: f64,
}

impl StubbornSimulatedAdapter {
    pub fn new(speed: f64) -> StubbornSimulatedAdapter {
        StubbornSimulatedAdapter { speed: speed.max(0.001) }
    }
}

#[async_trait]
impl DeviceAdapter for StubbornSimulatedAdapter {
    async fn submit(&self, dispatch: StepDispatch) -> Result<AdapterHandle> {
        let (obs_tx, obs_rx) = mpsc::channel(8);
        let (canceller, mut cancel_rx) = CancelHandle::pair();

        let sleep_ms = ((SimulatedAdapter::model_duration(&dispatch) as f64) * 1000.0 / self.speed) as u64;
        let value = SimulatedAdapter::synthesize_value(&dispatch);

        tokio::spawn(async move {
            let _ = obs_tx.send(Observation::started()).await;
            // Swallow the cancel signal; a completed physical operation is a
            // fact, not a choice.
            tokio::spawn(async move { while cancel_rx.recv().await.is_some() {} });
            tokio::time::sleep(Duration::from_millis(sleep_ms)).await;
            let _ = obs_tx.send(Observation::ok(value)).await;
        });

        Ok(AdapterHandle { observations: obs_rx, canceller })
    }
}
