use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::mpsc;

use crate::domain::device::Device;
use crate::domain::ids::{ContainerName, ProcessId, StepId};
use crate::error::Result;

/// Adapter-side status of a submitted operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterStatus {
    Started,
    Running,
    Ok,
    Failed,
    Cancelled,
    Timeout,
}

impl AdapterStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AdapterStatus::Ok | AdapterStatus::Failed | AdapterStatus::Cancelled | AdapterStatus::Timeout)
    }
}

/// One element of an operation's observation stream.
#[derive(Debug, Clone)]
pub struct Observation {
    pub status: AdapterStatus,
    pub progress: f32,
    /// Return value of a producing operation; carried on the terminal `Ok`.
    pub value: Option<serde_json::Value>,
    pub message: Option<String>,
}

impl Observation {
    pub fn started() -> Observation {
        Observation { status: AdapterStatus::Started, progress: 0.0, value: None, message: None }
    }

    pub fn ok(value: Option<serde_json::Value>) -> Observation {
        Observation { status: AdapterStatus::Ok, progress: 1.0, value, message: None }
    }

    pub fn cancelled() -> Observation {
        Observation { status: AdapterStatus::Cancelled, progress: 0.0, value: None, message: None }
    }

    pub fn failed(message: impl Into<String>) -> Observation {
        Observation { status: AdapterStatus::Failed, progress: 0.0, value: None, message: Some(message.into()) }
    }
}

/// Everything an adapter needs to execute one operation. For a bundle this
/// carries the union of the member containers.
#[derive(Debug, Clone)]
pub struct StepDispatch {
    pub step_id: StepId,
    pub process: ProcessId,
    pub fct: String,
    pub device: Device,
    pub containers: Vec<ContainerName>,
    pub params: HashMap<String, serde_json::Value>,
    pub scheduled_duration: i64,
    pub is_movement: bool,
}

/// Cooperative cancellation signal to an adapter.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: mpsc::Sender<()>,
}

impl CancelHandle {
    pub fn pair() -> (CancelHandle, mpsc::Receiver<()>) {
        let (tx, rx) = mpsc::channel(1);
        (CancelHandle { tx }, rx)
    }

    /// Signals the adapter.
    ///
    /// # Returns
    /// `true` when the adapter is still listening; honoring the signal
    /// within the grace period remains the adapter's choice.
    pub async fn cancel(&self) -> bool {
        self.tx.send(()).await.is_ok()
    }
}

/// Live view on one in-flight operation.
pub struct AdapterHandle {
    pub observations: mpsc::Receiver<Observation>,
    pub canceller: CancelHandle,
}

/// Translates a scheduled operation into a concrete device command. One
/// implementation per device kind; wire-protocol concerns stay behind this
/// trait.
#[async_trait]
pub trait DeviceAdapter: Send + Sync + std::fmt::Debug {
    async fn submit(&self, dispatch: StepDispatch) -> Result<AdapterHandle>;
}
