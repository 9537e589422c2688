use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use crate::domain::clock::SystemClock;
use crate::domain::device::{Device, DeviceId, DeviceKind, Position};
use crate::domain::estimator::{EstimatorConfig, StepTemplate};
use crate::domain::executor::adapter::{AdapterStatus, CancelHandle, DeviceAdapter, Observation, StepDispatch};
use crate::domain::executor::simulation::SimulatedAdapter;
use crate::domain::graph::WorkflowGraph;
use crate::domain::graph::node::{FCT_LID, FCT_UNLID, NodeKey, OperationNode, PARAM_DEST_SLOT, PARAM_LID_DEVICE, PARAM_LID_SLOT};
use crate::domain::ids::{ContainerName, ExperimentId, ProcessId, StepId};
use crate::domain::instance::scheduling_instance::{ProcessState, SchedulingInstance, StepOutcome, StepState};
use crate::domain::scheduler::list_scheduler::{SchedulerConfig, compute_plan};
use crate::domain::scheduler::plan::{Plan, PlanMode};
use crate::domain::status_store::history::{HistoryRecord, MovementInfo, StepStatus};
use crate::domain::status_store::store::StatusStore;
use crate::error::{Error, Result};

pub const FCT_UNLOAD: &str = "unload";

/// Parameter that makes a movement commit re-seat the parked lid after the
/// move.
pub const PARAM_RELID: &str = "relid";

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Seconds past the scheduled duration before a short re-plan fires.
    pub deviation_slack_s: i64,
    /// Multiplier on the expected duration before a step times out.
    pub timeout_factor: f64,
    pub timeout_factor_by_kind: HashMap<DeviceKind, f64>,
    /// Grace period for cooperative cancellation.
    pub cancel_grace_s: i64,
    pub tick_interval_ms: u64,
    pub estimator: EstimatorConfig,
    pub scheduler: SchedulerConfig,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        ExecutorConfig {
            deviation_slack_s: 10,
            timeout_factor: 2.0,
            timeout_factor_by_kind: HashMap::new(),
            cancel_grace_s: 5,
            tick_interval_ms: 100,
            estimator: EstimatorConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

/// Target of a pause/resume/cancel command.
#[derive(Debug, Clone)]
pub enum Scope {
    Global,
    Process(ProcessId),
}

/// Per-process status answer of `query_status`.
#[derive(Debug, Clone)]
pub struct StatusReport {
    pub process: ProcessId,
    pub experiment: ExperimentId,
    pub state: ProcessState,
    pub last_executed: Option<StepId>,
    pub next_planned: Option<StepId>,
    /// Expected finish of the whole process, seconds since epoch.
    pub eta_s: Option<i64>,
    pub error: Option<String>,
    pub steps: Vec<(StepId, StepState)>,
    /// Planned finish per not-yet-completed step, from the current plan.
    pub step_etas: Vec<(StepId, i64)>,
}

/// Commands into the core loop.
pub enum CoreCommand {
    SubmitProcess { graph: WorkflowGraph, priority: i32, delay_s: Option<i64>, reply: oneshot::Sender<Result<ExperimentId>> },
    Start { processes: Vec<ProcessId>, reply: oneshot::Sender<Result<()>> },
    Pause { scope: Scope, reply: oneshot::Sender<Result<()>> },
    Resume { scope: Scope, reply: oneshot::Sender<Result<()>> },
    Cancel { scope: Scope, reply: oneshot::Sender<Result<()>> },
    EnableSimulation { speed: f64, reply: oneshot::Sender<Result<()>> },
    DisableSimulation { reply: oneshot::Sender<Result<()>> },
    QueryStatus { process: Option<ProcessId>, reply: oneshot::Sender<Vec<StatusReport>> },
    ConfigureLab { devices: Vec<Device>, reply: oneshot::Sender<Result<()>> },
    Shutdown { reply: oneshot::Sender<()> },
}

/// Events from adapter observation pumps into the core loop.
enum CoreEvent {
    Observation { step_id: StepId, observation: Observation },
    AdapterLost { step_id: StepId, message: String },
}

#[derive(Debug, Clone)]
struct BundleMember {
    process: ProcessId,
    node: NodeKey,
    step_id: StepId,
    containers: Vec<ContainerName>,
    fct: String,
    params: HashMap<String, serde_json::Value>,
    is_movement: bool,
    expected_duration: i64,
}

struct InFlight {
    members: Vec<BundleMember>,
    device: Device,
    started_at: i64,
    scheduled_duration: i64,
    canceller: CancelHandle,
    deviation_flagged: bool,
    is_simulation: bool,
    /// When a cooperative cancel was signalled, if any.
    cancel_requested_at: Option<i64>,
}

/// Client handle onto a running executor core loop.
#[derive(Clone)]
pub struct ExecutorHandle {
    tx: mpsc::Sender<CoreCommand>,
}

macro_rules! ask {
    ($self:expr, $variant:ident { $($field:ident : $value:expr),* $(,)? }) => {{
        let (reply, rx) = oneshot::channel();
        $self
            .tx
            .send(CoreCommand::$variant { $($field: $value,)* reply })
            .await
            .map_err(|_| Error::Cancelled("Executor core loop is gone.".to_string()))?;
        rx.await.map_err(|_| Error::Cancelled("Executor dropped the reply.".to_string()))?
    }};
}

impl ExecutorHandle {
    pub async fn submit_process(&self, graph: WorkflowGraph, priority: i32, delay_s: Option<i64>) -> Result<ExperimentId> {
        ask!(self, SubmitProcess { graph: graph, priority: priority, delay_s: delay_s })
    }

    pub async fn start(&self, processes: Vec<ProcessId>) -> Result<()> {
        ask!(self, Start { processes: processes })
    }

    pub async fn pause(&self, scope: Scope) -> Result<()> {
        ask!(self, Pause { scope: scope })
    }

    pub async fn resume(&self, scope: Scope) -> Result<()> {
        ask!(self, Resume { scope: scope })
    }

    pub async fn cancel(&self, scope: Scope) -> Result<()> {
        ask!(self, Cancel { scope: scope })
    }

    pub async fn enable_simulation(&self, speed: f64) -> Result<()> {
        ask!(self, EnableSimulation { speed: speed })
    }

    pub async fn disable_simulation(&self) -> Result<()> {
        ask!(self, DisableSimulation {})
    }

    pub async fn query_status(&self, process: Option<ProcessId>) -> Result<Vec<StatusReport>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(CoreCommand::QueryStatus { process, reply })
            .await
            .map_err(|_| Error::Cancelled("Executor core loop is gone.".to_string()))?;
        rx.await.map_err(|_| Error::Cancelled("Executor dropped the reply.".to_string()))
    }

    pub async fn configure_lab(&self, devices: Vec<Device>) -> Result<()> {
        ask!(self, ConfigureLab { devices: devices })
    }

    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(CoreCommand::Shutdown { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }

    pub fn sender(&self) -> mpsc::Sender<CoreCommand> {
        self.tx.clone()
    }
}

/// The single writer over the Status Store and the Scheduling Instance.
///
/// All mutable state is owned here; device adapters run as tasks and talk
/// back through the event channel. The loop blocks only on its inbox.
pub struct Executor {
    store: StatusStore,
    instance: SchedulingInstance,
    plan: Plan,
    clock: Box<dyn SystemClock>,
    config: ExecutorConfig,
    adapters: HashMap<DeviceKind, Arc<dyn DeviceAdapter>>,

    /// Simulation speed while simulation mode is active.
    simulation: Option<f64>,
    /// Accelerated model clock; present exactly while simulation is active.
    sim_clock: Option<crate::domain::clock::ScaledClock>,

    in_flight: HashMap<StepId, InFlight>,
    /// Terminal steps whose late observations must be ignored.
    finalized: HashSet<StepId>,
    held: HashSet<ContainerName>,
    paused: bool,
    plan_stale: bool,
    affected: HashSet<ProcessId>,

    cmd_rx: mpsc::Receiver<CoreCommand>,
    event_tx: mpsc::Sender<CoreEvent>,
    event_rx: mpsc::Receiver<CoreEvent>,
}

impl Executor {
    pub fn new(
        store: StatusStore,
        clock: Box<dyn SystemClock>,
        adapters: HashMap<DeviceKind, Arc<dyn DeviceAdapter>>,
        config: ExecutorConfig,
    ) -> (Executor, ExecutorHandle) {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (event_tx, event_rx) = mpsc::channel(256);
        let now = clock.now_s();

        let executor = Executor {
            store,
            instance: SchedulingInstance::new(),
            plan: Plan::empty(now, PlanMode::Long),
            clock,
            config,
            adapters,
            simulation: None,
            sim_clock: None,
            in_flight: HashMap::new(),
            finalized: HashSet::new(),
            held: HashSet::new(),
            paused: false,
            plan_stale: false,
            affected: HashSet::new(),
            cmd_rx,
            event_tx,
            event_rx,
        };
        (executor, ExecutorHandle { tx: cmd_tx })
    }

    /// Model time: the base clock, or the accelerated clock while
    /// simulation is active. All scheduling, commit and history timestamps
    /// come from here.
    fn now(&self) -> i64 {
        match &self.sim_clock {
            Some(scaled) => scaled.now_s(),
            None => self.clock.now_s(),
        }
    }

    /// Runs the core loop until a `Shutdown` command arrives.
    pub async fn run(mut self) {
        let mut tick = tokio::time::interval(Duration::from_millis(self.config.tick_interval_ms));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                Some(cmd) = self.cmd_rx.recv() => {
                    if self.handle_command(cmd).await {
                        break;
                    }
                }
                Some(event) = self.event_rx.recv() => self.handle_event(event).await,
                _ = tick.tick() => self.on_tick().await,
            }
        }
        log::info!("Executor core loop stopped.");
    }

    // ---- Command handling ----

    async fn handle_command(&mut self, cmd: CoreCommand) -> bool {
        match cmd {
            CoreCommand::SubmitProcess { graph, priority, delay_s, reply } => {
                let _ = reply.send(self.submit_process(graph, priority, delay_s));
            }
            CoreCommand::Start { processes, reply } => {
                let mut result = Ok(());
                for process in &processes {
                    if let Err(e) = self.instance.start(process) {
                        result = Err(e);
                    }
                }
                self.plan_stale = true;
                let _ = reply.send(result);
            }
            CoreCommand::Pause { scope, reply } => {
                let result = match scope {
                    Scope::Global => {
                        self.paused = true;
                        log::info!("Global pause: in-flight steps continue, no new dispatches.");
                        Ok(())
                    }
                    Scope::Process(process) => self.instance.pause(&process),
                };
                let _ = reply.send(result);
            }
            CoreCommand::Resume { scope, reply } => {
                let result = match scope {
                    Scope::Global => {
                        self.paused = false;
                        Ok(())
                    }
                    Scope::Process(process) => self.instance.start(&process),
                };
                let _ = reply.send(result);
            }
            CoreCommand::Cancel { scope, reply } => {
                let result = match scope {
                    Scope::Global => {
                        for process in self.instance.live_process_ids() {
                            self.cancel_process(&process).await;
                        }
                        Ok(())
                    }
                    Scope::Process(process) => {
                        self.cancel_process(&process).await;
                        Ok(())
                    }
                };
                self.plan_stale = true;
                let _ = reply.send(result);
            }
            CoreCommand::EnableSimulation { speed, reply } => {
                log::info!("Simulation enabled at {}x.", speed);
                let speed = speed.max(0.001);
                self.simulation = Some(speed);
                // Model time accelerates from this moment on.
                self.sim_clock = Some(crate::domain::clock::ScaledClock::new(self.clock.clone(), speed));
                let _ = reply.send(Ok(()));
            }
            CoreCommand::DisableSimulation { reply } => {
                let result = if self.in_flight.is_empty() {
                    self.simulation = None;
                    self.sim_clock = None;
                    Ok(())
                } else {
                    Err(Error::Cancelled("Cannot leave simulation mode with simulated steps in flight.".to_string()))
                };
                let _ = reply.send(result);
            }
            CoreCommand::QueryStatus { process, reply } => {
                let _ = reply.send(self.build_reports(process));
            }
            CoreCommand::ConfigureLab { devices, reply } => {
                let result = if self.in_flight.is_empty() && self.instance.live_process_ids().is_empty() {
                    self.store.replace_devices(devices);
                    Ok(())
                } else {
                    Err(Error::ConfigError("Cannot replace the device catalogue while work is live.".to_string()))
                };
                let _ = reply.send(result);
            }
            CoreCommand::Shutdown { reply } => {
                let _ = reply.send(());
                return true;
            }
        }
        false
    }

    fn submit_process(&mut self, mut graph: WorkflowGraph, priority: i32, delay_s: Option<i64>) -> Result<ExperimentId> {
        let now = self.now();

        // Register labware containers that are not tracked yet; a different
        // container already sitting on a claimed starting position rejects
        // the submission.
        for (_, labware) in graph.labware() {
            match self.store.container(&labware.container) {
                Some(existing) => {
                    if existing.current_pos != labware.start {
                        log::warn!(
                            "Labware '{}' declared at {} but tracked at {}; using the tracked position.",
                            labware.container,
                            labware.start,
                            existing.current_pos
                        );
                    }
                }
                None => {
                    let mut spec = crate::domain::container::ContainerSpec::new(labware.container.clone(), labware.start.clone());
                    spec.lidded = labware.lidded;
                    spec.labware_type = labware.labware_type.clone();
                    self.store.add_container(spec)?;
                }
            }
        }

        // Stamp durations from history before the first plan sees the graph.
        let store = self.store.clone();
        let estimator_config = self.config.estimator.clone();
        graph.annotate_durations(|op| {
            let template = StepTemplate { fct: op.fct.clone(), params: op.params.clone(), movement: None };
            store.estimate_duration(&template, estimator_config.default_confidence, &estimator_config)
        });

        let delay_until = delay_s.map(|d| now + d);
        let experiment = self.instance.submit(graph, priority, delay_until)?;

        // Initial planning of a new workflow is the long mode's job.
        self.replan(PlanMode::Long);
        Ok(experiment)
    }

    async fn cancel_process(&mut self, process: &ProcessId) {
        match self.instance.cancel(process) {
            Ok(dropped) => {
                log::info!("Cancel of '{}' dropped {} queued steps.", process, dropped.len());
            }
            Err(e) => {
                log::warn!("Cancel of unknown process '{}': {}", process, e);
                return;
            }
        }

        // Cooperative cancel of the process's in-flight steps. Steps whose
        // adapters ignore the signal run to completion and still commit.
        let now = self.now();
        for (step_id, inflight) in self.in_flight.iter_mut() {
            if inflight.members.iter().any(|m| m.process == *process) {
                inflight.cancel_requested_at = Some(now);
                let canceller = inflight.canceller.clone();
                let step = step_id.clone();
                tokio::spawn(async move {
                    if !canceller.cancel().await {
                        log::warn!("Adapter for step '{}' no longer listens to cancellation.", step);
                    }
                });
            }
        }
    }

    // ---- Event handling ----

    async fn handle_event(&mut self, event: CoreEvent) {
        match event {
            CoreEvent::Observation { step_id, observation } => {
                if self.finalized.contains(&step_id) {
                    log::debug!("Late observation for finalized step '{}' ignored.", step_id);
                    return;
                }
                match observation.status {
                    AdapterStatus::Started | AdapterStatus::Running => {
                        log::debug!("Step '{}' progress {:.0}%.", step_id, observation.progress * 100.0);
                    }
                    AdapterStatus::Ok => self.commit_ok(&step_id, observation.value),
                    AdapterStatus::Failed => self.finalize_failed(&step_id, observation.message.unwrap_or_else(|| "adapter failure".to_string())),
                    AdapterStatus::Timeout => self.finalize_failed(&step_id, "adapter timeout".to_string()),
                    AdapterStatus::Cancelled => self.finalize_cancelled(&step_id),
                }
            }
            CoreEvent::AdapterLost { step_id, message } => {
                if self.finalized.contains(&step_id) {
                    return;
                }
                // Lost transport counts as a step failure with a specific cause.
                let device = self.in_flight.get(&step_id).map(|f| f.device.id.clone()).unwrap_or_else(|| DeviceId::new("unknown"));
                log::error!("TransportError: step '{}' on '{}': {}", step_id, device, message);
                self.finalize_failed(&step_id, format!("transport error: {}", message));
            }
        }
    }

    /// Commits all state changes of a successful step atomically with
    /// respect to the store's invariants, then feeds the outcome back so
    /// branches resolve, and schedules a short re-plan.
    fn commit_ok(&mut self, step_id: &StepId, value: Option<serde_json::Value>) {
        let Some(inflight) = self.in_flight.remove(step_id) else { return };
        self.finalized.insert(step_id.clone());
        let now = self.now();
        let finish = now.max(inflight.started_at);

        for member in &inflight.members {
            let movement = match self.apply_member_effects(member, &inflight.device) {
                Ok(movement) => movement,
                Err(e) => {
                    log::error!("CommitRejected: step '{}' could not commit: {}", member.step_id, e);
                    self.record_member(member, &inflight, inflight.started_at, finish, StepStatus::Failed, None, None);
                    self.fail_member(member, format!("commit rejected: {}", e));
                    continue;
                }
            };

            self.record_member(member, &inflight, inflight.started_at, finish, StepStatus::Ok, value.clone(), movement);

            let outcome = StepOutcome { status: StepStatus::Ok, value: value.clone(), start_s: inflight.started_at, finish_s: finish };
            match self.instance.on_complete(&member.process, member.node, &outcome) {
                Ok(pruned) => {
                    if !pruned.is_empty() {
                        log::info!("Branch resolution pruned {} nodes of process '{}'.", pruned.len(), member.process);
                    }
                }
                Err(e) => log::error!("Completion bookkeeping failed for '{}': {}", member.step_id, e),
            }
            self.affected.insert(member.process.clone());
        }

        self.release(&inflight);
        self.plan_stale = true;
    }

    /// Store mutations implied by one committed member: lid transitions and
    /// movements. Returns the movement record for history, if any.
    fn apply_member_effects(&mut self, member: &BundleMember, device: &Device) -> Result<Option<MovementInfo>> {
        // Built-in lid operations.
        if member.fct == FCT_UNLID {
            let park = param_position(&member.params)?;
            for container in &member.containers {
                self.store.unlid(container, &park)?;
            }
            return Ok(None);
        }
        if member.fct == FCT_LID {
            let expected = param_position(&member.params).ok();
            for container in &member.containers {
                self.store.lid(container, expected.as_ref())?;
            }
            return Ok(None);
        }
        if member.fct == FCT_UNLOAD {
            for container in &member.containers {
                self.store.remove_container(container)?;
            }
            return Ok(None);
        }

        if !member.is_movement {
            return Ok(None);
        }

        let mut movement = None;
        for container in &member.containers {
            let tracked = self.store.container(container).ok_or_else(|| Error::UnknownContainer(container.clone()))?;
            let origin = tracked.current_pos.clone();

            // Lid choreography around a move. Parking at the plate's own
            // position only works once the plate has left it, so that case
            // unlids after the move; re-seating a parked lid happens before
            // the move so a lid parked on the destination frees it in time.
            let park = if member.params.contains_key(PARAM_LID_DEVICE) { Some(param_position(&member.params)?) } else { None };
            if let Some(park_pos) = &park {
                if *park_pos != origin {
                    self.store.unlid(container, park_pos)?;
                }
            }
            if member.params.get(PARAM_RELID).and_then(|v| v.as_bool()).unwrap_or(false) {
                self.store.lid(container, None)?;
            }

            let slot = match member.params.get(PARAM_DEST_SLOT).and_then(|v| v.as_u64()) {
                Some(slot) => slot as u32,
                None => self
                    .store
                    .free_slot(&device.id, tracked.labware_type.as_deref())
                    .ok_or_else(|| Error::conflict(crate::error::StateConflictKind::DestOccupied, format!("No free slot on '{}'.", device.id)))?,
            };
            let destination = Position { device: device.id.clone(), slot };
            self.store.move_container(&origin, &destination, tracked.barcode.as_deref())?;

            if let Some(park_pos) = &park {
                if *park_pos == origin {
                    self.store.unlid(container, park_pos)?;
                }
            }

            let source_kind = self.store.device(&origin.device).map(|d| d.kind).unwrap_or(device.kind);
            let lidded = self.store.container(container).map(|c| c.lidded).unwrap_or(false);
            movement = Some(MovementInfo { origin, destination, source_kind, target_kind: device.kind, lidded });
        }
        Ok(movement)
    }

    fn finalize_failed(&mut self, step_id: &StepId, message: String) {
        let Some(inflight) = self.in_flight.remove(step_id) else { return };
        self.finalized.insert(step_id.clone());
        let now = self.now();

        log::error!("StepFailure: '{}' on '{}': {}", step_id, inflight.device.id, message);

        for member in &inflight.members {
            self.record_member(member, &inflight, inflight.started_at, now, StepStatus::Failed, None, None);
            self.fail_member(member, message.clone());
        }
        self.release(&inflight);
        self.plan_stale = true;
    }

    fn fail_member(&mut self, member: &BundleMember, message: String) {
        let outcome = StepOutcome { status: StepStatus::Failed, value: None, start_s: 0, finish_s: 0 };
        let _ = self.instance.on_complete(&member.process, member.node, &outcome);
        if let Some(p) = self.instance.process(&member.process) {
            if p.state == ProcessState::Failed {
                log::error!("Process '{}' failed: {}", member.process, message);
            }
        }
        self.affected.insert(member.process.clone());
    }

    fn finalize_cancelled(&mut self, step_id: &StepId) {
        let Some(inflight) = self.in_flight.remove(step_id) else { return };
        self.finalized.insert(step_id.clone());
        let now = self.now();

        for member in &inflight.members {
            // The cancel won: no commit, only the terminal history record.
            self.record_member(member, &inflight, inflight.started_at, now, StepStatus::Cancelled, None, None);
            let outcome = StepOutcome { status: StepStatus::Cancelled, value: None, start_s: inflight.started_at, finish_s: now };
            let _ = self.instance.on_complete(&member.process, member.node, &outcome);
        }
        self.release(&inflight);
        self.plan_stale = true;
    }

    fn record_member(
        &self,
        member: &BundleMember,
        inflight: &InFlight,
        start: i64,
        finish: i64,
        status: StepStatus,
        value: Option<serde_json::Value>,
        movement: Option<MovementInfo>,
    ) {
        let experiment = self
            .instance
            .process(&member.process)
            .map(|p| p.experiment.clone())
            .unwrap_or_else(|| ExperimentId::new("unknown"));
        self.store.record_step(HistoryRecord {
            step: member.step_id.clone(),
            process: member.process.clone(),
            experiment,
            fct: member.fct.clone(),
            device: inflight.device.id.clone(),
            containers: member.containers.clone(),
            start_s: start,
            finish_s: finish.max(start),
            status,
            value,
            params: member.params.clone(),
            movement,
            is_simulation: inflight.is_simulation,
        });
    }

    fn release(&mut self, inflight: &InFlight) {
        for member in &inflight.members {
            for container in &member.containers {
                self.held.remove(container);
            }
        }
    }

    // ---- Tick: deviation, timeout, re-plan, dispatch ----

    async fn on_tick(&mut self) {
        let now = self.now();

        let mut timed_out: Vec<StepId> = Vec::new();
        for (step_id, inflight) in self.in_flight.iter_mut() {
            // started_at and now share the same (possibly accelerated)
            // timebase, so this is model seconds.
            let elapsed = now - inflight.started_at;
            let expected: i64 = inflight.members.iter().map(|m| m.expected_duration).max().unwrap_or(inflight.scheduled_duration);
            let factor = self
                .config
                .timeout_factor_by_kind
                .get(&inflight.device.kind)
                .copied()
                .unwrap_or(self.config.timeout_factor);

            // Absolute slack on top of the factor keeps short steps from
            // racing their own completion under a coarse tick.
            let timeout_at = expected as f64 * factor + self.config.deviation_slack_s as f64;
            if elapsed as f64 > timeout_at {
                timed_out.push(step_id.clone());
            } else if !inflight.deviation_flagged && elapsed > inflight.scheduled_duration + self.config.deviation_slack_s {
                inflight.deviation_flagged = true;
                log::warn!(
                    "Deviation: step '{}' at {}s exceeds its scheduled {}s (+{}s slack); re-planning.",
                    step_id,
                    elapsed,
                    inflight.scheduled_duration,
                    self.config.deviation_slack_s
                );
                self.plan_stale = true;
                for member in &inflight.members {
                    self.affected.insert(member.process.clone());
                }
            }

            if let Some(requested) = inflight.cancel_requested_at.take() {
                if now - requested > self.config.cancel_grace_s {
                    // Past the grace period the operation is treated as
                    // committed-to-finish; its eventual outcome still lands.
                    log::warn!("Step '{}' ignored its cancel signal for {}s; letting it finish.", step_id, now - requested);
                } else {
                    inflight.cancel_requested_at = Some(requested);
                }
            }
        }

        for step_id in timed_out {
            if let Some(inflight) = self.in_flight.get(&step_id) {
                let canceller = inflight.canceller.clone();
                tokio::spawn(async move {
                    let _ = canceller.cancel().await;
                });
            }
            self.finalize_failed(&step_id, "timeout exceeded".to_string());
        }

        // Deferred bundles need a periodic look so their deadline can fire.
        if !self.plan_stale && !self.plan.deferred.is_empty() && now - self.plan.computed_at >= 1 {
            self.plan_stale = true;
        }

        if self.plan_stale {
            self.replan(PlanMode::Short);
        }

        self.dispatch_ready(now).await;
    }

    fn replan(&mut self, mode: PlanMode) {
        let now = self.now();
        let snapshot = self.instance.snapshot(&self.store, now);
        let affected = std::mem::take(&mut self.affected);
        let outcome = compute_plan(&snapshot, mode, Some(&self.plan), &affected, &self.config.scheduler);

        for error in outcome.errors {
            if let Error::Unschedulable { process, reason } = error {
                self.instance.fail(&process, format!("unschedulable: {}", reason));
            }
        }

        // Deferred steps start their bundle-deadline clock now.
        for step_id in &outcome.plan.deferred {
            self.instance.mark_deferred_by_step(step_id, now);
        }

        self.plan = outcome.plan;
        self.plan_stale = false;

        // Blocked steps get a fresh chance under the new plan.
        for process in self.instance.live_process_ids() {
            let blocked: Vec<NodeKey> = match self.instance.process(&process) {
                Some(p) => p.step_states.iter().filter(|(_, s)| **s == StepState::Blocked).map(|(k, _)| *k).collect(),
                None => continue,
            };
            for node in blocked {
                self.instance.set_step_state(&process, node, StepState::Ready);
            }
        }
    }

    async fn dispatch_ready(&mut self, now: i64) {
        if self.paused {
            return;
        }

        let ready = self.instance.ready_steps(now, &self.held);
        let mut dispatched_bundles: HashSet<StepId> = HashSet::new();

        for ready_step in ready {
            if self.in_flight.contains_key(&ready_step.step_id) {
                continue;
            }
            let Some(assignment) = self.plan.assignment(&ready_step.step_id).cloned() else {
                if self.plan.is_deferred(&ready_step.step_id) {
                    self.instance.mark_deferred(&ready_step.process, ready_step.node, now);
                } else {
                    // Ready work the plan does not know about: re-plan.
                    self.plan_stale = true;
                    self.affected.insert(ready_step.process.clone());
                }
                continue;
            };
            if assignment.earliest_start > now {
                continue;
            }

            // A bundle dispatches once, as one operation, when all members
            // are ready.
            if let Some(bundle_id) = &assignment.bundle {
                let lead = self
                    .plan
                    .assignments
                    .values()
                    .filter(|a| a.bundle.as_ref() == Some(bundle_id))
                    .map(|a| a.step_id.clone())
                    .min()
                    .expect("bundle has members");
                if dispatched_bundles.contains(&lead) || self.in_flight.contains_key(&lead) {
                    continue;
                }
                let member_ids: Vec<StepId> = self
                    .plan
                    .assignments
                    .values()
                    .filter(|a| a.bundle.as_ref() == Some(bundle_id))
                    .map(|a| a.step_id.clone())
                    .collect();
                let ready_now = self.instance.ready_steps(now, &self.held);
                let all_ready = member_ids.iter().all(|m| ready_now.iter().any(|r| r.step_id == *m));
                if !all_ready {
                    continue;
                }
                dispatched_bundles.insert(lead.clone());
                self.dispatch_assignment(&lead, &member_ids, now).await;
                continue;
            }

            let ids = vec![ready_step.step_id.clone()];
            self.dispatch_assignment(&ready_step.step_id, &ids, now).await;
        }
    }

    /// Precondition checks, adapter selection and submission for one
    /// operation (single step or whole bundle).
    async fn dispatch_assignment(&mut self, lead: &StepId, member_ids: &[StepId], now: i64) {
        let Some(assignment) = self.plan.assignment(lead).cloned() else { return };
        let Some(device) = self.store.device(&assignment.device) else {
            log::error!("Assigned device '{}' vanished; re-planning.", assignment.device);
            self.plan_stale = true;
            return;
        };

        let mut members: Vec<BundleMember> = Vec::new();
        for step_id in member_ids {
            let Some(a) = self.plan.assignment(step_id) else { continue };
            let Some(p) = self.instance.process(&a.process) else { continue };
            let Some(op) = p.graph.node(a.node).as_operation() else { continue };
            members.push(BundleMember {
                process: a.process.clone(),
                node: a.node,
                step_id: step_id.clone(),
                containers: op.containers.clone(),
                fct: op.fct.clone(),
                params: op.params.clone(),
                is_movement: op.is_movement,
                expected_duration: op.expected_duration,
            });
        }
        if members.is_empty() {
            return;
        }

        // Containers claimed by a step dispatched earlier in this very tick
        // are off limits until it finishes.
        if members.iter().any(|m| m.containers.iter().any(|c| self.held.contains(c))) {
            return;
        }

        // Containers must be where the operation expects them.
        for member in &members {
            if let Err(reason) = self.check_preconditions(member, &device) {
                log::warn!("Step '{}' blocked at dispatch: {}", member.step_id, reason);
                self.instance.set_step_state(&member.process, member.node, StepState::Blocked);
                self.plan_stale = true;
                self.affected.insert(member.process.clone());
                return;
            }
        }

        let adapter: Arc<dyn DeviceAdapter> = match self.simulation {
            Some(speed) => Arc::new(SimulatedAdapter::new(speed)),
            None => match self.adapters.get(&device.kind) {
                Some(adapter) => adapter.clone(),
                None => {
                    log::error!("No adapter registered for device kind {}.", device.kind);
                    for member in &members {
                        self.fail_member(member, format!("no adapter for kind {}", device.kind));
                    }
                    return;
                }
            },
        };

        let mut params = HashMap::new();
        let mut containers = Vec::new();
        for member in &members {
            params.extend(member.params.clone());
            containers.extend(member.containers.iter().cloned());
        }
        let dispatch = StepDispatch {
            step_id: lead.clone(),
            process: members[0].process.clone(),
            fct: members[0].fct.clone(),
            device: device.clone(),
            containers: containers.clone(),
            params,
            scheduled_duration: assignment.duration,
            is_movement: members[0].is_movement,
        };

        let handle = match adapter.submit(dispatch).await {
            Ok(handle) => handle,
            Err(e) => {
                log::error!("Adapter submit for '{}' failed: {}", lead, e);
                for member in &members {
                    self.fail_member(member, format!("submit failed: {}", e));
                }
                return;
            }
        };

        tracing::info!("Dispatched '{}' ({} member(s)) to '{}'.", lead, members.len(), device.id);

        for member in &members {
            self.instance.set_step_running(&member.process, member.node, now, device.id.clone());
            for container in &member.containers {
                self.held.insert(container.clone());
            }
        }

        self.in_flight.insert(
            lead.clone(),
            InFlight {
                members,
                device,
                started_at: now,
                scheduled_duration: assignment.duration,
                canceller: handle.canceller.clone(),
                deviation_flagged: false,
                is_simulation: self.simulation.is_some(),
                cancel_requested_at: None,
            },
        );
        self.finalized.remove(lead);

        // Pump the observation stream into the core inbox; a stream that
        // dies without a terminal status is a transport loss.
        let event_tx = self.event_tx.clone();
        let step = lead.clone();
        let mut observations = handle.observations;
        tokio::spawn(async move {
            let mut saw_terminal = false;
            while let Some(observation) = observations.recv().await {
                let terminal = observation.status.is_terminal();
                if event_tx.send(CoreEvent::Observation { step_id: step.clone(), observation }).await.is_err() {
                    return;
                }
                if terminal {
                    saw_terminal = true;
                    break;
                }
            }
            if !saw_terminal {
                let _ = event_tx.send(CoreEvent::AdapterLost { step_id: step, message: "observation stream closed".to_string() }).await;
            }
        });
    }

    fn check_preconditions(&self, member: &BundleMember, device: &Device) -> std::result::Result<(), String> {
        for container in &member.containers {
            let Some(tracked) = self.store.container(container) else {
                return Err(format!("container '{}' is not tracked", container));
            };
            if tracked.removed {
                return Err(format!("container '{}' was removed", container));
            }
            if !member.is_movement && member.fct != FCT_UNLID && member.fct != FCT_LID && tracked.current_pos.device != device.id {
                return Err(format!("container '{}' is at {}, not on '{}'", container, tracked.current_pos, device.id));
            }
        }
        Ok(())
    }

    // ---- Status ----

    fn build_reports(&self, filter: Option<ProcessId>) -> Vec<StatusReport> {
        let mut out = Vec::new();
        for p in self.instance.processes() {
            if let Some(only) = &filter {
                if p.id != *only {
                    continue;
                }
            }
            let Some(report) = self.instance.report(&p.id) else { continue };

            let planned = self.plan.process_assignments(&p.id);
            let next_planned = planned
                .iter()
                .find(|a| !matches!(self.instance.step_state(&p.id, a.node), Some(StepState::Completed) | Some(StepState::Running)))
                .map(|a| a.step_id.clone());
            let eta_s = planned.iter().map(|a| a.expected_finish()).max();
            let step_etas = planned
                .iter()
                .filter(|a| !matches!(self.instance.step_state(&p.id, a.node), Some(StepState::Completed)))
                .map(|a| (a.step_id.clone(), a.expected_finish()))
                .collect();

            out.push(StatusReport {
                process: report.process,
                experiment: report.experiment,
                state: report.state,
                last_executed: report.last_executed,
                next_planned,
                eta_s,
                error: report.error,
                steps: report.steps,
                step_etas,
            });
        }
        out.sort_by(|a, b| a.process.cmp(&b.process));
        out
    }
}

fn param_position(params: &HashMap<String, serde_json::Value>) -> Result<Position> {
    let device = params
        .get(PARAM_LID_DEVICE)
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::GraphError(format!("Missing '{}' parameter.", PARAM_LID_DEVICE)))?;
    let slot = params
        .get(PARAM_LID_SLOT)
        .and_then(|v| v.as_u64())
        .ok_or_else(|| Error::GraphError(format!("Missing '{}' parameter.", PARAM_LID_SLOT)))?;
    Ok(Position::new(device, slot as u32))
}

/// Builds an operation template for duration estimation out of a graph
/// operation.
pub fn template_for(op: &OperationNode) -> StepTemplate {
    StepTemplate { fct: op.fct.clone(), params: op.params.clone(), movement: None }
}
