use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use crate::domain::graph::node::{GraphNode, NodeKey, OperationNode};
use crate::domain::graph::{OpDependency, WorkflowGraph};
use crate::domain::ids::{ContainerName, ExperimentId, ProcessId, StepId};
use crate::domain::status_store::{StatusStore, StepStatus};
use crate::error::{Error, Result};

/// Lifecycle of a submitted process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl ProcessState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessState::Completed | ProcessState::Failed | ProcessState::Cancelled)
    }
}

/// State machine of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepState {
    Pending,
    Ready,
    Running,
    Completed,
    Failed,
    Cancelled,
    /// A precondition check failed at dispatch time; a reschedule returns
    /// the step to `Ready`.
    Blocked,
}

/// Terminal observation of one step execution.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub status: StepStatus,
    pub value: Option<serde_json::Value>,
    pub start_s: i64,
    pub finish_s: i64,
}

#[derive(Debug, Clone)]
pub struct CompletedStep {
    pub start_s: i64,
    pub finish_s: i64,
}

/// One live workflow: the immutable graph plus all runtime progress.
#[derive(Debug, Clone)]
pub struct LiveProcess {
    pub id: ProcessId,
    pub graph: WorkflowGraph,
    /// Numerically lower = more important.
    pub priority: i32,
    pub experiment: ExperimentId,
    pub state: ProcessState,
    pub delay_until: Option<i64>,

    /// Runtime values of variables and evaluated computations, by name.
    pub bindings: HashMap<String, serde_json::Value>,
    /// Resolved branch decisions.
    pub decisions: HashMap<NodeKey, bool>,
    pub completed: HashMap<NodeKey, CompletedStep>,
    /// Nodes removed from the live instance by branch resolution.
    pub pruned: HashSet<NodeKey>,
    pub step_states: HashMap<NodeKey, StepState>,
    pub attempts: HashMap<NodeKey, u32>,
    pub error: Option<String>,
    /// For steps waiting on a device bundle: when the wait started.
    pub deferred_since: HashMap<NodeKey, i64>,
    /// Dispatch timestamps and assigned devices of in-flight steps.
    pub running_since: HashMap<NodeKey, (i64, crate::domain::device::DeviceId)>,
}

impl LiveProcess {
    pub fn step_id(&self, node: NodeKey) -> StepId {
        StepId::for_node(&self.id, self.graph.node(node).name())
    }

    pub fn last_executed(&self) -> Option<StepId> {
        self.completed.iter().max_by_key(|(_, c)| c.finish_s).map(|(k, _)| self.step_id(*k))
    }

    fn live_operations(&self) -> Vec<NodeKey> {
        self.graph.operations().map(|(k, _)| k).filter(|k| !self.pruned.contains(k)).collect()
    }

    /// All guards of `node` are resolved and every one took the guarded arm.
    pub fn guards_allow_dispatch(&self, node: NodeKey) -> bool {
        self.graph.guards(node).iter().all(|(branch, arm)| self.decisions.get(branch) == Some(arm))
    }

    /// Scheduling dependencies restricted to predecessors that are still
    /// part of the live instance.
    pub fn live_dependencies(&self, node: NodeKey) -> Vec<OpDependency> {
        self.graph.operation_dependencies(node).into_iter().filter(|d| !self.pruned.contains(&d.pred)).collect()
    }
}

/// A step the executor may dispatch now.
#[derive(Debug, Clone)]
pub struct ReadyStep {
    pub process: ProcessId,
    pub node: NodeKey,
    pub step_id: StepId,
    pub operation: OperationNode,
    /// Earliest start implied by predecessor finishes and `min_wait`s.
    pub release_s: i64,
}

/// The union of all live workflow graphs plus runtime progress. Capacity
/// accounting and readiness live here so the scheduler can stay pure.
#[derive(Debug, Default)]
pub struct SchedulingInstance {
    processes: HashMap<ProcessId, LiveProcess>,
}

impl SchedulingInstance {
    pub fn new() -> Self {
        Self::default()
    }

    // ---- Submission lifecycle ----

    /// Registers a parsed workflow graph.
    ///
    /// # Returns
    /// The experiment id grouping all history records of this run.
    pub fn submit(&mut self, graph: WorkflowGraph, priority: i32, delay_until: Option<i64>) -> Result<ExperimentId> {
        let id = graph.process.clone();
        // Submission is idempotent by process id.
        if let Some(existing) = self.processes.get(&id) {
            log::info!("Process '{}' is already live; submission is a no-op.", id);
            return Ok(existing.experiment.clone());
        }

        let experiment = ExperimentId::new(Uuid::new_v4().to_string());
        let mut step_states = HashMap::new();
        for (key, _) in graph.operations() {
            step_states.insert(key, StepState::Pending);
        }

        log::info!("Process '{}' submitted ({} nodes, experiment {}).", id, graph.node_count(), experiment);

        self.processes.insert(
            id.clone(),
            LiveProcess {
                id,
                graph,
                priority,
                experiment: experiment.clone(),
                state: ProcessState::Pending,
                delay_until,
                bindings: HashMap::new(),
                decisions: HashMap::new(),
                completed: HashMap::new(),
                pruned: HashSet::new(),
                step_states,
                attempts: HashMap::new(),
                error: None,
                deferred_since: HashMap::new(),
                running_since: HashMap::new(),
            },
        );
        Ok(experiment)
    }

    pub fn start(&mut self, process: &ProcessId) -> Result<()> {
        let p = self.process_mut(process)?;
        match p.state {
            ProcessState::Pending | ProcessState::Paused => {
                p.state = ProcessState::Running;
                Ok(())
            }
            ProcessState::Running => Ok(()),
            other => Err(Error::Cancelled(format!("Process '{}' is terminal ({:?}) and cannot start.", process, other))),
        }
    }

    pub fn pause(&mut self, process: &ProcessId) -> Result<()> {
        let p = self.process_mut(process)?;
        if p.state == ProcessState::Running {
            p.state = ProcessState::Paused;
        }
        Ok(())
    }

    /// Marks the process cancelled and returns the steps that never ran.
    /// In-flight steps are the executor's to wind down.
    pub fn cancel(&mut self, process: &ProcessId) -> Result<Vec<NodeKey>> {
        let p = self.process_mut(process)?;
        if p.state.is_terminal() {
            return Ok(Vec::new());
        }
        p.state = ProcessState::Cancelled;

        let mut dropped = Vec::new();
        for (node, state) in p.step_states.iter_mut() {
            match state {
                StepState::Pending | StepState::Ready | StepState::Blocked => {
                    *state = StepState::Cancelled;
                    dropped.push(*node);
                }
                _ => {}
            }
        }
        log::info!("Process '{}' cancelled, {} queued steps dropped.", process, dropped.len());
        Ok(dropped)
    }

    pub fn fail(&mut self, process: &ProcessId, reason: impl Into<String>) {
        if let Some(p) = self.processes.get_mut(process) {
            if !p.state.is_terminal() {
                p.state = ProcessState::Failed;
                p.error = Some(reason.into());
            }
        }
    }

    // ---- Queries ----

    pub fn process(&self, id: &ProcessId) -> Option<&LiveProcess> {
        self.processes.get(id)
    }

    pub fn process_mut(&mut self, id: &ProcessId) -> Result<&mut LiveProcess> {
        self.processes.get_mut(id).ok_or_else(|| Error::UnknownProcess(id.clone()))
    }

    pub fn processes(&self) -> impl Iterator<Item = &LiveProcess> {
        self.processes.values()
    }

    pub fn live_process_ids(&self) -> Vec<ProcessId> {
        self.processes.values().filter(|p| !p.state.is_terminal()).map(|p| p.id.clone()).collect()
    }

    pub fn step_state(&self, process: &ProcessId, node: NodeKey) -> Option<StepState> {
        self.processes.get(process).and_then(|p| p.step_states.get(&node)).copied()
    }

    pub fn set_step_state(&mut self, process: &ProcessId, node: NodeKey, state: StepState) {
        if let Some(p) = self.processes.get_mut(process) {
            p.step_states.insert(node, state);
        }
    }

    /// Marks a step dispatched at `now` on `device`; the snapshot derives
    /// the expected finish of in-flight work from this.
    pub fn set_step_running(&mut self, process: &ProcessId, node: NodeKey, now: i64, device: crate::domain::device::DeviceId) {
        if let Some(p) = self.processes.get_mut(process) {
            p.step_states.insert(node, StepState::Running);
            p.running_since.insert(node, (now, device));
        }
    }

    /// Operations whose predecessors are complete, whose branch guards are
    /// resolved in their favor, whose containers are not held by an
    /// in-flight step, and whose process is running.
    ///
    /// `held` names containers currently claimed by in-flight steps; a
    /// container participates in at most one operation at a time.
    pub fn ready_steps(&self, now: i64, held: &HashSet<ContainerName>) -> Vec<ReadyStep> {
        let mut out = Vec::new();

        for p in self.processes.values() {
            if p.state != ProcessState::Running {
                continue;
            }
            if let Some(delay) = p.delay_until {
                if now < delay {
                    continue;
                }
            }

            for node in p.live_operations() {
                match p.step_states.get(&node) {
                    Some(StepState::Pending) | Some(StepState::Ready) => {}
                    _ => continue,
                }
                if !p.guards_allow_dispatch(node) {
                    continue;
                }

                let op = p.graph.node(node).as_operation().expect("live_operations yields operations");
                if op.containers.iter().any(|c| held.contains(c)) {
                    continue;
                }

                let mut release = now;
                let mut deps_done = true;
                for dep in p.live_dependencies(node) {
                    match p.completed.get(&dep.pred) {
                        Some(done) => {
                            release = release.max(done.finish_s + dep.min_wait);
                        }
                        None => {
                            deps_done = false;
                            break;
                        }
                    }
                }
                if !deps_done {
                    continue;
                }

                out.push(ReadyStep { process: p.id.clone(), node, step_id: p.step_id(node), operation: op.clone(), release_s: release });
            }
        }

        // Deterministic order for the executor's dispatch loop.
        out.sort_by(|a, b| a.release_s.cmp(&b.release_s).then_with(|| a.step_id.cmp(&b.step_id)));
        out
    }

    // ---- Progress ----

    /// Records a terminal step outcome: stamps the completion, publishes the
    /// produced value, evaluates computations, collapses branches.
    ///
    /// # Returns
    /// The set of nodes pruned by branch resolutions this outcome caused.
    pub fn on_complete(&mut self, process: &ProcessId, node: NodeKey, outcome: &StepOutcome) -> Result<Vec<NodeKey>> {
        let p = self.process_mut(process)?;
        p.running_since.remove(&node);

        match outcome.status {
            StepStatus::Ok => {
                p.step_states.insert(node, StepState::Completed);
                p.completed.insert(node, CompletedStep { start_s: outcome.start_s, finish_s: outcome.finish_s });
                p.deferred_since.remove(&node);

                if let Some(value) = &outcome.value {
                    Self::bind_produced_value(p, node, value.clone());
                }
                let pruned = Self::resolve_runtime_nodes(p)?;
                Self::check_process_complete(p);
                Ok(pruned)
            }
            StepStatus::Failed => {
                let max_retries = p
                    .graph
                    .node(node)
                    .as_operation()
                    .and_then(|op| op.params.get("max_retries"))
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0) as u32;
                let attempts = {
                    let a = p.attempts.entry(node).or_insert(0);
                    *a += 1;
                    *a
                };

                if attempts <= max_retries {
                    log::warn!("Step '{}' failed (attempt {}/{}), re-queueing.", p.step_id(node), attempts, max_retries + 1);
                    p.step_states.insert(node, StepState::Pending);
                } else {
                    p.step_states.insert(node, StepState::Failed);
                    let step = p.step_id(node);
                    p.state = ProcessState::Failed;
                    p.error = Some(format!("Step '{}' failed after {} attempt(s).", step, attempts));
                    log::error!("Process '{}' failed: step '{}' exhausted its attempts.", process, step);
                }
                Ok(Vec::new())
            }
            StepStatus::Cancelled => {
                p.step_states.insert(node, StepState::Cancelled);
                Ok(Vec::new())
            }
        }
    }

    fn bind_produced_value(p: &mut LiveProcess, producer: NodeKey, value: serde_json::Value) {
        let mut names = Vec::new();
        for key in p.graph.keys() {
            if let GraphNode::Variable(var) = p.graph.node(key) {
                if var.producer == producer {
                    names.push(var.name.to_string());
                }
            }
        }
        if names.is_empty() {
            // Producing operation without a declared variable; keep the value
            // in history only.
            return;
        }
        for name in names {
            log::debug!("Variable '{}' of process '{}' resolved to {}.", name, p.id, value);
            p.bindings.insert(name, value.clone());
        }
    }

    /// Evaluates computations and branch predicates in topological order
    /// until a fixpoint. Every newly decided branch prunes the subgraph that
    /// requires the untaken arm.
    fn resolve_runtime_nodes(p: &mut LiveProcess) -> Result<Vec<NodeKey>> {
        let mut newly_pruned = Vec::new();

        for key in p.graph.topo_order() {
            if p.pruned.contains(&key) {
                continue;
            }
            match p.graph.node(key) {
                GraphNode::Computation(comp) => {
                    if !p.bindings.contains_key(&comp.name) {
                        if let Some(value) = comp.expr.eval(&p.bindings)? {
                            p.bindings.insert(comp.name.clone(), value);
                        }
                    }
                }
                GraphNode::Branch(branch) => {
                    if !p.decisions.contains_key(&key) {
                        if let Some(value) = branch.predicate.eval(&p.bindings)? {
                            let taken = value
                                .as_bool()
                                .ok_or_else(|| Error::GraphError(format!("Branch '{}' predicate evaluated to non-boolean {}.", branch.name, value)))?;
                            p.decisions.insert(key, taken);
                            log::info!("Branch '{}' of process '{}' resolved to {}.", branch.name, p.id, taken);
                        }
                    }
                }
                _ => {}
            }
        }

        // Prune everything that requires an arm that was not taken.
        for key in p.graph.topo_order() {
            if p.pruned.contains(&key) {
                continue;
            }
            let dead = p.graph.guards(key).iter().any(|(branch, arm)| match p.decisions.get(branch) {
                Some(taken) => taken != arm,
                None => false,
            });
            if dead {
                p.pruned.insert(key);
                p.step_states.remove(&key);
                p.deferred_since.remove(&key);
                newly_pruned.push(key);
            }
        }

        Ok(newly_pruned)
    }

    fn check_process_complete(p: &mut LiveProcess) {
        let all_done = p.live_operations().iter().all(|k| matches!(p.step_states.get(k), Some(StepState::Completed)));
        if all_done && p.state == ProcessState::Running {
            p.state = ProcessState::Completed;
            log::info!("Process '{}' completed.", p.id);
        }
    }

    // ---- Snapshot for the scheduler ----

    /// Immutable view the scheduler plans from. Includes steps inside
    /// unresolved branch arms (they may be planned provisionally, never
    /// dispatched), excludes pruned and terminal steps.
    pub fn snapshot(&self, store: &StatusStore, now: i64) -> SchedulerSnapshot {
        let mut pending = Vec::new();
        let mut running = Vec::new();

        for p in self.processes.values() {
            // Terminal processes contribute no work; their in-flight steps
            // were already wound down by the executor. Paused processes keep
            // their running steps visible and stay plannable.
            if p.state.is_terminal() || p.state == ProcessState::Pending {
                continue;
            }

            for node in p.live_operations() {
                let op = p.graph.node(node).as_operation().expect("operations only");
                let step_id = p.step_id(node);
                match p.step_states.get(&node) {
                    Some(StepState::Running) => {
                        let (started_at, device) = match p.running_since.get(&node) {
                            Some((t, d)) => (*t, d.clone()),
                            None => (now, op.device.clone().unwrap_or_else(|| crate::domain::device::DeviceId::new("unknown"))),
                        };
                        running.push(RunningStepView {
                            step_id,
                            process: p.id.clone(),
                            node,
                            device,
                            device_kind: op.device_kind,
                            containers: op.containers.clone(),
                            duration: op.planning_duration(),
                            started_at,
                            expected_finish: started_at + op.planning_duration(),
                        });
                    }
                    Some(StepState::Pending) | Some(StepState::Ready) | Some(StepState::Blocked) => {
                        let deps = p
                            .live_dependencies(node)
                            .into_iter()
                            .map(|d| PendingDep {
                                pred: StepId::for_node(&p.id, p.graph.node(d.pred).name()),
                                pred_node: d.pred,
                                finished_at: p.completed.get(&d.pred).map(|c| c.finish_s),
                                min_wait: d.min_wait,
                                max_wait: d.max_wait,
                                wait_cost: d.wait_cost,
                            })
                            .collect();
                        pending.push(PendingStepView {
                            step_id,
                            process: p.id.clone(),
                            node,
                            fct: op.fct.clone(),
                            device_kind: op.device_kind,
                            device_pin: op.device.clone(),
                            duration: op.planning_duration().max(1),
                            containers: op.containers.clone(),
                            params: op.params.clone(),
                            is_movement: op.is_movement,
                            priority: p.priority,
                            release_floor: p.delay_until.unwrap_or(now).max(now),
                            deps,
                            deferred_since: p.deferred_since.get(&node).copied(),
                            unresolved_guard: !p.guards_allow_dispatch(node),
                        });
                    }
                    _ => {}
                }
            }
        }

        let container_devices = store
            .live_containers()
            .into_iter()
            .map(|c| (c.name.clone(), c.current_pos.device))
            .collect();

        SchedulerSnapshot { now, devices: store.devices(), container_devices, pending, running }
    }

    // ---- Status reporting ----

    pub fn report(&self, process: &ProcessId) -> Option<ProcessReport> {
        let p = self.processes.get(process)?;
        let mut steps: Vec<(StepId, StepState)> = p.step_states.iter().map(|(k, s)| (p.step_id(*k), *s)).collect();
        steps.sort_by(|a, b| a.0.cmp(&b.0));
        Some(ProcessReport {
            process: p.id.clone(),
            experiment: p.experiment.clone(),
            state: p.state,
            last_executed: p.last_executed(),
            error: p.error.clone(),
            steps,
        })
    }

    pub fn mark_deferred(&mut self, process: &ProcessId, node: NodeKey, now: i64) {
        if let Some(p) = self.processes.get_mut(process) {
            p.deferred_since.entry(node).or_insert(now);
        }
    }

    /// Starts the bundle-deadline clock for a deferred step known only by
    /// its step id.
    pub fn mark_deferred_by_step(&mut self, step: &StepId, now: i64) {
        for p in self.processes.values_mut() {
            let found = p.graph.operations().map(|(k, _)| k).find(|k| p.step_id(*k) == *step);
            if let Some(node) = found {
                p.deferred_since.entry(node).or_insert(now);
                return;
            }
        }
    }
}

/// Snapshot handed to the scheduler; it never reads the live instance.
#[derive(Debug, Clone)]
pub struct SchedulerSnapshot {
    pub now: i64,
    pub devices: Vec<crate::domain::device::Device>,
    /// Which device every live container currently sits on.
    pub container_devices: HashMap<ContainerName, crate::domain::device::DeviceId>,
    pub pending: Vec<PendingStepView>,
    pub running: Vec<RunningStepView>,
}

#[derive(Debug, Clone)]
pub struct PendingDep {
    pub pred: StepId,
    pub pred_node: NodeKey,
    /// Commit-time finish of the predecessor, when it already ran.
    pub finished_at: Option<i64>,
    pub min_wait: i64,
    pub max_wait: Option<i64>,
    pub wait_cost: f64,
}

#[derive(Debug, Clone)]
pub struct PendingStepView {
    pub step_id: StepId,
    pub process: ProcessId,
    pub node: NodeKey,
    pub fct: String,
    pub device_kind: crate::domain::device::DeviceKind,
    pub device_pin: Option<crate::domain::device::DeviceId>,
    pub duration: i64,
    pub containers: Vec<ContainerName>,
    pub params: HashMap<String, serde_json::Value>,
    pub is_movement: bool,
    pub priority: i32,
    pub release_floor: i64,
    pub deps: Vec<PendingDep>,
    pub deferred_since: Option<i64>,
    /// Inside an unresolved branch arm: plannable, not dispatchable.
    pub unresolved_guard: bool,
}

impl PendingStepView {
    pub fn wait_cost_sum(&self) -> f64 {
        self.deps.iter().map(|d| d.wait_cost).sum()
    }
}

#[derive(Debug, Clone)]
pub struct RunningStepView {
    pub step_id: StepId,
    pub process: ProcessId,
    pub node: NodeKey,
    pub device: crate::domain::device::DeviceId,
    pub device_kind: crate::domain::device::DeviceKind,
    pub containers: Vec<ContainerName>,
    pub duration: i64,
    pub started_at: i64,
    pub expected_finish: i64,
}

/// Terminal report for one process.
#[derive(Debug, Clone)]
pub struct ProcessReport {
    pub process: ProcessId,
    pub experiment: ExperimentId,
    pub state: ProcessState,
    pub last_executed: Option<StepId>,
    pub error: Option<String>,
    pub steps: Vec<(StepId, StepState)>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::device::{Device, DeviceKind, Position};
    use crate::domain::graph::node::{BinaryOp, Expr, LabwareNode, OperationNode};
    use crate::domain::graph::EdgeSpec;
    use std::collections::HashMap;

    fn labware(container: &str, device: &str, slot: u32) -> LabwareNode {
        LabwareNode { container: ContainerName::new(container), start: Position::new(device, slot), lidded: false, labware_type: None }
    }

    fn op(name: &str, kind: DeviceKind, duration: i64, containers: &[&str]) -> OperationNode {
        OperationNode {
            name: name.to_string(),
            fct: name.split('-').next().unwrap_or(name).to_string(),
            device_kind: kind,
            device: None,
            expected_duration: duration,
            containers: containers.iter().map(|c| ContainerName::new(*c)).collect(),
            params: HashMap::new(),
            is_movement: false,
            annotated_duration: None,
        }
    }

    /// P1 -> incubate-1 -> (min_wait 10) read-1
    fn chain_graph(process: &str) -> WorkflowGraph {
        let mut b = WorkflowGraph::builder(process);
        b.add_labware(labware("P1", "Hotel", 0)).unwrap();
        b.add_operation(op("incubate-1", DeviceKind::Incubator, 60, &["P1"])).unwrap();
        b.add_operation(op("read-1", DeviceKind::PlateReader, 30, &["P1"])).unwrap();
        b.link("P1", "incubate-1", EdgeSpec::for_container("P1")).unwrap();
        b.link("incubate-1", "read-1", EdgeSpec::for_container("P1").with_waits(10, Some(300))).unwrap();
        b.build().unwrap()
    }

    /// measure -> od -> od_double (computation) -> branch over arms.
    fn branch_graph(process: &str) -> WorkflowGraph {
        let mut b = WorkflowGraph::builder(process);
        b.add_labware(labware("P1", "Reader", 0)).unwrap();
        b.add_operation(op("measure-1", DeviceKind::PlateReader, 5, &["P1"])).unwrap();
        b.add_operation(op("reread-1", DeviceKind::PlateReader, 5, &["P1"])).unwrap();
        b.add_operation(op("incubate-2", DeviceKind::Incubator, 20, &["P1"])).unwrap();
        b.add_variable("od", "measure-1").unwrap();
        b.add_computation("od_double", Expr::binary(BinaryOp::Mul, Expr::var("od"), Expr::number(2.0))).unwrap();
        b.add_branch("dense", Expr::binary(BinaryOp::Gt, Expr::var("od_double"), Expr::number(1.2))).unwrap();
        b.link("P1", "measure-1", EdgeSpec::for_container("P1")).unwrap();
        b.link_branch("dense", "reread-1", true, EdgeSpec::for_container("P1")).unwrap();
        b.link_branch("dense", "incubate-2", false, EdgeSpec::for_container("P1")).unwrap();
        b.build().unwrap()
    }

    fn ok_outcome(value: Option<serde_json::Value>, start: i64, finish: i64) -> StepOutcome {
        StepOutcome { status: StepStatus::Ok, value, start_s: start, finish_s: finish }
    }

    fn test_store() -> StatusStore {
        let store = StatusStore::new();
        store.replace_devices(vec![Device {
            id: crate::domain::device::DeviceId::new("Hotel"),
            kind: DeviceKind::Storage,
            capacity: 4,
            process_capacity: 4,
            min_capacity: 1,
            allows_overlap: true,
            deep_well_slots: Vec::new(),
            params: HashMap::new(),
        }]);
        store
    }

    #[test]
    fn ready_respects_dependencies_and_min_wait() {
        let mut instance = SchedulingInstance::new();
        let process = ProcessId::new("chain");
        instance.submit(chain_graph("chain"), 0, None).unwrap();
        instance.start(&process).unwrap();

        let held = HashSet::new();
        let ready = instance.ready_steps(100, &held);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].step_id, StepId::new("chain.incubate-1"));

        let incubate = ready[0].node;
        instance.on_complete(&process, incubate, &ok_outcome(None, 100, 160)).unwrap();

        let ready = instance.ready_steps(200, &held);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].step_id, StepId::new("chain.read-1"));
        // finish 160 + min_wait 10
        assert_eq!(ready[0].release_s, 200.max(170));
    }

    #[test]
    fn held_containers_are_not_ready() {
        let mut instance = SchedulingInstance::new();
        let process = ProcessId::new("chain");
        instance.submit(chain_graph("chain"), 0, None).unwrap();
        instance.start(&process).unwrap();

        let mut held = HashSet::new();
        held.insert(ContainerName::new("P1"));
        assert!(instance.ready_steps(0, &held).is_empty());
    }

    #[test]
    fn delay_gates_readiness() {
        let mut instance = SchedulingInstance::new();
        let process = ProcessId::new("chain");
        instance.submit(chain_graph("chain"), 0, Some(500)).unwrap();
        instance.start(&process).unwrap();

        let held = HashSet::new();
        assert!(instance.ready_steps(499, &held).is_empty());
        assert_eq!(instance.ready_steps(500, &held).len(), 1);
    }

    #[test]
    fn completion_resolves_variables_computations_and_branches() {
        let mut instance = SchedulingInstance::new();
        let process = ProcessId::new("branching");
        instance.submit(branch_graph("branching"), 0, None).unwrap();
        instance.start(&process).unwrap();

        let p = instance.process(&process).unwrap();
        let measure = p.graph.key_by_name("measure-1").unwrap();
        let reread = p.graph.key_by_name("reread-1").unwrap();
        let incubate = p.graph.key_by_name("incubate-2").unwrap();

        // Until the predicate resolves, neither arm is dispatchable.
        let held = HashSet::new();
        let ready: Vec<StepId> = instance.ready_steps(0, &held).into_iter().map(|r| r.step_id).collect();
        assert_eq!(ready, vec![StepId::new("branching.measure-1")]);

        // 0.45 * 2 = 0.9 <= 1.2: the false arm survives.
        let pruned = instance.on_complete(&process, measure, &ok_outcome(Some(serde_json::json!(0.45)), 0, 5)).unwrap();
        assert_eq!(pruned, vec![reread]);

        let p = instance.process(&process).unwrap();
        assert_eq!(p.bindings.get("od"), Some(&serde_json::json!(0.45)));
        assert_eq!(p.bindings.get("od_double"), Some(&serde_json::json!(0.9)));
        assert!(p.pruned.contains(&reread));

        let ready: Vec<StepId> = instance.ready_steps(10, &held).into_iter().map(|r| r.step_id).collect();
        assert_eq!(ready, vec![StepId::new("branching.incubate-2")]);

        // Completing the surviving arm completes the process.
        instance.on_complete(&process, incubate, &ok_outcome(None, 10, 30)).unwrap();
        assert_eq!(instance.process(&process).unwrap().state, ProcessState::Completed);
    }

    #[test]
    fn failure_requeues_until_retries_are_exhausted() {
        let mut b = WorkflowGraph::builder("retry");
        b.add_labware(labware("P1", "Hotel", 0)).unwrap();
        let mut flaky = op("wash-1", DeviceKind::LiquidHandler, 10, &["P1"]);
        flaky.params.insert("max_retries".to_string(), serde_json::json!(1));
        b.add_operation(flaky).unwrap();
        b.link("P1", "wash-1", EdgeSpec::for_container("P1")).unwrap();
        let graph = b.build().unwrap();

        let mut instance = SchedulingInstance::new();
        let process = ProcessId::new("retry");
        instance.submit(graph, 0, None).unwrap();
        instance.start(&process).unwrap();
        let node = instance.process(&process).unwrap().graph.key_by_name("wash-1").unwrap();

        let failed = StepOutcome { status: StepStatus::Failed, value: None, start_s: 0, finish_s: 0 };
        instance.on_complete(&process, node, &failed).unwrap();
        assert_eq!(instance.step_state(&process, node), Some(StepState::Pending));
        assert_eq!(instance.process(&process).unwrap().state, ProcessState::Running);

        instance.on_complete(&process, node, &failed).unwrap();
        assert_eq!(instance.step_state(&process, node), Some(StepState::Failed));
        assert_eq!(instance.process(&process).unwrap().state, ProcessState::Failed);
    }

    #[test]
    fn cancel_drops_queued_steps() {
        let mut instance = SchedulingInstance::new();
        let process = ProcessId::new("chain");
        instance.submit(chain_graph("chain"), 0, None).unwrap();
        instance.start(&process).unwrap();

        let dropped = instance.cancel(&process).unwrap();
        assert_eq!(dropped.len(), 2);
        assert_eq!(instance.process(&process).unwrap().state, ProcessState::Cancelled);
        assert!(instance.ready_steps(0, &HashSet::new()).is_empty());

        // Cancelling again is a no-op.
        assert!(instance.cancel(&process).unwrap().is_empty());
    }

    #[test]
    fn submission_is_idempotent_by_process_id() {
        let mut instance = SchedulingInstance::new();
        let first = instance.submit(chain_graph("chain"), 0, None).unwrap();
        let second = instance.submit(chain_graph("chain"), 5, None).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn snapshot_flags_provisional_branch_arms_and_drops_pruned_ones() {
        let store = test_store();
        let mut instance = SchedulingInstance::new();
        let process = ProcessId::new("branching");
        instance.submit(branch_graph("branching"), 0, None).unwrap();
        instance.start(&process).unwrap();

        let snap = instance.snapshot(&store, 0);
        let reread = snap.pending.iter().find(|s| s.step_id == StepId::new("branching.reread-1")).unwrap();
        let incubate = snap.pending.iter().find(|s| s.step_id == StepId::new("branching.incubate-2")).unwrap();
        assert!(reread.unresolved_guard);
        assert!(incubate.unresolved_guard);

        let measure = instance.process(&process).unwrap().graph.key_by_name("measure-1").unwrap();
        instance.on_complete(&process, measure, &ok_outcome(Some(serde_json::json!(0.45)), 0, 5)).unwrap();

        let snap = instance.snapshot(&store, 10);
        assert!(snap.pending.iter().all(|s| s.step_id != StepId::new("branching.reread-1")));
        let incubate = snap.pending.iter().find(|s| s.step_id == StepId::new("branching.incubate-2")).unwrap();
        assert!(!incubate.unresolved_guard);
    }
}
