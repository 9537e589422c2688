//! End-to-end runs of the orchestrator against simulated devices.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use labflow::domain::clock::WallClock;
use labflow::domain::device::{Device, DeviceId, DeviceKind, Position};
use labflow::domain::executor::adapter::DeviceAdapter;
use labflow::domain::executor::executor::{Executor, ExecutorConfig, ExecutorHandle, Scope, StatusReport};
use labflow::domain::executor::simulation::{SimulatedAdapter, StubbornSimulatedAdapter};
use labflow::domain::graph::node::{BinaryOp, Expr, LabwareNode, OperationNode};
use labflow::domain::graph::{EdgeSpec, WorkflowGraph};
use labflow::domain::ids::{ContainerName, ProcessId};
use labflow::domain::instance::scheduling_instance::{ProcessState, StepState};
use labflow::domain::status_store::history::StepStatus;
use labflow::domain::status_store::store::StatusStore;

fn device(id: &str, kind: DeviceKind, capacity: u32, min_capacity: u32, allows_overlap: bool) -> Device {
    Device {
        id: DeviceId::new(id),
        kind,
        capacity,
        process_capacity: capacity,
        min_capacity,
        allows_overlap,
        deep_well_slots: Vec::new(),
        params: HashMap::new(),
    }
}

fn bench_lab() -> Vec<Device> {
    vec![
        device("Hotel", DeviceKind::Storage, 10, 1, true),
        device("Incubator1", DeviceKind::Incubator, 4, 1, true),
        device("Reader", DeviceKind::PlateReader, 1, 1, false),
        device("C", DeviceKind::Centrifuge, 4, 4, false),
    ]
}

fn labware(container: &str, device: &str, slot: u32, lidded: bool) -> LabwareNode {
    LabwareNode { container: ContainerName::new(container), start: Position::new(device, slot), lidded, labware_type: None }
}

fn op(name: &str, fct: &str, kind: DeviceKind, pin: Option<&str>, duration: i64, containers: &[&str]) -> OperationNode {
    OperationNode {
        name: name.to_string(),
        fct: fct.to_string(),
        device_kind: kind,
        device: pin.map(DeviceId::new),
        expected_duration: duration,
        containers: containers.iter().map(|c| ContainerName::new(*c)).collect(),
        params: HashMap::new(),
        is_movement: false,
        annotated_duration: None,
    }
}

fn move_op(name: &str, container: &str, kind: DeviceKind, pin: &str, duration: i64) -> OperationNode {
    let mut node = op(name, "move", kind, Some(pin), duration, &[container]);
    node.is_movement = true;
    node
}

async fn start_executor(store: StatusStore, adapters: HashMap<DeviceKind, Arc<dyn DeviceAdapter>>, config: ExecutorConfig) -> ExecutorHandle {
    let (executor, handle) = Executor::new(store, Box::new(WallClock), adapters, config);
    tokio::spawn(executor.run());
    handle
}

async fn simulated_executor(speed: f64, config: ExecutorConfig) -> (StatusStore, ExecutorHandle) {
    let store = StatusStore::new();
    store.replace_devices(bench_lab());
    let handle = start_executor(store.clone(), HashMap::new(), config).await;
    handle.enable_simulation(speed).await.unwrap();
    (store, handle)
}

/// Polls the status surface until the predicate holds.
async fn wait_for<F>(handle: &ExecutorHandle, process: &str, timeout_s: u64, pred: F) -> StatusReport
where
    F: Fn(&StatusReport) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout_s);
    loop {
        let reports = handle.query_status(Some(ProcessId::new(process))).await.unwrap();
        if let Some(report) = reports.first() {
            if pred(report) {
                return report.clone();
            }
            if tokio::time::Instant::now() > deadline {
                panic!("Timed out waiting for process '{}'; last report: {:?}", process, report);
            }
        } else if tokio::time::Instant::now() > deadline {
            panic!("Timed out waiting for process '{}'; no report at all", process);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

fn terminal(report: &StatusReport) -> bool {
    report.state.is_terminal()
}

/// Scenario: single plate, move – incubate – move – read.
#[tokio::test(flavor = "multi_thread")]
async fn single_plate_move_incubate_read() {
    let mut graph = WorkflowGraph::builder("single-plate");
    graph.add_labware(labware("P1", "Hotel", 0, false)).unwrap();
    graph.add_operation(move_op("move-to-incubator", "P1", DeviceKind::Incubator, "Incubator1", 2)).unwrap();
    let mut incubate = op("incubate-1", "incubate", DeviceKind::Incubator, Some("Incubator1"), 60, &["P1"]);
    incubate.params.insert("temperature_k".to_string(), serde_json::json!(310));
    graph.add_operation(incubate).unwrap();
    graph.add_operation(move_op("move-to-reader", "P1", DeviceKind::PlateReader, "Reader", 2)).unwrap();
    graph.add_operation(op("measure-od", "measure", DeviceKind::PlateReader, Some("Reader"), 5, &["P1"])).unwrap();
    graph.link("P1", "move-to-incubator", EdgeSpec::for_container("P1")).unwrap();
    graph.link("move-to-incubator", "incubate-1", EdgeSpec::for_container("P1")).unwrap();
    graph.link("incubate-1", "move-to-reader", EdgeSpec::for_container("P1")).unwrap();
    graph.link("move-to-reader", "measure-od", EdgeSpec::for_container("P1")).unwrap();
    let graph = graph.build().unwrap();

    let (store, handle) = simulated_executor(60.0, ExecutorConfig { deviation_slack_s: 30, ..Default::default() }).await;
    handle.submit_process(graph, 0, None).await.unwrap();
    handle.start(vec![ProcessId::new("single-plate")]).await.unwrap();

    let report = wait_for(&handle, "single-plate", 30, terminal).await;
    assert_eq!(report.state, ProcessState::Completed, "error: {:?}", report.error);

    // Committed position sequence Hotel → Incubator1 → Reader.
    let records = store.records();
    let moves: Vec<_> = records.iter().filter(|r| r.movement.is_some()).collect();
    assert_eq!(moves.len(), 2);
    assert_eq!(moves[0].movement.as_ref().unwrap().origin.device, DeviceId::new("Hotel"));
    assert_eq!(moves[0].movement.as_ref().unwrap().destination.device, DeviceId::new("Incubator1"));
    assert_eq!(moves[1].movement.as_ref().unwrap().destination.device, DeviceId::new("Reader"));

    // One record per step, all ok, all flagged as simulation.
    assert_eq!(records.len(), 4);
    assert!(records.iter().all(|r| r.status == StepStatus::Ok && r.is_simulation));

    // The incubation held the plate for its full duration (model seconds).
    let incubation = records.iter().find(|r| r.fct == "incubate").unwrap();
    assert!(incubation.duration_s() >= 60, "incubation lasted {}s", incubation.duration_s());

    let p1 = store.container(&ContainerName::new("P1")).unwrap();
    assert_eq!(p1.current_pos.device, DeviceId::new("Reader"));
}

/// Scenario: a centrifuge with min_capacity 4 never runs for two plates and
/// the owning process eventually reports unschedulable.
#[tokio::test(flavor = "multi_thread")]
async fn centrifuge_min_capacity_starves() {
    let mut graph = WorkflowGraph::builder("starved-spin");
    graph.add_labware(labware("P1", "Hotel", 0, false)).unwrap();
    graph.add_labware(labware("P2", "Hotel", 1, false)).unwrap();
    graph.add_operation(op("spin-a", "spin", DeviceKind::Centrifuge, Some("C"), 120, &["P1"])).unwrap();
    graph.add_operation(op("spin-b", "spin", DeviceKind::Centrifuge, Some("C"), 120, &["P2"])).unwrap();
    graph.link("P1", "spin-a", EdgeSpec::for_container("P1")).unwrap();
    graph.link("P2", "spin-b", EdgeSpec::for_container("P2")).unwrap();
    let graph = graph.build().unwrap();

    let config = ExecutorConfig {
        scheduler: labflow::domain::scheduler::list_scheduler::SchedulerConfig { bundle_deadline_s: 2, ..Default::default() },
        ..Default::default()
    };
    let (store, handle) = simulated_executor(1.0, config).await;
    handle.submit_process(graph, 0, None).await.unwrap();
    handle.start(vec![ProcessId::new("starved-spin")]).await.unwrap();

    let report = wait_for(&handle, "starved-spin", 30, terminal).await;
    assert_eq!(report.state, ProcessState::Failed);
    assert!(report.error.as_deref().unwrap_or("").contains("unschedulable"), "error: {:?}", report.error);

    // The centrifuge step never dispatched: no history at all.
    assert_eq!(store.history_len(), 0);
}

/// Scenario: lid parked during a read, restored on the way back.
#[tokio::test(flavor = "multi_thread")]
async fn lid_lifecycle_round_trip() {
    let mut graph = WorkflowGraph::builder("lid-demo");
    graph.add_labware(labware("P2", "Hotel", 1, true)).unwrap();

    let mut to_reader = move_op("move-to-reader", "P2", DeviceKind::PlateReader, "Reader", 2);
    to_reader.params.insert("lid_device".to_string(), serde_json::json!("Hotel"));
    to_reader.params.insert("lid_slot".to_string(), serde_json::json!(1));
    graph.add_operation(to_reader).unwrap();

    graph.add_operation(op("read-od", "read", DeviceKind::PlateReader, Some("Reader"), 5, &["P2"])).unwrap();

    let mut back = move_op("move-back", "P2", DeviceKind::Storage, "Hotel", 2);
    back.params.insert("dest_slot".to_string(), serde_json::json!(1));
    back.params.insert("relid".to_string(), serde_json::json!(true));
    graph.add_operation(back).unwrap();

    graph.link("P2", "move-to-reader", EdgeSpec::for_container("P2")).unwrap();
    graph.link("move-to-reader", "read-od", EdgeSpec::for_container("P2")).unwrap();
    graph.link("read-od", "move-back", EdgeSpec::for_container("P2")).unwrap();
    let graph = graph.build().unwrap();

    let (store, handle) = simulated_executor(20.0, ExecutorConfig { deviation_slack_s: 30, ..Default::default() }).await;
    handle.submit_process(graph, 0, None).await.unwrap();
    handle.start(vec![ProcessId::new("lid-demo")]).await.unwrap();

    let report = wait_for(&handle, "lid-demo", 30, terminal).await;
    assert_eq!(report.state, ProcessState::Completed, "error: {:?}", report.error);

    let p2 = store.container(&ContainerName::new("P2")).unwrap();
    assert_eq!(p2.current_pos, Position::new("Hotel", 1));
    assert!(p2.lidded);
    assert_eq!(p2.lid_pos, None);
}

/// Scenario: a runtime branch prunes the untaken arm and executes the other.
#[tokio::test(flavor = "multi_thread")]
async fn runtime_branch_takes_the_false_arm() {
    let mut graph = WorkflowGraph::builder("branching");
    graph.add_labware(labware("P1", "Reader", 0, false)).unwrap();

    let mut measure = op("measure-od", "measure", DeviceKind::PlateReader, Some("Reader"), 5, &["P1"]);
    measure.params.insert("sim_value".to_string(), serde_json::json!(0.45));
    graph.add_operation(measure).unwrap();
    graph.add_variable("od", "measure-od").unwrap();
    graph.add_branch("dense-enough", Expr::binary(BinaryOp::Gt, Expr::var("od"), Expr::number(0.6))).unwrap();

    graph.add_operation(op("extra-read", "read", DeviceKind::PlateReader, Some("Reader"), 5, &["P1"])).unwrap();
    graph.add_operation(move_op("move-to-incubator", "P1", DeviceKind::Incubator, "Incubator1", 2)).unwrap();
    graph.add_operation(op("second-incubation", "incubate", DeviceKind::Incubator, Some("Incubator1"), 20, &["P1"])).unwrap();

    graph.link("P1", "measure-od", EdgeSpec::for_container("P1")).unwrap();
    graph.link_branch("dense-enough", "extra-read", true, EdgeSpec::for_container("P1")).unwrap();
    graph.link_branch("dense-enough", "move-to-incubator", false, EdgeSpec::for_container("P1")).unwrap();
    graph.link("move-to-incubator", "second-incubation", EdgeSpec::for_container("P1")).unwrap();
    let graph = graph.build().unwrap();

    let (store, handle) = simulated_executor(20.0, ExecutorConfig { deviation_slack_s: 30, ..Default::default() }).await;
    handle.submit_process(graph, 0, None).await.unwrap();
    handle.start(vec![ProcessId::new("branching")]).await.unwrap();

    let report = wait_for(&handle, "branching", 30, terminal).await;
    assert_eq!(report.state, ProcessState::Completed, "error: {:?}", report.error);

    // The pruned arm left no trace: neither in history nor in the step list.
    let records = store.records();
    assert!(records.iter().all(|r| !r.step.to_string().contains("extra-read")));
    assert!(report.steps.iter().all(|(step, _)| !step.to_string().contains("extra-read")));

    // The false arm ran, including the extra incubation.
    assert!(records.iter().any(|r| r.fct == "incubate" && r.status == StepStatus::Ok));
}

/// Scenario: cancellation honoured mid-incubation.
#[tokio::test(flavor = "multi_thread")]
async fn cancel_mid_flight_with_cooperative_adapter() {
    let mut graph = WorkflowGraph::builder("cancel-demo");
    graph.add_labware(labware("P1", "Hotel", 0, false)).unwrap();
    graph.add_operation(move_op("move-to-incubator", "P1", DeviceKind::Incubator, "Incubator1", 2)).unwrap();
    graph.add_operation(op("incubate-slow", "incubate", DeviceKind::Incubator, Some("Incubator1"), 60, &["P1"])).unwrap();
    graph.add_operation(move_op("move-to-reader", "P1", DeviceKind::PlateReader, "Reader", 2)).unwrap();
    graph.link("P1", "move-to-incubator", EdgeSpec::for_container("P1")).unwrap();
    graph.link("move-to-incubator", "incubate-slow", EdgeSpec::for_container("P1")).unwrap();
    graph.link("incubate-slow", "move-to-reader", EdgeSpec::for_container("P1")).unwrap();
    let graph = graph.build().unwrap();

    let (store, handle) = simulated_executor(10.0, ExecutorConfig { deviation_slack_s: 30, ..Default::default() }).await;
    handle.submit_process(graph, 0, None).await.unwrap();
    handle.start(vec![ProcessId::new("cancel-demo")]).await.unwrap();

    wait_for(&handle, "cancel-demo", 30, |r| {
        r.steps.iter().any(|(step, state)| step.to_string().contains("incubate-slow") && *state == StepState::Running)
    })
    .await;
    handle.cancel(Scope::Process(ProcessId::new("cancel-demo"))).await.unwrap();

    let report = wait_for(&handle, "cancel-demo", 30, terminal).await;
    assert_eq!(report.state, ProcessState::Cancelled);

    // The incubation was cancelled without a commit, the container stayed
    // put, and nothing downstream ever ran.
    let records = store.records();
    let incubation = records.iter().find(|r| r.fct == "incubate").unwrap();
    assert_eq!(incubation.status, StepStatus::Cancelled);
    assert!(records.iter().all(|r| !r.step.to_string().contains("move-to-reader")));

    let p1 = store.container(&ContainerName::new("P1")).unwrap();
    assert_eq!(p1.current_pos.device, DeviceId::new("Incubator1"));
}

/// Scenario: an adapter that ignores the cancel signal completes, its side
/// effects commit, and the rest of the workflow is dropped.
#[tokio::test(flavor = "multi_thread")]
async fn cancel_ignored_completion_still_commits() {
    let mut graph = WorkflowGraph::builder("stubborn-demo");
    graph.add_labware(labware("P1", "Hotel", 0, false)).unwrap();
    graph.add_operation(move_op("move-to-incubator", "P1", DeviceKind::Incubator, "Incubator1", 1)).unwrap();
    graph.add_operation(op("incubate-slow", "incubate", DeviceKind::Incubator, Some("Incubator1"), 3, &["P1"])).unwrap();
    graph.add_operation(move_op("move-to-reader", "P1", DeviceKind::PlateReader, "Reader", 1)).unwrap();
    graph.link("P1", "move-to-incubator", EdgeSpec::for_container("P1")).unwrap();
    graph.link("move-to-incubator", "incubate-slow", EdgeSpec::for_container("P1")).unwrap();
    graph.link("incubate-slow", "move-to-reader", EdgeSpec::for_container("P1")).unwrap();
    let graph = graph.build().unwrap();

    let store = StatusStore::new();
    store.replace_devices(bench_lab());
    let mut adapters: HashMap<DeviceKind, Arc<dyn DeviceAdapter>> = HashMap::new();
    adapters.insert(DeviceKind::Storage, Arc::new(SimulatedAdapter::new(1.0)));
    adapters.insert(DeviceKind::Incubator, Arc::new(StubbornSimulatedAdapter::new(1.0)));
    adapters.insert(DeviceKind::PlateReader, Arc::new(SimulatedAdapter::new(1.0)));
    let handle = start_executor(store.clone(), adapters, ExecutorConfig { deviation_slack_s: 30, ..Default::default() }).await;

    handle.submit_process(graph, 0, None).await.unwrap();
    handle.start(vec![ProcessId::new("stubborn-demo")]).await.unwrap();

    wait_for(&handle, "stubborn-demo", 30, |r| {
        r.steps.iter().any(|(step, state)| step.to_string().contains("incubate-slow") && *state == StepState::Running)
    })
    .await;
    handle.cancel(Scope::Process(ProcessId::new("stubborn-demo"))).await.unwrap();

    let report = wait_for(&handle, "stubborn-demo", 30, terminal).await;
    assert_eq!(report.state, ProcessState::Cancelled);

    // Completion won: the incubation committed anyway; successors are gone.
    wait_for(&handle, "stubborn-demo", 30, |r| {
        r.steps.iter().any(|(step, state)| step.to_string().contains("incubate-slow") && *state == StepState::Completed)
    })
    .await;
    let records = store.records();
    let incubation = records.iter().find(|r| r.fct == "incubate").unwrap();
    assert_eq!(incubation.status, StepStatus::Ok);
    assert!(records.iter().all(|r| !r.step.to_string().contains("move-to-reader")));
}

/// Scenario: an incubation that overruns its schedule pushes downstream
/// steps to new start times past the real finish.
#[tokio::test(flavor = "multi_thread")]
async fn replan_on_delay_pushes_downstream_steps() {
    let mut graph = WorkflowGraph::builder("delay-demo");
    graph.add_labware(labware("P1", "Incubator1", 0, false)).unwrap();
    let mut incubate = op("incubate-delayed", "incubate", DeviceKind::Incubator, Some("Incubator1"), 60, &["P1"]);
    incubate.params.insert("sim_duration_s".to_string(), serde_json::json!(120));
    graph.add_operation(incubate).unwrap();
    graph.add_operation(move_op("move-to-reader", "P1", DeviceKind::PlateReader, "Reader", 2)).unwrap();
    graph.add_operation(op("measure-final", "measure", DeviceKind::PlateReader, Some("Reader"), 5, &["P1"])).unwrap();
    graph.link("P1", "incubate-delayed", EdgeSpec::for_container("P1")).unwrap();
    graph.link("incubate-delayed", "move-to-reader", EdgeSpec::for_container("P1")).unwrap();
    graph.link("move-to-reader", "measure-final", EdgeSpec::for_container("P1")).unwrap();
    let graph = graph.build().unwrap();

    let config = ExecutorConfig { deviation_slack_s: 10, timeout_factor: 3.0, ..Default::default() };
    let (store, handle) = simulated_executor(30.0, config).await;
    handle.submit_process(graph, 0, None).await.unwrap();
    handle.start(vec![ProcessId::new("delay-demo")]).await.unwrap();

    let report = wait_for(&handle, "delay-demo", 60, terminal).await;
    assert_eq!(report.state, ProcessState::Completed, "error: {:?}", report.error);

    let records = store.records();
    let incubation = records.iter().find(|r| r.fct == "incubate").unwrap();
    assert!(incubation.duration_s() >= 120, "incubation lasted {}s", incubation.duration_s());

    // Downstream steps started only after the revised finish.
    let hop = records.iter().find(|r| r.fct == "move").unwrap();
    let measure = records.iter().find(|r| r.fct == "measure").unwrap();
    assert!(hop.start_s >= incubation.finish_s);
    assert!(measure.start_s >= hop.finish_s);
}

/// A step that blows through its timeout fails its process.
#[tokio::test(flavor = "multi_thread")]
async fn timeout_fails_the_step_and_process() {
    let mut graph = WorkflowGraph::builder("timeout-demo");
    graph.add_labware(labware("P1", "Incubator1", 0, false)).unwrap();
    let mut incubate = op("incubate-stuck", "incubate", DeviceKind::Incubator, Some("Incubator1"), 2, &["P1"]);
    incubate.params.insert("sim_duration_s".to_string(), serde_json::json!(500));
    graph.add_operation(incubate).unwrap();
    graph.link("P1", "incubate-stuck", EdgeSpec::for_container("P1")).unwrap();
    let graph = graph.build().unwrap();

    let (store, handle) = simulated_executor(10.0, ExecutorConfig::default()).await;
    handle.submit_process(graph, 0, None).await.unwrap();
    handle.start(vec![ProcessId::new("timeout-demo")]).await.unwrap();

    let report = wait_for(&handle, "timeout-demo", 30, terminal).await;
    assert_eq!(report.state, ProcessState::Failed);

    let records = store.records();
    assert_eq!(records.iter().filter(|r| r.status == StepStatus::Failed).count(), 1);
}

/// Global pause halts new dispatches and resume releases them.
#[tokio::test(flavor = "multi_thread")]
async fn pause_blocks_dispatch_until_resume() {
    let mut graph = WorkflowGraph::builder("pause-demo");
    graph.add_labware(labware("P1", "Hotel", 0, false)).unwrap();
    graph.add_operation(move_op("move-to-incubator", "P1", DeviceKind::Incubator, "Incubator1", 2)).unwrap();
    graph.link("P1", "move-to-incubator", EdgeSpec::for_container("P1")).unwrap();
    let graph = graph.build().unwrap();

    let (store, handle) = simulated_executor(20.0, ExecutorConfig::default()).await;
    handle.pause(Scope::Global).await.unwrap();
    handle.submit_process(graph, 0, None).await.unwrap();
    handle.start(vec![ProcessId::new("pause-demo")]).await.unwrap();

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(store.history_len(), 0, "paused executor must not dispatch");

    handle.resume(Scope::Global).await.unwrap();
    let report = wait_for(&handle, "pause-demo", 30, terminal).await;
    assert_eq!(report.state, ProcessState::Completed, "error: {:?}", report.error);
}

/// A four-plate centrifuge bundle runs as one co-started operation.
#[tokio::test(flavor = "multi_thread")]
async fn centrifuge_bundle_co_starts_four_plates() {
    let mut graph = WorkflowGraph::builder("bundle-demo");
    for i in 1u32..=4 {
        let plate = format!("P{}", i);
        graph.add_labware(labware(&plate, "C", i - 1, false)).unwrap();
        graph.add_operation(op(&format!("spin-{}", i), "spin", DeviceKind::Centrifuge, Some("C"), 10, &[plate.as_str()])).unwrap();
        graph.link(&plate, &format!("spin-{}", i), EdgeSpec::for_container(plate.as_str())).unwrap();
    }
    let graph = graph.build().unwrap();

    let (store, handle) = simulated_executor(10.0, ExecutorConfig::default()).await;
    handle.submit_process(graph, 0, None).await.unwrap();
    handle.start(vec![ProcessId::new("bundle-demo")]).await.unwrap();

    let report = wait_for(&handle, "bundle-demo", 30, terminal).await;
    assert_eq!(report.state, ProcessState::Completed, "error: {:?}", report.error);

    let records = store.records();
    assert_eq!(records.len(), 4);
    let starts: std::collections::HashSet<i64> = records.iter().map(|r| r.start_s).collect();
    assert_eq!(starts.len(), 1, "bundle members must share one start");
}

/// An unload operation retires the container; the row survives with the
/// removed flag and its positions are freed.
#[tokio::test(flavor = "multi_thread")]
async fn unload_step_removes_the_container() {
    let mut graph = WorkflowGraph::builder("unload-demo");
    graph.add_labware(labware("P1", "Hotel", 0, false)).unwrap();
    graph.add_operation(op("unload-plate", "unload", DeviceKind::Storage, Some("Hotel"), 5, &["P1"])).unwrap();
    graph.link("P1", "unload-plate", EdgeSpec::for_container("P1")).unwrap();
    let graph = graph.build().unwrap();

    let (store, handle) = simulated_executor(20.0, ExecutorConfig::default()).await;
    handle.submit_process(graph, 0, None).await.unwrap();
    handle.start(vec![ProcessId::new("unload-demo")]).await.unwrap();

    let report = wait_for(&handle, "unload-demo", 30, terminal).await;
    assert_eq!(report.state, ProcessState::Completed, "error: {:?}", report.error);

    let p1 = store.container(&ContainerName::new("P1")).unwrap();
    assert!(p1.removed);
    assert!(store.position_empty(&Position::new("Hotel", 0)));
}

/// A step whose container is not where the operation expects it blocks at
/// dispatch and recovers once the lab catches up.
#[tokio::test(flavor = "multi_thread")]
async fn blocked_step_recovers_once_the_container_arrives() {
    // No movement step: the incubation expects P1 on Incubator1 while it
    // actually sits in storage.
    let mut graph = WorkflowGraph::builder("blocked-demo");
    graph.add_labware(labware("P1", "Hotel", 0, false)).unwrap();
    graph.add_operation(op("incubate-1", "incubate", DeviceKind::Incubator, Some("Incubator1"), 5, &["P1"])).unwrap();
    graph.link("P1", "incubate-1", EdgeSpec::for_container("P1")).unwrap();
    let graph = graph.build().unwrap();

    let (store, handle) = simulated_executor(20.0, ExecutorConfig::default()).await;
    handle.submit_process(graph, 0, None).await.unwrap();
    handle.start(vec![ProcessId::new("blocked-demo")]).await.unwrap();

    // The step keeps bouncing between blocked and ready, never running.
    tokio::time::sleep(Duration::from_millis(600)).await;
    let report = wait_for(&handle, "blocked-demo", 5, |r| !r.state.is_terminal()).await;
    assert_eq!(report.state, ProcessState::Running);
    assert_eq!(store.history_len(), 0);

    // An operator fixes the lab; the next dispatch attempt goes through.
    store.move_container(&Position::new("Hotel", 0), &Position::new("Incubator1", 0), None).unwrap();

    let report = wait_for(&handle, "blocked-demo", 30, terminal).await;
    assert_eq!(report.state, ProcessState::Completed, "error: {:?}", report.error);
    assert_eq!(store.history_len(), 1);
}
