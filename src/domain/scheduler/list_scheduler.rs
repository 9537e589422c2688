use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use crate::domain::device::{Device, DeviceId};
use crate::domain::ids::{ContainerName, ProcessId, StepId};
use crate::domain::instance::bundles::{Bundle, bundle_compatible_steps};
use crate::domain::instance::scheduling_instance::{PendingStepView, SchedulerSnapshot};
use crate::domain::scheduler::plan::{Assignment, Plan, PlanMode};
use crate::domain::scheduler::timeline::DeviceTimeline;
use crate::error::Error;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub short_budget_ms: u64,
    pub long_budget_ms: u64,
    /// Seconds a bundle-deferred step may wait before its process is
    /// declared unschedulable.
    pub bundle_deadline_s: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig { short_budget_ms: 2_000, long_budget_ms: 30_000, bundle_deadline_s: 600 }
    }
}

/// Result of one planning run. Processes listed in `errors` have no
/// assignments in the plan; all other live work is feasibly placed.
#[derive(Debug)]
pub struct ScheduleOutcome {
    pub plan: Plan,
    pub errors: Vec<Error>,
}

/// A list scheduler over per-device timelines.
///
/// Steps are placed in the normative selection order (earliest possible
/// start, then process priority, then incident wait-cost sum, then step id)
/// onto the device with the earliest finish time among candidates. The
/// function is pure with respect to its inputs: it only reads the snapshot
/// and, in short mode, the previous plan.
pub fn compute_plan(
    snapshot: &SchedulerSnapshot,
    mode: PlanMode,
    previous: Option<&Plan>,
    affected: &HashSet<ProcessId>,
    config: &SchedulerConfig,
) -> ScheduleOutcome {
    let budget = Duration::from_millis(match mode {
        PlanMode::Short => config.short_budget_ms,
        PlanMode::Long => config.long_budget_ms,
    });
    let started = Instant::now();
    let now = snapshot.now;

    let mut plan = Plan::empty(now, mode);
    let mut errors: Vec<Error> = Vec::new();
    let mut dead_processes: HashSet<ProcessId> = HashSet::new();

    // 1. Timelines seeded with current residency and in-flight operations.
    let mut timelines: HashMap<DeviceId, DeviceTimeline> = HashMap::new();
    for device in &snapshot.devices {
        let resident = snapshot.container_devices.values().filter(|d| **d == device.id).count() as u32;
        timelines.insert(device.id.clone(), DeviceTimeline::new(device.clone(), resident, now));
    }

    let mut container_free: HashMap<ContainerName, i64> = HashMap::new();
    let mut running_finish: HashMap<StepId, i64> = HashMap::new();
    for running in &snapshot.running {
        let finish = running.expected_finish.max(now);
        if let Some(tl) = timelines.get_mut(&running.device) {
            tl.book_operation(running.started_at, finish);
        }
        for container in &running.containers {
            container_free.insert(container.clone(), finish);
        }
        running_finish.insert(running.step_id.clone(), finish);
    }

    // Planned location of each container, updated as movements are placed.
    let mut planned_location: HashMap<ContainerName, DeviceId> = snapshot.container_devices.clone();

    // 2. Candidate devices per step; a step no device can ever take kills
    // its process immediately.
    let mut candidates: HashMap<StepId, Vec<DeviceId>> = HashMap::new();
    for step in &snapshot.pending {
        if dead_processes.contains(&step.process) {
            continue;
        }
        let list: Vec<DeviceId> = snapshot
            .devices
            .iter()
            .filter(|d| d.kind == step.device_kind)
            .filter(|d| step.device_pin.as_ref().map(|pin| *pin == d.id).unwrap_or(true))
            .filter(|d| d.capacity > 0 && d.process_capacity > 0)
            .map(|d| d.id.clone())
            .collect();
        if list.is_empty() {
            mark_unschedulable(
                &mut dead_processes,
                &mut errors,
                &step.process,
                format!("No usable device of kind {} for step '{}'.", step.device_kind, step.step_id),
            );
            continue;
        }
        candidates.insert(step.step_id.clone(), list);
    }

    // 3. Bundle steps that cannot meet a device's min_capacity alone.
    let device_by_id: HashMap<&DeviceId, &Device> = snapshot.devices.iter().map(|d| (&d.id, d)).collect();
    let mut bundle_of: HashMap<StepId, Bundle> = HashMap::new();
    {
        let needs_bundle: Vec<&PendingStepView> = snapshot
            .pending
            .iter()
            .filter(|s| !dead_processes.contains(&s.process))
            .filter(|s| {
                candidates
                    .get(&s.step_id)
                    .map(|list| list.iter().all(|d| device_by_id[d].min_capacity as usize > s.containers.len()))
                    .unwrap_or(false)
            })
            .collect();

        for bundle in bundle_compatible_steps(&needs_bundle) {
            let fillable = needs_bundle
                .iter()
                .filter(|s| bundle.members.contains(&s.step_id))
                .flat_map(|s| candidates.get(&s.step_id).into_iter().flatten())
                .any(|d| {
                    let dev = device_by_id[d];
                    dev.min_capacity <= bundle.container_count && bundle.container_count <= dev.capacity
                });

            if fillable {
                for member in &bundle.members {
                    bundle_of.insert(member.clone(), bundle.clone());
                }
            } else {
                // Not enough compatible containers yet: defer, and give up on
                // the owning processes once the deadline has passed.
                for step in needs_bundle.iter().filter(|s| bundle.members.contains(&s.step_id)) {
                    let waited_out = step.deferred_since.map(|since| now - since >= config.bundle_deadline_s).unwrap_or(false);
                    if waited_out {
                        mark_unschedulable(
                            &mut dead_processes,
                            &mut errors,
                            &step.process,
                            format!(
                                "Step '{}' needs a bundle of at least {} containers; only {} compatible after {}s.",
                                step.step_id,
                                candidates.get(&step.step_id).and_then(|l| l.first()).map(|d| device_by_id[d].min_capacity).unwrap_or(0),
                                bundle.container_count,
                                config.bundle_deadline_s
                            ),
                        );
                    } else {
                        plan.deferred.push(step.step_id.clone());
                    }
                }
            }
        }
    }

    let pending_by_id: HashMap<StepId, &PendingStepView> = snapshot.pending.iter().map(|s| (s.step_id.clone(), s)).collect();

    // 4. Short mode: retain assignments of processes the trigger event did
    // not touch, as long as they still fit.
    let mut retained: HashSet<StepId> = HashSet::new();
    if mode == PlanMode::Short {
        if let Some(prev) = previous {
            retain_unaffected(snapshot, prev, affected, &dead_processes, &mut timelines, &mut container_free, &mut planned_location, &mut plan, &mut retained);
        }
    }

    // 5. Main placement loop.
    let mut unplaced: Vec<StepId> = snapshot
        .pending
        .iter()
        .filter(|s| !dead_processes.contains(&s.process))
        .filter(|s| !retained.contains(&s.step_id))
        .filter(|s| !plan.deferred.contains(&s.step_id))
        .map(|s| s.step_id.clone())
        .collect();
    let mut placed_finish: HashMap<StepId, i64> = HashMap::new();
    for (step, finish) in &running_finish {
        placed_finish.insert(step.clone(), *finish);
    }
    for (step, assignment) in &plan.assignments {
        placed_finish.insert(step.clone(), assignment.expected_finish());
    }

    let mut budget_warned = false;
    while !unplaced.is_empty() {
        if started.elapsed() > budget && !budget_warned {
            budget_warned = true;
            log::warn!("Planning budget of {:?} exhausted with {} steps left; placing the remainder greedily.", budget, unplaced.len());
        }

        // Earliest possible start for every step whose predecessors are all
        // placed or finished, in the normative selection order.
        let mut selectable: Vec<(i64, i32, f64, StepId)> = Vec::new();
        for step_id in &unplaced {
            let step = pending_by_id[step_id];
            if dead_processes.contains(&step.process) {
                continue;
            }
            if let Some(est) = earliest_start(step, &placed_finish, &container_free) {
                selectable.push((est, step.priority, step.wait_cost_sum(), step_id.clone()));
            }
        }
        selectable.sort_by(|a, b| {
            a.0.cmp(&b.0)
                .then_with(|| a.1.cmp(&b.1))
                .then_with(|| a.2.partial_cmp(&b.2).unwrap_or(std::cmp::Ordering::Equal))
                .then_with(|| a.3.cmp(&b.3))
        });

        let mut progressed = false;

        for (est, _, _, step_id) in selectable {
            let step = pending_by_id[&step_id];
            if plan.assignments.contains_key(&step_id) {
                continue;
            }

            // Members of one bundle are placed together at a common start.
            let group: Vec<&PendingStepView> = match bundle_of.get(&step_id) {
                Some(bundle) => bundle.members.iter().filter_map(|m| pending_by_id.get(m).copied()).collect(),
                None => vec![step],
            };
            let mut group_est = est;
            let mut group_ready = true;
            for member in &group {
                match earliest_start(member, &placed_finish, &container_free) {
                    Some(e) => group_est = group_est.max(e),
                    None => {
                        group_ready = false;
                        break;
                    }
                }
            }
            if !group_ready {
                // Another member still waits on an unplaced predecessor; try
                // the next candidate this round.
                continue;
            }

            let group_containers: u32 = group.iter().map(|s| s.containers.len() as u32).sum();
            let latest = group.iter().filter_map(|s| latest_start(s, &placed_finish)).min().unwrap_or(i64::MAX);

            // Earliest-finish-time device selection among the candidates.
            let mut best: Option<(i64, DeviceId)> = None;
            for device_id in candidates.get(&step_id).into_iter().flatten() {
                let tl = &timelines[device_id];
                if device_by_id[device_id].min_capacity > group_containers {
                    continue;
                }
                // A bundle runs as one operation on the device.
                let arriving = if step.is_movement { group_containers } else { 0 };
                if let Some(start) = tl.earliest_fit(group_est, step.duration, 1, arriving) {
                    let better = match &best {
                        None => true,
                        Some((b_start, b_dev)) => start < *b_start || (start == *b_start && device_id < b_dev),
                    };
                    if better {
                        best = Some((start, device_id.clone()));
                    }
                }
            }

            let mut failure = None;
            let placement = match best {
                Some((start, _)) if start > latest => {
                    failure = Some(format!("Step '{}' cannot start before {} but max_wait forces a start by {}.", step_id, start, latest));
                    None
                }
                Some(found) => Some(found),
                None => {
                    failure = Some(format!("No device placement found for step '{}'.", step_id));
                    None
                }
            };

            let Some((start, device)) = placement else {
                // A provisional step inside an unresolved branch arm must not
                // kill its process; the arm may never be taken.
                if step.unresolved_guard {
                    plan.deferred.push(step_id.clone());
                    unplaced.retain(|s| s != &step_id);
                    progressed = true;
                    break;
                }
                mark_unschedulable(&mut dead_processes, &mut errors, &step.process, failure.unwrap_or_default());
                let process = step.process.clone();
                unplaced.retain(|s| pending_by_id[s].process != process);
                plan.drop_process(&process);
                progressed = true;
                break;
            };

            // Book the whole group.
            let end = start + step.duration.max(1);
            {
                let tl = timelines.get_mut(&device).expect("candidate device has a timeline");
                tl.book_operation(start, end);
                for member in &group {
                    if member.is_movement {
                        tl.add_residency(start, member.containers.len() as i32);
                    }
                }
            }
            for member in &group {
                if member.is_movement {
                    for container in &member.containers {
                        if let Some(origin) = planned_location.get(container) {
                            if *origin != device {
                                if let Some(src_tl) = timelines.get_mut(origin) {
                                    src_tl.add_residency(start, -1);
                                }
                            }
                        }
                        planned_location.insert(container.clone(), device.clone());
                    }
                }
                for container in &member.containers {
                    container_free.insert(container.clone(), end);
                }
                placed_finish.insert(member.step_id.clone(), end);
                plan.assignments.insert(
                    member.step_id.clone(),
                    Assignment {
                        step_id: member.step_id.clone(),
                        process: member.process.clone(),
                        node: member.node,
                        device: device.clone(),
                        earliest_start: start,
                        latest_start: latest,
                        duration: step.duration.max(1),
                        bundle: bundle_of.get(&member.step_id).map(|b| b.id.clone()),
                    },
                );
                unplaced.retain(|s| s != &member.step_id);
            }
            progressed = true;
            break;
        }

        if !progressed {
            // Whatever remains waits on a deferred bundle or on a pruned
            // predecessor; it stays out of this plan.
            for step_id in &unplaced {
                let step = pending_by_id[step_id];
                if !dead_processes.contains(&step.process) && !plan.deferred.contains(step_id) {
                    plan.deferred.push(step_id.clone());
                }
            }
            break;
        }
    }

    // Assignments of processes that died late must not survive.
    for process in &dead_processes {
        plan.drop_process(process);
        plan.deferred.retain(|s| pending_by_id.get(s).map(|p| p.process != *process).unwrap_or(true));
    }

    plan.rebuild_queues();
    plan.objective = objective(snapshot, &plan);

    tracing::info!(
        "Plan computed in {:?} ({:?} mode): {} assignments, {} deferred, {} unschedulable processes, objective {:.1}.",
        started.elapsed(),
        mode,
        plan.assignments.len(),
        plan.deferred.len(),
        errors.len(),
        plan.objective
    );

    ScheduleOutcome { plan, errors }
}

fn mark_unschedulable(dead: &mut HashSet<ProcessId>, errors: &mut Vec<Error>, process: &ProcessId, reason: String) {
    if dead.insert(process.clone()) {
        log::error!("Unschedulable: process '{}': {}", process, reason);
        errors.push(Error::Unschedulable { process: process.clone(), reason });
    }
}

/// Earliest admissible start, or `None` while a predecessor is unplaced.
fn earliest_start(step: &PendingStepView, placed_finish: &HashMap<StepId, i64>, container_free: &HashMap<ContainerName, i64>) -> Option<i64> {
    let mut est = step.release_floor;

    for dep in &step.deps {
        let finish = match dep.finished_at {
            Some(f) => f,
            None => match placed_finish.get(&dep.pred) {
                Some(f) => *f,
                None => return None,
            },
        };
        est = est.max(finish + dep.min_wait);
    }

    for container in &step.containers {
        if let Some(free_at) = container_free.get(container) {
            est = est.max(*free_at);
        }
    }

    Some(est)
}

/// Latest admissible start under `max_wait` bounds, when all bounding
/// predecessors have known finishes.
fn latest_start(step: &PendingStepView, placed_finish: &HashMap<StepId, i64>) -> Option<i64> {
    let mut latest: Option<i64> = None;
    for dep in &step.deps {
        if let Some(max_wait) = dep.max_wait {
            let finish = dep.finished_at.or_else(|| placed_finish.get(&dep.pred).copied())?;
            let bound = finish + max_wait;
            latest = Some(latest.map(|l: i64| l.min(bound)).unwrap_or(bound));
        }
    }
    latest
}

/// Re-books the previous assignments of unaffected processes verbatim where
/// they are still feasible; anything that no longer fits is re-placed by the
/// main loop.
#[allow(clippy::too_many_arguments)]
fn retain_unaffected(
    snapshot: &SchedulerSnapshot,
    previous: &Plan,
    affected: &HashSet<ProcessId>,
    dead: &HashSet<ProcessId>,
    timelines: &mut HashMap<DeviceId, DeviceTimeline>,
    container_free: &mut HashMap<ContainerName, i64>,
    planned_location: &mut HashMap<ContainerName, DeviceId>,
    plan: &mut Plan,
    retained: &mut HashSet<StepId>,
) {
    let now = snapshot.now;
    let mut by_process: HashMap<ProcessId, Vec<&PendingStepView>> = HashMap::new();
    for step in &snapshot.pending {
        by_process.entry(step.process.clone()).or_default().push(step);
    }

    'process: for (process, steps) in &by_process {
        if affected.contains(process) || dead.contains(process) {
            continue;
        }

        let mut bookings: Vec<(&PendingStepView, Assignment)> = Vec::new();
        for step in steps {
            match previous.assignment(&step.step_id) {
                Some(a) if a.earliest_start >= now => {
                    let tl = match timelines.get(&a.device) {
                        Some(tl) => tl,
                        None => continue 'process,
                    };
                    let arriving = if step.is_movement { step.containers.len() as u32 } else { 0 };
                    if !tl.fits(a.earliest_start, a.duration, 1, arriving) {
                        continue 'process;
                    }
                    bookings.push((step, a.clone()));
                }
                _ => continue 'process,
            }
        }

        for (step, assignment) in bookings {
            let end = assignment.expected_finish();
            let device = assignment.device.clone();
            if let Some(tl) = timelines.get_mut(&device) {
                tl.book_operation(assignment.earliest_start, end);
                if step.is_movement {
                    tl.add_residency(assignment.earliest_start, step.containers.len() as i32);
                }
            }
            for container in &step.containers {
                if step.is_movement {
                    if let Some(origin) = planned_location.get(container) {
                        if *origin != device {
                            if let Some(src_tl) = timelines.get_mut(origin) {
                                src_tl.add_residency(assignment.earliest_start, -1);
                            }
                        }
                    }
                    planned_location.insert(container.clone(), device.clone());
                }
                container_free.insert(container.clone(), end);
            }
            retained.insert(step.step_id.clone());
            plan.assignments.insert(step.step_id.clone(), assignment);
        }
    }
}

/// Σ wait_cost × idle_seconds over planned edges plus Σ (priority + 1) ×
/// makespan per process, with makespan measured from `now`.
fn objective(snapshot: &SchedulerSnapshot, plan: &Plan) -> f64 {
    let mut total = 0.0;

    let mut process_finish: HashMap<&ProcessId, i64> = HashMap::new();
    let mut process_priority: HashMap<&ProcessId, i32> = HashMap::new();

    for step in &snapshot.pending {
        let Some(assignment) = plan.assignment(&step.step_id) else { continue };
        process_priority.insert(&step.process, step.priority);
        let entry = process_finish.entry(&step.process).or_insert(i64::MIN);
        *entry = (*entry).max(assignment.expected_finish());

        for dep in &step.deps {
            let finish = dep.finished_at.or_else(|| plan.assignment(&dep.pred).map(|a| a.expected_finish()));
            if let Some(finish) = finish {
                let idle = (assignment.earliest_start - finish).max(0);
                total += dep.wait_cost * idle as f64;
            }
        }
    }

    for (process, finish) in process_finish {
        let priority = process_priority.get(process).copied().unwrap_or(0);
        total += (priority as f64 + 1.0) * (finish - snapshot.now).max(0) as f64;
    }

    total
}
