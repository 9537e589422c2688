use std::collections::HashMap;

use crate::domain::device::DeviceId;
use crate::domain::graph::node::NodeKey;
use crate::domain::ids::{BundleId, ProcessId, StepId};

/// Planning mode. Short re-plans locally and retains unaffected
/// assignments; long re-plans everything from scratch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanMode {
    Short,
    Long,
}

/// Start-time window assignment of one step to a concrete device.
#[derive(Debug, Clone)]
pub struct Assignment {
    pub step_id: StepId,
    pub process: ProcessId,
    pub node: NodeKey,
    pub device: DeviceId,
    pub earliest_start: i64,
    /// Latest start admissible under the `max_wait` bounds of the step's
    /// incoming edges. `i64::MAX` when unbounded.
    pub latest_start: i64,
    pub duration: i64,
    /// Set when the step runs as part of a `min_capacity` bundle.
    pub bundle: Option<BundleId>,
}

impl Assignment {
    pub fn expected_finish(&self) -> i64 {
        self.earliest_start + self.duration
    }
}

/// The scheduler's output: a feasible start-time assignment for every
/// placeable step plus a totally ordered per-device queue.
#[derive(Debug, Clone)]
pub struct Plan {
    pub computed_at: i64,
    pub mode: PlanMode,
    pub assignments: HashMap<StepId, Assignment>,
    pub device_queues: HashMap<DeviceId, Vec<StepId>>,
    /// Σ wait_cost × idle_seconds + Σ (priority + 1) × makespan.
    pub objective: f64,
    /// Steps waiting for a `min_capacity` bundle to fill up.
    pub deferred: Vec<StepId>,
}

impl Plan {
    pub fn empty(now: i64, mode: PlanMode) -> Plan {
        Plan { computed_at: now, mode, assignments: HashMap::new(), device_queues: HashMap::new(), objective: 0.0, deferred: Vec::new() }
    }

    pub fn assignment(&self, step: &StepId) -> Option<&Assignment> {
        self.assignments.get(step)
    }

    pub fn is_deferred(&self, step: &StepId) -> bool {
        self.deferred.contains(step)
    }

    /// Assignments of one process, ordered by start.
    pub fn process_assignments(&self, process: &ProcessId) -> Vec<&Assignment> {
        let mut out: Vec<&Assignment> = self.assignments.values().filter(|a| a.process == *process).collect();
        out.sort_by_key(|a| (a.earliest_start, a.step_id.clone()));
        out
    }

    pub fn drop_process(&mut self, process: &ProcessId) {
        let dropped: Vec<StepId> = self.assignments.values().filter(|a| a.process == *process).map(|a| a.step_id.clone()).collect();
        for step in &dropped {
            self.assignments.remove(step);
        }
        for queue in self.device_queues.values_mut() {
            queue.retain(|s| !dropped.contains(s));
        }
    }

    /// Checks every feasibility invariant of this plan against a snapshot:
    /// per-device operation concurrency and overlap rules, container
    /// exclusivity, and the wait bounds of every dependency edge.
    ///
    /// # Returns
    /// The first violation found, as a human-readable description.
    pub fn validate(&self, snapshot: &crate::domain::instance::scheduling_instance::SchedulerSnapshot) -> Result<(), String> {
        use std::collections::HashMap as Map;

        let pending: Map<&StepId, &crate::domain::instance::scheduling_instance::PendingStepView> =
            snapshot.pending.iter().map(|s| (&s.step_id, s)).collect();

        // Operation windows per device; bundle members collapse into one.
        let mut device_windows: Map<&DeviceId, Vec<(i64, i64, &StepId)>> = Map::new();
        let mut seen_bundles: std::collections::HashSet<&BundleId> = std::collections::HashSet::new();
        for assignment in self.assignments.values() {
            if let Some(bundle) = &assignment.bundle {
                if !seen_bundles.insert(bundle) {
                    continue;
                }
            }
            device_windows.entry(&assignment.device).or_default().push((
                assignment.earliest_start,
                assignment.expected_finish(),
                &assignment.step_id,
            ));
        }
        for running in &snapshot.running {
            device_windows.entry(&running.device).or_default().push((running.started_at, running.expected_finish, &running.step_id));
        }

        for device in &snapshot.devices {
            let Some(windows) = device_windows.get(&device.id) else { continue };
            let mut events: Vec<(i64, i32)> = Vec::new();
            for (start, end, _) in windows {
                events.push((*start, 1));
                events.push((*end, -1));
            }
            events.sort();
            let mut concurrent = 0;
            for (_, delta) in events {
                concurrent += delta;
                if concurrent as u32 > device.process_capacity {
                    return Err(format!("Device '{}' exceeds process_capacity {}.", device.id, device.process_capacity));
                }
                if !device.allows_overlap && concurrent > 1 {
                    return Err(format!("Device '{}' has overlapping operations but allows_overlap is false.", device.id));
                }
            }
        }

        // Container exclusivity.
        let mut container_windows: Map<&crate::domain::ids::ContainerName, Vec<(i64, i64, &StepId)>> = Map::new();
        for assignment in self.assignments.values() {
            if let Some(step) = pending.get(&assignment.step_id) {
                for container in &step.containers {
                    container_windows.entry(container).or_default().push((
                        assignment.earliest_start,
                        assignment.expected_finish(),
                        &assignment.step_id,
                    ));
                }
            }
        }
        for running in &snapshot.running {
            for container in &running.containers {
                container_windows.entry(container).or_default().push((running.started_at, running.expected_finish, &running.step_id));
            }
        }
        for (container, mut windows) in container_windows {
            windows.sort();
            for pair in windows.windows(2) {
                if pair[0].1 > pair[1].0 {
                    return Err(format!("Container '{}' is claimed by '{}' and '{}' at once.", container, pair[0].2, pair[1].2));
                }
            }
        }

        // Wait bounds.
        for assignment in self.assignments.values() {
            let Some(step) = pending.get(&assignment.step_id) else { continue };
            for dep in &step.deps {
                let finish = dep
                    .finished_at
                    .or_else(|| self.assignment(&dep.pred).map(|a| a.expected_finish()))
                    .or_else(|| snapshot.running.iter().find(|r| r.step_id == dep.pred).map(|r| r.expected_finish));
                let Some(finish) = finish else { continue };

                if assignment.earliest_start < finish + dep.min_wait {
                    return Err(format!(
                        "Step '{}' starts at {} but min_wait after '{}' requires {}.",
                        assignment.step_id,
                        assignment.earliest_start,
                        dep.pred,
                        finish + dep.min_wait
                    ));
                }
                if let Some(max_wait) = dep.max_wait {
                    if assignment.earliest_start > finish + max_wait {
                        return Err(format!(
                            "Step '{}' starts at {} but max_wait after '{}' allows at most {}.",
                            assignment.step_id,
                            assignment.earliest_start,
                            dep.pred,
                            finish + max_wait
                        ));
                    }
                }
            }
        }

        Ok(())
    }

    pub(crate) fn rebuild_queues(&mut self) {
        self.device_queues.clear();
        let mut by_device: HashMap<DeviceId, Vec<&Assignment>> = HashMap::new();
        for a in self.assignments.values() {
            by_device.entry(a.device.clone()).or_default().push(a);
        }
        for (device, mut list) in by_device {
            list.sort_by_key(|a| (a.earliest_start, a.step_id.clone()));
            self.device_queues.insert(device, list.into_iter().map(|a| a.step_id.clone()).collect());
        }
    }
}
