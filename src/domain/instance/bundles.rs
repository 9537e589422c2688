use std::collections::HashMap;
use union_find::{QuickUnionUf, UnionBySize, UnionFind};

use crate::domain::ids::{BundleId, StepId};
use crate::domain::instance::scheduling_instance::PendingStepView;

/// A group of compatible steps that must run as one operation on a
/// `min_capacity` device (centrifuge balance). Either the whole bundle is
/// dispatched co-started, or none of it is.
#[derive(Debug, Clone)]
pub struct Bundle {
    pub id: BundleId,
    pub members: Vec<StepId>,
    /// Total containers the bundle would load onto the device.
    pub container_count: u32,
}

/// Groups pending steps that target the same `min_capacity` device kind and
/// are compatible: same function, same parameters, same device pin.
///
/// Compatibility is established pairwise through a disjoint-set union so the
/// grouping stays correct if compatibility ever becomes non-transitive at
/// the parameter level.
pub fn bundle_compatible_steps(steps: &[&PendingStepView]) -> Vec<Bundle> {
    if steps.is_empty() {
        return Vec::new();
    }

    let mut dsu = QuickUnionUf::<UnionBySize>::new(steps.len());

    for i in 0..steps.len() {
        for j in (i + 1)..steps.len() {
            if compatible(steps[i], steps[j]) {
                dsu.union(i, j);
            }
        }
    }

    let mut groups: HashMap<usize, Vec<usize>> = HashMap::new();
    for i in 0..steps.len() {
        groups.entry(dsu.find(i)).or_default().push(i);
    }

    let mut bundles: Vec<Bundle> = groups
        .into_values()
        .map(|indices| {
            let mut members: Vec<StepId> = indices.iter().map(|&i| steps[i].step_id.clone()).collect();
            members.sort();
            let container_count = indices.iter().map(|&i| steps[i].containers.len() as u32).sum();
            let id = BundleId::new(format!("bundle.{}", members[0]));
            Bundle { id, members, container_count }
        })
        .collect();

    bundles.sort_by(|a, b| a.id.cmp(&b.id));
    bundles
}

fn compatible(a: &PendingStepView, b: &PendingStepView) -> bool {
    a.device_kind == b.device_kind && a.fct == b.fct && a.device_pin == b.device_pin && a.params == b.params
}
