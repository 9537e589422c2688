use lazy_static::lazy_static;
use std::collections::HashMap;

use crate::domain::device::DeviceKind;
use crate::domain::status_store::history::{HistoryRecord, StepStatus};
use crate::domain::status_store::store::StatusStore;

#[derive(Debug, Clone)]
pub struct EstimatorConfig {
    /// Below this many comparable samples the estimator answers "unknown"
    /// and the scheduler falls back to the declared expected duration.
    pub min_samples: usize,
    pub default_confidence: f64,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        EstimatorConfig { min_samples: 3, default_confidence: 0.95 }
    }
}

/// What to match past executions against.
#[derive(Debug, Clone)]
pub struct StepTemplate {
    pub fct: String,
    pub params: HashMap<String, serde_json::Value>,
    /// For movement steps: (source kind, target kind).
    pub movement: Option<(DeviceKind, DeviceKind)>,
}

lazy_static! {
    /// One-sided normal quantiles for the supported confidence levels.
    static ref Z_TABLE: Vec<(f64, f64)> = vec![(0.80, 0.8416), (0.90, 1.2816), (0.95, 1.6449), (0.975, 1.9600), (0.99, 2.3263)];
}

fn z_for(confidence: f64) -> f64 {
    let mut best = Z_TABLE[0];
    for entry in Z_TABLE.iter() {
        if (entry.0 - confidence).abs() < (best.0 - confidence).abs() {
            best = *entry;
        }
    }
    best.1
}

/// How specifically a history record matches a template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum MatchTier {
    FctOnly,
    FctAndParams,
    MovementPair,
}

fn match_tier(record: &HistoryRecord, template: &StepTemplate) -> Option<MatchTier> {
    if record.status != StepStatus::Ok {
        return None;
    }

    if let (Some(movement), Some((src, dst))) = (&record.movement, &template.movement) {
        if movement.source_kind == *src && movement.target_kind == *dst {
            return Some(MatchTier::MovementPair);
        }
    }
    if template.movement.is_some() {
        return None;
    }

    if record.fct != template.fct {
        return None;
    }
    if record.params == template.params {
        return Some(MatchTier::FctAndParams);
    }
    Some(MatchTier::FctOnly)
}

/// Upper-confidence-bound duration over comparable history.
///
/// Matching is tiered: movement steps match on the (source kind, target
/// kind) pair, operations on `fct` plus parameters, with `fct` alone as the
/// fallback when the specific tier is too thin.
pub fn estimate_duration(store: &StatusStore, template: &StepTemplate, confidence: f64, config: &EstimatorConfig) -> Option<i64> {
    let mut specific: Vec<f64> = Vec::new();
    let mut fallback: Vec<f64> = Vec::new();

    store.for_each_record(|record| match match_tier(record, template) {
        Some(MatchTier::MovementPair) | Some(MatchTier::FctAndParams) => specific.push(record.duration_s() as f64),
        Some(MatchTier::FctOnly) => fallback.push(record.duration_s() as f64),
        None => {}
    });

    let samples = if specific.len() >= config.min_samples {
        specific
    } else {
        // The fct-only tier includes the specific matches.
        fallback.extend(specific);
        fallback
    };
    if samples.len() < config.min_samples {
        return None;
    }

    let n = samples.len() as f64;
    let mean = samples.iter().sum::<f64>() / n;
    let variance = samples.iter().map(|d| (d - mean).powi(2)).sum::<f64>() / (n - 1.0).max(1.0);
    let upper = mean + z_for(confidence) * variance.sqrt() / n.sqrt();

    Some(upper.ceil() as i64)
}

impl StatusStore {
    /// See [`estimate_duration`]; the store is the natural home for the
    /// call since it owns the history.
    pub fn estimate_duration(&self, template: &StepTemplate, confidence: f64, config: &EstimatorConfig) -> Option<i64> {
        estimate_duration(self, template, confidence, config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::device::Position;
    use crate::domain::ids::{ContainerName, DeviceId, ExperimentId, ProcessId, StepId};
    use crate::domain::status_store::history::MovementInfo;

    fn record(fct: &str, duration: i64, movement: Option<MovementInfo>) -> HistoryRecord {
        HistoryRecord {
            step: StepId::new(format!("p.{}", fct)),
            process: ProcessId::new("p"),
            experiment: ExperimentId::new("e"),
            fct: fct.to_string(),
            device: DeviceId::new("dev"),
            containers: vec![ContainerName::new("P1")],
            start_s: 0,
            finish_s: duration,
            status: StepStatus::Ok,
            value: None,
            params: HashMap::new(),
            movement,
            is_simulation: false,
        }
    }

    fn hop(src: DeviceKind, dst: DeviceKind) -> MovementInfo {
        MovementInfo {
            origin: Position::new("a", 0),
            destination: Position::new("b", 0),
            source_kind: src,
            target_kind: dst,
            lidded: true,
        }
    }

    #[test]
    fn too_few_samples_yields_unknown() {
        let store = StatusStore::new();
        store.record_step(record("measure", 30, None));

        let template = StepTemplate { fct: "measure".to_string(), params: HashMap::new(), movement: None };
        assert_eq!(estimate_duration(&store, &template, 0.95, &EstimatorConfig::default()), None);
    }

    #[test]
    fn ucb_sits_above_the_mean() {
        let store = StatusStore::new();
        for d in [30, 32, 34, 36] {
            store.record_step(record("measure", d, None));
        }

        let template = StepTemplate { fct: "measure".to_string(), params: HashMap::new(), movement: None };
        let est = estimate_duration(&store, &template, 0.95, &EstimatorConfig::default()).unwrap();
        assert!(est >= 33, "UCB {} should be above the mean", est);
        assert!(est <= 40, "UCB {} should stay near the samples", est);
    }

    #[test]
    fn movement_matches_by_kind_pair() {
        let store = StatusStore::new();
        for d in [10, 12, 14] {
            store.record_step(record("move", d, Some(hop(DeviceKind::Storage, DeviceKind::Incubator))));
        }
        for d in [100, 110, 120] {
            store.record_step(record("move", d, Some(hop(DeviceKind::Storage, DeviceKind::Centrifuge))));
        }

        let template =
            StepTemplate { fct: "move".to_string(), params: HashMap::new(), movement: Some((DeviceKind::Storage, DeviceKind::Incubator)) };
        let est = estimate_duration(&store, &template, 0.95, &EstimatorConfig::default()).unwrap();
        assert!(est < 30, "estimate {} should come from the storage→incubator hops only", est);
    }
}
