use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::domain::device::{DeviceId, DeviceKind, Position};
use crate::domain::ids::{ContainerName, ExperimentId, ProcessId, StepId};

/// Terminal status of an executed step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepStatus {
    Ok,
    Failed,
    Cancelled,
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Movement specialization of a history record: origin, destination and the
/// lid flags the move was committed with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MovementInfo {
    pub origin: Position,
    pub destination: Position,
    pub source_kind: DeviceKind,
    pub target_kind: DeviceKind,
    pub lidded: bool,
}

/// One executed step, append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub step: StepId,
    pub process: ProcessId,
    pub experiment: ExperimentId,
    pub fct: String,
    pub device: DeviceId,
    pub containers: Vec<ContainerName>,

    pub start_s: i64,
    pub finish_s: i64,

    pub status: StepStatus,

    /// Return value of a producing operation.
    pub value: Option<serde_json::Value>,

    /// Free-form parameter bag of the operation.
    pub params: HashMap<String, serde_json::Value>,

    pub movement: Option<MovementInfo>,

    pub is_simulation: bool,
}

impl HistoryRecord {
    pub fn duration_s(&self) -> i64 {
        self.finish_s - self.start_s
    }
}
