use thiserror::Error;

use crate::domain::ids::{ContainerName, DeviceId, ProcessId, StepId};

/// Detail of a Status Store invariant violation. The store rejects the
/// mutating operation and leaves no state change behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateConflictKind {
    PositionOccupied,
    UnknownDevice,
    UnknownContainer,
    SlotOutOfRange,
    SourceEmpty,
    DestOccupied,
    AmbiguousSource,
    BarcodeMismatch,
    BarcodeInUse,
    LidStateInvalid,
    ContainerRemoved,
}

impl std::fmt::Display for StateConflictKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("File not found or could not be read: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse JSON document: {0}")]
    DeserializationError(#[from] serde_json::Error),

    #[error("Invalid lab configuration: {0}")]
    ConfigError(String),

    #[error("Status store conflict ({kind}): {message}")]
    StateConflict { kind: StateConflictKind, message: String },

    #[error("No feasible plan exists for process {process}: {reason}")]
    Unschedulable { process: ProcessId, reason: String },

    #[error("Step {step} on device {device} failed: {message}")]
    StepFailure { step: StepId, device: DeviceId, message: String },

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Lost connection to device adapter for {device}: {message}")]
    TransportError { device: DeviceId, message: String },

    #[error("Workflow graph is invalid: {0}")]
    GraphError(String),

    #[error("Unknown container '{0}'")]
    UnknownContainer(ContainerName),

    #[error("Unknown process '{0}'")]
    UnknownProcess(ProcessId),

    /// A command rejected on the far side of the control surface.
    #[error("Remote {kind}: {message}")]
    Remote { kind: String, message: String },
}

impl Error {
    pub fn conflict(kind: StateConflictKind, message: impl Into<String>) -> Self {
        Error::StateConflict { kind, message: message.into() }
    }

    /// The conflict kind, when this error is a store conflict.
    pub fn conflict_kind(&self) -> Option<&StateConflictKind> {
        match self {
            Error::StateConflict { kind, .. } => Some(kind),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
