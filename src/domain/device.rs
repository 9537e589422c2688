use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub use crate::domain::ids::DeviceId;

/// The device classes the scheduler knows how to place work on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    Incubator,
    PlateReader,
    LiquidHandler,
    Mover,
    Centrifuge,
    Storage,
}

impl DeviceKind {
    /// The section name used for this kind in the lab configuration document.
    pub fn config_section(&self) -> &'static str {
        match self {
            DeviceKind::Incubator => "incubators",
            DeviceKind::PlateReader => "plate_readers",
            DeviceKind::LiquidHandler => "liquid_handlers",
            DeviceKind::Mover => "movers",
            DeviceKind::Centrifuge => "centrifuges",
            DeviceKind::Storage => "storage",
        }
    }

    pub fn all() -> [DeviceKind; 6] {
        [
            DeviceKind::Incubator,
            DeviceKind::PlateReader,
            DeviceKind::LiquidHandler,
            DeviceKind::Mover,
            DeviceKind::Centrifuge,
            DeviceKind::Storage,
        ]
    }
}

impl std::fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// A physical device of the lab. Created at lab configuration, mutated only
/// by admin commands, destroyed only on a full lab reset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    pub kind: DeviceKind,

    /// Max concurrent containers.
    pub capacity: u32,

    /// Max concurrent operations. Defaults to `capacity`.
    pub process_capacity: u32,

    /// Minimum occupancy required to operate (centrifuge balance).
    pub min_capacity: u32,

    /// Whether two operations may overlap in time on this device.
    pub allows_overlap: bool,

    /// Slot indices suited for deep-well labware.
    pub deep_well_slots: Vec<u32>,

    /// Custom parameters from the lab document, passed through to adapters.
    pub params: HashMap<String, serde_json::Value>,
}

impl Device {
    pub fn slot_in_range(&self, slot: u32) -> bool {
        slot < self.capacity
    }

    pub fn slot_deep_well_suited(&self, slot: u32) -> bool {
        self.deep_well_slots.contains(&slot)
    }
}

/// A slot on a device; uniquely identifies a physical location. Lids and
/// containers share this namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Position {
    pub device: DeviceId,
    pub slot: u32,
}

impl Position {
    pub fn new(device: impl Into<DeviceId>, slot: u32) -> Position {
        Position { device: device.into(), slot }
    }
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}]", self.device, self.slot)
    }
}
