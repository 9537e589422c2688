use serde::{Deserialize, Serialize};
use slotmap::new_key_type;

use crate::domain::device::Position;
use crate::domain::ids::ContainerName;

new_key_type! {
    /// Store-internal key of a container row.
    pub struct ContainerKey;
}

/// A physical labware item (plate, tube) tracked by the Status Store.
///
/// Rows are never hard-deleted; a container leaves the lab by transitioning
/// to `removed = true`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Container {
    pub name: ContainerName,
    pub barcode: Option<String>,

    pub current_pos: Position,
    pub starting_pos: Position,

    /// Whether the lid currently sits on the container.
    pub lidded: bool,

    /// Where the lid is parked. Set iff `lidded == false` and the container
    /// has a lid at all.
    pub lid_pos: Option<Position>,

    pub removed: bool,

    /// Labware-type tag, e.g. `deep_well`; used as a position compatibility filter.
    pub labware_type: Option<String>,
}

/// Input for `StatusStore::add_container`.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: ContainerName,
    pub barcode: Option<String>,
    pub position: Position,
    pub lidded: bool,
    pub labware_type: Option<String>,
}

impl ContainerSpec {
    pub fn new(name: impl Into<ContainerName>, position: Position) -> ContainerSpec {
        ContainerSpec { name: name.into(), barcode: None, position, lidded: false, labware_type: None }
    }

    pub fn with_barcode(mut self, barcode: impl Into<String>) -> Self {
        self.barcode = Some(barcode.into());
        self
    }

    pub fn lidded(mut self) -> Self {
        self.lidded = true;
        self
    }

    pub fn with_labware_type(mut self, tag: impl Into<String>) -> Self {
        self.labware_type = Some(tag.into());
        self
    }
}

pub const DEEP_WELL_LABWARE: &str = "deep_well";

impl Container {
    /// Whether this container may occupy `slot` given its labware type.
    pub fn slot_compatible(&self, deep_well_suited: bool) -> bool {
        match self.labware_type.as_deref() {
            Some(DEEP_WELL_LABWARE) => deep_well_suited,
            _ => true,
        }
    }
}
