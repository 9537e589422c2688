use bimap::BiMap;
use slotmap::SlotMap;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::domain::container::{Container, ContainerKey, ContainerSpec};
use crate::domain::device::{Device, DeviceId, DeviceKind, Position};
use crate::domain::ids::ContainerName;
use crate::domain::status_store::history::HistoryRecord;
use crate::domain::status_store::persistence::HistoryBackend;
use crate::error::{Error, Result, StateConflictKind};

/// What a position currently holds. At most one occupant per position; lids
/// and containers share the namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Occupant {
    Container(ContainerKey),
    /// A parked lid, tagged with the container it belongs to.
    Lid(ContainerKey),
}

#[derive(Debug, Default)]
struct StoreInner {
    devices: HashMap<DeviceId, Device>,
    containers: SlotMap<ContainerKey, Container>,

    /// Index lookup of the internal key by user-facing container name.
    name_index: HashMap<ContainerName, ContainerKey>,
    barcode_index: BiMap<String, ContainerKey>,

    occupancy: HashMap<Position, Occupant>,

    history: Vec<HistoryRecord>,
    backend: Option<Box<dyn HistoryBackend>>,
}

/// Authoritative record of devices, positions, containers, lids and step
/// history. All mutations are validated against the store invariants and
/// rejected, never silently corrected, on violation.
#[derive(Debug, Clone)]
pub struct StatusStore {
    /// Both maps are protected with a single lock, so every mutating
    /// operation is atomic with respect to all invariants.
    inner: Arc<RwLock<StoreInner>>,
}

impl StatusStore {
    pub fn new() -> Self {
        Self { inner: Arc::new(RwLock::new(StoreInner::default())) }
    }

    pub fn with_backend(backend: Box<dyn HistoryBackend>) -> Self {
        let store = Self::new();
        store.inner.write().expect("RwLock poisoned").backend = Some(backend);
        store
    }

    // ---- Device catalogue ----

    /// Replaces the device catalogue. Containers and occupancy are cleared
    /// with it since positions reference devices; history is kept.
    pub fn replace_devices(&self, devices: Vec<Device>) {
        let mut guard = self.inner.write().expect("RwLock poisoned");
        guard.devices = devices.into_iter().map(|d| (d.id.clone(), d)).collect();
        guard.containers.clear();
        guard.name_index.clear();
        guard.barcode_index.clear();
        guard.occupancy.clear();
        log::info!("Device catalogue replaced: {} devices.", guard.devices.len());
    }

    pub fn device(&self, id: &DeviceId) -> Option<Device> {
        let guard = self.inner.read().expect("RwLock poisoned");
        guard.devices.get(id).cloned()
    }

    pub fn devices(&self) -> Vec<Device> {
        let guard = self.inner.read().expect("RwLock poisoned");
        guard.devices.values().cloned().collect()
    }

    pub fn devices_of_kind(&self, kind: DeviceKind) -> Vec<Device> {
        let guard = self.inner.read().expect("RwLock poisoned");
        guard.devices.values().filter(|d| d.kind == kind).cloned().collect()
    }

    // ---- Containers ----

    /// Adds a container at its starting position.
    ///
    /// # Returns
    /// The internal key of the new container row.
    pub fn add_container(&self, spec: ContainerSpec) -> Result<ContainerKey> {
        let mut guard = self.inner.write().expect("RwLock poisoned");

        Self::check_position(&guard, &spec.position)?;
        if guard.occupancy.contains_key(&spec.position) {
            return Err(Error::conflict(
                StateConflictKind::PositionOccupied,
                format!("Cannot add container '{}': position {} is occupied.", spec.name, spec.position),
            ));
        }
        if guard.name_index.contains_key(&spec.name) {
            return Err(Error::conflict(
                StateConflictKind::PositionOccupied,
                format!("Container name '{}' already exists in the store.", spec.name),
            ));
        }
        if let Some(bc) = &spec.barcode {
            if guard.barcode_index.contains_left(bc) {
                return Err(Error::conflict(StateConflictKind::BarcodeInUse, format!("Barcode '{}' is already bound.", bc)));
            }
        }
        if spec.labware_type.as_deref() == Some(crate::domain::container::DEEP_WELL_LABWARE) {
            let suited = guard.devices.get(&spec.position.device).map(|d| d.slot_deep_well_suited(spec.position.slot)).unwrap_or(false);
            if !suited {
                return Err(Error::conflict(
                    StateConflictKind::PositionOccupied,
                    format!("Position {} is not suited for deep-well labware.", spec.position),
                ));
            }
        }

        let container = Container {
            name: spec.name.clone(),
            barcode: spec.barcode.clone(),
            current_pos: spec.position.clone(),
            starting_pos: spec.position.clone(),
            lidded: spec.lidded,
            lid_pos: None,
            removed: false,
            labware_type: spec.labware_type,
        };

        let key = guard.containers.insert(container);
        guard.name_index.insert(spec.name, key);
        if let Some(bc) = spec.barcode {
            guard.barcode_index.insert(bc, key);
        }
        guard.occupancy.insert(spec.position, Occupant::Container(key));

        Ok(key)
    }

    /// Moves the container at `src` to `dst`. Atomic: either every check
    /// passes and the container is at `dst` afterwards, or nothing changed.
    ///
    /// If `barcode` is supplied, the container found at the source must carry
    /// it; a barcode known to the store but tracked at a different position
    /// is an ambiguous source.
    pub fn move_container(&self, src: &Position, dst: &Position, barcode: Option<&str>) -> Result<()> {
        let mut guard = self.inner.write().expect("RwLock poisoned");

        Self::check_position(&guard, src)?;
        Self::check_position(&guard, dst)?;

        let key = match guard.occupancy.get(src) {
            Some(Occupant::Container(key)) => *key,
            Some(Occupant::Lid(_)) | None => {
                if let Some(bc) = barcode {
                    if let Some(other) = guard.barcode_index.get_by_left(bc) {
                        let tracked = &guard.containers[*other].current_pos;
                        return Err(Error::conflict(
                            StateConflictKind::AmbiguousSource,
                            format!("Source {} is empty but barcode '{}' is tracked at {}.", src, bc, tracked),
                        ));
                    }
                }
                return Err(Error::conflict(StateConflictKind::SourceEmpty, format!("No container at source position {}.", src)));
            }
        };

        if let Some(bc) = barcode {
            let actual = guard.containers[key].barcode.as_deref();
            if actual != Some(bc) {
                return Err(Error::conflict(
                    StateConflictKind::BarcodeMismatch,
                    format!("Container '{}' at {} carries barcode {:?}, expected '{}'.", guard.containers[key].name, src, actual, bc),
                ));
            }
        }

        if guard.occupancy.contains_key(dst) {
            return Err(Error::conflict(StateConflictKind::DestOccupied, format!("Destination position {} is occupied.", dst)));
        }

        let deep_well_suited = guard.devices.get(&dst.device).map(|d| d.slot_deep_well_suited(dst.slot)).unwrap_or(false);
        if !guard.containers[key].slot_compatible(deep_well_suited) {
            return Err(Error::conflict(
                StateConflictKind::DestOccupied,
                format!("Destination {} is not suited for labware type {:?}.", dst, guard.containers[key].labware_type),
            ));
        }

        guard.occupancy.remove(src);
        guard.occupancy.insert(dst.clone(), Occupant::Container(key));
        guard.containers[key].current_pos = dst.clone();

        Ok(())
    }

    /// Takes the lid off `container` and parks it at the given position.
    pub fn unlid(&self, container: &ContainerName, lid_pos: &Position) -> Result<()> {
        let mut guard = self.inner.write().expect("RwLock poisoned");

        let key = Self::live_key(&guard, container)?;
        Self::check_position(&guard, lid_pos)?;

        if !guard.containers[key].lidded {
            return Err(Error::conflict(StateConflictKind::LidStateInvalid, format!("Container '{}' is not lidded.", container)));
        }
        if guard.occupancy.contains_key(lid_pos) {
            return Err(Error::conflict(
                StateConflictKind::PositionOccupied,
                format!("Cannot park lid of '{}': position {} is occupied.", container, lid_pos),
            ));
        }

        guard.occupancy.insert(lid_pos.clone(), Occupant::Lid(key));
        guard.containers[key].lidded = false;
        guard.containers[key].lid_pos = Some(lid_pos.clone());

        Ok(())
    }

    /// Puts the parked lid back on `container`. If coordinates are supplied
    /// the lid must actually be parked there.
    pub fn lid(&self, container: &ContainerName, expected_lid_pos: Option<&Position>) -> Result<()> {
        let mut guard = self.inner.write().expect("RwLock poisoned");

        let key = Self::live_key(&guard, container)?;

        if guard.containers[key].lidded {
            return Err(Error::conflict(StateConflictKind::LidStateInvalid, format!("Container '{}' is already lidded.", container)));
        }
        let lid_pos = match guard.containers[key].lid_pos.clone() {
            Some(pos) => pos,
            None => {
                return Err(Error::conflict(StateConflictKind::LidStateInvalid, format!("Container '{}' has no parked lid.", container)));
            }
        };
        if let Some(expected) = expected_lid_pos {
            if *expected != lid_pos {
                return Err(Error::conflict(
                    StateConflictKind::LidStateInvalid,
                    format!("Lid of '{}' is parked at {}, not at {}.", container, lid_pos, expected),
                ));
            }
        }

        guard.occupancy.remove(&lid_pos);
        guard.containers[key].lidded = true;
        guard.containers[key].lid_pos = None;

        Ok(())
    }

    /// Binds a barcode to a container. A barcode already bound to a
    /// different container is rejected, never re-bound.
    pub fn set_barcode(&self, container: &ContainerName, barcode: impl Into<String>) -> Result<()> {
        let mut guard = self.inner.write().expect("RwLock poisoned");
        let key = Self::live_key(&guard, container)?;
        let barcode = barcode.into();

        if let Some(existing) = guard.barcode_index.get_by_left(&barcode) {
            if *existing != key {
                return Err(Error::conflict(
                    StateConflictKind::BarcodeInUse,
                    format!("Barcode '{}' is already bound to '{}'.", barcode, guard.containers[*existing].name),
                ));
            }
            return Ok(());
        }

        if let Some(old) = guard.containers[key].barcode.take() {
            guard.barcode_index.remove_by_left(&old);
        }
        guard.barcode_index.insert(barcode.clone(), key);
        guard.containers[key].barcode = Some(barcode);

        Ok(())
    }

    /// Marks a container removed and frees its positions. The row itself is
    /// kept; history stays queryable.
    pub fn remove_container(&self, container: &ContainerName) -> Result<()> {
        let mut guard = self.inner.write().expect("RwLock poisoned");
        let key = Self::live_key(&guard, container)?;

        let current = guard.containers[key].current_pos.clone();
        guard.occupancy.remove(&current);
        if let Some(lid_pos) = guard.containers[key].lid_pos.take() {
            guard.occupancy.remove(&lid_pos);
        }
        guard.containers[key].removed = true;

        Ok(())
    }

    /// Clears containers, occupancy and history. The device catalogue
    /// survives; replacing it is `replace_devices`.
    pub fn wipe_lab(&self) {
        let mut guard = self.inner.write().expect("RwLock poisoned");
        guard.containers.clear();
        guard.name_index.clear();
        guard.barcode_index.clear();
        guard.occupancy.clear();
        guard.history.clear();
        log::warn!("Status store wiped.");
    }

    // ---- Queries ----

    pub fn position_empty(&self, pos: &Position) -> bool {
        let guard = self.inner.read().expect("RwLock poisoned");
        !guard.occupancy.contains_key(pos)
    }

    pub fn container_at(&self, pos: &Position) -> Option<Container> {
        let guard = self.inner.read().expect("RwLock poisoned");
        match guard.occupancy.get(pos) {
            Some(Occupant::Container(key)) => guard.containers.get(*key).filter(|c| !c.removed).cloned(),
            _ => None,
        }
    }

    pub fn container_by_barcode(&self, barcode: &str) -> Option<Container> {
        let guard = self.inner.read().expect("RwLock poisoned");
        let key = guard.barcode_index.get_by_left(barcode)?;
        guard.containers.get(*key).filter(|c| !c.removed).cloned()
    }

    pub fn container(&self, name: &ContainerName) -> Option<Container> {
        let guard = self.inner.read().expect("RwLock poisoned");
        let key = guard.name_index.get(name)?;
        guard.containers.get(*key).cloned()
    }

    /// All containers not yet removed.
    pub fn live_containers(&self) -> Vec<Container> {
        let guard = self.inner.read().expect("RwLock poisoned");
        guard.containers.values().filter(|c| !c.removed).cloned().collect()
    }

    /// Count of live containers currently occupying positions on `device`.
    pub fn containers_on_device(&self, device: &DeviceId) -> u32 {
        let guard = self.inner.read().expect("RwLock poisoned");
        guard.occupancy.iter().filter(|(pos, occ)| pos.device == *device && matches!(occ, Occupant::Container(_))).count() as u32
    }

    /// First empty slot on `device` compatible with `labware_type`.
    pub fn free_slot(&self, device: &DeviceId, labware_type: Option<&str>) -> Option<u32> {
        let guard = self.inner.read().expect("RwLock poisoned");
        let dev = guard.devices.get(device)?;
        for slot in 0..dev.capacity {
            let pos = Position { device: device.clone(), slot };
            if guard.occupancy.contains_key(&pos) {
                continue;
            }
            if labware_type == Some(crate::domain::container::DEEP_WELL_LABWARE) && !dev.slot_deep_well_suited(slot) {
                continue;
            }
            return Some(slot);
        }
        None
    }

    // ---- History ----

    /// Appends a history record and forwards it to the backend. The backend
    /// sees the record only after the in-memory append succeeded.
    pub fn record_step(&self, record: HistoryRecord) {
        let mut guard = self.inner.write().expect("RwLock poisoned");
        if record.finish_s < record.start_s {
            log::error!("HistoryRecordInvalidInterval: step {} has finish {} < start {}.", record.step, record.finish_s, record.start_s);
        }
        if let Some(backend) = &guard.backend {
            backend.append(&record);
        }
        guard.history.push(record);
    }

    pub fn history_len(&self) -> usize {
        let guard = self.inner.read().expect("RwLock poisoned");
        guard.history.len()
    }

    pub fn records(&self) -> Vec<HistoryRecord> {
        let guard = self.inner.read().expect("RwLock poisoned");
        guard.history.clone()
    }

    /// Visits all history records without cloning the whole log.
    pub fn for_each_record<F: FnMut(&HistoryRecord)>(&self, mut f: F) {
        let guard = self.inner.read().expect("RwLock poisoned");
        for record in &guard.history {
            f(record);
        }
    }

    // ---- Internal helpers ----

    fn check_position(guard: &StoreInner, pos: &Position) -> Result<()> {
        let device = guard
            .devices
            .get(&pos.device)
            .ok_or_else(|| Error::conflict(StateConflictKind::UnknownDevice, format!("Unknown device '{}'.", pos.device)))?;
        if !device.slot_in_range(pos.slot) {
            return Err(Error::conflict(
                StateConflictKind::SlotOutOfRange,
                format!("Slot {} out of range for device '{}' (capacity {}).", pos.slot, pos.device, device.capacity),
            ));
        }
        Ok(())
    }

    fn live_key(guard: &StoreInner, name: &ContainerName) -> Result<ContainerKey> {
        let key = guard
            .name_index
            .get(name)
            .copied()
            .ok_or_else(|| Error::conflict(StateConflictKind::UnknownContainer, format!("Unknown container '{}'.", name)))?;
        if guard.containers[key].removed {
            return Err(Error::conflict(StateConflictKind::ContainerRemoved, format!("Container '{}' was removed.", name)));
        }
        Ok(key)
    }
}

impl Default for StatusStore {
    fn default() -> Self {
        Self::new()
    }
}
