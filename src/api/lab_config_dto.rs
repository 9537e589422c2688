use serde::Deserialize;
use std::collections::HashMap;

use crate::domain::device::{Device, DeviceId, DeviceKind};
use crate::error::{Error, Result};

/// The lab configuration document. Devices are grouped into one section per
/// recognized kind; an unknown section is a configuration error (enforced by
/// `deny_unknown_fields`).
#[derive(Debug, Clone, Deserialize)]
pub struct LabConfigDto {
    #[serde(default)]
    pub description: String,
    pub devices: DevicesDto,
    /// Resource class names per kind, consumed by the external parser. Only
    /// validated here.
    #[serde(default)]
    pub translation: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DevicesDto {
    #[serde(default)]
    pub incubators: HashMap<String, DeviceEntryDto>,
    #[serde(default)]
    pub plate_readers: HashMap<String, DeviceEntryDto>,
    #[serde(default)]
    pub liquid_handlers: HashMap<String, DeviceEntryDto>,
    #[serde(default)]
    pub movers: HashMap<String, DeviceEntryDto>,
    #[serde(default)]
    pub centrifuges: HashMap<String, DeviceEntryDto>,
    #[serde(default)]
    pub storage: HashMap<String, DeviceEntryDto>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceEntryDto {
    pub capacity: u32,
    /// Max concurrent operations; defaults to `capacity`.
    pub process_capacity: Option<u32>,
    #[serde(default = "default_min_capacity")]
    pub min_capacity: u32,
    #[serde(default)]
    pub allows_overlap: bool,
    #[serde(default)]
    pub deep_well_slots: Vec<u32>,
    /// Everything else is a custom parameter passed through to adapters.
    #[serde(flatten)]
    pub params: HashMap<String, serde_json::Value>,
}

fn default_min_capacity() -> u32 {
    1
}

impl LabConfigDto {
    /// Validates the document and builds the device catalogue.
    pub fn into_devices(self) -> Result<Vec<Device>> {
        for kind in self.translation.keys() {
            let known = DeviceKind::all().iter().any(|k| k.config_section() == kind.as_str());
            if !known {
                return Err(Error::ConfigError(format!("Translation entry for unknown device kind '{}'.", kind)));
            }
        }

        let mut devices: Vec<Device> = Vec::new();
        let sections: [(DeviceKind, &HashMap<String, DeviceEntryDto>); 6] = [
            (DeviceKind::Incubator, &self.devices.incubators),
            (DeviceKind::PlateReader, &self.devices.plate_readers),
            (DeviceKind::LiquidHandler, &self.devices.liquid_handlers),
            (DeviceKind::Mover, &self.devices.movers),
            (DeviceKind::Centrifuge, &self.devices.centrifuges),
            (DeviceKind::Storage, &self.devices.storage),
        ];

        for (kind, entries) in sections {
            for (name, entry) in entries {
                if devices.iter().any(|d| d.id.as_str() == name) {
                    return Err(Error::ConfigError(format!("Duplicate device name '{}' across kinds.", name)));
                }
                if entry.min_capacity > entry.capacity.max(1) {
                    return Err(Error::ConfigError(format!(
                        "Device '{}': min_capacity {} exceeds capacity {}.",
                        name, entry.min_capacity, entry.capacity
                    )));
                }
                if let Some(bad) = entry.deep_well_slots.iter().find(|s| **s >= entry.capacity) {
                    return Err(Error::ConfigError(format!("Device '{}': deep_well slot {} out of range.", name, bad)));
                }

                devices.push(Device {
                    id: DeviceId::new(name.clone()),
                    kind,
                    capacity: entry.capacity,
                    process_capacity: entry.process_capacity.unwrap_or(entry.capacity),
                    min_capacity: entry.min_capacity,
                    allows_overlap: entry.allows_overlap,
                    deep_well_slots: entry.deep_well_slots.clone(),
                    params: entry.params.clone(),
                });
            }
        }

        devices.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(devices)
    }
}
