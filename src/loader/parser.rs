use serde::de::DeserializeOwned;
use std::fs;

use crate::api::lab_config_dto::LabConfigDto;
use crate::domain::device::Device;
use crate::error::{Error, Result};

/// Parses a JSON file into a given type `T`.
///
/// Errors are automatically converted into `crate::error::Error` variants:
/// - `Error::IoError` if the file cannot be read.
/// - `Error::DeserializationError` if the JSON is malformed.
pub fn parse_json_file<T: DeserializeOwned>(file_path: &str) -> Result<T> {
    let data = fs::read_to_string(file_path).map_err(Error::IoError)?;

    let parsed_data: T = serde_json::from_str(&data).map_err(Error::DeserializationError)?;

    Ok(parsed_data)
}

/// Loads and validates a lab configuration document.
pub fn load_lab_document(file_path: &str) -> Result<(LabConfigDto, Vec<Device>)> {
    let dto: LabConfigDto = parse_json_file(file_path)?;
    let devices = dto.clone().into_devices()?;
    log::info!("Lab document '{}' loaded: {} devices.", file_path, devices.len());
    Ok((dto, devices))
}
