use crate::domain::device::Device;
use crate::error::Result;
use crate::loader::parser::load_lab_document;

pub mod api;
pub mod domain;
pub mod error;
pub mod loader;
pub mod logger;

/// Loads a lab configuration document and builds the device catalogue.
pub fn load_lab(file_path: &str) -> Result<Vec<Device>> {
    logger::init();
    log::info!("Logger initialized. Loading lab configuration.");

    let (dto, devices) = load_lab_document(file_path)?;
    log::info!("Lab '{}' configured with {} devices.", dto.description, devices.len());

    Ok(devices)
}
