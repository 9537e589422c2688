pub mod lab_config_dto;

pub use lab_config_dto::{DeviceEntryDto, DevicesDto, LabConfigDto};
