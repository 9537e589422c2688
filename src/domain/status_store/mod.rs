pub mod history;
pub mod persistence;
pub mod store;

pub use history::{HistoryRecord, MovementInfo, StepStatus};
pub use persistence::{CsvHistoryBackend, HistoryBackend};
pub use store::{Occupant, StatusStore};
