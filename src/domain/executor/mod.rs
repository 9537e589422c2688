pub mod adapter;
pub mod executor;
pub mod simulation;

pub use adapter::{AdapterHandle, AdapterStatus, CancelHandle, DeviceAdapter, Observation, StepDispatch};
pub use executor::{CoreCommand, Executor, ExecutorConfig, ExecutorHandle, Scope, StatusReport};
pub use simulation::{SimulatedAdapter, StubbornSimulatedAdapter};
