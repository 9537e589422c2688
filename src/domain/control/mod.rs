pub mod client;
pub mod codec;
pub mod protocol;
pub mod server;
pub mod session;

pub use client::ControlClient;
pub use codec::{ControlCodec, MAX_CONTROL_FRAME_BYTES};
pub use protocol::{CommandPayload, Envelope, ProcessStatusDto, ResponsePayload, WirePayload};
pub use server::{ControlGateway, InboundCommand, spawn_listener};
pub use session::ControlSession;
