use actix::prelude::*;
use serde::{Deserialize, Serialize};

/// Commands the control surface accepts.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum CommandPayload {
    /// Hand a process description to the external parser and register the
    /// resulting graph. Idempotent by `name`.
    SubmitProcess { source: String, name: String, delay_minutes: Option<i64>, priority: Option<i32> },
    Start { processes: Vec<String> },
    /// `process = None` pauses globally.
    Pause { process: Option<String> },
    Resume { process: Option<String> },
    Cancel { process: Option<String> },
    EnableSimulation { speed: f64 },
    DisableSimulation,
    QueryStatus { process: Option<String> },
    /// Replaces the device catalogue from a lab configuration document.
    ConfigureLab { document: String },
}

/// Per-step line of a status answer.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StepStatusDto {
    pub step: String,
    pub state: String,
    /// Planned finish, seconds since epoch, for steps still in the plan.
    pub eta_s: Option<i64>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ProcessStatusDto {
    pub process: String,
    pub experiment: String,
    pub state: String,
    pub last_executed: Option<String>,
    pub next_planned: Option<String>,
    pub eta_s: Option<i64>,
    pub error: Option<String>,
    pub steps: Vec<StepStatusDto>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum ResponsePayload {
    Accepted { experiment: Option<String> },
    Status { reports: Vec<ProcessStatusDto> },
    Rejected { kind: String, message: String },
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum WirePayload {
    Command(CommandPayload),
    Response(ResponsePayload),
}

/// The framing every control message travels in. `request_id` ties a
/// response to its command.
#[derive(Serialize, Deserialize, Debug, Clone, Message)]
#[rtype(result = "()")]
pub struct Envelope {
    pub request_id: String,
    pub payload: WirePayload,
}

impl Envelope {
    pub fn command(request_id: impl Into<String>, payload: CommandPayload) -> Envelope {
        Envelope { request_id: request_id.into(), payload: WirePayload::Command(payload) }
    }

    pub fn response(request_id: impl Into<String>, payload: ResponsePayload) -> Envelope {
        Envelope { request_id: request_id.into(), payload: WirePayload::Response(payload) }
    }
}
