use actix::prelude::*;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::api::lab_config_dto::LabConfigDto;
use crate::domain::control::protocol::{CommandPayload, Envelope, ProcessStatusDto, ResponsePayload, StepStatusDto};
use crate::domain::control::session::ControlSession;
use crate::domain::executor::executor::{ExecutorHandle, Scope, StatusReport};
use crate::domain::graph::ProcessParser;
use crate::domain::ids::ProcessId;
use crate::error::Error;

/// A command frame received by a session, with the address to answer on.
#[derive(Message)]
#[rtype(result = "()")]
pub struct InboundCommand {
    pub envelope: Envelope,
    pub session: Recipient<Envelope>,
}

/// Bridges control sessions onto the executor core loop: every inbound
/// command becomes a core command, every reply travels back to the session
/// that asked.
pub struct ControlGateway {
    executor: ExecutorHandle,
    parser: Arc<dyn ProcessParser>,
}

impl ControlGateway {
    pub fn new(executor: ExecutorHandle, parser: Arc<dyn ProcessParser>) -> ControlGateway {
        ControlGateway { executor, parser }
    }
}

impl Actor for ControlGateway {
    type Context = Context<Self>;
}

impl Handler<InboundCommand> for ControlGateway {
    type Result = ();

    fn handle(&mut self, msg: InboundCommand, ctx: &mut Self::Context) {
        let executor = self.executor.clone();
        let parser = self.parser.clone();
        let InboundCommand { envelope, session } = msg;
        let request_id = envelope.request_id.clone();

        let fut = async move {
            let response = match envelope.payload {
                crate::domain::control::protocol::WirePayload::Command(cmd) => dispatch(executor, parser, cmd).await,
                crate::domain::control::protocol::WirePayload::Response(_) => {
                    ResponsePayload::Rejected { kind: "Protocol".to_string(), message: "Response frame on command path.".to_string() }
                }
            };
            session.do_send(Envelope::response(request_id, response));
        };
        ctx.spawn(actix::fut::wrap_future(fut));
    }
}

async fn dispatch(executor: ExecutorHandle, parser: Arc<dyn ProcessParser>, cmd: CommandPayload) -> ResponsePayload {
    match cmd {
        CommandPayload::SubmitProcess { source, name, delay_minutes, priority } => {
            let process = ProcessId::new(name);
            let graph = match parser.parse(&process, &source) {
                Ok(graph) => graph,
                Err(e) => return rejected(e),
            };
            match executor.submit_process(graph, priority.unwrap_or(0), delay_minutes.map(|m| m * 60)).await {
                Ok(experiment) => ResponsePayload::Accepted { experiment: Some(experiment.to_string()) },
                Err(e) => rejected(e),
            }
        }
        CommandPayload::Start { processes } => {
            let ids: Vec<ProcessId> = processes.into_iter().map(ProcessId::new).collect();
            answer(executor.start(ids).await)
        }
        CommandPayload::Pause { process } => answer(executor.pause(scope_of(process)).await),
        CommandPayload::Resume { process } => answer(executor.resume(scope_of(process)).await),
        CommandPayload::Cancel { process } => answer(executor.cancel(scope_of(process)).await),
        CommandPayload::EnableSimulation { speed } => answer(executor.enable_simulation(speed).await),
        CommandPayload::DisableSimulation => answer(executor.disable_simulation().await),
        CommandPayload::QueryStatus { process } => match executor.query_status(process.map(ProcessId::new)).await {
            Ok(reports) => ResponsePayload::Status { reports: reports.into_iter().map(report_dto).collect() },
            Err(e) => rejected(e),
        },
        CommandPayload::ConfigureLab { document } => {
            let dto: LabConfigDto = match serde_json::from_str(&document) {
                Ok(dto) => dto,
                Err(e) => return rejected(Error::DeserializationError(e)),
            };
            let devices = match dto.into_devices() {
                Ok(devices) => devices,
                Err(e) => return rejected(e),
            };
            answer(executor.configure_lab(devices).await)
        }
    }
}

fn scope_of(process: Option<String>) -> Scope {
    match process {
        Some(p) => Scope::Process(ProcessId::new(p)),
        None => Scope::Global,
    }
}

fn answer(result: crate::error::Result<()>) -> ResponsePayload {
    match result {
        Ok(()) => ResponsePayload::Accepted { experiment: None },
        Err(e) => rejected(e),
    }
}

fn rejected(e: Error) -> ResponsePayload {
    ResponsePayload::Rejected { kind: error_kind(&e).to_string(), message: e.to_string() }
}

fn error_kind(e: &Error) -> &'static str {
    match e {
        Error::IoError(_) => "IoError",
        Error::DeserializationError(_) => "DeserializationError",
        Error::ConfigError(_) => "ConfigError",
        Error::StateConflict { .. } => "StateConflict",
        Error::Unschedulable { .. } => "Unschedulable",
        Error::StepFailure { .. } => "StepFailure",
        Error::Cancelled(_) => "Cancelled",
        Error::TransportError { .. } => "TransportError",
        Error::GraphError(_) => "GraphError",
        Error::UnknownContainer(_) => "UnknownContainer",
        Error::UnknownProcess(_) => "UnknownProcess",
        Error::Remote { .. } => "Remote",
    }
}

fn report_dto(report: StatusReport) -> ProcessStatusDto {
    let step_etas: std::collections::HashMap<_, _> = report.step_etas.into_iter().collect();
    ProcessStatusDto {
        process: report.process.to_string(),
        experiment: report.experiment.to_string(),
        state: format!("{:?}", report.state),
        last_executed: report.last_executed.map(|s| s.to_string()),
        next_planned: report.next_planned.map(|s| s.to_string()),
        eta_s: report.eta_s,
        error: report.error,
        steps: report
            .steps
            .into_iter()
            .map(|(step, state)| StepStatusDto { eta_s: step_etas.get(&step).copied(), step: step.to_string(), state: format!("{:?}", state) })
            .collect(),
    }
}

/// Accept loop for the control port. One `ControlSession` actor per
/// connection.
pub fn spawn_listener(listen: SocketAddr, gateway: Recipient<InboundCommand>) {
    actix::spawn(async move {
        let listener = match tokio::net::TcpListener::bind(listen).await {
            Ok(listener) => listener,
            Err(e) => {
                log::error!("Control listener could not bind {}: {}", listen, e);
                return;
            }
        };
        log::info!("Control surface listening on {}.", listen);

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let (read_half, write_half) = tokio::io::split(stream);
                    ControlSession::new(gateway.clone(), peer.to_string(), write_half, read_half);
                }
                Err(e) => {
                    log::error!("Control listener accept failed: {}", e);
                }
            }
        }
    });
}
