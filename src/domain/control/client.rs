use futures::{SinkExt, StreamExt};
use std::io;
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use crate::domain::control::codec::ControlCodec;
use crate::domain::control::protocol::{CommandPayload, Envelope, ProcessStatusDto, ResponsePayload, WirePayload};
use crate::error::{Error, Result};

/// Typed proxy onto a remote control surface. Commands sent through this
/// client travel the same codec and session path as any other peer.
pub struct ControlClient {
    framed: Framed<TcpStream, ControlCodec>,
    next_request: u64,
}

impl ControlClient {
    pub async fn connect(addr: SocketAddr) -> Result<ControlClient> {
        let stream = TcpStream::connect(addr).await.map_err(Error::IoError)?;
        Ok(ControlClient { framed: Framed::new(stream, ControlCodec::new()), next_request: 0 })
    }

    async fn call(&mut self, payload: CommandPayload) -> Result<ResponsePayload> {
        self.next_request += 1;
        let request_id = format!("req-{}", self.next_request);

        self.framed.send(Envelope::command(request_id.clone(), payload)).await.map_err(Error::IoError)?;

        while let Some(frame) = self.framed.next().await {
            let envelope = frame.map_err(Error::IoError)?;
            if envelope.request_id != request_id {
                log::warn!("Out-of-order response '{}' while waiting for '{}'; dropped.", envelope.request_id, request_id);
                continue;
            }
            match envelope.payload {
                WirePayload::Response(response) => return Ok(response),
                WirePayload::Command(_) => {
                    log::warn!("Server sent a command frame to a client; dropped.");
                }
            }
        }
        Err(Error::IoError(io::Error::new(io::ErrorKind::UnexpectedEof, "control connection closed mid-request")))
    }

    fn expect_accepted(response: ResponsePayload) -> Result<Option<String>> {
        match response {
            ResponsePayload::Accepted { experiment } => Ok(experiment),
            ResponsePayload::Rejected { kind, message } => Err(Error::Remote { kind, message }),
            ResponsePayload::Status { .. } => Err(Error::Remote { kind: "Protocol".to_string(), message: "Unexpected status answer.".to_string() }),
        }
    }

    /// Submits a process description.
    ///
    /// # Returns
    /// The experiment id of the (possibly pre-existing) submission.
    pub async fn submit_process(&mut self, name: &str, source: &str, delay_minutes: Option<i64>, priority: Option<i32>) -> Result<String> {
        let response = self
            .call(CommandPayload::SubmitProcess {
                source: source.to_string(),
                name: name.to_string(),
                delay_minutes,
                priority,
            })
            .await?;
        Ok(Self::expect_accepted(response)?.unwrap_or_default())
    }

    pub async fn start(&mut self, processes: Vec<String>) -> Result<()> {
        let response = self.call(CommandPayload::Start { processes }).await?;
        Self::expect_accepted(response).map(|_| ())
    }

    pub async fn pause(&mut self, process: Option<String>) -> Result<()> {
        let response = self.call(CommandPayload::Pause { process }).await?;
        Self::expect_accepted(response).map(|_| ())
    }

    pub async fn resume(&mut self, process: Option<String>) -> Result<()> {
        let response = self.call(CommandPayload::Resume { process }).await?;
        Self::expect_accepted(response).map(|_| ())
    }

    pub async fn cancel(&mut self, process: Option<String>) -> Result<()> {
        let response = self.call(CommandPayload::Cancel { process }).await?;
        Self::expect_accepted(response).map(|_| ())
    }

    pub async fn enable_simulation(&mut self, speed: f64) -> Result<()> {
        let response = self.call(CommandPayload::EnableSimulation { speed }).await?;
        Self::expect_accepted(response).map(|_| ())
    }

    pub async fn disable_simulation(&mut self) -> Result<()> {
        let response = self.call(CommandPayload::DisableSimulation).await?;
        Self::expect_accepted(response).map(|_| ())
    }

    pub async fn query_status(&mut self, process: Option<String>) -> Result<Vec<ProcessStatusDto>> {
        let response = self.call(CommandPayload::QueryStatus { process }).await?;
        match response {
            ResponsePayload::Status { reports } => Ok(reports),
            ResponsePayload::Rejected { kind, message } => Err(Error::Remote { kind, message }),
            ResponsePayload::Accepted { .. } => {
                Err(Error::Remote { kind: "Protocol".to_string(), message: "Expected a status answer.".to_string() })
            }
        }
    }

    pub async fn configure_lab(&mut self, document: &str) -> Result<()> {
        let response = self.call(CommandPayload::ConfigureLab { document: document.to_string() }).await?;
        Self::expect_accepted(response).map(|_| ())
    }
}
