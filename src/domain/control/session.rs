use actix::prelude::*;
use std::io;
use tokio::net::TcpStream;
use tokio_util::codec::FramedRead;

use crate::domain::control::codec::ControlCodec;
use crate::domain::control::protocol::{Envelope, WirePayload};
use crate::domain::control::server::InboundCommand;

/// One control connection. Acts as a proxy: envelopes sent to this actor
/// are written to TCP, commands read from TCP are forwarded to the gateway.
pub struct ControlSession {
    gateway: Recipient<InboundCommand>,
    /// GENERICS ORDER IS CRITICAL: <Item, IO, Codec>
    framed_write: actix::io::FramedWrite<Envelope, tokio::io::WriteHalf<TcpStream>, ControlCodec>,
    peer: String,
}

impl ControlSession {
    pub fn new(
        gateway: Recipient<InboundCommand>,
        peer: String,
        write_half: tokio::io::WriteHalf<TcpStream>,
        read_half: tokio::io::ReadHalf<TcpStream>,
    ) -> Addr<Self> {
        Self::create(|ctx| {
            ctx.add_stream(FramedRead::new(read_half, ControlCodec::new()));
            Self { gateway, framed_write: actix::io::FramedWrite::new(write_half, ControlCodec::new(), ctx), peer }
        })
    }
}

impl Actor for ControlSession {
    type Context = Context<Self>;

    fn started(&mut self, _ctx: &mut Self::Context) {
        log::info!("Control session with {} established.", self.peer);
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        log::info!("Control session with {} closed.", self.peer);
    }
}

impl Handler<Envelope> for ControlSession {
    type Result = ();

    fn handle(&mut self, msg: Envelope, _ctx: &mut Self::Context) {
        self.framed_write.write(msg);
    }
}

impl StreamHandler<Result<Envelope, io::Error>> for ControlSession {
    fn handle(&mut self, msg: Result<Envelope, io::Error>, ctx: &mut Self::Context) {
        match msg {
            Ok(envelope) => match &envelope.payload {
                WirePayload::Command(_) => {
                    self.gateway.do_send(InboundCommand { envelope, session: ctx.address().recipient() });
                }
                WirePayload::Response(_) => {
                    log::warn!("Peer {} sent a response frame on the command channel; dropped.", self.peer);
                }
            },
            Err(e) => {
                log::error!("Codec error on control session with {}: {}", self.peer, e);
                ctx.stop();
            }
        }
    }
}

impl actix::io::WriteHandler<io::Error> for ControlSession {}
