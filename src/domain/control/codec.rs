use bytes::{Bytes, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::domain::control::protocol::Envelope;

/// Upper bound on one control frame. Commands are tiny except for
/// `SubmitProcess` sources and `ConfigureLab` documents; anything past this
/// cap is a corrupt length prefix or a runaway peer, not a lab document.
pub const MAX_CONTROL_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// Frames `Envelope`s for the control surface: length-delimited on the
/// wire, bincode inside, with the frame cap enforced in both directions.
pub struct ControlCodec {
    framing: LengthDelimitedCodec,
}

impl ControlCodec {
    pub fn new() -> Self {
        let framing = LengthDelimitedCodec::builder().max_frame_length(MAX_CONTROL_FRAME_BYTES).new_codec();
        Self { framing }
    }
}

impl Default for ControlCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder<Envelope> for ControlCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let bytes = bincode::serialize(&item).map_err(|e| {
            io::Error::new(io::ErrorKind::InvalidData, format!("control frame for request '{}' failed to serialize: {}", item.request_id, e))
        })?;

        // Reject before framing so the sender gets a message naming the
        // request instead of a bare length error from the framing layer.
        if bytes.len() > MAX_CONTROL_FRAME_BYTES {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "control frame for request '{}' is {} bytes, above the {} byte cap; trim the process source or lab document",
                    item.request_id,
                    bytes.len(),
                    MAX_CONTROL_FRAME_BYTES
                ),
            ));
        }

        self.framing.encode(Bytes::from(bytes), dst)
    }
}

impl Decoder for ControlCodec {
    type Item = Envelope;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(frame) = self.framing.decode(src)? else { return Ok(None) };

        let envelope = bincode::deserialize(&frame).map_err(|e| {
            io::Error::new(io::ErrorKind::InvalidData, format!("undecodable {} byte control frame: {}", frame.len(), e))
        })?;
        Ok(Some(envelope))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::control::protocol::{CommandPayload, WirePayload};

    #[test]
    fn envelope_round_trips_through_the_codec() {
        let mut codec = ControlCodec::new();
        let envelope = Envelope::command("req-1", CommandPayload::Start { processes: vec!["growth-assay".to_string()] });

        let mut buf = BytesMut::new();
        codec.encode(envelope, &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().expect("one full frame");

        assert_eq!(decoded.request_id, "req-1");
        match decoded.payload {
            WirePayload::Command(CommandPayload::Start { processes }) => assert_eq!(processes, vec!["growth-assay".to_string()]),
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn oversized_frames_are_rejected_with_the_request_id() {
        let mut codec = ControlCodec::new();
        let huge_source = "x".repeat(MAX_CONTROL_FRAME_BYTES);
        let envelope = Envelope::command(
            "req-big",
            CommandPayload::SubmitProcess { source: huge_source, name: "big".to_string(), delay_minutes: None, priority: None },
        );

        let mut buf = BytesMut::new();
        let err = codec.encode(envelope, &mut buf).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
        assert!(err.to_string().contains("req-big"), "error should name the request: {}", err);
        assert!(buf.is_empty(), "nothing may reach the wire");
    }

    #[test]
    fn garbage_frames_surface_a_decode_error() {
        let mut codec = ControlCodec::new();

        // A well-framed payload that is not bincode for an Envelope.
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&4u32.to_be_bytes());
        buf.extend_from_slice(&[0xff, 0xff, 0xff, 0xff]);

        let err = codec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[test]
    fn partial_frames_wait_for_more_bytes() {
        let mut codec = ControlCodec::new();
        let envelope = Envelope::command("req-2", CommandPayload::DisableSimulation);

        let mut full = BytesMut::new();
        codec.encode(envelope, &mut full).unwrap();

        // Feed everything but the last byte: not decodable yet, no error.
        let mut partial = BytesMut::from(&full[..full.len() - 1]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
    }
}
