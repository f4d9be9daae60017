//! Byte-level abstraction over the network configuration.
//!
//! The engine itself only produces [AddressedMessage]s; wiring them onto an
//! actual transport is the integrator's job. [BytesBus] is the seam for
//! that, and [BincodeEncodingLayer] turns typed messages into
//! length-prefixed byte frames.

use crate::messages::{AddressedMessage, Message};
use crate::types::Address;
use core::fmt::Debug;
use thiserror::Error;

/// Transport seam: hand a finished byte frame to a peer.
pub trait BytesBus: Debug {
    fn send_to_participant(&self, recipient: Address, frame: &[u8]);
}

/// Typed sending seam, for integrators that keep decoding on their side.
pub trait MessageBus: Debug {
    fn send_to_participant(&self, recipient: Address, msg: &Message);
}

#[derive(Error, Debug)]
pub enum WireError {
    #[error("message could not be encoded: {0}")]
    Encode(String),
    #[error("frame could not be decoded: {0}")]
    Decode(String),
    #[error("frame is shorter than its length prefix")]
    Truncated,
}

/// Frames are a u32 big-endian length followed by the bincode encoding of
/// the [Message].
pub fn encode(msg: &Message) -> Result<Vec<u8>, WireError> {
    let body = bincode::serialize(msg).map_err(|e| WireError::Encode(e.to_string()))?;
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

pub fn decode(frame: &[u8]) -> Result<Message, WireError> {
    if frame.len() < 4 {
        return Err(WireError::Truncated);
    }
    let len = u32::from_be_bytes(frame[..4].try_into().expect("checked length")) as usize;
    let body = frame.get(4..4 + len).ok_or(WireError::Truncated)?;
    bincode::deserialize(body).map_err(|e| WireError::Decode(e.to_string()))
}

/// Encoding layer sitting between the engine's typed outbox and a byte
/// transport.
#[derive(Debug)]
pub struct BincodeEncodingLayer<B: BytesBus> {
    pub bus: B,
}

impl<B: BytesBus> BincodeEncodingLayer<B> {
    pub fn new(bus: B) -> Self {
        BincodeEncodingLayer { bus }
    }

    /// Encode and send every message in an outbox batch.
    pub fn send_all(&self, outbox: &[AddressedMessage]) -> Result<(), WireError> {
        for addressed in outbox {
            self.bus
                .send_to_participant(addressed.to, &encode(&addressed.message)?);
        }
        Ok(())
    }
}

impl<B: BytesBus> MessageBus for BincodeEncodingLayer<B> {
    fn send_to_participant(&self, recipient: Address, msg: &Message) {
        // A message that cannot be encoded is a bug in the engine, not a
        // transport condition the peer could cause.
        let frame = encode(msg).expect("engine-built messages always encode");
        self.bus.send_to_participant(recipient, &frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_roundtrip() {
        let msg = Message::new(1);
        let frame = encode(&msg).unwrap();
        assert_eq!(decode(&frame).unwrap(), msg);
    }

    #[test]
    fn truncated_frame_is_rejected() {
        let msg = Message::new(1);
        let frame = encode(&msg).unwrap();
        assert!(matches!(
            decode(&frame[..frame.len() - 1]),
            Err(WireError::Truncated)
        ));
        assert!(matches!(decode(&[0, 0]), Err(WireError::Truncated)));
    }
}
