//! Frame reassembly for device connections
//!
//! TCP may split or coalesce device frames. The decoder accumulates bytes
//! and cuts frames by the device grammar: header, alphanumeric identifier
//! (ending at the first non-alphanumeric byte), then a 5-byte tail.
//!
//! Bytes that cannot start a device frame, or a cut whose tail matches no
//! device layout, are handed out as one opaque frame so the connection
//! handler can log and drop the peer.

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::debug;

use super::codec::Action;
use super::constants::{
    ACK_SUFFIX, ALERT_OPCODE, DEVICE_HEADER, DEVICE_TAIL_LEN, IDENTIFICATION_TAIL,
    MAX_IDENTIFIER_LEN,
};

/// `tokio_util` codec splitting a device byte stream into frames
#[derive(Debug, Default, Clone)]
pub struct FeederFrameCodec {
    /// Identifier bytes already scanned in the pending frame
    scanned: usize,
}

impl FeederFrameCodec {
    pub fn new() -> Self {
        Self::default()
    }

    fn take_opaque(&mut self, src: &mut BytesMut) -> Bytes {
        self.scanned = 0;
        src.split().freeze()
    }
}

/// Whether `tail` opens one of the device frame layouts
fn is_device_tail(tail: &[u8]) -> bool {
    tail == IDENTIFICATION_TAIL
        || tail[0] == ALERT_OPCODE
        || (tail[1..] == ACK_SUFFIX && Action::from_opcode(tail[0]).is_some())
}

impl Decoder for FeederFrameCodec {
    type Item = Bytes;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }

        let header_len = src.len().min(DEVICE_HEADER.len());
        if src[..header_len] != DEVICE_HEADER[..header_len] {
            return Ok(Some(self.take_opaque(src)));
        }
        if src.len() < DEVICE_HEADER.len() {
            return Ok(None);
        }

        // Resume the identifier scan where the previous call stopped
        let body = &src[DEVICE_HEADER.len()..];
        let run = self.scanned
            + body[self.scanned..]
                .iter()
                .take_while(|b| b.is_ascii_alphanumeric())
                .count();

        if run > MAX_IDENTIFIER_LEN {
            return Ok(Some(self.take_opaque(src)));
        }
        if run == body.len() {
            self.scanned = run;
            return Ok(None);
        }
        if run == 0 {
            return Ok(Some(self.take_opaque(src)));
        }

        let frame_len = DEVICE_HEADER.len() + run + DEVICE_TAIL_LEN;
        if src.len() < frame_len {
            self.scanned = run;
            return Ok(None);
        }

        // The identifier ran into a non-alphanumeric byte that is not a tail
        if !is_device_tail(&src[frame_len - DEVICE_TAIL_LEN..frame_len]) {
            return Ok(Some(self.take_opaque(src)));
        }

        self.scanned = 0;
        let frame = src.split_to(frame_len).freeze();

        // Feeders sometimes repeat their identification back to back
        if frame.ends_with(&IDENTIFICATION_TAIL) {
            while src.starts_with(&frame) {
                src.advance(frame.len());
            }
        }

        Ok(Some(frame))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, Self::Error> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        if !src.is_empty() {
            // Only a truncated but well-formed frame can be left here
            debug!(
                "Dropping truncated frame at EOF: {}",
                common::hex::encode_upper(src)
            );
            src.clear();
            self.scanned = 0;
        }
        Ok(None)
    }
}

impl Encoder<Bytes> for FeederFrameCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(&item);
        Ok(())
    }
}
