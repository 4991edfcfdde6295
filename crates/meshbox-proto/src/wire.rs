//! Length-prefixed CBOR framing for any serializable message.
//!
//! A frame is a 4-byte big-endian length prefix followed by that many bytes of CBOR body.
//! This is the only framing format used across this workspace; keeping it in one place
//! means controller and worker never need to agree on anything beyond "call `Packet`".

use serde::{de::DeserializeOwned, Serialize};

/// Errors that can occur while framing or unframing a message.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// The body failed to serialize to CBOR.
    #[error("cbor encode failed: {0}")]
    Encode(#[from] ciborium::ser::Error<std::io::Error>),
    /// The body failed to deserialize from CBOR.
    #[error("cbor decode failed: {0}")]
    Decode(#[from] ciborium::de::Error<std::io::Error>),
    /// The buffer was shorter than the declared frame length.
    #[error("truncated frame: declared {declared} bytes, have {available}")]
    Truncated {
        /// Length declared by the 4-byte prefix.
        declared: usize,
        /// Bytes actually available in the buffer.
        available: usize,
    },
}

/// A single length-prefixed frame.
pub struct Packet;

impl Packet {
    /// Encodes `msg` as a 4-byte big-endian length prefix followed by its CBOR body.
    pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, WireError> {
        let mut body = Vec::new();
        ciborium::into_writer(msg, &mut body)?;
        let mut framed = Vec::with_capacity(4 + body.len());
        #[allow(clippy::cast_possible_truncation)]
        framed.extend_from_slice(&(body.len() as u32).to_be_bytes());
        framed.extend_from_slice(&body);
        Ok(framed)
    }

    /// Decodes one frame from the front of `buf`, returning the message and the number
    /// of bytes consumed. `buf` must contain at least one complete frame.
    pub fn decode<T: DeserializeOwned>(buf: &[u8]) -> Result<(T, usize), WireError> {
        if buf.len() < 4 {
            return Err(WireError::Truncated {
                declared: 4,
                available: buf.len(),
            });
        }
        #[allow(clippy::unwrap_used)]
        let len_bytes: [u8; 4] = buf[..4].try_into().unwrap();
        let len = u32::from_be_bytes(len_bytes) as usize;
        if buf.len() < 4 + len {
            return Err(WireError::Truncated {
                declared: 4 + len,
                available: buf.len(),
            });
        }
        let msg = ciborium::from_reader(&buf[4..4 + len])?;
        Ok((msg, 4 + len))
    }
}

#[cfg(test)]
mod tests {
    use super::Packet;
    use crate::Decision;

    // ── 1. round-trips a simple enum payload ──
    #[test]
    fn round_trips_decision() {
        let framed = Packet::encode(&Decision::Dedup).expect("encode");
        let (decoded, consumed): (Decision, usize) = Packet::decode(&framed).expect("decode");
        assert_eq!(decoded, Decision::Dedup);
        assert_eq!(consumed, framed.len());
    }

    // ── 2. detects truncated frames ──
    #[test]
    fn detects_truncation() {
        let framed = Packet::encode(&Decision::Warm).expect("encode");
        let truncated = &framed[..framed.len() - 1];
        assert!(Packet::decode::<Decision>(truncated).is_err());
    }

    // ── 3. consumes only its own frame out of a longer buffer ──
    #[test]
    fn consumes_exactly_one_frame() {
        let mut buf = Packet::encode(&Decision::Base).expect("encode");
        let second = Packet::encode(&Decision::Purge).expect("encode");
        buf.extend_from_slice(&second);
        let (first, consumed): (Decision, usize) = Packet::decode(&buf).expect("decode");
        assert_eq!(first, Decision::Base);
        let (next, _) = Packet::decode::<Decision>(&buf[consumed..]).expect("decode");
        assert_eq!(next, Decision::Purge);
    }
}
