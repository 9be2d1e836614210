//! Length-prefixed framing of [`Envelope`]s.
//!
//! Wire layout of one frame:
//!
//! ```text
//! [4 bytes: body length N, big-endian, 0 < N <= 64 MiB]
//! [N bytes: protobuf-encoded envelope body]
//! ```
//!
//! Decoding is resumable: [`decode`] only consumes bytes once a whole frame is
//! buffered, so a connection's read buffer is the only state carried between
//! reads.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use prost::Message;
use tracing::trace;

use crate::error::{MuError, Result};
use crate::mu_protobuf::MuMessage;
use crate::protocol::Envelope;

/// Size of the length prefix
pub const HEADER_LEN: usize = 4;

/// Largest accepted envelope body (64 MiB)
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Mu frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FrameHeader {
    pub size: u32,
}

impl FrameHeader {
    pub fn new(size: u32) -> Self {
        Self { size }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.size); // Big endian
    }

    /// Read and validate a header without consuming it.
    /// Returns `None` while fewer than [`HEADER_LEN`] bytes are buffered.
    pub fn peek(buf: &[u8]) -> Result<Option<Self>> {
        if buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let size = i32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if size <= 0 || size as usize > MAX_FRAME_SIZE {
            return Err(MuError::Framing(format!("Invalid message length: {}", size)));
        }

        Ok(Some(FrameHeader { size: size as u32 }))
    }
}

/// Encode one envelope into a complete frame (header + body)
pub fn encode(envelope: &Envelope) -> Result<Bytes> {
    let message = MuMessage::from(envelope.clone());
    let body_len = message.encoded_len();
    if body_len > MAX_FRAME_SIZE {
        return Err(MuError::Framing(format!("Message too large: {} bytes", body_len)));
    }

    let mut buf = BytesMut::with_capacity(HEADER_LEN + body_len);
    FrameHeader::new(body_len as u32).encode(&mut buf);
    message.encode(&mut buf)?;

    Ok(buf.freeze())
}

/// Try to take one complete envelope from the front of `buffer`.
///
/// * `Ok(Some(envelope))` - a frame was consumed.
/// * `Ok(None)` - need more data; nothing was consumed.
/// * `Err(_)` - framing violation or undecodable body; the connection must be closed.
pub fn decode(buffer: &mut BytesMut) -> Result<Option<Envelope>> {
    let header = match FrameHeader::peek(buffer)? {
        Some(header) => header,
        None => return Ok(None),
    };

    let frame_len = HEADER_LEN + header.size as usize;
    if buffer.len() < frame_len {
        // Don't have the complete frame yet
        buffer.reserve(frame_len - buffer.len());
        return Ok(None);
    }

    buffer.advance(HEADER_LEN);
    let body = buffer.split_to(header.size as usize).freeze();
    trace!("Decoding frame body of {} bytes", body.len());

    let message = MuMessage::decode(body)?;
    Envelope::try_from(message).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Address;

    fn sample_envelopes() -> Vec<Envelope> {
        vec![
            Envelope::tell("worker/runJob", Some(Bytes::from_static(br#"{"jobId":1}"#))),
            Envelope::tell("worker/noop", None),
            Envelope::ask("b3f1", "server/reportStatus", Some(Bytes::from_static(b"[1,2,3]"))),
            Envelope::response("b3f1", Some(Bytes::from_static(br#""ok""#))),
            Envelope::heartbeat(Address::new("10.0.0.12", 27777)),
            Envelope::Heartbeat { sender_address: None },
            Envelope::error(Some("b3f1".to_string()), "No handler found for path: x"),
        ]
    }

    #[test]
    fn test_frame_header_encoding() {
        let mut buf = BytesMut::new();
        FrameHeader::new(1024).encode(&mut buf);

        assert_eq!(&buf[..], &1024u32.to_be_bytes()[..]);
        assert_eq!(FrameHeader::peek(&buf).unwrap(), Some(FrameHeader::new(1024)));
        // peek never consumes
        assert_eq!(buf.len(), HEADER_LEN);
    }

    #[test]
    fn test_roundtrip_every_kind() {
        for envelope in sample_envelopes() {
            let mut buf = BytesMut::from(&encode(&envelope).unwrap()[..]);
            let decoded = decode(&mut buf).unwrap();

            assert_eq!(decoded, Some(envelope));
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn test_length_prefix_matches_body() {
        let frame = encode(&Envelope::tell("a/b", None)).unwrap();
        let size = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;

        assert!(size > 0);
        assert_eq!(frame.len(), HEADER_LEN + size);
    }

    #[test]
    fn test_partial_frames_at_every_split_point() {
        let envelope = Envelope::ask("req-1", "server/fetchJob", Some(Bytes::from(vec![b'x'; 300])));
        let frame = encode(&envelope).unwrap();

        for split in 0..=frame.len() {
            let mut buf = BytesMut::new();
            let mut decoded = Vec::new();

            buf.extend_from_slice(&frame[..split]);
            while let Some(e) = decode(&mut buf).unwrap() {
                decoded.push(e);
            }
            if split < frame.len() {
                assert!(decoded.is_empty(), "spurious output at split {}", split);
                assert_eq!(buf.len(), split, "bytes consumed before frame complete at split {}", split);
            }

            buf.extend_from_slice(&frame[split..]);
            while let Some(e) = decode(&mut buf).unwrap() {
                decoded.push(e);
            }

            assert_eq!(decoded, vec![envelope.clone()], "split at {}", split);
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn test_byte_by_byte_feeding_of_several_frames() {
        let envelopes = sample_envelopes();
        let mut stream = Vec::new();
        for envelope in &envelopes {
            stream.extend_from_slice(&encode(envelope).unwrap());
        }

        let mut buf = BytesMut::new();
        let mut decoded = Vec::new();
        for byte in stream {
            buf.put_u8(byte);
            while let Some(e) = decode(&mut buf).unwrap() {
                decoded.push(e);
            }
        }

        assert_eq!(decoded, envelopes);
    }

    #[test]
    fn test_invalid_length_prefixes_are_rejected() {
        let too_large = (MAX_FRAME_SIZE as i32) + 1;
        for length in [0i32, -1, i32::MIN, too_large, i32::MAX] {
            let mut buf = BytesMut::new();
            buf.put_i32(length);
            buf.extend_from_slice(b"junk");

            let result = decode(&mut buf);
            assert!(
                matches!(result, Err(MuError::Framing(_))),
                "length {} should be a framing violation",
                length
            );
        }
    }

    #[test]
    fn test_max_size_prefix_waits_for_data() {
        let mut buf = BytesMut::new();
        buf.put_i32(MAX_FRAME_SIZE as i32);

        assert!(decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), HEADER_LEN);
    }

    #[test]
    fn test_garbage_body_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(3);
        buf.extend_from_slice(&[0xff, 0xff, 0xff]);

        assert!(matches!(decode(&mut buf), Err(MuError::Protocol(_))));
    }

    #[test]
    fn test_oversized_envelope_is_not_encoded() {
        let payload = Bytes::from(vec![0u8; MAX_FRAME_SIZE + 1]);
        let result = encode(&Envelope::tell("big/payload", Some(payload)));

        assert!(matches!(result, Err(MuError::Framing(ref m)) if m.contains("too large")));
    }
}
