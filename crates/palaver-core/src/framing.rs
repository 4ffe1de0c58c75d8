//! Length-prefixed record codec.
//!
//! Every record on the wire is a 4-byte big-endian length header followed by
//! exactly that many payload bytes:
//!
//! ```text
//! +----------------------------+------------------+
//! | Length (4 bytes, BE)       | Payload          |
//! +----------------------------+------------------+
//! ```
//!
//! A zero-length record is a keepalive NOOP; the decoder yields it as an
//! empty payload and the connection layer treats it as activity.
//!
//! # Security Considerations
//!
//! The declared length is validated against the configured maximum BEFORE
//! any allocation, so a hostile length prefix cannot trigger memory
//! exhaustion. Oversize records are fatal for the connection.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{DEFAULT_MAX_RECORD_SIZE, MAX_RECORD_SIZE, ProtocolError, ProtocolResult};

/// Length of the record header.
const HEADER_LEN: usize = 4;

/// Codec for length-prefixed records, usable with
/// [`tokio_util::codec::Framed`].
///
/// The decoder consumes from the caller's append-only receive buffer and
/// yields complete payloads, leaving any partial tail in the buffer for the
/// next call. It holds no state of its own beyond the size limit.
#[derive(Debug, Clone)]
pub struct RecordCodec {
    max_record_size: usize,
}

impl Default for RecordCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RECORD_SIZE)
    }
}

impl RecordCodec {
    /// Creates a codec with the given maximum payload size.
    ///
    /// Values above the protocol hard cap are clamped to
    /// [`MAX_RECORD_SIZE`].
    #[must_use]
    pub fn new(max_record_size: usize) -> Self {
        Self {
            max_record_size: max_record_size.min(MAX_RECORD_SIZE),
        }
    }

    /// Returns the configured maximum payload size.
    #[must_use]
    pub const fn max_record_size(&self) -> usize {
        self.max_record_size
    }
}

impl Decoder for RecordCodec {
    type Item = Bytes;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> ProtocolResult<Option<Bytes>> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let declared = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;

        // Validate before reserving or allocating anything.
        if declared > self.max_record_size {
            return Err(ProtocolError::RecordTooLarge {
                size: declared,
                max: self.max_record_size,
            });
        }

        let total = HEADER_LEN + declared;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        Ok(Some(src.split_to(declared).freeze()))
    }
}

impl<T: AsRef<[u8]>> Encoder<T> for RecordCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> ProtocolResult<()> {
        let payload = item.as_ref();
        if payload.len() > self.max_record_size {
            return Err(ProtocolError::RecordTooLarge {
                size: payload.len(),
                max: self.max_record_size,
            });
        }

        dst.reserve(HEADER_LEN + payload.len());
        #[allow(clippy::cast_possible_truncation)] // bounded by max_record_size
        dst.put_u32(payload.len() as u32);
        dst.extend_from_slice(payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_preserves_payload() {
        let mut codec = RecordCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(b"chat payload", &mut buf).unwrap();

        assert_eq!(&buf[..HEADER_LEN], &[0, 0, 0, 12]);
        let out = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&out[..], b"chat payload");
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_header_waits_for_more() {
        let mut codec = RecordCodec::default();
        let mut buf = BytesMut::from(&[0u8, 0][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn partial_payload_leaves_buffer_untouched() {
        let mut codec = RecordCodec::default();
        let mut buf = BytesMut::from(&[0u8, 0, 0, 8, 1, 2, 3][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 7);
    }

    #[test]
    fn zero_length_record_is_keepalive() {
        let mut codec = RecordCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(&[][..], &mut buf).unwrap();

        let out = codec.decode(&mut buf).unwrap().unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn declared_oversize_rejected_before_payload_arrives() {
        let mut codec = RecordCodec::new(1024 * 1024);
        let mut buf = BytesMut::new();
        buf.put_u32(1024 * 1024 + 1);
        buf.extend_from_slice(&[0u8; 16]);

        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::RecordTooLarge { size, max }
                if size == 1024 * 1024 + 1 && max == 1024 * 1024
        ));
    }

    #[test]
    fn record_at_exact_limit_is_accepted() {
        let mut codec = RecordCodec::new(4096);
        let payload = vec![0x5Au8; 4096];
        let mut buf = BytesMut::new();
        codec.encode(&payload, &mut buf).unwrap();

        let out = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(out.len(), 4096);
    }

    #[test]
    fn encode_rejects_oversize_payload() {
        let mut codec = RecordCodec::new(64);
        let mut buf = BytesMut::new();
        let err = codec.encode(&vec![0u8; 65], &mut buf).unwrap_err();
        assert!(matches!(err, ProtocolError::RecordTooLarge { size: 65, max: 64 }));
    }

    #[test]
    fn back_to_back_records_decode_in_order() {
        let mut codec = RecordCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(b"first", &mut buf).unwrap();
        codec.encode(b"second", &mut buf).unwrap();

        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], b"first");
        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], b"second");
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn limit_clamps_to_hard_cap() {
        let codec = RecordCodec::new(usize::MAX);
        assert_eq!(codec.max_record_size(), MAX_RECORD_SIZE);
    }
}
