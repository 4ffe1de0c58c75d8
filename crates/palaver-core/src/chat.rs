//! Chat sub-frames: the plaintext carried inside a cipher record.
//!
//! Layout:
//!
//! ```text
//! +---------+--------------------+----------------+------------------+------+
//! | subtype | timestamp (8B BE)  | message id 16B | body len (2B BE) | body |
//! +---------+--------------------+----------------+------------------+------+
//! ```
//!
//! The timestamp is client-supplied milliseconds since the Unix epoch and is
//! informational only. The message id exists purely for client-side receipt
//! matching; replay protection lives a layer below, on the cipher sequence.

use uuid::Uuid;

use crate::error::{ProtocolError, ProtocolResult};

/// Chat sub-frame header length: subtype + timestamp + id + body length.
pub const CHAT_HEADER_LEN: usize = 1 + 8 + 16 + 2;

/// Maximum chat body length, bounded by the 2-byte length field.
pub const MAX_CHAT_BODY_LEN: usize = u16::MAX as usize;

/// Chat sub-frame kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ChatKind {
    /// UTF-8 text message.
    Text = 0x01,
    /// Opaque binary payload.
    Binary = 0x02,
    /// Typing indicator (body: `1` typing, `0` stopped).
    Typing = 0x03,
    /// Read receipt (body: the 16-byte id of the message read).
    ReadReceipt = 0x04,
    /// Request for the connected-user list (empty body).
    UserListRequest = 0x05,
    /// Connected-user list (body: JSON array of display names).
    UserListResponse = 0x06,
    /// Server-to-client error notice (UTF-8 text body).
    Error = 0x07,
}

impl ChatKind {
    /// Decodes a subtype byte, failing closed on unknown values.
    #[must_use]
    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::Text),
            0x02 => Some(Self::Binary),
            0x03 => Some(Self::Typing),
            0x04 => Some(Self::ReadReceipt),
            0x05 => Some(Self::UserListRequest),
            0x06 => Some(Self::UserListResponse),
            0x07 => Some(Self::Error),
            _ => None,
        }
    }

    /// True for the kinds a client may send; the server-only kinds
    /// (user-list-response, error) are rejected on the inbound path.
    #[must_use]
    pub const fn client_may_send(&self) -> bool {
        matches!(
            self,
            Self::Text | Self::Binary | Self::Typing | Self::ReadReceipt | Self::UserListRequest
        )
    }

    /// Stable label for logs and metrics.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Binary => "binary",
            Self::Typing => "typing",
            Self::ReadReceipt => "read-receipt",
            Self::UserListRequest => "user-list-request",
            Self::UserListResponse => "user-list-response",
            Self::Error => "error",
        }
    }
}

/// Decoded chat sub-frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatFrame {
    /// Sub-frame kind.
    pub kind: ChatKind,
    /// Sender-supplied milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
    /// 16-byte message id for receipt matching.
    pub message_id: [u8; 16],
    /// Payload, at most [`MAX_CHAT_BODY_LEN`] bytes.
    pub body: Vec<u8>,
}

impl ChatFrame {
    /// Builds a frame with a freshly generated message id.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Malformed`] if the body exceeds the 2-byte
    /// length field.
    pub fn new(kind: ChatKind, timestamp_ms: u64, body: Vec<u8>) -> ProtocolResult<Self> {
        if body.len() > MAX_CHAT_BODY_LEN {
            return Err(ProtocolError::Malformed("chat body too long"));
        }
        Ok(Self {
            kind,
            timestamp_ms,
            message_id: *Uuid::new_v4().as_bytes(),
            body,
        })
    }

    /// Serializes the sub-frame.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(CHAT_HEADER_LEN + self.body.len());
        buf.push(self.kind as u8);
        buf.extend_from_slice(&self.timestamp_ms.to_be_bytes());
        buf.extend_from_slice(&self.message_id);
        #[allow(clippy::cast_possible_truncation)] // bounded at construction
        buf.extend_from_slice(&(self.body.len() as u16).to_be_bytes());
        buf.extend_from_slice(&self.body);
        buf
    }

    /// Parses a sub-frame from decrypted record plaintext.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Malformed`] on truncation, trailing garbage,
    /// or an unknown subtype.
    pub fn decode(plain: &[u8]) -> ProtocolResult<Self> {
        if plain.len() < CHAT_HEADER_LEN {
            return Err(ProtocolError::Malformed("chat frame truncated"));
        }
        let kind = ChatKind::from_byte(plain[0])
            .ok_or(ProtocolError::Malformed("unknown chat subtype"))?;
        let timestamp_ms = u64::from_be_bytes(plain[1..9].try_into().expect("length checked"));
        let mut message_id = [0u8; 16];
        message_id.copy_from_slice(&plain[9..25]);
        let body_len = u16::from_be_bytes([plain[25], plain[26]]) as usize;
        let body = &plain[CHAT_HEADER_LEN..];
        if body.len() != body_len {
            return Err(ProtocolError::Malformed("chat body length mismatch"));
        }
        Ok(Self {
            kind,
            timestamp_ms,
            message_id,
            body: body.to_vec(),
        })
    }

    /// Body interpreted as UTF-8, for text-bearing kinds.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Malformed`] on invalid UTF-8.
    pub fn body_text(&self) -> ProtocolResult<&str> {
        std::str::from_utf8(&self.body).map_err(|_| ProtocolError::Malformed("body not UTF-8"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_frame_roundtrip() {
        let frame = ChatFrame::new(ChatKind::Text, 1_700_000_000_123, b"hello".to_vec()).unwrap();
        let decoded = ChatFrame::decode(&frame.encode()).unwrap();
        assert_eq!(decoded, frame);
        assert_eq!(decoded.body_text().unwrap(), "hello");
    }

    #[test]
    fn empty_body_is_valid() {
        let frame = ChatFrame::new(ChatKind::UserListRequest, 0, Vec::new()).unwrap();
        let decoded = ChatFrame::decode(&frame.encode()).unwrap();
        assert!(decoded.body.is_empty());
    }

    #[test]
    fn body_length_must_match_payload() {
        let frame = ChatFrame::new(ChatKind::Text, 5, b"abcdef".to_vec()).unwrap();
        let mut encoded = frame.encode();
        encoded.truncate(encoded.len() - 1);
        assert!(matches!(
            ChatFrame::decode(&encoded),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn unknown_subtype_fails_closed() {
        let frame = ChatFrame::new(ChatKind::Text, 5, b"x".to_vec()).unwrap();
        let mut encoded = frame.encode();
        encoded[0] = 0x55;
        assert!(matches!(
            ChatFrame::decode(&encoded),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn oversized_body_rejected_at_construction() {
        let body = vec![0u8; MAX_CHAT_BODY_LEN + 1];
        assert!(ChatFrame::new(ChatKind::Binary, 0, body).is_err());
    }

    #[test]
    fn message_ids_are_unique() {
        let a = ChatFrame::new(ChatKind::Text, 0, Vec::new()).unwrap();
        let b = ChatFrame::new(ChatKind::Text, 0, Vec::new()).unwrap();
        assert_ne!(a.message_id, b.message_id);
    }

    #[test]
    fn server_only_kinds_are_not_client_sendable() {
        assert!(!ChatKind::UserListResponse.client_may_send());
        assert!(!ChatKind::Error.client_may_send());
        assert!(ChatKind::Text.client_may_send());
        assert!(ChatKind::Typing.client_may_send());
    }
}
