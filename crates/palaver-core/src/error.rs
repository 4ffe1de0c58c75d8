//! Protocol error types shared by the codec, record parser, and crypto
//! session.
//!
//! Every fallible wire-facing operation returns [`ProtocolResult`]. The
//! variants are deliberately coarse on the wire side: a peer is told the
//! *category* of failure via [`CloseReason`], never which specific check
//! fired.

use thiserror::Error;

/// Hard upper bound on a record payload, independent of configuration.
///
/// The configurable `max_message_size` may be lowered below this but never
/// raised above it; the cap exists so a corrupt or hostile length prefix can
/// never trigger a large allocation.
pub const MAX_RECORD_SIZE: usize = 16 * 1024 * 1024;

/// Default maximum record payload size (1 MiB).
pub const DEFAULT_MAX_RECORD_SIZE: usize = 1024 * 1024;

/// Result alias for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while framing, parsing, or unsealing records.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Declared record length exceeds the configured maximum.
    ///
    /// Raised before any payload allocation occurs.
    #[error("record too large: {size} bytes exceeds maximum {max}")]
    RecordTooLarge {
        /// Declared payload length.
        size: usize,
        /// Configured maximum.
        max: usize,
    },

    /// Record body is structurally invalid (truncated field, bad length,
    /// undecodable blob).
    #[error("malformed record: {0}")]
    Malformed(&'static str),

    /// First byte of the payload is not a known record tag.
    #[error("unknown record tag {tag:#04x}")]
    UnknownTag {
        /// The offending tag byte.
        tag: u8,
    },

    /// A syntactically valid record arrived in a state that does not accept
    /// it (e.g. a chat frame during handshake).
    #[error("unexpected {record} record in {state} state")]
    UnexpectedRecord {
        /// Human-readable record name.
        record: &'static str,
        /// State the connection was in.
        state: &'static str,
    },

    /// MAC mismatch or AEAD open failure. Treated as an active attack.
    #[error("record integrity check failed")]
    Integrity,

    /// Sequence number at or below the receive highwater mark.
    #[error("replayed record: seq {seq} <= highwater {highwater}")]
    Replay {
        /// Sequence carried by the rejected record.
        seq: u64,
        /// Highest sequence accepted so far.
        highwater: u64,
    },

    /// Handshake or rekey sub-exchange violated its script.
    #[error("handshake failure: {0}")]
    Handshake(&'static str),

    /// Inbound rate budget exhausted past the grace allowance.
    #[error("rate limit exceeded")]
    RateExceeded,

    /// Underlying transport error surfaced through the codec.
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Maps the error to the close-reason category reported to the peer.
    #[must_use]
    pub const fn close_reason(&self) -> CloseReason {
        match self {
            Self::Integrity | Self::Replay { .. } => CloseReason::Integrity,
            Self::RateExceeded => CloseReason::Rate,
            Self::Io(_) => CloseReason::Server,
            _ => CloseReason::Protocol,
        }
    }
}

/// Close-reason category carried in the body of a Close record.
///
/// The wire encoding is a single byte. Categories are intentionally broad:
/// replay, tamper, and decrypt failures all collapse to `Integrity`, and
/// internal faults collapse to `Server`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CloseReason {
    /// Orderly close (logout acknowledgement).
    Normal = 0x00,
    /// Framing or state-machine violation.
    Protocol = 0x01,
    /// Authentication failed or timed out.
    Auth = 0x02,
    /// Rate budget exhausted.
    Rate = 0x03,
    /// MAC, decryption, or replay failure.
    Integrity = 0x04,
    /// No inbound activity within the idle window.
    Idle = 0x05,
    /// Server-side shutdown or internal fault.
    Server = 0x06,
}

impl CloseReason {
    /// Decodes a reason byte, failing closed on unknown values.
    #[must_use]
    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(Self::Normal),
            0x01 => Some(Self::Protocol),
            0x02 => Some(Self::Auth),
            0x03 => Some(Self::Rate),
            0x04 => Some(Self::Integrity),
            0x05 => Some(Self::Idle),
            0x06 => Some(Self::Server),
            _ => None,
        }
    }

    /// Stable label used for logs and metrics.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Protocol => "protocol",
            Self::Auth => "auth",
            Self::Rate => "rate",
            Self::Integrity => "integrity",
            Self::Idle => "idle",
            Self::Server => "server",
        }
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_reason_roundtrip() {
        for reason in [
            CloseReason::Normal,
            CloseReason::Protocol,
            CloseReason::Auth,
            CloseReason::Rate,
            CloseReason::Integrity,
            CloseReason::Idle,
            CloseReason::Server,
        ] {
            assert_eq!(CloseReason::from_byte(reason as u8), Some(reason));
        }
    }

    #[test]
    fn unknown_reason_byte_fails_closed() {
        for byte in [0x07u8, 0x10, 0x42, 0xFF] {
            assert_eq!(CloseReason::from_byte(byte), None);
        }
    }

    #[test]
    fn replay_and_integrity_share_a_category() {
        let replay = ProtocolError::Replay {
            seq: 4,
            highwater: 9,
        };
        assert_eq!(replay.close_reason(), CloseReason::Integrity);
        assert_eq!(
            ProtocolError::Integrity.close_reason(),
            CloseReason::Integrity
        );
    }

    #[test]
    fn oversize_maps_to_protocol_category() {
        let err = ProtocolError::RecordTooLarge {
            size: 2 * 1024 * 1024,
            max: 1024 * 1024,
        };
        assert_eq!(err.close_reason(), CloseReason::Protocol);
    }
}
