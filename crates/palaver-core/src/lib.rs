//! Wire protocol, record cryptography, and policy primitives for the
//! palaver chat daemon.
//!
//! # Architecture
//!
//! The protocol stack is organized in layers; this crate owns everything
//! above the transport and below the connection state machine:
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │        Chat sub-frames                  │  chat
//! ├─────────────────────────────────────────┤
//! │        Record sealing (AEAD + MAC)      │  crypto
//! ├─────────────────────────────────────────┤
//! │        Tagged records                   │  record
//! ├─────────────────────────────────────────┤
//! │        Length-prefixed framing          │  framing
//! ├─────────────────────────────────────────┤
//! │        TCP / TLS transport              │  (daemon crate)
//! └─────────────────────────────────────────┘
//! ```
//!
//! Alongside the stack live the cross-cutting policies: token-bucket rate
//! limiting, the login throttle, the authentication ports, configuration,
//! and the injectable clock.
//!
//! # Security Considerations
//!
//! - Record lengths are validated before allocation.
//! - Unknown tags, subtypes, and reason codes fail closed.
//! - MAC verification is constant time and precedes decryption.
//! - Key material zeroizes on drop and is never cloned.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod auth;
pub mod chat;
pub mod clock;
pub mod config;
pub mod crypto;
pub mod error;
pub mod framing;
pub mod rate_limit;
pub mod record;

pub use auth::{
    parse_credentials, AuthError, AuthGate, AuthOutcome, AuthStore, Credentials, HistoryStore,
    Principal,
};
pub use chat::{ChatFrame, ChatKind};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use crypto::{CryptoSession, KeyExchange, SessionKeys, TranscriptLabel, SEQ_REKEY_THRESHOLD};
pub use error::{CloseReason, ProtocolError, ProtocolResult, DEFAULT_MAX_RECORD_SIZE};
pub use framing::RecordCodec;
pub use rate_limit::{
    InboundVerdict, LoginGate, LoginThrottle, SessionLimiter, SessionLimits, TokenBucket,
};
pub use record::{CipherFrame, Record, RekeyPhase, SealedContribution};
