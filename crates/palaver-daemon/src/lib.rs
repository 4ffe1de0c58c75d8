//! palaver-daemon — secure real-time chat server.
//!
//! The daemon accepts TCP (optionally TLS 1.3) connections, runs an
//! ephemeral key exchange and an authentication gate per connection, and
//! routes encrypted chat frames between peers.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │ Supervisor: accept loop, periodic tasks, shutdown         │
//! │   ├── Listener (permits, optional TLS)                    │
//! │   ├── Router (session registry, broadcast/unicast)        │
//! │   └── one task per connection:                            │
//! │         Framed codec ─ phase machine ─ crypto session     │
//! │         inbound dispatch ─ outbound queue ─ rate gate     │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! Each connection task exclusively owns its socket and key material; the
//! router holds only queues, counters, and cancellation handles. See
//! `palaver-core` for the wire protocol and cryptography.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod connection;
pub mod listener;
pub mod metrics;
pub mod outbound;
pub mod router;
pub mod session;
pub mod supervisor;

pub use connection::ConnectionCtx;
pub use listener::{Listener, ListenerError};
pub use metrics::{MetricsRegistry, ServerMetrics};
pub use outbound::{ChatEnqueue, OutboundItem, OutboundQueue, TryEnqueueError};
pub use router::{BroadcastReport, PeerHandle, Router, UnicastOutcome};
pub use session::{DisconnectCause, PhaseError, SessionId, SessionPhase, SessionStats};
pub use supervisor::{Server, ServerDeps, ServerError};
