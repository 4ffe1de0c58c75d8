//! Per-session state: the lifecycle phase machine, shared counters, and
//! disconnect causes.
//!
//! The phase machine is strict and forward-only:
//!
//! ```text
//!   Handshake ──> AwaitingAuth ──> Ready ──> Draining ──> Closed
//!        │              │            │          ▲
//!        └──────────────┴────────────┴──────────┘   (any error)
//! ```
//!
//! There are no implicit promotions and no regressions. Each transition is
//! validated explicitly and an illegal jump is a structured error the
//! caller can log without truncation. A session is visible to the router
//! only while in `Ready` or `Draining`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use palaver_core::error::CloseReason;

/// Process-unique session identifier. Monotonic, never reused.
pub type SessionId = u64;

/// Lifecycle phase of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Socket accepted, key exchange in progress.
    Handshake,
    /// Keys installed, waiting for credentials.
    AwaitingAuth,
    /// Authenticated and registered with the router.
    Ready,
    /// No new inbound accepted; outbound being flushed.
    Draining,
    /// Terminal.
    Closed,
}

impl SessionPhase {
    /// Attempts the `Handshake -> AwaitingAuth` transition.
    ///
    /// # Errors
    ///
    /// Returns [`PhaseError::IllegalTransition`] from any other phase.
    pub fn advance_to_awaiting_auth(self) -> Result<Self, PhaseError> {
        if self == Self::Handshake {
            Ok(Self::AwaitingAuth)
        } else {
            Err(PhaseError::IllegalTransition {
                from: self,
                to: Self::AwaitingAuth,
            })
        }
    }

    /// Attempts the `AwaitingAuth -> Ready` transition.
    ///
    /// # Errors
    ///
    /// Returns [`PhaseError::IllegalTransition`] from any other phase.
    pub fn advance_to_ready(self) -> Result<Self, PhaseError> {
        if self == Self::AwaitingAuth {
            Ok(Self::Ready)
        } else {
            Err(PhaseError::IllegalTransition {
                from: self,
                to: Self::Ready,
            })
        }
    }

    /// Attempts the transition into `Draining`, legal from every live
    /// phase.
    ///
    /// # Errors
    ///
    /// Returns [`PhaseError::IllegalTransition`] from `Closed` (and from
    /// `Draining` itself, so double-drains are caught).
    pub fn advance_to_draining(self) -> Result<Self, PhaseError> {
        match self {
            Self::Handshake | Self::AwaitingAuth | Self::Ready => Ok(Self::Draining),
            Self::Draining | Self::Closed => Err(PhaseError::IllegalTransition {
                from: self,
                to: Self::Draining,
            }),
        }
    }

    /// Attempts the `Draining -> Closed` transition.
    ///
    /// # Errors
    ///
    /// Returns [`PhaseError::IllegalTransition`] from any other phase.
    pub fn advance_to_closed(self) -> Result<Self, PhaseError> {
        if self == Self::Draining {
            Ok(Self::Closed)
        } else {
            Err(PhaseError::IllegalTransition {
                from: self,
                to: Self::Closed,
            })
        }
    }

    /// True while chat traffic is accepted.
    #[must_use]
    pub const fn accepts_chat(&self) -> bool {
        matches!(self, Self::Ready)
    }
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Handshake => "Handshake",
            Self::AwaitingAuth => "AwaitingAuth",
            Self::Ready => "Ready",
            Self::Draining => "Draining",
            Self::Closed => "Closed",
        };
        f.write_str(name)
    }
}

/// Illegal phase transition.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PhaseError {
    /// Attempted a transition the phase machine forbids.
    #[error("illegal session phase transition from {from} to {to}")]
    IllegalTransition {
        /// Phase the session was in.
        from: SessionPhase,
        /// Phase the caller attempted to reach.
        to: SessionPhase,
    },
}

/// Why a session ended. Finer-grained than the wire category so metrics
/// can distinguish, say, a backpressure close from a shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectCause {
    /// Client logged out cleanly.
    Logout,
    /// Framing or state-machine violation.
    Protocol,
    /// Authentication failed or timed out.
    AuthFailed,
    /// Inbound rate budget exhausted past grace.
    RateExceeded,
    /// MAC, decryption, or replay failure.
    Integrity,
    /// No inbound activity within the idle window.
    Idle,
    /// Outbound write stalled past the stall deadline.
    Backpressure,
    /// Server shutting down.
    Shutdown,
    /// Peer reset or vanished mid-stream; no final record is sent.
    PeerVanished,
    /// Unexpected internal fault; the session dies, the process does not.
    Internal,
}

impl DisconnectCause {
    /// Label for logs and the close-reason metric.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Logout => "logout",
            Self::Protocol => "protocol",
            Self::AuthFailed => "auth",
            Self::RateExceeded => "rate",
            Self::Integrity => "integrity",
            Self::Idle => "idle",
            Self::Backpressure => "backpressure",
            Self::Shutdown => "shutdown",
            Self::PeerVanished => "peer_vanished",
            Self::Internal => "internal",
        }
    }

    /// Category reported to the peer, or `None` when the transport is
    /// already gone and no final record can be sent.
    ///
    /// The peer is told the broad category only; backpressure, shutdown,
    /// and internal faults all read as "server".
    #[must_use]
    pub const fn wire_reason(&self) -> Option<CloseReason> {
        match self {
            Self::Logout => Some(CloseReason::Normal),
            Self::Protocol => Some(CloseReason::Protocol),
            Self::AuthFailed => Some(CloseReason::Auth),
            Self::RateExceeded => Some(CloseReason::Rate),
            Self::Integrity => Some(CloseReason::Integrity),
            Self::Idle => Some(CloseReason::Idle),
            Self::Backpressure | Self::Shutdown | Self::Internal => Some(CloseReason::Server),
            Self::PeerVanished => None,
        }
    }
}

/// Counters shared between a connection task and the periodic observers.
///
/// Activity is tracked as milliseconds since the server's epoch instant so
/// the reaper can compare without locking.
#[derive(Debug, Default)]
pub struct SessionStats {
    /// Bytes received on the socket.
    pub bytes_rx: AtomicU64,
    /// Bytes written to the socket.
    pub bytes_tx: AtomicU64,
    /// Records received.
    pub frames_rx: AtomicU64,
    /// Records sent.
    pub frames_tx: AtomicU64,
    /// Last inbound activity, in milliseconds since the server epoch.
    pub last_activity_ms: AtomicU64,
    /// Current key epoch installation time, in milliseconds since the
    /// server epoch.
    pub keys_installed_ms: AtomicU64,
}

impl SessionStats {
    /// Records inbound activity at `now`.
    pub fn touch(&self, epoch: Instant, now: Instant) {
        self.last_activity_ms
            .store(millis_since(epoch, now), Ordering::Relaxed);
    }

    /// Time since the last inbound activity.
    #[must_use]
    pub fn idle_for(&self, epoch: Instant, now: Instant) -> Duration {
        let last = self.last_activity_ms.load(Ordering::Relaxed);
        Duration::from_millis(millis_since(epoch, now).saturating_sub(last))
    }

    /// Records a key installation at `now`.
    pub fn mark_keys_installed(&self, epoch: Instant, now: Instant) {
        self.keys_installed_ms
            .store(millis_since(epoch, now), Ordering::Relaxed);
    }

    /// Age of the current key epoch.
    #[must_use]
    pub fn key_age(&self, epoch: Instant, now: Instant) -> Duration {
        let installed = self.keys_installed_ms.load(Ordering::Relaxed);
        Duration::from_millis(millis_since(epoch, now).saturating_sub(installed))
    }
}

fn millis_since(epoch: Instant, now: Instant) -> u64 {
    u64::try_from(now.saturating_duration_since(epoch).as_millis()).unwrap_or(u64::MAX)
}
