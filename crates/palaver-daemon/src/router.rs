//! Session registry and message routing.
//!
//! The router maps session ids to lightweight handles. Connection tasks own
//! their sockets; the router owns nothing but the handles, so a dead
//! session can never be kept alive (or its socket written) through the
//! registry.
//!
//! # Concurrency
//!
//! Backed by a sharded concurrent map: broadcasts and unicasts are
//! lock-free reads against each shard, registration and removal are brief
//! shard writes. A broadcaster never blocks on a slow peer — enqueueing
//! into a full peer queue drops that peer's oldest chat frame and moves
//! on.
//!
//! # Ordering
//!
//! Frames routed to the same peer through the same call chain stay FIFO
//! (one bounded queue per peer). Broadcast gives no cross-recipient
//! ordering: every recipient observes its own dispatch order.

use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use palaver_core::auth::Principal;
use palaver_core::chat::ChatFrame;
use tokio_util::sync::CancellationToken;

use crate::outbound::{ChatEnqueue, OutboundQueue, TryEnqueueError};
use crate::session::{DisconnectCause, SessionId, SessionStats};

/// Routing view of one live session.
///
/// Everything here is shared state or a signal; the socket and crypto live
/// exclusively in the connection task.
#[derive(Clone)]
pub struct PeerHandle {
    /// Session id.
    pub id: SessionId,
    /// Authenticated identity.
    pub principal: Principal,
    /// The session's outbound queue.
    pub outbound: Arc<OutboundQueue>,
    /// Shared counters for the reaper and metrics.
    pub stats: Arc<SessionStats>,
    /// Cancels the connection task.
    pub cancel: CancellationToken,
    /// Cause recorded for a requested close, read by the connection task.
    pub close_cause: Arc<Mutex<Option<DisconnectCause>>>,
    /// Set by the rekeyer; the connection initiates the sub-exchange.
    pub rekey_requested: Arc<AtomicBool>,
}

impl PeerHandle {
    /// Asks the owning connection task to shut the session down.
    pub fn request_close(&self, cause: DisconnectCause) {
        {
            let mut slot = self
                .close_cause
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            // First cause wins; a shutdown racing a reap keeps the reap's
            // reason.
            slot.get_or_insert(cause);
        }
        self.cancel.cancel();
    }

    /// Cause recorded by [`PeerHandle::request_close`], if any.
    #[must_use]
    pub fn requested_close_cause(&self) -> Option<DisconnectCause> {
        *self
            .close_cause
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Outcome of a targeted send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnicastOutcome {
    /// Frame queued on the peer.
    Enqueued,
    /// No registered session has that id.
    NoSuchPeer,
    /// Peer's outbound queue is at capacity; the frame was refused.
    PeerBackpressured,
}

/// Tally of one broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Peers the frame was queued for.
    pub delivered: usize,
    /// Peers that lost a queued frame (or the new one) to overflow.
    pub dropped: usize,
}

/// Concurrent registry of live sessions.
#[derive(Default)]
pub struct Router {
    peers: DashMap<SessionId, PeerHandle>,
}

impl Router {
    /// Creates an empty router.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a session on its transition to ready.
    pub fn register(&self, handle: PeerHandle) {
        let previous = self.peers.insert(handle.id, handle);
        debug_assert!(previous.is_none(), "session ids are never reused");
    }

    /// Removes a session, returning its handle if it was present.
    pub fn unregister(&self, id: SessionId) -> Option<PeerHandle> {
        self.peers.remove(&id).map(|(_, handle)| handle)
    }

    /// Queues a frame for one peer. Never blocks.
    pub fn unicast(&self, id: SessionId, frame: ChatFrame) -> UnicastOutcome {
        let Some(peer) = self.peers.get(&id) else {
            return UnicastOutcome::NoSuchPeer;
        };
        match peer.outbound.try_push_chat(frame) {
            Ok(()) => UnicastOutcome::Enqueued,
            Err(TryEnqueueError::Full) => UnicastOutcome::PeerBackpressured,
            Err(TryEnqueueError::Closed) => UnicastOutcome::NoSuchPeer,
        }
    }

    /// Queues a frame for every registered peer except `except`.
    ///
    /// Best-effort: peers whose queues are full lose their oldest chat
    /// frame and are counted in the report, but never stall the
    /// broadcaster.
    pub fn broadcast(&self, frame: &ChatFrame, except: Option<SessionId>) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        for peer in self.peers.iter() {
            if Some(peer.id) == except {
                continue;
            }
            match peer.outbound.push_chat(frame.clone()) {
                ChatEnqueue::Enqueued => report.delivered += 1,
                ChatEnqueue::DroppedOldest => {
                    report.delivered += 1;
                    report.dropped += 1;
                },
                ChatEnqueue::Closed => report.dropped += 1,
            }
        }
        report
    }

    /// Display names of every registered peer, sorted for stable output.
    #[must_use]
    pub fn user_list(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .peers
            .iter()
            .map(|peer| peer.principal.display_name.clone())
            .collect();
        names.sort_unstable();
        names
    }

    /// Snapshot of all handles, for the periodic scans and shutdown.
    #[must_use]
    pub fn handles(&self) -> Vec<PeerHandle> {
        self.peers.iter().map(|peer| peer.clone()).collect()
    }

    /// Number of registered sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// True when no session is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
