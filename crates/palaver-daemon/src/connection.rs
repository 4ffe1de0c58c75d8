//! Per-connection driver: handshake, authentication, the ready loop, and
//! the drain.
//!
//! One task per connection owns the socket, the codec, and the crypto
//! session; nothing else ever writes to the socket. The task advances the
//! session phase machine strictly forward and is the sole error sink for
//! its session: every failure maps to a [`DisconnectCause`], a best-effort
//! Close record, and removal from the router. Faults never propagate out
//! of the task.
//!
//! # Scheduling
//!
//! Inbound and outbound are coalesced into one `select!` loop (reads, the
//! outbound queue, the idle deadline, a housekeeping tick, and the cancel
//! token). Every wait has a timeout; rate-limited outbound frames park on
//! the bucket's own refill estimate, never in a busy loop.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use futures::{SinkExt, StreamExt};
use tokio::sync::OwnedSemaphorePermit;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use palaver_core::auth::{AuthGate, AuthOutcome, HistoryStore, Principal};
use palaver_core::chat::{ChatFrame, ChatKind};
use palaver_core::clock::Clock;
use palaver_core::config::Config;
use palaver_core::crypto::{CryptoSession, KeyExchange, TranscriptLabel};
use palaver_core::error::ProtocolError;
use palaver_core::framing::RecordCodec;
use palaver_core::rate_limit::{InboundVerdict, SessionLimiter};
use palaver_core::record::{Record, RekeyPhase, PUBLIC_KEY_LEN};

use crate::listener::BoxedStream;
use crate::metrics::ServerMetrics;
use crate::outbound::{ChatEnqueue, OutboundItem, OutboundQueue};
use crate::router::{PeerHandle, Router};
use crate::session::{DisconnectCause, SessionId, SessionPhase, SessionStats};

/// Time allowed to flush queued outbound once a session starts draining.
const DRAIN_DEADLINE: Duration = Duration::from_secs(2);

/// Fixed per-record cost of the cipher envelope (tag, sequence, nonce,
/// AEAD tag, MAC), charged to the byte bucket on top of the plaintext.
const CIPHER_OVERHEAD: usize = 1 + 8 + 12 + 16 + 32;

/// Housekeeping cadence inside the ready loop (rekey trigger checks).
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(1);

/// Shared dependencies handed to every connection task.
#[derive(Clone)]
pub struct ConnectionCtx {
    /// Daemon configuration.
    pub config: Arc<Config>,
    /// Session registry.
    pub router: Arc<Router>,
    /// Metrics handle.
    pub metrics: ServerMetrics,
    /// Authentication gate.
    pub auth: Arc<AuthGate>,
    /// Optional message archive.
    pub history: Option<Arc<dyn HistoryStore>>,
    /// Injectable clock.
    pub clock: Arc<dyn Clock>,
    /// Server epoch instant for the shared activity counters.
    pub epoch: Instant,
    /// Daemon-wide shutdown signal.
    pub shutdown: CancellationToken,
}

/// Runs one connection to completion. Never returns an error: every
/// failure is absorbed into the session's disconnect cause.
pub async fn run_connection(
    ctx: ConnectionCtx,
    id: SessionId,
    stream: BoxedStream,
    peer_addr: SocketAddr,
    permit: OwnedSemaphorePermit,
) {
    let codec = RecordCodec::new(ctx.config.performance.max_message_size);
    let framed = Framed::with_capacity(stream, codec, ctx.config.performance.receive_buffer_size);

    let now = ctx.clock.now();
    let stats = Arc::new(SessionStats::default());
    stats.touch(ctx.epoch, now);

    let mut conn = Connection {
        id,
        peer_addr,
        framed,
        phase: SessionPhase::Handshake,
        crypto: None,
        identity: None,
        limiter: SessionLimiter::new(ctx.config.session_limits(), now),
        stats,
        outbound: Arc::new(OutboundQueue::new(ctx.config.performance.outbound_queue_size)),
        cancel: ctx.shutdown.child_token(),
        close_cause: Arc::new(Mutex::new(None)),
        rekey_requested: Arc::new(AtomicBool::new(false)),
        pending_rekey: None,
        pending_confirm: None,
        registered: false,
        ctx,
    };

    debug!(session = conn.id, peer = %conn.peer_addr, "connection accepted");

    let cause = conn.drive().await;
    conn.finish(cause).await;

    // The permit frees the connection slot only after teardown completes.
    drop(permit);
}

struct Connection {
    id: SessionId,
    peer_addr: SocketAddr,
    framed: Framed<BoxedStream, RecordCodec>,
    phase: SessionPhase,
    crypto: Option<CryptoSession>,
    identity: Option<Principal>,
    limiter: SessionLimiter,
    stats: Arc<SessionStats>,
    outbound: Arc<OutboundQueue>,
    cancel: CancellationToken,
    close_cause: Arc<Mutex<Option<DisconnectCause>>>,
    rekey_requested: Arc<AtomicBool>,
    /// Key exchange we initiated, awaiting the peer's response.
    pending_rekey: Option<KeyExchange>,
    /// Transcript (initiator, responder) of a rekey we responded to,
    /// awaiting the peer's confirm.
    pending_confirm: Option<([u8; PUBLIC_KEY_LEN], [u8; PUBLIC_KEY_LEN])>,
    registered: bool,
    ctx: ConnectionCtx,
}

impl Connection {
    fn now(&self) -> Instant {
        self.ctx.clock.now()
    }

    /// Cause recorded by a supervisor-requested close, defaulting to
    /// shutdown.
    fn requested_cause(&self) -> DisconnectCause {
        self.close_cause
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .unwrap_or(DisconnectCause::Shutdown)
    }

    async fn drive(&mut self) -> DisconnectCause {
        let cancel = self.cancel.clone();

        let handshake = cancel.run_until_cancelled(self.handshake_phase());
        match handshake.await {
            None => return self.requested_cause(),
            Some(Err(cause)) => return cause,
            Some(Ok(())) => {},
        }

        let auth = cancel.run_until_cancelled(self.auth_phase());
        match auth.await {
            None => return self.requested_cause(),
            Some(Err(cause)) => return cause,
            Some(Ok(())) => {},
        }

        if let Err(cause) = self.register() {
            return cause;
        }
        self.ready_loop().await
    }

    // ------------------------------------------------------------------
    // Handshake
    // ------------------------------------------------------------------

    /// Runs the server side of the key exchange. Allowed inputs are
    /// handshake records only; anything else is a protocol violation.
    async fn handshake_phase(&mut self) -> Result<(), DisconnectCause> {
        let deadline = self.ctx.config.auth_timeout();

        let exchange = KeyExchange::generate();
        let server_pub = exchange.public_key();
        self.send_record(&Record::HandshakeHello {
            public_key: server_pub,
            contribution: None,
        })
        .await?;

        let payload = match tokio::time::timeout(deadline, self.framed.next()).await {
            Err(_) => {
                debug!(session = self.id, "handshake timed out");
                return Err(DisconnectCause::Protocol);
            },
            Ok(None) => return Err(DisconnectCause::PeerVanished),
            Ok(Some(Err(e))) => return Err(self.map_read_error(&e)),
            Ok(Some(Ok(payload))) => payload,
        };
        self.note_inbound(payload.len());

        let record = Record::decode(&payload).map_err(|e| self.protocol_fault(&e))?;
        let Record::HandshakeHello {
            public_key: client_pub,
            contribution: Some(sealed),
        } = record
        else {
            debug!(session = self.id, "unexpected record during handshake");
            return Err(DisconnectCause::Protocol);
        };

        let keys = exchange.complete(&client_pub, &sealed).map_err(|e| {
            warn!(session = self.id, error = %e, "key exchange failed");
            DisconnectCause::Protocol
        })?;

        let finish = keys.transcript_mac(TranscriptLabel::Handshake, &server_pub, &client_pub);
        let now = self.now();
        self.crypto = Some(CryptoSession::new(keys, now));
        self.stats.mark_keys_installed(self.ctx.epoch, now);

        self.send_record(&Record::HandshakeFinish { mac: finish }).await?;

        self.advance(SessionPhase::AwaitingAuth)?;
        debug!(session = self.id, "handshake complete");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Authentication
    // ------------------------------------------------------------------

    /// Waits for credentials within the auth window. A store outage is
    /// retryable until the window lapses; every other failure is final.
    async fn auth_phase(&mut self) -> Result<(), DisconnectCause> {
        let deadline = tokio::time::Instant::now() + self.ctx.config.auth_timeout();

        loop {
            let payload =
                match tokio::time::timeout_at(deadline, self.framed.next()).await {
                    Err(_) => {
                        info!(session = self.id, "authentication window lapsed");
                        self.ctx.metrics.auth_failure("timeout");
                        return Err(DisconnectCause::AuthFailed);
                    },
                    Ok(None) => return Err(DisconnectCause::PeerVanished),
                    Ok(Some(Err(e))) => return Err(self.map_read_error(&e)),
                    Ok(Some(Ok(payload))) => payload,
                };
            self.note_inbound(payload.len());

            let record = Record::decode(&payload).map_err(|e| self.protocol_fault(&e))?;
            let body = match record {
                Record::AuthRequest(body) => body,
                Record::Close(_) => return Err(DisconnectCause::Logout),
                other => {
                    debug!(
                        session = self.id,
                        record = other.name(),
                        "unexpected record while awaiting auth"
                    );
                    return Err(DisconnectCause::Protocol);
                },
            };

            let credentials =
                palaver_core::auth::parse_credentials(&body).map_err(|e| self.protocol_fault(&e))?;

            let now = self.now();
            match self
                .ctx
                .auth
                .authenticate(self.peer_addr.ip(), &credentials, now)
                .await
            {
                Ok((principal, token)) => {
                    info!(
                        session = self.id,
                        user = %principal.display_name,
                        user_id = principal.user_id,
                        "authenticated"
                    );
                    let outcome = AuthOutcome::Ok {
                        principal: principal.clone(),
                        token,
                    };
                    self.send_record(&Record::AuthResponse(outcome.encode().into())).await?;
                    self.identity = Some(principal);
                    self.advance(SessionPhase::Ready)?;
                    return Ok(());
                },
                Err(err) => {
                    self.ctx.metrics.auth_failure(err.code());
                    let outcome = AuthOutcome::Error {
                        code: err.code().to_string(),
                        retryable: err.is_retryable(),
                    };
                    self.send_record(&Record::AuthResponse(outcome.encode().into())).await?;
                    if err.is_retryable() {
                        debug!(session = self.id, error = %err, "auth retryable, window still open");
                        continue;
                    }
                    info!(session = self.id, error = %err, "authentication failed");
                    return Err(DisconnectCause::AuthFailed);
                },
            }
        }
    }

    fn register(&mut self) -> Result<(), DisconnectCause> {
        let Some(principal) = self.identity.clone() else {
            warn!(session = self.id, "ready session without an identity");
            return Err(DisconnectCause::Internal);
        };
        self.ctx.router.register(PeerHandle {
            id: self.id,
            principal,
            outbound: Arc::clone(&self.outbound),
            stats: Arc::clone(&self.stats),
            cancel: self.cancel.clone(),
            close_cause: Arc::clone(&self.close_cause),
            rekey_requested: Arc::clone(&self.rekey_requested),
        });
        self.registered = true;
        self.ctx.metrics.session_registered();
        Ok(())
    }

    /// Ready-phase invariant: crypto state is always present. A miss is a
    /// driver bug and closes the session, never the process.
    fn crypto_mut(&mut self) -> Result<&mut CryptoSession, DisconnectCause> {
        match self.crypto.as_mut() {
            Some(crypto) => Ok(crypto),
            None => {
                warn!(session = self.id, "ready session without crypto state");
                Err(DisconnectCause::Internal)
            },
        }
    }

    // ------------------------------------------------------------------
    // Ready loop
    // ------------------------------------------------------------------

    async fn ready_loop(&mut self) -> DisconnectCause {
        let cancel = self.cancel.clone();
        let outbound = Arc::clone(&self.outbound);
        let idle_timeout = self.ctx.config.idle_timeout();
        let mut housekeeping = tokio::time::interval(HOUSEKEEPING_INTERVAL);
        housekeeping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let idle_left = idle_timeout.saturating_sub(self.stats.idle_for(self.ctx.epoch, self.now()));
            let idle_at = tokio::time::Instant::now() + idle_left;

            tokio::select! {
                () = cancel.cancelled() => {
                    return self.requested_cause();
                },
                _ = tokio::time::sleep_until(idle_at) => {
                    if self.stats.idle_for(self.ctx.epoch, self.now()) >= idle_timeout {
                        info!(session = self.id, "idle timeout");
                        return DisconnectCause::Idle;
                    }
                },
                _ = housekeeping.tick() => {
                    if let Err(cause) = self.maybe_initiate_rekey() {
                        return cause;
                    }
                },
                item = outbound.pop() => {
                    let Some(item) = item else { continue };
                    if let Err(cause) = self.write_outbound(item).await {
                        return cause;
                    }
                },
                inbound = self.framed.next() => {
                    match inbound {
                        None => return DisconnectCause::PeerVanished,
                        Some(Err(e)) => return self.map_read_error(&e),
                        Some(Ok(payload)) => {
                            if let Err(cause) = self.handle_inbound(&payload).await {
                                return cause;
                            }
                        },
                    }
                },
            }
        }
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    async fn handle_inbound(&mut self, payload: &[u8]) -> Result<(), DisconnectCause> {
        self.note_inbound(payload.len());

        let record = Record::decode(payload).map_err(|e| self.protocol_fault(&e))?;
        match record {
            Record::Keepalive => Ok(()),
            Record::Close(_) => {
                debug!(session = self.id, "peer logout");
                Err(DisconnectCause::Logout)
            },
            Record::Cipher(frame) => {
                match self.limiter.admit_inbound(payload.len() as u64, self.now()) {
                    InboundVerdict::Allowed => {},
                    InboundVerdict::Grace => {
                        warn!(session = self.id, "inbound rate budget overrun absorbed by grace");
                    },
                    InboundVerdict::Exceeded => {
                        warn!(session = self.id, "inbound rate budget exhausted");
                        return Err(DisconnectCause::RateExceeded);
                    },
                }

                let crypto = self.crypto_mut()?;
                let plain = match crypto.open(&frame) {
                    Ok(plain) => plain,
                    Err(ProtocolError::Replay { seq, highwater }) => {
                        warn!(session = self.id, seq, highwater, "replayed record rejected");
                        self.ctx.metrics.replay_rejected();
                        return Err(DisconnectCause::Integrity);
                    },
                    Err(e) => {
                        warn!(session = self.id, error = %e, "record failed integrity checks");
                        return Err(DisconnectCause::Integrity);
                    },
                };

                let chat = ChatFrame::decode(&plain).map_err(|e| self.protocol_fault(&e))?;
                self.dispatch_chat(chat).await
            },
            Record::Rekey(phase) => self.handle_rekey(phase),
            other => {
                debug!(
                    session = self.id,
                    record = other.name(),
                    "unexpected record in ready state"
                );
                Err(DisconnectCause::Protocol)
            },
        }
    }

    async fn dispatch_chat(&mut self, frame: ChatFrame) -> Result<(), DisconnectCause> {
        if !frame.kind.client_may_send() {
            debug!(
                session = self.id,
                kind = frame.kind.label(),
                "client sent a server-only chat subtype"
            );
            return Err(DisconnectCause::Protocol);
        }

        match frame.kind {
            ChatKind::Text | ChatKind::Binary => {
                self.archive(&frame).await;
                self.fan_out(&frame);
            },
            ChatKind::Typing | ChatKind::ReadReceipt => {
                // Presence traffic is forwarded, never archived.
                self.fan_out(&frame);
            },
            ChatKind::UserListRequest => {
                let names = self.ctx.router.user_list();
                let body = serde_json::to_vec(&names)
                    .expect("a list of strings always serializes");
                match ChatFrame::new(ChatKind::UserListResponse, unix_millis(), body) {
                    Ok(response) => {
                        if self.outbound.push_chat(response) == ChatEnqueue::DroppedOldest {
                            self.ctx.metrics.broadcast_dropped(1);
                        }
                    },
                    Err(e) => {
                        // A user list too large for a chat body is a
                        // deployment problem, not a peer fault.
                        warn!(session = self.id, error = %e, "user list does not fit a chat frame");
                    },
                }
            },
            // Guarded by the client_may_send check above; fail closed if a
            // new subtype ever slips through.
            ChatKind::UserListResponse | ChatKind::Error => {
                return Err(DisconnectCause::Protocol);
            },
        }
        Ok(())
    }

    fn fan_out(&self, frame: &ChatFrame) {
        let report = self.ctx.router.broadcast(frame, Some(self.id));
        if report.dropped > 0 {
            self.ctx.metrics.broadcast_dropped(report.dropped);
        }
        debug!(
            session = self.id,
            kind = frame.kind.label(),
            delivered = report.delivered,
            dropped = report.dropped,
            "broadcast dispatched"
        );
    }

    async fn archive(&self, frame: &ChatFrame) {
        let Some(history) = self.ctx.history.as_ref() else {
            return;
        };
        let principal_id = self.identity.as_ref().map_or(0, |p| p.user_id);
        if let Err(e) = history.append(principal_id, frame).await {
            // History is advisory: log and move on.
            warn!(session = self.id, error = %e, "history append failed");
        }
    }

    // ------------------------------------------------------------------
    // Rekey
    // ------------------------------------------------------------------

    /// Starts a rekey when the rekeyer flagged this session or either
    /// local trigger (key age, sequence exhaustion) has fired.
    fn maybe_initiate_rekey(&mut self) -> Result<(), DisconnectCause> {
        if self.pending_rekey.is_some() || self.pending_confirm.is_some() {
            return Ok(());
        }
        let flagged = self.rekey_requested.swap(false, Ordering::Relaxed);
        let due = self
            .crypto
            .as_ref()
            .is_some_and(|c| c.needs_rekey(self.ctx.config.key_rotation_interval(), self.now()));
        if !(flagged || due) {
            return Ok(());
        }

        let exchange = KeyExchange::generate();
        let record = Record::Rekey(RekeyPhase::Init {
            public_key: exchange.public_key(),
        });
        self.pending_rekey = Some(exchange);
        self.outbound.push_control(record);
        debug!(session = self.id, "rekey initiated");
        Ok(())
    }

    fn handle_rekey(&mut self, phase: RekeyPhase) -> Result<(), DisconnectCause> {
        match phase {
            // Peer initiates: respond with a fresh key and contribution,
            // switch epochs, and await the confirm.
            RekeyPhase::Init { public_key: initiator_pub } => {
                let exchange = KeyExchange::generate();
                let responder_pub = exchange.public_key();
                let (sealed, keys) = exchange.respond(&initiator_pub).map_err(|e| {
                    warn!(session = self.id, error = %e, "rekey response failed");
                    DisconnectCause::Integrity
                })?;

                let now = self.now();
                self.crypto_mut()?.install(keys, now);
                self.stats.mark_keys_installed(self.ctx.epoch, now);
                self.pending_confirm = Some((initiator_pub, responder_pub));

                self.outbound.push_control(Record::Rekey(RekeyPhase::Response {
                    public_key: responder_pub,
                    contribution: sealed,
                }));
                Ok(())
            },
            // Peer answered our init: derive, confirm under the new keys,
            // and switch epochs.
            RekeyPhase::Response {
                public_key: responder_pub,
                contribution,
            } => {
                let Some(exchange) = self.pending_rekey.take() else {
                    debug!(session = self.id, "unsolicited rekey response");
                    return Err(DisconnectCause::Protocol);
                };
                let initiator_pub = exchange.public_key();
                let keys = exchange.complete(&responder_pub, &contribution).map_err(|e| {
                    warn!(session = self.id, error = %e, "rekey completion failed");
                    DisconnectCause::Integrity
                })?;
                let confirm =
                    keys.transcript_mac(TranscriptLabel::Rekey, &initiator_pub, &responder_pub);

                let now = self.now();
                self.crypto_mut()?.install(keys, now);
                self.stats.mark_keys_installed(self.ctx.epoch, now);
                self.ctx.metrics.rekey_completed();
                info!(session = self.id, "rekey complete (initiator)");

                self.outbound
                    .push_control(Record::Rekey(RekeyPhase::Confirm { mac: confirm }));
                Ok(())
            },
            RekeyPhase::Confirm { mac } => {
                let Some((initiator_pub, responder_pub)) = self.pending_confirm.take() else {
                    debug!(session = self.id, "unsolicited rekey confirm");
                    return Err(DisconnectCause::Protocol);
                };
                let Some(crypto) = self.crypto.as_ref() else {
                    warn!(session = self.id, "ready session without crypto state");
                    return Err(DisconnectCause::Internal);
                };
                if !crypto.keys().verify_transcript_mac(
                    TranscriptLabel::Rekey,
                    &initiator_pub,
                    &responder_pub,
                    &mac,
                ) {
                    warn!(session = self.id, "rekey confirm failed verification");
                    return Err(DisconnectCause::Integrity);
                }
                self.ctx.metrics.rekey_completed();
                info!(session = self.id, "rekey complete (responder)");
                Ok(())
            },
        }
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    async fn write_outbound(&mut self, item: OutboundItem) -> Result<(), DisconnectCause> {
        match item {
            // Control records bypass the rate gate: they are never
            // dropped and never parked behind a drained bucket.
            OutboundItem::Control(record) => self.send_record(&record).await,
            OutboundItem::Chat(frame) => {
                let plain = frame.encode();
                let wire_len = (plain.len() + CIPHER_OVERHEAD) as u64;

                // Park until both buckets can pay for the frame.
                loop {
                    let Some(delay) = self.limiter.admit_outbound(wire_len, self.now()) else {
                        break;
                    };
                    tokio::select! {
                        () = self.cancel.cancelled() => return Err(self.requested_cause()),
                        () = tokio::time::sleep(delay) => {},
                    }
                }

                let session = self.id;
                let sealed = self.crypto_mut()?.seal(&plain).map_err(|e| {
                    warn!(session, error = %e, "sealing failed");
                    DisconnectCause::Internal
                })?;
                self.send_record(&Record::Cipher(sealed)).await
            },
        }
    }

    /// Writes one record with the stall deadline applied. A peer that
    /// cannot drain its socket for the full deadline is cut off.
    async fn send_record(&mut self, record: &Record) -> Result<(), DisconnectCause> {
        let payload = record.encode();
        let len = payload.len();
        let stall = self.ctx.config.stall_timeout();

        match tokio::time::timeout(stall, self.framed.send(payload)).await {
            Err(_) => {
                warn!(session = self.id, record = record.name(), "write stalled past deadline");
                Err(DisconnectCause::Backpressure)
            },
            Ok(Err(e)) => {
                debug!(session = self.id, error = %e, "write failed");
                Err(DisconnectCause::PeerVanished)
            },
            Ok(Ok(())) => {
                self.stats.frames_tx.fetch_add(1, Ordering::Relaxed);
                self.stats.bytes_tx.fetch_add(len as u64, Ordering::Relaxed);
                self.ctx.metrics.frame_out(len);
                Ok(())
            },
        }
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Drains, notifies, unregisters, and counts the close. The crypto
    /// session (and with it all key material) drops here.
    async fn finish(&mut self, cause: DisconnectCause) {
        // The reaper may have removed a cancelled session already; only
        // the side that actually removes the entry adjusts the gauge.
        if self.registered && self.ctx.router.unregister(self.id).is_some() {
            self.ctx.metrics.session_unregistered();
        }
        self.outbound.close();

        if self.phase != SessionPhase::Closed {
            // Phase bookkeeping only; errors here would mean a driver bug
            // and the socket is closing either way.
            if let Ok(next) = self.phase.advance_to_draining() {
                self.phase = next;
            }
        }

        let deadline = tokio::time::Instant::now() + DRAIN_DEADLINE;

        // Flush what the peer is still owed, unless key material is
        // suspect or the transport is already gone.
        let flush = !matches!(
            cause,
            DisconnectCause::Integrity | DisconnectCause::PeerVanished
        );
        if flush && self.crypto.is_some() {
            while let Some(item) = self.outbound.try_pop() {
                match tokio::time::timeout_at(deadline, self.write_outbound(item)).await {
                    Ok(Ok(())) => {},
                    // Deadline hit or the write failed; stop flushing.
                    _ => break,
                }
            }
        }

        if let Some(reason) = cause.wire_reason() {
            let close = Record::Close(reason);
            let _ = tokio::time::timeout_at(deadline, self.framed.send(close.encode())).await;
        }
        let _ = tokio::time::timeout_at(deadline, SinkExt::<bytes::Bytes>::close(&mut self.framed)).await;

        if let Ok(next) = self.phase.advance_to_closed() {
            self.phase = next;
        }
        self.ctx.metrics.session_closed(cause.label());
        info!(
            session = self.id,
            peer = %self.peer_addr,
            cause = cause.label(),
            frames_rx = self.stats.frames_rx.load(Ordering::Relaxed),
            frames_tx = self.stats.frames_tx.load(Ordering::Relaxed),
            "session closed"
        );
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn note_inbound(&mut self, len: usize) {
        self.stats.frames_rx.fetch_add(1, Ordering::Relaxed);
        self.stats.bytes_rx.fetch_add(len as u64, Ordering::Relaxed);
        self.stats.touch(self.ctx.epoch, self.now());
        self.ctx.metrics.frame_in(len);
    }

    fn protocol_fault(&self, error: &ProtocolError) -> DisconnectCause {
        debug!(session = self.id, error = %error, "protocol fault");
        DisconnectCause::Protocol
    }

    fn map_read_error(&self, error: &ProtocolError) -> DisconnectCause {
        match error {
            ProtocolError::Io(_) => DisconnectCause::PeerVanished,
            other => self.protocol_fault(other),
        }
    }

    fn advance(&mut self, to: SessionPhase) -> Result<(), DisconnectCause> {
        let next = match to {
            SessionPhase::AwaitingAuth => self.phase.advance_to_awaiting_auth(),
            SessionPhase::Ready => self.phase.advance_to_ready(),
            SessionPhase::Draining => self.phase.advance_to_draining(),
            SessionPhase::Closed => self.phase.advance_to_closed(),
            SessionPhase::Handshake => {
                return Err(DisconnectCause::Internal);
            },
        };
        match next {
            Ok(phase) => {
                self.phase = phase;
                Ok(())
            },
            Err(e) => {
                warn!(session = self.id, error = %e, "phase machine violation");
                Err(DisconnectCause::Internal)
            },
        }
    }
}

/// Wall-clock milliseconds for server-generated chat frames. Informational
/// only; ordering and replay protection never depend on it.
fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
