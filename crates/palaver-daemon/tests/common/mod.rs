//! Test harness: an in-process daemon plus a protocol-complete client.

// Each test binary uses a different slice of the harness.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use palaver_core::auth::{AuthOutcome, MemoryAuthStore};
use palaver_core::chat::{ChatFrame, ChatKind};
use palaver_core::clock::SystemClock;
use palaver_core::config::Config;
use palaver_core::crypto::{CryptoSession, KeyExchange, TranscriptLabel};
use palaver_core::error::CloseReason;
use palaver_core::framing::RecordCodec;
use palaver_core::record::{Record, RekeyPhase, PUBLIC_KEY_LEN};
use palaver_daemon::{MetricsRegistry, Server, ServerDeps};

/// Read timeout applied to every client-side await.
pub const READ_TIMEOUT: Duration = Duration::from_secs(10);

/// A running daemon bound to an ephemeral loopback port.
pub struct TestServer {
    pub addr: SocketAddr,
    pub registry: Arc<MetricsRegistry>,
    pub shutdown: CancellationToken,
    pub task: JoinHandle<()>,
}

impl TestServer {
    /// Starts a daemon with the given config. Users `alice`/`bob` (ids 1
    /// and 2) are seeded with password `secret` and tokens `T1`/`T2`.
    pub async fn start(mut config: Config) -> Self {
        config.server.bind_address = "127.0.0.1".to_string();
        config.server.port = 0;
        config.monitoring.enable_metrics = false;

        let store = MemoryAuthStore::new(3600)
            .with_user(1, "alice", "secret")
            .with_user(2, "bob", "secret");
        store.issue_token(1, "T1");
        store.issue_token(2, "T2");

        let server = Server::bind(
            config,
            ServerDeps {
                auth_store: Arc::new(store),
                history: None,
                clock: Arc::new(SystemClock),
            },
        )
        .expect("server binds");

        let addr = server.local_addr().expect("bound addr");
        let registry = server.metrics_registry();
        let shutdown = server.shutdown_token();
        let task = tokio::spawn(server.run());

        Self {
            addr,
            registry,
            shutdown,
            task,
        }
    }

    /// Cancels the daemon and waits for it to stop.
    pub async fn stop(self) {
        self.shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(10), self.task)
            .await
            .expect("daemon should stop")
            .expect("daemon task should not panic");
    }
}

/// Wall-clock milliseconds for client-composed chat frames.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Protocol-complete test client.
pub struct TestClient {
    framed: Framed<TcpStream, RecordCodec>,
    crypto: Option<CryptoSession>,
    /// Transcript of a rekey this client responded to, awaiting confirm.
    pending_confirm: Option<([u8; PUBLIC_KEY_LEN], [u8; PUBLIC_KEY_LEN])>,
    /// Completed rekeys observed by this client.
    pub rekeys_seen: usize,
}

impl TestClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect");
        Self {
            framed: Framed::new(stream, RecordCodec::default()),
            crypto: None,
            pending_confirm: None,
            rekeys_seen: 0,
        }
    }

    /// Reads and decodes the next record.
    pub async fn recv_record(&mut self) -> Record {
        let payload = tokio::time::timeout(READ_TIMEOUT, self.framed.next())
            .await
            .expect("read timed out")
            .expect("connection open")
            .expect("frame decodes");
        Record::decode(&payload).expect("record decodes")
    }

    pub async fn send_record(&mut self, record: &Record) {
        self.framed.send(record.encode()).await.expect("send");
    }

    /// Client half of the key exchange.
    pub async fn handshake(&mut self) {
        let Record::HandshakeHello {
            public_key: server_pub,
            contribution: None,
        } = self.recv_record().await
        else {
            panic!("expected server hello");
        };

        let exchange = KeyExchange::generate();
        let client_pub = exchange.public_key();
        let (sealed, keys) = exchange.respond(&server_pub).expect("respond");
        self.send_record(&Record::HandshakeHello {
            public_key: client_pub,
            contribution: Some(sealed),
        })
        .await;

        let Record::HandshakeFinish { mac } = self.recv_record().await else {
            panic!("expected handshake finish");
        };
        assert!(
            keys.verify_transcript_mac(TranscriptLabel::Handshake, &server_pub, &client_pub, &mac),
            "finish MAC must verify"
        );
        self.crypto = Some(CryptoSession::new(keys, Instant::now()));
    }

    pub async fn login(&mut self, body: &str) -> AuthOutcome {
        self.send_record(&Record::AuthRequest(bytes::Bytes::copy_from_slice(
            body.as_bytes(),
        )))
        .await;
        let Record::AuthResponse(response) = self.recv_record().await else {
            panic!("expected auth response");
        };
        serde_json::from_slice(&response).expect("auth outcome decodes")
    }

    /// Connects, handshakes, and logs in with a token in one step.
    pub async fn ready(addr: SocketAddr, user: &str, token: &str) -> Self {
        let mut client = Self::connect(addr).await;
        client.handshake().await;
        let outcome = client
            .login(&format!(r#"{{"user":"{user}","token":"{token}"}}"#))
            .await;
        assert!(
            matches!(outcome, AuthOutcome::Ok { .. }),
            "login should succeed, got {outcome:?}"
        );
        client
    }

    pub fn crypto(&mut self) -> &mut CryptoSession {
        self.crypto.as_mut().expect("handshake completed")
    }

    pub async fn send_chat(&mut self, kind: ChatKind, body: &[u8]) {
        let frame = ChatFrame::new(kind, unix_millis(), body.to_vec()).expect("chat frame");
        self.send_chat_frame(&frame).await;
    }

    pub async fn send_chat_frame(&mut self, frame: &ChatFrame) {
        let sealed = self.crypto().seal(&frame.encode()).expect("seal");
        self.send_record(&Record::Cipher(sealed)).await;
    }

    /// Reads until a chat frame arrives, transparently participating in
    /// any rekey the server initiates. Panics on a Close record.
    pub async fn recv_chat(&mut self) -> ChatFrame {
        loop {
            match self.recv_record().await {
                Record::Cipher(frame) => {
                    let plain = self.crypto().open(&frame).expect("open");
                    return ChatFrame::decode(&plain).expect("chat decodes");
                },
                Record::Rekey(phase) => self.handle_rekey(phase).await,
                Record::Keepalive => {},
                Record::Close(reason) => panic!("unexpected close: {reason}"),
                other => panic!("unexpected record: {}", other.name()),
            }
        }
    }

    /// Reads until a Close record arrives and returns its reason,
    /// draining anything queued ahead of it.
    pub async fn recv_close(&mut self) -> CloseReason {
        loop {
            match self.recv_record().await {
                Record::Close(reason) => return reason,
                Record::Rekey(phase) => self.handle_rekey(phase).await,
                _ => {},
            }
        }
    }

    /// Handles a server-driven rekey phase, replying as the responder.
    pub async fn handle_rekey(&mut self, phase: RekeyPhase) {
        match phase {
            RekeyPhase::Init { public_key: initiator_pub } => {
                let exchange = KeyExchange::generate();
                let responder_pub = exchange.public_key();
                let (sealed, keys) = exchange.respond(&initiator_pub).expect("rekey respond");
                self.crypto().install(keys, Instant::now());
                self.pending_confirm = Some((initiator_pub, responder_pub));
                self.send_record(&Record::Rekey(RekeyPhase::Response {
                    public_key: responder_pub,
                    contribution: sealed,
                }))
                .await;
            },
            RekeyPhase::Confirm { mac } => {
                let (initiator_pub, responder_pub) =
                    self.pending_confirm.take().expect("confirm only after init");
                assert!(
                    self.crypto().keys().verify_transcript_mac(
                        TranscriptLabel::Rekey,
                        &initiator_pub,
                        &responder_pub,
                        &mac,
                    ),
                    "rekey confirm MAC must verify"
                );
                self.rekeys_seen += 1;
            },
            RekeyPhase::Response { .. } => panic!("server never responds to a client rekey here"),
        }
    }

    /// Runs a client-initiated rekey to completion.
    ///
    /// Call only when no other traffic is in flight toward this client;
    /// the next record is expected to be the server's response.
    pub async fn initiate_rekey(&mut self) {
        let exchange = KeyExchange::generate();
        let initiator_pub = exchange.public_key();
        self.send_record(&Record::Rekey(RekeyPhase::Init {
            public_key: initiator_pub,
        }))
        .await;

        let Record::Rekey(RekeyPhase::Response {
            public_key: responder_pub,
            contribution,
        }) = self.recv_record().await
        else {
            panic!("expected rekey response");
        };

        let keys = exchange
            .complete(&responder_pub, &contribution)
            .expect("rekey completes");
        let confirm = keys.transcript_mac(TranscriptLabel::Rekey, &initiator_pub, &responder_pub);
        self.crypto().install(keys, Instant::now());
        self.send_record(&Record::Rekey(RekeyPhase::Confirm { mac: confirm }))
            .await;
        self.rekeys_seen += 1;
    }

    pub async fn logout(&mut self) -> CloseReason {
        self.send_record(&Record::Close(CloseReason::Normal)).await;
        self.recv_close().await
    }
}
