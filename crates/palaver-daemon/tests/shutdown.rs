//! Graceful shutdown: every session is notified, drained, and counted.

mod common;

use std::time::Duration;

use palaver_core::config::Config;
use palaver_core::error::CloseReason;

use common::{TestClient, TestServer};

#[tokio::test]
async fn shutdown_notifies_and_drains_every_session() {
    let mut config = Config::default();
    config.server.graceful_shutdown_sec = 5;
    let server = TestServer::start(config).await;

    let mut clients = Vec::new();
    for (user, token) in [("alice", "T1"), ("bob", "T2")] {
        clients.push(TestClient::ready(server.addr, user, token).await);
    }

    server.shutdown.cancel();

    // Every connected session receives a close with the server category.
    for client in &mut clients {
        assert_eq!(client.recv_close().await, CloseReason::Server);
    }

    tokio::time::timeout(Duration::from_secs(10), server.task)
        .await
        .expect("daemon must stop within the deadline")
        .expect("daemon task must not panic");

    let text = server.registry.encode_text().unwrap();
    assert!(text.contains(r#"palaver_session_closes_total{reason="shutdown"} 2"#));
}

#[tokio::test]
async fn shutdown_with_no_sessions_is_immediate() {
    let server = TestServer::start(Config::default()).await;
    let started = std::time::Instant::now();
    server.stop().await;
    assert!(
        started.elapsed() < Duration::from_secs(5),
        "an idle daemon should stop promptly"
    );
}

#[tokio::test]
async fn sessions_accepted_before_shutdown_still_drain_cleanly() {
    let server = TestServer::start(Config::default()).await;

    let mut alice = TestClient::ready(server.addr, "alice", "T1").await;

    // A half-set-up connection (no handshake yet) is also torn down.
    let _dangling = tokio::net::TcpStream::connect(server.addr).await.unwrap();

    server.shutdown.cancel();
    assert_eq!(alice.recv_close().await, CloseReason::Server);

    tokio::time::timeout(Duration::from_secs(10), server.task)
        .await
        .expect("daemon must stop")
        .expect("daemon task must not panic");
}
