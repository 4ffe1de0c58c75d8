//! A wedged peer must never stall the rest of the server.

mod common;

use std::time::Duration;

use palaver_core::chat::ChatKind;
use palaver_core::config::Config;
use palaver_core::error::CloseReason;

use common::{TestClient, TestServer};

/// Polls the metrics text until `needle` appears or the deadline lapses.
async fn wait_for_metric(server: &TestServer, needle: &str, deadline: Duration) -> bool {
    let started = std::time::Instant::now();
    while started.elapsed() < deadline {
        let text = server.registry.encode_text().unwrap();
        if text.contains(needle) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    false
}

#[tokio::test]
async fn wedged_peer_is_dropped_without_stalling_the_sender() {
    let mut config = Config::default();
    config.performance.outbound_queue_size = 4;
    config.server.stall_timeout_sec = 1;
    // Keep the rate gate out of the picture; this test is about socket
    // backpressure, not budgets.
    config.rate_limiting.messages_per_second = 100_000;
    config.rate_limiting.burst_size = 100_000;
    config.rate_limiting.bandwidth_limit = 512 * 1024 * 1024;
    let server = TestServer::start(config).await;

    let mut alice = TestClient::ready(server.addr, "alice", "T1").await;
    // Bob authenticates and then never reads again: his socket wedges
    // once the kernel buffers fill.
    let _bob = TestClient::ready(server.addr, "bob", "T2").await;

    // Pump enough volume through the broadcast path to fill Bob's queue
    // and then his socket.
    let blob = vec![0x5Au8; 32 * 1024];
    for _ in 0..256 {
        alice.send_chat(ChatKind::Binary, &blob).await;
    }

    // Bob's session is closed for backpressure; Alice's is untouched.
    assert!(
        wait_for_metric(
            &server,
            r#"palaver_session_closes_total{reason="backpressure"} 1"#,
            Duration::from_secs(15),
        )
        .await,
        "the wedged peer must be closed for backpressure"
    );

    let text = server.registry.encode_text().unwrap();
    assert!(
        text.contains("palaver_broadcast_drops_total"),
        "overflowed broadcasts must be counted"
    );

    // The sender is still live and drains cleanly.
    assert_eq!(alice.logout().await, CloseReason::Normal);

    server.stop().await;
}
