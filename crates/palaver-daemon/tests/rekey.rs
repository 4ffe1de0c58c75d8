//! Mid-session key rotation driven by the server.

mod common;

use std::time::Duration;

use palaver_core::chat::ChatKind;
use palaver_core::config::Config;

use common::{TestClient, TestServer};

#[tokio::test]
async fn stale_keys_are_rotated_and_chat_continues() {
    let mut config = Config::default();
    // Expire keys almost immediately so the rotation happens in-test.
    config.security.key_rotation_interval_sec = 1;
    let server = TestServer::start(config).await;

    let mut alice = TestClient::ready(server.addr, "alice", "T1").await;
    let mut bob = TestClient::ready(server.addr, "bob", "T2").await;

    // Traffic before the rotation.
    alice.send_chat(ChatKind::Text, b"old epoch").await;
    assert_eq!(bob.recv_chat().await.body_text().unwrap(), "old epoch");

    // Let the rotation trigger fire on both connections.
    tokio::time::sleep(Duration::from_millis(2500)).await;

    // Both directions still work; the clients participate in the rekey
    // sub-exchange transparently inside recv_chat.
    alice.send_chat(ChatKind::Text, b"across the rekey").await;
    assert_eq!(bob.recv_chat().await.body_text().unwrap(), "across the rekey");

    bob.send_chat(ChatKind::Text, b"and back").await;
    assert_eq!(alice.recv_chat().await.body_text().unwrap(), "and back");

    // Drive the connections a little longer so the Confirm records (sent
    // after each Response) are observed and verified.
    alice.send_chat(ChatKind::UserListRequest, b"").await;
    alice.recv_chat().await;
    bob.send_chat(ChatKind::UserListRequest, b"").await;
    bob.recv_chat().await;

    assert!(
        alice.rekeys_seen >= 1 || bob.rekeys_seen >= 1,
        "at least one rekey must have completed (alice {}, bob {})",
        alice.rekeys_seen,
        bob.rekeys_seen
    );

    let text = server.registry.encode_text().unwrap();
    assert!(text.contains("palaver_rekeys_total"));

    server.stop().await;
}

#[tokio::test]
async fn client_may_initiate_a_rekey() {
    let server = TestServer::start(Config::default()).await;

    let mut alice = TestClient::ready(server.addr, "alice", "T1").await;
    let mut bob = TestClient::ready(server.addr, "bob", "T2").await;

    alice.initiate_rekey().await;

    // The new epoch carries traffic both ways.
    alice.send_chat(ChatKind::Text, b"fresh keys").await;
    assert_eq!(bob.recv_chat().await.body_text().unwrap(), "fresh keys");

    bob.send_chat(ChatKind::Text, b"ack").await;
    assert_eq!(alice.recv_chat().await.body_text().unwrap(), "ack");

    server.stop().await;
}
