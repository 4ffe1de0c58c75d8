//! End-to-end chat flows over real loopback connections.

mod common;

use palaver_core::chat::ChatKind;
use palaver_core::config::Config;
use palaver_core::error::CloseReason;

use common::{TestClient, TestServer};

#[tokio::test]
async fn two_clients_exchange_text() {
    let server = TestServer::start(Config::default()).await;

    let mut alice = TestClient::ready(server.addr, "alice", "T1").await;
    let mut bob = TestClient::ready(server.addr, "bob", "T2").await;

    alice.send_chat(ChatKind::Text, b"hello").await;

    let received = bob.recv_chat().await;
    assert_eq!(received.kind, ChatKind::Text);
    assert_eq!(received.body_text().unwrap(), "hello");

    // Reply flows the other way.
    bob.send_chat(ChatKind::Text, b"hi alice").await;
    let reply = alice.recv_chat().await;
    assert_eq!(reply.body_text().unwrap(), "hi alice");

    server.stop().await;
}

#[tokio::test]
async fn broadcast_reaches_every_peer_but_the_sender() {
    let server = TestServer::start(Config::default()).await;

    let mut alice = TestClient::ready(server.addr, "alice", "T1").await;
    let mut bob = TestClient::ready(server.addr, "bob", "T2").await;

    alice.send_chat(ChatKind::Text, b"fan out").await;
    assert_eq!(bob.recv_chat().await.body_text().unwrap(), "fan out");

    // The sender must not see an echo: the next frame Alice receives is
    // her own user-list response, not the broadcast.
    alice.send_chat(ChatKind::UserListRequest, b"").await;
    let response = alice.recv_chat().await;
    assert_eq!(response.kind, ChatKind::UserListResponse);

    server.stop().await;
}

#[tokio::test]
async fn user_list_reflects_registered_sessions() {
    let server = TestServer::start(Config::default()).await;

    let mut alice = TestClient::ready(server.addr, "alice", "T1").await;
    let _bob = TestClient::ready(server.addr, "bob", "T2").await;

    alice.send_chat(ChatKind::UserListRequest, b"").await;
    let response = alice.recv_chat().await;
    assert_eq!(response.kind, ChatKind::UserListResponse);

    let names: Vec<String> = serde_json::from_slice(&response.body).unwrap();
    assert_eq!(names, vec!["alice".to_string(), "bob".to_string()]);

    server.stop().await;
}

#[tokio::test]
async fn typing_indicators_are_forwarded() {
    let server = TestServer::start(Config::default()).await;

    let mut alice = TestClient::ready(server.addr, "alice", "T1").await;
    let mut bob = TestClient::ready(server.addr, "bob", "T2").await;

    alice.send_chat(ChatKind::Typing, &[1]).await;
    let seen = bob.recv_chat().await;
    assert_eq!(seen.kind, ChatKind::Typing);
    assert_eq!(seen.body, vec![1]);

    server.stop().await;
}

#[tokio::test]
async fn read_receipts_carry_the_original_message_id() {
    let server = TestServer::start(Config::default()).await;

    let mut alice = TestClient::ready(server.addr, "alice", "T1").await;
    let mut bob = TestClient::ready(server.addr, "bob", "T2").await;

    alice.send_chat(ChatKind::Text, b"read me").await;
    let message = bob.recv_chat().await;

    bob.send_chat(ChatKind::ReadReceipt, &message.message_id).await;
    let receipt = alice.recv_chat().await;
    assert_eq!(receipt.kind, ChatKind::ReadReceipt);
    assert_eq!(receipt.body, message.message_id.to_vec());

    server.stop().await;
}

#[tokio::test]
async fn logout_is_acked_and_frees_the_slot() {
    let server = TestServer::start(Config::default()).await;

    let mut alice = TestClient::ready(server.addr, "alice", "T1").await;
    let mut bob = TestClient::ready(server.addr, "bob", "T2").await;

    assert_eq!(alice.logout().await, CloseReason::Normal);

    // Bob is unaffected and the registry no longer lists alice.
    bob.send_chat(ChatKind::UserListRequest, b"").await;
    let response = bob.recv_chat().await;
    let names: Vec<String> = serde_json::from_slice(&response.body).unwrap();
    assert_eq!(names, vec!["bob".to_string()]);

    server.stop().await;
}

#[tokio::test]
async fn frame_counters_move() {
    let server = TestServer::start(Config::default()).await;

    let mut alice = TestClient::ready(server.addr, "alice", "T1").await;
    let mut bob = TestClient::ready(server.addr, "bob", "T2").await;
    alice.send_chat(ChatKind::Text, b"count me").await;
    bob.recv_chat().await;

    let text = server.registry.encode_text().unwrap();
    assert!(text.contains("palaver_frames_total"));
    assert!(text.contains(r#"direction="in""#));
    assert!(text.contains(r#"direction="out""#));

    server.stop().await;
}
