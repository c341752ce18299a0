//! Integration tests for the session lifecycle.
//!
//! Drives real consumers through the in-process harness: login, keepalive,
//! per-user connection limits, room presence and the admin control events.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::time::Duration;

use live_server::admin::{list_connections, send_control, ControlAction};
use live_test_utils::{TestLiveServer, TestRoomBuilder, TestTokenBuilder, TestWorldBuilder};
use serde_json::json;

const QUIET: Duration = Duration::from_millis(300);

// ============================================================================
// Login and keepalive
// ============================================================================

#[tokio::test]
async fn test_anonymous_login_then_ping() {
    let server = TestLiveServer::spawn(TestWorldBuilder::new().build()).await;
    let mut client = server.connect().await;

    let hello = client.authenticate_anonymous("4").await;
    assert_eq!(hello["user"]["kind"], json!("anonymous"));
    assert!(hello["world.config"].is_object());
    assert_eq!(hello["rooms"], json!([]));
    assert_eq!(hello["chat.channels"], json!([]));
    assert_eq!(hello["chat.read_pointers"], json!({}));

    client.send(json!(["ping", 1])).await;
    assert_eq!(client.recv().await, json!(["pong", 1]));

    client.close().await;
}

#[tokio::test]
async fn test_anonymous_login_reuses_user() {
    let server = TestLiveServer::spawn(TestWorldBuilder::new().build()).await;
    let mut first = server.connect().await;
    let mut second = server.connect().await;

    let a = first.authenticate_anonymous("browser-1").await;
    let b = second.authenticate_anonymous("browser-1").await;
    assert_eq!(a["user"]["id"], b["user"]["id"]);
}

#[tokio::test]
async fn test_anonymous_login_refused_when_disabled() {
    let server =
        TestLiveServer::spawn(TestWorldBuilder::new().allow_anonymous(false).build()).await;
    let mut client = server.connect().await;

    client
        .send(json!(["authenticate", 7, {"client_id": "4"}]))
        .await;
    assert_eq!(
        client.recv().await,
        json!(["error", 7, {"code": "auth.denied"}])
    );

    // Still unauthenticated afterwards.
    assert_eq!(
        client.call_err("room.enter", json!({})).await,
        "protocol.unauthenticated"
    );
}

#[tokio::test]
async fn test_token_login_and_secrets_visibility() {
    let server = TestLiveServer::spawn(TestWorldBuilder::new().build()).await;

    let mut attendee = server.connect().await;
    let hello = attendee
        .authenticate_token(&TestTokenBuilder::new("alice").with_display_name("Alice").sign())
        .await;
    assert_eq!(hello["user"]["kind"], json!("person"));
    assert_eq!(hello["user"]["profile"]["display_name"], json!("Alice"));
    assert!(hello["world.config"]["jwt_secrets"][0].get("secret").is_none());

    let mut admin = server.connect().await;
    let hello = admin
        .authenticate_token(&TestTokenBuilder::new("root").with_traits(&["admin"]).sign())
        .await;
    assert!(hello["world.config"]["jwt_secrets"][0]
        .get("secret")
        .is_some());
}

#[tokio::test]
async fn test_expired_token_rejected() {
    let server = TestLiveServer::spawn(TestWorldBuilder::new().build()).await;
    let mut client = server.connect().await;
    let token = TestTokenBuilder::new("alice").expires_in(-3600).sign();

    client.send(json!(["authenticate", 1, {"token": token}])).await;
    assert_eq!(
        client.recv().await,
        json!(["error", 1, {"code": "auth.invalid_token"}])
    );
}

#[tokio::test]
async fn test_rooms_listed_by_visibility() {
    let world = TestWorldBuilder::new()
        .role("attendee", &["room:view"])
        .grant("attendee", &[])
        .build();
    let server = TestLiveServer::spawn(world).await;
    let visible = server.add_room(TestRoomBuilder::new("Stage").build()).await;
    let hidden = server
        .add_room(
            TestRoomBuilder::new("Backstage")
                .grant("attendee", &["speaker"])
                .build(),
        )
        .await;
    server
        .add_room(TestRoomBuilder::new("Gone").deleted().build())
        .await;

    let mut client = server.connect().await;
    let hello = client.authenticate_anonymous("4").await;
    let ids: Vec<_> = hello["rooms"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["id"].clone())
        .collect();
    assert_eq!(ids, vec![json!(visible.id)]);
    assert!(!ids.contains(&json!(hidden.id)));
}

// ============================================================================
// Connection limits
// ============================================================================

#[tokio::test]
async fn test_connection_limit_replaces_older_session() {
    let server =
        TestLiveServer::spawn(TestWorldBuilder::new().connection_limit(1).build()).await;

    let mut a = server.connect().await;
    a.authenticate_anonymous("same").await;

    let mut b = server.connect().await;
    b.authenticate_anonymous("same").await;

    assert_eq!(
        a.recv().await,
        json!(["error", {"code": "connection.replaced"}])
    );
    a.expect_closed().await;

    b.send(json!(["ping", 2])).await;
    assert_eq!(b.recv().await, json!(["pong", 2]));
    assert_eq!(server.connection_count().await, 1);
}

#[tokio::test]
async fn test_connection_limit_counts_per_user() {
    let server =
        TestLiveServer::spawn(TestWorldBuilder::new().connection_limit(1).build()).await;

    let mut a = server.connect().await;
    a.authenticate_anonymous("first").await;
    let mut b = server.connect().await;
    b.authenticate_anonymous("second").await;

    a.expect_silence(QUIET).await;
    assert_eq!(server.connection_count().await, 2);
}

#[tokio::test]
async fn test_admins_are_not_limited() {
    let server =
        TestLiveServer::spawn(TestWorldBuilder::new().connection_limit(1).build()).await;
    let token = TestTokenBuilder::new("root").with_traits(&["admin"]).sign();

    let mut a = server.connect().await;
    a.authenticate_token(&token).await;
    let mut b = server.connect().await;
    b.authenticate_token(&token).await;

    a.expect_silence(QUIET).await;
    a.send(json!(["ping", 1])).await;
    assert_eq!(a.recv().await, json!(["pong", 1]));
}

// ============================================================================
// Room presence
// ============================================================================

#[tokio::test]
async fn test_room_leave_is_idempotent_and_ends_view() {
    let world = TestWorldBuilder::new()
        .role("attendee", &["room:view"])
        .grant("attendee", &[])
        .build();
    let server = TestLiveServer::spawn(world).await;
    let room = server.add_room(TestRoomBuilder::new("Stage").build()).await;

    let mut client = server.connect().await;
    client.authenticate_anonymous("4").await;
    client.call("room.enter", json!({"room": room.id})).await;

    let views = server.repository().room_views(room.id).await;
    assert_eq!(views.len(), 1);
    assert!(views.first().unwrap().end.is_none());

    client.call("room.leave", json!({"room": room.id})).await;
    client.call("room.leave", json!({"room": room.id})).await;

    let views = server.repository().room_views(room.id).await;
    assert_eq!(views.len(), 1);
    assert!(views.first().unwrap().end.is_some());
}

#[tokio::test]
async fn test_disconnect_ends_open_views() {
    let world = TestWorldBuilder::new()
        .role("attendee", &["room:view"])
        .grant("attendee", &[])
        .build();
    let server = TestLiveServer::spawn(world).await;
    let room = server.add_room(TestRoomBuilder::new("Stage").build()).await;

    let mut client = server.connect().await;
    client.authenticate_anonymous("4").await;
    client.call("room.enter", json!({"room": room.id})).await;
    client.close().await;

    let views = server.repository().room_views(room.id).await;
    assert!(views.iter().all(|v| v.end.is_some()));
    assert_eq!(server.connection_count().await, 0);
}

#[tokio::test]
async fn test_enter_unknown_room() {
    let server = TestLiveServer::spawn(TestWorldBuilder::new().build()).await;
    let mut client = server.connect().await;
    client.authenticate_anonymous("4").await;

    assert_eq!(
        client
            .call_err("room.enter", json!({"room": uuid::Uuid::new_v4()}))
            .await,
        "room.unknown"
    );
    assert_eq!(
        client.call_err("room.enter", json!({})).await,
        "protocol.malformed"
    );
}

// ============================================================================
// Admin control events
// ============================================================================

#[tokio::test]
async fn test_drop_closes_every_matching_connection() {
    let server = TestLiveServer::spawn(TestWorldBuilder::new().build()).await;
    let mut a = server.connect().await;
    let mut b = server.connect().await;
    a.authenticate_anonymous("a").await;

    let state = server.state();
    let counts = list_connections(&state.registry).await.unwrap();
    assert_eq!(counts.get("testcommit.test"), Some(&2));

    let notified = send_control(
        &state.registry,
        &state.layer,
        &["testcommit.*".to_string()],
        ControlAction::Drop,
        Duration::ZERO,
    )
    .await
    .unwrap();
    assert_eq!(notified, 2);

    a.expect_closed().await;
    b.expect_closed().await;
    assert_eq!(server.connection_count().await, 0);
}

#[tokio::test]
async fn test_non_matching_pattern_leaves_connections() {
    let server = TestLiveServer::spawn(TestWorldBuilder::new().build()).await;
    let mut client = server.connect().await;

    let state = server.state();
    let notified = send_control(
        &state.registry,
        &state.layer,
        &["*.production".to_string()],
        ControlAction::Drop,
        Duration::ZERO,
    )
    .await
    .unwrap();
    assert_eq!(notified, 0);

    client.send(json!(["ping", 1])).await;
    assert_eq!(client.recv().await, json!(["pong", 1]));
}

#[tokio::test]
async fn test_force_reload_notifies_then_closes() {
    let server = TestLiveServer::spawn(TestWorldBuilder::new().build()).await;
    let mut client = server.connect().await;

    let state = server.state();
    send_control(
        &state.registry,
        &state.layer,
        &[],
        ControlAction::Reload,
        Duration::ZERO,
    )
    .await
    .unwrap();

    assert_eq!(client.recv().await, json!(["connection.reload", {}]));
    client.expect_closed().await;
}
