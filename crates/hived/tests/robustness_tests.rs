//! Robustness tests for the module channel.
//!
//! These tests verify the supervisor handles misbehaving modules gracefully:
//! - Malformed and oversize frames
//! - Unknown message kinds
//! - Messages that are illegal in the current state
//! - Garbage before the handshake and rapid connect/disconnect
//! - Many modules connecting at once
//!
//! Tests CAN use `.unwrap()` and `.expect()`.

#![cfg(unix)]

use std::path::PathBuf;
use std::time::Duration;

use hive_core::{ProcessKey, SessionId, SessionState};
use hive_protocol::{
    framed, recv_frame, send_frame, Framed, Handshake, HandshakeReply, PipeMessage, MAX_FRAME_LEN,
};
use hived::registry::{
    spawn_registry, RegistryHandle, RemovalReason, SessionEvent, DEFAULT_PENDING_TIMEOUT,
};
use hived::server::ChannelServer;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

// ============================================================================
// Constants
// ============================================================================

const SOCKET_WAIT_TIMEOUT: Duration = Duration::from_millis(500);
const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(10);
const EVENT_TIMEOUT: Duration = Duration::from_secs(2);

// ============================================================================
// Test Helpers
// ============================================================================

struct TestServer {
    socket_path: PathBuf,
    cancel_token: CancellationToken,
    registry: RegistryHandle,
    _temp_dir: TempDir,
}

impl TestServer {
    async fn spawn() -> Self {
        let temp_dir = tempfile::tempdir().expect("create temp dir");
        let socket_path = temp_dir.path().join("hive.sock");

        let registry = spawn_registry(DEFAULT_PENDING_TIMEOUT);
        let cancel_token = CancellationToken::new();
        let mut server = ChannelServer::bind(socket_path.clone(), registry.clone(), cancel_token.clone())
            .expect("bind channel");

        tokio::spawn(async move {
            let _ = server.run().await;
        });

        let start = tokio::time::Instant::now();
        while start.elapsed() < SOCKET_WAIT_TIMEOUT && !socket_path.exists() {
            sleep(SOCKET_POLL_INTERVAL).await;
        }
        assert!(socket_path.exists(), "Server socket did not appear");

        Self {
            socket_path,
            cancel_token,
            registry,
            _temp_dir: temp_dir,
        }
    }

    async fn connect(&self) -> Framed<UnixStream> {
        framed(UnixStream::connect(&self.socket_path).await.expect("connect"))
    }

    async fn attach(&self, pid: u32) -> (Framed<UnixStream>, SessionId) {
        self.registry
            .register_pending(ProcessKey::new(pid, 1))
            .await
            .expect("register");
        let mut channel = self.connect().await;
        send_frame(&mut channel, &Handshake::new(pid)).await.expect("send handshake");
        match recv_frame::<_, HandshakeReply>(&mut channel).await {
            Ok(Some(HandshakeReply::Welcome { session_id, .. })) => (channel, session_id),
            other => panic!("expected welcome, got {other:?}"),
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

async fn removal_reason(
    events: &mut broadcast::Receiver<SessionEvent>,
    id: &SessionId,
) -> RemovalReason {
    loop {
        let event = timeout(EVENT_TIMEOUT, events.recv())
            .await
            .expect("event in time")
            .expect("event channel open");
        if let SessionEvent::Removed {
            session_id, reason, ..
        } = event
        {
            if session_id == *id {
                return reason;
            }
        }
    }
}

async fn wait_for_state(registry: &RegistryHandle, id: &SessionId, state: SessionState) -> bool {
    let start = tokio::time::Instant::now();
    while start.elapsed() < EVENT_TIMEOUT {
        if registry.get_session(id.clone()).await.map(|s| s.state) == Some(state) {
            return true;
        }
        sleep(SOCKET_POLL_INTERVAL).await;
    }
    false
}

/// Writes a raw length-prefixed body, bypassing message encoding.
async fn write_raw(channel: &mut Framed<UnixStream>, length: u32, body: &[u8]) {
    let stream = channel.get_mut();
    stream.write_all(&length.to_be_bytes()).await.unwrap();
    stream.write_all(body).await.unwrap();
    stream.flush().await.unwrap();
}

// ============================================================================
// Protocol violations
// ============================================================================

#[tokio::test]
async fn test_malformed_json_crashes_the_session() {
    let server = TestServer::spawn().await;
    let mut events = server.registry.subscribe();
    let (mut channel, id) = server.attach(100).await;

    send_frame(&mut channel, &PipeMessage::Loaded).await.unwrap();
    assert!(wait_for_state(&server.registry, &id, SessionState::Loaded).await);

    let body = b"{this is not json";
    write_raw(&mut channel, body.len() as u32, body).await;

    assert_eq!(removal_reason(&mut events, &id).await, RemovalReason::Crashed);
}

#[tokio::test]
async fn test_oversize_length_prefix_crashes_the_session() {
    let server = TestServer::spawn().await;
    let mut events = server.registry.subscribe();
    let (mut channel, id) = server.attach(101).await;

    write_raw(&mut channel, (MAX_FRAME_LEN as u32) * 8, b"").await;

    assert_eq!(removal_reason(&mut events, &id).await, RemovalReason::Crashed);
}

#[tokio::test]
async fn test_unknown_message_kind_crashes_the_session() {
    let server = TestServer::spawn().await;
    let mut events = server.registry.subscribe();
    let (mut channel, id) = server.attach(102).await;

    let body = br#"{"kind":"teleport","zone":"poknowledge"}"#;
    write_raw(&mut channel, body.len() as u32, body).await;

    assert_eq!(removal_reason(&mut events, &id).await, RemovalReason::Crashed);
}

#[tokio::test]
async fn test_garbage_before_handshake_leaves_session_pending() {
    let server = TestServer::spawn().await;
    let id = server
        .registry
        .register_pending(ProcessKey::new(103, 1))
        .await
        .unwrap();

    let mut channel = server.connect().await;
    let body = b"\x00\x01\x02";
    write_raw(&mut channel, body.len() as u32, body).await;

    let closed = timeout(EVENT_TIMEOUT, recv_frame::<_, HandshakeReply>(&mut channel))
        .await
        .unwrap();
    assert!(matches!(closed, Ok(None) | Err(_)));

    let view = server.registry.get_session(id).await.unwrap();
    assert_eq!(view.state, SessionState::Pending);
}

// ============================================================================
// Illegal transitions
// ============================================================================

#[tokio::test]
async fn test_login_before_loaded_is_rejected_without_closing() {
    let server = TestServer::spawn().await;
    let (mut channel, id) = server.attach(200).await;

    send_frame(&mut channel, &PipeMessage::login_char("Early")).await.unwrap();
    send_frame(&mut channel, &PipeMessage::Loaded).await.unwrap();
    assert!(wait_for_state(&server.registry, &id, SessionState::Loaded).await);

    let view = server.registry.get_session(id.clone()).await.unwrap();
    assert_eq!(view.character, None);

    // The channel survived the rejected message.
    send_frame(&mut channel, &PipeMessage::login_char("OnTime")).await.unwrap();
    assert!(wait_for_state(&server.registry, &id, SessionState::LoggedIn).await);
    let view = server.registry.get_session(id).await.unwrap();
    assert_eq!(view.character.as_deref(), Some("OnTime"));
}

#[tokio::test]
async fn test_class_level_before_loaded_is_rejected() {
    let server = TestServer::spawn().await;
    let (mut channel, id) = server.attach(201).await;

    send_frame(
        &mut channel,
        &PipeMessage::ClassLevel {
            class_id: 3,
            level: 50,
        },
    )
    .await
    .unwrap();
    send_frame(&mut channel, &PipeMessage::Loaded).await.unwrap();
    assert!(wait_for_state(&server.registry, &id, SessionState::Loaded).await);

    let view = server.registry.get_session(id).await.unwrap();
    assert_eq!(view.level, None);
}

// ============================================================================
// Load
// ============================================================================

#[tokio::test]
async fn test_rapid_connect_disconnect() {
    let server = TestServer::spawn().await;

    for _ in 0..25 {
        let channel = server.connect().await;
        drop(channel);
    }

    // The server still serves a real module afterwards.
    let (mut channel, id) = server.attach(300).await;
    send_frame(&mut channel, &PipeMessage::Loaded).await.unwrap();
    assert!(wait_for_state(&server.registry, &id, SessionState::Loaded).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_modules_at_once() {
    let server = TestServer::spawn().await;

    let mut channels = Vec::new();
    for pid in 400..416 {
        channels.push(server.attach(pid).await);
    }

    let mut tasks = Vec::new();
    for (mut channel, id) in channels {
        tasks.push(tokio::spawn(async move {
            send_frame(&mut channel, &PipeMessage::Loaded).await.unwrap();
            send_frame(&mut channel, &PipeMessage::login_char(format!("Char{id}")))
                .await
                .unwrap();
            (channel, id)
        }));
    }

    let mut attached = Vec::new();
    for task in tasks {
        attached.push(task.await.unwrap());
    }

    for (_, id) in &attached {
        assert!(wait_for_state(&server.registry, id, SessionState::LoggedIn).await);
        let view = server.registry.get_session(id.clone()).await.unwrap();
        assert_eq!(view.character, Some(format!("Char{id}")));
    }
    assert_eq!(server.registry.snapshot().await.len(), 16);
}
