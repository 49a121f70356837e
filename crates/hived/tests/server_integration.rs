//! Integration tests for the channel server.
//!
//! These tests drive the ChannelServer over real Unix sockets the way an
//! injected module does: handshake, lifecycle messages, dispatched commands,
//! disconnects and supervisor shutdown.
//!
//! Tests CAN use `.unwrap()` and `.expect()`; the panic-free behavior of
//! production code is checked through assertions.

#![cfg(unix)]

use std::path::PathBuf;
use std::time::Duration;

use hive_core::{ProcessKey, SessionId, SessionState, WindowId};
use hive_protocol::{
    framed, recv_frame, send_frame, Framed, Handshake, HandshakeReply, PipeMessage,
    ProtocolVersion,
};
use hived::registry::{
    spawn_registry, DispatchResult, RegistryHandle, RemovalReason, SessionEvent,
    DEFAULT_PENDING_TIMEOUT,
};
use hived::server::{ChannelServer, ServerError};
use tempfile::TempDir;
use tokio::net::UnixStream;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
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
    server_task: JoinHandle<()>,
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

        let server_task = tokio::spawn(async move {
            let _ = server.run().await;
        });

        let start = tokio::time::Instant::now();
        while start.elapsed() < SOCKET_WAIT_TIMEOUT && !socket_path.exists() {
            sleep(SOCKET_POLL_INTERVAL).await;
        }
        assert!(
            socket_path.exists(),
            "Server socket did not appear within {SOCKET_WAIT_TIMEOUT:?}"
        );

        Self {
            socket_path,
            cancel_token,
            registry,
            server_task,
            _temp_dir: temp_dir,
        }
    }

    async fn connect(&self) -> Framed<UnixStream> {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .expect("connect to server");
        framed(stream)
    }

    /// Connects and completes a handshake, returning the attached session.
    async fn attach(&self, handshake: Handshake) -> (Framed<UnixStream>, SessionId) {
        let mut channel = self.connect().await;
        match exchange(&mut channel, &handshake).await {
            HandshakeReply::Welcome { session_id, .. } => (channel, session_id),
            other => panic!("expected welcome, got {other:?}"),
        }
    }

    async fn shutdown(self) {
        self.cancel_token.cancel();
        timeout(EVENT_TIMEOUT, self.server_task)
            .await
            .expect("server stops")
            .expect("server task joins");
    }
}

async fn exchange(channel: &mut Framed<UnixStream>, handshake: &Handshake) -> HandshakeReply {
    send_frame(channel, handshake).await.expect("send handshake");
    timeout(EVENT_TIMEOUT, recv_frame::<_, HandshakeReply>(channel))
        .await
        .expect("reply in time")
        .expect("reply decodes")
        .expect("reply present")
}

async fn next_event(events: &mut broadcast::Receiver<SessionEvent>) -> SessionEvent {
    timeout(EVENT_TIMEOUT, events.recv())
        .await
        .expect("event in time")
        .expect("event channel open")
}

/// Skips events until one matches.
async fn wait_for<F>(events: &mut broadcast::Receiver<SessionEvent>, mut pred: F) -> SessionEvent
where
    F: FnMut(&SessionEvent) -> bool,
{
    loop {
        let event = next_event(events).await;
        if pred(&event) {
            return event;
        }
    }
}

async fn wait_for_removal(
    events: &mut broadcast::Receiver<SessionEvent>,
    id: &SessionId,
) -> RemovalReason {
    match wait_for(events, |e| {
        matches!(e, SessionEvent::Removed { session_id, .. } if session_id == id)
    })
    .await
    {
        SessionEvent::Removed { reason, .. } => reason,
        other => panic!("expected removal, got {other:?}"),
    }
}

async fn state_of(registry: &RegistryHandle, id: &SessionId) -> Option<SessionState> {
    registry.get_session(id.clone()).await.map(|s| s.state)
}

fn key(pid: u32) -> ProcessKey {
    ProcessKey::new(pid, 1_700_000_000)
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn test_full_session_lifecycle() {
    let server = TestServer::spawn().await;
    let mut events = server.registry.subscribe();

    let pending = server.registry.register_pending(key(4242)).await.unwrap();
    let (mut channel, id) = server
        .attach(Handshake::for_process(key(4242)).with_window(WindowId::new(0x1_0042)))
        .await;
    assert_eq!(id, pending);

    send_frame(&mut channel, &PipeMessage::Loaded).await.unwrap();
    wait_for(&mut events, |e| {
        matches!(e, SessionEvent::StateChanged { session, .. } if session.state == SessionState::Loaded)
    })
    .await;

    send_frame(&mut channel, &PipeMessage::login_char("Soandso")).await.unwrap();
    send_frame(
        &mut channel,
        &PipeMessage::ClassLevel {
            class_id: 12,
            level: 60,
        },
    )
    .await
    .unwrap();
    wait_for(&mut events, |e| {
        matches!(e, SessionEvent::Updated { session } if session.level == Some(60))
    })
    .await;

    let view = server.registry.get_session(id.clone()).await.unwrap();
    assert_eq!(view.state, SessionState::LoggedIn);
    assert_eq!(view.character.as_deref(), Some("Soandso"));
    assert_eq!(view.class_id, Some(12));
    assert_eq!(view.window, Some(WindowId::new(0x1_0042)));

    // Supervisor asks for an unload; the module acknowledges.
    assert_eq!(
        server.registry.dispatch(id.clone(), PipeMessage::ForceUnload).await,
        DispatchResult::Sent
    );
    let received = timeout(EVENT_TIMEOUT, recv_frame::<_, PipeMessage>(&mut channel))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, Some(PipeMessage::ForceUnload));
    assert_eq!(state_of(&server.registry, &id).await, Some(SessionState::Unloading));

    send_frame(&mut channel, &PipeMessage::Unloaded).await.unwrap();
    assert_eq!(wait_for_removal(&mut events, &id).await, RemovalReason::Graceful);

    // The supervisor closes its end once the session is gone.
    let after = timeout(EVENT_TIMEOUT, recv_frame::<_, PipeMessage>(&mut channel))
        .await
        .unwrap();
    assert!(matches!(after, Ok(None) | Err(_)));
    assert!(server.registry.snapshot().await.is_empty());

    server.shutdown().await;
}

#[tokio::test]
async fn test_disconnect_without_unload_is_a_crash() {
    let server = TestServer::spawn().await;
    let mut events = server.registry.subscribe();

    server.registry.register_pending(key(10)).await.unwrap();
    let (mut channel, id) = server.attach(Handshake::new(10)).await;
    send_frame(&mut channel, &PipeMessage::Loaded).await.unwrap();
    wait_for(&mut events, |e| matches!(e, SessionEvent::StateChanged { .. })).await;

    drop(channel);

    let crashed = wait_for(&mut events, |e| {
        matches!(e, SessionEvent::StateChanged { session, .. } if session.state == SessionState::Crashed)
    })
    .await;
    assert!(matches!(
        crashed,
        SessionEvent::StateChanged {
            from: SessionState::Loaded,
            ..
        }
    ));
    assert_eq!(wait_for_removal(&mut events, &id).await, RemovalReason::Crashed);

    server.shutdown().await;
}

#[tokio::test]
async fn test_module_initiated_unload() {
    let server = TestServer::spawn().await;
    let mut events = server.registry.subscribe();

    server.registry.register_pending(key(11)).await.unwrap();
    let (mut channel, id) = server.attach(Handshake::new(11)).await;
    send_frame(&mut channel, &PipeMessage::Loaded).await.unwrap();
    send_frame(&mut channel, &PipeMessage::ForceUnload).await.unwrap();

    wait_for(&mut events, |e| {
        matches!(e, SessionEvent::StateChanged { session, .. } if session.state == SessionState::Unloading)
    })
    .await;

    send_frame(&mut channel, &PipeMessage::Unloaded).await.unwrap();
    assert_eq!(wait_for_removal(&mut events, &id).await, RemovalReason::Graceful);

    server.shutdown().await;
}

// ============================================================================
// Handshake
// ============================================================================

#[tokio::test]
async fn test_unknown_pid_is_rejected() {
    let server = TestServer::spawn().await;
    let mut channel = server.connect().await;

    let reply = exchange(&mut channel, &Handshake::new(999)).await;
    match reply {
        HandshakeReply::Rejected { reason, .. } => assert!(reason.contains("999")),
        other => panic!("expected rejection, got {other:?}"),
    }

    server.shutdown().await;
}

#[tokio::test]
async fn test_handshake_before_registration_within_grace() {
    let server = TestServer::spawn().await;

    // The module connects first; the injection result lands shortly after.
    let registry = server.registry.clone();
    let register = tokio::spawn(async move {
        sleep(Duration::from_millis(100)).await;
        registry.register_pending(key(77)).await
    });

    let mut channel = server.connect().await;
    let reply = exchange(&mut channel, &Handshake::new(77)).await;
    let registered = register.await.unwrap().unwrap();

    assert_eq!(
        reply,
        HandshakeReply::Welcome {
            session_id: registered,
            protocol_version: ProtocolVersion::CURRENT,
        }
    );

    server.shutdown().await;
}

#[tokio::test]
async fn test_version_mismatch_is_rejected() {
    let server = TestServer::spawn().await;
    let id = server.registry.register_pending(key(20)).await.unwrap();

    let mut channel = server.connect().await;
    let handshake = Handshake {
        protocol_version: ProtocolVersion::new(2, 0),
        ..Handshake::new(20)
    };

    assert!(matches!(
        exchange(&mut channel, &handshake).await,
        HandshakeReply::Rejected { .. }
    ));

    // The session keeps waiting for a compatible module.
    assert_eq!(state_of(&server.registry, &id).await, Some(SessionState::Pending));
    let (_channel, attached) = server.attach(Handshake::new(20)).await;
    assert_eq!(attached, id);

    server.shutdown().await;
}

#[tokio::test]
async fn test_stale_start_time_is_rejected() {
    let server = TestServer::spawn().await;
    server.registry.register_pending(key(21)).await.unwrap();

    let mut channel = server.connect().await;
    let reply = exchange(&mut channel, &Handshake::for_process(ProcessKey::new(21, 5))).await;
    assert!(matches!(reply, HandshakeReply::Rejected { .. }));

    server.shutdown().await;
}

#[tokio::test]
async fn test_second_channel_for_a_session_is_rejected() {
    let server = TestServer::spawn().await;
    server.registry.register_pending(key(30)).await.unwrap();

    let (_first, _) = server.attach(Handshake::new(30)).await;

    let mut second = server.connect().await;
    assert!(matches!(
        exchange(&mut second, &Handshake::new(30)).await,
        HandshakeReply::Rejected { .. }
    ));

    server.shutdown().await;
}

#[tokio::test]
async fn test_interleaved_handshakes_never_merge() {
    let server = TestServer::spawn().await;
    let first = server.registry.register_pending(key(101)).await.unwrap();
    let second = server.registry.register_pending(key(102)).await.unwrap();

    // Connect in one order, handshake in the other.
    let mut a = server.connect().await;
    let mut b = server.connect().await;
    send_frame(&mut b, &Handshake::new(102)).await.unwrap();
    send_frame(&mut a, &Handshake::new(101)).await.unwrap();

    let reply_a = recv_frame::<_, HandshakeReply>(&mut a).await.unwrap().unwrap();
    let reply_b = recv_frame::<_, HandshakeReply>(&mut b).await.unwrap().unwrap();
    assert_eq!(reply_a, HandshakeReply::welcome(first.clone()));
    assert_eq!(reply_b, HandshakeReply::welcome(second.clone()));

    // Traffic on each channel only touches its own session.
    send_frame(&mut b, &PipeMessage::Loaded).await.unwrap();
    send_frame(&mut b, &PipeMessage::login_char("Bob")).await.unwrap();
    send_frame(&mut a, &PipeMessage::Loaded).await.unwrap();

    let start = tokio::time::Instant::now();
    while state_of(&server.registry, &second).await != Some(SessionState::LoggedIn)
        && start.elapsed() < EVENT_TIMEOUT
    {
        sleep(SOCKET_POLL_INTERVAL).await;
    }

    let a_view = server.registry.get_session(first).await.unwrap();
    let b_view = server.registry.get_session(second).await.unwrap();
    assert_eq!(b_view.state, SessionState::LoggedIn);
    assert_eq!(b_view.character.as_deref(), Some("Bob"));
    assert_eq!(a_view.character, None);
    assert_eq!(a_view.pid, 101);

    server.shutdown().await;
}

// ============================================================================
// Dispatch & shutdown
// ============================================================================

#[tokio::test]
async fn test_unload_all_reaches_every_channel() {
    let server = TestServer::spawn().await;
    server.registry.register_pending(key(1)).await.unwrap();
    server.registry.register_pending(key(2)).await.unwrap();
    server.registry.register_pending(key(3)).await.unwrap();

    let (mut one, _) = server.attach(Handshake::new(1)).await;
    let (mut two, _) = server.attach(Handshake::new(2)).await;

    let sent = server.registry.unload_all().await;
    assert_eq!(sent.len(), 2);

    for channel in [&mut one, &mut two] {
        let msg = timeout(EVENT_TIMEOUT, recv_frame::<_, PipeMessage>(channel))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg, Some(PipeMessage::ForceUnload));
    }

    server.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_removes_sessions_as_shutdown() {
    let server = TestServer::spawn().await;
    let mut events = server.registry.subscribe();

    server.registry.register_pending(key(50)).await.unwrap();
    let (mut channel, id) = server.attach(Handshake::new(50)).await;
    send_frame(&mut channel, &PipeMessage::Loaded).await.unwrap();
    wait_for(&mut events, |e| matches!(e, SessionEvent::StateChanged { .. })).await;

    let socket_path = server.socket_path.clone();
    let registry = server.registry.clone();
    server.shutdown().await;

    // No Crashed transition on the way out.
    let event = next_event(&mut events).await;
    assert!(
        matches!(
            &event,
            SessionEvent::Removed { session_id, reason: RemovalReason::Shutdown, .. } if *session_id == id
        ),
        "unexpected event {event:?}"
    );
    assert!(registry.snapshot().await.is_empty());
    assert!(!socket_path.exists());
}

// ============================================================================
// Single instance
// ============================================================================

#[tokio::test]
async fn test_second_server_on_live_path_is_refused() {
    let server = TestServer::spawn().await;

    let other_registry = spawn_registry(DEFAULT_PENDING_TIMEOUT);
    let second = ChannelServer::bind(
        server.socket_path.clone(),
        other_registry.clone(),
        CancellationToken::new(),
    );
    assert!(matches!(second, Err(ServerError::AlreadyRunning { .. })));

    // Modules still reach the first supervisor's registry.
    server.registry.register_pending(key(4242)).await.unwrap();
    let (_channel, id) = server.attach(Handshake::new(4242)).await;
    assert_eq!(id.pid(), Some(4242));
    assert!(other_registry.snapshot().await.is_empty());

    server.shutdown().await;
}

#[tokio::test]
async fn test_stale_socket_file_is_replaced() {
    let temp_dir = tempfile::tempdir().unwrap();
    let socket_path = temp_dir.path().join("hive.sock");

    // Left behind by a supervisor that died without cleaning up.
    drop(std::os::unix::net::UnixListener::bind(&socket_path).unwrap());
    assert!(socket_path.exists());

    let registry = spawn_registry(DEFAULT_PENDING_TIMEOUT);
    let cancel_token = CancellationToken::new();
    let mut server = ChannelServer::bind(socket_path.clone(), registry.clone(), cancel_token.clone())
        .expect("stale socket is reclaimed");
    let server_task = tokio::spawn(async move {
        let _ = server.run().await;
    });

    registry.register_pending(key(77)).await.unwrap();
    let mut channel = framed(UnixStream::connect(&socket_path).await.unwrap());
    assert!(matches!(
        exchange(&mut channel, &Handshake::new(77)).await,
        HandshakeReply::Welcome { .. }
    ));

    cancel_token.cancel();
    timeout(EVENT_TIMEOUT, server_task).await.unwrap().unwrap();
}
