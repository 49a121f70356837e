//! Registry actor commands, errors, and events.
//!
//! This module defines the message types for communicating with the `RegistryActor`:
//! - `RegistryCommand`: Commands sent to the actor
//! - `RegistryError`: Errors that can occur during registry operations
//! - `SessionEvent`: Events published by the registry for subscribers
//!
//! All types are designed for async message passing and follow the panic-free policy.

use std::collections::HashSet;

use hive_core::{DomainError, ProcessKey, SessionId, SessionState, SessionView, WindowId};
use hive_protocol::{Handshake, PipeMessage};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Sender half of a session's outbound channel.
///
/// Unbounded so the actor never waits on a slow connection writer.
pub type Outbound = mpsc::UnboundedSender<PipeMessage>;

// ============================================================================
// Registry Commands
// ============================================================================

/// Commands sent to the registry actor.
///
/// Each request carries a oneshot channel for the response.
#[derive(Debug)]
pub enum RegistryCommand {
    /// Create a Pending session for an injected (or adopted) process.
    ///
    /// # Errors
    /// - `RegistryError::SessionAlreadyExists` if this process instance is registered
    /// - `RegistryError::RegistryFull` if at maximum capacity
    RegisterPending {
        process: ProcessKey,
        respond_to: oneshot::Sender<Result<SessionId, RegistryError>>,
    },

    /// Attach a freshly handshaken channel to its session.
    ///
    /// The session is found by the pid in the handshake, never by arrival order.
    ///
    /// # Errors
    /// - `RegistryError::UnknownProcess` if no session waits for this pid
    /// - `RegistryError::StaleProcess` if the start time names another instance
    /// - `RegistryError::ChannelAttached` if the session already has a channel
    Accept {
        handshake: Handshake,
        /// Identifies the connection, so a late close from a replaced
        /// connection cannot end the session
        connection: u64,
        outbound: Outbound,
        respond_to: oneshot::Sender<Result<SessionId, RegistryError>>,
    },

    /// Apply an inbound message from a session's channel.
    ///
    /// # Errors
    /// - `RegistryError::SessionNotFound` if the session is gone
    /// - `RegistryError::InvalidTransition` if the message is not valid in the current state
    ApplyMessage {
        session_id: SessionId,
        message: PipeMessage,
        respond_to: oneshot::Sender<Result<MessageOutcome, RegistryError>>,
    },

    /// A session's channel ended.
    ///
    /// Responds once the session has been removed.
    ChannelClosed {
        session_id: SessionId,
        connection: u64,
        cause: CloseCause,
        respond_to: oneshot::Sender<()>,
    },

    /// Send a message to a session over its channel.
    Dispatch {
        session_id: SessionId,
        message: PipeMessage,
        respond_to: oneshot::Sender<DispatchResult>,
    },

    /// Ask every session with an open channel to unload.
    UnloadAll {
        respond_to: oneshot::Sender<Vec<SessionId>>,
    },

    /// A hotkey was routed to a session; publishes `SessionEvent::Activated`.
    ///
    /// # Errors
    /// - `RegistryError::SessionNotFound` if the session doesn't exist
    Activate {
        session_id: SessionId,
        respond_to: oneshot::Sender<Result<Option<WindowId>, RegistryError>>,
    },

    /// Get a single session by ID.
    GetSession {
        session_id: SessionId,
        respond_to: oneshot::Sender<Option<SessionView>>,
    },

    /// All sessions ordered by creation time, then pid.
    Snapshot {
        respond_to: oneshot::Sender<Vec<SessionView>>,
    },

    /// Remove sessions whose process is not in `live`.
    ///
    /// Responds with the number of sessions removed.
    Reap {
        live: HashSet<ProcessKey>,
        respond_to: oneshot::Sender<usize>,
    },

    /// Remove Pending sessions that never connected.
    ///
    /// Fire-and-forget, sent by the cleanup task.
    ExpirePending,
}

/// What the connection should do after an inbound message was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    /// Keep reading.
    Continue,
    /// The session ended; close the channel.
    Ended,
}

/// Why a channel ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCause {
    /// Peer closed or the transport failed.
    Disconnected,
    /// The peer sent something that is not a valid frame.
    ProtocolViolation,
    /// The supervisor is shutting down.
    Shutdown,
}

/// Result of [`RegistryCommand::Dispatch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchResult {
    Sent,
    SessionNotFound,
    /// The session exists but has no open channel.
    ChannelClosed,
}

// ============================================================================
// Registry Errors
// ============================================================================

/// Errors that can occur during registry operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// The registry has reached its maximum session capacity.
    #[error("registry is full (max: {max} sessions)")]
    RegistryFull { max: usize },

    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("session already exists: {0}")]
    SessionAlreadyExists(SessionId),

    /// No session is waiting for a channel from this pid.
    #[error("no pending session for pid {pid}")]
    UnknownProcess { pid: u32 },

    /// The handshake's start time does not match the registered instance.
    #[error("pid {pid} was registered for another process instance")]
    StaleProcess { pid: u32 },

    #[error("session {0} already has a channel")]
    ChannelAttached(SessionId),

    /// A message was not valid for the session's state.
    #[error("{0}")]
    InvalidTransition(#[from] DomainError),

    /// The response channel was closed before receiving a response.
    ///
    /// This typically indicates the actor was shut down.
    #[error("response channel closed")]
    ChannelClosed,
}

impl RegistryError {
    /// True if the handshake may succeed once the session is registered.
    pub fn is_retryable_handshake(&self) -> bool {
        matches!(self, Self::UnknownProcess { .. })
    }
}

// ============================================================================
// Session Events
// ============================================================================

/// Lifecycle events published by the registry to subscribers.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A Pending session was created.
    Created { session: Box<SessionView> },

    /// A session moved along the lifecycle graph.
    StateChanged {
        session: Box<SessionView>,
        from: SessionState,
    },

    /// Attributes changed without a state change (character, class, level).
    Updated { session: Box<SessionView> },

    /// A session was removed from the registry.
    Removed {
        session_id: SessionId,
        pid: u32,
        reason: RemovalReason,
    },

    /// A hotkey targeted this session; its window should come to the front.
    Activated {
        session_id: SessionId,
        window: Option<WindowId>,
    },
}

impl SessionEvent {
    pub fn session_id(&self) -> &SessionId {
        match self {
            Self::Created { session }
            | Self::StateChanged { session, .. }
            | Self::Updated { session } => &session.id,
            Self::Removed { session_id, .. } | Self::Activated { session_id, .. } => session_id,
        }
    }
}

/// Reason why a session was removed from the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    /// The module announced `Unloaded`.
    Graceful,

    /// The channel closed without `Unloaded`, or carried a malformed frame.
    Crashed,

    /// The process is no longer running.
    ProcessExited,

    /// Injected but never connected within the pending timeout.
    PendingExpired,

    /// The supervisor shut down while the channel was open.
    Shutdown,
}

impl std::fmt::Display for RemovalReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Graceful => write!(f, "module unloaded"),
            Self::Crashed => write!(f, "channel lost without unload"),
            Self::ProcessExited => write!(f, "process exited"),
            Self::PendingExpired => write!(f, "module never connected"),
            Self::Shutdown => write!(f, "supervisor shutdown"),
        }
    }
}
