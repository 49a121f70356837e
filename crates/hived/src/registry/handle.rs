//! Client interface for interacting with the RegistryActor.
//!
//! The `RegistryHandle` provides a cheap-to-clone interface for sending commands
//! to the registry actor and subscribing to session events.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Channel errors are mapped to `RegistryError::ChannelClosed`

use std::collections::HashSet;

use tokio::sync::{broadcast, mpsc, oneshot};

use hive_core::{ProcessKey, SessionId, SessionView, WindowId};
use hive_protocol::{Handshake, PipeMessage};

use super::commands::{
    CloseCause, DispatchResult, MessageOutcome, Outbound, RegistryCommand, RegistryError,
    SessionEvent,
};

// ============================================================================
// Registry Handle
// ============================================================================

/// Handle for interacting with the registry actor.
///
/// Cheap to clone and shared by the supervisor, the channel server and every
/// connection task.
///
/// ```ignore
/// let id = handle.register_pending(key).await?;
/// let mut events = handle.subscribe();
/// while let Ok(event) = events.recv().await {
///     // ...
/// }
/// ```
#[derive(Clone)]
pub struct RegistryHandle {
    sender: mpsc::Sender<RegistryCommand>,
    event_sender: broadcast::Sender<SessionEvent>,
}

impl RegistryHandle {
    pub fn new(
        sender: mpsc::Sender<RegistryCommand>,
        event_sender: broadcast::Sender<SessionEvent>,
    ) -> Self {
        Self {
            sender,
            event_sender,
        }
    }

    /// Sends a command and awaits its response.
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> RegistryCommand,
    ) -> Result<T, RegistryError> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(make(tx))
            .await
            .map_err(|_| RegistryError::ChannelClosed)?;

        rx.await.map_err(|_| RegistryError::ChannelClosed)
    }

    /// Registers a Pending session for a process instance.
    ///
    /// # Errors
    ///
    /// - `RegistryError::SessionAlreadyExists` if the instance is registered
    /// - `RegistryError::RegistryFull` if the registry is at capacity
    /// - `RegistryError::ChannelClosed` if the actor has shut down
    pub async fn register_pending(&self, process: ProcessKey) -> Result<SessionId, RegistryError> {
        self.request(|respond_to| RegistryCommand::RegisterPending {
            process,
            respond_to,
        })
        .await?
    }

    /// Attaches a handshaken channel to the session waiting for its pid.
    ///
    /// # Errors
    ///
    /// `UnknownProcess`, `StaleProcess` or `ChannelAttached`; the connection
    /// answers each with `Rejected`.
    pub async fn accept(
        &self,
        handshake: Handshake,
        connection: u64,
        outbound: Outbound,
    ) -> Result<SessionId, RegistryError> {
        self.request(|respond_to| RegistryCommand::Accept {
            handshake,
            connection,
            outbound,
            respond_to,
        })
        .await?
    }

    /// Applies an inbound message to the session.
    ///
    /// # Errors
    ///
    /// - `RegistryError::InvalidTransition` if the message is not valid now
    /// - `RegistryError::SessionNotFound` if the session is gone
    pub async fn apply_message(
        &self,
        session_id: SessionId,
        message: PipeMessage,
    ) -> Result<MessageOutcome, RegistryError> {
        self.request(|respond_to| RegistryCommand::ApplyMessage {
            session_id,
            message,
            respond_to,
        })
        .await?
    }

    /// Reports that a connection's channel ended. Returns once the session
    /// has been removed.
    pub async fn channel_closed(
        &self,
        session_id: SessionId,
        connection: u64,
        cause: CloseCause,
    ) -> Result<(), RegistryError> {
        self.request(|respond_to| RegistryCommand::ChannelClosed {
            session_id,
            connection,
            cause,
            respond_to,
        })
        .await
    }

    /// Sends a message to a session.
    ///
    /// A closed registry is reported as `DispatchResult::ChannelClosed`.
    pub async fn dispatch(&self, session_id: SessionId, message: PipeMessage) -> DispatchResult {
        self.request(|respond_to| RegistryCommand::Dispatch {
            session_id,
            message,
            respond_to,
        })
        .await
        .unwrap_or(DispatchResult::ChannelClosed)
    }

    /// Sends `ForceUnload` to every session with an open channel.
    ///
    /// Returns the sessions the request reached.
    pub async fn unload_all(&self) -> Vec<SessionId> {
        self.request(|respond_to| RegistryCommand::UnloadAll { respond_to })
            .await
            .unwrap_or_default()
    }

    /// Publishes `SessionEvent::Activated` for a session and returns its window.
    pub async fn activate(&self, session_id: SessionId) -> Result<Option<WindowId>, RegistryError> {
        self.request(|respond_to| RegistryCommand::Activate {
            session_id,
            respond_to,
        })
        .await?
    }

    /// Get a session by ID. Returns `None` if not found or the actor is gone.
    pub async fn get_session(&self, session_id: SessionId) -> Option<SessionView> {
        self.request(|respond_to| RegistryCommand::GetSession {
            session_id,
            respond_to,
        })
        .await
        .ok()
        .flatten()
    }

    /// Copy of every session, ordered by (created_at, pid).
    ///
    /// Returns an empty vector if the actor has shut down.
    pub async fn snapshot(&self) -> Vec<SessionView> {
        self.request(|respond_to| RegistryCommand::Snapshot { respond_to })
            .await
            .unwrap_or_default()
    }

    /// Removes sessions whose process instance is not in `live`.
    ///
    /// Returns the number of sessions removed.
    pub async fn reap(&self, live: HashSet<ProcessKey>) -> usize {
        self.request(|respond_to| RegistryCommand::Reap { live, respond_to })
            .await
            .unwrap_or(0)
    }

    /// Subscribe to lifecycle events.
    ///
    /// Slow subscribers may miss events (broadcast lag).
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_closed_actor_maps_to_errors() {
        let (cmd_tx, cmd_rx) = mpsc::channel(1);
        let (event_tx, _) = broadcast::channel(1);
        drop(cmd_rx);
        let handle = RegistryHandle::new(cmd_tx, event_tx);

        assert!(matches!(
            handle.register_pending(ProcessKey::new(1, 1)).await,
            Err(RegistryError::ChannelClosed)
        ));
        assert_eq!(
            handle.dispatch(SessionId::new("1-1"), PipeMessage::ForceUnload).await,
            DispatchResult::ChannelClosed
        );
        assert!(handle.snapshot().await.is_empty());
        assert!(handle.unload_all().await.is_empty());
        assert_eq!(handle.reap(HashSet::new()).await, 0);
    }
}
