//! Registry actor - owns all session state and processes commands.
//!
//! The RegistryActor is the single owner of session state in the system.
//! It receives commands via an mpsc channel and publishes events via broadcast.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations use `?`, pattern matching, or `unwrap_or`
//! - Channel send failures are logged but don't panic

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use hive_core::{
    ClassLevel, ProcessKey, SessionDomain, SessionId, SessionState, SessionView, WindowId,
};
use hive_protocol::{Handshake, PipeMessage};

use super::commands::{
    CloseCause, DispatchResult, MessageOutcome, Outbound, RegistryCommand, RegistryError,
    RemovalReason, SessionEvent,
};

// ============================================================================
// Resource Limits
// ============================================================================

/// Maximum number of sessions the registry can hold.
pub const MAX_SESSIONS: usize = 64;

/// How long a Pending session may wait for its channel.
pub const DEFAULT_PENDING_TIMEOUT: Duration = Duration::from_secs(60);

// ============================================================================
// Registry Actor
// ============================================================================

/// A channel attached to a session, tagged with the connection that owns it.
#[derive(Debug)]
struct Attached {
    connection: u64,
    outbound: Outbound,
}

#[derive(Debug)]
struct SessionEntry {
    session: SessionDomain,
    channel: Option<Attached>,
}

impl SessionEntry {
    fn open_channel(&self) -> Option<&Attached> {
        self.channel.as_ref().filter(|c| !c.outbound.is_closed())
    }
}

/// The registry actor - owns all session state.
///
/// Sessions are keyed by [`ProcessKey`], so a recycled pid never aliases an
/// older instance. A secondary index maps `SessionId` back to the key, and
/// each entry holds the outbound half of its channel.
///
/// The actor runs in a single task and processes commands sequentially;
/// this is the only place session state is mutated.
pub struct RegistryActor {
    receiver: mpsc::Receiver<RegistryCommand>,

    sessions: HashMap<ProcessKey, SessionEntry>,

    session_index: HashMap<SessionId, ProcessKey>,

    event_publisher: broadcast::Sender<SessionEvent>,

    pending_timeout: Duration,
}

impl RegistryActor {
    /// Creates a new registry actor.
    pub fn new(
        receiver: mpsc::Receiver<RegistryCommand>,
        event_publisher: broadcast::Sender<SessionEvent>,
        pending_timeout: Duration,
    ) -> Self {
        Self {
            receiver,
            sessions: HashMap::new(),
            session_index: HashMap::new(),
            event_publisher,
            pending_timeout,
        }
    }

    /// Runs the actor event loop until every sender is dropped.
    pub async fn run(mut self) {
        info!("Registry actor starting");

        while let Some(cmd) = self.receiver.recv().await {
            self.handle_command(cmd);
        }

        info!(sessions = self.sessions.len(), "Registry actor stopped");
    }

    /// Dispatches a command to the appropriate handler.
    fn handle_command(&mut self, cmd: RegistryCommand) {
        match cmd {
            RegistryCommand::RegisterPending {
                process,
                respond_to,
            } => {
                let result = self.handle_register_pending(process);
                // Ignore send error - caller may have dropped the receiver
                let _ = respond_to.send(result);
            }
            RegistryCommand::Accept {
                handshake,
                connection,
                outbound,
                respond_to,
            } => {
                let result = self.handle_accept(&handshake, connection, outbound);
                let _ = respond_to.send(result);
            }
            RegistryCommand::ApplyMessage {
                session_id,
                message,
                respond_to,
            } => {
                let result = self.handle_apply_message(&session_id, message);
                let _ = respond_to.send(result);
            }
            RegistryCommand::ChannelClosed {
                session_id,
                connection,
                cause,
                respond_to,
            } => {
                self.handle_channel_closed(&session_id, connection, cause);
                let _ = respond_to.send(());
            }
            RegistryCommand::Dispatch {
                session_id,
                message,
                respond_to,
            } => {
                let result = self.handle_dispatch(&session_id, message);
                let _ = respond_to.send(result);
            }
            RegistryCommand::UnloadAll { respond_to } => {
                let _ = respond_to.send(self.handle_unload_all());
            }
            RegistryCommand::Activate {
                session_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.handle_activate(&session_id));
            }
            RegistryCommand::GetSession {
                session_id,
                respond_to,
            } => {
                let view = self
                    .entry(&session_id)
                    .map(|e| SessionView::from_domain(&e.session));
                let _ = respond_to.send(view);
            }
            RegistryCommand::Snapshot { respond_to } => {
                let _ = respond_to.send(self.handle_snapshot());
            }
            RegistryCommand::Reap { live, respond_to } => {
                let _ = respond_to.send(self.handle_reap(&live));
            }
            RegistryCommand::ExpirePending => {
                self.handle_expire_pending();
            }
        }
    }

    // ========================================================================
    // Command Handlers
    // ========================================================================

    fn handle_register_pending(&mut self, process: ProcessKey) -> Result<SessionId, RegistryError> {
        if let Some(entry) = self.sessions.get(&process) {
            return Err(RegistryError::SessionAlreadyExists(entry.session.id.clone()));
        }

        // Same pid, different start time: the old instance is gone.
        let recycled: Vec<ProcessKey> = self
            .sessions
            .keys()
            .filter(|key| key.pid == process.pid)
            .copied()
            .collect();
        for key in recycled {
            self.remove(&key, RemovalReason::ProcessExited);
        }

        if self.sessions.len() >= MAX_SESSIONS {
            warn!(
                max = MAX_SESSIONS,
                pid = process.pid,
                "Registry full, rejecting session"
            );
            return Err(RegistryError::RegistryFull { max: MAX_SESSIONS });
        }

        let session = SessionDomain::pending(process);
        let session_id = session.id.clone();
        let view = SessionView::from_domain(&session);

        self.session_index.insert(session_id.clone(), process);
        self.sessions.insert(
            process,
            SessionEntry {
                session,
                channel: None,
            },
        );

        info!(session_id = %session_id, pid = process.pid, "Session pending");
        self.publish(SessionEvent::Created {
            session: Box::new(view),
        });

        Ok(session_id)
    }

    fn handle_accept(
        &mut self,
        handshake: &Handshake,
        connection: u64,
        outbound: Outbound,
    ) -> Result<SessionId, RegistryError> {
        let pid = handshake.pid;
        let key = self
            .sessions
            .keys()
            .find(|key| key.pid == pid)
            .copied()
            .ok_or(RegistryError::UnknownProcess { pid })?;

        if handshake.started_at.is_some_and(|started| started != key.started_at) {
            return Err(RegistryError::StaleProcess { pid });
        }

        let entry = self
            .sessions
            .get_mut(&key)
            .ok_or(RegistryError::UnknownProcess { pid })?;

        if entry.open_channel().is_some() || entry.session.state.is_ending() {
            return Err(RegistryError::ChannelAttached(entry.session.id.clone()));
        }

        entry.channel = Some(Attached {
            connection,
            outbound,
        });
        if let Some(window) = handshake.window_id() {
            entry.session.window = Some(window);
        }
        entry.session.touch();

        let session_id = entry.session.id.clone();
        let view = SessionView::from_domain(&entry.session);

        info!(
            session_id = %session_id,
            pid,
            connection,
            window = ?view.window,
            "Channel attached"
        );
        self.publish(SessionEvent::Updated {
            session: Box::new(view),
        });

        Ok(session_id)
    }

    fn handle_apply_message(
        &mut self,
        session_id: &SessionId,
        message: PipeMessage,
    ) -> Result<MessageOutcome, RegistryError> {
        let key = self.key_of(session_id)?;
        let kind = message.kind();

        let entry = self
            .sessions
            .get_mut(&key)
            .ok_or_else(|| RegistryError::SessionNotFound(session_id.clone()))?;
        let session = &mut entry.session;

        debug!(session_id = %session_id, kind = %kind, state = %session.state, "Applying message");

        let event = match message {
            PipeMessage::Loaded => match session.mark_loaded()? {
                Some(from) => state_changed(session, from),
                None => {
                    debug!(session_id = %session_id, "Repeated Loaded ignored");
                    return Ok(MessageOutcome::Continue);
                }
            },
            PipeMessage::LoginChar { name } => match session.login(&name)? {
                Some(from) => state_changed(session, from),
                None => updated(session),
            },
            PipeMessage::ClassLevel { class_id, level } => {
                session.set_class_level(ClassLevel::new(class_id, level))?;
                updated(session)
            }
            PipeMessage::ForceUnload => match session.announce_unload()? {
                Some(from) => {
                    info!(session_id = %session_id, "Module requested its own unload");
                    state_changed(session, from)
                }
                None => return Ok(MessageOutcome::Continue),
            },
            PipeMessage::Unloaded => {
                if let Some(from) = session.announce_unload()? {
                    let event = state_changed(session, from);
                    self.publish(event);
                }
                self.remove(&key, RemovalReason::Graceful);
                return Ok(MessageOutcome::Ended);
            }
        };

        self.publish(event);
        Ok(MessageOutcome::Continue)
    }

    fn handle_channel_closed(&mut self, session_id: &SessionId, connection: u64, cause: CloseCause) {
        let Some(key) = self.session_index.get(session_id).copied() else {
            debug!(session_id = %session_id, "Channel closed for removed session");
            return;
        };
        let Some(entry) = self.sessions.get_mut(&key) else {
            return;
        };

        let owner = entry.channel.as_ref().map(|c| c.connection);
        if owner != Some(connection) {
            debug!(
                session_id = %session_id,
                connection,
                owner = ?owner,
                "Ignoring close from a connection that no longer owns the session"
            );
            return;
        }

        if cause == CloseCause::Shutdown {
            self.remove(&key, RemovalReason::Shutdown);
            return;
        }

        match entry.session.crash() {
            Ok(from) => {
                warn!(
                    session_id = %session_id,
                    from = %from,
                    cause = ?cause,
                    "Channel closed without unload"
                );
                let event = state_changed(&entry.session, from);
                self.publish(event);
            }
            Err(e) => warn!(session_id = %session_id, error = %e, "Crash transition refused"),
        }
        self.remove(&key, RemovalReason::Crashed);
    }

    fn handle_dispatch(&mut self, session_id: &SessionId, message: PipeMessage) -> DispatchResult {
        let Some(key) = self.session_index.get(session_id).copied() else {
            return DispatchResult::SessionNotFound;
        };
        let Some(entry) = self.sessions.get_mut(&key) else {
            return DispatchResult::SessionNotFound;
        };
        let Some(outbound) = entry.open_channel().map(|c| c.outbound.clone()) else {
            return DispatchResult::ChannelClosed;
        };

        let mut event = None;
        if message == PipeMessage::ForceUnload {
            match entry.session.request_unload() {
                Ok(Some(from)) => event = Some(state_changed(&entry.session, from)),
                Ok(None) => {}
                Err(e) => debug!(session_id = %session_id, error = %e, "Unload requested before load"),
            }
        }

        let kind = message.kind();
        if outbound.send(message).is_err() {
            return DispatchResult::ChannelClosed;
        }
        debug!(session_id = %session_id, kind = %kind, "Message dispatched");

        if let Some(event) = event {
            self.publish(event);
        }
        DispatchResult::Sent
    }

    fn handle_unload_all(&mut self) -> Vec<SessionId> {
        let targets: Vec<SessionId> = self
            .sessions
            .values()
            .filter(|e| e.open_channel().is_some())
            .map(|e| e.session.id.clone())
            .collect();

        let sent: Vec<SessionId> = targets
            .into_iter()
            .filter(|id| self.handle_dispatch(id, PipeMessage::ForceUnload) == DispatchResult::Sent)
            .collect();

        info!(count = sent.len(), "Unload requested for all sessions");
        sent
    }

    fn handle_activate(&mut self, session_id: &SessionId) -> Result<Option<WindowId>, RegistryError> {
        let window = self
            .entry(session_id)
            .map(|e| e.session.window)
            .ok_or_else(|| RegistryError::SessionNotFound(session_id.clone()))?;

        debug!(session_id = %session_id, window = ?window, "Session activated");
        self.publish(SessionEvent::Activated {
            session_id: session_id.clone(),
            window,
        });
        Ok(window)
    }

    fn handle_snapshot(&self) -> Vec<SessionView> {
        let mut views: Vec<SessionView> = self
            .sessions
            .values()
            .map(|e| SessionView::from_domain(&e.session))
            .collect();
        views.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.pid.cmp(&b.pid)));
        views
    }

    fn handle_reap(&mut self, live: &HashSet<ProcessKey>) -> usize {
        let exited: Vec<ProcessKey> = self
            .sessions
            .keys()
            .filter(|key| !live.contains(key))
            .copied()
            .collect();

        for key in &exited {
            self.remove(key, RemovalReason::ProcessExited);
        }
        exited.len()
    }

    /// Removes Pending sessions whose module never connected in time.
    ///
    /// A session with an attached channel is left alone even if `Loaded`
    /// never arrives: the connection holds it, and closing that connection
    /// ends the session as Crashed.
    fn handle_expire_pending(&mut self) {
        let now = Utc::now();
        let timeout = self.pending_timeout;

        let expired: Vec<ProcessKey> = self
            .sessions
            .iter()
            .filter(|(_, e)| e.session.state == SessionState::Pending && e.channel.is_none())
            .filter(|(_, e)| {
                now.signed_duration_since(e.session.created_at)
                    .to_std()
                    .is_ok_and(|age| age >= timeout)
            })
            .map(|(key, _)| *key)
            .collect();

        if expired.is_empty() {
            debug!("No pending sessions to expire");
            return;
        }

        for key in expired {
            self.remove(&key, RemovalReason::PendingExpired);
        }
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn key_of(&self, session_id: &SessionId) -> Result<ProcessKey, RegistryError> {
        self.session_index
            .get(session_id)
            .copied()
            .ok_or_else(|| RegistryError::SessionNotFound(session_id.clone()))
    }

    fn entry(&self, session_id: &SessionId) -> Option<&SessionEntry> {
        self.session_index
            .get(session_id)
            .and_then(|key| self.sessions.get(key))
    }

    /// Deletes a session, dropping its outbound sender, and publishes `Removed`.
    fn remove(&mut self, key: &ProcessKey, reason: RemovalReason) {
        let Some(mut entry) = self.sessions.remove(key) else {
            return;
        };
        self.session_index.remove(&entry.session.id);

        if entry.session.state.can_transition_to(SessionState::Removed) {
            let _ = entry.session.transition(SessionState::Removed);
        }

        let session_id = entry.session.id;
        match reason {
            RemovalReason::Crashed | RemovalReason::ProcessExited => warn!(
                session_id = %session_id,
                pid = key.pid,
                reason = %reason,
                "Session removed"
            ),
            _ => info!(
                session_id = %session_id,
                pid = key.pid,
                reason = %reason,
                "Session removed"
            ),
        }

        self.publish(SessionEvent::Removed {
            session_id,
            pid: key.pid,
            reason,
        });
    }

    fn publish(&self, event: SessionEvent) {
        // No subscribers is not an error
        let _ = self.event_publisher.send(event);
    }

    // ========================================================================
    // Accessors (for testing)
    // ========================================================================

    /// Returns the number of sessions currently registered.
    #[cfg(test)]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

fn state_changed(session: &SessionDomain, from: SessionState) -> SessionEvent {
    SessionEvent::StateChanged {
        session: Box::new(SessionView::from_domain(session)),
        from,
    }
}

fn updated(session: &SessionDomain) -> SessionEvent {
    SessionEvent::Updated {
        session: Box::new(SessionView::from_domain(session)),
    }
}
