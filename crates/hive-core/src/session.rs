//! Session domain entities and value objects.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

use crate::error::{DomainError, DomainResult};
use crate::process::ProcessKey;

// ============================================================================
// Type-Safe Identifiers
// ============================================================================

/// Unique identifier for an injected session.
///
/// Derived from the owning process instance (`"{pid}-{started_at}"`), so the
/// same identifier can only reappear for the very same process instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Creates a new SessionId from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Builds the identifier for a process instance.
    pub fn for_process(key: &ProcessKey) -> Self {
        Self(format!("{}-{}", key.pid, key.started_at))
    }

    /// Extracts the pid encoded in the identifier.
    pub fn pid(&self) -> Option<u32> {
        self.0
            .split_once('-')
            .and_then(|(pid, _)| pid.parse().ok())
    }

    /// Returns the underlying string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Opaque handle of a session's primary game window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WindowId(u64);

impl WindowId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for WindowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

// ============================================================================
// Lifecycle State
// ============================================================================

/// Lifecycle state of a session.
///
/// ```text
/// Pending ──▶ Loaded ──▶ LoggedIn
///    │          │           │
///    └──────────┴─────┬─────┘
///                     ▼
///      (any) ──▶ Crashed │ Unloading ──▶ Removed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Injection succeeded; the module has not announced itself yet.
    #[default]
    Pending,

    /// The module is loaded and its channel is attached.
    Loaded,

    /// A character is logged in.
    LoggedIn,

    /// An unload was requested or announced.
    Unloading,

    /// The channel closed without an unload announcement.
    Crashed,

    /// Terminal. The record is deleted right after entering this state.
    Removed,
}

impl SessionState {
    /// Returns the display label for this state.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Loaded => "loaded",
            Self::LoggedIn => "in game",
            Self::Unloading => "unloading",
            Self::Crashed => "crashed",
            Self::Removed => "removed",
        }
    }

    /// Returns true if the session is on its way out.
    #[must_use]
    pub fn is_ending(&self) -> bool {
        matches!(self, Self::Unloading | Self::Crashed | Self::Removed)
    }

    /// Returns true if the module has announced itself.
    #[must_use]
    pub fn is_loaded(&self) -> bool {
        matches!(self, Self::Loaded | Self::LoggedIn)
    }

    /// Whether the lifecycle graph has an edge from `self` to `next`.
    #[must_use]
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Pending, Loaded) => true,
            (Loaded, LoggedIn) => true,
            (Pending | Loaded | LoggedIn, Unloading) => true,
            (Pending | Loaded | LoggedIn | Unloading, Crashed) => true,
            (Unloading | Crashed, Removed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Loaded => write!(f, "Loaded"),
            Self::LoggedIn => write!(f, "LoggedIn"),
            Self::Unloading => write!(f, "Unloading"),
            Self::Crashed => write!(f, "Crashed"),
            Self::Removed => write!(f, "Removed"),
        }
    }
}

// ============================================================================
// Value Objects
// ============================================================================

/// Class and level reported by a logged-in session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassLevel {
    pub class_id: u32,
    pub level: u32,
}

impl ClassLevel {
    pub const fn new(class_id: u32, level: u32) -> Self {
        Self { class_id, level }
    }
}

impl fmt::Display for ClassLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "class {} lvl {}", self.class_id, self.level)
    }
}

// ============================================================================
// Session Domain Entity
// ============================================================================

/// A live or pending injected instance.
///
/// Owned by the registry; everything else sees [`SessionView`] snapshots.
/// All state changes go through the methods below, which enforce the
/// lifecycle graph of [`SessionState`].
#[derive(Debug, Clone)]
pub struct SessionDomain {
    pub id: SessionId,
    pub process: ProcessKey,
    pub window: Option<WindowId>,
    pub state: SessionState,
    pub character: Option<String>,
    pub class_level: Option<ClassLevel>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl SessionDomain {
    /// Creates a Pending session for a freshly injected process.
    pub fn pending(process: ProcessKey) -> Self {
        let now = Utc::now();
        Self {
            id: SessionId::for_process(&process),
            process,
            window: None,
            state: SessionState::Pending,
            character: None,
            class_level: None,
            created_at: now,
            last_activity: now,
        }
    }

    /// Pid of the owning process.
    pub fn pid(&self) -> u32 {
        self.process.pid
    }

    /// Records activity without changing state.
    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    /// Moves to `next`, returning the previous state.
    ///
    /// # Errors
    /// `DomainError::InvalidTransition` if the graph has no such edge.
    pub fn transition(&mut self, next: SessionState) -> DomainResult<SessionState> {
        if !self.state.can_transition_to(next) {
            return Err(self.invalid(next));
        }
        let previous = self.state;
        self.state = next;
        self.touch();
        debug!(
            session_id = %self.id,
            from = %previous,
            to = %next,
            "Session state changed"
        );
        Ok(previous)
    }

    /// Applies a `Loaded` announcement.
    ///
    /// Returns `Some(previous)` on Pending→Loaded, `None` when the session was
    /// already loaded (repeated announcement).
    pub fn mark_loaded(&mut self) -> DomainResult<Option<SessionState>> {
        match self.state {
            SessionState::Loaded | SessionState::LoggedIn => {
                self.touch();
                Ok(None)
            }
            _ => self.transition(SessionState::Loaded).map(Some),
        }
    }

    /// Applies a character login.
    ///
    /// Returns `Some(previous)` on Loaded→LoggedIn, `None` when an already
    /// logged-in session switched characters.
    pub fn login(&mut self, name: &str) -> DomainResult<Option<SessionState>> {
        let name = name.trim();
        if name.is_empty() {
            return Err(DomainError::InvalidFieldValue {
                field: "character".to_string(),
                value: String::new(),
                expected: "non-empty name".to_string(),
            });
        }

        let changed = match self.state {
            SessionState::LoggedIn => {
                self.touch();
                None
            }
            _ => Some(self.transition(SessionState::LoggedIn)?),
        };
        self.character = Some(name.to_string());
        Ok(changed)
    }

    /// Records class and level. Only valid while logged in.
    pub fn set_class_level(&mut self, class_level: ClassLevel) -> DomainResult<()> {
        if self.state != SessionState::LoggedIn {
            return Err(self.invalid(SessionState::LoggedIn));
        }
        self.class_level = Some(class_level);
        self.touch();
        Ok(())
    }

    /// Supervisor-issued unload. Only a loaded module can honour it.
    ///
    /// Returns `None` if an unload is already in progress.
    pub fn request_unload(&mut self) -> DomainResult<Option<SessionState>> {
        match self.state {
            SessionState::Unloading => Ok(None),
            SessionState::Loaded | SessionState::LoggedIn => {
                self.transition(SessionState::Unloading).map(Some)
            }
            _ => Err(self.invalid(SessionState::Unloading)),
        }
    }

    /// Session-announced unload (graceful).
    ///
    /// Returns `None` if the session was already unloading.
    pub fn announce_unload(&mut self) -> DomainResult<Option<SessionState>> {
        match self.state {
            SessionState::Unloading => Ok(None),
            _ => self.transition(SessionState::Unloading).map(Some),
        }
    }

    /// Channel lost without an unload announcement.
    pub fn crash(&mut self) -> DomainResult<SessionState> {
        self.transition(SessionState::Crashed)
    }

    fn invalid(&self, to: SessionState) -> DomainError {
        DomainError::InvalidTransition {
            session_id: self.id.clone(),
            from: self.state,
            to,
        }
    }
}

// ============================================================================
// Session View
// ============================================================================

/// Read-only view of a session for collaborators (tray, status display).
///
/// Immutable snapshot created from SessionDomain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionView {
    pub id: SessionId,
    pub pid: u32,
    pub started_at: u64,
    pub window: Option<WindowId>,
    pub state: SessionState,
    pub state_label: String,
    pub character: Option<String>,
    pub class_id: Option<u32>,
    pub level: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl SessionView {
    /// Creates a view from a domain session.
    pub fn from_domain(session: &SessionDomain) -> Self {
        Self {
            id: session.id.clone(),
            pid: session.process.pid,
            started_at: session.process.started_at,
            window: session.window,
            state: session.state,
            state_label: session.state.label().to_string(),
            character: session.character.clone(),
            class_id: session.class_level.map(|c| c.class_id),
            level: session.class_level.map(|c| c.level),
            created_at: session.created_at,
            last_activity: session.last_activity,
        }
    }

    /// One-line summary for logs and the status command.
    pub fn summary(&self) -> String {
        let who = self.character.as_deref().unwrap_or("-");
        match (self.class_id, self.level) {
            (Some(class_id), Some(level)) => format!(
                "{} pid={} {} {} (class {class_id}, lvl {level})",
                self.id, self.pid, self.state_label, who
            ),
            _ => format!("{} pid={} {} {}", self.id, self.pid, self.state_label, who),
        }
    }
}
