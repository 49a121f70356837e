//! Message types exchanged over a session channel.

use crate::version::ProtocolVersion;
use hive_core::{ClassLevel, ProcessKey, SessionId, WindowId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// First frame sent by the injected module after connecting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    /// Module's protocol version
    pub protocol_version: ProtocolVersion,

    /// Pid of the process hosting the module
    pub pid: u32,

    /// Process start time in seconds since the epoch, if the module knows it.
    /// Used to tell a recycled pid from the injected instance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<u64>,

    /// Raw handle of the primary game window
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window: Option<u64>,
}

impl Handshake {
    /// Creates a handshake with the current protocol version.
    pub fn new(pid: u32) -> Self {
        Self {
            protocol_version: ProtocolVersion::CURRENT,
            pid,
            started_at: None,
            window: None,
        }
    }

    /// Creates a handshake naming an exact process instance.
    pub fn for_process(key: ProcessKey) -> Self {
        Self {
            started_at: Some(key.started_at),
            ..Self::new(key.pid)
        }
    }

    pub fn with_window(mut self, window: WindowId) -> Self {
        self.window = Some(window.raw());
        self
    }

    pub fn window_id(&self) -> Option<WindowId> {
        self.window.map(WindowId::new)
    }
}

/// Supervisor's answer to a [`Handshake`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HandshakeReply {
    /// Channel attached to a session
    Welcome {
        session_id: SessionId,
        protocol_version: ProtocolVersion,
    },

    /// Connection refused (unknown pid, version mismatch)
    Rejected {
        reason: String,
        /// Supervisor's protocol version, so the module can report it
        protocol_version: ProtocolVersion,
    },
}

impl HandshakeReply {
    pub fn welcome(session_id: SessionId) -> Self {
        Self::Welcome {
            session_id,
            protocol_version: ProtocolVersion::CURRENT,
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected {
            reason: reason.into(),
            protocol_version: ProtocolVersion::CURRENT,
        }
    }
}

/// Control message carried after the handshake, in either direction.
///
/// The source session is implicit from the connection that delivered it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PipeMessage {
    /// A character logged in
    LoginChar { name: String },

    /// The module finished loading
    Loaded,

    /// The module is unloading on its own
    Unloaded,

    /// Supervisor asks the module to unload
    ForceUnload,

    /// Class and level of the logged-in character
    ClassLevel { class_id: u32, level: u32 },
}

impl PipeMessage {
    pub fn login_char(name: impl Into<String>) -> Self {
        Self::LoginChar { name: name.into() }
    }

    pub fn class_level(class_level: ClassLevel) -> Self {
        Self::ClassLevel {
            class_id: class_level.class_id,
            level: class_level.level,
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Self::LoginChar { .. } => MessageKind::LoginChar,
            Self::Loaded => MessageKind::Loaded,
            Self::Unloaded => MessageKind::Unloaded,
            Self::ForceUnload => MessageKind::ForceUnload,
            Self::ClassLevel { .. } => MessageKind::ClassLevel,
        }
    }
}

/// Discriminant of a [`PipeMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    LoginChar,
    Loaded,
    Unloaded,
    ForceUnload,
    ClassLevel,
}

impl MessageKind {
    /// Numeric wire id used by the game-side module's logs.
    pub const fn code(&self) -> u8 {
        match self {
            Self::LoginChar => 1,
            Self::Loaded => 2,
            Self::Unloaded => 3,
            Self::ForceUnload => 4,
            Self::ClassLevel => 5,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::LoginChar),
            2 => Some(Self::Loaded),
            3 => Some(Self::Unloaded),
            4 => Some(Self::ForceUnload),
            5 => Some(Self::ClassLevel),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LoginChar => "login_char",
            Self::Loaded => "loaded",
            Self::Unloaded => "unloaded",
            Self::ForceUnload => "force_unload",
            Self::ClassLevel => "class_level",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.as_str(), self.code())
    }
}
