//! Global hotkey routing.
//!
//! The OS-level hotkey listener is a collaborator: it reports a pressed
//! [`KeyChord`] and the router decides which session, or which
//! supervisor-wide action, it belongs to.
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use hive_core::{KeyChord, SessionId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace};

// ============================================================================
// Targets
// ============================================================================

/// Supervisor-wide hotkey action.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum GlobalAction {
    /// Ask every session to unload.
    UnloadAll,
    /// An action handled by a collaborator (tray, overlay).
    Named(String),
}

impl fmt::Display for GlobalAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnloadAll => write!(f, "unload_all"),
            Self::Named(name) => write!(f, "{name}"),
        }
    }
}

impl FromStr for GlobalAction {
    type Err = HotkeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim();
        match name {
            "" => Err(HotkeyError::EmptyAction),
            "unload_all" => Ok(Self::UnloadAll),
            other => Ok(Self::Named(other.to_string())),
        }
    }
}

impl TryFrom<String> for GlobalAction {
    type Error = HotkeyError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<GlobalAction> for String {
    fn from(action: GlobalAction) -> Self {
        action.to_string()
    }
}

/// What a chord is bound to, and where a trigger is routed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HotkeyTarget {
    Session(SessionId),
    Global(GlobalAction),
}

impl fmt::Display for HotkeyTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Session(id) => write!(f, "session {id}"),
            Self::Global(action) => write!(f, "global {action}"),
        }
    }
}

/// Errors from binding changes.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HotkeyError {
    #[error("{chord} is already bound to {target}")]
    AlreadyBound { chord: KeyChord, target: HotkeyTarget },

    #[error("{chord} is not bound to {target}")]
    NotBound { chord: KeyChord, target: HotkeyTarget },

    #[error("hotkey action name is empty")]
    EmptyAction,
}

// ============================================================================
// Router
// ============================================================================

/// Maps chords to sessions and global actions.
///
/// A chord may be bound to several sessions and to one global action at the
/// same time. Resolution on trigger:
///
/// 1. the binding for the focused session
/// 2. the global binding
/// 3. the only session binding, when exactly one exists
///
/// Anything else is dropped. Bindings change only through
/// [`register`](Self::register) and [`unregister`](Self::unregister).
#[derive(Debug, Default)]
pub struct HotkeyRouter {
    sessions: HashMap<KeyChord, Vec<SessionId>>,
    globals: HashMap<KeyChord, GlobalAction>,
    foreground: Option<SessionId>,
}

impl HotkeyRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a binding.
    ///
    /// # Errors
    ///
    /// `HotkeyError::AlreadyBound` if the same session is already bound to
    /// the chord, or the chord already has a global action.
    pub fn register(&mut self, chord: KeyChord, target: HotkeyTarget) -> Result<(), HotkeyError> {
        match target {
            HotkeyTarget::Session(session_id) => {
                let bound = self.sessions.entry(chord.clone()).or_default();
                if bound.contains(&session_id) {
                    return Err(HotkeyError::AlreadyBound {
                        chord,
                        target: HotkeyTarget::Session(session_id),
                    });
                }
                debug!(chord = %chord, session_id = %session_id, "Session hotkey bound");
                bound.push(session_id);
            }
            HotkeyTarget::Global(action) => {
                if let Some(existing) = self.globals.get(&chord) {
                    return Err(HotkeyError::AlreadyBound {
                        chord,
                        target: HotkeyTarget::Global(existing.clone()),
                    });
                }
                debug!(chord = %chord, action = %action, "Global hotkey bound");
                self.globals.insert(chord, action);
            }
        }
        Ok(())
    }

    /// Removes a binding.
    ///
    /// # Errors
    ///
    /// `HotkeyError::NotBound` if the chord is not bound to `target`.
    pub fn unregister(&mut self, chord: &KeyChord, target: &HotkeyTarget) -> Result<(), HotkeyError> {
        let removed = match target {
            HotkeyTarget::Session(session_id) => match self.sessions.get_mut(chord) {
                Some(bound) => {
                    let before = bound.len();
                    bound.retain(|id| id != session_id);
                    let removed = bound.len() < before;
                    if bound.is_empty() {
                        self.sessions.remove(chord);
                    }
                    removed
                }
                None => false,
            },
            HotkeyTarget::Global(action) => {
                if self.globals.get(chord) == Some(action) {
                    self.globals.remove(chord);
                    true
                } else {
                    false
                }
            }
        };

        if removed {
            debug!(chord = %chord, target = %target, "Hotkey unbound");
            Ok(())
        } else {
            Err(HotkeyError::NotBound {
                chord: chord.clone(),
                target: target.clone(),
            })
        }
    }

    /// Records which session's window has focus (`None` when no game window does).
    pub fn set_foreground(&mut self, session: Option<SessionId>) {
        trace!(session = ?session, "Foreground changed");
        self.foreground = session;
    }

    pub fn foreground(&self) -> Option<&SessionId> {
        self.foreground.as_ref()
    }

    /// Resolves a pressed chord.
    #[must_use]
    pub fn on_trigger(&self, chord: &KeyChord) -> Option<HotkeyTarget> {
        let bound = self.sessions.get(chord).map(Vec::as_slice).unwrap_or_default();

        if let Some(focused) = self.foreground.as_ref().filter(|f| bound.contains(f)) {
            return Some(HotkeyTarget::Session(focused.clone()));
        }

        if let Some(action) = self.globals.get(chord) {
            return Some(HotkeyTarget::Global(action.clone()));
        }

        if let [only] = bound {
            return Some(HotkeyTarget::Session(only.clone()));
        }

        debug!(chord = %chord, candidates = bound.len(), "Hotkey dropped");
        None
    }

    /// Number of (chord, target) bindings.
    pub fn len(&self) -> usize {
        self.sessions.values().map(Vec::len).sum::<usize>() + self.globals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
