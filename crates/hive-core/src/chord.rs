//! Hotkey chords: a modifier set plus one key.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::DomainError;

/// Modifier keys held while the chord key is pressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Modifiers {
    pub ctrl: bool,
    pub alt: bool,
    pub shift: bool,
    pub win: bool,
}

impl Modifiers {
    pub const NONE: Self = Self {
        ctrl: false,
        alt: false,
        shift: false,
        win: false,
    };

    pub fn is_empty(&self) -> bool {
        *self == Self::NONE
    }
}

/// A key combination, e.g. `ctrl+shift+u`.
///
/// Parsing is case-insensitive and order-insensitive for modifiers, so
/// `Shift+Ctrl+U` and `ctrl+shift+u` are the same chord. The key part is
/// normalized to lowercase.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct KeyChord {
    modifiers: Modifiers,
    key: String,
}

impl KeyChord {
    /// Creates a chord from parts. The key is normalized to lowercase.
    pub fn new(modifiers: Modifiers, key: impl AsRef<str>) -> Result<Self, DomainError> {
        let key = key.as_ref().trim().to_ascii_lowercase();
        if key.is_empty() {
            return Err(DomainError::ParseError {
                field: "chord".to_string(),
                reason: "missing key".to_string(),
            });
        }
        if key.contains('+') || key.contains(char::is_whitespace) {
            return Err(DomainError::ParseError {
                field: "chord".to_string(),
                reason: format!("invalid key '{key}'"),
            });
        }
        Ok(Self { modifiers, key })
    }

    pub fn modifiers(&self) -> Modifiers {
        self.modifiers
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl FromStr for KeyChord {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse_err = |reason: String| DomainError::ParseError {
            field: "chord".to_string(),
            reason,
        };

        let parts: Vec<&str> = s.split('+').map(str::trim).collect();
        let (key, mods) = match parts.split_last() {
            Some((key, mods)) if !key.is_empty() => (*key, mods),
            _ => return Err(parse_err(format!("missing key in '{s}'"))),
        };

        let mut modifiers = Modifiers::NONE;
        for part in mods {
            let flag = match part.to_ascii_lowercase().as_str() {
                "ctrl" | "control" => &mut modifiers.ctrl,
                "alt" => &mut modifiers.alt,
                "shift" => &mut modifiers.shift,
                "win" | "super" | "meta" => &mut modifiers.win,
                other => return Err(parse_err(format!("unknown modifier '{other}'"))),
            };
            if *flag {
                return Err(parse_err(format!("duplicate modifier '{part}'")));
            }
            *flag = true;
        }

        Self::new(modifiers, key)
    }
}

impl fmt::Display for KeyChord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.modifiers.ctrl {
            write!(f, "ctrl+")?;
        }
        if self.modifiers.alt {
            write!(f, "alt+")?;
        }
        if self.modifiers.shift {
            write!(f, "shift+")?;
        }
        if self.modifiers.win {
            write!(f, "win+")?;
        }
        write!(f, "{}", self.key)
    }
}

impl TryFrom<String> for KeyChord {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<KeyChord> for String {
    fn from(chord: KeyChord) -> Self {
        chord.to_string()
    }
}
