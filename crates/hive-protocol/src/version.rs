//! Channel protocol versioning.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Version of the supervisor/module channel protocol, `major.minor`.
///
/// A module and supervisor interoperate when their majors match. Minor bumps
/// only add optional fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolVersion {
    pub major: u16,
    pub minor: u16,
}

impl ProtocolVersion {
    /// Version spoken by this build.
    pub const CURRENT: ProtocolVersion = ProtocolVersion { major: 1, minor: 0 };

    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    pub fn is_compatible_with(&self, other: &ProtocolVersion) -> bool {
        self.major == other.major
    }

    /// Checks a peer's version against ours.
    ///
    /// # Errors
    /// `VersionError::Incompatible` when the majors differ.
    pub fn negotiate(&self, peer: &ProtocolVersion) -> Result<(), VersionError> {
        if self.is_compatible_with(peer) {
            Ok(())
        } else {
            Err(VersionError::Incompatible {
                got: *peer,
                expected: *self,
            })
        }
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for ProtocolVersion {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || VersionError::InvalidFormat(s.to_string());
        let (major, minor) = s.split_once('.').ok_or_else(invalid)?;
        Ok(Self {
            major: major.parse().map_err(|_| invalid())?,
            minor: minor.parse().map_err(|_| invalid())?,
        })
    }
}

/// Errors that can occur with version handling.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VersionError {
    #[error("Invalid version format: {0}")]
    InvalidFormat(String),

    #[error("Incompatible protocol version: got {got}, expected {expected}")]
    Incompatible {
        got: ProtocolVersion,
        expected: ProtocolVersion,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_parse() {
        let v: ProtocolVersion = "1.3".parse().unwrap();
        assert_eq!(v, ProtocolVersion::new(1, 3));
        assert!("1".parse::<ProtocolVersion>().is_err());
        assert!("1.0.0".parse::<ProtocolVersion>().is_err());
        assert!("x.y".parse::<ProtocolVersion>().is_err());
    }

    #[test]
    fn test_negotiate() {
        let ours = ProtocolVersion::new(1, 0);
        assert!(ours.negotiate(&ProtocolVersion::new(1, 7)).is_ok());
        assert_eq!(
            ours.negotiate(&ProtocolVersion::new(2, 0)),
            Err(VersionError::Incompatible {
                got: ProtocolVersion::new(2, 0),
                expected: ours,
            })
        );
    }
}
