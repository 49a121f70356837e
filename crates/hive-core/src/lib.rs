//! hive core - shared types for the injection supervisor
//!
//! This crate provides the domain types shared between the injection
//! engine (hive-inject), the wire protocol (hive-protocol) and the
//! supervisor daemon (hived).
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod chord;
pub mod error;
pub mod process;
pub mod session;

// Re-exports for convenience
pub use chord::{KeyChord, Modifiers};
pub use error::{DomainError, DomainResult};
pub use process::{ProcessKey, RemoteAddress};
pub use session::{ClassLevel, SessionDomain, SessionId, SessionState, SessionView, WindowId};
