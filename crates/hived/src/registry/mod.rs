//! Session registry using the actor pattern.
//!
//! The registry is the single owner of all sessions. It receives commands via
//! a tokio mpsc channel, holds the session→channel index and publishes
//! lifecycle events on a broadcast channel.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐     ┌──────────────────┐
//! │ Supervisor /    │────▶│  RegistryActor  │────▶│ Broadcast Channel│
//! │ Connections     │     └─────────────────┘     └──────────────────┘
//! └─────────────────┘             │                        │
//!         │   RegistryCommand     │   SessionEvent         │
//!         │   (mpsc channel)      │   (broadcast)          │
//!         ▼                       ▼                        ▼
//!   register / accept /    HashMap<ProcessKey,      tray, status,
//!   apply / dispatch       SessionEntry>            hotkey glue
//! ```
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()` or `.expect()` in production code
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::time::interval;
use tracing::debug;

mod actor;
mod commands;
mod handle;

pub use actor::{RegistryActor, DEFAULT_PENDING_TIMEOUT, MAX_SESSIONS};
pub use commands::{
    CloseCause, DispatchResult, MessageOutcome, Outbound, RegistryCommand, RegistryError,
    RemovalReason, SessionEvent,
};
pub use handle::RegistryHandle;

/// Channel buffer sizes
const COMMAND_BUFFER: usize = 100;
const EVENT_BUFFER: usize = 100;

/// Pending-expiry check interval in seconds
const CLEANUP_INTERVAL_SECS: u64 = 2;

/// Spawn the registry actor and return a handle for interaction.
///
/// Also spawns a background task that expires Pending sessions older than
/// `pending_timeout`. Both tasks end once every handle is dropped.
///
/// ```no_run
/// use hived::registry::{spawn_registry, DEFAULT_PENDING_TIMEOUT};
///
/// #[tokio::main]
/// async fn main() {
///     let handle = spawn_registry(DEFAULT_PENDING_TIMEOUT);
///     let sessions = handle.snapshot().await;
/// }
/// ```
pub fn spawn_registry(pending_timeout: Duration) -> RegistryHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
    let (event_tx, _) = broadcast::channel(EVENT_BUFFER);

    let actor = RegistryActor::new(cmd_rx, event_tx.clone(), pending_timeout);
    tokio::spawn(actor.run());

    let handle = RegistryHandle::new(cmd_tx.clone(), event_tx);

    spawn_cleanup_task(cmd_tx.downgrade());

    handle
}

/// Periodically asks the actor to expire Pending sessions.
///
/// Holds a weak sender so the ticker alone does not keep the actor alive.
fn spawn_cleanup_task(sender: mpsc::WeakSender<RegistryCommand>) {
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(CLEANUP_INTERVAL_SECS));

        loop {
            ticker.tick().await;

            let Some(sender) = sender.upgrade() else {
                debug!("Cleanup task stopping: registry dropped");
                break;
            };
            if sender.send(RegistryCommand::ExpirePending).await.is_err() {
                debug!("Cleanup task stopping: registry channel closed");
                break;
            }
        }
    });
}
