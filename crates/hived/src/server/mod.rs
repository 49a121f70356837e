//! Channel server: accepts module connections.
//!
//! The server:
//! - Listens on a Unix socket (or a named pipe on Windows), refusing a path
//!   another live supervisor already serves
//! - Spawns a ConnectionHandler for each module on a `TaskTracker`
//! - On cancellation stops accepting, lets every connection report its
//!   closure to the registry, then waits for all of them
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │  ChannelServer  │
//! │  (listener)     │
//! └───────┬─────────┘
//!         │ accept()
//!         ▼
//! ┌─────────────────┐     ┌─────────────────┐
//! │ConnectionHandler│────▶│  RegistryHandle │
//! │  (per module)   │◀────│  (outbound)     │
//! └─────────────────┘     └─────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Accept errors are logged and allow continued operation

mod connection;

pub use connection::{ConnectionError, ConnectionHandler, HANDSHAKE_GRACE};

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};
#[cfg(unix)]
use tracing::warn;

use crate::registry::RegistryHandle;

/// Default channel path
#[cfg(unix)]
pub const DEFAULT_CHANNEL_PATH: &str = "/tmp/hive.sock";

/// Default channel path
#[cfg(windows)]
pub const DEFAULT_CHANNEL_PATH: &str = r"\\.\pipe\hive";

#[cfg(unix)]
type Listener = tokio::net::UnixListener;

#[cfg(windows)]
type Listener = tokio::net::windows::named_pipe::NamedPipeServer;

/// Listener for module channels.
///
/// Only one server may own a channel path. [`ChannelServer::bind`] refuses a
/// path another live supervisor is listening on, so its modules never
/// handshake with the wrong registry.
pub struct ChannelServer {
    path: PathBuf,
    listener: Listener,
    registry: RegistryHandle,
    cancel_token: CancellationToken,
    connection_counter: AtomicU64,
    tracker: TaskTracker,
}

impl ChannelServer {
    /// Claims the channel path and starts listening.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn bind(
        path: impl Into<PathBuf>,
        registry: RegistryHandle,
        cancel_token: CancellationToken,
    ) -> Result<Self, ServerError> {
        let path = path.into();
        let listener = bind_listener(&path)?;
        info!(channel = %path.display(), "Channel server listening");

        Ok(Self {
            path,
            listener,
            registry,
            cancel_token,
            connection_counter: AtomicU64::new(0),
            tracker: TaskTracker::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of connection tasks still running.
    pub fn active_connections(&self) -> usize {
        self.tracker.len()
    }

    /// Runs the server until the cancellation token is triggered.
    ///
    /// Returns after every connection task has finished.
    pub async fn run(&mut self) -> Result<(), ServerError> {
        let result = self.accept_loop().await;

        self.tracker.close();
        debug!(connections = self.tracker.len(), "Waiting for connections to close");
        self.tracker.wait().await;

        self.cleanup();
        result
    }

    /// Spawns a handler for an already-connected stream.
    pub fn spawn_connection<T>(&self, io: T)
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let connection = self.connection_counter.fetch_add(1, Ordering::Relaxed);
        let handler = ConnectionHandler::new(
            io,
            self.registry.clone(),
            self.cancel_token.child_token(),
            connection,
        );
        self.tracker.spawn(handler.run());
    }

    #[cfg(unix)]
    async fn accept_loop(&mut self) -> Result<(), ServerError> {
        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    info!("Channel server shutdown requested");
                    return Ok(());
                }

                result = self.listener.accept() => {
                    match result {
                        Ok((stream, _addr)) => self.spawn_connection(stream),
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
            }
        }
    }

    #[cfg(windows)]
    async fn accept_loop(&mut self) -> Result<(), ServerError> {
        use tokio::net::windows::named_pipe::ServerOptions;

        loop {
            let connected = tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    info!("Channel server shutdown requested");
                    return Ok(());
                }

                result = self.listener.connect() => result,
            };

            // The next instance exists before the old one is handed off or
            // dropped, so the pipe name stays held.
            let next = ServerOptions::new()
                .create(&self.path)
                .map_err(|e| setup_error(&self.path, e))?;
            let client = std::mem::replace(&mut self.listener, next);

            match connected {
                Ok(()) => self.spawn_connection(client),
                Err(e) => error!(error = %e, "Failed to accept connection"),
            }
        }
    }

    fn cleanup(&self) {
        self.remove_socket_file();
        info!("Channel server stopped");
    }

    #[cfg(unix)]
    fn remove_socket_file(&self) {
        if self.path.exists() {
            if let Err(e) = std::fs::remove_file(&self.path) {
                warn!(
                    channel = %self.path.display(),
                    error = %e,
                    "Failed to remove socket file"
                );
            }
        }
    }

    /// Named pipes vanish with their last handle.
    #[cfg(windows)]
    fn remove_socket_file(&self) {}
}

/// Binds the socket, replacing a stale file but never a live server.
#[cfg(unix)]
fn bind_listener(path: &Path) -> Result<Listener, ServerError> {
    if path.exists() {
        if std::os::unix::net::UnixStream::connect(path).is_ok() {
            return Err(ServerError::AlreadyRunning {
                path: path.to_path_buf(),
            });
        }
        warn!(channel = %path.display(), "Removing stale socket file");
        std::fs::remove_file(path).map_err(|e| setup_error(path, e))?;
    }

    if let Some(parent) = path.parent() {
        if !parent.exists() {
            std::fs::create_dir_all(parent).map_err(|e| setup_error(path, e))?;
        }
    }

    Listener::bind(path).map_err(|e| setup_error(path, e))
}

/// Creates the first pipe instance; fails if another server holds the name.
#[cfg(windows)]
fn bind_listener(path: &Path) -> Result<Listener, ServerError> {
    use tokio::net::windows::named_pipe::ServerOptions;

    ServerOptions::new()
        .first_pipe_instance(true)
        .create(path)
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::PermissionDenied {
                ServerError::AlreadyRunning {
                    path: path.to_path_buf(),
                }
            } else {
                setup_error(path, e)
            }
        })
}

fn setup_error(path: &Path, error: std::io::Error) -> ServerError {
    ServerError::ChannelSetup {
        path: path.to_path_buf(),
        error: error.to_string(),
    }
}

/// Errors that can occur in server operations.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to set up channel at {path}: {error}")]
    ChannelSetup { path: PathBuf, error: String },

    #[error("Another supervisor is already listening on {path}")]
    AlreadyRunning { path: PathBuf },
}
