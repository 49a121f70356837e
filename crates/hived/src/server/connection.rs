//! Connection handler for a single module channel.
//!
//! Each accepted connection gets its own `ConnectionHandler` that:
//! - Reads the handshake and negotiates the protocol version
//! - Attaches the channel to its session in the registry
//! - Applies inbound messages one at a time, awaiting the registry's reply
//!   before reading the next frame
//! - Writes messages the supervisor dispatches to the session
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Connection errors are logged and result in graceful disconnect

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use hive_core::SessionId;
use hive_protocol::{
    framed, recv_frame, send_frame, FrameError, Framed, Handshake, HandshakeReply, PipeMessage,
    ProtocolVersion, VersionError,
};

use crate::registry::{CloseCause, MessageOutcome, RegistryError, RegistryHandle};

/// Time allowed for the module's first frame
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a handshake for an unknown pid is retried.
///
/// A module can connect before the supervisor has registered its process.
pub const HANDSHAKE_GRACE: Duration = Duration::from_millis(500);

const ACCEPT_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Write timeout (10 seconds)
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// One step of the message loop.
enum Step {
    Shutdown,
    Outbound(Option<PipeMessage>),
    Inbound(Result<Option<PipeMessage>, FrameError>),
}

/// Handler for one module connection.
pub struct ConnectionHandler<T> {
    framed: Framed<T>,
    registry: RegistryHandle,
    cancel: CancellationToken,
    connection: u64,
}

impl<T> ConnectionHandler<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    /// Creates a handler over any byte stream (Unix socket, named pipe,
    /// in-memory duplex).
    pub fn new(io: T, registry: RegistryHandle, cancel: CancellationToken, connection: u64) -> Self {
        Self {
            framed: framed(io),
            registry,
            cancel,
            connection,
        }
    }

    /// Runs the connection until the channel ends.
    ///
    /// Returns the session the channel was attached to, if the handshake
    /// succeeded. By the time this returns, the registry has processed the
    /// channel's closure.
    pub async fn run(mut self) -> Option<SessionId> {
        debug!(connection = self.connection, "Module connected");

        let (session_id, outbound) = match self.handle_handshake().await {
            Ok(attached) => attached,
            Err(e) => {
                match &e {
                    ConnectionError::Eof | ConnectionError::Shutdown => {
                        debug!(connection = self.connection, error = %e, "Connection ended before handshake")
                    }
                    _ => warn!(connection = self.connection, error = %e, "Handshake failed"),
                }
                return None;
            }
        };

        let cause = self.message_loop(&session_id, outbound).await;

        if let Some(cause) = cause {
            if let Err(e) = self
                .registry
                .channel_closed(session_id.clone(), self.connection, cause)
                .await
            {
                debug!(session_id = %session_id, error = %e, "Registry gone before close was reported");
            }
        }

        debug!(session_id = %session_id, connection = self.connection, "Connection closed");
        Some(session_id)
    }

    /// Reads the handshake and attaches the channel.
    async fn handle_handshake(
        &mut self,
    ) -> Result<(SessionId, mpsc::UnboundedReceiver<PipeMessage>), ConnectionError> {
        let first = tokio::select! {
            _ = self.cancel.cancelled() => return Err(ConnectionError::Shutdown),
            first = timeout(HANDSHAKE_TIMEOUT, recv_frame::<_, Handshake>(&mut self.framed)) => first,
        };

        let handshake = match first {
            Err(_) => return Err(ConnectionError::HandshakeTimeout),
            Ok(Ok(Some(handshake))) => handshake,
            Ok(Ok(None)) => return Err(ConnectionError::Eof),
            Ok(Err(e)) => return Err(ConnectionError::Frame(e)),
        };

        debug!(
            connection = self.connection,
            pid = handshake.pid,
            version = %handshake.protocol_version,
            "Handshake received"
        );

        if let Err(e) = ProtocolVersion::CURRENT.negotiate(&handshake.protocol_version) {
            self.reject(&e.to_string()).await;
            return Err(ConnectionError::Version(e));
        }

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let session_id = match self.accept_with_grace(&handshake, outbound_tx).await {
            Ok(session_id) => session_id,
            Err(e) => {
                self.reject(&e.to_string()).await;
                return Err(ConnectionError::Registry(e));
            }
        };

        if let Err(e) = self.send(&HandshakeReply::welcome(session_id.clone())).await {
            // The registry already holds this channel; release it.
            let _ = self
                .registry
                .channel_closed(session_id, self.connection, CloseCause::Disconnected)
                .await;
            return Err(e);
        }

        info!(
            session_id = %session_id,
            pid = handshake.pid,
            connection = self.connection,
            "Module channel open"
        );
        Ok((session_id, outbound_rx))
    }

    /// Attaches the channel, retrying an unknown pid for [`HANDSHAKE_GRACE`].
    async fn accept_with_grace(
        &mut self,
        handshake: &Handshake,
        outbound: mpsc::UnboundedSender<PipeMessage>,
    ) -> Result<SessionId, RegistryError> {
        let deadline = Instant::now() + HANDSHAKE_GRACE;
        loop {
            match self
                .registry
                .accept(handshake.clone(), self.connection, outbound.clone())
                .await
            {
                Err(e) if e.is_retryable_handshake() && Instant::now() < deadline => {
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(e),
                        _ = sleep(ACCEPT_RETRY_INTERVAL) => {}
                    }
                }
                result => return result,
            }
        }
    }

    /// Pumps frames in both directions.
    ///
    /// Returns the close cause to report, or `None` when the registry already
    /// removed the session.
    async fn message_loop(
        &mut self,
        session_id: &SessionId,
        mut outbound: mpsc::UnboundedReceiver<PipeMessage>,
    ) -> Option<CloseCause> {
        loop {
            let step = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Step::Shutdown,
                out = outbound.recv() => Step::Outbound(out),
                frame = recv_frame::<_, PipeMessage>(&mut self.framed) => Step::Inbound(frame),
            };

            match step {
                Step::Shutdown => {
                    debug!(session_id = %session_id, "Closing channel for shutdown");
                    return Some(CloseCause::Shutdown);
                }
                Step::Outbound(None) => {
                    debug!(session_id = %session_id, "Session removed by registry");
                    return None;
                }
                Step::Outbound(Some(message)) => {
                    if let Err(e) = self.send(&message).await {
                        warn!(session_id = %session_id, error = %e, "Failed to write to module");
                        return Some(CloseCause::Disconnected);
                    }
                }
                Step::Inbound(Ok(None)) => return Some(CloseCause::Disconnected),
                Step::Inbound(Err(e)) if e.is_protocol_violation() => {
                    warn!(session_id = %session_id, error = %e, "Protocol violation, closing channel");
                    return Some(CloseCause::ProtocolViolation);
                }
                Step::Inbound(Err(e)) => {
                    debug!(session_id = %session_id, error = %e, "Channel read failed");
                    return Some(CloseCause::Disconnected);
                }
                Step::Inbound(Ok(Some(message))) => {
                    let kind = message.kind();
                    match self.registry.apply_message(session_id.clone(), message).await {
                        Ok(MessageOutcome::Continue) => {}
                        Ok(MessageOutcome::Ended) => return None,
                        Err(RegistryError::InvalidTransition(e)) => {
                            warn!(session_id = %session_id, kind = %kind, error = %e, "Message rejected");
                        }
                        Err(RegistryError::SessionNotFound(_)) => return None,
                        Err(e) => {
                            debug!(session_id = %session_id, error = %e, "Registry unavailable");
                            return None;
                        }
                    }
                }
            }
        }
    }

    async fn send<M: serde::Serialize>(&mut self, msg: &M) -> Result<(), ConnectionError> {
        match timeout(WRITE_TIMEOUT, send_frame(&mut self.framed, msg)).await {
            Ok(result) => result.map_err(ConnectionError::Frame),
            Err(_) => Err(ConnectionError::WriteTimeout),
        }
    }

    async fn reject(&mut self, reason: &str) {
        if let Err(e) = self.send(&HandshakeReply::rejected(reason)).await {
            debug!(connection = self.connection, error = %e, "Failed to send rejection");
        }
    }
}

/// Errors that can occur during connection handling.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Protocol version mismatch: {0}")]
    Version(#[from] VersionError),

    #[error("Handshake refused: {0}")]
    Registry(#[from] RegistryError),

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("Connection closed")]
    Eof,

    #[error("No handshake within {}s", HANDSHAKE_TIMEOUT.as_secs())]
    HandshakeTimeout,

    #[error("Write timeout")]
    WriteTimeout,

    #[error("Supervisor shutting down")]
    Shutdown,
}
