//! Length-prefixed JSON framing for session channels.
//!
//! Each frame is a 4-byte big-endian length followed by a JSON body of at
//! most [`MAX_FRAME_LEN`] bytes. Anything that does not decode cleanly
//! (oversize body, invalid JSON, unknown message kind) is a protocol
//! violation and the channel must be closed.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::LengthDelimitedCodec;

/// Maximum frame body, matching the game-side module's pipe buffer.
pub const MAX_FRAME_LEN: usize = 512;

/// A transport wrapped with the channel codec.
pub type Framed<T> = tokio_util::codec::Framed<T, LengthDelimitedCodec>;

/// Builds the channel codec.
pub fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .big_endian()
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec()
}

/// Wraps a byte stream in the channel codec.
pub fn framed<T>(io: T) -> Framed<T>
where
    T: AsyncRead + AsyncWrite,
{
    tokio_util::codec::Framed::new(io, codec())
}

/// Serializes a message into a frame body.
///
/// # Errors
/// `FrameError::TooLarge` if the body would exceed [`MAX_FRAME_LEN`].
pub fn encode<M: Serialize>(msg: &M) -> Result<Bytes, FrameError> {
    let body = serde_json::to_vec(msg).map_err(|e| FrameError::Malformed(e.to_string()))?;
    if body.len() > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge {
            size: body.len(),
            max: MAX_FRAME_LEN,
        });
    }
    Ok(Bytes::from(body))
}

/// Parses a frame body.
///
/// # Errors
/// `FrameError::Malformed` on invalid JSON or an unknown message shape.
pub fn decode<M: DeserializeOwned>(body: &[u8]) -> Result<M, FrameError> {
    if body.len() > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge {
            size: body.len(),
            max: MAX_FRAME_LEN,
        });
    }
    serde_json::from_slice(body).map_err(|e| FrameError::Malformed(e.to_string()))
}

/// Writes one message and flushes.
pub async fn send_frame<T, M>(framed: &mut Framed<T>, msg: &M) -> Result<(), FrameError>
where
    T: AsyncRead + AsyncWrite + Unpin,
    M: Serialize,
{
    let body = encode(msg)?;
    framed.send(body).await.map_err(FrameError::from_codec)
}

/// Reads one message. `Ok(None)` means the peer closed the channel cleanly.
pub async fn recv_frame<T, M>(framed: &mut Framed<T>) -> Result<Option<M>, FrameError>
where
    T: AsyncRead + AsyncWrite + Unpin,
    M: DeserializeOwned,
{
    match framed.next().await {
        None => Ok(None),
        Some(Ok(body)) => decode(&body).map(Some),
        Some(Err(e)) => Err(FrameError::from_codec(e)),
    }
}

/// Errors raised while framing or parsing channel traffic.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Frame too large: {size} bytes (max: {max})")]
    TooLarge { size: usize, max: usize },

    /// The codec refused a length prefix over the limit.
    #[error("Frame length exceeds {max} bytes")]
    LengthExceeded { max: usize },

    #[error("Malformed frame: {0}")]
    Malformed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FrameError {
    /// Maps a codec error; the codec reports oversize prefixes as `InvalidData`.
    pub fn from_codec(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::InvalidData {
            Self::LengthExceeded { max: MAX_FRAME_LEN }
        } else {
            Self::Io(err)
        }
    }

    /// True for violations of the framing or message format.
    pub fn is_protocol_violation(&self) -> bool {
        !matches!(self, Self::Io(_))
    }
}
