//! hive protocol - wire format of the supervisor/module channel
//!
//! A module connects, sends a [`Handshake`], receives a [`HandshakeReply`]
//! and then exchanges [`PipeMessage`] frames with the supervisor. Frames are
//! length-prefixed JSON (see [`frame`]).

pub mod frame;
pub mod message;
pub mod version;

pub use frame::{framed, recv_frame, send_frame, FrameError, Framed, MAX_FRAME_LEN};
pub use message::{Handshake, HandshakeReply, MessageKind, PipeMessage};
pub use version::{ProtocolVersion, VersionError};
