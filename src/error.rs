//! Error types
//!
//! Errors are grouped by the component that raises them. Dropped frames are
//! not errors anywhere in this crate: they are counted and reported through
//! `WriteOutcome` / `PushOutcome` instead.

use std::io;

use thiserror::Error;

use crate::channel::ChannelId;

/// Result alias using the crate-level [`Error`]
pub type Result<T> = std::result::Result<T, Error>;

/// Crate-level error
#[derive(Debug, Error)]
pub enum Error {
    #[error("shared memory: {0}")]
    Shm(#[from] ShmError),

    #[error("handshake rejected: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("packet: {0}")]
    Packet(#[from] PacketError),

    #[error("io: {0}")]
    Io(#[from] io::Error),

    #[error("websocket: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Shared-memory ring errors
#[derive(Debug, Error)]
pub enum ShmError {
    /// The segment or one of its semaphores could not be created or opened.
    /// Fatal to the channel.
    #[error("segment error on {name}: {source}")]
    Segment {
        name: String,
        #[source]
        source: io::Error,
    },

    /// Magic or version mismatch. Fatal to the consumer that observed it.
    #[error("incompatible segment format: magic={magic:#010x} version={version}")]
    IncompatibleFormat { magic: u32, version: u32 },

    /// No producer has created the segment yet. Retryable.
    #[error("no producer for {name}")]
    NotFound { name: String },

    /// Payload exceeds the slot capacity; the ring was not touched.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// The producer has been destroyed or has died.
    #[error("channel unavailable")]
    ChannelUnavailable,

    /// A slot whose size field cannot be valid (overwritten mid-copy).
    #[error("corrupt slot {index}: size {size}")]
    CorruptSlot { index: u32, size: u32 },
}

impl ShmError {
    pub(crate) fn segment(name: &str, source: io::Error) -> Self {
        ShmError::Segment {
            name: name.to_string(),
            source,
        }
    }

    /// Whether attaching again later may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, ShmError::NotFound { .. })
    }
}

/// Reasons a client handshake is rejected before any frame is sent
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeError {
    #[error("missing channel selector")]
    MissingSelector,

    #[error("invalid channel selector: {0:?}")]
    InvalidSelector(String),

    #[error("channel {0} is not active")]
    ChannelInactive(ChannelId),

    #[error("handshake timed out")]
    Timeout,
}

/// Wire packet decode errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PacketError {
    #[error("packet too short: {len} bytes")]
    TooShort { len: usize },

    #[error("unknown channel id {0}")]
    UnknownChannel(u8),
}
