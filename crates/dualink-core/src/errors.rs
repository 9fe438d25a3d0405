use std::time::Duration;

use crate::envelope::EnvelopeError;
use crate::events::ChannelKind;
use crate::state::{CloseSource, ConnectionState};

/// Errors raised by a connection primitive and its channels.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum LinkError {
    #[error("invalid target: {0}")]
    InvalidTarget(String),
    #[error("connection refused: {0}")]
    Refused(String),
    #[error("connection reset: {0}")]
    Reset(String),
    #[error("channel closed")]
    ChannelClosed,
    #[error("channel unavailable: {0}")]
    Unavailable(String),
    #[error("timed out after {0:?}")]
    TimedOut(Duration),
}

/// Errors surfaced by the transport to the application.
///
/// None of these tear down a healthy connection on their own: they are
/// returned to the caller and logged at the point they occur.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connection(#[source] LinkError),
    #[error("{0} channel not available")]
    ChannelUnavailable(ChannelKind),
    #[error("failed to decode envelope: {0}")]
    Decode(#[source] EnvelopeError),
    #[error("failed to encode envelope: {0}")]
    Encode(#[source] EnvelopeError),
    #[error("failed to write to {channel} channel: {source}")]
    SendWrite {
        channel: ChannelKind,
        source: LinkError,
    },
    #[error("{origin} closed with error: {error}")]
    CloseSignal {
        origin: CloseSource,
        error: LinkError,
    },
    #[error("invalid state: expected {expected}, found {actual}")]
    InvalidState {
        expected: ConnectionState,
        actual: ConnectionState,
    },
}

impl TransportError {
    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Connection(_) => "connection_error",
            Self::ChannelUnavailable(_) => "channel_unavailable",
            Self::Decode(_) => "decode_error",
            Self::Encode(_) => "encode_error",
            Self::SendWrite { .. } => "send_write_error",
            Self::CloseSignal { .. } => "close_signal_error",
            Self::InvalidState { .. } => "invalid_state",
        }
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;
