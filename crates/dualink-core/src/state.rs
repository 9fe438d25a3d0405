use std::fmt;

use serde::{Deserialize, Serialize};

use crate::events::ChannelKind;

/// Lifecycle of one transport: `Idle → Connecting → Open → Closed`.
///
/// `Closed` is terminal. A transport may also go straight from `Connecting`
/// to `Closed` when the connection never becomes usable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closed => "closed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which signal moved a transport to `Closed`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "channel", rename_all = "snake_case")]
pub enum CloseSource {
    /// The connection's own closed signal.
    Connection,
    /// A channel writer's closed signal.
    Writer(ChannelKind),
    /// A channel reader's closed signal.
    Reader(ChannelKind),
    /// The connection never became ready, or a channel could not be opened.
    ConnectFailed,
    /// The application closed the transport.
    Local,
}

impl fmt::Display for CloseSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection => f.write_str("connection"),
            Self::Writer(kind) => write!(f, "{kind} writer"),
            Self::Reader(kind) => write!(f, "{kind} reader"),
            Self::ConnectFailed => f.write_str("connect"),
            Self::Local => f.write_str("local"),
        }
    }
}

/// Why a transport closed. `error` is set when the signal rejected instead of
/// resolving.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseReason {
    pub source: CloseSource,
    pub error: Option<String>,
}

impl CloseReason {
    pub fn graceful(source: CloseSource) -> Self {
        Self {
            source,
            error: None,
        }
    }

    pub fn abrupt(source: CloseSource, error: impl Into<String>) -> Self {
        Self {
            source,
            error: Some(error.into()),
        }
    }

    pub fn is_graceful(&self) -> bool {
        self.error.is_none()
    }
}
