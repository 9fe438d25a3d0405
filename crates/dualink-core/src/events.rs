use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The three lifecycle event kinds a transport publishes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Ready,
    Message,
    Closed,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Message => "message",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events delivered to bus subscribers.
///
/// `Message` carries the application event name and payload decoded from an
/// inbound envelope. It does not record which channel the envelope arrived on.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportEvent {
    Ready,
    Message { event: String, data: Value },
    Closed,
}

impl TransportEvent {
    pub fn message(event: impl Into<String>, data: Value) -> Self {
        Self::Message {
            event: event.into(),
            data,
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            Self::Ready => EventKind::Ready,
            Self::Message { .. } => EventKind::Message,
            Self::Closed => EventKind::Closed,
        }
    }
}

/// The two logical channels multiplexed over one connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    /// Ordered, lossless bidirectional stream.
    Reliable,
    /// Unordered, lossy datagrams.
    Unreliable,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reliable => "reliable",
            Self::Unreliable => "unreliable",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn event_kind_matches_variant() {
        assert_eq!(TransportEvent::Ready.kind(), EventKind::Ready);
        assert_eq!(TransportEvent::Closed.kind(), EventKind::Closed);
        assert_eq!(
            TransportEvent::message("score", json!({"v": 7})).kind(),
            EventKind::Message
        );
    }

    #[test]
    fn event_kind_wire_names() {
        assert_eq!(EventKind::Ready.to_string(), "ready");
        assert_eq!(EventKind::Message.to_string(), "message");
        assert_eq!(EventKind::Closed.to_string(), "closed");
    }

    #[test]
    fn message_event_serializes_tagged() {
        let evt = TransportEvent::message("score", json!({"v": 7}));
        let value = serde_json::to_value(&evt).unwrap();
        assert_eq!(value, json!({"type": "message", "event": "score", "data": {"v": 7}}));
    }

    #[test]
    fn channel_kind_display() {
        assert_eq!(ChannelKind::Reliable.to_string(), "reliable");
        assert_eq!(ChannelKind::Unreliable.to_string(), "unreliable");
    }
}
