//! Wire envelope codec.
//!
//! Every channel write carries exactly one envelope: a UTF-8 JSON object with
//! the keys `event` (string) and `data` (any JSON value). There is no length
//! prefix and no batching.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Errors produced while encoding or decoding an envelope.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("payload could not be serialized: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("payload is not valid JSON: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("payload is not a JSON object")]
    NotAnObject,
    #[error("payload has no event name")]
    MissingEvent,
    #[error("event name must be a string")]
    InvalidEvent,
    #[error("event name must not be empty")]
    EmptyEvent,
}

impl EnvelopeError {
    /// `MissingEvent` payloads are dropped quietly by readers; everything else
    /// is protocol noise worth a warning.
    pub fn is_missing_event(&self) -> bool {
        matches!(self, Self::MissingEvent)
    }
}

/// A decoded `{event, data}` message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    pub data: Value,
}

impl Envelope {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    pub fn encode(&self) -> Result<Bytes, EnvelopeError> {
        encode(&self.event, &self.data)
    }
}

/// Borrowed form used on the send path so callers never clone their payload.
#[derive(Serialize)]
struct WireEnvelope<'a, T: ?Sized> {
    event: &'a str,
    data: &'a T,
}

/// Encode an event and its payload as one wire envelope. The event name must
/// be non-empty, since readers drop envelopes without one.
pub fn encode<T>(event: &str, data: &T) -> Result<Bytes, EnvelopeError>
where
    T: Serialize + ?Sized,
{
    if event.is_empty() {
        return Err(EnvelopeError::EmptyEvent);
    }
    let wire = WireEnvelope { event, data };
    serde_json::to_vec(&wire)
        .map(Bytes::from)
        .map_err(EnvelopeError::Serialize)
}

/// Decode one wire envelope.
///
/// A missing `data` key decodes as `null`. Keys other than `event` and `data`
/// are ignored.
pub fn decode(payload: &[u8]) -> Result<Envelope, EnvelopeError> {
    let value: Value = serde_json::from_slice(payload).map_err(EnvelopeError::Malformed)?;
    let Value::Object(mut map) = value else {
        return Err(EnvelopeError::NotAnObject);
    };

    let event = match map.remove("event") {
        None | Some(Value::Null) => return Err(EnvelopeError::MissingEvent),
        Some(Value::String(s)) if s.is_empty() => return Err(EnvelopeError::MissingEvent),
        Some(Value::String(s)) => s,
        Some(_) => return Err(EnvelopeError::InvalidEvent),
    };
    let data = map.remove("data").unwrap_or(Value::Null);

    Ok(Envelope { event, data })
}
