//! Boundary to the underlying connection primitive.
//!
//! A connection offers a readiness signal, a closed signal, one unreliable
//! datagram channel and any number of bidirectional ordered streams. The
//! transport only needs one stream. Implementations decide how the bytes move;
//! the transport never inspects anything below this interface.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dualink_core::LinkError;

/// Write half of a channel. Each `write` carries exactly one payload.
#[async_trait]
pub trait ChannelWriter: Send + Sync {
    async fn write(&self, payload: Bytes) -> Result<(), LinkError>;

    /// Resolves once the writer can no longer be used: `Ok` for a graceful
    /// close, `Err` when it was torn down abruptly.
    async fn closed(&self) -> Result<(), LinkError>;
}

/// Read half of a channel.
#[async_trait]
pub trait ChannelReader: Send + Sync {
    /// Next payload, or `Ok(None)` once the channel has no more data.
    async fn read(&self) -> Result<Option<Bytes>, LinkError>;

    /// Resolves once the reader is closed, same convention as
    /// [`ChannelWriter::closed`].
    async fn closed(&self) -> Result<(), LinkError>;
}

/// A writer/reader pair as handed out by a connection.
pub struct Duplex {
    pub writer: Arc<dyn ChannelWriter>,
    pub reader: Arc<dyn ChannelReader>,
}

/// An established (or establishing) connection.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Resolves once the connection is usable.
    async fn ready(&self) -> Result<(), LinkError>;

    /// Resolves when the connection terminates.
    async fn closed(&self) -> Result<(), LinkError>;

    /// The unreliable, unordered datagram channel.
    fn datagrams(&self) -> Result<Duplex, LinkError>;

    /// Open one bidirectional ordered stream.
    async fn open_bi(&self) -> Result<Duplex, LinkError>;

    /// Close the connection. Idempotent.
    fn close(&self);
}

/// Creates connections for a target. Construction is cheap; readiness is
/// awaited separately through [`Connection::ready`].
pub trait Connector: Send + Sync {
    fn open(&self, target: &str) -> Result<Arc<dyn Connection>, LinkError>;
}
