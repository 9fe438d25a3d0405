use std::sync::Arc;

use bytes::Bytes;
use dualink_core::{ChannelKind, LinkError};

use crate::connection::{ChannelReader, ChannelWriter, Duplex};

/// Write side, read side and closed signals of one logical channel.
///
/// Owned by the transport; the read side is shared with that channel's read
/// loop and close watcher.
#[derive(Clone)]
pub struct ChannelHandle {
    kind: ChannelKind,
    writer: Arc<dyn ChannelWriter>,
    reader: Arc<dyn ChannelReader>,
}

impl ChannelHandle {
    pub fn new(kind: ChannelKind, duplex: Duplex) -> Self {
        Self {
            kind,
            writer: duplex.writer,
            reader: duplex.reader,
        }
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub async fn write(&self, payload: Bytes) -> Result<(), LinkError> {
        self.writer.write(payload).await
    }

    pub fn writer(&self) -> Arc<dyn ChannelWriter> {
        Arc::clone(&self.writer)
    }

    pub fn reader(&self) -> Arc<dyn ChannelReader> {
        Arc::clone(&self.reader)
    }
}

impl std::fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelHandle").field("kind", &self.kind).finish()
    }
}
