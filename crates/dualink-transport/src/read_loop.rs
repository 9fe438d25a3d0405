use std::sync::Arc;

use dualink_core::{envelope, ChannelKind, ConnectionId, EventBus, TransportError, TransportEvent};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::connection::ChannelReader;

/// Counters reported when a read loop ends.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReadLoopStats {
    /// Envelopes published as `Message` events.
    pub delivered: u64,
    /// Payloads that did not decode to an envelope.
    pub dropped: u64,
}

/// Drains one channel reader and republishes each envelope on the bus.
///
/// End of data, a failed read, and cancellation all stop the loop without
/// publishing anything; closure is reported by the transport's close watchers.
pub struct ReadLoop {
    connection_id: ConnectionId,
    channel: ChannelKind,
    reader: Arc<dyn ChannelReader>,
    bus: Arc<EventBus>,
    stop: CancellationToken,
}

impl ReadLoop {
    pub fn new(
        connection_id: ConnectionId,
        channel: ChannelKind,
        reader: Arc<dyn ChannelReader>,
        bus: Arc<EventBus>,
        stop: CancellationToken,
    ) -> Self {
        Self {
            connection_id,
            channel,
            reader,
            bus,
            stop,
        }
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<ReadLoopStats> {
        tokio::spawn(self.run())
    }

    pub async fn run(self) -> ReadLoopStats {
        let mut stats = ReadLoopStats::default();

        loop {
            let next = tokio::select! {
                biased;
                () = self.stop.cancelled() => {
                    debug!(connection_id = %self.connection_id, channel = %self.channel, "read loop cancelled");
                    break;
                }
                next = self.reader.read() => next,
            };

            let payload = match next {
                Ok(Some(payload)) => payload,
                Ok(None) => {
                    debug!(connection_id = %self.connection_id, channel = %self.channel, "channel reached end of data");
                    break;
                }
                Err(e) => {
                    debug!(connection_id = %self.connection_id, channel = %self.channel, error = %e, "channel read failed");
                    break;
                }
            };

            match envelope::decode(&payload) {
                Ok(env) => {
                    trace!(
                        connection_id = %self.connection_id,
                        channel = %self.channel,
                        event = %env.event,
                        len = payload.len(),
                        "message received"
                    );
                    stats.delivered += 1;
                    self.bus.emit(&TransportEvent::Message {
                        event: env.event,
                        data: env.data,
                    });
                }
                Err(e) if e.is_missing_event() => {
                    stats.dropped += 1;
                    debug!(
                        connection_id = %self.connection_id,
                        channel = %self.channel,
                        len = payload.len(),
                        "dropping payload without event name"
                    );
                }
                Err(e) => {
                    stats.dropped += 1;
                    let err = TransportError::Decode(e);
                    warn!(
                        connection_id = %self.connection_id,
                        channel = %self.channel,
                        len = payload.len(),
                        error = %err,
                        error_kind = err.error_kind(),
                        "dropping undecodable payload"
                    );
                }
            }
        }

        debug!(
            connection_id = %self.connection_id,
            channel = %self.channel,
            delivered = stats.delivered,
            dropped = stats.dropped,
            "read loop finished"
        );
        stats
    }
}
