//! Connection lifecycle manager.
//!
//! A [`Transport`] owns one connection and splits it into a reliable channel
//! (one bidirectional stream) and an unreliable channel (datagrams). It moves
//! through `Idle → Connecting → Open → Closed`, emits `Ready` once the
//! channels are usable and `Closed` exactly once, whichever close signal gets
//! there first.

use std::future::Future;
use std::sync::{Arc, Weak};

use dualink_core::errors::Result;
use dualink_core::{
    envelope, ChannelKind, CloseReason, CloseSource, ConnectionId, ConnectionState, EventBus,
    EventKind, LinkError, SubscriptionId, TransportError, TransportEvent, TransportSettings,
};
use parking_lot::{Mutex, ReentrantMutex};
use serde::Serialize;
use serde_json::Value;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::connection::{Connection, Connector};
use crate::handle::ChannelHandle;
use crate::latch::CloseLatch;
use crate::read_loop::ReadLoop;

/// Client-side transport over one connection.
///
/// Dropping a transport closes its connection and aborts its background tasks.
pub struct Transport {
    inner: Arc<Inner>,
}

struct Inner {
    id: ConnectionId,
    settings: TransportSettings,
    connector: Arc<dyn Connector>,
    bus: Arc<EventBus>,
    latch: CloseLatch,
    /// Held while `Ready` or `Closed` is published, so listeners on other
    /// threads never see them out of order. Reentrant for listeners that call
    /// `close()`.
    lifecycle: ReentrantMutex<()>,
    /// Cancelled after `Closed` has been published.
    done: CancellationToken,
    state: Mutex<ConnectionState>,
    connection: Mutex<Option<Arc<dyn Connection>>>,
    reliable: Mutex<Option<ChannelHandle>>,
    unreliable: Mutex<Option<ChannelHandle>>,
    tasks: Mutex<Vec<AbortHandle>>,
}

impl Transport {
    pub fn new(settings: TransportSettings, connector: Arc<dyn Connector>) -> Self {
        Self::with_bus(settings, connector, Arc::new(EventBus::new()))
    }

    /// Build a transport that publishes on an existing bus.
    pub fn with_bus(
        settings: TransportSettings,
        connector: Arc<dyn Connector>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: ConnectionId::new(),
                settings,
                connector,
                bus,
                latch: CloseLatch::new(),
                lifecycle: ReentrantMutex::new(()),
                done: CancellationToken::new(),
                state: Mutex::new(ConnectionState::Idle),
                connection: Mutex::new(None),
                reliable: Mutex::new(None),
                unreliable: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn connection_id(&self) -> &ConnectionId {
        &self.inner.id
    }

    pub fn settings(&self) -> &TransportSettings {
        &self.inner.settings
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.inner.bus
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock()
    }

    /// What closed the transport, once it is closed.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.inner.latch.reason()
    }

    /// Resolves once the transport has reached `Closed` and the `Closed`
    /// event has been delivered.
    pub async fn closed(&self) {
        self.inner.done.cancelled().await;
    }

    /// Open the connection and both channels, then emit `Ready`.
    ///
    /// Only valid from `Idle`. On failure the transport is closed, `Closed`
    /// is emitted and the cause is returned as [`TransportError::Connection`].
    pub async fn connect(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if *state != ConnectionState::Idle {
                return Err(TransportError::InvalidState {
                    expected: ConnectionState::Idle,
                    actual: *state,
                });
            }
            *state = ConnectionState::Connecting;
        }
        info!(connection_id = %self.inner.id, url = %self.inner.settings.url, "connecting");

        match Arc::clone(&self.inner).establish().await {
            Ok(()) => Ok(()),
            Err(e) => {
                let err = TransportError::Connection(e.clone());
                error!(
                    connection_id = %self.inner.id,
                    url = %self.inner.settings.url,
                    error = %err,
                    error_kind = err.error_kind(),
                    "connect failed"
                );
                let _ = self
                    .inner
                    .shut_down(CloseReason::abrupt(CloseSource::ConnectFailed, e.to_string()));
                Err(err)
            }
        }
    }

    /// Send one envelope on the reliable (ordered) channel.
    pub async fn send_reliable<T>(&self, event: &str, data: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        self.send(ChannelKind::Reliable, event, data).await
    }

    /// Send one envelope on the unreliable (datagram) channel.
    pub async fn send_unreliable<T>(&self, event: &str, data: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        self.send(ChannelKind::Unreliable, event, data).await
    }

    async fn send<T>(&self, channel: ChannelKind, event: &str, data: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        let Some(handle) = self.inner.channel(channel) else {
            let err = TransportError::ChannelUnavailable(channel);
            error!(
                connection_id = %self.inner.id,
                channel = %channel,
                event,
                error_kind = err.error_kind(),
                "{err}"
            );
            return Err(err);
        };

        let payload = envelope::encode(event, data).map_err(|e| {
            let err = TransportError::Encode(e);
            error!(
                connection_id = %self.inner.id,
                channel = %channel,
                event,
                error = %err,
                error_kind = err.error_kind(),
                "failed to encode outgoing message"
            );
            err
        })?;

        let len = payload.len();
        handle.write(payload).await.map_err(|source| {
            let err = TransportError::SendWrite { channel, source };
            error!(
                connection_id = %self.inner.id,
                channel = %channel,
                event,
                error = %err,
                error_kind = err.error_kind(),
                "failed to send message"
            );
            err
        })?;
        trace!(connection_id = %self.inner.id, channel = %channel, event, len, "message sent");
        Ok(())
    }

    /// Close the connection locally. Emits `Closed` unless already closed.
    pub fn close(&self) {
        if self.state().is_terminal() {
            debug!(connection_id = %self.inner.id, "close requested on closed transport");
            return;
        }
        let _ = self.inner.shut_down(CloseReason::graceful(CloseSource::Local));
    }

    pub fn subscribe<F>(&self, kind: EventKind, listener: F) -> SubscriptionId
    where
        F: Fn(&TransportEvent) + Send + Sync + 'static,
    {
        self.inner.bus.subscribe(kind, listener)
    }

    pub fn subscribe_once<F>(&self, kind: EventKind, listener: F) -> SubscriptionId
    where
        F: Fn(&TransportEvent) + Send + Sync + 'static,
    {
        self.inner.bus.subscribe_once(kind, listener)
    }

    pub fn unsubscribe(&self, kind: EventKind, id: SubscriptionId) -> bool {
        self.inner.bus.unsubscribe(kind, id)
    }

    pub fn on_ready<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.subscribe(EventKind::Ready, move |_| listener())
    }

    /// Listen for inbound envelopes from either channel.
    pub fn on_message<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&str, &Value) + Send + Sync + 'static,
    {
        self.subscribe(EventKind::Message, move |evt| {
            if let TransportEvent::Message { event, data } = evt {
                listener(event, data);
            }
        })
    }

    pub fn on_closed<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.subscribe(EventKind::Closed, move |_| listener())
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        if self.state() != ConnectionState::Idle {
            let _ = self.inner.shut_down(CloseReason::graceful(CloseSource::Local));
        }
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("connection_id", &self.inner.id)
            .field("url", &self.inner.settings.url)
            .field("state", &self.state())
            .finish()
    }
}

impl Inner {
    fn channel(&self, kind: ChannelKind) -> Option<ChannelHandle> {
        match kind {
            ChannelKind::Reliable => self.reliable.lock().clone(),
            ChannelKind::Unreliable => self.unreliable.lock().clone(),
        }
    }

    async fn establish(self: Arc<Self>) -> std::result::Result<(), LinkError> {
        let conn = self.connector.open(&self.settings.url)?;
        *self.connection.lock() = Some(Arc::clone(&conn));
        if self.latch.is_fired() {
            conn.close();
            return Err(LinkError::Reset("transport closed while connecting".into()));
        }

        let (reliable, unreliable) = match self.settings.connect_timeout() {
            Some(limit) => tokio::time::timeout(limit, self.acquire(&conn))
                .await
                .map_err(|_| LinkError::TimedOut(limit))??,
            None => self.acquire(&conn).await?,
        };

        {
            let _lifecycle = self.lifecycle.lock();
            {
                let mut state = self.state.lock();
                if *state != ConnectionState::Connecting {
                    return Err(LinkError::Reset("transport closed while connecting".into()));
                }
                *self.reliable.lock() = Some(reliable.clone());
                *self.unreliable.lock() = Some(unreliable.clone());
                *state = ConnectionState::Open;
            }
            info!(connection_id = %self.id, url = %self.settings.url, "transport open");
            self.bus.emit(&TransportEvent::Ready);
        }

        self.spawn_watcher(CloseSource::Connection, {
            let conn = Arc::clone(&conn);
            async move { conn.closed().await }
        });
        for handle in [&reliable, &unreliable] {
            let kind = handle.kind();
            let writer = handle.writer();
            self.spawn_watcher(CloseSource::Writer(kind), async move { writer.closed().await });
            let reader = handle.reader();
            self.spawn_watcher(CloseSource::Reader(kind), async move { reader.closed().await });
        }
        for handle in [&reliable, &unreliable] {
            let task = ReadLoop::new(
                self.id.clone(),
                handle.kind(),
                handle.reader(),
                Arc::clone(&self.bus),
                self.latch.token(),
            )
            .spawn();
            self.tasks.lock().push(task.abort_handle());
        }
        Ok(())
    }

    /// Wait for readiness, then take the datagram channel and open the stream.
    async fn acquire(
        &self,
        conn: &Arc<dyn Connection>,
    ) -> std::result::Result<(ChannelHandle, ChannelHandle), LinkError> {
        tokio::select! {
            biased;
            () = self.latch.fired() => {
                return Err(LinkError::Reset("transport closed while connecting".into()));
            }
            result = conn.closed() => {
                return Err(result.err().unwrap_or_else(|| {
                    LinkError::Reset("connection closed before ready".into())
                }));
            }
            result = conn.ready() => result?,
        }
        debug!(connection_id = %self.id, "connection ready, acquiring channels");

        let unreliable = ChannelHandle::new(ChannelKind::Unreliable, conn.datagrams()?);
        let reliable = ChannelHandle::new(ChannelKind::Reliable, conn.open_bi().await?);
        Ok((reliable, unreliable))
    }

    fn spawn_watcher<F>(self: &Arc<Self>, source: CloseSource, signal: F)
    where
        F: Future<Output = std::result::Result<(), LinkError>> + Send + 'static,
    {
        let inner: Weak<Self> = Arc::downgrade(self);
        let stop = self.latch.token();
        let task = tokio::spawn(async move {
            let result = tokio::select! {
                biased;
                () = stop.cancelled() => return,
                result = signal => result,
            };
            if let Some(inner) = inner.upgrade() {
                inner.on_close_signal(source, result);
            }
        });
        self.tasks.lock().push(task.abort_handle());
    }

    fn on_close_signal(&self, source: CloseSource, result: std::result::Result<(), LinkError>) {
        let reason = match result {
            Ok(()) => CloseReason::graceful(source),
            Err(error) => {
                let reason = CloseReason::abrupt(source, error.to_string());
                let err = TransportError::CloseSignal {
                    origin: source,
                    error,
                };
                warn!(
                    connection_id = %self.id,
                    source = %source,
                    error = %err,
                    error_kind = err.error_kind(),
                    "close signal rejected"
                );
                reason
            }
        };
        let _ = self.shut_down(reason);
    }

    /// Terminal transition. Only the first caller closes the connection and
    /// emits `Closed`; returns whether this call was it.
    fn shut_down(&self, reason: CloseReason) -> bool {
        let source = reason.source;
        let graceful = reason.is_graceful();
        let _lifecycle = self.lifecycle.lock();
        {
            let mut state = self.state.lock();
            if !self.latch.trigger(reason) {
                return false;
            }
            *state = ConnectionState::Closed;
        }

        let conn = self.connection.lock().clone();
        if let Some(conn) = conn {
            conn.close();
        }

        info!(connection_id = %self.id, source = %source, graceful, "transport closed");
        self.bus.emit(&TransportEvent::Closed);
        self.done.cancel();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryAcceptor, MemoryConnector};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::timeout;

    const TIMEOUT: Duration = Duration::from_secs(2);

    fn transport() -> (Transport, MemoryAcceptor) {
        let (connector, acceptor) = MemoryConnector::new();
        let transport = Transport::new(TransportSettings::default(), Arc::new(connector));
        (transport, acceptor)
    }

    fn counter(transport: &Transport, kind: EventKind) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let _ = transport.subscribe(kind, move |_| {
            let _ = c.fetch_add(1, Ordering::SeqCst);
        });
        count
    }

    #[tokio::test]
    async fn starts_idle() {
        let (transport, _acceptor) = transport();
        assert_eq!(transport.state(), ConnectionState::Idle);
        assert!(transport.close_reason().is_none());
    }

    #[tokio::test]
    async fn connect_opens_and_emits_ready() {
        let (transport, mut acceptor) = transport();
        let ready = counter(&transport, EventKind::Ready);

        timeout(TIMEOUT, transport.connect()).await.unwrap().unwrap();
        let peer = acceptor.try_accept().unwrap();

        assert_eq!(transport.state(), ConnectionState::Open);
        assert_eq!(ready.load(Ordering::SeqCst), 1);
        assert_eq!(peer.target(), TransportSettings::default().url);
    }

    #[tokio::test]
    async fn connect_twice_is_invalid() {
        let (transport, _acceptor) = transport();
        transport.connect().await.unwrap();
        let err = transport.connect().await.unwrap_err();
        assert!(matches!(
            err,
            TransportError::InvalidState {
                expected: ConnectionState::Idle,
                actual: ConnectionState::Open,
            }
        ));
    }

    #[tokio::test]
    async fn send_before_connect_is_unavailable() {
        let (transport, _acceptor) = transport();
        let err = transport
            .send_reliable("move", &json!({"x": 1}))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransportError::ChannelUnavailable(ChannelKind::Reliable)
        ));
        let err = transport.send_unreliable("pos", &[1, 2]).await.unwrap_err();
        assert!(matches!(
            err,
            TransportError::ChannelUnavailable(ChannelKind::Unreliable)
        ));
    }

    #[tokio::test]
    async fn unserializable_data_is_encode_error() {
        let (transport, _acceptor) = transport();
        transport.connect().await.unwrap();

        let mut bad = std::collections::HashMap::new();
        let _ = bad.insert(vec![1u8], 1);
        let err = transport.send_reliable("bad", &bad).await.unwrap_err();
        assert!(matches!(err, TransportError::Encode(_)));
        assert_eq!(transport.state(), ConnectionState::Open);
    }

    #[tokio::test]
    async fn close_emits_closed_once() {
        let (transport, _acceptor) = transport();
        let closed = counter(&transport, EventKind::Closed);
        transport.connect().await.unwrap();

        transport.close();
        transport.close();
        timeout(TIMEOUT, transport.closed()).await.unwrap();

        assert_eq!(transport.state(), ConnectionState::Closed);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert_eq!(
            transport.close_reason(),
            Some(CloseReason::graceful(CloseSource::Local))
        );
    }

    #[tokio::test]
    async fn close_while_idle_prevents_connect() {
        let (transport, _acceptor) = transport();
        let closed = counter(&transport, EventKind::Closed);
        transport.close();
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert!(matches!(
            transport.connect().await,
            Err(TransportError::InvalidState { actual: ConnectionState::Closed, .. })
        ));
    }

    #[tokio::test]
    async fn empty_event_name_is_not_sent() {
        let (transport, mut acceptor) = transport();
        transport.connect().await.unwrap();
        let peer = acceptor.try_accept().unwrap();

        let err = transport.send_reliable("", &json!({"v": 1})).await.unwrap_err();
        assert!(matches!(err, TransportError::Encode(_)));
        assert!(peer.try_recv(ChannelKind::Reliable).is_none());
    }

    #[tokio::test]
    async fn close_from_other_thread_waits_for_ready_delivery() {
        let (transport, _acceptor) = transport();
        let transport = Arc::new(transport);
        let log = Arc::new(Mutex::new(Vec::new()));
        let closer = Arc::new(Mutex::new(None));

        // Registered first: while it runs, a second thread closes the transport.
        let weak = Arc::downgrade(&transport);
        let c = Arc::clone(&closer);
        let _ = transport.on_ready(move || {
            let Some(transport) = weak.upgrade() else { return };
            let handle = std::thread::spawn(move || transport.close());
            std::thread::sleep(Duration::from_millis(50));
            *c.lock() = Some(handle);
        });
        let l = Arc::clone(&log);
        let _ = transport.on_ready(move || l.lock().push("ready"));
        let l = Arc::clone(&log);
        let _ = transport.on_closed(move || l.lock().push("closed"));

        transport.connect().await.unwrap();
        let handle = closer.lock().take().unwrap();
        handle.join().unwrap();
        timeout(TIMEOUT, transport.closed()).await.unwrap();

        assert_eq!(*log.lock(), vec!["ready", "closed"]);
        assert_eq!(transport.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn ready_listener_may_close() {
        let (transport, _acceptor) = transport();
        let transport = Arc::new(transport);
        let weak = Arc::downgrade(&transport);
        let _ = transport.on_ready(move || {
            if let Some(transport) = weak.upgrade() {
                transport.close();
            }
        });
        let closed = counter(&transport, EventKind::Closed);

        transport.connect().await.unwrap();

        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert_eq!(transport.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn drop_closes_connection() {
        let (transport, mut acceptor) = transport();
        transport.connect().await.unwrap();
        let peer = acceptor.try_accept().unwrap();

        drop(transport);
        assert!(peer.is_closed());
    }

    #[tokio::test]
    async fn on_message_receives_event_and_data() {
        let (transport, mut acceptor) = transport();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        let _ = transport.on_message(move |event, data| {
            s.lock().push((event.to_string(), data.clone()));
        });
        transport.connect().await.unwrap();
        let peer = acceptor.try_accept().unwrap();

        peer.send(
            ChannelKind::Reliable,
            envelope::encode("score", &json!({"v": 1})).unwrap(),
        )
        .unwrap();
        peer.finish(ChannelKind::Reliable);
        timeout(TIMEOUT, transport.closed()).await.unwrap();

        assert_eq!(*seen.lock(), vec![("score".to_string(), json!({"v": 1}))]);
    }

    #[tokio::test]
    async fn shared_bus_sees_events() {
        let (connector, _acceptor) = MemoryConnector::new();
        let bus = Arc::new(EventBus::new());
        let ready = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&ready);
        let _ = bus.subscribe(EventKind::Ready, move |_| {
            let _ = r.fetch_add(1, Ordering::SeqCst);
        });

        let transport =
            Transport::with_bus(TransportSettings::default(), Arc::new(connector), Arc::clone(&bus));
        transport.connect().await.unwrap();

        assert!(Arc::ptr_eq(transport.bus(), &bus));
        assert_eq!(ready.load(Ordering::SeqCst), 1);
    }
}
