//! In-process connection primitive.
//!
//! Every [`MemoryConnector::open`] creates a [`MemoryConnection`] for the
//! transport and hands the matching [`MemoryPeer`] to the [`MemoryAcceptor`].
//! The peer plays the remote endpoint: it sends and receives payloads on both
//! channels and drives every readiness and close signal, which makes each
//! lifecycle path reproducible in tests.
//!
//! Datagrams are delivered in order and never dropped here; callers must not
//! rely on that for a real unreliable channel.
//!
//! Closing the connection ends pending reads and fails later writes, but it
//! does not settle the per-channel closed signals. Those only change through
//! the peer's `finish`/`reset`/`stop` calls.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dualink_core::{ChannelKind, LinkError};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::connection::{ChannelReader, ChannelWriter, Connection, Connector, Duplex};

type SignalState = Option<Result<(), LinkError>>;

/// Settable-once signal observed by any number of waiters.
#[derive(Clone)]
struct Signal {
    tx: Arc<watch::Sender<SignalState>>,
}

impl Signal {
    fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    fn settle(&self, result: Result<(), LinkError>) -> bool {
        self.tx.send_if_modified(|state| {
            if state.is_some() {
                return false;
            }
            *state = Some(result);
            true
        })
    }

    fn get(&self) -> SignalState {
        self.tx.borrow().clone()
    }

    async fn wait(&self) -> Result<(), LinkError> {
        let mut rx = self.tx.subscribe();
        let result = match rx.wait_for(Option::is_some).await {
            Ok(state) => state.clone().unwrap_or(Ok(())),
            Err(_) => Err(LinkError::Reset("signal dropped".into())),
        };
        result
    }
}

/// How a new connection becomes ready.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum ReadyBehavior {
    /// Ready as soon as it is opened.
    #[default]
    Immediate,
    /// Waits for [`MemoryPeer::accept`] or [`MemoryPeer::refuse`].
    Manual,
    /// Readiness fails with [`LinkError::Refused`].
    Refuse(String),
}

/// Scripted behavior for connections created by a [`MemoryConnector`].
#[derive(Clone, Debug, Default)]
pub struct MemoryBehavior {
    pub ready: ReadyBehavior,
    /// When set, `open_bi` fails with this reason.
    pub open_bi_error: Option<String>,
}

/// One direction of payloads, client to peer or peer to client.
struct Pipe {
    tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
}

impl Pipe {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx: Mutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    fn send(&self, payload: Bytes) -> Result<(), LinkError> {
        match self.tx.lock().as_ref() {
            Some(tx) => tx.send(payload).map_err(|_| LinkError::ChannelClosed),
            None => Err(LinkError::ChannelClosed),
        }
    }

    fn shut(&self) {
        let _ = self.tx.lock().take();
    }
}

/// Both directions of one logical channel plus the closed signals of the
/// transport-side writer and reader.
struct ChannelPipes {
    to_peer: Pipe,
    to_client: Pipe,
    writer_closed: Signal,
    reader_closed: Signal,
    taken: Mutex<bool>,
}

impl ChannelPipes {
    fn new() -> Self {
        Self {
            to_peer: Pipe::new(),
            to_client: Pipe::new(),
            writer_closed: Signal::new(),
            reader_closed: Signal::new(),
            taken: Mutex::new(false),
        }
    }
}

struct Link {
    target: String,
    behavior: MemoryBehavior,
    ready: Signal,
    closed: Signal,
    reliable: ChannelPipes,
    unreliable: ChannelPipes,
}

impl Link {
    fn channel(&self, kind: ChannelKind) -> &ChannelPipes {
        match kind {
            ChannelKind::Reliable => &self.reliable,
            ChannelKind::Unreliable => &self.unreliable,
        }
    }

    fn take_duplex(self: &Arc<Self>, kind: ChannelKind) -> Result<Duplex, LinkError> {
        if self.closed.get().is_some() {
            return Err(LinkError::Reset("connection closed".into()));
        }
        let pipes = self.channel(kind);
        {
            let mut taken = pipes.taken.lock();
            if *taken {
                return Err(LinkError::Unavailable(format!("{kind} channel already taken")));
            }
            *taken = true;
        }
        Ok(Duplex {
            writer: Arc::new(MemoryWriter {
                kind,
                link: Arc::clone(self),
            }),
            reader: Arc::new(MemoryReader {
                kind,
                link: Arc::clone(self),
            }),
        })
    }
}

struct MemoryWriter {
    kind: ChannelKind,
    link: Arc<Link>,
}

#[async_trait]
impl ChannelWriter for MemoryWriter {
    async fn write(&self, payload: Bytes) -> Result<(), LinkError> {
        match self.link.closed.get() {
            Some(Err(e)) => return Err(e),
            Some(Ok(())) => return Err(LinkError::ChannelClosed),
            None => {}
        }
        let pipes = self.link.channel(self.kind);
        match pipes.writer_closed.get() {
            Some(Err(e)) => Err(e),
            Some(Ok(())) => Err(LinkError::ChannelClosed),
            None => pipes.to_peer.send(payload),
        }
    }

    async fn closed(&self) -> Result<(), LinkError> {
        self.link.channel(self.kind).writer_closed.wait().await
    }
}

struct MemoryReader {
    kind: ChannelKind,
    link: Arc<Link>,
}

#[async_trait]
impl ChannelReader for MemoryReader {
    async fn read(&self) -> Result<Option<Bytes>, LinkError> {
        let pipes = self.link.channel(self.kind);
        let mut rx = pipes.to_client.rx.lock().await;
        tokio::select! {
            biased;
            msg = rx.recv() => match msg {
                Some(payload) => Ok(Some(payload)),
                None => {
                    let _ = pipes.reader_closed.settle(Ok(()));
                    Ok(None)
                }
            },
            result = pipes.reader_closed.wait() => result.map(|()| None),
            _ = self.link.closed.wait() => Ok(None),
        }
    }

    async fn closed(&self) -> Result<(), LinkError> {
        self.link.channel(self.kind).reader_closed.wait().await
    }
}

/// Transport-side end of an in-memory connection.
pub struct MemoryConnection {
    link: Arc<Link>,
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn ready(&self) -> Result<(), LinkError> {
        tokio::select! {
            biased;
            result = self.link.ready.wait() => result,
            _ = self.link.closed.wait() => {
                Err(LinkError::Reset("connection closed before ready".into()))
            }
        }
    }

    async fn closed(&self) -> Result<(), LinkError> {
        self.link.closed.wait().await
    }

    fn datagrams(&self) -> Result<Duplex, LinkError> {
        self.link.take_duplex(ChannelKind::Unreliable)
    }

    async fn open_bi(&self) -> Result<Duplex, LinkError> {
        if let Some(reason) = &self.link.behavior.open_bi_error {
            return Err(LinkError::Unavailable(reason.clone()));
        }
        self.link.take_duplex(ChannelKind::Reliable)
    }

    fn close(&self) {
        if self.link.closed.settle(Ok(())) {
            debug!(target_url = %self.link.target, "memory connection closed locally");
        }
    }
}

/// Remote end of an in-memory connection.
pub struct MemoryPeer {
    link: Arc<Link>,
}

impl MemoryPeer {
    /// Target the transport asked for.
    pub fn target(&self) -> &str {
        &self.link.target
    }

    /// Complete readiness (for [`ReadyBehavior::Manual`]).
    pub fn accept(&self) {
        let _ = self.link.ready.settle(Ok(()));
    }

    /// Fail readiness (for [`ReadyBehavior::Manual`]).
    pub fn refuse(&self, reason: &str) {
        let _ = self.link.ready.settle(Err(LinkError::Refused(reason.to_string())));
    }

    /// Deliver one payload to the transport's reader on `kind`.
    pub fn send(&self, kind: ChannelKind, payload: impl Into<Bytes>) -> Result<(), LinkError> {
        if self.link.closed.get().is_some() {
            return Err(LinkError::ChannelClosed);
        }
        self.link.channel(kind).to_client.send(payload.into())
    }

    /// Wait for the next payload the transport wrote on `kind`.
    pub async fn recv(&self, kind: ChannelKind) -> Option<Bytes> {
        self.link.channel(kind).to_peer.rx.lock().await.recv().await
    }

    /// Payload already written on `kind`, without waiting.
    pub fn try_recv(&self, kind: ChannelKind) -> Option<Bytes> {
        self.link
            .channel(kind)
            .to_peer
            .rx
            .try_lock()
            .ok()
            .and_then(|mut rx| rx.try_recv().ok())
    }

    /// End the stream toward the transport. The transport's reader closes
    /// gracefully once it has read every buffered payload.
    pub fn finish(&self, kind: ChannelKind) {
        self.link.channel(kind).to_client.shut();
    }

    /// Abort the stream toward the transport; its reader closes with an error.
    pub fn reset(&self, kind: ChannelKind, reason: &str) {
        let pipes = self.link.channel(kind);
        let _ = pipes
            .reader_closed
            .settle(Err(LinkError::Reset(reason.to_string())));
        pipes.to_client.shut();
    }

    /// Stop accepting payloads on `kind`; the transport's writer closes
    /// gracefully.
    pub fn stop(&self, kind: ChannelKind) {
        let _ = self.link.channel(kind).writer_closed.settle(Ok(()));
    }

    /// Stop accepting payloads on `kind`; the transport's writer closes with an
    /// error.
    pub fn stop_with_error(&self, kind: ChannelKind, reason: &str) {
        let _ = self
            .link
            .channel(kind)
            .writer_closed
            .settle(Err(LinkError::Reset(reason.to_string())));
    }

    /// Close the whole connection gracefully.
    pub fn close(&self) {
        let _ = self.link.closed.settle(Ok(()));
    }

    /// Close the whole connection with an error.
    pub fn close_with_error(&self, reason: &str) {
        let _ = self
            .link
            .closed
            .settle(Err(LinkError::Reset(reason.to_string())));
    }

    /// Whether either side has closed the connection.
    pub fn is_closed(&self) -> bool {
        self.link.closed.get().is_some()
    }

    /// Resolves when either side closes the connection.
    pub async fn closed(&self) -> Result<(), LinkError> {
        self.link.closed.wait().await
    }
}

/// Receives the peer end of every connection a [`MemoryConnector`] opens.
pub struct MemoryAcceptor {
    rx: mpsc::UnboundedReceiver<MemoryPeer>,
}

impl MemoryAcceptor {
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.rx.recv().await
    }

    pub fn try_accept(&mut self) -> Option<MemoryPeer> {
        self.rx.try_recv().ok()
    }
}

/// [`Connector`] producing in-memory connections.
pub struct MemoryConnector {
    behavior: MemoryBehavior,
    peers: mpsc::UnboundedSender<MemoryPeer>,
}

impl MemoryConnector {
    pub fn new() -> (Self, MemoryAcceptor) {
        Self::with_behavior(MemoryBehavior::default())
    }

    pub fn with_behavior(behavior: MemoryBehavior) -> (Self, MemoryAcceptor) {
        let (peers, rx) = mpsc::unbounded_channel();
        (Self { behavior, peers }, MemoryAcceptor { rx })
    }
}

impl Connector for MemoryConnector {
    fn open(&self, target: &str) -> Result<Arc<dyn Connection>, LinkError> {
        if target.trim().is_empty() {
            return Err(LinkError::InvalidTarget("empty target".into()));
        }

        let link = Arc::new(Link {
            target: target.to_string(),
            behavior: self.behavior.clone(),
            ready: Signal::new(),
            closed: Signal::new(),
            reliable: ChannelPipes::new(),
            unreliable: ChannelPipes::new(),
        });
        match &self.behavior.ready {
            ReadyBehavior::Immediate => {
                let _ = link.ready.settle(Ok(()));
            }
            ReadyBehavior::Refuse(reason) => {
                let _ = link.ready.settle(Err(LinkError::Refused(reason.clone())));
            }
            ReadyBehavior::Manual => {}
        }

        if self
            .peers
            .send(MemoryPeer {
                link: Arc::clone(&link),
            })
            .is_err()
        {
            debug!(target_url = %target, "no acceptor for memory connection");
        }

        Ok(Arc::new(MemoryConnection { link }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    const TIMEOUT: Duration = Duration::from_secs(2);

    async fn open_pair(behavior: MemoryBehavior) -> (Arc<dyn Connection>, MemoryPeer) {
        let (connector, mut acceptor) = MemoryConnector::with_behavior(behavior);
        let conn = connector.open("https://localhost:4433/").unwrap();
        let peer = acceptor.accept().await.unwrap();
        (conn, peer)
    }

    #[tokio::test]
    async fn empty_target_is_rejected() {
        let (connector, _acceptor) = MemoryConnector::new();
        let err = connector.open("  ").err().unwrap();
        assert!(matches!(err, LinkError::InvalidTarget(_)));
    }

    #[tokio::test]
    async fn peer_sees_target() {
        let (_conn, peer) = open_pair(MemoryBehavior::default()).await;
        assert_eq!(peer.target(), "https://localhost:4433/");
    }

    #[tokio::test]
    async fn immediate_ready() {
        let (conn, _peer) = open_pair(MemoryBehavior::default()).await;
        timeout(TIMEOUT, conn.ready()).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn refused_ready() {
        let behavior = MemoryBehavior {
            ready: ReadyBehavior::Refuse("no route".into()),
            ..MemoryBehavior::default()
        };
        let (conn, _peer) = open_pair(behavior).await;
        let err = conn.ready().await.unwrap_err();
        assert_eq!(err, LinkError::Refused("no route".into()));
    }

    #[tokio::test]
    async fn manual_ready_waits_for_peer() {
        let behavior = MemoryBehavior {
            ready: ReadyBehavior::Manual,
            ..MemoryBehavior::default()
        };
        let (conn, peer) = open_pair(behavior).await;
        assert!(timeout(Duration::from_millis(20), conn.ready()).await.is_err());
        peer.accept();
        timeout(TIMEOUT, conn.ready()).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn close_before_ready_fails_ready() {
        let behavior = MemoryBehavior {
            ready: ReadyBehavior::Manual,
            ..MemoryBehavior::default()
        };
        let (conn, peer) = open_pair(behavior).await;
        peer.close();
        assert!(timeout(TIMEOUT, conn.ready()).await.unwrap().is_err());
    }

    #[tokio::test]
    async fn payloads_flow_both_ways() {
        let (conn, peer) = open_pair(MemoryBehavior::default()).await;
        let stream = conn.open_bi().await.unwrap();

        stream.writer.write(Bytes::from_static(b"up")).await.unwrap();
        assert_eq!(peer.recv(ChannelKind::Reliable).await.unwrap(), "up");

        peer.send(ChannelKind::Reliable, &b"down"[..]).unwrap();
        let got = stream.reader.read().await.unwrap().unwrap();
        assert_eq!(got, "down");
    }

    #[tokio::test]
    async fn channels_are_independent() {
        let (conn, peer) = open_pair(MemoryBehavior::default()).await;
        let datagrams = conn.datagrams().unwrap();
        let _stream = conn.open_bi().await.unwrap();

        datagrams.writer.write(Bytes::from_static(b"dgram")).await.unwrap();
        assert!(peer.try_recv(ChannelKind::Reliable).is_none());
        assert_eq!(peer.try_recv(ChannelKind::Unreliable).unwrap(), "dgram");
    }

    #[tokio::test]
    async fn channel_can_only_be_taken_once() {
        let (conn, _peer) = open_pair(MemoryBehavior::default()).await;
        let _first = conn.open_bi().await.unwrap();
        assert!(matches!(conn.open_bi().await, Err(LinkError::Unavailable(_))));
        let _dgram = conn.datagrams().unwrap();
        assert!(conn.datagrams().is_err());
    }

    #[tokio::test]
    async fn open_bi_failure_injection() {
        let behavior = MemoryBehavior {
            open_bi_error: Some("stream limit".into()),
            ..MemoryBehavior::default()
        };
        let (conn, _peer) = open_pair(behavior).await;
        let err = conn.open_bi().await.err().unwrap();
        assert_eq!(err, LinkError::Unavailable("stream limit".into()));
    }

    #[tokio::test]
    async fn finish_drains_then_ends_reader() {
        let (conn, peer) = open_pair(MemoryBehavior::default()).await;
        let stream = conn.open_bi().await.unwrap();

        peer.send(ChannelKind::Reliable, &b"last"[..]).unwrap();
        peer.finish(ChannelKind::Reliable);

        assert_eq!(stream.reader.read().await.unwrap().unwrap(), "last");
        assert!(stream.reader.read().await.unwrap().is_none());
        assert!(stream.reader.closed().await.is_ok());
    }

    #[tokio::test]
    async fn reset_rejects_reader_closed() {
        let (conn, peer) = open_pair(MemoryBehavior::default()).await;
        let stream = conn.open_bi().await.unwrap();
        peer.reset(ChannelKind::Reliable, "boom");
        assert_eq!(
            stream.reader.closed().await,
            Err(LinkError::Reset("boom".into()))
        );
    }

    #[tokio::test]
    async fn stopped_writer_rejects_writes() {
        let (conn, peer) = open_pair(MemoryBehavior::default()).await;
        let datagrams = conn.datagrams().unwrap();
        peer.stop(ChannelKind::Unreliable);

        assert!(datagrams.writer.closed().await.is_ok());
        let err = datagrams
            .writer
            .write(Bytes::from_static(b"late"))
            .await
            .unwrap_err();
        assert_eq!(err, LinkError::ChannelClosed);
    }

    #[tokio::test]
    async fn local_close_is_visible_to_peer() {
        let (conn, peer) = open_pair(MemoryBehavior::default()).await;
        let stream = conn.open_bi().await.unwrap();
        conn.close();

        assert!(peer.is_closed());
        assert!(conn.closed().await.is_ok());
        assert!(stream.reader.read().await.unwrap().is_none());
        assert!(stream.writer.write(Bytes::from_static(b"x")).await.is_err());
    }

    #[tokio::test]
    async fn peer_close_with_error_rejects_closed() {
        let (conn, peer) = open_pair(MemoryBehavior::default()).await;
        peer.close_with_error("idle timeout");
        assert_eq!(
            conn.closed().await,
            Err(LinkError::Reset("idle timeout".into()))
        );
    }
}
