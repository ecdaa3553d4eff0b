//! Duplex packet channels between clients and the broker.
//!
//! # Architecture
//!
//! ```text
//!  client side                          broker side
//!  ───────────                          ───────────
//!  Box<dyn Channel> ──packets──► listener task ──ListenerEvent──► Broker
//!                   ◄──packets── PeerLink      ◄──deliver()────── Broker
//! ```
//!
//! Two implementations share the [`Channel`] contract:
//!
//! - [`inproc`] - a pair of bounded queues; the client's `send` never
//!   blocks and reports [`TransportError::Full`] instead
//! - [`socket`] - length-prefixed frames over TCP or Unix sockets
//!
//! Listeners announce each connection with [`ListenerEvent::Accepted`],
//! handing the broker a [`PeerLink`] for outbound delivery.

// Rust guideline compliant 2026-02

pub mod endpoint;
pub mod inproc;
pub mod socket;

use std::fmt;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::AbortHandle;

use crate::error::ProtocolError;
use crate::protocol::{framing, Packet};

pub use endpoint::Endpoint;
pub use inproc::{InprocChannel, InprocConnector};
pub use socket::{SocketChannel, SocketListener};

/// Errors that can occur during channel operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Endpoint URL could not be parsed.
    InvalidEndpoint(String),
    /// Failed to establish a connection.
    ConnectionFailed(String),
    /// The broker-bound queue is full (in-process client `send` only).
    Full,
    /// The channel was closed.
    Closed,
    /// I/O failure on the underlying socket.
    Io(String),
    /// The peer sent bytes that do not decode.
    Protocol(ProtocolError),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEndpoint(msg) => write!(f, "Invalid endpoint: {msg}"),
            Self::ConnectionFailed(msg) => write!(f, "Connection failed: {msg}"),
            Self::Full => write!(f, "Channel queue full"),
            Self::Closed => write!(f, "Channel closed"),
            Self::Io(msg) => write!(f, "I/O error: {msg}"),
            Self::Protocol(e) => write!(f, "Protocol error: {e}"),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<ProtocolError> for TransportError {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

/// A bidirectional packet channel, client side.
#[async_trait]
pub trait Channel: Send + Sync + fmt::Debug {
    /// Queue a packet for the peer. Never blocks.
    ///
    /// # Errors
    ///
    /// [`TransportError::Full`] if a bounded queue is at capacity,
    /// [`TransportError::Closed`] if the peer is gone,
    /// [`TransportError::Protocol`] if the packet is too large to frame.
    fn send(&self, packet: Packet) -> Result<(), TransportError>;

    /// Wait for the next packet.
    ///
    /// `None` waits indefinitely; on timeout returns `Ok(None)`.
    ///
    /// # Errors
    ///
    /// [`TransportError::Closed`] once the peer is gone and nothing is buffered.
    async fn receive(&mut self, timeout: Option<Duration>) -> Result<Option<Packet>, TransportError>;

    /// Close the channel. Further sends fail.
    fn close(&mut self);

    /// Endpoint this channel is connected to, for logging.
    fn peer(&self) -> &str;
}

/// Await a queue's `recv()` future with an optional timeout, mapping a
/// closed queue to [`TransportError::Closed`].
pub(crate) async fn recv_with_timeout<T>(
    timeout: Option<Duration>,
    recv: impl Future<Output = Option<T>> + Send,
) -> Result<Option<T>, TransportError> {
    let next = match timeout {
        None => recv.await,
        Some(limit) => match tokio::time::timeout(limit, recv).await {
            Ok(next) => next,
            Err(_elapsed) => return Ok(None),
        },
    };
    next.map(Some).ok_or(TransportError::Closed)
}

// ─── Broker-side plumbing ──────────────────────────────────────────────────

/// Connection handle allocated by a listener.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(String);

impl ClientId {
    /// Allocate a unique id using a monotonic counter + random suffix.
    pub fn generate(scheme: &str) -> Self {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(0);

        let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
        let rand: u16 = rand::random();
        Self(format!("{scheme}:{seq:x}{rand:04x}"))
    }

    /// The id as text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Events a listener reports to the broker.
#[derive(Debug)]
pub enum ListenerEvent {
    /// A new connection; `link` delivers packets back to it.
    Accepted {
        /// Connection handle.
        client: ClientId,
        /// Outbound link.
        link: PeerLink,
    },
    /// A packet from a connected client.
    Packet {
        /// Sender.
        client: ClientId,
        /// The packet.
        packet: Packet,
    },
    /// The connection ended. `reason` is set for protocol or I/O failures.
    Closed {
        /// Connection handle.
        client: ClientId,
        /// Why the connection ended, if abnormally.
        reason: Option<String>,
    },
}

#[derive(Debug)]
enum PeerSink {
    Inproc(UnboundedSender<Packet>),
    Socket(UnboundedSender<Vec<u8>>),
}

/// Broker-side outbound half of one connection.
///
/// Dropping the link stops the connection's reader and closes the
/// outbound queue once it drains.
#[derive(Debug)]
pub struct PeerLink {
    sink: PeerSink,
    reader: AbortHandle,
}

impl PeerLink {
    pub(crate) fn inproc(outbox: UnboundedSender<Packet>, reader: AbortHandle) -> Self {
        Self { sink: PeerSink::Inproc(outbox), reader }
    }

    pub(crate) fn socket(frames: UnboundedSender<Vec<u8>>, reader: AbortHandle) -> Self {
        Self { sink: PeerSink::Socket(frames), reader }
    }

    /// Queue one packet for the client without blocking.
    ///
    /// Both sinks are unbounded outboxes drained by a per-connection task,
    /// so a slow reader delays packets but never loses them.
    ///
    /// # Errors
    ///
    /// [`TransportError::Closed`] when the client is gone,
    /// [`TransportError::Protocol`] when a socket packet is too large to
    /// frame. The connection stays usable after the latter.
    pub fn deliver(&self, packet: &Packet) -> Result<(), TransportError> {
        match &self.sink {
            PeerSink::Inproc(tx) => tx.send(packet.clone()).map_err(|_closed| TransportError::Closed),
            PeerSink::Socket(tx) => tx
                .send(framing::encode_frame(packet)?)
                .map_err(|_closed| TransportError::Closed),
        }
    }
}

impl Drop for PeerLink {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

// ─── Connecting ────────────────────────────────────────────────────────────

/// How a client reaches a broker.
///
/// In-process brokers are reachable only through the connector handed out
/// by the runtime that owns them; there is no process-wide registry.
#[derive(Debug, Clone)]
pub enum Connector {
    /// In-process broker.
    Inproc(InprocConnector),
    /// Socket broker at a TCP or Unix endpoint.
    Socket(Endpoint),
}

impl Connector {
    /// Endpoint this connector reaches.
    pub fn endpoint(&self) -> Endpoint {
        match self {
            Self::Inproc(c) => Endpoint::Inproc(c.name().to_string()),
            Self::Socket(endpoint) => endpoint.clone(),
        }
    }
}

/// Open a channel to the broker behind `connector`.
pub async fn connect(connector: &Connector) -> Result<Box<dyn Channel>, TransportError> {
    match connector {
        Connector::Inproc(c) => Ok(Box::new(c.connect()?)),
        Connector::Socket(Endpoint::Inproc(name)) => Err(TransportError::ConnectionFailed(format!(
            "inproc://{name} is only reachable through its runtime's connector"
        ))),
        Connector::Socket(endpoint) => Ok(Box::new(SocketChannel::connect(endpoint).await?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn test_client_ids_unique_and_prefixed() {
        let ids: Vec<ClientId> = (0..50).map(|_| ClientId::generate("inproc")).collect();
        let unique: std::collections::HashSet<&ClientId> = ids.iter().collect();
        assert_eq!(unique.len(), ids.len());
        assert!(ids.iter().all(|id| id.as_str().starts_with("inproc:")));
    }

    #[tokio::test]
    async fn test_socket_connector_rejects_inproc_endpoint() {
        let connector = Connector::Socket(Endpoint::Inproc("x".into()));
        let err = connect(&connector).await.unwrap_err();
        assert!(matches!(err, TransportError::ConnectionFailed(_)));
    }

    #[tokio::test]
    async fn test_recv_with_timeout_returns_none_on_timeout() {
        let (_tx, mut rx) = mpsc::channel::<u8>(1);
        let got = recv_with_timeout(Some(Duration::from_millis(10)), rx.recv()).await;
        assert_eq!(got, Ok(None));
    }

    #[tokio::test]
    async fn test_recv_with_timeout_reports_closed() {
        let (tx, mut rx) = mpsc::channel::<u8>(1);
        drop(tx);
        assert_eq!(recv_with_timeout(None, rx.recv()).await, Err(TransportError::Closed));
    }
}
