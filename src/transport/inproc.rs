//! In-process transport.
//!
//! Each connection is a pair of bounded queues of `capacity` packets. The
//! client's `send` uses `try_send`, so a slow broker surfaces as
//! [`TransportError::Full`] instead of blocking the producer. A pump task
//! forwards client packets into the broker's event queue.
//!
//! The broker side never loses a packet: it writes into an unbounded
//! outbox, and a forwarder task moves packets into the client's bounded
//! queue as the client makes room, in order.
//!
//! ```text
//! broker ──deliver──► outbox ──forwarder──► [capacity] ──► InprocChannel
//! ```
//!
//! The connector captures the tokio runtime that created it, so clients
//! may connect from any thread.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, error::TrySendError, UnboundedReceiver, UnboundedSender};

use crate::protocol::Packet;

use super::{recv_with_timeout, Channel, ClientId, ListenerEvent, PeerLink, TransportError};

/// Hands out in-process connections to one broker.
#[derive(Debug, Clone)]
pub struct InprocConnector {
    name: Arc<str>,
    capacity: usize,
    events: UnboundedSender<ListenerEvent>,
    runtime: Handle,
}

impl InprocConnector {
    /// Create a connector feeding `events`. Must be called inside a tokio runtime.
    pub(crate) fn new(name: &str, capacity: usize, events: UnboundedSender<ListenerEvent>) -> Self {
        Self {
            name: Arc::from(name),
            capacity: capacity.max(1),
            events,
            runtime: Handle::current(),
        }
    }

    /// Name from the `inproc://<name>` endpoint.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Open a new connection.
    ///
    /// # Errors
    ///
    /// [`TransportError::ConnectionFailed`] if the broker has stopped.
    pub fn connect(&self) -> Result<InprocChannel, TransportError> {
        if self.events.is_closed() {
            return Err(TransportError::ConnectionFailed(format!(
                "inproc://{} is not running",
                self.name
            )));
        }

        let (to_broker_tx, to_broker_rx) = mpsc::channel::<Packet>(self.capacity);
        let (to_client_tx, to_client_rx) = mpsc::channel::<Packet>(self.capacity);

        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel::<Packet>();

        let client = ClientId::generate("inproc");
        let pump = self.runtime.spawn(pump(client.clone(), to_broker_rx, self.events.clone()));
        self.runtime.spawn(forward(client.clone(), outbox_rx, to_client_tx));
        let link = PeerLink::inproc(outbox_tx, pump.abort_handle());

        log::debug!("[Inproc] Client connected: {client} on inproc://{}", self.name);
        self.events
            .send(ListenerEvent::Accepted { client, link })
            .map_err(|_closed| {
                TransportError::ConnectionFailed(format!("inproc://{} is not running", self.name))
            })?;

        Ok(InprocChannel {
            peer: format!("inproc://{}", self.name),
            tx: Some(to_broker_tx),
            rx: to_client_rx,
        })
    }
}

/// Forward one client's packets to the broker until either side closes.
async fn pump(
    client: ClientId,
    mut rx: mpsc::Receiver<Packet>,
    events: UnboundedSender<ListenerEvent>,
) {
    while let Some(packet) = rx.recv().await {
        if events
            .send(ListenerEvent::Packet { client: client.clone(), packet })
            .is_err()
        {
            return;
        }
    }
    log::debug!("[Inproc] Client disconnected: {client}");
    let _ = events.send(ListenerEvent::Closed { client, reason: None });
}

/// Move broker packets into the client's bounded queue, waiting for room.
///
/// Ends once the link is dropped and the outbox drained, or when the client
/// closes its side.
async fn forward(client: ClientId, mut outbox: UnboundedReceiver<Packet>, to_client: mpsc::Sender<Packet>) {
    while let Some(packet) = outbox.recv().await {
        if to_client.send(packet).await.is_err() {
            log::debug!("[Inproc] Client {client} stopped reading");
            return;
        }
    }
}

/// Client side of an in-process connection.
#[derive(Debug)]
pub struct InprocChannel {
    peer: String,
    tx: Option<mpsc::Sender<Packet>>,
    rx: mpsc::Receiver<Packet>,
}

#[async_trait]
impl Channel for InprocChannel {
    fn send(&self, packet: Packet) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::Closed)?;
        tx.try_send(packet).map_err(|e| match e {
            TrySendError::Full(_) => TransportError::Full,
            TrySendError::Closed(_) => TransportError::Closed,
        })
    }

    async fn receive(&mut self, timeout: Option<Duration>) -> Result<Option<Packet>, TransportError> {
        recv_with_timeout(timeout, self.rx.recv()).await
    }

    fn close(&mut self) {
        self.tx = None;
        self.rx.close();
    }

    fn peer(&self) -> &str {
        &self.peer
    }
}
