//! Client side of the broker protocol.
//!
//! [`BrokerClient`] wraps a transport [`Channel`] and turns the packet
//! protocol into request/response calls:
//!
//! - `subscribe`, `unsubscribe`, `cancel` and `disconnect` wait for the
//!   broker's `respond` with the same transaction id.
//! - `execute` and its helpers send a request and return its transaction
//!   id; responses are read with [`BrokerClient::listen`],
//!   [`BrokerClient::call`] or [`BrokerClient::call_stream`].
//!
//! Packets that arrive while waiting for something else (fan-out from
//! subscriptions, responses for other transactions) are buffered and
//! returned by later reads in arrival order.

// Rust guideline compliant 2026-02

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use futures_util::stream::{self, Stream};
use tokio::time::Instant;

use crate::error::RemoteError;
use crate::protocol::{new_transaction_id, Packet, PacketType, Target};
use crate::transport::{self, Channel, Connector, Endpoint, TransportError};
use crate::value::Value;

/// Failure to establish a broker session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    /// The endpoint could not be reached or parsed.
    Transport(TransportError),
    /// The broker answered `connect` with a failure.
    Rejected(RemoteError),
    /// The broker did not answer `connect` in time.
    Timeout,
}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "Connect failed: {e}"),
            Self::Rejected(e) => write!(f, "Connect rejected: {e}"),
            Self::Timeout => write!(f, "Connect timed out waiting for the broker"),
        }
    }
}

impl std::error::Error for ConnectError {}

impl From<TransportError> for ConnectError {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

/// Failure of a request on an established session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// The channel failed or closed.
    Transport(TransportError),
    /// The broker or VM reported a failure.
    Remote(RemoteError),
    /// No response for this transaction arrived in time.
    Timeout(String),
    /// The packet handed to an execute call is not an `execute`.
    NotExecute(PacketType),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "{e}"),
            Self::Remote(e) => write!(f, "{e}"),
            Self::Timeout(tx) => write!(f, "Timed out waiting for transaction {tx}"),
            Self::NotExecute(ty) => write!(f, "Expected an execute packet, got {ty}"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<TransportError> for ClientError {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

impl ClientError {
    /// Error-kind code when the failure came from the broker or VM.
    pub fn remote_code(&self) -> Option<&str> {
        match self {
            Self::Remote(e) => Some(&e.code),
            _ => None,
        }
    }
}

/// A connected broker session.
pub struct BrokerClient {
    channel: Box<dyn Channel>,
    pending: VecDeque<Packet>,
    request_timeout: Duration,
    execute_timeout: Option<Duration>,
}

impl fmt::Debug for BrokerClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerClient")
            .field("peer", &self.channel.peer())
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

impl BrokerClient {
    /// Open a channel through `connector` and perform the handshake.
    ///
    /// `request_timeout` bounds every wait for a broker `respond`,
    /// including this handshake.
    pub async fn connect(connector: &Connector, request_timeout: Duration) -> Result<Self, ConnectError> {
        let channel = transport::connect(connector).await?;
        let mut client = Self {
            channel,
            pending: VecDeque::new(),
            request_timeout,
            execute_timeout: None,
        };
        let tx = new_transaction_id();
        client.channel.send(Packet::connect(&tx))?;
        match client.await_respond(&tx).await {
            Ok(()) => {
                log::debug!("[Client] Connected to {}", client.channel.peer());
                Ok(client)
            }
            Err(ClientError::Remote(e)) => Err(ConnectError::Rejected(e)),
            Err(ClientError::Timeout(_)) => Err(ConnectError::Timeout),
            Err(ClientError::Transport(e)) => Err(ConnectError::Transport(e)),
            Err(e @ ClientError::NotExecute(_)) => {
                Err(ConnectError::Transport(TransportError::ConnectionFailed(e.to_string())))
            }
        }
    }

    /// Connect to a socket broker by URL (`tcp://` or `ipc://`).
    ///
    /// In-process brokers are reachable only through their runtime's
    /// connector.
    pub async fn connect_url(url: &str, request_timeout: Duration) -> Result<Self, ConnectError> {
        let endpoint: Endpoint = url.parse()?;
        Self::connect(&Connector::Socket(endpoint), request_timeout).await
    }

    /// Bound each wait for an execute response. `None` waits forever.
    #[must_use]
    pub fn with_execute_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.execute_timeout = timeout;
        self
    }

    /// Endpoint this client is connected to.
    pub fn peer(&self) -> &str {
        self.channel.peer()
    }

    // ─── Session requests ──────────────────────────────────────────────────

    /// Receive every response for `target`, whoever executes it.
    pub async fn subscribe(&mut self, target: &Target) -> Result<(), ClientError> {
        let tx = new_transaction_id();
        self.channel.send(Packet::subscribe(&tx, target))?;
        self.await_respond(&tx).await
    }

    /// Drop a subscription. Fails with `NotFound` if it does not exist.
    pub async fn unsubscribe(&mut self, target: &Target) -> Result<(), ClientError> {
        let tx = new_transaction_id();
        self.channel.send(Packet::unsubscribe(&tx, target))?;
        self.await_respond(&tx).await
    }

    /// Ask the VM to stop an in-flight transaction started by this client.
    ///
    /// Fails with `UnknownTarget` if the transaction already finished.
    /// The cancelled transaction ends with a `Cancelled` failure response.
    pub async fn cancel(&mut self, transaction_id: &str) -> Result<(), ClientError> {
        self.channel.send(Packet::cancel(transaction_id))?;
        self.await_respond(transaction_id).await
    }

    /// End the session.
    pub async fn disconnect(mut self) -> Result<(), ClientError> {
        let tx = new_transaction_id();
        self.channel.send(Packet::disconnect(&tx))?;
        let result = self.await_respond(&tx).await;
        self.channel.close();
        result
    }

    // ─── Execute ───────────────────────────────────────────────────────────

    /// Send a prepared `execute` packet. Returns its transaction id.
    pub fn send_execute(&mut self, packet: Packet) -> Result<String, ClientError> {
        if packet.packet_type != PacketType::Execute {
            return Err(ClientError::NotExecute(packet.packet_type));
        }
        let tx = packet.transaction_id.clone();
        self.channel.send(packet)?;
        Ok(tx)
    }

    /// Execute against `target` with body `{args}`.
    pub fn execute(&mut self, target: &Target, args: Value) -> Result<String, ClientError> {
        self.send_execute(Packet::execute(new_transaction_id(), target, args))
    }

    /// `execute(call_function)`.
    pub fn call_function(&mut self, function: &str, args: Value) -> Result<String, ClientError> {
        self.send_execute(Packet::call_function(new_transaction_id(), function, args))
    }

    /// `execute(define_component)`.
    pub fn define_component(
        &mut self,
        component_type: &str,
        name: &str,
        args: Value,
    ) -> Result<String, ClientError> {
        self.send_execute(Packet::define_component(new_transaction_id(), component_type, name, args))
    }

    /// `execute(delete_component)`.
    pub fn delete_component(&mut self, name: &str) -> Result<String, ClientError> {
        self.send_execute(Packet::delete_component(new_transaction_id(), name))
    }

    /// `execute(call_method)`.
    pub fn call_method(&mut self, component: &str, method: &str, args: Value) -> Result<String, ClientError> {
        self.send_execute(Packet::call_method(new_transaction_id(), component, method, args))
    }

    /// Send `packet` and wait for its final output.
    ///
    /// Partial outputs of a streaming operator are skipped.
    pub async fn call(&mut self, packet: Packet) -> Result<Value, ClientError> {
        let tx = self.send_execute(packet)?;
        loop {
            let packet = self.wait_for(&tx).await?;
            if let Some(e) = packet.error() {
                return Err(ClientError::Remote(e));
            }
            if packet.done() {
                return Ok(packet.output().cloned().unwrap_or_default());
            }
        }
    }

    /// Send `packet` and stream every output, ending after the `done`
    /// response or the first failure.
    pub fn call_stream(
        &mut self,
        packet: Packet,
    ) -> Result<impl Stream<Item = Result<Value, ClientError>> + '_, ClientError> {
        let tx = self.send_execute(packet)?;
        Ok(self.responses(tx))
    }

    /// Stream the outputs of an already-sent transaction.
    pub fn responses(
        &mut self,
        transaction_id: String,
    ) -> impl Stream<Item = Result<Value, ClientError>> + '_ {
        stream::unfold(Some((self, transaction_id)), |state| async move {
            let (client, tx) = state?;
            match client.wait_for(&tx).await {
                Ok(packet) => {
                    if let Some(e) = packet.error() {
                        return Some((Err(ClientError::Remote(e)), None));
                    }
                    let output = packet.output().cloned().unwrap_or_default();
                    let next = if packet.done() { None } else { Some((client, tx)) };
                    Some((Ok(output), next))
                }
                Err(e) => Some((Err(e), None)),
            }
        })
    }

    // ─── Receiving ─────────────────────────────────────────────────────────

    /// Next packet addressed to this client, buffered ones first.
    ///
    /// `None` timeout waits until a packet arrives; `Ok(None)` means the
    /// timeout elapsed.
    pub async fn listen(&mut self, timeout: Option<Duration>) -> Result<Option<Packet>, ClientError> {
        if let Some(packet) = self.pending.pop_front() {
            return Ok(Some(packet));
        }
        Ok(self.channel.receive(timeout).await?)
    }

    /// Next `respond_execute` for `transaction_id`, buffering anything else.
    pub async fn wait_for(&mut self, transaction_id: &str) -> Result<Packet, ClientError> {
        if let Some(packet) = self.take_pending(transaction_id, PacketType::RespondExecute) {
            return Ok(packet);
        }
        loop {
            let Some(packet) = self.channel.receive(self.execute_timeout).await? else {
                return Err(ClientError::Timeout(transaction_id.to_string()));
            };
            if packet.packet_type == PacketType::RespondExecute && packet.transaction_id == transaction_id {
                return Ok(packet);
            }
            self.pending.push_back(packet);
        }
    }

    fn take_pending(&mut self, transaction_id: &str, packet_type: PacketType) -> Option<Packet> {
        let index = self
            .pending
            .iter()
            .position(|p| p.packet_type == packet_type && p.transaction_id == transaction_id)?;
        self.pending.remove(index)
    }

    async fn await_respond(&mut self, transaction_id: &str) -> Result<(), ClientError> {
        let respond = match self.take_pending(transaction_id, PacketType::Respond) {
            Some(packet) => packet,
            None => self.receive_respond(transaction_id).await?,
        };
        match respond.error() {
            Some(e) => Err(ClientError::Remote(e)),
            None => Ok(()),
        }
    }

    async fn receive_respond(&mut self, transaction_id: &str) -> Result<Packet, ClientError> {
        let deadline = Instant::now() + self.request_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ClientError::Timeout(transaction_id.to_string()));
            }
            let Some(packet) = self.channel.receive(Some(remaining)).await? else {
                return Err(ClientError::Timeout(transaction_id.to_string()));
            };
            if packet.packet_type == PacketType::Respond && packet.transaction_id == transaction_id {
                return Ok(packet);
            }
            self.pending.push_back(packet);
        }
    }
}
