//! Broker: routes client packets to the VM and fans responses out.
//!
//! # Architecture
//!
//! ```text
//! listener ──ListenerEvent──►┌──────── broker task ────────┐──VmRequest──► VM
//!                            │ clients   subscriptions     │
//! client ◄──PeerLink─────────└─────────────────────────────┘◄──VmReply──── VM
//! ```
//!
//! The broker task owns the client table and the subscription table; no
//! other task touches them. Every input (transport events, VM replies,
//! stop commands) arrives on a channel and is handled to completion before
//! the next one.
//!
//! # Connection rules
//!
//! - The first packet must be `connect`. Anything else, or a packet that
//!   fails validation, is a protocol error: the client gets a failed
//!   `respond` and the connection is dropped.
//! - `subscribe`/`unsubscribe` are answered directly.
//! - `execute` and `cancel` go to the VM, which answers them.
//! - If the VM is gone, `execute` fails with `vm unavailable` as a
//!   `respond_execute` and `cancel` as a `respond`.
//!
//! # Fan-out
//!
//! A VM reply goes to the requesting client first, then to every client
//! subscribed to the reply's target, each at most once. Delivery never
//! blocks and never drops: each link buffers until its client reads. A
//! closed client is removed.
//!
//! A reply too large to frame for a socket client is replaced by a
//! failure for that transaction; later packets of the same transaction are
//! not sent to that client. The connection stays open.

// Rust guideline compliant 2026-02

mod subscriptions;

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::{ProtocolError, RegistryError, RoutingError, RuntimeError};
use crate::protocol::{header, Packet, PacketType, Target, PROTOCOL_VERSION};
use crate::transport::{ClientId, ListenerEvent, PeerLink, TransportError};
use crate::vm::{VmReply, VmRequest};

use subscriptions::Subscriptions;

/// Commands from the runtime to the broker task.
#[derive(Debug)]
enum BrokerCommand {
    /// Stop; replies with the number of clients that were connected.
    Stop { response_tx: oneshot::Sender<usize> },
}

/// Handle to a running broker task.
#[derive(Debug)]
pub(crate) struct BrokerHandle {
    commands: UnboundedSender<BrokerCommand>,
    task: JoinHandle<()>,
}

impl BrokerHandle {
    /// Start the broker over `events`, forwarding work to `vm`.
    pub fn spawn(
        events: UnboundedReceiver<ListenerEvent>,
        vm: UnboundedSender<VmRequest>,
        replies: UnboundedReceiver<VmReply>,
    ) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let broker = Broker {
            clients: HashMap::new(),
            subscriptions: Subscriptions::default(),
            undeliverable: HashSet::new(),
            vm,
        };
        let task = tokio::spawn(broker.run(events, replies, command_rx));
        Self { commands, task }
    }

    /// Stop the broker and wait up to `timeout` for it to exit.
    ///
    /// Returns how many clients were connected, or `None` if the broker had
    /// already exited or did not stop in time.
    pub async fn stop(self, timeout: Duration) -> Option<usize> {
        let (response_tx, response_rx) = oneshot::channel();
        let sent = self.commands.send(BrokerCommand::Stop { response_tx }).is_ok();
        let mut task = self.task;
        let connected = if sent { response_rx.await.ok() } else { None };
        if tokio::time::timeout(timeout, &mut task).await.is_err() {
            log::warn!("[Broker] Did not stop within {timeout:?}, aborting");
            task.abort();
            return None;
        }
        connected
    }

    /// Stop immediately, dropping every client connection.
    pub fn abort(&self) {
        self.task.abort();
    }
}

struct Client {
    link: PeerLink,
    connected: bool,
}

struct Broker {
    clients: HashMap<ClientId, Client>,
    subscriptions: Subscriptions,
    /// Streams already failed for one client because a reply was too large.
    undeliverable: HashSet<(ClientId, String)>,
    vm: UnboundedSender<VmRequest>,
}

impl Broker {
    async fn run(
        mut self,
        mut events: UnboundedReceiver<ListenerEvent>,
        mut replies: UnboundedReceiver<VmReply>,
        mut commands: UnboundedReceiver<BrokerCommand>,
    ) {
        log::info!("[Broker] Running");
        loop {
            tokio::select! {
                biased;
                Some(command) = commands.recv() => match command {
                    BrokerCommand::Stop { response_tx } => {
                        let connected = self.clients.values().filter(|c| c.connected).count();
                        let _ = response_tx.send(connected);
                        break;
                    }
                },
                Some(reply) = replies.recv() => self.deliver_reply(reply),
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => break,
                },
            }
        }
        log::info!("[Broker] Stopped ({} clients dropped)", self.clients.len());
    }

    // ─── Transport events ──────────────────────────────────────────────────

    fn handle_event(&mut self, event: ListenerEvent) {
        match event {
            ListenerEvent::Accepted { client, link } => {
                log::debug!("[Broker] Accepted {client}");
                self.clients.insert(client, Client { link, connected: false });
            }
            ListenerEvent::Packet { client, packet } => self.handle_packet(client, packet),
            ListenerEvent::Closed { client, reason } => {
                match reason {
                    Some(reason) => log::warn!("[Broker] {client} closed: {reason}"),
                    None => log::debug!("[Broker] {client} closed"),
                }
                self.remove_client(&client);
            }
        }
    }

    fn handle_packet(&mut self, client: ClientId, packet: Packet) {
        let Some(connected) = self.clients.get(&client).map(|c| c.connected) else {
            log::debug!("[Broker] Ignoring packet from unknown client {client}");
            return;
        };

        let target = match check_packet(connected, &packet) {
            Ok(target) => target,
            Err(e) => {
                log::warn!("[Broker] Protocol error from {client}: {e}");
                let reply = Packet::respond_err(&packet.transaction_id, &RuntimeError::from(e));
                self.send(&client, &reply);
                self.remove_client(&client);
                return;
            }
        };

        let tx = packet.transaction_id.clone();
        match (packet.packet_type, target) {
            (PacketType::Connect, _) => {
                if let Some(state) = self.clients.get_mut(&client) {
                    state.connected = true;
                }
                log::info!("[Broker] {client} connected");
                self.send(&client, &Packet::respond_ok(tx));
            }
            (PacketType::Disconnect, _) => {
                log::info!("[Broker] {client} disconnected");
                self.send(&client, &Packet::respond_ok(tx));
                self.remove_client(&client);
            }
            (PacketType::Subscribe, Some(target)) => {
                log::debug!("[Broker] {client} subscribed to {target}");
                self.subscriptions.subscribe(target, client.clone());
                self.send(&client, &Packet::respond_ok(tx));
            }
            (PacketType::Unsubscribe, Some(target)) => {
                let reply = if self.subscriptions.unsubscribe(&target, &client) {
                    log::debug!("[Broker] {client} unsubscribed from {target}");
                    Packet::respond_ok(tx)
                } else {
                    let err = RegistryError::not_found("subscription", target.to_string());
                    Packet::respond_err(tx, &err.into())
                };
                self.send(&client, &reply);
            }
            (PacketType::Execute, Some(target)) => self.forward_execute(client, target, packet),
            (PacketType::Cancel, _) => {
                let request = VmRequest::Cancel { origin: client.clone(), transaction_id: tx.clone() };
                if self.vm.send(request).is_err() {
                    let reply = Packet::respond_err(tx, &RoutingError::VmUnavailable.into());
                    self.send(&client, &reply);
                }
            }
            // check_packet guarantees a target for routed packets and
            // rejects broker-only packet types.
            (ty, _) => log::error!("[Broker] Unroutable {ty} packet from {client}"),
        }
    }

    fn forward_execute(&mut self, client: ClientId, target: Target, packet: Packet) {
        log::debug!("[Broker] {client} execute {target} tx={}", packet.transaction_id);
        let request = VmRequest::Execute { origin: client, target, packet };
        if let Err(rejected) = self.vm.send(request) {
            let VmRequest::Execute { origin, target, packet } = rejected.0 else {
                return;
            };
            log::warn!("[Broker] VM unavailable for {target}");
            let error = RuntimeError::from(RoutingError::VmUnavailable);
            self.deliver_reply(VmReply {
                origin,
                target: Some(target),
                packet: Packet::respond_execute_err(packet.transaction_id, 0, &error),
            });
        }
    }

    // ─── Delivery ──────────────────────────────────────────────────────────

    fn deliver_reply(&mut self, reply: VmReply) {
        let recipients = self.subscriptions.recipients(&reply.origin, reply.target.as_ref());
        for client in recipients {
            self.send(&client, &reply.packet);
        }
    }

    /// Deliver one packet. A closed client is removed.
    fn send(&mut self, client: &ClientId, packet: &Packet) {
        let key = (client.clone(), packet.transaction_id.clone());
        if self.undeliverable.contains(&key) {
            if packet.is_terminal() {
                self.undeliverable.remove(&key);
            }
            return;
        }
        let Some(state) = self.clients.get(client) else {
            return;
        };
        let result = match state.link.deliver(packet) {
            Err(TransportError::Protocol(e)) => {
                log::warn!(
                    "[Broker] Cannot deliver {} tx={} to {client}: {e}",
                    packet.packet_type,
                    packet.transaction_id
                );
                let error = RuntimeError::from(e);
                let failure = match packet.packet_type {
                    PacketType::RespondExecute => Packet::respond_execute_err(
                        &packet.transaction_id,
                        packet.sequence.unwrap_or(0),
                        &error,
                    ),
                    _ => Packet::respond_err(&packet.transaction_id, &error),
                };
                if packet.packet_type == PacketType::RespondExecute && !packet.is_terminal() {
                    self.undeliverable.insert(key);
                }
                state.link.deliver(&failure)
            }
            other => other,
        };
        if let Err(e) = result {
            log::debug!("[Broker] Delivery to {client} failed: {e}");
            self.remove_client(client);
        }
    }

    fn remove_client(&mut self, client: &ClientId) {
        if self.clients.remove(client).is_some() {
            self.undeliverable.retain(|(owner, _)| owner != client);
            let dropped = self.subscriptions.remove_client(client);
            if dropped > 0 {
                log::debug!("[Broker] Dropped {dropped} subscriptions of {client}");
            }
        }
    }
}

/// Apply the connection rules to one packet and extract its routing target.
fn check_packet(connected: bool, packet: &Packet) -> Result<Option<Target>, ProtocolError> {
    packet.validate()?;
    match packet.packet_type {
        PacketType::Connect => {
            if let Some(version) = packet.headers.get(header::VERSION) {
                if version.as_str() != Some(PROTOCOL_VERSION) {
                    return Err(ProtocolError::Malformed(format!(
                        "unsupported protocol version {version}"
                    )));
                }
            }
            Ok(None)
        }
        _ if !connected => Err(ProtocolError::NotConnected),
        PacketType::Respond | PacketType::RespondExecute => {
            Err(ProtocolError::UnexpectedPacket(packet.packet_type.as_str()))
        }
        PacketType::Subscribe | PacketType::Unsubscribe | PacketType::Execute => {
            packet.target().map(Some)
        }
        PacketType::Disconnect | PacketType::Cancel => Ok(None),
    }
}
