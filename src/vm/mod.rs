//! Component-hosting VM.
//!
//! The VM owns the function/factory [`registry`] and the table of live
//! components. It receives execute and cancel requests from the broker,
//! runs them, and sends every response back tagged with the requesting
//! client and the target, so the broker can fan it out.
//!
//! # Architecture
//!
//! ```text
//!                    ┌──────────── VM task ─────────────┐
//! broker ─VmRequest─►│ registry   components   inflight │
//!                    └───┬──────────────┬───────────────┘
//!                        │ spawn         │ MethodCall
//!                        ▼               ▼
//!                   function task   component actor (one per name)
//!                        │               │
//!                        └──VmReply──────┴──► broker
//! ```
//!
//! Function calls each run on their own task. Method calls go through the
//! component's actor, which serializes them.
//!
//! # Cancellation
//!
//! Every in-flight transaction has a [`CancellationToken`], keyed by
//! `(client, transaction id)`. Method call tokens are children of their
//! component's token, which is a child of the VM's root token, so deleting
//! a component or stopping the VM cancels everything below it. A cancel
//! does not roll back state changes an operator already made.

// Rust guideline compliant 2026-02

pub mod component;
pub(crate) mod emitter;
pub mod module;
pub mod operator;
mod registry;

pub use component::{Component, ComponentBuilder};
pub use module::{ComponentFactory, Module};
pub use operator::{iter_stream, MethodOperator, Operator, ValueStream};

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{RegistryError, RoutingError, RuntimeError, ValidationError};
use crate::protocol::{Packet, Target};
use crate::transport::ClientId;
use crate::value::Value;

use component::{LiveComponent, MethodCall};
use emitter::ReplyEmitter;
use registry::Registry;

/// In-flight transaction key: requesting client and transaction id.
pub(crate) type CallKey = (ClientId, String);

/// Work the broker hands to the VM.
#[derive(Debug)]
pub(crate) enum VmRequest {
    /// Run an execute packet from `origin`.
    Execute {
        origin: ClientId,
        target: Target,
        packet: Packet,
    },
    /// Cancel `origin`'s in-flight transaction.
    Cancel { origin: ClientId, transaction_id: String },
}

/// A response on its way back to the broker.
#[derive(Debug)]
pub(crate) struct VmReply {
    /// Client that sent the request.
    pub origin: ClientId,
    /// Subscription key for fan-out. `None` for replies only the origin sees.
    pub target: Option<Target>,
    pub packet: Packet,
}

/// Handle to a running VM task.
#[derive(Debug)]
pub(crate) struct VmHandle {
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl VmHandle {
    /// Start the VM.
    ///
    /// `ready` resolves once the registry is built, or with the load error
    /// (in which case the task has already exited).
    pub fn spawn(
        modules: Vec<Module>,
        requests: UnboundedReceiver<VmRequest>,
        replies: UnboundedSender<VmReply>,
        ready: oneshot::Sender<Result<(), RegistryError>>,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let root = shutdown.clone();
        let task = tokio::spawn(async move {
            let registry = match Registry::from_modules(modules) {
                Ok(registry) => registry,
                Err(e) => {
                    log::error!("[VM] Failed to load modules: {e}");
                    let _ = ready.send(Err(e));
                    return;
                }
            };
            log::info!(
                "[VM] Ready with {} functions and {} component types",
                registry.function_count(),
                registry.factory_count()
            );
            let _ = ready.send(Ok(()));
            Vm::new(registry, replies, root).run(requests).await;
        });
        Self { shutdown, task }
    }

    /// Cancel everything and wait up to `timeout` for teardown.
    ///
    /// Returns `false` if the task had to be abandoned.
    pub async fn stop(self, timeout: Duration) -> bool {
        self.shutdown.cancel();
        let mut task = self.task;
        match tokio::time::timeout(timeout, &mut task).await {
            Ok(_) => true,
            Err(_elapsed) => {
                log::warn!("[VM] Did not stop within {timeout:?}, aborting");
                task.abort();
                false
            }
        }
    }

    /// Cancel without waiting. Components still tear down in the background.
    pub fn cancel(&self) {
        self.shutdown.cancel();
    }
}

struct Vm {
    registry: Registry,
    components: HashMap<String, LiveComponent>,
    inflight: HashMap<CallKey, CancellationToken>,
    replies: UnboundedSender<VmReply>,
    finished_tx: UnboundedSender<CallKey>,
    finished_rx: UnboundedReceiver<CallKey>,
    root: CancellationToken,
}

impl Vm {
    fn new(registry: Registry, replies: UnboundedSender<VmReply>, root: CancellationToken) -> Self {
        let (finished_tx, finished_rx) = mpsc::unbounded_channel();
        Self {
            registry,
            components: HashMap::new(),
            inflight: HashMap::new(),
            replies,
            finished_tx,
            finished_rx,
            root,
        }
    }

    async fn run(mut self, mut requests: UnboundedReceiver<VmRequest>) {
        loop {
            tokio::select! {
                biased;
                () = self.root.cancelled() => break,
                Some(key) = self.finished_rx.recv() => {
                    self.inflight.remove(&key);
                }
                request = requests.recv() => match request {
                    Some(VmRequest::Execute { origin, target, packet }) => {
                        self.execute(origin, target, packet);
                    }
                    Some(VmRequest::Cancel { origin, transaction_id }) => {
                        self.cancel(origin, transaction_id);
                    }
                    None => break,
                },
            }
        }
        self.shutdown().await;
    }

    fn execute(&mut self, origin: ClientId, target: Target, packet: Packet) {
        log::debug!("[VM] {target} tx={} from {origin}", packet.transaction_id);
        let emitter = ReplyEmitter::new(
            self.replies.clone(),
            origin,
            packet.transaction_id.clone(),
            target.clone(),
        );
        match target {
            Target::Function(name) => self.call_function(&name, packet.args().clone(), emitter),
            Target::ComponentType(ty) => self.define_component(&ty, &packet.body, emitter),
            Target::Component(name) => self.delete_component(&name, emitter),
            Target::Method { component, method } => {
                self.call_method(&component, method, packet.args().clone(), emitter);
            }
        }
    }

    fn call_function(&mut self, name: &str, args: Value, emitter: ReplyEmitter) {
        let Some(op) = self.registry.function(name).cloned() else {
            emitter.fail(RegistryError::not_found("function", name));
            return;
        };
        let key = emitter.key();
        let cancel = self.root.child_token();
        self.inflight.insert(key.clone(), cancel.clone());
        let finished = self.finished_tx.clone();
        tokio::spawn(async move {
            operator::run_function(&op, args, emitter, &cancel).await;
            let _ = finished.send(key);
        });
    }

    fn define_component(&mut self, component_type: &str, body: &Value, emitter: ReplyEmitter) {
        let name = match body.get("name") {
            Some(Value::String(name)) => name.clone(),
            Some(other) => {
                emitter.fail(ValidationError::Type {
                    op: "define_component".into(),
                    field: "name".into(),
                    expected: "string",
                    actual: other.type_name(),
                });
                return;
            }
            None => {
                emitter.fail(ValidationError::Range {
                    op: "define_component".into(),
                    field: "name".into(),
                });
                return;
            }
        };
        if self.components.contains_key(&name) {
            emitter.fail(RegistryError::AlreadyExists(name));
            return;
        }
        let Some(factory) = self.registry.factory(component_type) else {
            emitter.fail(RegistryError::UnknownComponentType(component_type.to_string()));
            return;
        };

        let args = body.get("args").cloned().unwrap_or_default();
        match factory(args) {
            Ok(component) => {
                let live = LiveComponent::spawn(
                    name.clone(),
                    component_type.to_string(),
                    component,
                    self.root.child_token(),
                    self.finished_tx.clone(),
                );
                self.components.insert(name.clone(), live);
                log::info!("[VM] Defined {component_type} component {name}");
                let output: Value =
                    [("component", name.as_str()), ("type", component_type)].into_iter().collect();
                emitter.done(output);
            }
            Err(e) => {
                log::warn!("[VM] Factory for {component_type} failed: {e}");
                emitter.fail(e);
            }
        }
    }

    fn delete_component(&mut self, name: &str, emitter: ReplyEmitter) {
        let Some(live) = self.components.remove(name) else {
            emitter.fail(RegistryError::not_found("component", name));
            return;
        };
        live.token.cancel();
        drop(live.calls);
        let name = name.to_string();
        let component_type = live.component_type;
        let task = live.task;
        tokio::spawn(async move {
            match task.await {
                Ok(()) => {
                    log::info!("[VM] Deleted {component_type} component {name}");
                    emitter.done(Value::Null);
                }
                Err(e) => {
                    log::error!("[VM] Component {name} task failed: {e}");
                    emitter.fail(RuntimeError::operator(format!("teardown of {name} failed: {e}")));
                }
            }
        });
    }

    fn call_method(&mut self, component: &str, method: String, args: Value, emitter: ReplyEmitter) {
        let Some(live) = self.components.get(component) else {
            emitter.fail(RegistryError::not_found("component", component));
            return;
        };
        let key = emitter.key();
        let cancel = live.token.child_token();
        self.inflight.insert(key.clone(), cancel.clone());
        if let Err(rejected) = live.calls.send(MethodCall { method, args, emitter, cancel }) {
            self.inflight.remove(&key);
            rejected.0.emitter.fail(RegistryError::not_found("component", component));
        }
    }

    fn cancel(&mut self, origin: ClientId, transaction_id: String) {
        let key = (origin, transaction_id);
        let packet = match self.inflight.get(&key) {
            Some(token) => {
                log::debug!("[VM] Cancelling tx={} from {}", key.1, key.0);
                token.cancel();
                Packet::respond_ok(&key.1)
            }
            None => {
                let error = RuntimeError::from(RoutingError::UnknownTarget(key.1.clone()));
                Packet::respond_err(&key.1, &error)
            }
        };
        let reply = VmReply { origin: key.0, target: None, packet };
        let _ = self.replies.send(reply);
    }

    async fn shutdown(mut self) {
        self.root.cancel();
        let count = self.components.len();
        for (name, live) in self.components.drain() {
            drop(live.calls);
            if let Err(e) = live.task.await {
                log::warn!("[VM] Component {name} task failed during shutdown: {e}");
            }
        }
        log::info!("[VM] Stopped ({count} components torn down)");
    }
}
