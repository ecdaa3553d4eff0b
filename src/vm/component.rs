//! Components: stateful method sets owned by one actor task each.
//!
//! A live component has a private mailbox of method calls. Its actor runs
//! them one at a time, in arrival order, so calls on one component are
//! serialized while different components run concurrently.
//!
//! ```text
//! VM ──MethodCall──► mailbox ──► actor ──► ReplyEmitter ──► broker
//!                               (owns state)
//! ```
//!
//! Deleting a component cancels its token: the running call observes the
//! cancellation, queued calls fail with `NotFound`, and the teardown hook
//! runs before the delete is acknowledged.

use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use indexmap::IndexMap;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{RegistryError, RuntimeError};
use crate::value::Value;

use super::emitter::ReplyEmitter;
use super::operator::{drive, MethodOperator, ValueStream};
use super::CallKey;

type TeardownFn = Box<dyn FnOnce(&mut (dyn Any + Send)) + Send>;

/// A component instance as produced by a factory.
pub struct Component {
    state: Box<dyn Any + Send>,
    methods: IndexMap<String, MethodOperator>,
    teardown: Option<TeardownFn>,
}

impl Component {
    /// Method names in registration order.
    pub fn method_names(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }

    async fn invoke(&mut self, name: &str, call: MethodCall) {
        let MethodCall { method, args, emitter, cancel } = call;
        let Some(op) = self.methods.get(&method).cloned() else {
            emitter.fail(RegistryError::not_found("method", format!("{name}.{method}")));
            return;
        };
        if cancel.is_cancelled() {
            emitter.fail(RuntimeError::cancelled());
            return;
        }
        match op {
            MethodOperator::Instant(f) => emitter.finish(f(self.state.as_mut(), args)),
            MethodOperator::Streaming(f) => match f(self.state.as_mut(), args) {
                Ok(stream) => drive(stream, emitter, &cancel).await,
                Err(e) => emitter.fail(e),
            },
        }
    }

    fn teardown(mut self) {
        if let Some(hook) = self.teardown.take() {
            hook(self.state.as_mut());
        }
    }
}

impl fmt::Debug for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Component")
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .field("teardown", &self.teardown.is_some())
            .finish_non_exhaustive()
    }
}

/// Typed builder for [`Component`].
///
/// Method bodies receive `&mut S`; the state is erased only inside the
/// built component.
pub struct ComponentBuilder<S> {
    state: S,
    methods: IndexMap<String, MethodOperator>,
    teardown: Option<TeardownFn>,
    _state: PhantomData<fn(S)>,
}

impl<S: Any + Send> ComponentBuilder<S> {
    /// Start a component around `state`.
    pub fn new(state: S) -> Self {
        Self { state, methods: IndexMap::new(), teardown: None, _state: PhantomData }
    }

    /// Add an instant method.
    #[must_use]
    pub fn instant<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut S, Value) -> Result<Value, RuntimeError> + Send + Sync + 'static,
    {
        let op = move |state: &mut (dyn Any + Send), args: Value| f(downcast(state)?, args);
        self.methods.insert(name.into(), MethodOperator::Instant(Arc::new(op)));
        self
    }

    /// Add a streaming method.
    #[must_use]
    pub fn streaming<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut S, Value) -> Result<ValueStream, RuntimeError> + Send + Sync + 'static,
    {
        let op = move |state: &mut (dyn Any + Send), args: Value| f(downcast(state)?, args);
        self.methods.insert(name.into(), MethodOperator::Streaming(Arc::new(op)));
        self
    }

    /// Run `f` when the component is deleted or the VM stops.
    #[must_use]
    pub fn on_teardown<F>(mut self, f: F) -> Self
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        self.teardown = Some(Box::new(move |state: &mut (dyn Any + Send)| {
            if let Ok(state) = downcast::<S>(state) {
                f(state);
            }
        }));
        self
    }

    /// Finish the component.
    pub fn build(self) -> Component {
        Component { state: Box::new(self.state), methods: self.methods, teardown: self.teardown }
    }
}

fn downcast<S: Any>(state: &mut (dyn Any + Send)) -> Result<&mut S, RuntimeError> {
    state
        .downcast_mut::<S>()
        .ok_or_else(|| RuntimeError::operator("component state has an unexpected type"))
}

// ─── Actor ─────────────────────────────────────────────────────────────────

/// One queued method invocation.
#[derive(Debug)]
pub(crate) struct MethodCall {
    pub method: String,
    pub args: Value,
    pub emitter: ReplyEmitter,
    pub cancel: CancellationToken,
}

/// VM-side handle to a running component actor.
#[derive(Debug)]
pub(crate) struct LiveComponent {
    pub component_type: String,
    pub calls: UnboundedSender<MethodCall>,
    pub token: CancellationToken,
    pub task: JoinHandle<()>,
}

impl LiveComponent {
    /// Spawn the actor for `component`, cancelled by `token`.
    ///
    /// Every finished call's key is reported on `finished`.
    pub fn spawn(
        name: String,
        component_type: String,
        component: Component,
        token: CancellationToken,
        finished: UnboundedSender<CallKey>,
    ) -> Self {
        let (calls, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_actor(name, component, rx, token.clone(), finished));
        Self { component_type, calls, token, task }
    }
}

async fn run_actor(
    name: String,
    mut component: Component,
    mut calls: UnboundedReceiver<MethodCall>,
    token: CancellationToken,
    finished: UnboundedSender<CallKey>,
) {
    loop {
        let call = tokio::select! {
            biased;
            () = token.cancelled() => break,
            next = calls.recv() => match next {
                Some(call) => call,
                None => break,
            },
        };
        let key = call.emitter.key();
        component.invoke(&name, call).await;
        let _ = finished.send(key);
    }

    calls.close();
    while let Ok(call) = calls.try_recv() {
        let key = call.emitter.key();
        call.emitter.fail(RegistryError::not_found("component", name.as_str()));
        let _ = finished.send(key);
    }

    component.teardown();
    log::debug!("[VM] Component {name} torn down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Packet, Target};
    use crate::transport::ClientId;
    use crate::vm::operator::iter_stream;
    use crate::vm::VmReply;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn call(
        method: &str,
        args: Value,
        replies: &UnboundedSender<VmReply>,
        cancel: &CancellationToken,
    ) -> MethodCall {
        let emitter = ReplyEmitter::new(
            replies.clone(),
            ClientId::generate("t"),
            crate::protocol::new_transaction_id(),
            Target::method("c", method),
        );
        MethodCall { method: method.into(), args, emitter, cancel: cancel.child_token() }
    }

    fn counter() -> Component {
        ComponentBuilder::new(0i64)
            .instant("add", |n, args| {
                *n += args.as_i64().unwrap_or(1);
                Ok(Value::from(*n))
            })
            .streaming("countdown", |n, _| {
                Ok(iter_stream((0..*n).rev().map(Value::from).collect::<Vec<_>>()))
            })
            .build()
    }

    async fn next(rx: &mut UnboundedReceiver<VmReply>) -> Packet {
        rx.recv().await.unwrap().packet
    }

    #[tokio::test]
    async fn test_calls_mutate_state_in_order() {
        let (replies, mut rx) = mpsc::unbounded_channel();
        let (finished, _finished_rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        let live = LiveComponent::spawn("c".into(), "counter".into(), counter(), token.clone(), finished);

        for n in [2, 3, 5] {
            live.calls.send(call("add", Value::from(n), &replies, &token)).unwrap();
        }
        let outputs: Vec<Value> = [
            next(&mut rx).await,
            next(&mut rx).await,
            next(&mut rx).await,
        ]
        .iter()
        .map(|p| p.output().cloned().unwrap())
        .collect();
        assert_eq!(outputs, vec![Value::from(2), Value::from(5), Value::from(10)]);

        live.calls.send(call("countdown", Value::Null, &replies, &token)).unwrap();
        let mut seen = Vec::new();
        loop {
            let packet = next(&mut rx).await;
            seen.push(packet.output().and_then(Value::as_i64).unwrap());
            if packet.is_terminal() {
                break;
            }
        }
        assert_eq!(seen, (0..10).rev().collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_unknown_method_is_not_found() {
        let (replies, mut rx) = mpsc::unbounded_channel();
        let (finished, _finished_rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        let live = LiveComponent::spawn("c".into(), "counter".into(), counter(), token.clone(), finished);
        live.calls.send(call("nope", Value::Null, &replies, &token)).unwrap();
        let err = next(&mut rx).await.error().unwrap();
        assert_eq!(err.code, "NotFound");
        assert!(err.detail.contains("c.nope"));
    }

    #[tokio::test]
    async fn test_cancel_runs_teardown_and_fails_queued_calls() {
        let torn_down = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&torn_down);
        let component = ComponentBuilder::new(())
            .instant("noop", |_, _| Ok(Value::Null))
            .on_teardown(move |_| flag.store(true, Ordering::SeqCst))
            .build();

        let (replies, mut rx) = mpsc::unbounded_channel();
        let (finished, _finished_rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        let live = LiveComponent::spawn("c".into(), "unit".into(), component, token.clone(), finished);

        token.cancel();
        let _ = live.calls.send(call("noop", Value::Null, &replies, &token));
        live.task.await.unwrap();

        assert!(torn_down.load(Ordering::SeqCst));
        if let Ok(reply) = rx.try_recv() {
            assert_eq!(reply.packet.error().unwrap().code, "NotFound");
        }
    }

    #[test]
    fn test_builder_lists_methods() {
        let component = counter();
        let names: Vec<&str> = component.method_names().collect();
        assert_eq!(names, vec!["add", "countdown"]);
    }
}
