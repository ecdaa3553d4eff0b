//! Function and method operators, and the streaming driver.
//!
//! An operator is either *instant* (one result) or *streaming* (a finite
//! stream of partial results). The VM turns a stream into
//! `respond_execute` packets with one element of lookahead, so the last
//! element is the one sent with `done: true`:
//!
//! ```text
//! stream:  a      b      c      <end>
//! emitted:        a/0    b/1    c/2 done
//! ```
//!
//! An empty stream completes with `output: null`. A stream error is sent
//! as a failure and nothing follows it. Cancellation is observed between
//! elements and reported as `Cancelled`. Either way, an element already
//! produced is emitted before the failure, so outputs stay gapless:
//!
//! ```text
//! stream:  a      b      <error>
//! emitted:        a/0    b/1 + error/2
//! ```

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use futures_util::stream::{self, BoxStream, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::error::RuntimeError;
use crate::value::Value;

use super::emitter::ReplyEmitter;

/// Stream of partial results produced by a streaming operator.
pub type ValueStream = BoxStream<'static, Result<Value, RuntimeError>>;

/// Instant function body.
pub type InstantFn = Arc<dyn Fn(Value) -> Result<Value, RuntimeError> + Send + Sync>;

/// Streaming function body.
pub type StreamingFn = Arc<dyn Fn(Value) -> Result<ValueStream, RuntimeError> + Send + Sync>;

/// Instant method body over erased component state.
pub type InstantMethodFn =
    Arc<dyn Fn(&mut (dyn Any + Send), Value) -> Result<Value, RuntimeError> + Send + Sync>;

/// Streaming method body over erased component state.
pub type StreamingMethodFn =
    Arc<dyn Fn(&mut (dyn Any + Send), Value) -> Result<ValueStream, RuntimeError> + Send + Sync>;

/// A stateless module function.
#[derive(Clone)]
pub enum Operator {
    /// Returns exactly one result.
    Instant(InstantFn),
    /// Returns a finite stream of results.
    Streaming(StreamingFn),
}

impl Operator {
    /// Wrap an instant function.
    pub fn instant<F>(f: F) -> Self
    where
        F: Fn(Value) -> Result<Value, RuntimeError> + Send + Sync + 'static,
    {
        Self::Instant(Arc::new(f))
    }

    /// Wrap a streaming function.
    pub fn streaming<F>(f: F) -> Self
    where
        F: Fn(Value) -> Result<ValueStream, RuntimeError> + Send + Sync + 'static,
    {
        Self::Streaming(Arc::new(f))
    }
}

impl fmt::Debug for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Instant(_) => f.write_str("Operator::Instant"),
            Self::Streaming(_) => f.write_str("Operator::Streaming"),
        }
    }
}

/// A component method, bound to erased component state.
///
/// Built through [`ComponentBuilder`](super::component::ComponentBuilder),
/// which checks the state type once per call.
#[derive(Clone)]
pub enum MethodOperator {
    /// Returns exactly one result.
    Instant(InstantMethodFn),
    /// Returns a finite stream of results. The stream must own what it
    /// reads; it cannot borrow the component state.
    Streaming(StreamingMethodFn),
}

impl fmt::Debug for MethodOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Instant(_) => f.write_str("MethodOperator::Instant"),
            Self::Streaming(_) => f.write_str("MethodOperator::Streaming"),
        }
    }
}

/// Stream that yields `items` in order.
pub fn iter_stream<I>(items: I) -> ValueStream
where
    I: IntoIterator<Item = Value>,
    I::IntoIter: Send + 'static,
{
    stream::iter(items.into_iter().map(Ok)).boxed()
}

/// Run a function operator to completion, emitting its responses.
pub(crate) async fn run_function(
    op: &Operator,
    args: Value,
    emitter: ReplyEmitter,
    cancel: &CancellationToken,
) {
    if cancel.is_cancelled() {
        emitter.fail(RuntimeError::cancelled());
        return;
    }
    match op {
        Operator::Instant(f) => emitter.finish(f(args)),
        Operator::Streaming(f) => match f(args) {
            Ok(stream) => drive(stream, emitter, cancel).await,
            Err(e) => emitter.fail(e),
        },
    }
}

/// Emit a stream as `respond_execute` packets, honoring `cancel`.
pub(crate) async fn drive(mut stream: ValueStream, mut emitter: ReplyEmitter, cancel: &CancellationToken) {
    let mut pending: Option<Value> = None;
    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                if let Some(previous) = pending.take() {
                    emitter.partial(previous);
                }
                emitter.fail(RuntimeError::cancelled());
                return;
            }
            next = stream.next() => next,
        };
        match next {
            Some(Ok(value)) => {
                if let Some(previous) = pending.replace(value) {
                    emitter.partial(previous);
                }
            }
            Some(Err(e)) => {
                if let Some(previous) = pending.take() {
                    emitter.partial(previous);
                }
                emitter.fail(e);
                return;
            }
            None => {
                emitter.done(pending.unwrap_or(Value::Null));
                return;
            }
        }
    }
}
