//! Per-transaction response emitter.

use tokio::sync::mpsc::UnboundedSender;

use crate::error::RuntimeError;
use crate::protocol::{Packet, Target};
use crate::transport::ClientId;
use crate::value::Value;

use super::{CallKey, VmReply};

/// Sends the `respond_execute` packets of one transaction in order.
///
/// Sequence numbers start at 0 and increase by one per packet. The
/// terminal methods consume the emitter, so nothing can follow a `done`
/// or failed response.
#[derive(Debug)]
pub(crate) struct ReplyEmitter {
    replies: UnboundedSender<VmReply>,
    origin: ClientId,
    transaction_id: String,
    target: Target,
    sequence: u32,
}

impl ReplyEmitter {
    pub fn new(
        replies: UnboundedSender<VmReply>,
        origin: ClientId,
        transaction_id: String,
        target: Target,
    ) -> Self {
        Self { replies, origin, transaction_id, target, sequence: 0 }
    }

    /// In-flight key of this transaction.
    pub fn key(&self) -> CallKey {
        (self.origin.clone(), self.transaction_id.clone())
    }

    /// Emit a non-final result.
    pub fn partial(&mut self, output: Value) {
        let packet = Packet::respond_execute(&self.transaction_id, self.sequence, false, output);
        self.emit(packet);
    }

    /// Emit the final result.
    pub fn done(mut self, output: Value) {
        let packet = Packet::respond_execute(&self.transaction_id, self.sequence, true, output);
        self.emit(packet);
    }

    /// Emit a failure. Terminal.
    pub fn fail(mut self, error: impl Into<RuntimeError>) {
        let error = error.into();
        log::debug!("[VM] {} tx={} failed: {error}", self.target, self.transaction_id);
        let packet = Packet::respond_execute_err(&self.transaction_id, self.sequence, &error);
        self.emit(packet);
    }

    /// Emit an instant operator's result.
    pub fn finish(self, result: Result<Value, RuntimeError>) {
        match result {
            Ok(output) => self.done(output),
            Err(e) => self.fail(e),
        }
    }

    fn emit(&mut self, packet: Packet) {
        self.sequence += 1;
        let reply = VmReply {
            origin: self.origin.clone(),
            target: Some(self.target.clone()),
            packet,
        };
        if self.replies.send(reply).is_err() {
            log::debug!("[VM] Broker gone, dropping reply for tx={}", self.transaction_id);
        }
    }
}
