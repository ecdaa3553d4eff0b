//! Packet model and wire protocol.
//!
//! A [`Packet`] carries a transaction id, a packet type, an optional
//! instruction type, an optional sequence number, string-keyed headers and
//! a [`Value`] body. Requests pair with responses by transaction id:
//!
//! ```text
//! connect / disconnect / subscribe / unsubscribe / cancel ──► respond
//! execute ──► respond_execute (seq 0) ... respond_execute (seq n, done)
//! ```
//!
//! # Header conventions
//!
//! | Instruction        | headers                  | execute body     |
//! |--------------------|--------------------------|------------------|
//! | `call_function`    | `{function}`             | `{args}`         |
//! | `define_component` | `{type}`                 | `{name, args}`   |
//! | `delete_component` | `{component}`            | `{}`             |
//! | `call_method`      | `{component, method}`    | `{args}`         |
//!
//! `respond_execute` headers are `{done: bool}`. Success bodies are
//! `{status: true, output}` and failures `{status: false, reason, detail}`.
//! A failed `respond_execute` is terminal and is never followed by a
//! `done: true` response for the same transaction.
//!
//! # Submodules
//!
//! - [`packet`] - binary packet codec
//! - [`framing`] - length-prefixed frames for byte-stream transports

// Rust guideline compliant 2026-02

pub mod framing;
pub mod packet;

use std::fmt;

use crate::error::{ProtocolError, RemoteError, RuntimeError};
use crate::value::{Map, Value};

/// Packet type with its wire code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// Client handshake.
    Connect = 0,
    /// Client goodbye.
    Disconnect = 1,
    /// Register interest in a target.
    Subscribe = 2,
    /// Drop interest in a target.
    Unsubscribe = 3,
    /// Run an instruction on the VM.
    Execute = 4,
    /// Cooperative stop of an in-flight transaction.
    Cancel = 5,
    /// Single reply to connect/disconnect/subscribe/unsubscribe/cancel.
    Respond = 16,
    /// One of possibly many replies to an execute.
    RespondExecute = 17,
}

impl PacketType {
    /// Wire code.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Parse a wire code.
    pub fn from_code(code: u8) -> Result<Self, ProtocolError> {
        Ok(match code {
            0 => Self::Connect,
            1 => Self::Disconnect,
            2 => Self::Subscribe,
            3 => Self::Unsubscribe,
            4 => Self::Execute,
            5 => Self::Cancel,
            16 => Self::Respond,
            17 => Self::RespondExecute,
            other => return Err(ProtocolError::UnknownPacketType(other)),
        })
    }

    /// Whether this packet type requires an instruction type.
    pub fn carries_instruction(self) -> bool {
        matches!(self, Self::Subscribe | Self::Unsubscribe | Self::Execute)
    }

    /// snake_case name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Disconnect => "disconnect",
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
            Self::Execute => "execute",
            Self::Cancel => "cancel",
            Self::Respond => "respond",
            Self::RespondExecute => "respond_execute",
        }
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Instruction type with its wire code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum InstructionType {
    /// Call a stateless module function.
    CallFunction = 0,
    /// Create a named component from a factory.
    DefineComponent = 1,
    /// Tear down a named component.
    DeleteComponent = 2,
    /// Call a method on a live component.
    CallMethod = 3,
}

impl InstructionType {
    /// Wire code.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Parse a wire code.
    pub fn from_code(code: u8) -> Result<Self, ProtocolError> {
        Ok(match code {
            0 => Self::CallFunction,
            1 => Self::DefineComponent,
            2 => Self::DeleteComponent,
            3 => Self::CallMethod,
            other => return Err(ProtocolError::UnknownInstructionType(other)),
        })
    }

    /// snake_case name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CallFunction => "call_function",
            Self::DefineComponent => "define_component",
            Self::DeleteComponent => "delete_component",
            Self::CallMethod => "call_method",
        }
    }
}

impl fmt::Display for InstructionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Header keys used for routing.
pub mod header {
    /// Function name (`call_function`).
    pub const FUNCTION: &str = "function";
    /// Component type (`define_component`).
    pub const TYPE: &str = "type";
    /// Component name (`delete_component`, `call_method`).
    pub const COMPONENT: &str = "component";
    /// Method name (`call_method`).
    pub const METHOD: &str = "method";
    /// Final-response flag (`respond_execute`).
    pub const DONE: &str = "done";
    /// Protocol version (`connect`).
    pub const VERSION: &str = "version";
}

/// Protocol version announced in `connect`.
pub const PROTOCOL_VERSION: &str = "1";

/// Addressable target of an instruction; the subscription key.
///
/// Each variant fixes its instruction type, so a target can never be
/// paired with the wrong instruction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    /// `call_function` on a module function.
    Function(String),
    /// `define_component` of a component type.
    ComponentType(String),
    /// `delete_component` of a named component.
    Component(String),
    /// `call_method` on a named component.
    Method {
        /// Component name.
        component: String,
        /// Method name.
        method: String,
    },
}

impl Target {
    /// `call_function` target.
    pub fn function(name: impl Into<String>) -> Self {
        Self::Function(name.into())
    }

    /// `define_component` target.
    pub fn component_type(ty: impl Into<String>) -> Self {
        Self::ComponentType(ty.into())
    }

    /// `delete_component` target.
    pub fn component(name: impl Into<String>) -> Self {
        Self::Component(name.into())
    }

    /// `call_method` target.
    pub fn method(component: impl Into<String>, method: impl Into<String>) -> Self {
        Self::Method { component: component.into(), method: method.into() }
    }

    /// Instruction type addressed by this target.
    pub fn instruction_type(&self) -> InstructionType {
        match self {
            Self::Function(_) => InstructionType::CallFunction,
            Self::ComponentType(_) => InstructionType::DefineComponent,
            Self::Component(_) => InstructionType::DeleteComponent,
            Self::Method { .. } => InstructionType::CallMethod,
        }
    }

    /// Write routing headers for this target.
    pub fn write_headers(&self, headers: &mut Map) {
        match self {
            Self::Function(name) => {
                headers.insert(header::FUNCTION.into(), Value::from(name.as_str()));
            }
            Self::ComponentType(ty) => {
                headers.insert(header::TYPE.into(), Value::from(ty.as_str()));
            }
            Self::Component(name) => {
                headers.insert(header::COMPONENT.into(), Value::from(name.as_str()));
            }
            Self::Method { component, method } => {
                headers.insert(header::COMPONENT.into(), Value::from(component.as_str()));
                headers.insert(header::METHOD.into(), Value::from(method.as_str()));
            }
        }
    }

    /// Read a target for `instruction` from routing headers.
    pub fn from_headers(instruction: InstructionType, headers: &Map) -> Result<Self, ProtocolError> {
        let text = |key: &'static str| {
            headers
                .get(key)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or(ProtocolError::MissingHeader(key))
        };
        Ok(match instruction {
            InstructionType::CallFunction => Self::Function(text(header::FUNCTION)?),
            InstructionType::DefineComponent => Self::ComponentType(text(header::TYPE)?),
            InstructionType::DeleteComponent => Self::Component(text(header::COMPONENT)?),
            InstructionType::CallMethod => Self::Method {
                component: text(header::COMPONENT)?,
                method: text(header::METHOD)?,
            },
        })
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Function(name) => write!(f, "call_function/{name}"),
            Self::ComponentType(ty) => write!(f, "define_component/{ty}"),
            Self::Component(name) => write!(f, "delete_component/{name}"),
            Self::Method { component, method } => write!(f, "call_method/{component}/{method}"),
        }
    }
}

/// One protocol message.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    /// Correlates every packet of one logical request.
    pub transaction_id: String,
    /// Packet type.
    pub packet_type: PacketType,
    /// Present only on subscribe, unsubscribe and execute.
    pub instruction_type: Option<InstructionType>,
    /// Present only on respond_execute.
    pub sequence: Option<u32>,
    /// Routing and control headers.
    pub headers: Map,
    /// Payload.
    pub body: Value,
}

/// Generate a fresh transaction id.
pub fn new_transaction_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn ok_body() -> Value {
    [("status", true)].into_iter().collect()
}

fn ok_output_body(output: Value) -> Value {
    [("status", Value::Bool(true)), ("output", output)].into_iter().collect()
}

impl Packet {
    fn bare(transaction_id: impl Into<String>, packet_type: PacketType) -> Self {
        Self {
            transaction_id: transaction_id.into(),
            packet_type,
            instruction_type: None,
            sequence: None,
            headers: Map::new(),
            body: Value::map(),
        }
    }

    fn routed(transaction_id: impl Into<String>, packet_type: PacketType, target: &Target) -> Self {
        let mut packet = Self::bare(transaction_id, packet_type);
        packet.instruction_type = Some(target.instruction_type());
        target.write_headers(&mut packet.headers);
        packet
    }

    // ─── Requests ──────────────────────────────────────────────────────────

    /// `connect` handshake.
    pub fn connect(transaction_id: impl Into<String>) -> Self {
        let mut packet = Self::bare(transaction_id, PacketType::Connect);
        packet.headers.insert(header::VERSION.into(), Value::from(PROTOCOL_VERSION));
        packet
    }

    /// `disconnect`.
    pub fn disconnect(transaction_id: impl Into<String>) -> Self {
        Self::bare(transaction_id, PacketType::Disconnect)
    }

    /// `subscribe` to `target`.
    pub fn subscribe(transaction_id: impl Into<String>, target: &Target) -> Self {
        Self::routed(transaction_id, PacketType::Subscribe, target)
    }

    /// `unsubscribe` from `target`.
    pub fn unsubscribe(transaction_id: impl Into<String>, target: &Target) -> Self {
        Self::routed(transaction_id, PacketType::Unsubscribe, target)
    }

    /// `execute` against `target` with body `{args}`.
    ///
    /// For `define_component` prefer [`Packet::define_component`], which
    /// also carries the new component's name.
    pub fn execute(transaction_id: impl Into<String>, target: &Target, args: Value) -> Self {
        let mut packet = Self::routed(transaction_id, PacketType::Execute, target);
        packet.body = [("args", args)].into_iter().collect();
        packet
    }

    /// `execute(call_function)`.
    pub fn call_function(transaction_id: impl Into<String>, function: &str, args: Value) -> Self {
        Self::execute(transaction_id, &Target::function(function), args)
    }

    /// `execute(define_component)` creating `name` of type `component_type`.
    pub fn define_component(
        transaction_id: impl Into<String>,
        component_type: &str,
        name: &str,
        args: Value,
    ) -> Self {
        let mut packet =
            Self::routed(transaction_id, PacketType::Execute, &Target::component_type(component_type));
        packet.body = [("name", Value::from(name)), ("args", args)].into_iter().collect();
        packet
    }

    /// `execute(delete_component)`.
    pub fn delete_component(transaction_id: impl Into<String>, name: &str) -> Self {
        Self::routed(transaction_id, PacketType::Execute, &Target::component(name))
    }

    /// `execute(call_method)`.
    pub fn call_method(
        transaction_id: impl Into<String>,
        component: &str,
        method: &str,
        args: Value,
    ) -> Self {
        Self::execute(transaction_id, &Target::method(component, method), args)
    }

    /// `cancel` of the in-flight transaction `transaction_id`.
    pub fn cancel(transaction_id: impl Into<String>) -> Self {
        Self::bare(transaction_id, PacketType::Cancel)
    }

    // ─── Responses ─────────────────────────────────────────────────────────

    /// `respond` success.
    pub fn respond_ok(transaction_id: impl Into<String>) -> Self {
        let mut packet = Self::bare(transaction_id, PacketType::Respond);
        packet.body = ok_body();
        packet
    }

    /// `respond` failure.
    pub fn respond_err(transaction_id: impl Into<String>, error: &RuntimeError) -> Self {
        let mut packet = Self::bare(transaction_id, PacketType::Respond);
        packet.body = error.to_body();
        packet
    }

    /// Successful `respond_execute`.
    pub fn respond_execute(
        transaction_id: impl Into<String>,
        sequence: u32,
        done: bool,
        output: Value,
    ) -> Self {
        let mut packet = Self::bare(transaction_id, PacketType::RespondExecute);
        packet.sequence = Some(sequence);
        packet.headers.insert(header::DONE.into(), Value::Bool(done));
        packet.body = ok_output_body(output);
        packet
    }

    /// Failed `respond_execute`. Terminal, and never marked `done`.
    pub fn respond_execute_err(
        transaction_id: impl Into<String>,
        sequence: u32,
        error: &RuntimeError,
    ) -> Self {
        let mut packet = Self::bare(transaction_id, PacketType::RespondExecute);
        packet.sequence = Some(sequence);
        packet.headers.insert(header::DONE.into(), Value::Bool(false));
        packet.body = error.to_body();
        packet
    }

    // ─── Inspection ────────────────────────────────────────────────────────

    /// Check the per-type field rules.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        let name = self.packet_type.as_str();
        match (self.packet_type.carries_instruction(), self.instruction_type) {
            (true, None) => return Err(ProtocolError::MissingInstruction(name)),
            (false, Some(_)) => return Err(ProtocolError::UnexpectedInstruction(name)),
            _ => {}
        }
        match (self.packet_type, self.sequence) {
            (PacketType::RespondExecute, None) => {
                Err(ProtocolError::Malformed("respond_execute without sequence".into()))
            }
            (PacketType::RespondExecute, Some(_)) | (_, None) => Ok(()),
            (_, Some(_)) => Err(ProtocolError::Malformed(format!("{name} cannot carry a sequence"))),
        }
    }

    /// Routing target of a subscribe/unsubscribe/execute packet.
    pub fn target(&self) -> Result<Target, ProtocolError> {
        let instruction = self
            .instruction_type
            .ok_or(ProtocolError::MissingInstruction(self.packet_type.as_str()))?;
        Target::from_headers(instruction, &self.headers)
    }

    /// `status` field of a response body. Missing means failure.
    pub fn status(&self) -> bool {
        self.body.get("status").and_then(Value::as_bool).unwrap_or(false)
    }

    /// `done` header of a `respond_execute`.
    pub fn done(&self) -> bool {
        self.headers.get(header::DONE).and_then(Value::as_bool).unwrap_or(false)
    }

    /// `output` of a successful `respond_execute`.
    pub fn output(&self) -> Option<&Value> {
        self.body.get("output")
    }

    /// Failure carried by a response, if any.
    pub fn error(&self) -> Option<RemoteError> {
        RemoteError::from_body(&self.body)
    }

    /// Whether this is the last packet of its transaction: a `respond`,
    /// a failed `respond_execute`, or one marked `done`.
    pub fn is_terminal(&self) -> bool {
        match self.packet_type {
            PacketType::Respond => true,
            PacketType::RespondExecute => self.done() || !self.status(),
            _ => false,
        }
    }

    /// Args of an execute body (`Null` when absent).
    pub fn args(&self) -> &Value {
        self.body.get("args").unwrap_or(&Value::Null)
    }
}
