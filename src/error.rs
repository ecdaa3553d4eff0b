//! Error taxonomy shared by the broker, the VM and clients.
//!
//! Every failure that crosses the broker/VM boundary is one of the
//! [`RuntimeError`] classes below. On the wire it becomes a failed body:
//!
//! ```text
//! {status: false, reason: <code>, detail: <message>}
//! ```
//!
//! where `reason` is the stable code from [`RuntimeError::code`] and
//! `detail` is the `Display` text. Clients rebuild a [`RemoteError`].
//!
//! Only [`ProtocolError`] is fatal to a connection; everything else is
//! reported to the caller and the connection survives.

// Rust guideline compliant 2026-02

use std::fmt;

use crate::value::{Map, Value};

/// Malformed packets and protocol misuse. Fatal to the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Packet bytes could not be decoded.
    Malformed(String),
    /// Packet type code outside the known set.
    UnknownPacketType(u8),
    /// Instruction type code outside the known set.
    UnknownInstructionType(u8),
    /// An instruction type is required for this packet type but missing.
    MissingInstruction(&'static str),
    /// An instruction type was given to a packet type that cannot carry one.
    UnexpectedInstruction(&'static str),
    /// A required routing header is missing or not a string.
    MissingHeader(&'static str),
    /// A packet other than `connect` arrived before the handshake.
    NotConnected,
    /// A client sent a packet type only the broker may send.
    UnexpectedPacket(&'static str),
    /// Framing layer rejected the byte stream.
    Frame(String),
    /// A packet field or frame does not fit its length prefix or limit.
    TooLarge {
        /// What overflowed, e.g. `transaction id` or `frame`.
        what: &'static str,
        /// Actual size in bytes.
        len: usize,
        /// Largest allowed size in bytes.
        max: usize,
    },
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed(msg) => write!(f, "Malformed packet: {msg}"),
            Self::UnknownPacketType(code) => write!(f, "Unknown packet type: {code}"),
            Self::UnknownInstructionType(code) => write!(f, "Unknown instruction type: {code}"),
            Self::MissingInstruction(packet) => {
                write!(f, "Packet type {packet} requires an instruction type")
            }
            Self::UnexpectedInstruction(packet) => {
                write!(f, "Packet type {packet} cannot carry an instruction type")
            }
            Self::MissingHeader(name) => write!(f, "Missing or invalid header: {name}"),
            Self::NotConnected => write!(f, "Expected connect before any other packet"),
            Self::UnexpectedPacket(packet) => write!(f, "Clients may not send {packet} packets"),
            Self::Frame(msg) => write!(f, "Framing error: {msg}"),
            Self::TooLarge { what, len, max } => write!(f, "{what} is {len} bytes (max {max})"),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Routing failures reported by the broker or VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingError {
    /// The VM inbound channel is closed.
    VmUnavailable,
    /// No in-flight transaction matches a cancel request.
    UnknownTarget(String),
}

impl fmt::Display for RoutingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::VmUnavailable => write!(f, "vm unavailable"),
            Self::UnknownTarget(target) => write!(f, "No in-flight transaction: {target}"),
        }
    }
}

impl std::error::Error for RoutingError {}

/// Argument validation failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// A field is present with the wrong type.
    Type {
        /// Operation being validated.
        op: String,
        /// Offending field.
        field: String,
        /// Expected value type.
        expected: &'static str,
        /// Actual value type.
        actual: &'static str,
    },
    /// A required field is missing or out of range.
    Range {
        /// Operation being validated.
        op: String,
        /// Offending field.
        field: String,
    },
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Type { op, field, expected, actual } => write!(
                f,
                "{op}: field '{field}' expected {expected}, got {actual}"
            ),
            Self::Range { op, field } => write!(f, "{op}: field '{field}' missing or out of range"),
        }
    }
}

impl std::error::Error for ValidationError {}

/// Function, component and factory lookup failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// Target does not exist. `kind` is "function", "component" or "method".
    NotFound {
        /// What kind of target was looked up.
        kind: &'static str,
        /// Name that was looked up.
        name: String,
    },
    /// A live component already uses this name.
    AlreadyExists(String),
    /// No factory registered for this component type.
    UnknownComponentType(String),
    /// Two modules contribute the same function or factory name.
    DuplicateName {
        /// "function" or "component type".
        kind: &'static str,
        /// The clashing name.
        name: String,
        /// Module that registered it first.
        first: String,
        /// Module that tried to register it again.
        second: String,
    },
}

impl RegistryError {
    /// Shorthand for [`RegistryError::NotFound`].
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound { kind, name: name.into() }
    }
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { kind, name } => write!(f, "No such {kind}: {name}"),
            Self::AlreadyExists(name) => write!(f, "Component already exists: {name}"),
            Self::UnknownComponentType(ty) => write!(f, "Unknown component type: {ty}"),
            Self::DuplicateName { kind, name, first, second } => write!(
                f,
                "Duplicate {kind} '{name}' registered by modules '{first}' and '{second}'"
            ),
        }
    }
}

impl std::error::Error for RegistryError {}

/// Failures raised by operator or factory code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperatorError {
    /// The operator reported a failure; the message is passed through verbatim.
    Failed(String),
    /// The transaction was cancelled before it completed.
    Cancelled,
}

impl fmt::Display for OperatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed(msg) => write!(f, "{msg}"),
            Self::Cancelled => write!(f, "Transaction cancelled"),
        }
    }
}

impl std::error::Error for OperatorError {}

/// Any failure that can be reported back to a caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    /// See [`ProtocolError`].
    Protocol(ProtocolError),
    /// See [`RoutingError`].
    Routing(RoutingError),
    /// See [`ValidationError`].
    Validation(ValidationError),
    /// See [`RegistryError`].
    Registry(RegistryError),
    /// See [`OperatorError`].
    Operator(OperatorError),
}

impl RuntimeError {
    /// Wrap an operator failure message.
    pub fn operator(msg: impl Into<String>) -> Self {
        Self::Operator(OperatorError::Failed(msg.into()))
    }

    /// Cancellation of an in-flight transaction.
    pub fn cancelled() -> Self {
        Self::Operator(OperatorError::Cancelled)
    }

    /// Stable error-kind code carried in the `reason` field.
    ///
    /// `VmUnavailable` is reported as the literal `vm unavailable`, the
    /// reason string clients match on.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Protocol(_) => "ProtocolError",
            Self::Routing(RoutingError::VmUnavailable) => "vm unavailable",
            Self::Routing(RoutingError::UnknownTarget(_)) => "UnknownTarget",
            Self::Validation(ValidationError::Type { .. }) => "TypeError",
            Self::Validation(ValidationError::Range { .. }) => "RangeError",
            Self::Registry(RegistryError::NotFound { .. }) => "NotFound",
            Self::Registry(RegistryError::AlreadyExists(_)) => "AlreadyExists",
            Self::Registry(RegistryError::UnknownComponentType(_)) => "UnknownComponentType",
            Self::Registry(RegistryError::DuplicateName { .. }) => "DuplicateName",
            Self::Operator(OperatorError::Failed(_)) => "OperatorError",
            Self::Operator(OperatorError::Cancelled) => "Cancelled",
        }
    }

    /// Failure body sent in `respond` / `respond_execute` packets.
    pub fn to_body(&self) -> Value {
        let mut body = Map::new();
        body.insert("status".into(), Value::Bool(false));
        body.insert("reason".into(), Value::from(self.code()));
        body.insert("detail".into(), Value::from(self.to_string()));
        Value::Map(body)
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Protocol(e) => write!(f, "{e}"),
            Self::Routing(e) => write!(f, "{e}"),
            Self::Validation(e) => write!(f, "{e}"),
            Self::Registry(e) => write!(f, "{e}"),
            Self::Operator(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for RuntimeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Protocol(e) => Some(e),
            Self::Routing(e) => Some(e),
            Self::Validation(e) => Some(e),
            Self::Registry(e) => Some(e),
            Self::Operator(e) => Some(e),
        }
    }
}

impl From<ProtocolError> for RuntimeError {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

impl From<RoutingError> for RuntimeError {
    fn from(e: RoutingError) -> Self {
        Self::Routing(e)
    }
}

impl From<ValidationError> for RuntimeError {
    fn from(e: ValidationError) -> Self {
        Self::Validation(e)
    }
}

impl From<RegistryError> for RuntimeError {
    fn from(e: RegistryError) -> Self {
        Self::Registry(e)
    }
}

impl From<OperatorError> for RuntimeError {
    fn from(e: OperatorError) -> Self {
        Self::Operator(e)
    }
}

/// A failure reported by the broker or VM, as seen by a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    /// Error-kind code, e.g. `NotFound`.
    pub code: String,
    /// Human-readable message.
    pub detail: String,
}

impl RemoteError {
    /// Rebuild from a failed response body. Returns `None` for success bodies.
    pub fn from_body(body: &Value) -> Option<Self> {
        if body.get("status").and_then(Value::as_bool) != Some(false) {
            return None;
        }
        let code = body
            .get("reason")
            .and_then(Value::as_str)
            .unwrap_or("Unknown")
            .to_string();
        let detail = body
            .get("detail")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Some(Self { code, detail })
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.detail.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{}: {}", self.code, self.detail)
        }
    }
}

impl std::error::Error for RemoteError {}
