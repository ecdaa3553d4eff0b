//! Switchboard - local-first agent runtime.
//!
//! A broker routes request/response packets between clients and a
//! component-hosting VM. Clients call stateless module functions, create
//! and delete named stateful components, and call component methods that
//! return one result or a stream of partial results. Any client can
//! subscribe to a target and receive every response for it.
//!
//! # Architecture
//!
//! ```text
//! BrokerClient ──Channel (inproc / tcp / ipc)──► Broker ──► VM ──► component actors
//!      ▲                                           │        │
//!      └──────────── respond / respond_execute ────┴────────┘
//! ```
//!
//! # Modules
//!
//! - [`value`] - dynamically typed values and their binary codec
//! - [`protocol`] - packets, targets and wire encoding
//! - [`transport`] - in-process and socket channels
//! - `broker` - routing and subscriptions (internal)
//! - [`vm`] - modules, components and operators
//! - [`client`] - request/response client
//! - [`runtime`] - lifecycle of a broker and VM pair
//! - [`modules`] - built-in modules
//! - [`config`] - configuration loading

// Rust guideline compliant 2026-02

mod broker;
pub mod client;
pub mod config;
pub mod constants;
pub mod error;
pub mod modules;
pub mod protocol;
pub mod runtime;
pub mod transport;
pub mod value;
pub mod vm;

pub use client::{BrokerClient, ClientError, ConnectError};
pub use config::{RuntimeConfig, SchedulingMode};
pub use error::{RemoteError, RuntimeError};
pub use protocol::{InstructionType, Packet, PacketType, Target};
pub use runtime::{Runtime, RuntimeHandle};
pub use transport::{Connector, Endpoint};
pub use value::{Map, Value};
pub use vm::{Component, ComponentBuilder, Module, Operator};
