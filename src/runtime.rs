//! Runtime lifecycle: one broker, one VM and their transport.
//!
//! [`Runtime`] is the async form, started inside an existing tokio
//! runtime. [`RuntimeHandle`] owns its own tokio runtime, built for the
//! configured [`SchedulingMode`], and exposes blocking methods for callers
//! outside async code.
//!
//! # Startup
//!
//! ```text
//! start ─► bind transport ─► spawn VM ─► spawn broker ─► await VM ready ─► Ok
//!                                                            │
//!                                           load error / timeout ─► stop ─► Err
//! ```
//!
//! `start` returns only after the VM has built its registry, so a client
//! can never execute against a VM that is still loading.
//!
//! # Shutdown
//!
//! `stop` closes the listener, stops the broker (dropping every client
//! connection), then stops the VM (tearing down every live component). It
//! is idempotent. Dropping a runtime without stopping it aborts the
//! broker and cancels the VM without waiting.

// Rust guideline compliant 2026-02

use std::future::Future;

use anyhow::{anyhow, Context, Result};
use tokio::sync::{mpsc, oneshot};

use crate::broker::BrokerHandle;
use crate::client::{BrokerClient, ConnectError};
use crate::config::{RuntimeConfig, SchedulingMode};
use crate::transport::{Connector, Endpoint, InprocConnector, SocketListener};
use crate::vm::{Module, VmHandle};

/// A running broker and VM.
#[derive(Debug)]
pub struct Runtime {
    config: RuntimeConfig,
    endpoint: Endpoint,
    connector: Connector,
    listener: Option<SocketListener>,
    broker: Option<BrokerHandle>,
    vm: Option<VmHandle>,
}

impl Runtime {
    /// Start a broker on `config.endpoint` and a VM hosting `modules`.
    ///
    /// # Errors
    ///
    /// Fails if the config is invalid, the endpoint cannot be bound, two
    /// modules register the same name, or the VM is not ready within
    /// `config.ready_timeout_ms`.
    pub async fn start(config: &RuntimeConfig, modules: Vec<Module>) -> Result<Self> {
        config.validate()?;
        let requested = config.endpoint()?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (listener, connector) = match &requested {
            Endpoint::Inproc(name) => {
                let connector = InprocConnector::new(name, config.mailbox_capacity, events_tx);
                (None, Connector::Inproc(connector))
            }
            _ => {
                let listener = SocketListener::bind(&requested, events_tx)
                    .await
                    .with_context(|| format!("Failed to bind {requested}"))?;
                let bound = listener.endpoint().clone();
                (Some(listener), Connector::Socket(bound))
            }
        };
        let endpoint = connector.endpoint();

        let (vm_tx, vm_rx) = mpsc::unbounded_channel();
        let (replies_tx, replies_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let vm = VmHandle::spawn(modules, vm_rx, replies_tx, ready_tx);
        let broker = BrokerHandle::spawn(events_rx, vm_tx, replies_rx);

        let mut runtime = Self {
            config: config.clone(),
            endpoint,
            connector,
            listener,
            broker: Some(broker),
            vm: Some(vm),
        };

        let ready = tokio::time::timeout(config.ready_timeout(), ready_rx).await;
        let failure = match ready {
            Ok(Ok(Ok(()))) => {
                log::info!("[Runtime] Started on {} ({})", runtime.endpoint, config.scheduling);
                return Ok(runtime);
            }
            Ok(Ok(Err(e))) => anyhow!(e).context("VM failed to load modules"),
            Ok(Err(_dropped)) => anyhow!("VM exited before signalling ready"),
            Err(_elapsed) => anyhow!("VM not ready within {:?}", config.ready_timeout()),
        };
        runtime.stop().await;
        Err(failure)
    }

    /// Endpoint the broker is reachable on. For `tcp://host:0` this is the
    /// bound port.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Connector for new clients.
    pub fn connector(&self) -> Connector {
        self.connector.clone()
    }

    /// Whether `stop` has not been called yet.
    pub fn is_running(&self) -> bool {
        self.broker.is_some()
    }

    /// Connect a new client using the configured request timeout.
    pub async fn connect(&self) -> Result<BrokerClient, ConnectError> {
        BrokerClient::connect(&self.connector, self.config.connect_timeout()).await
    }

    /// Stop the broker and the VM. Calling it again does nothing.
    pub async fn stop(&mut self) {
        let timeout = self.config.stop_timeout();
        if let Some(listener) = self.listener.take() {
            listener.shutdown();
        }
        if let Some(broker) = self.broker.take() {
            match broker.stop(timeout).await {
                Some(connected) => {
                    log::info!("[Runtime] Broker stopped ({connected} clients were connected)");
                }
                None => log::warn!("[Runtime] Broker did not stop cleanly"),
            }
        }
        if let Some(vm) = self.vm.take() {
            if vm.stop(timeout).await {
                log::info!("[Runtime] VM stopped");
            }
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.shutdown();
        }
        if let Some(broker) = self.broker.take() {
            broker.abort();
        }
        if let Some(vm) = self.vm.take() {
            vm.cancel();
        }
    }
}

/// A [`Runtime`] together with the tokio runtime that drives it.
///
/// Blocking methods must not be called from inside an async context, and
/// the handle must not be dropped there.
#[derive(Debug)]
pub struct RuntimeHandle {
    runtime: Runtime,
    tokio: tokio::runtime::Runtime,
}

impl RuntimeHandle {
    /// Build a tokio runtime for `config.scheduling` and start on it.
    ///
    /// With [`SchedulingMode::Cooperative`] the broker and VM share the
    /// calling thread and make progress only inside [`RuntimeHandle::block_on`].
    pub fn start(config: RuntimeConfig, modules: Vec<Module>) -> Result<Self> {
        let tokio = match config.scheduling {
            SchedulingMode::MultiThread => tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .thread_name("switchboard")
                .build(),
            SchedulingMode::Cooperative => {
                tokio::runtime::Builder::new_current_thread().enable_all().build()
            }
        }
        .context("Failed to create tokio runtime")?;

        let runtime = tokio.block_on(Runtime::start(&config, modules))?;
        Ok(Self { runtime, tokio })
    }

    /// Drive `future` to completion on this runtime.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.tokio.block_on(future)
    }

    /// See [`Runtime::endpoint`].
    pub fn endpoint(&self) -> &Endpoint {
        self.runtime.endpoint()
    }

    /// See [`Runtime::connector`].
    pub fn connector(&self) -> Connector {
        self.runtime.connector()
    }

    /// The async runtime, for use inside [`RuntimeHandle::block_on`].
    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    /// Connect a new client, blocking until the handshake completes.
    pub fn connect(&self) -> Result<BrokerClient, ConnectError> {
        self.block_on(self.runtime.connect())
    }

    /// Stop the broker and VM, blocking until they exit. Idempotent.
    pub fn stop(&mut self) {
        self.tokio.block_on(self.runtime.stop());
    }
}

impl Drop for RuntimeHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
