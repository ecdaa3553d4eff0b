//! Switchboard CLI - serve a runtime or execute one instruction against it.
//!
//! This is the main binary entry point. See the `switchboard` library for
//! the core functionality.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use switchboard::value::{from_json_str, to_json_string};
use switchboard::{BrokerClient, Packet, RuntimeConfig, RuntimeHandle, Target, Value};

/// Global allocator configured per M-MIMALLOC-APPS guideline.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "switchboard")]
#[command(version = VERSION)]
#[command(about = "Local-first agent runtime: broker, VM and components")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a broker and VM with the built-in modules until Ctrl-C
    Serve {
        /// Endpoint URL, e.g. tcp://127.0.0.1:7400 or ipc:///tmp/switchboard.sock
        #[arg(long)]
        endpoint: Option<String>,
        /// Config file (defaults to the platform config directory)
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Execute one instruction against a running broker
    Exec {
        /// Broker endpoint URL
        #[arg(long)]
        endpoint: String,
        /// Arguments as a JSON document
        #[arg(long)]
        args: Option<String>,
        /// Give up when no response arrives within this many milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
        #[command(subcommand)]
        instruction: Instruction,
    },
}

#[derive(Subcommand)]
enum Instruction {
    /// Call a module function
    CallFunction { name: String },
    /// Create a named component of a registered type
    DefineComponent {
        #[arg(value_name = "TYPE")]
        component_type: String,
        name: String,
    },
    /// Tear down a named component
    DeleteComponent { name: String },
    /// Call a method on a live component
    CallMethod { component: String, method: String },
}

impl Instruction {
    fn target(&self) -> Target {
        match self {
            Self::CallFunction { name } => Target::function(name),
            Self::DefineComponent { component_type, .. } => Target::component_type(component_type),
            Self::DeleteComponent { name } => Target::component(name),
            Self::CallMethod { component, method } => Target::method(component, method),
        }
    }

    fn packet(&self, args: Value) -> Packet {
        let tx = switchboard::protocol::new_transaction_id();
        match self {
            Self::CallFunction { name } => Packet::call_function(tx, name, args),
            Self::DefineComponent { component_type, name } => {
                Packet::define_component(tx, component_type, name, args)
            }
            Self::DeleteComponent { name } => Packet::delete_component(tx, name),
            Self::CallMethod { component, method } => Packet::call_method(tx, component, method, args),
        }
    }
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { endpoint, config } => {
            serve(endpoint, config)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Exec { endpoint, args, timeout_ms, instruction } => {
            init_logging("warn");
            let args = match args {
                Some(text) => from_json_str(&text).context("--args is not valid JSON")?,
                None => Value::Null,
            };
            let tokio = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .context("Failed to create tokio runtime")?;
            let ok = tokio.block_on(exec(&endpoint, &instruction, args, timeout_ms.map(Duration::from_millis)))?;
            Ok(if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
        }
    }
}

fn init_logging(default_filter: &str) {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .format_timestamp_millis()
        .init();
}

fn serve(endpoint: Option<String>, config_path: Option<PathBuf>) -> Result<()> {
    let mut config = match config_path {
        Some(path) => RuntimeConfig::load_from(&path)?,
        None => RuntimeConfig::load()?,
    };
    if let Some(endpoint) = endpoint {
        config.endpoint = endpoint;
    }
    init_logging(&config.log_filter);
    log::info!("Switchboard v{VERSION} starting");

    let (shutdown_tx, shutdown_rx) = std::sync::mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = shutdown_tx.send(());
    })
    .context("Failed to install signal handler")?;

    let mut handle = RuntimeHandle::start(config, switchboard::modules::builtin())?;
    println!("Listening on {}", handle.endpoint());

    // Blocks until a signal arrives; the runtime's own threads keep serving.
    let _ = shutdown_rx.recv();
    println!("Shutting down...");
    handle.stop();
    Ok(())
}

/// Run one instruction and print every response as a JSON line. Returns
/// whether the instruction succeeded.
async fn exec(
    endpoint: &str,
    instruction: &Instruction,
    args: Value,
    timeout: Option<Duration>,
) -> Result<bool> {
    let connect_timeout = timeout.unwrap_or(switchboard::constants::DEFAULT_CONNECT_TIMEOUT);
    let mut client = BrokerClient::connect_url(endpoint, connect_timeout)
        .await
        .with_context(|| format!("Failed to connect to {endpoint}"))?
        .with_execute_timeout(timeout);

    let target = instruction.target();
    client.subscribe(&target).await.context("Failed to subscribe")?;
    let tx = client.send_execute(instruction.packet(args))?;

    let ok = loop {
        let packet = match client.wait_for(&tx).await {
            Ok(packet) => packet,
            Err(e) => {
                eprintln!("Error: {e}");
                break false;
            }
        };
        println!("{}", packet_json(&packet));
        if packet.is_terminal() {
            break packet.status();
        }
    };

    if let Err(e) = client.disconnect().await {
        log::debug!("Disconnect failed: {e}");
    }
    Ok(ok)
}

fn packet_json(packet: &Packet) -> String {
    let mut line = switchboard::Map::new();
    line.insert("transaction_id".to_string(), Value::from(packet.transaction_id.as_str()));
    line.insert("type".to_string(), Value::from(packet.packet_type.as_str()));
    if let Some(sequence) = packet.sequence {
        line.insert("sequence".to_string(), Value::from(sequence));
    }
    line.insert("headers".to_string(), Value::Map(packet.headers.clone()));
    line.insert("body".to_string(), packet.body.clone());
    to_json_string(&Value::Map(line))
}
