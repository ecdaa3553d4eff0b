//! Runtime configuration.
//!
//! Loaded from `<config_dir>/switchboard/config.json` (or an explicit
//! path), falling back to defaults, then overridden from the environment:
//!
//! | Variable                       | Field              |
//! |--------------------------------|--------------------|
//! | `SWITCHBOARD_ENDPOINT`         | `endpoint`         |
//! | `SWITCHBOARD_SCHEDULING`       | `scheduling`       |
//! | `SWITCHBOARD_MAILBOX_CAPACITY` | `mailbox_capacity` |
//! | `SWITCHBOARD_LOG`              | `log_filter`       |
//! | `SWITCHBOARD_CONFIG_DIR`       | config directory   |

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_ENDPOINT, DEFAULT_LOG_FILTER, DEFAULT_MAILBOX_CAPACITY,
    DEFAULT_READY_TIMEOUT, DEFAULT_STOP_TIMEOUT,
};
use crate::transport::Endpoint;

/// How the runtime's tasks are scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingMode {
    /// Broker and VM run on a multi-threaded tokio runtime.
    #[default]
    MultiThread,
    /// Broker and VM share one thread; they advance only while the owner
    /// is blocked in the runtime (waits are scheduler yields).
    Cooperative,
}

impl FromStr for SchedulingMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "multi_thread" | "multi-thread" => Ok(Self::MultiThread),
            "cooperative" => Ok(Self::Cooperative),
            other => bail!("Unknown scheduling mode: {other} (expected multi_thread or cooperative)"),
        }
    }
}

impl fmt::Display for SchedulingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MultiThread => f.write_str("multi_thread"),
            Self::Cooperative => f.write_str("cooperative"),
        }
    }
}

/// Configuration for one runtime.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Endpoint URL the broker listens on.
    pub endpoint: String,
    /// Task scheduling model.
    pub scheduling: SchedulingMode,
    /// Bound of each in-process queue.
    pub mailbox_capacity: usize,
    /// Client wait for broker acknowledgements, in milliseconds.
    pub connect_timeout_ms: u64,
    /// Wait for VM readiness during start, in milliseconds.
    pub ready_timeout_ms: u64,
    /// Wait for each task during stop, in milliseconds.
    pub stop_timeout_ms: u64,
    /// `env_logger` filter used by the binary.
    pub log_filter: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            scheduling: SchedulingMode::default(),
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT.as_millis() as u64,
            ready_timeout_ms: DEFAULT_READY_TIMEOUT.as_millis() as u64,
            stop_timeout_ms: DEFAULT_STOP_TIMEOUT.as_millis() as u64,
            log_filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

impl RuntimeConfig {
    /// Config for `endpoint` with everything else defaulted.
    pub fn with_endpoint(endpoint: impl Into<String>) -> Self {
        Self { endpoint: endpoint.into(), ..Self::default() }
    }

    /// Returns the configuration directory path.
    ///
    /// `SWITCHBOARD_CONFIG_DIR` overrides the platform config directory.
    pub fn config_dir() -> Result<PathBuf> {
        if let Ok(dir) = std::env::var("SWITCHBOARD_CONFIG_DIR") {
            return Ok(PathBuf::from(dir));
        }
        Ok(dirs::config_dir()
            .context("Could not determine config directory")?
            .join("switchboard"))
    }

    /// Load from the default config file, with environment overrides.
    ///
    /// A missing file yields defaults; an unreadable or invalid one is an error.
    pub fn load() -> Result<Self> {
        let path = Self::config_dir()?.join("config.json");
        let mut config = if path.exists() { Self::load_from_file(&path)? } else { Self::default() };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path`, with environment overrides.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Invalid config: {}", path.display()))
    }

    /// Write this config as pretty JSON.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config: {}", path.display()))
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from a variable lookup (the environment in production).
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(endpoint) = lookup("SWITCHBOARD_ENDPOINT") {
            self.endpoint = endpoint;
        }
        if let Some(mode) = lookup("SWITCHBOARD_SCHEDULING") {
            self.scheduling = mode.parse()?;
        }
        if let Some(capacity) = lookup("SWITCHBOARD_MAILBOX_CAPACITY") {
            self.mailbox_capacity = capacity
                .parse()
                .with_context(|| format!("Invalid SWITCHBOARD_MAILBOX_CAPACITY: {capacity}"))?;
        }
        if let Some(filter) = lookup("SWITCHBOARD_LOG") {
            self.log_filter = filter;
        }
        Ok(())
    }

    /// Reject values the runtime cannot use.
    pub fn validate(&self) -> Result<()> {
        self.endpoint()?;
        if self.mailbox_capacity == 0 {
            bail!("mailbox_capacity must be at least 1");
        }
        if self.connect_timeout_ms == 0 || self.ready_timeout_ms == 0 || self.stop_timeout_ms == 0 {
            bail!("timeouts must be non-zero");
        }
        Ok(())
    }

    /// Parsed endpoint.
    pub fn endpoint(&self) -> Result<Endpoint> {
        self.endpoint
            .parse()
            .with_context(|| format!("Invalid endpoint: {}", self.endpoint))
    }

    /// Client acknowledgement timeout.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// VM readiness timeout.
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    /// Per-task stop timeout.
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = RuntimeConfig::default();
        config.validate().unwrap();
        assert_eq!(config.endpoint, "inproc://default");
        assert_eq!(config.mailbox_capacity, 128);
        assert_eq!(config.scheduling, SchedulingMode::MultiThread);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("config.json");
        std::fs::write(&path, r#"{"endpoint": "tcp://127.0.0.1:7000", "scheduling": "cooperative"}"#)
            .unwrap();
        let config = RuntimeConfig::load_from_file(&path).unwrap();
        assert_eq!(config.endpoint, "tcp://127.0.0.1:7000");
        assert_eq!(config.scheduling, SchedulingMode::Cooperative);
        assert_eq!(config.connect_timeout_ms, 1000);
    }

    #[test]
    fn test_save_then_load() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("nested/config.json");
        let config = RuntimeConfig { mailbox_capacity: 7, ..RuntimeConfig::with_endpoint("inproc://x") };
        config.save_to(&path).unwrap();
        assert_eq!(RuntimeConfig::load_from_file(&path).unwrap(), config);
    }

    #[test]
    fn test_overrides_apply() {
        let mut config = RuntimeConfig::default();
        config
            .apply_overrides(|key| match key {
                "SWITCHBOARD_ENDPOINT" => Some("ipc:///tmp/sb.sock".into()),
                "SWITCHBOARD_SCHEDULING" => Some("cooperative".into()),
                "SWITCHBOARD_MAILBOX_CAPACITY" => Some("16".into()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.endpoint, "ipc:///tmp/sb.sock");
        assert_eq!(config.scheduling, SchedulingMode::Cooperative);
        assert_eq!(config.mailbox_capacity, 16);
    }

    #[test]
    fn test_bad_override_is_error() {
        let mut config = RuntimeConfig::default();
        let result = config.apply_overrides(|key| {
            (key == "SWITCHBOARD_MAILBOX_CAPACITY").then(|| "lots".to_string())
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(RuntimeConfig::with_endpoint("carrier-pigeon://x").validate().is_err());
        let zero = RuntimeConfig { mailbox_capacity: 0, ..RuntimeConfig::default() };
        assert!(zero.validate().is_err());
    }

    #[test]
    fn test_invalid_json_is_error() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("config.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(RuntimeConfig::load_from(&path).is_err());
    }
}
