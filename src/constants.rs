//! Application-wide constants.
//!
//! Tunables that are not exposed through [`crate::config::RuntimeConfig`]
//! live here, grouped by domain.

use std::time::Duration;

// ============================================================================
// Transport
// ============================================================================

/// Default bound of each in-process queue, in packets.
///
/// A client that stops draining its queue loses deliveries beyond this
/// many outstanding packets rather than stalling the broker.
pub const DEFAULT_MAILBOX_CAPACITY: usize = 128;

/// Socket read buffer size.
pub const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Back-off after a failed `accept` (e.g. file-descriptor exhaustion).
pub const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

// ============================================================================
// Timeouts
// ============================================================================

/// How long a client waits for the broker's reply to connect, subscribe,
/// unsubscribe, cancel and disconnect.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// How long `start` waits for the VM to report ready.
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(5);

/// How long `stop` waits for each of the VM and broker tasks to exit
/// before abandoning them.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(1);

// ============================================================================
// Defaults
// ============================================================================

/// Endpoint used when none is configured.
pub const DEFAULT_ENDPOINT: &str = "inproc://default";

/// Log filter used when none is configured.
pub const DEFAULT_LOG_FILTER: &str = "info";
