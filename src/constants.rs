//! Tunable defaults for the transport and the mode state machine.
//!
//! Values here seed [`crate::config::DriverConfig`]; a config file or
//! environment override takes precedence at runtime.
//!
//! # Categories
//!
//! - **Buffers**: receive buffer sizes for command and event sockets
//! - **Retries**: bounds for dump-interrupted and device-busy retries
//! - **Delays**: sleeps between retries and deferred group re-joins

use std::time::Duration;

// ============================================================================
// Buffers
// ============================================================================

/// Initial receive buffer for command sockets.
///
/// The socket layer peeks the real datagram size and grows the buffer when a
/// dump reply is larger, so this only needs to fit the common case.
pub const DEFAULT_RX_BUFFER_SIZE: usize = 16 * 1024;

/// Initial receive buffer for event and listener sockets.
pub const DEFAULT_EVENT_RX_BUFFER_SIZE: usize = 8 * 1024;

/// Kernel-side `SO_RCVBUF` requested for event sockets.
///
/// Scan-result and beacon bursts can overrun the default socket buffer.
pub const EVENT_SOCKET_RCVBUF: usize = 256 * 1024;

// ============================================================================
// Retries
// ============================================================================

/// Attempts for a dump that keeps coming back interrupted.
pub const DUMP_RETRY_ATTEMPTS: u32 = 10;

/// Down/mode-set/up cycles attempted before a mode switch gives up.
pub const MODE_SWITCH_ATTEMPTS: u32 = 10;

// ============================================================================
// Delays
// ============================================================================

/// Sleep between mode-set attempts while the kernel reports the device busy.
pub const MODE_SWITCH_BUSY_DELAY: Duration = Duration::from_millis(100);

/// Delay before re-resolving multicast groups after an nl80211 family reload.
pub const REGROUP_DELAY: Duration = Duration::from_millis(100);
