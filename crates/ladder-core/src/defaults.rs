//! Default configuration values.
//!
//! Centralized default constants for use across all crates.

// ============================================================================
// Network Defaults
// ============================================================================

/// Default port the central relay listens on.
pub const DEFAULT_CENTRAL_PORT: u16 = 3425;
/// Default bind host for an entry node's public listener.
pub const DEFAULT_ENTRY_LISTEN_HOST: &str = "0.0.0.0";
/// Default TCP_NODELAY (disable Nagle's algorithm for lower latency).
pub const DEFAULT_TCP_NO_DELAY: bool = true;

// ============================================================================
// Timeout Defaults
// ============================================================================

/// Idle window on a relay link before a PING is sent.
pub const DEFAULT_KEEPALIVE_IDLE_SECS: u64 = 60;
/// How long to wait for a PONG before the relay link is closed.
pub const DEFAULT_PONG_TIMEOUT_SECS: u64 = 15;
/// Outbound connect timeout (central relay and backend).
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
/// How long an entry terminus may hold bytes while its pipe is being made.
pub const DEFAULT_DEFERRED_FLUSH_SECS: u64 = 60;

// ============================================================================
// Buffer/Size Defaults
// ============================================================================

/// Maximum length of any frame on a relay link, header included (64 KiB).
pub const MAX_PACKET_LENGTH: usize = 64 * 1024;
/// Default read chunk per link, and the largest raw payload wrapped into one frame.
pub const DEFAULT_RELAY_BUFFER_SIZE: usize = 16 * 1024;
/// Default cap on bytes queued by an entry terminus before its pipe exists.
pub const DEFAULT_MAX_DEFERRED_BYTES: usize = 256 * 1024;

// ============================================================================
// Topology Constants
// ============================================================================

/// Hops between a boundary node and the opposite terminus
/// (central relay + opposite boundary node).
pub const INTERMEDIATE_HOPS: usize = 2;
