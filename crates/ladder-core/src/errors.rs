//! Error type constants for logging.
//!
//! These constants provide consistent error classification across all crates.

/// Protocol violation on a relay link.
pub const ERROR_PROTOCOL: &str = "protocol";
/// I/O error.
pub const ERROR_IO: &str = "io";
/// Timeout error.
pub const ERROR_TIMEOUT: &str = "timeout";
/// Identifier/password rejected by the central relay.
pub const ERROR_AUTH: &str = "auth";
/// Configuration error.
pub const ERROR_CONFIG: &str = "config";
/// Routing tables disagree with each other.
pub const ERROR_CONSISTENCY: &str = "consistency";
/// Node code namespace exhausted.
pub const ERROR_CAPACITY: &str = "capacity";
/// A link the process cannot live without went away.
pub const ERROR_LINK_LOST: &str = "link_lost";
