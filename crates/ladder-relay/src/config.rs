//! Configuration structures for the three node roles.
//!
//! Each role reads its own TOML file: a `[central]`, `[entry]` or `[exit]`
//! table plus an optional shared `[timeouts]` table.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use ladder_core::defaults::{
    DEFAULT_CENTRAL_PORT, DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_DEFERRED_FLUSH_SECS,
    DEFAULT_ENTRY_LISTEN_HOST, DEFAULT_KEEPALIVE_IDLE_SECS, DEFAULT_MAX_DEFERRED_BYTES,
    DEFAULT_PONG_TIMEOUT_SECS, DEFAULT_RELAY_BUFFER_SIZE, DEFAULT_TCP_NO_DELAY, INTERMEDIATE_HOPS,
    MAX_PACKET_LENGTH,
};
use serde::{Deserialize, Serialize};

use crate::error::RelayError;

// ── Central Relay Configuration ──

/// Top-level central relay configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CentralNodeConfig {
    pub central: CentralConfig,

    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CentralConfig {
    /// Listen address for entry and exit nodes (ip:port).
    #[serde(default = "default_central_listen")]
    pub listen: SocketAddr,
}

// ── Entry Node Configuration ──

/// Top-level entry node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryNodeConfig {
    pub entry: EntryConfig,

    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryConfig {
    /// Central relay address (host:port).
    pub central: String,

    /// Identifier of the exit node to attach to.
    pub identifier: String,

    pub password: String,

    /// Host to bind the public listener on. The port comes from the exit node.
    #[serde(default = "default_listen_host")]
    pub listen_host: String,
}

// ── Exit Node Configuration ──

/// Top-level exit node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitNodeConfig {
    pub exit: ExitConfig,

    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitConfig {
    /// Central relay address (host:port).
    pub central: String,

    /// Identifier this exit registers under.
    pub identifier: String,

    pub password: String,

    /// The real service behind this exit (host:port).
    pub backend: String,

    /// Port entry nodes expose. Defaults to the backend port.
    #[serde(default)]
    pub advertise_port: Option<u16>,
}

impl ExitConfig {
    /// Port announced to the central relay in `IDENTIFY`.
    pub fn connect_port(&self) -> Result<u16, RelayError> {
        if let Some(port) = self.advertise_port {
            return Ok(port);
        }
        backend_port(&self.backend)
    }
}

fn backend_port(addr: &str) -> Result<u16, RelayError> {
    addr.rsplit_once(':')
        .and_then(|(_, port)| port.parse::<u16>().ok())
        .filter(|port| *port != 0)
        .ok_or_else(|| RelayError::Config(format!("backend '{addr}' has no valid port")))
}

// ── Shared ──

/// Timer and buffer settings shared by every role.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Silence on a relay link before a PING is sent (seconds).
    #[serde(default = "default_keepalive_idle")]
    pub keepalive_idle_secs: u64,

    /// Time to wait for PONG before closing the link (seconds).
    #[serde(default = "default_pong_timeout")]
    pub pong_timeout_secs: u64,

    /// Timeout for outbound TCP connects (seconds).
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// How long an entry terminus may wait for its pipe (seconds).
    #[serde(default = "default_deferred_flush")]
    pub deferred_flush_secs: u64,

    /// Read buffer size per link, also the largest raw chunk per frame.
    #[serde(default = "default_relay_buffer_size")]
    pub relay_buffer_size: usize,

    /// Bytes an entry terminus may send before its pipe exists.
    #[serde(default = "default_max_deferred_bytes")]
    pub max_deferred_bytes: usize,

    #[serde(default = "default_tcp_no_delay")]
    pub tcp_no_delay: bool,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            keepalive_idle_secs: default_keepalive_idle(),
            pong_timeout_secs: default_pong_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            deferred_flush_secs: default_deferred_flush(),
            relay_buffer_size: default_relay_buffer_size(),
            max_deferred_bytes: default_max_deferred_bytes(),
            tcp_no_delay: default_tcp_no_delay(),
        }
    }
}

impl TimeoutConfig {
    pub fn keepalive_idle(&self) -> Duration {
        Duration::from_secs(self.keepalive_idle_secs)
    }

    pub fn pong_timeout(&self) -> Duration {
        Duration::from_secs(self.pong_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn deferred_flush(&self) -> Duration {
        Duration::from_secs(self.deferred_flush_secs)
    }
}

fn default_keepalive_idle() -> u64 {
    DEFAULT_KEEPALIVE_IDLE_SECS
}
fn default_pong_timeout() -> u64 {
    DEFAULT_PONG_TIMEOUT_SECS
}
fn default_connect_timeout() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_SECS
}
fn default_deferred_flush() -> u64 {
    DEFAULT_DEFERRED_FLUSH_SECS
}
fn default_relay_buffer_size() -> usize {
    DEFAULT_RELAY_BUFFER_SIZE
}
fn default_max_deferred_bytes() -> usize {
    DEFAULT_MAX_DEFERRED_BYTES
}
fn default_tcp_no_delay() -> bool {
    DEFAULT_TCP_NO_DELAY
}
fn default_central_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], DEFAULT_CENTRAL_PORT))
}
fn default_listen_host() -> String {
    DEFAULT_ENTRY_LISTEN_HOST.to_string()
}

// ── Loading & validation ──

/// Reads and parses a TOML config file.
pub fn load<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, RelayError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| RelayError::Config(format!("failed to read {}: {e}", path.display())))?;
    toml::from_str(&text)
        .map_err(|e| RelayError::Config(format!("failed to parse {}: {e}", path.display())))
}

fn validate_credentials(identifier: &str, password: &str) -> Result<(), RelayError> {
    if identifier.is_empty() {
        return Err(RelayError::Config("identifier must not be empty".into()));
    }
    if password.is_empty() {
        return Err(RelayError::Config("password must not be empty".into()));
    }
    if identifier.len() > u16::MAX as usize || password.len() > u16::MAX as usize {
        return Err(RelayError::Config(
            "identifier and password must fit in 65535 bytes".into(),
        ));
    }
    Ok(())
}

fn validate_address(field: &str, addr: &str) -> Result<(), RelayError> {
    if addr.is_empty() {
        return Err(RelayError::Config(format!("{field} must not be empty")));
    }
    backend_port(addr)
        .map(|_| ())
        .map_err(|_| RelayError::Config(format!("{field} '{addr}' must be host:port")))
}

pub fn validate_timeouts(t: &TimeoutConfig) -> Result<(), RelayError> {
    if t.keepalive_idle_secs == 0 {
        return Err(RelayError::Config("keepalive_idle_secs must be > 0".into()));
    }
    if t.pong_timeout_secs == 0 {
        return Err(RelayError::Config("pong_timeout_secs must be > 0".into()));
    }
    if t.connect_timeout_secs == 0 {
        return Err(RelayError::Config("connect_timeout_secs must be > 0".into()));
    }
    if t.deferred_flush_secs == 0 {
        return Err(RelayError::Config("deferred_flush_secs must be > 0".into()));
    }
    // A raw chunk plus its length field and hop codes must fit one frame.
    let max_chunk = MAX_PACKET_LENGTH - 4 - INTERMEDIATE_HOPS * 2;
    if t.relay_buffer_size == 0 || t.relay_buffer_size > max_chunk {
        return Err(RelayError::Config(format!(
            "relay_buffer_size must be between 1 and {max_chunk}"
        )));
    }
    Ok(())
}

pub fn validate_central(cfg: &CentralNodeConfig) -> Result<(), RelayError> {
    validate_timeouts(&cfg.timeouts)
}

pub fn validate_entry(cfg: &EntryNodeConfig) -> Result<(), RelayError> {
    validate_address("entry.central", &cfg.entry.central)?;
    validate_credentials(&cfg.entry.identifier, &cfg.entry.password)?;
    if cfg.entry.listen_host.is_empty() {
        return Err(RelayError::Config("entry.listen_host must not be empty".into()));
    }
    validate_timeouts(&cfg.timeouts)
}

pub fn validate_exit(cfg: &ExitNodeConfig) -> Result<(), RelayError> {
    validate_address("exit.central", &cfg.exit.central)?;
    validate_address("exit.backend", &cfg.exit.backend)?;
    validate_credentials(&cfg.exit.identifier, &cfg.exit.password)?;
    if cfg.exit.advertise_port == Some(0) {
        return Err(RelayError::Config("exit.advertise_port must not be 0".into()));
    }
    validate_timeouts(&cfg.timeouts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_central_config() {
        let toml_str = r#"
[central]
listen = "0.0.0.0:3425"
"#;
        let config: CentralNodeConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.central.listen.port(), 3425);
        assert_eq!(config.timeouts.keepalive_idle_secs, 60); // default
        assert_eq!(config.timeouts.pong_timeout_secs, 15); // default
        validate_central(&config).unwrap();
    }

    #[test]
    fn central_listen_defaults_to_all_interfaces() {
        let config: CentralNodeConfig = toml::from_str("[central]\n").unwrap();
        assert_eq!(config.central.listen.to_string(), "0.0.0.0:3425");
    }

    #[test]
    fn parse_entry_config() {
        let toml_str = r#"
[entry]
central = "relay.example.com:3425"
identifier = "svc"
password = "pw"

[timeouts]
connect_timeout_secs = 15
"#;
        let config: EntryNodeConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.entry.identifier, "svc");
        assert_eq!(config.entry.listen_host, "0.0.0.0");
        assert_eq!(config.timeouts.connect_timeout_secs, 15);
        assert_eq!(config.timeouts.deferred_flush_secs, 60); // default
        validate_entry(&config).unwrap();
    }

    #[test]
    fn parse_exit_config() {
        let toml_str = r#"
[exit]
central = "relay.example.com:3425"
identifier = "svc"
password = "pw"
backend = "127.0.0.1:8080"
"#;
        let config: ExitNodeConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.exit.advertise_port, None);
        assert_eq!(config.exit.connect_port().unwrap(), 8080);
        validate_exit(&config).unwrap();
    }

    #[test]
    fn advertise_port_overrides_backend_port() {
        let toml_str = r#"
[exit]
central = "relay:3425"
identifier = "svc"
password = "pw"
backend = "[::1]:22"
advertise_port = 2222
"#;
        let config: ExitNodeConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.exit.connect_port().unwrap(), 2222);
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut config = ExitNodeConfig {
            exit: ExitConfig {
                central: "relay:3425".into(),
                identifier: String::new(),
                password: "pw".into(),
                backend: "127.0.0.1:8080".into(),
                advertise_port: None,
            },
            timeouts: TimeoutConfig::default(),
        };
        assert!(matches!(validate_exit(&config), Err(RelayError::Config(_))));

        config.exit.identifier = "svc".into();
        config.exit.backend = "no-port".into();
        assert!(validate_exit(&config).is_err());

        config.exit.backend = "127.0.0.1:8080".into();
        config.timeouts.relay_buffer_size = MAX_PACKET_LENGTH;
        assert!(validate_exit(&config).is_err());

        config.timeouts.relay_buffer_size = DEFAULT_RELAY_BUFFER_SIZE;
        config.timeouts.pong_timeout_secs = 0;
        assert!(validate_exit(&config).is_err());

        config.timeouts.pong_timeout_secs = 15;
        validate_exit(&config).unwrap();
    }

    #[test]
    fn missing_required_field_fails_to_parse() {
        let toml_str = r#"
[entry]
central = "relay:3425"
identifier = "svc"
"#;
        assert!(toml::from_str::<EntryNodeConfig>(toml_str).is_err());
    }
}
