//! Server Configuration
//!
//! All runtime knobs of the engine live in [`ServerConfig`]. Every field has a
//! default, so a config file only needs the values it wants to change:
//!
//! ```toml
//! name = "echo"
//! port = 4123
//! mode = "event-driven"
//! timeout_ms = 30000
//! max_connections = 500
//!
//! [socket]
//! no_delay = true
//! linger_secs = 5
//!
//! [pools]
//! worker_threads = 8
//! max_active_handlers = 1024
//!
//! [tls]
//! cert_chain = "certs/server.pem"
//! private_key = "certs/server.key"
//! ```

use crate::codec::DataModes;
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default message sent when admission control rejects a client.
pub const DEFAULT_MAX_CONNECTION_MSG: &str = "-ERR Server Busy. Max Connection Reached";

/// Default message sent when a client times out.
pub const DEFAULT_TIMEOUT_MSG: &str = "-ERR Timeout";

/// Default message sent when a client runs out of login attempts.
pub const DEFAULT_MAX_AUTH_TRY_MSG: &str = "-ERR Max Auth Try Reached";

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The TOML document is malformed or has unknown keys
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of range or inconsistent with another value
    #[error("invalid value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// How connections are driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionMode {
    /// One dedicated worker thread per connection, suspended on reads.
    Blocking,
    /// Connections are re-entered by readiness events on a shared pool.
    #[default]
    EventDriven,
}

/// Socket options applied to every accepted connection.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SocketOptions {
    /// SO_LINGER in seconds (None leaves the OS default)
    pub linger_secs: Option<u64>,
    /// TCP_NODELAY
    pub no_delay: bool,
    /// IP_TOS traffic class
    pub traffic_class: Option<u32>,
    /// SO_SNDBUF
    pub send_buffer_size: Option<usize>,
    /// SO_RCVBUF
    pub recv_buffer_size: Option<usize>,
    /// Listen backlog
    pub backlog: i32,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            linger_secs: None,
            no_delay: true,
            traffic_class: None,
            send_buffer_size: None,
            recv_buffer_size: None,
            backlog: 1024,
        }
    }
}

/// Sizing of the resource pools.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolSettings {
    /// Worker threads for the event-driven personality
    pub worker_threads: usize,
    /// Capacity of the connection and client-data pools. In blocking mode
    /// this is also the number of worker threads.
    pub max_active_handlers: usize,
    /// Capacity of each pooled byte buffer
    pub buffer_size: usize,
    /// Upper bound on buffers handed out at once
    pub max_buffers: usize,
    /// Concurrent write-path workers allowed by the write gate
    /// (defaults to `worker_threads`)
    pub max_concurrent_writers: Option<usize>,
}

impl Default for PoolSettings {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            worker_threads: cpus.max(2),
            max_active_handlers: 1024,
            buffer_size: 8 * 1024,
            max_buffers: 4096,
            max_concurrent_writers: None,
        }
    }
}

/// Address-based access constraints.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AccessSettings {
    /// When non-empty, only these addresses may connect
    pub allow: Vec<IpAddr>,
    /// Addresses that bypass the max-connection limit
    pub trusted: Vec<IpAddr>,
}

/// TLS material loaded from PEM files.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsSettings {
    /// PEM certificate chain
    pub cert_chain: PathBuf,
    /// PEM private key
    pub private_key: PathBuf,
    /// Start every connection with a TLS handshake. When false, TLS is only
    /// used by connections that upgrade in-band.
    #[serde(default = "default_true")]
    pub start_secure: bool,
}

fn default_true() -> bool {
    true
}

/// Framing limits.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Limits {
    /// Longest LINE frame accepted, in bytes
    pub max_line_length: usize,
    /// Largest OBJECT frame accepted, in bytes
    pub max_object_size: usize,
    /// Upper bound on bytes drained per READ event
    pub max_read_per_event: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_line_length: 64 * 1024,
            max_object_size: 16 * 1024 * 1024,
            max_read_per_event: 256 * 1024,
        }
    }
}

/// Tunables of the idle reaper.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReaperSettings {
    /// Grace added to the timeout for blocking connections, which notice
    /// their own socket timeout first
    pub blocking_padding_ms: u64,
    /// Consecutive optimistic scan failures before a locked scan
    pub optimistic_retries: u32,
}

impl Default for ReaperSettings {
    fn default() -> Self {
        Self {
            blocking_padding_ms: 1000,
            optimistic_retries: 4,
        }
    }
}

/// Complete server configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Name used for thread names and logs
    pub name: String,
    /// Host to bind to
    pub host: String,
    /// Port to listen on (0 picks a free port)
    pub port: u16,
    /// Connection personality
    pub mode: ExecutionMode,
    /// Maximum live connections (None = unlimited)
    pub max_connections: Option<usize>,
    /// Sent to clients rejected by admission control
    pub max_connection_msg: String,
    /// Idle timeout in milliseconds (0 disables timeouts and the reaper)
    pub timeout_ms: u64,
    /// Sent to clients that time out
    pub timeout_msg: String,
    /// Failed logins allowed before disconnect (0 = unlimited)
    pub max_auth_try: u32,
    /// Sent when the login limit is hit
    pub max_auth_try_msg: String,
    /// Initial data modes of every connection
    pub data_modes: DataModes,
    /// How long the close path waits for outbound data, in milliseconds
    pub close_drain_timeout_ms: u64,
    /// Abort the process on internal errors
    pub strict: bool,
    pub socket: SocketOptions,
    pub pools: PoolSettings,
    pub access: AccessSettings,
    pub tls: Option<TlsSettings>,
    pub limits: Limits,
    pub reaper: ReaperSettings,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "berth".to_string(),
            host: crate::DEFAULT_HOST.to_string(),
            port: crate::DEFAULT_PORT,
            mode: ExecutionMode::default(),
            max_connections: None,
            max_connection_msg: DEFAULT_MAX_CONNECTION_MSG.to_string(),
            timeout_ms: 60_000,
            timeout_msg: DEFAULT_TIMEOUT_MSG.to_string(),
            max_auth_try: 5,
            max_auth_try_msg: DEFAULT_MAX_AUTH_TRY_MSG.to_string(),
            data_modes: DataModes::default(),
            close_drain_timeout_ms: 120_000,
            strict: false,
            socket: SocketOptions::default(),
            pools: PoolSettings::default(),
            access: AccessSettings::default(),
            tls: None,
            limits: Limits::default(),
            reaper: ReaperSettings::default(),
        }
    }
}

impl ServerConfig {
    /// Parses a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: ServerConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Checks values that serde cannot.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
            ConfigError::Invalid {
                field,
                reason: reason.into(),
            }
        }

        if self.pools.max_active_handlers == 0 {
            return Err(invalid("pools.max_active_handlers", "must be at least 1"));
        }
        if self.pools.worker_threads == 0 {
            return Err(invalid("pools.worker_threads", "must be at least 1"));
        }
        if self.pools.buffer_size < 512 {
            return Err(invalid("pools.buffer_size", "must be at least 512 bytes"));
        }
        if self.pools.max_buffers < 2 {
            return Err(invalid("pools.max_buffers", "must be at least 2"));
        }
        if self.pools.max_concurrent_writers == Some(0) {
            return Err(invalid("pools.max_concurrent_writers", "must be at least 1"));
        }
        if self.max_connections == Some(0) {
            return Err(invalid("max_connections", "must be at least 1"));
        }
        if self.limits.max_line_length == 0 {
            return Err(invalid("limits.max_line_length", "must be positive"));
        }
        if self.socket.backlog <= 0 {
            return Err(invalid("socket.backlog", "must be positive"));
        }
        // Each blocking worker holds a read buffer for its connection's life.
        if self.mode == ExecutionMode::Blocking
            && self.pools.max_buffers <= self.pools.max_active_handlers
        {
            return Err(invalid(
                "pools.max_buffers",
                "must exceed pools.max_active_handlers in blocking mode",
            ));
        }
        if self.limits.max_read_per_event < self.pools.buffer_size {
            return Err(invalid(
                "limits.max_read_per_event",
                "must be at least one buffer",
            ));
        }
        Ok(())
    }

    /// Resolves the bind address.
    pub fn bind_address(&self) -> Result<SocketAddr, ConfigError> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| ConfigError::Invalid {
                field: "host",
                reason: e.to_string(),
            })?
            .next()
            .ok_or_else(|| ConfigError::Invalid {
                field: "host",
                reason: format!("{} did not resolve", self.host),
            })
    }

    /// Idle timeout, or None when disabled.
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }

    /// Bounded wait used by the close path.
    pub fn close_drain_timeout(&self) -> Duration {
        Duration::from_millis(self.close_drain_timeout_ms)
    }

    /// Writers admitted concurrently by the write gate.
    pub fn max_concurrent_writers(&self) -> usize {
        self.pools
            .max_concurrent_writers
            .unwrap_or(self.pools.worker_threads)
    }

    /// Threads in the worker pool for the configured personality.
    pub fn worker_threads(&self) -> usize {
        match self.mode {
            ExecutionMode::Blocking => self.pools.max_active_handlers,
            ExecutionMode::EventDriven => self.pools.worker_threads,
        }
    }
}
