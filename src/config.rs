//! Configuration loading and types for huddle.
//!
//! Configuration is read from a YAML file and deserialized into the
//! [`Config`] struct.  Every field has a default, so an empty file is a
//! valid configuration.  Each subsection governs a different part of the
//! system: this node's identity, how it enters a group, network timeouts,
//! the coordinator monitor, logging, and observability.

use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::protocol::DEFAULT_MAX_FRAME_BYTES;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Identity and listener settings.
    #[serde(default)]
    pub node: NodeConfig,

    /// Group entry settings.
    #[serde(default)]
    pub group: GroupConfig,

    /// Connection timeouts and limits.
    #[serde(default)]
    pub network: NetworkConfig,

    /// Coordinator monitor settings.
    #[serde(default)]
    pub monitor: MonitorConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Observability settings (metrics + admin endpoint).
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// This node's identity and listener.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    /// Username; must be non-empty, without whitespace or `:`.
    #[serde(default)]
    pub username: String,

    /// Bind host address.
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port (0 picks an ephemeral port).
    #[serde(default = "default_port")]
    pub port: u16,

    /// Address other members dial.  Defaults to `host`, or loopback when
    /// `host` is the unspecified address.
    #[serde(default)]
    pub advertise_host: Option<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            username: String::new(),
            host: default_host(),
            port: default_port(),
            advertise_host: None,
        }
    }
}

impl NodeConfig {
    pub fn bind_addr(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub fn advertised_host(&self) -> String {
        if let Some(host) = self.advertise_host.as_ref().filter(|h| !h.is_empty()) {
            return host.clone();
        }
        match self.host.parse::<IpAddr>() {
            Ok(ip) if ip.is_unspecified() => "127.0.0.1".to_string(),
            _ => self.host.clone(),
        }
    }
}

/// How this node enters a group.
#[derive(Debug, Clone, Deserialize)]
pub struct GroupConfig {
    /// `host:port` of any existing member.  Absent or empty founds a new
    /// group.
    #[serde(default)]
    pub join: Option<String>,

    /// Admit join requests without asking the operator.
    #[serde(default = "default_true")]
    pub auto_accept: bool,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            join: None,
            auto_accept: true,
        }
    }
}

impl GroupConfig {
    /// The join target, `None` when founding.
    pub fn join_target(&self) -> Option<&str> {
        self.join
            .as_deref()
            .map(str::trim)
            .filter(|target| !target.is_empty())
    }
}

/// Timeouts and limits for peer connections.
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    /// Connect timeout for probes and broadcasts, in milliseconds.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Read/write timeout for a single frame, in milliseconds.
    #[serde(default = "default_io_timeout_ms")]
    pub io_timeout_ms: u64,

    /// Overall timeout for an outbound join (operator approval included).
    #[serde(default = "default_join_timeout_ms")]
    pub join_timeout_ms: u64,

    /// Concurrent inbound connections; extra connections are refused.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Largest accepted frame body in bytes.
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            io_timeout_ms: default_io_timeout_ms(),
            join_timeout_ms: default_join_timeout_ms(),
            max_connections: default_max_connections(),
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

impl NetworkConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}

/// Coordinator monitor settings.
#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    /// Interval between monitor ticks, in milliseconds.
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,

    /// Every this many ticks the coordinator verifies every member, not
    /// just reported suspects.  0 disables the sweep.
    #[serde(default = "default_sweep_every")]
    pub sweep_every: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            probe_interval_ms: default_probe_interval_ms(),
            sweep_every: default_sweep_every(),
        }
    }
}

impl MonitorConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms.max(1))
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: text or json.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Observability settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// Install the Prometheus recorder.
    #[serde(default = "default_true")]
    pub metrics: bool,

    /// Bind address of the admin HTTP endpoint (`/health`, `/roster`,
    /// `/metrics`).  Disabled when absent.
    #[serde(default)]
    pub admin_addr: Option<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            metrics: true,
            admin_addr: None,
        }
    }
}

// -- Defaults ----------------------------------------------------------------

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    7100
}

fn default_connect_timeout_ms() -> u64 {
    500
}

fn default_io_timeout_ms() -> u64 {
    500
}

fn default_join_timeout_ms() -> u64 {
    30_000
}

fn default_max_connections() -> usize {
    256
}

fn default_max_frame_bytes() -> usize {
    DEFAULT_MAX_FRAME_BYTES
}

fn default_probe_interval_ms() -> u64 {
    1000
}

fn default_sweep_every() -> u32 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

// -- Loader ------------------------------------------------------------------

/// Load and parse configuration from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    if contents.trim().is_empty() {
        return Ok(Config::default());
    }
    let config: Config = serde_yaml::from_str(&contents)?;
    Ok(config)
}
