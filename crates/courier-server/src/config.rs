//! Server configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (COURIER_HOST, COURIER_PORT)
//! - TOML configuration file

use anyhow::{bail, Context, Result};
use courier_core::{BackoffConfig, HistoryOptions, NodeConfig, SubscribeOptions};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Heartbeat configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Channel history retention.
    #[serde(default)]
    pub history: HistoryConfig,

    /// Presence tracking.
    #[serde(default)]
    pub presence: PresenceConfig,

    /// Credentials used when a client connects without any.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Backing store shards.
    #[serde(default)]
    pub shards: ShardsConfig,

    /// Time allowed for sessions to tear down on shutdown.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_ms: u64,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum subscriptions per connection.
    #[serde(default = "default_max_subscriptions")]
    pub max_subscriptions_per_connection: usize,

    /// Maximum message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Heartbeat interval in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,

    /// Connection timeout in milliseconds.
    #[serde(default = "default_heartbeat_timeout")]
    pub timeout_ms: u64,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

/// History configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Entries kept per channel; 0 disables history.
    #[serde(default = "default_history_size")]
    pub size: usize,

    /// Entry lifetime in milliseconds.
    #[serde(default = "default_history_ttl")]
    pub ttl_ms: u64,

    /// Idle time after which a channel stream and its epoch are dropped.
    #[serde(default = "default_history_meta_ttl")]
    pub meta_ttl_secs: u64,
}

/// Presence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceConfig {
    /// Entries not refreshed within this window are stale.
    #[serde(default = "default_presence_ttl")]
    pub ttl_ms: u64,

    /// How often live sessions refresh their entries.
    #[serde(default = "default_presence_refresh")]
    pub refresh_interval_ms: u64,

    /// How often stale entries and expired history are swept.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_ms: u64,

    /// Track subscribers in presence.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Announce joins and leaves to subscribers.
    #[serde(default = "default_true")]
    pub join_leave: bool,

    /// Allow recovery of missed publications on resubscribe.
    #[serde(default = "default_true")]
    pub recover: bool,
}

/// Fallback credentials.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// User assigned to clients that connect without one.
    #[serde(default)]
    pub default_user: Option<String>,

    /// JSON connection info attached to the default user.
    #[serde(default)]
    pub default_info: Option<serde_json::Value>,
}

/// Shard configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardsConfig {
    /// Shard names. Each name gets its own store instance.
    #[serde(default = "default_shard_names")]
    pub names: Vec<String>,

    /// First reconnect delay in milliseconds.
    #[serde(default = "default_backoff_min")]
    pub backoff_min_ms: u64,

    /// Reconnect delay cap in milliseconds.
    #[serde(default = "default_backoff_max")]
    pub backoff_max_ms: u64,
}

// Default value functions
fn default_host() -> String {
    std::env::var("COURIER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("COURIER_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8000)
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_max_connections() -> usize {
    100_000
}

fn default_max_subscriptions() -> usize {
    100
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_heartbeat_interval() -> u64 {
    25_000 // 25 seconds
}

fn default_heartbeat_timeout() -> u64 {
    60_000 // 60 seconds
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_history_size() -> usize {
    100
}

fn default_history_ttl() -> u64 {
    5_000
}

fn default_history_meta_ttl() -> u64 {
    7 * 24 * 3600 // 7 days
}

fn default_presence_ttl() -> u64 {
    60_000
}

fn default_presence_refresh() -> u64 {
    25_000
}

fn default_sweep_interval() -> u64 {
    10_000
}

fn default_shard_names() -> Vec<String> {
    vec!["shard-0".to_string()]
}

fn default_backoff_min() -> u64 {
    50
}

fn default_backoff_max() -> u64 {
    5_000
}

fn default_shutdown_timeout() -> u64 {
    10_000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            limits: LimitsConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            metrics: MetricsConfig::default(),
            history: HistoryConfig::default(),
            presence: PresenceConfig::default(),
            auth: AuthConfig::default(),
            shards: ShardsConfig::default(),
            shutdown_timeout_ms: default_shutdown_timeout(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_subscriptions_per_connection: default_max_subscriptions(),
            max_message_size: default_max_message_size(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval(),
            timeout_ms: default_heartbeat_timeout(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            size: default_history_size(),
            ttl_ms: default_history_ttl(),
            meta_ttl_secs: default_history_meta_ttl(),
        }
    }
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            ttl_ms: default_presence_ttl(),
            refresh_interval_ms: default_presence_refresh(),
            sweep_interval_ms: default_sweep_interval(),
            enabled: true,
            join_leave: true,
            recover: true,
        }
    }
}

impl Default for ShardsConfig {
    fn default() -> Self {
        Self {
            names: default_shard_names(),
            backoff_min_ms: default_backoff_min(),
            backoff_max_ms: default_backoff_max(),
        }
    }
}

impl Config {
    /// Load configuration from file or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        let config_paths = [
            "courier.toml",
            "/etc/courier/courier.toml",
            "~/.config/courier/courier.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        // Fall back to defaults with environment overrides
        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("Invalid config file: {}", path.display()))?;

        Ok(config)
    }

    /// Reject settings the node cannot run with.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        if self.shards.names.is_empty() {
            bail!("at least one shard is required");
        }
        if self.shards.backoff_min_ms == 0 || self.shards.backoff_min_ms > self.shards.backoff_max_ms {
            bail!("shard backoff must satisfy 0 < backoff_min_ms <= backoff_max_ms");
        }
        if self.presence.refresh_interval_ms == 0 || self.presence.sweep_interval_ms == 0 {
            bail!("presence intervals must be positive");
        }
        if self.heartbeat.interval_ms == 0 {
            bail!("heartbeat interval_ms must be positive");
        }
        if self.presence.refresh_interval_ms >= self.presence.ttl_ms {
            bail!("presence refresh_interval_ms must be shorter than ttl_ms");
        }
        self.bind_addr().map(|_| ())
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid listen address {}:{}", self.host, self.port))
    }

    /// Node settings derived from this configuration.
    #[must_use]
    pub fn node_config(&self) -> NodeConfig {
        NodeConfig {
            history: HistoryOptions::new(
                self.history.size,
                Duration::from_millis(self.history.ttl_ms),
            ),
            subscribe_options: SubscribeOptions {
                presence: self.presence.enabled,
                join_leave: self.presence.join_leave,
                recover: self.presence.recover,
            },
            presence_ttl: Duration::from_millis(self.presence.ttl_ms),
            presence_refresh_interval: Duration::from_millis(self.presence.refresh_interval_ms),
            sweep_interval: Duration::from_millis(self.presence.sweep_interval_ms),
        }
    }

    /// Reconnect backoff for every shard.
    #[must_use]
    pub fn backoff(&self) -> BackoffConfig {
        BackoffConfig {
            min_delay: Duration::from_millis(self.shards.backoff_min_ms),
            max_delay: Duration::from_millis(self.shards.backoff_max_ms),
            factor: 2,
        }
    }

    #[must_use]
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}
