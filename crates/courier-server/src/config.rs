//! Server configuration.
//!
//! Configuration can be loaded from:
//! - TOML configuration file (explicit `--config` path or a default location)
//! - Environment variables (`COURIER_*`), which override the file

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default config file locations, in lookup order.
pub const CONFIG_PATHS: [&str; 3] = [
    "courier.toml",
    "/etc/courier/courier.toml",
    "~/.config/courier/courier.toml",
];

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port of the first worker. Worker `i` listens on `port + i`.
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub limits: LimitsConfig,

    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    #[serde(default)]
    pub presence: PresenceConfig,

    #[serde(default)]
    pub bus: BusConfig,

    #[serde(default)]
    pub redis: RedisConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub workers: WorkersConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Enable WebSocket transport.
    #[serde(default = "default_true")]
    pub websocket: bool,

    /// Path for WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,

    /// Enable the long-polling fallback.
    #[serde(default = "default_true")]
    pub polling: bool,

    /// Base path for polling endpoints.
    #[serde(default = "default_polling_path")]
    pub polling_path: String,

    /// How long one poll waits for events, in milliseconds.
    #[serde(default = "default_poll_wait")]
    pub poll_wait_ms: u64,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of live groups per worker.
    #[serde(default = "default_max_groups")]
    pub max_groups: usize,

    /// Maximum groups one connection may belong to.
    #[serde(default = "default_max_subscriptions")]
    pub max_subscriptions_per_connection: usize,

    /// Maximum inbound message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Heartbeat interval advertised to clients, in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,

    /// Idle connections are closed after this many milliseconds.
    #[serde(default = "default_heartbeat_timeout")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceBackend {
    #[default]
    Memory,
    Redis,
}

/// Presence directory configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceConfig {
    #[serde(default)]
    pub backend: PresenceBackend,

    /// Lease length in milliseconds.
    #[serde(default = "default_presence_ttl")]
    pub ttl_ms: u64,

    /// How often each worker renews its leases, in milliseconds.
    #[serde(default = "default_presence_refresh")]
    pub refresh_ms: u64,

    #[serde(default = "default_presence_prefix")]
    pub key_prefix: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusBackend {
    #[default]
    Local,
    Redis,
}

/// Fan-out bus configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    #[serde(default)]
    pub backend: BusBackend,

    #[serde(default = "default_bus_prefix")]
    pub channel_prefix: String,

    /// Envelopes buffered per subscriber before it lags.
    #[serde(default = "default_bus_capacity")]
    pub capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
}

/// Session token configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// HS256 secret. Tokens are rejected when unset.
    #[serde(default)]
    pub secret: Option<String>,

    /// Refuse connections that only send a `userId` hint.
    #[serde(default)]
    pub require_token: bool,
}

/// Persistence collaborator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Seed file for the in-memory store.
    #[serde(default)]
    pub seed_path: Option<PathBuf>,

    /// Deadline for every collaborator call, in milliseconds.
    #[serde(default = "default_store_timeout")]
    pub timeout_ms: u64,
}

/// Worker supervisor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkersConfig {
    /// Number of worker processes. Defaults to available parallelism.
    #[serde(default)]
    pub count: Option<usize>,

    /// Delay before a crashed worker is restarted, in milliseconds.
    #[serde(default = "default_restart_backoff")]
    pub restart_backoff_ms: u64,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port of the first worker.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_polling_path() -> String {
    "/poll".to_string()
}

fn default_poll_wait() -> u64 {
    25_000
}

fn default_max_groups() -> usize {
    10_000
}

fn default_max_subscriptions() -> usize {
    500
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_heartbeat_interval() -> u64 {
    25_000
}

fn default_heartbeat_timeout() -> u64 {
    60_000
}

fn default_presence_ttl() -> u64 {
    90_000
}

fn default_presence_refresh() -> u64 {
    30_000
}

fn default_presence_prefix() -> String {
    "courier:presence".to_string()
}

fn default_bus_prefix() -> String {
    "courier:bus".to_string()
}

fn default_bus_capacity() -> usize {
    4096
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_store_timeout() -> u64 {
    5_000
}

fn default_restart_backoff() -> u64 {
    1_000
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            limits: LimitsConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            presence: PresenceConfig::default(),
            bus: BusConfig::default(),
            redis: RedisConfig::default(),
            auth: AuthConfig::default(),
            store: StoreConfig::default(),
            workers: WorkersConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket: true,
            websocket_path: default_ws_path(),
            polling: true,
            polling_path: default_polling_path(),
            poll_wait_ms: default_poll_wait(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_groups: default_max_groups(),
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

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            backend: PresenceBackend::default(),
            ttl_ms: default_presence_ttl(),
            refresh_ms: default_presence_refresh(),
            key_prefix: default_presence_prefix(),
        }
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            backend: BusBackend::default(),
            channel_prefix: default_bus_prefix(),
            capacity: default_bus_capacity(),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            seed_path: None,
            timeout_ms: default_store_timeout(),
        }
    }
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            count: None,
            restart_backoff_ms: default_restart_backoff(),
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

impl Config {
    /// Load configuration from `path`, or from the first default location
    /// that exists, then apply environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file cannot be read or parsed, or an
    /// override is not a valid value.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::from_default_paths()?,
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    fn from_default_paths() -> Result<Self> {
        for path in &CONFIG_PATHS {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }
        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Apply `COURIER_*` overrides from `lookup`.
    ///
    /// # Errors
    ///
    /// Returns an error if a numeric override does not parse.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(host) = lookup("COURIER_HOST") {
            self.host = host;
        }
        if let Some(port) = lookup("COURIER_PORT") {
            self.port = port
                .parse()
                .with_context(|| format!("Invalid COURIER_PORT: {port}"))?;
        }
        if let Some(workers) = lookup("COURIER_WORKERS") {
            let count: usize = workers
                .parse()
                .with_context(|| format!("Invalid COURIER_WORKERS: {workers}"))?;
            self.workers.count = Some(count);
        }
        if let Some(url) = lookup("COURIER_REDIS_URL") {
            self.redis.url = url;
        }
        if let Some(secret) = lookup("COURIER_JWT_SECRET") {
            self.auth.secret = Some(secret);
        }
        Ok(())
    }

    /// Socket address for a worker port.
    ///
    /// # Errors
    ///
    /// Returns an error if `host` is not an IP address.
    pub fn bind_addr(&self, port: u16) -> Result<SocketAddr> {
        let addr = format!("{}:{}", self.host, port);
        match addr.parse() {
            Ok(addr) => Ok(addr),
            Err(_) => bail!("Invalid bind address: {addr}"),
        }
    }

    /// Number of workers the supervisor runs.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.workers
            .count
            .filter(|&n| n > 0)
            .unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(std::num::NonZeroUsize::get)
                    .unwrap_or(1)
            })
    }

    #[must_use]
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store.timeout_ms)
    }

    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat.timeout_ms)
    }

    /// Whether workers can reach each other's connections.
    #[must_use]
    pub fn is_shared(&self) -> bool {
        self.presence.backend == PresenceBackend::Redis && self.bus.backend == BusBackend::Redis
    }
}
