//! Server configuration loading from file and environment variables.

use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use tessera_db::{AcquirePolicy, PoolOptions};
use tessera_session::{BeginMode, SessionOptions};
use thiserror::Error;

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Server network settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Database and session settings.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Periodic maintenance settings.
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
}

/// Network configuration for the HTTP server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path (or `file:` URI) of the SQLite database.
    #[serde(default = "default_db_path")]
    pub path: String,

    /// Maximum number of pooled connections.
    #[serde(default = "default_pool_max_size")]
    pub pool_max_size: u32,

    /// Connections kept open while idle.
    #[serde(default = "default_min_idle")]
    pub min_idle: u32,

    /// How long a request waits for a pooled connection.
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,

    /// Fail immediately instead of waiting when the pool is saturated.
    #[serde(default)]
    pub fail_fast: bool,

    /// SQLite busy timeout in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// How long shutdown waits for open sessions.
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,

    /// Defer connecting until the first request.
    #[serde(default)]
    pub lazy: bool,

    /// `BEGIN` flavor used for every session.
    #[serde(default)]
    pub begin_mode: BeginMode,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "tessera_session=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

/// Background maintenance configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MaintenanceConfig {
    /// Seconds between two purge runs.
    #[serde(default = "default_purge_interval_seconds")]
    pub purge_interval_seconds: u64,

    /// Notes older than this many days are purged. `0` disables purging.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}

fn default_port() -> u16 {
    3000
}

fn default_db_path() -> String {
    "tessera.db".to_string()
}

fn default_pool_max_size() -> u32 {
    8
}

fn default_min_idle() -> u32 {
    1
}

fn default_acquire_timeout_ms() -> u64 {
    5_000
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_drain_timeout_ms() -> u64 {
    10_000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_purge_interval_seconds() -> u64 {
    3_600
}

fn default_retention_days() -> u32 {
    30
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            pool_max_size: default_pool_max_size(),
            min_idle: default_min_idle(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            fail_fast: false,
            busy_timeout_ms: default_busy_timeout_ms(),
            drain_timeout_ms: default_drain_timeout_ms(),
            lazy: false,
            begin_mode: BeginMode::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            purge_interval_seconds: default_purge_interval_seconds(),
            retention_days: default_retention_days(),
        }
    }
}

impl DatabaseConfig {
    /// Pool options derived from this section.
    pub fn pool_options(&self) -> PoolOptions {
        let acquire = if self.fail_fast {
            AcquirePolicy::FailFast
        } else {
            AcquirePolicy::Wait {
                timeout: Duration::from_millis(self.acquire_timeout_ms),
            }
        };
        PoolOptions {
            max_size: self.pool_max_size,
            min_idle: self.min_idle,
            acquire,
            busy_timeout_ms: self.busy_timeout_ms,
            drain_timeout: Duration::from_millis(self.drain_timeout_ms),
            lazy: self.lazy,
            ..PoolOptions::default()
        }
    }

    /// Session options derived from this section.
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            begin: self.begin_mode,
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Loads configuration from a TOML file, falling back to defaults, then
/// applies environment overrides.
///
/// Environment variable overrides:
/// - `TESSERA_HOST` overrides `server.host`
/// - `TESSERA_PORT` overrides `server.port`
/// - `TESSERA_DB_PATH` overrides `database.path`
/// - `TESSERA_DB_POOL_MAX_SIZE` overrides `database.pool_max_size`
/// - `TESSERA_DB_MIN_IDLE` overrides `database.min_idle`
/// - `TESSERA_DB_ACQUIRE_TIMEOUT_MS` overrides `database.acquire_timeout_ms`
/// - `TESSERA_DB_FAIL_FAST` overrides `database.fail_fast`
/// - `TESSERA_DB_BUSY_TIMEOUT_MS` overrides `database.busy_timeout_ms`
/// - `TESSERA_DB_DRAIN_TIMEOUT_MS` overrides `database.drain_timeout_ms`
/// - `TESSERA_DB_LAZY` overrides `database.lazy`
/// - `TESSERA_DB_BEGIN_MODE` overrides `database.begin_mode`
/// - `TESSERA_LOG_LEVEL` overrides `logging.level`
/// - `TESSERA_LOG_JSON` overrides `logging.json` (set to "true" to enable)
/// - `TESSERA_PURGE_INTERVAL_SECONDS` overrides `maintenance.purge_interval_seconds`
/// - `TESSERA_RETENTION_DAYS` overrides `maintenance.retention_days`
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    apply_overrides(&mut config, |key| std::env::var(key).ok());
    Ok(config)
}

/// Applies `TESSERA_*` overrides looked up through `lookup`. Values that do not
/// parse are ignored.
pub fn apply_overrides<F>(config: &mut Config, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    fn parsed<T: std::str::FromStr>(value: Option<String>) -> Option<T> {
        value.and_then(|v| v.trim().parse().ok())
    }

    if let Some(host) = parsed(lookup("TESSERA_HOST")) {
        config.server.host = host;
    }
    if let Some(port) = parsed(lookup("TESSERA_PORT")) {
        config.server.port = port;
    }
    if let Some(db_path) = lookup("TESSERA_DB_PATH") {
        config.database.path = db_path;
    }
    if let Some(max_size) = parsed(lookup("TESSERA_DB_POOL_MAX_SIZE")) {
        config.database.pool_max_size = max_size;
    }
    if let Some(min_idle) = parsed(lookup("TESSERA_DB_MIN_IDLE")) {
        config.database.min_idle = min_idle;
    }
    if let Some(timeout) = parsed(lookup("TESSERA_DB_ACQUIRE_TIMEOUT_MS")) {
        config.database.acquire_timeout_ms = timeout;
    }
    if let Some(fail_fast) = lookup("TESSERA_DB_FAIL_FAST") {
        config.database.fail_fast = is_truthy(&fail_fast);
    }
    if let Some(timeout) = parsed(lookup("TESSERA_DB_BUSY_TIMEOUT_MS")) {
        config.database.busy_timeout_ms = timeout;
    }
    if let Some(timeout) = parsed(lookup("TESSERA_DB_DRAIN_TIMEOUT_MS")) {
        config.database.drain_timeout_ms = timeout;
    }
    if let Some(lazy) = lookup("TESSERA_DB_LAZY") {
        config.database.lazy = is_truthy(&lazy);
    }
    if let Some(mode) = lookup("TESSERA_DB_BEGIN_MODE").and_then(|m| parse_begin_mode(&m)) {
        config.database.begin_mode = mode;
    }
    if let Some(level) = lookup("TESSERA_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(json) = lookup("TESSERA_LOG_JSON") {
        config.logging.json = is_truthy(&json);
    }
    if let Some(interval) = parsed(lookup("TESSERA_PURGE_INTERVAL_SECONDS")) {
        config.maintenance.purge_interval_seconds = interval;
    }
    if let Some(days) = parsed(lookup("TESSERA_RETENTION_DAYS")) {
        config.maintenance.retention_days = days;
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(value.trim(), "true" | "1")
}

fn parse_begin_mode(value: &str) -> Option<BeginMode> {
    match value.trim().to_ascii_lowercase().as_str() {
        "deferred" => Some(BeginMode::Deferred),
        "immediate" => Some(BeginMode::Immediate),
        "exclusive" => Some(BeginMode::Exclusive),
        _ => None,
    }
}
