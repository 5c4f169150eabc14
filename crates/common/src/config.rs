//! Application configuration.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{AppResult, RoomId};

/// Application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Local presentation server configuration.
    #[serde(default)]
    pub server: ServerConfig,
    /// Database configuration.
    pub database: DatabaseConfig,
    /// Redis configuration.
    pub redis: RedisConfig,
    /// Room configuration.
    #[serde(default)]
    pub room: RoomConfig,
    /// Reconciliation configuration.
    #[serde(default)]
    pub sync: SyncConfig,
    /// Which remote store backs the room.
    #[serde(default)]
    pub backend: BackendKind,
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to bind to.
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Database connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// `PostgreSQL` connection URL.
    pub url: String,
    /// Maximum number of connections in the pool.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool.
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

/// Redis configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL.
    pub url: String,
    /// Prefix for all pub/sub channel names.
    #[serde(default = "default_redis_prefix")]
    pub prefix: String,
}

/// Room configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RoomConfig {
    /// Room to join. A fresh one is generated when absent.
    #[serde(default)]
    pub id: Option<String>,
    /// File holding this device's vote locks.
    #[serde(default = "default_lock_path")]
    pub lock_path: PathBuf,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            id: None,
            lock_path: default_lock_path(),
        }
    }
}

impl RoomConfig {
    /// Resolve the configured room id, generating one if none is set.
    pub fn resolve_id(&self) -> AppResult<RoomId> {
        match self.id.as_deref() {
            Some(raw) if !raw.trim().is_empty() => RoomId::parse(raw.trim()),
            _ => Ok(RoomId::generate()),
        }
    }
}

/// Reconciliation configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Interval of the unconditional refresh poll.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Capacity of the reconciler's trigger queue.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl SyncConfig {
    /// Poll interval as a [`Duration`].
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Remote store selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// `PostgreSQL` records with Redis broadcast.
    #[default]
    Postgres,
    /// Process-local store, for trying the widget without infrastructure.
    Memory,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

const fn default_port() -> u16 {
    4280
}

const fn default_max_connections() -> u32 {
    10
}

const fn default_min_connections() -> u32 {
    1
}

fn default_redis_prefix() -> String {
    "tally".to_string()
}

fn default_lock_path() -> PathBuf {
    PathBuf::from(".tally/locks.json")
}

const fn default_poll_interval_ms() -> u64 {
    3000
}

const fn default_queue_capacity() -> usize {
    16
}

impl Config {
    /// Load configuration from files and environment variables.
    ///
    /// Configuration is loaded in the following order:
    /// 1. `.env` (if present)
    /// 2. `config/default.toml`
    /// 3. `config/{environment}.toml` (based on `TALLY_ENV`)
    /// 4. Environment variables with `TALLY__` prefix
    pub fn load() -> Result<Self, config::ConfigError> {
        dotenvy::dotenv().ok();
        let env = std::env::var("TALLY_ENV").unwrap_or_else(|_| "development".to_string());

        let config = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name(&format!("config/{env}")).required(false))
            .add_source(
                config::Environment::with_prefix("TALLY")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Load configuration from a specific file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, config::ConfigError> {
        let config = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("TALLY")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }
}
