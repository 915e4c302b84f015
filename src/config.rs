//! Runtime configuration parsed from environment variables.
//!
//! Every knob has a typed default except `DATABASE_URL`. Unparseable values
//! fall back to the default rather than failing startup.

use std::time::Duration;

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_DB_MAX_CONNECTIONS: u32 = 5;
pub const DEFAULT_STATE_FLUSH_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_WS_IDLE_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_WS_PING_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_WS_CLIENT_QUEUE: usize = 256;
pub const DEFAULT_BOARD_SIZE: f64 = 5000.0;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
}

/// Connection-level limits for the realtime gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RealtimeConfig {
    /// A connection with no inbound traffic for this long is disconnected.
    pub idle_timeout: Duration,
    /// Server ping cadence.
    pub ping_interval: Duration,
    /// Outbound frame queue depth per connection.
    pub client_queue: usize,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(DEFAULT_WS_IDLE_TIMEOUT_SECS),
            ping_interval: Duration::from_secs(DEFAULT_WS_PING_INTERVAL_SECS),
            client_queue: DEFAULT_WS_CLIENT_QUEUE,
        }
    }
}

/// Dimensions given to newly created boards.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoardDefaults {
    pub width: f64,
    pub height: f64,
}

impl Default for BoardDefaults {
    fn default() -> Self {
        Self { width: DEFAULT_BOARD_SIZE, height: DEFAULT_BOARD_SIZE }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    pub db_max_connections: u32,
    pub flush_interval: Duration,
    pub realtime: RealtimeConfig,
    pub board_defaults: BoardDefaults,
}

impl Config {
    /// Build typed config from environment variables.
    ///
    /// Required:
    /// - `DATABASE_URL`
    ///
    /// Optional:
    /// - `PORT` (3000), `DB_MAX_CONNECTIONS` (5)
    /// - `STATE_FLUSH_INTERVAL_MS` (1000)
    /// - `WS_IDLE_TIMEOUT_SECS` (300), `WS_PING_INTERVAL_SECS` (30), `WS_CLIENT_QUEUE` (256)
    /// - `BOARD_DEFAULT_WIDTH`, `BOARD_DEFAULT_HEIGHT` (5000)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Missing` if `DATABASE_URL` is unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("DATABASE_URL").map_err(|_| ConfigError::Missing("DATABASE_URL"))?;

        Ok(Self {
            database_url,
            port: env_parse("PORT", DEFAULT_PORT),
            db_max_connections: env_parse("DB_MAX_CONNECTIONS", DEFAULT_DB_MAX_CONNECTIONS),
            flush_interval: Duration::from_millis(env_parse("STATE_FLUSH_INTERVAL_MS", DEFAULT_STATE_FLUSH_INTERVAL_MS)),
            realtime: RealtimeConfig {
                idle_timeout: Duration::from_secs(env_parse("WS_IDLE_TIMEOUT_SECS", DEFAULT_WS_IDLE_TIMEOUT_SECS)),
                ping_interval: Duration::from_secs(env_parse("WS_PING_INTERVAL_SECS", DEFAULT_WS_PING_INTERVAL_SECS)),
                client_queue: env_parse("WS_CLIENT_QUEUE", DEFAULT_WS_CLIENT_QUEUE).max(1),
            },
            board_defaults: BoardDefaults {
                width: env_parse("BOARD_DEFAULT_WIDTH", DEFAULT_BOARD_SIZE),
                height: env_parse("BOARD_DEFAULT_HEIGHT", DEFAULT_BOARD_SIZE),
            },
        })
    }
}

pub(crate) fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}
