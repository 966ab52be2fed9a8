use std::{net::SocketAddr, str::FromStr, time::Duration};

use axum::http::HeaderValue;
use thiserror::Error;

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:5000";
const DEFAULT_DATABASE_URL: &str = "sqlite://forumchat.db?mode=rwc";
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 16;
const DEFAULT_CORS_ORIGINS: &str = "http://localhost:3000,http://localhost:5173";
const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 25;
const DEFAULT_CLIENT_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    fn invalid(key: &'static str, value: impl Into<String>, reason: impl ToString) -> Self {
        Self::Invalid {
            key,
            value: value.into(),
            reason: reason.to_string(),
        }
    }
}

/// Liveness settings for websocket connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// How often the server pings each client.
    pub interval: Duration,
    /// How long a client may stay silent before it is disconnected.
    pub timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(DEFAULT_HEARTBEAT_INTERVAL_SECS),
            timeout: Duration::from_secs(DEFAULT_CLIENT_TIMEOUT_SECS),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub database_url: String,
    pub db_max_connections: u32,
    pub cors_origins: Vec<HeaderValue>,
    pub heartbeat: HeartbeatConfig,
}

impl Config {
    /// Reads the configuration from the process environment, honouring a `.env` file.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| dotenv::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let bind_addr = parsed(&lookup, "BIND_ADDR", DEFAULT_BIND_ADDR)?;
        let database_url = lookup("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_owned());
        let db_max_connections: u32 = parsed(&lookup, "DB_MAX_CONNECTIONS", DEFAULT_DB_MAX_CONNECTIONS)?;
        if db_max_connections == 0 {
            return Err(ConfigError::invalid("DB_MAX_CONNECTIONS", "0", "must be at least 1"));
        }

        let origins = lookup("CORS_ORIGINS").unwrap_or_else(|| DEFAULT_CORS_ORIGINS.to_owned());
        let cors_origins = origins
            .split(',')
            .map(str::trim)
            .filter(|origin| !origin.is_empty())
            .map(|origin| {
                HeaderValue::from_str(origin)
                    .map_err(|err| ConfigError::invalid("CORS_ORIGINS", origin, err))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let interval: u64 = parsed(&lookup, "HEARTBEAT_INTERVAL_SECS", DEFAULT_HEARTBEAT_INTERVAL_SECS)?;
        let timeout: u64 = parsed(&lookup, "CLIENT_TIMEOUT_SECS", DEFAULT_CLIENT_TIMEOUT_SECS)?;
        if interval == 0 {
            return Err(ConfigError::invalid("HEARTBEAT_INTERVAL_SECS", "0", "must be at least 1"));
        }
        if timeout <= interval {
            return Err(ConfigError::invalid(
                "CLIENT_TIMEOUT_SECS",
                timeout.to_string(),
                format!("must be greater than HEARTBEAT_INTERVAL_SECS ({interval})"),
            ));
        }

        Ok(Config {
            bind_addr,
            database_url,
            db_max_connections,
            cors_origins,
            heartbeat: HeartbeatConfig {
                interval: Duration::from_secs(interval),
                timeout: Duration::from_secs(timeout),
            },
        })
    }
}

fn parsed<T, D>(lookup: &impl Fn(&str) -> Option<String>, key: &'static str, default: D) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    D: ToString,
{
    let value = lookup(key).unwrap_or_else(|| default.to_string());
    value
        .trim()
        .parse()
        .map_err(|err| ConfigError::invalid(key, value.clone(), err))
}
