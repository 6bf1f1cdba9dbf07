use std::env;
use std::path::PathBuf;
use std::time::Duration;

use dotenv::dotenv;
use thiserror::Error;
use tracing::warn;

use crate::rabbitmq::channel_manager::{
    AckMode, PoolSettings, DEFAULT_CHANNEL_COUNT, DEFAULT_CHANNEL_RETRY_DELAY,
    DEFAULT_PREFETCH_COUNT, DEFAULT_QUEUE_NAME,
};
use crate::rabbitmq::connection::{ConnectionSettings, TlsMode, DEFAULT_PORT};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("environment variable {0} is required")]
    Missing(&'static str),

    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub connection: ConnectionSettings,
    pub pool: PoolSettings,
    pub channel_retry_delay: Duration,
}

impl Config {
    /// Read the configuration from the process environment, after loading `.env`.
    pub fn load() -> Result<Self, ConfigError> {
        dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the configuration from any key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let tls = if parse_flag("AMQP_TLS", get("AMQP_TLS"))? {
            TlsMode::Enabled {
                skip_verify: parse_flag("AMQP_TLS_SKIP_VERIFY", get("AMQP_TLS_SKIP_VERIFY"))?,
                ca_cert: get("AMQP_TLS_CA_CERT").map(PathBuf::from),
            }
        } else {
            TlsMode::Disabled
        };

        let connection = ConnectionSettings {
            user: get("AMQP_USER").ok_or(ConfigError::Missing("AMQP_USER"))?,
            password: lookup("AMQP_PASS").unwrap_or_default(),
            host: get("AMQP_HOST").ok_or(ConfigError::Missing("AMQP_HOST"))?,
            port: match get("AMQP_PORT") {
                Some(value) => parse_number("AMQP_PORT", &value)?,
                None => DEFAULT_PORT,
            },
            tls,
        };

        let pool = PoolSettings {
            queue_name: get("AMQP_QUEUE_NAME").unwrap_or_else(|| DEFAULT_QUEUE_NAME.to_string()),
            channel_count: channel_count(get("AMQP_CHANNEL_COUNT")),
            ack_mode: match get("AMQP_ACK_MODE") {
                Some(value) => value.parse::<AckMode>().map_err(|e| ConfigError::Invalid {
                    key: "AMQP_ACK_MODE",
                    value: value.clone(),
                    reason: e.to_string(),
                })?,
                None => AckMode::default(),
            },
            prefetch_count: match get("AMQP_PREFETCH_COUNT") {
                Some(value) => parse_number("AMQP_PREFETCH_COUNT", &value)?,
                None => DEFAULT_PREFETCH_COUNT,
            },
        };

        let channel_retry_delay = match get("AMQP_CHANNEL_RETRY_MS") {
            Some(value) => Duration::from_millis(parse_number("AMQP_CHANNEL_RETRY_MS", &value)?),
            None => DEFAULT_CHANNEL_RETRY_DELAY,
        };

        Ok(Config {
            connection,
            pool,
            channel_retry_delay,
        })
    }
}

/// A bad channel count is not fatal: the worker falls back to the default.
fn channel_count(value: Option<String>) -> usize {
    match value {
        None => DEFAULT_CHANNEL_COUNT,
        Some(value) => match value.trim().parse::<usize>() {
            Ok(count) if count > 0 => count,
            _ => {
                warn!(
                    value = %value,
                    default = DEFAULT_CHANNEL_COUNT,
                    "Invalid AMQP_CHANNEL_COUNT, using default"
                );
                DEFAULT_CHANNEL_COUNT
            }
        },
    }
}

fn parse_flag(key: &'static str, value: Option<String>) -> Result<bool, ConfigError> {
    let Some(value) = value else {
        return Ok(false);
    };
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            key,
            value,
            reason: "expected a boolean".to_string(),
        }),
    }
}

fn parse_number<T>(key: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: e.to_string(),
    })
}
