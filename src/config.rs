//! Configuration for the admission gate.

use serde::{Deserialize, Serialize};
use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use thiserror::Error;

/// Environment variable holding the gate's listen address.
pub const ENV_LISTEN_ADDR: &str = "DBFW_LISTEN_ADDR";
/// Environment variable holding the global connection limit.
pub const ENV_CONNECTION_LIMIT: &str = "DBFW_CONNECTION_LIMIT";
/// Environment variable holding the per-IP connection limit.
pub const ENV_PER_IP_CONNECTION_LIMIT: &str = "DBFW_PER_IP_CONNECTION_LIMIT";
/// Environment variable holding the token refill rate (tokens/second).
pub const ENV_RATE_LIMIT_RATE: &str = "DBFW_RATE_LIMIT_RATE";
/// Environment variable holding the token bucket capacity.
pub const ENV_RATE_LIMIT_CAPACITY: &str = "DBFW_RATE_LIMIT_CAPACITY";

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A configured value could not be parsed.
    #[error("invalid value '{value}' for {key}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    /// Invalid listen address format.
    #[error("invalid listen address '{addr}': {reason}")]
    InvalidListenAddr { addr: String, reason: String },
}

/// Connection limits enforced by the connection register.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Maximum simultaneously-open connections across all source IPs.
    /// Zero rejects every connection.
    #[serde(default = "default_connection_limit")]
    pub connection_limit: usize,
    /// Maximum simultaneously-open connections from a single source IP.
    #[serde(default = "default_per_ip_connection_limit")]
    pub per_ip_connection_limit: usize,
}

fn default_connection_limit() -> usize {
    10_000
}

fn default_per_ip_connection_limit() -> usize {
    100
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connection_limit: default_connection_limit(),
            per_ip_connection_limit: default_per_ip_connection_limit(),
        }
    }
}

impl ConnectionConfig {
    /// Creates a new connection configuration.
    pub fn new(connection_limit: usize) -> Self {
        Self {
            connection_limit,
            ..Default::default()
        }
    }

    /// Sets the maximum connections per IP.
    pub fn with_per_ip_limit(mut self, max: usize) -> Self {
        self.per_ip_connection_limit = max;
        self
    }
}

/// Token bucket parameters, applied independently to every source IP.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimiterConfig {
    /// Tokens replenished per second. Zero disables rate limiting.
    #[serde(default = "default_rate")]
    pub rate: u64,
    /// Maximum tokens a bucket may hold (burst size).
    #[serde(default = "default_capacity")]
    pub capacity: u64,
}

fn default_rate() -> u64 {
    100
}

fn default_capacity() -> u64 {
    50
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            rate: default_rate(),
            capacity: default_capacity(),
        }
    }
}

impl RateLimiterConfig {
    /// Creates a new rate limiter configuration.
    pub fn new(rate: u64, capacity: u64) -> Self {
        Self { rate, capacity }
    }

    /// Returns `true` when the rate is the unlimited sentinel.
    pub fn is_unlimited(&self) -> bool {
        self.rate == 0
    }
}

/// Process configuration for the admission gate binary.
///
/// # Environment Variables
///
/// * `DBFW_LISTEN_ADDR` - Address to accept client connections on (default: "127.0.0.1:5433")
/// * `DBFW_CONNECTION_LIMIT` - Global connection limit (default: 10000)
/// * `DBFW_PER_IP_CONNECTION_LIMIT` - Per-IP connection limit (default: 100)
/// * `DBFW_RATE_LIMIT_RATE` - Tokens per second per IP, 0 = unlimited
/// * `DBFW_RATE_LIMIT_CAPACITY` - Bucket capacity per IP
///
/// Rate limiting is enabled only when at least one of the two rate limit
/// variables is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateConfig {
    /// Address to listen on for incoming connections.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Connection concurrency limits.
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Per-IP rate limiting, disabled when absent.
    #[serde(default)]
    pub rate_limiter: Option<RateLimiterConfig>,
}

fn default_listen_addr() -> String {
    "127.0.0.1:5433".to_string()
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            connection: ConnectionConfig::default(),
            rate_limiter: None,
        }
    }
}

impl GateConfig {
    /// Loads configuration from environment variables with fallback to defaults.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if a variable is set but cannot be
    /// parsed as a non-negative integer.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Loads configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let listen_addr = lookup(ENV_LISTEN_ADDR).unwrap_or_else(default_listen_addr);

        let connection = ConnectionConfig {
            connection_limit: parse_var(&lookup, ENV_CONNECTION_LIMIT)?
                .unwrap_or_else(default_connection_limit),
            per_ip_connection_limit: parse_var(&lookup, ENV_PER_IP_CONNECTION_LIMIT)?
                .unwrap_or_else(default_per_ip_connection_limit),
        };

        let rate = parse_var::<u64, _>(&lookup, ENV_RATE_LIMIT_RATE)?;
        let capacity = parse_var::<u64, _>(&lookup, ENV_RATE_LIMIT_CAPACITY)?;
        let rate_limiter = match (rate, capacity) {
            (None, None) => None,
            (rate, capacity) => Some(RateLimiterConfig {
                rate: rate.unwrap_or_else(default_rate),
                capacity: capacity.unwrap_or_else(default_capacity),
            }),
        };

        Ok(Self {
            listen_addr,
            connection,
            rate_limiter,
        })
    }

    /// Loads configuration from the environment and validates it.
    pub fn from_env_validated() -> Result<Self, ConfigError> {
        let config = Self::from_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the listen address is not a valid socket address.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.listen_addr
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidListenAddr {
                addr: self.listen_addr.clone(),
                reason: e.to_string(),
            })?;

        Ok(())
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                value: raw.clone(),
                reason: e.to_string(),
            }),
    }
}
