//! Server configuration
//!
//! Loaded from a JSON file and/or overridden from the command line.

use crate::network::message::{MAGIC_MAINNET, MAGIC_PRIVNET, MAGIC_TESTNET};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Default outbound connection target
pub const DEFAULT_MIN_PEERS: usize = 5;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    ParseError(#[from] serde_json::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Network server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP port to listen on, also announced in our Version
    pub listen_tcp: u16,
    /// Timeout for outbound dials
    #[serde(rename = "dial_timeout_ms", with = "millis")]
    pub dial_timeout: Duration,
    /// Interval of each peer's sync tick
    #[serde(rename = "proto_tick_interval_ms", with = "millis")]
    pub proto_tick_interval: Duration,
    /// Network magic
    pub net: u32,
    pub user_agent: String,
    pub relay: bool,
    /// Addresses (host:port) backfilled into discovery on start
    pub seeds: Vec<String>,
    /// Number of peers the server tries to keep connected
    pub min_peers: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_tcp: 20333,
            dial_timeout: Duration::from_secs(3),
            proto_tick_interval: Duration::from_secs(5),
            net: MAGIC_PRIVNET,
            user_agent: format!("/chain-p2p:{}/", env!("CARGO_PKG_VERSION")),
            relay: true,
            seeds: Vec::new(),
            min_peers: DEFAULT_MIN_PEERS,
        }
    }
}

impl ServerConfig {
    /// Load from a JSON file; missing fields take their defaults
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path)?;
        let config: ServerConfig = serde_json::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.proto_tick_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "proto_tick_interval_ms must be positive".to_string(),
            ));
        }
        if self.dial_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "dial_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Resolve a network name or a raw number to its magic
pub fn parse_net(s: &str) -> Result<u32, ConfigError> {
    match s.to_ascii_lowercase().as_str() {
        "mainnet" => Ok(MAGIC_MAINNET),
        "testnet" => Ok(MAGIC_TESTNET),
        "privnet" => Ok(MAGIC_PRIVNET),
        other => other
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("unknown network: {}", s))),
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
