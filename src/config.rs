//! Service configuration, loaded from JSON.
//!
//! Durations are written the way queries write them (`"1s"`, `"10m"`, `"1h30m"`).

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::query::executor::ExecutionConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub enabled: bool,
    /// Emit an info line for every executed window
    pub log_enabled: bool,
    #[serde(with = "duration_string")]
    pub run_interval: Duration,
    pub node_id: u64,
    pub lease_name: String,
    #[serde(with = "duration_string")]
    pub lease_duration: Duration,
    pub max_concurrent_queries: usize,
    pub chunk_size: usize,
    #[serde(with = "optional_duration_string", skip_serializing_if = "Option::is_none")]
    pub query_timeout: Option<Duration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics_addr: Option<SocketAddr>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enabled: true,
            log_enabled: true,
            run_interval: Duration::from_secs(1),
            node_id: 1,
            lease_name: "continuous_querier".to_string(),
            lease_duration: Duration::from_secs(60),
            max_concurrent_queries: 32,
            chunk_size: 10_000,
            query_timeout: None,
            metrics_addr: None,
        }
    }
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.run_interval.is_zero() {
            return Err(ConfigError::Invalid("run_interval must be greater than zero".to_string()));
        }
        if self.lease_duration.is_zero() {
            return Err(ConfigError::Invalid("lease_duration must be greater than zero".to_string()));
        }
        if self.lease_name.is_empty() {
            return Err(ConfigError::Invalid("lease_name must not be empty".to_string()));
        }
        if self.max_concurrent_queries == 0 {
            return Err(ConfigError::Invalid("max_concurrent_queries must be greater than zero".to_string()));
        }
        if self.chunk_size == 0 {
            return Err(ConfigError::Invalid("chunk_size must be greater than zero".to_string()));
        }
        Ok(())
    }

    pub fn execution_config(&self) -> ExecutionConfig {
        ExecutionConfig {
            chunk_size: self.chunk_size,
            timeout: self.query_timeout,
        }
    }
}

mod duration_string {
    use std::time::Duration;

    use serde::{de, Deserialize, Deserializer, Serializer};

    use crate::query::parser::lexer::{format_duration, parse_duration};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let nanos = i64::try_from(value.as_nanos()).map_err(<S::Error as serde::ser::Error>::custom)?;
        serializer.serialize_str(&format_duration(nanos))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let text = String::deserialize(deserializer)?;
        parse(&text).map_err(de::Error::custom)
    }

    pub(super) fn parse(text: &str) -> Result<Duration, String> {
        let nanos = parse_duration(text).map_err(|e| e.to_string())?;
        u64::try_from(nanos)
            .map(Duration::from_nanos)
            .map_err(|_| format!("duration must not be negative: {}", text))
    }
}

mod optional_duration_string {
    use std::time::Duration;

    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => super::duration_string::serialize(duration, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(text) => super::duration_string::parse(&text).map(Some).map_err(de::Error::custom),
            None => Ok(None),
        }
    }
}
