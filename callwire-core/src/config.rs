//! Coordinator configuration

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Config content is not valid JSON for this schema
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    /// Config parsed but a value is out of range
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// STUN/TURN server used by the peer transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IceServerConfig {
    /// Server URLs, e.g. `stun:stun.l.google.com:19302`
    pub urls: Vec<String>,
    /// TURN username
    pub username: String,
    /// TURN credential
    pub credential: String,
}

impl Default for IceServerConfig {
    fn default() -> Self {
        Self {
            urls: vec!["stun:stun.l.google.com:19302".to_string()],
            username: String::new(),
            credential: String::new(),
        }
    }
}

/// Call coordinator configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Outgoing calls not accepted within this many seconds are cancelled (0 disables)
    pub ring_timeout_secs: u64,
    /// Maximum wait for ICE gathering before a description is advertised
    pub gathering_timeout_ms: u64,
    /// Send attempts for the initiating `StartCall` signal
    pub start_call_attempts: u32,
    /// Base delay between `StartCall` attempts
    pub retry_backoff_ms: u64,
    /// Also forward locally gathered candidates individually
    pub trickle_ice: bool,
    /// ICE servers for the peer transport
    pub ice_servers: Vec<IceServerConfig>,
    /// Capacity of the call event broadcast channel
    pub event_buffer: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            ring_timeout_secs: 45,
            gathering_timeout_ms: 10_000,
            start_call_attempts: 3,
            retry_backoff_ms: 250,
            trickle_ice: false,
            ice_servers: vec![IceServerConfig::default()],
            event_buffer: 100,
        }
    }
}

impl CoordinatorConfig {
    /// Parse and validate a JSON config
    ///
    /// # Errors
    ///
    /// Returns error if the JSON is malformed or a value is out of range
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON config file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or its content is invalid
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    /// Check value ranges
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` describing the first bad value
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.gathering_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "gathering_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.start_call_attempts == 0 {
            return Err(ConfigError::Invalid(
                "start_call_attempts must be at least 1".to_string(),
            ));
        }
        if self.event_buffer == 0 {
            return Err(ConfigError::Invalid(
                "event_buffer must be greater than zero".to_string(),
            ));
        }
        if let Some(server) = self.ice_servers.iter().find(|s| s.urls.is_empty()) {
            return Err(ConfigError::Invalid(format!(
                "ICE server entry has no urls (username: {:?})",
                server.username
            )));
        }
        Ok(())
    }

    /// Ring timeout, `None` when disabled
    pub fn ring_timeout(&self) -> Option<Duration> {
        (self.ring_timeout_secs > 0).then(|| Duration::from_secs(self.ring_timeout_secs))
    }

    /// ICE gathering timeout
    pub fn gathering_timeout(&self) -> Duration {
        Duration::from_millis(self.gathering_timeout_ms)
    }

    /// Delay before the given retry (1-based), linear in the attempt number
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(u64::from(attempt)))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = CoordinatorConfig::default();
        config.validate().unwrap();
        assert_eq!(config.ring_timeout(), Some(Duration::from_secs(45)));
        assert_eq!(config.gathering_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config =
            CoordinatorConfig::from_json_str(r#"{ "ring_timeout_secs": 0, "trickle_ice": true }"#)
                .unwrap();
        assert_eq!(config.ring_timeout(), None);
        assert!(config.trickle_ice);
        assert_eq!(config.start_call_attempts, 3);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let res = CoordinatorConfig::from_json_str(r#"{ "start_call_attempts": 0 }"#);
        assert!(matches!(res, Err(ConfigError::Invalid(ref msg)) if msg.contains("start_call_attempts")));

        let res = CoordinatorConfig::from_json_str(r#"{ "ice_servers": [ { "urls": [] } ] }"#);
        assert!(matches!(res, Err(ConfigError::Invalid(_))));

        let res = CoordinatorConfig::from_json_str("not json");
        assert!(matches!(res, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "gathering_timeout_ms": 1500, "retry_backoff_ms": 10 }}"#).unwrap();

        let config = CoordinatorConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.gathering_timeout(), Duration::from_millis(1500));
        assert_eq!(config.retry_delay(3), Duration::from_millis(30));
    }

    #[test]
    fn test_missing_file() {
        let res = CoordinatorConfig::from_json_file("/nonexistent/callwire.json");
        assert!(matches!(res, Err(ConfigError::Io(_))));
    }
}
