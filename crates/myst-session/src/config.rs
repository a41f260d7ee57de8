//! Session Configuration
//!
//! Timeouts, currencies and storage paths for the session coordinator.
//! Loadable from TOML or JSON; every field has a default.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Complete session configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// How long to wait for the core service to be bound (seconds)
    #[serde(default = "default_ready_timeout")]
    pub ready_timeout_secs: u64,
    /// Identity / balance / rate queries (seconds)
    #[serde(default = "default_query_timeout")]
    pub query_timeout_secs: u64,
    /// Connection establishment (seconds)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Connection cancellation (seconds)
    #[serde(default = "default_cancel_timeout")]
    pub cancel_timeout_secs: u64,
    /// Token currency reported in balance snapshots
    #[serde(default = "default_token_currency")]
    pub token_currency: String,
    /// Fiat currency used for exchange-rate lookups
    #[serde(default = "default_fiat_currency")]
    pub fiat_currency: String,
    /// Buffered session events per subscriber
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    /// Buffered core signals before the core is back-pressured
    #[serde(default = "default_signal_capacity")]
    pub signal_capacity: usize,
    /// Where preference flags are persisted (in memory when unset)
    #[serde(default)]
    pub preferences_path: Option<PathBuf>,
}

fn default_ready_timeout() -> u64 {
    30
}

fn default_query_timeout() -> u64 {
    10
}

fn default_connect_timeout() -> u64 {
    60
}

fn default_cancel_timeout() -> u64 {
    15
}

fn default_token_currency() -> String {
    "MYSTT".to_string()
}

fn default_fiat_currency() -> String {
    "USD".to_string()
}

fn default_event_capacity() -> usize {
    64
}

fn default_signal_capacity() -> usize {
    256
}

impl SessionConfig {
    /// Load from TOML string
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Load from JSON string
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Load from a `.toml` or `.json` file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;

        let config = match ext {
            "toml" => Self::from_toml(&content)?,
            "json" => Self::from_json(&content)?,
            _ => return Err(ConfigError::UnsupportedFormat),
        };
        config.validate()?;
        Ok(config)
    }

    /// Export as TOML
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn cancel_timeout(&self) -> Duration {
        Duration::from_secs(self.cancel_timeout_secs)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let timeouts = [
            ("ready_timeout_secs", self.ready_timeout_secs),
            ("query_timeout_secs", self.query_timeout_secs),
            ("connect_timeout_secs", self.connect_timeout_secs),
            ("cancel_timeout_secs", self.cancel_timeout_secs),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, secs)| *secs == 0) {
            return Err(ConfigError::ZeroTimeout(name));
        }
        if self.token_currency.trim().is_empty() || self.fiat_currency.trim().is_empty() {
            return Err(ConfigError::EmptyCurrency);
        }
        if self.event_capacity == 0 || self.signal_capacity == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        Ok(())
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ready_timeout_secs: default_ready_timeout(),
            query_timeout_secs: default_query_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            cancel_timeout_secs: default_cancel_timeout(),
            token_currency: default_token_currency(),
            fiat_currency: default_fiat_currency(),
            event_capacity: default_event_capacity(),
            signal_capacity: default_signal_capacity(),
            preferences_path: None,
        }
    }
}

/// Configuration errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("Timeout must be non-zero: {0}")]
    ZeroTimeout(&'static str),

    #[error("Currency code must not be empty")]
    EmptyCurrency,

    #[error("Channel capacity must be non-zero")]
    ZeroCapacity,

    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Unsupported config format")]
    UnsupportedFormat,
}
