//! Broker configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (FANOUT_*)
//! - TOML configuration file

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// In-process broker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Per-subscriber event buffer capacity.
    ///
    /// When a subscriber's buffer is full, further events for it are dropped
    /// (delivery is at-most-once, best-effort).
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Maximum channel or pattern name length in bytes.
    #[serde(default = "default_max_channel_name_length")]
    pub max_channel_name_length: usize,
}

// Default value functions
fn default_event_capacity() -> usize {
    std::env::var("FANOUT_EVENT_CAPACITY")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(1024)
}

fn default_max_channel_name_length() -> usize {
    256
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            event_capacity: default_event_capacity(),
            max_channel_name_length: default_max_channel_name_length(),
        }
    }
}

impl BrokerConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: BrokerConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Validate a channel or pattern name against this configuration.
    ///
    /// # Errors
    ///
    /// Returns an error message if the name is invalid.
    pub fn validate_channel_name(&self, name: &str) -> Result<(), &'static str> {
        if name.is_empty() {
            return Err("Channel name cannot be empty");
        }
        if name.len() > self.max_channel_name_length {
            return Err("Channel name too long");
        }
        if !name.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
            return Err("Channel name contains invalid characters");
        }
        Ok(())
    }
}
