//! Pool configuration.
//!
//! Parsed from TOML; every field except the pool name has a default, so a
//! minimal file is just `name = "my-pool"`.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::PoolError;

/// Configuration for one pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Pool name; identifies the pool in logs, the registry, and stats.
    pub name: String,

    /// Number of workers started by `start_pool`.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Default timeout for synchronous submissions, in milliseconds.
    /// `0` means no deadline.
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,

    /// Port for the JSON stats endpoint; absent = disabled.
    #[serde(default)]
    pub stats_port: Option<u16>,
}

fn default_workers() -> usize {
    100
}

fn default_call_timeout_ms() -> u64 {
    5_000
}

impl PoolConfig {
    /// Config with default settings for the given pool name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            workers: default_workers(),
            call_timeout_ms: default_call_timeout_ms(),
            stats_port: None,
        }
    }

    /// The default sync-submission timeout; `None` when configured as `0`.
    pub fn call_timeout(&self) -> Option<Duration> {
        match self.call_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(raw: &str) -> Result<Self, PoolError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML config file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, PoolError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    /// Check the invariants a usable config must satisfy.
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.name.trim().is_empty() {
            return Err(PoolError::Config("pool name must not be empty".into()));
        }
        if self.workers == 0 {
            return Err(PoolError::Config(format!(
                "pool {} must have at least one worker",
                self.name
            )));
        }
        Ok(())
    }
}
