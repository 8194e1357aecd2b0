//! Configuration for materialized view management.
//!
//! Two layers exist: [`ServerSettings`] holds server-wide limits that are
//! fixed for the lifetime of a process, and [`Settings`] holds the per-query
//! knobs carried by a [`QueryContext`](crate::context::QueryContext).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Server-wide settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Maximum number of materialized views reading from one source table.
    /// Zero means unlimited.
    pub max_materialized_views_count_for_table: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            max_materialized_views_count_for_table: 0,
        }
    }
}

impl ServerSettings {
    /// Create settings with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the dependent view limit per source table.
    pub fn with_max_materialized_views_count_for_table(mut self, limit: usize) -> Self {
        self.max_materialized_views_count_for_table = limit;
        self
    }

    /// Load settings from a JSON document. Missing keys keep their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Per-query settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// How long to wait for a table lock before giving up
    #[serde(with = "duration_secs")]
    pub lock_acquire_timeout: Duration,
    /// Preferred block size for reads
    pub max_block_size: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            lock_acquire_timeout: Duration::from_secs(120),
            max_block_size: 65_536,
        }
    }
}

impl Settings {
    /// Create settings with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the lock acquire timeout.
    pub fn with_lock_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.lock_acquire_timeout = timeout;
        self
    }

    /// Set the maximum block size.
    pub fn with_max_block_size(mut self, max_block_size: usize) -> Self {
        self.max_block_size = max_block_size;
        self
    }

    /// Load settings from a JSON document. Missing keys keep their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Configuration of an [`Engine`](crate::Engine).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub server: ServerSettings,
    /// Settings of statements the engine issues itself
    pub settings: Settings,
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_server_settings(mut self, server: ServerSettings) -> Self {
        self.server = server;
        self
    }

    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    /// Load a configuration from a JSON document with optional `server` and
    /// `settings` sections.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Durations are written as fractional seconds.
mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
