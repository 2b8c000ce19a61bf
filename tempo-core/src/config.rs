//! Runtime Configuration
//!
//! Configuration is plain data with serde support so hosts can ship it
//! alongside the rest of their settings. Every field has a default, so an
//! empty JSON object is a valid configuration.
//!
//! ```rust,ignore
//! let config = RuntimeConfig::from_json(r#"{ "pool": { "max": 64 } }"#)?;
//! let runtime = Runtime::with_config(config);
//! ```

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Top-level runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Sizing of the storage pools used for opcode lists and tracking frames.
    pub pool: PoolConfig,

    /// Emit a warning when a destroyed cell is updated.
    pub warn_on_destroyed_update: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            warn_on_destroyed_update: true,
        }
    }
}

impl RuntimeConfig {
    /// Parse a configuration from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        Ok(config.normalized())
    }

    /// Clamp values that would make the pools unusable.
    fn normalized(mut self) -> Self {
        if self.pool.initial > self.pool.max {
            self.pool.initial = self.pool.max;
        }
        self
    }
}

/// Retention bounds for an adaptive storage pool.
///
/// A pool starts out keeping at most `initial` released items. Whenever it
/// runs dry more often than it is refilled, the retention limit doubles,
/// never exceeding `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub initial: usize,
    pub max: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            initial: 16,
            max: 1024,
        }
    }
}
