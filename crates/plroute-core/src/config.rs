//! Engine configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RouteError};

/// Tunables for the routing engine and its node connections.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound on a single reactor wait (ms). Interrupts are checked
    /// between waits.
    pub poll_interval_ms: u64,
    /// TCP connect and startup handshake timeout (ms).
    pub connect_timeout_ms: u64,
    /// Largest node count accepted for a cluster.
    pub max_nodes: usize,
    /// Reported to nodes in the startup packet.
    pub application_name: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            connect_timeout_ms: 10_000,
            max_nodes: 100,
            application_name: "plroute".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(RouteError::Config(
                "poll_interval_ms must be > 0".to_string(),
            ));
        }
        if self.connect_timeout_ms == 0 {
            return Err(RouteError::Config(
                "connect_timeout_ms must be > 0".to_string(),
            ));
        }
        if self.max_nodes == 0 {
            return Err(RouteError::Config("max_nodes must be > 0".to_string()));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}
