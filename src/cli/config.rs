use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::api::{modbus::ConnectionConfig, poll::PollConfigUpdate};

/// Monitor configuration file
///
/// ```toml
/// codes = ["P0B-00", "P0B-01"]
/// read_timeout_ms = 2000
///
/// [connection]
/// port = "/dev/ttyUSB0"
/// baud_rate = 115200
/// slave_id = 1
///
/// [poll]
/// watchdog_timeout_secs = 10
/// reconnect_delay_secs = 5
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub connection: Option<ConnectionConfig>,
    pub poll: PollConfigUpdate,
    /// Visible codes; empty means every catalog code
    pub codes: Vec<String>,
    /// Client-level exchange limit
    pub read_timeout_ms: Option<u64>,
}

impl MonitorConfig {
    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml(&text)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }
}
