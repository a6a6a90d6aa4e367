use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::Result;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 8673;
const DEFAULT_RECONNECT_DELAY_MS: u64 = 160;

/// Client configuration.
///
/// `reconnect_delay` is the linear backoff unit in milliseconds: the n-th
/// reconnection attempt is scheduled `reconnect_delay * n` after the
/// disconnection. `max_connection_attempts` and `max_errors` both treat
/// zero as "no ceiling".
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    /// Log per-command round-trip latency at debug level.
    pub debug: bool,
    pub reconnect_delay: u64,
    pub max_connection_attempts: u32,
    pub max_errors: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            debug: false,
            reconnect_delay: DEFAULT_RECONNECT_DELAY_MS,
            max_connection_attempts: 0,
            max_errors: 0,
        }
    }
}

impl ClientConfig {
    /// Load a configuration from a YAML file. Missing keys fall back to
    /// their defaults.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        let config = serde_yaml::from_str(&raw)?;
        Ok(config)
    }

    pub(crate) fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Delay before the reconnection attempt following `attempts` tries.
    pub(crate) fn backoff(&self, attempts: u32) -> Duration {
        Duration::from_millis(self.reconnect_delay * u64::from(attempts))
    }
}
