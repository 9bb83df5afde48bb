//! Configuration for the swarm and the bundled `mplex` transport.
//!
//! Every field has a default, so an empty TOML document is a valid
//! configuration:
//!
//! ```toml
//! [swarm]
//! idle_timeout_ms = 30000
//! gc_interval_ms = 1000
//!
//! [mplex]
//! max_data_size = 16384
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::transport::mplex::MAX_DATA_SIZE;

/// Default interval between idle-connection sweeps.
pub const DEFAULT_GC_INTERVAL_MS: u64 = 1000;

/// Top-level configuration document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub swarm: SwarmConfig,
    pub mplex: MplexConfig,
}

impl Config {
    /// Parse a configuration from TOML text.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Read and parse a TOML configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }
}

/// Swarm behaviour knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SwarmConfig {
    /// Close connections that have carried no streams for this long.
    /// `None` disables idle reclamation.
    pub idle_timeout_ms: Option<u64>,

    /// How often the idle reaper sweeps the connection set.
    pub gc_interval_ms: u64,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: None,
            gc_interval_ms: DEFAULT_GC_INTERVAL_MS,
        }
    }
}

impl SwarmConfig {
    /// Enable idle reclamation with the given timeout and sweep interval.
    pub fn with_idle_timeout(mut self, timeout: Duration, gc_interval: Duration) -> Self {
        self.idle_timeout_ms = Some(timeout.as_millis() as u64);
        self.gc_interval_ms = gc_interval.as_millis() as u64;
        self
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_ms.map(Duration::from_millis)
    }

    /// Sweep interval, never shorter than one millisecond.
    pub fn gc_interval(&self) -> Duration {
        Duration::from_millis(self.gc_interval_ms.max(1))
    }
}

/// Settings for [`MplexTransport`](crate::transport::mplex::MplexTransport).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MplexConfig {
    /// Largest payload carried by one data frame. Clamped to the wire maximum.
    pub max_data_size: usize,
}

impl Default for MplexConfig {
    fn default() -> Self {
        Self {
            max_data_size: MAX_DATA_SIZE,
        }
    }
}

impl MplexConfig {
    /// Effective frame payload size: within `1..=MAX_DATA_SIZE`.
    pub fn data_size(&self) -> usize {
        self.max_data_size.clamp(1, MAX_DATA_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.swarm.idle_timeout(), None);
        assert_eq!(config.swarm.gc_interval(), Duration::from_secs(1));
        assert_eq!(config.mplex.data_size(), MAX_DATA_SIZE);
    }

    #[test]
    fn test_parse_full_document() {
        let config = Config::from_toml_str(
            r#"
            [swarm]
            idle_timeout_ms = 500
            gc_interval_ms = 100

            [mplex]
            max_data_size = 1024
            "#,
        )
        .unwrap();

        assert_eq!(config.swarm.idle_timeout(), Some(Duration::from_millis(500)));
        assert_eq!(config.swarm.gc_interval(), Duration::from_millis(100));
        assert_eq!(config.mplex.data_size(), 1024);
    }

    #[test]
    fn test_data_size_is_clamped() {
        let config = MplexConfig {
            max_data_size: usize::MAX,
        };
        assert_eq!(config.data_size(), MAX_DATA_SIZE);

        let config = MplexConfig { max_data_size: 0 };
        assert_eq!(config.data_size(), 1);
    }

    #[test]
    fn test_invalid_document() {
        let err = Config::from_toml_str("[swarm]\ngc_interval_ms = \"soon\"").unwrap_err();
        assert!(matches!(err, crate::Error::Config(_)));
    }

    #[test]
    fn test_with_idle_timeout() {
        let config = SwarmConfig::default()
            .with_idle_timeout(Duration::from_millis(250), Duration::from_millis(50));
        assert_eq!(config.idle_timeout(), Some(Duration::from_millis(250)));
        assert_eq!(config.gc_interval(), Duration::from_millis(50));
    }
}
