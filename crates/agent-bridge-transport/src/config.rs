//! Bridge configuration.

use std::{net::SocketAddr, path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use agent_bridge_executor::DriverConfig;
use agent_bridge_session::RegistryConfig;

use crate::mirror::TranscriptMirror;

const DEFAULT_STREAM_FLUSH_MS: u64 = 50;
const DEFAULT_HISTORY_TIMEOUT_MS: u64 = 3_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Top-level bridge settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub listen: SocketAddr,
    pub drivers: DriverConfig,
    /// Stream batching window.
    pub stream_flush_ms: u64,
    /// Safety timeout for client-side initial history batching.
    pub history_timeout_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8787)),
            drivers: DriverConfig::default(),
            stream_flush_ms: DEFAULT_STREAM_FLUSH_MS,
            history_timeout_ms: DEFAULT_HISTORY_TIMEOUT_MS,
        }
    }
}

impl BridgeConfig {
    /// Parse TOML text.
    ///
    /// # Errors
    /// Returns error if the text is not valid config.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Load from `path`, or defaults if the file does not exist.
    ///
    /// # Errors
    /// Returns error if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&text)
    }

    #[must_use]
    pub const fn history_timeout(&self) -> Duration {
        Duration::from_millis(self.history_timeout_ms)
    }

    /// A client-side mirror that batches the initial history replay with the
    /// configured timeout.
    #[must_use]
    pub fn transcript_mirror(&self) -> TranscriptMirror {
        TranscriptMirror::new(self.history_timeout())
    }

    #[must_use]
    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            stream_flush: Duration::from_millis(self.stream_flush_ms),
            ..RegistryConfig::default()
        }
    }
}
