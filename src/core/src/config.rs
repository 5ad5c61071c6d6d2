use crate::error::{OciError, Result};
use crate::log::LogConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Store configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Run garbage collection when a modified layout is closed
    pub gc: bool,

    /// Maintain the fallback-tag referrer index when a manifest with a subject is put
    pub referrers_on_put: bool,

    /// Transfer admission settings
    pub transfer: TransferConfig,

    /// Logging
    pub log: LogConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            gc: true,
            referrers_on_put: true,
            transfer: TransferConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl StoreConfig {
    /// Parse a YAML (or JSON, which is valid YAML) document.
    pub fn from_yaml_str(s: &str) -> Result<Self> {
        let config: StoreConfig = serde_yaml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a file; `.json` is parsed as JSON, anything else as YAML.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            OciError::ConfigError(format!("Failed to read {}: {}", path.display(), e))
        })?;

        let config: StoreConfig = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&content)?,
            _ => serde_yaml::from_str(&content)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the store cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.transfer.max_concurrent == 0 {
            return Err(OciError::ConfigError(
                "transfer.max_concurrent must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Transfer admission configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Maximum concurrently active transfers per store
    pub max_concurrent: usize,

    /// Release order for queued transfers
    pub order: QueueOrder,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            order: QueueOrder::ManifestsFirst,
        }
    }
}

/// Release order of queued entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueOrder {
    /// Oldest queued entry first
    Fifo,

    /// Manifests before blobs, oldest first within each group
    ManifestsFirst,
}
