//! Updater configuration
//!
//! Timeouts and replug windows default to the values the modem stack has
//! always used; the JSON form exists so field deployments can stretch them
//! for slow hubs without a rebuild.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, UpdateError};

/// Tunables shared by every component of an update attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdaterConfig {
    /// Per-write and per-read deadline on the AT port
    pub at_timeout_ms: u64,

    /// Window for the modem to drop off the bus and re-enumerate after a fastboot detach
    pub fastboot_remove_delay_ms: u64,

    /// Window for the modem to be re-probed by the management service after attach
    pub reprobe_remove_delay_ms: u64,

    /// Hex-dump every buffer written to or read from the device
    pub verbose: bool,

    /// Leading part of the flashing manifest filename inside a bundle
    pub manifest_prefix: String,

    /// Trailing part of the flashing manifest filename inside a bundle
    pub manifest_suffix: String,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            at_timeout_ms: 1500,
            fastboot_remove_delay_ms: 10_000,
            reprobe_remove_delay_ms: 45_000,
            verbose: false,
            manifest_prefix: "rawprogram".to_string(),
            manifest_suffix: ".xml".to_string(),
        }
    }
}

impl UpdaterConfig {
    /// Parse and validate a JSON configuration
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|e| UpdateError::Config(format!("invalid updater config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| UpdateError::io(format!("reading {}", path.display()), e))?;
        Self::from_json_str(&raw)
    }

    /// Reject configurations that cannot describe a working update
    pub fn validate(&self) -> Result<()> {
        if self.at_timeout_ms == 0 {
            return Err(UpdateError::Config("at_timeout_ms must be non-zero".to_string()));
        }
        if self.fastboot_remove_delay_ms == 0 {
            return Err(UpdateError::Config(
                "fastboot_remove_delay_ms must be non-zero".to_string(),
            ));
        }
        // Re-probing a full management stack is slower than a raw USB re-plug.
        if self.reprobe_remove_delay_ms <= self.fastboot_remove_delay_ms {
            return Err(UpdateError::Config(format!(
                "reprobe_remove_delay_ms ({}) must exceed fastboot_remove_delay_ms ({})",
                self.reprobe_remove_delay_ms, self.fastboot_remove_delay_ms
            )));
        }
        if self.manifest_prefix.is_empty() && self.manifest_suffix.is_empty() {
            return Err(UpdateError::Config(
                "manifest_prefix and manifest_suffix cannot both be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn at_timeout(&self) -> Duration {
        Duration::from_millis(self.at_timeout_ms)
    }

    pub fn fastboot_remove_delay(&self) -> Duration {
        Duration::from_millis(self.fastboot_remove_delay_ms)
    }

    pub fn reprobe_remove_delay(&self) -> Duration {
        Duration::from_millis(self.reprobe_remove_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() -> Result<()> {
        let config = UpdaterConfig::default();
        config.validate()?;
        assert_eq!(config.at_timeout(), Duration::from_millis(1500));
        assert!(config.reprobe_remove_delay() > config.fastboot_remove_delay());
        Ok(())
    }

    #[test]
    fn test_partial_json_uses_defaults() -> Result<()> {
        let config = UpdaterConfig::from_json_str(r#"{ "verbose": true, "at_timeout_ms": 3000 }"#)?;
        assert!(config.verbose);
        assert_eq!(config.at_timeout_ms, 3000);
        assert_eq!(config.reprobe_remove_delay_ms, 45_000);
        assert_eq!(config.manifest_prefix, "rawprogram");
        Ok(())
    }

    #[test]
    fn test_reprobe_window_must_exceed_fastboot_window() {
        let result = UpdaterConfig::from_json_str(
            r#"{ "fastboot_remove_delay_ms": 60000, "reprobe_remove_delay_ms": 45000 }"#,
        );
        assert!(matches!(result, Err(UpdateError::Config(_))));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let config = UpdaterConfig {
            at_timeout_ms: 0,
            ..UpdaterConfig::default()
        };
        assert!(matches!(config.validate(), Err(UpdateError::Config(_))));
    }

    #[test]
    fn test_malformed_json_is_config_error() {
        let result = UpdaterConfig::from_json_str("{ not json");
        assert!(matches!(result, Err(UpdateError::Config(_))));
    }

    #[test]
    fn test_load_from_file() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("updater.json");
        std::fs::write(&path, r#"{ "manifest_prefix": "firehose-rawprogram" }"#)?;
        let config = UpdaterConfig::load(&path)?;
        assert_eq!(config.manifest_prefix, "firehose-rawprogram");
        Ok(())
    }
}
