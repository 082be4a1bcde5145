//! Configuration for the posture agent.

use crate::device::types::DeviceAddress;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration for the posture agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address of the posture corrector, e.g. `D4:D4:DA:44:28:86`
    pub device_address: Option<String>,

    /// Bluetooth adapter to use (platform name). First adapter when unset.
    pub adapter: Option<String>,

    /// Path for day statistics and the activity log
    pub data_path: PathBuf,

    /// How long to scan for the peripheral before giving up
    #[serde(with = "duration_serde")]
    pub scan_timeout: Duration,

    /// Settings for `--simulate` runs
    pub simulation: SimulationConfig,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("posture-agent");

        Self {
            device_address: None,
            adapter: None,
            data_path: data_dir,
            scan_timeout: Duration::from_secs(15),
            simulation: SimulationConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from the default location.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration from `path`, falling back to defaults when the file
    /// does not exist.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&content).map_err(ConfigError::Parse)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to the default location.
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(self).map_err(ConfigError::Serialize)?;
        std::fs::write(path, content)?;

        Ok(())
    }

    /// Get the path to the configuration file.
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("posture-agent")
            .join("config.json")
    }

    /// Ensure all required directories exist.
    pub fn ensure_directories(&self) -> Result<(), ConfigError> {
        std::fs::create_dir_all(&self.data_path)?;
        Ok(())
    }

    /// File holding the day statistics.
    pub fn statistics_path(&self) -> PathBuf {
        self.data_path.join("day_statistics.json")
    }

    /// File holding the activity counters.
    pub fn activity_path(&self) -> PathBuf {
        self.data_path.join("activity.json")
    }

    /// Validate and store the device address in canonical form.
    pub fn set_device_address(&mut self, address: &str) -> Result<DeviceAddress, ConfigError> {
        let parsed: DeviceAddress = address
            .parse()
            .map_err(|_| ConfigError::InvalidAddress(address.to_string()))?;
        self.device_address = Some(parsed.to_string());
        Ok(parsed)
    }
}

/// Behaviour of the simulated peripheral.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Time between simulated posture reports
    #[serde(with = "duration_serde")]
    pub interval: Duration,

    /// Share of time the simulated wearer spends hunched (0.0 to 1.0)
    pub hunched_ratio: f64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3),
            hunched_ratio: 0.3,
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[source] serde_json::Error),
    #[error("Serialize error: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("Invalid device address: {0}")]
    InvalidAddress(String),
}

/// Serde support for Duration.
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.scan_timeout, Duration::from_secs(15));
        assert!(config.device_address.is_none());
        assert!(config.statistics_path().ends_with("day_statistics.json"));
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("config.json")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let mut config = Config::default();
        config.set_device_address("d4-d4-da-44-28-86").unwrap();
        config.simulation.interval = Duration::from_secs(1);
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.device_address.as_deref(), Some("D4:D4:DA:44:28:86"));
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "scan_timeout": 30 }"#).unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.scan_timeout, Duration::from_secs(30));
        assert_eq!(config.simulation, SimulationConfig::default());
    }

    #[test]
    fn test_rejects_bad_address() {
        let mut config = Config::default();
        let err = config.set_device_address("D4:D4").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidAddress(_)));
        assert!(config.device_address.is_none());
    }
}
