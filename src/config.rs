use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::accuracy::AccuracyConfig;
use crate::conflicts::ConflictConfig;
use crate::error::EngineError;
use crate::forecast::ForecastConfig;
use crate::jobs::JobConfig;
use crate::logging::LogConfig;
use crate::optimizer::OptimizerConfig;

/// Engine configuration. Every constant is a tunable default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub metadata: ConfigMetadata,

    #[serde(default)]
    pub forecast: ForecastConfig,

    #[serde(default)]
    pub accuracy: AccuracyConfig,

    #[serde(default)]
    pub conflicts: ConflictConfig,

    #[serde(default)]
    pub optimizer: OptimizerConfig,

    #[serde(default)]
    pub jobs: JobConfig,

    #[serde(default)]
    pub logging: LogConfig,
}

/// Configuration metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigMetadata {
    /// Configuration format version
    pub version: String,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl Default for ConfigMetadata {
    fn default() -> Self {
        let now = Utc::now();
        ConfigMetadata {
            version: "1".to_string(),
            created_at: now,
            updated_at: now,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            metadata: ConfigMetadata::default(),
            forecast: ForecastConfig::default(),
            accuracy: AccuracyConfig::default(),
            conflicts: ConflictConfig::default(),
            optimizer: OptimizerConfig::default(),
            jobs: JobConfig::default(),
            logging: LogConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: EngineConfig =
            toml::from_str(&content).with_context(|| "Failed to parse TOML configuration")?;

        config
            .validate()
            .with_context(|| format!("Invalid configuration in {}", path.as_ref().display()))?;
        Ok(config)
    }

    /// Save configuration to TOML file, stamping the modification time
    pub fn save_to_file<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        self.metadata.updated_at = Utc::now();

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let toml_content = toml::to_string_pretty(self)
            .with_context(|| "Failed to serialize configuration to TOML")?;

        fs::write(&path, toml_content)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;

        Ok(())
    }

    pub fn default_config_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".capacityrs")
            .join("config.toml")
    }

    /// Load `path` if it exists. `Ok(None)` means there is no file; a file
    /// that cannot be read, parsed or validated is an error.
    pub fn try_load<P: AsRef<Path>>(path: P) -> Result<Option<Self>> {
        if !path.as_ref().exists() {
            return Ok(None);
        }
        Self::load_from_file(path).map(Some)
    }

    /// [`EngineConfig::try_load`] at the default location. Hosts that install
    /// logging from the loaded config report the error once logging is up.
    pub fn try_load_default() -> Result<Option<Self>> {
        Self::try_load(Self::default_config_path())
    }

    pub fn save_default(&mut self) -> Result<PathBuf> {
        let config_path = Self::default_config_path();
        self.save_to_file(&config_path)?;
        Ok(config_path)
    }

    /// Reject values that cannot produce a meaningful engine
    pub fn validate(&self) -> std::result::Result<(), EngineError> {
        let invalid = |msg: String| Err(EngineError::Configuration(msg));
        let optimizer = &self.optimizer;

        if optimizer.allowed_start_hour >= optimizer.allowed_end_hour
            || optimizer.allowed_end_hour > 24
        {
            return invalid(format!(
                "allowed hours {}..{} are out of order",
                optimizer.allowed_start_hour, optimizer.allowed_end_hour
            ));
        }
        if optimizer.recovery_min_minutes <= 0
            || optimizer.recovery_min_minutes > optimizer.recovery_max_minutes
        {
            return invalid(format!(
                "recovery duration range {}..{} minutes is invalid",
                optimizer.recovery_min_minutes, optimizer.recovery_max_minutes
            ));
        }
        if !(optimizer.weights.total() > 0.0) {
            return invalid("scoring weights must sum to a positive value".to_string());
        }
        if optimizer.max_slots == 0 || optimizer.max_iterations == 0 {
            return invalid("slot search limits must be positive".to_string());
        }
        if self.conflicts.min_buffer_minutes < 0 {
            return invalid("minimum buffer must not be negative".to_string());
        }
        if self.conflicts.forecast_tolerance_minutes <= 0 || self.accuracy.tolerance_minutes <= 0 {
            return invalid("forecast matching tolerances must be positive".to_string());
        }
        if self.conflicts.daily_max_items == 0 {
            return invalid("daily item maximum must be positive".to_string());
        }
        if self.accuracy.window_size == 0 {
            return invalid("accuracy window must hold at least one score".to_string());
        }
        if self.forecast.max_horizon_hours == 0 {
            return invalid("maximum forecast horizon must be positive".to_string());
        }
        if self.jobs.reforecast_interval_hours <= 0 || self.jobs.accuracy_interval_hours <= 0 {
            return invalid("job intervals must be positive".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::LogLevel;
    use tempfile::tempdir;

    #[test]
    fn test_config_serialization() {
        let config = EngineConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let deserialized: EngineConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(config, deserialized);
        assert_eq!(deserialized.conflicts.min_buffer_minutes, 15);
        assert_eq!(deserialized.optimizer.weights.resource_match, 0.4);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("partial.toml");
        fs::write(
            &path,
            r#"
[metadata]
version = "1"
created_at = "2024-09-01T00:00:00Z"
updated_at = "2024-09-01T00:00:00Z"

[conflicts]
min_buffer_minutes = 10
daily_max_items = 5
daily_load_fraction = 1.5
deficit_high_threshold = 30.0
deficit_medium_threshold = 15.0
forecast_tolerance_minutes = 30
"#,
        )
        .unwrap();

        let config = EngineConfig::load_from_file(&path).unwrap();
        assert_eq!(config.conflicts.daily_max_items, 5);
        assert_eq!(config.optimizer, OptimizerConfig::default());
    }

    #[test]
    fn test_partial_logging_table_uses_defaults() {
        let config: EngineConfig = toml::from_str(
            r#"
[logging]
level = "debug"

[optimizer]
max_iterations = 200
"#,
        )
        .unwrap();

        assert_eq!(config.logging.level, LogLevel::Debug);
        assert_eq!(config.logging.format, LogConfig::default().format);
        assert!(config.logging.rotation);
        assert_eq!(config.optimizer.max_iterations, 200);
        assert_eq!(config.optimizer.allowed_start_hour, 8);
        assert_eq!(config.metadata.version, "1");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_try_load_reports_unusable_file() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("config.toml");
        assert!(EngineConfig::try_load(&path).unwrap().is_none());

        fs::write(&path, "[logging]\nlevel = \"loud\"\n").unwrap();
        let err = EngineConfig::try_load(&path).unwrap_err();
        assert!(err.to_string().contains("parse"));

        fs::write(&path, "[jobs]\nreforecast_interval_hours = 12\n").unwrap();
        let loaded = EngineConfig::try_load(&path).unwrap().unwrap();
        assert_eq!(loaded.jobs.reforecast_interval_hours, 12);
    }

    #[test]
    fn test_config_file_io() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("nested").join("config.toml");

        let mut original = EngineConfig::default();
        original.jobs.reforecast_interval_hours = 6;
        original.save_to_file(&config_path).unwrap();

        let loaded = EngineConfig::load_from_file(&config_path).unwrap();
        assert_eq!(loaded.jobs.reforecast_interval_hours, 6);
        assert!(loaded.metadata.updated_at >= original.metadata.created_at);
    }

    #[test]
    fn test_validation_rejects_inverted_hours() {
        let mut config = EngineConfig::default();
        config.optimizer.allowed_start_hour = 20;
        config.optimizer.allowed_end_hour = 8;
        assert!(matches!(
            config.validate(),
            Err(EngineError::Configuration(_))
        ));

        let mut config = EngineConfig::default();
        config.optimizer.recovery_min_minutes = 200;
        assert!(config.validate().is_err());

        assert!(EngineConfig::default().validate().is_ok());
    }
}
