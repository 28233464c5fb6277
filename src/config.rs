use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::TrackStatsError;
use crate::logging::LogConfig;

/// Speeds around this value are a receiver error code, not a measurement
pub const RECEIVER_ERROR_SPEED_MPS: f64 = 128.0;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Application metadata
    #[serde(default)]
    pub metadata: ConfigMetadata,

    /// Aggregation thresholds
    #[serde(default)]
    pub statistics: StatisticsSettings,

    /// Point store location and paging
    #[serde(default)]
    pub store: StoreSettings,

    #[serde(default)]
    pub logging: LogConfig,
}

/// Configuration metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigMetadata {
    /// Configuration format version
    pub version: String,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last modification timestamp
    pub updated_at: DateTime<Utc>,
}

/// Tuning of the statistics aggregator
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatisticsSettings {
    /// A sample is moving when its speed is at or above this value (m/s)
    pub moving_speed_threshold_mps: f64,

    /// Number of altitude samples averaged before extremes and gain are derived
    pub altitude_smoothing_window: usize,

    /// Speed changes implying a larger acceleration (m/s²) are not taken as max speed
    pub max_acceleration_mps2: f64,
}

impl Default for StatisticsSettings {
    fn default() -> Self {
        Self {
            // about 0.8 km/h
            moving_speed_threshold_mps: 0.224,
            altitude_smoothing_window: 25,
            // roughly 2 g
            max_acceleration_mps2: 19.6,
        }
    }
}

impl StatisticsSettings {
    pub fn validate(&self) -> std::result::Result<(), TrackStatsError> {
        if !self.moving_speed_threshold_mps.is_finite() || self.moving_speed_threshold_mps < 0.0 {
            return Err(TrackStatsError::Configuration(format!(
                "moving_speed_threshold_mps must be a non-negative number, got {}",
                self.moving_speed_threshold_mps
            )));
        }
        if self.altitude_smoothing_window == 0 {
            return Err(TrackStatsError::Configuration(
                "altitude_smoothing_window must be at least 1".to_string(),
            ));
        }
        if !(self.max_acceleration_mps2 > 0.0) {
            return Err(TrackStatsError::Configuration(format!(
                "max_acceleration_mps2 must be positive, got {}",
                self.max_acceleration_mps2
            )));
        }
        Ok(())
    }
}

/// Point store settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    /// SQLite database file
    pub database_path: PathBuf,

    /// Rows fetched per page when iterating track points
    pub page_size: usize,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            database_path: data_dir().join("tracks.db"),
            page_size: 2000,
        }
    }
}

fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".trackstats")
}

impl Default for ConfigMetadata {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            version: "1.0".to_string(),
            created_at: now,
            updated_at: now,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            metadata: ConfigMetadata::default(),
            statistics: StatisticsSettings::default(),
            store: StoreSettings::default(),
            logging: LogConfig::default(),
        }
    }
}

/// Configuration management implementation
impl AppConfig {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: AppConfig = toml::from_str(&content)
            .with_context(|| "Failed to parse TOML configuration")?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        self.metadata.updated_at = Utc::now();

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;
        }

        let toml_content = toml::to_string_pretty(self)
            .with_context(|| "Failed to serialize configuration to TOML")?;

        fs::write(&path, toml_content)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;

        Ok(())
    }

    /// Get default configuration file path
    pub fn default_config_path() -> PathBuf {
        data_dir().join("config.toml")
    }

    /// Load configuration, using defaults only when the file does not exist.
    ///
    /// An unreadable or invalid file is an error.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        let config_path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(Self::default_config_path);

        if !config_path.exists() {
            return Ok(Self::default());
        }
        Self::load_from_file(&config_path)
    }

    pub fn validate(&self) -> std::result::Result<(), TrackStatsError> {
        self.statistics.validate()?;
        if self.store.page_size == 0 {
            return Err(TrackStatsError::Configuration(
                "page_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
