//! Configuration file support for Barpath.
//!
//! Configuration is loaded from `$XDG_CONFIG_HOME/barpath/config.toml`.
//! Every field has a default, so a partial file (or none) is fine.

use crate::calibration::FormBreakdownPolicy;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Application configuration
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub data: DataConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub calibration: CalibrationConfig,

    #[serde(default)]
    pub recovery: RecoveryConfig,
}

/// Data storage configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DataConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Optional JSON plan library replacing the built-in one
    #[serde(default)]
    pub plan_file: Option<PathBuf>,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            plan_file: None,
        }
    }
}

/// Live session behaviour
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Edit modes close after this long without interaction
    #[serde(default = "default_edit_idle_timeout_seconds")]
    pub edit_idle_timeout_seconds: u64,

    /// Used for bodyweight volume
    #[serde(default = "default_body_weight")]
    pub body_weight: f64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            edit_idle_timeout_seconds: default_edit_idle_timeout_seconds(),
            body_weight: default_body_weight(),
        }
    }
}

/// Calibration protocol parameters
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CalibrationConfig {
    #[serde(default = "default_target_rir")]
    pub target_rir: u8,

    #[serde(default = "default_adjustment_per_rir_percent")]
    pub adjustment_per_rir_percent: f64,

    #[serde(default = "default_form_breakdown_reduction_percent")]
    pub form_breakdown_reduction_percent: f64,

    #[serde(default)]
    pub form_breakdown_policy: FormBreakdownPolicy,

    /// How many loads to offer during load selection
    #[serde(default = "default_candidate_count")]
    pub candidate_count: usize,

    #[serde(default = "default_max_rir")]
    pub max_rir: u8,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            target_rir: default_target_rir(),
            adjustment_per_rir_percent: default_adjustment_per_rir_percent(),
            form_breakdown_reduction_percent: default_form_breakdown_reduction_percent(),
            form_breakdown_policy: FormBreakdownPolicy::default(),
            candidate_count: default_candidate_count(),
            max_rir: default_max_rir(),
        }
    }
}

/// Checkpoint handling
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Checkpoints older than this are discarded instead of offered
    #[serde(default = "default_max_checkpoint_age_hours")]
    pub max_checkpoint_age_hours: i64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_checkpoint_age_hours: default_max_checkpoint_age_hours(),
        }
    }
}

/// One day
pub const MAX_EDIT_IDLE_TIMEOUT_SECONDS: u64 = 86_400;

/// One year
pub const MAX_CHECKPOINT_AGE_HOURS: i64 = 24 * 365;

// Default value functions
fn default_data_dir() -> PathBuf {
    let base = dirs::data_local_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join(".local/share")))
        .unwrap_or_else(|| PathBuf::from("."));
    base.join("barpath")
}

fn default_tick_interval_ms() -> u64 {
    1000
}

fn default_edit_idle_timeout_seconds() -> u64 {
    10
}

fn default_body_weight() -> f64 {
    75.0
}

fn default_target_rir() -> u8 {
    2
}

fn default_adjustment_per_rir_percent() -> f64 {
    2.5
}

fn default_form_breakdown_reduction_percent() -> f64 {
    10.0
}

fn default_candidate_count() -> usize {
    5
}

fn default_max_rir() -> u8 {
    10
}

fn default_max_checkpoint_age_hours() -> i64 {
    24
}

impl Config {
    /// Load configuration from the standard config path
    pub fn load() -> Result<Self> {
        let config_path = Self::default_config_path();
        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            tracing::info!(
                "No config file found at {:?}, using defaults",
                config_path
            );
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        tracing::info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Reject values the session cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.session.tick_interval_ms == 0 {
            return Err(Error::Config("session.tick_interval_ms must be positive".into()));
        }
        if self.calibration.target_rir > self.calibration.max_rir {
            return Err(Error::Config(format!(
                "calibration.target_rir ({}) exceeds calibration.max_rir ({})",
                self.calibration.target_rir, self.calibration.max_rir
            )));
        }
        if !(0.0..100.0).contains(&self.calibration.form_breakdown_reduction_percent) {
            return Err(Error::Config(
                "calibration.form_breakdown_reduction_percent must be in [0, 100)".into(),
            ));
        }
        if self.session.edit_idle_timeout_seconds > MAX_EDIT_IDLE_TIMEOUT_SECONDS {
            return Err(Error::Config(format!(
                "session.edit_idle_timeout_seconds must be at most {}",
                MAX_EDIT_IDLE_TIMEOUT_SECONDS
            )));
        }
        if !(1..=MAX_CHECKPOINT_AGE_HOURS).contains(&self.recovery.max_checkpoint_age_hours) {
            return Err(Error::Config(format!(
                "recovery.max_checkpoint_age_hours must be in [1, {}]",
                MAX_CHECKPOINT_AGE_HOURS
            )));
        }
        Ok(())
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        let base = dirs::config_dir()
            .or_else(|| dirs::home_dir().map(|home| home.join(".config")))
            .unwrap_or_else(|| PathBuf::from("."));
        base.join("barpath").join("config.toml")
    }

    /// Save the current configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, contents)?;
        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    pub fn tick_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.session.tick_interval_ms)
    }
}
