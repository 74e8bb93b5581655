//! Pump configuration store.
//!
//! Everything the simulated pump would otherwise read from ambient settings
//! (speed factor, Control-IQ tuning, alert thresholds, reminders, data
//! directory) lives in one [`PumpConfig`] that is injected at construction.
//!
//! ```toml
//! [simulation]
//! speed_factor = 30
//! seed = 42
//!
//! [control]
//! target_low = 5.5
//! target_high = 7.0
//! aggressiveness = 3
//!
//! [alerts]
//! low_glucose = 3.9
//! urgent_low_glucose = 3.1
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub use crate::error::ConfigError;

use crate::alerts::AlertThresholds;
use crate::control::ControlSettings;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PumpConfig {
    #[serde(default)]
    pub simulation: SimulationConfig,
    #[serde(default)]
    pub control: ControlSettings,
    #[serde(default)]
    pub alerts: AlertThresholds,
    #[serde(default)]
    pub bolus: BolusConfig,
    #[serde(default)]
    pub reminders: Vec<Reminder>,
}

impl PumpConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.simulation.speed_factor == 0 {
            return Err(ConfigError::Invalid("speed_factor must be at least 1".into()));
        }
        if self.bolus.max_units <= 0.0 || self.bolus.max_units > crate::constants::MAX_BOLUS {
            return Err(ConfigError::Invalid(format!(
                "bolus.max_units must be in (0, {}]",
                crate::constants::MAX_BOLUS
            )));
        }
        self.control.validate()?;
        self.alerts.validate()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SimulationConfig {
    /// Simulated seconds per wall-clock second
    #[serde(default = "default_speed_factor")]
    pub speed_factor: u32,
    /// RNG seed; `None` seeds from the clock
    #[serde(default)]
    pub seed: Option<u64>,
    /// Hours of synthetic history generated on a cold start
    #[serde(default = "default_history_hours")]
    pub history_hours: u32,
    /// Directory holding the persisted JSON files
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            speed_factor: default_speed_factor(),
            seed: None,
            history_hours: default_history_hours(),
            data_dir: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BolusConfig {
    #[serde(default = "default_max_bolus")]
    pub max_units: f64,
}

impl Default for BolusConfig {
    fn default() -> Self {
        Self {
            max_units: default_max_bolus(),
        }
    }
}

/// A scheduled user reminder (site change, BG check, ...).
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Reminder {
    pub kind: String,
    pub due: DateTime<Utc>,
    #[serde(default)]
    pub acknowledged: bool,
}

fn default_speed_factor() -> u32 {
    30
}
fn default_history_hours() -> u32 {
    48
}
fn default_max_bolus() -> f64 {
    crate::constants::MAX_BOLUS
}

/// Load a pump configuration from a TOML file and validate it.
pub fn load_config(path: &str) -> Result<PumpConfig, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let config: PumpConfig = toml::from_str(&content)?;
    config.validate()?;
    Ok(config)
}
