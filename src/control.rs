// Control-IQ — automated basal adjustment. The algorithm is a pure function;
// the pump decides when to call it and what to do with the result.

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;
use crate::constants::*;
use crate::types::{ActivityMode, GlucoseLevel, InsulinUnits, TrendDirection};

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ControlSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_target_low")]
    pub target_low: GlucoseLevel,
    #[serde(default = "default_target_high")]
    pub target_high: GlucoseLevel,
    #[serde(default = "default_true")]
    pub hypo_prevention: bool,
    /// 1 (gentle) to 5 (aggressive)
    #[serde(default = "default_aggressiveness")]
    pub aggressiveness: u8,
    #[serde(default)]
    pub activity_mode: ActivityMode,
    /// Upper bound on the rate the control loop may set, u/hr
    #[serde(default = "default_max_basal")]
    pub max_basal_rate: InsulinUnits,
}

impl Default for ControlSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            target_low: default_target_low(),
            target_high: default_target_high(),
            hypo_prevention: true,
            aggressiveness: default_aggressiveness(),
            activity_mode: ActivityMode::Normal,
            max_basal_rate: default_max_basal(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_target_low() -> GlucoseLevel {
    5.5
}
fn default_target_high() -> GlucoseLevel {
    7.0
}
fn default_aggressiveness() -> u8 {
    3
}
fn default_max_basal() -> InsulinUnits {
    3.0
}

impl ControlSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=5).contains(&self.aggressiveness) {
            return Err(ConfigError::Invalid(format!(
                "control.aggressiveness must be 1-5, got {}",
                self.aggressiveness
            )));
        }
        if self.target_low <= 0.0 || self.target_low >= self.target_high {
            return Err(ConfigError::Invalid(format!(
                "control target range is empty: {:.1}-{:.1}",
                self.target_low, self.target_high
            )));
        }
        if self.max_basal_rate <= 0.0 || self.max_basal_rate > MAX_BASAL_RATE {
            return Err(ConfigError::Invalid(format!(
                "control.max_basal_rate must be in (0, {}]",
                MAX_BASAL_RATE
            )));
        }
        Ok(())
    }

    /// Level 1 -> 0.6, level 3 -> 1.0, level 5 -> 1.4.
    pub fn aggressiveness_factor(&self) -> f64 {
        0.6 + (self.aggressiveness.clamp(1, 5) as f64 - 1.0) * 0.2
    }

    /// Clamp a proposed rate to what the control loop is allowed to set.
    pub fn cap_rate(&self, rate: InsulinUnits) -> InsulinUnits {
        rate.clamp(0.0, self.max_basal_rate.min(MAX_BASAL_RATE))
    }

    /// `basal_delta` against this configuration's own target range.
    pub fn delta(
        &self,
        glucose: GlucoseLevel,
        trend: TrendDirection,
        current_basal: InsulinUnits,
        iob: InsulinUnits,
    ) -> f64 {
        basal_delta(
            glucose,
            trend,
            current_basal,
            self.target_low,
            self.target_high,
            iob,
            self,
        )
    }
}

/// Change to apply to the current basal rate, in u/hr. First match wins:
/// hypo suspend, below range, above range (tiered), then in-range fine tuning.
/// IOB is accepted for interface stability but does not change the result.
pub fn basal_delta(
    glucose: GlucoseLevel,
    trend: TrendDirection,
    current_basal: InsulinUnits,
    target_low: GlucoseLevel,
    target_high: GlucoseLevel,
    _iob: InsulinUnits,
    settings: &ControlSettings,
) -> f64 {
    if glucose < GLUCOSE_SUSPEND {
        return -current_basal;
    }
    if glucose < target_low {
        return -0.5 * current_basal;
    }
    if glucose > target_high {
        let excess = glucose - target_high;
        let fraction = if excess > 5.0 {
            0.5
        } else if excess > 2.5 {
            0.3
        } else {
            0.15
        };
        return fraction * current_basal;
    }

    let mut adjustment = match settings.activity_mode {
        ActivityMode::Normal => 0.0,
        ActivityMode::Sleep => -0.05 * current_basal,
        ActivityMode::Exercise => -0.2 * current_basal,
    };
    adjustment += match trend {
        TrendDirection::RisingQuickly => 0.2 * current_basal,
        TrendDirection::Rising => 0.1 * current_basal,
        TrendDirection::FallingQuickly => -0.2 * current_basal,
        TrendDirection::Falling => -0.1 * current_basal,
        TrendDirection::Stable | TrendDirection::Unknown => 0.0,
    };
    adjustment *= settings.aggressiveness_factor();
    if settings.hypo_prevention && adjustment < 0.0 {
        adjustment *= 0.7;
    }
    adjustment
}

/// Human-readable description of an applied adjustment, used for the Info alert.
pub fn describe_adjustment(delta: f64, new_rate: InsulinUnits) -> String {
    let direction = if delta > 0.0 { "increased" } else { "decreased" };
    format!("Control-IQ {} basal rate to {:.2} u/hr", direction, new_rate)
}
