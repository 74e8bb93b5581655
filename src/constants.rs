// Constants — fixed limits and defaults of the simulated pump.

use crate::types::{GlucoseLevel, InsulinUnits};

// Glucose (mmol/L)
pub const GLUCOSE_DEFAULT: GlucoseLevel = 5.5;
pub const GLUCOSE_MIN: GlucoseLevel = 2.8;
pub const GLUCOSE_MAX: GlucoseLevel = 20.0;
pub const GLUCOSE_SUSPEND: GlucoseLevel = 3.9;
pub const GLUCOSE_RESUME: GlucoseLevel = 4.4;
pub const MAX_READINGS: usize = 288; // 24h at 5-minute cadence
pub const READING_INTERVAL_MINUTES: i64 = 5;

// Trend slope thresholds (mmol/L per second)
pub const TREND_QUICK: f64 = 0.05;
pub const TREND_SLOW: f64 = 0.02;

// Insulin limits
pub const MAX_BASAL_RATE: InsulinUnits = 5.0; // u/hr
pub const MAX_BOLUS: InsulinUnits = 25.0;
pub const RESERVOIR_CAPACITY: InsulinUnits = 300.0;
pub const EXTENDED_BOLUS_STEPS: u32 = 10;
pub const STANDARD_BOLUS_DELAY_SECS: i64 = 2;
pub const IOB_DURATION_HOURS: f64 = 4.0;
pub const IN_FLIGHT_IOB_FRACTION: f64 = 0.8;
pub const IOB_PUBLISH_EPSILON: f64 = 0.01;
pub const CONTROL_DEADBAND: f64 = 0.01;

// Battery
pub const BATTERY_FULL: u8 = 100;
pub const BATTERY_SHUTDOWN: u8 = 1;
pub const SHUTDOWN_DELAY_SECS: i64 = 3;
pub const CHARGE_STEP_SECS: i64 = 3;

// Alerts
pub const ALERT_HISTORY_CAP: usize = 1000;
pub const CGM_GAP_SECS: i64 = 600;
pub const OCCLUSION_ODDS: u32 = 1000;
pub const OCCLUSION_MESSAGE: &str = "OCCLUSION DETECTED: Check infusion set for blockages";

// Simulated tick periods (seconds of simulated time)
pub const BATTERY_PERIOD_SECS: i64 = 300;
pub const GLUCOSE_PERIOD_SECS: i64 = 300;
pub const IOB_PERIOD_SECS: i64 = 60;
pub const CONTROL_PERIOD_SECS: i64 = 300;
pub const RESERVOIR_PERIOD_SECS: i64 = 5;

// Real-time tick periods (seconds of wall time, unaffected by speed factor)
pub const REMINDER_PERIOD_SECS: i64 = 60;
pub const OCCLUSION_PERIOD_SECS: i64 = 60;

pub const DEFAULT_PROFILE: &str = "Default";
