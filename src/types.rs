// Types — canonical domain records shared by every component and by the
// persistence layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Blood glucose in mmol/L
pub type GlucoseLevel = f64;

/// Insulin amount in units (rates are units per hour)
pub type InsulinUnits = f64;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GlucoseReading {
    pub timestamp: DateTime<Utc>,
    pub value: GlucoseLevel,
}

/// Classification of the recent glucose rate of change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TrendDirection {
    RisingQuickly,
    Rising,
    #[default]
    Stable,
    Falling,
    FallingQuickly,
    Unknown,
}

impl TrendDirection {
    pub fn arrow(self) -> &'static str {
        match self {
            TrendDirection::RisingQuickly => "↑↑",
            TrendDirection::Rising => "↑",
            TrendDirection::Stable => "→",
            TrendDirection::Falling => "↓",
            TrendDirection::FallingQuickly => "↓↓",
            TrendDirection::Unknown => "?",
        }
    }
}

/// A stretch of basal delivery at one rate. `end` is `None` while the
/// segment is still running.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BasalSegment {
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub rate: InsulinUnits,
    pub profile_name: String,
    pub automatic: bool,
}

impl BasalSegment {
    pub fn is_open(&self) -> bool {
        self.end_time.is_none()
    }

    /// Units delivered by this segment inside `[start, end]`, treating an
    /// open segment as running until `now`.
    pub fn units_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> InsulinUnits {
        let seg_end = self.end_time.unwrap_or(now);
        let from = self.start_time.max(start);
        let to = seg_end.min(end);
        if to <= from {
            return 0.0;
        }
        let hours = (to - from).num_milliseconds() as f64 / 3_600_000.0;
        self.rate * hours
    }

    pub fn overlaps(&self, start: DateTime<Utc>, end: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        let seg_end = self.end_time.unwrap_or(now);
        self.start_time <= end && seg_end >= start
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BolusDelivery {
    pub timestamp: DateTime<Utc>,
    pub units: InsulinUnits,
    pub reason: String,
    pub extended: bool,
    /// Minutes; 0 for a standard bolus
    pub duration: u32,
    pub completed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub name: String,
    pub basal_rate: InsulinUnits,
    pub carb_ratio: f64,
    pub correction_factor: f64,
    pub target_glucose: GlucoseLevel,
}

impl Profile {
    pub fn new(
        name: &str,
        basal_rate: InsulinUnits,
        carb_ratio: f64,
        correction_factor: f64,
        target_glucose: GlucoseLevel,
    ) -> Self {
        Self {
            name: name.to_string(),
            basal_rate,
            carb_ratio,
            correction_factor,
            target_glucose,
        }
    }

    pub fn is_valid(&self) -> bool {
        !self.name.trim().is_empty()
            && self.basal_rate > 0.0
            && self.carb_ratio > 0.0
            && self.correction_factor > 0.0
            && self.target_glucose > 0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AlertLevel {
    Info,
    Warning,
    Error,
    Critical,
}

impl AlertLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertLevel::Info => "INFO",
            AlertLevel::Warning => "WARNING",
            AlertLevel::Error => "ERROR",
            AlertLevel::Critical => "CRITICAL",
        }
    }
}

/// Subsystem an alert originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AlertSource {
    Glucose,
    Insulin,
    Bolus,
    Battery,
    Pump,
    ControlIq,
    Reminder,
    TestHarness,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: u64,
    pub message: String,
    pub level: AlertLevel,
    pub source: AlertSource,
    pub timestamp: DateTime<Utc>,
    pub acknowledged: bool,
}

/// One line of the append-only event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub level: AlertLevel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PowerState {
    #[default]
    PoweredOff,
    PoweredOn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ActivityMode {
    #[default]
    Normal,
    Sleep,
    Exercise,
}

/// Why basal is held off while the pump is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SuspendReason {
    /// Held by the control loop until glucose recovers.
    LowGlucose,
    /// Held until the infusion set is replaced.
    Occlusion,
}

/// Device-level state owned by the pump.
#[derive(Debug, Clone, PartialEq)]
pub struct PumpState {
    pub battery_level: u8,
    pub insulin_remaining: InsulinUnits,
    pub insulin_on_board: InsulinUnits,
    pub running: bool,
    pub charging: bool,
    pub last_action: DateTime<Utc>,
    pub profile_name: String,
    pub last_control_delta: f64,
    pub suspend_reason: Option<SuspendReason>,
}

impl PumpState {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            battery_level: crate::constants::BATTERY_FULL,
            insulin_remaining: crate::constants::RESERVOIR_CAPACITY,
            insulin_on_board: 0.0,
            running: false,
            charging: false,
            last_action: now,
            profile_name: crate::constants::DEFAULT_PROFILE.to_string(),
            last_control_delta: 0.0,
            suspend_reason: None,
        }
    }

    pub fn power_state(&self) -> PowerState {
        if self.running {
            PowerState::PoweredOn
        } else {
            PowerState::PoweredOff
        }
    }
}

/// Notifications published to registered observers.
#[derive(Debug, Clone, PartialEq)]
pub enum PumpEvent {
    Started,
    Stopped,
    NewReading(GlucoseReading),
    TrendChanged(TrendDirection),
    BasalRateChanged(InsulinUnits),
    BolusStarted { units: InsulinUnits },
    BolusCompleted { units: InsulinUnits },
    BolusCancelled { delivered: InsulinUnits, requested: InsulinUnits },
    InsulinOnBoardChanged(InsulinUnits),
    ControlIqAdjusted { delta: f64, new_rate: InsulinUnits },
    BatteryLevelChanged(u8),
    ChargingChanged(bool),
    InsulinRemainingChanged(InsulinUnits),
    AlertRaised { id: u64, message: String, level: AlertLevel },
    CriticalAlert { message: String },
    ProfileChanged(String),
    ShutdownRequested,
}

/// Immutable view of the whole pump handed to collaborators.
#[derive(Debug, Clone, PartialEq)]
pub struct PumpSnapshot {
    pub now: DateTime<Utc>,
    pub running: bool,
    pub charging: bool,
    pub battery_level: u8,
    pub insulin_remaining: InsulinUnits,
    pub insulin_on_board: InsulinUnits,
    pub glucose: GlucoseLevel,
    pub trend: TrendDirection,
    pub last_reading_time: DateTime<Utc>,
    pub basal_active: bool,
    pub basal_rate: InsulinUnits,
    pub suspend_reason: Option<SuspendReason>,
    pub bolus_active: bool,
    pub active_profile: String,
    pub last_control_delta: f64,
    pub active_alerts: Vec<Alert>,
    pub alert_history_len: usize,
}

impl std::fmt::Display for TrendDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::fmt::Display for PowerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::fmt::Display for PumpSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "  time:               {}", self.now.to_rfc3339())?;
        writeln!(f, "  running:            {}", self.running)?;
        writeln!(
            f,
            "  battery:            {}%{}",
            self.battery_level,
            if self.charging { " (charging)" } else { "" }
        )?;
        writeln!(f, "  insulin_remaining:  {:.2} units", self.insulin_remaining)?;
        writeln!(f, "  insulin_on_board:   {:.2} units", self.insulin_on_board)?;
        writeln!(
            f,
            "  glucose:            {:.1} mmol/L {}",
            self.glucose,
            self.trend.arrow()
        )?;
        let held = match (self.basal_active, self.suspend_reason) {
            (true, _) => "",
            (false, Some(SuspendReason::Occlusion)) => " (suspended: occlusion)",
            (false, Some(SuspendReason::LowGlucose)) => " (suspended: low glucose)",
            (false, None) => " (suspended)",
        };
        writeln!(f, "  basal:              {:.2} u/hr{}", self.basal_rate, held)?;
        writeln!(f, "  bolus_active:       {}", self.bolus_active)?;
        writeln!(f, "  profile:            {}", self.active_profile)?;
        writeln!(f, "  control_iq_delta:   {:+.2} u/hr", self.last_control_delta)?;
        write!(
            f,
            "  alerts:             {} active / {} logged",
            self.active_alerts.len(),
            self.alert_history_len
        )
    }
}
