//! Alert engine: threshold evaluation, alert lifecycle and the event log.
//!
//! Evaluators are pure predicates that turn a reading into an [`AlertCheck`]
//! with a fixed message template. [`AlertEngine::raise`] deduplicates by
//! message against the active set, so re-evaluating the same condition on
//! every tick yields one active alert until it is acknowledged.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ConfigError;
use crate::constants::*;
use crate::types::{Alert, AlertLevel, AlertSource, EventRecord, GlucoseLevel, InsulinUnits, TrendDirection};

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct AlertThresholds {
    #[serde(default = "default_low_glucose")]
    pub low_glucose: GlucoseLevel,
    #[serde(default = "default_urgent_low_glucose")]
    pub urgent_low_glucose: GlucoseLevel,
    #[serde(default = "default_high_glucose")]
    pub high_glucose: GlucoseLevel,
    #[serde(default = "default_urgent_high_glucose")]
    pub urgent_high_glucose: GlucoseLevel,
    #[serde(default = "default_low_insulin")]
    pub low_insulin: InsulinUnits,
    #[serde(default = "default_critical_insulin")]
    pub critical_insulin: InsulinUnits,
    #[serde(default = "default_low_battery")]
    pub low_battery: u8,
    #[serde(default = "default_critical_battery")]
    pub critical_battery: u8,
}

fn default_low_glucose() -> GlucoseLevel {
    3.9
}
fn default_urgent_low_glucose() -> GlucoseLevel {
    3.1
}
fn default_high_glucose() -> GlucoseLevel {
    10.0
}
fn default_urgent_high_glucose() -> GlucoseLevel {
    13.9
}
fn default_low_insulin() -> InsulinUnits {
    50.0
}
fn default_critical_insulin() -> InsulinUnits {
    10.0
}
fn default_low_battery() -> u8 {
    20
}
fn default_critical_battery() -> u8 {
    5
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            low_glucose: default_low_glucose(),
            urgent_low_glucose: default_urgent_low_glucose(),
            high_glucose: default_high_glucose(),
            urgent_high_glucose: default_urgent_high_glucose(),
            low_insulin: default_low_insulin(),
            critical_insulin: default_critical_insulin(),
            low_battery: default_low_battery(),
            critical_battery: default_critical_battery(),
        }
    }
}

impl AlertThresholds {
    /// Urgent thresholds must be strictly more extreme than their warning pair.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.urgent_low_glucose < self.low_glucose
            && self.low_glucose < self.high_glucose
            && self.high_glucose < self.urgent_high_glucose)
        {
            return Err(ConfigError::Invalid(format!(
                "glucose thresholds must satisfy urgent_low < low < high < urgent_high, got {} / {} / {} / {}",
                self.urgent_low_glucose, self.low_glucose, self.high_glucose, self.urgent_high_glucose
            )));
        }
        if !(0.0 <= self.critical_insulin && self.critical_insulin < self.low_insulin) {
            return Err(ConfigError::Invalid(format!(
                "insulin thresholds must satisfy 0 <= critical < low, got {} / {}",
                self.critical_insulin, self.low_insulin
            )));
        }
        if !(self.critical_battery < self.low_battery && self.low_battery <= BATTERY_FULL) {
            return Err(ConfigError::Invalid(format!(
                "battery thresholds must satisfy critical < low <= 100, got {} / {}",
                self.critical_battery, self.low_battery
            )));
        }
        Ok(())
    }
}

/// Outcome of a threshold evaluator: what would be raised.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertCheck {
    pub message: String,
    pub level: AlertLevel,
    pub source: AlertSource,
}

impl AlertCheck {
    fn new(message: String, level: AlertLevel, source: AlertSource) -> Self {
        Self {
            message,
            level,
            source,
        }
    }
}

pub fn evaluate_glucose(glucose: GlucoseLevel, t: &AlertThresholds) -> Option<AlertCheck> {
    let (message, level) = if glucose <= t.urgent_low_glucose {
        (format!("URGENT LOW GLUCOSE: {:.1} mmol/L", glucose), AlertLevel::Critical)
    } else if glucose < t.low_glucose {
        (format!("Low glucose: {:.1} mmol/L", glucose), AlertLevel::Warning)
    } else if glucose >= t.urgent_high_glucose {
        (format!("URGENT HIGH GLUCOSE: {:.1} mmol/L", glucose), AlertLevel::Critical)
    } else if glucose > t.high_glucose {
        (format!("High glucose: {:.1} mmol/L", glucose), AlertLevel::Warning)
    } else {
        return None;
    };
    Some(AlertCheck::new(message, level, AlertSource::Glucose))
}

pub fn evaluate_trend(trend: TrendDirection) -> Option<AlertCheck> {
    let message = match trend {
        TrendDirection::RisingQuickly => "Glucose rising quickly",
        TrendDirection::FallingQuickly => "Glucose falling quickly",
        _ => return None,
    };
    Some(AlertCheck::new(message.to_string(), AlertLevel::Warning, AlertSource::Glucose))
}

pub fn evaluate_insulin(remaining: InsulinUnits, t: &AlertThresholds) -> Option<AlertCheck> {
    let (message, level) = if remaining <= t.critical_insulin {
        (
            format!("INSULIN CRITICALLY LOW: {:.1} units remaining", remaining),
            AlertLevel::Critical,
        )
    } else if remaining <= t.low_insulin {
        (format!("Insulin low: {:.1} units remaining", remaining), AlertLevel::Warning)
    } else {
        return None;
    };
    Some(AlertCheck::new(message, level, AlertSource::Insulin))
}

pub fn evaluate_battery(level: u8, t: &AlertThresholds) -> Option<AlertCheck> {
    let (message, severity) = if level <= t.critical_battery {
        (format!("BATTERY CRITICALLY LOW: {}% remaining", level), AlertLevel::Critical)
    } else if level <= t.low_battery {
        (format!("Battery low: {}% remaining", level), AlertLevel::Warning)
    } else {
        return None;
    };
    Some(AlertCheck::new(message, severity, AlertSource::Battery))
}

/// More than ten minutes without a CGM reading.
pub fn evaluate_cgm_gap(last_reading: DateTime<Utc>, now: DateTime<Utc>) -> Option<AlertCheck> {
    let gap = (now - last_reading).num_seconds();
    if gap <= CGM_GAP_SECS {
        return None;
    }
    Some(AlertCheck::new(
        format!("CGM data gap: No readings for {} minutes", gap / 60),
        AlertLevel::Warning,
        AlertSource::Glucose,
    ))
}

/// A bolus still in flight two minutes past its expected duration
/// (the extended duration, or one minute for a standard bolus).
pub fn evaluate_bolus_overrun(
    started: DateTime<Utc>,
    extended: bool,
    duration_minutes: u32,
    now: DateTime<Utc>,
) -> Option<AlertCheck> {
    let expected = if extended { duration_minutes as i64 } else { 1 };
    if (now - started).num_seconds() <= (expected + 2) * 60 {
        return None;
    }
    Some(AlertCheck::new(
        "Bolus delivery taking longer than expected".to_string(),
        AlertLevel::Warning,
        AlertSource::Bolus,
    ))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    AutoRecoverable,
    RequiresManualIntervention,
}

/// Fixed recovery table. Only CGM connectivity problems and interrupted
/// boluses clear themselves; Critical alerts never do.
pub fn classify_recovery(alert: &Alert) -> Recovery {
    if alert.level == AlertLevel::Critical {
        return Recovery::RequiresManualIntervention;
    }
    let m = alert.message.as_str();
    match alert.source {
        AlertSource::Glucose if m.contains("CGM connection lost") || m.starts_with("CGM data gap") => {
            Recovery::AutoRecoverable
        }
        AlertSource::Bolus if m.contains("Bolus interrupted") => Recovery::AutoRecoverable,
        _ => Recovery::RequiresManualIntervention,
    }
}

pub fn recovery_instructions(alert: &Alert) -> &'static str {
    let m = alert.message.as_str();
    match alert.source {
        AlertSource::Glucose if m.contains("CGM") => {
            "Check CGM sensor connection and move pump closer to sensor."
        }
        AlertSource::Pump if m.contains("OCCLUSION") => {
            "Check infusion set for kinks or blockages. Replace infusion set if necessary."
        }
        AlertSource::Bolus if m.contains("Bolus interrupted") => {
            "Restart bolus delivery if needed. Check insulin reservoir."
        }
        AlertSource::Battery => "Connect pump to charger immediately.",
        _ => match alert.level {
            AlertLevel::Info => "No action required.",
            AlertLevel::Warning => "Acknowledge the warning and monitor the situation.",
            AlertLevel::Error => "Review pump settings and status. Contact support if problem persists.",
            AlertLevel::Critical => "Stop using the pump and contact support immediately.",
        },
    }
}

/// Owns the active alert set, the capped alert history and the event log.
#[derive(Debug, Clone)]
pub struct AlertEngine {
    thresholds: AlertThresholds,
    enabled: bool,
    active: Vec<Alert>,
    history: VecDeque<Alert>,
    events: VecDeque<EventRecord>,
    next_id: u64,
}

impl AlertEngine {
    pub fn new(thresholds: AlertThresholds) -> Self {
        Self {
            thresholds,
            enabled: true,
            active: Vec::new(),
            history: VecDeque::new(),
            events: VecDeque::new(),
            next_id: 1,
        }
    }

    /// Rebuild from persisted alerts. Ids continue after the largest seen.
    pub fn restore(
        thresholds: AlertThresholds,
        active: Vec<Alert>,
        history: Vec<Alert>,
        events: Vec<EventRecord>,
    ) -> Self {
        let next_id = active
            .iter()
            .chain(history.iter())
            .map(|a| a.id)
            .max()
            .unwrap_or(0)
            + 1;
        let mut engine = Self {
            thresholds,
            enabled: true,
            active: active.into_iter().filter(|a| !a.acknowledged).collect(),
            history: history.into_iter().collect(),
            events: events.into_iter().collect(),
            next_id,
        };
        engine.trim();
        engine
    }

    pub fn thresholds(&self) -> &AlertThresholds {
        &self.thresholds
    }

    pub fn set_thresholds(&mut self, thresholds: AlertThresholds) -> Result<(), ConfigError> {
        thresholds.validate()?;
        self.thresholds = thresholds;
        Ok(())
    }

    /// Disabling only silences the threshold evaluators; explicit raises still land.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Raise an alert unless one with the same message is already active.
    /// Returns the new alert, or `None` for a duplicate.
    pub fn raise(
        &mut self,
        message: &str,
        level: AlertLevel,
        source: AlertSource,
        now: DateTime<Utc>,
    ) -> Option<Alert> {
        if self.is_active(message) {
            return None;
        }
        let alert = Alert {
            id: self.next_id,
            message: message.to_string(),
            level,
            source,
            timestamp: now,
            acknowledged: false,
        };
        self.next_id += 1;
        self.active.push(alert.clone());
        self.history.push_back(alert.clone());
        self.log_event(message, level, now);
        match level {
            AlertLevel::Critical | AlertLevel::Error => {
                tracing::warn!(id = alert.id, level = %level, "{}", message)
            }
            _ => tracing::info!(id = alert.id, level = %level, "{}", message),
        }
        self.trim();
        Some(alert)
    }

    pub fn raise_check(&mut self, check: AlertCheck, now: DateTime<Utc>) -> Option<Alert> {
        self.raise(&check.message, check.level, check.source, now)
    }

    /// Append to the event log without raising an alert.
    pub fn log_event(&mut self, message: &str, level: AlertLevel, now: DateTime<Utc>) {
        self.events.push_back(EventRecord {
            timestamp: now,
            message: message.to_string(),
            level,
        });
        while self.events.len() > ALERT_HISTORY_CAP {
            self.events.pop_front();
        }
    }

    pub fn acknowledge(&mut self, id: u64) -> bool {
        let Some(pos) = self.active.iter().position(|a| a.id == id) else {
            return false;
        };
        self.active.remove(pos);
        if let Some(entry) = self.history.iter_mut().find(|a| a.id == id) {
            entry.acknowledged = true;
        }
        true
    }

    /// Returns how many alerts were cleared.
    pub fn acknowledge_all(&mut self) -> usize {
        let cleared = self.active.len();
        for alert in self.active.drain(..) {
            if let Some(entry) = self.history.iter_mut().find(|a| a.id == alert.id) {
                entry.acknowledged = true;
            }
        }
        cleared
    }

    /// Clear an auto-recoverable alert. Manual-intervention alerts stay active.
    pub fn attempt_recovery(&mut self, id: u64, now: DateTime<Utc>) -> bool {
        let Some(alert) = self.active.iter().find(|a| a.id == id).cloned() else {
            return false;
        };
        if classify_recovery(&alert) != Recovery::AutoRecoverable {
            return false;
        }
        self.acknowledge(id);
        self.log_event(&format!("Recovered: {}", alert.message), AlertLevel::Info, now);
        true
    }

    pub fn find(&self, id: u64) -> Option<&Alert> {
        self.active
            .iter()
            .find(|a| a.id == id)
            .or_else(|| self.history.iter().find(|a| a.id == id))
    }

    pub fn is_active(&self, message: &str) -> bool {
        self.active.iter().any(|a| a.message == message)
    }

    pub fn active(&self) -> &[Alert] {
        &self.active
    }

    pub fn history(&self) -> impl Iterator<Item = &Alert> {
        self.history.iter()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn events(&self) -> impl Iterator<Item = &EventRecord> {
        self.events.iter()
    }

    pub fn has_critical_alerts(&self) -> bool {
        self.active.iter().any(|a| a.level == AlertLevel::Critical)
    }

    pub fn alerts_of_level(&self, level: AlertLevel) -> Vec<&Alert> {
        self.active.iter().filter(|a| a.level == level).collect()
    }

    /// Drop the active set, keeping history and the event log.
    pub fn clear_active(&mut self) {
        self.active.clear();
    }

    fn trim(&mut self) {
        while self.history.len() > ALERT_HISTORY_CAP {
            self.history.pop_front();
        }
        while self.events.len() > ALERT_HISTORY_CAP {
            self.events.pop_front();
        }
    }
}

impl Default for AlertEngine {
    fn default() -> Self {
        Self::new(AlertThresholds::default())
    }
}
