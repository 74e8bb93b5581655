// Safety invariants — checked against a pump snapshot after every step.

use crate::constants::*;
use crate::types::*;

/// The reservoir never goes negative or above capacity.
pub fn reservoir_within_capacity(s: &PumpSnapshot) -> bool {
    (0.0..=RESERVOIR_CAPACITY).contains(&s.insulin_remaining)
}

pub fn battery_within_range(s: &PumpSnapshot) -> bool {
    s.battery_level <= BATTERY_FULL
}

pub fn basal_within_limit(s: &PumpSnapshot) -> bool {
    (0.0..=MAX_BASAL_RATE).contains(&s.basal_rate)
}

pub fn iob_non_negative(s: &PumpSnapshot) -> bool {
    s.insulin_on_board >= 0.0
}

/// basalActive implies running
pub fn basal_only_when_running(s: &PumpSnapshot) -> bool {
    !s.basal_active || s.running
}

/// bolusActive implies running
pub fn bolus_only_when_running(s: &PumpSnapshot) -> bool {
    !s.bolus_active || s.running
}

/// A suspended or stopped basal delivers nothing.
pub fn inactive_basal_is_zero(s: &PumpSnapshot) -> bool {
    s.basal_active || s.basal_rate == 0.0
}

/// An occluded set delivers no basal until it is replaced.
pub fn occlusion_holds_basal(s: &PumpSnapshot) -> bool {
    s.suspend_reason != Some(SuspendReason::Occlusion) || !s.basal_active
}

pub fn glucose_in_sensor_range(s: &PumpSnapshot) -> bool {
    (GLUCOSE_MIN..=GLUCOSE_MAX).contains(&s.glucose)
}

pub fn active_alerts_unacknowledged(s: &PumpSnapshot) -> bool {
    s.active_alerts.iter().all(|a| !a.acknowledged)
}

/// No two active alerts share a message.
pub fn active_alerts_deduplicated(s: &PumpSnapshot) -> bool {
    s.active_alerts
        .iter()
        .enumerate()
        .all(|(i, a)| s.active_alerts[i + 1..].iter().all(|b| b.message != a.message))
}

pub fn alert_history_capped(s: &PumpSnapshot) -> bool {
    s.alert_history_len <= ALERT_HISTORY_CAP
}

/// All individual invariants with names for reporting.
pub const ALL_INVARIANTS: &[(&str, fn(&PumpSnapshot) -> bool)] = &[
    ("reservoirWithinCapacity", reservoir_within_capacity),
    ("batteryWithinRange", battery_within_range),
    ("basalWithinLimit", basal_within_limit),
    ("iobNonNegative", iob_non_negative),
    ("basalOnlyWhenRunning", basal_only_when_running),
    ("bolusOnlyWhenRunning", bolus_only_when_running),
    ("inactiveBasalIsZero", inactive_basal_is_zero),
    ("occlusionHoldsBasal", occlusion_holds_basal),
    ("glucoseInSensorRange", glucose_in_sensor_range),
    ("activeAlertsUnacknowledged", active_alerts_unacknowledged),
    ("activeAlertsDeduplicated", active_alerts_deduplicated),
    ("alertHistoryCapped", alert_history_capped),
];

pub fn safety_invariant(s: &PumpSnapshot) -> bool {
    ALL_INVARIANTS.iter().all(|(_, check)| check(s))
}

/// Check all invariants and return the name of the first violated one, if any.
pub fn check_invariants(s: &PumpSnapshot) -> Result<(), &'static str> {
    for (name, check) in ALL_INVARIANTS {
        if !check(s) {
            return Err(name);
        }
    }
    Ok(())
}
