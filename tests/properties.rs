//! Property-based tests for the pure dosing and alerting functions.

use chrono::Duration;
use proptest::prelude::*;

use closed_loop_pump::alerts::{evaluate_glucose, AlertThresholds};
use closed_loop_pump::calculator::suggested_bolus;
use closed_loop_pump::clock::{Clock, VirtualClock};
use closed_loop_pump::constants::*;
use closed_loop_pump::control::{basal_delta, ControlSettings};
use closed_loop_pump::insulin::{bolus_iob, clamp_rate};
use closed_loop_pump::scheduler::{EventQueue, Task};
use closed_loop_pump::types::*;

fn trend_strategy() -> impl Strategy<Value = TrendDirection> {
    prop_oneof![
        Just(TrendDirection::RisingQuickly),
        Just(TrendDirection::Rising),
        Just(TrendDirection::Stable),
        Just(TrendDirection::Falling),
        Just(TrendDirection::FallingQuickly),
        Just(TrendDirection::Unknown),
    ]
}

fn activity_strategy() -> impl Strategy<Value = ActivityMode> {
    prop_oneof![
        Just(ActivityMode::Normal),
        Just(ActivityMode::Sleep),
        Just(ActivityMode::Exercise),
    ]
}

proptest! {
    // Property: clamped rates stay inside pump limits and clamping twice changes nothing
    #[test]
    fn test_clamp_rate_bounded_and_idempotent(rate in -100.0f64..100.0) {
        let once = clamp_rate(rate);
        prop_assert!((0.0..=MAX_BASAL_RATE).contains(&once));
        prop_assert_eq!(clamp_rate(once), once);
    }

    // Property: below the suspend threshold the loop always removes the whole basal
    #[test]
    fn test_hypo_cuts_all_basal(
        glucose in GLUCOSE_MIN..GLUCOSE_SUSPEND,
        basal in 0.0f64..5.0,
        trend in trend_strategy(),
        mode in activity_strategy(),
        level in 1u8..=5,
    ) {
        let settings = ControlSettings { activity_mode: mode, aggressiveness: level, ..ControlSettings::default() };
        let delta = basal_delta(glucose, trend, basal, 5.5, 7.0, 0.0, &settings);
        prop_assert!((delta + basal).abs() < 1e-12);
    }

    // Property: above range the loop only ever adds insulin, by at most half the basal
    #[test]
    fn test_above_range_increases(
        glucose in 7.01f64..20.0,
        basal in 0.1f64..5.0,
        trend in trend_strategy(),
    ) {
        let delta = basal_delta(glucose, trend, basal, 5.5, 7.0, 0.0, &ControlSettings::default());
        prop_assert!(delta > 0.0);
        prop_assert!(delta <= 0.5 * basal + 1e-12);
    }

    // Property: the proposed rate after capping never exceeds the configured maximum
    #[test]
    fn test_capped_rate_within_control_limit(
        glucose in GLUCOSE_MIN..GLUCOSE_MAX,
        basal in 0.1f64..5.0,
        trend in trend_strategy(),
    ) {
        let settings = ControlSettings::default();
        let delta = settings.delta(glucose, trend, basal, 0.0);
        let rate = settings.cap_rate(basal + delta);
        prop_assert!(rate >= 0.0 && rate <= settings.max_basal_rate);
    }

    // Property: IOB from a single bolus decays monotonically and never exceeds the dose
    #[test]
    fn test_bolus_iob_monotone(units in 0.0f64..25.0, a in 0.0f64..5.0, b in 0.0f64..5.0) {
        let (early, late) = if a <= b { (a, b) } else { (b, a) };
        let iob_early = bolus_iob(units, early);
        let iob_late = bolus_iob(units, late);
        prop_assert!(iob_late <= iob_early + 1e-12);
        prop_assert!(iob_early <= units + 1e-12);
        prop_assert!(iob_late >= 0.0);
    }

    // Property: the calculator suggestion is always within [0, max]
    #[test]
    fn test_suggestion_bounded(
        glucose in GLUCOSE_MIN..GLUCOSE_MAX,
        carbs in 0.0f64..300.0,
        iob in 0.0f64..20.0,
    ) {
        let profile = Profile::new("Default", 1.0, 10.0, 2.0, 5.5);
        let units = suggested_bolus(glucose, carbs, &profile, iob, MAX_BOLUS);
        prop_assert!((0.0..=MAX_BOLUS).contains(&units));
    }

    // Property: readings inside the alert band never raise a glucose alert
    #[test]
    fn test_in_band_glucose_is_quiet(glucose in 3.9f64..=10.0) {
        prop_assert!(evaluate_glucose(glucose, &AlertThresholds::default()).is_none());
    }

    // Property: the queue hands out entries in non-decreasing due order
    #[test]
    fn test_queue_pops_in_time_order(offsets in prop::collection::vec(0i64..10_000, 1..50)) {
        let t0 = VirtualClock::at_epoch().now();
        let mut queue = EventQueue::new();
        for (i, ms) in offsets.iter().enumerate() {
            queue.schedule_at(t0 + Duration::milliseconds(*ms), Task::BolusStep { bolus_id: i as u64 });
        }
        let mut last = t0;
        let mut count = 0;
        while let Some(entry) = queue.pop_due(t0 + Duration::seconds(10)) {
            prop_assert!(entry.due >= last);
            last = entry.due;
            count += 1;
        }
        prop_assert_eq!(count, offsets.len());
    }
}
