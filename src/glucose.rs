//! Bounded CGM history and trend classification.

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Timelike, Utc};
use rand::Rng;

use crate::constants::*;
use crate::types::{GlucoseLevel, GlucoseReading, TrendDirection};

/// The last 24 hours of glucose readings plus the derived trend.
#[derive(Debug, Clone, Default)]
pub struct GlucoseSeries {
    readings: VecDeque<GlucoseReading>,
    trend: TrendDirection,
}

impl GlucoseSeries {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a series from persisted data. Readings are re-sorted and capped;
    /// the stored trend is kept as-is.
    pub fn restore(mut readings: Vec<GlucoseReading>, trend: TrendDirection) -> Self {
        readings.sort_by_key(|r| r.timestamp);
        let skip = readings.len().saturating_sub(MAX_READINGS);
        Self {
            readings: readings.into_iter().skip(skip).collect(),
            trend,
        }
    }

    /// Append a reading, evict beyond capacity and recompute the trend.
    /// Returns the new trend.
    pub fn add_reading(&mut self, value: GlucoseLevel, timestamp: DateTime<Utc>) -> TrendDirection {
        self.readings.push_back(GlucoseReading { timestamp, value });
        while self.readings.len() > MAX_READINGS {
            self.readings.pop_front();
        }
        self.recompute_trend();
        self.trend
    }

    /// Replace the series with `hours` of synthetic 5-minute readings ending at `now`.
    pub fn generate_synthetic_window(&mut self, hours: u32, now: DateTime<Utc>, rng: &mut impl Rng) {
        self.readings.clear();
        let start = now - Duration::hours(hours as i64);
        let mut timestamp = start;
        while timestamp <= now {
            let elapsed_hours = (timestamp - start).num_seconds() as f64 / 3600.0;
            let noise = (rng.gen::<f64>() - 0.5) * 0.4;
            let value = (synthetic_value(elapsed_hours, hour_of_day(timestamp)) + noise)
                .clamp(GLUCOSE_MIN, GLUCOSE_MAX);
            self.readings.push_back(GlucoseReading { timestamp, value });
            timestamp += Duration::minutes(READING_INTERVAL_MINUTES);
        }
        while self.readings.len() > MAX_READINGS {
            self.readings.pop_front();
        }
        self.recompute_trend();
    }

    pub fn clear(&mut self) {
        self.readings.clear();
        self.trend = TrendDirection::Unknown;
    }

    pub fn trend(&self) -> TrendDirection {
        self.trend
    }

    /// Test/override hook; the next reading recomputes the trend again.
    pub fn force_trend(&mut self, trend: TrendDirection) {
        self.trend = trend;
    }

    pub fn current_value(&self) -> GlucoseLevel {
        self.readings.back().map_or(GLUCOSE_DEFAULT, |r| r.value)
    }

    pub fn last_reading_time(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.readings.back().map_or(now, |r| r.timestamp)
    }

    pub fn latest(&self) -> Option<&GlucoseReading> {
        self.readings.back()
    }

    /// Readings with `start <= timestamp <= end`.
    pub fn readings(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<GlucoseReading> {
        self.readings
            .iter()
            .filter(|r| r.timestamp >= start && r.timestamp <= end)
            .copied()
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &GlucoseReading> {
        self.readings.iter()
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    fn recompute_trend(&mut self) {
        let recent: Vec<GlucoseReading> = self
            .readings
            .iter()
            .skip(self.readings.len().saturating_sub(3))
            .copied()
            .collect();
        self.trend = classify_trend(&recent);
    }
}

/// Least-squares slope (mmol/L per second) of the given readings.
/// `None` when fewer than two distinct timestamps are present.
pub fn slope(readings: &[GlucoseReading]) -> Option<f64> {
    let first = readings.first()?.timestamp;
    let n = readings.len() as f64;
    let (mut sum_x, mut sum_y, mut sum_xy, mut sum_x2) = (0.0, 0.0, 0.0, 0.0);
    for r in readings {
        let x = (r.timestamp - first).num_milliseconds() as f64 / 1000.0;
        sum_x += x;
        sum_y += r.value;
        sum_xy += x * r.value;
        sum_x2 += x * x;
    }
    let denom = n * sum_x2 - sum_x * sum_x;
    if denom.abs() < f64::EPSILON {
        return None;
    }
    Some((n * sum_xy - sum_x * sum_y) / denom)
}

/// Trend of the last three readings. Fewer than three readings is Stable.
pub fn classify_trend(readings: &[GlucoseReading]) -> TrendDirection {
    if readings.len() < 3 {
        return TrendDirection::Stable;
    }
    let recent = &readings[readings.len() - 3..];
    match slope(recent) {
        Some(s) if s > TREND_QUICK => TrendDirection::RisingQuickly,
        Some(s) if s > TREND_SLOW => TrendDirection::Rising,
        Some(s) if s < -TREND_QUICK => TrendDirection::FallingQuickly,
        Some(s) if s < -TREND_SLOW => TrendDirection::Falling,
        _ => TrendDirection::Stable,
    }
}

fn hour_of_day(t: DateTime<Utc>) -> f64 {
    t.hour() as f64 + t.minute() as f64 / 60.0 + t.second() as f64 / 3600.0
}

/// Triangular spike over `[start_hour, start_hour + 2)`, peaking at the midpoint.
fn meal_spike(hour_of_day: f64, start_hour: f64, peak: f64) -> f64 {
    let progress = (hour_of_day - start_hour) / 2.0;
    if !(0.0..1.0).contains(&progress) {
        return 0.0;
    }
    if progress < 0.5 {
        peak * progress * 2.0
    } else {
        peak * (1.0 - progress) * 2.0
    }
}

/// Noise-free synthetic curve: a 3-hour sine around 7.0 plus meal spikes at
/// 07:00, 12:00 and 18:00.
pub fn synthetic_value(elapsed_hours: f64, hour_of_day: f64) -> GlucoseLevel {
    let base = 7.0 + 3.0 * (elapsed_hours / 3.0 * 2.0 * std::f64::consts::PI).sin();
    let meals = meal_spike(hour_of_day, 7.0, 4.0)
        + meal_spike(hour_of_day, 12.0, 4.5)
        + meal_spike(hour_of_day, 18.0, 5.0);
    base + meals
}

/// Typical glucose for an hour of the day, used when no recent history exists.
pub fn time_of_day_baseline(hour: u32) -> GlucoseLevel {
    match hour {
        3..=6 => 7.0,
        7..=9 => 8.5,
        10..=11 => 6.0,
        12..=14 => 9.0,
        15..=17 => 5.5,
        18..=20 => 8.0,
        _ => 6.5,
    }
}

/// The next simulated CGM value: continue from the last hour of readings with
/// a small wobble, or fall back to the time-of-day baseline.
pub fn next_reading(series: &GlucoseSeries, now: DateTime<Utc>, rng: &mut impl Rng) -> GlucoseLevel {
    let recent = series.readings(now - Duration::hours(1), now);
    let value = match recent.last() {
        Some(last) => last.value + (rng.gen::<f64>() - 0.5) * 0.3,
        None => time_of_day_baseline(now.hour()) + (rng.gen::<f64>() - 0.5),
    };
    value.clamp(GLUCOSE_MIN, GLUCOSE_MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, VirtualClock};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn reading(t0: DateTime<Utc>, secs: i64, value: f64) -> GlucoseReading {
        GlucoseReading {
            timestamp: t0 + Duration::seconds(secs),
            value,
        }
    }

    #[test]
    fn test_empty_series_defaults() {
        let now = VirtualClock::at_epoch().now();
        let series = GlucoseSeries::new();
        assert_eq!(series.current_value(), 5.5);
        assert_eq!(series.last_reading_time(now), now);
        assert_eq!(series.trend(), TrendDirection::Stable);
    }

    #[test]
    fn test_add_reading_caps_history() {
        let t0 = VirtualClock::at_epoch().now();
        let mut series = GlucoseSeries::new();
        for i in 0..300 {
            series.add_reading(6.0, t0 + Duration::minutes(5 * i));
        }
        assert_eq!(series.len(), MAX_READINGS);
        assert_eq!(series.iter().next().unwrap().timestamp, t0 + Duration::minutes(5 * 12));
    }

    #[test]
    fn test_fewer_than_three_is_stable_and_clear_is_unknown() {
        let t0 = VirtualClock::at_epoch().now();
        let mut series = GlucoseSeries::new();
        assert_eq!(series.add_reading(5.0, t0), TrendDirection::Stable);
        assert_eq!(series.add_reading(15.0, t0 + Duration::seconds(10)), TrendDirection::Stable);
        series.clear();
        assert_eq!(series.trend(), TrendDirection::Unknown);
        assert!(series.is_empty());
    }

    #[test]
    fn test_classify_trend_thresholds() {
        let t0 = VirtualClock::at_epoch().now();
        // slope = 0.06 per second
        let quick = [reading(t0, 0, 5.0), reading(t0, 10, 5.6), reading(t0, 20, 6.2)];
        assert_eq!(classify_trend(&quick), TrendDirection::RisingQuickly);
        // slope = 0.03
        let rising = [reading(t0, 0, 5.0), reading(t0, 10, 5.3), reading(t0, 20, 5.6)];
        assert_eq!(classify_trend(&rising), TrendDirection::Rising);
        let falling = [reading(t0, 0, 5.6), reading(t0, 10, 5.3), reading(t0, 20, 5.0)];
        assert_eq!(classify_trend(&falling), TrendDirection::Falling);
        let plunging = [reading(t0, 0, 6.2), reading(t0, 10, 5.6), reading(t0, 20, 5.0)];
        assert_eq!(classify_trend(&plunging), TrendDirection::FallingQuickly);
        let flat = [reading(t0, 0, 5.0), reading(t0, 300, 5.1), reading(t0, 600, 5.2)];
        assert_eq!(classify_trend(&flat), TrendDirection::Stable);
    }

    #[test]
    fn test_classify_trend_ignores_input_order() {
        let t0 = VirtualClock::at_epoch().now();
        let a = [reading(t0, 0, 5.0), reading(t0, 10, 5.3), reading(t0, 20, 5.6)];
        let b = [a[2], a[0], a[1]];
        assert_eq!(classify_trend(&a), classify_trend(&b));
    }

    #[test]
    fn test_identical_timestamps_are_stable() {
        let t0 = VirtualClock::at_epoch().now();
        let same = [reading(t0, 0, 4.0), reading(t0, 0, 9.0), reading(t0, 0, 14.0)];
        assert_eq!(classify_trend(&same), TrendDirection::Stable);
    }

    #[test]
    fn test_synthetic_window_shape() {
        let now = VirtualClock::at_epoch().now();
        let mut rng = StdRng::seed_from_u64(3);
        let mut series = GlucoseSeries::new();
        series.generate_synthetic_window(6, now, &mut rng);
        // 6h at 5-minute cadence, both ends inclusive
        assert_eq!(series.len(), 73);
        assert!(series.iter().all(|r| (GLUCOSE_MIN..=GLUCOSE_MAX).contains(&r.value)));
        assert_eq!(series.latest().unwrap().timestamp, now);
    }

    #[test]
    fn test_synthetic_window_deterministic_for_seed() {
        let now = VirtualClock::at_epoch().now();
        let mut a = GlucoseSeries::new();
        let mut b = GlucoseSeries::new();
        a.generate_synthetic_window(24, now, &mut StdRng::seed_from_u64(11));
        b.generate_synthetic_window(24, now, &mut StdRng::seed_from_u64(11));
        let va: Vec<f64> = a.iter().map(|r| r.value).collect();
        let vb: Vec<f64> = b.iter().map(|r| r.value).collect();
        assert_eq!(va, vb);
    }

    #[test]
    fn test_meal_spikes_peak_mid_window() {
        assert!((meal_spike(8.0, 7.0, 4.0) - 4.0).abs() < 1e-9);
        assert_eq!(meal_spike(6.9, 7.0, 4.0), 0.0);
        assert_eq!(meal_spike(9.0, 7.0, 4.0), 0.0);
        assert!((meal_spike(19.5, 18.0, 5.0) - 2.5).abs() < 1e-9);
    }

    #[test]
    fn test_next_reading_without_history_uses_baseline() {
        let now = VirtualClock::at_epoch().now(); // 00:00 -> 6.5 baseline
        let series = GlucoseSeries::new();
        let value = next_reading(&series, now, &mut StdRng::seed_from_u64(1));
        assert!((6.0..=7.0).contains(&value));
    }

    #[test]
    fn test_restore_sorts_and_caps() {
        let t0 = VirtualClock::at_epoch().now();
        let mut raw: Vec<GlucoseReading> = (0..400).map(|i| reading(t0, i * 300, 6.0)).collect();
        raw.reverse();
        let series = GlucoseSeries::restore(raw, TrendDirection::Rising);
        assert_eq!(series.len(), MAX_READINGS);
        assert_eq!(series.trend(), TrendDirection::Rising);
        assert_eq!(series.latest().unwrap().timestamp, t0 + Duration::seconds(399 * 300));
    }
}
