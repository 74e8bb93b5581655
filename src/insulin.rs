//! Insulin delivery: the basal state machine, the single-bolus sub-machine,
//! IOB bookkeeping and delivery history.
//!
//! Nothing in here schedules anything. Operations report what changed and the
//! pump turns that into events and queue entries. A bolus is advanced by
//! [`InsulinDelivery::advance_bolus`], which the pump calls when a step falls
//! due; stale steps from an earlier bolus are recognised by their id and
//! ignored.

use chrono::{DateTime, Duration, NaiveTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::constants::*;
use crate::error::PumpError;
use crate::types::{BasalSegment, BolusDelivery, InsulinUnits, Profile};

#[derive(Debug, Clone, PartialEq)]
pub enum BasalState {
    Inactive,
    /// The open segment; `end_time` is `None`.
    Active(BasalSegment),
}

/// A bolus that has started but not finished.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InFlightBolus {
    pub id: u64,
    pub delivery: BolusDelivery,
    pub steps_done: u32,
    pub delivered: InsulinUnits,
}

impl InFlightBolus {
    pub fn step_units(&self) -> InsulinUnits {
        if self.delivery.extended {
            self.delivery.units / EXTENDED_BOLUS_STEPS as f64
        } else {
            self.delivery.units
        }
    }

    pub fn total_steps(&self) -> u32 {
        if self.delivery.extended {
            EXTENDED_BOLUS_STEPS
        } else {
            1
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum BolusState {
    #[default]
    Idle,
    InFlight(InFlightBolus),
    Completed(BolusDelivery),
    Cancelled(BolusDelivery),
}

/// Result of a due bolus step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BolusProgress {
    /// Part of an extended bolus went in; more steps follow.
    Step { delivered: InsulinUnits },
    Completed { units: InsulinUnits },
}

/// Where an accepted bolus' steps fall, for the scheduler.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BolusPlan {
    pub id: u64,
    pub units: InsulinUnits,
    pub steps: u32,
    /// Simulated seconds between steps (extended), or 0 for a standard bolus
    pub step_interval_secs: i64,
}

/// Outcome of `adjust_basal_rate`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BasalAdjustment {
    pub rate: InsulinUnits,
    /// Set only for automatic adjustments of an already running basal
    pub control_delta: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InsulinKind {
    Bolus,
    Basal,
}

/// One point of the merged delivery chart: bolus units or a sampled basal rate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InsulinHistoryPoint {
    pub timestamp: DateTime<Utc>,
    pub kind: InsulinKind,
    /// Units for a bolus, u/hr for a basal sample
    pub amount: f64,
}

/// Hard pump limit for any stored basal rate.
pub fn clamp_rate(rate: InsulinUnits) -> InsulinUnits {
    if rate.is_nan() {
        return 0.0;
    }
    rate.clamp(0.0, MAX_BASAL_RATE)
}

/// Remaining activity of `units` delivered `hours_elapsed` ago (linear decay).
pub fn bolus_iob(units: InsulinUnits, hours_elapsed: f64) -> InsulinUnits {
    if !(0.0..IOB_DURATION_HOURS).contains(&hours_elapsed) {
        return 0.0;
    }
    units * (1.0 - hours_elapsed / IOB_DURATION_HOURS)
}

#[derive(Debug, Clone)]
pub struct InsulinDelivery {
    basal: BasalState,
    last_rate: InsulinUnits,
    last_profile: String,
    last_automatic: bool,
    basal_history: Vec<BasalSegment>,
    bolus: BolusState,
    bolus_history: Vec<BolusDelivery>,
    next_bolus_id: u64,
    insulin_on_board: InsulinUnits,
    last_control_adjustment: f64,
    undrawn: InsulinUnits,
}

impl Default for InsulinDelivery {
    fn default() -> Self {
        Self::new()
    }
}

impl InsulinDelivery {
    pub fn new() -> Self {
        Self {
            basal: BasalState::Inactive,
            last_rate: 0.0,
            last_profile: String::new(),
            last_automatic: false,
            basal_history: Vec::new(),
            bolus: BolusState::Idle,
            bolus_history: Vec::new(),
            next_bolus_id: 1,
            insulin_on_board: 0.0,
            last_control_adjustment: 0.0,
            undrawn: 0.0,
        }
    }

    /// Rebuild from persisted histories. Basal and bolus always come back idle.
    pub fn restore(
        basal_history: Vec<BasalSegment>,
        bolus_history: Vec<BolusDelivery>,
        last_bolus: Option<BolusDelivery>,
        last_basal: Option<BasalSegment>,
        insulin_on_board: InsulinUnits,
        last_control_adjustment: f64,
    ) -> Self {
        let mut delivery = Self::new();
        delivery.basal_history = basal_history
            .into_iter()
            .filter(|s| !s.is_open())
            .map(|mut s| {
                s.rate = clamp_rate(s.rate);
                s
            })
            .collect();
        delivery.bolus_history = bolus_history;
        if let Some(seg) = last_basal {
            delivery.last_rate = clamp_rate(seg.rate);
            delivery.last_profile = seg.profile_name;
            delivery.last_automatic = seg.automatic;
        }
        delivery.bolus = match last_bolus {
            Some(b) if b.completed => BolusState::Completed(b),
            Some(b) => BolusState::Cancelled(b),
            None => BolusState::Idle,
        };
        delivery.insulin_on_board = insulin_on_board.max(0.0);
        delivery.last_control_adjustment = last_control_adjustment;
        delivery
    }

    // Basal

    /// Start basal at `rate` (clamped to the pump limit), closing any open segment.
    /// Returns the stored rate.
    pub fn start_basal(
        &mut self,
        rate: InsulinUnits,
        profile: &str,
        automatic: bool,
        now: DateTime<Utc>,
    ) -> InsulinUnits {
        let rate = clamp_rate(rate);
        self.close_segment(now);
        self.basal = BasalState::Active(BasalSegment {
            start_time: now,
            end_time: None,
            rate,
            profile_name: profile.to_string(),
            automatic,
        });
        self.last_rate = rate;
        self.last_profile = profile.to_string();
        self.last_automatic = automatic;
        tracing::debug!(rate, profile, automatic, "basal started");
        rate
    }

    /// Close the open segment and go inactive. Returns false if already inactive.
    pub fn stop_basal(&mut self, now: DateTime<Utc>) -> bool {
        if !self.close_segment(now) {
            return false;
        }
        self.basal = BasalState::Inactive;
        tracing::debug!("basal stopped");
        true
    }

    pub fn suspend_basal(&mut self, now: DateTime<Utc>) -> bool {
        self.stop_basal(now)
    }

    /// Reopen basal at the last known rate and profile. Does nothing (and
    /// returns `None`) when that rate is zero or no profile was ever used.
    pub fn resume_basal(&mut self, now: DateTime<Utc>) -> Option<InsulinUnits> {
        if self.last_profile.is_empty() || self.last_rate <= 0.0 {
            return None;
        }
        let profile = self.last_profile.clone();
        Some(self.start_basal(self.last_rate, &profile, self.last_automatic, now))
    }

    /// Change the running rate. An inactive basal is started with the last
    /// profile (or Default).
    pub fn adjust_basal_rate(
        &mut self,
        new_rate: InsulinUnits,
        automatic: bool,
        now: DateTime<Utc>,
    ) -> BasalAdjustment {
        let new_rate = clamp_rate(new_rate);
        let current = match &self.basal {
            BasalState::Active(seg) => Some((seg.rate, seg.profile_name.clone())),
            BasalState::Inactive => None,
        };
        let Some((current_rate, profile)) = current else {
            let profile = if self.last_profile.is_empty() {
                DEFAULT_PROFILE.to_string()
            } else {
                self.last_profile.clone()
            };
            let rate = self.start_basal(new_rate, &profile, automatic, now);
            return BasalAdjustment {
                rate,
                control_delta: None,
            };
        };
        let delta = new_rate - current_rate;
        self.start_basal(new_rate, &profile, automatic, now);
        let control_delta = if automatic {
            self.last_control_adjustment = delta;
            Some(delta)
        } else {
            None
        };
        BasalAdjustment {
            rate: new_rate,
            control_delta,
        }
    }

    fn close_segment(&mut self, now: DateTime<Utc>) -> bool {
        let BasalState::Active(open) = std::mem::replace(&mut self.basal, BasalState::Inactive) else {
            return false;
        };
        self.basal_history.push(BasalSegment {
            end_time: Some(now.max(open.start_time)),
            ..open
        });
        true
    }

    pub fn basal_state(&self) -> &BasalState {
        &self.basal
    }

    pub fn is_basal_active(&self) -> bool {
        matches!(self.basal, BasalState::Active(_))
    }

    /// Current delivery rate; 0 while inactive.
    pub fn current_basal_rate(&self) -> InsulinUnits {
        match &self.basal {
            BasalState::Active(seg) => seg.rate,
            BasalState::Inactive => 0.0,
        }
    }

    pub fn current_profile(&self) -> &str {
        match &self.basal {
            BasalState::Active(seg) => &seg.profile_name,
            BasalState::Inactive => &self.last_profile,
        }
    }

    /// Last segment that ran, open or closed, used for persistence.
    pub fn last_basal(&self) -> Option<BasalSegment> {
        match &self.basal {
            BasalState::Active(seg) => Some(seg.clone()),
            BasalState::Inactive => self.basal_history.last().cloned(),
        }
    }

    pub fn last_control_adjustment(&self) -> f64 {
        self.last_control_adjustment
    }

    // Bolus

    /// Accept a bolus. Units over the single-bolus maximum are clamped;
    /// the reservoir check happens after clamping.
    pub fn deliver_bolus(
        &mut self,
        units: InsulinUnits,
        reason: &str,
        extended: bool,
        duration_minutes: u32,
        reservoir: InsulinUnits,
        now: DateTime<Utc>,
    ) -> Result<BolusPlan, PumpError> {
        if self.is_bolus_active() {
            return Err(PumpError::BolusInFlight);
        }
        if units.is_nan() || units <= 0.0 {
            return Err(PumpError::InvalidBolus(units));
        }
        if extended && duration_minutes == 0 {
            return Err(PumpError::MissingDuration);
        }
        let units = units.min(MAX_BOLUS);
        if units > reservoir {
            return Err(PumpError::InsufficientInsulin {
                requested: units,
                remaining: reservoir,
            });
        }

        let id = self.next_bolus_id;
        self.next_bolus_id += 1;
        let flight = InFlightBolus {
            id,
            delivery: BolusDelivery {
                timestamp: now,
                units,
                reason: reason.to_string(),
                extended,
                duration: if extended { duration_minutes } else { 0 },
                completed: false,
            },
            steps_done: 0,
            delivered: 0.0,
        };
        let plan = BolusPlan {
            id,
            units,
            steps: flight.total_steps(),
            step_interval_secs: if extended {
                duration_minutes as i64 * 60 / EXTENDED_BOLUS_STEPS as i64
            } else {
                0
            },
        };
        self.bolus = BolusState::InFlight(flight);
        tracing::info!(units, extended, duration_minutes, reason, "bolus started");
        Ok(plan)
    }

    /// Deliver the next step of bolus `id`. Returns `None` when that bolus is
    /// no longer in flight.
    pub fn advance_bolus(&mut self, id: u64) -> Option<BolusProgress> {
        let BolusState::InFlight(flight) = &mut self.bolus else {
            return None;
        };
        if flight.id != id {
            return None;
        }
        let step = flight.step_units();
        flight.steps_done += 1;
        flight.delivered += step;
        self.undrawn += step;
        if flight.steps_done < flight.total_steps() {
            return Some(BolusProgress::Step { delivered: step });
        }

        let mut done = flight.delivery.clone();
        done.completed = true;
        let units = done.units;
        self.bolus_history.push(done.clone());
        self.bolus = BolusState::Completed(done);
        tracing::info!(units, "bolus completed");
        Some(BolusProgress::Completed { units })
    }

    /// Stop the in-flight bolus and record what actually went in.
    /// Returns `(delivered, requested)`.
    pub fn cancel_bolus(&mut self, now: DateTime<Utc>) -> Result<(InsulinUnits, InsulinUnits), PumpError> {
        if !self.is_bolus_active() {
            return Err(PumpError::NoBolusInFlight);
        }
        let BolusState::InFlight(flight) = std::mem::take(&mut self.bolus) else {
            return Err(PumpError::NoBolusInFlight);
        };
        let requested = flight.delivery.units;
        let delivered = if flight.delivery.extended {
            flight.delivered
        } else {
            let elapsed = (now - flight.delivery.timestamp).num_milliseconds().max(0) as f64;
            let fraction = (elapsed / (STANDARD_BOLUS_DELAY_SECS as f64 * 1000.0)).min(1.0);
            let amount = requested * fraction;
            self.undrawn += amount;
            amount
        };
        let partial = BolusDelivery {
            units: delivered,
            completed: false,
            ..flight.delivery
        };
        self.bolus_history.push(partial.clone());
        self.bolus = BolusState::Cancelled(partial);
        tracing::info!(delivered, requested, "bolus cancelled");
        Ok((delivered, requested))
    }

    pub fn is_bolus_active(&self) -> bool {
        matches!(self.bolus, BolusState::InFlight(_))
    }

    pub fn bolus_state(&self) -> &BolusState {
        &self.bolus
    }

    pub fn current_bolus(&self) -> Option<&InFlightBolus> {
        match &self.bolus {
            BolusState::InFlight(flight) => Some(flight),
            _ => None,
        }
    }

    /// Most recent finished bolus, completed or cancelled.
    pub fn last_bolus(&self) -> Option<&BolusDelivery> {
        match &self.bolus {
            BolusState::Completed(b) | BolusState::Cancelled(b) => Some(b),
            _ => None,
        }
    }

    /// Bolus insulin delivered since the last call; the reservoir tick draws it.
    pub fn take_undrawn(&mut self) -> InsulinUnits {
        std::mem::take(&mut self.undrawn)
    }

    // IOB

    /// Linear-decay IOB over the last four hours plus a fixed share of any
    /// in-flight bolus.
    pub fn compute_iob(&self, now: DateTime<Utc>) -> InsulinUnits {
        let history: InsulinUnits = self
            .bolus_history
            .iter()
            .map(|b| {
                let hours = (now - b.timestamp).num_milliseconds() as f64 / 3_600_000.0;
                bolus_iob(b.units, hours)
            })
            .sum();
        let in_flight = self
            .current_bolus()
            .map_or(0.0, |f| f.delivery.units * IN_FLIGHT_IOB_FRACTION);
        history + in_flight
    }

    /// Recompute IOB; returns the new value only when it moved by more than
    /// the publish threshold.
    pub fn update_iob(&mut self, now: DateTime<Utc>) -> Option<InsulinUnits> {
        let total = self.compute_iob(now);
        if (total - self.insulin_on_board).abs() > IOB_PUBLISH_EPSILON {
            self.insulin_on_board = total;
            Some(total)
        } else {
            None
        }
    }

    pub fn insulin_on_board(&self) -> InsulinUnits {
        self.insulin_on_board
    }

    // History

    pub fn bolus_history(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<BolusDelivery> {
        self.bolus_history
            .iter()
            .filter(|b| b.timestamp >= start && b.timestamp <= end)
            .cloned()
            .collect()
    }

    /// Segments overlapping the window, the open segment included.
    pub fn basal_history(&self, start: DateTime<Utc>, end: DateTime<Utc>, now: DateTime<Utc>) -> Vec<BasalSegment> {
        self.all_segments()
            .filter(|s| s.overlaps(start, end, now))
            .cloned()
            .collect()
    }

    pub fn total_basal(&self, start: DateTime<Utc>, end: DateTime<Utc>, now: DateTime<Utc>) -> InsulinUnits {
        self.all_segments().map(|s| s.units_between(start, end, now)).sum()
    }

    pub fn total_bolus(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> InsulinUnits {
        self.bolus_history(start, end).iter().map(|b| b.units).sum()
    }

    pub fn total_insulin(&self, start: DateTime<Utc>, end: DateTime<Utc>, now: DateTime<Utc>) -> InsulinUnits {
        self.total_basal(start, end, now) + self.total_bolus(start, end)
    }

    /// Boluses in the window plus each overlapping basal segment sampled hourly
    /// from its start, sorted by time.
    pub fn history_points(&self, start: DateTime<Utc>, end: DateTime<Utc>, now: DateTime<Utc>) -> Vec<InsulinHistoryPoint> {
        let mut points: Vec<InsulinHistoryPoint> = self
            .bolus_history(start, end)
            .into_iter()
            .map(|b| InsulinHistoryPoint {
                timestamp: b.timestamp,
                kind: InsulinKind::Bolus,
                amount: b.units,
            })
            .collect();
        for seg in self.basal_history(start, end, now) {
            let seg_end = seg.end_time.unwrap_or(now);
            let mut t = seg.start_time;
            while t <= seg_end {
                if t >= start && t <= end {
                    points.push(InsulinHistoryPoint {
                        timestamp: t,
                        kind: InsulinKind::Basal,
                        amount: seg.rate,
                    });
                }
                t += Duration::hours(1);
            }
        }
        points.sort_by_key(|p| p.timestamp);
        points
    }

    /// Closed segments only.
    pub fn closed_segments(&self) -> &[BasalSegment] {
        &self.basal_history
    }

    pub fn all_boluses(&self) -> &[BolusDelivery] {
        &self.bolus_history
    }

    fn all_segments(&self) -> impl Iterator<Item = &BasalSegment> {
        let open = match &self.basal {
            BasalState::Active(seg) => Some(seg),
            BasalState::Inactive => None,
        };
        self.basal_history.iter().chain(open)
    }

    pub fn add_bolus_record(&mut self, bolus: BolusDelivery) {
        self.bolus_history.push(bolus);
    }

    pub fn add_basal_record(&mut self, segment: BasalSegment) {
        if !segment.is_open() {
            self.basal_history.push(segment);
        }
    }

    /// Backfill `hours` of plausible delivery history ending at `now`:
    /// four-hour basal blocks (mostly automatic, jittered) and the day's
    /// meal and correction boluses.
    pub fn seed_history(&mut self, hours: u32, now: DateTime<Utc>, profile: &Profile, rng: &mut impl Rng) {
        let start = now - Duration::hours(hours as i64);

        let mut seg_start = start;
        while seg_start < now {
            let seg_end = (seg_start + Duration::hours(4)).min(now);
            let automatic = rng.gen_range(0..100) < 70;
            let rate = if automatic {
                (profile.basal_rate + (rng.gen::<f64>() - 0.5) * 0.6).max(0.1)
            } else {
                profile.basal_rate
            };
            self.add_basal_record(BasalSegment {
                start_time: seg_start,
                end_time: Some(seg_end),
                rate: clamp_rate(rate),
                profile_name: profile.name.clone(),
                automatic,
            });
            seg_start = seg_end;
        }

        let in_window = |t: DateTime<Utc>| t >= start && t <= now;
        let mut day = start.date_naive();
        while day <= now.date_naive() {
            let at = |h: u32, m: u32| {
                NaiveTime::from_hms_opt(h, m, 0).map(|time| day.and_time(time).and_utc())
            };
            if let Some(t) = at(7, 15).filter(|t| in_window(*t)) {
                let units = 4.0 + (rng.gen::<f64>() - 0.5);
                self.add_bolus_record(seeded_bolus(t, units, "Breakfast", 0));
            }
            if let Some(t) = at(12, 30).filter(|t| in_window(*t)) {
                let units = 5.0 + (rng.gen::<f64>() - 0.5) * 1.5;
                self.add_bolus_record(seeded_bolus(t, units, "Lunch", 0));
            }
            if let Some(t) = at(18, 45).filter(|t| in_window(*t)) {
                let units = 6.0 + (rng.gen::<f64>() - 0.5) * 2.0;
                let duration = if rng.gen_range(0..100) < 30 {
                    rng.gen_range(1..4) * 30
                } else {
                    0
                };
                self.add_bolus_record(seeded_bolus(t, units, "Dinner", duration));
            }
            if rng.gen_range(0..100) < 40 {
                let hour = rng.gen_range(14..22);
                let minute = rng.gen_range(0..60);
                if let Some(t) = at(hour, minute).filter(|t| in_window(*t)) {
                    let units = 1.5 + rng.gen::<f64>() * 1.5;
                    self.add_bolus_record(seeded_bolus(t, units, "Correction", 0));
                }
            }
            let Some(next) = day.succ_opt() else { break };
            day = next;
        }
        self.bolus_history.sort_by_key(|b| b.timestamp);
    }
}

fn seeded_bolus(timestamp: DateTime<Utc>, units: InsulinUnits, reason: &str, duration: u32) -> BolusDelivery {
    BolusDelivery {
        timestamp,
        units,
        reason: reason.to_string(),
        extended: duration > 0,
        duration,
        completed: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, VirtualClock};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn now() -> DateTime<Utc> {
        VirtualClock::at_epoch().now()
    }

    fn default_profile() -> Profile {
        Profile::new("Default", 1.0, 10.0, 2.0, 5.5)
    }

    #[test]
    fn test_start_basal_clamps() {
        let mut d = InsulinDelivery::new();
        assert_eq!(d.start_basal(7.5, "Default", false, now()), 5.0);
        assert_eq!(d.current_basal_rate(), 5.0);
        assert_eq!(d.start_basal(-1.0, "Default", false, now()), 0.0);
        assert_eq!(clamp_rate(clamp_rate(9.0)), clamp_rate(9.0));
    }

    #[test]
    fn test_segments_track_real_start_times() {
        let t0 = now();
        let mut d = InsulinDelivery::new();
        d.start_basal(1.0, "Default", false, t0);
        d.start_basal(2.0, "Default", true, t0 + Duration::minutes(30));
        assert!(d.stop_basal(t0 + Duration::minutes(90)));
        let segs = d.closed_segments();
        assert_eq!(segs.len(), 2);
        assert_eq!(segs[0].start_time, t0);
        assert_eq!(segs[0].end_time, Some(t0 + Duration::minutes(30)));
        assert_eq!(segs[1].start_time, t0 + Duration::minutes(30));
        assert!(!d.is_basal_active());
        assert_eq!(d.current_basal_rate(), 0.0);
        // 1.0 x 0.5h + 2.0 x 1h
        let total = d.total_basal(t0, t0 + Duration::hours(2), t0 + Duration::hours(2));
        assert!((total - 2.5).abs() < 1e-9);
    }

    #[test]
    fn test_stop_when_inactive_is_noop() {
        let mut d = InsulinDelivery::new();
        assert!(!d.stop_basal(now()));
        assert!(d.closed_segments().is_empty());
    }

    #[test]
    fn test_open_segment_counts_until_now() {
        let t0 = now();
        let mut d = InsulinDelivery::new();
        d.start_basal(1.2, "Default", false, t0);
        let total = d.total_basal(t0, t0 + Duration::hours(5), t0 + Duration::hours(1));
        assert!((total - 1.2).abs() < 1e-9);
        assert_eq!(d.basal_history(t0, t0 + Duration::hours(1), t0 + Duration::hours(1)).len(), 1);
    }

    #[test]
    fn test_resume_uses_last_rate() {
        let t0 = now();
        let mut d = InsulinDelivery::new();
        assert_eq!(d.resume_basal(t0), None);
        d.start_basal(0.8, "Sleep", false, t0);
        d.suspend_basal(t0 + Duration::minutes(5));
        assert_eq!(d.resume_basal(t0 + Duration::minutes(10)), Some(0.8));
        assert_eq!(d.current_profile(), "Sleep");
    }

    #[test]
    fn test_resume_refuses_zero_rate() {
        let t0 = now();
        let mut d = InsulinDelivery::new();
        d.start_basal(0.0, "Default", true, t0);
        d.suspend_basal(t0);
        assert_eq!(d.resume_basal(t0), None);
        assert!(!d.is_basal_active());
    }

    #[test]
    fn test_adjust_records_control_delta_only_when_automatic() {
        let t0 = now();
        let mut d = InsulinDelivery::new();
        d.start_basal(1.0, "Default", false, t0);
        let manual = d.adjust_basal_rate(1.5, false, t0);
        assert_eq!(manual.control_delta, None);
        assert_eq!(d.last_control_adjustment(), 0.0);
        let auto = d.adjust_basal_rate(1.2, true, t0);
        assert!((auto.control_delta.unwrap() + 0.3).abs() < 1e-9);
        assert!((d.last_control_adjustment() + 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_adjust_when_inactive_starts_default() {
        let mut d = InsulinDelivery::new();
        let adj = d.adjust_basal_rate(6.0, true, now());
        assert_eq!(adj.rate, 5.0);
        assert!(d.is_basal_active());
        assert_eq!(d.current_profile(), "Default");
    }

    #[test]
    fn test_second_bolus_rejected() {
        let mut d = InsulinDelivery::new();
        let plan = d.deliver_bolus(3.0, "Manual", false, 0, 300.0, now()).unwrap();
        assert_eq!(plan.steps, 1);
        assert_eq!(
            d.deliver_bolus(2.0, "Manual", false, 0, 300.0, now()),
            Err(PumpError::BolusInFlight)
        );
        assert_eq!(d.current_bolus().unwrap().delivery.units, 3.0);
    }

    #[test]
    fn test_bolus_validation() {
        let mut d = InsulinDelivery::new();
        assert_eq!(d.deliver_bolus(0.0, "Manual", false, 0, 300.0, now()), Err(PumpError::InvalidBolus(0.0)));
        assert_eq!(d.deliver_bolus(2.0, "Manual", true, 0, 300.0, now()), Err(PumpError::MissingDuration));
        assert!(matches!(
            d.deliver_bolus(12.0, "Manual", false, 0, 10.0, now()),
            Err(PumpError::InsufficientInsulin { .. })
        ));
        let plan = d.deliver_bolus(40.0, "Manual", false, 0, 300.0, now()).unwrap();
        assert_eq!(plan.units, 25.0);
    }

    #[test]
    fn test_standard_bolus_completes_in_one_step() {
        let mut d = InsulinDelivery::new();
        let plan = d.deliver_bolus(4.0, "Manual", false, 0, 300.0, now()).unwrap();
        assert_eq!(d.advance_bolus(plan.id), Some(BolusProgress::Completed { units: 4.0 }));
        assert!(!d.is_bolus_active());
        assert_eq!(d.take_undrawn(), 4.0);
        assert_eq!(d.take_undrawn(), 0.0);
        assert!(d.last_bolus().unwrap().completed);
    }

    #[test]
    fn test_extended_bolus_ten_equal_steps() {
        let mut d = InsulinDelivery::new();
        let plan = d.deliver_bolus(5.0, "Manual", true, 60, 300.0, now()).unwrap();
        assert_eq!(plan.steps, 10);
        assert_eq!(plan.step_interval_secs, 360);
        let mut total = 0.0;
        for _ in 0..9 {
            match d.advance_bolus(plan.id) {
                Some(BolusProgress::Step { delivered }) => {
                    assert!((delivered - 0.5).abs() < 1e-9);
                    total += delivered;
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(d.advance_bolus(plan.id), Some(BolusProgress::Completed { units: 5.0 }));
        total += 0.5;
        assert!((total - 5.0).abs() < 1e-9);
        assert!((d.take_undrawn() - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_stale_step_ignored() {
        let mut d = InsulinDelivery::new();
        let first = d.deliver_bolus(5.0, "Manual", true, 30, 300.0, now()).unwrap();
        d.cancel_bolus(now()).unwrap();
        let second = d.deliver_bolus(2.0, "Manual", true, 30, 300.0, now()).unwrap();
        assert_eq!(d.advance_bolus(first.id), None);
        assert!(d.advance_bolus(second.id).is_some());
    }

    #[test]
    fn test_cancel_extended_records_delivered_steps() {
        let t0 = now();
        let mut d = InsulinDelivery::new();
        let plan = d.deliver_bolus(5.0, "Manual", true, 60, 300.0, t0).unwrap();
        for _ in 0..3 {
            d.advance_bolus(plan.id);
        }
        let (delivered, requested) = d.cancel_bolus(t0 + Duration::minutes(20)).unwrap();
        assert!((delivered - 1.5).abs() < 1e-9);
        assert_eq!(requested, 5.0);
        let last = d.last_bolus().unwrap();
        assert!(!last.completed);
        assert!((last.units - 1.5).abs() < 1e-9);
        assert_eq!(d.cancel_bolus(t0), Err(PumpError::NoBolusInFlight));
    }

    #[test]
    fn test_cancel_standard_is_proportional() {
        let t0 = now();
        let mut d = InsulinDelivery::new();
        d.deliver_bolus(4.0, "Manual", false, 0, 300.0, t0).unwrap();
        let (delivered, _) = d.cancel_bolus(t0 + Duration::seconds(1)).unwrap();
        assert!((delivered - 2.0).abs() < 1e-9);
        assert!((d.take_undrawn() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_iob_decay() {
        assert_eq!(bolus_iob(4.0, 4.0), 0.0);
        assert_eq!(bolus_iob(4.0, 0.0), 4.0);
        assert!((bolus_iob(4.0, 2.0) - 2.0).abs() < 1e-9);
        assert!(bolus_iob(4.0, 1.0) > bolus_iob(4.0, 1.5));
        assert_eq!(bolus_iob(4.0, -0.5), 0.0);
    }

    #[test]
    fn test_update_iob_includes_in_flight_share() {
        let t0 = now();
        let mut d = InsulinDelivery::new();
        d.deliver_bolus(5.0, "Manual", true, 60, 300.0, t0).unwrap();
        let iob = d.update_iob(t0).unwrap();
        assert!((iob - 4.0).abs() < 1e-9);
        assert_eq!(d.update_iob(t0), None);
    }

    #[test]
    fn test_update_iob_from_history() {
        let t0 = now();
        let mut d = InsulinDelivery::new();
        d.add_bolus_record(seeded_bolus(t0, 4.0, "Lunch", 0));
        assert_eq!(d.update_iob(t0 + Duration::hours(1)), Some(3.0));
        // 3.0 -> 2.99 is under the publish threshold
        assert_eq!(d.update_iob(t0 + Duration::seconds(3600 + 18)), None);
        assert!(d.update_iob(t0 + Duration::hours(4)).is_some());
        assert_eq!(d.insulin_on_board(), 0.0);
    }

    #[test]
    fn test_totals_and_windows() {
        let t0 = now();
        let mut d = InsulinDelivery::new();
        d.add_bolus_record(seeded_bolus(t0, 3.0, "Breakfast", 0));
        d.add_bolus_record(seeded_bolus(t0 + Duration::hours(5), 2.0, "Lunch", 0));
        assert_eq!(d.total_bolus(t0, t0 + Duration::hours(5)), 5.0);
        assert_eq!(d.bolus_history(t0 + Duration::minutes(1), t0 + Duration::hours(6)).len(), 1);
        d.add_basal_record(BasalSegment {
            start_time: t0,
            end_time: Some(t0 + Duration::hours(2)),
            rate: 1.0,
            profile_name: "Default".into(),
            automatic: false,
        });
        let total = d.total_insulin(t0 + Duration::hours(1), t0 + Duration::hours(6), t0 + Duration::hours(6));
        assert!((total - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_history_points_merge_and_sort() {
        let t0 = now();
        let mut d = InsulinDelivery::new();
        d.add_basal_record(BasalSegment {
            start_time: t0,
            end_time: Some(t0 + Duration::hours(3)),
            rate: 0.9,
            profile_name: "Default".into(),
            automatic: true,
        });
        d.add_bolus_record(seeded_bolus(t0 + Duration::minutes(90), 3.0, "Lunch", 0));
        let points = d.history_points(t0, t0 + Duration::hours(3), t0 + Duration::hours(3));
        let kinds: Vec<InsulinKind> = points.iter().map(|p| p.kind).collect();
        assert_eq!(
            kinds,
            vec![
                InsulinKind::Basal,
                InsulinKind::Basal,
                InsulinKind::Bolus,
                InsulinKind::Basal,
                InsulinKind::Basal,
            ]
        );
        assert_eq!(points[2].amount, 3.0);
    }

    #[test]
    fn test_seed_history_covers_window() {
        let t0 = now();
        let end = t0 + Duration::hours(48);
        let mut d = InsulinDelivery::new();
        d.seed_history(48, end, &default_profile(), &mut StdRng::seed_from_u64(5));
        assert_eq!(d.closed_segments().len(), 12);
        assert_eq!(d.closed_segments()[0].start_time, t0);
        assert_eq!(d.closed_segments()[11].end_time, Some(end));
        assert!(d.closed_segments().iter().all(|s| (0.1..=5.0).contains(&s.rate)));
        // two full days of breakfast, lunch and dinner
        let meals = d.all_boluses().iter().filter(|b| b.reason != "Correction").count();
        assert_eq!(meals, 6);
        assert!(d.all_boluses().windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
        assert!(!d.is_basal_active());
    }

    #[test]
    fn test_restore_is_idle() {
        let t0 = now();
        let seg = BasalSegment {
            start_time: t0,
            end_time: None,
            rate: 9.0,
            profile_name: "Sleep".into(),
            automatic: true,
        };
        let d = InsulinDelivery::restore(vec![seg.clone()], vec![], None, Some(seg), 1.5, -0.2);
        assert!(!d.is_basal_active());
        assert!(!d.is_bolus_active());
        assert!(d.closed_segments().is_empty());
        assert_eq!(d.current_profile(), "Sleep");
        assert_eq!(d.insulin_on_board(), 1.5);
        assert_eq!(d.last_control_adjustment(), -0.2);
    }
}
