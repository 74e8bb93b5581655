//! The pump: owns every component, drives them from the event queue and
//! publishes what happened to registered observers.
//!
//! All work happens inside [`Pump::advance`], one queue entry at a time and
//! each to completion. Tick periods are given in simulated time and divided
//! by the configured speed factor; reminder, occlusion and charging checks
//! run on real-time cadence.

use chrono::{DateTime, Duration, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::alerts::{self, AlertCheck, AlertEngine, AlertThresholds, Recovery};
use crate::calculator;
use crate::clock::Clock;
use crate::config::{ConfigError, PumpConfig, Reminder};
use crate::constants::*;
use crate::control::ControlSettings;
use crate::error::{PumpError, StorageError};
use crate::glucose::{self, GlucoseSeries};
use crate::insulin::{BolusProgress, InsulinDelivery, InsulinHistoryPoint};
use crate::profiles::ProfileStore;
use crate::scheduler::{scaled_period, EventQueue, Task};
use crate::storage::{
    EventLogDoc, GlucoseDoc, InsulinDoc, LoadedDocuments, ProfilesDoc, PumpDocuments, PumpStateDoc, Storage,
};
use crate::types::*;

pub type Observer = Box<dyn FnMut(&PumpEvent)>;

pub struct Pump<C: Clock> {
    clock: C,
    config: PumpConfig,
    rng: StdRng,
    state: PumpState,
    glucose: GlucoseSeries,
    insulin: InsulinDelivery,
    profiles: ProfileStore,
    alerts: AlertEngine,
    control: ControlSettings,
    reminders: Vec<Reminder>,
    queue: EventQueue,
    storage: Option<Storage>,
    observers: Vec<Observer>,
    shutdown_scheduled: bool,
}

impl<C: Clock> std::fmt::Debug for Pump<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pump")
            .field("state", &self.state)
            .field("queued", &self.queue.len())
            .field("observers", &self.observers.len())
            .finish()
    }
}

impl<C: Clock> Pump<C> {
    /// Build a pump from a validated configuration. With a data directory the
    /// previous session is restored; otherwise (or for missing files) a cold
    /// start generates synthetic glucose and delivery history.
    pub fn new(config: PumpConfig, clock: C) -> Result<Self, ConfigError> {
        config.validate()?;
        let now = clock.now();
        let seed = config
            .simulation
            .seed
            .unwrap_or_else(|| now.timestamp() as u64 ^ now.timestamp_subsec_nanos() as u64);
        let storage = config.simulation.data_dir.clone().map(Storage::new);
        let loaded = storage.as_ref().map(Storage::load_all).unwrap_or_default();

        let mut pump = Self {
            rng: StdRng::seed_from_u64(seed),
            state: PumpState::new(now),
            glucose: GlucoseSeries::new(),
            insulin: InsulinDelivery::new(),
            profiles: ProfileStore::with_defaults(),
            alerts: AlertEngine::new(config.alerts.clone()),
            control: config.control.clone(),
            reminders: config.reminders.clone(),
            queue: EventQueue::new(),
            storage,
            observers: Vec::new(),
            shutdown_scheduled: false,
            config,
            clock,
        };
        pump.restore(loaded);
        tracing::info!(seed, "pump initialised");
        Ok(pump)
    }

    fn restore(&mut self, loaded: LoadedDocuments) {
        let now = self.clock.now();
        let hours = self.config.simulation.history_hours;

        if let Some(doc) = loaded.profiles {
            self.profiles = ProfileStore::restore(doc.profiles, &doc.active_profile);
        }
        self.state.profile_name = self.profiles.active_name().to_string();

        if let Some(doc) = loaded.state {
            self.state.battery_level = doc.battery_level.min(BATTERY_FULL);
            self.state.insulin_remaining = doc.insulin_remaining.clamp(0.0, RESERVOIR_CAPACITY);
            self.state.insulin_on_board = doc.insulin_on_board.max(0.0);
            self.state.last_action = doc.last_action;
            self.state.last_control_delta = doc.last_control_iq_delta;
            let events = loaded.events.map(|e| e.events).unwrap_or_default();
            self.alerts = AlertEngine::restore(self.config.alerts.clone(), doc.active_alerts, doc.alert_history, events);
            if doc.occluded {
                self.state.suspend_reason = Some(SuspendReason::Occlusion);
            }
        } else if let Some(doc) = loaded.events {
            self.alerts = AlertEngine::restore(self.config.alerts.clone(), Vec::new(), Vec::new(), doc.events);
        }

        match loaded.glucose {
            Some(doc) => self.glucose = GlucoseSeries::restore(doc.readings, doc.trend),
            None if hours > 0 => self.glucose.generate_synthetic_window(hours, now, &mut self.rng),
            None => {}
        }

        match loaded.insulin {
            Some(doc) => {
                if doc.current_bolus.is_some() {
                    tracing::warn!("discarding a bolus that was in flight when data was saved");
                }
                self.insulin = InsulinDelivery::restore(
                    doc.basal_history,
                    doc.bolus_history,
                    doc.last_bolus,
                    doc.current_basal,
                    doc.insulin_on_board,
                    doc.last_control_iq_adjustment,
                );
            }
            None if hours > 0 => {
                let profile = self.profiles.active().clone();
                self.insulin.seed_history(hours, now, &profile, &mut self.rng);
            }
            None => {}
        }
        self.insulin.update_iob(now);
        self.state.insulin_on_board = self.insulin.insulin_on_board();
    }

    // Observers

    pub fn subscribe(&mut self, observer: impl FnMut(&PumpEvent) + 'static) {
        self.observers.push(Box::new(observer));
    }

    fn emit(&mut self, event: PumpEvent) {
        for observer in self.observers.iter_mut() {
            observer(&event);
        }
    }

    pub fn snapshot(&self) -> PumpSnapshot {
        let now = self.clock.now();
        PumpSnapshot {
            now,
            running: self.state.running,
            charging: self.state.charging,
            battery_level: self.state.battery_level,
            insulin_remaining: self.state.insulin_remaining,
            insulin_on_board: self.state.insulin_on_board,
            glucose: self.glucose.current_value(),
            trend: self.glucose.trend(),
            last_reading_time: self.glucose.last_reading_time(now),
            basal_active: self.insulin.is_basal_active(),
            basal_rate: self.insulin.current_basal_rate(),
            suspend_reason: self.state.suspend_reason,
            bolus_active: self.insulin.is_bolus_active(),
            active_profile: self.profiles.active_name().to_string(),
            last_control_delta: self.state.last_control_delta,
            active_alerts: self.alerts.active().to_vec(),
            alert_history_len: self.alerts.history_len(),
        }
    }

    // Lifecycle

    /// Power on: start the active profile's basal and arm every tick.
    /// An unreplaced occluded set keeps basal off. Returns false if already running.
    pub fn start(&mut self) -> bool {
        if self.state.running {
            return false;
        }
        let now = self.clock.now();
        self.state.running = true;
        self.state.last_action = now;
        self.shutdown_scheduled = false;

        let profile = self.profiles.active().clone();
        let rate = if self.is_occluded() {
            tracing::warn!("started with an occluded infusion set, basal held");
            0.0
        } else {
            self.state.suspend_reason = None;
            self.insulin.start_basal(profile.basal_rate, &profile.name, false, now)
        };
        self.schedule_ticks(now);
        self.alerts.log_event("Pump started", AlertLevel::Info, now);
        tracing::info!(profile = %profile.name, rate, "pump started");
        self.emit(PumpEvent::Started);
        self.emit(PumpEvent::BasalRateChanged(rate));

        self.check_battery(now);
        self.check_insulin(now);
        true
    }

    fn schedule_ticks(&mut self, now: DateTime<Utc>) {
        let speed = self.config.simulation.speed_factor;
        let q = &mut self.queue;
        q.schedule_every(now, scaled_period(BATTERY_PERIOD_SECS, speed), Task::Battery);
        q.schedule_every(now, scaled_period(GLUCOSE_PERIOD_SECS, speed), Task::Glucose);
        q.schedule_every(now, scaled_period(IOB_PERIOD_SECS, speed), Task::Iob);
        q.schedule_every(now, scaled_period(CONTROL_PERIOD_SECS, speed), Task::Control);
        q.schedule_every(now, scaled_period(RESERVOIR_PERIOD_SECS, speed), Task::Reservoir);
        q.schedule_every(now, Duration::seconds(REMINDER_PERIOD_SECS), Task::Reminder);
        q.schedule_every(now, Duration::seconds(OCCLUSION_PERIOD_SECS), Task::Occlusion);
        if self.control.enabled {
            // one early evaluation shortly after power-on
            q.schedule_at(now + Duration::seconds(2), Task::Control);
        }
        if self.state.charging && !q.contains(Task::Charge) {
            q.schedule_every(now, Duration::seconds(CHARGE_STEP_SECS), Task::Charge);
        }
    }

    /// Power off: cancel any bolus, stop basal, drop every pending tick and
    /// persist. Returns false if already stopped.
    pub fn stop(&mut self) -> bool {
        if !self.state.running {
            return false;
        }
        let now = self.clock.now();
        if self.insulin.is_bolus_active() {
            if let Ok((delivered, requested)) = self.insulin.cancel_bolus(now) {
                self.emit(PumpEvent::BolusCancelled { delivered, requested });
                let message = format!("Bolus interrupted: {:.2} of {:.2} units delivered", delivered, requested);
                self.raise(AlertCheck {
                    message,
                    level: AlertLevel::Warning,
                    source: AlertSource::Bolus,
                }, now);
            }
        }
        if self.insulin.stop_basal(now) {
            self.emit(PumpEvent::BasalRateChanged(0.0));
        }
        // pending bolus draw still leaves the reservoir
        self.draw_reservoir(0.0);
        self.queue.clear();
        // charging carries on while powered off
        if self.state.charging {
            self.queue
                .schedule_every(now, Duration::seconds(CHARGE_STEP_SECS), Task::Charge);
        }
        self.state.running = false;
        self.state.last_action = now;
        if self.state.suspend_reason == Some(SuspendReason::LowGlucose) {
            self.state.suspend_reason = None;
        }
        self.alerts.log_event("Pump stopped", AlertLevel::Info, now);
        tracing::info!("pump stopped");
        self.emit(PumpEvent::Stopped);

        if let Err(e) = self.save() {
            tracing::error!("Failed to save pump data: {}", e);
        }
        true
    }

    pub fn is_running(&self) -> bool {
        self.state.running
    }

    /// Process every queue entry due within the next `by` of clock time,
    /// waiting on the clock between them.
    pub fn advance(&mut self, by: Duration) {
        let until = self.clock.now() + by;
        while let Some(entry) = self.queue.pop_due(until) {
            self.clock.sleep_until(entry.due);
            self.dispatch(entry.task, entry.due);
        }
        self.clock.sleep_until(until);
    }

    /// `advance` by an amount of simulated time.
    pub fn advance_simulated(&mut self, by: Duration) {
        let millis = by.num_milliseconds() / self.config.simulation.speed_factor.max(1) as i64;
        self.advance(Duration::milliseconds(millis));
    }

    fn dispatch(&mut self, task: Task, due: DateTime<Utc>) {
        tracing::trace!(%task, due = %due.to_rfc3339(), "tick");
        match task {
            Task::Glucose => self.glucose_tick(due),
            Task::Control => self.control_tick(due),
            Task::BolusStep { bolus_id } => self.bolus_step(bolus_id, due),
            Task::Iob => self.iob_tick(due),
            Task::Reservoir => self.reservoir_tick(),
            Task::Battery => self.battery_tick(due),
            Task::Charge => self.charge_tick(due),
            Task::Reminder => self.reminder_tick(due),
            Task::Occlusion => self.occlusion_tick(due),
            Task::Shutdown => self.shutdown(),
        }
    }

    // Ticks

    fn glucose_tick(&mut self, now: DateTime<Utc>) {
        let gap = alerts::evaluate_cgm_gap(self.glucose.last_reading_time(now), now);
        let value = glucose::next_reading(&self.glucose, now, &mut self.rng);
        self.record_reading(value, now);
        if let Some(check) = gap.filter(|_| self.alerts.is_enabled()) {
            self.raise(check, now);
        }
    }

    fn record_reading(&mut self, value: GlucoseLevel, now: DateTime<Utc>) {
        let before = self.glucose.trend();
        let trend = self.glucose.add_reading(value, now);
        self.emit(PumpEvent::NewReading(GlucoseReading { timestamp: now, value }));
        if trend != before {
            self.emit(PumpEvent::TrendChanged(trend));
        }
        self.check_glucose(now);
    }

    fn control_tick(&mut self, now: DateTime<Utc>) {
        if !self.state.running || !self.control.enabled || self.is_occluded() {
            return;
        }
        let glucose = self.glucose.current_value();
        let trend = self.glucose.trend();
        let profile = self.profiles.active().clone();

        // suspended: only a reading at or above the resume threshold reopens basal
        if !self.insulin.is_basal_active() {
            if glucose >= GLUCOSE_RESUME {
                let rate = match self.insulin.resume_basal(now) {
                    Some(rate) => rate,
                    None => self.insulin.start_basal(profile.basal_rate, &profile.name, false, now),
                };
                self.state.suspend_reason = None;
                self.alerts.log_event("Basal delivery resumed", AlertLevel::Info, now);
                tracing::info!(glucose, rate, "basal resumed");
                self.emit(PumpEvent::BasalRateChanged(rate));
            }
            return;
        }

        let delta = self
            .control
            .delta(glucose, trend, profile.basal_rate, self.insulin.insulin_on_board());

        if glucose < GLUCOSE_SUSPEND {
            self.state.last_control_delta = delta;
            self.insulin.suspend_basal(now);
            self.state.suspend_reason = Some(SuspendReason::LowGlucose);
            self.alerts
                .log_event("Basal delivery suspended - Low glucose", AlertLevel::Warning, now);
            tracing::warn!(glucose, delta, "basal suspended for low glucose");
            self.emit(PumpEvent::ControlIqAdjusted { delta, new_rate: 0.0 });
            self.emit(PumpEvent::BasalRateChanged(0.0));
            return;
        }

        if delta.abs() > CONTROL_DEADBAND {
            let new_rate = self.control.cap_rate(profile.basal_rate + delta);
            let applied = self.insulin.adjust_basal_rate(new_rate, true, now);
            self.state.last_control_delta = delta;
            self.alerts
                .log_event(&crate::control::describe_adjustment(delta, applied.rate), AlertLevel::Info, now);
            tracing::info!(glucose, %trend, delta, rate = applied.rate, "Control-IQ adjustment");
            self.emit(PumpEvent::ControlIqAdjusted {
                delta,
                new_rate: applied.rate,
            });
            self.emit(PumpEvent::BasalRateChanged(applied.rate));
        }
    }

    fn bolus_step(&mut self, bolus_id: u64, now: DateTime<Utc>) {
        match self.insulin.advance_bolus(bolus_id) {
            Some(BolusProgress::Step { .. }) => {
                if let Some(flight) = self.insulin.current_bolus() {
                    let interval = flight.delivery.duration as i64 * 60 / EXTENDED_BOLUS_STEPS as i64;
                    let period = scaled_period(interval, self.config.simulation.speed_factor);
                    self.queue.schedule_at(now + period, Task::BolusStep { bolus_id });
                }
            }
            Some(BolusProgress::Completed { units }) => {
                self.emit(PumpEvent::BolusCompleted { units });
                self.refresh_iob(now);
            }
            None => {}
        }
    }

    fn iob_tick(&mut self, now: DateTime<Utc>) {
        self.refresh_iob(now);
        self.check_insulin(now);
        if let Some(flight) = self.insulin.current_bolus() {
            let d = &flight.delivery;
            let overrun = alerts::evaluate_bolus_overrun(d.timestamp, d.extended, d.duration, now);
            if let Some(check) = overrun.filter(|_| self.alerts.is_enabled()) {
                self.raise(check, now);
            }
        }
    }

    fn refresh_iob(&mut self, now: DateTime<Utc>) {
        if let Some(iob) = self.insulin.update_iob(now) {
            self.state.insulin_on_board = iob;
            self.emit(PumpEvent::InsulinOnBoardChanged(iob));
        }
    }

    fn reservoir_tick(&mut self) {
        let basal = self.insulin.current_basal_rate() / 3600.0 * RESERVOIR_PERIOD_SECS as f64;
        self.draw_reservoir(basal);
    }

    /// Take `basal` plus any delivered-but-undrawn bolus insulin out of the reservoir.
    fn draw_reservoir(&mut self, basal: InsulinUnits) {
        let draw = basal + self.insulin.take_undrawn();
        if draw <= 0.0 {
            return;
        }
        let remaining = (self.state.insulin_remaining - draw).clamp(0.0, RESERVOIR_CAPACITY);
        if remaining != self.state.insulin_remaining {
            self.state.insulin_remaining = remaining;
            self.emit(PumpEvent::InsulinRemainingChanged(remaining));
        }
    }

    fn battery_tick(&mut self, now: DateTime<Utc>) {
        if !self.state.charging && self.state.battery_level > 0 {
            self.state.battery_level -= 1;
            self.emit(PumpEvent::BatteryLevelChanged(self.state.battery_level));
        }
        self.check_battery(now);
    }

    fn charge_tick(&mut self, now: DateTime<Utc>) {
        if !self.state.charging {
            self.queue.cancel(|t| *t == Task::Charge);
            return;
        }
        if self.state.battery_level < BATTERY_FULL {
            self.state.battery_level += 1;
            self.emit(PumpEvent::BatteryLevelChanged(self.state.battery_level));
        } else {
            self.stop_charging();
            self.alerts.log_event("Battery fully charged", AlertLevel::Info, now);
        }
    }

    fn reminder_tick(&mut self, now: DateTime<Utc>) {
        let due: Vec<String> = self
            .reminders
            .iter_mut()
            .filter(|r| !r.acknowledged && r.due <= now)
            .map(|r| {
                r.acknowledged = true;
                r.kind.clone()
            })
            .collect();
        for kind in due {
            self.raise(AlertCheck {
                message: format!("Reminder: {}", kind),
                level: AlertLevel::Warning,
                source: AlertSource::Reminder,
            }, now);
        }
    }

    fn occlusion_tick(&mut self, now: DateTime<Utc>) {
        if !self.state.running || self.rng.gen_range(0..OCCLUSION_ODDS) != 0 {
            return;
        }
        self.occlusion(now);
    }

    fn occlusion(&mut self, now: DateTime<Utc>) {
        self.raise(AlertCheck {
            message: OCCLUSION_MESSAGE.to_string(),
            level: AlertLevel::Critical,
            source: AlertSource::Pump,
        }, now);
        self.state.suspend_reason = Some(SuspendReason::Occlusion);
        if self.insulin.suspend_basal(now) {
            self.emit(PumpEvent::BasalRateChanged(0.0));
        }
    }

    pub fn is_occluded(&self) -> bool {
        self.state.suspend_reason == Some(SuspendReason::Occlusion)
    }

    /// The user has replaced the infusion set: lift the occlusion hold and,
    /// while running, restart the active profile's basal. Returns false when
    /// no occlusion was holding delivery.
    pub fn resume_delivery(&mut self) -> bool {
        if !self.is_occluded() {
            return false;
        }
        let now = self.clock.now();
        self.state.suspend_reason = None;
        self.state.last_action = now;
        self.alerts
            .log_event("Infusion set replaced - delivery resumed", AlertLevel::Info, now);
        if self.state.running {
            let profile = self.profiles.active().clone();
            let rate = self.insulin.start_basal(profile.basal_rate, &profile.name, false, now);
            tracing::info!(rate, "basal resumed after occlusion");
            self.emit(PumpEvent::BasalRateChanged(rate));
        }
        true
    }

    fn shutdown(&mut self) {
        tracing::warn!(battery = self.state.battery_level, "battery depleted, shutting down");
        self.emit(PumpEvent::ShutdownRequested);
        self.stop();
    }

    // Alert checks

    fn raise(&mut self, check: AlertCheck, now: DateTime<Utc>) -> Option<Alert> {
        let alert = self.alerts.raise_check(check, now)?;
        self.emit(PumpEvent::AlertRaised {
            id: alert.id,
            message: alert.message.clone(),
            level: alert.level,
        });
        if alert.level == AlertLevel::Critical {
            self.emit(PumpEvent::CriticalAlert {
                message: alert.message.clone(),
            });
        }
        Some(alert)
    }

    fn check_glucose(&mut self, now: DateTime<Utc>) {
        if !self.alerts.is_enabled() {
            return;
        }
        let value = self.glucose.current_value();
        let checks = [
            alerts::evaluate_glucose(value, self.alerts.thresholds()),
            alerts::evaluate_trend(self.glucose.trend()),
        ];
        for check in checks.into_iter().flatten() {
            self.raise(check, now);
        }
    }

    fn check_insulin(&mut self, now: DateTime<Utc>) {
        if !self.alerts.is_enabled() {
            return;
        }
        if let Some(check) = alerts::evaluate_insulin(self.state.insulin_remaining, self.alerts.thresholds()) {
            self.raise(check, now);
        }
    }

    fn check_battery(&mut self, now: DateTime<Utc>) {
        if self.alerts.is_enabled() {
            if let Some(check) = alerts::evaluate_battery(self.state.battery_level, self.alerts.thresholds()) {
                self.raise(check, now);
            }
        }
        if self.state.running && self.state.battery_level <= BATTERY_SHUTDOWN && !self.shutdown_scheduled {
            self.shutdown_scheduled = true;
            self.queue
                .schedule_at(now + Duration::seconds(SHUTDOWN_DELAY_SECS), Task::Shutdown);
        }
    }

    // Bolus

    /// Start a manual bolus. Units above the configured maximum are clamped.
    pub fn deliver_bolus(&mut self, units: InsulinUnits, extended: bool, duration_minutes: u32) -> Result<(), PumpError> {
        if !self.state.running {
            return Err(PumpError::NotRunning);
        }
        if self.is_occluded() {
            return Err(PumpError::Occluded);
        }
        let now = self.clock.now();
        let units = if units > self.config.bolus.max_units {
            self.config.bolus.max_units
        } else {
            units
        };
        let plan = match self.insulin.deliver_bolus(
            units,
            "Manual",
            extended,
            duration_minutes,
            self.state.insulin_remaining,
            now,
        ) {
            Ok(plan) => plan,
            Err(e) => {
                if matches!(e, PumpError::InsufficientInsulin { .. }) {
                    self.alerts
                        .log_event("Not enough insulin remaining for bolus", AlertLevel::Warning, now);
                }
                tracing::warn!("bolus rejected: {}", e);
                return Err(e);
            }
        };

        let first = if extended {
            scaled_period(plan.step_interval_secs, self.config.simulation.speed_factor)
        } else {
            Duration::seconds(STANDARD_BOLUS_DELAY_SECS)
        };
        self.queue.schedule_at(now + first, Task::BolusStep { bolus_id: plan.id });
        self.state.last_action = now;
        self.emit(PumpEvent::BolusStarted { units: plan.units });
        self.refresh_iob(now);
        Ok(())
    }

    /// Stop the running bolus. Returns `(delivered, requested)`.
    pub fn cancel_bolus(&mut self) -> Result<(InsulinUnits, InsulinUnits), PumpError> {
        let now = self.clock.now();
        let (delivered, requested) = self.insulin.cancel_bolus(now)?;
        self.queue.cancel(|t| matches!(t, Task::BolusStep { .. }));
        self.state.last_action = now;
        self.emit(PumpEvent::BolusCancelled { delivered, requested });
        self.refresh_iob(now);
        Ok((delivered, requested))
    }

    pub fn is_bolus_active(&self) -> bool {
        self.insulin.is_bolus_active()
    }

    /// Carb + correction suggestion for the active profile and current state.
    pub fn suggested_bolus(&self, carbs: f64) -> InsulinUnits {
        calculator::suggested_bolus(
            self.glucose.current_value(),
            carbs,
            self.profiles.active(),
            self.state.insulin_on_board,
            self.config.bolus.max_units,
        )
    }

    pub fn is_bolus_safe(&self, units: InsulinUnits) -> bool {
        calculator::is_bolus_safe(
            units,
            self.glucose.current_value(),
            self.state.insulin_on_board,
            self.config.bolus.max_units,
        )
    }

    // Profiles

    pub fn set_active_profile(&mut self, name: &str) -> Result<(), PumpError> {
        if self.profiles.set_active(name)? {
            self.apply_active_profile();
        }
        Ok(())
    }

    pub fn create_profile(&mut self, profile: Profile) -> Result<(), PumpError> {
        self.profiles.create(profile)?;
        Ok(())
    }

    pub fn update_profile(&mut self, name: &str, profile: Profile) -> Result<(), PumpError> {
        let was_active = self.profiles.active_name() == name;
        self.profiles.update(name, profile)?;
        if was_active {
            self.apply_active_profile();
        }
        Ok(())
    }

    pub fn delete_profile(&mut self, name: &str) -> Result<(), PumpError> {
        let was_active = self.profiles.active_name() == name;
        self.profiles.delete(name)?;
        if was_active {
            self.apply_active_profile();
        }
        Ok(())
    }

    pub fn deactivate_profile(&mut self, name: &str) -> Result<(), PumpError> {
        if self.profiles.deactivate(name)? {
            self.apply_active_profile();
        }
        Ok(())
    }

    /// Publish the active profile and, while running, restart basal on it.
    fn apply_active_profile(&mut self) {
        let now = self.clock.now();
        let profile = self.profiles.active().clone();
        self.state.profile_name = profile.name.clone();
        self.state.last_action = now;
        tracing::info!(profile = %profile.name, "active profile changed");
        self.emit(PumpEvent::ProfileChanged(profile.name.clone()));
        if self.state.running && self.state.suspend_reason.is_none() {
            let rate = self.insulin.start_basal(profile.basal_rate, &profile.name, false, now);
            self.emit(PumpEvent::BasalRateChanged(rate));
        }
    }

    pub fn profiles(&self) -> &ProfileStore {
        &self.profiles
    }

    pub fn active_profile(&self) -> &Profile {
        self.profiles.active()
    }

    // Charging

    pub fn start_charging(&mut self) {
        if self.state.charging {
            return;
        }
        let now = self.clock.now();
        self.state.charging = true;
        self.queue
            .schedule_every(now, Duration::seconds(CHARGE_STEP_SECS), Task::Charge);
        self.emit(PumpEvent::ChargingChanged(true));
    }

    pub fn stop_charging(&mut self) {
        if !self.state.charging {
            return;
        }
        self.state.charging = false;
        self.queue.cancel(|t| *t == Task::Charge);
        self.emit(PumpEvent::ChargingChanged(false));
    }

    // Queries

    pub fn state(&self) -> &PumpState {
        &self.state
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn config(&self) -> &PumpConfig {
        &self.config
    }

    pub fn current_glucose(&self) -> GlucoseLevel {
        self.glucose.current_value()
    }

    pub fn trend(&self) -> TrendDirection {
        self.glucose.trend()
    }

    pub fn glucose_history(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<GlucoseReading> {
        self.glucose.readings(start, end)
    }

    pub fn insulin_history(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<InsulinHistoryPoint> {
        self.insulin.history_points(start, end, self.clock.now())
    }

    pub fn bolus_history(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<BolusDelivery> {
        self.insulin.bolus_history(start, end)
    }

    pub fn basal_history(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<BasalSegment> {
        self.insulin.basal_history(start, end, self.clock.now())
    }

    pub fn total_insulin(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> InsulinUnits {
        self.insulin.total_insulin(start, end, self.clock.now())
    }

    pub fn insulin(&self) -> &InsulinDelivery {
        &self.insulin
    }

    pub fn glucose(&self) -> &GlucoseSeries {
        &self.glucose
    }

    // Alerts

    pub fn active_alerts(&self) -> &[Alert] {
        self.alerts.active()
    }

    pub fn alert_history(&self) -> Vec<Alert> {
        self.alerts.history().cloned().collect()
    }

    pub fn event_log(&self) -> Vec<EventRecord> {
        self.alerts.events().cloned().collect()
    }

    pub fn acknowledge_alert(&mut self, id: u64) -> bool {
        self.alerts.acknowledge(id)
    }

    pub fn acknowledge_all_alerts(&mut self) -> usize {
        self.alerts.acknowledge_all()
    }

    pub fn has_critical_alerts(&self) -> bool {
        self.alerts.has_critical_alerts()
    }

    pub fn alerts_of_level(&self, level: AlertLevel) -> Vec<Alert> {
        self.alerts.alerts_of_level(level).into_iter().cloned().collect()
    }

    pub fn attempt_recovery(&mut self, id: u64) -> bool {
        let now = self.clock.now();
        self.alerts.attempt_recovery(id, now)
    }

    pub fn recovery(&self, id: u64) -> Option<(Recovery, &'static str)> {
        self.alerts
            .find(id)
            .map(|a| (alerts::classify_recovery(a), alerts::recovery_instructions(a)))
    }

    pub fn set_alerts_enabled(&mut self, enabled: bool) {
        self.alerts.set_enabled(enabled);
    }

    pub fn set_alert_thresholds(&mut self, thresholds: AlertThresholds) -> Result<(), ConfigError> {
        self.alerts.set_thresholds(thresholds.clone())?;
        self.config.alerts = thresholds;
        Ok(())
    }

    pub fn add_reminder(&mut self, kind: &str, due: DateTime<Utc>) {
        self.reminders.push(Reminder {
            kind: kind.to_string(),
            due,
            acknowledged: false,
        });
    }

    pub fn reminders(&self) -> &[Reminder] {
        &self.reminders
    }

    // Control-IQ settings

    pub fn control_settings(&self) -> &ControlSettings {
        &self.control
    }

    pub fn set_control_settings(&mut self, settings: ControlSettings) -> Result<(), ConfigError> {
        settings.validate()?;
        self.control = settings;
        Ok(())
    }

    pub fn set_control_iq_enabled(&mut self, enabled: bool) {
        self.control.enabled = enabled;
    }

    pub fn set_activity_mode(&mut self, mode: ActivityMode) {
        self.control.activity_mode = mode;
    }

    // Test overrides

    /// Record `value` as a reading taken now, as if the CGM had reported it.
    pub fn force_glucose(&mut self, value: GlucoseLevel) {
        let now = self.clock.now();
        self.record_reading(value.clamp(GLUCOSE_MIN, GLUCOSE_MAX), now);
    }

    pub fn force_trend(&mut self, trend: TrendDirection) {
        self.glucose.force_trend(trend);
        self.emit(PumpEvent::TrendChanged(trend));
    }

    pub fn force_battery(&mut self, level: u8) {
        let now = self.clock.now();
        self.state.battery_level = level.min(BATTERY_FULL);
        self.emit(PumpEvent::BatteryLevelChanged(self.state.battery_level));
        self.check_battery(now);
    }

    pub fn force_insulin(&mut self, units: InsulinUnits) {
        let now = self.clock.now();
        self.state.insulin_remaining = units.clamp(0.0, RESERVOIR_CAPACITY);
        self.emit(PumpEvent::InsulinRemainingChanged(self.state.insulin_remaining));
        self.check_insulin(now);
    }

    pub fn force_occlusion(&mut self) {
        let now = self.clock.now();
        self.occlusion(now);
    }

    pub fn inject_alert(&mut self, message: &str, level: AlertLevel) -> Option<Alert> {
        let now = self.clock.now();
        self.raise(AlertCheck {
            message: message.to_string(),
            level,
            source: AlertSource::TestHarness,
        }, now)
    }

    // Persistence

    pub fn documents(&self) -> PumpDocuments {
        PumpDocuments {
            state: PumpStateDoc {
                battery_level: self.state.battery_level,
                insulin_remaining: self.state.insulin_remaining,
                power_state: self.state.power_state(),
                last_action: self.state.last_action,
                profile_name: self.profiles.active_name().to_string(),
                insulin_on_board: self.state.insulin_on_board,
                last_control_iq_delta: self.state.last_control_delta,
                occluded: self.is_occluded(),
                active_alerts: self.alerts.active().to_vec(),
                alert_history: self.alerts.history().cloned().collect(),
            },
            glucose: GlucoseDoc {
                readings: self.glucose.iter().copied().collect(),
                trend: self.glucose.trend(),
            },
            insulin: InsulinDoc {
                current_bolus: self.insulin.current_bolus().cloned(),
                last_bolus: self.insulin.last_bolus().cloned(),
                bolus_history: self.insulin.all_boluses().to_vec(),
                basal_history: self.insulin.closed_segments().to_vec(),
                current_basal: self.insulin.last_basal(),
                basal_active: self.insulin.is_basal_active(),
                insulin_on_board: self.insulin.insulin_on_board(),
                last_control_iq_adjustment: self.insulin.last_control_adjustment(),
            },
            profiles: ProfilesDoc {
                profiles: self.profiles.all(),
                active_profile: self.profiles.active_name().to_string(),
            },
            events: EventLogDoc {
                events: self.alerts.events().cloned().collect(),
            },
        }
    }

    /// Write every document to the data directory, if one is configured.
    pub fn save(&self) -> Result<(), StorageError> {
        match &self.storage {
            Some(storage) => storage.save_all(&self.documents()),
            None => Ok(()),
        }
    }
}
