// Persistence across pump sessions: save at stop, restore at construction.

use std::fs;

use closed_loop_pump::storage::{INSULIN_FILE, PUMP_STATE_FILE};
use closed_loop_pump::types::*;
use closed_loop_pump::{Clock, Pump, PumpConfig, VirtualClock};
use chrono::Duration;

fn config(dir: &std::path::Path) -> PumpConfig {
    let mut config = PumpConfig::default();
    config.simulation.seed = Some(3);
    config.simulation.history_hours = 0;
    config.simulation.data_dir = Some(dir.to_path_buf());
    config
}

#[test]
fn session_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let clock = VirtualClock::at_epoch();

    let mut first = Pump::new(config(dir.path()), clock.clone()).unwrap();
    first.start();
    first
        .create_profile(Profile::new("Travel", 1.2, 12.0, 2.2, 6.0))
        .unwrap();
    first.set_active_profile("Travel").unwrap();
    first.deliver_bolus(2.0, false, 0).unwrap();
    first.advance(Duration::seconds(30));
    first.force_insulin(8.0);
    let remaining = first.state().insulin_remaining;
    let readings = first.glucose().len();
    assert!(first.stop());

    clock.advance(Duration::minutes(10));
    let second = Pump::new(config(dir.path()), clock.clone()).unwrap();

    assert!(!second.is_running());
    assert!(!second.snapshot().basal_active);
    assert_eq!(second.snapshot().active_profile, "Travel");
    assert_eq!(second.profiles().get("Travel").unwrap().carb_ratio, 12.0);
    assert_eq!(second.state().insulin_remaining, remaining);
    assert_eq!(second.glucose().len(), readings);

    let boluses = second.bolus_history(clock.now() - Duration::hours(1), clock.now());
    assert_eq!(boluses.len(), 1);
    assert_eq!(boluses[0].units, 2.0);
    assert!(boluses[0].completed);

    // the critical reservoir alert is still waiting to be acknowledged
    assert!(second.has_critical_alerts());
    assert!(second.event_log().iter().any(|e| e.message == "Pump started"));
    assert!(second.event_log().iter().any(|e| e.message == "Pump stopped"));
}

#[test]
fn in_flight_bolus_is_not_resumed() {
    let dir = tempfile::tempdir().unwrap();
    let clock = VirtualClock::at_epoch();

    let mut first = Pump::new(config(dir.path()), clock.clone()).unwrap();
    first.start();
    first.deliver_bolus(4.0, true, 120).unwrap();
    first.advance(Duration::seconds(30));
    first.save().unwrap();
    assert!(first.is_bolus_active());

    let raw = fs::read_to_string(dir.path().join(INSULIN_FILE)).unwrap();
    assert!(raw.contains("\"currentBolus\""));

    let mut second = Pump::new(config(dir.path()), clock.clone()).unwrap();
    assert!(!second.is_bolus_active());
    second.start();
    assert!(second.deliver_bolus(1.0, false, 0).is_ok());
}

#[test]
fn occlusion_hold_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let clock = VirtualClock::at_epoch();

    let mut first = Pump::new(config(dir.path()), clock.clone()).unwrap();
    first.start();
    first.force_occlusion();
    first.acknowledge_all_alerts();
    assert!(first.stop());

    let mut second = Pump::new(config(dir.path()), clock.clone()).unwrap();
    assert!(second.is_occluded());
    second.start();
    assert!(!second.snapshot().basal_active);
    assert!(second.resume_delivery());
    assert!(second.snapshot().basal_active);
}

#[test]
fn battery_shutdown_persists_without_explicit_save() {
    let dir = tempfile::tempdir().unwrap();
    let clock = VirtualClock::at_epoch();

    let mut pump = Pump::new(config(dir.path()), clock.clone()).unwrap();
    pump.start();
    pump.force_battery(2);
    pump.advance(Duration::seconds(15));
    assert!(!pump.is_running());
    assert!(!pump.stop());

    let raw = fs::read_to_string(dir.path().join(PUMP_STATE_FILE)).unwrap();
    assert!(raw.contains("\"batteryLevel\": 1"));
}

#[test]
fn corrupt_state_falls_back_to_defaults() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join(PUMP_STATE_FILE), "{\"batteryLevel\": \"full\"").unwrap();

    let pump = Pump::new(config(dir.path()), VirtualClock::at_epoch()).unwrap();
    let snap = pump.snapshot();
    assert_eq!(snap.battery_level, 100);
    assert_eq!(snap.insulin_remaining, 300.0);
    assert_eq!(snap.active_profile, "Default");
    assert!(snap.active_alerts.is_empty());
}

#[test]
fn stop_without_data_dir_is_harmless() {
    let mut config = PumpConfig::default();
    config.simulation.history_hours = 0;
    let mut pump = Pump::new(config, VirtualClock::at_epoch()).unwrap();
    pump.start();
    assert!(pump.stop());
    assert!(pump.save().is_ok());
}
