// Model-Based Testing — deterministic command replay.
// Given a sequence of Commands, applies each to a Pump on a virtual clock
// and returns the resulting snapshot sequence for inspection.

use chrono::Duration;

use crate::clock::Clock;
use crate::error::PumpError;
use crate::invariants;
use crate::pump::Pump;
use crate::types::*;

/// One externally driven step: a user action, a test override, or the
/// passage of time.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    NoAction,
    Start,
    Stop,
    /// Let this many simulated minutes pass
    Wait { minutes: i64 },
    /// Let this many clock seconds pass
    WaitClock { seconds: i64 },
    Bolus { units: f64 },
    ExtendedBolus { units: f64, minutes: u32 },
    CancelBolus,
    SetProfile { name: String },
    ForceGlucose { value: f64 },
    ForceTrend { trend: TrendDirection },
    ForceBattery { level: u8 },
    ForceInsulin { units: f64 },
    Occlusion,
    ResumeDelivery,
    StartCharging,
    StopCharging,
    AcknowledgeAll,
    SetControlIq { enabled: bool },
    SetActivity { mode: ActivityMode },
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::NoAction => write!(f, "NoAction"),
            Command::Start => write!(f, "Start"),
            Command::Stop => write!(f, "Stop"),
            Command::Wait { minutes } => write!(f, "Wait({}m)", minutes),
            Command::WaitClock { seconds } => write!(f, "WaitClock({}s)", seconds),
            Command::Bolus { units } => write!(f, "Bolus({:.2})", units),
            Command::ExtendedBolus { units, minutes } => write!(f, "ExtendedBolus({:.2}, {}m)", units, minutes),
            Command::CancelBolus => write!(f, "CancelBolus"),
            Command::SetProfile { name } => write!(f, "SetProfile({})", name),
            Command::ForceGlucose { value } => write!(f, "ForceGlucose({:.1})", value),
            Command::ForceTrend { trend } => write!(f, "ForceTrend({})", trend),
            Command::ForceBattery { level } => write!(f, "ForceBattery({})", level),
            Command::ForceInsulin { units } => write!(f, "ForceInsulin({:.1})", units),
            Command::Occlusion => write!(f, "Occlusion"),
            Command::ResumeDelivery => write!(f, "ResumeDelivery"),
            Command::StartCharging => write!(f, "StartCharging"),
            Command::StopCharging => write!(f, "StopCharging"),
            Command::AcknowledgeAll => write!(f, "AcknowledgeAll"),
            Command::SetControlIq { enabled } => write!(f, "SetControlIq({})", enabled),
            Command::SetActivity { mode } => write!(f, "SetActivity({:?})", mode),
        }
    }
}

/// Apply a single command to the pump. Commands that the pump refuses
/// (a bolus while stopped, an unknown profile) return the pump's error.
pub fn apply_command<C: Clock>(pump: &mut Pump<C>, command: &Command) -> Result<(), PumpError> {
    match command {
        Command::NoAction => {}
        Command::Start => {
            pump.start();
        }
        Command::Stop => {
            pump.stop();
        }
        Command::Wait { minutes } => pump.advance_simulated(Duration::minutes(*minutes)),
        Command::WaitClock { seconds } => pump.advance(Duration::seconds(*seconds)),
        Command::Bolus { units } => pump.deliver_bolus(*units, false, 0)?,
        Command::ExtendedBolus { units, minutes } => pump.deliver_bolus(*units, true, *minutes)?,
        Command::CancelBolus => {
            pump.cancel_bolus()?;
        }
        Command::SetProfile { name } => pump.set_active_profile(name)?,
        Command::ForceGlucose { value } => pump.force_glucose(*value),
        Command::ForceTrend { trend } => pump.force_trend(*trend),
        Command::ForceBattery { level } => pump.force_battery(*level),
        Command::ForceInsulin { units } => pump.force_insulin(*units),
        Command::Occlusion => pump.force_occlusion(),
        Command::ResumeDelivery => {
            pump.resume_delivery();
        }
        Command::StartCharging => pump.start_charging(),
        Command::StopCharging => pump.stop_charging(),
        Command::AcknowledgeAll => {
            pump.acknowledge_all_alerts();
        }
        Command::SetControlIq { enabled } => pump.set_control_iq_enabled(*enabled),
        Command::SetActivity { mode } => pump.set_activity_mode(*mode),
    }
    Ok(())
}

/// Replay a full command sequence against `pump`.
/// Each command must succeed; panics with a descriptive message if one is
/// refused or leaves the pump violating an invariant.
/// Returns the sequence of (command, resulting snapshot) pairs.
pub fn replay_trace<C: Clock>(pump: &mut Pump<C>, commands: &[Command]) -> Vec<(Command, PumpSnapshot)> {
    let mut trace = Vec::with_capacity(commands.len());

    for (i, command) in commands.iter().enumerate() {
        if let Err(e) = apply_command(pump, command) {
            panic!(
                "Command {} refused at step {}: {}\nState:\n{}",
                command,
                i,
                e,
                pump.snapshot()
            );
        }

        let snapshot = pump.snapshot();
        if let Err(violated) = invariants::check_invariants(&snapshot) {
            panic!(
                "Invariant '{}' violated after step {} ({})\nState:\n{}",
                violated, i, command, snapshot,
            );
        }

        trace.push((command.clone(), snapshot));
    }

    trace
}
