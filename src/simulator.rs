// Simulator — random exploration of the pump through its public commands.
// Each step shuffles the action list and applies the first command the pump
// accepts, then checks every safety invariant on the resulting snapshot.

use rand::seq::SliceRandom;
use rand::Rng;

use crate::clock::VirtualClock;
use crate::config::{ConfigError, PumpConfig};
use crate::invariants;
use crate::mbt::{self, Command};
use crate::profiles::default_profiles;
use crate::pump::Pump;
use crate::types::*;

/// The set of actions the simulator can choose from.
#[derive(Debug, Clone, Copy)]
pub enum Action {
    Start,
    Stop,
    Wait,
    Bolus,
    ExtendedBolus,
    CancelBolus,
    SwitchProfile,
    Meal,
    Hypo,
    Occlusion,
    ReplaceInfusionSet,
    ToggleCharging,
    AcknowledgeAll,
    ToggleControlIq,
    SetActivity,
}

const ALL_ACTIONS: &[Action] = &[
    Action::Start,
    Action::Stop,
    Action::Wait,
    Action::Bolus,
    Action::ExtendedBolus,
    Action::CancelBolus,
    Action::SwitchProfile,
    Action::Meal,
    Action::Hypo,
    Action::Occlusion,
    Action::ReplaceInfusionSet,
    Action::ToggleCharging,
    Action::AcknowledgeAll,
    Action::ToggleControlIq,
    Action::SetActivity,
];

const BOLUS_UNITS: &[f64] = &[0.5, 1.0, 2.5, 4.0, 8.0, 30.0];
const EXTENDED_MINUTES: &[u32] = &[30, 60, 120];
const WAIT_MINUTES: &[i64] = &[1, 5, 15, 30];
const MEAL_PEAKS: &[f64] = &[9.0, 12.0, 16.0];
const HYPO_VALUES: &[f64] = &[3.0, 3.5, 3.8];

/// Build a fresh pump for one trace. Persistence is always off.
pub fn init_pump(base: &PumpConfig, seed: u64) -> Result<Pump<VirtualClock>, ConfigError> {
    let mut config = base.clone();
    config.simulation.seed = Some(seed);
    config.simulation.data_dir = None;
    Pump::new(config, VirtualClock::at_epoch())
}

/// Turn an action into a concrete command, or `None` when it cannot apply.
fn resolve(pump: &Pump<VirtualClock>, action: Action, rng: &mut impl Rng) -> Option<Command> {
    let snap = pump.snapshot();
    let command = match action {
        Action::Start if !snap.running => Command::Start,
        Action::Stop if snap.running => Command::Stop,
        Action::Wait => Command::Wait {
            minutes: *WAIT_MINUTES.choose(rng)?,
        },
        Action::Bolus if snap.running && !snap.bolus_active => Command::Bolus {
            units: *BOLUS_UNITS.choose(rng)?,
        },
        Action::ExtendedBolus if snap.running && !snap.bolus_active => Command::ExtendedBolus {
            units: *BOLUS_UNITS.choose(rng)?,
            minutes: *EXTENDED_MINUTES.choose(rng)?,
        },
        Action::CancelBolus if snap.bolus_active => Command::CancelBolus,
        Action::SwitchProfile => {
            let name = default_profiles().choose(rng)?.name.clone();
            if name == snap.active_profile {
                return None;
            }
            Command::SetProfile { name }
        }
        Action::Meal => Command::ForceGlucose {
            value: *MEAL_PEAKS.choose(rng)?,
        },
        Action::Hypo => Command::ForceGlucose {
            value: *HYPO_VALUES.choose(rng)?,
        },
        Action::Occlusion if snap.running => Command::Occlusion,
        Action::ReplaceInfusionSet if snap.suspend_reason == Some(SuspendReason::Occlusion) => Command::ResumeDelivery,
        Action::ToggleCharging if snap.charging => Command::StopCharging,
        Action::ToggleCharging => Command::StartCharging,
        Action::AcknowledgeAll if !snap.active_alerts.is_empty() => Command::AcknowledgeAll,
        Action::ToggleControlIq => Command::SetControlIq {
            enabled: !pump.control_settings().enabled,
        },
        Action::SetActivity => Command::SetActivity {
            mode: *[ActivityMode::Normal, ActivityMode::Sleep, ActivityMode::Exercise].choose(rng)?,
        },
        _ => return None,
    };
    Some(command)
}

/// Execute a single random step. Returns the applied command.
pub fn step(pump: &mut Pump<VirtualClock>, rng: &mut impl Rng) -> Command {
    let mut actions: Vec<Action> = ALL_ACTIONS.to_vec();
    actions.shuffle(rng);

    for action in actions {
        let Some(command) = resolve(pump, action, rng) else {
            continue;
        };
        if mbt::apply_command(pump, &command).is_ok() {
            return command;
        }
    }

    Command::NoAction
}

/// Result of running one simulation trace.
pub struct TraceResult {
    pub steps: usize,
    pub violation: Option<ViolationInfo>,
    pub final_state: PumpSnapshot,
}

/// Run a single simulation trace for up to `max_steps`.
/// Checks all safety invariants after each step.
pub fn run_trace(
    base: &PumpConfig,
    max_steps: usize,
    rng: &mut impl Rng,
    verbose: bool,
) -> Result<TraceResult, ConfigError> {
    let mut pump = init_pump(base, rng.gen())?;
    let mut state = pump.snapshot();

    if verbose {
        println!("[State 0] init");
        println!("{}\n", state);
    }

    if let Err(invariant) = invariants::check_invariants(&state) {
        return Ok(TraceResult {
            steps: 0,
            violation: Some(ViolationInfo {
                invariant,
                trace: 0,
                step: 0,
                command: Command::NoAction,
                recent: Vec::new(),
                state: state.clone(),
            }),
            final_state: state,
        });
    }

    let mut recent: Vec<Command> = Vec::with_capacity(RECENT_COMMANDS);

    for step_num in 1..=max_steps {
        let command = step(&mut pump, rng);
        let new_state = pump.snapshot();
        if recent.len() == RECENT_COMMANDS {
            recent.remove(0);
        }
        recent.push(command.clone());

        if verbose && new_state != state {
            println!("[State {}] {}", step_num, command);
            println!("{}\n", new_state);
        }

        state = new_state;

        if let Err(invariant) = invariants::check_invariants(&state) {
            if verbose {
                println!("!!! INVARIANT VIOLATION: {} at step {} after {}", invariant, step_num, command);
            }
            return Ok(TraceResult {
                steps: step_num,
                violation: Some(ViolationInfo {
                    invariant,
                    trace: 0,
                    step: step_num,
                    command,
                    recent,
                    state: state.clone(),
                }),
                final_state: state,
            });
        }
    }

    Ok(TraceResult {
        steps: max_steps,
        violation: None,
        final_state: state,
    })
}

/// Run many simulation traces, stopping at the first violation.
pub fn run_simulation(
    base: &PumpConfig,
    max_steps: usize,
    max_samples: usize,
    seed: u64,
    verbose: bool,
) -> Result<SimulationResult, ConfigError> {
    use rand::SeedableRng;
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);

    let start = std::time::Instant::now();
    let mut violation = None;

    for trace_num in 0..max_samples {
        let result = run_trace(base, max_steps, &mut rng, verbose && trace_num == 0)?;

        if let Some(info) = result.violation {
            tracing::error!(
                invariant = info.invariant,
                trace = trace_num,
                step = info.step,
                command = %info.command,
                "invariant violated"
            );
            violation = Some(ViolationInfo { trace: trace_num, ..info });
            break;
        }
    }

    Ok(SimulationResult {
        max_steps,
        max_samples,
        seed,
        elapsed: start.elapsed(),
        violation,
    })
}

/// Commands kept for the violation report.
const RECENT_COMMANDS: usize = 5;

/// Where a trace broke: the invariant, the command that broke it and the
/// few commands leading up to it.
pub struct ViolationInfo {
    pub invariant: &'static str,
    pub trace: usize,
    pub step: usize,
    pub command: Command,
    pub recent: Vec<Command>,
    pub state: PumpSnapshot,
}

pub struct SimulationResult {
    pub max_steps: usize,
    pub max_samples: usize,
    pub seed: u64,
    pub elapsed: std::time::Duration,
    pub violation: Option<ViolationInfo>,
}

impl std::fmt::Display for SimulationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let traces_per_sec = self.max_samples as f64 / self.elapsed.as_secs_f64().max(1e-9);
        writeln!(f)?;
        match &self.violation {
            None => {
                writeln!(
                    f,
                    "[ok] No violation found ({:.0}ms at {:.0} traces/second).",
                    self.elapsed.as_millis(),
                    traces_per_sec,
                )?;
                writeln!(f, "Checked {} traces of {} steps each.", self.max_samples, self.max_steps)?;
            }
            Some(v) => {
                writeln!(
                    f,
                    "[VIOLATION] Invariant '{}' violated at trace {} step {} by {}.",
                    v.invariant, v.trace, v.step, v.command,
                )?;
                if !v.recent.is_empty() {
                    let path: Vec<String> = v.recent.iter().map(|c| c.to_string()).collect();
                    writeln!(f, "Leading commands: {}", path.join(" -> "))?;
                }
                writeln!(f, "State at violation:")?;
                writeln!(f, "{}", v.state)?;
                for alert in &v.state.active_alerts {
                    writeln!(f, "  [{}] {}", alert.level, alert.message)?;
                }
            }
        }
        writeln!(f, "Seed: {} ", self.seed)
    }
}
