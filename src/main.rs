use clap::{Parser, Subcommand};
use tracing::Level;

use closed_loop_pump::config::{load_config, PumpConfig};
use closed_loop_pump::invariants;
use closed_loop_pump::simulator;
use closed_loop_pump::{Clock, Pump, PumpEvent, SystemClock, VirtualClock};

#[derive(Parser)]
#[command(name = "closed-loop-pump")]
#[command(about = "Closed-loop insulin pump simulator", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Random traces through the pump, checking safety invariants after every step
    Check {
        #[arg(long, default_value_t = 20)]
        max_steps: usize,

        #[arg(long, default_value_t = 200)]
        max_samples: usize,

        /// Defaults to the current time
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Power the pump on and let it run
    Run {
        /// Simulated hours to run for
        #[arg(long, default_value_t = 24)]
        hours: i64,

        /// Wait on the system clock instead of jumping through time
        #[arg(long)]
        realtime: bool,

        /// Print every pump event
        #[arg(long)]
        events: bool,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(if cli.verbose { Level::DEBUG } else { Level::INFO })
        .with_writer(std::io::stderr)
        .init();

    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => PumpConfig::default(),
    };

    match cli.command {
        Commands::Check {
            max_steps,
            max_samples,
            seed,
        } => {
            let seed = seed.unwrap_or_else(|| {
                std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_nanos() as u64
            });

            println!("Closed-Loop Pump Simulator");
            println!("==========================");
            println!("Running {} traces of {} steps each (seed: {})", max_samples, max_steps, seed);
            if cli.verbose {
                println!("Verbose mode: showing first trace\n");
            }

            println!("Checking invariants:");
            for (name, _) in invariants::ALL_INVARIANTS {
                println!("  - {}", name);
            }

            let result = simulator::run_simulation(&config, max_steps, max_samples, seed, cli.verbose)?;
            println!("{}", result);
            if result.violation.is_some() {
                std::process::exit(1);
            }
        }
        Commands::Run {
            hours,
            realtime,
            events,
        } => {
            if realtime {
                run(Pump::new(config, SystemClock)?, hours, events)?;
            } else {
                run(Pump::new(config, VirtualClock::new(chrono::Utc::now()))?, hours, events)?;
            }
        }
    }
    Ok(())
}

fn run<C: Clock>(mut pump: Pump<C>, hours: i64, events: bool) -> Result<(), Box<dyn std::error::Error>> {
    if events {
        pump.subscribe(|event: &PumpEvent| println!("{:?}", event));
    }
    pump.start();
    for hour in 1..=hours {
        pump.advance_simulated(chrono::Duration::hours(1));
        if !pump.is_running() {
            println!("Pump shut down after {} simulated hours", hour);
            break;
        }
    }
    println!("{}", pump.snapshot());
    // stop persists on its own; a pump that already shut down is saved here
    if !pump.stop() {
        pump.save()?;
    }
    Ok(())
}
