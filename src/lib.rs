pub mod alerts;
pub mod calculator;
pub mod clock;
pub mod config;
pub mod constants;
pub mod control;
pub mod error;
pub mod glucose;
pub mod insulin;
pub mod invariants;
pub mod mbt;
pub mod profiles;
pub mod pump;
pub mod scheduler;
pub mod simulator;
pub mod storage;
pub mod types;

pub use clock::{Clock, SystemClock, VirtualClock};
pub use config::PumpConfig;
pub use error::PumpError;
pub use pump::Pump;
pub use types::{PumpEvent, PumpSnapshot};
