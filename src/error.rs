use thiserror::Error;

use crate::types::InsulinUnits;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PumpError {
    #[error("Pump is not running")]
    NotRunning,
    #[error("A bolus is already being delivered")]
    BolusInFlight,
    #[error("No bolus is being delivered")]
    NoBolusInFlight,
    #[error("Invalid bolus amount: {0}")]
    InvalidBolus(InsulinUnits),
    #[error("Extended bolus needs a duration in minutes")]
    MissingDuration,
    #[error("Not enough insulin remaining: requested {requested:.2}, remaining {remaining:.2}")]
    InsufficientInsulin {
        requested: InsulinUnits,
        remaining: InsulinUnits,
    },
    #[error("Delivery is suspended until the infusion set is replaced")]
    Occluded,
    #[error("Profile error: {0}")]
    Profile(#[from] ProfileError),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProfileError {
    #[error("Profile not found: {0}")]
    NotFound(String),
    #[error("Profile already exists: {0}")]
    AlreadyExists(String),
    #[error("Profile has invalid values: {0}")]
    Invalid(String),
    #[error("The Default profile cannot be removed or deactivated")]
    DefaultProtected,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Atomic persist failed: {0}")]
    Persist(#[from] tempfile::PersistError),
}
