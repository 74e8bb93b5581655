//! JSON persistence of pump data, one document per file in a data directory.
//!
//! Writes go to a temporary file in the same directory which is then renamed
//! over the target, so a crash mid-write leaves the previous file intact.
//! Loads never fail the caller: a missing file is a cold start and an
//! unreadable one is logged and treated the same way.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::insulin::InFlightBolus;
use crate::types::{
    Alert, BasalSegment, BolusDelivery, EventRecord, GlucoseReading, InsulinUnits, PowerState, Profile,
    TrendDirection,
};

pub const PUMP_STATE_FILE: &str = "pump_state.json";
pub const GLUCOSE_FILE: &str = "glucose_readings.json";
pub const INSULIN_FILE: &str = "insulin_data.json";
pub const PROFILES_FILE: &str = "profiles.json";
pub const EVENT_LOG_FILE: &str = "event_log.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PumpStateDoc {
    pub battery_level: u8,
    pub insulin_remaining: InsulinUnits,
    pub power_state: PowerState,
    pub last_action: DateTime<Utc>,
    pub profile_name: String,
    pub insulin_on_board: InsulinUnits,
    pub last_control_iq_delta: f64,
    #[serde(default)]
    pub occluded: bool,
    #[serde(default)]
    pub active_alerts: Vec<Alert>,
    #[serde(default)]
    pub alert_history: Vec<Alert>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlucoseDoc {
    pub readings: Vec<GlucoseReading>,
    #[serde(default)]
    pub trend: TrendDirection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InsulinDoc {
    #[serde(default)]
    pub current_bolus: Option<InFlightBolus>,
    #[serde(default)]
    pub last_bolus: Option<BolusDelivery>,
    #[serde(default)]
    pub bolus_history: Vec<BolusDelivery>,
    #[serde(default)]
    pub basal_history: Vec<BasalSegment>,
    /// Open segment at save time, or the last closed one
    #[serde(default)]
    pub current_basal: Option<BasalSegment>,
    #[serde(default)]
    pub basal_active: bool,
    #[serde(default)]
    pub insulin_on_board: InsulinUnits,
    #[serde(default)]
    pub last_control_iq_adjustment: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfilesDoc {
    pub profiles: Vec<Profile>,
    pub active_profile: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventLogDoc {
    pub events: Vec<EventRecord>,
}

/// Everything persisted at a stop boundary.
#[derive(Debug, Clone, PartialEq)]
pub struct PumpDocuments {
    pub state: PumpStateDoc,
    pub glucose: GlucoseDoc,
    pub insulin: InsulinDoc,
    pub profiles: ProfilesDoc,
    pub events: EventLogDoc,
}

/// Whatever could be read back; `None` means "use defaults".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadedDocuments {
    pub state: Option<PumpStateDoc>,
    pub glucose: Option<GlucoseDoc>,
    pub insulin: Option<InsulinDoc>,
    pub profiles: Option<ProfilesDoc>,
    pub events: Option<EventLogDoc>,
}

#[derive(Debug, Clone)]
pub struct Storage {
    dir: PathBuf,
}

impl Storage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_of(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// Serialize `value` and atomically replace `name` in the data directory.
    pub fn save_json<T: Serialize>(&self, name: &str, value: &T) -> Result<(), StorageError> {
        fs::create_dir_all(&self.dir)?;
        let json = serde_json::to_string_pretty(value)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(json.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(self.path_of(name))?;
        Ok(())
    }

    /// Read `name`; `None` if it is missing or unreadable.
    pub fn load_json<T: DeserializeOwned>(&self, name: &str) -> Option<T> {
        let path = self.path_of(name);
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("{} not found, using defaults", path.display());
                return None;
            }
            Err(e) => {
                tracing::warn!("Failed to read {}: {}", path.display(), e);
                return None;
            }
        };
        match serde_json::from_str(&content) {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::warn!("Ignoring corrupt {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Save every document. Stops at the first failure.
    pub fn save_all(&self, docs: &PumpDocuments) -> Result<(), StorageError> {
        self.save_json(PUMP_STATE_FILE, &docs.state)?;
        self.save_json(GLUCOSE_FILE, &docs.glucose)?;
        self.save_json(INSULIN_FILE, &docs.insulin)?;
        self.save_json(PROFILES_FILE, &docs.profiles)?;
        self.save_json(EVENT_LOG_FILE, &docs.events)?;
        tracing::info!("Pump data saved to {}", self.dir.display());
        Ok(())
    }

    pub fn load_all(&self) -> LoadedDocuments {
        LoadedDocuments {
            state: self.load_json(PUMP_STATE_FILE),
            glucose: self.load_json(GLUCOSE_FILE),
            insulin: self.load_json(INSULIN_FILE),
            profiles: self.load_json(PROFILES_FILE),
            events: self.load_json(EVENT_LOG_FILE),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, VirtualClock};

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path());
        let now = VirtualClock::at_epoch().now();
        let doc = GlucoseDoc {
            readings: vec![GlucoseReading { timestamp: now, value: 6.2 }],
            trend: TrendDirection::Rising,
        };
        storage.save_json(GLUCOSE_FILE, &doc).unwrap();
        let loaded: GlucoseDoc = storage.load_json(GLUCOSE_FILE).unwrap();
        assert_eq!(loaded, doc);
    }

    #[test]
    fn test_missing_and_corrupt_files_fall_back() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path());
        assert!(storage.load_json::<ProfilesDoc>(PROFILES_FILE).is_none());
        fs::write(storage.path_of(PROFILES_FILE), "{ not json").unwrap();
        assert!(storage.load_json::<ProfilesDoc>(PROFILES_FILE).is_none());
        assert_eq!(storage.load_all(), LoadedDocuments::default());
    }

    #[test]
    fn test_save_creates_directory_and_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("pump").join("data");
        let storage = Storage::new(&nested);
        storage.save_json(EVENT_LOG_FILE, &EventLogDoc::default()).unwrap();
        let names: Vec<String> = fs::read_dir(&nested)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec![EVENT_LOG_FILE.to_string()]);
    }

    #[test]
    fn test_timestamps_are_iso8601() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path());
        let now = VirtualClock::at_epoch().now();
        let doc = EventLogDoc {
            events: vec![EventRecord {
                timestamp: now,
                message: "Pump started".into(),
                level: crate::types::AlertLevel::Info,
            }],
        };
        storage.save_json(EVENT_LOG_FILE, &doc).unwrap();
        let raw = fs::read_to_string(storage.path_of(EVENT_LOG_FILE)).unwrap();
        assert!(raw.contains("2024-03-01T00:00:00Z"));
    }
}
