// Profiles — named basal/bolus settings with exactly one active entry.
// "Default" always exists and is the fallback whenever the active profile goes away.

use std::collections::BTreeMap;

use crate::constants::{DEFAULT_PROFILE, MAX_BASAL_RATE};
use crate::error::ProfileError;
use crate::types::Profile;

#[derive(Debug, Clone, PartialEq)]
pub struct ProfileStore {
    profiles: BTreeMap<String, Profile>,
    active: String,
}

impl Default for ProfileStore {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Built-in profiles present on a fresh pump.
pub fn default_profiles() -> Vec<Profile> {
    vec![
        Profile::new(DEFAULT_PROFILE, 1.0, 10.0, 2.0, 5.5),
        Profile::new("Sleep", 0.8, 10.0, 2.0, 6.0),
        Profile::new("Exercise", 0.6, 15.0, 2.5, 6.5),
    ]
}

fn check(profile: &Profile) -> Result<(), ProfileError> {
    if !profile.is_valid() {
        return Err(ProfileError::Invalid(profile.name.clone()));
    }
    if profile.basal_rate > MAX_BASAL_RATE {
        return Err(ProfileError::Invalid(format!(
            "{}: basal rate above {} u/hr",
            profile.name, MAX_BASAL_RATE
        )));
    }
    Ok(())
}

impl ProfileStore {
    pub fn with_defaults() -> Self {
        Self {
            profiles: default_profiles()
                .into_iter()
                .map(|p| (p.name.clone(), p))
                .collect(),
            active: DEFAULT_PROFILE.to_string(),
        }
    }

    /// Rebuild from persisted profiles. Invalid entries are dropped, Default is
    /// reinstated if missing, and an unknown active name falls back to Default.
    pub fn restore(profiles: Vec<Profile>, active: &str) -> Self {
        let mut map: BTreeMap<String, Profile> = profiles
            .into_iter()
            .filter(|p| check(p).is_ok())
            .map(|p| (p.name.clone(), p))
            .collect();
        if !map.contains_key(DEFAULT_PROFILE) {
            let default = default_profiles().remove(0);
            map.insert(default.name.clone(), default);
        }
        let active = if map.contains_key(active) {
            active.to_string()
        } else {
            DEFAULT_PROFILE.to_string()
        };
        Self { profiles: map, active }
    }

    pub fn create(&mut self, profile: Profile) -> Result<(), ProfileError> {
        check(&profile)?;
        if self.profiles.contains_key(&profile.name) {
            return Err(ProfileError::AlreadyExists(profile.name));
        }
        self.profiles.insert(profile.name.clone(), profile);
        Ok(())
    }

    /// Replace profile `name`. A different `updated.name` renames it and the
    /// active name follows. Default can be edited but not renamed.
    pub fn update(&mut self, name: &str, updated: Profile) -> Result<(), ProfileError> {
        check(&updated)?;
        if !self.profiles.contains_key(name) {
            return Err(ProfileError::NotFound(name.to_string()));
        }
        if name != updated.name {
            if name == DEFAULT_PROFILE {
                return Err(ProfileError::DefaultProtected);
            }
            if self.profiles.contains_key(&updated.name) {
                return Err(ProfileError::AlreadyExists(updated.name));
            }
            self.profiles.remove(name);
            if self.active == name {
                self.active = updated.name.clone();
            }
        }
        self.profiles.insert(updated.name.clone(), updated);
        Ok(())
    }

    /// Remove a profile. Removing the active one makes Default active.
    pub fn delete(&mut self, name: &str) -> Result<(), ProfileError> {
        if name == DEFAULT_PROFILE {
            return Err(ProfileError::DefaultProtected);
        }
        if self.profiles.remove(name).is_none() {
            return Err(ProfileError::NotFound(name.to_string()));
        }
        if self.active == name {
            self.active = DEFAULT_PROFILE.to_string();
        }
        Ok(())
    }

    /// Returns true when the active profile actually changed.
    pub fn set_active(&mut self, name: &str) -> Result<bool, ProfileError> {
        if !self.profiles.contains_key(name) {
            return Err(ProfileError::NotFound(name.to_string()));
        }
        if self.active == name {
            return Ok(false);
        }
        self.active = name.to_string();
        Ok(true)
    }

    /// Leave profile `name` by switching back to Default.
    pub fn deactivate(&mut self, name: &str) -> Result<bool, ProfileError> {
        if name == DEFAULT_PROFILE {
            return Err(ProfileError::DefaultProtected);
        }
        if !self.profiles.contains_key(name) {
            return Err(ProfileError::NotFound(name.to_string()));
        }
        if self.active != name {
            return Ok(false);
        }
        self.active = DEFAULT_PROFILE.to_string();
        Ok(true)
    }

    pub fn get(&self, name: &str) -> Option<&Profile> {
        self.profiles.get(name)
    }

    pub fn active(&self) -> &Profile {
        // `active` always names a stored profile and Default is never removed
        match self.profiles.get(&self.active) {
            Some(p) => p,
            None => &self.profiles[DEFAULT_PROFILE],
        }
    }

    pub fn active_name(&self) -> &str {
        &self.active
    }

    pub fn names(&self) -> Vec<String> {
        self.profiles.keys().cloned().collect()
    }

    pub fn all(&self) -> Vec<Profile> {
        self.profiles.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let store = ProfileStore::default();
        assert_eq!(store.names(), vec!["Default", "Exercise", "Sleep"]);
        assert_eq!(store.active_name(), "Default");
        assert_eq!(store.active().basal_rate, 1.0);
    }

    #[test]
    fn test_create_rejects_invalid_and_duplicates() {
        let mut store = ProfileStore::default();
        assert!(matches!(
            store.create(Profile::new("Sick", 0.0, 10.0, 2.0, 6.0)),
            Err(ProfileError::Invalid(_))
        ));
        assert!(matches!(
            store.create(Profile::new("", 1.0, 10.0, 2.0, 6.0)),
            Err(ProfileError::Invalid(_))
        ));
        assert_eq!(
            store.create(Profile::new("Sleep", 1.0, 10.0, 2.0, 6.0)),
            Err(ProfileError::AlreadyExists("Sleep".into()))
        );
        assert!(store.create(Profile::new("Sick", 1.4, 8.0, 1.5, 6.0)).is_ok());
        assert_eq!(store.get("Sick").unwrap().carb_ratio, 8.0);
    }

    #[test]
    fn test_default_is_protected() {
        let mut store = ProfileStore::default();
        assert_eq!(store.delete("Default"), Err(ProfileError::DefaultProtected));
        assert_eq!(store.deactivate("Default"), Err(ProfileError::DefaultProtected));
        assert_eq!(
            store.update("Default", Profile::new("Renamed", 1.0, 10.0, 2.0, 5.5)),
            Err(ProfileError::DefaultProtected)
        );
        assert!(store.get("Default").is_some());
    }

    #[test]
    fn test_rename_active_follows() {
        let mut store = ProfileStore::default();
        assert_eq!(store.set_active("Sleep"), Ok(true));
        assert_eq!(store.set_active("Sleep"), Ok(false));
        store.update("Sleep", Profile::new("Night", 0.7, 10.0, 2.0, 6.0)).unwrap();
        assert_eq!(store.active_name(), "Night");
        assert!(store.get("Sleep").is_none());
        assert_eq!(
            store.update("Night", Profile::new("Exercise", 0.7, 10.0, 2.0, 6.0)),
            Err(ProfileError::AlreadyExists("Exercise".into()))
        );
    }

    #[test]
    fn test_delete_active_falls_back() {
        let mut store = ProfileStore::default();
        store.set_active("Exercise").unwrap();
        store.delete("Exercise").unwrap();
        assert_eq!(store.active_name(), "Default");
        assert_eq!(store.delete("Exercise"), Err(ProfileError::NotFound("Exercise".into())));
    }

    #[test]
    fn test_deactivate() {
        let mut store = ProfileStore::default();
        assert_eq!(store.deactivate("Sleep"), Ok(false));
        store.set_active("Sleep").unwrap();
        assert_eq!(store.deactivate("Sleep"), Ok(true));
        assert_eq!(store.active_name(), "Default");
    }

    #[test]
    fn test_restore_repairs() {
        let store = ProfileStore::restore(
            vec![
                Profile::new("Travel", 1.1, 10.0, 2.0, 6.0),
                Profile::new("Broken", -1.0, 10.0, 2.0, 6.0),
            ],
            "Broken",
        );
        assert_eq!(store.names(), vec!["Default", "Travel"]);
        assert_eq!(store.active_name(), "Default");
    }
}
