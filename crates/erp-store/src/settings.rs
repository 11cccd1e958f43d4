use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::build_info::BuildInfo;
use crate::database::{Database, Record};
use crate::error::{Result, StoreError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthenticationMode {
    DeviceSecurity,
    Password,
    #[default]
    Unspecified,
}

/// Singleton record of app-wide settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingsRecord {
    #[serde(default)]
    pub latest_app_version_name: String,
    #[serde(default)]
    pub latest_app_version_code: i64,
    #[serde(default)]
    pub data_protection_version_accepted: Option<DateTime<Utc>>,
    #[serde(default)]
    pub onboarding_succeeded_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub authentication_mode: AuthenticationMode,
    #[serde(default)]
    pub zoom_enabled: bool,
    #[serde(default)]
    pub user_has_accepted_insecure_device: bool,
    #[serde(default)]
    pub authentication_fails: u32,
    #[serde(default)]
    pub welcome_drawer_shown: bool,
    #[serde(default)]
    pub main_screen_tooltip_shown: bool,
    #[serde(default)]
    pub ml_kit_accepted: bool,
}

impl Record for SettingsRecord {
    const COLLECTION: &'static str = "settings";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileRecord {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

impl Record for ProfileRecord {
    const COLLECTION: &'static str = "profiles";
}

impl ProfileRecord {
    pub fn new(name: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            created_at: now,
        }
    }
}

/// Repository over the settings record.
#[derive(Debug, Clone)]
pub struct GeneralSettings {
    db: Arc<Database>,
}

impl GeneralSettings {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn general(&self) -> Result<SettingsRecord> {
        self.db
            .query_first::<SettingsRecord>()?
            .ok_or_else(|| StoreError::NotFound(SettingsRecord::COLLECTION.into()))
    }

    /// First-run initializer. Creates the settings record for `build` when
    /// none exists; returns whether it did.
    pub fn ensure_initialized(&self, build: &BuildInfo) -> Result<bool> {
        self.db.write_blocking(|tx| {
            if tx.query_first::<SettingsRecord>()?.is_some() {
                return Ok(false);
            }
            tx.insert(&SettingsRecord {
                latest_app_version_name: build.version_name.clone(),
                latest_app_version_code: build.version_code,
                ..SettingsRecord::default()
            })?;
            info!(version = %build.version_name, "settings record created");
            Ok(true)
        })
    }

    pub fn accept_updated_data_terms(&self, now: DateTime<Utc>) -> Result<()> {
        self.update(|s| s.data_protection_version_accepted = Some(now))
    }

    pub fn save_onboarding_succeeded_data(
        &self,
        authentication_mode: AuthenticationMode,
        profile_name: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.db.write_blocking(|tx| {
            let found = tx.update_first::<SettingsRecord, _>(|s| {
                s.data_protection_version_accepted = Some(now);
                s.onboarding_succeeded_at = Some(now);
                s.authentication_mode = authentication_mode;
            })?;
            if !found {
                return Err(StoreError::NotFound(SettingsRecord::COLLECTION.into()));
            }
            tx.insert(&ProfileRecord::new(profile_name, now))?;
            debug!("onboarding data saved");
            Ok(())
        })
    }

    pub fn save_authentication_mode(&self, mode: AuthenticationMode) -> Result<()> {
        self.update(|s| s.authentication_mode = mode)
    }

    pub fn authentication_mode(&self) -> Result<AuthenticationMode> {
        Ok(self.general()?.authentication_mode)
    }

    pub fn save_zoom_preference(&self, enabled: bool) -> Result<()> {
        self.update(|s| s.zoom_enabled = enabled)
    }

    pub fn accept_insecure_device(&self) -> Result<()> {
        self.update(|s| s.user_has_accepted_insecure_device = true)
    }

    /// Returns the new failure count.
    pub fn increment_number_of_authentication_failures(&self) -> Result<u32> {
        let mut count = 0;
        self.update(|s| {
            s.authentication_fails = s.authentication_fails.saturating_add(1);
            count = s.authentication_fails;
        })?;
        Ok(count)
    }

    pub fn reset_number_of_authentication_failures(&self) -> Result<()> {
        self.update(|s| s.authentication_fails = 0)
    }

    pub fn save_welcome_drawer_shown(&self) -> Result<()> {
        self.update(|s| s.welcome_drawer_shown = true)
    }

    pub fn save_main_screen_tooltip_shown(&self) -> Result<()> {
        self.update(|s| s.main_screen_tooltip_shown = true)
    }

    pub fn accept_ml_kit(&self) -> Result<()> {
        self.update(|s| s.ml_kit_accepted = true)
    }

    pub fn profiles(&self) -> Result<Vec<ProfileRecord>> {
        self.db.query::<ProfileRecord>()
    }

    fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut SettingsRecord),
    {
        self.db.write_blocking(|tx| {
            if tx.update_first::<SettingsRecord, _>(f)? {
                Ok(())
            } else {
                Err(StoreError::NotFound(SettingsRecord::COLLECTION.into()))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::random_bytes;
    use crate::database::{open_database_with, ENCRYPTION_KEY_LEN};
    use crate::schema::app_schemas;
    use tempfile::{tempdir, TempDir};

    fn repo() -> (TempDir, GeneralSettings) {
        let dir = tempdir().unwrap();
        let key = random_bytes(ENCRYPTION_KEY_LEN);
        let db = open_database_with(&dir.path().join("erp.realm"), app_schemas(), |cfg| {
            cfg.encryption_key(&key)
        })
        .unwrap();
        (dir, GeneralSettings::new(Arc::new(db)))
    }

    #[test]
    fn initializer_creates_record_once() {
        let (_dir, settings) = repo();
        let build = BuildInfo::new("1.24.0", 12_400);
        assert!(settings.ensure_initialized(&build).unwrap());
        assert!(!settings.ensure_initialized(&BuildInfo::new("9.9.9", 1)).unwrap());
        let general = settings.general().unwrap();
        assert_eq!(general.latest_app_version_name, "1.24.0");
        assert_eq!(general.latest_app_version_code, 12_400);
    }

    #[test]
    fn operations_need_a_record() {
        let (_dir, settings) = repo();
        assert!(matches!(settings.general(), Err(StoreError::NotFound(_))));
        assert!(matches!(
            settings.save_zoom_preference(true),
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            settings.save_onboarding_succeeded_data(AuthenticationMode::Password, "Ada", Utc::now()),
            Err(StoreError::NotFound(_))
        ));
        assert!(settings.profiles().unwrap().is_empty());
    }

    #[test]
    fn onboarding_sets_mode_and_creates_profile() {
        let (_dir, settings) = repo();
        settings.ensure_initialized(&BuildInfo::current()).unwrap();
        let now = Utc::now();
        settings
            .save_onboarding_succeeded_data(AuthenticationMode::DeviceSecurity, "Ada", now)
            .unwrap();
        let general = settings.general().unwrap();
        assert_eq!(general.onboarding_succeeded_at, Some(now));
        assert_eq!(general.data_protection_version_accepted, Some(now));
        assert_eq!(settings.authentication_mode().unwrap(), AuthenticationMode::DeviceSecurity);
        let profiles = settings.profiles().unwrap();
        assert_eq!(profiles.len(), 1);
        assert_eq!(profiles[0].name, "Ada");
    }

    #[test]
    fn failure_counter() {
        let (_dir, settings) = repo();
        settings.ensure_initialized(&BuildInfo::current()).unwrap();
        assert_eq!(settings.increment_number_of_authentication_failures().unwrap(), 1);
        assert_eq!(settings.increment_number_of_authentication_failures().unwrap(), 2);
        settings.reset_number_of_authentication_failures().unwrap();
        assert_eq!(settings.general().unwrap().authentication_fails, 0);
    }

    #[test]
    fn flags_touch_only_their_field() {
        let (_dir, settings) = repo();
        settings.ensure_initialized(&BuildInfo::current()).unwrap();
        let before = settings.general().unwrap();

        settings.save_zoom_preference(true).unwrap();
        settings.accept_insecure_device().unwrap();
        settings.save_welcome_drawer_shown().unwrap();
        settings.save_main_screen_tooltip_shown().unwrap();
        settings.accept_ml_kit().unwrap();
        settings.save_authentication_mode(AuthenticationMode::Password).unwrap();

        let expected = SettingsRecord {
            zoom_enabled: true,
            user_has_accepted_insecure_device: true,
            welcome_drawer_shown: true,
            main_screen_tooltip_shown: true,
            ml_kit_accepted: true,
            authentication_mode: AuthenticationMode::Password,
            ..before
        };
        assert_eq!(settings.general().unwrap(), expected);
    }

    #[test]
    fn accept_data_terms_records_time() {
        let (_dir, settings) = repo();
        settings.ensure_initialized(&BuildInfo::current()).unwrap();
        let now = Utc::now();
        settings.accept_updated_data_terms(now).unwrap();
        assert_eq!(settings.general().unwrap().data_protection_version_accepted, Some(now));
        assert!(settings.general().unwrap().onboarding_succeeded_at.is_none());
    }
}
