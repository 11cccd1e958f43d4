//! One-time opening of the encrypted store and the process-wide holder for
//! the store module.
//!
//! The store is opened exactly once per process. Whoever needs it first runs
//! the open while every other caller waits; the outcome, a handle or a fatal
//! [`UncaughtError`], is kept and handed to every later caller. There is no
//! way back from a fatal outcome short of [`StoreHolder::reset`] after the
//! on-disk state was repaired or wiped.

use parking_lot::{Mutex, RwLock};
use std::fs;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use tracing::{error, info, warn};

use crate::build_info::BuildInfo;
use crate::config::StoreConfig;
use crate::database::{open_database_with, Database, WriteTransaction};
use crate::error::{Result, StoreError, UncaughtError};
use crate::master_key::{KeyScheme, MasterKeyBuilder};
use crate::passphrase::get_or_create_passphrase;
use crate::paths::{ensure_private_dir, secure_prefs_path};
use crate::schema::{app_schemas, SchemaSet};
use crate::secure_prefs::{
    PrefKeyEncryptionScheme, PrefValueEncryptionScheme, PreferenceStore, SecurePreferences,
};
use crate::settings::{GeneralSettings, SettingsRecord};

/// Opens the encrypted store at `path` with the passphrase kept in `prefs`
/// and stamps the settings record with `build`.
///
/// Every failure, whether from the passphrase, the key or the store itself,
/// comes back as [`UncaughtError`].
pub fn open_store(
    schemas: SchemaSet,
    prefs: &dyn PreferenceStore,
    build: &BuildInfo,
    path: &Path,
) -> std::result::Result<Database, UncaughtError> {
    try_open_store(schemas, prefs, build, path).map_err(|e| {
        error!(path = %path.display(), error = %e, "cannot open encrypted store");
        UncaughtError::new(e)
    })
}

fn try_open_store(
    schemas: SchemaSet,
    prefs: &dyn PreferenceStore,
    build: &BuildInfo,
    path: &Path,
) -> Result<Database> {
    let passphrase = get_or_create_passphrase(prefs)?;
    let key = passphrase.decode()?;
    let db = open_database_with(path, schemas, |config| config.encryption_key(&key))?;
    let stamped = db.write_blocking(|tx| stamp_app_version(tx, build))?;
    if stamped {
        info!(version = %build.version_name, code = build.version_code, "settings stamped with app version");
    } else {
        info!("no settings record yet, skipping version stamp");
    }
    Ok(db)
}

/// Updates the app version fields of the first settings record. Does not
/// create one.
pub fn stamp_app_version(tx: &mut WriteTransaction<'_>, build: &BuildInfo) -> Result<bool> {
    tx.update_first::<SettingsRecord, _>(|settings| {
        settings.latest_app_version_name = build.version_name.clone();
        settings.latest_app_version_code = build.version_code;
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreState {
    Uninitialized,
    Opening,
    Open,
    Fatal,
}

enum Slot {
    Empty,
    Open(StoreModule),
    Fatal(UncaughtError),
}

/// Init-once holder of the store module.
pub struct StoreHolder {
    slot: Mutex<Slot>,
    state: RwLock<StoreState>,
}

impl Default for StoreHolder {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreHolder {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot::Empty),
            state: RwLock::new(StoreState::Uninitialized),
        }
    }

    /// The holder shared by the whole process.
    pub fn global() -> &'static StoreHolder {
        static HOLDER: OnceLock<StoreHolder> = OnceLock::new();
        HOLDER.get_or_init(StoreHolder::new)
    }

    pub fn state(&self) -> StoreState {
        *self.state.read()
    }

    /// Returns the open module, running `open` if nobody has yet.
    pub fn get_or_open<F>(&self, open: F) -> std::result::Result<StoreModule, UncaughtError>
    where
        F: FnOnce() -> std::result::Result<StoreModule, UncaughtError>,
    {
        let mut slot = self.slot.lock();
        match &*slot {
            Slot::Open(module) => return Ok(module.clone()),
            Slot::Fatal(err) => return Err(err.clone()),
            Slot::Empty => {}
        }

        *self.state.write() = StoreState::Opening;
        match open() {
            Ok(module) => {
                *slot = Slot::Open(module.clone());
                *self.state.write() = StoreState::Open;
                Ok(module)
            }
            Err(err) => {
                *slot = Slot::Fatal(err.clone());
                *self.state.write() = StoreState::Fatal;
                Err(err)
            }
        }
    }

    pub fn get(&self) -> Option<StoreModule> {
        match &*self.slot.lock() {
            Slot::Open(module) => Some(module.clone()),
            _ => None,
        }
    }

    /// Forgets the current outcome. Only for use after the on-disk state was
    /// repaired or wiped.
    pub fn reset(&self) -> StoreState {
        let mut slot = self.slot.lock();
        *slot = Slot::Empty;
        let mut state = self.state.write();
        std::mem::replace(&mut *state, StoreState::Uninitialized)
    }
}

/// The store's dependency graph: secure preferences, the eagerly opened
/// store and the repositories on top of it.
#[derive(Debug, Clone)]
pub struct StoreModule {
    pub config: StoreConfig,
    pub secure_prefs: Arc<SecurePreferences>,
    pub database: Arc<Database>,
    pub settings: GeneralSettings,
}

impl StoreModule {
    pub fn build(config: StoreConfig) -> std::result::Result<Self, UncaughtError> {
        Self::build_with(config, StoreHolder::global())
    }

    /// Returns the module held by `holder`, opening it from `config` first
    /// if needed. Once open, the module is tied to its data directory, file
    /// names and key backend; asking for another location is an error. A
    /// different `config.build` is ignored, the store was already stamped.
    pub fn build_with(
        config: StoreConfig,
        holder: &StoreHolder,
    ) -> std::result::Result<Self, UncaughtError> {
        let module = holder.get_or_open(|| Self::open(config.clone()))?;
        if !module.config.same_location(&config) {
            return Err(UncaughtError::new(StoreError::Config(format!(
                "store already open in {}, cannot switch to {}",
                module.config.data_dir.display(),
                config.data_dir.display()
            ))));
        }
        Ok(module)
    }

    /// Opens the secure preferences and the store without going through a
    /// holder.
    pub fn open(config: StoreConfig) -> std::result::Result<Self, UncaughtError> {
        let secure_prefs = Arc::new(open_secure_prefs(&config).map_err(|e| {
            error!(data_dir = %config.data_dir.display(), error = %e, "cannot open secure preferences");
            e
        })?);
        let database = Arc::new(open_store(
            app_schemas(),
            secure_prefs.as_ref(),
            &config.build,
            &config.database_path(),
        )?);
        let settings = GeneralSettings::new(Arc::clone(&database));
        Ok(Self {
            config,
            secure_prefs,
            database,
            settings,
        })
    }
}

/// Opens the secure preferences described by `config`, creating the master
/// key on first use.
pub fn open_secure_prefs(
    config: &StoreConfig,
) -> std::result::Result<SecurePreferences, UncaughtError> {
    ensure_private_dir(&config.data_dir)?;
    let master_key = MasterKeyBuilder::new(&config.master_key_alias)
        .set_key_scheme(KeyScheme::Aes256Gcm)
        .backend(config.master_key_backend())
        .build();
    let prefs = SecurePreferences::create(
        &config.data_dir,
        &config.prefs_file_name,
        master_key,
        PrefKeyEncryptionScheme::Aes256Siv,
        PrefValueEncryptionScheme::Aes256Gcm,
    )?;
    Ok(prefs)
}

/// Wipes the store, the secure preferences and the master key, and puts
/// `holder` back to [`StoreState::Uninitialized`]. The next open starts a new
/// installation with a new passphrase.
pub fn reset_installation(config: &StoreConfig, holder: &StoreHolder) -> Result<()> {
    let previous = holder.reset();
    remove_if_exists(&config.database_path())?;
    remove_if_exists(&secure_prefs_path(&config.data_dir, &config.prefs_file_name))?;
    MasterKeyBuilder::new(&config.master_key_alias)
        .backend(config.master_key_backend())
        .build()
        .delete()?;
    warn!(data_dir = %config.data_dir.display(), ?previous, "installation reset");
    Ok(())
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StoreError::Io(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KeyBackendKind;
    use crate::passphrase::{ENCRYPTED_REALM_PASSWORD_KEY, PASSPHRASE_SIZE_IN_BYTES};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    fn config(dir: &Path) -> StoreConfig {
        StoreConfig::new(dir)
            .with_key_backend(KeyBackendKind::File)
            .with_build(BuildInfo::new("1.24.0", 12_400))
    }

    #[test]
    fn empty_installation_opens() {
        let dir = tempdir().unwrap();
        let cfg = config(dir.path());
        let prefs = open_secure_prefs(&cfg).unwrap();
        let db = open_store(app_schemas(), &prefs, &cfg.build, &cfg.database_path()).unwrap();

        let passphrase = get_or_create_passphrase(&prefs).unwrap();
        assert_eq!(passphrase.decode().unwrap().len(), PASSPHRASE_SIZE_IN_BYTES);
        assert!(db.query_first::<SettingsRecord>().unwrap().is_none());
    }

    #[test]
    fn existing_settings_get_current_version() {
        let dir = tempdir().unwrap();
        let old = config(dir.path()).with_build(BuildInfo::new("1.20.0", 12_000));
        let prefs = open_secure_prefs(&old).unwrap();
        let db = open_store(app_schemas(), &prefs, &old.build, &old.database_path()).unwrap();
        GeneralSettings::new(Arc::new(db))
            .ensure_initialized(&old.build)
            .unwrap();

        let new = config(dir.path());
        let prefs = open_secure_prefs(&new).unwrap();
        let db = open_store(app_schemas(), &prefs, &new.build, &new.database_path()).unwrap();
        let settings = db.query_first::<SettingsRecord>().unwrap().unwrap();
        assert_eq!(settings.latest_app_version_name, "1.24.0");
        assert_eq!(settings.latest_app_version_code, 12_400);
    }

    #[test]
    fn foreign_passphrase_is_wrapped() {
        let dir = tempdir().unwrap();
        let cfg = config(dir.path());
        let prefs = open_secure_prefs(&cfg).unwrap();
        open_store(app_schemas(), &prefs, &cfg.build, &cfg.database_path()).unwrap();

        let other = tempdir().unwrap();
        let foreign = open_secure_prefs(&config(other.path())).unwrap();
        let err = open_store(app_schemas(), &foreign, &cfg.build, &cfg.database_path()).unwrap_err();
        assert!(matches!(err.cause(), StoreError::InvalidKey(_)));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn undecodable_passphrase_is_wrapped() {
        let dir = tempdir().unwrap();
        let cfg = config(dir.path());
        let prefs = open_secure_prefs(&cfg).unwrap();
        prefs
            .put_string(ENCRYPTED_REALM_PASSWORD_KEY, "not base64 !!")
            .unwrap();
        let err = open_store(app_schemas(), &prefs, &cfg.build, &cfg.database_path()).unwrap_err();
        assert!(matches!(err.cause(), StoreError::Crypto(_)));
    }

    #[test]
    fn holder_opens_once() {
        let dir = tempdir().unwrap();
        let holder = StoreHolder::new();
        assert_eq!(holder.state(), StoreState::Uninitialized);

        let first = StoreModule::build_with(config(dir.path()), &holder).unwrap();
        let second = StoreModule::build_with(config(dir.path()), &holder).unwrap();
        assert!(Arc::ptr_eq(&first.database, &second.database));
        assert!(Arc::ptr_eq(&first.secure_prefs, &second.secure_prefs));
        assert_eq!(holder.state(), StoreState::Open);
    }

    #[test]
    fn open_module_refuses_another_location() {
        let first_dir = tempdir().unwrap();
        let second_dir = tempdir().unwrap();
        let holder = StoreHolder::new();
        let first = StoreModule::build_with(config(first_dir.path()), &holder).unwrap();

        let err = StoreModule::build_with(config(second_dir.path()), &holder).unwrap_err();
        assert!(matches!(err.cause(), StoreError::Config(_)));
        assert!(!second_dir.path().join("REALM_DB_MASTER_KEY.key").exists());
        assert!(!second_dir.path().join("ENCRYPTED_REALM_PREFS_FILE_NAME.json").exists());

        let again = StoreModule::build_with(config(first_dir.path()), &holder).unwrap();
        assert!(Arc::ptr_eq(&first.secure_prefs, &again.secure_prefs));
        assert_eq!(holder.state(), StoreState::Open);
    }

    #[test]
    fn holder_keeps_fatal_outcome() {
        let holder = StoreHolder::new();
        let calls = AtomicUsize::new(0);
        let fail = || {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(UncaughtError::new(StoreError::Corrupted("boom".into())))
        };
        assert!(holder.get_or_open(fail).is_err());
        let again = holder.get_or_open(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(UncaughtError::new(StoreError::NotFound("never".into())))
        });
        assert!(matches!(again.unwrap_err().cause(), StoreError::Corrupted(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(holder.state(), StoreState::Fatal);
        assert!(holder.get().is_none());

        assert_eq!(holder.reset(), StoreState::Fatal);
        assert_eq!(holder.state(), StoreState::Uninitialized);
    }

    #[test]
    fn concurrent_callers_share_one_open() {
        let dir = tempdir().unwrap();
        let holder = Arc::new(StoreHolder::new());
        let opens = Arc::new(AtomicUsize::new(0));
        let cfg = config(dir.path());

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let holder = Arc::clone(&holder);
                let opens = Arc::clone(&opens);
                let cfg = cfg.clone();
                std::thread::spawn(move || {
                    holder
                        .get_or_open(|| {
                            opens.fetch_add(1, Ordering::SeqCst);
                            StoreModule::open(cfg)
                        })
                        .unwrap()
                })
            })
            .collect();
        let modules: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(opens.load(Ordering::SeqCst), 1);
        assert!(modules
            .iter()
            .all(|m| Arc::ptr_eq(&m.database, &modules[0].database)
                && Arc::ptr_eq(&m.secure_prefs, &modules[0].secure_prefs)));
    }

    #[test]
    fn reset_starts_a_new_installation() {
        let dir = tempdir().unwrap();
        let holder = StoreHolder::new();
        let cfg = config(dir.path());
        let before = StoreModule::build_with(cfg.clone(), &holder).unwrap();
        let old_passphrase = get_or_create_passphrase(before.secure_prefs.as_ref()).unwrap();
        drop(before);

        reset_installation(&cfg, &holder).unwrap();
        assert_eq!(holder.state(), StoreState::Uninitialized);
        assert!(!cfg.database_path().exists());

        let after = StoreModule::build_with(cfg, &holder).unwrap();
        let new_passphrase = get_or_create_passphrase(after.secure_prefs.as_ref()).unwrap();
        assert_ne!(old_passphrase, new_passphrase);
    }
}
