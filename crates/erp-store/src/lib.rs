//! Encrypted local store of the eRezept client.
//!
//! The store is a single encrypted file whose 64-byte key is kept as a
//! passphrase in [`SecurePreferences`], which are in turn sealed under a
//! master key held by the OS keyring. [`StoreModule::build`] wires the whole
//! chain and opens the store once per process.

pub mod bootstrap;
pub mod build_info;
pub mod config;
pub mod crypto;
pub mod database;
pub mod error;
pub mod master_key;
pub mod passphrase;
pub mod paths;
pub mod schema;
pub mod secure_prefs;
pub mod settings;

pub use bootstrap::{
    open_secure_prefs, open_store, reset_installation, StoreHolder, StoreModule, StoreState,
};
pub use build_info::BuildInfo;
pub use config::{KeyBackendKind, StoreConfig};
pub use database::{Database, Record};
pub use error::{Result, StoreError, UncaughtError};
pub use passphrase::{get_or_create_passphrase, Passphrase};
pub use schema::{app_schemas, SchemaSet};
pub use secure_prefs::{PreferenceStore, SecurePreferences};
pub use settings::{AuthenticationMode, GeneralSettings, ProfileRecord, SettingsRecord};
