use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::build_info::BuildInfo;
use crate::error::{Result, StoreError};
use crate::master_key::{KeyBackend, REALM_MASTER_KEY_ALIAS};
use crate::paths::{data_dir, database_path, master_key_path};

pub const ENCRYPTED_REALM_PREFS_FILE_NAME: &str = "ENCRYPTED_REALM_PREFS_FILE_NAME";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyBackendKind {
    Keyring,
    File,
    Ephemeral,
}

impl FromStr for KeyBackendKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "keyring" => Ok(Self::Keyring),
            "file" => Ok(Self::File),
            "ephemeral" | "memory" => Ok(Self::Ephemeral),
            other => Err(StoreError::Config(format!("unknown key backend: {other}"))),
        }
    }
}

impl fmt::Display for KeyBackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Keyring => "keyring",
            Self::File => "file",
            Self::Ephemeral => "ephemeral",
        };
        f.write_str(name)
    }
}

/// Where the store lives and how its master key is kept.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub data_dir: PathBuf,
    pub prefs_file_name: String,
    pub master_key_alias: String,
    pub key_backend: KeyBackendKind,
    pub build: BuildInfo,
}

impl StoreConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            prefs_file_name: ENCRYPTED_REALM_PREFS_FILE_NAME.to_string(),
            master_key_alias: REALM_MASTER_KEY_ALIAS.to_string(),
            key_backend: KeyBackendKind::Keyring,
            build: BuildInfo::current(),
        }
    }

    /// Platform data directory, with `ERP_DATA_DIR` and
    /// `ERP_MASTER_KEY_BACKEND` taking precedence.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::new(data_dir()?);
        if let Ok(backend) = std::env::var("ERP_MASTER_KEY_BACKEND") {
            config.key_backend = backend.parse()?;
        }
        Ok(config)
    }

    pub fn with_key_backend(mut self, backend: KeyBackendKind) -> Self {
        self.key_backend = backend;
        self
    }

    pub fn with_build(mut self, build: BuildInfo) -> Self {
        self.build = build;
        self
    }

    /// Whether both configs point at the same files and master key.
    pub fn same_location(&self, other: &StoreConfig) -> bool {
        self.data_dir == other.data_dir
            && self.prefs_file_name == other.prefs_file_name
            && self.master_key_alias == other.master_key_alias
            && self.key_backend == other.key_backend
    }

    pub fn database_path(&self) -> PathBuf {
        database_path(&self.data_dir)
    }

    pub fn master_key_backend(&self) -> KeyBackend {
        match self.key_backend {
            KeyBackendKind::Keyring => KeyBackend::Keyring,
            KeyBackendKind::File => {
                KeyBackend::File(master_key_path(&self.data_dir, &self.master_key_alias))
            }
            KeyBackendKind::Ephemeral => KeyBackend::Ephemeral,
        }
    }
}
