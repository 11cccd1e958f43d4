//! Master key handling for the secure preference store.
//!
//! The master key never leaves the platform credential store except while a
//! preference file is being read or written. It is created on first access
//! under a fixed alias.

use base64::{engine::general_purpose, Engine as _};
use keyring::Entry;
use parking_lot::Mutex;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::crypto::{random_bytes, SUBKEY_LEN};
use crate::error::{Result, StoreError};
use crate::paths::write_atomic;

pub const KEYRING_SERVICE: &str = "de.gematik.erp";
pub const REALM_MASTER_KEY_ALIAS: &str = "REALM_DB_MASTER_KEY";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyScheme {
    Aes256Gcm,
}

impl KeyScheme {
    pub fn key_len(self) -> usize {
        match self {
            KeyScheme::Aes256Gcm => SUBKEY_LEN,
        }
    }
}

pub trait MasterKeyProvider: fmt::Debug + Send + Sync {
    fn alias(&self) -> &str;

    fn scheme(&self) -> KeyScheme;

    /// Returns the key, generating and persisting it on first access.
    fn get_or_create(&self) -> Result<Zeroizing<Vec<u8>>>;

    /// Destroys the key. Everything encrypted under it becomes unreadable.
    fn delete(&self) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyBackend {
    /// OS credential store: Keychain, Credential Manager or Secret Service.
    Keyring,
    /// Owner-only key file, for hosts without a credential store.
    File(PathBuf),
    /// Process memory only. Every run starts with a fresh key.
    Ephemeral,
}

pub struct MasterKeyBuilder {
    alias: String,
    scheme: KeyScheme,
    backend: KeyBackend,
}

impl MasterKeyBuilder {
    pub fn new(alias: &str) -> Self {
        Self {
            alias: alias.to_string(),
            scheme: KeyScheme::Aes256Gcm,
            backend: KeyBackend::Keyring,
        }
    }

    pub fn set_key_scheme(mut self, scheme: KeyScheme) -> Self {
        self.scheme = scheme;
        self
    }

    pub fn backend(mut self, backend: KeyBackend) -> Self {
        self.backend = backend;
        self
    }

    pub fn build(self) -> Box<dyn MasterKeyProvider> {
        match self.backend {
            KeyBackend::Keyring => Box::new(KeyringMasterKey {
                alias: self.alias,
                scheme: self.scheme,
            }),
            KeyBackend::File(path) => Box::new(FileMasterKey {
                alias: self.alias,
                scheme: self.scheme,
                path,
            }),
            KeyBackend::Ephemeral => Box::new(EphemeralMasterKey::new(&self.alias, self.scheme)),
        }
    }
}

#[derive(Debug)]
pub struct KeyringMasterKey {
    alias: String,
    scheme: KeyScheme,
}

impl KeyringMasterKey {
    fn entry(&self) -> Result<Entry> {
        Entry::new(KEYRING_SERVICE, &self.alias)
            .map_err(|e| StoreError::Keyring(format!("keyring init: {e}")))
    }
}

impl MasterKeyProvider for KeyringMasterKey {
    fn alias(&self) -> &str {
        &self.alias
    }

    fn scheme(&self) -> KeyScheme {
        self.scheme
    }

    fn get_or_create(&self) -> Result<Zeroizing<Vec<u8>>> {
        let entry = self.entry()?;
        match entry.get_password() {
            Ok(encoded) => decode_key(&encoded, self.scheme),
            Err(keyring::Error::NoEntry) => {
                info!(alias = %self.alias, "generating master key in os keyring");
                let key = random_bytes(self.scheme.key_len());
                let encoded = Zeroizing::new(general_purpose::STANDARD.encode(&*key));
                entry
                    .set_password(&encoded)
                    .map_err(|e| StoreError::Keyring(format!("store master key: {e}")))?;
                Ok(key)
            }
            Err(e) => Err(StoreError::Keyring(format!("load master key: {e}"))),
        }
    }

    fn delete(&self) -> Result<()> {
        match self.entry()?.delete_password() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(StoreError::Keyring(format!("delete master key: {e}"))),
        }
    }
}

#[derive(Debug)]
pub struct FileMasterKey {
    alias: String,
    scheme: KeyScheme,
    path: PathBuf,
}

impl MasterKeyProvider for FileMasterKey {
    fn alias(&self) -> &str {
        &self.alias
    }

    fn scheme(&self) -> KeyScheme {
        self.scheme
    }

    fn get_or_create(&self) -> Result<Zeroizing<Vec<u8>>> {
        if self.path.exists() {
            let encoded = Zeroizing::new(fs::read_to_string(&self.path)?);
            return decode_key(encoded.trim(), self.scheme);
        }
        info!(alias = %self.alias, path = %self.path.display(), "generating master key file");
        let key = random_bytes(self.scheme.key_len());
        let encoded = Zeroizing::new(general_purpose::STANDARD.encode(&*key));
        write_atomic(&self.path, encoded.as_bytes())?;
        Ok(key)
    }

    fn delete(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

pub struct EphemeralMasterKey {
    alias: String,
    scheme: KeyScheme,
    key: Mutex<Option<Zeroizing<Vec<u8>>>>,
}

impl EphemeralMasterKey {
    pub fn new(alias: &str, scheme: KeyScheme) -> Self {
        Self {
            alias: alias.to_string(),
            scheme,
            key: Mutex::new(None),
        }
    }
}

impl fmt::Debug for EphemeralMasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EphemeralMasterKey")
            .field("alias", &self.alias)
            .field("scheme", &self.scheme)
            .finish_non_exhaustive()
    }
}

impl MasterKeyProvider for EphemeralMasterKey {
    fn alias(&self) -> &str {
        &self.alias
    }

    fn scheme(&self) -> KeyScheme {
        self.scheme
    }

    fn get_or_create(&self) -> Result<Zeroizing<Vec<u8>>> {
        let mut guard = self.key.lock();
        let key = guard.get_or_insert_with(|| {
            debug!(alias = %self.alias, "generating ephemeral master key");
            random_bytes(self.scheme.key_len())
        });
        Ok(key.clone())
    }

    fn delete(&self) -> Result<()> {
        self.key.lock().take();
        Ok(())
    }
}

fn decode_key(encoded: &str, scheme: KeyScheme) -> Result<Zeroizing<Vec<u8>>> {
    let key = Zeroizing::new(
        general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| StoreError::Crypto(format!("decode master key: {e}")))?,
    );
    if key.len() != scheme.key_len() {
        return Err(StoreError::InvalidKeyLength {
            expected: scheme.key_len(),
            actual: key.len(),
        });
    }
    Ok(key)
}
