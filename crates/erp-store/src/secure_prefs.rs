//! File-backed key-value store with keys and values encrypted at rest.
//!
//! Preference names are encrypted with AES-256-SIV, which is deterministic,
//! so a name always maps to the same ciphertext and lookups never need to
//! decrypt the whole file. Values use AES-256-GCM with a fresh random nonce
//! and are bound to their encrypted name through the AEAD associated data.
//! The file also carries an HMAC tag of the master key so that a replaced
//! master key is refused before anything gets written.

use base64::{engine::general_purpose, Engine as _};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::crypto::{
    derive_siv_subkey, derive_subkey, gcm_decrypt, gcm_encrypt, generate_gcm_nonce, hmac_sha256,
    siv_encrypt, verify_hmac_sha256, GCM_NONCE_LEN,
};
use crate::error::{Result, StoreError};
use crate::master_key::MasterKeyProvider;
use crate::paths::{secure_prefs_path, write_atomic};

pub const PREFS_FORMAT_VERSION: u32 = 1;

const KEY_ENC_LABEL: &str = "erp.prefs.key.siv";
const VALUE_ENC_LABEL: &str = "erp.prefs.value.enc";
const KEY_CHECK_LABEL: &str = "erp.prefs.key.check";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PrefKeyEncryptionScheme {
    Aes256Siv,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PrefValueEncryptionScheme {
    Aes256Gcm,
}

/// Simple string get/set used by the passphrase manager.
pub trait PreferenceStore: Send + Sync {
    fn get_string(&self, key: &str) -> Result<Option<Zeroizing<String>>>;

    fn put_string(&self, key: &str, value: &str) -> Result<()>;

    fn remove(&self, key: &str) -> Result<()>;

    fn contains(&self, key: &str) -> Result<bool> {
        Ok(self.get_string(key)?.is_some())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PrefsFile {
    version: u32,
    key_scheme: PrefKeyEncryptionScheme,
    value_scheme: PrefValueEncryptionScheme,
    master_key_alias: String,
    key_check: String,
    #[serde(default)]
    entries: BTreeMap<String, String>,
}

struct SubKeys {
    key_enc: Zeroizing<Vec<u8>>,
    value_enc: Zeroizing<Vec<u8>>,
    check: Zeroizing<Vec<u8>>,
}

pub struct SecurePreferences {
    path: PathBuf,
    file_name: String,
    key_scheme: PrefKeyEncryptionScheme,
    value_scheme: PrefValueEncryptionScheme,
    master_key: Box<dyn MasterKeyProvider>,
    keys: SubKeys,
    entries: RwLock<BTreeMap<String, String>>,
}

impl fmt::Debug for SecurePreferences {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurePreferences")
            .field("path", &self.path)
            .field("master_key", &self.master_key)
            .field("entries", &self.entries.read().len())
            .finish_non_exhaustive()
    }
}

impl SecurePreferences {
    /// Opens the preference file `file_name` inside `dir`, creating it on
    /// first use. May trigger master key generation.
    pub fn create(
        dir: &Path,
        file_name: &str,
        master_key: Box<dyn MasterKeyProvider>,
        key_scheme: PrefKeyEncryptionScheme,
        value_scheme: PrefValueEncryptionScheme,
    ) -> Result<Self> {
        let path = secure_prefs_path(dir, file_name);
        let master = master_key.get_or_create()?;
        let keys = SubKeys {
            key_enc: derive_siv_subkey(&master, KEY_ENC_LABEL)?,
            value_enc: derive_subkey(&master, VALUE_ENC_LABEL)?,
            check: derive_subkey(&master, KEY_CHECK_LABEL)?,
        };

        let entries = if path.exists() {
            let raw = fs::read(&path)?;
            let file: PrefsFile = serde_json::from_slice(&raw)?;
            if file.version != PREFS_FORMAT_VERSION
                || file.key_scheme != key_scheme
                || file.value_scheme != value_scheme
            {
                return Err(StoreError::Corrupted(format!(
                    "preference file {} uses an unsupported format",
                    path.display()
                )));
            }
            let tag = general_purpose::STANDARD
                .decode(&file.key_check)
                .map_err(|e| StoreError::Corrupted(format!("preference key check: {e}")))?;
            if !verify_hmac_sha256(&keys.check, file_name.as_bytes(), &tag)? {
                return Err(StoreError::InvalidKey(path.display().to_string()));
            }
            debug!(path = %path.display(), entries = file.entries.len(), "loaded secure preferences");
            file.entries
        } else {
            info!(path = %path.display(), "creating secure preferences");
            BTreeMap::new()
        };

        let prefs = Self {
            path,
            file_name: file_name.to_string(),
            key_scheme,
            value_scheme,
            master_key,
            keys,
            entries: RwLock::new(entries),
        };
        if !prefs.path.exists() {
            prefs.persist(&prefs.entries.read())?;
        }
        Ok(prefs)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn edit(&self) -> Editor<'_> {
        Editor {
            prefs: self,
            clear: false,
            ops: Vec::new(),
        }
    }

    fn encrypt_key(&self, key: &str) -> Result<String> {
        let ct = siv_encrypt(&self.keys.key_enc, key.as_bytes(), self.file_name.as_bytes())?;
        Ok(general_purpose::STANDARD.encode(ct))
    }

    fn encrypt_value(&self, encrypted_key: &str, value: &str) -> Result<String> {
        let nonce = generate_gcm_nonce();
        let ct = gcm_encrypt(
            &self.keys.value_enc,
            &nonce,
            value.as_bytes(),
            encrypted_key.as_bytes(),
        )?;
        Ok(encode_sealed(&nonce, &ct))
    }

    fn decrypt_value(&self, encrypted_key: &str, sealed: &str) -> Result<Zeroizing<String>> {
        let (nonce, ct) = decode_sealed(sealed)?;
        let plain = gcm_decrypt(&self.keys.value_enc, &nonce, &ct, encrypted_key.as_bytes())?;
        let value = std::str::from_utf8(&plain)
            .map_err(|_| StoreError::Corrupted("preference value is not utf-8".into()))?;
        Ok(Zeroizing::new(value.to_string()))
    }

    fn persist(&self, entries: &BTreeMap<String, String>) -> Result<()> {
        let file = PrefsFile {
            version: PREFS_FORMAT_VERSION,
            key_scheme: self.key_scheme,
            value_scheme: self.value_scheme,
            master_key_alias: self.master_key.alias().to_string(),
            key_check: general_purpose::STANDARD
                .encode(hmac_sha256(&self.keys.check, self.file_name.as_bytes())?),
            entries: entries.clone(),
        };
        write_atomic(&self.path, &serde_json::to_vec_pretty(&file)?)
    }
}

impl PreferenceStore for SecurePreferences {
    fn get_string(&self, key: &str) -> Result<Option<Zeroizing<String>>> {
        let encrypted_key = self.encrypt_key(key)?;
        let guard = self.entries.read();
        match guard.get(&encrypted_key) {
            Some(sealed) => self.decrypt_value(&encrypted_key, sealed).map(Some),
            None => Ok(None),
        }
    }

    fn put_string(&self, key: &str, value: &str) -> Result<()> {
        self.edit().put_string(key, value).commit()
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.edit().remove(key).commit()
    }
}

enum EditOp {
    Put(String, Zeroizing<String>),
    Remove(String),
}

/// Batched modifications, applied together by [`Editor::commit`].
pub struct Editor<'a> {
    prefs: &'a SecurePreferences,
    clear: bool,
    ops: Vec<EditOp>,
}

impl<'a> Editor<'a> {
    pub fn put_string(mut self, key: &str, value: &str) -> Self {
        self.ops
            .push(EditOp::Put(key.to_string(), Zeroizing::new(value.to_string())));
        self
    }

    pub fn remove(mut self, key: &str) -> Self {
        self.ops.push(EditOp::Remove(key.to_string()));
        self
    }

    /// Drops every existing entry before the other edits are applied.
    pub fn clear(mut self) -> Self {
        self.clear = true;
        self
    }

    /// Writes the edits to disk. On failure the in-memory state is left
    /// untouched.
    pub fn commit(self) -> Result<()> {
        let mut guard = self.prefs.entries.write();
        let mut next = if self.clear {
            BTreeMap::new()
        } else {
            guard.clone()
        };
        for op in &self.ops {
            match op {
                EditOp::Put(key, value) => {
                    let encrypted_key = self.prefs.encrypt_key(key)?;
                    let sealed = self.prefs.encrypt_value(&encrypted_key, value)?;
                    next.insert(encrypted_key, sealed);
                }
                EditOp::Remove(key) => {
                    next.remove(&self.prefs.encrypt_key(key)?);
                }
            }
        }
        self.prefs.persist(&next)?;
        *guard = next;
        Ok(())
    }
}

fn encode_sealed(nonce: &[u8; GCM_NONCE_LEN], ct: &[u8]) -> String {
    let mut buf = Vec::with_capacity(GCM_NONCE_LEN + ct.len());
    buf.extend_from_slice(nonce);
    buf.extend_from_slice(ct);
    general_purpose::STANDARD.encode(buf)
}

fn decode_sealed(sealed: &str) -> Result<([u8; GCM_NONCE_LEN], Vec<u8>)> {
    let raw = general_purpose::STANDARD
        .decode(sealed)
        .map_err(|e| StoreError::Corrupted(format!("preference entry: {e}")))?;
    if raw.len() <= GCM_NONCE_LEN {
        return Err(StoreError::Corrupted("preference entry too short".into()));
    }
    let mut nonce = [0u8; GCM_NONCE_LEN];
    nonce.copy_from_slice(&raw[..GCM_NONCE_LEN]);
    Ok((nonce, raw[GCM_NONCE_LEN..].to_vec()))
}
