//! Embedded single-file document store, encrypted with a 64-byte key.
//!
//! Layout: a fixed 128-byte header followed by the XChaCha20-Poly1305
//! ciphertext of the JSON document. The whole header is the associated data
//! of the ciphertext. The first half of the key encrypts, the second half
//! keys an HMAC over the header so a wrong key is told apart from a damaged
//! file.

use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::crypto::{
    decrypt, encrypt, generate_nonce, hmac_sha256, verify_hmac_sha256, MAC_LEN, SUBKEY_LEN,
    XNONCE_LEN,
};
use crate::error::{Result, StoreError};
use crate::paths::write_atomic;
use crate::schema::SchemaSet;

pub const DB_MAGIC: &[u8; 8] = b"ERPDB01\0";
pub const DB_FORMAT_VERSION: u32 = 1;
pub const HEADER_SIZE: usize = 128;
pub const ENCRYPTION_KEY_LEN: usize = 64;

const CHECKED_HEADER_LEN: usize = 40;

/// A type stored in one named collection.
pub trait Record: Serialize + DeserializeOwned {
    const COLLECTION: &'static str;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Document {
    #[serde(default)]
    pub collections: BTreeMap<String, Vec<Value>>,
}

impl Document {
    pub fn collection(&self, name: &str) -> &[Value] {
        self.collections.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn collection_mut(&mut self, name: &str) -> &mut Vec<Value> {
        self.collections.entry(name.to_string()).or_default()
    }
}

#[derive(Debug, Clone)]
struct DbHeader {
    format_version: u32,
    schema_version: u32,
    nonce: [u8; XNONCE_LEN],
    key_check: [u8; MAC_LEN],
}

impl DbHeader {
    fn new(schema_version: u32, mac_key: &[u8]) -> Result<Self> {
        let mut header = Self {
            format_version: DB_FORMAT_VERSION,
            schema_version,
            nonce: generate_nonce(),
            key_check: [0u8; MAC_LEN],
        };
        header.key_check = hmac_sha256(mac_key, &header.checked_bytes())?;
        Ok(header)
    }

    fn checked_bytes(&self) -> [u8; CHECKED_HEADER_LEN] {
        let mut buf = [0u8; CHECKED_HEADER_LEN];
        buf[..8].copy_from_slice(DB_MAGIC);
        buf[8..12].copy_from_slice(&self.format_version.to_le_bytes());
        buf[12..16].copy_from_slice(&self.schema_version.to_le_bytes());
        buf[16..40].copy_from_slice(&self.nonce);
        buf
    }

    fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[..CHECKED_HEADER_LEN].copy_from_slice(&self.checked_bytes());
        buf[CHECKED_HEADER_LEN..CHECKED_HEADER_LEN + MAC_LEN].copy_from_slice(&self.key_check);
        // remaining bytes stay zero
        buf
    }

    fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(StoreError::Corrupted("store header truncated".into()));
        }
        if &buf[..8] != DB_MAGIC {
            return Err(StoreError::Corrupted("invalid magic".into()));
        }
        let mut word = [0u8; 4];
        word.copy_from_slice(&buf[8..12]);
        let format_version = u32::from_le_bytes(word);
        if format_version != DB_FORMAT_VERSION {
            return Err(StoreError::Corrupted(format!(
                "unsupported store format {format_version}"
            )));
        }
        word.copy_from_slice(&buf[12..16]);
        let schema_version = u32::from_le_bytes(word);
        let mut nonce = [0u8; XNONCE_LEN];
        nonce.copy_from_slice(&buf[16..40]);
        let mut key_check = [0u8; MAC_LEN];
        key_check.copy_from_slice(&buf[CHECKED_HEADER_LEN..CHECKED_HEADER_LEN + MAC_LEN]);
        Ok(Self {
            format_version,
            schema_version,
            nonce,
            key_check,
        })
    }
}

/// Open configuration, adjusted by the closure passed to
/// [`open_database_with`].
pub struct DatabaseConfig {
    path: PathBuf,
    schema: SchemaSet,
    encryption_key: Option<Zeroizing<Vec<u8>>>,
}

impl DatabaseConfig {
    pub fn new(path: impl Into<PathBuf>, schema: SchemaSet) -> Self {
        Self {
            path: path.into(),
            schema,
            encryption_key: None,
        }
    }

    pub fn encryption_key(mut self, key: &[u8]) -> Self {
        self.encryption_key = Some(Zeroizing::new(key.to_vec()));
        self
    }

    pub fn open(self) -> Result<Database> {
        Database::open(self)
    }
}

pub fn open_database_with<F>(path: &Path, schema: SchemaSet, configure: F) -> Result<Database>
where
    F: FnOnce(DatabaseConfig) -> DatabaseConfig,
{
    configure(DatabaseConfig::new(path, schema)).open()
}

pub struct Database {
    path: PathBuf,
    schema: SchemaSet,
    enc_key: Zeroizing<Vec<u8>>,
    mac_key: Zeroizing<Vec<u8>>,
    doc: RwLock<Document>,
    writer: Mutex<()>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.path)
            .field("schema", &self.schema)
            .finish_non_exhaustive()
    }
}

impl Database {
    /// Opens the store, creating it when the file does not exist and
    /// migrating it when it was written by an older schema.
    pub fn open(config: DatabaseConfig) -> Result<Self> {
        let key = config
            .encryption_key
            .ok_or_else(|| StoreError::MissingEncryptionKey(config.path.display().to_string()))?;
        if key.len() != ENCRYPTION_KEY_LEN {
            return Err(StoreError::InvalidKeyLength {
                expected: ENCRYPTION_KEY_LEN,
                actual: key.len(),
            });
        }
        let db = Self {
            path: config.path,
            schema: config.schema,
            enc_key: Zeroizing::new(key[..SUBKEY_LEN].to_vec()),
            mac_key: Zeroizing::new(key[SUBKEY_LEN..].to_vec()),
            doc: RwLock::new(Document::default()),
            writer: Mutex::new(()),
        };

        if !db.path.exists() {
            info!(path = %db.path.display(), schema = db.schema.version, "creating encrypted store");
            db.save(&Document::default())?;
            return Ok(db);
        }

        let (stored_version, mut doc) = db.load()?;
        if stored_version != db.schema.version {
            db.schema.migrate(&mut doc, stored_version)?;
            db.save(&doc)?;
            info!(
                path = %db.path.display(),
                from = stored_version,
                to = db.schema.version,
                "store schema upgraded"
            );
        } else {
            debug!(path = %db.path.display(), schema = stored_version, "opened encrypted store");
        }
        *db.doc.write() = doc;
        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn schema_version(&self) -> u32 {
        self.schema.version
    }

    pub fn query<T: Record>(&self) -> Result<Vec<T>> {
        decode_all(self.doc.read().collection(T::COLLECTION))
    }

    pub fn query_first<T: Record>(&self) -> Result<Option<T>> {
        let guard = self.doc.read();
        guard
            .collection(T::COLLECTION)
            .first()
            .map(|value| serde_json::from_value(value.clone()).map_err(StoreError::from))
            .transpose()
    }

    pub fn count<T: Record>(&self) -> usize {
        self.doc.read().collection(T::COLLECTION).len()
    }

    /// Runs `f` as one write transaction, blocking until it is committed.
    ///
    /// Writers are serialized. `f` works on a private copy of the document;
    /// the copy replaces the file and the in-memory state only when `f`
    /// returns `Ok` and the file was written.
    pub fn write_blocking<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut WriteTransaction<'_>) -> Result<R>,
    {
        let _writer = self.writer.lock();
        let mut draft = self.doc.read().clone();
        let out = {
            let mut tx = WriteTransaction {
                schema: &self.schema,
                doc: &mut draft,
            };
            f(&mut tx)?
        };
        self.save(&draft)?;
        *self.doc.write() = draft;
        Ok(out)
    }

    fn load(&self) -> Result<(u32, Document)> {
        let raw = fs::read(&self.path)?;
        let header = DbHeader::from_bytes(&raw)?;
        if !verify_hmac_sha256(&self.mac_key, &header.checked_bytes(), &header.key_check)? {
            return Err(StoreError::InvalidKey(self.path.display().to_string()));
        }
        let plaintext = decrypt(
            &self.enc_key,
            &header.nonce,
            &raw[HEADER_SIZE..],
            &raw[..HEADER_SIZE],
        )
        .map_err(|_| StoreError::Corrupted(format!("cannot decrypt {}", self.path.display())))?;
        let doc: Document = serde_json::from_slice(&plaintext)?;
        Ok((header.schema_version, doc))
    }

    fn save(&self, doc: &Document) -> Result<()> {
        // Fresh nonce on every save: XChaCha20-Poly1305 must never reuse one.
        let header = DbHeader::new(self.schema.version, &self.mac_key)?;
        let header_bytes = header.to_bytes();
        let plaintext = Zeroizing::new(serde_json::to_vec(doc)?);
        let ciphertext = encrypt(&self.enc_key, &header.nonce, &plaintext, &header_bytes)?;
        let mut out = Vec::with_capacity(HEADER_SIZE + ciphertext.len());
        out.extend_from_slice(&header_bytes);
        out.extend_from_slice(&ciphertext);
        write_atomic(&self.path, &out)
    }
}

pub struct WriteTransaction<'a> {
    schema: &'a SchemaSet,
    doc: &'a mut Document,
}

impl<'a> WriteTransaction<'a> {
    pub fn query<T: Record>(&self) -> Result<Vec<T>> {
        decode_all(self.doc.collection(T::COLLECTION))
    }

    pub fn query_first<T: Record>(&self) -> Result<Option<T>> {
        self.doc
            .collection(T::COLLECTION)
            .first()
            .map(|value| serde_json::from_value(value.clone()).map_err(StoreError::from))
            .transpose()
    }

    pub fn insert<T: Record>(&mut self, record: &T) -> Result<()> {
        self.check_collection::<T>()?;
        let value = serde_json::to_value(record)?;
        self.doc.collection_mut(T::COLLECTION).push(value);
        Ok(())
    }

    /// Applies `f` to the first record of `T`. Returns whether one existed.
    pub fn update_first<T, F>(&mut self, f: F) -> Result<bool>
    where
        T: Record,
        F: FnOnce(&mut T),
    {
        self.check_collection::<T>()?;
        let Some(slot) = self.doc.collection_mut(T::COLLECTION).first_mut() else {
            return Ok(false);
        };
        let mut record: T = serde_json::from_value(slot.clone())?;
        f(&mut record);
        *slot = serde_json::to_value(&record)?;
        Ok(true)
    }

    pub fn update_all<T, F>(&mut self, mut f: F) -> Result<usize>
    where
        T: Record,
        F: FnMut(&mut T),
    {
        self.check_collection::<T>()?;
        let slots = self.doc.collection_mut(T::COLLECTION);
        for slot in slots.iter_mut() {
            let mut record: T = serde_json::from_value(slot.clone())?;
            f(&mut record);
            *slot = serde_json::to_value(&record)?;
        }
        Ok(slots.len())
    }

    pub fn delete_all<T: Record>(&mut self) -> Result<usize> {
        self.check_collection::<T>()?;
        let removed = std::mem::take(self.doc.collection_mut(T::COLLECTION));
        Ok(removed.len())
    }

    fn check_collection<T: Record>(&self) -> Result<()> {
        if self.schema.contains(T::COLLECTION) {
            Ok(())
        } else {
            Err(StoreError::UnknownCollection(T::COLLECTION.to_string()))
        }
    }
}

fn decode_all<T: Record>(values: &[Value]) -> Result<Vec<T>> {
    values
        .iter()
        .map(|value| serde_json::from_value(value.clone()).map_err(StoreError::from))
        .collect()
}
