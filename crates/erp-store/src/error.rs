use std::sync::Arc;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("keyring error: {0}")]
    Keyring(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("encryption key must be {expected} bytes, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("no encryption key configured for {0}")]
    MissingEncryptionKey(String),

    #[error("encryption key does not match store {0}")]
    InvalidKey(String),

    #[error("store file corrupted: {0}")]
    Corrupted(String),

    #[error("store schema version {found} is newer than supported version {supported}")]
    SchemaTooNew { found: u32, supported: u32 },

    #[error("migration from schema version {from} failed: {reason}")]
    Migration { from: u32, reason: String },

    #[error("collection not part of schema: {0}")]
    UnknownCollection(String),

    #[error("passphrase should not be empty")]
    PassphraseUnavailable,

    #[error("record not found: {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Fatal failure of the one-time store bootstrap.
///
/// Every cause, whatever its kind, surfaces as this one type. The process
/// cannot continue without a decrypted store, so callers are expected to
/// report it and terminate rather than retry.
#[derive(Debug, Clone, Error)]
#[error("uncaught error while opening the encrypted store: {cause}")]
pub struct UncaughtError {
    #[source]
    cause: Arc<StoreError>,
}

impl UncaughtError {
    pub fn new(cause: StoreError) -> Self {
        Self {
            cause: Arc::new(cause),
        }
    }

    pub fn cause(&self) -> &StoreError {
        &self.cause
    }
}

impl From<StoreError> for UncaughtError {
    fn from(cause: StoreError) -> Self {
        Self::new(cause)
    }
}
