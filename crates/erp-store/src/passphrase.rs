use base64::{engine::general_purpose, Engine as _};
use std::fmt;
use tracing::info;
use zeroize::Zeroizing;

use crate::crypto::random_bytes;
use crate::error::{Result, StoreError};
use crate::secure_prefs::PreferenceStore;

pub const ENCRYPTED_REALM_PASSWORD_KEY: &str = "ENCRYPTED_REALM_PASSWORD_KEY";
pub const PASSPHRASE_SIZE_IN_BYTES: usize = 64;

/// Base64 form of the database key as kept in the secure preferences.
#[derive(Clone, PartialEq, Eq)]
pub struct Passphrase(Zeroizing<String>);

impl Passphrase {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Raw key bytes for the store's open configuration.
    pub fn decode(&self) -> Result<Zeroizing<Vec<u8>>> {
        general_purpose::STANDARD
            .decode(self.0.as_bytes())
            .map(Zeroizing::new)
            .map_err(|e| StoreError::Crypto(format!("decode passphrase: {e}")))
    }
}

impl fmt::Debug for Passphrase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Passphrase(<redacted>)")
    }
}

/// Returns the stored passphrase, generating and storing one first when the
/// entry is absent or empty. An existing value is never replaced.
pub fn get_or_create_passphrase(store: &dyn PreferenceStore) -> Result<Passphrase> {
    if stored_passphrase(store)?.is_none() {
        info!("no database passphrase stored yet, generating one");
        let passphrase = generate_passphrase();
        store.put_string(ENCRYPTED_REALM_PASSWORD_KEY, &passphrase)?;
    }
    stored_passphrase(store)?
        .map(Passphrase)
        .ok_or(StoreError::PassphraseUnavailable)
}

fn stored_passphrase(store: &dyn PreferenceStore) -> Result<Option<Zeroizing<String>>> {
    Ok(store
        .get_string(ENCRYPTED_REALM_PASSWORD_KEY)?
        .filter(|value| !value.is_empty()))
}

fn generate_passphrase() -> Zeroizing<String> {
    let bytes = random_bytes(PASSPHRASE_SIZE_IN_BYTES);
    Zeroizing::new(general_purpose::STANDARD.encode(&*bytes))
}
