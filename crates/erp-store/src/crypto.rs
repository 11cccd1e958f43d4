use aes_gcm::Aes256Gcm;
use aes_siv::siv::Aes256Siv;
use chacha20poly1305::aead::{Aead, KeyInit, OsRng, Payload};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::error::{Result, StoreError};

pub const XNONCE_LEN: usize = 24;
pub const GCM_NONCE_LEN: usize = 12;
pub const SUBKEY_LEN: usize = 32;
pub const MAC_LEN: usize = 32;
pub const SIV_KEY_LEN: usize = 64;

type HmacSha256 = Hmac<Sha256>;

pub fn random_bytes(len: usize) -> Zeroizing<Vec<u8>> {
    let mut bytes = Zeroizing::new(vec![0u8; len]);
    OsRng.fill_bytes(&mut bytes);
    bytes
}

pub fn generate_nonce() -> [u8; XNONCE_LEN] {
    let mut nonce = [0u8; XNONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

pub fn generate_gcm_nonce() -> [u8; GCM_NONCE_LEN] {
    let mut nonce = [0u8; GCM_NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

pub fn encrypt(key: &[u8], nonce: &[u8; XNONCE_LEN], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    check_key_len(key)?;
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .encrypt(XNonce::from_slice(nonce), Payload { msg: plaintext, aad })
        .map_err(|e| StoreError::Crypto(format!("encrypt: {e}")))
}

pub fn decrypt(
    key: &[u8],
    nonce: &[u8; XNONCE_LEN],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Zeroizing<Vec<u8>>> {
    check_key_len(key)?;
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(XNonce::from_slice(nonce), Payload { msg: ciphertext, aad })
        .map(Zeroizing::new)
        .map_err(|e| StoreError::Crypto(format!("decrypt: {e}")))
}

pub fn gcm_encrypt(
    key: &[u8],
    nonce: &[u8; GCM_NONCE_LEN],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| StoreError::Crypto(format!("aes-gcm key: {e}")))?;
    cipher
        .encrypt(aes_gcm::Nonce::from_slice(nonce), Payload { msg: plaintext, aad })
        .map_err(|e| StoreError::Crypto(format!("aes-gcm encrypt: {e}")))
}

pub fn gcm_decrypt(
    key: &[u8],
    nonce: &[u8; GCM_NONCE_LEN],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Zeroizing<Vec<u8>>> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| StoreError::Crypto(format!("aes-gcm key: {e}")))?;
    cipher
        .decrypt(aes_gcm::Nonce::from_slice(nonce), Payload { msg: ciphertext, aad })
        .map(Zeroizing::new)
        .map_err(|e| StoreError::Crypto(format!("aes-gcm decrypt: {e}")))
}

pub fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<[u8; MAC_LEN]> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|e| StoreError::Crypto(format!("hmac key: {e}")))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}

/// Constant-time tag comparison.
pub fn verify_hmac_sha256(key: &[u8], data: &[u8], tag: &[u8]) -> Result<bool> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|e| StoreError::Crypto(format!("hmac key: {e}")))?;
    mac.update(data);
    Ok(mac.verify_slice(tag).is_ok())
}

/// Deterministic AES-256-SIV (RFC 5297) with one associated data header.
/// Equal inputs always give equal output.
pub fn siv_encrypt(key: &[u8], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    let mut cipher = siv_cipher(key)?;
    cipher
        .encrypt([aad], plaintext)
        .map_err(|e| StoreError::Crypto(format!("aes-siv encrypt: {e}")))
}

pub fn siv_decrypt(key: &[u8], ciphertext: &[u8], aad: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    let mut cipher = siv_cipher(key)?;
    cipher
        .decrypt([aad], ciphertext)
        .map(Zeroizing::new)
        .map_err(|e| StoreError::Crypto(format!("aes-siv decrypt: {e}")))
}

fn siv_cipher(key: &[u8]) -> Result<Aes256Siv> {
    if key.len() != SIV_KEY_LEN {
        return Err(StoreError::InvalidKeyLength {
            expected: SIV_KEY_LEN,
            actual: key.len(),
        });
    }
    <Aes256Siv as aes_siv::aead::KeyInit>::new_from_slice(key)
        .map_err(|e| StoreError::Crypto(format!("aes-siv key: {e}")))
}

/// Derives an independent 32-byte key from `master` for the given purpose.
pub fn derive_subkey(master: &[u8], label: &str) -> Result<Zeroizing<Vec<u8>>> {
    let tag = hmac_sha256(master, label.as_bytes())?;
    Ok(Zeroizing::new(tag.to_vec()))
}

/// Like [`derive_subkey`] but 64 bytes long, as AES-256-SIV needs two keys.
pub fn derive_siv_subkey(master: &[u8], label: &str) -> Result<Zeroizing<Vec<u8>>> {
    let mut key = Zeroizing::new(Vec::with_capacity(SIV_KEY_LEN));
    for block in [1u8, 2u8] {
        let mut input = label.as_bytes().to_vec();
        input.push(block);
        key.extend_from_slice(&hmac_sha256(master, &input)?);
    }
    Ok(key)
}

fn check_key_len(key: &[u8]) -> Result<()> {
    if key.len() != SUBKEY_LEN {
        return Err(StoreError::InvalidKeyLength {
            expected: SUBKEY_LEN,
            actual: key.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xchacha_rejects_foreign_aad() {
        let key = random_bytes(SUBKEY_LEN);
        let nonce = generate_nonce();
        let ct = encrypt(&key, &nonce, b"payload", b"header-a").unwrap();
        assert_eq!(&*decrypt(&key, &nonce, &ct, b"header-a").unwrap(), b"payload");
        assert!(decrypt(&key, &nonce, &ct, b"header-b").is_err());
    }

    #[test]
    fn gcm_wrong_key_fails() {
        let key = random_bytes(SUBKEY_LEN);
        let other = random_bytes(SUBKEY_LEN);
        let nonce = generate_gcm_nonce();
        let ct = gcm_encrypt(&key, &nonce, b"value", b"").unwrap();
        assert!(gcm_decrypt(&other, &nonce, &ct, b"").is_err());
    }

    #[test]
    fn subkeys_differ_per_label() {
        let master = random_bytes(SUBKEY_LEN);
        let a = derive_subkey(&master, "prefs-key").unwrap();
        let b = derive_subkey(&master, "prefs-value").unwrap();
        assert_ne!(*a, *b);
        assert_eq!(a.len(), SUBKEY_LEN);
    }

    #[test]
    fn siv_is_deterministic_and_bound_to_aad() {
        let master = random_bytes(SUBKEY_LEN);
        let key = derive_siv_subkey(&master, "names").unwrap();
        assert_eq!(key.len(), SIV_KEY_LEN);
        let a = siv_encrypt(&key, b"name", b"file").unwrap();
        assert_eq!(a, siv_encrypt(&key, b"name", b"file").unwrap());
        assert_ne!(a, siv_encrypt(&key, b"name", b"other-file").unwrap());
        assert_eq!(&*siv_decrypt(&key, &a, b"file").unwrap(), b"name");
        assert!(siv_decrypt(&key, &a, b"other-file").is_err());
        assert!(siv_encrypt(&key[..32], b"name", b"file").is_err());
    }

    #[test]
    fn short_key_is_rejected() {
        let nonce = generate_nonce();
        let err = encrypt(&[0u8; 16], &nonce, b"x", b"").unwrap_err();
        assert!(matches!(
            err,
            StoreError::InvalidKeyLength { expected: 32, actual: 16 }
        ));
    }

    #[test]
    fn hmac_verification() {
        let key = random_bytes(SUBKEY_LEN);
        let tag = hmac_sha256(&key, b"data").unwrap();
        assert!(verify_hmac_sha256(&key, b"data", &tag).unwrap());
        assert!(!verify_hmac_sha256(&key, b"other", &tag).unwrap());
    }
}
