//! Password-based authenticated encryption for the store.
//!
//! Key derivation: PBKDF2-HMAC-SHA256, fresh 16-byte salt per encryption.
//! AEAD: XChaCha20-Poly1305 (24-byte random nonce, 16-byte tag).
//!
//! Blob wire format:
//!   [ salt (16 bytes) | nonce (24 bytes) | ciphertext + tag ]
//!
//! The salt travels with the ciphertext, so any blob can be decrypted with
//! nothing but the master password. Tampering anywhere in the blob fails the
//! Poly1305 tag check and surfaces as `StoreError::AuthFailure`.

use base64::{engine::general_purpose, Engine as _};
use chacha20poly1305::aead::{Aead, KeyInit, OsRng};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::error::{Result, StoreError};

pub const PBKDF2_ITERATIONS: u32 = 600_000;
pub const SALT_LEN: usize = 16;
pub const NONCE_LEN: usize = 24;
pub const TAG_LEN: usize = 16;
pub const DERIVED_KEY_LEN: usize = 32;
pub const RECOVERY_KEY_LEN: usize = 32;

/// Known plaintext of the verification blob. Decrypting `verification.dat`
/// back to this value authenticates a password without storing it anywhere.
pub const VERIFICATION_PLAINTEXT: &[u8] = b"burrow-verification-v1";

/// Derive a 32-byte key from the master password and a per-blob salt.
pub fn derive_key(password: &str, salt: &[u8]) -> Zeroizing<[u8; DERIVED_KEY_LEN]> {
    let mut key = Zeroizing::new([0u8; DERIVED_KEY_LEN]);
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, PBKDF2_ITERATIONS, key.as_mut());
    key
}

pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    salt
}

pub fn generate_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Encrypt `plaintext` under `password` with a fresh salt and nonce.
pub fn encrypt(plaintext: &[u8], password: &str) -> Result<Vec<u8>> {
    let salt = generate_salt();
    let nonce = generate_nonce();
    let key = derive_key(password, &salt);
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key.as_ref()));
    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&nonce), plaintext)
        .map_err(|_| StoreError::Encrypt)?;

    let mut blob = Vec::with_capacity(SALT_LEN + NONCE_LEN + ciphertext.len());
    blob.extend_from_slice(&salt);
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&ciphertext);
    Ok(blob)
}

/// Decrypt a `salt || nonce || ciphertext` blob.
///
/// A structurally malformed blob is `Corrupt`; a failed tag check (wrong
/// password or tampering) is `AuthFailure`.
pub fn decrypt(blob: &[u8], password: &str) -> Result<Zeroizing<Vec<u8>>> {
    if blob.len() < SALT_LEN + NONCE_LEN + TAG_LEN {
        return Err(StoreError::Corrupt(format!(
            "ciphertext blob too short: {} bytes",
            blob.len()
        )));
    }
    let (salt, rest) = blob.split_at(SALT_LEN);
    let (nonce, ciphertext) = rest.split_at(NONCE_LEN);

    let key = derive_key(password, salt);
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key.as_ref()));
    let plaintext = cipher
        .decrypt(XNonce::from_slice(nonce), ciphertext)
        .map_err(|_| StoreError::AuthFailure)?;
    Ok(Zeroizing::new(plaintext))
}

/// Generate a recovery token: 32 random bytes in the URL-safe base64
/// alphabet, no padding.
pub fn generate_recovery_key() -> String {
    let mut bytes = Zeroizing::new([0u8; RECOVERY_KEY_LEN]);
    OsRng.fill_bytes(bytes.as_mut());
    general_purpose::URL_SAFE_NO_PAD.encode(bytes.as_ref())
}

/// Check `password` against an encrypted verification blob.
pub fn verify_password(verification_blob: &[u8], password: &str) -> Result<()> {
    let plaintext = decrypt(verification_blob, password)?;
    if plaintext.as_slice() != VERIFICATION_PLAINTEXT {
        return Err(StoreError::AuthFailure);
    }
    Ok(())
}

/// Decrypt `blob` with `old_password` and re-encrypt it under `new_password`
/// with a fresh salt and nonce. Fails immediately if the old password is
/// wrong.
pub fn re_encrypt(blob: &[u8], old_password: &str, new_password: &str) -> Result<Vec<u8>> {
    let plaintext = decrypt(blob, old_password)?;
    encrypt(&plaintext, new_password)
}
