//! Share key derivation using Argon2id
//!
//! Used by embedders (and the veilfs CLI) that hold a passphrase rather than
//! raw key material. The salt lives in the share configuration; the derived
//! key never touches disk.

use crate::config::EncryptionConfig;
use crate::crypto::{KeyContext, KEY_SIZE, SALT_SIZE};
use crate::error::{Error, Result};
use argon2::{Algorithm, Argon2, Params, Version};
use rand::RngCore;
use zeroize::Zeroizing;

/// Derive a share key from a passphrase and the share's stored salt
pub fn derive_share_key(
    passphrase: &str,
    config: &EncryptionConfig,
) -> Result<Zeroizing<[u8; KEY_SIZE]>> {
    if config.salt.len() < SALT_SIZE {
        return Err(Error::KeyDerivation(format!(
            "salt too short: {} bytes, need {}",
            config.salt.len(),
            SALT_SIZE
        )));
    }

    let params = Params::new(
        config.argon2_memory_kib,
        config.argon2_iterations,
        config.argon2_parallelism,
        Some(KEY_SIZE),
    )
    .map_err(|e| Error::KeyDerivation(format!("invalid Argon2 parameters: {}", e)))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    argon2
        .hash_password_into(passphrase.as_bytes(), &config.salt, key.as_mut())
        .map_err(|e| Error::KeyDerivation(format!("key derivation failed: {}", e)))?;

    Ok(key)
}

/// Derive a full [`KeyContext`] for a share from a passphrase
pub fn derive_key_context(
    share_id: &str,
    key_version: u32,
    passphrase: &str,
    config: &EncryptionConfig,
) -> Result<KeyContext> {
    let key = derive_share_key(passphrase, config)?;
    Ok(KeyContext::new(share_id, key_version, *key))
}

/// Generate a fresh random salt for a new share
pub fn generate_salt() -> [u8; SALT_SIZE] {
    let mut salt = [0u8; SALT_SIZE];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}
