//! Cryptographic primitives for veilfs
//!
//! All content and name encryption uses AES-256-GCM through ring. Key
//! material is supplied by the embedding application (key management is an
//! external collaborator); this module never generates or persists share
//! keys on its own.

pub mod kdf;
pub mod nonce;

use crate::error::{Error, Result};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use std::collections::BTreeMap;
use std::fmt;
use zeroize::Zeroizing;

/// Symmetric key size in bytes (AES-256)
pub const KEY_SIZE: usize = 32;

/// AEAD nonce size in bytes
pub const NONCE_SIZE: usize = 12;

/// AEAD authentication tag size in bytes
pub const TAG_SIZE: usize = 16;

/// KDF salt size in bytes
pub const SALT_SIZE: usize = 16;

/// Per-chunk and per-token ciphertext overhead (nonce + tag)
pub const CHUNK_OVERHEAD: usize = NONCE_SIZE + TAG_SIZE;

/// A share's symmetric key material at one key version.
///
/// Immutable for the lifetime of a session. Rekeying a share produces a new
/// `KeyContext` with a higher version; old versions stay available through
/// the [`KeyChain`] so previously written containers remain readable.
#[derive(Clone)]
pub struct KeyContext {
    share_id: String,
    key_version: u32,
    key: Zeroizing<[u8; KEY_SIZE]>,
}

impl KeyContext {
    pub fn new(share_id: impl Into<String>, key_version: u32, key: [u8; KEY_SIZE]) -> Self {
        KeyContext {
            share_id: share_id.into(),
            key_version,
            key: Zeroizing::new(key),
        }
    }

    pub fn share_id(&self) -> &str {
        &self.share_id
    }

    pub fn key_version(&self) -> u32 {
        self.key_version
    }

    pub(crate) fn key_bytes(&self) -> &[u8] {
        self.key.as_ref()
    }
}

impl fmt::Debug for KeyContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyContext")
            .field("share_id", &self.share_id)
            .field("key_version", &self.key_version)
            .field("key", &"[REDACTED]")
            .finish()
    }
}

/// All key versions known for one share.
///
/// The highest version is the current one and is used for every new
/// obfuscation and container; containers opened later select their original
/// version by the value stored in their header.
#[derive(Debug, Clone)]
pub struct KeyChain {
    share_id: String,
    contexts: BTreeMap<u32, KeyContext>,
}

impl KeyChain {
    /// Create a chain holding a single key version
    pub fn new(ctx: KeyContext) -> Self {
        let share_id = ctx.share_id().to_string();
        let mut contexts = BTreeMap::new();
        contexts.insert(ctx.key_version(), ctx);
        KeyChain { share_id, contexts }
    }

    /// Add another key version (e.g. a retained pre-rekey key)
    pub fn add(&mut self, ctx: KeyContext) -> Result<()> {
        if ctx.share_id() != self.share_id {
            return Err(Error::Config(format!(
                "key for share '{}' added to chain of share '{}'",
                ctx.share_id(),
                self.share_id
            )));
        }
        self.contexts.insert(ctx.key_version(), ctx);
        Ok(())
    }

    pub fn share_id(&self) -> &str {
        &self.share_id
    }

    /// The current (highest-version) key context
    pub fn current(&self) -> &KeyContext {
        // the chain is never empty by construction
        self.contexts
            .values()
            .next_back()
            .expect("key chain is never empty")
    }

    /// Look up a specific key version
    pub fn get(&self, version: u32) -> Option<&KeyContext> {
        self.contexts.get(&version)
    }
}

/// AES-256-GCM session cipher bound to one key context.
///
/// Constructed once per long-lived session object (obfuscator, open
/// container) and shared through it.
pub struct AeadCipher {
    key: LessSafeKey,
    key_version: u32,
}

impl AeadCipher {
    pub fn new(ctx: &KeyContext) -> Result<Self> {
        let unbound = UnboundKey::new(&AES_256_GCM, ctx.key_bytes())
            .map_err(|_| Error::FileEncryption("failed to initialize AES-256-GCM key".into()))?;
        Ok(AeadCipher {
            key: LessSafeKey::new(unbound),
            key_version: ctx.key_version(),
        })
    }

    pub fn key_version(&self) -> u32 {
        self.key_version
    }

    /// Encrypt `plaintext`, returning ciphertext with the tag appended
    pub fn seal(&self, nonce: [u8; NONCE_SIZE], aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut in_out = plaintext.to_vec();
        let tag = self
            .key
            .seal_in_place_separate_tag(Nonce::assume_unique_for_key(nonce), Aad::from(aad), &mut in_out)
            .map_err(|_| Error::FileEncryption("AEAD seal failed".into()))?;
        in_out.extend_from_slice(tag.as_ref());
        Ok(in_out)
    }

    /// Decrypt `ciphertext||tag`, verifying the authentication tag
    pub fn open(&self, nonce: [u8; NONCE_SIZE], aad: &[u8], sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < TAG_SIZE {
            return Err(Error::FileIntegrity(format!(
                "sealed record too short: {} bytes",
                sealed.len()
            )));
        }
        let mut in_out = sealed.to_vec();
        let plain = self
            .key
            .open_in_place(Nonce::assume_unique_for_key(nonce), Aad::from(aad), &mut in_out)
            .map_err(|_| Error::FileIntegrity("authentication tag mismatch".into()))?;
        Ok(plain.to_vec())
    }
}

impl fmt::Debug for AeadCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AeadCipher")
            .field("key_version", &self.key_version)
            .field("key", &"[REDACTED]")
            .finish()
    }
}
