//! Reversible path name obfuscation
//!
//! Each path segment is encrypted on its own under the share's current key
//! and encoded into a token safe for every supported backing filesystem.
//! Because directories are obfuscated level by level, the backing store
//! mirrors the logical tree and a partial path can be listed without
//! decrypting unrelated siblings.
//!
//! A token is self-describing: base64url(nonce || ciphertext || tag). No
//! side index is needed to reverse it, only the share key.

use crate::cache::BoundedCache;
use crate::crypto::nonce::NoncePool;
use crate::crypto::{AeadCipher, KeyContext, CHUNK_OVERHEAD, NONCE_SIZE};
use crate::error::{Error, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use parking_lot::Mutex;
use tracing::{trace, warn};

/// Path separator for plaintext volume paths
pub const SEPARATOR: char = '/';

/// Size of each direction of the name cache
const NAME_CACHE_CAPACITY: usize = 10 * 1024;

struct NameCache {
    plain_to_token: BoundedCache<String, String>,
    token_to_plain: BoundedCache<String, String>,
}

/// Obfuscates and deobfuscates path segments for one share.
///
/// Tokens are nondeterministic (every encryption draws a fresh nonce), so a
/// bounded bidirectional cache keeps the plain-to-token mapping stable for
/// the lifetime of the obfuscator and makes repeated lookups cheap.
pub struct PathObfuscator {
    cipher: AeadCipher,
    nonces: NoncePool,
    cache: Mutex<NameCache>,
}

impl PathObfuscator {
    /// Create an obfuscator bound to one key context
    pub fn new(ctx: &KeyContext, pool_capacity: usize, pool_low_water: usize) -> Result<Self> {
        Ok(PathObfuscator {
            cipher: AeadCipher::new(ctx)?,
            nonces: NoncePool::new(pool_capacity, pool_low_water),
            cache: Mutex::new(NameCache {
                plain_to_token: BoundedCache::new(NAME_CACHE_CAPACITY),
                token_to_plain: BoundedCache::new(NAME_CACHE_CAPACITY),
            }),
        })
    }

    /// Obfuscate a single path segment.
    ///
    /// Fails only on cipher-backend errors, which are not recoverable.
    pub fn obfuscate_segment(&self, plain: &str) -> Result<String> {
        if let Some(token) = self.cache.lock().plain_to_token.get(&plain.to_string()) {
            trace!(segment = plain, "obfuscate cache hit");
            return Ok(token.clone());
        }

        let nonce = self.nonces.draw();
        let sealed = self.cipher.seal(nonce, &[], plain.as_bytes())?;

        let mut raw = Vec::with_capacity(NONCE_SIZE + sealed.len());
        raw.extend_from_slice(&nonce);
        raw.extend_from_slice(&sealed);
        let token = URL_SAFE_NO_PAD.encode(&raw);

        let mut cache = self.cache.lock();
        cache.plain_to_token.insert(plain.to_string(), token.clone());
        cache.token_to_plain.insert(token.clone(), plain.to_string());

        Ok(token)
    }

    /// Deobfuscate a single token back to its plaintext segment.
    ///
    /// Fails with [`Error::Obfuscation`] when the token is malformed, was
    /// produced under a different key, or decodes to invalid UTF-8.
    pub fn deobfuscate_segment(&self, token: &str) -> Result<String> {
        if let Some(plain) = self.cache.lock().token_to_plain.get(&token.to_string()) {
            return Ok(plain.clone());
        }

        let raw = URL_SAFE_NO_PAD
            .decode(token.as_bytes())
            .map_err(|e| Error::Obfuscation(format!("token is not valid base64url: {}", e)))?;

        if raw.len() < CHUNK_OVERHEAD {
            return Err(Error::Obfuscation(format!(
                "token too short: {} bytes",
                raw.len()
            )));
        }

        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&raw[..NONCE_SIZE]);

        let plain_bytes = self.cipher.open(nonce, &[], &raw[NONCE_SIZE..]).map_err(|_| {
            Error::Obfuscation("token failed authentication (wrong key or corrupted)".to_string())
        })?;

        let plain = String::from_utf8(plain_bytes)
            .map_err(|e| Error::Obfuscation(format!("token decodes to invalid UTF-8: {}", e)))?;

        let mut cache = self.cache.lock();
        cache.plain_to_token.insert(plain.clone(), token.to_string());
        cache.token_to_plain.insert(token.to_string(), plain.clone());

        Ok(plain)
    }

    /// Obfuscate a full plaintext path, segment by segment.
    ///
    /// The root path `/` is the identity transform and is never obfuscated.
    pub fn obfuscate_path(&self, path: &str) -> Result<String> {
        if path == "/" {
            return Ok("/".to_string());
        }

        let mut out = String::new();
        for segment in path.split(SEPARATOR).filter(|s| !s.is_empty()) {
            out.push(SEPARATOR);
            out.push_str(&self.obfuscate_segment(segment)?);
        }
        Ok(out)
    }

    /// Deobfuscate a full obfuscated path, segment by segment
    pub fn deobfuscate_path(&self, path: &str) -> Result<String> {
        if path == "/" {
            return Ok("/".to_string());
        }

        let mut out = String::new();
        for token in path.split(SEPARATOR).filter(|s| !s.is_empty()) {
            out.push(SEPARATOR);
            match self.deobfuscate_segment(token) {
                Ok(plain) => out.push_str(&plain),
                Err(e) => {
                    warn!(token, "failed to deobfuscate path segment");
                    return Err(e);
                }
            }
        }
        Ok(out)
    }

    /// The cached token for a plaintext segment, if one is known.
    ///
    /// Lets callers that track on-disk state (directory resolution) check
    /// for an established mapping without minting a fresh token.
    pub fn cached_token(&self, plain: &str) -> Option<String> {
        self.cache
            .lock()
            .plain_to_token
            .get(&plain.to_string())
            .cloned()
    }

    /// Drop any cached mapping for a plaintext segment (rename/delete)
    pub fn invalidate(&self, plain: &str) {
        let mut cache = self.cache.lock();
        if let Some(token) = cache.plain_to_token.remove(&plain.to_string()) {
            cache.token_to_plain.remove(&token);
        }
    }
}
