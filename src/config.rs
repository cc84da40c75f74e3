//! Configuration management for veilfs
//!
//! A share carries its public parameters (identifier, key version, chunk
//! size, KDF salt) in a JSON file inside the share metadata directory. Key
//! material itself is never persisted here.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Default chunk size: 64 KiB of plaintext per chunk
pub const DEFAULT_CHUNK_SIZE: u32 = 64 * 1024;

/// Default nonce pool capacity
pub const DEFAULT_NONCE_POOL_SIZE: usize = 200_000;

/// Metadata directory kept at the root of every share backing directory
pub const SHARE_METADATA_DIR: &str = ".veilfs";

/// Share configuration file name inside the metadata directory
pub const SHARE_CONFIG_FILE: &str = "share.json";

/// Per-share configuration persisted in the share metadata directory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShareConfig {
    /// Share identifier
    pub share_id: String,

    /// Current share key version
    pub key_version: u32,

    /// Volume behaviour
    pub volume: VolumeConfig,

    /// Key derivation parameters
    pub encryption: EncryptionConfig,
}

/// Volume behaviour configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeConfig {
    /// Plaintext bytes per encrypted chunk
    pub chunk_size: u32,

    /// Capacity of the pre-generated nonce pool
    pub nonce_pool_size: usize,

    /// Refill the pool in the background once it drops below this level
    pub nonce_pool_refill_at: usize,

    /// Fail a directory listing on the first undecryptable entry instead of
    /// skipping it
    pub strict_listing: bool,
}

/// Key derivation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionConfig {
    /// Argon2 memory cost in KiB
    pub argon2_memory_kib: u32,

    /// Argon2 time cost (iterations)
    pub argon2_iterations: u32,

    /// Argon2 parallelism
    pub argon2_parallelism: u32,

    /// Salt for key derivation
    #[serde(with = "hex_serde")]
    pub salt: Vec<u8>,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        VolumeConfig {
            chunk_size: DEFAULT_CHUNK_SIZE,
            nonce_pool_size: DEFAULT_NONCE_POOL_SIZE,
            nonce_pool_refill_at: DEFAULT_NONCE_POOL_SIZE / 4,
            strict_listing: false,
        }
    }
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        EncryptionConfig {
            argon2_memory_kib: 65536, // 64 MiB
            argon2_iterations: 3,
            argon2_parallelism: 4,
            salt: Vec::new(),
        }
    }
}

impl ShareConfig {
    /// Path of the config file for a share rooted at `share_root`
    pub fn path_for(share_root: &Path) -> PathBuf {
        share_root.join(SHARE_METADATA_DIR).join(SHARE_CONFIG_FILE)
    }

    /// Load the share configuration from a share backing directory
    pub fn load(share_root: &Path) -> Result<Self> {
        let path = Self::path_for(share_root);
        let data = fs::read_to_string(&path).map_err(|e| {
            Error::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&data)
            .map_err(|e| Error::Config(format!("cannot parse {}: {}", path.display(), e)))
    }

    /// Save the share configuration, creating the metadata directory if
    /// needed
    pub fn save(&self, share_root: &Path) -> Result<()> {
        let path = Self::path_for(share_root);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("cannot serialize config: {}", e)))?;
        fs::write(&path, data)?;
        Ok(())
    }
}

mod hex_serde {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}
