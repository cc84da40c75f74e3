//! veilfs - Encrypted virtual filesystem layer for untrusted cloud storage
//!
//! This library presents a plaintext view of a directory tree whose on-disk
//! representation is fully encrypted: file names are obfuscated per share and
//! file contents live in authenticated, randomly-accessible chunked
//! containers. It is a synchronous, blocking library intended to be driven by
//! whatever threads the embedding filesystem driver supplies.

pub mod cache;
pub mod config;
pub mod container;
pub mod crypto;
pub mod error;
pub mod obfuscate;
pub mod registry;
pub mod volume;

pub use config::{ShareConfig, VolumeConfig};
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{ShareConfig, VolumeConfig};
    pub use crate::crypto::{KeyChain, KeyContext};
    pub use crate::error::{Error, Result};
    pub use crate::volume::{CreationFlags, DirEntry, FileInfo, VirtualFile, VirtualVolume};
}
