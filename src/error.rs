//! Error types for veilfs
//!
//! Every cryptographic or integrity failure is surfaced to the caller as a
//! typed error; the library never retries silently. The embedding filesystem
//! driver maps these kinds to its own error codes.

use thiserror::Error;

/// Result type used throughout veilfs
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for veilfs
#[derive(Debug, Error)]
pub enum Error {
    /// A name token is malformed, fails authentication or decodes to
    /// invalid UTF-8
    #[error("obfuscation error: {0}")]
    Obfuscation(String),

    /// Cipher initialization or parameter failure
    #[error("file encryption error: {0}")]
    FileEncryption(String),

    /// AEAD tag verification failed on a content chunk - tampering or
    /// wrong key
    #[error("file integrity error: {0}")]
    FileIntegrity(String),

    /// The backing counterpart of a file is absent
    #[error("file not found: {0}")]
    FileNotFound(String),

    /// Creation was requested for a file that already exists
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The container header is missing, truncated or unparseable
    #[error("corrupt header: {0}")]
    CorruptHeader(String),

    /// Underlying storage failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Handle registry misuse (double close, release of an unknown
    /// identity, ...)
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// Key derivation failed
    #[error("key derivation error: {0}")]
    KeyDerivation(String),

    /// Configuration error
    #[error("config error: {0}")]
    Config(String),
}

impl Error {
    /// True for errors that indicate tampering rather than ordinary failure
    pub fn is_integrity_failure(&self) -> bool {
        matches!(self, Error::FileIntegrity(_) | Error::Obfuscation(_))
    }
}
