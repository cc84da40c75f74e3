//! On-disk container header and size accounting
//!
//! Layout (big-endian, 28 bytes):
//!
//! ```text
//! magic        8   fixed file magic
//! version      u16  container format version
//! key_version  u32  share key version this file was written under
//! chunk_size   u32  plaintext bytes per chunk
//! plain_len    u64  virtual (plaintext) length
//! reserved     u16  zero
//! ```
//!
//! The key version is stored so rekeyed shares can still decrypt files
//! written under an older key.

use crate::crypto::CHUNK_OVERHEAD;
use crate::error::{Error, Result};

/// Container file magic
pub const MAGIC: [u8; 8] = *b"VEILFSCT";

/// Current container format version
pub const FORMAT_VERSION: u16 = 1;

/// Encoded header size in bytes
pub const HEADER_SIZE: usize = 28;

/// Decoded container header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Share key version used for this file
    pub key_version: u32,
    /// Plaintext bytes per chunk
    pub chunk_size: u32,
    /// Virtual (plaintext) length of the file
    pub plain_len: u64,
}

impl Header {
    pub fn new(key_version: u32, chunk_size: u32) -> Self {
        Header {
            key_version,
            chunk_size,
            plain_len: 0,
        }
    }

    /// Encode into the on-disk representation
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..8].copy_from_slice(&MAGIC);
        buf[8..10].copy_from_slice(&FORMAT_VERSION.to_be_bytes());
        buf[10..14].copy_from_slice(&self.key_version.to_be_bytes());
        buf[14..18].copy_from_slice(&self.chunk_size.to_be_bytes());
        buf[18..26].copy_from_slice(&self.plain_len.to_be_bytes());
        // bytes 26..28 reserved, zero
        buf
    }

    /// Decode and validate an on-disk header
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::CorruptHeader(format!(
                "truncated header: {} bytes, need {}",
                buf.len(),
                HEADER_SIZE
            )));
        }
        if buf[0..8] != MAGIC {
            return Err(Error::CorruptHeader("bad file magic".to_string()));
        }

        let version = u16::from_be_bytes([buf[8], buf[9]]);
        if version != FORMAT_VERSION {
            return Err(Error::CorruptHeader(format!(
                "unsupported container format version {}",
                version
            )));
        }

        let key_version = u32::from_be_bytes([buf[10], buf[11], buf[12], buf[13]]);
        let chunk_size = u32::from_be_bytes([buf[14], buf[15], buf[16], buf[17]]);
        if chunk_size == 0 {
            return Err(Error::CorruptHeader("chunk size is zero".to_string()));
        }

        let mut plain_len_bytes = [0u8; 8];
        plain_len_bytes.copy_from_slice(&buf[18..26]);
        let plain_len = u64::from_be_bytes(plain_len_bytes);

        Ok(Header {
            key_version,
            chunk_size,
            plain_len,
        })
    }
}

/// Number of chunks covering `plain_len` plaintext bytes
pub fn chunk_count(plain_len: u64, chunk_size: u32) -> u64 {
    plain_len.div_ceil(chunk_size as u64)
}

/// Real (on-disk) size of a container holding `plain_len` plaintext bytes
pub fn virtual_to_real(plain_len: u64, chunk_size: u32) -> u64 {
    HEADER_SIZE as u64 + plain_len + chunk_count(plain_len, chunk_size) * CHUNK_OVERHEAD as u64
}

/// Virtual (plaintext) size of a container with real on-disk size
/// `real_len`.
///
/// Exact inverse of [`virtual_to_real`] for every valid container size.
pub fn real_to_virtual(real_len: u64, chunk_size: u32) -> u64 {
    if real_len <= HEADER_SIZE as u64 {
        return 0;
    }
    let body = real_len - HEADER_SIZE as u64;
    let record = chunk_size as u64 + CHUNK_OVERHEAD as u64;
    let full = body / record;
    let rem = body % record;
    if rem == 0 {
        full * chunk_size as u64
    } else {
        // trailing partial chunk still carries a full nonce + tag
        full * chunk_size as u64 + rem.saturating_sub(CHUNK_OVERHEAD as u64)
    }
}
