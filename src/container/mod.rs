//! Chunked AEAD file container
//!
//! Presents a plaintext random-access byte stream backed by an
//! authenticated, chunk-encrypted on-disk file. Arbitrary offsets can be
//! read or written without touching the rest of the file: only the chunks
//! covering the requested range are decrypted, and modified chunks are
//! re-encrypted in place with a fresh nonce.

pub mod header;

use crate::crypto::{AeadCipher, KeyChain, KeyContext, CHUNK_OVERHEAD, NONCE_SIZE};
use crate::error::{Error, Result};
use header::{chunk_count, Header, HEADER_SIZE};
use rand::RngCore;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

pub use header::{real_to_virtual, virtual_to_real};

/// Read only the header of a container and report its virtual size.
///
/// Zero-length backing files (e.g. just created by a sync client) count as
/// empty rather than corrupt.
pub fn read_virtual_size(path: &Path) -> Result<u64> {
    let mut f = File::open(path).map_err(|e| match e.kind() {
        ErrorKind::NotFound => Error::FileNotFound(path.display().to_string()),
        _ => Error::Io(e),
    })?;
    if f.metadata()?.len() == 0 {
        return Ok(0);
    }
    let mut buf = [0u8; HEADER_SIZE];
    f.read_exact(&mut buf).map_err(|e| match e.kind() {
        ErrorKind::UnexpectedEof => {
            Error::CorruptHeader(format!("{}: file shorter than header", path.display()))
        }
        _ => Error::Io(e),
    })?;
    Ok(Header::decode(&buf)?.plain_len)
}

/// An open encrypted container file.
///
/// The logical cursor is independent of the backing store layout; `seek`
/// may move past the current end (sparse-write semantics, the gap is
/// zero-filled on the next write).
pub struct EncryptedFile {
    backing: File,
    path: PathBuf,
    cipher: AeadCipher,
    header: Header,
    cursor: u64,
}

impl EncryptedFile {
    /// Create a fresh container at `path` under the given key context.
    ///
    /// Fails with [`Error::AlreadyExists`] if the backing file already holds
    /// data; `create` on the same path twice is always an error.
    pub fn create(path: &Path, ctx: &KeyContext, chunk_size: u32) -> Result<Self> {
        if chunk_size == 0 {
            return Err(Error::Config("chunk size must be non-zero".to_string()));
        }

        let backing = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        if backing.metadata()?.len() > 0 {
            return Err(Error::AlreadyExists(path.display().to_string()));
        }

        debug!(path = %path.display(), chunk_size, key_version = ctx.key_version(), "creating container");
        let mut file = EncryptedFile {
            backing,
            path: path.to_path_buf(),
            cipher: AeadCipher::new(ctx)?,
            header: Header::new(ctx.key_version(), chunk_size),
            cursor: 0,
        };
        file.write_header()?;
        Ok(file)
    }

    /// Open an existing container, validating its header.
    ///
    /// The decryption key is selected by the key version stored in the
    /// header, so files written before a rekey stay readable. No chunk is
    /// decrypted until the first `read` or `write`.
    pub fn open(path: &Path, keys: &KeyChain) -> Result<Self> {
        let mut backing = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => Error::FileNotFound(path.display().to_string()),
                _ => Error::Io(e),
            })?;

        let mut buf = [0u8; HEADER_SIZE];
        backing.seek(SeekFrom::Start(0))?;
        backing.read_exact(&mut buf).map_err(|e| match e.kind() {
            ErrorKind::UnexpectedEof => {
                Error::CorruptHeader(format!("{}: file shorter than header", path.display()))
            }
            _ => Error::Io(e),
        })?;
        let header = Header::decode(&buf)?;

        let ctx = keys.get(header.key_version).ok_or_else(|| {
            Error::FileEncryption(format!(
                "no key material for share key version {}",
                header.key_version
            ))
        })?;

        trace!(path = %path.display(), key_version = header.key_version, plain_len = header.plain_len, "opened container");
        Ok(EncryptedFile {
            backing,
            path: path.to_path_buf(),
            cipher: AeadCipher::new(ctx)?,
            header,
            cursor: 0,
        })
    }

    /// Set the logical cursor. May exceed the current virtual size.
    pub fn seek(&mut self, pos: u64) {
        self.cursor = pos;
    }

    pub fn position(&self) -> u64 {
        self.cursor
    }

    /// Plaintext length of the file
    pub fn virtual_size(&self) -> u64 {
        self.header.plain_len
    }

    /// On-disk length of the backing file
    pub fn real_size(&self) -> Result<u64> {
        Ok(self.backing.metadata()?.len())
    }

    pub fn key_version(&self) -> u32 {
        self.header.key_version
    }

    pub fn chunk_size(&self) -> u32 {
        self.header.chunk_size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read from the cursor, clamped at the virtual size. Returns the
    /// number of bytes actually available.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() || self.cursor >= self.header.plain_len {
            return Ok(0);
        }
        let avail = self.header.plain_len - self.cursor;
        let want = (buf.len() as u64).min(avail) as usize;
        let cs = self.header.chunk_size as u64;

        let mut done = 0usize;
        while done < want {
            let pos = self.cursor + done as u64;
            let index = pos / cs;
            let offset = (pos % cs) as usize;
            let chunk = self.read_chunk(index)?;
            let take = (want - done).min(chunk.len() - offset);
            buf[done..done + take].copy_from_slice(&chunk[offset..offset + take]);
            done += take;
        }

        self.cursor += want as u64;
        Ok(want)
    }

    /// Write at the cursor, extending the file as needed. A cursor past the
    /// current end zero-fills the gap first.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.cursor > self.header.plain_len {
            let cursor = self.cursor;
            self.zero_extend(cursor)?;
        }
        let cursor = self.cursor;
        self.write_at(cursor, buf)?;
        self.cursor += buf.len() as u64;
        Ok(buf.len())
    }

    /// Truncate or zero-extend to `new_len`.
    ///
    /// Truncation drops excess tail chunks outright and re-encrypts a
    /// shortened final chunk at its new length, so no partially
    /// authenticated data survives.
    pub fn set_len(&mut self, new_len: u64) -> Result<()> {
        use std::cmp::Ordering;

        match new_len.cmp(&self.header.plain_len) {
            Ordering::Equal => Ok(()),
            Ordering::Greater => self.zero_extend(new_len),
            Ordering::Less => {
                let cs = self.header.chunk_size as u64;
                if new_len % cs != 0 {
                    let index = new_len / cs;
                    let mut plain = self.read_chunk(index)?;
                    plain.truncate((new_len - index * cs) as usize);
                    self.write_chunk(index, &plain)?;
                }
                self.header.plain_len = new_len;
                self.backing
                    .set_len(virtual_to_real(new_len, self.header.chunk_size))?;
                self.write_header()
            }
        }
    }

    /// Durably write all modified chunks and the header
    pub fn flush(&mut self) -> Result<()> {
        self.write_header()?;
        self.backing.sync_data()?;
        Ok(())
    }

    /// Flush and release the in-memory cipher state
    pub fn close(mut self) -> Result<()> {
        self.flush()
    }

    fn chunk_offset(&self, index: u64) -> u64 {
        HEADER_SIZE as u64 + index * (self.header.chunk_size as u64 + CHUNK_OVERHEAD as u64)
    }

    /// Plaintext length of an existing chunk (only the last may be short)
    fn chunk_plain_len(&self, index: u64) -> usize {
        let cs = self.header.chunk_size as u64;
        let count = chunk_count(self.header.plain_len, self.header.chunk_size);
        debug_assert!(index < count);
        if index + 1 == count {
            (self.header.plain_len - index * cs) as usize
        } else {
            cs as usize
        }
    }

    fn read_chunk(&mut self, index: u64) -> Result<Vec<u8>> {
        let record_len = self.chunk_plain_len(index) + CHUNK_OVERHEAD;
        let mut record = vec![0u8; record_len];
        self.backing.seek(SeekFrom::Start(self.chunk_offset(index)))?;
        self.backing.read_exact(&mut record).map_err(|e| match e.kind() {
            ErrorKind::UnexpectedEof => Error::FileIntegrity(format!(
                "chunk {} of {} is truncated",
                index,
                self.path.display()
            )),
            _ => Error::Io(e),
        })?;

        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&record[..NONCE_SIZE]);
        self.cipher
            .open(nonce, &index.to_be_bytes(), &record[NONCE_SIZE..])
            .map_err(|_| {
                Error::FileIntegrity(format!(
                    "chunk {} of {} failed authentication",
                    index,
                    self.path.display()
                ))
            })
    }

    fn write_chunk(&mut self, index: u64, plain: &[u8]) -> Result<()> {
        debug_assert!(plain.len() <= self.header.chunk_size as usize);
        let mut nonce = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce);
        let sealed = self.cipher.seal(nonce, &index.to_be_bytes(), plain)?;

        self.backing.seek(SeekFrom::Start(self.chunk_offset(index)))?;
        self.backing.write_all(&nonce)?;
        self.backing.write_all(&sealed)?;
        Ok(())
    }

    /// Write `data` at `offset`, which must not exceed the current end
    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        debug_assert!(offset <= self.header.plain_len);
        let cs = self.header.chunk_size as u64;

        let mut pos = offset;
        let mut remaining = data;
        while !remaining.is_empty() {
            let index = pos / cs;
            let chunk_off = (pos % cs) as usize;
            let take = remaining.len().min(cs as usize - chunk_off);

            let existing = index < chunk_count(self.header.plain_len, self.header.chunk_size);
            let mut plain = if existing {
                self.read_chunk(index)?
            } else {
                Vec::new()
            };
            if plain.len() < chunk_off + take {
                plain.resize(chunk_off + take, 0);
            }
            plain[chunk_off..chunk_off + take].copy_from_slice(&remaining[..take]);
            self.write_chunk(index, &plain)?;

            pos += take as u64;
            remaining = &remaining[take..];
            if pos > self.header.plain_len {
                self.header.plain_len = pos;
            }
        }
        self.write_header()
    }

    /// Zero-fill from the current end up to `to`
    fn zero_extend(&mut self, to: u64) -> Result<()> {
        let cs = self.header.chunk_size as usize;
        let zeros = vec![0u8; cs];
        while self.header.plain_len < to {
            let end = self.header.plain_len;
            let chunk_off = (end % cs as u64) as usize;
            let take = ((to - end) as usize).min(cs - chunk_off);
            self.write_at(end, &zeros[..take])?;
        }
        Ok(())
    }

    fn write_header(&mut self) -> Result<()> {
        self.backing.seek(SeekFrom::Start(0))?;
        self.backing.write_all(&self.header.encode())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{KeyChain, KeyContext, KEY_SIZE};
    use std::fs;
    use tempfile::tempdir;

    const CHUNK: u32 = 256;

    fn test_context(version: u32) -> KeyContext {
        let mut key = [0u8; KEY_SIZE];
        for (i, b) in key.iter_mut().enumerate() {
            *b = (i as u8).wrapping_add(version as u8);
        }
        KeyContext::new("s1", version, key)
    }

    fn test_chain() -> KeyChain {
        KeyChain::new(test_context(1))
    }

    #[test]
    fn test_write_read_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f");

        let mut f = EncryptedFile::create(&path, &test_context(1), CHUNK).unwrap();
        f.write(b"hello world").unwrap();
        f.close().unwrap();

        let mut f = EncryptedFile::open(&path, &test_chain()).unwrap();
        assert_eq!(f.virtual_size(), 11);
        let mut buf = [0u8; 64];
        let n = f.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello world");
    }

    #[test]
    fn test_multi_chunk_random_access() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f");
        let data: Vec<u8> = (0..CHUNK as usize * 3 + 17).map(|i| (i % 251) as u8).collect();

        let mut f = EncryptedFile::create(&path, &test_context(1), CHUNK).unwrap();
        f.write(&data).unwrap();

        // read a range straddling a chunk boundary
        f.seek(CHUNK as u64 - 5);
        let mut buf = [0u8; 10];
        assert_eq!(f.read(&mut buf).unwrap(), 10);
        assert_eq!(&buf, &data[CHUNK as usize - 5..CHUNK as usize + 5]);

        // overwrite in the middle of chunk 1, then verify the splice
        f.seek(CHUNK as u64 + 3);
        f.write(b"XYZ").unwrap();
        f.seek(0);
        let mut all = vec![0u8; data.len()];
        assert_eq!(f.read(&mut all).unwrap(), data.len());
        assert_eq!(&all[CHUNK as usize + 3..CHUNK as usize + 6], b"XYZ");
        assert_eq!(&all[..CHUNK as usize + 3], &data[..CHUNK as usize + 3]);
        assert_eq!(&all[CHUNK as usize + 6..], &data[CHUNK as usize + 6..]);
    }

    #[test]
    fn test_create_twice_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f");

        let f = EncryptedFile::create(&path, &test_context(1), CHUNK).unwrap();
        f.close().unwrap();

        assert!(matches!(
            EncryptedFile::create(&path, &test_context(1), CHUNK),
            Err(Error::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_open_missing_fails() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            EncryptedFile::open(&dir.path().join("nope"), &test_chain()),
            Err(Error::FileNotFound(_))
        ));
    }

    #[test]
    fn test_open_garbage_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f");
        fs::write(&path, b"this is not a container at all, not even close").unwrap();

        assert!(matches!(
            EncryptedFile::open(&path, &test_chain()),
            Err(Error::CorruptHeader(_))
        ));
    }

    #[test]
    fn test_tamper_detected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f");

        let mut f = EncryptedFile::create(&path, &test_context(1), CHUNK).unwrap();
        f.write(b"authentic content").unwrap();
        f.close().unwrap();

        // flip one ciphertext bit in the first chunk
        let mut raw = fs::read(&path).unwrap();
        raw[HEADER_SIZE + NONCE_SIZE + 3] ^= 0x01;
        fs::write(&path, &raw).unwrap();

        let mut f = EncryptedFile::open(&path, &test_chain()).unwrap();
        let mut buf = [0u8; 32];
        assert!(matches!(f.read(&mut buf), Err(Error::FileIntegrity(_))));
    }

    #[test]
    fn test_sparse_write() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f");

        let mut f = EncryptedFile::create(&path, &test_context(1), CHUNK).unwrap();
        f.seek(1000);
        f.write(b"x").unwrap();
        assert_eq!(f.virtual_size(), 1001);

        f.seek(0);
        let mut buf = vec![0xffu8; 1000];
        assert_eq!(f.read(&mut buf).unwrap(), 1000);
        assert!(buf.iter().all(|&b| b == 0));

        let mut one = [0u8; 1];
        assert_eq!(f.read(&mut one).unwrap(), 1);
        assert_eq!(&one, b"x");
    }

    #[test]
    fn test_truncate_drops_tail_chunk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f");

        let mut f = EncryptedFile::create(&path, &test_context(1), CHUNK).unwrap();
        f.write(&vec![0xaa; CHUNK as usize * 3]).unwrap();

        f.set_len(CHUNK as u64 + 1).unwrap();
        assert_eq!(f.virtual_size(), CHUNK as u64 + 1);
        assert_eq!(
            f.real_size().unwrap(),
            virtual_to_real(CHUNK as u64 + 1, CHUNK)
        );

        f.seek(0);
        let mut buf = vec![0u8; CHUNK as usize * 3];
        assert_eq!(f.read(&mut buf).unwrap(), CHUNK as usize + 1);
        assert!(buf[..CHUNK as usize + 1].iter().all(|&b| b == 0xaa));
    }

    #[test]
    fn test_truncate_then_extend() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f");

        let mut f = EncryptedFile::create(&path, &test_context(1), CHUNK).unwrap();
        f.write(b"abcdef").unwrap();
        f.set_len(3).unwrap();
        f.set_len(8).unwrap();

        f.seek(0);
        let mut buf = [0u8; 16];
        let n = f.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"abc\0\0\0\0\0");
    }

    #[test]
    fn test_size_accounting() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f");

        let mut f = EncryptedFile::create(&path, &test_context(1), CHUNK).unwrap();
        f.write(&vec![1u8; 700]).unwrap();
        f.seek(300);
        f.write(&vec![2u8; 100]).unwrap();

        assert_eq!(f.virtual_size(), 700);
        let real = f.real_size().unwrap();
        assert_eq!(real, virtual_to_real(700, CHUNK));
        assert_eq!(real_to_virtual(real, CHUNK), 700);
    }

    #[test]
    fn test_old_key_version_still_readable() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f");

        let mut f = EncryptedFile::create(&path, &test_context(1), CHUNK).unwrap();
        f.write(b"pre-rekey data").unwrap();
        f.close().unwrap();

        // share gets rekeyed to version 2; version 1 stays on the chain
        let mut chain = KeyChain::new(test_context(2));
        chain.add(test_context(1)).unwrap();

        let mut f = EncryptedFile::open(&path, &chain).unwrap();
        assert_eq!(f.key_version(), 1);
        let mut buf = [0u8; 32];
        let n = f.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"pre-rekey data");
    }

    #[test]
    fn test_missing_key_version_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f");

        let f = EncryptedFile::create(&path, &test_context(3), CHUNK).unwrap();
        f.close().unwrap();

        assert!(matches!(
            EncryptedFile::open(&path, &test_chain()),
            Err(Error::FileEncryption(_))
        ));
    }

    #[test]
    fn test_read_past_end_returns_zero() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f");

        let mut f = EncryptedFile::create(&path, &test_context(1), CHUNK).unwrap();
        f.write(b"tiny").unwrap();
        f.seek(100);
        let mut buf = [0u8; 8];
        assert_eq!(f.read(&mut buf).unwrap(), 0);
    }
}
