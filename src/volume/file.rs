//! Per-file view of the volume
//!
//! A `VirtualFile` binds one plaintext path to its encrypted backing
//! container. It is created cheaply by [`VirtualVolume::get_file`] and
//! holds no resources until `open`; after `open` it shares the container
//! session with every other handle on the same backing path through the
//! volume's registry.
//!
//! [`VirtualVolume::get_file`]: super::VirtualVolume::get_file

use super::{normalize_path, VolumeShared};
use crate::container::{self, EncryptedFile};
use crate::error::{Error, Result};
use crate::registry::SharedFile;
use std::fs::{self, FileTimes, OpenOptions};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, warn};

/// How `open` treats an existing or missing backing file.
///
/// Mirrors the Win32 creation dispositions, which is what filesystem
/// drivers hand down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreationFlags {
    /// Create, replacing any existing file
    CreateAlways,
    /// Create; fail if the file already exists
    CreateNew,
    /// Open, creating the file first when it does not exist
    OpenAlways,
    /// Open; fail if the file does not exist
    OpenExisting,
    /// Open and truncate to zero; fail if the file does not exist
    TruncateExisting,
}

impl CreationFlags {
    fn truncates(self) -> bool {
        matches!(self, CreationFlags::CreateAlways | CreationFlags::TruncateExisting)
    }
}

/// One logical handle on an encrypted file
pub struct VirtualFile {
    shared: Arc<VolumeShared>,
    plain_path: String,
    backing_path: PathBuf,
    handle: Option<SharedFile>,
}

impl VirtualFile {
    pub(super) fn new(
        shared: Arc<VolumeShared>,
        plain_path: String,
        backing_path: PathBuf,
    ) -> Self {
        VirtualFile {
            shared,
            plain_path,
            backing_path,
            handle: None,
        }
    }

    pub fn path(&self) -> &str {
        &self.plain_path
    }

    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    /// Open the backing container according to `flags`.
    ///
    /// When another handle already holds the container open, the session is
    /// shared; a truncating disposition then truncates the live session
    /// instead of replacing the backing file.
    pub fn open(&mut self, flags: CreationFlags) -> Result<()> {
        if self.handle.is_some() {
            return Err(Error::InvariantViolation(format!(
                "{}: handle is already open",
                self.plain_path
            )));
        }

        let exists = self.backing_path.exists();
        let already_open = self.shared.registry.is_open(&self.backing_path);
        match flags {
            CreationFlags::CreateNew if exists => {
                return Err(Error::AlreadyExists(self.plain_path.clone()));
            }
            CreationFlags::OpenExisting | CreationFlags::TruncateExisting if !exists => {
                return Err(Error::FileNotFound(self.plain_path.clone()));
            }
            // replacing a closed file means starting a fresh container
            CreationFlags::CreateAlways if exists && !already_open => {
                fs::remove_file(&self.backing_path)?;
            }
            _ => {}
        }

        debug!(path = %self.plain_path, ?flags, "opening virtual file");
        let ctx = self.shared.keys.current();
        let keys = &self.shared.keys;
        let chunk_size = self.shared.config.chunk_size;
        let backing = &self.backing_path;

        let handle = self.shared.registry.acquire(backing, || {
            let create = match flags {
                CreationFlags::CreateNew | CreationFlags::CreateAlways => true,
                CreationFlags::OpenAlways => !backing.exists(),
                CreationFlags::OpenExisting | CreationFlags::TruncateExisting => false,
            };
            let mut file = if create {
                EncryptedFile::create(backing, ctx, chunk_size)?
            } else {
                EncryptedFile::open(backing, keys)?
            };
            // a failure here aborts the acquire, so nothing is registered
            if flags.truncates() {
                file.set_len(0)?;
            }
            Ok(file)
        })?;

        // the session may have been shared rather than freshly opened;
        // truncate it in place, and give the reference back on failure
        if flags.truncates() {
            let truncated = handle.lock().set_len(0);
            if let Err(e) = truncated {
                drop(handle);
                let _ = self.shared.registry.release(&self.backing_path);
                return Err(e);
            }
        }
        self.handle = Some(handle);
        Ok(())
    }

    fn session(&self) -> Result<&SharedFile> {
        self.handle.as_ref().ok_or_else(|| {
            Error::InvariantViolation(format!("{}: handle is not open", self.plain_path))
        })
    }

    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.session()?.lock().read(buf)
    }

    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.session()?.lock().write(buf)
    }

    pub fn seek(&mut self, pos: u64) -> Result<()> {
        self.session()?.lock().seek(pos);
        Ok(())
    }

    pub fn set_len(&mut self, new_len: u64) -> Result<()> {
        self.session()?.lock().set_len(new_len)
    }

    pub fn flush(&mut self) -> Result<()> {
        self.session()?.lock().flush()
    }

    /// Plaintext size, from the live session when open, else the header
    pub fn virtual_size(&self) -> Result<u64> {
        match &self.handle {
            Some(handle) => Ok(handle.lock().virtual_size()),
            None => container::read_virtual_size(&self.backing_path),
        }
    }

    /// Release this handle; the container closes when the last handle on
    /// the same backing path is released.
    pub fn close(&mut self) -> Result<()> {
        match self.handle.take() {
            Some(handle) => {
                // this clone must be gone before release, or the registry
                // can never become the sole owner of the session
                drop(handle);
                self.shared.registry.release(&self.backing_path)
            }
            None => Err(Error::InvariantViolation(format!(
                "{}: close of a handle that is not open",
                self.plain_path
            ))),
        }
    }

    /// Delete the file. An open file is marked and deleted after the last
    /// handle is released; a closed file is removed immediately.
    pub fn delete(&mut self) -> Result<()> {
        debug!(path = %self.plain_path, "deleting virtual file");
        if self.shared.registry.is_open(&self.backing_path) {
            self.shared.registry.mark_delete_on_close(&self.backing_path)?;
        } else {
            fs::remove_file(&self.backing_path).map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => Error::FileNotFound(self.plain_path.clone()),
                _ => Error::Io(e),
            })?;
        }
        if let Some(name) = self.plain_path.rsplit('/').next() {
            self.shared.obfuscator.invalidate(name);
        }
        Ok(())
    }

    /// Rename to another plaintext path on the same volume.
    ///
    /// Disallowed while any handle holds the file open, since open sessions
    /// are keyed by the backing path.
    pub fn rename_to(&mut self, new_plain_path: &str) -> Result<()> {
        if self.shared.registry.is_open(&self.backing_path) {
            return Err(Error::InvariantViolation(format!(
                "{}: cannot rename an open file",
                self.plain_path
            )));
        }

        let new_plain = normalize_path(new_plain_path)?;
        let new_backing = {
            let _guard = self.shared.meta.lock();
            self.shared.resolve_locked(&new_plain)?
        };
        if new_backing.exists() {
            return Err(Error::AlreadyExists(new_plain));
        }

        debug!(from = %self.plain_path, to = %new_plain, "renaming virtual file");
        fs::rename(&self.backing_path, &new_backing).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => Error::FileNotFound(self.plain_path.clone()),
            _ => Error::Io(e),
        })?;

        if let Some(name) = self.plain_path.rsplit('/').next() {
            self.shared.obfuscator.invalidate(name);
        }
        self.plain_path = new_plain;
        self.backing_path = new_backing;
        Ok(())
    }

    /// Stamp the backing file's access time (content stays untouched)
    pub fn set_last_access_time(&self, at: SystemTime) -> Result<()> {
        self.set_times(FileTimes::new().set_accessed(at))
    }

    /// Stamp the backing file's modification time (content stays untouched)
    pub fn set_modified_time(&self, mt: SystemTime) -> Result<()> {
        self.set_times(FileTimes::new().set_modified(mt))
    }

    fn set_times(&self, times: FileTimes) -> Result<()> {
        let f = OpenOptions::new()
            .write(true)
            .open(&self.backing_path)
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => Error::FileNotFound(self.plain_path.clone()),
                _ => Error::Io(e),
            })?;
        f.set_times(times)?;
        Ok(())
    }
}

impl Drop for VirtualFile {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            drop(handle);
            if let Err(e) = self.shared.registry.release(&self.backing_path) {
                warn!(path = %self.plain_path, error = %e, "releasing dropped handle failed");
            }
        }
    }
}
