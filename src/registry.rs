//! Reference-counted registry of open containers
//!
//! Filesystem drivers routinely issue several logical opens against the
//! same inode. The registry makes "open" idempotent-but-counted per
//! backing-file identity: the first acquire constructs the container
//! session, later acquires share it, and the session is torn down exactly
//! once when the last reference is released.
//!
//! Entries are keyed by the backing path, a stable identity, not by
//! instance. All map mutations happen under one global lock; correctness
//! over lock granularity.

use crate::container::EncryptedFile;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// A shared open container session
pub type SharedFile = Arc<Mutex<EncryptedFile>>;

struct Entry {
    file: SharedFile,
    refcount: usize,
    delete_on_close: bool,
}

/// Registry of open encrypted containers, keyed by backing path
pub struct FileHandleRegistry {
    entries: Mutex<HashMap<PathBuf, Entry>>,
}

impl FileHandleRegistry {
    pub fn new() -> Self {
        FileHandleRegistry {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Acquire a handle for `identity`, opening the container via
    /// `open_fn` only when no session exists yet.
    pub fn acquire<F>(&self, identity: &Path, open_fn: F) -> Result<SharedFile>
    where
        F: FnOnce() -> Result<EncryptedFile>,
    {
        let mut entries = self.entries.lock();

        if let Some(entry) = entries.get_mut(identity) {
            entry.refcount += 1;
            debug!(path = %identity.display(), refcount = entry.refcount, "sharing open container");
            return Ok(Arc::clone(&entry.file));
        }

        // the lock is held across the open so concurrent first-opens
        // cannot race to initialize the same session
        let file = Arc::new(Mutex::new(open_fn()?));
        entries.insert(
            identity.to_path_buf(),
            Entry {
                file: Arc::clone(&file),
                refcount: 1,
                delete_on_close: false,
            },
        );
        Ok(file)
    }

    /// Release one reference; at zero the container is closed, removed,
    /// and (when marked) its backing file deleted.
    ///
    /// The final release requires the registry to hold the sole remaining
    /// reference to the session. If a stray clone is still alive the
    /// release fails and the entry stays registered, never stranding an
    /// unflushed session.
    pub fn release(&self, identity: &Path) -> Result<()> {
        let mut entries = self.entries.lock();

        let entry = entries.get_mut(identity).ok_or_else(|| {
            Error::InvariantViolation(format!(
                "release of identity that is not open: {}",
                identity.display()
            ))
        })?;

        if entry.refcount > 1 {
            entry.refcount -= 1;
            debug!(path = %identity.display(), refcount = entry.refcount, "released shared handle");
            return Ok(());
        }

        // checked under the registry lock, so once the map owns the sole
        // Arc no new clone can appear before teardown
        if Arc::strong_count(&entry.file) != 1 {
            return Err(Error::InvariantViolation(format!(
                "container for {} still referenced after final release",
                identity.display()
            )));
        }

        let entry = entries
            .remove(identity)
            .expect("entry disappeared under the registry lock");
        let delete = entry.delete_on_close;
        drop(entries);

        let file = Arc::try_unwrap(entry.file).map_err(|_| {
            Error::InvariantViolation(format!(
                "container for {} cloned during teardown",
                identity.display()
            ))
        })?;
        file.into_inner().close()?;

        if delete {
            debug!(path = %identity.display(), "deleting backing file marked delete-on-close");
            if let Err(e) = fs::remove_file(identity) {
                warn!(path = %identity.display(), error = %e, "delete-on-close failed");
                return Err(Error::Io(e));
            }
        }
        Ok(())
    }

    /// Mark an open identity so its backing file is deleted after the
    /// final release closes the cipher state
    pub fn mark_delete_on_close(&self, identity: &Path) -> Result<()> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(identity).ok_or_else(|| {
            Error::InvariantViolation(format!(
                "delete-on-close for identity that is not open: {}",
                identity.display()
            ))
        })?;
        entry.delete_on_close = true;
        Ok(())
    }

    /// Whether a session is currently open for `identity`
    pub fn is_open(&self, identity: &Path) -> bool {
        self.entries.lock().contains_key(identity)
    }

    /// Number of distinct open identities
    pub fn open_count(&self) -> usize {
        self.entries.lock().len()
    }
}

impl Default for FileHandleRegistry {
    fn default() -> Self {
        Self::new()
    }
}
