//! Virtual volume: the façade a filesystem driver calls
//!
//! A `VirtualVolume` reconciles plaintext logical paths with their
//! obfuscated backing paths under one share root, and hands out
//! [`VirtualFile`] bindings whose open state is shared through the
//! [`FileHandleRegistry`](crate::registry::FileHandleRegistry).
//!
//! One volume instance exists per mounted share and lives for the duration
//! of the mount. The volume is the lock domain: metadata operations and
//! obfuscation lookups for the same volume are serialized.

mod file;

pub use file::{CreationFlags, VirtualFile};

use crate::config::{VolumeConfig, SHARE_METADATA_DIR};
use crate::container;
use crate::crypto::KeyChain;
use crate::error::{Error, Result};
use crate::obfuscate::PathObfuscator;
use crate::registry::FileHandleRegistry;
use parking_lot::Mutex;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, info, warn};

/// One entry of a directory listing, with its deobfuscated name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub is_directory: bool,
}

/// Metadata for one file or directory in the plaintext view.
///
/// `size` for regular files is the virtual (plaintext) size, never the
/// on-disk size of the encrypted container.
#[derive(Debug, Clone)]
pub struct FileInfo {
    pub file_name: String,
    pub size: u64,
    pub created: SystemTime,
    pub accessed: SystemTime,
    pub modified: SystemTime,
    pub is_directory: bool,
    pub is_symlink: bool,
}

pub(crate) struct VolumeShared {
    pub(crate) root: PathBuf,
    pub(crate) keys: KeyChain,
    pub(crate) config: VolumeConfig,
    pub(crate) obfuscator: PathObfuscator,
    pub(crate) registry: FileHandleRegistry,
    /// Lock domain for metadata operations and obfuscation lookups
    pub(crate) meta: Mutex<()>,
}

/// A mounted share: plaintext view over an obfuscated, encrypted backing
/// directory
pub struct VirtualVolume {
    shared: Arc<VolumeShared>,
}

impl VirtualVolume {
    /// Mount a volume over `root` with the share's key material
    pub fn new(root: impl Into<PathBuf>, keys: KeyChain, config: VolumeConfig) -> Result<Self> {
        let root = root.into();
        if !root.is_dir() {
            return Err(Error::FileNotFound(format!(
                "backing root is not a directory: {}",
                root.display()
            )));
        }

        let obfuscator = PathObfuscator::new(
            keys.current(),
            config.nonce_pool_size,
            config.nonce_pool_refill_at,
        )?;

        info!(root = %root.display(), share = keys.share_id(), "mounting virtual volume");
        Ok(VirtualVolume {
            shared: Arc::new(VolumeShared {
                root,
                keys,
                config,
                obfuscator,
                registry: FileHandleRegistry::new(),
                meta: Mutex::new(()),
            }),
        })
    }

    pub fn root(&self) -> &Path {
        &self.shared.root
    }

    pub fn share_id(&self) -> &str {
        self.shared.keys.share_id()
    }

    pub fn config(&self) -> &VolumeConfig {
        &self.shared.config
    }

    /// Resolve a plaintext path to its obfuscated backing path
    pub fn resolve(&self, plain_path: &str) -> Result<PathBuf> {
        let plain = normalize_path(plain_path)?;
        let _guard = self.shared.meta.lock();
        self.shared.resolve_locked(&plain)
    }

    /// Get a [`VirtualFile`] bound to the resolved backing path
    pub fn get_file(&self, plain_path: &str) -> Result<VirtualFile> {
        let plain = normalize_path(plain_path)?;
        let backing = {
            let _guard = self.shared.meta.lock();
            self.shared.resolve_locked(&plain)?
        };
        Ok(VirtualFile::new(Arc::clone(&self.shared), plain, backing))
    }

    /// List a directory with deobfuscated entry names.
    ///
    /// Entries that fail to deobfuscate (foreign files, corrupted tokens)
    /// are skipped with a warning unless `strict_listing` is set; a
    /// directory with damaged neighbours must not make the whole listing
    /// fail.
    pub fn list_directory(&self, plain_path: &str) -> Result<Vec<DirEntry>> {
        let plain = normalize_path(plain_path)?;
        let _guard = self.shared.meta.lock();
        let backing = self.shared.resolve_locked(&plain)?;

        let read_dir = fs::read_dir(&backing).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => Error::FileNotFound(plain.clone()),
            _ => Error::Io(e),
        })?;

        let mut entries = Vec::new();
        for entry in read_dir {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(token) = file_name.to_str() else {
                warn!(dir = %plain, "skipping entry with non-UTF-8 name");
                continue;
            };
            if token == SHARE_METADATA_DIR {
                continue;
            }

            match self.shared.obfuscator.deobfuscate_segment(token) {
                Ok(name) => {
                    let is_directory = entry.file_type()?.is_dir();
                    entries.push(DirEntry { name, is_directory });
                }
                Err(e) if self.shared.config.strict_listing => return Err(e),
                Err(_) => {
                    warn!(dir = %plain, token, "skipping undecryptable directory entry");
                }
            }
        }
        Ok(entries)
    }

    /// Metadata for a path.
    ///
    /// `already_obfuscated` means the given path is a backing path relative
    /// to the root; `output_obfuscated` selects whether the reported name
    /// is the backing token or the plaintext name.
    pub fn get_file_info(
        &self,
        path: &str,
        already_obfuscated: bool,
        output_obfuscated: bool,
    ) -> Result<FileInfo> {
        let _guard = self.shared.meta.lock();

        let (backing, obfuscated_rel) = if already_obfuscated {
            let rel = path.trim_start_matches('/');
            (join_under(&self.shared.root, rel)?, rel.to_string())
        } else {
            let plain = normalize_path(path)?;
            let backing = self.shared.resolve_locked(&plain)?;
            let rel = backing
                .strip_prefix(&self.shared.root)
                .unwrap_or(&backing)
                .to_string_lossy()
                .into_owned();
            (backing, rel)
        };

        let is_root = obfuscated_rel.is_empty();
        let meta = fs::symlink_metadata(&backing).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => Error::FileNotFound(path.to_string()),
            _ => Error::Io(e),
        })?;

        let last_token = Path::new(&obfuscated_rel)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let file_name = if is_root {
            "/".to_string()
        } else if output_obfuscated {
            last_token
        } else if already_obfuscated {
            self.shared.obfuscator.deobfuscate_segment(&last_token)?
        } else {
            normalize_path(path)?
                .rsplit('/')
                .next()
                .unwrap_or_default()
                .to_string()
        };

        let size = if meta.is_file() {
            container::read_virtual_size(&backing)?
        } else {
            0
        };

        let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        Ok(FileInfo {
            file_name,
            size,
            created: meta.created().unwrap_or(modified),
            accessed: meta.accessed().unwrap_or(modified),
            modified,
            is_directory: meta.is_dir(),
            is_symlink: meta.file_type().is_symlink(),
        })
    }

    /// Create a directory at the plaintext path (parent must exist)
    pub fn create_directory(&self, plain_path: &str) -> Result<()> {
        let plain = normalize_path(plain_path)?;
        let _guard = self.shared.meta.lock();
        let backing = self.shared.resolve_locked(&plain)?;

        debug!(path = %plain, "creating directory");
        fs::create_dir(&backing).map_err(|e| match e.kind() {
            io::ErrorKind::AlreadyExists => Error::AlreadyExists(plain.clone()),
            io::ErrorKind::NotFound => Error::FileNotFound(plain.clone()),
            _ => Error::Io(e),
        })
    }

    /// Remove an empty directory at the plaintext path
    pub fn remove_directory(&self, plain_path: &str) -> Result<()> {
        let plain = normalize_path(plain_path)?;
        if plain == "/" {
            return Err(Error::InvariantViolation(
                "cannot remove the volume root".to_string(),
            ));
        }
        let _guard = self.shared.meta.lock();
        let backing = self.shared.resolve_locked(&plain)?;

        debug!(path = %plain, "removing directory");
        fs::remove_dir(&backing).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => Error::FileNotFound(plain.clone()),
            _ => Error::Io(e),
        })
    }

    /// Number of distinct containers currently open through this volume
    pub fn open_file_count(&self) -> usize {
        self.shared.registry.open_count()
    }
}

impl VolumeShared {
    /// Resolve an already-normalized plaintext path; caller holds the
    /// volume lock
    pub(crate) fn resolve_locked(&self, plain: &str) -> Result<PathBuf> {
        if plain == "/" {
            return Ok(self.root.clone());
        }
        let mut backing = self.root.clone();
        for segment in plain.split('/').filter(|s| !s.is_empty()) {
            let token = self.find_or_mint_token(&backing, segment)?;
            backing.push(token);
        }
        Ok(backing)
    }

    /// Token for `segment` under `parent`.
    ///
    /// Tokens carry a fresh nonce, so two mounts would encrypt the same
    /// name to different strings. An existing on-disk entry that decrypts
    /// to `segment` is therefore adopted (and cached) before a new token
    /// is ever minted; minting happens only for names with no backing
    /// counterpart yet.
    fn find_or_mint_token(&self, parent: &Path, segment: &str) -> Result<String> {
        // tokens for the same name can differ per directory (each mint
        // draws a fresh nonce), so a cached token only short-circuits the
        // scan when it is actually present under this parent
        if let Some(token) = self.obfuscator.cached_token(segment) {
            if parent.join(&token).exists() {
                return Ok(token);
            }
        }

        if parent.is_dir() {
            for entry in fs::read_dir(parent)? {
                let entry = entry?;
                let file_name = entry.file_name();
                let Some(token) = file_name.to_str() else {
                    continue;
                };
                if token == SHARE_METADATA_DIR {
                    continue;
                }
                // deobfuscation caches the mapping for later lookups
                if let Ok(plain) = self.obfuscator.deobfuscate_segment(token) {
                    if plain == segment {
                        return Ok(token.to_string());
                    }
                }
            }
        }

        self.obfuscator.obfuscate_segment(segment)
    }
}

/// Normalize a plaintext volume path to the form `/a/b` (or `/`).
///
/// Paths must be absolute; `.` and `..` segments are rejected rather than
/// interpreted.
pub(crate) fn normalize_path(path: &str) -> Result<String> {
    if !path.starts_with('/') {
        return Err(Error::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("volume paths must be absolute: {:?}", path),
        )));
    }

    let mut normalized = String::new();
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        if segment == "." || segment == ".." {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("relative segment in volume path: {:?}", path),
            )));
        }
        normalized.push('/');
        normalized.push_str(segment);
    }
    if normalized.is_empty() {
        normalized.push('/');
    }
    Ok(normalized)
}

/// Join a backing-relative path under the root, confined to the root.
///
/// Obfuscated tokens never contain `.` or `..`, so such segments in a
/// backing path are rejected rather than walked.
fn join_under(root: &Path, rel: &str) -> Result<PathBuf> {
    let mut out = root.to_path_buf();
    for segment in rel.split('/').filter(|s| !s.is_empty()) {
        if segment == "." || segment == ".." {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("relative segment in backing path: {:?}", rel),
            )));
        }
        out.push(segment);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{KeyContext, KEY_SIZE};
    use tempfile::tempdir;

    fn test_keychain() -> KeyChain {
        let mut key = [0u8; KEY_SIZE];
        for (i, b) in key.iter_mut().enumerate() {
            *b = i as u8;
        }
        KeyChain::new(KeyContext::new("s1", 1, key))
    }

    fn test_volume(root: &Path) -> VirtualVolume {
        let config = VolumeConfig {
            chunk_size: 256,
            nonce_pool_size: 1024,
            nonce_pool_refill_at: 256,
            strict_listing: false,
        };
        VirtualVolume::new(root, test_keychain(), config).unwrap()
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("/").unwrap(), "/");
        assert_eq!(normalize_path("/a/b/").unwrap(), "/a/b");
        assert_eq!(normalize_path("//a//b").unwrap(), "/a/b");
        assert!(normalize_path("relative").is_err());
        assert!(normalize_path("/a/../b").is_err());
    }

    #[test]
    fn test_resolve_obfuscates_each_segment() {
        let dir = tempdir().unwrap();
        let volume = test_volume(dir.path());

        let backing = volume.resolve("/docs/report.txt").unwrap();
        let rel = backing.strip_prefix(dir.path()).unwrap();

        let segments: Vec<_> = rel.components().collect();
        assert_eq!(segments.len(), 2);
        let rendered = rel.to_string_lossy();
        assert!(!rendered.contains("docs"));
        assert!(!rendered.contains("report"));
    }

    #[test]
    fn test_resolve_root_identity() {
        let dir = tempdir().unwrap();
        let volume = test_volume(dir.path());
        assert_eq!(volume.resolve("/").unwrap(), dir.path());
    }

    #[test]
    fn test_resolve_is_stable() {
        let dir = tempdir().unwrap();
        let volume = test_volume(dir.path());
        assert_eq!(
            volume.resolve("/a/b.txt").unwrap(),
            volume.resolve("/a/b.txt").unwrap()
        );
    }

    #[test]
    fn test_end_to_end_scenario() {
        let dir = tempdir().unwrap();
        let volume = test_volume(dir.path());

        volume.create_directory("/docs").unwrap();

        let mut file = volume.get_file("/docs/report.txt").unwrap();
        file.open(CreationFlags::CreateNew).unwrap();
        file.write(b"hello").unwrap();
        file.close().unwrap();

        let entries = volume.list_directory("/docs").unwrap();
        assert_eq!(
            entries,
            vec![DirEntry {
                name: "report.txt".to_string(),
                is_directory: false
            }]
        );

        let mut file = volume.get_file("/docs/report.txt").unwrap();
        file.open(CreationFlags::OpenExisting).unwrap();
        let mut buf = [0u8; 16];
        let n = file.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
        file.close().unwrap();
    }

    #[test]
    fn test_second_mount_finds_existing_files() {
        let dir = tempdir().unwrap();

        {
            let volume = test_volume(dir.path());
            volume.create_directory("/docs").unwrap();
            let mut file = volume.get_file("/docs/kept.txt").unwrap();
            file.open(CreationFlags::CreateNew).unwrap();
            file.write(b"across mounts").unwrap();
            file.close().unwrap();
        }

        // a fresh mount has an empty name cache and must adopt the
        // on-disk tokens instead of minting new ones
        let volume = test_volume(dir.path());
        let mut file = volume.get_file("/docs/kept.txt").unwrap();
        file.open(CreationFlags::OpenExisting).unwrap();
        let mut buf = [0u8; 32];
        let n = file.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"across mounts");
        file.close().unwrap();
    }

    #[test]
    fn test_same_name_in_two_directories_across_mounts() {
        let dir = tempdir().unwrap();

        {
            let volume = test_volume(dir.path());
            volume.create_directory("/a").unwrap();
            let mut file = volume.get_file("/a/f.txt").unwrap();
            file.open(CreationFlags::CreateNew).unwrap();
            file.write(b"first").unwrap();
            file.close().unwrap();
        }

        // a fresh mount mints its own token for the same name in a second
        // directory; the original file must still resolve afterwards
        let volume = test_volume(dir.path());
        volume.create_directory("/b").unwrap();
        let mut file = volume.get_file("/b/f.txt").unwrap();
        file.open(CreationFlags::CreateNew).unwrap();
        file.close().unwrap();

        let mut file = volume.get_file("/a/f.txt").unwrap();
        file.open(CreationFlags::OpenExisting).unwrap();
        let mut buf = [0u8; 16];
        let n = file.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"first");
        file.close().unwrap();
    }

    #[test]
    fn test_obfuscated_info_confined_to_root() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("private")).unwrap();
        let root = dir.path().join("share");
        fs::create_dir(&root).unwrap();
        let volume = test_volume(&root);

        assert!(volume.get_file_info("/../private", true, true).is_err());
        assert!(volume.get_file_info("/./x", true, true).is_err());
    }

    #[test]
    fn test_listing_skips_foreign_entries() {
        let dir = tempdir().unwrap();
        let volume = test_volume(dir.path());

        volume.create_directory("/d").unwrap();
        let backing = volume.resolve("/d").unwrap();
        fs::write(backing.join("desktop.ini"), b"foreign junk").unwrap();

        let mut file = volume.get_file("/d/ok.txt").unwrap();
        file.open(CreationFlags::CreateNew).unwrap();
        file.close().unwrap();

        let entries = volume.list_directory("/d").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "ok.txt");
    }

    #[test]
    fn test_strict_listing_fails_on_foreign_entries() {
        let dir = tempdir().unwrap();
        let config = VolumeConfig {
            chunk_size: 256,
            nonce_pool_size: 1024,
            nonce_pool_refill_at: 256,
            strict_listing: true,
        };
        let volume = VirtualVolume::new(dir.path(), test_keychain(), config).unwrap();

        fs::write(dir.path().join("intruder"), b"x").unwrap();
        assert!(matches!(
            volume.list_directory("/"),
            Err(Error::Obfuscation(_))
        ));
    }

    #[test]
    fn test_listing_hides_metadata_dir() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join(SHARE_METADATA_DIR)).unwrap();
        let volume = test_volume(dir.path());

        assert!(volume.list_directory("/").unwrap().is_empty());
    }

    #[test]
    fn test_file_info_reports_virtual_size() {
        let dir = tempdir().unwrap();
        let volume = test_volume(dir.path());

        let mut file = volume.get_file("/data.bin").unwrap();
        file.open(CreationFlags::CreateNew).unwrap();
        file.write(&vec![9u8; 1000]).unwrap();
        file.close().unwrap();

        let info = volume.get_file_info("/data.bin", false, false).unwrap();
        assert_eq!(info.size, 1000);
        assert_eq!(info.file_name, "data.bin");
        assert!(!info.is_directory);
        assert!(!info.is_symlink);

        // the backing file is strictly larger than the virtual size
        let backing = volume.resolve("/data.bin").unwrap();
        assert!(fs::metadata(backing).unwrap().len() > 1000);
    }

    #[test]
    fn test_file_info_missing() {
        let dir = tempdir().unwrap();
        let volume = test_volume(dir.path());
        assert!(matches!(
            volume.get_file_info("/absent.txt", false, false),
            Err(Error::FileNotFound(_))
        ));
    }

    #[test]
    fn test_file_info_root() {
        let dir = tempdir().unwrap();
        let volume = test_volume(dir.path());
        let info = volume.get_file_info("/", false, false).unwrap();
        assert!(info.is_directory);
        assert_eq!(info.file_name, "/");
    }

    #[test]
    fn test_file_info_obfuscated_input() {
        let dir = tempdir().unwrap();
        let volume = test_volume(dir.path());

        let mut file = volume.get_file("/x.txt").unwrap();
        file.open(CreationFlags::CreateNew).unwrap();
        file.close().unwrap();

        let backing = volume.resolve("/x.txt").unwrap();
        let token = backing.file_name().unwrap().to_str().unwrap().to_string();

        let info = volume
            .get_file_info(&format!("/{}", token), true, false)
            .unwrap();
        assert_eq!(info.file_name, "x.txt");

        let info = volume
            .get_file_info(&format!("/{}", token), true, true)
            .unwrap();
        assert_eq!(info.file_name, token);
    }

    #[test]
    fn test_remove_directory() {
        let dir = tempdir().unwrap();
        let volume = test_volume(dir.path());

        volume.create_directory("/gone").unwrap();
        volume.remove_directory("/gone").unwrap();
        assert!(matches!(
            volume.get_file_info("/gone", false, false),
            Err(Error::FileNotFound(_))
        ));
        assert!(volume.remove_directory("/").is_err());
    }

    #[test]
    fn test_create_directory_twice_fails() {
        let dir = tempdir().unwrap();
        let volume = test_volume(dir.path());

        volume.create_directory("/d").unwrap();
        assert!(matches!(
            volume.create_directory("/d"),
            Err(Error::AlreadyExists(_))
        ));
    }
}
