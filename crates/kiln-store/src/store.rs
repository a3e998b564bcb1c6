//! Store operations: validity, references, derivations, and adding content.

use crate::db::{Database, PathInfo};
use crate::path::store_dir;
use kiln_derive::{Derivation, Hash, StorePath};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Directory holding one temp-roots file per live process with a
/// realisation in flight, mirrored from `gc::GarbageCollector`'s own
/// constant of the same name since the two can't share a private item
/// across modules.
const TEMP_ROOTS_DIR: &str = "temproots";

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("path not found: {0}")]
    PathNotFound(String),

    #[error("path already exists: {0}")]
    PathExists(String),

    #[error("invalid store path: {0}")]
    InvalidPath(String),

    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: Hash, actual: Hash },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store is in read-only mode")]
    ReadOnly,
}

/// The kiln content-addressed store.
pub struct Store {
    /// The root directory of the store (where paths live).
    root: PathBuf,
    /// Metadata database (validity, references, derivers).
    db: Database,
    /// Negative cache of paths whose build is known to fail.
    failed: HashSet<StorePath>,
    /// Cache of loaded derivations.
    derivation_cache: HashMap<StorePath, Derivation>,
    read_only: bool,
}

impl Store {
    /// Open the store at the default location.
    pub fn open() -> Result<Self, StoreError> {
        Self::open_at(store_dir())
    }

    /// Open the store at a specific location.
    pub fn open_at(root: PathBuf) -> Result<Self, StoreError> {
        fs::create_dir_all(&root)?;
        let db = Database::open(root.clone())?;

        Ok(Self {
            root,
            db,
            failed: HashSet::new(),
            derivation_cache: HashMap::new(),
            read_only: false,
        })
    }

    /// Put the store in read-only mode: every mutating call fails.
    pub fn set_read_only(&mut self, read_only: bool) {
        self.read_only = read_only;
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.read_only {
            return Err(StoreError::ReadOnly);
        }
        Ok(())
    }

    /// Get the store root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Check if a path exists on disk (distinct from `is_valid_path`, which
    /// also requires the path to be registered).
    pub fn path_exists(&self, path: &StorePath) -> bool {
        self.to_path(path).exists()
    }

    /// Convert a StorePath to an absolute filesystem path.
    pub fn to_path(&self, store_path: &StorePath) -> PathBuf {
        store_path.path_with_prefix(&self.root.to_string_lossy())
    }

    /// Register a temp root for `path`, protecting it from a GC that runs
    /// concurrently with a realisation in progress (§4.2 step 1, §6
    /// `add_temp_root`). One append-only, NUL-separated file per live
    /// process, named by PID, under `temproots/`.
    pub fn add_temp_root(&self, path: &StorePath) -> Result<(), StoreError> {
        let dir = self.root.join(TEMP_ROOTS_DIR);
        fs::create_dir_all(&dir)?;
        let file_path = dir.join(format!("{}", std::process::id()));

        let mut file = fs::OpenOptions::new().create(true).append(true).open(&file_path)?;

        #[cfg(unix)]
        lock_temp_roots_file(&file)?;

        let target = self.to_path(path);
        file.write_all(target.to_string_lossy().as_bytes())?;
        file.write_all(&[0u8])?;

        #[cfg(unix)]
        unlock_temp_roots_file(&file)?;

        Ok(())
    }

    // ---------- validity and references (§6 Store API) ----------

    pub fn is_valid_path(&mut self, path: &StorePath) -> Result<bool, StoreError> {
        self.db.is_valid(path)
    }

    pub fn query_references(&mut self, path: &StorePath) -> Result<HashSet<StorePath>, StoreError> {
        self.db.get_references(path)
    }

    pub fn query_referrers(&mut self, path: &StorePath) -> Result<HashSet<StorePath>, StoreError> {
        self.db.get_referrers(path)
    }

    pub fn query_valid_derivers(&self, path: &StorePath) -> Result<HashSet<StorePath>, StoreError> {
        self.db.query_valid_derivers(path)
    }

    pub fn query_path_info(&mut self, path: &StorePath) -> Result<Option<PathInfo>, StoreError> {
        self.db.query(path)
    }

    pub fn has_path_failed(&self, path: &StorePath) -> bool {
        self.failed.contains(path)
    }

    pub fn register_failed_path(&mut self, path: StorePath) {
        self.failed.insert(path);
    }

    /// Atomically register a set of newly-built/substituted paths as valid.
    /// All paths in `infos` become valid together or not at all.
    pub fn register_valid_paths(&mut self, infos: Vec<PathInfo>) -> Result<(), StoreError> {
        self.check_writable()?;
        for info in &infos {
            if !self.path_exists(&info.path) {
                return Err(StoreError::PathNotFound(info.path.display_name()));
            }
        }
        for info in infos {
            self.db.register(info)?;
        }
        Ok(())
    }

    pub fn query_derivation_outputs(&mut self, drv_path: &StorePath) -> Result<HashSet<StorePath>, StoreError> {
        let drv = self.read_derivation(drv_path)?;
        Ok(drv.outputs.values().filter_map(|o| o.path.clone()).collect())
    }

    // ---------- adding content ----------

    /// Add a file to the store with a content hash.
    pub fn add_file(&mut self, source: &Path, name: &str) -> Result<StorePath, StoreError> {
        self.check_writable()?;
        let content = fs::read(source)?;
        let hash = Hash::of(&content);

        let store_path = StorePath::new(hash, name.to_string());
        let dest = self.to_path(&store_path);

        if dest.exists() {
            let existing_content = fs::read(&dest)?;
            let existing_hash = Hash::of(&existing_content);
            if existing_hash != hash {
                return Err(StoreError::HashMismatch {
                    expected: hash,
                    actual: existing_hash,
                });
            }
        } else {
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(source, &dest)?;
            let mut perms = fs::metadata(&dest)?.permissions();
            perms.set_readonly(true);
            fs::set_permissions(&dest, perms)?;
        }

        Ok(store_path)
    }

    /// Add a directory to the store.
    pub fn add_dir(&mut self, source: &Path, name: &str) -> Result<StorePath, StoreError> {
        self.check_writable()?;
        let hash = hash_dir(source)?;

        let store_path = StorePath::new(hash, name.to_string());
        let dest = self.to_path(&store_path);

        if !dest.exists() {
            copy_dir_recursive(source, &dest)?;
            make_readonly_recursive(&dest)?;
        }

        Ok(store_path)
    }

    /// Add content directly to the store, as `add_to_store` does for the
    /// evaluator's source-path coercion (§4.5 string contexts).
    pub fn add_to_store(&mut self, content: &[u8], name: &str) -> Result<StorePath, StoreError> {
        self.check_writable()?;
        let hash = Hash::of(content);
        let store_path = StorePath::new(hash, name.to_string());
        let dest = self.to_path(&store_path);

        if !dest.exists() {
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&dest, content)?;
            let mut perms = fs::metadata(&dest)?.permissions();
            perms.set_readonly(true);
            fs::set_permissions(&dest, perms)?;
        }

        Ok(store_path)
    }

    /// Add a derivation to the store.
    pub fn add_derivation(&mut self, drv: &Derivation) -> Result<StorePath, StoreError> {
        self.check_writable()?;
        let drv_path = drv.drv_path();
        let dest = self.to_path(&drv_path);

        if !dest.exists() {
            let json = drv.to_json()?;
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&dest, &json)?;
        }

        self.derivation_cache.insert(drv_path.clone(), drv.clone());
        Ok(drv_path)
    }

    /// Read a derivation from the store.
    pub fn read_derivation(&mut self, path: &StorePath) -> Result<Derivation, StoreError> {
        if let Some(drv) = self.derivation_cache.get(path) {
            return Ok(drv.clone());
        }

        let fs_path = self.to_path(path);
        if !fs_path.exists() {
            return Err(StoreError::PathNotFound(path.display_name()));
        }

        let content = fs::read_to_string(&fs_path)?;
        let drv = Derivation::from_json(&content)?;
        self.derivation_cache.insert(path.clone(), drv.clone());

        Ok(drv)
    }

    /// Delete a path from the store (used by garbage collection).
    pub fn delete(&mut self, path: &StorePath) -> Result<(), StoreError> {
        self.check_writable()?;
        self.db.delete(path)?;

        let fs_path = self.to_path(path);
        if !fs_path.exists() {
            return Ok(());
        }

        make_writable_recursive(&fs_path)?;

        if fs_path.is_dir() {
            fs::remove_dir_all(&fs_path)?;
        } else {
            fs::remove_file(&fs_path)?;
        }

        Ok(())
    }

    /// List all paths present on disk, whether or not registered valid.
    pub fn list_paths(&self) -> Result<Vec<StorePath>, StoreError> {
        let mut paths = Vec::new();

        if !self.root.exists() {
            return Ok(paths);
        }

        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let path = entry.path();
            if let Some(store_path) = StorePath::parse(&path) {
                paths.push(store_path);
            }
        }

        Ok(paths)
    }

    /// Get the total size of the store in bytes.
    pub fn size(&self) -> Result<u64, StoreError> {
        dir_size(&self.root)
    }
}

/// Hash a directory's contents.
fn hash_dir(path: &Path) -> Result<Hash, StoreError> {
    let mut hasher = kiln_derive::Hasher::new();
    hash_dir_recursive(path, &mut hasher)?;
    Ok(hasher.finalize())
}

fn hash_dir_recursive(path: &Path, hasher: &mut kiln_derive::Hasher) -> Result<(), StoreError> {
    let mut entries: Vec<_> = fs::read_dir(path)?.collect::<Result<_, _>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let path = entry.path();
        let name = entry.file_name();
        hasher.update(name.as_encoded_bytes());

        if path.is_dir() {
            hasher.update(b"d");
            hash_dir_recursive(&path, hasher)?;
        } else {
            hasher.update(b"f");
            let content = fs::read(&path)?;
            hasher.update(&content);
        }
    }

    Ok(())
}

fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<(), StoreError> {
    fs::create_dir_all(dst)?;

    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());

        if src_path.is_dir() {
            copy_dir_recursive(&src_path, &dst_path)?;
        } else {
            fs::copy(&src_path, &dst_path)?;
        }
    }

    Ok(())
}

fn make_readonly_recursive(path: &Path) -> Result<(), StoreError> {
    if path.is_dir() {
        for entry in fs::read_dir(path)? {
            make_readonly_recursive(&entry?.path())?;
        }
    }

    let mut perms = fs::metadata(path)?.permissions();
    perms.set_readonly(true);
    fs::set_permissions(path, perms)?;

    Ok(())
}

#[cfg(unix)]
fn make_writable_recursive(path: &Path) -> Result<(), StoreError> {
    use std::os::unix::fs::PermissionsExt;

    let perms = fs::metadata(path)?.permissions();
    let mode = if path.is_dir() { 0o755 } else { 0o644 };
    let new_perms = fs::Permissions::from_mode(perms.mode() | mode);
    fs::set_permissions(path, new_perms)?;

    if path.is_dir() {
        for entry in fs::read_dir(path)? {
            make_writable_recursive(&entry?.path())?;
        }
    }

    Ok(())
}

#[cfg(not(unix))]
fn make_writable_recursive(path: &Path) -> Result<(), StoreError> {
    let mut perms = fs::metadata(path)?.permissions();
    #[allow(clippy::permissions_set_readonly_false)]
    perms.set_readonly(false);
    fs::set_permissions(path, perms)?;

    if path.is_dir() {
        for entry in fs::read_dir(path)? {
            make_writable_recursive(&entry?.path())?;
        }
    }

    Ok(())
}

fn dir_size(path: &Path) -> Result<u64, StoreError> {
    let mut size = 0;

    if !path.exists() {
        return Ok(0);
    }

    if path.is_file() {
        return Ok(fs::metadata(path)?.len());
    }

    for entry in fs::read_dir(path)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            size += dir_size(&path)?;
        } else {
            size += fs::metadata(&path)?.len();
        }
    }

    Ok(size)
}

#[cfg(unix)]
fn lock_temp_roots_file(file: &fs::File) -> Result<(), StoreError> {
    use std::os::fd::AsRawFd;
    nix::fcntl::flock(file.as_raw_fd(), nix::fcntl::FlockArg::LockExclusive)
        .map_err(|e| StoreError::Io(io::Error::from_raw_os_error(e as i32)))
}

#[cfg(unix)]
fn unlock_temp_roots_file(file: &fs::File) -> Result<(), StoreError> {
    use std::os::fd::AsRawFd;
    nix::fcntl::flock(file.as_raw_fd(), nix::fcntl::FlockArg::Unlock)
        .map_err(|e| StoreError::Io(io::Error::from_raw_os_error(e as i32)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    fn temp_store(suffix: &str) -> Store {
        let dir = env::temp_dir().join(format!("kiln-store-test-{}-{}", std::process::id(), suffix));
        let _ = fs::remove_dir_all(&dir);
        Store::open_at(dir).unwrap()
    }

    #[test]
    fn test_add_and_read_derivation() {
        let mut store = temp_store("drv");
        let drv = Derivation::builder("hello", "1.0").build();
        let path = store.add_derivation(&drv).unwrap();
        let reloaded = store.read_derivation(&path).unwrap();
        assert_eq!(reloaded.name, "hello");
    }

    #[test]
    fn test_register_and_query_valid() {
        let mut store = temp_store("valid");
        let content = b"hello world";
        let path = store.add_to_store(content, "hello-1.0").unwrap();
        assert!(!store.is_valid_path(&path).unwrap());

        let info = PathInfo::new(path.clone(), Hash::of(content), content.len() as u64);
        store.register_valid_paths(vec![info]).unwrap();
        assert!(store.is_valid_path(&path).unwrap());
    }

    #[test]
    fn test_read_only_rejects_mutation() {
        let mut store = temp_store("readonly");
        store.set_read_only(true);
        let err = store.add_to_store(b"x", "x").unwrap_err();
        assert!(matches!(err, StoreError::ReadOnly));
    }
}
