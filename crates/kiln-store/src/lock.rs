//! Output-path locking (§5): an exclusive `<path>.lock` per path a goal is
//! about to realise, acquired with paths sorted so two workers racing on an
//! overlapping set never deadlock.
//! 输出路径锁（§5）：goal 即将实现的每个路径有一个独占的
//! `<path>.lock`，按排序顺序获取，避免两个在重叠路径集合上
//! 竞争的 worker 互相死锁。

use crate::StoreError;
use std::fs;
use std::path::{Path, PathBuf};

/// A held set of exclusive locks, released when dropped.
pub struct PathLocks {
    files: Vec<fs::File>,
}

impl PathLocks {
    /// Try to lock every path in `paths`, non-blocking. Paths are sorted
    /// before acquisition. Returns `Ok(None)` rather than an error when any
    /// lock is already held, so a caller can park the goal and retry later
    /// instead of failing it outright.
    pub fn try_acquire(paths: &[PathBuf]) -> Result<Option<Self>, StoreError> {
        let mut sorted: Vec<&PathBuf> = paths.iter().collect();
        sorted.sort();

        let mut files = Vec::with_capacity(sorted.len());
        for path in sorted {
            let lock_path = lock_path_for(path);
            if let Some(parent) = lock_path.parent() {
                fs::create_dir_all(parent)?;
            }
            let file = fs::OpenOptions::new().create(true).write(true).open(&lock_path)?;

            #[cfg(unix)]
            if try_lock_exclusive(&file).is_err() {
                return Ok(None);
            }

            files.push(file);
        }

        Ok(Some(Self { files }))
    }
}

impl Drop for PathLocks {
    fn drop(&mut self) {
        #[cfg(unix)]
        for file in &self.files {
            let _ = unlock(file);
        }
    }
}

fn lock_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".lock");
    PathBuf::from(name)
}

#[cfg(unix)]
fn try_lock_exclusive(file: &fs::File) -> Result<(), StoreError> {
    use std::os::fd::AsRawFd;
    nix::fcntl::flock(file.as_raw_fd(), nix::fcntl::FlockArg::LockExclusiveNonblock)
        .map_err(|e| StoreError::Io(std::io::Error::from_raw_os_error(e as i32)))
}

#[cfg(unix)]
fn unlock(file: &fs::File) -> Result<(), StoreError> {
    use std::os::fd::AsRawFd;
    nix::fcntl::flock(file.as_raw_fd(), nix::fcntl::FlockArg::Unlock)
        .map_err(|e| StoreError::Io(std::io::Error::from_raw_os_error(e as i32)))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_second_acquire_on_same_path_waits() {
        let dir = std::env::temp_dir().join(format!("kiln-lock-test-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let target = dir.join("some-store-path");

        let first = PathLocks::try_acquire(&[target.clone()]).unwrap();
        assert!(first.is_some());

        let second = PathLocks::try_acquire(&[target.clone()]).unwrap();
        assert!(second.is_none());

        drop(first);
        let third = PathLocks::try_acquire(&[target]).unwrap();
        assert!(third.is_some());

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_acquires_in_sorted_order() {
        let dir = std::env::temp_dir().join(format!("kiln-lock-order-test-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let a = dir.join("b-path");
        let b = dir.join("a-path");

        let locks = PathLocks::try_acquire(&[a, b]).unwrap();
        assert!(locks.is_some());

        let _ = fs::remove_dir_all(&dir);
    }
}
