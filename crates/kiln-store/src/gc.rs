//! Garbage collection for the store.
//! 存储的垃圾回收。
//!
//! Garbage collection removes paths that are no longer reachable from
//! any GC root, any live temporary root, or (depending on policy) any
//! live derivation output or deriver.
//! 垃圾回收移除从任何 GC 根、存活的临时根，或（取决于策略）任何
//! 存活推导的输出或生产者不再可达的路径。

use crate::{Store, StoreError};
use kiln_derive::StorePath;
use std::collections::HashSet;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// GC roots directory, holding direct symlinks into the store.
/// GC 根目录，存放指向存储的直接符号链接。
const GC_ROOTS_DIR: &str = "gcroots";

/// Indirect roots live one level below the roots dir; each entry is a
/// symlink whose target is itself a user-chosen symlink into the store.
/// 间接根位于根目录下一级；每个条目是一个符号链接，其目标
/// 本身是用户选择的指向存储的符号链接。
const GC_INDIRECT_DIR: &str = "gcroots/auto";

/// Directory holding one temp-roots file per live worker process.
/// 存放每个存活工作进程的临时根文件的目录。
const TEMP_ROOTS_DIR: &str = "temproots";

/// The GC write lock file. Builders hold it shared; the collector
/// holds it exclusive.
/// GC 写锁文件。构建者持有共享锁；收集器持有排他锁。
const GC_LOCK_FILE: &str = "gc.lock";

/// What a GC invocation should do with the dead set it computes.
/// GC 调用应该对其计算出的死亡集合做什么。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcAction {
    /// Report live paths, delete nothing.
    ReturnLive,
    /// Report dead paths, delete nothing.
    ReturnDead,
    /// Delete every dead path found by a full store scan.
    DeleteDead,
    /// Delete only the paths named in `paths_to_delete`, failing if any
    /// of them is still live.
    DeleteSpecific,
}

/// Options controlling one GC run.
/// 控制一次 GC 运行的选项。
pub struct GcOptions {
    pub action: GcAction,
    /// Skip liveness checks entirely (used by `DeleteSpecific` callers
    /// that already know what they want gone).
    pub ignore_liveness: bool,
    /// Paths to consider for `DeleteSpecific`.
    pub paths_to_delete: Vec<StorePath>,
    /// Stop deleting once this many bytes have been freed.
    pub max_freed: Option<u64>,
}

impl Default for GcOptions {
    fn default() -> Self {
        Self {
            action: GcAction::DeleteDead,
            ignore_liveness: false,
            paths_to_delete: Vec::new(),
            max_freed: None,
        }
    }
}

/// Result of a GC run.
/// GC 运行的结果。
#[derive(Debug, Clone, Default)]
pub struct GcResult {
    /// Paths returned or deleted, depending on the action.
    pub paths: Vec<StorePath>,
    pub bytes_freed: u64,
    pub blocks_freed: u64,
}

impl GcResult {
    /// Format freed bytes as a human-readable string.
    /// 将释放的字节格式化为人类可读的字符串。
    pub fn freed_human(&self) -> String {
        const KB: u64 = 1024;
        const MB: u64 = KB * 1024;
        const GB: u64 = MB * 1024;

        if self.bytes_freed >= GB {
            format!("{:.2} GiB", self.bytes_freed as f64 / GB as f64)
        } else if self.bytes_freed >= MB {
            format!("{:.2} MiB", self.bytes_freed as f64 / MB as f64)
        } else if self.bytes_freed >= KB {
            format!("{:.2} KiB", self.bytes_freed as f64 / KB as f64)
        } else {
            format!("{} B", self.bytes_freed)
        }
    }
}

/// Garbage collector for the store.
/// 存储的垃圾回收器。
pub struct GarbageCollector<'a> {
    store: &'a mut Store,
    /// Keep a path alive if any of its derivation's outputs is alive.
    pub gc_keep_derivations: bool,
    /// Keep a path alive if it is the deriver of a live output.
    pub gc_keep_outputs: bool,
    /// Paths tentatively marked dead while resolving the
    /// keep-derivations/keep-outputs mutual recursion; rolled back if
    /// the branch turns out to be live.
    tentative: HashSet<StorePath>,
    /// Paths confirmed dead so far in the current `try_to_delete` walk.
    dead: HashSet<StorePath>,
}

impl<'a> GarbageCollector<'a> {
    /// Create a new garbage collector with the given root-keeping policy.
    /// 使用给定的根保留策略创建新的垃圾回收器。
    pub fn new(store: &'a mut Store, gc_keep_derivations: bool, gc_keep_outputs: bool) -> Self {
        Self {
            store,
            gc_keep_derivations,
            gc_keep_outputs,
            tentative: HashSet::new(),
            dead: HashSet::new(),
        }
    }

    fn roots_dir(&self) -> PathBuf {
        self.store.root().join(GC_ROOTS_DIR)
    }

    fn indirect_dir(&self) -> PathBuf {
        self.store.root().join(GC_INDIRECT_DIR)
    }

    fn temp_roots_dir(&self) -> PathBuf {
        self.store.root().join(TEMP_ROOTS_DIR)
    }

    fn lock_path(&self) -> PathBuf {
        self.store.root().join(GC_LOCK_FILE)
    }

    /// Add a direct GC root: a symlink under `gcroots/` pointing straight
    /// into the store.
    /// 添加直接 GC 根：`gcroots/` 下指向存储的符号链接。
    pub fn add_root(&self, name: &str, path: &StorePath) -> Result<(), StoreError> {
        let roots_dir = self.roots_dir();
        fs::create_dir_all(&roots_dir)?;
        symlink_replacing(&roots_dir.join(name), &self.store.to_path(path))
    }

    /// Remove a direct GC root.
    pub fn remove_root(&self, name: &str) -> Result<(), StoreError> {
        let link_path = self.roots_dir().join(name);
        if link_path.exists() || link_path.is_symlink() {
            fs::remove_file(&link_path)?;
        }
        Ok(())
    }

    /// Register an indirect root: `<state>/gcroots/auto/<hash-of-target>`
    /// whose target is a user symlink that itself points into the store.
    /// 注册间接根：`<state>/gcroots/auto/<目标哈希>`，其目标是
    /// 用户创建的、指向存储的符号链接。
    pub fn add_indirect_root(&self, link: &Path) -> Result<(), StoreError> {
        let indirect_dir = self.indirect_dir();
        fs::create_dir_all(&indirect_dir)?;

        let digest = kiln_derive::Hash::of(link.to_string_lossy().as_bytes());
        let entry = indirect_dir.join(digest.to_hex());
        symlink_replacing(&entry, link)
    }

    /// Register a temporary root for the current process: a path that
    /// must survive any GC that runs concurrently with this build.
    /// 为当前进程注册临时根：任何与此构建并发运行的 GC 都必须
    /// 保留的路径。
    pub fn add_temp_root(&self, path: &StorePath) -> Result<(), StoreError> {
        let dir = self.temp_roots_dir();
        fs::create_dir_all(&dir)?;
        let file_path = dir.join(format!("{}", std::process::id()));

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&file_path)?;

        #[cfg(unix)]
        lock_file(&file, false)?;

        let target = self.store.to_path(path);
        file.write_all(target.to_string_lossy().as_bytes())?;
        file.write_all(&[0u8])?;

        #[cfg(unix)]
        unlock_file(&file)?;

        Ok(())
    }

    /// `find_roots` from §6: every live root symlink and the store path
    /// it ultimately resolves to.
    pub fn find_roots(&self) -> Result<Vec<(PathBuf, StorePath)>, StoreError> {
        let mut roots = Vec::new();

        let roots_dir = self.roots_dir();
        if roots_dir.exists() {
            for entry in fs::read_dir(&roots_dir)? {
                let entry = entry?;
                let path = entry.path();
                if path == self.indirect_dir() {
                    continue;
                }
                if let Some(sp) = read_root_link(&path)? {
                    roots.push((path, sp));
                }
            }
        }

        let indirect_dir = self.indirect_dir();
        if indirect_dir.exists() {
            for entry in fs::read_dir(&indirect_dir)? {
                let entry = entry?;
                let link = entry.path();
                match fs::read_link(&link) {
                    Ok(target) => {
                        if let Some(sp) = read_root_link(&target)? {
                            roots.push((target, sp));
                        } else {
                            // stale indirect link: target gone, remove it
                            let _ = fs::remove_file(&link);
                        }
                    }
                    Err(_) => {
                        let _ = fs::remove_file(&link);
                    }
                }
            }
        }

        Ok(roots)
    }

    /// Enumerate the live set: permanent roots, indirect roots (one hop,
    /// reaping stale links), and every path named in a live temp-roots
    /// file, transitively closed over references.
    /// 枚举存活集合：永久根、间接根（一跳，回收陈旧链接），
    /// 以及所有存活临时根文件中列出的路径，沿引用传递闭包。
    pub fn find_live_paths(&mut self) -> Result<HashSet<StorePath>, StoreError> {
        let mut seeds: HashSet<StorePath> = self
            .find_roots()?
            .into_iter()
            .map(|(_, sp)| sp)
            .collect();

        for path in self.read_temp_roots()? {
            seeds.insert(path);
        }

        let mut live = HashSet::new();
        for seed in seeds {
            self.add_reachable(&seed, &mut live)?;
        }

        Ok(live)
    }

    /// Read every per-process temp-roots file, reaping files whose
    /// owning process is gone (write-lockable).
    /// 读取每个进程的临时根文件，回收所有者进程已消失的文件
    /// （可写锁定）。
    fn read_temp_roots(&self) -> Result<HashSet<StorePath>, StoreError> {
        let mut live = HashSet::new();
        let dir = self.temp_roots_dir();
        if !dir.exists() {
            return Ok(live);
        }

        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();

            let mut file = fs::File::open(&path)?;
            #[cfg(unix)]
            let stale = try_lock_file(&file).is_ok();
            #[cfg(not(unix))]
            let stale = false;

            let mut contents = Vec::new();
            file.read_to_end(&mut contents)?;

            if stale {
                // owner died; mark reaped and drop the file's contribution
                let _ = fs::write(&path, b"d");
                continue;
            }

            for chunk in contents.split(|&b| b == 0) {
                if chunk.is_empty() {
                    continue;
                }
                let text = String::from_utf8_lossy(chunk);
                if let Some(sp) = StorePath::parse(Path::new(text.as_ref())) {
                    live.insert(sp);
                }
            }
        }

        Ok(live)
    }

    /// Add a path and everything it transitively references to the live
    /// set (derivation input closures included).
    fn add_reachable(
        &mut self,
        path: &StorePath,
        live: &mut HashSet<StorePath>,
    ) -> Result<(), StoreError> {
        if live.contains(path) || !self.store.path_exists(path) {
            return Ok(());
        }
        live.insert(path.clone());

        for reference in self.store.query_references(path)? {
            self.add_reachable(&reference, live)?;
        }

        if path.name().ends_with(".drv")
            && let Ok(drv) = self.store.read_derivation(path)
        {
            let input_drvs: Vec<_> = drv.input_drvs.keys().cloned().collect();
            let input_srcs: Vec<_> = drv.input_srcs.clone();

            for input_drv in input_drvs {
                self.add_reachable(&input_drv, live)?;
            }
            for input_src in input_srcs {
                self.add_reachable(&input_src, live)?;
            }

            if self.gc_keep_derivations {
                for output in drv.outputs.values().filter_map(|o| o.path.clone()) {
                    self.add_reachable(&output, live)?;
                }
            }
        }

        Ok(())
    }

    /// `try_to_delete(p)`: true if `p` was (or can be) removed, false if
    /// still alive. Handles the `gc_keep_derivations`/`gc_keep_outputs`
    /// mutual recursion by tentatively marking `p` dead while walking
    /// its deriver chain, rolling back the mark if the deriver is live.
    fn try_to_delete(&mut self, path: &StorePath, live: &HashSet<StorePath>) -> Result<bool, StoreError> {
        if live.contains(path) || self.dead.contains(path) {
            return Ok(self.dead.contains(path));
        }

        if !self.store.is_valid_path(path)? {
            self.dead.insert(path.clone());
            return Ok(true);
        }

        if !self.store.query_referrers(path)?.is_empty() {
            for referrer in self.store.query_referrers(path)? {
                if live.contains(&referrer) || !self.try_to_delete(&referrer, live)? {
                    return Ok(false);
                }
            }
        }

        if self.gc_keep_outputs {
            self.tentative.insert(path.clone());
            for deriver in self.store.query_valid_derivers(path)? {
                let deriver_alive = live.contains(&deriver) || !self.try_to_delete(&deriver, live)?;
                if deriver_alive {
                    self.tentative.remove(path);
                    return Ok(false);
                }
            }
            self.tentative.remove(path);
        }

        self.dead.insert(path.clone());
        Ok(true)
    }

    /// Run one GC pass per the configured options.
    /// 按配置的选项运行一次 GC。
    pub fn collect(&mut self, options: &GcOptions) -> Result<GcResult, StoreError> {
        let _lock = self.acquire_write_lock()?;

        let live = if options.ignore_liveness {
            HashSet::new()
        } else {
            self.find_live_paths()?
        };

        let mut result = GcResult::default();

        match options.action {
            GcAction::ReturnLive => {
                result.paths = live.into_iter().collect();
            }
            GcAction::ReturnDead => {
                for path in self.store.list_paths()? {
                    if options.ignore_liveness || !live.contains(&path) {
                        result.paths.push(path);
                    }
                }
            }
            GcAction::DeleteSpecific => {
                for path in &options.paths_to_delete {
                    if !options.ignore_liveness && live.contains(path) {
                        return Err(StoreError::PathExists(format!(
                            "{} is still reachable from a root",
                            path.display_name()
                        )));
                    }
                    self.delete_one(path, &mut result, options.max_freed)?;
                }
            }
            GcAction::DeleteDead => {
                let mut candidates = self.store.list_paths()?;
                shuffle(&mut candidates);

                for path in candidates {
                    if let Some(limit) = options.max_freed
                        && result.bytes_freed >= limit
                    {
                        break;
                    }
                    if self.try_to_delete(&path, &live)? {
                        self.delete_one(&path, &mut result, options.max_freed)?;
                    }
                }
            }
        }

        Ok(result)
    }

    fn delete_one(
        &mut self,
        path: &StorePath,
        result: &mut GcResult,
        max_freed: Option<u64>,
    ) -> Result<(), StoreError> {
        if let Some(limit) = max_freed
            && result.bytes_freed >= limit
        {
            return Ok(());
        }

        let fs_path = self.store.to_path(path);
        let size = dir_size(&fs_path).unwrap_or(0);

        // Invalidate in the metadata DB and rename aside before
        // actually unlinking, so a crash mid-GC never leaves a
        // half-deleted valid path still registered.
        // 在实际解除链接之前，先在元数据数据库中使其失效并改名，
        // 这样 GC 中途崩溃永远不会留下已注册但删了一半的有效路径。
        if self.store.query_path_info(path)?.is_some() {
            let aside = fs_path.with_extension(format!("gc-{}", std::process::id()));
            if fs_path.exists() && fs::rename(&fs_path, &aside).is_ok() {
                self.store.delete(path)?;
                let _ = fs::remove_dir_all(&aside).or_else(|_| fs::remove_file(&aside));
            } else {
                self.store.delete(path)?;
            }
        } else {
            let _ = fs::remove_dir_all(&fs_path).or_else(|_| fs::remove_file(&fs_path));
        }

        result.paths.push(path.clone());
        result.bytes_freed += size;
        result.blocks_freed += size.div_ceil(512);

        Ok(())
    }

    #[cfg(unix)]
    fn acquire_write_lock(&self) -> Result<fs::File, StoreError> {
        let path = self.lock_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = fs::OpenOptions::new().create(true).write(true).open(&path)?;
        lock_file(&file, true)?;
        Ok(file)
    }

    #[cfg(not(unix))]
    fn acquire_write_lock(&self) -> Result<fs::File, StoreError> {
        let path = self.lock_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(fs::OpenOptions::new().create(true).write(true).open(&path)?)
    }
}

fn read_root_link(path: &Path) -> Result<Option<StorePath>, StoreError> {
    if !path.is_symlink() {
        return Ok(None);
    }
    let target = fs::read_link(path)?;
    Ok(StorePath::parse(&target))
}

fn symlink_replacing(link_path: &Path, target: &Path) -> Result<(), StoreError> {
    if link_path.exists() || link_path.is_symlink() {
        fs::remove_file(link_path)?;
    }

    #[cfg(unix)]
    std::os::unix::fs::symlink(target, link_path)?;

    #[cfg(not(unix))]
    fs::write(link_path, target.to_string_lossy().as_bytes())?;

    Ok(())
}

/// Shuffle a candidate list so `DeleteDead` scans the store in
/// randomised order, per the procedure.
fn shuffle<T>(items: &mut [T]) {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    for i in (1..items.len()).rev() {
        let j = rng.gen_range(0..=i);
        items.swap(i, j);
    }
}

#[cfg(unix)]
fn lock_file(file: &fs::File, exclusive: bool) -> Result<(), StoreError> {
    use std::os::fd::AsRawFd;
    let arg = if exclusive {
        nix::fcntl::FlockArg::LockExclusive
    } else {
        nix::fcntl::FlockArg::LockShared
    };
    nix::fcntl::flock(file.as_raw_fd(), arg)
        .map_err(|e| StoreError::Io(std::io::Error::from_raw_os_error(e as i32)))
}

#[cfg(unix)]
fn unlock_file(file: &fs::File) -> Result<(), StoreError> {
    use std::os::fd::AsRawFd;
    nix::fcntl::flock(file.as_raw_fd(), nix::fcntl::FlockArg::Unlock)
        .map_err(|e| StoreError::Io(std::io::Error::from_raw_os_error(e as i32)))
}

/// Attempt to take an exclusive lock without blocking; success means no
/// other process holds the file open for reading, i.e. its owner died.
#[cfg(unix)]
fn try_lock_file(file: &fs::File) -> Result<(), StoreError> {
    use std::os::fd::AsRawFd;
    nix::fcntl::flock(file.as_raw_fd(), nix::fcntl::FlockArg::LockExclusiveNonblock)
        .map_err(|e| StoreError::Io(std::io::Error::from_raw_os_error(e as i32)))?;
    nix::fcntl::flock(file.as_raw_fd(), nix::fcntl::FlockArg::Unlock)
        .map_err(|e| StoreError::Io(std::io::Error::from_raw_os_error(e as i32)))?;
    Ok(())
}

/// Calculate directory size.
/// 计算目录大小。
fn dir_size(path: &Path) -> Result<u64, StoreError> {
    let mut size = 0;

    if path.is_file() || path.is_symlink() {
        return Ok(fs::symlink_metadata(path)?.len());
    }

    if path.is_dir() {
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            size += dir_size(&entry.path())?;
        }
    }

    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    fn temp_store(suffix: &str) -> Store {
        let dir = env::temp_dir().join(format!("kiln-gc-test-{}-{}", std::process::id(), suffix));
        let _ = fs::remove_dir_all(&dir);
        Store::open_at(dir).unwrap()
    }

    #[test]
    fn test_unrooted_path_is_collected() {
        let mut store = temp_store("unrooted");
        let path = store.add_to_store(b"garbage", "garbage-1.0").unwrap();
        let info = crate::db::PathInfo::new(path.clone(), kiln_derive::Hash::of(b"garbage"), 7);
        store.register_valid_paths(vec![info]).unwrap();

        let mut gc = GarbageCollector::new(&mut store, true, true);
        let result = gc.collect(&GcOptions::default()).unwrap();

        assert_eq!(result.paths, vec![path]);
    }

    #[test]
    fn test_rooted_path_survives() {
        let mut store = temp_store("rooted");
        let path = store.add_to_store(b"keepme", "keepme-1.0").unwrap();
        let info = crate::db::PathInfo::new(path.clone(), kiln_derive::Hash::of(b"keepme"), 7);
        store.register_valid_paths(vec![info]).unwrap();

        {
            let gc = GarbageCollector::new(&mut store, true, true);
            gc.add_root("keep", &path).unwrap();
        }

        let mut gc = GarbageCollector::new(&mut store, true, true);
        let result = gc.collect(&GcOptions::default()).unwrap();

        assert!(result.paths.is_empty());
        assert!(store.path_exists(&path));
    }

    #[test]
    fn test_delete_specific_fails_on_live_path() {
        let mut store = temp_store("delete-specific");
        let path = store.add_to_store(b"live", "live-1.0").unwrap();
        let info = crate::db::PathInfo::new(path.clone(), kiln_derive::Hash::of(b"live"), 4);
        store.register_valid_paths(vec![info]).unwrap();

        {
            let gc = GarbageCollector::new(&mut store, true, true);
            gc.add_root("keep", &path).unwrap();
        }

        let mut gc = GarbageCollector::new(&mut store, true, true);
        let options = GcOptions {
            action: GcAction::DeleteSpecific,
            paths_to_delete: vec![path],
            ..GcOptions::default()
        };
        assert!(gc.collect(&options).is_err());
    }
}
