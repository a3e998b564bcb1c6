//! Layered configuration for the goal engine.
//!
//! Precedence, lowest to highest: built-in defaults, a config file, `KILN_*`
//! environment overrides, then CLI flags — the caller applies the last step
//! by mutating the struct returned from [`Settings::load`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid value for `{key}`: {value}")]
    InvalidValue { key: String, value: String },
}

/// Every configuration option recognised by the engine (§6).
#[derive(Debug, Clone)]
pub struct Settings {
    /// Name of the group builds allocate per-uid workers from; empty disables.
    pub build_users_group: String,
    /// Upper bound on concurrent local builds.
    pub max_jobs: u32,
    /// Value exposed to builders as `NIX_BUILD_CORES`.
    pub cores: u32,
    /// Seconds since last stdout/stderr byte before a build is killed.
    pub max_silent_time: u64,
    /// Wall-clock seconds since build start before a build is killed. 0 disables.
    pub timeout: u64,
    /// Whether substitution is attempted before building.
    pub use_substitutes: bool,
    /// Substituter command lines, tried in order.
    pub substituters: Vec<String>,
    /// After every substituter fails, still attempt a local build.
    pub try_fallback: bool,
    /// Keep scheduling other goals after one fails.
    pub keep_going: bool,
    /// Retain the temp directory of a failed build for inspection.
    pub keep_failed: bool,
    /// Use a chroot/namespace sandbox for local builds.
    pub use_chroot: bool,
    /// Extra host paths bind-mounted read-only into the chroot.
    pub dirs_in_chroot: Vec<PathBuf>,
    /// Keep a path's outputs alive whenever the path itself is live.
    pub gc_keep_derivations: bool,
    /// Keep a path's deriver alive whenever the path itself is live.
    pub gc_keep_outputs: bool,
    /// Remember failed builds so repeat requests fail fast.
    pub cache_failure: bool,
    /// Polling interval, in milliseconds, for lock-sleeping goals.
    pub poll_interval_ms: u64,
    /// Reject every mutating store operation.
    pub read_only_mode: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            build_users_group: String::new(),
            max_jobs: 1,
            cores: std::thread::available_parallelism().map(|p| p.get() as u32).unwrap_or(1),
            max_silent_time: 0,
            timeout: 0,
            use_substitutes: true,
            substituters: Vec::new(),
            try_fallback: false,
            keep_going: false,
            keep_failed: false,
            use_chroot: cfg!(target_os = "linux"),
            dirs_in_chroot: Vec::new(),
            gc_keep_derivations: true,
            gc_keep_outputs: false,
            cache_failure: false,
            poll_interval_ms: 500,
            read_only_mode: false,
        }
    }
}

impl Settings {
    /// Load defaults, then a config file if one exists, then environment
    /// overrides. CLI flags are applied by the caller afterwards.
    pub fn load(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut settings = Self::default();

        if let Some(path) = config_path
            && path.exists()
        {
            settings.apply_file(path)?;
        }

        settings.apply_env();
        Ok(settings)
    }

    fn apply_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                self.apply_one(key.trim(), value.trim())?;
            }
        }

        Ok(())
    }

    fn apply_env(&mut self) {
        let overrides: HashMap<&str, &str> = [
            ("build-users-group", "KILN_BUILD_USERS_GROUP"),
            ("max-jobs", "KILN_MAX_JOBS"),
            ("cores", "KILN_CORES"),
            ("max-silent-time", "KILN_MAX_SILENT_TIME"),
            ("timeout", "KILN_TIMEOUT"),
            ("use-substitutes", "KILN_USE_SUBSTITUTES"),
            ("try-fallback", "KILN_TRY_FALLBACK"),
            ("keep-going", "KILN_KEEP_GOING"),
            ("keep-failed", "KILN_KEEP_FAILED"),
            ("use-chroot", "KILN_USE_CHROOT"),
            ("gc-keep-outputs", "KILN_GC_KEEP_OUTPUTS"),
            ("gc-keep-derivations", "KILN_GC_KEEP_DERIVATIONS"),
            ("cache-failure", "KILN_CACHE_FAILURE"),
            ("poll-interval", "KILN_POLL_INTERVAL"),
            ("read-only-mode", "KILN_READ_ONLY_MODE"),
        ]
        .into_iter()
        .collect();

        for (key, var) in overrides {
            if let Ok(value) = std::env::var(var) {
                let _ = self.apply_one(key, &value);
            }
        }
    }

    fn apply_one(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let invalid = || ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        };

        match key {
            "build-users-group" => self.build_users_group = value.to_string(),
            "max-jobs" => self.max_jobs = value.parse().map_err(|_| invalid())?,
            "cores" => self.cores = value.parse().map_err(|_| invalid())?,
            "max-silent-time" => self.max_silent_time = value.parse().map_err(|_| invalid())?,
            "timeout" => self.timeout = value.parse().map_err(|_| invalid())?,
            "use-substitutes" => self.use_substitutes = parse_bool(value).ok_or_else(invalid)?,
            "substituters" => self.substituters = value.split(',').map(str::to_string).collect(),
            "try-fallback" => self.try_fallback = parse_bool(value).ok_or_else(invalid)?,
            "keep-going" => self.keep_going = parse_bool(value).ok_or_else(invalid)?,
            "keep-failed" => self.keep_failed = parse_bool(value).ok_or_else(invalid)?,
            "use-chroot" => self.use_chroot = parse_bool(value).ok_or_else(invalid)?,
            "dirs-in-chroot" => self.dirs_in_chroot = value.split(':').map(PathBuf::from).collect(),
            "gc-keep-derivations" => self.gc_keep_derivations = parse_bool(value).ok_or_else(invalid)?,
            "gc-keep-outputs" => self.gc_keep_outputs = parse_bool(value).ok_or_else(invalid)?,
            "cache-failure" => self.cache_failure = parse_bool(value).ok_or_else(invalid)?,
            "poll-interval" => self.poll_interval_ms = value.parse().map_err(|_| invalid())?,
            "read-only-mode" => self.read_only_mode = parse_bool(value).ok_or_else(invalid)?,
            _ => return Err(invalid()),
        }

        Ok(())
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.max_jobs, 1);
        assert!(settings.gc_keep_derivations);
    }

    #[test]
    fn test_env_override() {
        // SAFETY: test runs single-threaded within this process's test harness slot.
        unsafe {
            std::env::set_var("KILN_MAX_JOBS", "4");
        }
        let settings = Settings::load(None).unwrap();
        unsafe {
            std::env::remove_var("KILN_MAX_JOBS");
        }
        assert_eq!(settings.max_jobs, 4);
    }
}
