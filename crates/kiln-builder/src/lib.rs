//! Build execution for kiln.
//!
//! This crate launches exactly one derivation build inside a sandbox and
//! registers its outputs. Resolving *which* derivations need building and
//! in what order is the goal engine's job (`kiln-goal`); by the time a
//! `Builder` sees a derivation, its `input_drvs`/`input_srcs` are already
//! realised and valid in the store.

pub mod sandbox;
pub mod executor;
pub mod output;

use kiln_derive::{Derivation, StorePath};
use kiln_store::Store;
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur during building.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store error: {0}")]
    Store(#[from] kiln_store::StoreError),

    #[error("sandbox error: {0}")]
    Sandbox(String),

    #[error("build failed: {0}")]
    BuildFailed(String),

    #[error("missing input: {0}")]
    MissingInput(String),

    #[error("output hash mismatch for {output}: expected {expected}, got {actual}")]
    OutputHashMismatch {
        output: String,
        expected: String,
        actual: String,
    },
}

/// Build result.
#[derive(Debug, Clone)]
pub struct BuildResult {
    /// The derivation that was built.
    pub derivation: StorePath,
    /// Map from output name to store path.
    pub outputs: HashMap<String, StorePath>,
    /// Build log.
    pub log: String,
    /// Build duration in seconds.
    pub duration_secs: f64,
}

/// Builder configuration.
#[derive(Debug, Clone)]
pub struct BuilderConfig {
    /// Number of cores to expose to this build (`max-jobs` controls how
    /// many builds run at once; this controls `NIX_BUILD_CORES` per build).
    pub cores: usize,
    /// Temporary directory for builds.
    pub temp_dir: PathBuf,
    /// Whether to use sandboxing.
    pub sandbox: bool,
    /// Keep failed build directories for debugging.
    pub keep_failed: bool,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            cores: num_cpus(),
            temp_dir: std::env::temp_dir().join("kiln-build"),
            sandbox: cfg!(target_os = "linux"),
            keep_failed: false,
        }
    }
}

/// Get number of CPUs.
fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(1)
}

/// Launches one sandboxed build at a time against a store.
pub struct Builder {
    store: Store,
    config: BuilderConfig,
}

impl Builder {
    /// Create a new builder.
    pub fn new(store: Store) -> Self {
        Self {
            store,
            config: BuilderConfig::default(),
        }
    }

    /// Create a new builder with configuration.
    pub fn with_config(store: Store, config: BuilderConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut Store {
        &mut self.store
    }

    pub fn config(&self) -> &BuilderConfig {
        &self.config
    }

    /// Check if every output of `drv` already has a fixed, existing path
    /// (used by `DerivationGoal::HaveDerivation` to skip rebuilding).
    pub fn check_outputs_exist(&self, drv: &Derivation) -> Option<HashMap<String, StorePath>> {
        let mut outputs = HashMap::new();

        for (name, output) in &drv.outputs {
            let path = output.path.as_ref()?;
            if !self.store.path_exists(path) {
                return None;
            }
            outputs.insert(name.clone(), path.clone());
        }

        Some(outputs)
    }

    /// Build a derivation whose inputs are already realised, registering
    /// its outputs as valid paths on success.
    pub fn build(&mut self, drv: &Derivation) -> Result<BuildResult, BuildError> {
        let start = std::time::Instant::now();
        let drv_path = drv.drv_path();

        if let Some(outputs) = self.check_outputs_exist(drv) {
            return Ok(BuildResult {
                derivation: drv_path,
                outputs,
                log: String::new(),
                duration_secs: 0.0,
            });
        }

        for input_drv_path in drv.input_drvs.keys() {
            if !self.store.path_exists(input_drv_path) {
                return Err(BuildError::MissingInput(input_drv_path.display_name()));
            }
        }
        for input_src in &drv.input_srcs {
            if !self.store.path_exists(input_src) {
                return Err(BuildError::MissingInput(input_src.display_name()));
            }
        }

        let (outputs, log) = self.execute_build(drv)?;
        let duration = start.elapsed().as_secs_f64();

        Ok(BuildResult {
            derivation: drv_path,
            outputs,
            log,
            duration_secs: duration,
        })
    }

    fn execute_build(&mut self, drv: &Derivation) -> Result<(HashMap<String, StorePath>, String), BuildError> {
        use executor::BuildExecutor;

        let mut executor = BuildExecutor::new(&mut self.store, &self.config);
        executor.execute(drv)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_config_default() {
        let config = BuilderConfig::default();
        assert!(config.cores >= 1);
    }
}
