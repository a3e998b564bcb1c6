//! Build executor.

use crate::sandbox::{Sandbox, SandboxConfig};
use crate::{BuildError, BuilderConfig};
use kiln_derive::{Derivation, StorePath};
use kiln_store::{PathInfo, Store};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// Build executor.
pub struct BuildExecutor<'a> {
    store: &'a mut Store,
    config: &'a BuilderConfig,
}

impl<'a> BuildExecutor<'a> {
    /// Create a new build executor.
    pub fn new(store: &'a mut Store, config: &'a BuilderConfig) -> Self {
        Self { store, config }
    }

    /// Execute a derivation build.
    pub fn execute(&mut self, drv: &Derivation) -> Result<(HashMap<String, StorePath>, String), BuildError> {
        let build_id = format!("{}-{}", drv.name, uuid_simple());
        let build_root = self.config.temp_dir.join(&build_id);
        fs::create_dir_all(&build_root)?;

        let sandbox_config = SandboxConfig::new(build_root.clone());
        let sandbox = Sandbox::new(sandbox_config)?;

        fs::create_dir_all(sandbox.build_dir().join("tmp"))?;

        let env = self.prepare_env(drv, &sandbox)?;
        self.setup_inputs(drv, &sandbox)?;
        let output_dirs = self.create_output_dirs(drv, &sandbox)?;

        let output = sandbox.execute(&drv.builder, &drv.args, &env)?;

        let log = format!(
            "=== stdout ===\n{}\n=== stderr ===\n{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );

        if !output.status.success() {
            if self.config.keep_failed {
                eprintln!("Build failed. Keeping build directory: {}", build_root.display());
            } else {
                let _ = sandbox.cleanup();
            }
            return Err(BuildError::BuildFailed(format!(
                "builder exited with status {}\n{}",
                output.status, log
            )));
        }

        let outputs = self.collect_outputs(drv, &output_dirs)?;

        if !self.config.keep_failed {
            let _ = sandbox.cleanup();
        }

        Ok((outputs, log))
    }

    /// Prepare environment variables for the build.
    fn prepare_env(&self, drv: &Derivation, sandbox: &Sandbox) -> Result<HashMap<String, String>, BuildError> {
        let mut env: HashMap<String, String> = drv.env.iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        env.insert("NIX_BUILD_TOP".to_string(), sandbox.build_dir().to_string_lossy().into_owned());
        env.insert("TMPDIR".to_string(), sandbox.build_dir().join("tmp").to_string_lossy().into_owned());
        env.insert("TEMPDIR".to_string(), sandbox.build_dir().join("tmp").to_string_lossy().into_owned());
        env.insert("TMP".to_string(), sandbox.build_dir().join("tmp").to_string_lossy().into_owned());
        env.insert("TEMP".to_string(), sandbox.build_dir().join("tmp").to_string_lossy().into_owned());
        env.insert("HOME".to_string(), sandbox.build_dir().to_string_lossy().into_owned());
        env.insert("PWD".to_string(), sandbox.build_dir().to_string_lossy().into_owned());

        env.insert("NIX_BUILD_CORES".to_string(), self.config.cores.to_string());
        env.insert("name".to_string(), drv.name.clone());
        env.insert("version".to_string(), drv.version.clone());
        env.insert("system".to_string(), drv.system.clone());

        for name in drv.outputs.keys() {
            let out_dir = sandbox.output_dir().join(name);
            env.insert(name.clone(), out_dir.to_string_lossy().into_owned());
        }

        Ok(env)
    }

    /// Set up input paths in the sandbox.
    fn setup_inputs(&self, drv: &Derivation, sandbox: &Sandbox) -> Result<(), BuildError> {
        let inputs_dir = sandbox.build_dir().join("inputs");
        fs::create_dir_all(&inputs_dir)?;

        for (input_drv_path, output_names) in &drv.input_drvs {
            let input_store_path = self.store.to_path(input_drv_path);

            for output_name in output_names {
                let link_name = format!("{}-{}", input_drv_path.name(), output_name);
                let link_path = inputs_dir.join(&link_name);

                if input_store_path.exists() {
                    #[cfg(unix)]
                    std::os::unix::fs::symlink(&input_store_path, &link_path)?;

                    #[cfg(not(unix))]
                    fs::copy(&input_store_path, &link_path)?;
                }
            }
        }

        for input_src in &drv.input_srcs {
            let src_path = self.store.to_path(input_src);
            let link_path = inputs_dir.join(input_src.name());

            if src_path.exists() {
                #[cfg(unix)]
                std::os::unix::fs::symlink(&src_path, &link_path)?;

                #[cfg(not(unix))]
                {
                    if src_path.is_dir() {
                        copy_dir_recursive(&src_path, &link_path)?;
                    } else {
                        fs::copy(&src_path, &link_path)?;
                    }
                }
            }
        }

        Ok(())
    }

    /// Create output directories.
    fn create_output_dirs(&self, drv: &Derivation, sandbox: &Sandbox) -> Result<HashMap<String, std::path::PathBuf>, BuildError> {
        let mut output_dirs = HashMap::new();

        for name in drv.outputs.keys() {
            let out_dir = sandbox.output_dir().join(name);
            fs::create_dir_all(&out_dir)?;
            output_dirs.insert(name.clone(), out_dir);
        }

        Ok(output_dirs)
    }

    /// Collect outputs, add them to the store, and register them valid
    /// with their NAR hash/size so GC and `query_valid_derivers` see them.
    fn collect_outputs(
        &mut self,
        drv: &Derivation,
        output_dirs: &HashMap<String, std::path::PathBuf>,
    ) -> Result<HashMap<String, StorePath>, BuildError> {
        let drv_path = drv.drv_path();
        let input_closure: Vec<StorePath> = drv
            .input_drvs
            .keys()
            .cloned()
            .chain(drv.input_srcs.iter().cloned())
            .collect();

        let mut outputs = HashMap::new();
        let mut infos = Vec::new();

        for (name, output) in &drv.outputs {
            let out_dir = output_dirs.get(name)
                .ok_or_else(|| BuildError::BuildFailed(format!("missing output directory: {}", name)))?;

            crate::output::validate_output(out_dir)?;

            let nar_hash = kiln_store::hash_path(out_dir)
                .map_err(|e| BuildError::BuildFailed(e.to_string()))?;

            if let Some(ref expected_hash) = output.expected_hash
                && nar_hash != *expected_hash
            {
                return Err(BuildError::OutputHashMismatch {
                    output: name.clone(),
                    expected: expected_hash.to_hex(),
                    actual: nar_hash.to_hex(),
                });
            }

            let store_name = if name == "out" {
                format!("{}-{}", drv.name, drv.version)
            } else {
                format!("{}-{}-{}", drv.name, drv.version, name)
            };

            let store_path = self.store.add_dir(out_dir, &store_name)?;
            let nar_size = crate::output::output_size(out_dir).unwrap_or(0);

            let mut info = PathInfo::new(store_path.clone(), nar_hash, nar_size);
            info.set_deriver(drv_path.clone());
            for reference in crate::output::scan_references(out_dir, &input_closure, self.store)? {
                info.add_reference(reference);
            }
            infos.push(info);

            outputs.insert(name.clone(), store_path);
        }

        self.store.register_valid_paths(infos)?;

        Ok(outputs)
    }
}

/// Generate a simple unique ID.
fn uuid_simple() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    format!("{:x}{:x}", now.as_secs(), now.subsec_nanos())
}

/// Recursively copy a directory.
#[cfg(not(unix))]
fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<(), BuildError> {
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
