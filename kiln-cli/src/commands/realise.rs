//! The `kiln realise` command: make a set of store paths valid, building or
//! substituting whatever the worker decides is missing.

use crate::output;
use kiln_builder::Builder;
use kiln_derive::StorePath;
use kiln_goal::{Settings, Worker};
use kiln_store::Store;

pub fn run(paths: &[String], repair: bool) -> Result<(), String> {
    if repair {
        output::warning("--repair is not yet implemented; realising normally");
    }

    let store = Store::open().map_err(|e| format!("failed to open store: {e}"))?;
    let settings = Settings::load(None).map_err(|e| format!("failed to load configuration: {e}"))?;

    let store_paths: Vec<StorePath> = paths
        .iter()
        .map(|p| parse_requested_path(&store, p))
        .collect::<Result<_, _>>()?;

    let builder = Builder::new(store);
    let mut worker = Worker::new(builder, settings);

    for path in &store_paths {
        worker.add_goal(path.clone());
    }

    let status = output::Status::new(&format!("Realising {} path(s)", store_paths.len()));
    let code = worker.run();

    match code {
        0 => {
            status.success(None);
            for path in &store_paths {
                output::list_item(&worker.store().to_path(path).display().to_string());
            }
            Ok(())
        }
        100 => {
            status.fail(Some("build failed permanently"));
            Err("realisation failed permanently".to_string())
        }
        _ => {
            status.fail(Some("build failed"));
            Err("realisation failed".to_string())
        }
    }
}

/// Accept either a store path already under the store root or a bare
/// `<hash>-<name>` / `<name>.drv` component.
fn parse_requested_path(store: &Store, arg: &str) -> Result<StorePath, String> {
    let path = std::path::Path::new(arg);
    if let Some(sp) = StorePath::parse(path) {
        return Ok(sp);
    }
    let full = store.root().join(arg);
    StorePath::parse(&full).ok_or_else(|| format!("not a valid store path: {arg}"))
}
