//! The `kiln gc` command.

use crate::output;
use kiln_derive::StorePath;
use kiln_goal::Settings;
use kiln_store::gc::{GarbageCollector, GcAction, GcOptions};
use kiln_store::Store;

pub fn run(action: &str, max_freed: Option<u64>, paths: &[String]) -> Result<(), String> {
    let mut store = Store::open().map_err(|e| format!("failed to open store: {e}"))?;
    let settings = Settings::load(None).map_err(|e| format!("failed to load configuration: {e}"))?;

    let action = match action {
        "return-live" => GcAction::ReturnLive,
        "return-dead" => GcAction::ReturnDead,
        "delete-dead" => GcAction::DeleteDead,
        "delete-specific" => GcAction::DeleteSpecific,
        other => return Err(format!("unknown --action `{other}`")),
    };

    let paths_to_delete: Vec<StorePath> = paths
        .iter()
        .map(|p| {
            let full = store.root().join(p);
            StorePath::parse(&full).ok_or_else(|| format!("not a valid store path: {p}"))
        })
        .collect::<Result<_, _>>()?;

    if matches!(action, GcAction::DeleteSpecific) && paths_to_delete.is_empty() {
        return Err("--action delete-specific requires at least one path".to_string());
    }

    let options = GcOptions {
        action,
        ignore_liveness: false,
        paths_to_delete,
        max_freed,
    };

    let status = output::Status::new("Running garbage collection");

    let mut gc = GarbageCollector::new(&mut store, settings.gc_keep_derivations, settings.gc_keep_outputs);

    let result = match gc.collect(&options) {
        Ok(r) => r,
        Err(e) => {
            status.fail(Some("garbage collection failed"));
            return Err(format!("{e}"));
        }
    };

    status.success(None);
    output::header("Garbage Collection Result");
    output::kv("Paths", &result.paths.len().to_string());
    output::kv("Freed", &result.freed_human());
    println!();

    for path in &result.paths {
        output::list_item(&path.display_name());
    }

    Ok(())
}
