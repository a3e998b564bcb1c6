//! Substitute a single store path from a configured substituter instead of
//! building it, per §4.4/§6: invoke `<substituter> --substitute <path>
//! <dest>`, verify the NAR hash, then register it valid.

use std::process::Command;

use kiln_derive::{Hash, StorePath};
use kiln_store::PathInfo;

use crate::error::GoalError;
use crate::goal::{ExitStatus, Goal, GoalId, WorkResult};
use crate::worker::WorkerCtx;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubstitutionState {
    Init,
    /// About to try the substituter at `next_substituter`.
    TryNext,
    /// A substituter reported hash/size; waiting for the references
    /// closure (each reference becomes its own substitution goal).
    GotInfo,
    ReferencesValid,
    TryToRun,
    Finished,
}

pub struct SubstitutionGoal {
    id: GoalId,
    path: StorePath,
    state: SubstitutionState,
    next_substituter: usize,
    pending_references: Vec<GoalId>,
    info: Option<SubstitutableInfo>,
    exit: Option<ExitStatus>,
}

struct SubstitutableInfo {
    references: Vec<StorePath>,
    nar_size: u64,
    /// The hash the substituter advertised on stdout, if it emitted one in
    /// recognisable `"<hashType>:<hash>"` form; verified against the fetched
    /// content's actual NAR hash in `step_try_to_run`.
    expected_hash: Option<Hash>,
}

/// Parse a substituter's advertised `"<hashType>:<hash16or32>"` stdout line.
/// Short (16-byte) hex is padded the same lossy way `StorePath::parse_name`
/// reconstructs a short-hex store path. Returns `None` for anything that
/// doesn't look like a recognisable hash, rather than erroring: a
/// substituter that prints no usable hash just skips verification.
fn parse_advertised_hash(line: &str) -> Option<Hash> {
    let (_hash_type, hex) = line.split_once(':')?;
    match hex.len() {
        64 => Hash::from_hex(hex).ok(),
        32 => {
            let short = hex::decode(hex).ok()?;
            let mut bytes = [0u8; 32];
            bytes[..16].copy_from_slice(&short);
            Some(Hash::from_bytes(bytes))
        }
        _ => None,
    }
}

impl SubstitutionGoal {
    pub fn new(id: GoalId, path: StorePath) -> Self {
        Self {
            id,
            path,
            state: SubstitutionState::Init,
            next_substituter: 0,
            pending_references: Vec::new(),
            info: None,
            exit: None,
        }
    }

    pub fn path(&self) -> &StorePath {
        &self.path
    }

    fn finish(&mut self, status: ExitStatus) -> WorkResult {
        self.state = SubstitutionState::Finished;
        self.exit = Some(status);
        WorkResult::Done(status)
    }

    fn step_init(&mut self, ctx: &mut WorkerCtx) -> Result<WorkResult, GoalError> {
        if ctx.store().is_valid_path(&self.path)? {
            return Ok(self.finish(ExitStatus::Success));
        }
        if !ctx.settings.use_substitutes || ctx.settings.substituters.is_empty() {
            return Ok(self.finish(ExitStatus::NoSubstituters));
        }
        self.state = SubstitutionState::TryNext;
        Ok(WorkResult::Waiting(Vec::new()))
    }

    fn step_try_next(&mut self, ctx: &mut WorkerCtx) -> Result<WorkResult, GoalError> {
        if self.next_substituter >= ctx.settings.substituters.len() {
            return Ok(self.finish(ExitStatus::NoSubstituters));
        }

        let sub = ctx.settings.substituters[self.next_substituter].clone();
        self.next_substituter += 1;

        let dest = ctx.store().to_path(&self.path);
        let output = Command::new(&sub)
            .arg("--substitute")
            .arg(self.path.display_name())
            .arg(&dest)
            .output();

        let output = match output {
            Ok(o) if o.status.success() => o,
            _ => return Ok(WorkResult::Waiting(Vec::new())), // try the next substituter
        };

        let line = String::from_utf8_lossy(&output.stdout);
        let line = line.lines().next().unwrap_or("").trim();
        let expected_hash = if line.is_empty() { None } else { parse_advertised_hash(line) };

        let nar_size = std::fs::metadata(&dest).map(|m| m.len()).unwrap_or(0);

        // The substituter's only wire channel is the fetched content itself, so
        // references are discovered the same way a builder's outputs are: scan
        // for the on-disk strings of paths already known to this store.
        let candidates = ctx.store().list_paths().unwrap_or_default();
        let references = kiln_builder::output::scan_references(&dest, &candidates, ctx.store())
            .unwrap_or_default()
            .into_iter()
            .filter(|r| r != &self.path)
            .collect();

        self.info = Some(SubstitutableInfo { references, nar_size, expected_hash });
        self.state = SubstitutionState::GotInfo;
        Ok(WorkResult::Waiting(Vec::new()))
    }

    fn step_got_info(&mut self, ctx: &mut WorkerCtx) -> Result<WorkResult, GoalError> {
        let info = self.info.as_ref().expect("GotInfo without info");
        self.pending_references = info
            .references
            .iter()
            .cloned()
            .map(|r| ctx.get_or_create_substitution_goal(r))
            .collect();

        self.state = SubstitutionState::ReferencesValid;
        Ok(WorkResult::Waiting(self.pending_references.clone()))
    }

    fn step_references_valid(&mut self, ctx: &mut WorkerCtx) -> Result<WorkResult, GoalError> {
        let all_ok = self.pending_references.iter().all(|id| ctx.goal_succeeded(*id));
        if !all_ok {
            return Ok(self.finish(ExitStatus::Failed));
        }
        self.state = SubstitutionState::TryToRun;
        Ok(WorkResult::Waiting(Vec::new()))
    }

    fn step_try_to_run(&mut self, ctx: &mut WorkerCtx) -> Result<WorkResult, GoalError> {
        // §5: lock the output path before touching the metadata database;
        // re-check validity once held in case another goal won the race.
        let dest = ctx.store().to_path(&self.path);
        let Some(_locks) = kiln_store::PathLocks::try_acquire(&[dest])? else {
            return Ok(WorkResult::WaitingAWhile);
        };
        if ctx.store().is_valid_path(&self.path)? {
            return Ok(self.finish(ExitStatus::Success));
        }

        let info = self.info.as_ref().expect("TryToRun without info");
        let nar_hash = kiln_store::hash_path(&ctx.store().to_path(&self.path))
            .map_err(|e| GoalError::Hash(e.to_string()))?;

        // SubstError: the content this substituter served doesn't match the
        // hash it advertised. Fall back to the next substituter instead of
        // failing outright (`next_substituter` was already advanced).
        if let Some(expected) = info.expected_hash {
            if expected != nar_hash {
                log::warn!(
                    "substituter for {} advertised hash {} but delivered {}; trying next substituter",
                    self.path.display_name(),
                    expected,
                    nar_hash
                );
                self.info = None;
                self.state = SubstitutionState::TryNext;
                return Ok(WorkResult::Waiting(Vec::new()));
            }
        }

        let info = self.info.as_ref().expect("TryToRun without info");
        let mut path_info = PathInfo::new(self.path.clone(), nar_hash, info.nar_size);
        for r in &info.references {
            path_info.add_reference(r.clone());
        }

        ctx.store().register_valid_paths(vec![path_info])?;
        self.state = SubstitutionState::Finished;
        Ok(self.finish(ExitStatus::Success))
    }
}

impl Goal for SubstitutionGoal {
    fn id(&self) -> GoalId {
        self.id
    }

    fn work(&mut self, ctx: &mut WorkerCtx) -> WorkResult {
        let result = match self.state {
            SubstitutionState::Init => self.step_init(ctx),
            SubstitutionState::TryNext => self.step_try_next(ctx),
            SubstitutionState::GotInfo => self.step_got_info(ctx),
            SubstitutionState::ReferencesValid => self.step_references_valid(ctx),
            SubstitutionState::TryToRun => self.step_try_to_run(ctx),
            SubstitutionState::Finished => return WorkResult::Done(self.exit.unwrap_or(ExitStatus::Failed)),
        };

        match result {
            Ok(r) => r,
            Err(e) => {
                log::warn!("substitution of {} failed: {}", self.path.display_name(), e);
                self.finish(ExitStatus::Failed)
            }
        }
    }

    fn cancel(&mut self, _ctx: &mut WorkerCtx) {
        self.state = SubstitutionState::Finished;
        self.exit = Some(ExitStatus::Failed);
    }

    fn label(&self) -> String {
        format!("sub:{}", self.path.display_name())
    }
}

#[cfg(test)]
mod tests {
    use crate::config::Settings;
    use crate::worker::Worker;
    use kiln_builder::Builder;
    use kiln_derive::{Hash, StorePath};
    use kiln_store::Store;
    use tempfile::TempDir;

    /// A fake substituter: writes fixed content to the requested destination
    /// and reports success on stdout, exercising `step_try_next` without a
    /// real network-backed binary cache.
    #[cfg(unix)]
    fn write_fake_substituter(dir: &std::path::Path) -> std::path::PathBuf {
        use std::fs;
        use std::os::unix::fs::PermissionsExt;

        let script = dir.join("fake-substituter.sh");
        fs::write(&script, "#!/bin/sh\necho -n 'hello from cache' > \"$3\"\necho ok\n").unwrap();
        let mut perms = fs::metadata(&script).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&script, perms).unwrap();
        script
    }

    #[cfg(unix)]
    #[test]
    fn test_substitution_fetches_from_configured_substituter() {
        let store_dir = TempDir::new().unwrap();
        let scratch_dir = TempDir::new().unwrap();
        let store = Store::open_at(store_dir.path().to_path_buf()).unwrap();

        let script = write_fake_substituter(scratch_dir.path());
        let mut settings = Settings::default();
        settings.substituters = vec![script.display().to_string()];

        let path = StorePath::new(Hash::of_str("cached-thing"), "cached-thing-1.0".to_string());

        let mut worker = Worker::new(Builder::new(store), settings);
        worker.add_goal(path);
        assert_eq!(worker.run(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_no_substituters_fails_without_a_builder() {
        let store_dir = TempDir::new().unwrap();
        let store = Store::open_at(store_dir.path().to_path_buf()).unwrap();
        let settings = Settings { substituters: Vec::new(), ..Settings::default() };

        let path = StorePath::new(Hash::of_str("unreachable-thing"), "unreachable-thing-1.0".to_string());

        let mut worker = Worker::new(Builder::new(store), settings);
        worker.add_goal(path);
        assert_eq!(worker.run(), 1);
    }
}
