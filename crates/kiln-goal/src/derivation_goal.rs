//! Realise a single derivation: substitute its outputs if possible,
//! otherwise realise its inputs and build it.

use kiln_derive::{Derivation, StorePath};

use crate::error::GoalError;
use crate::goal::{ExitStatus, Goal, GoalId, WorkResult};
use crate::worker::WorkerCtx;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DerivationState {
    Init,
    HaveDerivation,
    OutputsSubstituted,
    InputsRealised,
    TryToBuild,
    BuildDone,
    ClosureRepaired,
}

pub struct DerivationGoal {
    id: GoalId,
    drv_path: StorePath,
    state: DerivationState,
    drv: Option<Derivation>,
    waiting_for: Vec<GoalId>,
    exit: Option<ExitStatus>,
}

impl DerivationGoal {
    pub fn new(id: GoalId, drv_path: StorePath) -> Self {
        Self {
            id,
            drv_path,
            state: DerivationState::Init,
            drv: None,
            waiting_for: Vec::new(),
            exit: None,
        }
    }

    pub fn drv_path(&self) -> &StorePath {
        &self.drv_path
    }

    fn finish(&mut self, status: ExitStatus) -> WorkResult {
        self.state = DerivationState::ClosureRepaired;
        self.exit = Some(status);
        WorkResult::Done(status)
    }

    fn outputs_all_valid(&self, ctx: &mut WorkerCtx) -> bool {
        let drv = self.drv.as_ref().expect("no derivation loaded");
        drv.outputs.values().all(|out| match &out.path {
            Some(p) => ctx.store().is_valid_path(p).unwrap_or(false),
            None => false,
        })
    }

    fn step_init(&mut self, ctx: &mut WorkerCtx) -> Result<WorkResult, GoalError> {
        // §4.2 step 1: protect the drv from a GC racing with this realisation.
        ctx.store().add_temp_root(&self.drv_path)?;

        if ctx.store().has_path_failed(&self.drv_path) {
            return Ok(self.finish(ExitStatus::PermanentFailure));
        }
        let drv = ctx.store().read_derivation(&self.drv_path)?;
        self.drv = Some(drv);
        self.state = DerivationState::HaveDerivation;
        Ok(WorkResult::Waiting(Vec::new()))
    }

    fn step_have_derivation(&mut self, ctx: &mut WorkerCtx) -> Result<WorkResult, GoalError> {
        if self.outputs_all_valid(ctx) {
            return Ok(self.finish(ExitStatus::Success));
        }

        let drv = self.drv.as_ref().expect("no derivation loaded");
        self.waiting_for = if ctx.settings.use_substitutes {
            drv.outputs
                .values()
                .filter_map(|out| out.path.clone())
                .map(|p| ctx.get_or_create_substitution_goal(p))
                .collect()
        } else {
            Vec::new()
        };

        self.state = DerivationState::OutputsSubstituted;
        Ok(WorkResult::Waiting(self.waiting_for.clone()))
    }

    fn step_outputs_substituted(&mut self, ctx: &mut WorkerCtx) -> Result<WorkResult, GoalError> {
        if self.outputs_all_valid(ctx) {
            return Ok(self.finish(ExitStatus::Success));
        }
        let substitution_attempted = ctx.settings.use_substitutes && !ctx.settings.substituters.is_empty();
        if substitution_attempted && !ctx.settings.try_fallback {
            return Ok(self.finish(ExitStatus::PermanentFailure));
        }

        let drv = self.drv.as_ref().expect("no derivation loaded").clone();
        let input_drv_goals: Vec<GoalId> = drv
            .input_drvs
            .keys()
            .cloned()
            .map(|p| ctx.get_or_create_derivation_goal(p))
            .collect();
        let input_src_goals: Vec<GoalId> = drv
            .input_srcs
            .iter()
            .cloned()
            .map(|p| ctx.get_or_create_substitution_goal(p))
            .collect();

        self.waiting_for = input_drv_goals.into_iter().chain(input_src_goals).collect();
        self.state = DerivationState::InputsRealised;
        Ok(WorkResult::Waiting(self.waiting_for.clone()))
    }

    fn step_inputs_realised(&mut self, ctx: &mut WorkerCtx) -> Result<WorkResult, GoalError> {
        let all_ok = self.waiting_for.iter().all(|id| ctx.goal_succeeded(*id));
        if !all_ok {
            if ctx.settings.cache_failure {
                ctx.store().register_failed_path(self.drv_path.clone());
            }
            return Ok(self.finish(ExitStatus::PermanentFailure));
        }
        self.state = DerivationState::TryToBuild;
        Ok(WorkResult::Waiting(Vec::new()))
    }

    fn step_try_to_build(&mut self, ctx: &mut WorkerCtx) -> Result<WorkResult, GoalError> {
        let drv = self.drv.as_ref().expect("no derivation loaded").clone();

        // §5: an exclusive lock on the drv itself (output paths are unknown
        // until the build hashes its content, so the drv path is the
        // earliest point two workers racing on the same derivation collide).
        let lock_target = ctx.store().to_path(&self.drv_path);
        let Some(_locks) = kiln_store::PathLocks::try_acquire(&[lock_target])? else {
            return Ok(WorkResult::WaitingAWhile);
        };

        if self.outputs_all_valid(ctx) {
            self.state = DerivationState::BuildDone;
            return Ok(WorkResult::Waiting(Vec::new()));
        }

        match ctx.build(&drv) {
            Ok(_result) => {
                self.state = DerivationState::BuildDone;
                Ok(WorkResult::Waiting(Vec::new()))
            }
            Err(e) => {
                log::warn!("build of {} failed: {}", self.drv_path.display_name(), e);
                let fixed_output = drv.outputs.values().any(|out| out.is_fixed());
                if ctx.settings.cache_failure && !fixed_output {
                    ctx.store().register_failed_path(self.drv_path.clone());
                }
                Ok(self.finish(ExitStatus::PermanentFailure))
            }
        }
    }

    fn step_build_done(&mut self, ctx: &mut WorkerCtx) -> Result<WorkResult, GoalError> {
        if !self.outputs_all_valid(ctx) {
            return Ok(self.finish(ExitStatus::PermanentFailure));
        }
        self.state = DerivationState::ClosureRepaired;
        Ok(self.finish(ExitStatus::Success))
    }
}

impl Goal for DerivationGoal {
    fn id(&self) -> GoalId {
        self.id
    }

    fn work(&mut self, ctx: &mut WorkerCtx) -> WorkResult {
        let result = match self.state {
            DerivationState::Init => self.step_init(ctx),
            DerivationState::HaveDerivation => self.step_have_derivation(ctx),
            DerivationState::OutputsSubstituted => self.step_outputs_substituted(ctx),
            DerivationState::InputsRealised => self.step_inputs_realised(ctx),
            DerivationState::TryToBuild => self.step_try_to_build(ctx),
            DerivationState::BuildDone => self.step_build_done(ctx),
            DerivationState::ClosureRepaired => return WorkResult::Done(self.exit.unwrap_or(ExitStatus::Failed)),
        };

        match result {
            Ok(r) => r,
            Err(e) => {
                log::warn!("goal for {} errored: {}", self.drv_path.display_name(), e);
                self.finish(ExitStatus::PermanentFailure)
            }
        }
    }

    fn cancel(&mut self, _ctx: &mut WorkerCtx) {
        self.state = DerivationState::ClosureRepaired;
        self.exit = Some(ExitStatus::Failed);
    }

    fn label(&self) -> String {
        format!("drv:{}", self.drv_path.display_name())
    }
}

#[cfg(test)]
mod tests {
    use crate::config::Settings;
    use crate::worker::Worker;
    use kiln_builder::Builder;
    use kiln_derive::Derivation;
    use kiln_store::{PathInfo, Store};
    use tempfile::TempDir;

    #[test]
    fn test_already_valid_outputs_skip_building() {
        let dir = TempDir::new().unwrap();
        let mut store = Store::open_at(dir.path().to_path_buf()).unwrap();

        let content = b"hello world";
        let out_path = store.add_to_store(content, "hello-1.0").unwrap();
        let nar_hash = kiln_store::hash_path(&store.to_path(&out_path)).unwrap();
        store
            .register_valid_paths(vec![PathInfo::new(out_path.clone(), nar_hash, content.len() as u64)])
            .unwrap();

        let mut drv = Derivation::builder("hello", "1.0").build();
        drv.outputs.get_mut("out").unwrap().path = Some(out_path);
        let drv_path = store.add_derivation(&drv).unwrap();

        let mut worker = Worker::new(Builder::new(store), Settings::default());
        worker.add_goal(drv_path);
        assert_eq!(worker.run(), 0);
    }
}
