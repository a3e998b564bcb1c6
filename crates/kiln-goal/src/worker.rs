//! The scheduler: owns every live goal, wakes them as their dependencies
//! resolve, and reports a final exit status once the work queue drains.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use kiln_builder::{BuildError, BuildResult, Builder};
use kiln_derive::{Derivation, StorePath};
use kiln_store::Store;

use crate::config::Settings;
use crate::derivation_goal::DerivationGoal;
use crate::goal::{ExitStatus, Goal, GoalId, WorkResult};
use crate::substitution_goal::SubstitutionGoal;

/// A goal held by concrete type rather than behind a trait object, so the
/// worker can match on it directly instead of threading `dyn Goal` through
/// every borrow of the store and builder.
pub enum GoalKind {
    Derivation(DerivationGoal),
    Substitution(SubstitutionGoal),
}

impl GoalKind {
    fn id(&self) -> GoalId {
        match self {
            GoalKind::Derivation(g) => g.id(),
            GoalKind::Substitution(g) => g.id(),
        }
    }

    fn work(&mut self, ctx: &mut WorkerCtx) -> WorkResult {
        match self {
            GoalKind::Derivation(g) => g.work(ctx),
            GoalKind::Substitution(g) => g.work(ctx),
        }
    }

    fn cancel(&mut self, ctx: &mut WorkerCtx) {
        match self {
            GoalKind::Derivation(g) => g.cancel(ctx),
            GoalKind::Substitution(g) => g.cancel(ctx),
        }
    }

    fn label(&self) -> String {
        match self {
            GoalKind::Derivation(g) => g.label(),
            GoalKind::Substitution(g) => g.label(),
        }
    }
}

/// Borrowed view into worker state that a [`Goal`] is handed during `work`.
///
/// Holds the builder rather than a bare `&mut Store` so `ctx.build` and
/// `ctx.store` never alias the same `Store` through two different paths.
pub struct WorkerCtx<'a> {
    builder: &'a mut Builder,
    pub settings: &'a Settings,
    next_id: &'a mut u64,
    derivation_goals: &'a mut HashMap<StorePath, GoalId>,
    substitution_goals: &'a mut HashMap<StorePath, GoalId>,
    finished: &'a HashMap<GoalId, ExitStatus>,
    pending_new: &'a mut Vec<(GoalId, GoalKind)>,
}

impl<'a> WorkerCtx<'a> {
    pub fn store(&mut self) -> &mut Store {
        self.builder.store_mut()
    }

    pub fn build(&mut self, drv: &Derivation) -> Result<BuildResult, BuildError> {
        self.builder.build(drv)
    }

    /// Look up or spawn the goal realising `drv_path`, deduplicating so two
    /// dependents on the same derivation share one build.
    pub fn get_or_create_derivation_goal(&mut self, drv_path: StorePath) -> GoalId {
        if let Some(id) = self.derivation_goals.get(&drv_path) {
            return *id;
        }
        let id = self.alloc_id();
        self.derivation_goals.insert(drv_path.clone(), id);
        self.pending_new.push((id, GoalKind::Derivation(DerivationGoal::new(id, drv_path))));
        id
    }

    pub fn get_or_create_substitution_goal(&mut self, path: StorePath) -> GoalId {
        if let Some(id) = self.substitution_goals.get(&path) {
            return *id;
        }
        let id = self.alloc_id();
        self.substitution_goals.insert(path.clone(), id);
        self.pending_new.push((id, GoalKind::Substitution(SubstitutionGoal::new(id, path))));
        id
    }

    pub fn goal_succeeded(&self, id: GoalId) -> bool {
        self.finished.get(&id).map(|s| s.is_success()).unwrap_or(false)
    }

    fn alloc_id(&mut self) -> GoalId {
        let id = GoalId(*self.next_id);
        *self.next_id += 1;
        id
    }
}

/// Drives goals to completion, fanning work out breadth-first as
/// dependencies are discovered rather than computing a build order upfront.
pub struct Worker {
    builder: Builder,
    settings: Settings,
    goals: HashMap<GoalId, GoalKind>,
    derivation_goals: HashMap<StorePath, GoalId>,
    substitution_goals: HashMap<StorePath, GoalId>,
    finished: HashMap<GoalId, ExitStatus>,
    top_goals: Vec<GoalId>,
    awake: VecDeque<GoalId>,
    waiting_for_a_while: Vec<GoalId>,
    /// goals blocked on a dependency, and how many of their deps remain.
    blocked_on: HashMap<GoalId, HashSet<GoalId>>,
    /// dependency -> the goals blocked on it, woken once it finishes.
    waiters: HashMap<GoalId, Vec<GoalId>>,
    next_id: u64,
}

impl Worker {
    pub fn new(builder: Builder, settings: Settings) -> Self {
        Self {
            builder,
            settings,
            goals: HashMap::new(),
            derivation_goals: HashMap::new(),
            substitution_goals: HashMap::new(),
            finished: HashMap::new(),
            top_goals: Vec::new(),
            awake: VecDeque::new(),
            waiting_for_a_while: Vec::new(),
            blocked_on: HashMap::new(),
            waiters: HashMap::new(),
            next_id: 0,
        }
    }

    pub fn store(&self) -> &Store {
        self.builder.store()
    }

    /// Request that `path` become valid, as a top-level goal. Derivation
    /// outputs (`.drv` paths) are built; anything else is substituted.
    pub fn add_goal(&mut self, path: StorePath) -> GoalId {
        let id = if path.name().ends_with(".drv") {
            self.spawn_derivation_goal(path)
        } else {
            self.spawn_substitution_goal(path)
        };
        self.top_goals.push(id);
        self.awake.push_back(id);
        id
    }

    fn spawn_derivation_goal(&mut self, drv_path: StorePath) -> GoalId {
        if let Some(id) = self.derivation_goals.get(&drv_path) {
            return *id;
        }
        let id = self.alloc_id();
        self.derivation_goals.insert(drv_path.clone(), id);
        self.goals.insert(id, GoalKind::Derivation(DerivationGoal::new(id, drv_path)));
        id
    }

    fn spawn_substitution_goal(&mut self, path: StorePath) -> GoalId {
        if let Some(id) = self.substitution_goals.get(&path) {
            return *id;
        }
        let id = self.alloc_id();
        self.substitution_goals.insert(path.clone(), id);
        self.goals.insert(id, GoalKind::Substitution(SubstitutionGoal::new(id, path)));
        id
    }

    fn alloc_id(&mut self) -> GoalId {
        let id = GoalId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Run every scheduled goal to completion and return a process exit
    /// code: 0 on full success, 1 if anything failed transiently, 100 if
    /// any top-level goal failed permanently.
    pub fn run(&mut self) -> i32 {
        while !self.awake.is_empty() || !self.waiting_for_a_while.is_empty() {
            if self.awake.is_empty() {
                std::thread::sleep(Duration::from_millis(self.settings.poll_interval_ms));
                self.awake.extend(self.waiting_for_a_while.drain(..));
                continue;
            }

            let id = self.awake.pop_front().unwrap();
            if self.finished.contains_key(&id) {
                continue;
            }

            let mut goal = match self.goals.remove(&id) {
                Some(g) => g,
                None => continue,
            };

            let mut pending_new = Vec::new();
            let result = {
                let mut ctx = WorkerCtx {
                    builder: &mut self.builder,
                    settings: &self.settings,
                    next_id: &mut self.next_id,
                    derivation_goals: &mut self.derivation_goals,
                    substitution_goals: &mut self.substitution_goals,
                    finished: &self.finished,
                    pending_new: &mut pending_new,
                };
                goal.work(&mut ctx)
            };

            for (new_id, new_goal) in pending_new {
                self.goals.insert(new_id, new_goal);
                self.awake.push_back(new_id);
            }

            match result {
                WorkResult::Waiting(deps) if deps.is_empty() => {
                    self.goals.insert(id, goal);
                    self.awake.push_back(id);
                }
                WorkResult::Waiting(deps) => {
                    let remaining: HashSet<GoalId> =
                        deps.into_iter().filter(|d| !self.finished.contains_key(d)).collect();
                    self.goals.insert(id, goal);
                    if remaining.is_empty() {
                        self.awake.push_back(id);
                    } else {
                        for dep in &remaining {
                            self.waiters.entry(*dep).or_default().push(id);
                        }
                        self.blocked_on.insert(id, remaining);
                    }
                }
                WorkResult::WaitingAWhile => {
                    self.goals.insert(id, goal);
                    self.waiting_for_a_while.push(id);
                }
                WorkResult::Done(status) => {
                    log::debug!("{} finished: {:?}", goal.label(), status);
                    self.finished.insert(id, status);
                    self.wake_waiters(id);
                }
            }
        }

        self.exit_code()
    }

    fn wake_waiters(&mut self, finished: GoalId) {
        let Some(waiters) = self.waiters.remove(&finished) else { return };
        for waiter in waiters {
            let done = if let Some(deps) = self.blocked_on.get_mut(&waiter) {
                deps.remove(&finished);
                deps.is_empty()
            } else {
                true
            };
            if done {
                self.blocked_on.remove(&waiter);
                self.awake.push_back(waiter);
            }
        }
    }

    fn exit_code(&self) -> i32 {
        let statuses: Vec<ExitStatus> = self.top_goals.iter().filter_map(|id| self.finished.get(id)).copied().collect();
        if statuses.iter().any(|s| matches!(s, ExitStatus::PermanentFailure)) {
            100
        } else if statuses.iter().any(|s| s.is_failure()) {
            1
        } else {
            0
        }
    }

    /// Cancel every goal still outstanding, e.g. on a ctrl-c.
    pub fn cancel_all(&mut self) {
        let ids: Vec<GoalId> = self.goals.keys().copied().collect();
        let mut pending_new = Vec::new();
        for id in ids {
            if let Some(mut goal) = self.goals.remove(&id) {
                let mut ctx = WorkerCtx {
                    builder: &mut self.builder,
                    settings: &self.settings,
                    next_id: &mut self.next_id,
                    derivation_goals: &mut self.derivation_goals,
                    substitution_goals: &mut self.substitution_goals,
                    finished: &self.finished,
                    pending_new: &mut pending_new,
                };
                goal.cancel(&mut ctx);
            }
        }
        self.awake.clear();
        self.waiting_for_a_while.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_store::Store;
    use tempfile::TempDir;

    fn test_worker() -> (Worker, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Store::open_at(dir.path().to_path_buf()).unwrap();
        let builder = Builder::new(store);
        let settings = Settings { poll_interval_ms: 1, ..Settings::default() };
        (Worker::new(builder, settings), dir)
    }

    #[test]
    fn test_empty_run_succeeds() {
        let (mut worker, _dir) = test_worker();
        assert_eq!(worker.run(), 0);
    }

    #[test]
    fn test_missing_derivation_is_permanent_failure() {
        let (mut worker, _dir) = test_worker();
        let hash = kiln_derive::Hash::of_str("does-not-exist");
        let path = StorePath::new(hash, "missing.drv".to_string());
        worker.add_goal(path);
        assert_eq!(worker.run(), 100);
    }
}
