//! Shared goal vocabulary: identity, exit status, and the scheduling trait
//! both [`crate::derivation_goal::DerivationGoal`] and
//! [`crate::substitution_goal::SubstitutionGoal`] implement.

use std::fmt;

/// Identifies one goal for the lifetime of a worker run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GoalId(pub u64);

impl fmt::Display for GoalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "goal#{}", self.0)
    }
}

/// Terminal status of a finished goal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Success,
    /// A transient failure: the caller may retry (substituter unreachable,
    /// lock contention exhausted its retries).
    Failed,
    /// A non-transient failure (builder exited non-zero, hash mismatch).
    /// Propagates as worker exit code 100.
    PermanentFailure,
    /// No configured substituter could answer for this path — distinct
    /// from `Failed` so a caller can fall back to building instead of
    /// giving up outright.
    NoSubstituters,
}

impl ExitStatus {
    pub fn is_success(self) -> bool {
        matches!(self, ExitStatus::Success)
    }

    pub fn is_failure(self) -> bool {
        !self.is_success()
    }
}

/// What a goal's `work` call accomplished this round.
pub enum WorkResult {
    /// Still running; re-poll once every id in `waiting_for` has finished.
    Waiting(Vec<GoalId>),
    /// Nothing to do until the polling interval elapses (lock contention).
    WaitingAWhile,
    /// Terminal: the goal is finished.
    Done(ExitStatus),
}

/// One cooperatively-scheduled unit of work.
///
/// A goal's state function runs to completion and returns; it never blocks.
/// Blocking on a child process or another goal is expressed by returning
/// [`WorkResult::Waiting`] and waiting for [`Worker`](crate::worker::Worker)
/// to invoke `work` again once the dependency resolves.
pub trait Goal {
    fn id(&self) -> GoalId;

    /// Advance the goal by one state transition.
    fn work(&mut self, ctx: &mut crate::worker::WorkerCtx) -> WorkResult;

    /// Kill any child process and release resources; the goal is now failed.
    fn cancel(&mut self, ctx: &mut crate::worker::WorkerCtx);

    /// A short label for logging (`drv:name` / `sub:name`).
    fn label(&self) -> String;
}
