//! Goal engine for kiln: turns a request for a set of store paths into a
//! DAG of derivation/substitution goals and drives them to completion.
//!
//! By the time a path reaches this crate its derivation (if any) is already
//! in the store; `kiln-goal` decides what else needs to be valid first and
//! in what order, `kiln-builder` does the actual building, and `kiln-store`
//! is the ground truth for what is already valid.

pub mod config;
pub mod derivation_goal;
pub mod error;
pub mod goal;
pub mod hook;
pub mod substitution_goal;
pub mod worker;

pub use config::{ConfigError, Settings};
pub use derivation_goal::{DerivationGoal, DerivationState};
pub use error::GoalError;
pub use goal::{ExitStatus, Goal, GoalId, WorkResult};
pub use hook::{BuildHook, HookDecision, HookError};
pub use substitution_goal::{SubstitutionGoal, SubstitutionState};
pub use worker::{GoalKind, Worker, WorkerCtx};
