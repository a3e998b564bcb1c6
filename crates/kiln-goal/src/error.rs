//! Error types for the goal engine.

use kiln_derive::StorePath;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GoalError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store error: {0}")]
    Store(#[from] kiln_store::StoreError),

    #[error("build error: {0}")]
    Build(#[from] kiln_builder::BuildError),

    #[error("evaluation error: {0}")]
    Eval(#[from] kiln_eval::EvalError),

    #[error("dependency cycle detected at {0}")]
    Cycle(StorePath),

    #[error("no derivation produced a path for {0}")]
    NoSubstituters(StorePath),

    #[error("lock contention exhausted retries on {0}")]
    LockTimeout(StorePath),

    #[error("failed to hash substituted path: {0}")]
    Hash(String),
}
