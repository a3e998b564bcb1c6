//! Lazy, call-by-need evaluator for the kiln expression language.
//!
//! Expressions evaluate to weak head normal form through `Thunk::force`;
//! compound values hold unforced thunks for their children, so a `let`
//! binding or attribute is only evaluated if something actually demands it.

mod builtin;
mod env;
mod eval;
mod thunk;
mod value;

pub use builtin::{builtins, root_env};
pub use env::Env;
pub use eval::{EvalError, Evaluator};
pub use thunk::Thunk;
pub use value::{AttrSet, Builtin, BuiltinFn, Closure, KString, Value};
