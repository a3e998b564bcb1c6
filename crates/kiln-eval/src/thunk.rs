//! Call-by-need thunks.
//!
//! Forcing walks `Unevaluated -> Evaluating -> Evaluated`. A thunk observed
//! in `Evaluating` state is being forced by an enclosing frame on the same
//! force stack — that's infinite recursion (`let x = x; in x`), not a
//! concurrency hazard, since the evaluator is single-threaded.

use std::cell::RefCell;
use std::rc::Rc;

use kiln_syntax::Expr;

use crate::env::Env;
use crate::eval::{EvalError, Evaluator};
use crate::value::Value;

#[derive(Clone)]
pub struct Thunk(Rc<RefCell<ThunkState>>);

enum ThunkState {
    Unevaluated { expr: Rc<Expr>, env: Env },
    Evaluating,
    Evaluated(Value),
}

impl Thunk {
    pub fn new(expr: Rc<Expr>, env: Env) -> Self {
        Thunk(Rc::new(RefCell::new(ThunkState::Unevaluated { expr, env })))
    }

    pub fn evaluated(value: Value) -> Self {
        Thunk(Rc::new(RefCell::new(ThunkState::Evaluated(value))))
    }

    /// Force to weak head normal form, memoizing the result.
    pub fn force(&self, ev: &mut Evaluator) -> Result<Value, EvalError> {
        let (expr, env) = match &*self.0.borrow() {
            ThunkState::Evaluated(v) => return Ok(v.clone()),
            ThunkState::Evaluating => return Err(EvalError::InfiniteRecursion),
            ThunkState::Unevaluated { expr, env } => (expr.clone(), env.clone()),
        };

        *self.0.borrow_mut() = ThunkState::Evaluating;
        let result = ev.eval(&expr, &env);
        match &result {
            Ok(value) => *self.0.borrow_mut() = ThunkState::Evaluated(value.clone()),
            Err(_) => *self.0.borrow_mut() = ThunkState::Unevaluated { expr, env },
        }
        result
    }
}

impl std::fmt::Debug for Thunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &*self.0.borrow() {
            ThunkState::Evaluated(v) => write!(f, "{v:?}"),
            ThunkState::Evaluating => write!(f, "<blackhole>"),
            ThunkState::Unevaluated { .. } => write!(f, "<thunk>"),
        }
    }
}
