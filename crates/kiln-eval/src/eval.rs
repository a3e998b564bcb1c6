//! The expression evaluator.

use std::rc::Rc;

use kiln_common::Interner;
use kiln_diagnostic::ErrorCode;
use kiln_syntax::{BinOp, Expr, ExprKind, LambdaParam, StringPart, UnaryOp};
use thiserror::Error;

use crate::env::Env;
use crate::thunk::Thunk;
use crate::value::{AttrSet, Closure, KString, Value};

#[derive(Debug, Error, Clone)]
pub enum EvalError {
    #[error("undefined variable `{0}`")]
    UnboundVariable(String),
    #[error("type error: expected {expected}, got {got}")]
    TypeError { expected: &'static str, got: &'static str },
    #[error("division by zero")]
    DivisionByZero,
    #[error("assertion failed")]
    AssertionFailed,
    #[error("attribute `{0}` missing")]
    MissingAttr(String),
    #[error("infinite recursion encountered")]
    InfiniteRecursion,
    #[error("value of type {0} is not callable")]
    NotAFunction(&'static str),
    #[error("function called with {got} arguments, expected {expected}")]
    WrongArity { expected: usize, got: usize },
    #[error("attribute `{0}` already defined")]
    DuplicateAttr(String),
    #[error("cannot coerce a string with a context to a path")]
    PathContextMismatch,
    #[error("{0}")]
    Thrown(String),
}

impl EvalError {
    pub fn code(&self) -> ErrorCode {
        match self {
            EvalError::UnboundVariable(_) => ErrorCode::UnboundVariable,
            EvalError::TypeError { .. } => ErrorCode::TypeError,
            EvalError::DivisionByZero => ErrorCode::DivisionByZero,
            EvalError::AssertionFailed => ErrorCode::AssertionFailed,
            EvalError::MissingAttr(_) => ErrorCode::MissingAttr,
            EvalError::InfiniteRecursion => ErrorCode::InfiniteRecursion,
            EvalError::NotAFunction(_) => ErrorCode::NotAFunction,
            EvalError::WrongArity { .. } => ErrorCode::WrongArity,
            EvalError::DuplicateAttr(_) => ErrorCode::DuplicateAttr,
            EvalError::PathContextMismatch => ErrorCode::PathContextMismatch,
            EvalError::Thrown(_) => ErrorCode::Thrown,
        }
    }
}

pub struct Evaluator {
    pub interner: Interner,
    /// "while evaluating ..." frames, pushed as the force stack unwinds
    /// through an error so diagnostics can show the full chain.
    pub trace: Vec<String>,
}

impl Default for Evaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl Evaluator {
    pub fn new() -> Self {
        Self {
            interner: Interner::new(),
            trace: Vec::new(),
        }
    }

    pub fn eval_source(&mut self, expr: &Expr, env: &Env) -> Result<Value, EvalError> {
        self.eval(&Rc::new(expr.clone()), env)
    }

    pub fn eval(&mut self, expr: &Rc<Expr>, env: &Env) -> Result<Value, EvalError> {
        match &expr.kind {
            ExprKind::Int(n) => Ok(Value::Int(*n)),
            ExprKind::Float(f) => Ok(Value::Float(*f)),
            ExprKind::Bool(b) => Ok(Value::Bool(*b)),
            ExprKind::Null => Ok(Value::Null),
            ExprKind::Path(p) => Ok(Value::Path(std::path::PathBuf::from(p))),

            ExprKind::Str(parts) => self.eval_string(parts, env),

            ExprKind::Var(name) => self.lookup(name, env),

            ExprKind::Attrs {
                recursive,
                bindings,
                inherits,
            } => self.eval_attrs(*recursive, bindings, inherits, env),

            ExprKind::List(items) => {
                let thunks = items
                    .iter()
                    .map(|e| Thunk::new(Rc::new(e.clone()), env.clone()))
                    .collect();
                Ok(Value::List(Rc::new(thunks)))
            }

            ExprKind::Lambda { param, body } => Ok(Value::Lambda(Rc::new(Closure {
                param: param.clone(),
                body: Rc::new((**body).clone()),
                env: env.clone(),
            }))),

            ExprKind::Call { func, arg } => {
                let func_val = self.eval(&Rc::new((**func).clone()), env)?;
                let arg_thunk = Thunk::new(Rc::new((**arg).clone()), env.clone());
                self.apply(func_val, arg_thunk)
            }

            ExprKind::Let {
                bindings,
                inherits,
                body,
            } => {
                let frame = self.build_recursive_frame(bindings, inherits, env)?;
                self.eval(&Rc::new((**body).clone()), &frame)
            }

            ExprKind::With { attrs, body } => {
                let attrs_thunk = Thunk::new(Rc::new((**attrs).clone()), env.clone());
                let frame = env.child_with(attrs_thunk);
                self.eval(&Rc::new((**body).clone()), &frame)
            }

            ExprKind::If {
                cond,
                then_branch,
                else_branch,
            } => {
                if self.eval_bool(cond, env)? {
                    self.eval(&Rc::new((**then_branch).clone()), env)
                } else {
                    self.eval(&Rc::new((**else_branch).clone()), env)
                }
            }

            ExprKind::Assert { cond, body } => {
                if !self.eval_bool(cond, env)? {
                    return Err(EvalError::AssertionFailed);
                }
                self.eval(&Rc::new((**body).clone()), env)
            }

            ExprKind::Select { base, path, or_default } => {
                self.eval_select(base, path, or_default.as_deref(), env)
            }

            ExprKind::HasAttr { base, path } => {
                let found = self.try_select(base, path, env)?.is_some();
                Ok(Value::Bool(found))
            }

            ExprKind::Binary { op, lhs, rhs } => self.eval_binary(*op, lhs, rhs, env),
            ExprKind::Unary { op, operand } => self.eval_unary(*op, operand, env),

            ExprKind::Concat(lhs, rhs) => {
                let l = self.force_list(lhs, env)?;
                let r = self.force_list(rhs, env)?;
                let mut items = (*l).clone();
                items.extend((*r).iter().cloned());
                Ok(Value::List(Rc::new(items)))
            }

            ExprKind::Update(lhs, rhs) => {
                let l = self.force_attrs(lhs, env)?;
                let r = self.force_attrs(rhs, env)?;
                Ok(Value::Attrs(Rc::new(l.update(&r))))
            }
        }
    }

    // ---------- variables and scoping ----------

    fn lookup(&mut self, name: &str, env: &Env) -> Result<Value, EvalError> {
        if let Some(thunk) = env.lookup_lexical(name) {
            return thunk.force(self);
        }
        for with_attrs in env.with_frames() {
            let value = with_attrs.force(self)?;
            let Value::Attrs(attrs) = value else {
                return Err(EvalError::TypeError {
                    expected: "set",
                    got: value.type_name(),
                });
            };
            let sym = self.interner.intern(name);
            if let Some(thunk) = attrs.get(sym).cloned() {
                return thunk.force(self);
            }
        }
        Err(EvalError::UnboundVariable(name.to_string()))
    }

    // ---------- attribute sets ----------

    fn check_no_duplicates(
        bindings: &[kiln_syntax::AttrBinding],
        inherits: &[String],
    ) -> Result<(), EvalError> {
        let mut names = std::collections::HashSet::new();
        for b in bindings {
            if !names.insert(b.name.clone()) {
                return Err(EvalError::DuplicateAttr(b.name.clone()));
            }
        }
        for n in inherits {
            if !names.insert(n.clone()) {
                return Err(EvalError::DuplicateAttr(n.clone()));
            }
        }
        Ok(())
    }

    fn eval_attrs(
        &mut self,
        recursive: bool,
        bindings: &[kiln_syntax::AttrBinding],
        inherits: &[String],
        env: &Env,
    ) -> Result<Value, EvalError> {
        Self::check_no_duplicates(bindings, inherits)?;

        let binding_env = if recursive { env.child() } else { env.clone() };

        let mut entries = Vec::with_capacity(bindings.len() + inherits.len());
        for b in bindings {
            let sym = self.interner.intern(&b.name);
            let thunk = Thunk::new(Rc::new(b.value.clone()), binding_env.clone());
            if recursive {
                binding_env.bind(b.name.clone(), thunk.clone());
            }
            entries.push((sym, thunk));
        }
        for name in inherits {
            let sym = self.interner.intern(name);
            // Bare `inherit a;` always reads from the *enclosing* scope, even
            // inside `rec { ... }` — it never sees its own sibling bindings.
            let var_expr = Rc::new(Expr::new(ExprKind::Var(name.clone()), kiln_common::Span::DUMMY));
            let thunk = Thunk::new(var_expr, env.clone());
            entries.push((sym, thunk));
        }

        Ok(Value::Attrs(Rc::new(AttrSet::from_entries(entries))))
    }

    /// Shared by `let` (always recursive) and `rec { }`.
    fn build_recursive_frame(
        &mut self,
        bindings: &[kiln_syntax::AttrBinding],
        inherits: &[String],
        env: &Env,
    ) -> Result<Env, EvalError> {
        Self::check_no_duplicates(bindings, inherits)?;

        let frame = env.child();
        for b in bindings {
            let thunk = Thunk::new(Rc::new(b.value.clone()), frame.clone());
            frame.bind(b.name.clone(), thunk);
        }
        for name in inherits {
            let var_expr = Rc::new(Expr::new(ExprKind::Var(name.clone()), kiln_common::Span::DUMMY));
            let thunk = Thunk::new(var_expr, env.clone());
            frame.bind(name.clone(), thunk);
        }
        Ok(frame)
    }

    // ---------- select ----------

    fn eval_select(
        &mut self,
        base: &Expr,
        path: &[String],
        or_default: Option<&Expr>,
        env: &Env,
    ) -> Result<Value, EvalError> {
        match self.try_select(base, path, env)? {
            Some(thunk) => thunk.force(self),
            None => match or_default {
                Some(d) => self.eval(&Rc::new(d.clone()), env),
                None => Err(EvalError::MissingAttr(path.join("."))),
            },
        }
    }

    /// Walks an attribute path, returning `None` as soon as a segment is
    /// missing rather than erroring, so `?` and `or` can use the same walk.
    fn try_select(&mut self, base: &Expr, path: &[String], env: &Env) -> Result<Option<Thunk>, EvalError> {
        let mut current = self.eval(&Rc::new(base.clone()), env)?;
        let mut last_thunk = None;
        for (i, segment) in path.iter().enumerate() {
            let Value::Attrs(attrs) = &current else {
                return Err(EvalError::TypeError {
                    expected: "set",
                    got: current.type_name(),
                });
            };
            let sym = self.interner.intern(segment);
            match attrs.get(sym) {
                Some(thunk) => {
                    last_thunk = Some(thunk.clone());
                    if i + 1 < path.len() {
                        current = thunk.force(self)?;
                    }
                }
                None => return Ok(None),
            }
        }
        Ok(last_thunk)
    }

    // ---------- operators ----------

    fn eval_binary(&mut self, op: BinOp, lhs: &Expr, rhs: &Expr, env: &Env) -> Result<Value, EvalError> {
        match op {
            BinOp::And => return Ok(Value::Bool(self.eval_bool(lhs, env)? && self.eval_bool(rhs, env)?)),
            BinOp::Or => return Ok(Value::Bool(self.eval_bool(lhs, env)? || self.eval_bool(rhs, env)?)),
            _ => {}
        }

        let l = self.eval(&Rc::new(lhs.clone()), env)?;
        let r = self.eval(&Rc::new(rhs.clone()), env)?;

        match op {
            BinOp::Add => match (&l, &r) {
                (Value::Str(a), Value::Str(b)) => Ok(Value::Str(a.concat(b))),
                _ => numeric_op(&l, &r, |a, b| a + b, |a, b| a + b),
            },
            BinOp::Sub => numeric_op(&l, &r, |a, b| a - b, |a, b| a - b),
            BinOp::Mul => numeric_op(&l, &r, |a, b| a * b, |a, b| a * b),
            BinOp::Div => match (&l, &r) {
                (Value::Int(_), Value::Int(0)) => Err(EvalError::DivisionByZero),
                _ => numeric_op(&l, &r, |a, b| a / b, |a, b| a / b),
            },
            BinOp::Eq => Ok(Value::Bool(self.values_equal(&l, &r)?)),
            BinOp::Ne => Ok(Value::Bool(!self.values_equal(&l, &r)?)),
            BinOp::Lt => compare(&l, &r, |o| o == std::cmp::Ordering::Less),
            BinOp::Le => compare(&l, &r, |o| o != std::cmp::Ordering::Greater),
            BinOp::Gt => compare(&l, &r, |o| o == std::cmp::Ordering::Greater),
            BinOp::Ge => compare(&l, &r, |o| o != std::cmp::Ordering::Less),
            BinOp::And | BinOp::Or => unreachable!("short-circuited above"),
        }
    }

    fn eval_unary(&mut self, op: UnaryOp, operand: &Expr, env: &Env) -> Result<Value, EvalError> {
        let v = self.eval(&Rc::new(operand.clone()), env)?;
        match (op, &v) {
            (UnaryOp::Neg, Value::Int(n)) => Ok(Value::Int(-n)),
            (UnaryOp::Neg, Value::Float(f)) => Ok(Value::Float(-f)),
            (UnaryOp::Neg, other) => Err(EvalError::TypeError {
                expected: "int or float",
                got: other.type_name(),
            }),
            (UnaryOp::Not, Value::Bool(b)) => Ok(Value::Bool(!b)),
            (UnaryOp::Not, other) => Err(EvalError::TypeError {
                expected: "bool",
                got: other.type_name(),
            }),
        }
    }

    pub fn values_equal(&mut self, a: &Value, b: &Value) -> Result<bool, EvalError> {
        Ok(match (a, b) {
            (Value::Int(x), Value::Int(y)) => x == y,
            (Value::Float(x), Value::Float(y)) => x == y,
            (Value::Int(x), Value::Float(y)) | (Value::Float(y), Value::Int(x)) => *x as f64 == *y,
            (Value::Bool(x), Value::Bool(y)) => x == y,
            (Value::Null, Value::Null) => true,
            (Value::Str(x), Value::Str(y)) => x.text == y.text,
            (Value::Path(x), Value::Path(y)) => x == y,
            (Value::List(x), Value::List(y)) => {
                if x.len() != y.len() {
                    return Ok(false);
                }
                for (tx, ty) in x.iter().zip(y.iter()) {
                    let (vx, vy) = (tx.force(self)?, ty.force(self)?);
                    if !self.values_equal(&vx, &vy)? {
                        return Ok(false);
                    }
                }
                true
            }
            (Value::Attrs(x), Value::Attrs(y)) => {
                if x.len() != y.len() {
                    return Ok(false);
                }
                for (sym, tx) in x.iter() {
                    let Some(ty) = y.get(*sym) else { return Ok(false) };
                    let (vx, vy) = (tx.force(self)?, ty.force(self)?);
                    if !self.values_equal(&vx, &vy)? {
                        return Ok(false);
                    }
                }
                true
            }
            _ => false,
        })
    }

    // ---------- coercions ----------

    pub fn eval_bool(&mut self, expr: &Expr, env: &Env) -> Result<bool, EvalError> {
        match self.eval(&Rc::new(expr.clone()), env)? {
            Value::Bool(b) => Ok(b),
            other => Err(EvalError::TypeError {
                expected: "bool",
                got: other.type_name(),
            }),
        }
    }

    fn force_list(&mut self, expr: &Expr, env: &Env) -> Result<Rc<Vec<Thunk>>, EvalError> {
        match self.eval(&Rc::new(expr.clone()), env)? {
            Value::List(items) => Ok(items),
            other => Err(EvalError::TypeError {
                expected: "list",
                got: other.type_name(),
            }),
        }
    }

    pub fn force_attrs(&mut self, expr: &Expr, env: &Env) -> Result<Rc<AttrSet>, EvalError> {
        match self.eval(&Rc::new(expr.clone()), env)? {
            Value::Attrs(attrs) => Ok(attrs),
            other => Err(EvalError::TypeError {
                expected: "set",
                got: other.type_name(),
            }),
        }
    }

    fn eval_string(&mut self, parts: &[StringPart], env: &Env) -> Result<Value, EvalError> {
        let mut result = KString::new("");
        for part in parts {
            let piece = match part {
                StringPart::Literal(s) => KString::new(s.clone()),
                StringPart::Expr(e) => {
                    let v = self.eval(&Rc::new(e.clone()), env)?;
                    self.coerce_to_string(&v)?
                }
            };
            result = result.concat(&piece);
        }
        Ok(Value::Str(result))
    }

    pub fn coerce_to_string(&self, v: &Value) -> Result<KString, EvalError> {
        match v {
            Value::Str(s) => Ok(s.clone()),
            Value::Path(p) => Ok(KString::new(p.display().to_string())),
            Value::Int(n) => Ok(KString::new(n.to_string())),
            Value::Float(f) => Ok(KString::new(f.to_string())),
            Value::Bool(b) => Ok(KString::new(if *b { "1" } else { "" })),
            Value::Null => Ok(KString::new("")),
            other => Err(EvalError::TypeError {
                expected: "string-coercible value",
                got: other.type_name(),
            }),
        }
    }

    // ---------- application ----------

    pub fn apply(&mut self, func: Value, arg: Thunk) -> Result<Value, EvalError> {
        match func {
            Value::Lambda(closure) => self.apply_lambda(&closure, arg),
            Value::Builtin(b) => {
                if b.arity == 1 {
                    (b.func)(self, &[arg])
                } else {
                    Ok(Value::PartialBuiltin(b, Rc::new(vec![arg])))
                }
            }
            Value::PartialBuiltin(b, applied) => {
                let mut next = (*applied).clone();
                next.push(arg);
                if next.len() == b.arity {
                    (b.func)(self, &next)
                } else {
                    Ok(Value::PartialBuiltin(b, Rc::new(next)))
                }
            }
            other => Err(EvalError::NotAFunction(other.type_name())),
        }
    }

    fn apply_lambda(&mut self, closure: &Closure, arg: Thunk) -> Result<Value, EvalError> {
        match &closure.param {
            LambdaParam::Simple(name) => {
                let frame = closure.env.child();
                frame.bind(name.clone(), arg);
                self.eval(&closure.body, &frame)
            }
            LambdaParam::Formals(formals) => {
                let arg_value = arg.force(self)?;
                let Value::Attrs(attrs) = &arg_value else {
                    return Err(EvalError::TypeError {
                        expected: "set",
                        got: arg_value.type_name(),
                    });
                };

                if !formals.ellipsis {
                    let known: std::collections::HashSet<&str> =
                        formals.fields.iter().map(|f| f.name.as_str()).collect();
                    for (sym, _) in attrs.iter() {
                        let name = self.interner.get(*sym);
                        if !known.contains(name) {
                            return Err(EvalError::MissingAttr(format!(
                                "unexpected argument `{name}`"
                            )));
                        }
                    }
                }

                let frame = closure.env.child();
                for field in &formals.fields {
                    let sym = self.interner.intern(&field.name);
                    let thunk = match attrs.get(sym) {
                        Some(t) => t.clone(),
                        None => match &field.default {
                            Some(default_expr) => Thunk::new(Rc::new(default_expr.clone()), frame.clone()),
                            None => return Err(EvalError::MissingAttr(field.name.clone())),
                        },
                    };
                    frame.bind(field.name.clone(), thunk);
                }
                if let Some(bind_name) = &formals.bind_name {
                    frame.bind(bind_name.clone(), Thunk::evaluated(arg_value.clone()));
                }
                self.eval(&closure.body, &frame)
            }
        }
    }
}

fn numeric_op(
    l: &Value,
    r: &Value,
    int_op: fn(i64, i64) -> i64,
    float_op: fn(f64, f64) -> f64,
) -> Result<Value, EvalError> {
    match (l, r) {
        (Value::Int(a), Value::Int(b)) => Ok(Value::Int(int_op(*a, *b))),
        (Value::Float(a), Value::Float(b)) => Ok(Value::Float(float_op(*a, *b))),
        (Value::Int(a), Value::Float(b)) => Ok(Value::Float(float_op(*a as f64, *b))),
        (Value::Float(a), Value::Int(b)) => Ok(Value::Float(float_op(*a, *b as f64))),
        _ => Err(EvalError::TypeError {
            expected: "two numbers",
            got: if matches!(l, Value::Int(_) | Value::Float(_)) {
                r.type_name()
            } else {
                l.type_name()
            },
        }),
    }
}

fn compare(l: &Value, r: &Value, test: fn(std::cmp::Ordering) -> bool) -> Result<Value, EvalError> {
    let ordering = match (l, r) {
        (Value::Int(a), Value::Int(b)) => a.cmp(b),
        (Value::Float(a), Value::Float(b)) => a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal),
        (Value::Int(a), Value::Float(b)) => (*a as f64).partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal),
        (Value::Float(a), Value::Int(b)) => a.partial_cmp(&(*b as f64)).unwrap_or(std::cmp::Ordering::Equal),
        (Value::Str(a), Value::Str(b)) => a.text.cmp(&b.text),
        _ => {
            return Err(EvalError::TypeError {
                expected: "two comparable numbers or strings",
                got: r.type_name(),
            });
        }
    };
    Ok(Value::Bool(test(ordering)))
}
