//! Runtime values produced by forcing a thunk to weak head normal form.

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::rc::Rc;

use kiln_common::Symbol;
use kiln_syntax::{Expr, LambdaParam};

use crate::env::Env;
use crate::thunk::Thunk;

/// A value in weak head normal form. Compound values hold `Thunk`s for their
/// children rather than fully-evaluated `Value`s, preserving call-by-need.
#[derive(Clone)]
pub enum Value {
    Int(i64),
    Float(f64),
    Bool(bool),
    Null,
    Str(KString),
    /// A resolved filesystem path; never carries a string context.
    Path(PathBuf),
    List(Rc<Vec<Thunk>>),
    Attrs(Rc<AttrSet>),
    Lambda(Rc<Closure>),
    Builtin(Rc<Builtin>),
    /// A builtin partially applied to some of its arguments.
    PartialBuiltin(Rc<Builtin>, Rc<Vec<Thunk>>),
}

/// A string together with the set of store paths it depends on. Contexts
/// propagate through concatenation so that using a derivation's output path
/// in a string is enough to make the build system realise it first.
#[derive(Debug, Clone, Default)]
pub struct KString {
    pub text: Rc<String>,
    pub context: Rc<BTreeSet<String>>,
}

impl KString {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: Rc::new(text.into()),
            context: Rc::new(BTreeSet::new()),
        }
    }

    pub fn with_context(text: impl Into<String>, context: BTreeSet<String>) -> Self {
        Self {
            text: Rc::new(text.into()),
            context: Rc::new(context),
        }
    }

    pub fn concat(&self, other: &KString) -> KString {
        let mut text = String::with_capacity(self.text.len() + other.text.len());
        text.push_str(&self.text);
        text.push_str(&other.text);
        let mut context = (*self.context).clone();
        context.extend(other.context.iter().cloned());
        KString {
            text: Rc::new(text),
            context: Rc::new(context),
        }
    }
}

/// An attribute set: entries sorted by `Symbol` so that building an attrset
/// from already-sorted parts (`//`, `rec { inherit ... }`) is a linear merge
/// rather than a re-sort, and lookups binary-search.
#[derive(Default)]
pub struct AttrSet {
    entries: Vec<(Symbol, Thunk)>,
}

impl AttrSet {
    /// Build from unsorted `(Symbol, Thunk)` pairs, later entries winning on
    /// a duplicate key (matches `{ a = 1; a = 2; }` evaluating to `a = 2`,
    /// though the parser rejects duplicate static keys before this runs).
    pub fn from_entries(mut entries: Vec<(Symbol, Thunk)>) -> Self {
        entries.sort_by_key(|(sym, _)| *sym);
        entries.dedup_by_key(|(sym, _)| *sym);
        Self { entries }
    }

    pub fn get(&self, sym: Symbol) -> Option<&Thunk> {
        self.entries
            .binary_search_by_key(&sym, |(s, _)| *s)
            .ok()
            .map(|i| &self.entries[i].1)
    }

    pub fn contains(&self, sym: Symbol) -> bool {
        self.entries.binary_search_by_key(&sym, |(s, _)| *s).is_ok()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(Symbol, Thunk)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `self // other` — a right-biased merge-sort, O(n + m) since both
    /// sides are already sorted by `Symbol`.
    pub fn update(&self, other: &AttrSet) -> AttrSet {
        let mut merged = Vec::with_capacity(self.entries.len() + other.entries.len());
        let (mut i, mut j) = (0, 0);
        while i < self.entries.len() && j < other.entries.len() {
            let (sa, _) = &self.entries[i];
            let (sb, _) = &other.entries[j];
            match sa.cmp(sb) {
                std::cmp::Ordering::Less => {
                    merged.push(self.entries[i].clone());
                    i += 1;
                }
                std::cmp::Ordering::Greater => {
                    merged.push(other.entries[j].clone());
                    j += 1;
                }
                std::cmp::Ordering::Equal => {
                    merged.push(other.entries[j].clone());
                    i += 1;
                    j += 1;
                }
            }
        }
        merged.extend_from_slice(&self.entries[i..]);
        merged.extend_from_slice(&other.entries[j..]);
        AttrSet { entries: merged }
    }
}

impl Clone for AttrSet {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
        }
    }
}

/// A lambda closure: the formal parameter(s), the body, and the environment
/// it was defined in.
pub struct Closure {
    pub param: LambdaParam,
    pub body: Rc<Expr>,
    pub env: Env,
}

/// A builtin function. Builtins receive unforced thunks so that
/// short-circuiting builtins (`if`-like helpers) don't force arguments they
/// don't need.
pub struct Builtin {
    pub name: &'static str,
    pub arity: usize,
    pub func: BuiltinFn,
}

pub type BuiltinFn = fn(&mut crate::eval::Evaluator, &[Thunk]) -> Result<Value, crate::eval::EvalError>;

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(n) => write!(f, "{n}"),
            Value::Float(n) => write!(f, "{n}"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Null => write!(f, "null"),
            Value::Str(s) => write!(f, "{:?}", s.text),
            Value::Path(p) => write!(f, "{}", p.display()),
            Value::List(items) => {
                write!(f, "[ ")?;
                for item in items.iter() {
                    write!(f, "{item:?} ")?;
                }
                write!(f, "]")
            }
            Value::Attrs(attrs) => write!(f, "<set of {} attrs>", attrs.len()),
            Value::Lambda(_) => write!(f, "<lambda>"),
            Value::Builtin(b) => write!(f, "<builtin:{}>", b.name),
            Value::PartialBuiltin(b, applied) => {
                write!(f, "<builtin:{} ({}/{} args)>", b.name, applied.len(), b.arity)
            }
        }
    }
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Bool(_) => "bool",
            Value::Null => "null",
            Value::Str(_) => "string",
            Value::Path(_) => "path",
            Value::List(_) => "list",
            Value::Attrs(_) => "set",
            Value::Lambda(_) | Value::Builtin(_) | Value::PartialBuiltin(_, _) => "lambda",
        }
    }

    pub fn is_truthy_type(&self) -> bool {
        matches!(self, Value::Bool(_))
    }
}
