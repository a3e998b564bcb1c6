//! Expression AST nodes.
//!
//! Node kinds mirror the engine's expression grammar: literals, variables,
//! attribute sets (recursive or plain), lists, lambdas, function application,
//! `let`, `with`, `if`, `assert`, `select` (with optional `or` default),
//! has-attr, arithmetic/logical operators, concatenation and right-biased
//! update (`//`).

use crate::LambdaParam;
use kiln_common::Span;

#[derive(Debug, Clone)]
pub struct Expr {
    pub kind: ExprKind,
    pub span: Span,
}

impl Expr {
    pub fn new(kind: ExprKind, span: Span) -> Self {
        Self { kind, span }
    }
}

#[derive(Debug, Clone)]
pub enum ExprKind {
    Int(i64),
    Float(f64),
    /// A (possibly interpolated) string literal: literal and expression
    /// parts concatenated at evaluation time.
    Str(Vec<StringPart>),
    /// A path literal (`./foo`, `/bar`), resolved relative to the file it was parsed from.
    Path(String),
    Bool(bool),
    Null,

    /// A variable reference. The parser only ever produces `Var(name)`; the
    /// evaluator's resolver pass rewrites statically resolvable references
    /// into a `(depth, displacement)` slot and leaves the rest dynamic.
    Var(String),

    /// `{ a = 1; b = 2; }` or `rec { a = 1; b = a + 1; }`.
    Attrs {
        recursive: bool,
        bindings: Vec<AttrBinding>,
        /// Names pulled in verbatim from an enclosing scope via `inherit a b;`.
        inherits: Vec<String>,
    },

    List(Vec<Expr>),

    Lambda {
        param: LambdaParam,
        body: Box<Expr>,
    },

    /// Function application `f x`. Multi-argument calls are curried chains of this node.
    Call { func: Box<Expr>, arg: Box<Expr> },

    Let {
        bindings: Vec<AttrBinding>,
        inherits: Vec<String>,
        body: Box<Expr>,
    },

    With {
        attrs: Box<Expr>,
        body: Box<Expr>,
    },

    If {
        cond: Box<Expr>,
        then_branch: Box<Expr>,
        else_branch: Box<Expr>,
    },

    Assert {
        cond: Box<Expr>,
        body: Box<Expr>,
    },

    /// `a.b.c` with an optional `or default`.
    Select {
        base: Box<Expr>,
        path: Vec<String>,
        or_default: Option<Box<Expr>>,
    },

    /// `a ? b.c` — tests whether an attribute path exists.
    HasAttr { base: Box<Expr>, path: Vec<String> },

    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },

    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },

    /// `a ++ b` — list concatenation.
    Concat(Box<Expr>, Box<Expr>),

    /// `a // b` — right-biased attribute-set update.
    Update(Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone)]
pub struct AttrBinding {
    pub name: String,
    pub value: Expr,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub enum StringPart {
    Literal(String),
    Expr(Expr),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}
