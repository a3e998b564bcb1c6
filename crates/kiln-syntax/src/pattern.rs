//! Lambda formal-argument patterns.
//!
//! The expression language has exactly one place patterns occur: a lambda's
//! argument, which is either a single bound name or an attribute-set pattern
//! with optional defaults and an ellipsis (`{a, b ? dflt, ...}@name: body`).

use crate::Expr;
use kiln_common::Span;

/// The formal parameter(s) of a lambda.
#[derive(Debug, Clone)]
pub enum LambdaParam {
    /// `x: body` — binds the whole argument to `x`.
    Simple(String),
    /// `{a, b ? dflt, ...}@name: body` — destructures an attribute set.
    Formals(Formals),
}

#[derive(Debug, Clone)]
pub struct Formals {
    pub fields: Vec<FormalField>,
    /// `true` when `...` is present: extra attributes are permitted and ignored.
    pub ellipsis: bool,
    /// The optional `@name` binding the whole argument attrset.
    pub bind_name: Option<String>,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct FormalField {
    pub name: String,
    /// `b ? dflt`: the default value used when the caller omits this attribute.
    pub default: Option<Expr>,
    pub span: Span,
}
