//! Common utilities and data structures shared across kiln.
//!
//! This crate provides foundational types used by the lexer, parser and
//! evaluator:
//! - `Span`: source code location tracking
//! - `Interner` / `Symbol`: string interning for attribute-set keys, ordered
//!   so attribute sets can sort and binary-search by symbol

mod interner;
mod span;

pub use interner::{Interner, Symbol};
pub use span::{BytePos, Span};
