//! Parser for the kiln expression language.
//!
//! This crate provides a recursive descent parser that converts tokens into
//! the `kiln-syntax` AST.
//!
//! ## Error Recovery
//!
//! The parser implements error recovery to continue parsing after
//! encountering errors, allowing multiple errors to be reported in a single
//! parse pass.

mod parser;
mod recovery;

pub use parser::Parser;
pub use recovery::{DelimiterKind, DelimiterStack, RecoveryMode};

use kiln_diagnostic::Diagnostic;
use kiln_lexer::Lexer;
use kiln_syntax::Expr;

/// Parse a source string into an expression.
pub fn parse(source: &str) -> (Expr, Vec<Diagnostic>) {
    let lexer = Lexer::new(source);
    let (tokens, mut diagnostics) = lexer.tokenize();

    let mut parser = Parser::new(tokens);
    let expr = parser.parse_expr_toplevel();

    diagnostics.extend(parser.diagnostics());
    (expr, diagnostics)
}
