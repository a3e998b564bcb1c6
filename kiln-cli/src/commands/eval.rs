//! The `kiln eval` command: evaluate an expression to normal form.
//!
//! Exposed because the evaluator is core to derivation construction, not
//! because a full language CLI (repl/fmt/check) is in scope here.

use crate::output;
use kiln_diagnostic::emit;
use kiln_eval::{Evaluator, root_env};

pub fn run(expr_or_file: &str, verbose: bool) -> Result<(), String> {
    let (source, label) = load_source(expr_or_file);

    let (expr, diagnostics) = kiln_parser::parse(&source);
    for diag in &diagnostics {
        emit(&source, &label, diag);
    }
    if !diagnostics.is_empty() {
        return Err("parse error".to_string());
    }

    if verbose {
        output::info(&format!("parsed: {expr:?}"));
    }

    let env = root_env();
    let mut evaluator = Evaluator::new();

    match evaluator.eval_source(&expr, &env) {
        Ok(value) => {
            output::success(&format!("{value:?}"));
            Ok(())
        }
        Err(e) => {
            output::error(&format!("{e}"));
            Err("evaluation error".to_string())
        }
    }
}

/// A `.kiln`-suffixed argument that exists on disk is read as a file;
/// anything else is treated as the expression text directly.
fn load_source(expr_or_file: &str) -> (String, String) {
    if expr_or_file.ends_with(".kiln") && std::path::Path::new(expr_or_file).exists() {
        let source = std::fs::read_to_string(expr_or_file).unwrap_or_default();
        (source, expr_or_file.to_string())
    } else {
        (expr_or_file.to_string(), "<expr>".to_string())
    }
}
