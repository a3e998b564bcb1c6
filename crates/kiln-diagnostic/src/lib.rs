//! Diagnostic and error reporting for kiln.
//!
//! This crate renders beautiful error messages using `ariadne`, including the
//! evaluator's "while evaluating ..." forcing-chain trace when `show-trace`
//! is enabled.

mod codes;
mod diagnostic;

pub use codes::ErrorCode;
pub use diagnostic::{Diagnostic, DiagnosticKind, Label, Severity};

use ariadne::{ColorGenerator, Label as AriadneLabel, Report, ReportKind, Source};

/// Render a diagnostic to stderr.
pub fn emit(source: &str, filename: &str, diagnostic: &Diagnostic) {
    emit_with_trace(source, filename, diagnostic, false)
}

/// Render a diagnostic to stderr, optionally appending the evaluation trace
/// (the `show-trace` configuration option).
pub fn emit_with_trace(source: &str, filename: &str, diagnostic: &Diagnostic, show_trace: bool) {
    let kind = match diagnostic.severity {
        Severity::Error => ReportKind::Error,
        Severity::Warning => ReportKind::Warning,
        Severity::Note => ReportKind::Advice,
    };

    let mut colors = ColorGenerator::new();
    let mut report = Report::build(kind, filename, diagnostic.span.start.0 as usize)
        .with_message(&diagnostic.message);

    if let Some(code) = &diagnostic.code {
        report = report.with_code(code.as_str());
    }

    for label in &diagnostic.labels {
        let color = colors.next();
        let ariadne_label = AriadneLabel::new((filename, label.span.range()))
            .with_message(&label.message)
            .with_color(color);
        report = report.with_label(ariadne_label);
    }

    for note in &diagnostic.notes {
        report = report.with_note(note);
    }

    if show_trace {
        for frame in &diagnostic.trace {
            report = report.with_note(format!("while evaluating {frame}"));
        }
    } else if !diagnostic.trace.is_empty() {
        report = report.with_note("(use --show-trace to see the full evaluation trace)");
    }

    if let Some(help) = &diagnostic.help {
        report = report.with_help(help);
    }

    report
        .finish()
        .eprint((filename, Source::from(source)))
        .unwrap();
}
