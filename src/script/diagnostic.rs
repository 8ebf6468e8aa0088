use serde::Serialize;

use super::ast::Span;

/// A compiler message with severity and source location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub kind: DiagnosticKind,
    pub message: String,
    pub span: Span,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// Which stage of the pipeline produced the diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticKind {
    Lexer,
    Parser,
    Type,
    Compiler,
}

impl Diagnostic {
    fn new(severity: Severity, kind: DiagnosticKind, message: impl Into<String>, span: Span) -> Self {
        Self {
            severity,
            kind,
            message: message.into(),
            span,
        }
    }

    pub fn lexer(message: impl Into<String>, span: Span) -> Self {
        Self::new(Severity::Error, DiagnosticKind::Lexer, message, span)
    }

    pub fn parser(message: impl Into<String>, span: Span) -> Self {
        Self::new(Severity::Error, DiagnosticKind::Parser, message, span)
    }

    pub fn type_error(message: impl Into<String>, span: Span) -> Self {
        Self::new(Severity::Error, DiagnosticKind::Type, message, span)
    }

    pub fn compiler(message: impl Into<String>, span: Span) -> Self {
        Self::new(Severity::Error, DiagnosticKind::Compiler, message, span)
    }

    pub fn warning(message: impl Into<String>, span: Span) -> Self {
        Self::new(Severity::Warning, DiagnosticKind::Type, message, span)
    }

    pub fn info(message: impl Into<String>, span: Span) -> Self {
        Self::new(Severity::Info, DiagnosticKind::Type, message, span)
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }

    /// 1-based (line, column) of the diagnostic's start in `source`.
    pub fn location(&self, source: &str) -> (usize, usize) {
        offset_to_line_col(source, self.span.start)
    }

    /// Format the diagnostic with source context: `(1,9): error: message`.
    pub fn format_with_source(&self, source: &str) -> String {
        let (line, col) = self.location(source);
        format!(
            "({line},{col}): {}: {}",
            match self.severity {
                Severity::Error => "error",
                Severity::Warning => "warning",
                Severity::Info => "info",
            },
            self.message,
        )
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for Diagnostic {}

pub(crate) fn offset_to_line_col(source: &str, offset: usize) -> (usize, usize) {
    let mut line = 1;
    let mut col = 1;
    for (i, ch) in source.char_indices() {
        if i >= offset {
            break;
        }
        if ch == '\n' {
            line += 1;
            col = 1;
        } else {
            col += 1;
        }
    }
    (line, col)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_col_counts_from_one() {
        assert_eq!(offset_to_line_col("abc", 0), (1, 1));
        assert_eq!(offset_to_line_col("ab\ncd", 4), (2, 2));
    }

    #[test]
    fn formats_severity_and_location() {
        let d = Diagnostic::parser("Expected expression", Span::new(8, 8));
        assert_eq!(d.format_with_source("int y = "), "(1,9): error: Expected expression");
        let w = Diagnostic::warning("Unreachable code detected", Span::new(0, 1));
        assert!(w.format_with_source("x").contains("warning"));
        assert!(!w.is_error());
    }
}
