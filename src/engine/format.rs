//! Display text for results, faults and diagnostics.

use std::fmt::Write as _;

use crate::script::builtins::short_name;
use crate::script::diagnostic::Diagnostic;
use crate::script::value::{format_double, quote_string, ExceptionValue, Value};
use crate::script::vm::Fault;

/// Render a submission's result. `None` for null, which reports as no value.
pub fn format_value(value: &Value) -> Option<String> {
    let text = match value {
        Value::Null => return None,
        Value::Int(v) => v.to_string(),
        Value::Double(v) => format_double(*v),
        Value::Bool(v) => v.to_string(),
        Value::Str(s) => quote_string(s),
        Value::Exception(e) => format_exception_object(e),
    };
    Some(text)
}

/// `Exception { Message = "boom" }`
fn format_exception_object(e: &ExceptionValue) -> String {
    format!(
        "{} {{ Message = {} }}",
        short_name(&e.type_name),
        quote_string(&e.message)
    )
}

/// Frames shown before the rest of a trace is summarized.
pub const MAX_TRACE_FRAMES: usize = 10;

/// Exception type and message, then the innermost active frames:
///
/// ```text
/// System.Exception: boom
///   at Submission#4.<Main> (line 1)
/// ```
pub fn format_fault(fault: &Fault) -> String {
    let mut out = format!("{}: {}", fault.exception.type_name, fault.exception.message);
    for frame in fault.trace.iter().take(MAX_TRACE_FRAMES) {
        let _ = write!(out, "\n  at {} (line {})", frame.routine, frame.line);
    }
    let hidden = fault.trace.len().saturating_sub(MAX_TRACE_FRAMES);
    if hidden > 0 {
        let _ = write!(out, "\n  ... {hidden} more frames");
    }
    out
}

/// `(1,9): error: Invalid expression term`
pub fn format_diagnostic(diagnostic: &Diagnostic, source: &str) -> String {
    diagnostic.format_with_source(source)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::script::ast::Span;
    use crate::script::vm::TraceFrame;

    #[test]
    fn values() {
        assert_eq!(format_value(&Value::Int(2)).unwrap(), "2");
        assert_eq!(format_value(&Value::Double(2.5)).unwrap(), "2.5");
        assert_eq!(format_value(&Value::Double(f64::NAN)).unwrap(), "NaN");
        assert_eq!(format_value(&Value::Bool(true)).unwrap(), "true");
        assert_eq!(format_value(&Value::str("a\"b\n")).unwrap(), r#""a\"b\n""#);
        assert_eq!(format_value(&Value::Null), None);
    }

    #[test]
    fn exception_values_show_their_message() {
        let e = Value::Exception(Arc::new(ExceptionValue::new("System.FormatException", "bad")));
        assert_eq!(format_value(&e).unwrap(), r#"FormatException { Message = "bad" }"#);
    }

    #[test]
    fn faults_carry_a_trace() {
        let fault = Fault {
            exception: ExceptionValue::new("System.Exception", "boom"),
            trace: vec![
                TraceFrame { routine: "Submission#1.fail".into(), line: 2 },
                TraceFrame { routine: "Submission#3.<Main>".into(), line: 1 },
            ],
        };
        assert_eq!(
            format_fault(&fault),
            "System.Exception: boom\n  at Submission#1.fail (line 2)\n  at Submission#3.<Main> (line 1)"
        );
    }

    #[test]
    fn deep_traces_keep_the_innermost_frames() {
        let trace = (0..5000)
            .map(|depth| TraceFrame { routine: "Submission#0.down".into(), line: depth })
            .collect();
        let fault = Fault {
            exception: ExceptionValue::new("System.Exception", "bottom"),
            trace,
        };
        let text = format_fault(&fault);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 1 + MAX_TRACE_FRAMES + 1);
        assert_eq!(lines[1], "  at Submission#0.down (line 0)");
        assert_eq!(lines[MAX_TRACE_FRAMES], "  at Submission#0.down (line 9)");
        assert_eq!(lines[MAX_TRACE_FRAMES + 1], "  ... 4990 more frames");
    }

    #[test]
    fn diagnostics_use_line_and_column() {
        let d = Diagnostic::parser("Invalid expression term", Span::new(8, 9));
        assert_eq!(format_diagnostic(&d, "int y = "), "(1,9): error: Invalid expression term");
    }
}
