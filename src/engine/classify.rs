use crate::script::diagnostic::{Diagnostic, Severity};

/// Compiler output split by severity. Each list keeps emission order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Classified {
    pub errors: Vec<Diagnostic>,
    pub warnings: Vec<Diagnostic>,
    pub info: Vec<Diagnostic>,
}

impl Classified {
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// The blocking diagnostics in `raw`, in the order the compiler emitted them.
pub fn classify(raw: &[Diagnostic]) -> Vec<Diagnostic> {
    raw.iter().filter(|d| d.is_error()).cloned().collect()
}

pub fn partition(raw: &[Diagnostic]) -> Classified {
    let mut out = Classified::default();
    for d in raw {
        match d.severity {
            Severity::Error => out.errors.push(d.clone()),
            Severity::Warning => out.warnings.push(d.clone()),
            Severity::Info => out.info.push(d.clone()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::ast::Span;

    fn raw() -> Vec<Diagnostic> {
        vec![
            Diagnostic::warning("Unreachable code detected", Span::new(0, 1)),
            Diagnostic::type_error("b", Span::new(9, 10)),
            Diagnostic::info("'x' hides the declaration from Submission#0", Span::new(2, 3)),
            Diagnostic::parser("a", Span::new(1, 2)),
        ]
    }

    #[test]
    fn keeps_emission_order() {
        let errors = classify(&raw());
        let messages: Vec<&str> = errors.iter().map(|d| d.message.as_str()).collect();
        assert_eq!(messages, ["b", "a"]);
    }

    #[test]
    fn partitions_by_severity() {
        let parts = partition(&raw());
        assert!(parts.has_errors());
        assert_eq!(parts.errors.len(), 2);
        assert_eq!(parts.warnings.len(), 1);
        assert_eq!(parts.info.len(), 1);
        assert!(classify(&parts.warnings).is_empty());
    }
}
