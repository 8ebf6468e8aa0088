use crate::script::builtins::{
    short_name, MemberKind, ParamTy, ReferenceSet, Ret, BUILTINS, CONSTANTS, EXCEPTION_TYPES,
    LIBRARY_TYPES,
};
use crate::settings::DEFAULT_USINGS;

/// Supplies the symbol universe for a session. Called once, before the first
/// compile; the result is shared read-only by every unit in the chain.
pub trait ReferenceSupplier {
    fn supply(&self) -> ReferenceSet;
}

/// The built-in library: `System.Console`, `System.Math`, `System.Convert`,
/// string and exception members, and the standard exception types.
#[derive(Debug, Clone)]
pub struct StandardReferences {
    usings: Vec<String>,
}

impl StandardReferences {
    pub fn new<I, S>(usings: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            usings: usings.into_iter().map(Into::into).collect(),
        }
    }
}

impl Default for StandardReferences {
    fn default() -> Self {
        Self::new(DEFAULT_USINGS.iter().copied())
    }
}

impl ReferenceSupplier for StandardReferences {
    fn supply(&self) -> ReferenceSet {
        let refs = LIBRARY_TYPES
            .iter()
            .fold(ReferenceSet::new(), |refs, ty| refs.with_type(*ty));
        let refs = EXCEPTION_TYPES
            .iter()
            .fold(refs, |refs, ty| refs.with_exception_type(*ty));
        log::debug!(
            "supplying {} library types, {} exception types, {} usings",
            LIBRARY_TYPES.len(),
            EXCEPTION_TYPES.len(),
            self.usings.len()
        );
        refs.with_usings(self.usings.iter().cloned())
    }
}

fn param_label(ty: ParamTy) -> String {
    match ty {
        ParamTy::Of(t) => t.keyword().to_string(),
        ParamTy::Any => "object".into(),
        ParamTy::Numeric => "number".into(),
    }
}

fn ret_label(ret: Ret) -> String {
    match ret {
        Ret::Of(t) => t.keyword().to_string(),
        Ret::SameNumeric => "number".into(),
    }
}

/// Human-readable summary of a reference set: imports, library members,
/// constants and exception types.
pub fn describe_references(refs: &ReferenceSet) -> String {
    let mut lines = Vec::new();

    lines.push(format!("Usings ({})", refs.usings().len()));
    for using in refs.usings() {
        lines.push(format!("  - {using}"));
    }

    let types: Vec<&str> = refs.types().collect();
    lines.push(format!("\nTypes ({})", types.len()));
    for ty in types {
        lines.push(format!("  {ty}"));
        for member in BUILTINS.iter().filter(|b| b.owner == ty) {
            let params: Vec<String> = member
                .params
                .iter()
                .map(|(name, ty)| format!("{} {name}", param_label(*ty)))
                .collect();
            lines.push(format!(
                "    - {} {}({}): {}",
                ret_label(member.ret),
                member.name,
                params.join(", "),
                member.description
            ));
        }
        for constant in CONSTANTS.iter().filter(|c| c.owner == ty) {
            lines.push(format!("    - const double {}: {}", constant.name, constant.description));
        }
    }

    lines.push("\nMembers".to_string());
    for member in BUILTINS.iter().filter(|b| b.kind != MemberKind::Static) {
        let suffix = if member.kind == MemberKind::Property { "" } else { "()" };
        lines.push(format!(
            "  - {}.{}{suffix}: {}",
            short_name(member.owner),
            member.name,
            member.description
        ));
    }

    let exceptions: Vec<&str> = refs.exception_types().collect();
    lines.push(format!("\nExceptions ({})", exceptions.len()));
    for ex in exceptions {
        lines.push(format!("  - {ex}"));
    }

    lines.join("\n")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn standard_set_resolves_library_and_exceptions() {
        let refs = StandardReferences::default().supply();
        assert_eq!(refs.resolve_type("Math"), Some("System.Math"));
        assert_eq!(refs.resolve_type("System.Convert"), Some("System.Convert"));
        assert_eq!(refs.resolve_exception("Exception"), Some("System.Exception"));
        assert!(refs.usings().iter().any(|u| u == "System.Console"));
    }

    #[test]
    fn custom_usings_limit_unqualified_access() {
        let refs = StandardReferences::new(["System.Text"]).supply();
        assert_eq!(refs.resolve_type("Math"), None);
        assert_eq!(refs.resolve_type("System.Math"), Some("System.Math"));
    }

    #[test]
    fn description_lists_members() {
        let text = describe_references(&StandardReferences::default().supply());
        assert!(text.contains("System.Math"));
        assert!(text.contains("Sqrt("));
        assert!(text.contains("const double PI"));
        assert!(text.contains("System.DivideByZeroException"));
    }
}
