use indexmap::IndexSet;
use serde::Serialize;

use super::ast::TypeName;

/// Library routine selected by the type checker and executed by the VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    // Console
    WriteLineEmpty,
    WriteLine,
    Write,
    // Math
    Sqrt,
    Abs,
    Floor,
    Ceiling,
    Round,
    Sin,
    Cos,
    Exp,
    Log,
    Pow,
    Max,
    Min,
    // Convert
    ToInt32,
    ToDouble,
    ToStringOf,
    // String members
    Length,
    ToUpper,
    ToLower,
    Trim,
    Contains,
    StartsWith,
    EndsWith,
    IndexOf,
    Substring,
    Replace,
    // Any value
    ToStringMember,
    // Exception members
    Message,
}

/// Parameter typing for library routines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamTy {
    Of(TypeName),
    /// Any non-void value; rendered with `ToString` semantics where needed.
    Any,
    /// `int` or `double`; see [`Ret::SameNumeric`].
    Numeric,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ret {
    Of(TypeName),
    /// `int` when every argument is `int`, otherwise `double`.
    SameNumeric,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberKind {
    /// `Console.WriteLine(x)`: called through the type.
    Static,
    /// `s.ToUpper()`: receiver is passed as the first argument.
    Method,
    /// `s.Length`: receiver only, no parentheses.
    Property,
}

/// Library member: single source of truth for owner, name, signature, AND
/// the VM routine. Typeck, compiler and the reference listing all read from this.
#[derive(Debug, Clone)]
pub struct BuiltinFn {
    pub owner: &'static str,
    pub name: &'static str,
    pub kind: MemberKind,
    pub params: &'static [(&'static str, ParamTy)],
    pub ret: Ret,
    pub op: Builtin,
    pub description: &'static str,
}

pub const STRING_OWNER: &str = "string";
pub const OBJECT_OWNER: &str = "object";
pub const EXCEPTION_OWNER: &str = "System.Exception";

const D: ParamTy = ParamTy::Of(TypeName::Double);
const S: ParamTy = ParamTy::Of(TypeName::String);
const I: ParamTy = ParamTy::Of(TypeName::Int);
const RD: Ret = Ret::Of(TypeName::Double);
const RS: Ret = Ret::Of(TypeName::String);
const RB: Ret = Ret::Of(TypeName::Bool);
const RI: Ret = Ret::Of(TypeName::Int);
const RV: Ret = Ret::Of(TypeName::Void);

/// All library members known to the engine.
pub static BUILTINS: &[BuiltinFn] = &[
    // ── System.Console ──────────────────────────────────────────
    BuiltinFn {
        owner: "System.Console", name: "WriteLine", kind: MemberKind::Static, params: &[], ret: RV,
        op: Builtin::WriteLineEmpty, description: "Write a line terminator",
    },
    BuiltinFn {
        owner: "System.Console", name: "WriteLine", kind: MemberKind::Static, params: &[("value", ParamTy::Any)], ret: RV,
        op: Builtin::WriteLine, description: "Write a value followed by a line terminator",
    },
    BuiltinFn {
        owner: "System.Console", name: "Write", kind: MemberKind::Static, params: &[("value", ParamTy::Any)], ret: RV,
        op: Builtin::Write, description: "Write a value",
    },
    // ── System.Math (1-arg) ─────────────────────────────────────
    BuiltinFn {
        owner: "System.Math", name: "Sqrt", kind: MemberKind::Static, params: &[("d", D)], ret: RD,
        op: Builtin::Sqrt, description: "Square root",
    },
    BuiltinFn {
        owner: "System.Math", name: "Abs", kind: MemberKind::Static, params: &[("value", ParamTy::Numeric)], ret: Ret::SameNumeric,
        op: Builtin::Abs, description: "Absolute value",
    },
    BuiltinFn {
        owner: "System.Math", name: "Floor", kind: MemberKind::Static, params: &[("d", D)], ret: RD,
        op: Builtin::Floor, description: "Round down",
    },
    BuiltinFn {
        owner: "System.Math", name: "Ceiling", kind: MemberKind::Static, params: &[("d", D)], ret: RD,
        op: Builtin::Ceiling, description: "Round up",
    },
    BuiltinFn {
        owner: "System.Math", name: "Round", kind: MemberKind::Static, params: &[("d", D)], ret: RD,
        op: Builtin::Round, description: "Round to nearest, ties to even",
    },
    BuiltinFn {
        owner: "System.Math", name: "Sin", kind: MemberKind::Static, params: &[("a", D)], ret: RD,
        op: Builtin::Sin, description: "Sine",
    },
    BuiltinFn {
        owner: "System.Math", name: "Cos", kind: MemberKind::Static, params: &[("d", D)], ret: RD,
        op: Builtin::Cos, description: "Cosine",
    },
    BuiltinFn {
        owner: "System.Math", name: "Exp", kind: MemberKind::Static, params: &[("d", D)], ret: RD,
        op: Builtin::Exp, description: "e raised to a power",
    },
    BuiltinFn {
        owner: "System.Math", name: "Log", kind: MemberKind::Static, params: &[("d", D)], ret: RD,
        op: Builtin::Log, description: "Natural logarithm",
    },
    // ── System.Math (2-arg) ─────────────────────────────────────
    BuiltinFn {
        owner: "System.Math", name: "Pow", kind: MemberKind::Static, params: &[("x", D), ("y", D)], ret: RD,
        op: Builtin::Pow, description: "Power",
    },
    BuiltinFn {
        owner: "System.Math", name: "Max", kind: MemberKind::Static,
        params: &[("val1", ParamTy::Numeric), ("val2", ParamTy::Numeric)], ret: Ret::SameNumeric,
        op: Builtin::Max, description: "Larger of two numbers",
    },
    BuiltinFn {
        owner: "System.Math", name: "Min", kind: MemberKind::Static,
        params: &[("val1", ParamTy::Numeric), ("val2", ParamTy::Numeric)], ret: Ret::SameNumeric,
        op: Builtin::Min, description: "Smaller of two numbers",
    },
    // ── System.Convert ──────────────────────────────────────────
    BuiltinFn {
        owner: "System.Convert", name: "ToInt32", kind: MemberKind::Static, params: &[("value", ParamTy::Any)], ret: RI,
        op: Builtin::ToInt32, description: "Convert to int; FormatException on bad text",
    },
    BuiltinFn {
        owner: "System.Convert", name: "ToDouble", kind: MemberKind::Static, params: &[("value", ParamTy::Any)], ret: RD,
        op: Builtin::ToDouble, description: "Convert to double; FormatException on bad text",
    },
    BuiltinFn {
        owner: "System.Convert", name: "ToString", kind: MemberKind::Static, params: &[("value", ParamTy::Any)], ret: RS,
        op: Builtin::ToStringOf, description: "Convert to string",
    },
    // ── string members ──────────────────────────────────────────
    BuiltinFn {
        owner: STRING_OWNER, name: "Length", kind: MemberKind::Property, params: &[], ret: RI,
        op: Builtin::Length, description: "Number of characters",
    },
    BuiltinFn {
        owner: STRING_OWNER, name: "ToUpper", kind: MemberKind::Method, params: &[], ret: RS,
        op: Builtin::ToUpper, description: "Upper-case copy",
    },
    BuiltinFn {
        owner: STRING_OWNER, name: "ToLower", kind: MemberKind::Method, params: &[], ret: RS,
        op: Builtin::ToLower, description: "Lower-case copy",
    },
    BuiltinFn {
        owner: STRING_OWNER, name: "Trim", kind: MemberKind::Method, params: &[], ret: RS,
        op: Builtin::Trim, description: "Copy without leading and trailing whitespace",
    },
    BuiltinFn {
        owner: STRING_OWNER, name: "Contains", kind: MemberKind::Method, params: &[("value", S)], ret: RB,
        op: Builtin::Contains, description: "Whether the substring occurs",
    },
    BuiltinFn {
        owner: STRING_OWNER, name: "StartsWith", kind: MemberKind::Method, params: &[("value", S)], ret: RB,
        op: Builtin::StartsWith, description: "Whether the string starts with the prefix",
    },
    BuiltinFn {
        owner: STRING_OWNER, name: "EndsWith", kind: MemberKind::Method, params: &[("value", S)], ret: RB,
        op: Builtin::EndsWith, description: "Whether the string ends with the suffix",
    },
    BuiltinFn {
        owner: STRING_OWNER, name: "IndexOf", kind: MemberKind::Method, params: &[("value", S)], ret: RI,
        op: Builtin::IndexOf, description: "Character index of the first occurrence, or -1",
    },
    BuiltinFn {
        owner: STRING_OWNER, name: "Substring", kind: MemberKind::Method, params: &[("startIndex", I), ("length", I)], ret: RS,
        op: Builtin::Substring, description: "Characters [startIndex, startIndex + length)",
    },
    BuiltinFn {
        owner: STRING_OWNER, name: "Replace", kind: MemberKind::Method, params: &[("oldValue", S), ("newValue", S)], ret: RS,
        op: Builtin::Replace, description: "Copy with every occurrence replaced",
    },
    // ── object / Exception members ──────────────────────────────
    BuiltinFn {
        owner: OBJECT_OWNER, name: "ToString", kind: MemberKind::Method, params: &[], ret: RS,
        op: Builtin::ToStringMember, description: "Text rendering of the value",
    },
    BuiltinFn {
        owner: EXCEPTION_OWNER, name: "Message", kind: MemberKind::Property, params: &[], ret: RS,
        op: Builtin::Message, description: "Exception message",
    },
];

/// Static constants exposed on library types.
#[derive(Debug, Clone)]
pub struct BuiltinConst {
    pub owner: &'static str,
    pub name: &'static str,
    pub value: f64,
    pub description: &'static str,
}

pub static CONSTANTS: &[BuiltinConst] = &[
    BuiltinConst { owner: "System.Math", name: "PI", value: std::f64::consts::PI, description: "3.14159..." },
    BuiltinConst { owner: "System.Math", name: "E", value: std::f64::consts::E, description: "2.71828..." },
];

/// Exception types constructible with `new`, all in namespace `System`.
pub static EXCEPTION_TYPES: &[&str] = &[
    "System.Exception",
    "System.InvalidOperationException",
    "System.ArgumentException",
    "System.ArgumentOutOfRangeException",
    "System.DivideByZeroException",
    "System.FormatException",
    "System.NotImplementedException",
    "System.IndexOutOfRangeException",
    "System.NullReferenceException",
];

/// Static types that own library members.
pub static LIBRARY_TYPES: &[&str] = &["System.Console", "System.Math", "System.Convert"];

pub fn lookup_static(owner: &str, name: &str, argc: usize) -> Option<&'static BuiltinFn> {
    BUILTINS.iter().find(|b| {
        b.kind == MemberKind::Static && b.owner == owner && b.name == name && b.params.len() == argc
    })
}

/// Whether `owner` has any static member called `name`, regardless of arity.
pub fn has_static(owner: &str, name: &str) -> bool {
    BUILTINS
        .iter()
        .any(|b| b.kind == MemberKind::Static && b.owner == owner && b.name == name)
}

pub fn lookup_const(owner: &str, name: &str) -> Option<&'static BuiltinConst> {
    CONSTANTS.iter().find(|c| c.owner == owner && c.name == name)
}

/// Instance members visible on a receiver of type `receiver`, most specific owner first.
fn member_owners(receiver: TypeName) -> &'static [&'static str] {
    match receiver {
        TypeName::String => &[STRING_OWNER, OBJECT_OWNER],
        TypeName::Exception => &[EXCEPTION_OWNER, OBJECT_OWNER],
        _ => &[OBJECT_OWNER],
    }
}

/// Find an instance member. `argc` is `None` for property access.
pub fn lookup_member(receiver: TypeName, name: &str, argc: Option<usize>) -> Option<&'static BuiltinFn> {
    member_owners(receiver).iter().find_map(|owner| {
        BUILTINS.iter().find(|b| {
            b.owner == *owner
                && b.name == name
                && match argc {
                    None => b.kind == MemberKind::Property,
                    Some(n) => b.kind == MemberKind::Method && b.params.len() == n,
                }
        })
    })
}

/// Short name of a dotted type: `System.Exception` → `Exception`.
pub fn short_name(full: &str) -> &str {
    full.rsplit('.').next().unwrap_or(full)
}

// ── Reference set ─────────────────────────────────────────────────

/// The symbol universe a compilation sees beyond user declarations: which
/// library types and exception types exist, and which namespaces/types are
/// imported for unqualified use. Immutable once handed to the chain.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReferenceSet {
    types: IndexSet<String>,
    exception_types: IndexSet<String>,
    usings: Vec<String>,
}

impl ReferenceSet {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_type(mut self, full_name: impl Into<String>) -> Self {
        self.types.insert(full_name.into());
        self
    }

    #[must_use]
    pub fn with_exception_type(mut self, full_name: impl Into<String>) -> Self {
        self.exception_types.insert(full_name.into());
        self
    }

    #[must_use]
    pub fn with_usings<I, S>(mut self, usings: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.usings.extend(usings.into_iter().map(Into::into));
        self
    }

    pub fn usings(&self) -> &[String] {
        &self.usings
    }

    pub fn types(&self) -> impl Iterator<Item = &str> {
        self.types.iter().map(String::as_str)
    }

    pub fn exception_types(&self) -> impl Iterator<Item = &str> {
        self.exception_types.iter().map(String::as_str)
    }

    fn resolve_in<'a>(&self, set: &'a IndexSet<String>, path: &str) -> Option<&'a str> {
        if let Some(full) = set.get(path) {
            return Some(full.as_str());
        }
        self.usings.iter().find_map(|ns| {
            let candidate = format!("{ns}.{path}");
            set.get(candidate.as_str()).map(String::as_str)
        })
    }

    /// Resolve a (possibly partially qualified) library type name.
    pub fn resolve_type(&self, path: &str) -> Option<&str> {
        self.resolve_in(&self.types, path)
    }

    /// Resolve an exception type name for `new`.
    pub fn resolve_exception(&self, path: &str) -> Option<&str> {
        self.resolve_in(&self.exception_types, path)
    }

    /// Types imported with a using that names the type itself
    /// (`System.Console`), whose static members are usable unqualified.
    pub fn static_imports(&self) -> impl Iterator<Item = &str> {
        self.usings
            .iter()
            .filter(|u| self.types.contains(u.as_str()))
            .map(String::as_str)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn standard() -> ReferenceSet {
        let mut refs = ReferenceSet::new();
        for ty in LIBRARY_TYPES {
            refs = refs.with_type(*ty);
        }
        for ty in EXCEPTION_TYPES {
            refs = refs.with_exception_type(*ty);
        }
        refs.with_usings(["System", "System.Console"])
    }

    #[test]
    fn write_line_overloads_by_arity() {
        assert_eq!(lookup_static("System.Console", "WriteLine", 0).unwrap().op, Builtin::WriteLineEmpty);
        assert_eq!(lookup_static("System.Console", "WriteLine", 1).unwrap().op, Builtin::WriteLine);
        assert!(lookup_static("System.Console", "WriteLine", 2).is_none());
        assert!(has_static("System.Console", "WriteLine"));
    }

    #[test]
    fn string_members_fall_back_to_object() {
        assert_eq!(lookup_member(TypeName::String, "Length", None).unwrap().op, Builtin::Length);
        assert_eq!(lookup_member(TypeName::String, "ToString", Some(0)).unwrap().op, Builtin::ToStringMember);
        assert_eq!(lookup_member(TypeName::Int, "ToString", Some(0)).unwrap().op, Builtin::ToStringMember);
        assert!(lookup_member(TypeName::Int, "Length", None).is_none());
        // Methods are not properties
        assert!(lookup_member(TypeName::String, "ToUpper", None).is_none());
    }

    #[test]
    fn resolves_through_namespace_usings() {
        let refs = standard();
        assert_eq!(refs.resolve_type("Math"), Some("System.Math"));
        assert_eq!(refs.resolve_type("System.Math"), Some("System.Math"));
        assert_eq!(refs.resolve_exception("Exception"), Some("System.Exception"));
        assert!(refs.resolve_type("Nope").is_none());
    }

    #[test]
    fn namespace_using_required_for_short_names() {
        let refs = ReferenceSet::new().with_type("System.Math");
        assert!(refs.resolve_type("Math").is_none());
        assert_eq!(refs.resolve_type("System.Math"), Some("System.Math"));
    }

    #[test]
    fn static_imports_are_type_usings() {
        let refs = standard();
        let imports: Vec<_> = refs.static_imports().collect();
        assert_eq!(imports, vec!["System.Console"]);
    }

    #[test]
    fn constants_and_short_names() {
        assert!((lookup_const("System.Math", "PI").unwrap().value - std::f64::consts::PI).abs() < 1e-12);
        assert_eq!(short_name("System.DivideByZeroException"), "DivideByZeroException");
        assert_eq!(short_name("Exception"), "Exception");
    }
}
