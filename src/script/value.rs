//! Runtime values shared by the VM, the state store and result formatting.

use std::fmt::Write as _;
use std::sync::Arc;

use super::ast::TypeName;

/// Hashable identity of a pooled constant.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum ConstKey {
    Null,
    Int(i32),
    Double(u64),
    Bool(bool),
    Str(Arc<str>),
}

/// An exception object: created by `new`, or raised by the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionValue {
    /// Fully qualified type name, e.g. `System.DivideByZeroException`.
    pub type_name: String,
    pub message: String,
}

impl ExceptionValue {
    pub fn new(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            message: message.into(),
        }
    }

    /// Message used by `new XException()` with no arguments.
    pub fn default_message(type_name: &str) -> String {
        format!("Exception of type '{type_name}' was thrown.")
    }

    pub fn null_reference() -> Self {
        Self::new(
            "System.NullReferenceException",
            "Object reference not set to an instance of an object.",
        )
    }

    pub fn divide_by_zero() -> Self {
        Self::new("System.DivideByZeroException", "Attempted to divide by zero.")
    }

    pub fn overflow(message: impl Into<String>) -> Self {
        Self::new("System.OverflowException", message)
    }

    pub fn format(message: impl Into<String>) -> Self {
        Self::new("System.FormatException", message)
    }

    pub fn argument_out_of_range(param: &str, message: &str) -> Self {
        Self::new(
            "System.ArgumentOutOfRangeException",
            format!("{message} (Parameter '{param}')"),
        )
    }

    pub fn argument_null(param: &str) -> Self {
        Self::new(
            "System.ArgumentNullException",
            format!("Value cannot be null. (Parameter '{param}')"),
        )
    }
}

/// Runtime value on the VM stack and in submission state slots.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Int(i32),
    Double(f64),
    Bool(bool),
    Str(Arc<str>),
    Exception(Arc<ExceptionValue>),
}

impl Value {
    /// Zero value for a declared type (`int x;` starts as `0`).
    pub fn default_for(ty: TypeName) -> Self {
        match ty {
            TypeName::Int => Self::Int(0),
            TypeName::Double => Self::Double(0.0),
            TypeName::Bool => Self::Bool(false),
            TypeName::String | TypeName::Void | TypeName::Null | TypeName::Exception => Self::Null,
        }
    }

    pub fn str(s: impl Into<Arc<str>>) -> Self {
        Self::Str(s.into())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// `ToString()` rendering: `True`/`False`, invariant numbers, null as empty.
    pub fn to_display_string(&self) -> String {
        match self {
            Self::Null => String::new(),
            Self::Int(v) => v.to_string(),
            Self::Double(v) => format_double(*v),
            Self::Bool(true) => "True".into(),
            Self::Bool(false) => "False".into(),
            Self::Str(s) => s.to_string(),
            Self::Exception(e) => format!("{}: {}", e.type_name, e.message),
        }
    }

    /// Identity of a constant for pool deduplication. Doubles compare by
    /// bits; exceptions are never pooled.
    pub(crate) fn constant_key(&self) -> Option<ConstKey> {
        Some(match self {
            Self::Null => ConstKey::Null,
            Self::Int(v) => ConstKey::Int(*v),
            Self::Double(v) => ConstKey::Double(v.to_bits()),
            Self::Bool(v) => ConstKey::Bool(*v),
            Self::Str(s) => ConstKey::Str(Arc::clone(s)),
            Self::Exception(_) => return None,
        })
    }

    /// `==` semantics. Exceptions compare by reference.
    #[allow(clippy::float_cmp)]
    pub fn equals(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Double(a), Self::Double(b)) => a == b,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Exception(a), Self::Exception(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// Invariant-culture, round-trippable rendering of a double:
/// `2`, `2.5`, `1E+20`, `1.5E-07`, `Infinity`, `NaN`.
pub fn format_double(v: f64) -> String {
    if v.is_nan() {
        return "NaN".into();
    }
    if v.is_infinite() {
        return if v > 0.0 { "Infinity".into() } else { "-Infinity".into() };
    }
    let abs = v.abs();
    if abs != 0.0 && !(1e-4..1e15).contains(&abs) {
        // Rust's `{:e}` gives the shortest mantissa: `1.5e-7`.
        let raw = format!("{v:e}");
        let (mantissa, exponent) = raw.split_once('e').unwrap_or((raw.as_str(), "0"));
        let (sign, digits) = match exponent.strip_prefix('-') {
            Some(d) => ('-', d),
            None => ('+', exponent),
        };
        let mut out = String::with_capacity(raw.len() + 2);
        out.push_str(mantissa);
        out.push('E');
        out.push(sign);
        if digits.len() < 2 {
            out.push('0');
        }
        out.push_str(digits);
        return out;
    }
    format!("{v}")
}

/// Quoted string literal with escapes, for displaying string results.
pub fn quote_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for ch in s.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\0' => out.push_str("\\0"),
            c if c.is_control() => {
                let _ = write!(out, "\\u{:04x}", u32::from(c));
            }
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn doubles_render_invariant() {
        assert_eq!(format_double(2.0), "2");
        assert_eq!(format_double(2.5), "2.5");
        assert_eq!(format_double(0.1 + 0.2), "0.30000000000000004");
        assert_eq!(format_double(1e20), "1E+20");
        assert_eq!(format_double(1.5e-7), "1.5E-07");
        assert_eq!(format_double(f64::INFINITY), "Infinity");
        assert_eq!(format_double(f64::NEG_INFINITY), "-Infinity");
        assert_eq!(format_double(f64::NAN), "NaN");
        assert_eq!(format_double(0.0), "0");
    }

    #[test]
    fn to_string_semantics() {
        assert_eq!(Value::Bool(true).to_display_string(), "True");
        assert_eq!(Value::Null.to_display_string(), "");
        assert_eq!(Value::Int(-3).to_display_string(), "-3");
        assert_eq!(Value::str("hi").to_display_string(), "hi");
    }

    #[test]
    fn quoting_escapes() {
        assert_eq!(quote_string("a\"b\n"), "\"a\\\"b\\n\"");
        assert_eq!(quote_string(""), "\"\"");
    }

    #[test]
    fn defaults_per_type() {
        assert!(matches!(Value::default_for(TypeName::Int), Value::Int(0)));
        assert!(matches!(Value::default_for(TypeName::Bool), Value::Bool(false)));
        assert!(Value::default_for(TypeName::String).is_null());
    }

    #[test]
    fn equality_rules() {
        assert!(Value::Null.equals(&Value::Null));
        assert!(!Value::Null.equals(&Value::str("")));
        assert!(!Value::Double(f64::NAN).equals(&Value::Double(f64::NAN)));
        let e = Arc::new(ExceptionValue::new("System.Exception", "x"));
        assert!(Value::Exception(e.clone()).equals(&Value::Exception(e)));
    }
}
