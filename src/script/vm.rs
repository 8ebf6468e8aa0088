use std::sync::Arc;

use super::builtins::{Builtin, MemberKind, BUILTINS};
use super::compiler::{Chunk, CompiledSubmission, Op, ENTRY_ROUTINE};
use super::typeck::{FunctionRef, GlobalRef};
use super::value::{ExceptionValue, Value};

/// Default recursion limit.
pub const DEFAULT_MAX_CALL_DEPTH: usize = 256;

/// Budgets that turn runaway scripts into recoverable faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionLimits {
    /// Maximum ops executed per submission; `None` is unlimited.
    pub step_limit: Option<u64>,
    pub max_call_depth: usize,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            step_limit: None,
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
        }
    }
}

/// Loaded submission images, by submission id.
pub trait CodeLookup {
    fn submission(&self, id: u32) -> Option<Arc<CompiledSubmission>>;
}

/// Storage for submission globals.
pub trait GlobalStore {
    fn load(&self, global: GlobalRef) -> Option<Value>;
    /// Returns false when the slot does not exist.
    fn store(&mut self, global: GlobalRef, value: Value) -> bool;
}

/// One line of a fault's stack trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceFrame {
    /// `Submission#3.<Main>`, `Submission#1.fact`
    pub routine: String,
    pub line: u32,
}

/// An exception that escaped the submission, with the frames active when it
/// was raised, innermost first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    pub exception: ExceptionValue,
    pub trace: Vec<TraceFrame>,
}

/// Why execution stopped without a result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trap {
    /// User-visible exception.
    Thrown(Fault),
    /// Broken image or state store; the session cannot continue.
    Internal(String),
}

enum Raise {
    Throw(ExceptionValue),
    Internal(String),
}

impl From<ExceptionValue> for Raise {
    fn from(e: ExceptionValue) -> Self {
        Self::Throw(e)
    }
}

fn internal(message: impl Into<String>) -> Raise {
    Raise::Internal(message.into())
}

/// Run a submission's entry routine to completion.
///
/// Returns the value of the trailing expression, or `Value::Null` when the
/// submission has none.
pub fn run(
    code: Arc<CompiledSubmission>,
    lookup: &dyn CodeLookup,
    globals: &mut dyn GlobalStore,
    limits: &ExecutionLimits,
) -> Result<Value, Trap> {
    let local_count = usize::from(code.entry.local_count);
    let mut machine = Machine {
        lookup,
        globals,
        limits,
        stack: Vec::with_capacity(64),
        frames: Vec::new(),
        steps: 0,
    };
    machine.stack.resize(local_count, Value::Null);
    machine.frames.push(Frame {
        code,
        function: None,
        ip: 0,
        base: 0,
    });
    machine.run()
}

struct Frame {
    code: Arc<CompiledSubmission>,
    /// `None` for the entry routine.
    function: Option<u16>,
    ip: usize,
    /// Stack index of local 0.
    base: usize,
}

impl Frame {
    fn chunk(&self) -> Option<&Chunk> {
        match self.function {
            None => Some(&self.code.entry),
            Some(index) => self.code.function(index),
        }
    }

    fn trace(&self) -> TraceFrame {
        let name = self.chunk().map_or(ENTRY_ROUTINE, |c| c.name.as_str());
        TraceFrame {
            routine: format!("Submission#{}.{name}", self.code.id),
            // ip already points past the faulting op
            line: self.chunk().map_or(0, |c| c.line_at(self.ip.saturating_sub(1))),
        }
    }
}

struct Machine<'a> {
    lookup: &'a dyn CodeLookup,
    globals: &'a mut dyn GlobalStore,
    limits: &'a ExecutionLimits,
    stack: Vec<Value>,
    frames: Vec<Frame>,
    steps: u64,
}

impl Machine<'_> {
    fn run(&mut self) -> Result<Value, Trap> {
        loop {
            match self.step() {
                Ok(Some(result)) => return Ok(result),
                Ok(None) => {}
                Err(Raise::Throw(exception)) => {
                    let trace = self.frames.iter().rev().map(Frame::trace).collect();
                    return Err(Trap::Thrown(Fault { exception, trace }));
                }
                Err(Raise::Internal(message)) => return Err(Trap::Internal(message)),
            }
        }
    }

    fn pop(&mut self) -> Result<Value, Raise> {
        self.stack.pop().ok_or_else(|| internal("operand stack underflow"))
    }

    fn frame(&self) -> Result<&Frame, Raise> {
        self.frames.last().ok_or_else(|| internal("no active frame"))
    }

    fn local_index(&self, idx: u16) -> Result<usize, Raise> {
        let slot = self.frame()?.base + usize::from(idx);
        if slot < self.stack.len() {
            Ok(slot)
        } else {
            Err(internal(format!("local {idx} out of range")))
        }
    }

    /// Execute one op. `Some(value)` when the entry routine returns.
    #[allow(clippy::too_many_lines)]
    fn step(&mut self) -> Result<Option<Value>, Raise> {
        let frame = self.frames.last_mut().ok_or_else(|| internal("no active frame"))?;
        let Some(op) = frame.chunk().and_then(|c| c.ops.get(frame.ip)).copied() else {
            return Err(internal("instruction pointer ran past the end of the routine"));
        };
        frame.ip += 1;

        self.steps += 1;
        if let Some(limit) = self.limits.step_limit {
            if self.steps > limit {
                return Err(ExceptionValue::new(
                    "System.ExecutionLimitExceededException",
                    format!("Execution exceeded the limit of {limit} steps."),
                )
                .into());
            }
        }

        match op {
            Op::PushConst(idx) => {
                let value = self
                    .frame()?
                    .code
                    .constants
                    .get(usize::from(idx))
                    .cloned()
                    .ok_or_else(|| internal(format!("constant {idx} out of range")))?;
                self.stack.push(value);
            }
            Op::PushNull => self.stack.push(Value::Null),
            Op::Pop => {
                self.pop()?;
            }
            Op::Dup => {
                let top = self.stack.last().cloned().ok_or_else(|| internal("operand stack underflow"))?;
                self.stack.push(top);
            }
            Op::LoadLocal(idx) => {
                let slot = self.local_index(idx)?;
                let value = self.stack[slot].clone();
                self.stack.push(value);
            }
            Op::StoreLocal(idx) => {
                let value = self.pop()?;
                let slot = self.local_index(idx)?;
                self.stack[slot] = value;
            }
            Op::LoadGlobal(g) => {
                let value = self.globals.load(g).ok_or_else(|| missing_global(g))?;
                self.stack.push(value);
            }
            Op::StoreGlobal(g) => {
                let value = self.pop()?;
                if !self.globals.store(g, value) {
                    return Err(missing_global(g));
                }
            }

            Op::Add | Op::Sub | Op::Mul | Op::Div | Op::Rem | Op::Pow => {
                let right = self.pop()?;
                let left = self.pop()?;
                self.stack.push(arithmetic(op, left, right)?);
            }
            Op::Neg => {
                let value = match self.pop()? {
                    Value::Int(v) => Value::Int(v.wrapping_neg()),
                    Value::Double(v) => Value::Double(-v),
                    other => return Err(type_confusion("-", &other)),
                };
                self.stack.push(value);
            }
            Op::Concat => {
                let right = self.pop()?;
                let left = self.pop()?;
                let mut s = left.to_display_string();
                s.push_str(&right.to_display_string());
                self.stack.push(Value::str(s));
            }

            Op::Lt | Op::Gt | Op::Le | Op::Ge => {
                let right = self.pop()?;
                let left = self.pop()?;
                self.stack.push(Value::Bool(compare(op, &left, &right)?));
            }
            Op::Eq | Op::Ne => {
                let right = self.pop()?;
                let left = self.pop()?;
                let equal = left.equals(&right);
                self.stack.push(Value::Bool(if op == Op::Eq { equal } else { !equal }));
            }
            Op::Not => {
                let value = as_bool(&self.pop()?)?;
                self.stack.push(Value::Bool(!value));
            }

            Op::IntToFloat => {
                let value = match self.pop()? {
                    Value::Int(v) => Value::Double(f64::from(v)),
                    other => other,
                };
                self.stack.push(value);
            }
            Op::FloatToInt => {
                let value = match self.pop()? {
                    Value::Double(v) => Value::Int(v as i32),
                    other => other,
                };
                self.stack.push(value);
            }

            Op::JumpIfFalse(target) => {
                if !as_bool(&self.pop()?)? {
                    self.jump(target)?;
                }
            }
            Op::Jump(target) => self.jump(target)?,

            Op::Call(function) => self.call(function)?,
            Op::Builtin(builtin) => {
                let argc = stack_arity(builtin);
                let at = self
                    .stack
                    .len()
                    .checked_sub(argc)
                    .ok_or_else(|| internal("operand stack underflow"))?;
                let args = self.stack.split_off(at);
                if let Some(result) = call_builtin(builtin, args)? {
                    self.stack.push(result);
                }
            }
            Op::NewException { type_const, has_message } => {
                let type_name = match self.frame()?.code.constants.get(usize::from(type_const)) {
                    Some(Value::Str(s)) => s.to_string(),
                    _ => return Err(internal(format!("constant {type_const} is not a type name"))),
                };
                let message = if has_message {
                    match self.pop()? {
                        Value::Null => ExceptionValue::default_message(&type_name),
                        other => other.to_display_string(),
                    }
                } else {
                    ExceptionValue::default_message(&type_name)
                };
                self.stack
                    .push(Value::Exception(Arc::new(ExceptionValue::new(type_name, message))));
            }
            Op::Throw => {
                return Err(match self.pop()? {
                    Value::Exception(e) => Raise::Throw((*e).clone()),
                    Value::Null => ExceptionValue::null_reference().into(),
                    other => type_confusion("throw", &other),
                });
            }
            Op::Return => {
                let result = self.pop()?;
                let frame = self.frames.pop().ok_or_else(|| internal("no active frame"))?;
                self.stack.truncate(frame.base);
                if self.frames.is_empty() {
                    return Ok(Some(result));
                }
                self.stack.push(result);
            }
        }
        Ok(None)
    }

    fn jump(&mut self, target: u32) -> Result<(), Raise> {
        let frame = self.frames.last_mut().ok_or_else(|| internal("no active frame"))?;
        frame.ip = usize::try_from(target).map_err(|_| internal("jump target out of range"))?;
        Ok(())
    }

    fn call(&mut self, function: FunctionRef) -> Result<(), Raise> {
        if self.frames.len() >= self.limits.max_call_depth {
            return Err(ExceptionValue::new(
                "System.StackOverflowException",
                format!(
                    "Call depth exceeded the limit of {} frames.",
                    self.limits.max_call_depth
                ),
            )
            .into());
        }
        let current = &self.frame()?.code;
        let code = if current.id == function.submission {
            Arc::clone(current)
        } else {
            self.lookup.submission(function.submission).ok_or_else(|| {
                internal(format!("Submission#{} is not loaded", function.submission))
            })?
        };
        let chunk = code.function(function.index).ok_or_else(|| {
            internal(format!(
                "Submission#{} has no function {}",
                function.submission, function.index
            ))
        })?;
        let params = usize::from(chunk.param_count);
        let extra = usize::from(chunk.local_count).saturating_sub(params);
        let base = self
            .stack
            .len()
            .checked_sub(params)
            .ok_or_else(|| internal("operand stack underflow"))?;
        self.stack.extend(std::iter::repeat(Value::Null).take(extra));
        self.frames.push(Frame {
            code,
            function: Some(function.index),
            ip: 0,
            base,
        });
        Ok(())
    }
}

fn missing_global(g: GlobalRef) -> Raise {
    internal(format!(
        "state slot {} of Submission#{} is missing",
        g.slot, g.submission
    ))
}

fn type_confusion(op: &str, value: &Value) -> Raise {
    internal(format!("operator '{op}' applied to unexpected operand {value:?}"))
}

fn as_bool(value: &Value) -> Result<bool, Raise> {
    match value {
        Value::Bool(b) => Ok(*b),
        other => Err(type_confusion("bool", other)),
    }
}

fn overflow() -> ExceptionValue {
    ExceptionValue::overflow("Arithmetic operation resulted in an overflow.")
}

fn arithmetic(op: Op, left: Value, right: Value) -> Result<Value, Raise> {
    match (left, right) {
        (Value::Int(a), Value::Int(b)) => {
            let value = match op {
                Op::Add => a.wrapping_add(b),
                Op::Sub => a.wrapping_sub(b),
                Op::Mul => a.wrapping_mul(b),
                Op::Div | Op::Rem if b == 0 => return Err(ExceptionValue::divide_by_zero().into()),
                Op::Div => a.checked_div(b).ok_or_else(overflow)?,
                Op::Rem => a.checked_rem(b).ok_or_else(overflow)?,
                _ => return Ok(Value::Double(f64::from(a).powf(f64::from(b)))),
            };
            Ok(Value::Int(value))
        }
        (Value::Double(a), Value::Double(b)) => Ok(Value::Double(match op {
            Op::Add => a + b,
            Op::Sub => a - b,
            Op::Mul => a * b,
            Op::Div => a / b,
            Op::Rem => a % b,
            _ => a.powf(b),
        })),
        (other, _) => Err(type_confusion("arithmetic", &other)),
    }
}

#[allow(clippy::float_cmp)]
fn compare(op: Op, left: &Value, right: &Value) -> Result<bool, Raise> {
    let ordering = match (left, right) {
        (Value::Int(a), Value::Int(b)) => a.partial_cmp(b),
        (Value::Double(a), Value::Double(b)) => a.partial_cmp(b),
        (other, _) => return Err(type_confusion("comparison", other)),
    };
    // NaN compares false against everything
    let Some(ordering) = ordering else {
        return Ok(false);
    };
    Ok(match op {
        Op::Lt => ordering.is_lt(),
        Op::Gt => ordering.is_gt(),
        Op::Le => ordering.is_le(),
        _ => ordering.is_ge(),
    })
}

// ── Library routines ──────────────────────────────────────────────

/// Values a builtin pops: its parameters plus the receiver for instance members.
fn stack_arity(op: Builtin) -> usize {
    BUILTINS
        .iter()
        .find(|b| b.op == op)
        .map_or(0, |b| b.params.len() + usize::from(b.kind != MemberKind::Static))
}

fn as_f64(value: &Value) -> Result<f64, Raise> {
    match value {
        Value::Double(v) => Ok(*v),
        Value::Int(v) => Ok(f64::from(*v)),
        other => Err(type_confusion("numeric", other)),
    }
}

fn as_i32(value: &Value) -> Result<i32, Raise> {
    match value {
        Value::Int(v) => Ok(*v),
        other => Err(type_confusion("int", other)),
    }
}

/// Receiver of an instance member; `null` raises `NullReferenceException`.
fn receiver_str(value: &Value) -> Result<&str, Raise> {
    match value {
        Value::Str(s) => Ok(s),
        Value::Null => Err(ExceptionValue::null_reference().into()),
        other => Err(type_confusion("string member", other)),
    }
}

/// String argument that must not be null.
fn arg_str<'v>(value: &'v Value, param: &str) -> Result<&'v str, Raise> {
    match value {
        Value::Str(s) => Ok(s),
        Value::Null => Err(ExceptionValue::argument_null(param).into()),
        other => Err(type_confusion("string argument", other)),
    }
}

fn math1(args: &[Value], f: impl FnOnce(f64) -> f64) -> Result<Option<Value>, Raise> {
    let [x] = args else {
        return Err(internal("Math routine expects 1 argument"));
    };
    Ok(Some(Value::Double(f(as_f64(x)?))))
}

fn int32_range_overflow() -> ExceptionValue {
    ExceptionValue::overflow("Value was either too large or too small for an Int32.")
}

fn not_in_correct_format(text: &str) -> ExceptionValue {
    ExceptionValue::format(format!(
        "The input string '{text}' was not in a correct format."
    ))
}

fn convert_to_int32(value: &Value) -> Result<i32, Raise> {
    match value {
        Value::Null => Ok(0),
        Value::Int(v) => Ok(*v),
        Value::Bool(b) => Ok(i32::from(*b)),
        Value::Double(v) => {
            let rounded = v.round_ties_even();
            if rounded.is_nan() || rounded < f64::from(i32::MIN) || rounded > f64::from(i32::MAX) {
                Err(int32_range_overflow().into())
            } else {
                Ok(rounded as i32)
            }
        }
        Value::Str(s) => {
            let trimmed = s.trim();
            let digits = trimmed.strip_prefix(['+', '-']).unwrap_or(trimmed);
            if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
                return Err(not_in_correct_format(s).into());
            }
            trimmed.parse::<i32>().map_err(|_| int32_range_overflow().into())
        }
        Value::Exception(e) => Err(invalid_cast(&e.type_name).into()),
    }
}

fn convert_to_double(value: &Value) -> Result<f64, Raise> {
    match value {
        Value::Null => Ok(0.0),
        Value::Int(v) => Ok(f64::from(*v)),
        Value::Double(v) => Ok(*v),
        Value::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
        Value::Str(s) => match s.trim() {
            "Infinity" | "∞" => Ok(f64::INFINITY),
            "-Infinity" | "-∞" => Ok(f64::NEG_INFINITY),
            "NaN" => Ok(f64::NAN),
            t => t
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .ok_or_else(|| not_in_correct_format(s).into()),
        },
        Value::Exception(e) => Err(invalid_cast(&e.type_name).into()),
    }
}

fn invalid_cast(type_name: &str) -> ExceptionValue {
    ExceptionValue::new(
        "System.InvalidCastException",
        format!("Unable to cast object of type '{type_name}' to type 'System.IConvertible'."),
    )
}

/// Execute a library routine. `None` for routines returning void.
fn call_builtin(op: Builtin, args: Vec<Value>) -> Result<Option<Value>, Raise> {
    use crate::engine::console;

    let str_result = |s: String| -> Result<Option<Value>, Raise> { Ok(Some(Value::str(s))) };
    match (op, args.as_slice()) {
        (Builtin::WriteLineEmpty, []) => {
            console::write("\n");
            Ok(None)
        }
        (Builtin::WriteLine, [v]) => {
            let mut line = v.to_display_string();
            line.push('\n');
            console::write(&line);
            Ok(None)
        }
        (Builtin::Write, [v]) => {
            console::write(&v.to_display_string());
            Ok(None)
        }

        (Builtin::Sqrt, _) => math1(&args, f64::sqrt),
        (Builtin::Floor, _) => math1(&args, f64::floor),
        (Builtin::Ceiling, _) => math1(&args, f64::ceil),
        (Builtin::Round, _) => math1(&args, f64::round_ties_even),
        (Builtin::Sin, _) => math1(&args, f64::sin),
        (Builtin::Cos, _) => math1(&args, f64::cos),
        (Builtin::Exp, _) => math1(&args, f64::exp),
        (Builtin::Log, _) => math1(&args, f64::ln),
        (Builtin::Abs, [Value::Int(v)]) => v
            .checked_abs()
            .map(|a| Some(Value::Int(a)))
            .ok_or_else(|| {
                ExceptionValue::overflow(
                    "Negating the minimum value of a twos complement number is invalid.",
                )
                .into()
            }),
        (Builtin::Abs, _) => math1(&args, f64::abs),
        (Builtin::Pow, [x, y]) => Ok(Some(Value::Double(as_f64(x)?.powf(as_f64(y)?)))),
        (Builtin::Max | Builtin::Min, [Value::Int(a), Value::Int(b)]) => {
            Ok(Some(Value::Int(if op == Builtin::Max { *a.max(b) } else { *a.min(b) })))
        }
        (Builtin::Max | Builtin::Min, [a, b]) => {
            let (a, b) = (as_f64(a)?, as_f64(b)?);
            // NaN wins in either direction
            let v = if a.is_nan() || b.is_nan() {
                f64::NAN
            } else if op == Builtin::Max {
                a.max(b)
            } else {
                a.min(b)
            };
            Ok(Some(Value::Double(v)))
        }

        (Builtin::ToInt32, [v]) => Ok(Some(Value::Int(convert_to_int32(v)?))),
        (Builtin::ToDouble, [v]) => Ok(Some(Value::Double(convert_to_double(v)?))),
        (Builtin::ToStringOf, [v]) => str_result(v.to_display_string()),

        (Builtin::Length, [s]) => {
            let len = receiver_str(s)?.chars().count();
            Ok(Some(Value::Int(i32::try_from(len).unwrap_or(i32::MAX))))
        }
        (Builtin::ToUpper, [s]) => str_result(receiver_str(s)?.to_uppercase()),
        (Builtin::ToLower, [s]) => str_result(receiver_str(s)?.to_lowercase()),
        (Builtin::Trim, [s]) => str_result(receiver_str(s)?.trim().to_string()),
        (Builtin::Contains, [s, v]) => {
            let hay = receiver_str(s)?;
            Ok(Some(Value::Bool(hay.contains(arg_str(v, "value")?))))
        }
        (Builtin::StartsWith, [s, v]) => {
            let hay = receiver_str(s)?;
            Ok(Some(Value::Bool(hay.starts_with(arg_str(v, "value")?))))
        }
        (Builtin::EndsWith, [s, v]) => {
            let hay = receiver_str(s)?;
            Ok(Some(Value::Bool(hay.ends_with(arg_str(v, "value")?))))
        }
        (Builtin::IndexOf, [s, v]) => {
            let hay = receiver_str(s)?;
            let needle = arg_str(v, "value")?;
            let index = hay
                .find(needle)
                .map_or(-1, |byte| i32::try_from(hay[..byte].chars().count()).unwrap_or(i32::MAX));
            Ok(Some(Value::Int(index)))
        }
        (Builtin::Substring, [s, start, length]) => {
            let text = receiver_str(s)?;
            str_result(substring(text, as_i32(start)?, as_i32(length)?)?)
        }
        (Builtin::Replace, [s, old, new]) => {
            let text = receiver_str(s)?;
            let old = arg_str(old, "oldValue")?;
            if old.is_empty() {
                return Err(ExceptionValue::new(
                    "System.ArgumentException",
                    "String cannot be of zero length. (Parameter 'oldValue')",
                )
                .into());
            }
            let new = match new {
                Value::Null => "",
                other => arg_str(other, "newValue")?,
            };
            str_result(text.replace(old, new))
        }

        (Builtin::ToStringMember, [v]) => match v {
            Value::Null => Err(ExceptionValue::null_reference().into()),
            other => str_result(other.to_display_string()),
        },
        (Builtin::Message, [v]) => match v {
            Value::Exception(e) => str_result(e.message.clone()),
            Value::Null => Err(ExceptionValue::null_reference().into()),
            other => Err(type_confusion("Message", other)),
        },

        (op, args) => Err(internal(format!(
            "builtin {op:?} called with {} arguments",
            args.len()
        ))),
    }
}

fn substring(text: &str, start: i32, length: i32) -> Result<String, Raise> {
    let count = text.chars().count();
    let Ok(start) = usize::try_from(start) else {
        return Err(ExceptionValue::argument_out_of_range(
            "startIndex",
            "StartIndex cannot be less than zero.",
        )
        .into());
    };
    let Ok(length) = usize::try_from(length) else {
        return Err(ExceptionValue::argument_out_of_range(
            "length",
            "Length cannot be less than zero.",
        )
        .into());
    };
    if start > count {
        return Err(ExceptionValue::argument_out_of_range(
            "startIndex",
            "startIndex cannot be larger than length of string.",
        )
        .into());
    }
    if start + length > count {
        return Err(ExceptionValue::argument_out_of_range(
            "length",
            "Index and length must refer to a location within the string.",
        )
        .into());
    }
    Ok(text.chars().skip(start).take(length).collect())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::engine::console::OutputRedirect;
    use crate::script::builtins::{ReferenceSet, EXCEPTION_TYPES, LIBRARY_TYPES};
    use crate::script::typeck::{Declarations, PriorSubmission};
    use crate::script::{compile_submission, CompileOptions};

    /// Minimal chain: compiled images, declarations and a flat global map.
    #[derive(Default)]
    struct Session {
        code: HashMap<u32, Arc<CompiledSubmission>>,
        declarations: Vec<(u32, Declarations)>,
        globals: HashMap<GlobalRef, Value>,
        limits: ExecutionLimits,
    }

    impl CodeLookup for Session {
        fn submission(&self, id: u32) -> Option<Arc<CompiledSubmission>> {
            self.code.get(&id).cloned()
        }
    }

    struct Globals<'a>(&'a mut HashMap<GlobalRef, Value>);

    impl GlobalStore for Globals<'_> {
        fn load(&self, global: GlobalRef) -> Option<Value> {
            self.0.get(&global).cloned()
        }

        fn store(&mut self, global: GlobalRef, value: Value) -> bool {
            match self.0.get_mut(&global) {
                Some(slot) => {
                    *slot = value;
                    true
                }
                None => false,
            }
        }
    }

    fn refs() -> ReferenceSet {
        let mut refs = ReferenceSet::new();
        for ty in LIBRARY_TYPES {
            refs = refs.with_type(*ty);
        }
        for ty in EXCEPTION_TYPES {
            refs = refs.with_exception_type(*ty);
        }
        refs.with_usings(["System", "System.Console", "System.Math"])
    }

    impl Session {
        fn submit(&mut self, src: &str) -> Result<Value, Trap> {
            let id = u32::try_from(self.code.len()).unwrap();
            let prior: Vec<PriorSubmission<'_>> = self
                .declarations
                .iter()
                .rev()
                .map(|(id, declarations)| PriorSubmission { id: *id, declarations })
                .collect();
            let output = compile_submission(src, id, &prior, &refs(), CompileOptions::default())
                .unwrap_or_else(|e| panic!("compile failed for {src:?}: {e:?}"));
            let image = Arc::new(output.submission);
            for (slot, ty) in image.globals.iter().enumerate() {
                let slot = u16::try_from(slot).unwrap();
                self.globals.insert(GlobalRef { submission: id, slot }, Value::default_for(*ty));
            }
            self.code.insert(id, Arc::clone(&image));
            self.declarations.push((id, output.declarations));
            let mut globals = std::mem::take(&mut self.globals);
            let result = run(image, &*self, &mut Globals(&mut globals), &self.limits);
            self.globals = globals;
            result
        }

        fn value(&mut self, src: &str) -> Value {
            self.submit(src).unwrap_or_else(|t| panic!("{src:?} trapped: {t:?}"))
        }

        fn fault(&mut self, src: &str) -> Fault {
            match self.submit(src) {
                Err(Trap::Thrown(fault)) => fault,
                other => panic!("expected a fault from {src:?}, got {other:?}"),
            }
        }
    }

    fn eval(src: &str) -> Value {
        Session::default().value(src)
    }

    fn assert_int(v: &Value, expected: i32) {
        match v {
            Value::Int(i) => assert_eq!(*i, expected),
            other => panic!("expected int {expected}, got {other:?}"),
        }
    }

    fn assert_double(v: &Value, expected: f64) {
        match v {
            Value::Double(d) => assert!((d - expected).abs() < 1e-9, "expected {expected}, got {d}"),
            other => panic!("expected double {expected}, got {other:?}"),
        }
    }

    fn assert_str(v: &Value, expected: &str) {
        match v {
            Value::Str(s) => assert_eq!(&**s, expected),
            other => panic!("expected string {expected:?}, got {other:?}"),
        }
    }

    // ── Expressions ──────────────────────────────────────────────

    #[test]
    fn arithmetic_basics() {
        assert_int(&eval("1 + 1"), 2);
        assert_int(&eval("7 / 2"), 3);
        assert_int(&eval("-7 % 3"), -1);
        assert_double(&eval("7 / 2.0"), 3.5);
        assert_double(&eval("2 ** 10"), 1024.0);
        assert_int(&eval("2147483647 + 1"), i32::MIN);
    }

    #[test]
    fn statements_produce_null() {
        assert!(eval("var x = 10;").is_null());
        assert!(eval("").is_null());
        assert!(eval("WriteLine(1)").is_null());
    }

    #[test]
    fn strings_and_members() {
        assert_str(&eval("\"a\" + 1 + true"), "a1True");
        assert_int(&eval("\"héllo\".Length"), 5);
        assert_str(&eval("\"  Hi \".Trim().ToUpper()"), "HI");
        assert_int(&eval("\"hello\".IndexOf(\"l\")"), 2);
        assert_str(&eval("\"hello\".Substring(1, 3)"), "ell");
        assert_str(&eval("\"a-b-c\".Replace(\"-\", \"+\")"), "a+b+c");
        assert_str(&eval("(2.5).ToString()"), "2.5");
    }

    #[test]
    fn short_circuit_skips_right_side() {
        let mut s = Session::default();
        s.value("var hits = 0; bool touch() { hits++; return true; }");
        s.value("var r = false && touch() || true || touch();");
        assert_int(&s.value("hits"), 0);
    }

    #[test]
    fn control_flow() {
        assert_int(&eval("var s = 0; for (int i = 1; i <= 10; i++) { if (i % 2 == 0) continue; s += i; } s"), 25);
        assert_int(&eval("var n = 0; while (true) { n++; if (n == 7) break; } n"), 7);
        assert_str(&eval("var k = 3; k > 2 ? \"big\" : \"small\""), "big");
    }

    #[test]
    fn increments() {
        assert_int(&eval("var i = 5; var a = i++; a * 10 + i"), 56);
        assert_int(&eval("var j = 5; var b = ++j; b * 10 + j"), 66);
        assert_double(&eval("var d = 1.5; d--; d"), 0.5);
    }

    #[test]
    fn conversions() {
        assert_int(&eval("(int)2.9"), 2);
        assert_int(&eval("Convert.ToInt32(2.5)"), 2);
        assert_int(&eval("Convert.ToInt32(3.5)"), 4);
        assert_int(&eval("Convert.ToInt32(\" 42 \")"), 42);
        assert_double(&eval("Round(2.5)"), 2.0);
        assert_int(&eval("Max(3, 9)"), 9);
        assert_double(&eval("Sqrt(16)"), 4.0);
    }

    // ── Functions and submissions ────────────────────────────────

    #[test]
    fn recursion() {
        assert_int(&eval("int fact(int n) => n <= 1 ? 1 : n * fact(n - 1);\nfact(10)"), 3_628_800);
    }

    #[test]
    fn globals_persist_across_submissions() {
        let mut s = Session::default();
        assert!(s.value("var x = 10;").is_null());
        assert_int(&s.value("x * 2"), 20);
        s.value("x = x + 5;");
        assert_int(&s.value("x"), 15);
    }

    #[test]
    fn functions_from_earlier_submissions() {
        let mut s = Session::default();
        s.value("var total = 0; void add(int n) { total += n; }");
        s.value("add(4); add(6);");
        assert_int(&s.value("total"), 10);
        s.value("int twice(int v) => v * 2;");
        assert_int(&s.value("twice(total)"), 20);
    }

    #[test]
    fn shadowing_reads_newest() {
        let mut s = Session::default();
        s.value("var x = 1;");
        s.value("string x = \"s\";");
        assert_str(&s.value("x"), "s");
    }

    // ── Faults ───────────────────────────────────────────────────

    #[test]
    fn thrown_exception_carries_trace() {
        let mut s = Session::default();
        s.value("void boom(string m)\n{\n    throw new Exception(m);\n}");
        let fault = s.fault("var y = 1;\nboom(\"bang\");");
        assert_eq!(fault.exception.type_name, "System.Exception");
        assert_eq!(fault.exception.message, "bang");
        assert_eq!(fault.trace, vec![
            TraceFrame { routine: "Submission#0.boom".into(), line: 3 },
            TraceFrame { routine: "Submission#1.<Main>".into(), line: 2 },
        ]);
    }

    #[test]
    fn runtime_faults() {
        let mut s = Session::default();
        s.value("var zero = 0;");
        assert_eq!(s.fault("1 / zero").exception.type_name, "System.DivideByZeroException");
        assert_eq!(s.fault("\"abc\".Substring(2, 5)").exception.type_name, "System.ArgumentOutOfRangeException");
        assert_eq!(s.fault("string n = null; n.Length").exception.type_name, "System.NullReferenceException");
        assert_eq!(s.fault("Convert.ToInt32(\"x1\")").exception.type_name, "System.FormatException");
        assert_eq!(s.fault("throw null;").exception.type_name, "System.NullReferenceException");
        let default = s.fault("throw new InvalidOperationException();").exception;
        assert_eq!(default.message, "Exception of type 'System.InvalidOperationException' was thrown.");
    }

    #[test]
    fn declarations_survive_faults() {
        let mut s = Session::default();
        s.fault("var x = 5; throw new Exception();");
        assert_int(&s.value("x"), 5);
    }

    #[test]
    fn limits_become_faults() {
        let mut s = Session {
            limits: ExecutionLimits { step_limit: Some(1_000), max_call_depth: 32 },
            ..Session::default()
        };
        let spin = s.fault("while (true) { }");
        assert_eq!(spin.exception.type_name, "System.ExecutionLimitExceededException");
        let deep = s.fault("int down(int n) => down(n + 1);\ndown(0)");
        assert_eq!(deep.exception.type_name, "System.StackOverflowException");
        assert_eq!(deep.trace.len(), 32);
    }

    #[test]
    fn write_line_goes_to_console() {
        let redirect = OutputRedirect::begin();
        eval("Write(\"a\"); WriteLine(1.5); WriteLine();");
        assert_eq!(redirect.finish(), "a1.5\n\n");
    }
}
