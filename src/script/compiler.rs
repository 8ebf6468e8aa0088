use std::collections::HashMap;

use super::ast::{BinOp, Span, TypeName, UnaryOp};
use super::builtins::Builtin;
use super::diagnostic::Diagnostic;
use super::typeck::{
    FunctionRef, GlobalRef, Place, TypedExpr, TypedExprKind, TypedFunction, TypedScript, TypedStmt,
    TypedStmtKind,
};
use super::value::{ConstKey, Value};

/// Name of the entry routine of every submission.
pub const ENTRY_ROUTINE: &str = "<Main>";

/// Executable image of one submission: an entry chunk, its functions, and a
/// shared constant pool.
#[derive(Debug, Clone)]
pub struct CompiledSubmission {
    pub id: u32,
    pub entry: Chunk,
    /// Indexed by `FunctionRef::index`.
    pub functions: Vec<Chunk>,
    pub constants: Vec<Value>,
    /// Types of the globals this submission declares, in slot order.
    pub globals: Vec<TypeName>,
}

impl CompiledSubmission {
    pub fn function(&self, index: u16) -> Option<&Chunk> {
        self.functions.get(usize::from(index))
    }
}

/// One routine's bytecode.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub name: String,
    pub ops: Vec<Op>,
    /// 1-based source line of each op, parallel to `ops`.
    pub lines: Vec<u32>,
    pub param_count: u16,
    /// Total local slots, parameters included.
    pub local_count: u16,
}

impl Chunk {
    pub fn line_at(&self, ip: usize) -> u32 {
        self.lines.get(ip).copied().unwrap_or(0)
    }
}

/// Bytecode operations for the stack-based VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    /// Push a constant from the constant pool.
    PushConst(u16),
    PushNull,
    /// Pop top of stack.
    Pop,
    /// Duplicate top of stack.
    Dup,
    /// Load a local variable onto the stack.
    LoadLocal(u16),
    /// Pop top of stack into a local variable slot.
    StoreLocal(u16),
    /// Load a submission global from the state store.
    LoadGlobal(GlobalRef),
    /// Pop top of stack into a submission global.
    StoreGlobal(GlobalRef),

    // Arithmetic; operands share a type (int or double)
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Neg,
    Pow,
    /// Pop two values, push their `ToString` renderings joined.
    Concat,

    // Comparison
    Lt,
    Gt,
    Le,
    Ge,
    Eq,
    Ne,
    Not,

    // Conversion
    IntToFloat,
    /// Truncating conversion, as a C-style cast.
    FloatToInt,

    // Control flow
    /// Pop condition; jump to absolute op index if false.
    JumpIfFalse(u32),
    /// Unconditional jump to absolute op index.
    Jump(u32),
    /// Call a user function; arguments are on the stack, the result replaces them.
    Call(FunctionRef),
    /// Library routine; pops its arguments and pushes its result unless it returns void.
    Builtin(Builtin),
    /// Pop the optional message, push a new exception of the named type.
    NewException { type_const: u16, has_message: bool },
    /// Pop an exception and raise it.
    Throw,
    /// Return top of stack to the caller.
    Return,
}

/// Lower a type-checked submission to bytecode. `source` supplies line numbers
/// for stack traces.
pub fn compile(typed: &TypedScript, source: &str) -> Result<CompiledSubmission, Diagnostic> {
    let mut compiler = Compiler::new(source);

    let mut functions = Vec::with_capacity(typed.functions.len());
    for f in &typed.functions {
        functions.push(compiler.compile_function(f)?);
    }

    compiler.compile_block(&typed.body)?;
    if !matches!(typed.body.last().map(|s| &s.kind), Some(TypedStmtKind::Result(_))) {
        compiler.emit(Op::PushNull);
    }
    compiler.emit(Op::Return);
    let entry = compiler.finish_chunk(ENTRY_ROUTINE, 0, typed.entry_locals);

    Ok(CompiledSubmission {
        id: typed.submission,
        entry,
        functions,
        constants: compiler.constants,
        globals: typed.declarations.global_types(),
    })
}

/// Jump sites awaiting a target inside the innermost loop.
#[derive(Default)]
struct LoopLabels {
    breaks: Vec<usize>,
    continues: Vec<usize>,
}

struct Compiler {
    ops: Vec<Op>,
    lines: Vec<u32>,
    constants: Vec<Value>,
    pooled: HashMap<ConstKey, u16>,
    loops: Vec<LoopLabels>,
    line_starts: Vec<usize>,
    current_line: u32,
}

impl Compiler {
    fn new(source: &str) -> Self {
        let line_starts = std::iter::once(0)
            .chain(source.match_indices('\n').map(|(i, _)| i + 1))
            .collect();
        Self {
            ops: Vec::new(),
            lines: Vec::new(),
            constants: Vec::new(),
            pooled: HashMap::new(),
            loops: Vec::new(),
            line_starts,
            current_line: 1,
        }
    }

    fn line_of(&self, span: Span) -> u32 {
        let line = match self.line_starts.binary_search(&span.start) {
            Ok(i) => i + 1,
            Err(i) => i,
        };
        u32::try_from(line).unwrap_or(u32::MAX)
    }

    fn emit(&mut self, op: Op) {
        self.ops.push(op);
        self.lines.push(self.current_line);
    }

    fn emit_const(&mut self, value: Value) -> Result<(), Diagnostic> {
        let idx = self.add_constant(value)?;
        self.emit(Op::PushConst(idx));
        Ok(())
    }

    fn add_constant(&mut self, value: Value) -> Result<u16, Diagnostic> {
        let key = value.constant_key();
        if let Some(&idx) = key.as_ref().and_then(|k| self.pooled.get(k)) {
            return Ok(idx);
        }
        let idx = u16::try_from(self.constants.len()).map_err(|_| too_many_constants())?;
        if let Some(key) = key {
            self.pooled.insert(key, idx);
        }
        self.constants.push(value);
        Ok(idx)
    }

    fn current_offset(&self) -> usize {
        self.ops.len()
    }

    fn jump_target(&self, offset: usize) -> Result<u32, Diagnostic> {
        u32::try_from(offset).map_err(|_| {
            Diagnostic::compiler("Bytecode too large (max 4294967295 ops)", Span::default())
        })
    }

    /// Emit a forward jump with a placeholder target; returns its index for patching.
    fn emit_jump(&mut self, op: Op) -> usize {
        let idx = self.current_offset();
        self.emit(op);
        idx
    }

    fn patch_jump(&mut self, idx: usize) -> Result<(), Diagnostic> {
        let target = self.jump_target(self.ops.len())?;
        self.patch_jump_to(idx, target);
        Ok(())
    }

    fn patch_jump_to(&mut self, idx: usize, target: u32) {
        if let Some(Op::JumpIfFalse(dest) | Op::Jump(dest)) = self.ops.get_mut(idx) {
            *dest = target;
        }
    }

    fn finish_chunk(&mut self, name: &str, param_count: u16, local_count: u16) -> Chunk {
        Chunk {
            name: name.to_string(),
            ops: std::mem::take(&mut self.ops),
            lines: std::mem::take(&mut self.lines),
            param_count,
            local_count,
        }
    }

    fn compile_function(&mut self, f: &TypedFunction) -> Result<Chunk, Diagnostic> {
        self.current_line = self.line_of(f.span);
        self.compile_block(&f.body)?;
        // Falling off the end is only reachable in void functions.
        self.emit(Op::PushNull);
        self.emit(Op::Return);
        Ok(self.finish_chunk(&f.name, f.param_count, f.local_count))
    }

    // ── Statements ────────────────────────────────────────────────

    fn compile_block(&mut self, stmts: &[TypedStmt]) -> Result<(), Diagnostic> {
        for stmt in stmts {
            self.compile_stmt(stmt)?;
        }
        Ok(())
    }

    fn compile_stmt(&mut self, stmt: &TypedStmt) -> Result<(), Diagnostic> {
        self.current_line = self.line_of(stmt.span);
        match &stmt.kind {
            TypedStmtKind::Init { place, value } => {
                self.compile_expr(value)?;
                self.emit_store(*place);
            }
            TypedStmtKind::Expr(expr) => {
                self.compile_expr(expr)?;
                if expr.ty != TypeName::Void {
                    self.emit(Op::Pop);
                }
            }
            TypedStmtKind::Result(expr) => {
                self.compile_expr(expr)?;
                if expr.ty == TypeName::Void {
                    self.emit(Op::PushNull);
                }
            }
            TypedStmtKind::If {
                condition,
                then_branch,
                else_branch,
            } => {
                self.compile_expr(condition)?;
                let else_jump = self.emit_jump(Op::JumpIfFalse(0));
                self.compile_block(then_branch)?;
                if else_branch.is_empty() {
                    self.patch_jump(else_jump)?;
                } else {
                    let end_jump = self.emit_jump(Op::Jump(0));
                    self.patch_jump(else_jump)?;
                    self.compile_block(else_branch)?;
                    self.patch_jump(end_jump)?;
                }
            }
            TypedStmtKind::While { condition, body } => {
                let start = self.jump_target(self.current_offset())?;
                self.compile_expr(condition)?;
                let exit = self.emit_jump(Op::JumpIfFalse(0));
                self.loops.push(LoopLabels::default());
                self.compile_block(body)?;
                self.emit(Op::Jump(start));
                self.patch_jump(exit)?;
                self.close_loop(start)?;
            }
            TypedStmtKind::For {
                init,
                condition,
                step,
                body,
            } => {
                self.compile_block(init)?;
                let start = self.jump_target(self.current_offset())?;
                let exit = match condition {
                    Some(c) => {
                        self.compile_expr(c)?;
                        Some(self.emit_jump(Op::JumpIfFalse(0)))
                    }
                    None => None,
                };
                self.loops.push(LoopLabels::default());
                self.compile_block(body)?;
                let step_start = self.jump_target(self.current_offset())?;
                for e in step {
                    self.compile_expr(e)?;
                    if e.ty != TypeName::Void {
                        self.emit(Op::Pop);
                    }
                }
                self.emit(Op::Jump(start));
                if let Some(exit) = exit {
                    self.patch_jump(exit)?;
                }
                self.close_loop(step_start)?;
            }
            TypedStmtKind::Block(stmts) => self.compile_block(stmts)?,
            TypedStmtKind::Return(value) => {
                match value {
                    Some(v) => self.compile_expr(v)?,
                    None => self.emit(Op::PushNull),
                }
                self.emit(Op::Return);
            }
            TypedStmtKind::Break => {
                let idx = self.emit_jump(Op::Jump(0));
                self.innermost_loop(stmt.span)?.breaks.push(idx);
            }
            TypedStmtKind::Continue => {
                let idx = self.emit_jump(Op::Jump(0));
                self.innermost_loop(stmt.span)?.continues.push(idx);
            }
            TypedStmtKind::Throw(value) => {
                self.compile_expr(value)?;
                self.emit(Op::Throw);
            }
        }
        Ok(())
    }

    fn innermost_loop(&mut self, span: Span) -> Result<&mut LoopLabels, Diagnostic> {
        self.loops
            .last_mut()
            .ok_or_else(|| Diagnostic::compiler("break or continue outside of a loop", span))
    }

    /// Pop the innermost loop: breaks go to the current offset, continues to `continue_target`.
    fn close_loop(&mut self, continue_target: u32) -> Result<(), Diagnostic> {
        let labels = self.loops.pop().unwrap_or_default();
        for idx in labels.breaks {
            self.patch_jump(idx)?;
        }
        for idx in labels.continues {
            self.patch_jump_to(idx, continue_target);
        }
        Ok(())
    }

    // ── Expressions ───────────────────────────────────────────────

    fn emit_load(&mut self, place: Place) {
        self.emit(match place {
            Place::Local(idx) => Op::LoadLocal(idx),
            Place::Global(g) => Op::LoadGlobal(g),
        });
    }

    fn emit_store(&mut self, place: Place) {
        self.emit(match place {
            Place::Local(idx) => Op::StoreLocal(idx),
            Place::Global(g) => Op::StoreGlobal(g),
        });
    }

    fn compile_expr(&mut self, expr: &TypedExpr) -> Result<(), Diagnostic> {
        match &expr.kind {
            TypedExprKind::IntLit(v) => self.emit_const(Value::Int(*v))?,
            TypedExprKind::FloatLit(v) => self.emit_const(Value::Double(*v))?,
            TypedExprKind::StringLit(s) => self.emit_const(Value::str(s.as_str()))?,
            TypedExprKind::BoolLit(b) => self.emit_const(Value::Bool(*b))?,
            TypedExprKind::Null => self.emit(Op::PushNull),
            TypedExprKind::Load(place) => self.emit_load(*place),
            TypedExprKind::Assign { place, value } => {
                self.compile_expr(value)?;
                self.emit(Op::Dup);
                self.emit_store(*place);
            }
            TypedExprKind::IncDec {
                place,
                increment,
                prefix,
            } => {
                let one = if expr.ty == TypeName::Double {
                    Value::Double(1.0)
                } else {
                    Value::Int(1)
                };
                let op = if *increment { Op::Add } else { Op::Sub };
                self.emit_load(*place);
                if *prefix {
                    self.emit_const(one)?;
                    self.emit(op);
                    self.emit(Op::Dup);
                } else {
                    self.emit(Op::Dup);
                    self.emit_const(one)?;
                    self.emit(op);
                }
                self.emit_store(*place);
            }
            TypedExprKind::BinOp { op, left, right } => {
                let op = match op {
                    BinOp::And => return self.compile_logical(true, left, right),
                    BinOp::Or => return self.compile_logical(false, left, right),
                    BinOp::Add => Op::Add,
                    BinOp::Sub => Op::Sub,
                    BinOp::Mul => Op::Mul,
                    BinOp::Div => Op::Div,
                    BinOp::Mod => Op::Rem,
                    BinOp::Pow => Op::Pow,
                    BinOp::Lt => Op::Lt,
                    BinOp::Gt => Op::Gt,
                    BinOp::Le => Op::Le,
                    BinOp::Ge => Op::Ge,
                    BinOp::Eq => Op::Eq,
                    BinOp::Ne => Op::Ne,
                };
                self.compile_expr(left)?;
                self.compile_expr(right)?;
                self.emit(op);
            }
            TypedExprKind::Concat { left, right } => {
                self.compile_expr(left)?;
                self.compile_expr(right)?;
                self.emit(Op::Concat);
            }
            TypedExprKind::UnaryOp { op, operand } => {
                self.compile_expr(operand)?;
                self.emit(match op {
                    UnaryOp::Neg => Op::Neg,
                    UnaryOp::Not => Op::Not,
                });
            }
            TypedExprKind::Conditional {
                condition,
                then_expr,
                else_expr,
            } => {
                self.compile_expr(condition)?;
                let else_jump = self.emit_jump(Op::JumpIfFalse(0));
                self.compile_expr(then_expr)?;
                let end_jump = self.emit_jump(Op::Jump(0));
                self.patch_jump(else_jump)?;
                self.compile_expr(else_expr)?;
                self.patch_jump(end_jump)?;
            }
            TypedExprKind::Call { function, args } => {
                for arg in args {
                    self.compile_expr(arg)?;
                }
                self.emit(Op::Call(*function));
                // Every routine returns a value; void results are dropped here.
                if expr.ty == TypeName::Void {
                    self.emit(Op::Pop);
                }
            }
            TypedExprKind::Builtin { op, args } => {
                for arg in args {
                    self.compile_expr(arg)?;
                }
                self.emit(Op::Builtin(*op));
            }
            TypedExprKind::NewException { type_name, message } => {
                let type_const = self.add_constant(Value::str(type_name.as_str()))?;
                if let Some(m) = message {
                    self.compile_expr(m)?;
                }
                self.emit(Op::NewException {
                    type_const,
                    has_message: message.is_some(),
                });
            }
            TypedExprKind::IntToFloat(inner) => {
                self.compile_expr(inner)?;
                self.emit(Op::IntToFloat);
            }
            TypedExprKind::FloatToInt(inner) => {
                self.compile_expr(inner)?;
                self.emit(Op::FloatToInt);
            }
        }
        Ok(())
    }
}

impl Compiler {
    /// `a && b` and `a || b`, evaluating `b` only when it decides the result.
    fn compile_logical(&mut self, is_and: bool, left: &TypedExpr, right: &TypedExpr) -> Result<(), Diagnostic> {
        self.compile_expr(left)?;
        let branch = self.emit_jump(Op::JumpIfFalse(0));
        if is_and {
            self.compile_expr(right)?;
            let end = self.emit_jump(Op::Jump(0));
            self.patch_jump(branch)?;
            self.emit_const(Value::Bool(false))?;
            self.patch_jump(end)
        } else {
            self.emit_const(Value::Bool(true))?;
            let end = self.emit_jump(Op::Jump(0));
            self.patch_jump(branch)?;
            self.compile_expr(right)?;
            self.patch_jump(end)
        }
    }
}

fn too_many_constants() -> Diagnostic {
    Diagnostic::compiler("Too many constants (max 65535)", Span::default())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::script::builtins::{ReferenceSet, EXCEPTION_TYPES, LIBRARY_TYPES};
    use crate::script::lexer::lex;
    use crate::script::parser::{parse, ParseOptions};
    use crate::script::typeck::type_check;

    fn compile_src(src: &str) -> CompiledSubmission {
        let mut refs = ReferenceSet::new().with_usings(["System", "System.Console"]);
        for ty in LIBRARY_TYPES {
            refs = refs.with_type(*ty);
        }
        for ty in EXCEPTION_TYPES {
            refs = refs.with_exception_type(*ty);
        }
        let tokens = lex(src).unwrap();
        let script = parse(tokens, ParseOptions::default()).unwrap();
        let typed = type_check(&script, 3, &[], &refs).unwrap();
        compile(&typed, src).unwrap()
    }

    #[test]
    fn trailing_expression_is_returned() {
        let compiled = compile_src("1 + 1");
        assert_eq!(compiled.id, 3);
        assert_eq!(compiled.entry.name, ENTRY_ROUTINE);
        assert_eq!(compiled.entry.ops.last(), Some(&Op::Return));
        assert!(compiled.entry.ops.contains(&Op::Add));
        assert!(!compiled.entry.ops.contains(&Op::PushNull));
    }

    #[test]
    fn statements_return_null() {
        let compiled = compile_src("var x = 10;");
        let ops = &compiled.entry.ops;
        assert_eq!(&ops[ops.len() - 2..], &[Op::PushNull, Op::Return]);
        assert!(ops.contains(&Op::StoreGlobal(GlobalRef { submission: 3, slot: 0 })));
        assert_eq!(compiled.globals, vec![TypeName::Int]);
    }

    #[test]
    fn constant_dedup() {
        let compiled = compile_src("var a = 2; var b = 2; var c = \"2\";");
        let twos = compiled.constants.iter().filter(|c| matches!(c, Value::Int(2))).count();
        assert_eq!(twos, 1, "Duplicate constants should be deduplicated");
        assert_eq!(compiled.constants.len(), 2);
    }

    #[test]
    fn functions_get_their_own_chunks() {
        let compiled = compile_src("int sq(int v) => v * v;\nsq(3)");
        assert_eq!(compiled.functions.len(), 1);
        let f = compiled.function(0).unwrap();
        assert_eq!(f.name, "sq");
        assert_eq!(f.param_count, 1);
        assert!(f.ops.contains(&Op::LoadLocal(0)));
        assert!(compiled
            .entry
            .ops
            .contains(&Op::Call(FunctionRef { submission: 3, index: 0 })));
    }

    #[test]
    fn void_call_result_is_dropped() {
        let compiled = compile_src("void hi() { WriteLine(\"hi\"); }\nhi();");
        let entry = &compiled.entry.ops;
        let call = entry.iter().position(|op| matches!(op, Op::Call(_))).unwrap();
        assert_eq!(entry[call + 1], Op::Pop);
        // Builtin void routines push nothing
        let f = &compiled.functions[0].ops;
        let write = f.iter().position(|op| *op == Op::Builtin(Builtin::WriteLine)).unwrap();
        assert_eq!(f[write + 1], Op::PushNull);
    }

    #[test]
    fn loops_patch_break_and_continue() {
        let compiled = compile_src("for (int i = 0; i < 10; i++) { if (i == 2) continue; if (i == 5) break; }");
        let ops = &compiled.entry.ops;
        let len = u32::try_from(ops.len()).unwrap();
        for op in ops {
            if let Op::Jump(t) | Op::JumpIfFalse(t) = op {
                assert!(*t < len, "jump target {t} out of range");
                assert_ne!(*t, 0, "unpatched jump");
            }
        }
    }

    #[test]
    fn short_circuit_uses_jumps() {
        let compiled = compile_src("var a = true; var b = a && false || a;");
        let jumps = compiled.entry.ops.iter().filter(|op| matches!(op, Op::JumpIfFalse(_))).count();
        assert_eq!(jumps, 2);
        assert!(!compiled.entry.ops.contains(&Op::Ne));
    }

    #[test]
    fn lines_follow_statements() {
        let compiled = compile_src("var a = 1;\n\nthrow new Exception(\"x\");");
        let throw = compiled.entry.ops.iter().position(|op| *op == Op::Throw).unwrap();
        assert_eq!(compiled.entry.line_at(throw), 3);
        assert_eq!(compiled.entry.line_at(0), 1);
        assert_eq!(compiled.entry.lines.len(), compiled.entry.ops.len());
    }
}
