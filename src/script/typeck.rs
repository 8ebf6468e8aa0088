use std::collections::HashMap;

use indexmap::IndexMap;
use serde::Serialize;

use super::ast::*;
use super::builtins::{self, Builtin, BuiltinFn, ParamTy, ReferenceSet, Ret};
use super::diagnostic::{Diagnostic, DiagnosticKind};

/// Address of a submission global: the declaring submission and its slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct GlobalRef {
    pub submission: u32,
    pub slot: u16,
}

/// Address of a user function: the declaring submission and its index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct FunctionRef {
    pub submission: u32,
    pub index: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlobalDecl {
    pub ty: TypeName,
    pub slot: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionSig {
    pub params: Vec<TypeName>,
    pub ret: TypeName,
    pub index: u16,
}

/// Names a submission introduced, in declaration order.
#[derive(Debug, Clone, Default)]
pub struct Declarations {
    pub globals: IndexMap<String, GlobalDecl>,
    pub functions: IndexMap<String, FunctionSig>,
}

impl Declarations {
    /// Slot types in slot order; the state store installs defaults from these.
    pub fn global_types(&self) -> Vec<TypeName> {
        self.globals.values().map(|g| g.ty).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.globals.is_empty() && self.functions.is_empty()
    }
}

/// A previously accepted submission whose declarations are in scope.
#[derive(Debug, Clone, Copy)]
pub struct PriorSubmission<'a> {
    pub id: u32,
    pub declarations: &'a Declarations,
}

/// Result of type checking one submission.
#[derive(Debug, Clone)]
pub struct TypedScript {
    pub submission: u32,
    pub declarations: Declarations,
    /// Indexed by `FunctionSig::index`.
    pub functions: Vec<TypedFunction>,
    pub body: Vec<TypedStmt>,
    pub entry_locals: u16,
    /// Non-error diagnostics (warnings and info), in emission order.
    pub diagnostics: Vec<Diagnostic>,
}

#[derive(Debug, Clone)]
pub struct TypedFunction {
    pub name: String,
    pub param_count: u16,
    pub ret: TypeName,
    pub body: Vec<TypedStmt>,
    pub local_count: u16,
    pub span: Span,
}

/// Where a variable lives at run time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Place {
    Local(u16),
    Global(GlobalRef),
}

#[derive(Debug, Clone)]
pub struct TypedStmt {
    pub kind: TypedStmtKind,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub enum TypedStmtKind {
    /// Store an initial value into a freshly declared variable.
    Init { place: Place, value: TypedExpr },
    /// Expression evaluated for effect; any value is discarded.
    Expr(TypedExpr),
    /// Trailing expression whose value is the submission's result.
    Result(TypedExpr),
    If {
        condition: TypedExpr,
        then_branch: Vec<TypedStmt>,
        else_branch: Vec<TypedStmt>,
    },
    While {
        condition: TypedExpr,
        body: Vec<TypedStmt>,
    },
    For {
        init: Vec<TypedStmt>,
        condition: Option<TypedExpr>,
        step: Vec<TypedExpr>,
        body: Vec<TypedStmt>,
    },
    Block(Vec<TypedStmt>),
    Return(Option<TypedExpr>),
    Break,
    Continue,
    Throw(TypedExpr),
}

#[derive(Debug, Clone)]
pub struct TypedExpr {
    pub kind: TypedExprKind,
    pub ty: TypeName,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub enum TypedExprKind {
    IntLit(i32),
    FloatLit(f64),
    StringLit(String),
    BoolLit(bool),
    Null,
    Load(Place),
    Assign {
        place: Place,
        value: Box<TypedExpr>,
    },
    IncDec {
        place: Place,
        increment: bool,
        prefix: bool,
    },
    /// Arithmetic, comparison, equality and logical operators on operands
    /// already converted to a common type. `And`/`Or` short-circuit.
    BinOp {
        op: BinOp,
        left: Box<TypedExpr>,
        right: Box<TypedExpr>,
    },
    /// String `+`: both operands rendered with `ToString` semantics.
    Concat {
        left: Box<TypedExpr>,
        right: Box<TypedExpr>,
    },
    UnaryOp {
        op: UnaryOp,
        operand: Box<TypedExpr>,
    },
    Conditional {
        condition: Box<TypedExpr>,
        then_expr: Box<TypedExpr>,
        else_expr: Box<TypedExpr>,
    },
    Call {
        function: FunctionRef,
        args: Vec<TypedExpr>,
    },
    /// Library call; instance members take the receiver as first argument.
    Builtin {
        op: Builtin,
        args: Vec<TypedExpr>,
    },
    NewException {
        type_name: String,
        message: Option<Box<TypedExpr>>,
    },
    IntToFloat(Box<TypedExpr>),
    FloatToInt(Box<TypedExpr>),
}

pub fn type_check(
    script: &Script,
    submission: u32,
    prior: &[PriorSubmission<'_>],
    refs: &ReferenceSet,
) -> Result<TypedScript, Vec<Diagnostic>> {
    let mut ctx = TypeContext::new(submission, prior, refs);
    ctx.check(script)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Routine {
    TopLevel,
    Function(TypeName),
}

struct TypeContext<'a> {
    submission: u32,
    /// Earlier submissions, newest first.
    prior: &'a [PriorSubmission<'a>],
    refs: &'a ReferenceSet,
    declarations: Declarations,
    /// Routine-local scopes. Empty at the top level of a submission, where
    /// declarations become globals.
    scopes: Vec<HashMap<String, (TypeName, u16)>>,
    next_local: u16,
    routine: Routine,
    loop_depth: u32,
    diagnostics: Vec<Diagnostic>,
}

impl<'a> TypeContext<'a> {
    fn new(submission: u32, prior: &'a [PriorSubmission<'a>], refs: &'a ReferenceSet) -> Self {
        Self {
            submission,
            prior,
            refs,
            declarations: Declarations::default(),
            scopes: Vec::new(),
            next_local: 0,
            routine: Routine::TopLevel,
            loop_depth: 0,
            diagnostics: Vec::new(),
        }
    }

    fn check(&mut self, script: &Script) -> Result<TypedScript, Vec<Diagnostic>> {
        // Hoist function signatures so any statement or function can call them.
        for item in &script.items {
            if let Item::Function(f) = item {
                if let Err(e) = self.declare_function(f) {
                    self.report(e);
                }
            }
        }

        // Top-level statements, in order. Globals become visible as declared.
        let stmts: Vec<&Stmt> = script
            .items
            .iter()
            .filter_map(|item| match item {
                Item::Stmt(s) => Some(s),
                Item::Function(_) => None,
            })
            .collect();
        let body = self.check_stmt_list(&stmts);
        let entry_locals = self.next_local;

        // Function bodies see every global of this submission.
        let mut functions = Vec::new();
        for item in &script.items {
            if let Item::Function(f) = item {
                if self.declarations.functions.get(&f.name).is_some_and(|sig| usize::from(sig.index) == functions.len()) {
                    functions.push(self.check_function(f));
                }
            }
        }

        if self.diagnostics.iter().any(Diagnostic::is_error) {
            return Err(std::mem::take(&mut self.diagnostics));
        }
        Ok(TypedScript {
            submission: self.submission,
            declarations: std::mem::take(&mut self.declarations),
            functions,
            body,
            entry_locals,
            diagnostics: std::mem::take(&mut self.diagnostics),
        })
    }

    /// Capacity limits are reported once per submission, at the first
    /// declaration past the limit.
    fn report(&mut self, e: Diagnostic) {
        let repeated = e.kind == DiagnosticKind::Compiler
            && self
                .diagnostics
                .iter()
                .any(|d| d.kind == DiagnosticKind::Compiler && d.message == e.message);
        if !repeated {
            self.diagnostics.push(e);
        }
    }

    // ── Declarations ──────────────────────────────────────────────

    fn declare_function(&mut self, f: &FnDef) -> Result<(), Diagnostic> {
        if self.declarations.functions.contains_key(&f.name) {
            return Err(Diagnostic::type_error(
                format!("A function named '{}' is already defined in this submission", f.name),
                f.span,
            ));
        }
        let index = u16::try_from(self.declarations.functions.len()).map_err(|_| {
            Diagnostic::compiler("Too many functions in one submission (max 65535)", f.span)
        })?;
        self.note_hidden(&f.name, f.span);
        self.declarations.functions.insert(
            f.name.clone(),
            FunctionSig {
                params: f.params.iter().map(|p| p.ty).collect(),
                ret: f.return_type,
                index,
            },
        );
        Ok(())
    }

    fn declare_global(&mut self, name: &str, ty: TypeName, span: Span) -> Result<Place, Diagnostic> {
        if self.declarations.globals.contains_key(name) || self.declarations.functions.contains_key(name) {
            return Err(Diagnostic::type_error(
                format!("A variable named '{name}' is already defined in this submission"),
                span,
            ));
        }
        let slot = u16::try_from(self.declarations.globals.len()).map_err(|_| {
            Diagnostic::compiler("Too many variables in one submission (max 65535)", span)
        })?;
        self.note_hidden(name, span);
        self.declarations
            .globals
            .insert(name.to_string(), GlobalDecl { ty, slot });
        Ok(Place::Global(GlobalRef {
            submission: self.submission,
            slot,
        }))
    }

    fn declare_local(&mut self, name: &str, ty: TypeName, span: Span) -> Result<Place, Diagnostic> {
        if self.scopes.iter().any(|scope| scope.contains_key(name)) {
            return Err(Diagnostic::type_error(
                format!("A local variable named '{name}' is already defined in this scope"),
                span,
            ));
        }
        let idx = self.next_local;
        self.next_local = idx.checked_add(1).ok_or_else(|| {
            Diagnostic::compiler("Too many local variables (max 65535)", span)
        })?;
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(name.to_string(), (ty, idx));
        }
        Ok(Place::Local(idx))
    }

    /// Info diagnostic when a new declaration hides one from an earlier submission.
    fn note_hidden(&mut self, name: &str, span: Span) {
        let hidden = self.prior.iter().find(|p| {
            p.declarations.globals.contains_key(name) || p.declarations.functions.contains_key(name)
        });
        if let Some(p) = hidden {
            self.diagnostics.push(Diagnostic::info(
                format!("'{name}' hides the declaration from Submission#{}", p.id),
                span,
            ));
        }
    }

    // ── Name resolution ───────────────────────────────────────────

    fn resolve_variable(&self, name: &str) -> Option<(Place, TypeName)> {
        for scope in self.scopes.iter().rev() {
            if let Some((ty, idx)) = scope.get(name) {
                return Some((Place::Local(*idx), *ty));
            }
        }
        if let Some(g) = self.declarations.globals.get(name) {
            return Some((
                Place::Global(GlobalRef {
                    submission: self.submission,
                    slot: g.slot,
                }),
                g.ty,
            ));
        }
        for p in self.prior {
            if let Some(g) = p.declarations.globals.get(name) {
                return Some((
                    Place::Global(GlobalRef {
                        submission: p.id,
                        slot: g.slot,
                    }),
                    g.ty,
                ));
            }
        }
        None
    }

    fn resolve_function(&self, name: &str) -> Option<(FunctionRef, &FunctionSig)> {
        if let Some(sig) = self.declarations.functions.get(name) {
            return Some((
                FunctionRef {
                    submission: self.submission,
                    index: sig.index,
                },
                sig,
            ));
        }
        self.prior.iter().find_map(|p| {
            p.declarations.functions.get(name).map(|sig| {
                (
                    FunctionRef {
                        submission: p.id,
                        index: sig.index,
                    },
                    sig,
                )
            })
        })
    }

    /// If `expr` names a library type (`Math`, `System.Console`), return its
    /// full name. A path whose root is a variable is never a type.
    fn static_owner(&self, expr: &Expr) -> Option<&'a str> {
        let path = dotted_path(expr)?;
        let root = path.split('.').next().unwrap_or(&path);
        if self.resolve_variable(root).is_some() {
            return None;
        }
        self.refs.resolve_type(&path)
    }

    fn resolve_place(&self, target: &Expr) -> Result<(Place, TypeName), Diagnostic> {
        match &target.kind {
            ExprKind::Ident(name) => self.resolve_variable(name).ok_or_else(|| {
                Diagnostic::type_error(
                    format!("The name '{name}' does not exist in the current context"),
                    target.span,
                )
            }),
            _ => Err(Diagnostic::type_error(
                "The left-hand side of an assignment must be a variable",
                target.span,
            )),
        }
    }

    // ── Statements ────────────────────────────────────────────────

    /// Check statements in order, collecting errors per statement and
    /// warning once on the first statement after control has left the list.
    fn check_stmt_list(&mut self, stmts: &[&Stmt]) -> Vec<TypedStmt> {
        let mut typed: Vec<TypedStmt> = Vec::new();
        let mut reported_unreachable = false;
        for stmt in stmts {
            if !reported_unreachable
                && !matches!(stmt, Stmt::Empty(_))
                && typed.last().is_some_and(|last| !completes_normally(last))
            {
                self.diagnostics
                    .push(Diagnostic::warning("Unreachable code detected", stmt.span()));
                reported_unreachable = true;
            }
            match self.check_stmt(stmt) {
                Ok(ts) => typed.push(ts),
                Err(e) => self.report(e),
            }
        }
        typed
    }

    fn check_block(&mut self, stmts: &[Stmt]) -> Vec<TypedStmt> {
        self.scopes.push(HashMap::new());
        let refs: Vec<&Stmt> = stmts.iter().collect();
        let typed = self.check_stmt_list(&refs);
        self.scopes.pop();
        typed
    }

    /// Body of `if`/`while`/`for`, always in its own scope.
    fn check_embedded(&mut self, stmt: &Stmt) -> Vec<TypedStmt> {
        match stmt {
            Stmt::Block { stmts, .. } => self.check_block(stmts),
            other => self.check_block(std::slice::from_ref(other)),
        }
    }

    fn check_loop_body(&mut self, stmt: &Stmt) -> Vec<TypedStmt> {
        self.loop_depth += 1;
        let body = self.check_embedded(stmt);
        self.loop_depth -= 1;
        body
    }

    fn check_stmt(&mut self, stmt: &Stmt) -> Result<TypedStmt, Diagnostic> {
        let span = stmt.span();
        let kind = match stmt {
            Stmt::Let { name, ty, value, span } => self.check_let(name, *ty, value.as_ref(), *span)?,
            Stmt::Expr { expr, terminated: true } => {
                let typed = self.check_expr(expr)?;
                if is_pure_value(&typed) {
                    self.diagnostics.push(Diagnostic::warning(
                        "The result of the expression is never used",
                        expr.span,
                    ));
                }
                TypedStmtKind::Expr(typed)
            }
            Stmt::Expr { expr, terminated: false } => TypedStmtKind::Result(self.check_expr(expr)?),
            Stmt::If {
                condition,
                then_branch,
                else_branch,
                ..
            } => {
                let condition = self.check_condition(condition)?;
                let then_branch = self.check_embedded(then_branch);
                let else_branch = else_branch
                    .as_deref()
                    .map(|s| self.check_embedded(s))
                    .unwrap_or_default();
                TypedStmtKind::If {
                    condition,
                    then_branch,
                    else_branch,
                }
            }
            Stmt::While { condition, body, .. } => {
                let condition = self.check_condition(condition)?;
                let body = self.check_loop_body(body);
                TypedStmtKind::While { condition, body }
            }
            Stmt::For {
                init,
                condition,
                step,
                body,
                ..
            } => {
                self.scopes.push(HashMap::new());
                let result = self.check_for(init.as_deref(), condition.as_ref(), step, body);
                self.scopes.pop();
                result?
            }
            Stmt::Block { stmts, .. } => TypedStmtKind::Block(self.check_block(stmts)),
            Stmt::Return { value, span } => self.check_return(value.as_ref(), *span)?,
            Stmt::Break(span) | Stmt::Continue(span) => {
                if self.loop_depth == 0 {
                    return Err(Diagnostic::type_error(
                        "No enclosing loop out of which to break or continue",
                        *span,
                    ));
                }
                if matches!(stmt, Stmt::Break(_)) {
                    TypedStmtKind::Break
                } else {
                    TypedStmtKind::Continue
                }
            }
            Stmt::Throw { value, .. } => {
                let typed = self.check_expr(value)?;
                if !matches!(typed.ty, TypeName::Exception | TypeName::Null) {
                    return Err(Diagnostic::type_error(
                        format!("The type thrown must be an exception, not '{}'", typed.ty),
                        value.span,
                    ));
                }
                TypedStmtKind::Throw(typed)
            }
            Stmt::Empty(_) => TypedStmtKind::Block(Vec::new()),
        };
        Ok(TypedStmt { kind, span })
    }

    fn check_let(
        &mut self,
        name: &str,
        ty: Option<TypeName>,
        value: Option<&Expr>,
        span: Span,
    ) -> Result<TypedStmtKind, Diagnostic> {
        let (ty, value) = match (ty, value) {
            (None, None) => {
                return Err(Diagnostic::type_error(
                    "Implicitly-typed variables must be initialized",
                    span,
                ))
            }
            (None, Some(expr)) => {
                let typed = self.check_value(expr)?;
                if typed.ty == TypeName::Null {
                    return Err(Diagnostic::type_error(
                        "Cannot assign <null> to an implicitly-typed variable",
                        expr.span,
                    ));
                }
                (typed.ty, Some(typed))
            }
            (Some(ty), Some(expr)) => {
                let typed = self.check_expr(expr)?;
                (ty, Some(coerce(typed, ty)?))
            }
            (Some(ty), None) => (ty, None),
        };

        if self.scopes.is_empty() {
            let place = self.declare_global(name, ty, span)?;
            // Globals start at their type's default; nothing to emit.
            Ok(match value {
                Some(value) => TypedStmtKind::Init { place, value },
                None => TypedStmtKind::Block(Vec::new()),
            })
        } else {
            let place = self.declare_local(name, ty, span)?;
            let value = value.unwrap_or_else(|| default_expr(ty, span));
            Ok(TypedStmtKind::Init { place, value })
        }
    }

    fn check_for(
        &mut self,
        init: Option<&Stmt>,
        condition: Option<&Expr>,
        step: &[Expr],
        body: &Stmt,
    ) -> Result<TypedStmtKind, Diagnostic> {
        let init = match init {
            Some(s) => vec![self.check_stmt(s)?],
            None => Vec::new(),
        };
        let condition = condition.map(|c| self.check_condition(c)).transpose()?;
        let step = step
            .iter()
            .map(|e| self.check_expr(e))
            .collect::<Result<Vec<_>, _>>()?;
        let body = self.check_loop_body(body);
        Ok(TypedStmtKind::For {
            init,
            condition,
            step,
            body,
        })
    }

    fn check_return(&mut self, value: Option<&Expr>, span: Span) -> Result<TypedStmtKind, Diagnostic> {
        let Routine::Function(ret) = self.routine else {
            return Err(Diagnostic::type_error(
                "A return statement is only allowed inside a function",
                span,
            ));
        };
        match (ret, value) {
            (TypeName::Void, None) => Ok(TypedStmtKind::Return(None)),
            (TypeName::Void, Some(expr)) => Err(Diagnostic::type_error(
                "A function returning void cannot return a value",
                expr.span,
            )),
            (ret, None) => Err(Diagnostic::type_error(
                format!("A value of type '{ret}' must be returned"),
                span,
            )),
            (ret, Some(expr)) => {
                let typed = self.check_expr(expr)?;
                Ok(TypedStmtKind::Return(Some(coerce(typed, ret)?)))
            }
        }
    }

    fn check_function(&mut self, f: &FnDef) -> TypedFunction {
        let saved_next = self.next_local;
        let saved_routine = self.routine;
        let saved_loops = self.loop_depth;
        self.next_local = 0;
        self.routine = Routine::Function(f.return_type);
        self.loop_depth = 0;

        self.scopes.push(HashMap::new());
        for p in &f.params {
            if let Err(e) = self.declare_local(&p.name, p.ty, p.span) {
                self.report(e);
            }
        }
        let param_count = self.next_local;
        let refs: Vec<&Stmt> = f.body.iter().collect();
        let body = self.check_stmt_list(&refs);
        self.scopes.pop();

        if f.return_type != TypeName::Void && list_completes_normally(&body) {
            self.diagnostics.push(Diagnostic::type_error(
                format!("'{}': not all code paths return a value", f.name),
                f.span,
            ));
        }

        let local_count = self.next_local;
        self.next_local = saved_next;
        self.routine = saved_routine;
        self.loop_depth = saved_loops;

        TypedFunction {
            name: f.name.clone(),
            param_count,
            ret: f.return_type,
            body,
            local_count,
            span: f.span,
        }
    }

    // ── Expressions ───────────────────────────────────────────────

    fn check_condition(&mut self, expr: &Expr) -> Result<TypedExpr, Diagnostic> {
        let typed = self.check_expr(expr)?;
        coerce(typed, TypeName::Bool)
    }

    /// Check an expression that must produce a value (not `void`).
    fn check_value(&mut self, expr: &Expr) -> Result<TypedExpr, Diagnostic> {
        let typed = self.check_expr(expr)?;
        require_value(typed)
    }

    fn check_expr(&mut self, expr: &Expr) -> Result<TypedExpr, Diagnostic> {
        let span = expr.span;
        match &expr.kind {
            ExprKind::IntLit(v) => Ok(typed(TypedExprKind::IntLit(*v), TypeName::Int, span)),
            ExprKind::FloatLit(v) => Ok(typed(TypedExprKind::FloatLit(*v), TypeName::Double, span)),
            ExprKind::StringLit(s) => Ok(typed(TypedExprKind::StringLit(s.clone()), TypeName::String, span)),
            ExprKind::BoolLit(b) => Ok(typed(TypedExprKind::BoolLit(*b), TypeName::Bool, span)),
            ExprKind::Null => Ok(typed(TypedExprKind::Null, TypeName::Null, span)),
            ExprKind::Ident(name) => self.check_ident(name, span),

            ExprKind::BinOp { op, left, right } => {
                let left = self.check_value(left)?;
                let right = self.check_value(right)?;
                check_binop(*op, left, right, span)
            }

            ExprKind::UnaryOp { op, operand } => {
                let operand = self.check_value(operand)?;
                let ok = match op {
                    UnaryOp::Neg => operand.ty.is_numeric(),
                    UnaryOp::Not => operand.ty == TypeName::Bool,
                };
                if !ok {
                    return Err(Diagnostic::type_error(
                        format!(
                            "Operator '{}' cannot be applied to operand of type '{}'",
                            if *op == UnaryOp::Neg { "-" } else { "!" },
                            operand.ty
                        ),
                        span,
                    ));
                }
                let ty = operand.ty;
                Ok(typed(
                    TypedExprKind::UnaryOp {
                        op: *op,
                        operand: Box::new(operand),
                    },
                    ty,
                    span,
                ))
            }

            ExprKind::Assign { op, target, value } => {
                let (place, ty) = self.resolve_place(target)?;
                let value = self.check_value(value)?;
                let value = match op {
                    None => coerce(value, ty)?,
                    Some(op) => {
                        let current = typed(TypedExprKind::Load(place), ty, target.span);
                        let combined = check_binop(*op, current, value, span)?;
                        if ty == TypeName::Int && combined.ty == TypeName::Double {
                            // `i += 1.5` converts back to the variable's type.
                            typed(TypedExprKind::FloatToInt(Box::new(combined)), TypeName::Int, span)
                        } else {
                            coerce(combined, ty)?
                        }
                    }
                };
                Ok(typed(
                    TypedExprKind::Assign {
                        place,
                        value: Box::new(value),
                    },
                    ty,
                    span,
                ))
            }

            ExprKind::IncDec { target, increment, prefix } => {
                let (place, ty) = self.resolve_place(target)?;
                if !ty.is_numeric() {
                    return Err(Diagnostic::type_error(
                        format!(
                            "Operator '{}' cannot be applied to operand of type '{ty}'",
                            if *increment { "++" } else { "--" }
                        ),
                        span,
                    ));
                }
                Ok(typed(
                    TypedExprKind::IncDec {
                        place,
                        increment: *increment,
                        prefix: *prefix,
                    },
                    ty,
                    span,
                ))
            }

            ExprKind::Conditional {
                condition,
                then_expr,
                else_expr,
            } => {
                let condition = self.check_condition(condition)?;
                let then_expr = self.check_value(then_expr)?;
                let else_expr = self.check_value(else_expr)?;
                let ty = conditional_type(then_expr.ty, else_expr.ty).ok_or_else(|| {
                    Diagnostic::type_error(
                        format!(
                            "Type of conditional expression cannot be determined because there is no implicit conversion between '{}' and '{}'",
                            then_expr.ty, else_expr.ty
                        ),
                        span,
                    )
                })?;
                Ok(typed(
                    TypedExprKind::Conditional {
                        condition: Box::new(condition),
                        then_expr: Box::new(coerce(then_expr, ty)?),
                        else_expr: Box::new(coerce(else_expr, ty)?),
                    },
                    ty,
                    span,
                ))
            }

            ExprKind::Call { name, args } => self.check_call(name, args, span),
            ExprKind::MethodCall { object, method, args } => {
                self.check_method_call(object, method, args, span)
            }
            ExprKind::Field { object, field } => self.check_field(object, field, span),

            ExprKind::New { type_name, args } => {
                let full = self.refs.resolve_exception(type_name).ok_or_else(|| {
                    Diagnostic::type_error(
                        format!("The type or namespace name '{type_name}' could not be found"),
                        span,
                    )
                })?;
                let message = match args.as_slice() {
                    [] => None,
                    [arg] => {
                        let arg = self.check_expr(arg)?;
                        Some(Box::new(coerce(arg, TypeName::String)?))
                    }
                    _ => {
                        return Err(Diagnostic::type_error(
                            format!(
                                "'{}' does not contain a constructor that takes {} arguments",
                                builtins::short_name(full),
                                args.len()
                            ),
                            span,
                        ))
                    }
                };
                Ok(typed(
                    TypedExprKind::NewException {
                        type_name: full.to_string(),
                        message,
                    },
                    TypeName::Exception,
                    span,
                ))
            }

            ExprKind::Cast { ty, operand } => {
                let operand = self.check_value(operand)?;
                check_cast(*ty, operand, span)
            }
        }
    }

    fn check_ident(&self, name: &str, span: Span) -> Result<TypedExpr, Diagnostic> {
        if let Some((place, ty)) = self.resolve_variable(name) {
            return Ok(typed(TypedExprKind::Load(place), ty, span));
        }
        // Constants of statically imported types: `PI` with `using static System.Math`.
        for owner in self.refs.static_imports() {
            if let Some(c) = builtins::lookup_const(owner, name) {
                return Ok(typed(TypedExprKind::FloatLit(c.value), TypeName::Double, span));
            }
        }
        if self.refs.resolve_type(name).is_some() {
            return Err(Diagnostic::type_error(
                format!("'{name}' is a type, which is not valid in the given context"),
                span,
            ));
        }
        Err(Diagnostic::type_error(
            format!("The name '{name}' does not exist in the current context"),
            span,
        ))
    }

    fn check_args(&mut self, args: &[Expr]) -> Result<Vec<TypedExpr>, Diagnostic> {
        args.iter().map(|a| self.check_expr(a)).collect()
    }

    fn check_call(&mut self, name: &str, args: &[Expr], span: Span) -> Result<TypedExpr, Diagnostic> {
        if let Some((function, sig)) = self.resolve_function(name) {
            let params = sig.params.clone();
            let ret = sig.ret;
            if params.len() != args.len() {
                return Err(arity_error(name, args.len(), span));
            }
            let typed_args = self
                .check_args(args)?
                .into_iter()
                .zip(params)
                .map(|(arg, ty)| coerce(arg, ty))
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(typed(
                TypedExprKind::Call {
                    function,
                    args: typed_args,
                },
                ret,
                span,
            ));
        }

        let refs = self.refs;
        let imports: Vec<&str> = refs.static_imports().collect();
        if let Some(b) = imports
            .iter()
            .find_map(|owner| builtins::lookup_static(owner, name, args.len()))
        {
            let typed_args = self.check_args(args)?;
            return check_builtin(b, Vec::new(), typed_args, span);
        }
        if imports.iter().any(|owner| builtins::has_static(owner, name)) {
            return Err(arity_error(name, args.len(), span));
        }
        Err(Diagnostic::type_error(
            format!("The name '{name}' does not exist in the current context"),
            span,
        ))
    }

    fn check_method_call(
        &mut self,
        object: &Expr,
        method: &str,
        args: &[Expr],
        span: Span,
    ) -> Result<TypedExpr, Diagnostic> {
        if let Some(owner) = self.static_owner(object) {
            return match builtins::lookup_static(owner, method, args.len()) {
                Some(b) => {
                    let typed_args = self.check_args(args)?;
                    check_builtin(b, Vec::new(), typed_args, span)
                }
                None if builtins::has_static(owner, method) => Err(arity_error(method, args.len(), span)),
                None => Err(no_member(builtins::short_name(owner), method, span)),
            };
        }

        let receiver = self.check_value(object)?;
        let Some(b) = builtins::lookup_member(receiver.ty, method, Some(args.len())) else {
            let other_arity = (0..=3).any(|n| builtins::lookup_member(receiver.ty, method, Some(n)).is_some());
            return Err(if other_arity {
                arity_error(method, args.len(), span)
            } else {
                no_member(receiver.ty.keyword(), method, span)
            });
        };
        let typed_args = self.check_args(args)?;
        check_builtin(b, vec![receiver], typed_args, span)
    }

    fn check_field(&mut self, object: &Expr, field: &str, span: Span) -> Result<TypedExpr, Diagnostic> {
        if let Some(owner) = self.static_owner(object) {
            return builtins::lookup_const(owner, field)
                .map(|c| typed(TypedExprKind::FloatLit(c.value), TypeName::Double, span))
                .ok_or_else(|| no_member(builtins::short_name(owner), field, span));
        }
        let receiver = self.check_value(object)?;
        let b = builtins::lookup_member(receiver.ty, field, None)
            .ok_or_else(|| no_member(receiver.ty.keyword(), field, span))?;
        check_builtin(b, vec![receiver], Vec::new(), span)
    }
}

// ── Typing rules ──────────────────────────────────────────────────

fn typed(kind: TypedExprKind, ty: TypeName, span: Span) -> TypedExpr {
    TypedExpr { kind, ty, span }
}

fn require_value(expr: TypedExpr) -> Result<TypedExpr, Diagnostic> {
    if expr.ty == TypeName::Void {
        Err(Diagnostic::type_error(
            "An expression of type 'void' cannot be used as a value",
            expr.span,
        ))
    } else {
        Ok(expr)
    }
}

fn coerce_to_float(expr: TypedExpr) -> TypedExpr {
    let span = expr.span;
    match expr.kind {
        TypedExprKind::IntLit(v) => typed(TypedExprKind::FloatLit(f64::from(v)), TypeName::Double, span),
        _ => typed(TypedExprKind::IntToFloat(Box::new(expr)), TypeName::Double, span),
    }
}

/// Implicit conversion of `expr` to `target`.
fn coerce(expr: TypedExpr, target: TypeName) -> Result<TypedExpr, Diagnostic> {
    let expr = require_value(expr)?;
    if expr.ty == target {
        return Ok(expr);
    }
    match (expr.ty, target) {
        (TypeName::Int, TypeName::Double) => Ok(coerce_to_float(expr)),
        (TypeName::Null, t) if t.is_nullable() => Ok(TypedExpr { ty: t, ..expr }),
        (from, to) => Err(Diagnostic::type_error(
            format!("Cannot implicitly convert type '{from}' to '{to}'"),
            expr.span,
        )),
    }
}

fn conditional_type(a: TypeName, b: TypeName) -> Option<TypeName> {
    match (a, b) {
        _ if a == b => Some(a),
        (TypeName::Int, TypeName::Double) | (TypeName::Double, TypeName::Int) => Some(TypeName::Double),
        (TypeName::Null, t) | (t, TypeName::Null) if t.is_nullable() => Some(t),
        _ => None,
    }
}

/// Bring two numeric operands to a common type.
fn unify_numeric(left: TypedExpr, right: TypedExpr) -> (TypedExpr, TypedExpr, TypeName) {
    match (left.ty, right.ty) {
        (TypeName::Int, TypeName::Double) => (coerce_to_float(left), right, TypeName::Double),
        (TypeName::Double, TypeName::Int) => (left, coerce_to_float(right), TypeName::Double),
        (ty, _) => (left, right, ty),
    }
}

fn is_constant_zero(expr: &TypedExpr) -> bool {
    match &expr.kind {
        TypedExprKind::IntLit(0) => true,
        TypedExprKind::UnaryOp { op: UnaryOp::Neg, operand } => is_constant_zero(operand),
        _ => false,
    }
}

fn check_binop(op: BinOp, left: TypedExpr, right: TypedExpr, span: Span) -> Result<TypedExpr, Diagnostic> {
    let mismatch = |l: TypeName, r: TypeName| {
        Diagnostic::type_error(
            format!(
                "Operator '{}' cannot be applied to operands of type '{l}' and '{r}'",
                op.symbol()
            ),
            span,
        )
    };
    let (lt, rt) = (left.ty, right.ty);
    let binop = |op, left, right, ty| {
        typed(
            TypedExprKind::BinOp {
                op,
                left: Box::new(left),
                right: Box::new(right),
            },
            ty,
            span,
        )
    };

    match op {
        BinOp::Add if lt == TypeName::String || rt == TypeName::String => Ok(typed(
            TypedExprKind::Concat {
                left: Box::new(left),
                right: Box::new(right),
            },
            TypeName::String,
            span,
        )),
        BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Mod => {
            if !lt.is_numeric() || !rt.is_numeric() {
                return Err(mismatch(lt, rt));
            }
            let (left, right, ty) = unify_numeric(left, right);
            if ty == TypeName::Int && matches!(op, BinOp::Div | BinOp::Mod) && is_constant_zero(&right) {
                return Err(Diagnostic::type_error("Division by constant zero", span));
            }
            Ok(binop(op, left, right, ty))
        }
        BinOp::Pow => {
            if !lt.is_numeric() || !rt.is_numeric() {
                return Err(mismatch(lt, rt));
            }
            Ok(binop(op, coerce(left, TypeName::Double)?, coerce(right, TypeName::Double)?, TypeName::Double))
        }
        BinOp::Lt | BinOp::Gt | BinOp::Le | BinOp::Ge => {
            if !lt.is_numeric() || !rt.is_numeric() {
                return Err(mismatch(lt, rt));
            }
            let (left, right, _) = unify_numeric(left, right);
            Ok(binop(op, left, right, TypeName::Bool))
        }
        BinOp::Eq | BinOp::Ne => {
            let comparable = (lt.is_numeric() && rt.is_numeric())
                || lt == rt
                || (lt == TypeName::Null && rt.is_nullable())
                || (rt == TypeName::Null && lt.is_nullable());
            if !comparable {
                return Err(mismatch(lt, rt));
            }
            let (left, right) = if lt.is_numeric() {
                let (l, r, _) = unify_numeric(left, right);
                (l, r)
            } else {
                (left, right)
            };
            Ok(binop(op, left, right, TypeName::Bool))
        }
        BinOp::And | BinOp::Or => {
            if lt != TypeName::Bool || rt != TypeName::Bool {
                return Err(mismatch(lt, rt));
            }
            Ok(binop(op, left, right, TypeName::Bool))
        }
    }
}

fn check_cast(target: TypeName, operand: TypedExpr, span: Span) -> Result<TypedExpr, Diagnostic> {
    match (operand.ty, target) {
        (from, to) if from == to => Ok(TypedExpr { span, ..operand }),
        (TypeName::Double, TypeName::Int) => Ok(typed(
            TypedExprKind::FloatToInt(Box::new(operand)),
            TypeName::Int,
            span,
        )),
        (TypeName::Int, TypeName::Double) => Ok(TypedExpr {
            span,
            ..coerce_to_float(operand)
        }),
        (TypeName::Null, TypeName::String) => Ok(TypedExpr {
            ty: TypeName::String,
            span,
            ..operand
        }),
        (from, to) => Err(Diagnostic::type_error(
            format!("Cannot convert type '{from}' to '{to}'"),
            span,
        )),
    }
}

fn check_builtin(
    b: &BuiltinFn,
    receiver: Vec<TypedExpr>,
    args: Vec<TypedExpr>,
    span: Span,
) -> Result<TypedExpr, Diagnostic> {
    let numeric_args: Vec<TypeName> = args
        .iter()
        .zip(b.params)
        .filter(|(_, (_, p))| *p == ParamTy::Numeric)
        .map(|(a, _)| a.ty)
        .collect();
    let all_int = numeric_args.iter().all(|t| *t == TypeName::Int);

    let mut typed_args = receiver;
    for (arg, (_, param)) in args.into_iter().zip(b.params) {
        let arg = match param {
            ParamTy::Of(ty) => coerce(arg, *ty)?,
            ParamTy::Any => require_value(arg)?,
            ParamTy::Numeric => {
                if !arg.ty.is_numeric() {
                    return Err(Diagnostic::type_error(
                        format!("Argument of type '{}' is not numeric", arg.ty),
                        arg.span,
                    ));
                }
                if all_int {
                    arg
                } else {
                    coerce(arg, TypeName::Double)?
                }
            }
        };
        typed_args.push(arg);
    }

    let ty = match b.ret {
        Ret::Of(ty) => ty,
        Ret::SameNumeric if all_int => TypeName::Int,
        Ret::SameNumeric => TypeName::Double,
    };
    Ok(typed(
        TypedExprKind::Builtin {
            op: b.op,
            args: typed_args,
        },
        ty,
        span,
    ))
}

fn arity_error(name: &str, argc: usize, span: Span) -> Diagnostic {
    Diagnostic::type_error(
        format!("No overload for method '{name}' takes {argc} arguments"),
        span,
    )
}

fn no_member(owner: &str, member: &str, span: Span) -> Diagnostic {
    Diagnostic::type_error(
        format!("'{owner}' does not contain a definition for '{member}'"),
        span,
    )
}

fn default_expr(ty: TypeName, span: Span) -> TypedExpr {
    let kind = match ty {
        TypeName::Int => TypedExprKind::IntLit(0),
        TypeName::Double => TypedExprKind::FloatLit(0.0),
        TypeName::Bool => TypedExprKind::BoolLit(false),
        TypeName::String | TypeName::Void | TypeName::Null | TypeName::Exception => TypedExprKind::Null,
    };
    typed(kind, ty, span)
}

/// `a.b.c` as a dotted path, if the expression is only identifiers and member access.
fn dotted_path(expr: &Expr) -> Option<String> {
    match &expr.kind {
        ExprKind::Ident(name) => Some(name.clone()),
        ExprKind::Field { object, field } => {
            let mut path = dotted_path(object)?;
            path.push('.');
            path.push_str(field);
            Some(path)
        }
        _ => None,
    }
}

/// Expressions with no side effect, whose value is thrown away as a statement.
fn is_pure_value(expr: &TypedExpr) -> bool {
    match &expr.kind {
        TypedExprKind::Assign { .. }
        | TypedExprKind::IncDec { .. }
        | TypedExprKind::Call { .. }
        | TypedExprKind::Builtin { .. }
        | TypedExprKind::NewException { .. } => false,
        TypedExprKind::IntToFloat(inner) | TypedExprKind::FloatToInt(inner) => is_pure_value(inner),
        _ => expr.ty != TypeName::Void,
    }
}

// ── Reachability ──────────────────────────────────────────────────

fn list_completes_normally(stmts: &[TypedStmt]) -> bool {
    stmts.iter().all(completes_normally)
}

/// Whether control can flow past `stmt` to the next statement.
fn completes_normally(stmt: &TypedStmt) -> bool {
    match &stmt.kind {
        TypedStmtKind::Return(_)
        | TypedStmtKind::Throw(_)
        | TypedStmtKind::Break
        | TypedStmtKind::Continue => false,
        TypedStmtKind::Block(stmts) => list_completes_normally(stmts),
        TypedStmtKind::If {
            then_branch,
            else_branch,
            ..
        } => list_completes_normally(then_branch) || list_completes_normally(else_branch),
        TypedStmtKind::While { condition, body } => {
            !is_constant_true(Some(condition)) || body.iter().any(breaks_loop)
        }
        TypedStmtKind::For { condition, body, .. } => {
            !is_constant_true(condition.as_ref()) || body.iter().any(breaks_loop)
        }
        TypedStmtKind::Init { .. } | TypedStmtKind::Expr(_) | TypedStmtKind::Result(_) => true,
    }
}

/// A missing `for` condition counts as `true`.
fn is_constant_true(condition: Option<&TypedExpr>) -> bool {
    condition.map_or(true, |c| matches!(c.kind, TypedExprKind::BoolLit(true)))
}

/// Whether `stmt` contains a `break` for the enclosing loop (not a nested one).
fn breaks_loop(stmt: &TypedStmt) -> bool {
    match &stmt.kind {
        TypedStmtKind::Break => true,
        TypedStmtKind::Block(stmts) => stmts.iter().any(breaks_loop),
        TypedStmtKind::If {
            then_branch,
            else_branch,
            ..
        } => then_branch.iter().chain(else_branch).any(breaks_loop),
        _ => false,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::script::builtins::{EXCEPTION_TYPES, LIBRARY_TYPES};
    use crate::script::diagnostic::Severity;
    use crate::script::lexer::lex;
    use crate::script::parser::{parse, ParseOptions};

    fn refs() -> ReferenceSet {
        let mut refs = ReferenceSet::new();
        for ty in LIBRARY_TYPES {
            refs = refs.with_type(*ty);
        }
        for ty in EXCEPTION_TYPES {
            refs = refs.with_exception_type(*ty);
        }
        refs.with_usings(["System", "System.Console"])
    }

    fn check_with(src: &str, id: u32, prior: &[PriorSubmission<'_>]) -> Result<TypedScript, Vec<Diagnostic>> {
        let tokens = lex(src).unwrap();
        let script = parse(tokens, ParseOptions::default()).unwrap();
        type_check(&script, id, prior, &refs())
    }

    fn check(src: &str) -> TypedScript {
        check_with(src, 0, &[]).unwrap()
    }

    fn check_err(src: &str) -> Vec<Diagnostic> {
        check_with(src, 0, &[]).unwrap_err()
    }

    fn result_ty(typed: &TypedScript) -> Option<TypeName> {
        typed.body.iter().find_map(|s| match &s.kind {
            TypedStmtKind::Result(e) => Some(e.ty),
            _ => None,
        })
    }

    // ── Declarations ───────────────────────────────────────────────

    #[test]
    fn top_level_vars_are_globals() {
        let typed = check("var x = 10; double y; string s = null;");
        let globals: Vec<_> = typed.declarations.globals.iter().map(|(n, g)| (n.as_str(), g.ty, g.slot)).collect();
        assert_eq!(globals, vec![
            ("x", TypeName::Int, 0),
            ("y", TypeName::Double, 1),
            ("s", TypeName::String, 2),
        ]);
        assert_eq!(typed.entry_locals, 0);
    }

    #[test]
    fn nested_vars_are_locals() {
        let typed = check("{ var t = 1; } for (int i = 0; i < 2; i++) { }");
        assert!(typed.declarations.globals.is_empty());
        assert_eq!(typed.entry_locals, 2);
    }

    #[test]
    fn duplicate_in_same_submission_is_error() {
        let errors = check_err("var x = 1; var x = 2;");
        assert!(errors.iter().any(|e| e.is_error() && e.message.contains("already defined")));
    }

    #[test]
    fn variable_limit_is_reported_once() {
        let src: String = (0..65_540).map(|i| format!("int v{i};")).collect();
        let errors = check_err(&src);
        let over: Vec<_> = errors
            .iter()
            .filter(|e| e.message.starts_with("Too many variables"))
            .collect();
        assert_eq!(over.len(), 1);
        assert!(over[0].is_error());
        assert_eq!(&src[over[0].span.start..over[0].span.end], "int v65536");
    }

    #[test]
    fn redeclaring_prior_global_is_info() {
        let first = check("var x = 1;");
        let prior = [PriorSubmission { id: 0, declarations: &first.declarations }];
        let second = check_with("string x = \"a\";", 1, &prior).unwrap();
        assert_eq!(second.diagnostics.len(), 1);
        assert_eq!(second.diagnostics[0].severity, Severity::Info);
        assert!(second.diagnostics[0].message.contains("Submission#0"));
    }

    #[test]
    fn var_requires_initializer_and_non_null() {
        // Parsed as `var x;`
        let errors = check_err("var x;");
        assert!(errors[0].message.contains("must be initialized"));
        let errors = check_err("var y = null;");
        assert!(errors[0].message.contains("<null>"));
    }

    // ── Resolution across submissions ─────────────────────────────

    #[test]
    fn prior_globals_resolve_to_their_submission() {
        let first = check("var x = 10;");
        let prior = [PriorSubmission { id: 0, declarations: &first.declarations }];
        let second = check_with("x * 2", 1, &prior).unwrap();
        assert_eq!(result_ty(&second), Some(TypeName::Int));
        let TypedStmtKind::Result(expr) = &second.body[0].kind else { panic!() };
        let TypedExprKind::BinOp { left, .. } = &expr.kind else { panic!() };
        assert!(matches!(
            left.kind,
            TypedExprKind::Load(Place::Global(GlobalRef { submission: 0, slot: 0 }))
        ));
    }

    #[test]
    fn newest_declaration_wins() {
        let first = check("var x = 1;");
        let second = check("string x = \"s\";");
        let prior = [
            PriorSubmission { id: 1, declarations: &second.declarations },
            PriorSubmission { id: 0, declarations: &first.declarations },
        ];
        let third = check_with("x", 2, &prior).unwrap();
        assert_eq!(result_ty(&third), Some(TypeName::String));
    }

    #[test]
    fn prior_functions_are_callable() {
        let first = check("int sq(int v) => v * v;");
        let prior = [PriorSubmission { id: 0, declarations: &first.declarations }];
        let second = check_with("sq(4)", 1, &prior).unwrap();
        let TypedStmtKind::Result(expr) = &second.body[0].kind else { panic!() };
        assert!(matches!(
            expr.kind,
            TypedExprKind::Call { function: FunctionRef { submission: 0, index: 0 }, .. }
        ));
    }

    #[test]
    fn unknown_name_is_error() {
        let errors = check_err("y + 1");
        assert!(errors[0].message.contains("'y' does not exist"));
    }

    // ── Functions ────────────────────────────────────────────────

    #[test]
    fn functions_are_hoisted_and_recursive() {
        let typed = check("var r = fact(5); int fact(int n) { if (n <= 1) return 1; return n * fact(n - 1); }");
        assert_eq!(typed.functions.len(), 1);
        assert_eq!(typed.functions[0].param_count, 1);
    }

    #[test]
    fn missing_return_path_is_error() {
        let errors = check_err("int f(int n) { if (n > 0) return 1; }");
        assert!(errors.iter().any(|e| e.message.contains("not all code paths return a value")));
    }

    #[test]
    fn infinite_loop_satisfies_return_analysis() {
        check("int f() { while (true) { } }");
        let errors = check_err("int g() { while (true) { break; } }");
        assert!(errors[0].message.contains("not all code paths"));
    }

    #[test]
    fn wrong_argument_count() {
        let errors = check_err("int f(int a) => a; f(1, 2)");
        assert!(errors[0].message.contains("takes 2 arguments"));
    }

    #[test]
    fn return_outside_function_is_error() {
        let errors = check_err("return 1;");
        assert!(errors[0].message.contains("only allowed inside a function"));
    }

    // ── Expressions ──────────────────────────────────────────────

    #[test]
    fn int_widens_to_double() {
        let typed = check("1 + 2.5");
        assert_eq!(result_ty(&typed), Some(TypeName::Double));
    }

    #[test]
    fn string_concatenation() {
        let typed = check("\"n = \" + 3 + true");
        assert_eq!(result_ty(&typed), Some(TypeName::String));
    }

    #[test]
    fn narrowing_requires_cast() {
        let errors = check_err("int i = 2.5;");
        assert!(errors[0].message.contains("Cannot implicitly convert type 'double' to 'int'"));
        check("int i = (int)2.5;");
    }

    #[test]
    fn constant_division_by_zero() {
        let errors = check_err("var q = 5 / 0;");
        assert!(errors[0].message.contains("Division by constant zero"));
        // Doubles divide to infinity
        check("var d = 5.0 / 0;");
    }

    #[test]
    fn void_cannot_be_a_value() {
        let errors = check_err("var v = WriteLine(\"x\");");
        assert!(errors[0].message.contains("'void'"));
    }

    #[test]
    fn library_resolution_respects_usings() {
        let typed = check("Math.Sqrt(2)");
        assert_eq!(result_ty(&typed), Some(TypeName::Double));
        let typed = check("System.Console.WriteLine(1)");
        assert_eq!(result_ty(&typed), Some(TypeName::Void));
        let typed = check("Math.Max(1, 2)");
        assert_eq!(result_ty(&typed), Some(TypeName::Int));
        let typed = check("Math.Max(1, 2.0)");
        assert_eq!(result_ty(&typed), Some(TypeName::Double));
        let errors = check_err("Sqrt(2)");
        assert!(errors[0].message.contains("'Sqrt' does not exist"));
    }

    #[test]
    fn member_access() {
        assert_eq!(result_ty(&check("\"abc\".Length")), Some(TypeName::Int));
        assert_eq!(result_ty(&check("\"abc\".ToUpper()")), Some(TypeName::String));
        assert_eq!(result_ty(&check("new Exception(\"m\").Message")), Some(TypeName::String));
        assert_eq!(result_ty(&check("(1.5).ToString()")), Some(TypeName::String));
        let errors = check_err("\"abc\".Nope");
        assert!(errors[0].message.contains("'string' does not contain a definition for 'Nope'"));
    }

    #[test]
    fn unknown_exception_type() {
        let errors = check_err("throw new BogusException();");
        assert!(errors[0].message.contains("'BogusException' could not be found"));
    }

    // ── Warnings ─────────────────────────────────────────────────

    #[test]
    fn unreachable_code_warns_once() {
        let typed = check("void f() { return; WriteLine(1); WriteLine(2); }");
        let warnings: Vec<_> = typed.diagnostics.iter().filter(|d| d.severity == Severity::Warning).collect();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].message.contains("Unreachable"));
    }

    #[test]
    fn discarded_value_warns() {
        let typed = check("var x = 1; x + 1;");
        assert_eq!(typed.diagnostics.len(), 1);
        assert!(typed.diagnostics[0].message.contains("never used"));
        // Calls and assignments are statements in their own right
        let typed = check("var y = 1; y = 2; Math.Abs(-1);");
        assert!(typed.diagnostics.is_empty());
    }

    #[test]
    fn errors_keep_warnings_in_order() {
        let errors = check_err("var a = 1; a + 1; var b = nope;");
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].severity, Severity::Warning);
        assert_eq!(errors[1].severity, Severity::Error);
    }
}
