//! AST node types for submitted snippets.

use serde::Serialize;

/// Source span for error reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn merge(self, other: Span) -> Span {
        Span {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }
}

/// One submitted snippet, parsed as a top-level script fragment.
#[derive(Debug, Clone, Default)]
pub struct Script {
    pub items: Vec<Item>,
}

#[derive(Debug, Clone)]
pub enum Item {
    Function(FnDef),
    Stmt(Stmt),
}

/// `int square(int x) { return x * x; }` or `int square(int x) => x * x;`
#[derive(Debug, Clone)]
pub struct FnDef {
    pub name: String,
    pub params: Vec<FnParam>,
    pub return_type: TypeName,
    pub body: Vec<Stmt>,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct FnParam {
    pub name: String,
    pub ty: TypeName,
    pub span: Span,
}

/// Types known to the language. `Null` and `Exception` cannot be spelled in
/// a declaration; they only arise from literals, `new` and `var` inference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeName {
    Int,
    Double,
    Bool,
    String,
    Void,
    Null,
    Exception,
}

impl TypeName {
    pub fn is_numeric(self) -> bool {
        matches!(self, Self::Int | Self::Double)
    }

    /// Reference types accept `null`.
    pub fn is_nullable(self) -> bool {
        matches!(self, Self::String | Self::Exception | Self::Null)
    }

    pub fn keyword(self) -> &'static str {
        match self {
            Self::Int => "int",
            Self::Double => "double",
            Self::Bool => "bool",
            Self::String => "string",
            Self::Void => "void",
            Self::Null => "<null>",
            Self::Exception => "Exception",
        }
    }
}

impl std::fmt::Display for TypeName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.keyword())
    }
}

/// Statements.
#[derive(Debug, Clone)]
pub enum Stmt {
    /// `var x = e;`, `int x;`, `int x = e;` (`ty` is `None` for `var`).
    Let {
        name: String,
        ty: Option<TypeName>,
        value: Option<Expr>,
        span: Span,
    },
    /// An expression statement. `terminated` is false for a trailing
    /// top-level expression written without `;`.
    Expr { expr: Expr, terminated: bool },
    If {
        condition: Expr,
        then_branch: Box<Stmt>,
        else_branch: Option<Box<Stmt>>,
        span: Span,
    },
    While {
        condition: Expr,
        body: Box<Stmt>,
        span: Span,
    },
    For {
        init: Option<Box<Stmt>>,
        condition: Option<Expr>,
        step: Vec<Expr>,
        body: Box<Stmt>,
        span: Span,
    },
    Block { stmts: Vec<Stmt>, span: Span },
    Return { value: Option<Expr>, span: Span },
    Break(Span),
    Continue(Span),
    Throw { value: Expr, span: Span },
    Empty(Span),
}

impl Stmt {
    pub fn span(&self) -> Span {
        match self {
            Self::Let { span, .. }
            | Self::If { span, .. }
            | Self::While { span, .. }
            | Self::For { span, .. }
            | Self::Block { span, .. }
            | Self::Return { span, .. }
            | Self::Throw { span, .. } => *span,
            Self::Break(span) | Self::Continue(span) | Self::Empty(span) => *span,
            Self::Expr { expr, .. } => expr.span,
        }
    }
}

/// Expressions.
#[derive(Debug, Clone)]
pub struct Expr {
    pub kind: ExprKind,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub enum ExprKind {
    /// Integer literal: `42`
    IntLit(i32),
    /// Double literal: `1.5`, `1e3`
    FloatLit(f64),
    /// String literal: `"hi"`
    StringLit(String),
    /// Boolean literal: `true`, `false`
    BoolLit(bool),
    /// `null`
    Null,
    /// Name reference: `x`, `Console`
    Ident(String),
    /// Binary operation: `a + b`
    BinOp {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    /// Unary operation: `-x`, `!b`
    UnaryOp {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    /// `x = e`, `x += e`
    Assign {
        op: Option<BinOp>,
        target: Box<Expr>,
        value: Box<Expr>,
    },
    /// `x++`, `--x`
    IncDec {
        target: Box<Expr>,
        increment: bool,
        prefix: bool,
    },
    /// `c ? a : b`
    Conditional {
        condition: Box<Expr>,
        then_expr: Box<Expr>,
        else_expr: Box<Expr>,
    },
    /// Function call: `square(3)`, `WriteLine("x")`
    Call { name: String, args: Vec<Expr> },
    /// Method call: `Console.WriteLine(x)`, `s.ToUpper()`
    MethodCall {
        object: Box<Expr>,
        method: String,
        args: Vec<Expr>,
    },
    /// Member access: `s.Length`, `Math.PI`
    Field { object: Box<Expr>, field: String },
    /// `new Exception("boom")`
    New { type_name: String, args: Vec<Expr> },
    /// `(int)x`
    Cast { ty: TypeName, operand: Box<Expr> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Lt,
    Gt,
    Le,
    Ge,
    Eq,
    Ne,
    And,
    Or,
}

impl BinOp {
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::Mod => "%",
            Self::Pow => "**",
            Self::Lt => "<",
            Self::Gt => ">",
            Self::Le => "<=",
            Self::Ge => ">=",
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::And => "&&",
            Self::Or => "||",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}
