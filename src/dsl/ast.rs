//! Syntax tree for RAI source files.

/// Byte range into the source text a node was parsed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
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

/// A parsed compilation unit: every top-level form in source order.
#[derive(Debug, Clone, Default)]
pub struct File {
    pub items: Vec<Item>,
}

#[derive(Debug, Clone)]
pub enum Item {
    /// `#__FILE__ <path>` marker inserted when files are stitched together.
    FileMarker { path: String, span: Span },
    /// `#out <path>`
    Out { path: String, span: Span },
    /// `#extends <path>`
    Extends { path: String, span: Span },
    /// `global NAME`
    Global { name: String, span: Span },
    Define(DefineDef),
    Script(CallableDef),
    Function(CallableDef),
}

/// `#define NAME <expr>`; `text` is the exact source of the expression.
#[derive(Debug, Clone)]
pub struct DefineDef {
    pub name: String,
    pub name_span: Span,
    pub body: Expr,
    pub text: String,
    pub span: Span,
}

/// `script NAME(params) { ... }` or `fn NAME(params) { ... }`
#[derive(Debug, Clone)]
pub struct CallableDef {
    pub name: String,
    pub name_span: Span,
    pub params: Vec<Param>,
    pub body: Block,
    pub span: Span,
}

impl CallableDef {
    /// Number of leading `&name` parameters.
    pub fn ref_count(&self) -> usize {
        self.params.iter().take_while(|p| p.is_ref).count()
    }
}

#[derive(Debug, Clone)]
pub struct Param {
    pub name: String,
    pub is_ref: bool,
    pub span: Span,
}

/// `{ stmt* }`
#[derive(Debug, Clone)]
pub struct Block {
    pub stmts: Vec<Stmt>,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub enum Stmt {
    Break(Span),
    Call(CallExpr),
    Let {
        name: String,
        name_span: Span,
        value: Expr,
        span: Span,
    },
    /// `x = e`, or `x op= e` when `op` is set.
    Assign {
        name: String,
        name_span: Span,
        op: Option<BinOp>,
        value: Expr,
        span: Span,
    },
    Return { value: Option<Expr>, span: Span },
    Loop { body: Block, span: Span },
    If {
        branches: Vec<(Expr, Block)>,
        else_body: Option<Block>,
        span: Span,
    },
    /// A lone identifier; always rejected by the resolver.
    Ident { name: String, span: Span },
}

/// `[collapse] name(args)`
#[derive(Debug, Clone)]
pub struct CallExpr {
    pub name: String,
    pub name_span: Span,
    pub collapse: bool,
    pub args: Vec<Arg>,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub enum Arg {
    Expr(Expr),
    Str { value: String, span: Span },
}

impl Arg {
    pub fn span(&self) -> Span {
        match self {
            Arg::Expr(e) => e.span,
            Arg::Str { span, .. } => *span,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Expr {
    pub kind: ExprKind,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub enum ExprKind {
    /// Decimal or hex literal.
    Number(f64),
    /// `name` or `@name`.
    Ident { name: String, from_target: bool },
    Call(CallExpr),
    /// `#calc(...)`, holding the raw text between the parentheses.
    Calc { text: String },
    Not(Box<Expr>),
    BinOp {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Or,
    And,
    BitOr,
    BitXor,
    BitAnd,
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Shl,
    Shr,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}
