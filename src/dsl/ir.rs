//! Lowered instruction form produced by the resolver and consumed by the encoder.

use super::ast::BinOp;

/// Operator codes as the runtime numbers them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Operator {
    Or = 0,
    And = 1,
    BitOr = 2,
    BitXor = 3,
    BitAnd = 4,
    Eq = 5,
    Ne = 6,
    Gt = 7,
    Ge = 8,
    Lt = 9,
    Le = 10,
    Shl = 11,
    Shr = 12,
    Add = 13,
    Sub = 14,
    Mul = 15,
    Div = 16,
    Mod = 17,
    Not = 18,
}

impl From<BinOp> for Operator {
    fn from(op: BinOp) -> Self {
        match op {
            BinOp::Or => Operator::Or,
            BinOp::And => Operator::And,
            BinOp::BitOr => Operator::BitOr,
            BinOp::BitXor => Operator::BitXor,
            BinOp::BitAnd => Operator::BitAnd,
            BinOp::Eq => Operator::Eq,
            BinOp::Ne => Operator::Ne,
            BinOp::Gt => Operator::Gt,
            BinOp::Ge => Operator::Ge,
            BinOp::Lt => Operator::Lt,
            BinOp::Le => Operator::Le,
            BinOp::Shl => Operator::Shl,
            BinOp::Shr => Operator::Shr,
            BinOp::Add => Operator::Add,
            BinOp::Sub => Operator::Sub,
            BinOp::Mul => Operator::Mul,
            BinOp::Div => Operator::Div,
            BinOp::Mod => Operator::Mod,
        }
    }
}

/// What a `Return` command leaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum CallType {
    Scope = 0,
    Function = 1,
    Script = 2,
    Loop = 3,
}

/// Tags separating the sections of an `If` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Branch {
    If = 0,
    Elif = 1,
    Else = 2,
    End = 3,
}

// Commands the resolver emits on its own. Their opcodes come from the builtins table.
pub const CMD_IF: &str = "If";
pub const CMD_LOOP: &str = "Loop";
pub const CMD_RETURN: &str = "Return";
pub const CMD_LOOPBACK: &str = "Loopback";
pub const CMD_CREATE_VARIABLE: &str = "CreateVariable";
pub const CMD_SET_VARIABLE: &str = "SetVariable";
pub const CMD_CALL_FN: &str = "CallFn";
pub const CMD_CALL_SCRIPT: &str = "CallScript";
pub const CMD_COLLAPSE: &str = "Collapse";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Function,
    Script,
    Builtin,
}

/// A resolved call: callee id plus its own lowered arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub kind: CallKind,
    /// Function index, script id, or builtin opcode depending on `kind`.
    pub id: u16,
    pub name: String,
    pub args: Vec<PassedArg>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PassedArg {
    /// Index into the owning scope's number pool.
    Number(u16),
    /// Index into the owning scope's string pool.
    String(u16),
    /// Slot in the visible variable chain.
    Variable(u16),
    /// Builtin global; `relative` when written with `@`.
    Global { slot: u16, relative: bool },
    Call(Call),
    Expression(Box<Expression>),
    Raw(u16),
}

impl PassedArg {
    pub fn is_variable(&self) -> bool {
        matches!(self, PassedArg::Variable(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    pub op: Operator,
    pub lhs: PassedArg,
    /// Absent only for `Not`.
    pub rhs: Option<PassedArg>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub name: String,
    pub args: Vec<PassedArg>,
}

impl Command {
    pub fn new(name: impl Into<String>, args: Vec<PassedArg>) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }
}
