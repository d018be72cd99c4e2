//! Parsed representation of a calculation expression, prior to compilation
//! against a particular output table or entity generation.

use crate::builtin::AggOp;

/// A parsed token, used only transiently by the tokenizer in [`crate::parse`].
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Number(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
    Comma,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    KwCase,
    KwWhen,
    KwThen,
    KwElse,
    KwEnd,
    KwNull,
    Eof,
}

/// A `CASE WHEN lhs op rhs THEN ... ELSE ... END` comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl CompareOp {
    pub fn sql(self) -> &'static str {
        match self {
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::Eq => "=",
            CompareOp::Ne => "<>",
        }
    }
}

/// Which run a microdata attribute reference is pinned to, e.g.
/// `Income[base]` / `Income[variant]`. `None` means "the run currently
/// being scanned" (no run comparison).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunTag {
    Base,
    Variant,
}

/// A name reference inside a calculation expression: an accumulator or
/// microdata attribute, optionally a parameter (`param.Name`), optionally
/// tagged with a run comparison (microdata only).
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnRef {
    /// Set for `param.Name` parameter references; `name` then holds `Name`.
    pub is_param: bool,
    pub name: String,
    pub run_tag: Option<RunTag>,
}

/// Scalar expression AST, produced by [`crate::parse::parse_expr`].
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Const(f64),
    Column(ColumnRef),
    Add(Box<Expr>, Box<Expr>),
    Sub(Box<Expr>, Box<Expr>),
    Mul(Box<Expr>, Box<Expr>),
    Div(Box<Expr>, Box<Expr>),
    Neg(Box<Expr>),
    /// `CASE WHEN lhs op rhs THEN a ELSE b END`, produced from expanding
    /// `OM_IF`/`OM_DIV_BY` before parsing, or written directly in source.
    Case {
        cond_op: CompareOp,
        cond_lhs: Box<Expr>,
        cond_rhs: Box<Expr>,
        then: Box<Expr>,
        els: Box<Expr>,
    },
    /// The `NULL` literal, e.g. `OM_DIV_BY`'s `ELSE NULL` branch.
    Null,
    /// An aggregate operator call, e.g. `OM_SUM(acc0 + 0.5 * acc1)`.
    Agg(AggOp, Box<Expr>),
}
