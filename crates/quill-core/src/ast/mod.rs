//! The typed input tree handed over by the front end.
//!
//! Every expression arrives with its resolved type; the only type variables
//! left are the `Param` placeholders inside generic templates, which the
//! lowering substitutes away per instantiation. The backend validates the
//! types it depends on but never infers.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::ir;
use crate::span::Span;

/// Source-level type, as resolved by the front end. `Param` names a generic
/// type parameter and is only legal inside a generic template body.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Ty {
    I1,
    I8,
    I32,
    I64,
    F64,
    Ptr,
    Vector { elem: Box<Ty>, lanes: u32 },
    Void,
    Param(String),
}

impl Ty {
    pub fn vector(elem: Ty, lanes: u32) -> Ty {
        Ty::Vector {
            elem: Box::new(elem),
            lanes,
        }
    }

    /// Substitute type parameters and produce the concrete lowering type.
    /// An unmapped parameter means monomorphization cannot proceed.
    pub fn resolve(&self, subst: &HashMap<String, ir::Ty>) -> Result<ir::Ty> {
        match self {
            Ty::I1 => Ok(ir::Ty::I1),
            Ty::I8 => Ok(ir::Ty::I8),
            Ty::I32 => Ok(ir::Ty::I32),
            Ty::I64 => Ok(ir::Ty::I64),
            Ty::F64 => Ok(ir::Ty::F64),
            Ty::Ptr => Ok(ir::Ty::Ptr),
            Ty::Vector { elem, lanes } => Ok(ir::Ty::vector(elem.resolve(subst)?, *lanes)),
            Ty::Void => Ok(ir::Ty::Void),
            Ty::Param(name) => subst
                .get(name)
                .cloned()
                .ok_or_else(|| Error::GenericResolution(name.clone())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    /// Short-circuit boolean and; lowered through branches, never eagerly.
    And,
    /// Short-circuit boolean or.
    Or,
}

impl BinaryOp {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge
        )
    }

    pub fn is_short_circuit(self) -> bool {
        matches!(self, BinaryOp::And | BinaryOp::Or)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReduceKind {
    Add,
    FAdd,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expr {
    pub kind: ExprKind,
    pub ty: Ty,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExprKind {
    IntLit(i64),
    FloatLit(f64),
    BoolLit(bool),
    Var(String),
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    /// Conditional expression; both arms produce the expression's type.
    Ternary {
        cond: Box<Expr>,
        then_val: Box<Expr>,
        else_val: Box<Expr>,
    },
    Call {
        callee: String,
        type_args: Vec<Ty>,
        args: Vec<Expr>,
    },
    /// Fixed-width vector literal; element count must equal the lane count.
    VectorLit(Vec<Expr>),
    /// Read one lane of a vector value.
    VectorGet {
        vector: Box<Expr>,
        lane: u32,
    },
    /// Horizontal reduction to a scalar of the element type.
    Reduce {
        kind: ReduceKind,
        vector: Box<Expr>,
        seed: Option<Box<Expr>>,
    },
    /// Explicit conversion; the target type is the expression's type.
    Cast {
        value: Box<Expr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContractKind {
    Requires,
    Ensures,
    Invariant,
}

impl ContractKind {
    /// Numeric code passed to the contract-failure runtime hook.
    pub fn code(self) -> i64 {
        match self {
            ContractKind::Requires => 0,
            ContractKind::Ensures => 1,
            ContractKind::Invariant => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stmt {
    pub kind: StmtKind,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StmtKind {
    Let {
        name: String,
        ty: Ty,
        init: Expr,
    },
    Assign {
        name: String,
        value: Expr,
    },
    /// `else_body` empty means no else arm.
    If {
        cond: Expr,
        then_body: Vec<Stmt>,
        else_body: Vec<Stmt>,
    },
    While {
        cond: Expr,
        body: Vec<Stmt>,
    },
    Break,
    Continue,
    Return(Option<Expr>),
    Expr(Expr),
    Panic {
        message: String,
    },
    Contract {
        kind: ContractKind,
        cond: Expr,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    pub ty: Ty,
    /// Whether the body assigns to this parameter; decided by the front end.
    pub mutated: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDef {
    pub name: String,
    /// Generic type parameter names; non-empty makes this a template that is
    /// only lowered per concrete instantiation.
    pub generics: Vec<String>,
    pub params: Vec<Param>,
    pub ret: Ty,
    pub body: Vec<Stmt>,
    pub span: Span,
}

impl FunctionDef {
    pub fn is_generic(&self) -> bool {
        !self.generics.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AstModule {
    pub name: String,
    /// File name reported in debug metadata.
    pub source_file: String,
    /// Source text; required for line/column debug locations.
    pub source: Option<String>,
    pub functions: Vec<FunctionDef>,
}

impl AstModule {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            source_file: format!("{}.ql", name),
            name,
            source: None,
            functions: Vec::new(),
        }
    }
}
