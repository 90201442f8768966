use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub type TempId = u32;
pub type LocalId = u32;
pub type BlockId = u32;

/// The closed set of types the lowering layer works with. Anything richer
/// (structs, enums, slices) is flattened by the front end before it gets here.
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
}

impl Ty {
    pub fn vector(elem: Ty, lanes: u32) -> Ty {
        Ty::Vector {
            elem: Box::new(elem),
            lanes,
        }
    }

    pub fn is_integer(&self) -> bool {
        matches!(self, Ty::I1 | Ty::I8 | Ty::I32 | Ty::I64)
    }

    pub fn is_float(&self) -> bool {
        matches!(self, Ty::F64)
    }

    pub fn is_vector(&self) -> bool {
        matches!(self, Ty::Vector { .. })
    }

    /// Scalar types that arithmetic instructions accept directly.
    pub fn is_arithmetic(&self) -> bool {
        self.is_integer() || self.is_float()
    }

    pub fn bit_width(&self) -> Option<u32> {
        match self {
            Ty::I1 => Some(1),
            Ty::I8 => Some(8),
            Ty::I32 => Some(32),
            Ty::I64 => Some(64),
            Ty::F64 => Some(64),
            Ty::Ptr => Some(64),
            Ty::Vector { elem, lanes } => elem.bit_width().map(|w| w * lanes),
            Ty::Void => None,
        }
    }

    /// Element type of a vector, if this is one.
    pub fn vector_elem(&self) -> Option<&Ty> {
        match self {
            Ty::Vector { elem, .. } => Some(elem),
            _ => None,
        }
    }

    pub fn vector_lanes(&self) -> Option<u32> {
        match self {
            Ty::Vector { lanes, .. } => Some(*lanes),
            _ => None,
        }
    }
}

impl std::fmt::Display for Ty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Ty::I1 => write!(f, "i1"),
            Ty::I8 => write!(f, "i8"),
            Ty::I32 => write!(f, "i32"),
            Ty::I64 => write!(f, "i64"),
            Ty::F64 => write!(f, "f64"),
            Ty::Ptr => write!(f, "ptr"),
            Ty::Vector { elem, lanes } => write!(f, "<{} x {}>", lanes, elem),
            Ty::Void => write!(f, "void"),
        }
    }
}

/// A typed value available at some point in the CFG. Constants are immediate,
/// globals name module data, locals are addressable slots, and temporaries are
/// single-assignment results of instructions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    ConstInt { ty: Ty, value: i64 },
    ConstFloat { value: f64 },
    ConstVector { ty: Ty, elems: Vec<Value> },
    Undef(Ty),
    Global { name: String, ty: Ty },
    Local { id: LocalId, ty: Ty },
    Temp { id: TempId, ty: Ty },
}

impl Value {
    pub fn int(ty: Ty, value: i64) -> Value {
        Value::ConstInt { ty, value }
    }

    pub fn i64(value: i64) -> Value {
        Value::ConstInt { ty: Ty::I64, value }
    }

    pub fn i32(value: i64) -> Value {
        Value::ConstInt { ty: Ty::I32, value }
    }

    pub fn bool(value: bool) -> Value {
        Value::ConstInt {
            ty: Ty::I1,
            value: value as i64,
        }
    }

    pub fn f64(value: f64) -> Value {
        Value::ConstFloat { value }
    }

    /// Placeholder result of a `Void`-typed expression. Using it as an
    /// operand fails type validation, which is the point.
    pub fn unit() -> Value {
        Value::Undef(Ty::Void)
    }

    pub fn ty(&self) -> Ty {
        match self {
            Value::ConstInt { ty, .. } => ty.clone(),
            Value::ConstFloat { .. } => Ty::F64,
            Value::ConstVector { ty, .. } => ty.clone(),
            Value::Undef(ty) => ty.clone(),
            Value::Global { ty, .. } => ty.clone(),
            Value::Local { ty, .. } => ty.clone(),
            Value::Temp { ty, .. } => ty.clone(),
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Value::Local { .. })
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::ConstInt { value, .. } => write!(f, "{}", value),
            Value::ConstFloat { value } => write!(f, "{:?}", value),
            Value::ConstVector { elems, .. } => {
                write!(f, "<{}>", elems.iter().map(|e| e.to_string()).join(", "))
            }
            Value::Undef(_) => write!(f, "undef"),
            Value::Global { name, .. } => write!(f, "@{}", name),
            Value::Local { id, .. } => write!(f, "%l{}", id),
            Value::Temp { id, .. } => write!(f, "%{}", id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

impl BinOp {
    pub fn as_str(self) -> &'static str {
        match self {
            BinOp::Add => "add",
            BinOp::Sub => "sub",
            BinOp::Mul => "mul",
            BinOp::Div => "div",
            BinOp::Rem => "rem",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    pub fn as_str(self) -> &'static str {
        match self {
            CmpOp::Eq => "eq",
            CmpOp::Ne => "ne",
            CmpOp::Lt => "lt",
            CmpOp::Le => "le",
            CmpOp::Gt => "gt",
            CmpOp::Ge => "ge",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnOp {
    Neg,
    Not,
}

impl UnOp {
    pub fn as_str(self) -> &'static str {
        match self {
            UnOp::Neg => "neg",
            UnOp::Not => "not",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CastKind {
    Trunc,
    Zext,
    Sext,
    SiToFp,
    FpToSi,
    IntToPtr,
    PtrToInt,
    Bitcast,
}

impl CastKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CastKind::Trunc => "trunc",
            CastKind::Zext => "zext",
            CastKind::Sext => "sext",
            CastKind::SiToFp => "sitofp",
            CastKind::FpToSi => "fptosi",
            CastKind::IntToPtr => "inttoptr",
            CastKind::PtrToInt => "ptrtoint",
            CastKind::Bitcast => "bitcast",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReduceOp {
    Add,
    FAdd,
}

impl ReduceOp {
    pub fn as_str(self) -> &'static str {
        match self {
            ReduceOp::Add => "reduce_add",
            ReduceOp::FAdd => "reduce_fadd",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum InstKind {
    // Arithmetic and comparison
    Binary {
        op: BinOp,
        lhs: Value,
        rhs: Value,
    },
    Cmp {
        op: CmpOp,
        lhs: Value,
        rhs: Value,
    },
    Unary {
        op: UnOp,
        operand: Value,
    },

    // Local slot memory
    Alloca {
        slot: LocalId,
    },
    Load {
        place: Value,
    },
    Store {
        place: Value,
        value: Value,
    },

    // Raw pointer memory, used by the synthesized accessor helpers
    PtrLoad {
        addr: Value,
    },
    PtrStore {
        addr: Value,
        value: Value,
    },

    // Type conversion; the target type is the instruction's result type
    Cast {
        kind: CastKind,
        value: Value,
    },

    // Fixed-width vectors
    InsertElement {
        vector: Value,
        element: Value,
        lane: u32,
    },
    ExtractElement {
        vector: Value,
        lane: u32,
    },
    Reduce {
        op: ReduceOp,
        vector: Value,
        seed: Option<Value>,
    },

    Call {
        callee: String,
        args: Vec<Value>,
    },

    Phi {
        incoming: Vec<(Value, BlockId)>,
    },
}

impl InstKind {
    pub fn is_phi(&self) -> bool {
        matches!(self, InstKind::Phi { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Terminator {
    Branch {
        cond: Value,
        then_to: BlockId,
        else_to: BlockId,
    },
    Jump(BlockId),
    Return(Option<Value>),
    Unreachable,
}

impl Terminator {
    pub fn successors(&self) -> Vec<BlockId> {
        match self {
            Terminator::Branch {
                then_to, else_to, ..
            } => vec![*then_to, *else_to],
            Terminator::Jump(target) => vec![*target],
            Terminator::Return(_) | Terminator::Unreachable => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebugLoc {
    pub line: u32,
    pub column: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    /// Result temporary; `None` for value-less instructions (stores, void calls).
    pub result: Option<TempId>,
    /// Result type; `Void` when there is no result.
    pub ty: Ty,
    pub kind: InstKind,
    pub loc: Option<DebugLoc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasicBlock {
    pub id: BlockId,
    pub label: String,
    pub instructions: Vec<Instruction>,
    /// `None` only while the block is still under construction; finalization
    /// guarantees `Some`.
    pub terminator: Option<Terminator>,
}

impl BasicBlock {
    pub fn new(id: BlockId, label: impl Into<String>) -> Self {
        Self {
            id,
            label: label.into(),
            instructions: Vec::new(),
            terminator: None,
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.terminator.is_some()
    }

    /// Phi instructions sit at the head of a block, before anything else.
    pub fn phi_count(&self) -> usize {
        self.instructions
            .iter()
            .take_while(|inst| inst.kind.is_phi())
            .count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub params: Vec<Ty>,
    pub ret: Ty,
    pub variadic: bool,
}

impl Signature {
    pub fn new(params: Vec<Ty>, ret: Ty) -> Self {
        Self {
            params,
            ret,
            variadic: false,
        }
    }

    pub fn variadic(params: Vec<Ty>, ret: Ty) -> Self {
        Self {
            params,
            ret,
            variadic: true,
        }
    }
}

impl std::fmt::Display for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let params = self.params.iter().map(|t| t.to_string()).join(", ");
        if self.variadic {
            write!(f, "({}, ...) -> {}", params, self.ret)
        } else {
            write!(f, "({}) -> {}", params, self.ret)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionParam {
    pub name: String,
    pub ty: Ty,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalSlot {
    pub id: LocalId,
    pub name: String,
    pub ty: Ty,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubprogramInfo {
    pub name: String,
    pub file: String,
    pub line: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    pub params: Vec<FunctionParam>,
    pub signature: Signature,
    pub blocks: Vec<BasicBlock>,
    pub locals: Vec<LocalSlot>,
    pub debug: Option<SubprogramInfo>,
}

impl Function {
    pub fn entry(&self) -> &BasicBlock {
        &self.blocks[0]
    }

    pub fn block(&self, id: BlockId) -> Option<&BasicBlock> {
        self.blocks.get(id as usize)
    }

    pub fn block_by_label(&self, label: &str) -> Option<&BasicBlock> {
        self.blocks.iter().find(|b| b.label == label)
    }

    pub fn successors_of(&self, id: BlockId) -> Vec<BlockId> {
        self.block(id)
            .and_then(|b| b.terminator.as_ref())
            .map(|t| t.successors())
            .unwrap_or_default()
    }

    /// Predecessors are derived from terminators rather than stored, so they
    /// can never drift out of sync with the actual edges.
    pub fn predecessors_of(&self, id: BlockId) -> Vec<BlockId> {
        self.blocks
            .iter()
            .filter(|b| {
                b.terminator
                    .as_ref()
                    .map(|t| t.successors().contains(&id))
                    .unwrap_or(false)
            })
            .map(|b| b.id)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternDecl {
    pub name: String,
    pub signature: Signature,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalData {
    pub name: String,
    pub bytes: Vec<u8>,
}

/// One monomorphization of a generic function: the key that produced it and
/// the mangled name of the concrete definition in the module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenericInstantiation {
    pub base: String,
    pub type_args: Vec<Ty>,
    pub mangled: String,
}

impl GenericInstantiation {
    pub fn new(base: impl Into<String>, type_args: Vec<Ty>) -> Self {
        let base = base.into();
        let mangled = mangle_name(&base, &type_args);
        Self {
            base,
            type_args,
            mangled,
        }
    }
}

/// Mangle a generic base name with its concrete type arguments. Zero
/// arguments leave the name untouched.
pub fn mangle_name(base: &str, type_args: &[Ty]) -> String {
    if type_args.is_empty() {
        base.to_string()
    } else {
        let args = type_args.iter().map(mangle_ty).join("_");
        format!("{}${}", base, args)
    }
}

fn mangle_ty(ty: &Ty) -> String {
    match ty {
        Ty::I1 => "i1".to_string(),
        Ty::I8 => "i8".to_string(),
        Ty::I32 => "i32".to_string(),
        Ty::I64 => "i64".to_string(),
        Ty::F64 => "f64".to_string(),
        Ty::Ptr => "ptr".to_string(),
        Ty::Vector { elem, lanes } => format!("vec{}x{}", lanes, mangle_ty(elem)),
        Ty::Void => "void".to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleDebugInfo {
    pub file: String,
    pub producer: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Module {
    pub name: String,
    pub functions: Vec<Function>,
    pub declarations: Vec<ExternDecl>,
    pub globals: Vec<GlobalData>,
    pub instantiations: Vec<GenericInstantiation>,
    pub debug: Option<ModuleDebugInfo>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            functions: Vec::new(),
            declarations: Vec::new(),
            globals: Vec::new(),
            instantiations: Vec::new(),
            debug: None,
        }
    }

    pub fn add_function(&mut self, function: Function) {
        self.functions.push(function);
    }

    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }

    pub fn declaration(&self, name: &str) -> Option<&ExternDecl> {
        self.declarations.iter().find(|d| d.name == name)
    }

    pub fn global(&self, name: &str) -> Option<&GlobalData> {
        self.globals.iter().find(|g| g.name == name)
    }
}

/// Finalization check over an assembled function: every block terminated,
/// branch targets resolved, no unreachable non-entry blocks, phis at block
/// heads with incoming sets matching the actual predecessors.
pub fn verify_function(function: &Function) -> Result<()> {
    if function.blocks.is_empty() {
        return Err(Error::InvalidBlockState(format!(
            "function `{}` has no blocks",
            function.name
        )));
    }
    for block in &function.blocks {
        let terminator = block.terminator.as_ref().ok_or_else(|| {
            Error::InvalidBlockState(format!(
                "block `{}` in `{}` has no terminator",
                block.label, function.name
            ))
        })?;
        for target in terminator.successors() {
            if function.block(target).is_none() {
                return Err(Error::UnresolvedLabel(format!(
                    "{} -> bb{}",
                    block.label, target
                )));
            }
        }
        let phi_head = block.phi_count();
        for inst in block.instructions.iter().skip(phi_head) {
            if inst.kind.is_phi() {
                return Err(Error::InvalidBlockState(format!(
                    "phi after non-phi instruction in block `{}`",
                    block.label
                )));
            }
        }
        if block.id != 0 && function.predecessors_of(block.id).is_empty() {
            return Err(Error::InvalidBlockState(format!(
                "block `{}` in `{}` is unreachable",
                block.label, function.name
            )));
        }
        verify_phis(function, block)?;
    }
    Ok(())
}

fn verify_phis(function: &Function, block: &BasicBlock) -> Result<()> {
    let mut preds = function.predecessors_of(block.id);
    preds.sort_unstable();
    for inst in block.instructions.iter().take(block.phi_count()) {
        let incoming = match &inst.kind {
            InstKind::Phi { incoming } => incoming,
            _ => continue,
        };
        let mut sources: Vec<BlockId> = incoming.iter().map(|(_, b)| *b).collect();
        sources.sort_unstable();
        sources.dedup();
        for source in &sources {
            if function.block(*source).is_none() {
                return Err(Error::UnresolvedLabel(format!(
                    "phi in `{}` references bb{}",
                    block.label, source
                )));
            }
        }
        if sources != preds {
            return Err(Error::UnresolvedLabel(format!(
                "phi in `{}` covers blocks {:?} but predecessors are {:?}",
                block.label, sources, preds
            )));
        }
        for (value, _) in incoming {
            if value.ty() != inst.ty {
                return Err(Error::type_mismatch(&inst.ty, value.ty()));
            }
        }
    }
    Ok(())
}
