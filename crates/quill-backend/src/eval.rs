//! A reference interpreter for lowered modules.
//!
//! Walks the block graph directly, resolving phis against the edge the
//! execution actually took. Globals live in a flat byte arena so the
//! synthesized memory accessors and the panic path behave like the real
//! runtime: `write` to fd 2 is captured, `exit` unwinds as an outcome.
//! Externs beyond `strlen`/`write`/`exit` are out of scope here.

use std::collections::HashMap;

use quill_core::error::{Error, Result};
use quill_core::ir::{
    BinOp, BlockId, CastKind, CmpOp, Function, InstKind, LocalId, Module, ReduceOp, TempId,
    Terminator, Ty, UnOp, Value,
};
use quill_core::tracing::debug;

const LOG_AREA: &str = "[eval]";

const ARENA_SIZE: usize = 1 << 16;
const STEP_LIMIT: u64 = 1_000_000;

#[derive(Debug, Clone, PartialEq)]
pub enum EvalValue {
    Int(i64),
    Float(f64),
    Vector(Vec<EvalValue>),
    Unit,
}

impl EvalValue {
    pub fn as_int(&self) -> Result<i64> {
        match self {
            EvalValue::Int(value) => Ok(*value),
            other => Err(Error::Generic(format!("expected an integer, got {:?}", other))),
        }
    }

    pub fn as_float(&self) -> Result<f64> {
        match self {
            EvalValue::Float(value) => Ok(*value),
            other => Err(Error::Generic(format!("expected a float, got {:?}", other))),
        }
    }
}

/// How a program run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The entry function returned normally.
    Return(EvalValue),
    /// Generated code called `exit`.
    Exit(i32),
}

enum Flow {
    Value(EvalValue),
    Exit(i32),
}

pub struct Evaluator<'m> {
    module: &'m Module,
    memory: Vec<u8>,
    global_addrs: HashMap<String, i64>,
    stderr: Vec<u8>,
    steps: u64,
}

impl<'m> Evaluator<'m> {
    pub fn new(module: &'m Module) -> Self {
        // Address 0 stays unmapped; globals pack in from 16.
        let mut memory = vec![0u8; 16];
        let mut global_addrs = HashMap::new();
        for global in &module.globals {
            global_addrs.insert(global.name.clone(), memory.len() as i64);
            memory.extend_from_slice(&global.bytes);
        }
        if memory.len() < ARENA_SIZE {
            memory.resize(ARENA_SIZE, 0);
        }
        Self {
            module,
            memory,
            global_addrs,
            stderr: Vec::new(),
            steps: 0,
        }
    }

    /// Bytes generated code wrote to fd 2.
    pub fn stderr(&self) -> &[u8] {
        &self.stderr
    }

    /// Run `name` with `args` to completion.
    pub fn call(&mut self, name: &str, args: &[EvalValue]) -> Result<Outcome> {
        debug!("{} call `{}`", LOG_AREA, name);
        match self.call_symbol(name, args.to_vec())? {
            Flow::Value(value) => Ok(Outcome::Return(value)),
            Flow::Exit(code) => Ok(Outcome::Exit(code)),
        }
    }

    fn call_symbol(&mut self, name: &str, args: Vec<EvalValue>) -> Result<Flow> {
        let module = self.module;
        if let Some(function) = module.function(name) {
            return self.run_function(function, args);
        }
        self.call_extern(name, &args)
    }

    fn run_function(&mut self, function: &Function, args: Vec<EvalValue>) -> Result<Flow> {
        if args.len() != function.params.len() {
            return Err(Error::Generic(format!(
                "`{}` takes {} arguments, {} given",
                function.name,
                function.params.len(),
                args.len()
            )));
        }
        let mut temps: HashMap<TempId, EvalValue> = HashMap::new();
        for (index, arg) in args.into_iter().enumerate() {
            temps.insert(index as TempId, arg);
        }
        let mut locals: HashMap<LocalId, EvalValue> = HashMap::new();
        let mut current: BlockId = 0;
        let mut previous: Option<BlockId> = None;

        loop {
            self.tick()?;
            let block = function
                .blocks
                .get(current as usize)
                .ok_or_else(|| Error::UnresolvedLabel(format!("bb{}", current)))?;

            for inst in &block.instructions {
                self.tick()?;
                let value = match &inst.kind {
                    InstKind::Phi { incoming } => {
                        let from = previous.ok_or_else(|| {
                            Error::InvalidBlockState("phi in the entry block".to_string())
                        })?;
                        let (value, _) = incoming
                            .iter()
                            .find(|(_, pred)| *pred == from)
                            .ok_or_else(|| {
                                Error::UnresolvedLabel(format!(
                                    "phi in `{}` has no incoming for bb{}",
                                    block.label, from
                                ))
                            })?;
                        self.operand(value, &temps, &locals)?
                    }
                    InstKind::Binary { op, lhs, rhs } => {
                        let lhs = self.operand(lhs, &temps, &locals)?;
                        let rhs = self.operand(rhs, &temps, &locals)?;
                        binary_value(*op, &lhs, &rhs)?
                    }
                    InstKind::Cmp { op, lhs, rhs } => {
                        let lhs = self.operand(lhs, &temps, &locals)?;
                        let rhs = self.operand(rhs, &temps, &locals)?;
                        cmp_value(*op, &lhs, &rhs)?
                    }
                    InstKind::Unary { op, operand } => {
                        let value = self.operand(operand, &temps, &locals)?;
                        unary_value(*op, &inst.ty, &value)?
                    }
                    InstKind::Alloca { .. } => EvalValue::Unit,
                    InstKind::Load { place } => {
                        let slot = local_slot(place)?;
                        locals.get(&slot).cloned().ok_or_else(|| {
                            Error::Generic(format!("load from uninitialized slot {}", slot))
                        })?
                    }
                    InstKind::Store { place, value } => {
                        let slot = local_slot(place)?;
                        let value = self.operand(value, &temps, &locals)?;
                        locals.insert(slot, value);
                        EvalValue::Unit
                    }
                    InstKind::PtrLoad { addr } => {
                        let addr = self.operand(addr, &temps, &locals)?.as_int()?;
                        self.mem_load(addr, &inst.ty)?
                    }
                    InstKind::PtrStore { addr, value } => {
                        let target = self.operand(addr, &temps, &locals)?.as_int()?;
                        let ty = value.ty();
                        let value = self.operand(value, &temps, &locals)?.as_int()?;
                        self.mem_store(target, &ty, value)?;
                        EvalValue::Unit
                    }
                    InstKind::Cast { kind, value } => {
                        let from = value.ty();
                        let value = self.operand(value, &temps, &locals)?;
                        cast_value(*kind, &from, &inst.ty, &value)?
                    }
                    InstKind::InsertElement {
                        vector,
                        element,
                        lane,
                    } => {
                        let mut lanes = vector_lanes(self.operand(vector, &temps, &locals)?)?;
                        let element = self.operand(element, &temps, &locals)?;
                        let index = *lane as usize;
                        if index >= lanes.len() {
                            return Err(Error::VectorShapeMismatch {
                                lhs: format!("{} lanes", lanes.len()),
                                rhs: format!("lane {}", lane),
                            });
                        }
                        lanes[index] = element;
                        EvalValue::Vector(lanes)
                    }
                    InstKind::ExtractElement { vector, lane } => {
                        let lanes = vector_lanes(self.operand(vector, &temps, &locals)?)?;
                        lanes.get(*lane as usize).cloned().ok_or_else(|| {
                            Error::VectorShapeMismatch {
                                lhs: format!("{} lanes", lanes.len()),
                                rhs: format!("lane {}", lane),
                            }
                        })?
                    }
                    InstKind::Reduce { op, vector, seed } => {
                        let lanes = vector_lanes(self.operand(vector, &temps, &locals)?)?;
                        let seed = match seed {
                            Some(seed) => Some(self.operand(seed, &temps, &locals)?),
                            None => None,
                        };
                        reduce_value(*op, &lanes, seed)?
                    }
                    InstKind::Call { callee, args } => {
                        let mut values = Vec::with_capacity(args.len());
                        for arg in args {
                            values.push(self.operand(arg, &temps, &locals)?);
                        }
                        match self.call_symbol(callee, values)? {
                            Flow::Value(value) => value,
                            Flow::Exit(code) => return Ok(Flow::Exit(code)),
                        }
                    }
                };
                if let Some(id) = inst.result {
                    temps.insert(id, value);
                }
            }

            let terminator = block.terminator.as_ref().ok_or_else(|| {
                Error::InvalidBlockState(format!("`{}` has no terminator", block.label))
            })?;
            match terminator {
                Terminator::Branch {
                    cond,
                    then_to,
                    else_to,
                } => {
                    let cond = self.operand(cond, &temps, &locals)?.as_int()?;
                    previous = Some(current);
                    current = if cond != 0 { *then_to } else { *else_to };
                }
                Terminator::Jump(target) => {
                    previous = Some(current);
                    current = *target;
                }
                Terminator::Return(value) => {
                    let value = match value {
                        Some(value) => self.operand(value, &temps, &locals)?,
                        None => EvalValue::Unit,
                    };
                    return Ok(Flow::Value(value));
                }
                Terminator::Unreachable => {
                    return Err(Error::InvalidBlockState(format!(
                        "reached `unreachable` in `{}`",
                        function.name
                    )));
                }
            }
        }
    }

    fn tick(&mut self) -> Result<()> {
        self.steps += 1;
        if self.steps > STEP_LIMIT {
            return Err(Error::Generic("evaluation step limit exceeded".to_string()));
        }
        Ok(())
    }

    fn operand(
        &self,
        value: &Value,
        temps: &HashMap<TempId, EvalValue>,
        locals: &HashMap<LocalId, EvalValue>,
    ) -> Result<EvalValue> {
        match value {
            Value::ConstInt { value, .. } => Ok(EvalValue::Int(*value)),
            Value::ConstFloat { value } => Ok(EvalValue::Float(*value)),
            Value::ConstVector { elems, .. } => elems
                .iter()
                .map(|elem| self.operand(elem, temps, locals))
                .collect::<Result<Vec<_>>>()
                .map(EvalValue::Vector),
            Value::Undef(ty) => Ok(default_of(ty)),
            Value::Global { name, .. } => self
                .global_addrs
                .get(name)
                .map(|addr| EvalValue::Int(*addr))
                .ok_or_else(|| Error::UnknownSymbol(name.clone())),
            Value::Local { id, .. } => locals
                .get(id)
                .cloned()
                .ok_or_else(|| Error::Generic(format!("slot {} used as a value", id))),
            Value::Temp { id, .. } => temps
                .get(id)
                .cloned()
                .ok_or_else(|| Error::Generic(format!("temporary %{} is undefined", id))),
        }
    }

    fn call_extern(&mut self, name: &str, args: &[EvalValue]) -> Result<Flow> {
        match name {
            "strlen" => {
                let addr = arg(args, 0)?.as_int()? as usize;
                let tail = self
                    .memory
                    .get(addr..)
                    .ok_or_else(|| Error::Generic(format!("address {} out of range", addr)))?;
                let len = tail
                    .iter()
                    .position(|byte| *byte == 0)
                    .ok_or_else(|| Error::Generic("unterminated string".to_string()))?;
                Ok(Flow::Value(EvalValue::Int(len as i64)))
            }
            "write" => {
                let fd = arg(args, 0)?.as_int()?;
                let addr = arg(args, 1)?.as_int()? as usize;
                let len = arg(args, 2)?.as_int()? as usize;
                let bytes = self.memory.get(addr..addr + len).ok_or_else(|| {
                    Error::Generic(format!("write of {} bytes at {} out of range", len, addr))
                })?;
                if fd == 2 {
                    self.stderr.extend_from_slice(bytes);
                }
                Ok(Flow::Value(EvalValue::Int(len as i64)))
            }
            "exit" => {
                let code = arg(args, 0)?.as_int()? as i32;
                Ok(Flow::Exit(code))
            }
            other => Err(Error::UnknownSymbol(format!(
                "extern `{}` is not modeled by the evaluator",
                other
            ))),
        }
    }

    fn mem_load(&self, addr: i64, ty: &Ty) -> Result<EvalValue> {
        let addr = addr as usize;
        match ty {
            Ty::I8 => {
                let byte = *self
                    .memory
                    .get(addr)
                    .ok_or_else(|| Error::Generic(format!("load at {} out of range", addr)))?;
                Ok(EvalValue::Int((byte as i8) as i64))
            }
            Ty::I64 => {
                let bytes = self.memory.get(addr..addr + 8).ok_or_else(|| {
                    Error::Generic(format!("load of 8 bytes at {} out of range", addr))
                })?;
                let mut raw = [0u8; 8];
                raw.copy_from_slice(bytes);
                Ok(EvalValue::Int(i64::from_le_bytes(raw)))
            }
            other => Err(Error::type_mismatch("i8 or i64 pointer load", other)),
        }
    }

    fn mem_store(&mut self, addr: i64, ty: &Ty, value: i64) -> Result<()> {
        let addr = addr as usize;
        match ty {
            Ty::I8 => {
                let slot = self
                    .memory
                    .get_mut(addr)
                    .ok_or_else(|| Error::Generic(format!("store at {} out of range", addr)))?;
                *slot = value as u8;
                Ok(())
            }
            Ty::I64 => {
                let bytes = self.memory.get_mut(addr..addr + 8).ok_or_else(|| {
                    Error::Generic(format!("store of 8 bytes at {} out of range", addr))
                })?;
                bytes.copy_from_slice(&value.to_le_bytes());
                Ok(())
            }
            other => Err(Error::type_mismatch("i8 or i64 pointer store", other)),
        }
    }
}

fn arg(args: &[EvalValue], index: usize) -> Result<&EvalValue> {
    args.get(index)
        .ok_or_else(|| Error::Generic(format!("missing argument {}", index)))
}

fn local_slot(place: &Value) -> Result<LocalId> {
    match place {
        Value::Local { id, .. } => Ok(*id),
        other => Err(Error::type_mismatch("addressable local", other.ty())),
    }
}

fn vector_lanes(value: EvalValue) -> Result<Vec<EvalValue>> {
    match value {
        EvalValue::Vector(lanes) => Ok(lanes),
        other => Err(Error::Generic(format!("expected a vector, got {:?}", other))),
    }
}

fn default_of(ty: &Ty) -> EvalValue {
    match ty {
        Ty::F64 => EvalValue::Float(0.0),
        Ty::Vector { elem, lanes } => {
            EvalValue::Vector(vec![default_of(elem); *lanes as usize])
        }
        Ty::Void => EvalValue::Unit,
        _ => EvalValue::Int(0),
    }
}

fn binary_value(op: BinOp, lhs: &EvalValue, rhs: &EvalValue) -> Result<EvalValue> {
    match (lhs, rhs) {
        (EvalValue::Int(a), EvalValue::Int(b)) => int_binary(op, *a, *b),
        (EvalValue::Float(a), EvalValue::Float(b)) => Ok(EvalValue::Float(float_binary(op, *a, *b))),
        (EvalValue::Vector(a), EvalValue::Vector(b)) => {
            if a.len() != b.len() {
                return Err(Error::VectorShapeMismatch {
                    lhs: format!("{} lanes", a.len()),
                    rhs: format!("{} lanes", b.len()),
                });
            }
            a.iter()
                .zip(b)
                .map(|(x, y)| binary_value(op, x, y))
                .collect::<Result<Vec<_>>>()
                .map(EvalValue::Vector)
        }
        _ => Err(Error::Generic("mismatched operand kinds".to_string())),
    }
}

fn int_binary(op: BinOp, a: i64, b: i64) -> Result<EvalValue> {
    let value = match op {
        BinOp::Add => a.wrapping_add(b),
        BinOp::Sub => a.wrapping_sub(b),
        BinOp::Mul => a.wrapping_mul(b),
        BinOp::Div => {
            if b == 0 {
                return Err(Error::Generic("division by zero".to_string()));
            }
            a.wrapping_div(b)
        }
        BinOp::Rem => {
            if b == 0 {
                return Err(Error::Generic("remainder by zero".to_string()));
            }
            a.wrapping_rem(b)
        }
    };
    Ok(EvalValue::Int(value))
}

fn float_binary(op: BinOp, a: f64, b: f64) -> f64 {
    match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div => a / b,
        BinOp::Rem => a % b,
    }
}

fn cmp_value(op: CmpOp, lhs: &EvalValue, rhs: &EvalValue) -> Result<EvalValue> {
    let holds = match (lhs, rhs) {
        (EvalValue::Int(a), EvalValue::Int(b)) => match op {
            CmpOp::Eq => a == b,
            CmpOp::Ne => a != b,
            CmpOp::Lt => a < b,
            CmpOp::Le => a <= b,
            CmpOp::Gt => a > b,
            CmpOp::Ge => a >= b,
        },
        (EvalValue::Float(a), EvalValue::Float(b)) => match op {
            CmpOp::Eq => a == b,
            CmpOp::Ne => a != b,
            CmpOp::Lt => a < b,
            CmpOp::Le => a <= b,
            CmpOp::Gt => a > b,
            CmpOp::Ge => a >= b,
        },
        _ => return Err(Error::Generic("mismatched comparison operands".to_string())),
    };
    Ok(EvalValue::Int(holds as i64))
}

fn unary_value(op: UnOp, ty: &Ty, value: &EvalValue) -> Result<EvalValue> {
    match (op, value) {
        (UnOp::Neg, EvalValue::Int(v)) => Ok(EvalValue::Int(v.wrapping_neg())),
        (UnOp::Neg, EvalValue::Float(v)) => Ok(EvalValue::Float(-v)),
        (UnOp::Neg, EvalValue::Vector(lanes)) => lanes
            .iter()
            .map(|lane| unary_value(op, ty, lane))
            .collect::<Result<Vec<_>>>()
            .map(EvalValue::Vector),
        (UnOp::Not, EvalValue::Int(v)) => {
            if *ty == Ty::I1 {
                Ok(EvalValue::Int((*v == 0) as i64))
            } else {
                Ok(EvalValue::Int(!v))
            }
        }
        _ => Err(Error::Generic("invalid unary operand".to_string())),
    }
}

fn cast_value(kind: CastKind, from: &Ty, to: &Ty, value: &EvalValue) -> Result<EvalValue> {
    match kind {
        CastKind::Trunc => {
            let v = value.as_int()?;
            let out = match to {
                Ty::I1 => v & 1,
                Ty::I8 => (v as i8) as i64,
                Ty::I32 => (v as i32) as i64,
                _ => v,
            };
            Ok(EvalValue::Int(out))
        }
        CastKind::Zext => {
            let v = value.as_int()? as u64;
            let masked = match from {
                Ty::I1 => v & 0x1,
                Ty::I8 => v & 0xff,
                Ty::I32 => v & 0xffff_ffff,
                _ => v,
            };
            Ok(EvalValue::Int(masked as i64))
        }
        CastKind::Sext => Ok(EvalValue::Int(value.as_int()?)),
        CastKind::SiToFp => Ok(EvalValue::Float(value.as_int()? as f64)),
        CastKind::FpToSi => Ok(EvalValue::Int(value.as_float()? as i64)),
        CastKind::IntToPtr | CastKind::PtrToInt => Ok(EvalValue::Int(value.as_int()?)),
        CastKind::Bitcast => match (from, to) {
            (Ty::I64, Ty::F64) => Ok(EvalValue::Float(f64::from_bits(value.as_int()? as u64))),
            (Ty::F64, Ty::I64) => Ok(EvalValue::Int(value.as_float()?.to_bits() as i64)),
            _ => Ok(value.clone()),
        },
    }
}

fn reduce_value(op: ReduceOp, lanes: &[EvalValue], seed: Option<EvalValue>) -> Result<EvalValue> {
    match op {
        ReduceOp::Add => {
            let mut acc: i64 = 0;
            for lane in lanes {
                acc = acc.wrapping_add(lane.as_int()?);
            }
            Ok(EvalValue::Int(acc))
        }
        ReduceOp::FAdd => {
            let mut acc = match seed {
                Some(seed) => seed.as_float()?,
                None => return Err(Error::Generic("float reduction without a seed".to_string())),
            };
            for lane in lanes {
                acc += lane.as_float()?;
            }
            Ok(EvalValue::Float(acc))
        }
    }
}
