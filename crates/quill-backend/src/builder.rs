//! Mutable construction API for a single function's basic-block graph.
//!
//! The builder hands out block ids, tracks the current insertion block, and
//! validates every instruction at append time so malformed graphs are caught
//! where they are produced, not later. `finish` runs the finalization pass
//! and yields an immutable [`Function`].

use std::collections::HashMap;

use quill_core::error::{Error, Result};
use quill_core::ir::{
    self, BasicBlock, BlockId, CastKind, DebugLoc, Function, FunctionParam, InstKind, Instruction,
    LocalId, LocalSlot, ReduceOp, Signature, SubprogramInfo, TempId, Terminator, Ty, Value,
};
use quill_core::tracing::debug;

const LOG_AREA: &str = "[build]";

pub const ENTRY_LABEL: &str = "entry";

pub struct FunctionBuilder {
    name: String,
    params: Vec<FunctionParam>,
    ret: Ty,
    blocks: Vec<BasicBlock>,
    locals: Vec<LocalSlot>,
    current: BlockId,
    next_temp: TempId,
    label_uses: HashMap<String, u32>,
    subprogram: Option<SubprogramInfo>,
    loc: Option<DebugLoc>,
}

impl FunctionBuilder {
    /// Start a function whose entry block is already in place. Parameters
    /// occupy the first temporary ids, so body temporaries continue the
    /// numbering after the last parameter.
    pub fn new(name: impl Into<String>, params: Vec<(String, Ty)>, ret: Ty) -> Self {
        let name = name.into();
        let params: Vec<FunctionParam> = params
            .into_iter()
            .map(|(name, ty)| FunctionParam { name, ty })
            .collect();
        let mut label_uses = HashMap::new();
        label_uses.insert(ENTRY_LABEL.to_string(), 1);
        debug!("{} start function `{}`", LOG_AREA, name);
        Self {
            next_temp: params.len() as TempId,
            params,
            ret,
            name,
            blocks: vec![BasicBlock::new(0, ENTRY_LABEL)],
            locals: Vec::new(),
            current: 0,
            label_uses,
            subprogram: None,
            loc: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn return_type(&self) -> &Ty {
        &self.ret
    }

    /// The value a parameter binds to: a pre-numbered temporary.
    pub fn param_value(&self, index: usize) -> Result<Value> {
        self.params
            .get(index)
            .map(|p| Value::Temp {
                id: index as TempId,
                ty: p.ty.clone(),
            })
            .ok_or_else(|| Error::UnknownSymbol(format!("parameter {}", index)))
    }

    pub fn set_subprogram(&mut self, info: SubprogramInfo) {
        self.subprogram = Some(info);
    }

    /// Debug location attached to subsequently appended instructions.
    pub fn set_loc(&mut self, loc: Option<DebugLoc>) {
        self.loc = loc;
    }

    /// Create a block labeled after `hint`, unique within the function
    /// (`then`, `then.1`, `then.2`, ...). Does not move the insertion point.
    pub fn new_block(&mut self, hint: &str) -> BlockId {
        let uses = self.label_uses.entry(hint.to_string()).or_insert(0);
        let label = if *uses == 0 {
            hint.to_string()
        } else {
            format!("{}.{}", hint, uses)
        };
        *uses += 1;
        let id = self.blocks.len() as BlockId;
        self.blocks.push(BasicBlock::new(id, label));
        id
    }

    pub fn set_insertion_point(&mut self, block: BlockId) -> Result<()> {
        if (block as usize) >= self.blocks.len() {
            return Err(Error::UnresolvedLabel(format!("bb{}", block)));
        }
        self.current = block;
        Ok(())
    }

    pub fn current_block(&self) -> BlockId {
        self.current
    }

    pub fn label(&self, block: BlockId) -> Result<&str> {
        self.blocks
            .get(block as usize)
            .map(|b| b.label.as_str())
            .ok_or_else(|| Error::UnresolvedLabel(format!("bb{}", block)))
    }

    pub fn is_terminated(&self, block: BlockId) -> bool {
        self.blocks
            .get(block as usize)
            .map(|b| b.is_terminated())
            .unwrap_or(false)
    }

    pub fn current_terminated(&self) -> bool {
        self.is_terminated(self.current)
    }

    /// Declare a local slot and emit its `alloca` at the insertion point.
    pub fn alloca(&mut self, name: &str, ty: Ty) -> Result<LocalId> {
        if ty == Ty::Void {
            return Err(Error::type_mismatch("sized type", &ty));
        }
        let id = self.locals.len() as LocalId;
        self.locals.push(LocalSlot {
            id,
            name: name.to_string(),
            ty,
        });
        self.append(Ty::Void, InstKind::Alloca { slot: id })?;
        Ok(id)
    }

    pub fn local_value(&self, id: LocalId) -> Result<Value> {
        self.locals
            .get(id as usize)
            .map(|slot| Value::Local {
                id,
                ty: slot.ty.clone(),
            })
            .ok_or_else(|| Error::UnknownSymbol(format!("local slot {}", id)))
    }

    /// Append an instruction to the current block. Returns the fresh result
    /// temporary, or `None` for `Void`-typed instructions.
    pub fn append(&mut self, ty: Ty, kind: InstKind) -> Result<Option<Value>> {
        let block = &self.blocks[self.current as usize];
        if block.is_terminated() {
            return Err(Error::InvalidBlockState(format!(
                "append after terminator in `{}`",
                block.label
            )));
        }
        if kind.is_phi() && block.phi_count() != block.instructions.len() {
            return Err(Error::InvalidBlockState(format!(
                "phi must precede other instructions in `{}`",
                block.label
            )));
        }
        self.validate(&ty, &kind)?;
        let result = if ty == Ty::Void {
            None
        } else {
            let id = self.next_temp;
            self.next_temp += 1;
            Some(id)
        };
        let value = result.map(|id| Value::Temp {
            id,
            ty: ty.clone(),
        });
        self.blocks[self.current as usize]
            .instructions
            .push(Instruction {
                result,
                ty,
                kind,
                loc: self.loc,
            });
        Ok(value)
    }

    /// Append an instruction that must produce a value.
    pub fn append_value(&mut self, ty: Ty, kind: InstKind) -> Result<Value> {
        match self.append(ty, kind)? {
            Some(value) => Ok(value),
            None => Err(Error::type_mismatch("value-producing instruction", "void")),
        }
    }

    /// Close the current block. Branch targets must already exist.
    pub fn terminate(&mut self, terminator: Terminator) -> Result<()> {
        let block = &self.blocks[self.current as usize];
        if block.is_terminated() {
            return Err(Error::InvalidBlockState(format!(
                "block `{}` already terminated",
                block.label
            )));
        }
        match &terminator {
            Terminator::Branch {
                cond,
                then_to,
                else_to,
            } => {
                if cond.ty() != Ty::I1 {
                    return Err(Error::type_mismatch(Ty::I1, cond.ty()));
                }
                self.check_target(*then_to)?;
                self.check_target(*else_to)?;
            }
            Terminator::Jump(target) => self.check_target(*target)?,
            Terminator::Return(value) => {
                let found = value.as_ref().map(|v| v.ty()).unwrap_or(Ty::Void);
                if found != self.ret {
                    return Err(Error::type_mismatch(&self.ret, found));
                }
            }
            Terminator::Unreachable => {}
        }
        self.blocks[self.current as usize].terminator = Some(terminator);
        Ok(())
    }

    fn check_target(&self, target: BlockId) -> Result<()> {
        if (target as usize) >= self.blocks.len() {
            return Err(Error::UnresolvedLabel(format!("bb{}", target)));
        }
        Ok(())
    }

    /// Finalize: run the structural pass and hand over the immutable function.
    pub fn finish(self) -> Result<Function> {
        let signature = Signature::new(
            self.params.iter().map(|p| p.ty.clone()).collect(),
            self.ret.clone(),
        );
        let function = Function {
            name: self.name,
            params: self.params,
            signature,
            blocks: self.blocks,
            locals: self.locals,
            debug: self.subprogram,
        };
        ir::verify_function(&function)?;
        debug!(
            "{} finished `{}`: {} blocks, {} temps",
            LOG_AREA,
            function.name,
            function.blocks.len(),
            self.next_temp
        );
        Ok(function)
    }

    fn validate(&self, ty: &Ty, kind: &InstKind) -> Result<()> {
        match kind {
            InstKind::Binary { lhs, rhs, .. } => {
                let (lt, rt) = (lhs.ty(), rhs.ty());
                if lt != rt {
                    if lt.is_vector() && rt.is_vector() {
                        return Err(Error::VectorShapeMismatch {
                            lhs: lt.to_string(),
                            rhs: rt.to_string(),
                        });
                    }
                    return Err(Error::type_mismatch(lt, rt));
                }
                let elementwise_ok = match &lt {
                    Ty::Vector { elem, .. } => elem.is_arithmetic(),
                    other => other.is_arithmetic(),
                };
                if !elementwise_ok {
                    return Err(Error::type_mismatch("arithmetic operands", lt));
                }
                if *ty != lt {
                    return Err(Error::type_mismatch(lt, ty));
                }
            }
            InstKind::Cmp { lhs, rhs, .. } => {
                let (lt, rt) = (lhs.ty(), rhs.ty());
                if lt != rt {
                    return Err(Error::type_mismatch(lt, rt));
                }
                if !lt.is_arithmetic() {
                    return Err(Error::type_mismatch("scalar operands", lt));
                }
                if *ty != Ty::I1 {
                    return Err(Error::type_mismatch(Ty::I1, ty));
                }
            }
            InstKind::Unary { op, operand } => {
                let ot = operand.ty();
                match op {
                    ir::UnOp::Neg if !ot.is_arithmetic() => {
                        return Err(Error::type_mismatch("numeric operand", ot));
                    }
                    ir::UnOp::Not if !ot.is_integer() => {
                        return Err(Error::type_mismatch("integer operand", ot));
                    }
                    _ => {}
                }
                if *ty != ot {
                    return Err(Error::type_mismatch(ot, ty));
                }
            }
            InstKind::Alloca { slot } => {
                if (*slot as usize) >= self.locals.len() {
                    return Err(Error::UnknownSymbol(format!("local slot {}", slot)));
                }
                if *ty != Ty::Void {
                    return Err(Error::type_mismatch(Ty::Void, ty));
                }
            }
            InstKind::Load { place } => {
                if !place.is_local() {
                    return Err(Error::type_mismatch("addressable local", place.ty()));
                }
                if *ty != place.ty() {
                    return Err(Error::type_mismatch(place.ty(), ty));
                }
            }
            InstKind::Store { place, value } => {
                if !place.is_local() {
                    return Err(Error::type_mismatch("addressable local", place.ty()));
                }
                if value.ty() != place.ty() {
                    return Err(Error::type_mismatch(place.ty(), value.ty()));
                }
                if *ty != Ty::Void {
                    return Err(Error::type_mismatch(Ty::Void, ty));
                }
            }
            InstKind::PtrLoad { addr } => {
                if addr.ty() != Ty::Ptr {
                    return Err(Error::type_mismatch(Ty::Ptr, addr.ty()));
                }
                if *ty == Ty::Void {
                    return Err(Error::type_mismatch("sized type", ty));
                }
            }
            InstKind::PtrStore { addr, .. } => {
                if addr.ty() != Ty::Ptr {
                    return Err(Error::type_mismatch(Ty::Ptr, addr.ty()));
                }
                if *ty != Ty::Void {
                    return Err(Error::type_mismatch(Ty::Void, ty));
                }
            }
            InstKind::Cast { kind, value } => self.validate_cast(*kind, &value.ty(), ty)?,
            InstKind::InsertElement {
                vector,
                element,
                lane,
            } => {
                let vt = vector.ty();
                let (elem, lanes) = match &vt {
                    Ty::Vector { elem, lanes } => ((**elem).clone(), *lanes),
                    other => return Err(Error::type_mismatch("vector", other)),
                };
                if *lane >= lanes {
                    return Err(Error::VectorShapeMismatch {
                        lhs: vt.to_string(),
                        rhs: format!("lane {}", lane),
                    });
                }
                if element.ty() != elem {
                    return Err(Error::type_mismatch(elem, element.ty()));
                }
                if *ty != vt {
                    return Err(Error::type_mismatch(vt, ty));
                }
            }
            InstKind::ExtractElement { vector, lane } => {
                let vt = vector.ty();
                let (elem, lanes) = match &vt {
                    Ty::Vector { elem, lanes } => ((**elem).clone(), *lanes),
                    other => return Err(Error::type_mismatch("vector", other)),
                };
                if *lane >= lanes {
                    return Err(Error::VectorShapeMismatch {
                        lhs: vt.to_string(),
                        rhs: format!("lane {}", lane),
                    });
                }
                if *ty != elem {
                    return Err(Error::type_mismatch(elem, ty));
                }
            }
            InstKind::Reduce { op, vector, seed } => {
                let vt = vector.ty();
                let elem = match &vt {
                    Ty::Vector { elem, .. } => (**elem).clone(),
                    other => return Err(Error::type_mismatch("vector", other)),
                };
                match op {
                    ReduceOp::Add => {
                        if !elem.is_integer() {
                            return Err(Error::type_mismatch("integer lanes", elem));
                        }
                        if seed.is_some() {
                            return Err(Error::type_mismatch(
                                "seedless integer reduction",
                                "seed operand",
                            ));
                        }
                    }
                    ReduceOp::FAdd => {
                        // Ordered float reduction needs a start value.
                        let seed = seed.as_ref().ok_or_else(|| {
                            Error::type_mismatch("seeded float reduction", "missing seed")
                        })?;
                        if !elem.is_float() {
                            return Err(Error::type_mismatch("float lanes", elem));
                        }
                        if seed.ty() != elem {
                            return Err(Error::type_mismatch(&elem, seed.ty()));
                        }
                    }
                }
                if *ty != elem {
                    return Err(Error::type_mismatch(elem, ty));
                }
            }
            InstKind::Call { .. } => {
                // Callee resolution is the module lowering's concern.
            }
            InstKind::Phi { incoming } => {
                if incoming.is_empty() {
                    return Err(Error::InvalidBlockState("phi with no incoming".to_string()));
                }
                for (value, block) in incoming {
                    self.check_target(*block)?;
                    if value.ty() != *ty {
                        return Err(Error::type_mismatch(ty, value.ty()));
                    }
                }
            }
        }
        Ok(())
    }

    fn validate_cast(&self, kind: CastKind, from: &Ty, to: &Ty) -> Result<()> {
        let ok = match kind {
            CastKind::Trunc => {
                from.is_integer() && to.is_integer() && from.bit_width() > to.bit_width()
            }
            CastKind::Zext | CastKind::Sext => {
                from.is_integer() && to.is_integer() && from.bit_width() < to.bit_width()
            }
            CastKind::SiToFp => from.is_integer() && to.is_float(),
            CastKind::FpToSi => from.is_float() && to.is_integer(),
            CastKind::IntToPtr => *from == Ty::I64 && *to == Ty::Ptr,
            CastKind::PtrToInt => *from == Ty::Ptr && *to == Ty::I64,
            CastKind::Bitcast => from.bit_width() == to.bit_width() && from.bit_width().is_some(),
        };
        if ok {
            Ok(())
        } else {
            Err(Error::type_mismatch(
                format!("{} source for {}", kind.as_str(), to),
                from,
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_core::ir::{BinOp, CmpOp};

    fn builder() -> FunctionBuilder {
        FunctionBuilder::new("f", vec![("x".to_string(), Ty::I64)], Ty::I64)
    }

    #[test]
    fn params_take_first_temp_ids() {
        let mut b = builder();
        let x = b.param_value(0).unwrap();
        assert!(matches!(x, Value::Temp { id: 0, .. }));
        let sum = b
            .append_value(
                Ty::I64,
                InstKind::Binary {
                    op: BinOp::Add,
                    lhs: x.clone(),
                    rhs: Value::i64(1),
                },
            )
            .unwrap();
        assert!(matches!(sum, Value::Temp { id: 1, .. }));
    }

    #[test]
    fn append_after_terminator_is_rejected() {
        let mut b = builder();
        b.terminate(Terminator::Return(Some(Value::i64(0)))).unwrap();
        let err = b
            .append(
                Ty::I64,
                InstKind::Binary {
                    op: BinOp::Add,
                    lhs: Value::i64(1),
                    rhs: Value::i64(2),
                },
            )
            .unwrap_err();
        assert!(matches!(err, Error::InvalidBlockState(_)));
    }

    #[test]
    fn double_terminate_is_rejected() {
        let mut b = builder();
        b.terminate(Terminator::Return(Some(Value::i64(0)))).unwrap();
        let err = b.terminate(Terminator::Unreachable).unwrap_err();
        assert!(matches!(err, Error::InvalidBlockState(_)));
    }

    #[test]
    fn finish_requires_terminators_everywhere() {
        let mut b = builder();
        let next = b.new_block("next");
        b.terminate(Terminator::Jump(next)).unwrap();
        // `next` is never terminated.
        let err = b.finish().unwrap_err();
        assert!(matches!(err, Error::InvalidBlockState(_)));
    }

    #[test]
    fn orphan_blocks_are_rejected_at_finish() {
        let mut b = builder();
        let orphan = b.new_block("orphan");
        b.terminate(Terminator::Return(Some(Value::i64(0)))).unwrap();
        b.set_insertion_point(orphan).unwrap();
        b.terminate(Terminator::Return(Some(Value::i64(1)))).unwrap();
        let err = b.finish().unwrap_err();
        assert!(matches!(err, Error::InvalidBlockState(_)));
    }

    #[test]
    fn branch_to_missing_block_is_rejected() {
        let mut b = builder();
        let err = b.terminate(Terminator::Jump(42)).unwrap_err();
        assert!(matches!(err, Error::UnresolvedLabel(_)));
    }

    #[test]
    fn branch_condition_must_be_i1() {
        let mut b = builder();
        let t = b.new_block("t");
        let e = b.new_block("e");
        let err = b
            .terminate(Terminator::Branch {
                cond: Value::i64(1),
                then_to: t,
                else_to: e,
            })
            .unwrap_err();
        assert!(matches!(err, Error::TypeMismatch { .. }));
    }

    #[test]
    fn phi_incoming_must_match_predecessors() {
        let mut b = builder();
        let left = b.new_block("left");
        let right = b.new_block("right");
        let merge = b.new_block("merge");
        b.terminate(Terminator::Branch {
            cond: Value::bool(true),
            then_to: left,
            else_to: right,
        })
        .unwrap();
        b.set_insertion_point(left).unwrap();
        b.terminate(Terminator::Jump(merge)).unwrap();
        b.set_insertion_point(right).unwrap();
        b.terminate(Terminator::Jump(merge)).unwrap();
        b.set_insertion_point(merge).unwrap();
        // Claims only `left` feeds the phi; `right` does too.
        b.append(
            Ty::I64,
            InstKind::Phi {
                incoming: vec![(Value::i64(1), left)],
            },
        )
        .unwrap();
        b.terminate(Terminator::Return(Some(Value::i64(0)))).unwrap();
        let err = b.finish().unwrap_err();
        assert!(matches!(err, Error::UnresolvedLabel(_)));
    }

    #[test]
    fn phi_incoming_types_must_match_declared() {
        let mut b = builder();
        let side = b.new_block("side");
        let merge = b.new_block("merge");
        b.terminate(Terminator::Branch {
            cond: Value::bool(true),
            then_to: side,
            else_to: merge,
        })
        .unwrap();
        b.set_insertion_point(side).unwrap();
        b.terminate(Terminator::Jump(merge)).unwrap();
        b.set_insertion_point(merge).unwrap();
        let err = b
            .append(
                Ty::I64,
                InstKind::Phi {
                    incoming: vec![(Value::i64(1), side), (Value::f64(2.0), 0)],
                },
            )
            .unwrap_err();
        assert!(matches!(err, Error::TypeMismatch { .. }));
    }

    #[test]
    fn phi_after_non_phi_is_rejected() {
        let mut b = builder();
        b.append(
            Ty::I64,
            InstKind::Binary {
                op: BinOp::Add,
                lhs: Value::i64(1),
                rhs: Value::i64(2),
            },
        )
        .unwrap();
        let err = b
            .append(
                Ty::I64,
                InstKind::Phi {
                    incoming: vec![(Value::i64(1), 0)],
                },
            )
            .unwrap_err();
        assert!(matches!(err, Error::InvalidBlockState(_)));
    }

    #[test]
    fn labels_get_occurrence_suffixes() {
        let mut b = builder();
        let first = b.new_block("then");
        let second = b.new_block("then");
        assert_eq!(b.label(first).unwrap(), "then");
        assert_eq!(b.label(second).unwrap(), "then.1");
    }

    #[test]
    fn comparison_result_is_i1() {
        let mut b = builder();
        let x = b.param_value(0).unwrap();
        let err = b.append(
            Ty::I64,
            InstKind::Cmp {
                op: CmpOp::Gt,
                lhs: x.clone(),
                rhs: Value::i64(0),
            },
        );
        assert!(err.is_err());
        let flag = b
            .append_value(
                Ty::I1,
                InstKind::Cmp {
                    op: CmpOp::Gt,
                    lhs: x,
                    rhs: Value::i64(0),
                },
            )
            .unwrap();
        assert_eq!(flag.ty(), Ty::I1);
    }

    #[test]
    fn mixed_vector_shapes_are_rejected() {
        let mut b = builder();
        let four = Value::Undef(Ty::vector(Ty::I64, 4));
        let two = Value::Undef(Ty::vector(Ty::I64, 2));
        let err = b
            .append(
                Ty::vector(Ty::I64, 4),
                InstKind::Binary {
                    op: BinOp::Add,
                    lhs: four,
                    rhs: two,
                },
            )
            .unwrap_err();
        assert!(matches!(err, Error::VectorShapeMismatch { .. }));
    }

    #[test]
    fn stores_produce_no_temporary() {
        let mut b = builder();
        let slot = b.alloca("x", Ty::I64).unwrap();
        let place = b.local_value(slot).unwrap();
        let result = b
            .append(
                Ty::Void,
                InstKind::Store {
                    place,
                    value: Value::i64(3),
                },
            )
            .unwrap();
        assert!(result.is_none());
    }
}
