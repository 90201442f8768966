//! Vector expression lowering: literals build up from `undef` one lane at a
//! time, element reads extract, and reductions fold a whole vector into a
//! scalar.

use quill_core::ast::{Expr, ReduceKind};
use quill_core::error::{Error, Result};
use quill_core::ir::{BinOp, InstKind, ReduceOp, Ty, Value};
use quill_core::span::Span;

use super::func::FunctionLowering;

impl<'a> FunctionLowering<'a> {
    /// A literal becomes an `insertelement` chain seeded with `undef`; lanes
    /// are filled in source order, so element ids are deterministic.
    pub(super) fn lower_vector_lit(
        &mut self,
        elems: &[Expr],
        ty: Ty,
        span: Span,
    ) -> Result<Value> {
        let (elem_ty, lanes) = match &ty {
            Ty::Vector { elem, lanes } => ((**elem).clone(), *lanes),
            other => return Err(Error::type_mismatch("vector literal type", other)),
        };
        if elems.len() != lanes as usize {
            return Err(Error::VectorShapeMismatch {
                lhs: ty.to_string(),
                rhs: format!("{} elements", elems.len()),
            });
        }
        let mut vector = Value::Undef(ty.clone());
        for (lane, elem) in elems.iter().enumerate() {
            let element = self.lower_expr(elem)?;
            if element.ty() != elem_ty {
                return Err(Error::type_mismatch(&elem_ty, element.ty()));
            }
            self.set_loc(span);
            vector = self.builder.append_value(
                ty.clone(),
                InstKind::InsertElement {
                    vector,
                    element,
                    lane: lane as u32,
                },
            )?;
        }
        Ok(vector)
    }

    pub(super) fn lower_vector_get(
        &mut self,
        vector: &Expr,
        lane: u32,
        ty: Ty,
        span: Span,
    ) -> Result<Value> {
        let source = self.lower_expr(vector)?;
        let source_ty = source.ty();
        let lanes = source_ty
            .vector_lanes()
            .ok_or_else(|| Error::type_mismatch("vector", &source_ty))?;
        if lane >= lanes {
            return Err(Error::VectorShapeMismatch {
                lhs: source_ty.to_string(),
                rhs: format!("lane {}", lane),
            });
        }
        self.set_loc(span);
        self.builder.append_value(
            ty,
            InstKind::ExtractElement {
                vector: source,
                lane,
            },
        )
    }

    /// Integer reductions are seedless; a source-level seed folds in with an
    /// `add` afterwards. Float reductions are ordered and always carry a
    /// seed, defaulting to `0.0`.
    pub(super) fn lower_reduce(
        &mut self,
        kind: ReduceKind,
        vector: &Expr,
        seed: Option<&Expr>,
        span: Span,
    ) -> Result<Value> {
        let source = self.lower_expr(vector)?;
        let source_ty = source.ty();
        let elem_ty = source_ty
            .vector_elem()
            .cloned()
            .ok_or_else(|| Error::type_mismatch("vector", &source_ty))?;
        match kind {
            ReduceKind::Add => {
                if !elem_ty.is_integer() {
                    return Err(Error::type_mismatch("integer lanes", elem_ty));
                }
                let seed_value = match seed {
                    Some(seed_expr) => {
                        let value = self.lower_expr(seed_expr)?;
                        if value.ty() != elem_ty {
                            return Err(Error::type_mismatch(&elem_ty, value.ty()));
                        }
                        Some(value)
                    }
                    None => None,
                };
                self.set_loc(span);
                let reduced = self.builder.append_value(
                    elem_ty.clone(),
                    InstKind::Reduce {
                        op: ReduceOp::Add,
                        vector: source,
                        seed: None,
                    },
                )?;
                match seed_value {
                    None => Ok(reduced),
                    Some(seed_value) => self.builder.append_value(
                        elem_ty,
                        InstKind::Binary {
                            op: BinOp::Add,
                            lhs: reduced,
                            rhs: seed_value,
                        },
                    ),
                }
            }
            ReduceKind::FAdd => {
                if !elem_ty.is_float() {
                    return Err(Error::type_mismatch("float lanes", elem_ty));
                }
                let seed_value = match seed {
                    Some(seed_expr) => {
                        let value = self.lower_expr(seed_expr)?;
                        if value.ty() != elem_ty {
                            return Err(Error::type_mismatch(&elem_ty, value.ty()));
                        }
                        value
                    }
                    None => Value::f64(0.0),
                };
                self.set_loc(span);
                self.builder.append_value(
                    elem_ty,
                    InstKind::Reduce {
                        op: ReduceOp::FAdd,
                        vector: source,
                        seed: Some(seed_value),
                    },
                )
            }
        }
    }
}
