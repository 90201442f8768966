//! Expression lowering. Values flow as SSA temporaries; the only places a
//! phi is created are ternaries and short-circuit `&&`/`||`, where two arms
//! genuinely merge a value.

use quill_core::ast::{BinaryOp, Expr, ExprKind, Ty as AstTy, UnaryOp};
use quill_core::error::{Error, Result};
use quill_core::ir::{BinOp, CastKind, CmpOp, InstKind, Signature, Terminator, Ty, UnOp, Value};
use quill_core::span::Span;

use super::func::{Binding, FunctionLowering};
use crate::runtime::RuntimeAbi;

impl<'a> FunctionLowering<'a> {
    pub(super) fn lower_expr(&mut self, expr: &Expr) -> Result<Value> {
        self.lower_expr_kind(expr).map_err(|e| e.with_span(expr.span))
    }

    fn lower_expr_kind(&mut self, expr: &Expr) -> Result<Value> {
        let ty = expr.ty.resolve(&self.subst)?;
        match &expr.kind {
            ExprKind::IntLit(value) => {
                if !ty.is_integer() {
                    return Err(Error::type_mismatch("integer literal type", ty));
                }
                Ok(Value::int(ty, *value))
            }
            ExprKind::FloatLit(value) => Ok(Value::f64(*value)),
            ExprKind::BoolLit(value) => Ok(Value::bool(*value)),
            ExprKind::Var(name) => self.lower_var(name, expr.span),
            ExprKind::Unary { op, operand } => {
                let operand = self.lower_expr(operand)?;
                let op = match op {
                    UnaryOp::Neg => UnOp::Neg,
                    UnaryOp::Not => UnOp::Not,
                };
                self.set_loc(expr.span);
                self.builder.append_value(ty, InstKind::Unary { op, operand })
            }
            ExprKind::Binary { op, lhs, rhs } => self.lower_binary(*op, lhs, rhs, ty, expr.span),
            ExprKind::Ternary {
                cond,
                then_val,
                else_val,
            } => self.lower_ternary(cond, then_val, else_val, ty, expr.span),
            ExprKind::Call {
                callee,
                type_args,
                args,
            } => self.lower_call(callee, type_args, args, ty, expr.span),
            ExprKind::VectorLit(elems) => self.lower_vector_lit(elems, ty, expr.span),
            ExprKind::VectorGet { vector, lane } => {
                self.lower_vector_get(vector, *lane, ty, expr.span)
            }
            ExprKind::Reduce { kind, vector, seed } => {
                self.lower_reduce(*kind, vector, seed.as_deref(), expr.span)
            }
            ExprKind::Cast { value } => self.lower_cast(value, ty, expr.span),
        }
    }

    fn lower_var(&mut self, name: &str, span: Span) -> Result<Value> {
        match self.lookup(name) {
            Some(Binding::Direct(value)) => Ok(value),
            Some(Binding::Slot(slot)) => {
                let place = self.builder.local_value(slot)?;
                let ty = place.ty();
                self.set_loc(span);
                self.builder.append_value(ty, InstKind::Load { place })
            }
            None => Err(Error::UnknownSymbol(name.to_string())),
        }
    }

    fn lower_binary(
        &mut self,
        op: BinaryOp,
        lhs: &Expr,
        rhs: &Expr,
        ty: Ty,
        span: Span,
    ) -> Result<Value> {
        if op.is_short_circuit() {
            return self.lower_short_circuit(op, lhs, rhs, span);
        }
        let lhs = self.lower_expr(lhs)?;
        let rhs = self.lower_expr(rhs)?;
        self.set_loc(span);
        if let Some(op) = cmp_op(op) {
            self.builder.append_value(ty, InstKind::Cmp { op, lhs, rhs })
        } else if let Some(op) = arith_op(op) {
            self.builder.append_value(ty, InstKind::Binary { op, lhs, rhs })
        } else {
            Err(Error::Generic(format!(
                "operator {:?} has no instruction form",
                op
            )))
        }
    }

    /// `a && b` evaluates `b` only when `a` is true; `a || b` only when `a`
    /// is false. The skipping edge feeds the known constant into the phi.
    fn lower_short_circuit(
        &mut self,
        op: BinaryOp,
        lhs: &Expr,
        rhs: &Expr,
        span: Span,
    ) -> Result<Value> {
        let lhs = self.lower_expr(lhs)?;
        if lhs.ty() != Ty::I1 {
            return Err(Error::type_mismatch(Ty::I1, lhs.ty()));
        }
        let (hint, skip_value) = match op {
            BinaryOp::And => ("and", Value::bool(false)),
            _ => ("or", Value::bool(true)),
        };
        let rhs_blk = self.builder.new_block(&format!("{}.rhs", hint));
        let merge = self.builder.new_block(&format!("{}.merge", hint));
        let skip_from = self.builder.current_block();
        self.set_loc(span);
        let (then_to, else_to) = match op {
            BinaryOp::And => (rhs_blk, merge),
            _ => (merge, rhs_blk),
        };
        self.builder.terminate(Terminator::Branch {
            cond: lhs,
            then_to,
            else_to,
        })?;

        self.builder.set_insertion_point(rhs_blk)?;
        let rhs = self.lower_expr(rhs)?;
        if rhs.ty() != Ty::I1 {
            return Err(Error::type_mismatch(Ty::I1, rhs.ty()));
        }
        let rhs_end = self.builder.current_block();
        self.builder.terminate(Terminator::Jump(merge))?;

        self.builder.set_insertion_point(merge)?;
        self.set_loc(span);
        self.builder.append_value(
            Ty::I1,
            InstKind::Phi {
                incoming: vec![(skip_value, skip_from), (rhs, rhs_end)],
            },
        )
    }

    /// Expression conditional: both arms produce a value and fall through to
    /// a merge block whose phi selects between them. A `Void` ternary keeps
    /// the diamond and records the join with a dead phi.
    fn lower_ternary(
        &mut self,
        cond: &Expr,
        then_val: &Expr,
        else_val: &Expr,
        ty: Ty,
        span: Span,
    ) -> Result<Value> {
        let cond_value = self.lower_expr(cond)?;
        if cond_value.ty() != Ty::I1 {
            return Err(Error::type_mismatch(Ty::I1, cond_value.ty()));
        }
        let then_blk = self.builder.new_block("then");
        let else_blk = self.builder.new_block("else");
        self.set_loc(span);
        self.builder.terminate(Terminator::Branch {
            cond: cond_value,
            then_to: then_blk,
            else_to: else_blk,
        })?;

        self.builder.set_insertion_point(then_blk)?;
        let then_value = self.lower_expr(then_val)?;
        let then_end = self.builder.current_block();

        self.builder.set_insertion_point(else_blk)?;
        let else_value = self.lower_expr(else_val)?;
        let else_end = self.builder.current_block();

        if then_value.ty() != else_value.ty() {
            return Err(Error::type_mismatch(then_value.ty(), else_value.ty()));
        }

        let merge = self.builder.new_block("merge");
        self.builder.set_insertion_point(then_end)?;
        self.builder.terminate(Terminator::Jump(merge))?;
        self.builder.set_insertion_point(else_end)?;
        self.builder.terminate(Terminator::Jump(merge))?;
        self.builder.set_insertion_point(merge)?;

        self.set_loc(span);
        if ty == Ty::Void {
            self.builder.append_value(
                Ty::I64,
                InstKind::Phi {
                    incoming: vec![(Value::i64(0), then_end), (Value::i64(0), else_end)],
                },
            )?;
            return Ok(Value::unit());
        }
        if then_value.ty() != ty {
            return Err(Error::type_mismatch(ty, then_value.ty()));
        }
        self.builder.append_value(
            ty,
            InstKind::Phi {
                incoming: vec![(then_value, then_end), (else_value, else_end)],
            },
        )
    }

    fn lower_call(
        &mut self,
        callee: &str,
        type_args: &[AstTy],
        args: &[Expr],
        ty: Ty,
        span: Span,
    ) -> Result<Value> {
        let mut concrete = Vec::with_capacity(type_args.len());
        for arg in type_args {
            concrete.push(arg.resolve(&self.subst)?);
        }
        let (symbol, signature) = self.resolve_callee(callee, &concrete)?;

        let mut lowered = Vec::with_capacity(args.len());
        for arg in args {
            lowered.push(self.lower_expr(arg)?);
        }
        check_call_args(&symbol, &signature, &lowered)?;
        if signature.ret != ty {
            return Err(Error::type_mismatch(&signature.ret, ty));
        }

        self.set_loc(span);
        let result = self.builder.append(
            signature.ret,
            InstKind::Call {
                callee: symbol,
                args: lowered,
            },
        )?;
        Ok(result.unwrap_or_else(Value::unit))
    }

    /// Call targets resolve in a fixed order: accessor aliases, the runtime
    /// catalog, generic instantiation, then plain module symbols.
    fn resolve_callee(&mut self, callee: &str, type_args: &[Ty]) -> Result<(String, Signature)> {
        if let Some(symbol) = RuntimeAbi::accessor_symbol(callee) {
            if !type_args.is_empty() {
                return Err(Error::GenericResolution(format!(
                    "`{}` does not take type arguments",
                    callee
                )));
            }
            let signature = RuntimeAbi::accessor_signature(symbol)
                .ok_or_else(|| Error::UnknownSymbol(symbol.to_string()))?;
            return Ok((symbol.to_string(), signature));
        }
        if RuntimeAbi::is_runtime_function(callee) {
            if !type_args.is_empty() {
                return Err(Error::GenericResolution(format!(
                    "`{}` does not take type arguments",
                    callee
                )));
            }
            let signature = self.ctx.runtime.declare_runtime(callee)?;
            return Ok((callee.to_string(), signature));
        }
        if !type_args.is_empty() {
            return self.ctx.instantiate(callee, type_args);
        }
        if self.ctx.templates.contains_key(callee) {
            return Err(Error::GenericResolution(format!(
                "`{}` needs explicit type arguments",
                callee
            )));
        }
        let signature = self
            .ctx
            .symbols
            .get(callee)
            .cloned()
            .ok_or_else(|| Error::UnknownSymbol(callee.to_string()))?;
        Ok((callee.to_string(), signature))
    }

    fn lower_cast(&mut self, value: &Expr, target: Ty, span: Span) -> Result<Value> {
        let source = self.lower_expr(value)?;
        let from = source.ty();
        if from == target {
            return Ok(source);
        }
        let kind = cast_kind(&from, &target)?;
        self.set_loc(span);
        self.builder.append_value(
            target,
            InstKind::Cast {
                kind,
                value: source,
            },
        )
    }
}

fn arith_op(op: BinaryOp) -> Option<BinOp> {
    match op {
        BinaryOp::Add => Some(BinOp::Add),
        BinaryOp::Sub => Some(BinOp::Sub),
        BinaryOp::Mul => Some(BinOp::Mul),
        BinaryOp::Div => Some(BinOp::Div),
        BinaryOp::Rem => Some(BinOp::Rem),
        _ => None,
    }
}

fn cmp_op(op: BinaryOp) -> Option<CmpOp> {
    match op {
        BinaryOp::Eq => Some(CmpOp::Eq),
        BinaryOp::Ne => Some(CmpOp::Ne),
        BinaryOp::Lt => Some(CmpOp::Lt),
        BinaryOp::Le => Some(CmpOp::Le),
        BinaryOp::Gt => Some(CmpOp::Gt),
        BinaryOp::Ge => Some(CmpOp::Ge),
        _ => None,
    }
}

fn check_call_args(symbol: &str, signature: &Signature, args: &[Value]) -> Result<()> {
    if signature.variadic {
        if args.len() < signature.params.len() {
            return Err(Error::type_mismatch(
                format!(
                    "at least {} arguments to `{}`",
                    signature.params.len(),
                    symbol
                ),
                args.len(),
            ));
        }
    } else if args.len() != signature.params.len() {
        return Err(Error::type_mismatch(
            format!("{} arguments to `{}`", signature.params.len(), symbol),
            args.len(),
        ));
    }
    for (param, arg) in signature.params.iter().zip(args) {
        if arg.ty() != *param {
            return Err(Error::type_mismatch(param, arg.ty()));
        }
    }
    Ok(())
}

fn cast_kind(from: &Ty, to: &Ty) -> Result<CastKind> {
    let kind = match (from, to) {
        _ if from.is_integer() && to.is_integer() => {
            if from.bit_width() > to.bit_width() {
                CastKind::Trunc
            } else if *from == Ty::I1 {
                CastKind::Zext
            } else {
                CastKind::Sext
            }
        }
        _ if from.is_integer() && to.is_float() => CastKind::SiToFp,
        _ if from.is_float() && to.is_integer() => CastKind::FpToSi,
        (Ty::I64, Ty::Ptr) => CastKind::IntToPtr,
        (Ty::Ptr, Ty::I64) => CastKind::PtrToInt,
        _ => {
            return Err(Error::type_mismatch(
                format!("a type convertible to {}", to),
                from,
            ))
        }
    };
    Ok(kind)
}
