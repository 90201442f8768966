//! Per-function lowering: bindings, statements, and control flow.
//!
//! Locals and mutated parameters live in stack slots and are reloaded on
//! every read, so statement-level `if`/`while` never thread values through
//! phis; only expression-level merges (ternary, short-circuit) do.

use std::collections::HashMap;

use quill_core::ast::{ContractKind, Expr, FunctionDef, Stmt, StmtKind};
use quill_core::error::{Error, Result};
use quill_core::ir::{BlockId, Function, InstKind, LocalId, Terminator, Ty, Value};
use quill_core::span::Span;

use super::ModuleLowering;
use crate::builder::FunctionBuilder;
use crate::runtime::{CONTRACT_FAIL_SYMBOL, PANIC_SYMBOL};

/// What a source name currently resolves to.
#[derive(Debug, Clone)]
pub(super) enum Binding {
    /// Stack slot; every read loads, every write stores.
    Slot(LocalId),
    /// Immutable parameter read directly as its temporary.
    Direct(Value),
}

struct LoopContext {
    continue_target: BlockId,
    break_target: BlockId,
}

pub(crate) struct FunctionLowering<'a> {
    pub(super) ctx: &'a mut ModuleLowering,
    pub(super) builder: FunctionBuilder,
    scopes: Vec<HashMap<String, Binding>>,
    loop_stack: Vec<LoopContext>,
    pub(super) subst: HashMap<String, Ty>,
}

impl<'a> FunctionLowering<'a> {
    pub(super) fn new(
        ctx: &'a mut ModuleLowering,
        def: &FunctionDef,
        subst: &HashMap<String, Ty>,
        name: &str,
    ) -> Result<Self> {
        let mut params = Vec::with_capacity(def.params.len());
        for param in &def.params {
            params.push((param.name.clone(), param.ty.resolve(subst)?));
        }
        let ret = def.ret.resolve(subst)?;
        let mut builder = FunctionBuilder::new(name, params, ret);
        if let Some(info) = ctx.debug.subprogram(name, def.span) {
            builder.set_subprogram(info);
        }
        let mut this = Self {
            ctx,
            builder,
            scopes: vec![HashMap::new()],
            loop_stack: Vec::new(),
            subst: subst.clone(),
        };
        this.bind_params(def)?;
        Ok(this)
    }

    /// Immutable parameters stay in their temporaries; mutated ones get a
    /// slot and an initializing store so later assignments have a home.
    fn bind_params(&mut self, def: &FunctionDef) -> Result<()> {
        for (index, param) in def.params.iter().enumerate() {
            let value = self.builder.param_value(index)?;
            if param.mutated {
                let slot = self.builder.alloca(&param.name, value.ty())?;
                let place = self.builder.local_value(slot)?;
                self.builder.append(Ty::Void, InstKind::Store { place, value })?;
                self.bind(param.name.clone(), Binding::Slot(slot));
            } else {
                self.bind(param.name.clone(), Binding::Direct(value));
            }
        }
        Ok(())
    }

    pub(super) fn run(mut self, def: &FunctionDef) -> Result<Function> {
        self.lower_block(&def.body)?;
        if !self.builder.current_terminated() {
            if *self.builder.return_type() == Ty::Void {
                self.builder.terminate(Terminator::Return(None))?;
            } else {
                return Err(Error::InvalidBlockState(format!(
                    "`{}` can reach the end of its body without returning {}",
                    self.builder.name(),
                    self.builder.return_type()
                )));
            }
        }
        self.builder.finish()
    }

    pub(super) fn bind(&mut self, name: String, binding: Binding) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(name, binding);
        }
    }

    pub(super) fn lookup(&self, name: &str) -> Option<Binding> {
        self.scopes
            .iter()
            .rev()
            .find_map(|scope| scope.get(name).cloned())
    }

    pub(super) fn set_loc(&mut self, span: Span) {
        let loc = self.ctx.debug.location(span);
        self.builder.set_loc(loc);
    }

    /// Lower a statement list in a fresh scope. Once the current block is
    /// terminated the rest of the list is unreachable and dropped.
    fn lower_block(&mut self, body: &[Stmt]) -> Result<()> {
        self.scopes.push(HashMap::new());
        let mut result = Ok(());
        for stmt in body {
            if self.builder.current_terminated() {
                break;
            }
            result = self.lower_stmt(stmt);
            if result.is_err() {
                break;
            }
        }
        self.scopes.pop();
        result
    }

    fn lower_stmt(&mut self, stmt: &Stmt) -> Result<()> {
        self.set_loc(stmt.span);
        self.lower_stmt_kind(stmt).map_err(|e| e.with_span(stmt.span))
    }

    fn lower_stmt_kind(&mut self, stmt: &Stmt) -> Result<()> {
        match &stmt.kind {
            StmtKind::Let { name, ty, init } => {
                let ty = ty.resolve(&self.subst)?;
                let value = self.lower_expr(init)?;
                if value.ty() != ty {
                    return Err(Error::type_mismatch(ty, value.ty()));
                }
                let slot = self.builder.alloca(name, ty)?;
                let place = self.builder.local_value(slot)?;
                self.set_loc(stmt.span);
                self.builder.append(Ty::Void, InstKind::Store { place, value })?;
                self.bind(name.clone(), Binding::Slot(slot));
                Ok(())
            }
            StmtKind::Assign { name, value } => {
                let value = self.lower_expr(value)?;
                match self.lookup(name) {
                    Some(Binding::Slot(slot)) => {
                        let place = self.builder.local_value(slot)?;
                        if value.ty() != place.ty() {
                            return Err(Error::type_mismatch(place.ty(), value.ty()));
                        }
                        self.set_loc(stmt.span);
                        self.builder.append(Ty::Void, InstKind::Store { place, value })?;
                        Ok(())
                    }
                    Some(Binding::Direct(_)) => Err(Error::Generic(format!(
                        "`{}` is immutable here and cannot be assigned",
                        name
                    ))),
                    None => Err(Error::UnknownSymbol(name.to_string())),
                }
            }
            StmtKind::If {
                cond,
                then_body,
                else_body,
            } => self.lower_if(cond, then_body, else_body),
            StmtKind::While { cond, body } => self.lower_while(cond, body),
            StmtKind::Break => {
                let target = self
                    .loop_stack
                    .last()
                    .map(|ctx| ctx.break_target)
                    .ok_or_else(|| {
                        Error::InvalidBlockState("break outside of a loop".to_string())
                    })?;
                self.builder.terminate(Terminator::Jump(target))
            }
            StmtKind::Continue => {
                let target = self
                    .loop_stack
                    .last()
                    .map(|ctx| ctx.continue_target)
                    .ok_or_else(|| {
                        Error::InvalidBlockState("continue outside of a loop".to_string())
                    })?;
                self.builder.terminate(Terminator::Jump(target))
            }
            StmtKind::Return(value) => {
                let value = match value {
                    Some(expr) => Some(self.lower_expr(expr)?),
                    None => None,
                };
                self.set_loc(stmt.span);
                self.builder.terminate(Terminator::Return(value))
            }
            StmtKind::Expr(expr) => {
                self.lower_expr(expr)?;
                Ok(())
            }
            StmtKind::Panic { message } => self.lower_panic(message),
            StmtKind::Contract {
                kind,
                cond,
                message,
            } => self.lower_contract(*kind, cond, message, stmt.span),
        }
    }

    /// Statement-level conditional. Arms that fall off their end jump to a
    /// merge block; the merge is only created if at least one arm needs it.
    fn lower_if(&mut self, cond: &Expr, then_body: &[Stmt], else_body: &[Stmt]) -> Result<()> {
        let cond_value = self.lower_expr(cond)?;
        if cond_value.ty() != Ty::I1 {
            return Err(Error::type_mismatch(Ty::I1, cond_value.ty()));
        }
        let then_blk = self.builder.new_block("then");

        if else_body.is_empty() {
            let merge = self.builder.new_block("merge");
            self.builder.terminate(Terminator::Branch {
                cond: cond_value,
                then_to: then_blk,
                else_to: merge,
            })?;
            self.builder.set_insertion_point(then_blk)?;
            self.lower_block(then_body)?;
            if !self.builder.current_terminated() {
                self.builder.terminate(Terminator::Jump(merge))?;
            }
            self.builder.set_insertion_point(merge)?;
            return Ok(());
        }

        let else_blk = self.builder.new_block("else");
        self.builder.terminate(Terminator::Branch {
            cond: cond_value,
            then_to: then_blk,
            else_to: else_blk,
        })?;

        self.builder.set_insertion_point(then_blk)?;
        self.lower_block(then_body)?;
        let then_open = (!self.builder.current_terminated()).then(|| self.builder.current_block());

        self.builder.set_insertion_point(else_blk)?;
        self.lower_block(else_body)?;
        let else_open = (!self.builder.current_terminated()).then(|| self.builder.current_block());

        if then_open.is_none() && else_open.is_none() {
            // Both arms left the function; whatever follows is unreachable.
            return Ok(());
        }
        let merge = self.builder.new_block("merge");
        for open in [then_open, else_open].into_iter().flatten() {
            self.builder.set_insertion_point(open)?;
            self.builder.terminate(Terminator::Jump(merge))?;
        }
        self.builder.set_insertion_point(merge)?;
        Ok(())
    }

    /// `while` shape: `loop.start` evaluates the condition, `loop.body` runs
    /// the body and jumps back, `loop.end` is where `break` and a false
    /// condition land. `continue` re-enters `loop.start`.
    fn lower_while(&mut self, cond: &Expr, body: &[Stmt]) -> Result<()> {
        let start = self.builder.new_block("loop.start");
        self.builder.terminate(Terminator::Jump(start))?;
        self.builder.set_insertion_point(start)?;

        let cond_value = self.lower_expr(cond)?;
        if cond_value.ty() != Ty::I1 {
            return Err(Error::type_mismatch(Ty::I1, cond_value.ty()));
        }
        let body_blk = self.builder.new_block("loop.body");
        let end = self.builder.new_block("loop.end");
        self.builder.terminate(Terminator::Branch {
            cond: cond_value,
            then_to: body_blk,
            else_to: end,
        })?;

        self.builder.set_insertion_point(body_blk)?;
        self.loop_stack.push(LoopContext {
            continue_target: start,
            break_target: end,
        });
        let body_result = self.lower_block(body);
        self.loop_stack.pop();
        body_result?;
        if !self.builder.current_terminated() {
            self.builder.terminate(Terminator::Jump(start))?;
        }
        self.builder.set_insertion_point(end)?;
        Ok(())
    }

    fn lower_panic(&mut self, message: &str) -> Result<()> {
        self.ctx.runtime.require_panic()?;
        let msg = self.ctx.runtime.intern_string(message);
        self.builder.append(
            Ty::Void,
            InstKind::Call {
                callee: PANIC_SYMBOL.to_string(),
                args: vec![msg],
            },
        )?;
        self.builder.terminate(Terminator::Unreachable)
    }

    /// Contract checks branch to a fail block that reports and never returns;
    /// execution continues in the ok block.
    fn lower_contract(
        &mut self,
        kind: ContractKind,
        cond: &Expr,
        message: &str,
        span: Span,
    ) -> Result<()> {
        let cond_value = self.lower_expr(cond)?;
        if cond_value.ty() != Ty::I1 {
            return Err(Error::type_mismatch(Ty::I1, cond_value.ty()));
        }
        let ok = self.builder.new_block("contract.ok");
        let fail = self.builder.new_block("contract.fail");
        self.builder.terminate(Terminator::Branch {
            cond: cond_value,
            then_to: ok,
            else_to: fail,
        })?;

        self.builder.set_insertion_point(fail)?;
        self.ctx.runtime.require_contract_fail()?;
        let fn_name = self.builder.name().to_string();
        let source_file = self.ctx.source_file.clone();
        let line = self
            .ctx
            .debug
            .location(span)
            .map(|loc| i64::from(loc.line))
            .unwrap_or(0);
        let condition = self.ctx.runtime.intern_string(message);
        let file = self.ctx.runtime.intern_string(&source_file);
        let func = self.ctx.runtime.intern_string(&fn_name);
        self.builder.append(
            Ty::Void,
            InstKind::Call {
                callee: CONTRACT_FAIL_SYMBOL.to_string(),
                args: vec![
                    Value::i64(kind.code()),
                    condition,
                    file,
                    Value::i64(line),
                    func,
                ],
            },
        )?;
        self.builder.terminate(Terminator::Unreachable)?;

        self.builder.set_insertion_point(ok)?;
        Ok(())
    }
}
