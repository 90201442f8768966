//! Lowering from the typed AST to the block-structured module.
//!
//! Runs in two passes: the first registers every function signature (generic
//! templates by base name), the second lowers bodies. Monomorphic instances
//! requested at call sites land on a worklist and are lowered right after the
//! function that first asked for them; a memo keyed by `(base, type args)`
//! guarantees each combination is built once.

mod expr;
mod func;
mod vector;

#[cfg(test)]
mod tests;

use std::collections::HashMap;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use quill_core::ast::{AstModule, FunctionDef};
use quill_core::diagnostics::{diagnostic_manager, Diagnostic};
use quill_core::error::{Error, Result};
use quill_core::ir::{Function, GenericInstantiation, Module, Signature, Ty};
use quill_core::tracing::debug;

use crate::debug::DebugInfoBuilder;
use crate::runtime::RuntimeRegistry;

pub(crate) use func::FunctionLowering;

const LOG_AREA: &str = "[lower]";

/// Cap on distinct monomorphic instances per module; crossing it almost
/// always means polymorphic recursion.
const INSTANTIATION_LIMIT: usize = 1000;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LowerOptions {
    /// Attach line/column locations and subprogram records.
    pub debug_info: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct GenericKey {
    base: String,
    type_args: Vec<Ty>,
}

struct PendingInstance {
    def: FunctionDef,
    subst: HashMap<String, Ty>,
    mangled: String,
}

/// Lowers one AST module into one block-structured module.
pub struct ModuleLowering {
    module: Module,
    pub(crate) source_file: String,
    pub(crate) symbols: HashMap<String, Signature>,
    pub(crate) templates: HashMap<String, FunctionDef>,
    memo: DashMap<GenericKey, String>,
    instantiation_order: Vec<GenericInstantiation>,
    pending: Vec<PendingInstance>,
    pub(crate) runtime: RuntimeRegistry,
    pub(crate) debug: DebugInfoBuilder,
}

/// Lower `ast` into a finalized module. Every function that comes back has
/// passed structural verification; on error nothing partial is returned and
/// the failure is recorded on the shared diagnostic manager.
pub fn lower_module(ast: &AstModule, options: LowerOptions) -> Result<Module> {
    ModuleLowering::new(ast, &options)
        .run(ast)
        .map_err(|err| report_failure(&ast.name, err))
}

fn report_failure(module: &str, err: Error) -> Error {
    let mut diagnostic =
        Diagnostic::error(err.root().to_string()).with_source_context(format!("lower:{}", module));
    if let Error::Spanned { span, .. } = &err {
        diagnostic = diagnostic.with_span(*span);
    }
    diagnostic_manager().error(diagnostic);
    err
}

impl ModuleLowering {
    pub fn new(ast: &AstModule, options: &LowerOptions) -> Self {
        let debug = match &ast.source {
            Some(source) if options.debug_info => {
                DebugInfoBuilder::new(ast.source_file.clone(), source)
            }
            _ => DebugInfoBuilder::disabled(),
        };
        Self {
            module: Module::new(ast.name.clone()),
            source_file: ast.source_file.clone(),
            symbols: HashMap::new(),
            templates: HashMap::new(),
            memo: DashMap::new(),
            instantiation_order: Vec::new(),
            pending: Vec::new(),
            runtime: RuntimeRegistry::new(),
            debug,
        }
    }

    pub fn run(mut self, ast: &AstModule) -> Result<Module> {
        self.register_signatures(ast)?;
        for def in &ast.functions {
            if def.is_generic() {
                continue;
            }
            let function = self.lower_function(def, &HashMap::new(), None)?;
            self.module.add_function(function);
            self.drain_pending()?;
        }
        self.finalize()
    }

    /// Pass one: make every name callable before any body is lowered.
    fn register_signatures(&mut self, ast: &AstModule) -> Result<()> {
        for def in &ast.functions {
            if self.templates.contains_key(&def.name) || self.symbols.contains_key(&def.name) {
                return Err(Error::SignatureConflict {
                    name: def.name.clone(),
                    existing: "already defined".to_string(),
                    requested: "second definition".to_string(),
                });
            }
            if def.is_generic() {
                self.templates.insert(def.name.clone(), def.clone());
            } else {
                let signature = signature_of(def, &HashMap::new())?;
                self.symbols.insert(def.name.clone(), signature);
            }
        }
        Ok(())
    }

    fn lower_function(
        &mut self,
        def: &FunctionDef,
        subst: &HashMap<String, Ty>,
        mangled: Option<&str>,
    ) -> Result<Function> {
        let name = mangled.unwrap_or(&def.name).to_string();
        debug!("{} function `{}`", LOG_AREA, name);
        FunctionLowering::new(self, def, subst, &name)?.run(def)
    }

    /// Resolve a call to a generic template. The memo is an insert-if-absent
    /// table: the first request for a `(base, args)` key publishes the mangled
    /// name, every later request reuses it.
    pub(crate) fn instantiate(
        &mut self,
        base: &str,
        type_args: &[Ty],
    ) -> Result<(String, Signature)> {
        let key = GenericKey {
            base: base.to_string(),
            type_args: type_args.to_vec(),
        };
        if let Some(hit) = self.memo.get(&key) {
            let mangled = hit.clone();
            drop(hit);
            return self.instance_signature(mangled);
        }
        let def = self.templates.get(base).cloned().ok_or_else(|| {
            Error::GenericResolution(format!("`{}` is not a generic template", base))
        })?;
        if def.generics.len() != type_args.len() {
            return Err(Error::GenericResolution(format!(
                "`{}` takes {} type arguments, {} given",
                base,
                def.generics.len(),
                type_args.len()
            )));
        }
        if self.instantiation_order.len() >= INSTANTIATION_LIMIT {
            return Err(Error::GenericResolution(format!(
                "more than {} generic instances; `{}` looks polymorphically recursive",
                INSTANTIATION_LIMIT, base
            )));
        }
        let subst: HashMap<String, Ty> = def
            .generics
            .iter()
            .cloned()
            .zip(type_args.iter().cloned())
            .collect();
        let signature = signature_of(&def, &subst)?;
        let instantiation = GenericInstantiation::new(base, type_args.to_vec());
        let mangled = instantiation.mangled.clone();
        match self.memo.entry(key) {
            Entry::Occupied(hit) => {
                let winner = hit.get().clone();
                drop(hit);
                self.instance_signature(winner)
            }
            Entry::Vacant(slot) => {
                slot.insert(mangled.clone());
                debug!("{} instantiate `{}`", LOG_AREA, mangled);
                self.symbols.insert(mangled.clone(), signature.clone());
                self.instantiation_order.push(instantiation);
                self.pending.push(PendingInstance {
                    def,
                    subst,
                    mangled: mangled.clone(),
                });
                Ok((mangled, signature))
            }
        }
    }

    fn instance_signature(&self, mangled: String) -> Result<(String, Signature)> {
        let signature = self
            .symbols
            .get(&mangled)
            .cloned()
            .ok_or_else(|| Error::UnknownSymbol(mangled.clone()))?;
        Ok((mangled, signature))
    }

    /// Lower queued instances; their bodies may queue more.
    fn drain_pending(&mut self) -> Result<()> {
        while let Some(instance) = self.pending.pop() {
            let function =
                self.lower_function(&instance.def, &instance.subst, Some(&instance.mangled))?;
            self.module.add_function(function);
        }
        Ok(())
    }

    fn finalize(mut self) -> Result<Module> {
        self.module.instantiations = self.instantiation_order;
        self.module.debug = self.debug.module_info();
        self.runtime.finish(&mut self.module)?;
        debug!(
            "{} module `{}`: {} functions, {} externs, {} instances",
            LOG_AREA,
            self.module.name,
            self.module.functions.len(),
            self.module.declarations.len(),
            self.module.instantiations.len()
        );
        Ok(self.module)
    }
}

fn signature_of(def: &FunctionDef, subst: &HashMap<String, Ty>) -> Result<Signature> {
    let params = def
        .params
        .iter()
        .map(|p| p.ty.resolve(subst))
        .collect::<Result<Vec<_>>>()?;
    Ok(Signature::new(params, def.ret.resolve(subst)?))
}
