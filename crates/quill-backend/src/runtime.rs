//! The fixed runtime ABI generated modules link against.
//!
//! `RuntimeAbi` is the static catalog of callable externs. `RuntimeRegistry`
//! is the per-module state: which externs the lowered code declared, interned
//! string data, and which of the synthesized helper functions it needs.

use std::collections::HashMap;

use quill_core::error::{Error, Result};
use quill_core::ir::{
    CastKind, ExternDecl, Function, GlobalData, InstKind, Module, Signature, Terminator, Ty, Value,
};
use quill_core::tracing::debug;

use crate::builder::FunctionBuilder;

const LOG_AREA: &str = "[runtime]";

/// Helper the panic statement calls into.
pub const PANIC_SYMBOL: &str = "__panic";
/// Helper failed contract checks call into.
pub const CONTRACT_FAIL_SYMBOL: &str = "__contract_fail";

const NEWLINE_GLOBAL: &str = ".panic_newline";

/// Static catalog of the runtime functions generated code may call.
pub struct RuntimeAbi;

impl RuntimeAbi {
    /// Signature of a runtime function, if `name` belongs to the ABI.
    pub fn signature(name: &str) -> Option<Signature> {
        match name {
            // Memory management
            "malloc" => Some(Signature::new(vec![Ty::I64], Ty::Ptr)),
            "free" => Some(Signature::new(vec![Ty::Ptr], Ty::Void)),
            "memcpy" => Some(Signature::new(vec![Ty::Ptr, Ty::Ptr, Ty::I64], Ty::Ptr)),

            // Garbage collector
            "gc_init" => Some(Signature::new(vec![], Ty::Void)),
            "gc_alloc" => Some(Signature::new(vec![Ty::I64], Ty::Ptr)),
            "gc_collect" => Some(Signature::new(vec![], Ty::Void)),
            "gc_add_root" => Some(Signature::new(vec![Ty::Ptr], Ty::Void)),
            "gc_remove_root" => Some(Signature::new(vec![Ty::Ptr], Ty::Void)),
            "gc_bytes_allocated" => Some(Signature::new(vec![], Ty::I64)),
            "gc_objects_count" => Some(Signature::new(vec![], Ty::I64)),
            "gc_collections" => Some(Signature::new(vec![], Ty::I64)),
            "gc_set_threshold" => Some(Signature::new(vec![Ty::I64], Ty::Void)),
            "gc_print_stats" => Some(Signature::new(vec![], Ty::Void)),

            // File and stream I/O
            "fopen" => Some(Signature::new(vec![Ty::Ptr, Ty::Ptr], Ty::Ptr)),
            "fclose" => Some(Signature::new(vec![Ty::Ptr], Ty::I32)),
            "fread" => Some(Signature::new(vec![Ty::Ptr, Ty::I64, Ty::I64, Ty::Ptr], Ty::I64)),
            "fwrite" => Some(Signature::new(vec![Ty::Ptr, Ty::I64, Ty::I64, Ty::Ptr], Ty::I64)),
            "fgets" => Some(Signature::new(vec![Ty::Ptr, Ty::I32, Ty::Ptr], Ty::Ptr)),
            "fputs" => Some(Signature::new(vec![Ty::Ptr, Ty::Ptr], Ty::I32)),
            "fgetc" => Some(Signature::new(vec![Ty::Ptr], Ty::I32)),
            "fputc" => Some(Signature::new(vec![Ty::I32, Ty::Ptr], Ty::I32)),
            "feof" => Some(Signature::new(vec![Ty::Ptr], Ty::I32)),
            "ftell" => Some(Signature::new(vec![Ty::Ptr], Ty::I64)),
            "fseek" => Some(Signature::new(vec![Ty::Ptr, Ty::I64, Ty::I32], Ty::I32)),
            "fflush" => Some(Signature::new(vec![Ty::Ptr], Ty::I32)),
            "puts" => Some(Signature::new(vec![Ty::Ptr], Ty::I32)),
            "printf" => Some(Signature::variadic(vec![Ty::Ptr], Ty::I32)),
            "putchar" => Some(Signature::new(vec![Ty::I32], Ty::I32)),
            "write" => Some(Signature::new(vec![Ty::I32, Ty::Ptr, Ty::I64], Ty::I64)),

            // Strings
            "strlen" => Some(Signature::new(vec![Ty::Ptr], Ty::I64)),
            "strcmp" => Some(Signature::new(vec![Ty::Ptr, Ty::Ptr], Ty::I32)),
            "strncmp" => Some(Signature::new(vec![Ty::Ptr, Ty::Ptr, Ty::I64], Ty::I32)),

            // Process and scheduling
            "exit" => Some(Signature::new(vec![Ty::I32], Ty::Void)),
            "sched_yield" => Some(Signature::new(vec![], Ty::I32)),
            "usleep" => Some(Signature::new(vec![Ty::I32], Ty::I32)),

            _ => None,
        }
    }

    /// Whether `name` is a known runtime function.
    pub fn is_runtime_function(name: &str) -> bool {
        Self::signature(name).is_some()
    }

    /// Source programs call accessors by their bare names; the lowered call
    /// targets the synthesized helper.
    pub fn accessor_symbol(name: &str) -> Option<&'static str> {
        match name {
            "load_byte" => Some("__load_byte"),
            "store_byte" => Some("__store_byte"),
            "load_word" => Some("__load_word"),
            "store_word" => Some("__store_word"),
            _ => None,
        }
    }

    pub fn accessor_signature(symbol: &str) -> Option<Signature> {
        match symbol {
            "__load_byte" | "__load_word" => Some(Signature::new(vec![Ty::I64], Ty::I64)),
            "__store_byte" | "__store_word" => {
                Some(Signature::new(vec![Ty::I64, Ty::I64], Ty::Void))
            }
            _ => None,
        }
    }
}

/// Per-module runtime state accumulated during lowering.
pub struct RuntimeRegistry {
    declarations: Vec<ExternDecl>,
    by_name: HashMap<String, Signature>,
    globals: Vec<GlobalData>,
    interned: HashMap<String, String>,
    next_str: u32,
    panic_used: bool,
    contract_used: bool,
}

impl RuntimeRegistry {
    pub fn new() -> Self {
        Self {
            declarations: Vec::new(),
            by_name: HashMap::new(),
            globals: Vec::new(),
            interned: HashMap::new(),
            next_str: 0,
            panic_used: false,
            contract_used: false,
        }
    }

    /// Idempotent external declaration. Redeclaring with the same signature
    /// is a no-op; redeclaring with a different one is an error.
    pub fn ensure_declared(&mut self, name: &str, signature: Signature) -> Result<()> {
        if let Some(existing) = self.by_name.get(name) {
            if *existing != signature {
                return Err(Error::SignatureConflict {
                    name: name.to_string(),
                    existing: existing.to_string(),
                    requested: signature.to_string(),
                });
            }
            return Ok(());
        }
        debug!("{} declare `{}`: {}", LOG_AREA, name, signature);
        self.by_name.insert(name.to_string(), signature.clone());
        self.declarations.push(ExternDecl {
            name: name.to_string(),
            signature,
        });
        Ok(())
    }

    /// Declare a catalog function and hand back its signature.
    pub fn declare_runtime(&mut self, name: &str) -> Result<Signature> {
        let signature =
            RuntimeAbi::signature(name).ok_or_else(|| Error::UnknownSymbol(name.to_string()))?;
        self.ensure_declared(name, signature.clone())?;
        Ok(signature)
    }

    pub fn declaration(&self, name: &str) -> Option<&Signature> {
        self.by_name.get(name)
    }

    /// Intern a NUL-terminated message; equal strings share one global.
    pub fn intern_string(&mut self, text: &str) -> Value {
        if let Some(name) = self.interned.get(text) {
            return Value::Global {
                name: name.clone(),
                ty: Ty::Ptr,
            };
        }
        let name = format!(".str.{}", self.next_str);
        self.next_str += 1;
        let mut bytes = text.as_bytes().to_vec();
        bytes.push(0);
        self.globals.push(GlobalData {
            name: name.clone(),
            bytes,
        });
        self.interned.insert(text.to_string(), name.clone());
        Value::Global { name, ty: Ty::Ptr }
    }

    /// Record that lowered code calls `__panic` and declare what its body needs.
    pub fn require_panic(&mut self) -> Result<()> {
        self.panic_used = true;
        self.declare_write_path()
    }

    /// Record that lowered code calls `__contract_fail`.
    pub fn require_contract_fail(&mut self) -> Result<()> {
        self.contract_used = true;
        self.declare_write_path()
    }

    fn declare_write_path(&mut self) -> Result<()> {
        self.declare_runtime("strlen")?;
        self.declare_runtime("write")?;
        self.declare_runtime("exit")?;
        Ok(())
    }

    fn newline_global(&mut self) -> Value {
        if !self.globals.iter().any(|g| g.name == NEWLINE_GLOBAL) {
            self.globals.push(GlobalData {
                name: NEWLINE_GLOBAL.to_string(),
                bytes: vec![b'\n'],
            });
        }
        Value::Global {
            name: NEWLINE_GLOBAL.to_string(),
            ty: Ty::Ptr,
        }
    }

    /// Synthesize helper bodies and move declarations and data into the module.
    /// The four memory accessors are always present; the failure helpers only
    /// when something lowered to them.
    pub fn finish(mut self, module: &mut Module) -> Result<()> {
        module.add_function(synth_load_byte()?);
        module.add_function(synth_store_byte()?);
        module.add_function(synth_load_word()?);
        module.add_function(synth_store_word()?);
        if self.panic_used {
            let newline = self.newline_global();
            module.add_function(synth_panic(newline)?);
        }
        if self.contract_used {
            let newline = self.newline_global();
            module.add_function(synth_contract_fail(newline)?);
        }
        module.declarations.extend(self.declarations);
        module.globals.extend(self.globals);
        Ok(())
    }
}

impl Default for RuntimeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn synth_load_byte() -> Result<Function> {
    let mut b = FunctionBuilder::new("__load_byte", vec![("addr".to_string(), Ty::I64)], Ty::I64);
    let addr = b.param_value(0)?;
    let ptr = b.append_value(
        Ty::Ptr,
        InstKind::Cast {
            kind: CastKind::IntToPtr,
            value: addr,
        },
    )?;
    let byte = b.append_value(Ty::I8, InstKind::PtrLoad { addr: ptr })?;
    let wide = b.append_value(
        Ty::I64,
        InstKind::Cast {
            kind: CastKind::Zext,
            value: byte,
        },
    )?;
    b.terminate(Terminator::Return(Some(wide)))?;
    b.finish()
}

fn synth_store_byte() -> Result<Function> {
    let mut b = FunctionBuilder::new(
        "__store_byte",
        vec![
            ("addr".to_string(), Ty::I64),
            ("value".to_string(), Ty::I64),
        ],
        Ty::Void,
    );
    let addr = b.param_value(0)?;
    let value = b.param_value(1)?;
    let ptr = b.append_value(
        Ty::Ptr,
        InstKind::Cast {
            kind: CastKind::IntToPtr,
            value: addr,
        },
    )?;
    let narrow = b.append_value(
        Ty::I8,
        InstKind::Cast {
            kind: CastKind::Trunc,
            value,
        },
    )?;
    b.append(
        Ty::Void,
        InstKind::PtrStore {
            addr: ptr,
            value: narrow,
        },
    )?;
    b.terminate(Terminator::Return(None))?;
    b.finish()
}

fn synth_load_word() -> Result<Function> {
    let mut b = FunctionBuilder::new("__load_word", vec![("addr".to_string(), Ty::I64)], Ty::I64);
    let addr = b.param_value(0)?;
    let ptr = b.append_value(
        Ty::Ptr,
        InstKind::Cast {
            kind: CastKind::IntToPtr,
            value: addr,
        },
    )?;
    let word = b.append_value(Ty::I64, InstKind::PtrLoad { addr: ptr })?;
    b.terminate(Terminator::Return(Some(word)))?;
    b.finish()
}

fn synth_store_word() -> Result<Function> {
    let mut b = FunctionBuilder::new(
        "__store_word",
        vec![
            ("addr".to_string(), Ty::I64),
            ("value".to_string(), Ty::I64),
        ],
        Ty::Void,
    );
    let addr = b.param_value(0)?;
    let value = b.param_value(1)?;
    let ptr = b.append_value(
        Ty::Ptr,
        InstKind::Cast {
            kind: CastKind::IntToPtr,
            value: addr,
        },
    )?;
    b.append(Ty::Void, InstKind::PtrStore { addr: ptr, value })?;
    b.terminate(Terminator::Return(None))?;
    b.finish()
}

/// `__panic(msg)`: write the message and a newline to stderr, exit(1).
fn synth_panic(newline: Value) -> Result<Function> {
    let mut b = FunctionBuilder::new(PANIC_SYMBOL, vec![("msg".to_string(), Ty::Ptr)], Ty::Void);
    let msg = b.param_value(0)?;
    let len = b.append_value(
        Ty::I64,
        InstKind::Call {
            callee: "strlen".to_string(),
            args: vec![msg.clone()],
        },
    )?;
    b.append(
        Ty::I64,
        InstKind::Call {
            callee: "write".to_string(),
            args: vec![Value::i32(2), msg, len],
        },
    )?;
    b.append(
        Ty::I64,
        InstKind::Call {
            callee: "write".to_string(),
            args: vec![Value::i32(2), newline, Value::i64(1)],
        },
    )?;
    b.append(
        Ty::Void,
        InstKind::Call {
            callee: "exit".to_string(),
            args: vec![Value::i32(1)],
        },
    )?;
    b.terminate(Terminator::Unreachable)?;
    b.finish()
}

/// `__contract_fail(kind, condition, file, line, func)`: report the failed
/// condition the same way `__panic` reports its message. The extra operands
/// are carried for richer runtimes; the synthesized body prints the condition.
fn synth_contract_fail(newline: Value) -> Result<Function> {
    let mut b = FunctionBuilder::new(
        CONTRACT_FAIL_SYMBOL,
        vec![
            ("kind".to_string(), Ty::I64),
            ("condition".to_string(), Ty::Ptr),
            ("file".to_string(), Ty::Ptr),
            ("line".to_string(), Ty::I64),
            ("func".to_string(), Ty::Ptr),
        ],
        Ty::Void,
    );
    let condition = b.param_value(1)?;
    let len = b.append_value(
        Ty::I64,
        InstKind::Call {
            callee: "strlen".to_string(),
            args: vec![condition.clone()],
        },
    )?;
    b.append(
        Ty::I64,
        InstKind::Call {
            callee: "write".to_string(),
            args: vec![Value::i32(2), condition, len],
        },
    )?;
    b.append(
        Ty::I64,
        InstKind::Call {
            callee: "write".to_string(),
            args: vec![Value::i32(2), newline, Value::i64(1)],
        },
    )?;
    b.append(
        Ty::Void,
        InstKind::Call {
            callee: "exit".to_string(),
            args: vec![Value::i32(1)],
        },
    )?;
    b.terminate(Terminator::Unreachable)?;
    b.finish()
}
