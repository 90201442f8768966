//! Lowering backend: turns the typed AST from `quill-core` into a verified
//! control-flow graph of basic blocks, ready for an external serializer.

pub mod builder;
pub mod debug;
pub mod eval;
pub mod lower;
pub mod runtime;

pub use builder::FunctionBuilder;
pub use lower::{lower_module, LowerOptions, ModuleLowering};
