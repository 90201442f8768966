pub mod ast;
pub mod diagnostics;
pub mod error;
pub mod ir;
pub mod span;

pub use tracing;

pub use error::{Error, Result};
