use crate::span::Span;
use std::result;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },
    #[error("invalid block state: {0}")]
    InvalidBlockState(String),
    #[error("unresolved label `{0}`")]
    UnresolvedLabel(String),
    #[error("vector shape mismatch: {lhs} vs {rhs}")]
    VectorShapeMismatch { lhs: String, rhs: String },
    #[error("conflicting signature for `{name}`: already declared as {existing}, requested {requested}")]
    SignatureConflict {
        name: String,
        existing: String,
        requested: String,
    },
    #[error("cannot resolve generic parameter: {0}")]
    GenericResolution(String),
    #[error("unknown symbol `{0}`")]
    UnknownSymbol(String),
    #[error("{inner} at {span}")]
    Spanned { span: Span, inner: Box<Error> },
    #[error("generic error: {0}")]
    Generic(String),
}

pub type Result<T> = result::Result<T, Error>;

impl Error {
    /// Build a type mismatch from anything with a printable type.
    pub fn type_mismatch(expected: impl ToString, found: impl ToString) -> Error {
        Error::TypeMismatch {
            expected: expected.to_string(),
            found: found.to_string(),
        }
    }

    /// Attach the offending source location. Already-spanned errors keep the
    /// innermost location, which points closest to the fault.
    pub fn with_span(self, span: Span) -> Error {
        match self {
            Error::Spanned { .. } => self,
            other => Error::Spanned {
                span,
                inner: Box::new(other),
            },
        }
    }

    /// The underlying error with any span wrapper stripped.
    pub fn root(&self) -> &Error {
        match self {
            Error::Spanned { inner, .. } => inner.root(),
            other => other,
        }
    }
}

impl From<eyre::Report> for Error {
    fn from(err: eyre::Report) -> Self {
        Error::Generic(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Generic(e.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Generic(s)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Generic(e.to_string())
    }
}
