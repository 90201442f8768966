use crate::span::Span;
use once_cell::sync::Lazy;
use std::fmt::{Display, Formatter};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticLevel {
    Info,
    Warning,
    Error,
}

#[derive(Clone)]
pub struct Diagnostic<T = String>
where
    T: Clone + Display,
{
    pub level: DiagnosticLevel,
    pub message: T,
    pub span: Option<Span>,
    pub suggestions: Vec<String>,
    pub source_context: Option<String>,
}

impl<T> Diagnostic<T>
where
    T: Clone + Display,
{
    pub fn error(message: T) -> Self {
        Self {
            level: DiagnosticLevel::Error,
            message,
            span: None,
            suggestions: Vec::new(),
            source_context: None,
        }
    }

    pub fn warning(message: T) -> Self {
        Self {
            level: DiagnosticLevel::Warning,
            message,
            span: None,
            suggestions: Vec::new(),
            source_context: None,
        }
    }

    pub fn info(message: T) -> Self {
        Self {
            level: DiagnosticLevel::Info,
            message,
            span: None,
            suggestions: Vec::new(),
            source_context: None,
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }

    pub fn with_source_context(mut self, context: impl Into<String>) -> Self {
        self.source_context = Some(context.into());
        self
    }

    pub fn as_string_diagnostic(&self) -> Diagnostic<String> {
        Diagnostic {
            level: self.level,
            message: self.message.to_string(),
            span: self.span,
            suggestions: self.suggestions.clone(),
            source_context: self.source_context.clone(),
        }
    }
}

impl<T> std::fmt::Debug for Diagnostic<T>
where
    T: Clone + Display,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Diagnostic")
            .field("level", &self.level)
            .field("message", &self.message.to_string())
            .field("span", &self.span)
            .field("suggestions", &self.suggestions)
            .field("source_context", &self.source_context)
            .finish()
    }
}

impl<T> Display for Diagnostic<T>
where
    T: Clone + Display,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;

        if !self.suggestions.is_empty() {
            let hints = self.suggestions.join("; ");
            write!(f, " (hints: {})", hints)?;
        }

        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct DiagnosticManager {
    diagnostics: Arc<Mutex<Vec<Diagnostic>>>,
}

impl DiagnosticManager {
    pub fn new() -> Self {
        Self {
            diagnostics: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn error(&self, diagnostic: Diagnostic) {
        self.add_diagnostic(diagnostic);
    }

    pub fn add_diagnostic(&self, diagnostic: Diagnostic) {
        if let Ok(mut diagnostics) = self.diagnostics.lock() {
            diagnostics.push(diagnostic);
        }
    }

    pub fn get_diagnostics(&self) -> Vec<Diagnostic> {
        self.diagnostics
            .lock()
            .map(|d| d.clone())
            .unwrap_or_default()
    }

    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .lock()
            .map(|d| d.iter().any(|diag| diag.level == DiagnosticLevel::Error))
            .unwrap_or(false)
    }

    pub fn clear(&self) {
        if let Ok(mut diagnostics) = self.diagnostics.lock() {
            diagnostics.clear();
        }
    }

    /// Print diagnostics to stderr. The fallback context is used when a
    /// diagnostic does not carry a source context of its own.
    pub fn emit<M>(diagnostics: &[Diagnostic<M>], fallback_context: Option<&str>)
    where
        M: Clone + Display,
    {
        for diagnostic in diagnostics {
            let context = diagnostic
                .source_context
                .as_deref()
                .or(fallback_context)
                .unwrap_or("backend");

            let level = match diagnostic.level {
                DiagnosticLevel::Error => "ERROR",
                DiagnosticLevel::Warning => "WARNING",
                DiagnosticLevel::Info => "INFO",
            };

            let printable = diagnostic.as_string_diagnostic();
            eprintln!("[{}] {}: {}", context, level, printable.message);
            if let Some(span) = &printable.span {
                eprintln!("   at {}", span);
            }
            for suggestion in &printable.suggestions {
                eprintln!("   suggestion: {}", suggestion);
            }
        }
    }
}

impl Default for DiagnosticManager {
    fn default() -> Self {
        DiagnosticManager::new()
    }
}

static GLOBAL_DIAGNOSTIC_MANAGER: Lazy<Arc<DiagnosticManager>> =
    Lazy::new(|| Arc::new(DiagnosticManager::new()));

pub fn diagnostic_manager() -> Arc<DiagnosticManager> {
    GLOBAL_DIAGNOSTIC_MANAGER.clone()
}

/// Record an error diagnostic on the global manager and hand back a structured
/// error for the caller to propagate.
pub fn report_error(message: impl Into<String>) -> crate::error::Error {
    let diagnostic = Diagnostic::error(message.into());
    diagnostic_manager().error(diagnostic.clone());
    crate::error::Error::Generic(diagnostic.message)
}

#[macro_export]
macro_rules! emit_error {
    ($manager:expr, $context:expr, $($arg:tt)*) => {
        $manager.add_diagnostic(
            $crate::diagnostics::Diagnostic::error(format!($($arg)*))
                .with_source_context($context.to_string())
        )
    };
}
