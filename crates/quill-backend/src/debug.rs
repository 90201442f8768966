//! Source-location metadata for lowered code.
//!
//! Spans carry byte offsets; the emitter wants `line:column`. The builder
//! indexes newline offsets once per source file and resolves spans against
//! that index. A disabled builder resolves nothing and costs nothing.

use quill_core::ir::{DebugLoc, ModuleDebugInfo, SubprogramInfo};
use quill_core::span::Span;

const PRODUCER: &str = "quill";

pub struct DebugInfoBuilder {
    file: String,
    line_starts: Vec<u32>,
    enabled: bool,
}

impl DebugInfoBuilder {
    pub fn new(file: impl Into<String>, source: &str) -> Self {
        let mut line_starts = vec![0u32];
        for (offset, byte) in source.bytes().enumerate() {
            if byte == b'\n' {
                line_starts.push(offset as u32 + 1);
            }
        }
        Self {
            file: file.into(),
            line_starts,
            enabled: true,
        }
    }

    pub fn disabled() -> Self {
        Self {
            file: String::new(),
            line_starts: vec![0],
            enabled: false,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// One-based line and column of the start of `span`.
    pub fn location(&self, span: Span) -> Option<DebugLoc> {
        if !self.enabled {
            return None;
        }
        let line = match self.line_starts.binary_search(&span.lo) {
            Ok(index) => index,
            Err(index) => index - 1,
        };
        Some(DebugLoc {
            line: line as u32 + 1,
            column: span.lo - self.line_starts[line] + 1,
        })
    }

    pub fn subprogram(&self, name: &str, span: Span) -> Option<SubprogramInfo> {
        let loc = self.location(span)?;
        Some(SubprogramInfo {
            name: name.to_string(),
            file: self.file.clone(),
            line: loc.line,
        })
    }

    pub fn module_info(&self) -> Option<ModuleDebugInfo> {
        if !self.enabled {
            return None;
        }
        Some(ModuleDebugInfo {
            file: self.file.clone(),
            producer: PRODUCER.to_string(),
        })
    }
}
