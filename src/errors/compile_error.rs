#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Error produced while translating source text into bytecode, either by
/// the parser or by the code generator.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CompileError {
    pub source_name: String,
    pub line: u32,
    pub message: String,
}

impl CompileError {
    pub fn new(source_name: impl Into<String>, line: u32, message: impl Into<String>) -> Self {
        Self {
            source_name: source_name.into(),
            line,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "compile error near line({}) {}: {}",
            self.line, self.source_name, self.message
        )
    }
}

impl std::error::Error for CompileError {}
