use super::CompileError;
use crate::value::Value;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Classification of a runtime failure as observed through the embedding
/// API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ErrorKind {
    /// Source text or a precompiled chunk failed to load.
    Syntax,
    /// A chunk file could not be opened or read.
    File,
    /// An error raised while executing bytecode or by a host function.
    Run,
    /// An error raised inside an error handler.
    Error,
    /// A host-side crash; never catchable from scripts.
    Panic,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Syntax => "syntax",
            ErrorKind::File => "file",
            ErrorKind::Run => "run",
            ErrorKind::Error => "error",
            ErrorKind::Panic => "panic",
        }
    }
}

/// A runtime failure: the raised value (usually a string that already
/// carries the assembled traceback) tagged with how it was produced.
#[derive(Debug, Clone)]
pub struct RuntimeError {
    pub kind: ErrorKind,
    pub value: Value,
}

impl RuntimeError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            value: Value::string(message.into()),
        }
    }

    pub fn with_value(kind: ErrorKind, value: Value) -> Self {
        Self { kind, value }
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Run, message)
    }
}

impl std::fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.value.display_string())
    }
}

impl std::error::Error for RuntimeError {}

impl From<CompileError> for RuntimeError {
    fn from(err: CompileError) -> Self {
        RuntimeError::new(ErrorKind::Syntax, err.to_string())
    }
}

impl From<std::io::Error> for RuntimeError {
    fn from(err: std::io::Error) -> Self {
        RuntimeError::new(ErrorKind::File, err.to_string())
    }
}
