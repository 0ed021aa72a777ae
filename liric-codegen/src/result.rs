//! The error taxonomy shared across LIRIC's pipeline stages.
//!
//! Every public entry point in the crate family either succeeds and
//! leaves state consistent, or fails with one of these variants and
//! leaves state unchanged relative to its start (see spec §7). No
//! stage panics on malformed-but-reachable input; `unwrap`/`expect` are
//! reserved for invariants the type system or prior validation already
//! guarantees.

use std::fmt;

/// A single-line, user-facing diagnostic plus an error-code category.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CodegenError {
    /// Caller violated a precondition (null, empty, out of range).
    #[error("argument error: {0}")]
    Argument(String),

    /// A sequencing rule was broken (e.g. emitting without a current
    /// block, or ending a function with an unterminated block).
    #[error("state error: {0}")]
    State(String),

    /// Operation incompatible with the current session mode.
    #[error("mode error: {0}")]
    Mode(String),

    /// Symbol lookup missed after all resolution steps were exhausted.
    #[error("symbol not found: {0}")]
    NotFound(String),

    /// Instruction selection, encoding, JIT paging, or dynamic-library
    /// failure, including "target does not support this opcode".
    #[error("backend error: {0}")]
    Backend(String),

    /// Textual IR lexer/parser failure; carries `line:col: message`.
    #[error("parse error: {0}")]
    Parse(ParseError),
}

/// A parser diagnostic with source position, formatted as `line:col: message`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    /// 1-based source line.
    pub line: u32,
    /// 1-based source column.
    pub col: u32,
    /// Human-readable description.
    pub message: String,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}: {}", self.line, self.col, self.message)
    }
}

impl ParseError {
    /// Construct a new parse error at `line:col`.
    pub fn new(line: u32, col: u32, message: impl Into<String>) -> Self {
        Self {
            line,
            col,
            message: message.into(),
        }
    }
}

impl CodegenError {
    /// Build an [`CodegenError::Argument`] from a displayable message.
    pub fn argument(msg: impl Into<String>) -> Self {
        CodegenError::Argument(msg.into())
    }

    /// Build a [`CodegenError::State`] from a displayable message.
    pub fn state(msg: impl Into<String>) -> Self {
        CodegenError::State(msg.into())
    }

    /// Build a [`CodegenError::Backend`] from a displayable message.
    pub fn backend(msg: impl Into<String>) -> Self {
        CodegenError::Backend(msg.into())
    }
}

impl From<ParseError> for CodegenError {
    fn from(e: ParseError) -> Self {
        CodegenError::Parse(e)
    }
}

/// The result type returned by every fallible entry point in the
/// LIRIC pipeline.
pub type CodegenResult<T> = Result<T, CodegenError>;
