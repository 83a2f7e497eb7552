//! Error types for value operations

use thiserror::Error;

/// Error type for value operations
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValueError {
    /// Type mismatch error
    #[error("type error: expected {expected}, got {actual}")]
    TypeError {
        expected: &'static str,
        actual: &'static str,
    },

    /// Index out of bounds
    #[error("index {index} out of bounds for length {length}")]
    IndexOutOfBounds { index: i64, length: usize },

    /// Key not found in dict
    #[error("key not found: {0}")]
    KeyNotFound(String),

    /// Invalid operation
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// Conversion error
    #[error("cannot convert {from} to {to}: {reason}")]
    ConversionError {
        from: &'static str,
        to: &'static str,
        reason: String,
    },

    /// Division by zero
    #[error("division by zero")]
    DivisionByZero,

    /// Undefined variable in an environment chain
    #[error("undefined variable '{0}'")]
    UndefinedVariable(String),

    /// Function arity mismatch
    #[error("function expects {expected} arguments, got {actual}")]
    ArityMismatch { expected: usize, actual: usize },
}

/// Result type for value operations
pub type ValueResult<T> = Result<T, ValueError>;
