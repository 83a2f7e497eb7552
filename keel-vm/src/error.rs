//! Fatal VM errors
//!
//! Everything here terminates the run: these are compiler/VM contract
//! violations, not user-level failures. Recoverable language errors never
//! appear as `VmError`; they travel as [`ErrorValue`]s through the
//! error-union machinery and only surface here as [`VmError::UnhandledError`]
//! when they reach the top level unhandled.

use keel_core::value::ErrorValue;
use std::fmt;

/// VM error types with rich context
#[derive(Debug, Clone)]
pub enum VmError {
    /// Operand stack overflow
    StackOverflow {
        current_depth: usize,
        max_depth: usize,
    },

    /// Operand stack underflow
    StackUnderflow {
        operation: String,
        stack_size: usize,
    },

    /// Call stack overflow
    CallStackOverflow {
        current_depth: usize,
        max_depth: usize,
    },

    /// Type error
    TypeError {
        operation: String,
        expected: String,
        got: String,
        line: u32,
    },

    /// Unknown variable outside the error-union channel
    UndefinedVariable { name: String, line: u32 },

    /// CALL resolved to nothing callable
    UndefinedFunction { name: String, line: u32 },

    /// Jump left the instruction array
    InvalidJumpTarget { target: i64, program_len: usize },

    /// The instruction stream violates a structural contract
    MalformedProgram { message: String, line: u32 },

    /// Module registry failure
    ModuleError { module_name: String, message: String },

    /// A language-level error reached the top level with no handler
    UnhandledError { error: ErrorValue, line: u32 },

    /// Runtime error
    RuntimeError {
        message: String,
        stack_trace: Option<StackTrace>,
    },
}

/// Stack frame information
#[derive(Debug, Clone)]
pub struct StackFrame {
    pub function_name: String,
    pub ip: usize,
    pub line: u32,
}

/// Stack trace
#[derive(Debug, Clone, Default)]
pub struct StackTrace {
    pub frames: Vec<StackFrame>,
}

impl StackTrace {
    pub fn new() -> Self {
        Self { frames: Vec::new() }
    }

    pub fn push_frame(&mut self, frame: StackFrame) {
        self.frames.push(frame);
    }
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::StackOverflow {
                current_depth,
                max_depth,
            } => {
                write!(
                    f,
                    "Stack overflow: depth {} exceeds maximum {}",
                    current_depth, max_depth
                )
            }
            VmError::StackUnderflow {
                operation,
                stack_size,
            } => {
                write!(
                    f,
                    "Stack underflow in {}: stack size is {}",
                    operation, stack_size
                )
            }
            VmError::CallStackOverflow {
                current_depth,
                max_depth,
            } => {
                write!(
                    f,
                    "Call stack overflow: depth {} exceeds maximum {}",
                    current_depth, max_depth
                )
            }
            VmError::TypeError {
                operation,
                expected,
                got,
                line,
            } => {
                write!(
                    f,
                    "Type error in {}: expected {}, got {} (line {})",
                    operation, expected, got, line
                )
            }
            VmError::UndefinedVariable { name, line } => {
                write!(f, "Undefined variable '{}' (line {})", name, line)
            }
            VmError::UndefinedFunction { name, line } => {
                write!(f, "Undefined function '{}' (line {})", name, line)
            }
            VmError::InvalidJumpTarget {
                target,
                program_len,
            } => {
                write!(
                    f,
                    "Invalid jump target: {} (program length: {})",
                    target, program_len
                )
            }
            VmError::MalformedProgram { message, line } => {
                write!(f, "Malformed program: {} (line {})", message, line)
            }
            VmError::ModuleError {
                module_name,
                message,
            } => {
                write!(f, "Module error in '{}': {}", module_name, message)
            }
            VmError::UnhandledError { error, line } => {
                write!(f, "Unhandled error: {} (line {})", error, line)
            }
            VmError::RuntimeError {
                message,
                stack_trace,
            } => {
                write!(f, "Runtime error: {}", message)?;
                if let Some(trace) = stack_trace {
                    write!(f, "\nStack trace:")?;
                    for (i, frame) in trace.frames.iter().enumerate() {
                        write!(
                            f,
                            "\n  {}: {} at ip {} (line {})",
                            i, frame.function_name, frame.ip, frame.line
                        )?;
                    }
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for VmError {}

impl From<anyhow::Error> for VmError {
    fn from(err: anyhow::Error) -> Self {
        VmError::RuntimeError {
            message: err.to_string(),
            stack_trace: None,
        }
    }
}

/// Result type for VM operations
pub type VmResult<T> = Result<T, VmError>;
