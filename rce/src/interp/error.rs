//! Runtime errors for the executor
//!
//! These are failures of the harness itself, never exceptions thrown by the
//! executed method: those are reported as `Outcome::Threw`.

use std::fmt;

use crate::error::RceError;

/// Runtime error during execution
#[derive(Debug, Clone)]
pub struct RuntimeError {
    pub kind: ErrorKind,
    pub message: String,
}

/// Kinds of runtime errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Argument missing or outside the declared parameter range
    BadArgument,
    /// A store wrote outside its array: optimized code is unsound
    UnsafeAccess,
    /// Step limit reached
    OutOfFuel,
    /// The method or its compiled form is inconsistent
    Malformed,
}

impl RuntimeError {
    pub fn missing_argument(name: &str) -> Self {
        RuntimeError {
            kind: ErrorKind::BadArgument,
            message: format!("no value for parameter `{name}`"),
        }
    }

    pub fn argument_out_of_range(name: &str, value: i64, range: &str) -> Self {
        RuntimeError {
            kind: ErrorKind::BadArgument,
            message: format!("argument {name} = {value} is outside its declared range {range}"),
        }
    }

    pub fn unsafe_access(store: &str, index: i64, length: i64) -> Self {
        RuntimeError {
            kind: ErrorKind::UnsafeAccess,
            message: format!("store {store} wrote index {index} of an array of length {length}"),
        }
    }

    pub fn out_of_fuel(limit: u64) -> Self {
        RuntimeError {
            kind: ErrorKind::OutOfFuel,
            message: format!("execution exceeded {limit} steps"),
        }
    }

    pub fn malformed(msg: &str) -> Self {
        RuntimeError {
            kind: ErrorKind::Malformed,
            message: msg.to_string(),
        }
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for RuntimeError {}

impl From<RceError> for RuntimeError {
    fn from(e: RceError) -> Self {
        RuntimeError::malformed(e.message())
    }
}

/// Result type for execution
pub type ExecResult<T> = Result<T, RuntimeError>;
