use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coarse status code reported alongside every [`PrimitiveError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    Success,
    InvalidArguments,
    Unimplemented,
    OutOfMemory,
    RuntimeError,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Success => "success",
            Status::InvalidArguments => "invalid_arguments",
            Status::Unimplemented => "unimplemented",
            Status::OutOfMemory => "out_of_memory",
            Status::RuntimeError => "runtime_error",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure surfaced by descriptor construction, resolution, caching or execution.
///
/// Every layer forwards the first failure it sees without retrying, so callers can tell an
/// unsupported shape apart from memory pressure or a malformed request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PrimitiveError {
    #[error("invalid arguments: {message}")]
    InvalidArguments { message: String },
    #[error("{op} is not implemented: {reason}")]
    Unimplemented { op: &'static str, reason: String },
    #[error("out of memory while {context} ({bytes} bytes)")]
    OutOfMemory { context: String, bytes: usize },
    #[error("primitive execution failure: {message}")]
    Execution { message: String },
}

impl PrimitiveError {
    pub fn invalid_arguments(message: impl Into<String>) -> Self {
        PrimitiveError::InvalidArguments {
            message: message.into(),
        }
    }

    pub fn unimplemented(op: &'static str, reason: impl Into<String>) -> Self {
        PrimitiveError::Unimplemented {
            op,
            reason: reason.into(),
        }
    }

    pub fn out_of_memory(context: impl Into<String>, bytes: usize) -> Self {
        PrimitiveError::OutOfMemory {
            context: context.into(),
            bytes,
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        PrimitiveError::Execution {
            message: message.into(),
        }
    }

    pub fn status(&self) -> Status {
        match self {
            PrimitiveError::InvalidArguments { .. } => Status::InvalidArguments,
            PrimitiveError::Unimplemented { .. } => Status::Unimplemented,
            PrimitiveError::OutOfMemory { .. } => Status::OutOfMemory,
            PrimitiveError::Execution { .. } => Status::RuntimeError,
        }
    }

    /// Returns `true` when a candidate declined the request; resolution moves on to the next one.
    pub fn is_unimplemented(&self) -> bool {
        matches!(self, PrimitiveError::Unimplemented { .. })
    }
}

/// Convenience alias for results returned by the primitive layer.
pub type PrimResult<T> = Result<T, PrimitiveError>;

/// Early-returns `Unimplemented` for `op` unless `cond` holds.
#[macro_export]
macro_rules! ensure_supported {
    ($cond:expr, $op:expr, $($reason:tt)+) => {
        if !$cond {
            return Err($crate::error::PrimitiveError::unimplemented($op, format!($($reason)+)));
        }
    };
}
