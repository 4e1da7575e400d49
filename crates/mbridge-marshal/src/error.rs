use std::fmt;

use mbridge_runtime::RuntimeError;

/// A managed exception raised by a callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedError {
    /// The method that raised, as `Type.name(sig)ret`.
    pub method: String,
    /// The runtime's `Type: message` rendering of the exception.
    pub description: String,
    /// Whether the exception was handed back to a managed caller.
    pub rethrown: bool,
}

impl fmt::Display for ManagedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "managed exception in {}: {}", self.method, self.description)
    }
}

impl std::error::Error for ManagedError {}

/// Errors from a marshalled call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MarshalError {
    #[error(transparent)]
    Managed(#[from] ManagedError),

    /// The callback returned null; the merge is declined.
    #[error("{method} returned null")]
    NullResult { method: String },

    /// The callback returned something other than the expected kind.
    #[error("{method} returned {found}, expected {expected}")]
    ResultKind {
        method: String,
        expected: &'static str,
        found: String,
    },

    /// An operand list was passed without the byte array type.
    #[error("operand lists need the byte array class")]
    MissingOperandClass,

    #[error("runtime error: {0}")]
    Runtime(#[from] RuntimeError),
}

/// Result alias for marshalled calls.
pub type MarshalResult<T> = Result<T, MarshalError>;
