use std::fmt;

use mbridge_attach::AttachError;
use mbridge_hooks::BindingError;
use mbridge_marshal::{ManagedError, MarshalError};
use mbridge_runtime::RuntimeError;

/// Outcome of a merge that produced no value, as reported to the engine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MergeError {
    /// The operands cannot be combined. A normal outcome: the engine falls
    /// back to its documented handling for a declined merge.
    #[error("operands cannot be combined")]
    NotCombinable,

    /// The managed callback could not be reached.
    #[error("merge callback unavailable: {reason}")]
    Unavailable { reason: String },

    /// The managed callback raised an exception.
    #[error(transparent)]
    Managed(#[from] ManagedError),
}

impl MergeError {
    pub fn unavailable(reason: impl fmt::Display) -> Self {
        Self::Unavailable {
            reason: reason.to_string(),
        }
    }

    pub fn is_not_combinable(&self) -> bool {
        matches!(self, Self::NotCombinable)
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

impl From<AttachError> for MergeError {
    fn from(e: AttachError) -> Self {
        Self::unavailable(e)
    }
}

impl From<BindingError> for MergeError {
    fn from(e: BindingError) -> Self {
        Self::unavailable(e)
    }
}

impl From<RuntimeError> for MergeError {
    fn from(e: RuntimeError) -> Self {
        Self::unavailable(e)
    }
}

impl From<MarshalError> for MergeError {
    fn from(e: MarshalError) -> Self {
        match e {
            MarshalError::Managed(managed) => Self::Managed(managed),
            MarshalError::NullResult { .. } => Self::NotCombinable,
            other => Self::unavailable(other),
        }
    }
}

/// Result alias for merge operations.
pub type MergeResult<T> = Result<T, MergeError>;
