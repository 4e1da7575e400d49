/// Errors from the attachment manager.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AttachError {
    /// The native thread could not obtain an execution handle.
    #[error("attachment failure: {reason}")]
    AttachmentFailure { reason: String },

    /// The bridge is shutting down; no new calls are admitted.
    #[error("bridge is closing")]
    Closing,

    /// Explicit detach was requested while a call on this thread still
    /// holds the handle.
    #[error("thread is inside a managed call and cannot detach")]
    InUse,

    /// The runtime rejected an explicit detach.
    #[error("detach failure: {reason}")]
    DetachFailure { reason: String },
}

/// Result alias for attachment operations.
pub type AttachResult<T> = Result<T, AttachError>;
