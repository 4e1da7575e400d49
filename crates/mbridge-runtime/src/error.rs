use crate::handle::ObjRef;

/// Errors reported by a [`ManagedRuntime`](crate::ManagedRuntime).
///
/// These describe misuse of the embedding interface or refusals by the
/// runtime. An exception raised by managed code is *not* a `RuntimeError`:
/// it is left pending on the thread and observed through
/// `exception_occurred`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuntimeError {
    /// The handle was detached, or presented on a thread it was not issued to.
    #[error("execution handle is not valid on this thread")]
    InvalidHandle,

    /// The runtime refused to attach the current thread.
    #[error("runtime refused to attach thread: {0}")]
    AttachRefused(String),

    /// The runtime does not support the interface version the bridge needs.
    #[error("runtime interface version {requested} is not supported")]
    VersionUnsupported { requested: u32 },

    /// No type with the given name is known to the runtime.
    #[error("class not found: {0}")]
    ClassNotFound(String),

    /// No method with the given name and signature exists on the type.
    #[error("method not found: {class}.{name}{signature}")]
    MethodNotFound {
        class: String,
        name: String,
        signature: String,
    },

    /// No field with the given name and signature exists on the type.
    #[error("field not found: {class}.{name}:{signature}")]
    FieldNotFound {
        class: String,
        name: String,
        signature: String,
    },

    /// A type with this name is already defined.
    #[error("class already defined: {0}")]
    DuplicateClass(String),

    /// A call supplied a different number of arguments than the signature declares.
    #[error("{method} expects {expected} arguments, got {found}")]
    ArityMismatch {
        method: String,
        expected: usize,
        found: usize,
    },

    /// The method is declared but has no implementation on the receiver.
    #[error("abstract method invoked: {0}")]
    AbstractMethod(String),

    /// A call was attempted while an exception is pending on the thread.
    #[error("an exception is pending on the current thread")]
    ExceptionPending,

    /// The reference is unknown, already deleted, or owned by another thread.
    #[error("invalid reference {0:?}")]
    InvalidReference(ObjRef),

    /// The reference resolved to nothing (a null or collected object).
    #[error("null reference")]
    NullReference,

    /// The object is not of the kind the operation requires.
    #[error("wrong object kind: expected {expected}, found {found}")]
    WrongKind {
        expected: &'static str,
        found: &'static str,
    },

    /// A zero-copy view was read after its backing native memory was released.
    #[error("zero-copy view has been revoked")]
    RevokedView,
}

/// Result alias for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;
