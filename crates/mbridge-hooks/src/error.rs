use std::fmt;

use mbridge_runtime::RuntimeError;

/// Errors from resolving or using a cached managed binding.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BindingError {
    /// A managed type or member a binding needs could not be found.
    #[error("binding {binding}: cannot resolve {member}: {reason}")]
    ResolutionFailure {
        binding: String,
        member: String,
        reason: String,
    },

    /// The binding was used before its loader ran.
    #[error("binding {0} is not loaded")]
    NotLoaded(String),

    /// The binding was used after its unloader released it.
    #[error("binding {0} has been released")]
    Released(String),

    /// A loader tried to set a binding twice.
    #[error("binding {0} is already loaded")]
    AlreadyLoaded(String),

    /// Releasing managed references held by the binding failed.
    #[error("binding {binding}: release failed: {reason}")]
    ReleaseFailure { binding: String, reason: String },
}

impl BindingError {
    pub fn resolution(binding: &str, member: &str, source: RuntimeError) -> Self {
        Self::ResolutionFailure {
            binding: binding.to_string(),
            member: member.to_string(),
            reason: source.to_string(),
        }
    }
}

/// Result alias for binding operations.
pub type BindingResult<T> = Result<T, BindingError>;

/// Lifecycle phase of a [`HookRegistry`](crate::HookRegistry).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Accepting registrations.
    Open,
    Loaded,
    Unloaded,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open => f.write_str("open"),
            Self::Loaded => f.write_str("loaded"),
            Self::Unloaded => f.write_str("unloaded"),
        }
    }
}

/// Errors from the hook registry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// Hooks can only be registered before load.
    #[error("hook registry is {phase}; registration is closed")]
    Frozen { phase: Phase },

    /// `run_loaders` was called outside the open phase.
    #[error("cannot run loaders: registry is {phase}")]
    NotOpen { phase: Phase },

    /// A loader could not resolve its binding; load is aborted.
    #[error("loader {hook} failed: {source}")]
    LoaderFailed {
        hook: String,
        #[source]
        source: BindingError,
    },
}

/// Result alias for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;
