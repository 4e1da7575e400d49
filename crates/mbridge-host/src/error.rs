use mbridge_attach::AttachError;
use mbridge_hooks::{BindingError, RegistryError};
use mbridge_operator::MergeError;
use mbridge_runtime::RuntimeError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HostError {
    #[error("hook registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("binding error: {0}")]
    Binding(#[from] BindingError),

    #[error("attach error: {0}")]
    Attach(#[from] AttachError),

    #[error("runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("merge error: {0}")]
    Merge(#[from] MergeError),

    #[error("unknown adapter handle: {0}")]
    UnknownHandle(i64),

    #[error("factory {factory} declined to create a provider")]
    FactoryDeclined { factory: String },

    #[error("managed exception in {method}: {description}")]
    ManagedRaised { method: String, description: String },

    #[error("bridge already installed")]
    AlreadyInstalled,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type HostResult<T> = Result<T, HostError>;
