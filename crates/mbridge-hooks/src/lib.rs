//! Lifecycle hooks and cached managed bindings.
//!
//! Each operator kind needs a handful of managed types and methods. They
//! are resolved once, by a loader hook that runs when the bridge is loaded
//! into the runtime, and released once, by an unloader hook that runs at
//! unload. In between, worker threads read them without locking.
//!
//! # Key Types
//!
//! - [`HookRegistry`] -- ordered loaders and unloaders
//! - [`BindingCell`] -- write-once slot; reads after release fail loudly
//! - [`ClassBinding`] / [`MethodBinding`] -- a pinned managed type and a
//!   resolved method on it
//! - [`ReturnEnvelopeBinding`] -- the result envelope type and its
//!   "result is a reference" flag

pub mod binding;
pub mod error;
pub mod registry;

pub use binding::{BindingCell, ClassBinding, MethodBinding, ReturnEnvelopeBinding, IS_REFERENCE_FIELD};
pub use error::{BindingError, BindingResult, Phase, RegistryError, RegistryResult};
pub use registry::{HookRegistry, Loader, UnloadFailure, UnloadReport, Unloader};
