//! Callback marshalling between native byte ranges and managed methods.
//!
//! A call turns each native argument into a transient managed buffer
//! (copied, or a zero-copy view), appends a fresh result envelope, invokes
//! the bound method, and then either decodes the result into native memory
//! or captures the managed exception. Transient buffers are released on
//! every path before the call returns.
//!
//! # Key Types
//!
//! - [`invoke`] / [`invoke_predicate`] -- the two call shapes
//! - [`CallSpec`] -- method, envelope, buffer mode and exception routing
//! - [`LocalScope`] -- releases a call's local references exactly once
//! - [`ManagedError`] -- a captured managed exception

pub mod error;
pub mod marshaller;
pub mod scope;

pub use error::{ManagedError, MarshalError, MarshalResult};
pub use marshaller::{invoke, invoke_predicate, Argument, BufferMode, CallSpec, ExceptionRouting};
pub use scope::LocalScope;
