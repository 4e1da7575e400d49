//! Managed runtime embedding contract for the merge bridge.
//!
//! The bridge never talks to a concrete virtual machine. Everything it needs
//! from the garbage-collected side (attaching threads, resolving methods,
//! creating buffers, calling methods, raising and inspecting exceptions) is
//! expressed by the object-safe [`ManagedRuntime`] trait.
//!
//! # Key Types
//!
//! - [`ExecutionHandle`] -- proof that the current native thread may call
//!   into the runtime; `!Send`, invalidated by detachment
//! - [`ObjRef`] -- opaque local, global or weak reference to a managed object
//! - [`Env`] -- a runtime paired with a handle; what bindings and the
//!   marshaller operate on
//! - [`NativeView`] -- a window over native memory exposed as a zero-copy
//!   managed buffer
//!
//! # Backends
//!
//! - [`SimRuntime`] -- in-memory runtime with closures as managed methods,
//!   reference accounting and a mark/sweep collector. Used by tests, the CLI
//!   and embedders that host merge logic written in Rust.

pub mod env;
pub mod error;
pub mod handle;
pub mod names;
pub mod sim;
pub mod traits;

pub use env::Env;
pub use error::{RuntimeError, RuntimeResult};
pub use handle::{ExecutionHandle, FieldId, MethodId, NativeView, ObjRef, Value};
pub use sim::{ClassDef, ManagedCall, MethodImpl, Raise, SimRuntime};
pub use traits::ManagedRuntime;
