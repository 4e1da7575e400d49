//! Attachment of native threads to the managed runtime.
//!
//! Native worker threads were never created by the managed runtime, so
//! before one can call managed code it has to be attached. Attaching is
//! expensive, so the handle is cached per thread and reused until the thread
//! exits (or, under the eager policy, until the outermost call returns).
//!
//! # Key Types
//!
//! - [`AttachManager`] -- hands out handles, owns the closing flag
//! - [`AttachGuard`] -- a handle checked out for one call; applies the
//!   detach policy on drop
//! - [`DetachPolicy`] -- lazy (detach at thread exit) or eager
//!
//! # Design Rules
//!
//! 1. A thread's record lives in that thread's storage and is never read by
//!    another thread.
//! 2. Dropping the record at thread exit detaches the thread, unless the
//!    runtime attached it or the bridge is closing.
//! 3. Once closing, no handle is handed out and no detach is issued.

pub mod error;
pub mod manager;
pub mod policy;
mod record;

pub use error::{AttachError, AttachResult};
pub use manager::{AttachGuard, AttachManager};
pub use policy::DetachPolicy;
pub use record::{Origin, ThreadAttachment};
