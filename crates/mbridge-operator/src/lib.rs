//! Merge operators for a native key-value engine, backed by managed code.
//!
//! The engine sees every adapter through the [`MergeOperator`] contract.
//! Three adapters forward merges to a provider object living in the managed
//! runtime; the fourth, [`XorOperator`], never leaves native code.
//!
//! # Key Types
//!
//! - [`MergeOperator`] / [`AssociativeMergeOperator`] -- the engine-facing
//!   contract
//! - [`AssociativeAdapter`] -- pairwise `merge`, copying or zero-copy
//! - [`NonAssociativeAdapter`] -- full, partial and multi-operand merges
//!   with per-instance feature flags
//! - [`Adapter`] -- one of the above built from an [`AdapterConfig`]
//! - [`BindingSet`] -- managed handles filled by the load hooks
//! - [`ProviderSlot`] -- pinned or collectable provider reference
//!
//! # Design Rules
//!
//! 1. A declined or failed callback is reported as an error value, never a
//!    panic; the engine keeps the operands unmerged.
//! 2. Disabled features return their fixed answer without calling back.
//! 3. No adapter attaches a thread or resolves a binding on its own; both
//!    come from the shared [`AttachManager`](mbridge_attach::AttachManager)
//!    and [`BindingSet`].

pub mod adapter;
pub mod bindings;
pub mod callback;
pub mod config;
pub mod contract;
pub mod error;
pub mod managed;
pub mod provider;
pub mod xor;

pub use adapter::{Adapter, AssociativeAdapter, NonAssociativeAdapter};
pub use bindings::{AssociativeBindings, BindingSet, BufferClasses, FactoryBindings, NonAssociativeBindings};
pub use callback::Callback;
pub use config::{AdapterConfig, AdapterKind, ClassNames, NonAssociativeConfig};
pub use contract::{associative_partial_merge, fold_full_merge, AssociativeMergeOperator, MergeInput, MergeOperator};
pub use error::{MergeError, MergeResult};
pub use provider::{ProviderRetention, ProviderSlot, ResolvedProvider};
pub use xor::{xor_merge, XorOperator};
