//! Process-wide merge bridge.
//!
//! Ties the attachment manager, the hook registry and the adapters to one
//! managed runtime, and exposes what the runtime and the engine call: the
//! load and unload entry points, and the create/bind/dispose operations on
//! adapter handles.
//!
//! # Key Types
//!
//! - [`Bridge`] -- owns one runtime's bridge state
//! - [`AdapterTable`] / [`NativeHandle`] -- adapters by managed-side handle
//! - [`BridgeConfig`] -- TOML and environment configuration
//!
//! # Design Rules
//!
//! 1. Every binding is registered before load, and nothing is registered
//!    after it.
//! 2. Unload never attaches a thread.
//! 3. The engine holds adapters by `Arc`; disposing a handle only cuts the
//!    adapter off from its provider.

pub mod bridge;
pub mod config;
pub mod entry;
pub mod error;
pub mod table;

pub use bridge::{Bridge, FactoryAdapter};
pub use config::{BridgeConfig, ENV_DETACH_POLICY, ENV_PROVIDER_RETENTION};
pub use entry::{install, installed, on_load, on_unload};
pub use error::{HostError, HostResult};
pub use table::{AdapterTable, NativeHandle};
