use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroI64;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};

use mbridge_attach::AttachManager;
use mbridge_operator::{Adapter, AdapterConfig, BindingSet, MergeOperator, ProviderRetention};
use mbridge_runtime::{Env, ObjRef};
use tracing::debug;

use crate::error::{HostError, HostResult};

/// Opaque adapter handle as stored on the managed side.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NativeHandle(NonZeroI64);

impl NativeHandle {
    pub fn from_raw(raw: i64) -> Option<Self> {
        NonZeroI64::new(raw).map(Self)
    }

    pub fn into_raw(self) -> i64 {
        self.0.get()
    }
}

impl fmt::Display for NativeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0.get())
    }
}

/// Live adapters keyed by the handle the managed side holds.
///
/// The engine is handed an `Arc` of the adapter, so disposing the handle
/// never invalidates an operator the engine is still calling; the adapter
/// just stops reaching its provider.
pub struct AdapterTable {
    attach: Arc<AttachManager>,
    bindings: Arc<BindingSet>,
    default_retention: ProviderRetention,
    next: AtomicI64,
    adapters: RwLock<HashMap<NativeHandle, Arc<Adapter>>>,
}

impl AdapterTable {
    pub fn new(attach: Arc<AttachManager>, bindings: Arc<BindingSet>, default_retention: ProviderRetention) -> Self {
        Self {
            attach,
            bindings,
            default_retention,
            next: AtomicI64::new(1),
            adapters: RwLock::new(HashMap::new()),
        }
    }

    /// Number of live adapters.
    pub fn len(&self) -> usize {
        self.adapters.read().expect("lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.read().expect("lock poisoned").is_empty()
    }

    /// Allocate an adapter. Nothing managed happens until it is bound.
    pub fn create_native(&self, config: &AdapterConfig) -> NativeHandle {
        let handle = loop {
            if let Some(h) = NativeHandle::from_raw(self.next.fetch_add(1, Ordering::Relaxed)) {
                break h;
            }
        };
        let adapter = Adapter::new(
            config,
            Arc::clone(&self.attach),
            Arc::clone(&self.bindings),
            self.default_retention,
        );
        debug!(%handle, operator = adapter.name(), "adapter created");
        self.adapters
            .write()
            .expect("lock poisoned")
            .insert(handle, Arc::new(adapter));
        handle
    }

    /// Give the adapter its provider. The caller keeps `provider`.
    pub fn bind_callback(&self, handle: NativeHandle, env: &Env<'_>, provider: ObjRef) -> HostResult<()> {
        self.operator(handle)?.bind(env, provider)?;
        debug!(%handle, "provider bound");
        Ok(())
    }

    /// The operator to hand to the engine.
    pub fn operator(&self, handle: NativeHandle) -> HostResult<Arc<Adapter>> {
        self.adapters
            .read()
            .expect("lock poisoned")
            .get(&handle)
            .cloned()
            .ok_or(HostError::UnknownHandle(handle.into_raw()))
    }

    /// Release the provider and forget the handle.
    pub fn dispose_native(&self, handle: NativeHandle) -> HostResult<()> {
        let adapter = self
            .adapters
            .write()
            .expect("lock poisoned")
            .remove(&handle)
            .ok_or(HostError::UnknownHandle(handle.into_raw()))?;
        adapter.release();
        debug!(%handle, "adapter disposed");
        Ok(())
    }

    /// Release every provider, keeping the handles valid for a later
    /// dispose. Returns how many adapters were visited.
    pub fn release_providers(&self) -> usize {
        let adapters: Vec<Arc<Adapter>> = self.adapters.read().expect("lock poisoned").values().cloned().collect();
        for adapter in &adapters {
            adapter.release();
        }
        adapters.len()
    }
}

impl fmt::Debug for AdapterTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterTable")
            .field("adapters", &self.len())
            .field("default_retention", &self.default_retention)
            .finish()
    }
}
