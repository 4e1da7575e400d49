use std::sync::Arc;

use mbridge_attach::{AttachManager, Origin};
use mbridge_marshal::ExceptionRouting;
use mbridge_runtime::{Env, ObjRef, RuntimeResult};

use crate::bindings::BindingSet;
use crate::error::MergeResult;
use crate::provider::{ProviderRetention, ProviderSlot};

/// Route from an adapter to its managed provider.
///
/// Owns the provider reference and shares the attachment manager and the
/// loaded bindings with every other adapter of the bridge.
#[derive(Debug)]
pub struct Callback {
    attach: Arc<AttachManager>,
    bindings: Arc<BindingSet>,
    provider: ProviderSlot,
}

impl Callback {
    pub fn new(attach: Arc<AttachManager>, bindings: Arc<BindingSet>, retention: ProviderRetention) -> Self {
        Self {
            attach,
            bindings,
            provider: ProviderSlot::new(retention),
        }
    }

    pub fn bindings(&self) -> &BindingSet {
        &self.bindings
    }

    pub fn provider(&self) -> &ProviderSlot {
        &self.provider
    }

    pub fn is_closing(&self) -> bool {
        self.attach.is_closing()
    }

    pub fn bind(&self, env: &Env<'_>, provider: ObjRef) -> RuntimeResult<()> {
        self.provider.bind(env, provider)
    }

    /// Run `f` against the provider on the calling thread.
    ///
    /// Exceptions are handed back to the managed caller only when the
    /// runtime itself owns the thread; on engine worker threads there is
    /// nobody to receive them.
    pub fn call<R>(&self, f: impl FnOnce(&Env<'_>, ObjRef, ExceptionRouting) -> MergeResult<R>) -> MergeResult<R> {
        let guard = self.attach.acquire()?;
        let env = guard.env();
        let provider = self.provider.resolve(&env)?;
        let routing = match guard.origin() {
            Origin::Runtime => ExceptionRouting::Rethrow,
            Origin::Bridge => ExceptionRouting::LogAndClear,
        };
        let result = f(&env, provider.target(), routing);
        provider.release(&env);
        result
    }

    /// Drop the provider reference. While closing only an existing handle
    /// is used; otherwise the thread is attached as for a call.
    pub fn release(&self) {
        if !self.provider.is_bound() {
            return;
        }
        let guard = match self.attach.acquire() {
            Ok(guard) => Some(guard),
            Err(_) => self.attach.acquire_for_teardown(),
        };
        match guard {
            Some(guard) => self.provider.release(Some(&guard.env())),
            None => self.provider.release(None),
        }
    }
}
