use std::fmt;
use std::str::FromStr;
use std::sync::RwLock;

use mbridge_runtime::{Env, ObjRef, RuntimeResult};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{MergeError, MergeResult};

/// How an adapter holds on to its managed provider object.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderRetention {
    /// A global reference: the provider lives as long as the binding.
    #[default]
    Pin,
    /// A weak reference: once the provider is otherwise unreachable and
    /// collected, every call reports the callback as unavailable.
    AllowCollection,
}

impl fmt::Display for ProviderRetention {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pin => f.write_str("pin"),
            Self::AllowCollection => f.write_str("allow-collection"),
        }
    }
}

impl FromStr for ProviderRetention {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pin" => Ok(Self::Pin),
            "allow-collection" | "allow_collection" | "weak" => Ok(Self::AllowCollection),
            other => Err(format!(
                "unknown provider retention '{other}' (expected pin or allow-collection)"
            )),
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct Bound {
    reference: ObjRef,
    retention: ProviderRetention,
}

/// The provider an adapter calls into, resolved per call.
///
/// The target is a local reference owned by the caller; `release` drops it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResolvedProvider {
    target: ObjRef,
}

impl ResolvedProvider {
    pub fn target(&self) -> ObjRef {
        self.target
    }

    /// Drop the per-call local reference.
    pub fn release(self, env: &Env<'_>) {
        if let Err(e) = env.delete_local_ref(self.target) {
            warn!(error = %e, "failed to release provider reference");
        }
    }
}

/// Long-lived reference from an adapter to its managed provider.
pub struct ProviderSlot {
    retention: ProviderRetention,
    bound: RwLock<Option<Bound>>,
}

impl ProviderSlot {
    pub fn new(retention: ProviderRetention) -> Self {
        Self {
            retention,
            bound: RwLock::new(None),
        }
    }

    pub fn retention(&self) -> ProviderRetention {
        self.retention
    }

    pub fn is_bound(&self) -> bool {
        self.bound.read().expect("lock poisoned").is_some()
    }

    /// Take a long-lived reference to `provider`, replacing any earlier one.
    ///
    /// The caller keeps ownership of `provider` itself.
    pub fn bind(&self, env: &Env<'_>, provider: ObjRef) -> RuntimeResult<()> {
        let reference = match self.retention {
            ProviderRetention::Pin => env.new_global_ref(provider)?,
            ProviderRetention::AllowCollection => env.new_weak_ref(provider)?,
        };
        let previous = self.bound.write().expect("lock poisoned").replace(Bound {
            reference,
            retention: self.retention,
        });
        if let Some(previous) = previous {
            debug!("provider rebound");
            release_bound(env, previous);
        }
        Ok(())
    }

    /// The provider to call for this invocation.
    ///
    /// Always a fresh local reference, taken while the slot is read-locked,
    /// so a concurrent rebind or release can delete the long-lived
    /// reference without invalidating a call already in flight.
    pub fn resolve(&self, env: &Env<'_>) -> MergeResult<ResolvedProvider> {
        let slot = self.bound.read().expect("lock poisoned");
        let bound = (*slot).ok_or_else(|| MergeError::unavailable("no provider bound"))?;
        match bound.retention {
            ProviderRetention::Pin => Ok(ResolvedProvider {
                target: env.new_local_ref(bound.reference)?,
            }),
            ProviderRetention::AllowCollection => match env.upgrade_weak_ref(bound.reference)? {
                Some(target) => Ok(ResolvedProvider { target }),
                None => Err(MergeError::unavailable("provider has been collected")),
            },
        }
    }

    /// Forget the provider. The managed reference is deleted when an
    /// execution handle is available and leaked to the runtime otherwise.
    pub fn release(&self, env: Option<&Env<'_>>) {
        let Some(bound) = self.bound.write().expect("lock poisoned").take() else {
            return;
        };
        match env {
            Some(env) => release_bound(env, bound),
            None => debug!("provider released without an execution handle"),
        }
    }
}

impl fmt::Debug for ProviderSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderSlot")
            .field("retention", &self.retention)
            .field("bound", &self.is_bound())
            .finish()
    }
}

fn release_bound(env: &Env<'_>, bound: Bound) {
    let result = match bound.retention {
        ProviderRetention::Pin => env.delete_global_ref(bound.reference),
        ProviderRetention::AllowCollection => env.delete_weak_ref(bound.reference),
    };
    if let Err(e) = result {
        warn!(retention = %bound.retention, error = %e, "failed to release provider");
    }
}
