use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

use mbridge_runtime::{names, Env, FieldId, MethodId, ObjRef, RuntimeResult};
use tracing::{error, trace, warn};

use crate::error::{BindingError, BindingResult};

// ---------------------------------------------------------------------------
// BindingCell
// ---------------------------------------------------------------------------

/// A write-once slot for a resolved binding.
///
/// Set by a loader, read lock-free by every worker thread afterwards, and
/// marked released by the matching unloader. Reads after release fail with
/// [`BindingError::Released`] instead of touching stale managed handles.
pub struct BindingCell<T> {
    name: String,
    value: OnceLock<T>,
    released: AtomicBool,
}

impl<T> BindingCell<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: OnceLock::new(),
            released: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set(&self, value: T) -> BindingResult<()> {
        if self.released.load(Ordering::Acquire) {
            return Err(BindingError::Released(self.name.clone()));
        }
        self.value
            .set(value)
            .map_err(|_| BindingError::AlreadyLoaded(self.name.clone()))
    }

    pub fn get(&self) -> BindingResult<&T> {
        if self.released.load(Ordering::Acquire) {
            return Err(BindingError::Released(self.name.clone()));
        }
        self.value.get().ok_or_else(|| BindingError::NotLoaded(self.name.clone()))
    }

    /// Mark the binding released. Returns the value the first time, so the
    /// caller can free what it holds exactly once.
    pub fn release(&self) -> Option<&T> {
        if self.released.swap(true, Ordering::AcqRel) {
            return None;
        }
        self.value.get()
    }

    pub fn is_loaded(&self) -> bool {
        self.value.get().is_some() && !self.released.load(Ordering::Acquire)
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

impl<T> fmt::Debug for BindingCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BindingCell")
            .field("name", &self.name)
            .field("loaded", &self.value.get().is_some())
            .field("released", &self.is_released())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// ClassBinding
// ---------------------------------------------------------------------------

/// A managed type pinned by a global reference.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClassBinding {
    pub name: String,
    pub global: ObjRef,
}

impl ClassBinding {
    /// Look up `class_name` and pin it for the lifetime of the binding.
    pub fn resolve(env: &Env<'_>, binding: &str, class_name: &str) -> BindingResult<Self> {
        let local = env.find_class(class_name).map_err(|e| {
            error!(binding, class = class_name, error = %e, "class resolution failed");
            BindingError::resolution(binding, class_name, e)
        })?;
        let global = env.new_global_ref(local);
        release_local(env, local);
        let global = global.map_err(|e| BindingError::resolution(binding, class_name, e))?;
        trace!(binding, class = class_name, "class pinned");
        Ok(Self {
            name: class_name.to_string(),
            global,
        })
    }

    pub fn method(&self, env: &Env<'_>, binding: &str, name: &str, signature: &str) -> BindingResult<MethodBinding> {
        let id = env.method_id(self.global, name, signature).map_err(|e| {
            error!(binding, class = %self.name, method = name, signature, error = %e, "method resolution failed");
            BindingError::resolution(binding, &format!("{}.{name}{signature}", self.name), e)
        })?;
        Ok(MethodBinding {
            id,
            declaring_type: self.name.clone(),
            name: name.to_string(),
            signature: signature.to_string(),
        })
    }

    pub fn field(&self, env: &Env<'_>, binding: &str, name: &str, signature: &str) -> BindingResult<FieldId> {
        env.field_id(self.global, name, signature).map_err(|e| {
            error!(binding, class = %self.name, field = name, error = %e, "field resolution failed");
            BindingError::resolution(binding, &format!("{}.{name}:{signature}", self.name), e)
        })
    }

    /// Drop the global reference.
    pub fn release(&self, env: &Env<'_>, binding: &str) -> BindingResult<()> {
        env.delete_global_ref(self.global)
            .map_err(|e| BindingError::ReleaseFailure {
                binding: binding.to_string(),
                reason: e.to_string(),
            })
    }
}

// ---------------------------------------------------------------------------
// MethodBinding
// ---------------------------------------------------------------------------

/// A resolved managed method.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MethodBinding {
    pub id: MethodId,
    pub declaring_type: String,
    pub name: String,
    pub signature: String,
}

impl fmt::Display for MethodBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}{}", self.declaring_type, self.name, self.signature)
    }
}

// ---------------------------------------------------------------------------
// ReturnEnvelopeBinding
// ---------------------------------------------------------------------------

/// Name of the boolean field on the envelope that marks the result as a
/// reference to one of the call's argument buffers.
pub const IS_REFERENCE_FIELD: &str = "isArgumentReference";

/// The result envelope type: constructor plus its single boolean field.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReturnEnvelopeBinding {
    pub class: ClassBinding,
    pub ctor: MethodId,
    pub is_reference: FieldId,
}

impl ReturnEnvelopeBinding {
    pub fn resolve(env: &Env<'_>, binding: &str, class_name: &str) -> BindingResult<Self> {
        let class = ClassBinding::resolve(env, binding, class_name)?;
        let members = class
            .method(env, binding, names::CONSTRUCTOR, names::DEFAULT_CONSTRUCTOR_SIG)
            .and_then(|ctor| {
                class
                    .field(env, binding, IS_REFERENCE_FIELD, "Z")
                    .map(|field| (ctor.id, field))
            });
        match members {
            Ok((ctor, is_reference)) => Ok(Self {
                class,
                ctor,
                is_reference,
            }),
            Err(e) => {
                if let Err(release) = class.release(env, binding) {
                    warn!(binding, error = %release, "failed to release partial binding");
                }
                Err(e)
            }
        }
    }

    /// A fresh envelope with the flag unset. Returns a local reference.
    pub fn instantiate(&self, env: &Env<'_>) -> RuntimeResult<ObjRef> {
        env.new_object(self.class.global, self.ctor)
    }

    pub fn is_reference(&self, env: &Env<'_>, envelope: ObjRef) -> RuntimeResult<bool> {
        env.get_boolean_field(envelope, self.is_reference)
    }
}

fn release_local(env: &Env<'_>, local: ObjRef) {
    if let Err(e) = env.delete_local_ref(local) {
        warn!(error = %e, "failed to release local reference");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mbridge_runtime::{ClassDef, ManagedRuntime, SimRuntime};

    const ENVELOPE: &str = "test/ReturnType";

    fn runtime() -> SimRuntime {
        let rt = SimRuntime::new();
        rt.define_class(ClassDef::new(ENVELOPE).bool_field(IS_REFERENCE_FIELD, false))
            .unwrap();
        rt.define_class(
            ClassDef::new("test/Provider").method("merge", "([B)[B", |_call, args| Ok(args[0])),
        )
        .unwrap();
        rt
    }

    // -----------------------------------------------------------------------
    // BindingCell
    // -----------------------------------------------------------------------

    #[test]
    fn cell_lifecycle() {
        let cell = BindingCell::new("demo");
        assert_eq!(cell.get(), Err(BindingError::NotLoaded("demo".into())));
        cell.set(7u32).unwrap();
        assert_eq!(cell.get(), Ok(&7));
        assert_eq!(cell.set(8), Err(BindingError::AlreadyLoaded("demo".into())));
        assert!(cell.is_loaded());

        assert_eq!(cell.release(), Some(&7));
        assert_eq!(cell.release(), None);
        assert_eq!(cell.get(), Err(BindingError::Released("demo".into())));
        assert!(!cell.is_loaded());
    }

    #[test]
    fn release_before_load_blocks_set() {
        let cell: BindingCell<u8> = BindingCell::new("early");
        assert_eq!(cell.release(), None);
        assert_eq!(cell.set(1), Err(BindingError::Released("early".into())));
    }

    // -----------------------------------------------------------------------
    // Resolution
    // -----------------------------------------------------------------------

    #[test]
    fn resolve_class_and_method() {
        let rt = runtime();
        let h = rt.attach_current_thread().unwrap();
        let env = Env::new(&rt, &h);

        let class = ClassBinding::resolve(&env, "provider", "test/Provider").unwrap();
        assert_eq!(rt.live_global_refs(), 1);
        assert_eq!(rt.live_local_refs(), 0);

        let merge = class.method(&env, "provider", "merge", "([B)[B").unwrap();
        assert_eq!(merge.to_string(), "test/Provider.merge([B)[B");

        class.release(&env, "provider").unwrap();
        assert_eq!(rt.live_global_refs(), 0);
    }

    #[test]
    fn missing_members_are_resolution_failures() {
        let rt = runtime();
        let h = rt.attach_current_thread().unwrap();
        let env = Env::new(&rt, &h);

        assert!(matches!(
            ClassBinding::resolve(&env, "x", "no/Such"),
            Err(BindingError::ResolutionFailure { .. })
        ));
        let class = ClassBinding::resolve(&env, "x", "test/Provider").unwrap();
        let err = class.method(&env, "x", "merge", "()V").unwrap_err();
        assert!(matches!(err, BindingError::ResolutionFailure { ref member, .. } if member.contains("merge()V")));
    }

    #[test]
    fn envelope_round_trip() {
        let rt = runtime();
        let h = rt.attach_current_thread().unwrap();
        let env = Env::new(&rt, &h);
        let envelope = ReturnEnvelopeBinding::resolve(&env, "envelope", ENVELOPE).unwrap();
        let obj = envelope.instantiate(&env).unwrap();
        assert!(!envelope.is_reference(&env, obj).unwrap());

        // An envelope without the flag field fails and does not leak its class pin.
        let err = ReturnEnvelopeBinding::resolve(&env, "envelope", "test/Provider").unwrap_err();
        assert!(matches!(err, BindingError::ResolutionFailure { .. }));
        assert_eq!(rt.live_global_refs(), 1);
    }
}
