use std::sync::Arc;

use mbridge_hooks::{
    BindingCell, BindingResult, ClassBinding, HookRegistry, MethodBinding, RegistryResult, ReturnEnvelopeBinding,
};
use mbridge_runtime::{names, Env};
use tracing::{debug, warn};

use crate::config::ClassNames;

/// Resolved `merge` of an associative provider type.
#[derive(Clone, Debug)]
pub struct AssociativeBindings {
    pub class: ClassBinding,
    pub merge: MethodBinding,
}

/// Resolved methods of the non-associative provider type.
#[derive(Clone, Debug)]
pub struct NonAssociativeBindings {
    pub class: ClassBinding,
    pub full_merge: MethodBinding,
    pub partial_multi_merge: MethodBinding,
    pub partial_merge: MethodBinding,
    pub should_merge: MethodBinding,
}

/// Resolved methods of the associative provider factory.
#[derive(Clone, Debug)]
pub struct FactoryBindings {
    pub class: ClassBinding,
    pub name: MethodBinding,
    pub create: MethodBinding,
}

/// Element types for operand arrays.
#[derive(Clone, Debug)]
pub struct BufferClasses {
    pub byte_array: ClassBinding,
    pub byte_buffer: ClassBinding,
}

/// Every managed handle the adapters use, one write-once cell per binding.
///
/// Filled by the loaders [`register`](Self::register) installs and marked
/// released by the matching unloaders.
#[derive(Debug)]
pub struct BindingSet {
    pub envelope: BindingCell<ReturnEnvelopeBinding>,
    pub buffers: BindingCell<BufferClasses>,
    pub associative: BindingCell<AssociativeBindings>,
    pub zero_copy: BindingCell<AssociativeBindings>,
    pub non_associative: BindingCell<NonAssociativeBindings>,
    pub factory: BindingCell<FactoryBindings>,
}

impl BindingSet {
    fn new() -> Self {
        Self {
            envelope: BindingCell::new("return-type"),
            buffers: BindingCell::new("buffers"),
            associative: BindingCell::new("associative"),
            zero_copy: BindingCell::new("associative-zero-copy"),
            non_associative: BindingCell::new("non-associative"),
            factory: BindingCell::new("associative-factory"),
        }
    }

    /// Register one loader/unloader pair per binding, in dependency order.
    pub fn register(registry: &HookRegistry, names: &ClassNames) -> RegistryResult<Arc<Self>> {
        let set = Arc::new(Self::new());

        let (s, n) = (Arc::clone(&set), names.clone());
        registry.register_loader("return-type", move |env| {
            s.envelope
                .set(ReturnEnvelopeBinding::resolve(env, s.envelope.name(), &n.return_type)?)
        })?;
        let s = Arc::clone(&set);
        registry.register_unloader("return-type", move |env| {
            release(&s.envelope, env, |b, env| b.class.release(env, "return-type"))
        })?;

        let s = Arc::clone(&set);
        registry.register_loader("buffers", move |env| s.buffers.set(BufferClasses::resolve(env)?))?;
        let s = Arc::clone(&set);
        registry.register_unloader("buffers", move |env| {
            release(&s.buffers, env, |b, env| {
                let array = b.byte_array.release(env, "buffers");
                let buffer = b.byte_buffer.release(env, "buffers");
                array.and(buffer)
            })
        })?;

        let (s, n) = (Arc::clone(&set), names.clone());
        registry.register_loader("associative", move |env| {
            let sig = n.associative_merge_sig();
            s.associative
                .set(AssociativeBindings::resolve(env, "associative", &n.associative, &sig)?)
        })?;
        let s = Arc::clone(&set);
        registry.register_unloader("associative", move |env| {
            release(&s.associative, env, |b, env| b.class.release(env, "associative"))
        })?;

        let (s, n) = (Arc::clone(&set), names.clone());
        registry.register_loader("associative-zero-copy", move |env| {
            let sig = n.zero_copy_merge_sig();
            s.zero_copy.set(AssociativeBindings::resolve(
                env,
                "associative-zero-copy",
                &n.associative_zero_copy,
                &sig,
            )?)
        })?;
        let s = Arc::clone(&set);
        registry.register_unloader("associative-zero-copy", move |env| {
            release(&s.zero_copy, env, |b, env| b.class.release(env, "associative-zero-copy"))
        })?;

        let (s, n) = (Arc::clone(&set), names.clone());
        registry.register_loader("non-associative", move |env| {
            s.non_associative.set(NonAssociativeBindings::resolve(env, &n)?)
        })?;
        let s = Arc::clone(&set);
        registry.register_unloader("non-associative", move |env| {
            release(&s.non_associative, env, |b, env| b.class.release(env, "non-associative"))
        })?;

        let (s, n) = (Arc::clone(&set), names.clone());
        registry.register_loader("associative-factory", move |env| {
            s.factory.set(FactoryBindings::resolve(env, &n)?)
        })?;
        let s = Arc::clone(&set);
        registry.register_unloader("associative-factory", move |env| {
            release(&s.factory, env, |b, env| b.class.release(env, "associative-factory"))
        })?;

        Ok(set)
    }
}

impl AssociativeBindings {
    fn resolve(env: &Env<'_>, binding: &str, class_name: &str, signature: &str) -> BindingResult<Self> {
        let class = ClassBinding::resolve(env, binding, class_name)?;
        match class.method(env, binding, "merge", signature) {
            Ok(merge) => Ok(Self { class, merge }),
            Err(e) => {
                if let Err(release) = class.release(env, binding) {
                    warn!(binding, error = %release, "failed to release partial binding");
                }
                Err(e)
            }
        }
    }
}

impl NonAssociativeBindings {
    fn resolve(env: &Env<'_>, names: &ClassNames) -> BindingResult<Self> {
        const BINDING: &str = "non-associative";
        let class = ClassBinding::resolve(env, BINDING, &names.non_associative)?;
        let methods = (|| -> BindingResult<_> {
            Ok((
                class.method(env, BINDING, "fullMerge", &names.full_merge_sig())?,
                class.method(env, BINDING, "partialMultiMerge", &names.partial_multi_merge_sig())?,
                class.method(env, BINDING, "partialMerge", &names.partial_merge_sig())?,
                class.method(env, BINDING, "shouldMerge", names.should_merge_sig())?,
            ))
        })();
        match methods {
            Ok((full_merge, partial_multi_merge, partial_merge, should_merge)) => Ok(Self {
                class,
                full_merge,
                partial_multi_merge,
                partial_merge,
                should_merge,
            }),
            Err(e) => {
                if let Err(release) = class.release(env, BINDING) {
                    warn!(binding = BINDING, error = %release, "failed to release partial binding");
                }
                Err(e)
            }
        }
    }
}

impl FactoryBindings {
    fn resolve(env: &Env<'_>, names: &ClassNames) -> BindingResult<Self> {
        const BINDING: &str = "associative-factory";
        let class = ClassBinding::resolve(env, BINDING, &names.associative_factory)?;
        let methods = class
            .method(env, BINDING, "name", &names.factory_name_sig())
            .and_then(|name| {
                class
                    .method(env, BINDING, "createAssociativeMergeOperator", &names.factory_create_sig())
                    .map(|create| (name, create))
            });
        match methods {
            Ok((name, create)) => Ok(Self { class, name, create }),
            Err(e) => {
                if let Err(release) = class.release(env, BINDING) {
                    warn!(binding = BINDING, error = %release, "failed to release partial binding");
                }
                Err(e)
            }
        }
    }
}

impl BufferClasses {
    fn resolve(env: &Env<'_>) -> BindingResult<Self> {
        let byte_array = ClassBinding::resolve(env, "buffers", names::BYTE_ARRAY)?;
        match ClassBinding::resolve(env, "buffers", names::BYTE_BUFFER) {
            Ok(byte_buffer) => Ok(Self {
                byte_array,
                byte_buffer,
            }),
            Err(e) => {
                if let Err(release) = byte_array.release(env, "buffers") {
                    warn!(binding = "buffers", error = %release, "failed to release partial binding");
                }
                Err(e)
            }
        }
    }
}

/// Mark `cell` released and, when a handle is available, drop the managed
/// references it held.
fn release<T>(
    cell: &BindingCell<T>,
    env: Option<&Env<'_>>,
    free: impl FnOnce(&T, &Env<'_>) -> BindingResult<()>,
) -> BindingResult<()> {
    let Some(value) = cell.release() else {
        return Ok(());
    };
    match env {
        Some(env) => free(value, env),
        None => {
            debug!(binding = cell.name(), "released without an execution handle");
            Ok(())
        }
    }
}
