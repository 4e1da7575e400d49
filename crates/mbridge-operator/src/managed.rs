//! Provider types for [`SimRuntime`].
//!
//! Declares the managed side of the adapter contract (the envelope, the
//! abstract provider bases and the factory base) and builds concrete
//! providers from Rust closures.

use std::sync::Arc;

use mbridge_hooks::IS_REFERENCE_FIELD;
use mbridge_runtime::{ClassDef, ManagedCall, Raise, RuntimeResult, SimRuntime, Value};

use crate::config::ClassNames;

/// Declare the envelope, provider bases and factory base named by `names`.
pub fn define_contract_classes(rt: &SimRuntime, names: &ClassNames) -> RuntimeResult<()> {
    rt.define_class(ClassDef::new(&names.return_type).bool_field(IS_REFERENCE_FIELD, false))?;
    rt.define_class(ClassDef::new(&names.associative).abstract_method("merge", names.associative_merge_sig()))?;
    rt.define_class(
        ClassDef::new(&names.associative_zero_copy).abstract_method("merge", names.zero_copy_merge_sig()),
    )?;
    rt.define_class(
        ClassDef::new(&names.non_associative)
            .abstract_method("fullMerge", names.full_merge_sig())
            .abstract_method("partialMultiMerge", names.partial_multi_merge_sig())
            .abstract_method("partialMerge", names.partial_merge_sig())
            .abstract_method("shouldMerge", names.should_merge_sig()),
    )?;
    rt.define_class(
        ClassDef::new(&names.associative_factory)
            .abstract_method("name", names.factory_name_sig())
            .abstract_method("createAssociativeMergeOperator", names.factory_create_sig()),
    )
}

/// What a pairwise provider hands back.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AssociativeReply {
    /// A freshly built value.
    Value(Vec<u8>),
    /// The incoming value itself, returned by reference.
    Incoming,
    /// The existing value itself, returned by reference.
    Existing,
    /// Decline the merge (managed null).
    Decline,
}

/// Pairwise merge body: `(key, existing, value)`.
pub type PairwiseFn = dyn Fn(&[u8], Option<&[u8]>, &[u8]) -> Result<AssociativeReply, Raise> + Send + Sync;

/// A concrete provider for the copying associative adapter, or for the
/// zero-copy one when `zero_copy` is set.
pub fn associative_provider<F>(names: &ClassNames, class: &str, zero_copy: bool, body: F) -> ClassDef
where
    F: Fn(&[u8], Option<&[u8]>, &[u8]) -> Result<AssociativeReply, Raise> + Send + Sync + 'static,
{
    let (base, sig) = if zero_copy {
        (&names.associative_zero_copy, names.zero_copy_merge_sig())
    } else {
        (&names.associative, names.associative_merge_sig())
    };
    let body: Arc<PairwiseFn> = Arc::new(body);
    ClassDef::new(class).extends(base).method("merge", sig, move |call, args| {
        let key = call.bytes(&args[0])?.unwrap_or_default();
        let existing = call.bytes(&args[1])?;
        let value = call.bytes(&args[2])?.unwrap_or_default();
        match body(&key, existing.as_deref(), &value)? {
            AssociativeReply::Value(bytes) => Ok(call.new_byte_array(&bytes)),
            AssociativeReply::Incoming => by_reference(call, &args[3], args[2]),
            AssociativeReply::Existing => by_reference(call, &args[3], args[1]),
            AssociativeReply::Decline => Ok(Value::null()),
        }
    })
}

fn by_reference(call: &mut ManagedCall<'_>, envelope: &Value, arg: Value) -> Result<Value, Raise> {
    call.set_bool_field(envelope, IS_REFERENCE_FIELD, true)?;
    Ok(arg)
}

type FullFn = dyn Fn(&[u8], Option<&[u8]>, &[Vec<u8>]) -> Result<Option<Vec<u8>>, Raise> + Send + Sync;
type MultiFn = dyn Fn(&[u8], &[Vec<u8>]) -> Result<Option<Vec<u8>>, Raise> + Send + Sync;
type PartialFn = dyn Fn(&[u8], &[u8], &[u8]) -> Result<Option<Vec<u8>>, Raise> + Send + Sync;
type ShouldFn = dyn Fn(&[Vec<u8>]) -> Result<bool, Raise> + Send + Sync;

/// Builder for a concrete non-associative provider.
///
/// Methods left unset stay abstract; calling one raises in the runtime.
/// Every body returns `None` to decline.
pub struct NonAssociativeProvider {
    def: ClassDef,
    names: ClassNames,
}

impl NonAssociativeProvider {
    pub fn new(names: &ClassNames, class: &str) -> Self {
        Self {
            def: ClassDef::new(class).extends(&names.non_associative),
            names: names.clone(),
        }
    }

    pub fn full_merge<F>(mut self, f: F) -> Self
    where
        F: Fn(&[u8], Option<&[u8]>, &[Vec<u8>]) -> Result<Option<Vec<u8>>, Raise> + Send + Sync + 'static,
    {
        let f: Arc<FullFn> = Arc::new(f);
        self.def = self.def.method("fullMerge", self.names.full_merge_sig(), move |call, args| {
            let key = call.bytes(&args[0])?.unwrap_or_default();
            let existing = call.bytes(&args[1])?;
            let operands = call.operands(&args[2])?;
            reply(call, f(&key, existing.as_deref(), &operands)?)
        });
        self
    }

    pub fn partial_multi_merge<F>(mut self, f: F) -> Self
    where
        F: Fn(&[u8], &[Vec<u8>]) -> Result<Option<Vec<u8>>, Raise> + Send + Sync + 'static,
    {
        let f: Arc<MultiFn> = Arc::new(f);
        self.def = self.def.method(
            "partialMultiMerge",
            self.names.partial_multi_merge_sig(),
            move |call, args| {
                let key = call.bytes(&args[0])?.unwrap_or_default();
                let operands = call.operands(&args[1])?;
                reply(call, f(&key, &operands)?)
            },
        );
        self
    }

    pub fn partial_merge<F>(mut self, f: F) -> Self
    where
        F: Fn(&[u8], &[u8], &[u8]) -> Result<Option<Vec<u8>>, Raise> + Send + Sync + 'static,
    {
        let f: Arc<PartialFn> = Arc::new(f);
        self.def = self.def.method("partialMerge", self.names.partial_merge_sig(), move |call, args| {
            let key = call.bytes(&args[0])?.unwrap_or_default();
            let left = call.bytes(&args[1])?.unwrap_or_default();
            let right = call.bytes(&args[2])?.unwrap_or_default();
            reply(call, f(&key, &left, &right)?)
        });
        self
    }

    pub fn should_merge<F>(mut self, f: F) -> Self
    where
        F: Fn(&[Vec<u8>]) -> Result<bool, Raise> + Send + Sync + 'static,
    {
        let f: Arc<ShouldFn> = Arc::new(f);
        self.def = self.def.method("shouldMerge", self.names.should_merge_sig(), move |call, args| {
            Ok(Value::Bool(f(&call.operands(&args[0])?)?))
        });
        self
    }

    pub fn build(self) -> ClassDef {
        self.def
    }
}

fn reply(call: &mut ManagedCall<'_>, bytes: Option<Vec<u8>>) -> Result<Value, Raise> {
    Ok(match bytes {
        Some(bytes) => call.new_byte_array(&bytes),
        None => Value::null(),
    })
}

/// A concrete factory whose `createAssociativeMergeOperator` instantiates
/// `provider_class`, or declines when asked not to create.
pub fn associative_factory(names: &ClassNames, class: &str, display_name: &str, provider_class: &str) -> ClassDef {
    let display_name = display_name.to_string();
    let provider_class = provider_class.to_string();
    ClassDef::new(class)
        .extends(&names.associative_factory)
        .method("name", names.factory_name_sig(), move |call, _args| Ok(call.new_string(&display_name)))
        .method(
            "createAssociativeMergeOperator",
            names.factory_create_sig(),
            move |call, args| match args[0] {
                Value::Bool(true) => call.new_instance(&provider_class),
                _ => Ok(Value::null()),
            },
        )
}
