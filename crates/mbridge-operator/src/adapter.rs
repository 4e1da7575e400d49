use std::sync::Arc;

use mbridge_attach::AttachManager;
use mbridge_marshal::{invoke, invoke_predicate, Argument, BufferMode, CallSpec};
use mbridge_runtime::{Env, ObjRef, RuntimeResult};
use tracing::{debug, trace};

use crate::bindings::BindingSet;
use crate::callback::Callback;
use crate::config::{AdapterConfig, AdapterKind, NonAssociativeConfig};
use crate::contract::{associative_partial_merge, fold_full_merge, AssociativeMergeOperator, MergeInput, MergeOperator};
use crate::error::{MergeError, MergeResult};
use crate::provider::ProviderRetention;
use crate::xor::XorOperator;

// ---------------------------------------------------------------------------
// AssociativeAdapter
// ---------------------------------------------------------------------------

/// Pairwise merge through a managed `merge` callback.
///
/// In [`BufferMode::View`] the arguments are zero-copy views over the
/// engine's memory and every call first checks whether the bridge is
/// closing.
#[derive(Debug)]
pub struct AssociativeAdapter {
    callback: Callback,
    mode: BufferMode,
}

impl AssociativeAdapter {
    pub fn new(callback: Callback, mode: BufferMode) -> Self {
        Self { callback, mode }
    }

    pub fn callback(&self) -> &Callback {
        &self.callback
    }

    pub fn mode(&self) -> BufferMode {
        self.mode
    }
}

impl AssociativeMergeOperator for AssociativeAdapter {
    fn name(&self) -> &str {
        match self.mode {
            BufferMode::Copy => "AssociativeCallbackMergeOperator",
            BufferMode::View => "AssociativeZeroCopyMergeOperator",
        }
    }

    fn merge(&self, key: &[u8], existing: Option<&[u8]>, value: &[u8]) -> MergeResult<Vec<u8>> {
        if self.mode == BufferMode::View && self.callback.is_closing() {
            trace!(operator = AssociativeMergeOperator::name(self), "merge rejected: closing");
            return Err(MergeError::unavailable("bridge is closing"));
        }
        let bindings = self.callback.bindings();
        let method = match self.mode {
            BufferMode::Copy => bindings.associative.get()?,
            BufferMode::View => bindings.zero_copy.get()?,
        };
        let envelope = bindings.envelope.get()?;

        let result = self.callback.call(|env, target, exceptions| {
            let spec = CallSpec {
                method: &method.merge,
                envelope: Some(envelope),
                operand_class: None,
                mode: self.mode,
                exceptions,
            };
            let args = [
                Argument::Bytes(Some(key)),
                Argument::Bytes(existing),
                Argument::Bytes(Some(value)),
            ];
            Ok(invoke(env, target, &spec, &args)?)
        });
        if let Err(e) = &result {
            debug!(operator = AssociativeMergeOperator::name(self), error = %e, "merge produced no value");
        }
        result
    }
}

impl MergeOperator for AssociativeAdapter {
    fn name(&self) -> &str {
        AssociativeMergeOperator::name(self)
    }

    fn full_merge(&self, input: &MergeInput<'_>) -> MergeResult<Vec<u8>> {
        fold_full_merge(self, input)
    }

    fn partial_merge(&self, key: &[u8], left: &[u8], right: &[u8]) -> MergeResult<Vec<u8>> {
        associative_partial_merge(self, key, left, right)
    }
}

// ---------------------------------------------------------------------------
// NonAssociativeAdapter
// ---------------------------------------------------------------------------

/// Full, partial and should-merge through a managed provider.
///
/// Paths disabled in the [`NonAssociativeConfig`] answer "cannot merge"
/// without touching the runtime.
#[derive(Debug)]
pub struct NonAssociativeAdapter {
    callback: Callback,
    flags: NonAssociativeConfig,
}

impl NonAssociativeAdapter {
    pub fn new(callback: Callback, flags: NonAssociativeConfig) -> Self {
        Self { callback, flags }
    }

    pub fn callback(&self) -> &Callback {
        &self.callback
    }

    pub fn flags(&self) -> NonAssociativeConfig {
        self.flags
    }

    fn call_bytes(&self, pick: Pick, args: &[Argument<'_>]) -> MergeResult<Vec<u8>> {
        let bindings = self.callback.bindings();
        let methods = bindings.non_associative.get()?;
        let envelope = bindings.envelope.get()?;
        let operand_class = bindings.buffers.get()?.byte_array.global;
        let method = match pick {
            Pick::Full => &methods.full_merge,
            Pick::PartialMulti => &methods.partial_multi_merge,
            Pick::Partial => &methods.partial_merge,
        };
        let result = self.callback.call(|env, target, exceptions| {
            let spec = CallSpec {
                method,
                envelope: Some(envelope),
                operand_class: Some(operand_class),
                mode: BufferMode::Copy,
                exceptions,
            };
            Ok(invoke(env, target, &spec, args)?)
        });
        if let Err(e) = &result {
            debug!(operator = self.name(), method = %method.name, error = %e, "merge produced no value");
        }
        result
    }
}

#[derive(Clone, Copy)]
enum Pick {
    Full,
    PartialMulti,
    Partial,
}

impl MergeOperator for NonAssociativeAdapter {
    fn name(&self) -> &str {
        "NonAssociativeCallbackMergeOperator"
    }

    fn full_merge(&self, input: &MergeInput<'_>) -> MergeResult<Vec<u8>> {
        self.call_bytes(
            Pick::Full,
            &[
                Argument::Bytes(Some(input.key)),
                Argument::Bytes(input.existing_value),
                Argument::Operands(input.operands),
            ],
        )
    }

    fn partial_merge(&self, key: &[u8], left: &[u8], right: &[u8]) -> MergeResult<Vec<u8>> {
        self.call_bytes(
            Pick::Partial,
            &[
                Argument::Bytes(Some(key)),
                Argument::Bytes(Some(left)),
                Argument::Bytes(Some(right)),
            ],
        )
    }

    fn partial_merge_multi(&self, key: &[u8], operands: &[&[u8]]) -> MergeResult<Vec<u8>> {
        if !self.flags.allow_partial_multi_merge {
            return Err(MergeError::NotCombinable);
        }
        self.call_bytes(
            Pick::PartialMulti,
            &[Argument::Bytes(Some(key)), Argument::Operands(operands)],
        )
    }

    fn should_merge(&self, operands: &[&[u8]]) -> bool {
        if !self.flags.allow_should_merge {
            return false;
        }
        let outcome = (|| -> MergeResult<bool> {
            let bindings = self.callback.bindings();
            let method = &bindings.non_associative.get()?.should_merge;
            let operand_class = bindings.buffers.get()?.byte_array.global;
            self.callback.call(|env, target, exceptions| {
                let spec = CallSpec {
                    method,
                    envelope: None,
                    operand_class: Some(operand_class),
                    mode: BufferMode::Copy,
                    exceptions,
                };
                Ok(invoke_predicate(env, target, &spec, &[Argument::Operands(operands)])?)
            })
        })();
        outcome.unwrap_or_else(|e| {
            debug!(operator = self.name(), error = %e, "should-merge answered false");
            false
        })
    }

    fn allow_single_operand(&self) -> bool {
        self.flags.allow_single_operand
    }
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

/// One native merge operator handed to the engine.
#[derive(Debug)]
pub enum Adapter {
    Associative(AssociativeAdapter),
    AssociativeZeroCopy(AssociativeAdapter),
    NonAssociative(NonAssociativeAdapter),
    Xor(XorOperator),
}

impl Adapter {
    /// Build the adapter `config` describes. No managed interaction happens
    /// until a provider is bound and the engine calls in.
    pub fn new(
        config: &AdapterConfig,
        attach: Arc<AttachManager>,
        bindings: Arc<BindingSet>,
        default_retention: ProviderRetention,
    ) -> Self {
        let retention = config.retention.unwrap_or(default_retention);
        let callback = || Callback::new(attach, bindings, retention);
        match config.kind {
            AdapterKind::Associative => Self::Associative(AssociativeAdapter::new(callback(), BufferMode::Copy)),
            AdapterKind::AssociativeZeroCopy => {
                Self::AssociativeZeroCopy(AssociativeAdapter::new(callback(), BufferMode::View))
            }
            AdapterKind::NonAssociative(flags) => Self::NonAssociative(NonAssociativeAdapter::new(callback(), flags)),
            AdapterKind::Xor => Self::Xor(XorOperator),
        }
    }

    fn callback(&self) -> Option<&Callback> {
        match self {
            Self::Associative(a) | Self::AssociativeZeroCopy(a) => Some(a.callback()),
            Self::NonAssociative(a) => Some(a.callback()),
            Self::Xor(_) => None,
        }
    }

    /// Hold `provider` for later calls. A no-op for the XOR combinator,
    /// which never calls back.
    pub fn bind(&self, env: &Env<'_>, provider: ObjRef) -> RuntimeResult<()> {
        match self.callback() {
            Some(callback) => callback.bind(env, provider),
            None => Ok(()),
        }
    }

    pub fn is_bound(&self) -> bool {
        self.callback().is_some_and(|c| c.provider().is_bound())
    }

    /// Drop the provider reference.
    pub fn release(&self) {
        if let Some(callback) = self.callback() {
            callback.release();
        }
    }

    /// The pairwise view of this adapter, for the variants that have one.
    pub fn as_associative(&self) -> Option<&dyn AssociativeMergeOperator> {
        match self {
            Self::Associative(a) | Self::AssociativeZeroCopy(a) => Some(a as &dyn AssociativeMergeOperator),
            Self::NonAssociative(_) => None,
            Self::Xor(x) => Some(x as &dyn AssociativeMergeOperator),
        }
    }

    fn operator(&self) -> &dyn MergeOperator {
        match self {
            Self::Associative(a) | Self::AssociativeZeroCopy(a) => a,
            Self::NonAssociative(a) => a,
            Self::Xor(x) => x,
        }
    }
}

impl MergeOperator for Adapter {
    fn name(&self) -> &str {
        self.operator().name()
    }

    fn full_merge(&self, input: &MergeInput<'_>) -> MergeResult<Vec<u8>> {
        self.operator().full_merge(input)
    }

    fn partial_merge(&self, key: &[u8], left: &[u8], right: &[u8]) -> MergeResult<Vec<u8>> {
        self.operator().partial_merge(key, left, right)
    }

    fn partial_merge_multi(&self, key: &[u8], operands: &[&[u8]]) -> MergeResult<Vec<u8>> {
        self.operator().partial_merge_multi(key, operands)
    }

    fn should_merge(&self, operands: &[&[u8]]) -> bool {
        self.operator().should_merge(operands)
    }

    fn allow_single_operand(&self) -> bool {
        self.operator().allow_single_operand()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClassNames;
    use crate::managed::{associative_provider, define_contract_classes, AssociativeReply, NonAssociativeProvider};
    use mbridge_attach::DetachPolicy;
    use mbridge_hooks::HookRegistry;
    use mbridge_runtime::{ManagedRuntime, Raise, SimRuntime};
    use std::sync::Barrier;

    fn concat(existing: Option<&[u8]>, value: &[u8]) -> Vec<u8> {
        let mut out = existing.unwrap_or_default().to_vec();
        out.extend_from_slice(value);
        out
    }

    struct Fixture {
        rt: Arc<SimRuntime>,
        attach: Arc<AttachManager>,
        bindings: Arc<BindingSet>,
        registry: HookRegistry,
    }

    impl Fixture {
        fn new() -> Self {
            let rt = Arc::new(SimRuntime::new());
            let names = ClassNames::default();
            define_contract_classes(&rt, &names).unwrap();
            let providers = [
                associative_provider(&names, "test/Concat", false, |_, e, v| Ok(AssociativeReply::Value(concat(e, v)))),
                associative_provider(&names, "test/Raise", false, |_, _, _| Err(Raise::runtime("merge exploded"))),
                associative_provider(&names, "test/Decline", false, |_, _, _| Ok(AssociativeReply::Decline)),
                associative_provider(&names, "test/ConcatView", true, |_, e, v| Ok(AssociativeReply::Value(concat(e, v)))),
                associative_provider(&names, "test/PickIncoming", true, |_, _, _| Ok(AssociativeReply::Incoming)),
                NonAssociativeProvider::new(&names, "test/Lists")
                    .full_merge(|_, existing, operands| {
                        let mut out = existing.unwrap_or_default().to_vec();
                        for op in operands {
                            out.extend_from_slice(op);
                        }
                        Ok(Some(out))
                    })
                    .partial_multi_merge(|_, operands| Ok(Some(operands.join(&b'+'))))
                    .partial_merge(|_, l, r| Ok((l.len() == r.len()).then(|| [l, r].concat())))
                    .should_merge(|operands| Ok(operands.len() > 1))
                    .build(),
                NonAssociativeProvider::new(&names, "test/Explodes")
                    .full_merge(|_, _, _| Err(Raise::runtime("full boom")))
                    .partial_multi_merge(|_, _| Err(Raise::runtime("multi boom")))
                    .partial_merge(|_, _, _| Err(Raise::runtime("partial boom")))
                    .should_merge(|_| Err(Raise::runtime("should boom")))
                    .build(),
            ];
            for def in providers {
                rt.define_class(def).unwrap();
            }

            let registry = HookRegistry::new();
            let bindings = BindingSet::register(&registry, &names).unwrap();
            let h = rt.attach_current_thread().unwrap();
            registry.run_loaders(&Env::new(&*rt, &h)).unwrap();
            rt.detach_current_thread(h).unwrap();

            let attach = Arc::new(AttachManager::new(rt.clone(), DetachPolicy::Lazy));
            Self {
                rt,
                attach,
                bindings,
                registry,
            }
        }

        fn adapter(&self, config: AdapterConfig) -> Adapter {
            Adapter::new(
                &config,
                Arc::clone(&self.attach),
                Arc::clone(&self.bindings),
                ProviderRetention::Pin,
            )
        }

        fn bound(&self, config: AdapterConfig, class: &str) -> Adapter {
            let adapter = self.adapter(config);
            let guard = self.attach.acquire().unwrap();
            let env = guard.env();
            let provider = self.rt.instantiate(&env, class).unwrap();
            adapter.bind(&env, provider).unwrap();
            env.delete_local_ref(provider).unwrap();
            adapter
        }

        fn thread(&self) -> std::thread::ThreadId {
            std::thread::current().id()
        }
    }

    fn flags(should: bool, multi: bool) -> NonAssociativeConfig {
        NonAssociativeConfig {
            allow_single_operand: true,
            allow_should_merge: should,
            allow_partial_multi_merge: multi,
        }
    }

    // -----------------------------------------------------------------------
    // Associative, copying
    // -----------------------------------------------------------------------

    #[test]
    fn associative_merge_round_trip() {
        let fx = Fixture::new();
        let adapter = fx.bound(AdapterConfig::associative(), "test/Concat");
        let op = adapter.as_associative().unwrap();

        assert_eq!(op.merge(b"k", Some(&b"ab"[..]), b"cd").unwrap(), b"abcd");
        assert_eq!(op.merge(b"k", None, b"cd").unwrap(), b"cd");
        assert_eq!(fx.rt.call_count("merge"), 2);
        assert_eq!(fx.rt.live_local_refs_on(fx.thread()), 0);
        assert_eq!(adapter.name(), "AssociativeCallbackMergeOperator");
    }

    #[test]
    fn associative_full_merge_folds_through_callback() {
        let fx = Fixture::new();
        let adapter = fx.bound(AdapterConfig::associative(), "test/Concat");
        let operands: [&[u8]; 3] = [b"b", b"c", b"d"];

        let out = adapter
            .full_merge(&MergeInput::new(b"k", Some(&b"a"[..]), &operands))
            .unwrap();
        assert_eq!(out, b"abcd");
        assert_eq!(fx.rt.call_count("merge"), 3);
        assert_eq!(adapter.partial_merge(b"k", b"x", b"y").unwrap(), b"xy");
    }

    #[test]
    fn declined_merge_is_not_combinable() {
        let fx = Fixture::new();
        let adapter = fx.bound(AdapterConfig::associative(), "test/Decline");
        let op = adapter.as_associative().unwrap();
        assert_eq!(op.merge(b"k", None, b"v"), Err(MergeError::NotCombinable));
        assert_eq!(fx.rt.live_local_refs_on(fx.thread()), 0);
    }

    #[test]
    fn raising_callback_on_worker_thread() {
        let fx = Fixture::new();
        let adapter = fx.bound(AdapterConfig::associative(), "test/Raise");
        let objects_before = fx.rt.live_objects();

        let err = adapter.as_associative().unwrap().merge(b"k", Some(&b"a"[..]), b"b").unwrap_err();
        let managed = match err {
            MergeError::Managed(m) => m,
            other => panic!("expected a managed error, got {other:?}"),
        };
        assert!(managed.description.contains("merge exploded"));
        assert!(!managed.rethrown);
        assert!(fx.rt.pending_exception(fx.thread()).is_none());
        assert_eq!(fx.rt.live_local_refs_on(fx.thread()), 0);

        fx.rt.collect_garbage();
        assert!(fx.rt.live_objects() <= objects_before);
    }

    #[test]
    fn raising_callback_on_runtime_thread_is_rethrown() {
        let fx = Fixture::new();
        // The runtime owns this thread before the bridge sees it.
        let _own = fx.rt.attach_current_thread().unwrap();
        let adapter = fx.bound(AdapterConfig::associative(), "test/Raise");

        let err = adapter.as_associative().unwrap().merge(b"k", None, b"b").unwrap_err();
        assert!(matches!(err, MergeError::Managed(ref m) if m.rethrown));
        let pending = fx.rt.take_pending_exception(fx.thread()).unwrap();
        assert!(pending.contains("merge exploded"));
    }

    #[test]
    fn unbound_adapter_is_unavailable() {
        let fx = Fixture::new();
        let adapter = fx.adapter(AdapterConfig::associative());
        assert!(!adapter.is_bound());
        let err = adapter.as_associative().unwrap().merge(b"k", None, b"v").unwrap_err();
        assert!(err.is_unavailable());
    }

    #[test]
    fn refused_attachment_makes_callback_unavailable() {
        let fx = Fixture::new();
        let adapter = fx.bound(AdapterConfig::associative(), "test/Concat");
        fx.rt.set_refuse_attach(Some("paused"));

        std::thread::scope(|s| {
            s.spawn(|| {
                let op = adapter.as_associative().unwrap();
                for _ in 0..2 {
                    let err = op.merge(b"k", None, b"v").unwrap_err();
                    assert!(err.is_unavailable(), "{err:?}");
                    assert!(err.to_string().contains("paused"));
                }
                assert_eq!(fx.rt.attach_count(std::thread::current().id()), 0);
            })
            .join()
            .unwrap();
        });
        assert_eq!(fx.rt.call_count("merge"), 0);

        fx.rt.set_refuse_attach(None);
        std::thread::scope(|s| {
            let out = s.spawn(|| adapter.as_associative().unwrap().merge(b"k", None, b"v"));
            assert_eq!(out.join().unwrap().unwrap(), b"v");
        });
    }

    #[test]
    fn release_during_call_keeps_provider_for_that_call() {
        let fx = Fixture::new();
        let entered = Arc::new(Barrier::new(2));
        let resume = Arc::new(Barrier::new(2));
        let (e, r) = (Arc::clone(&entered), Arc::clone(&resume));
        fx.rt
            .define_class(associative_provider(&ClassNames::default(), "test/Blocking", false, move |_, _, v| {
                e.wait();
                r.wait();
                Ok(AssociativeReply::Value(v.to_vec()))
            }))
            .unwrap();
        let adapter = fx.bound(AdapterConfig::associative(), "test/Blocking");
        let globals = fx.rt.live_global_refs();

        std::thread::scope(|s| {
            let worker = s.spawn(|| {
                let out = adapter.as_associative().unwrap().merge(b"k", None, b"v");
                (out, fx.rt.live_local_refs_on(std::thread::current().id()))
            });
            entered.wait();
            adapter.release();
            let bound_after_release = adapter.is_bound();
            let globals_after_release = fx.rt.live_global_refs();
            resume.wait();

            let (out, locals) = worker.join().unwrap();
            assert!(!bound_after_release);
            assert_eq!(globals_after_release, globals - 1);
            assert_eq!(out.unwrap(), b"v");
            assert_eq!(locals, 0);
        });

        let err = adapter.as_associative().unwrap().merge(b"k", None, b"v").unwrap_err();
        assert!(err.is_unavailable());
    }

    // -----------------------------------------------------------------------
    // Associative, zero-copy
    // -----------------------------------------------------------------------

    #[test]
    fn zero_copy_merge_copies_result() {
        let fx = Fixture::new();
        let adapter = fx.bound(AdapterConfig::zero_copy(), "test/ConcatView");
        let op = adapter.as_associative().unwrap();
        assert_eq!(op.merge(b"k", Some(&b"12"[..]), b"34").unwrap(), b"1234");
        assert_eq!(adapter.name(), "AssociativeZeroCopyMergeOperator");
    }

    #[test]
    fn zero_copy_reference_result_is_read_from_view() {
        let fx = Fixture::new();
        let adapter = fx.bound(AdapterConfig::zero_copy(), "test/PickIncoming");
        let incoming = vec![7u8, 8, 9];

        let out = adapter.as_associative().unwrap().merge(b"k", Some(&b"old"[..]), &incoming).unwrap();
        assert_eq!(out, incoming);
        assert_ne!(out.as_ptr(), incoming.as_ptr());
        assert_eq!(fx.rt.live_local_refs_on(fx.thread()), 0);
    }

    #[test]
    fn zero_copy_short_circuits_when_closing() {
        let fx = Fixture::new();
        let adapter = fx.bound(AdapterConfig::zero_copy(), "test/ConcatView");
        fx.attach.begin_closing();

        let err = adapter.as_associative().unwrap().merge(b"k", None, b"v").unwrap_err();
        assert_eq!(err, MergeError::unavailable("bridge is closing"));
        assert_eq!(fx.rt.call_count("merge"), 0);
    }

    // -----------------------------------------------------------------------
    // Non-associative
    // -----------------------------------------------------------------------

    #[test]
    fn non_associative_full_merge() {
        let fx = Fixture::new();
        let adapter = fx.bound(AdapterConfig::non_associative(flags(true, true)), "test/Lists");
        let operands: [&[u8]; 2] = [b"b", b"c"];

        let out = adapter.full_merge(&MergeInput::new(b"k", None, &operands)).unwrap();
        assert_eq!(out, b"bc");
        let out = adapter
            .full_merge(&MergeInput::new(b"k", Some(&b"a"[..]), &operands))
            .unwrap();
        assert_eq!(out, b"abc");
        assert!(adapter.allow_single_operand());
        assert_eq!(adapter.name(), "NonAssociativeCallbackMergeOperator");
        assert_eq!(fx.rt.live_local_refs_on(fx.thread()), 0);
    }

    #[test]
    fn non_associative_partial_merge_may_decline() {
        let fx = Fixture::new();
        let adapter = fx.bound(AdapterConfig::non_associative(flags(true, true)), "test/Lists");
        assert_eq!(adapter.partial_merge(b"k", b"ab", b"cd").unwrap(), b"abcd");
        assert_eq!(adapter.partial_merge(b"k", b"ab", b"c"), Err(MergeError::NotCombinable));
    }

    #[test]
    fn should_merge_disabled_never_calls_back() {
        let fx = Fixture::new();
        let adapter = fx.bound(AdapterConfig::non_associative(flags(false, false)), "test/Lists");
        let operands: [&[u8]; 2] = [b"a", b"b"];

        assert!(!adapter.should_merge(&operands));
        assert_eq!(fx.rt.call_count("shouldMerge"), 0);
    }

    #[test]
    fn should_merge_enabled_asks_provider() {
        let fx = Fixture::new();
        let adapter = fx.bound(AdapterConfig::non_associative(flags(true, false)), "test/Lists");
        let operands: [&[u8]; 2] = [b"a", b"b"];

        assert!(adapter.should_merge(&operands));
        assert!(!adapter.should_merge(&operands[..1]));
        assert_eq!(fx.rt.call_count("shouldMerge"), 2);
    }

    #[test]
    fn partial_multi_merge_gated_by_flag() {
        let fx = Fixture::new();
        let operands: [&[u8]; 3] = [b"a", b"b", b"c"];

        let disabled = fx.bound(AdapterConfig::non_associative(flags(false, false)), "test/Lists");
        assert_eq!(
            disabled.partial_merge_multi(b"k", &operands),
            Err(MergeError::NotCombinable)
        );
        assert_eq!(fx.rt.call_count("partialMultiMerge"), 0);

        let enabled = fx.bound(AdapterConfig::non_associative(flags(false, true)), "test/Lists");
        assert_eq!(enabled.partial_merge_multi(b"k", &operands).unwrap(), b"a+b+c");
        assert_eq!(fx.rt.call_count("partialMultiMerge"), 1);
    }

    #[test]
    fn raising_operand_callbacks_leak_nothing() {
        let fx = Fixture::new();
        let adapter = fx.bound(AdapterConfig::non_associative(flags(true, true)), "test/Explodes");
        let operands: [&[u8]; 3] = [b"a", b"b", b"c"];
        let managed = |err: MergeError| match err {
            MergeError::Managed(m) => m,
            other => panic!("expected a managed error, got {other:?}"),
        };

        let full = managed(
            adapter
                .full_merge(&MergeInput::new(b"k", Some(&b"x"[..]), &operands))
                .unwrap_err(),
        );
        assert!(full.description.contains("full boom"));
        assert!(!full.rethrown);

        let multi = managed(adapter.partial_merge_multi(b"k", &operands).unwrap_err());
        assert!(multi.description.contains("multi boom"));

        let partial = managed(adapter.partial_merge(b"k", b"l", b"r").unwrap_err());
        assert!(partial.description.contains("partial boom"));

        assert!(!adapter.should_merge(&operands));
        assert_eq!(fx.rt.call_count("shouldMerge"), 1);

        assert_eq!(fx.rt.live_local_refs_on(fx.thread()), 0);
        assert!(fx.rt.pending_exception(fx.thread()).is_none());
    }

    // -----------------------------------------------------------------------
    // Provider retention
    // -----------------------------------------------------------------------

    #[test]
    fn pinned_provider_outlives_collection() {
        let fx = Fixture::new();
        let adapter = fx.bound(AdapterConfig::associative(), "test/Concat");
        fx.rt.collect_garbage();
        assert_eq!(adapter.as_associative().unwrap().merge(b"k", None, b"v").unwrap(), b"v");
    }

    #[test]
    fn collectable_provider_goes_inert() {
        let fx = Fixture::new();
        let config = AdapterConfig::associative().with_retention(ProviderRetention::AllowCollection);
        let adapter = fx.bound(config, "test/Concat");
        let op = adapter.as_associative().unwrap();

        assert_eq!(op.merge(b"k", None, b"v").unwrap(), b"v");
        fx.rt.collect_garbage();
        let err = op.merge(b"k", None, b"v").unwrap_err();
        assert_eq!(err, MergeError::unavailable("provider has been collected"));
        assert_eq!(fx.rt.call_count("merge"), 1);
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    #[test]
    fn calls_after_unload_fail_detectably() {
        let fx = Fixture::new();
        let adapter = fx.bound(AdapterConfig::associative(), "test/Concat");
        {
            let guard = fx.attach.acquire().unwrap();
            let report = fx.registry.run_unloaders(Some(&guard.env()));
            assert!(report.is_clean());
        }

        let err = adapter.as_associative().unwrap().merge(b"k", None, b"v").unwrap_err();
        assert!(err.is_unavailable());
        assert!(err.to_string().contains("released"));
        assert_eq!(fx.rt.call_count("merge"), 0);

        adapter.release();
        assert!(!adapter.is_bound());
        assert_eq!(fx.rt.live_global_refs(), 0);
    }

    #[test]
    fn release_while_closing_uses_cached_handle() {
        let fx = Fixture::new();
        let adapter = fx.bound(AdapterConfig::associative(), "test/Concat");
        let globals = fx.rt.live_global_refs();
        fx.attach.begin_closing();

        adapter.release();
        assert!(!adapter.is_bound());
        assert_eq!(fx.rt.live_global_refs(), globals - 1);
    }

    #[test]
    fn xor_adapter_never_touches_runtime() {
        let fx = Fixture::new();
        let adapter = fx.adapter(AdapterConfig::xor());
        let attaches = fx.rt.total_attaches();

        let op = adapter.as_associative().unwrap();
        assert_eq!(op.merge(b"k", Some(&[0xf0][..]), &[0x0f]).unwrap(), vec![0xff]);
        assert_eq!(op.merge(b"k", Some(&[1, 2][..]), &[1]), Err(MergeError::NotCombinable));
        assert_eq!(adapter.name(), "XorMergeOperator");
        assert_eq!(fx.rt.total_attaches(), attaches);

        let guard = fx.attach.acquire().unwrap();
        let env = guard.env();
        let provider = fx.rt.instantiate(&env, "test/Concat").unwrap();
        adapter.bind(&env, provider).unwrap();
        assert!(!adapter.is_bound());
    }
}
