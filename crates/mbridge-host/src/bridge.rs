use std::sync::Arc;

use mbridge_attach::AttachManager;
use mbridge_hooks::{HookRegistry, MethodBinding, UnloadReport};
use mbridge_operator::{AdapterConfig, BindingSet};
use mbridge_runtime::{Env, ManagedRuntime, ObjRef, Value};
use tracing::{debug, error, info, warn};

use crate::config::BridgeConfig;
use crate::error::{HostError, HostResult};
use crate::table::{AdapterTable, NativeHandle};

/// An associative adapter produced by a managed factory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FactoryAdapter {
    pub handle: NativeHandle,
    /// What the factory's `name()` reported.
    pub factory_name: String,
}

/// The bridge between one managed runtime and the engine's merge operators.
///
/// Owns the attachment manager, the hook registry with every binding
/// registered, and the adapter table. Construct it before the runtime
/// loads the library, call [`load`](Self::load) from the load entry point
/// and [`unload`](Self::unload) from the unload entry point.
pub struct Bridge {
    config: BridgeConfig,
    attach: Arc<AttachManager>,
    registry: HookRegistry,
    bindings: Arc<BindingSet>,
    adapters: AdapterTable,
}

impl Bridge {
    pub fn new(runtime: Arc<dyn ManagedRuntime>, config: BridgeConfig) -> HostResult<Self> {
        let attach = Arc::new(AttachManager::new(runtime, config.detach_policy));
        let registry = HookRegistry::new();
        let bindings = BindingSet::register(&registry, &config.class_names)?;
        let adapters = AdapterTable::new(Arc::clone(&attach), Arc::clone(&bindings), config.provider_retention);
        debug!(
            policy = %config.detach_policy,
            retention = %config.provider_retention,
            loaders = registry.loader_count(),
            "bridge created"
        );
        Ok(Self {
            config,
            attach,
            registry,
            bindings,
            adapters,
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn attach_manager(&self) -> &Arc<AttachManager> {
        &self.attach
    }

    pub fn registry(&self) -> &HookRegistry {
        &self.registry
    }

    pub fn bindings(&self) -> &Arc<BindingSet> {
        &self.bindings
    }

    pub fn adapters(&self) -> &AdapterTable {
        &self.adapters
    }

    pub fn is_closing(&self) -> bool {
        self.attach.is_closing()
    }

    /// Resolve every binding. Returns the runtime interface version.
    ///
    /// The loading thread is attached for the duration if it was not
    /// already, and detached again afterwards. A failed load releases
    /// whatever the earlier loaders resolved before reporting the error.
    pub fn load(&self) -> HostResult<u32> {
        let runtime = self.attach.runtime();
        let version = runtime.interface_version();
        let (handle, attached_here) = match runtime.current_env()? {
            Some(handle) => (handle, false),
            None => (runtime.attach_current_thread()?, true),
        };

        let env = Env::new(&**runtime, &handle);
        let outcome = self.registry.run_loaders(&env);
        if outcome.is_err() {
            let report = self.registry.run_unloaders(Some(&env));
            if !report.is_clean() {
                warn!(failures = report.failures.len(), "cleanup after failed load was incomplete");
            }
        }

        if attached_here {
            if let Err(e) = runtime.detach_current_thread(handle) {
                warn!(error = %e, "failed to detach loading thread");
            }
        }

        let ran = outcome?;
        info!(version, loaders = ran, "bridge loaded");
        Ok(version)
    }

    /// Enter the closing state and release every binding and provider.
    ///
    /// Never attaches a thread; with no handle at hand the managed
    /// references are left to the runtime's own teardown.
    pub fn unload(&self) -> UnloadReport {
        if !self.attach.begin_closing() {
            debug!("bridge already closing");
        }
        let report = {
            let guard = self.attach.acquire_for_teardown();
            let env = guard.as_ref().map(|g| g.env());
            self.registry.run_unloaders(env.as_ref())
        };
        let released = self.adapters.release_providers();
        info!(
            unloaders = report.ran,
            failures = report.failures.len(),
            adapters = released,
            "bridge unloaded"
        );
        report
    }

    /// Ask a managed factory for a provider and bind it to a new
    /// associative adapter.
    pub fn create_from_factory(
        &self,
        env: &Env<'_>,
        factory: ObjRef,
        create_if_missing: bool,
    ) -> HostResult<FactoryAdapter> {
        let methods = self.bindings.factory.get()?;

        let name = env.call_method(factory, methods.name.id, &[])?;
        check_raised(env, &methods.name)?;
        let factory_name = match name.as_object() {
            Some(string) => {
                let text = env.read_string(string);
                release_local(env, string, "factory name");
                text?
            }
            None => String::new(),
        };

        let produced = env.call_method(factory, methods.create.id, &[Value::Bool(create_if_missing)])?;
        check_raised(env, &methods.create)?;
        let Some(provider) = produced.as_object() else {
            debug!(factory = %factory_name, create_if_missing, "factory declined");
            return Err(HostError::FactoryDeclined { factory: factory_name });
        };

        let handle = self.adapters.create_native(&AdapterConfig::associative());
        let bound = self.adapters.bind_callback(handle, env, provider);
        release_local(env, provider, "factory provider");
        if let Err(e) = bound {
            if let Err(dispose) = self.adapters.dispose_native(handle) {
                warn!(%handle, error = %dispose, "failed to dispose unbound adapter");
            }
            return Err(e);
        }
        debug!(factory = %factory_name, %handle, "adapter created from factory");
        Ok(FactoryAdapter { handle, factory_name })
    }

    /// Detach the calling thread now if the bridge attached it.
    ///
    /// For threads whose exit hooks never run, such as the main thread.
    pub fn detach_current_thread_if_possible(&self) -> HostResult<bool> {
        Ok(self.attach.detach_current_thread()?)
    }
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("adapters", &self.adapters)
            .field("closing", &self.is_closing())
            .finish()
    }
}

/// Delete a local reference, logging a failure instead of returning it.
fn release_local(env: &Env<'_>, obj: ObjRef, what: &str) -> bool {
    match env.delete_local_ref(obj) {
        Ok(()) => true,
        Err(e) => {
            warn!(what, error = %e, "failed to release local reference");
            false
        }
    }
}

/// Leave a raised exception pending for the managed caller and report it.
fn check_raised(env: &Env<'_>, method: &MethodBinding) -> HostResult<()> {
    let Some(throwable) = env.exception_occurred()? else {
        return Ok(());
    };
    let description = env
        .describe_exception(throwable)
        .unwrap_or_else(|e| format!("<undescribable: {e}>"));
    release_local(env, throwable, "exception");
    error!(method = %method, exception = %description, "factory raised");
    Err(HostError::ManagedRaised {
        method: method.to_string(),
        description,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    use mbridge_attach::{DetachPolicy, Origin, ThreadAttachment};
    use mbridge_hooks::Phase;
    use mbridge_operator::managed::{associative_factory, associative_provider, define_contract_classes, AssociativeReply};
    use mbridge_operator::{AssociativeMergeOperator, ClassNames, MergeError, ProviderRetention};
    use mbridge_runtime::sim::SIM_INTERFACE_VERSION;
    use mbridge_runtime::{Raise, SimRuntime};

    fn runtime(names: &ClassNames) -> Arc<SimRuntime> {
        let rt = Arc::new(SimRuntime::new());
        define_contract_classes(&rt, names).unwrap();
        rt.define_class(associative_provider(names, "test/Digest", false, |key, _, value| {
            let mut hasher = blake3::Hasher::new();
            hasher.update(key);
            hasher.update(value);
            Ok(AssociativeReply::Value(hasher.finalize().as_bytes().to_vec()))
        }))
        .unwrap();
        rt.define_class(associative_provider(names, "test/Raise", false, |_, _, _| {
            Err(Raise::runtime("provider failed"))
        }))
        .unwrap();
        rt.define_class(associative_factory(names, "test/DigestFactory", "digest", "test/Digest"))
            .unwrap();
        rt
    }

    fn loaded(config: BridgeConfig) -> (Arc<SimRuntime>, Bridge) {
        let rt = runtime(&config.class_names);
        let bridge = Bridge::new(rt.clone(), config).unwrap();
        assert_eq!(bridge.load().unwrap(), SIM_INTERFACE_VERSION);
        (rt, bridge)
    }

    fn adapter(rt: &SimRuntime, bridge: &Bridge, config: AdapterConfig, class: &str) -> NativeHandle {
        let handle = bridge.adapters().create_native(&config);
        let guard = bridge.attach_manager().acquire().unwrap();
        let env = guard.env();
        let provider = rt.instantiate(&env, class).unwrap();
        bridge.adapters().bind_callback(handle, &env, provider).unwrap();
        env.delete_local_ref(provider).unwrap();
        handle
    }

    fn digest(key: &[u8], value: &[u8]) -> Vec<u8> {
        let mut hasher = blake3::Hasher::new();
        hasher.update(key);
        hasher.update(value);
        hasher.finalize().as_bytes().to_vec()
    }

    // -----------------------------------------------------------------------
    // Load
    // -----------------------------------------------------------------------

    #[test]
    fn load_cycles_the_loading_thread() {
        let (rt, bridge) = loaded(BridgeConfig::default());
        let me = thread::current().id();
        assert_eq!(rt.attach_count(me), 1);
        assert_eq!(rt.detach_count(me), 1);
        assert!(!rt.is_attached(me));
        assert!(bridge.bindings().envelope.is_loaded());
        assert_eq!(bridge.registry().loader_count(), 0);
    }

    #[test]
    fn load_keeps_runtime_owned_thread_attached() {
        let names = ClassNames::default();
        let rt = runtime(&names);
        let _own = rt.attach_current_thread().unwrap();
        let bridge = Bridge::new(rt.clone(), BridgeConfig::default()).unwrap();

        bridge.load().unwrap();
        let me = thread::current().id();
        assert!(rt.is_attached(me));
        assert_eq!(rt.detach_count(me), 0);
    }

    #[test]
    fn load_twice_is_rejected() {
        let (_rt, bridge) = loaded(BridgeConfig::default());
        assert!(matches!(bridge.load(), Err(HostError::Registry(_))));
    }

    #[test]
    fn failed_load_releases_partial_bindings() {
        let rt = Arc::new(SimRuntime::new());
        let names = ClassNames::default();
        define_contract_classes(&rt, &names).unwrap();
        let config = BridgeConfig {
            class_names: ClassNames {
                non_associative: "missing/Type".into(),
                ..names
            },
            ..BridgeConfig::default()
        };
        let bridge = Bridge::new(rt.clone(), config).unwrap();

        let err = bridge.load().unwrap_err();
        assert!(err.to_string().contains("non-associative"));
        assert_eq!(rt.live_global_refs(), 0);
        assert!(!rt.is_attached(thread::current().id()));
        assert!(bridge.bindings().envelope.is_released());
        assert_eq!(bridge.registry().phase(), Phase::Unloaded);
        assert!(matches!(bridge.load(), Err(HostError::Registry(_))));
    }

    #[test]
    fn version_mismatch_fails_load() {
        let names = ClassNames::default();
        let rt = runtime(&names);
        rt.set_version_supported(false);
        let bridge = Bridge::new(rt.clone(), BridgeConfig::default()).unwrap();
        assert!(matches!(bridge.load(), Err(HostError::Runtime(_))));
        assert_eq!(rt.total_attaches(), 0);
    }

    // -----------------------------------------------------------------------
    // Concurrency
    // -----------------------------------------------------------------------

    #[test]
    fn eight_threads_see_only_their_own_arguments() {
        let (rt, bridge) = loaded(BridgeConfig::default());
        let handle = adapter(&rt, &bridge, AdapterConfig::associative(), "test/Digest");
        let op = bridge.adapters().operator(handle).unwrap();
        const CALLS: usize = 250;

        let threads: Vec<_> = thread::scope(|s| {
            let workers: Vec<_> = (0..8u8)
                .map(|t| {
                    let op = Arc::clone(&op);
                    let rt = &rt;
                    s.spawn(move || {
                        let key = [b'k', t];
                        let merge = op.as_associative().unwrap();
                        for i in 0..CALLS {
                            let value = format!("thread-{t}-call-{i}").into_bytes();
                            let out = merge.merge(&key, None, &value).unwrap();
                            assert_eq!(out, digest(&key, &value), "thread {t} call {i}");
                        }
                        let me = thread::current().id();
                        assert_eq!(rt.attach_count(me), 1);
                        assert_eq!(rt.live_local_refs_on(me), 0);
                        me
                    })
                })
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });

        // Lazy policy: each worker was detached once, at thread exit.
        for id in &threads {
            assert_eq!(rt.detach_count(*id), 1);
            assert!(!rt.is_attached(*id));
        }
        assert_eq!(rt.call_count("merge"), 8 * CALLS as u64);
        assert_eq!(rt.reclaimed_on_detach(), 0);
    }

    #[test]
    fn eager_policy_detaches_after_each_call() {
        let config = BridgeConfig {
            detach_policy: DetachPolicy::Eager,
            ..BridgeConfig::default()
        };
        let (rt, bridge) = loaded(config);
        let handle = adapter(&rt, &bridge, AdapterConfig::associative(), "test/Digest");
        let op = bridge.adapters().operator(handle).unwrap();

        thread::spawn(move || {
            let merge = op.as_associative().unwrap();
            for _ in 0..3 {
                merge.merge(b"k", None, b"v").unwrap();
            }
            let me = thread::current().id();
            assert_eq!(rt.attach_count(me), 3);
            assert!(!rt.is_attached(me));
        })
        .join()
        .unwrap();
    }

    // -----------------------------------------------------------------------
    // Failure paths
    // -----------------------------------------------------------------------

    #[test]
    fn raising_provider_leaks_nothing() {
        let (rt, bridge) = loaded(BridgeConfig::default());
        let handle = adapter(&rt, &bridge, AdapterConfig::associative(), "test/Raise");
        let op = bridge.adapters().operator(handle).unwrap();

        thread::spawn(move || {
            let err = op.as_associative().unwrap().merge(b"k", Some(&b"a"[..]), b"b").unwrap_err();
            assert!(matches!(err, MergeError::Managed(_)));
            let me = thread::current().id();
            assert_eq!(rt.live_local_refs_on(me), 0);
            assert!(rt.pending_exception(me).is_none());
        })
        .join()
        .unwrap();
    }

    #[test]
    fn calls_after_unload_are_unavailable() {
        let (rt, bridge) = loaded(BridgeConfig::default());
        let handle = adapter(&rt, &bridge, AdapterConfig::associative(), "test/Digest");
        let op = bridge.adapters().operator(handle).unwrap();
        assert!(op.as_associative().unwrap().merge(b"k", None, b"v").is_ok());

        let report = bridge.unload();
        assert_eq!(report.ran, 6);
        assert!(report.is_clean());
        assert!(bridge.is_closing());
        assert_eq!(rt.live_global_refs(), 0);

        let err = op.as_associative().unwrap().merge(b"k", None, b"v").unwrap_err();
        assert!(err.is_unavailable());
        assert_eq!(bridge.unload().ran, 0);
        bridge.adapters().dispose_native(handle).unwrap();
    }

    #[test]
    fn unload_without_handle_never_attaches() {
        let (rt, bridge) = loaded(BridgeConfig::default());
        let attaches = rt.total_attaches();
        let report = bridge.unload();
        assert!(report.is_clean());
        assert_eq!(rt.total_attaches(), attaches);
        // Bindings were only marked released; the runtime still owns them.
        assert_eq!(rt.live_global_refs(), 7);
    }

    #[test]
    fn retention_follows_configuration() {
        for (retention, survives) in [(ProviderRetention::Pin, true), (ProviderRetention::AllowCollection, false)] {
            let config = BridgeConfig {
                provider_retention: retention,
                ..BridgeConfig::default()
            };
            let (rt, bridge) = loaded(config);
            let handle = adapter(&rt, &bridge, AdapterConfig::associative(), "test/Digest");
            rt.collect_garbage();

            let op = bridge.adapters().operator(handle).unwrap();
            let outcome = op.as_associative().unwrap().merge(b"k", None, b"v");
            assert_eq!(outcome.is_ok(), survives, "{retention}");
        }
    }

    // -----------------------------------------------------------------------
    // Factory and explicit detach
    // -----------------------------------------------------------------------

    #[test]
    fn factory_produces_bound_adapter() {
        let (rt, bridge) = loaded(BridgeConfig::default());
        let guard = bridge.attach_manager().acquire().unwrap();
        let env = guard.env();
        let factory = rt.instantiate(&env, "test/DigestFactory").unwrap();

        let made = bridge.create_from_factory(&env, factory, true).unwrap();
        assert_eq!(made.factory_name, "digest");
        let op = bridge.adapters().operator(made.handle).unwrap();
        assert!(op.is_bound());
        assert_eq!(op.as_associative().unwrap().merge(b"k", None, b"v").unwrap(), digest(b"k", b"v"));

        let err = bridge.create_from_factory(&env, factory, false).unwrap_err();
        assert!(matches!(err, HostError::FactoryDeclined { ref factory } if factory == "digest"));
        assert_eq!(bridge.adapters().len(), 1);
        env.delete_local_ref(factory).unwrap();
        assert_eq!(rt.live_local_refs_on(thread::current().id()), 0);
    }

    #[test]
    fn stale_local_reference_is_logged_not_raised() {
        let (rt, bridge) = loaded(BridgeConfig::default());
        let guard = bridge.attach_manager().acquire().unwrap();
        let env = guard.env();
        let factory = rt.instantiate(&env, "test/DigestFactory").unwrap();

        assert!(release_local(&env, factory, "factory"));
        assert!(!release_local(&env, factory, "factory"));
        assert!(env.exception_occurred().unwrap().is_none());
        assert_eq!(rt.live_local_refs_on(thread::current().id()), 0);
    }

    #[test]
    fn explicit_detach_of_bridge_thread() {
        let (rt, bridge) = loaded(BridgeConfig::default());
        let handle = adapter(&rt, &bridge, AdapterConfig::associative(), "test/Digest");
        let me = thread::current().id();
        assert_eq!(bridge.attach_manager().thread_state(), ThreadAttachment::Attached(Origin::Bridge));

        assert!(bridge.detach_current_thread_if_possible().unwrap());
        assert!(!rt.is_attached(me));
        assert!(!bridge.detach_current_thread_if_possible().unwrap());

        // The next call attaches again.
        let op = bridge.adapters().operator(handle).unwrap();
        op.as_associative().unwrap().merge(b"k", None, b"v").unwrap();
        assert!(rt.is_attached(me));
    }
}
