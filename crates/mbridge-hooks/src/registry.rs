use std::panic::{self, AssertUnwindSafe};
use std::sync::Mutex;

use mbridge_runtime::Env;
use tracing::{debug, error, info, warn};

use crate::error::{BindingResult, Phase, RegistryError, RegistryResult};

/// Resolves and caches one binding's managed handles.
pub type Loader = Box<dyn FnMut(&Env<'_>) -> BindingResult<()> + Send>;

/// Releases one binding's managed handles.
///
/// Receives `None` when no execution handle could be obtained at teardown;
/// it should then mark its bindings released without calling the runtime.
pub type Unloader = Box<dyn FnMut(Option<&Env<'_>>) -> BindingResult<()> + Send>;

struct Named<H> {
    name: String,
    hook: H,
}

struct RegistryInner {
    phase: Phase,
    loaders: Vec<Named<Loader>>,
    unloaders: Vec<Named<Unloader>>,
}

/// An unloader that returned an error or panicked.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnloadFailure {
    pub hook: String,
    pub message: String,
}

/// Outcome of [`HookRegistry::run_unloaders`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UnloadReport {
    /// Unloaders invoked, including failed ones.
    pub ran: usize,
    pub failures: Vec<UnloadFailure>,
}

impl UnloadReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Ordered loader and unloader hooks, run once at load and once at unload.
///
/// Registration is only accepted while the registry is open. Loaders run in
/// registration order and the first failure aborts the load. Unloaders run
/// in reverse order, each isolated from the others' failures and panics.
/// Both lists are emptied by the run that consumes them.
pub struct HookRegistry {
    inner: Mutex<RegistryInner>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                phase: Phase::Open,
                loaders: Vec::new(),
                unloaders: Vec::new(),
            }),
        }
    }

    pub fn phase(&self) -> Phase {
        self.inner.lock().expect("lock poisoned").phase
    }

    pub fn loader_count(&self) -> usize {
        self.inner.lock().expect("lock poisoned").loaders.len()
    }

    pub fn unloader_count(&self) -> usize {
        self.inner.lock().expect("lock poisoned").unloaders.len()
    }

    pub fn register_loader<F>(&self, name: impl Into<String>, loader: F) -> RegistryResult<()>
    where
        F: FnMut(&Env<'_>) -> BindingResult<()> + Send + 'static,
    {
        let mut inner = self.inner.lock().expect("lock poisoned");
        if inner.phase != Phase::Open {
            return Err(RegistryError::Frozen { phase: inner.phase });
        }
        inner.loaders.push(Named {
            name: name.into(),
            hook: Box::new(loader),
        });
        Ok(())
    }

    pub fn register_unloader<F>(&self, name: impl Into<String>, unloader: F) -> RegistryResult<()>
    where
        F: FnMut(Option<&Env<'_>>) -> BindingResult<()> + Send + 'static,
    {
        let mut inner = self.inner.lock().expect("lock poisoned");
        if inner.phase != Phase::Open {
            return Err(RegistryError::Frozen { phase: inner.phase });
        }
        inner.unloaders.push(Named {
            name: name.into(),
            hook: Box::new(unloader),
        });
        Ok(())
    }

    /// Run every loader in registration order. Returns how many ran.
    ///
    /// The registry is frozen and the loader list cleared whether or not a
    /// loader fails; a failed load still needs [`run_unloaders`](Self::run_unloaders)
    /// to release whatever the earlier loaders resolved.
    pub fn run_loaders(&self, env: &Env<'_>) -> RegistryResult<usize> {
        let loaders = {
            let mut inner = self.inner.lock().expect("lock poisoned");
            if inner.phase != Phase::Open {
                return Err(RegistryError::NotOpen { phase: inner.phase });
            }
            inner.phase = Phase::Loaded;
            std::mem::take(&mut inner.loaders)
        };
        info!(
            loaders = loaders.len(),
            unloaders = self.unloader_count(),
            "running loaders"
        );

        let mut ran = 0;
        for Named { name, mut hook } in loaders {
            if let Err(source) = hook(env) {
                error!(hook = %name, error = %source, "loader failed, aborting load");
                return Err(RegistryError::LoaderFailed { hook: name, source });
            }
            if let Some(description) = env.catch_and_log() {
                debug!(hook = %name, exception = %description, "loader left an exception pending");
            }
            debug!(hook = %name, "loader done");
            ran += 1;
        }
        Ok(ran)
    }

    /// Run every unloader in reverse registration order.
    ///
    /// Runs at most once; later calls return an empty report.
    pub fn run_unloaders(&self, env: Option<&Env<'_>>) -> UnloadReport {
        let unloaders = {
            let mut inner = self.inner.lock().expect("lock poisoned");
            if inner.phase == Phase::Unloaded {
                return UnloadReport::default();
            }
            inner.phase = Phase::Unloaded;
            inner.loaders.clear();
            std::mem::take(&mut inner.unloaders)
        };
        info!(unloaders = unloaders.len(), has_env = env.is_some(), "running unloaders");

        let mut report = UnloadReport::default();
        for Named { name, mut hook } in unloaders.into_iter().rev() {
            report.ran += 1;
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| hook(env)));
            let message = match outcome {
                Ok(Ok(())) => {
                    debug!(hook = %name, "unloader done");
                    continue;
                }
                Ok(Err(e)) => e.to_string(),
                Err(payload) => panic_message(payload.as_ref()),
            };
            warn!(hook = %name, error = %message, "unloader failed");
            report.failures.push(UnloadFailure { hook: name, message });
        }
        report
    }
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().expect("lock poisoned");
        f.debug_struct("HookRegistry")
            .field("phase", &inner.phase)
            .field("loaders", &inner.loaders.len())
            .field("unloaders", &inner.unloaders.len())
            .finish()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BindingError;
    use mbridge_runtime::{ManagedRuntime, SimRuntime};
    use std::sync::{Arc, Mutex};

    fn journal() -> Arc<Mutex<Vec<String>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    fn log(journal: &Arc<Mutex<Vec<String>>>, entry: &str) {
        journal.lock().unwrap().push(entry.to_string());
    }

    // -----------------------------------------------------------------------
    // Ordering
    // -----------------------------------------------------------------------

    #[test]
    fn loaders_forward_unloaders_reverse() {
        let rt = SimRuntime::new();
        let h = rt.attach_current_thread().unwrap();
        let env = Env::new(&rt, &h);
        let registry = HookRegistry::new();
        let j = journal();

        for name in ["a", "b", "c"] {
            let jl = j.clone();
            registry
                .register_loader(name, move |_| {
                    log(&jl, &format!("load {name}"));
                    Ok(())
                })
                .unwrap();
            let ju = j.clone();
            registry
                .register_unloader(name, move |_| {
                    log(&ju, &format!("unload {name}"));
                    Ok(())
                })
                .unwrap();
        }

        assert_eq!(registry.run_loaders(&env).unwrap(), 3);
        assert_eq!(registry.loader_count(), 0);
        let report = registry.run_unloaders(Some(&env));
        assert_eq!(report.ran, 3);
        assert!(report.is_clean());
        assert_eq!(
            *j.lock().unwrap(),
            vec!["load a", "load b", "load c", "unload c", "unload b", "unload a"]
        );
    }

    #[test]
    fn unloaders_run_once() {
        let registry = HookRegistry::new();
        let j = journal();
        let ju = j.clone();
        registry
            .register_unloader("only", move |_| {
                log(&ju, "unload");
                Ok(())
            })
            .unwrap();

        assert_eq!(registry.run_unloaders(None).ran, 1);
        assert_eq!(registry.run_unloaders(None).ran, 0);
        assert_eq!(j.lock().unwrap().len(), 1);
        assert_eq!(registry.phase(), Phase::Unloaded);
    }

    // -----------------------------------------------------------------------
    // Failures
    // -----------------------------------------------------------------------

    #[test]
    fn first_loader_failure_aborts() {
        let rt = SimRuntime::new();
        let h = rt.attach_current_thread().unwrap();
        let env = Env::new(&rt, &h);
        let registry = HookRegistry::new();
        let j = journal();

        let j1 = j.clone();
        registry
            .register_loader("bad", move |_| {
                log(&j1, "bad");
                Err(BindingError::NotLoaded("x".into()))
            })
            .unwrap();
        let j2 = j.clone();
        registry
            .register_loader("never", move |_| {
                log(&j2, "never");
                Ok(())
            })
            .unwrap();

        let err = registry.run_loaders(&env).unwrap_err();
        assert!(matches!(err, RegistryError::LoaderFailed { ref hook, .. } if hook == "bad"));
        assert_eq!(*j.lock().unwrap(), vec!["bad"]);
        assert_eq!(registry.loader_count(), 0);
        assert!(matches!(registry.run_loaders(&env), Err(RegistryError::NotOpen { .. })));
    }

    #[test]
    fn unloader_failures_are_isolated() {
        let registry = HookRegistry::new();
        let j = journal();

        let j1 = j.clone();
        registry
            .register_unloader("first", move |_| {
                log(&j1, "first");
                Ok(())
            })
            .unwrap();
        registry
            .register_unloader("errs", |_| Err(BindingError::Released("y".into())))
            .unwrap();
        registry
            .register_unloader("panics", |_| panic!("teardown exploded"))
            .unwrap();

        let report = registry.run_unloaders(None);
        assert_eq!(report.ran, 3);
        assert_eq!(report.failures.len(), 2);
        assert_eq!(report.failures[0].hook, "panics");
        assert!(report.failures[0].message.contains("teardown exploded"));
        assert_eq!(report.failures[1].hook, "errs");
        assert_eq!(*j.lock().unwrap(), vec!["first"]);
    }

    #[test]
    fn registration_closes_after_load() {
        let rt = SimRuntime::new();
        let h = rt.attach_current_thread().unwrap();
        let env = Env::new(&rt, &h);
        let registry = HookRegistry::new();
        registry.run_loaders(&env).unwrap();

        assert_eq!(
            registry.register_loader("late", |_| Ok(())),
            Err(RegistryError::Frozen { phase: Phase::Loaded })
        );
        assert!(registry.register_unloader("late", |_| Ok(())).is_err());
    }

    #[test]
    fn pending_exception_after_loader_is_cleared() {
        let rt = SimRuntime::new();
        let h = rt.attach_current_thread().unwrap();
        let env = Env::new(&rt, &h);
        let registry = HookRegistry::new();
        registry
            .register_loader("noisy", |env| {
                env.throw_error("left behind").map_err(|e| BindingError::resolution("noisy", "throw", e))
            })
            .unwrap();
        registry.run_loaders(&env).unwrap();
        assert!(rt.pending_exception(h.thread()).is_none());
    }
}
