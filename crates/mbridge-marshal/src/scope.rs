use mbridge_runtime::{Env, ObjRef};
use tracing::warn;

/// Local references created for one call.
///
/// Every reference pushed is deleted exactly once, newest first, when the
/// scope drops. Deleting a direct buffer's reference revokes the buffer, so
/// no managed view outlives the native memory it was built over. Failures
/// are logged and never change the outcome of the call.
pub struct LocalScope<'a> {
    env: Env<'a>,
    refs: Vec<ObjRef>,
}

impl<'a> LocalScope<'a> {
    pub fn new(env: Env<'a>) -> Self {
        Self {
            env,
            refs: Vec::new(),
        }
    }

    /// Track `r` and hand it back.
    pub fn push(&mut self, r: ObjRef) -> ObjRef {
        self.refs.push(r);
        r
    }

    pub fn len(&self) -> usize {
        self.refs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }

    /// Release everything tracked so far. The scope stays usable.
    pub fn release_all(&mut self) {
        for r in self.refs.drain(..).rev() {
            if let Err(e) = self.env.delete_local_ref(r) {
                warn!(reference = ?r, error = %e, "failed to release transient buffer");
            }
        }
    }
}

impl Drop for LocalScope<'_> {
    fn drop(&mut self) {
        self.release_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mbridge_runtime::{ManagedRuntime, SimRuntime};

    #[test]
    fn releases_everything_once() {
        let rt = SimRuntime::new();
        let h = rt.attach_current_thread().unwrap();
        let env = Env::new(&rt, &h);
        {
            let mut scope = LocalScope::new(env);
            scope.push(env.new_byte_array(b"a").unwrap());
            scope.push(env.new_byte_array(b"b").unwrap());
            assert_eq!(scope.len(), 2);
            assert_eq!(rt.live_local_refs(), 2);
        }
        assert_eq!(rt.live_local_refs(), 0);
    }

    #[test]
    fn release_failure_is_swallowed() {
        let rt = SimRuntime::new();
        let h = rt.attach_current_thread().unwrap();
        let env = Env::new(&rt, &h);
        let r = env.new_byte_array(b"x").unwrap();
        let mut scope = LocalScope::new(env);
        scope.push(r);
        env.delete_local_ref(r).unwrap();
        drop(scope);
        assert_eq!(rt.live_local_refs(), 0);
    }
}
