use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use mbridge_runtime::{Env, ExecutionHandle, ManagedRuntime, RuntimeError};
use tracing::{debug, trace, warn};

use crate::error::{AttachError, AttachResult};
use crate::policy::DetachPolicy;
use crate::record::{self, AttachmentRecord, Origin, ThreadAttachment};

static NEXT_MANAGER_ID: AtomicU64 = AtomicU64::new(1);

fn attach_failure(e: RuntimeError) -> AttachError {
    AttachError::AttachmentFailure { reason: e.to_string() }
}

// ---------------------------------------------------------------------------
// AttachManager
// ---------------------------------------------------------------------------

/// Hands out execution handles to native threads.
///
/// The first [`acquire`](Self::acquire) on a thread attaches it (or adopts
/// an attachment the runtime already had) and caches the handle in the
/// thread's own storage; later calls return the cached handle without
/// touching the runtime. Under [`DetachPolicy::Lazy`] the thread stays
/// attached until it exits; under [`DetachPolicy::Eager`] it is detached
/// when the outermost guard drops.
///
/// Once [`begin_closing`](Self::begin_closing) is called no new handles are
/// handed out and the manager never calls detach again.
pub struct AttachManager {
    id: u64,
    runtime: Arc<dyn ManagedRuntime>,
    policy: DetachPolicy,
    closing: Arc<AtomicBool>,
    /// Thread records hold a weak copy to notice the manager is gone.
    live: Arc<()>,
}

impl AttachManager {
    pub fn new(runtime: Arc<dyn ManagedRuntime>, policy: DetachPolicy) -> Self {
        Self {
            id: NEXT_MANAGER_ID.fetch_add(1, Ordering::Relaxed),
            runtime,
            policy,
            closing: Arc::new(AtomicBool::new(false)),
            live: Arc::new(()),
        }
    }

    pub fn runtime(&self) -> &Arc<dyn ManagedRuntime> {
        &self.runtime
    }

    pub fn policy(&self) -> DetachPolicy {
        self.policy
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Enter the closing state. Returns `false` if it was already closing.
    pub fn begin_closing(&self) -> bool {
        !self.closing.swap(true, Ordering::AcqRel)
    }

    /// Attachment state of the calling thread.
    pub fn thread_state(&self) -> ThreadAttachment {
        record::with_record(self.id, |r| r.state()).unwrap_or(ThreadAttachment::Unattached)
    }

    /// Obtain a handle for the calling thread, attaching it if needed.
    ///
    /// Reentrant: nested guards on one thread share the cached handle.
    pub fn acquire(&self) -> AttachResult<AttachGuard<'_>> {
        if self.is_closing() {
            trace!(manager = self.id, "acquire rejected: closing");
            return Err(AttachError::Closing);
        }

        if let Some((handle, origin)) = record::enter(self.id) {
            return Ok(self.guard(handle, origin, Scope::Recorded));
        }

        let pruned = record::prune_orphans();
        if pruned > 0 {
            debug!(manager = self.id, pruned, "dropped records of defunct managers");
        }
        let (handle, origin) = self.attach()?;

        let reattached = record::with_record(self.id, |r| {
            r.handle = Some(handle.clone());
            r.origin = origin;
            r.depth += 1;
        });
        if reattached.is_some() {
            debug!(manager = self.id, ?origin, "thread reattached");
            return Ok(self.guard(handle, origin, Scope::Recorded));
        }

        let record = AttachmentRecord {
            manager: self.id,
            owner: Arc::downgrade(&self.live),
            runtime: Arc::clone(&self.runtime),
            closing: Arc::clone(&self.closing),
            handle: Some(handle.clone()),
            origin,
            depth: 1,
        };
        match record::insert(record) {
            Ok(()) => Ok(self.guard(handle, origin, Scope::Recorded)),
            Err(mut record) => {
                record.handle = None;
                warn!(manager = self.id, "thread storage unavailable, attachment not cached");
                Ok(self.guard(handle, origin, Scope::Unrecorded))
            }
        }
    }

    /// Best-effort handle for shutdown work.
    ///
    /// Works while closing. Uses the cached handle or an attachment the
    /// runtime already has, and never attaches the thread afresh.
    pub fn acquire_for_teardown(&self) -> Option<AttachGuard<'_>> {
        if let Some((handle, origin)) = record::enter(self.id) {
            return Some(self.guard(handle, origin, Scope::Recorded));
        }
        match self.runtime.current_env() {
            Ok(Some(handle)) => Some(self.guard(handle, Origin::Runtime, Scope::Unrecorded)),
            Ok(None) => None,
            Err(e) => {
                warn!(manager = self.id, error = %e, "no execution handle for teardown");
                None
            }
        }
    }

    /// Detach the calling thread now instead of at thread exit.
    ///
    /// Returns `true` if a detach call was made. Attachments the runtime
    /// made itself are forgotten but not detached, and nothing is detached
    /// while closing.
    pub fn detach_current_thread(&self) -> AttachResult<bool> {
        let taken = record::with_record(self.id, |r| {
            if r.depth > 0 {
                Err(AttachError::InUse)
            } else {
                Ok(r.take_detachable())
            }
        });
        let Some(handle) = taken.transpose()?.flatten() else {
            return Ok(false);
        };
        self.runtime
            .detach_current_thread(handle)
            .map_err(|e| AttachError::DetachFailure { reason: e.to_string() })?;
        debug!(manager = self.id, "thread detached explicitly");
        Ok(true)
    }

    fn attach(&self) -> AttachResult<(ExecutionHandle, Origin)> {
        match self.runtime.current_env().map_err(attach_failure)? {
            Some(handle) => {
                debug!(manager = self.id, "thread already attached by runtime");
                Ok((handle, Origin::Runtime))
            }
            None => {
                let handle = self.runtime.attach_current_thread().map_err(attach_failure)?;
                debug!(manager = self.id, "thread attached");
                Ok((handle, Origin::Bridge))
            }
        }
    }

    fn guard(&self, handle: ExecutionHandle, origin: Origin, scope: Scope) -> AttachGuard<'_> {
        AttachGuard {
            manager: self,
            handle,
            origin,
            scope,
        }
    }

    fn release(&self, scope: Scope, origin: Origin, handle: ExecutionHandle) {
        let detachable = match scope {
            Scope::Recorded => {
                let eager = self.policy == DetachPolicy::Eager;
                record::with_record(self.id, |r| {
                    r.depth = r.depth.saturating_sub(1);
                    if eager && r.depth == 0 && r.origin == Origin::Bridge {
                        r.take_detachable()
                    } else {
                        None
                    }
                })
                .flatten()
            }
            Scope::Unrecorded if origin == Origin::Bridge && !self.is_closing() => Some(handle),
            Scope::Unrecorded => None,
        };
        if let Some(handle) = detachable {
            match self.runtime.detach_current_thread(handle) {
                Ok(()) => trace!(manager = self.id, "thread detached after call"),
                Err(e) => warn!(manager = self.id, error = %e, "detach after call failed"),
            }
        }
    }
}

impl std::fmt::Debug for AttachManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachManager")
            .field("id", &self.id)
            .field("policy", &self.policy)
            .field("closing", &self.is_closing())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// AttachGuard
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug)]
enum Scope {
    /// Counted in the thread's record.
    Recorded,
    /// Not cached anywhere; the guard owns the attachment.
    Unrecorded,
}

/// A handle checked out for the duration of one call.
///
/// Dropping the guard applies the detach policy. The guard cannot leave its
/// thread.
pub struct AttachGuard<'m> {
    manager: &'m AttachManager,
    handle: ExecutionHandle,
    origin: Origin,
    scope: Scope,
}

impl AttachGuard<'_> {
    pub fn env(&self) -> Env<'_> {
        Env::new(self.manager.runtime.as_ref(), &self.handle)
    }

    pub fn handle(&self) -> &ExecutionHandle {
        &self.handle
    }

    /// Who attached the thread. Managed exceptions can only be handed back
    /// to a caller on runtime-owned threads.
    pub fn origin(&self) -> Origin {
        self.origin
    }
}

impl Drop for AttachGuard<'_> {
    fn drop(&mut self) {
        self.manager.release(self.scope, self.origin, self.handle.clone());
    }
}

impl std::fmt::Debug for AttachGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachGuard")
            .field("handle", &self.handle)
            .field("origin", &self.origin)
            .field("scope", &self.scope)
            .finish()
    }
}
