use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use mbridge_runtime::{ExecutionHandle, ManagedRuntime};
use tracing::{debug, warn};

/// Who attached a thread to the runtime.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Origin {
    /// The bridge attached it and is responsible for detaching it.
    Bridge,
    /// The runtime already knew the thread; the bridge never detaches it.
    Runtime,
}

/// Attachment state of the current thread, as seen by one manager.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadAttachment {
    /// No call from this thread has gone through the manager yet.
    Unattached,
    Attached(Origin),
    /// Attached once, then detached explicitly or by the eager policy.
    Detached,
}

/// One thread's cached attachment for one manager.
///
/// Lives only in the owning thread's storage. Dropping it is the thread-exit
/// finalizer: a bridge-owned attachment is detached unless the bridge is
/// closing.
pub(crate) struct AttachmentRecord {
    pub manager: u64,
    /// Dangles once the manager is dropped.
    pub owner: Weak<()>,
    pub runtime: Arc<dyn ManagedRuntime>,
    pub closing: Arc<AtomicBool>,
    pub handle: Option<ExecutionHandle>,
    pub origin: Origin,
    /// Number of live guards on this thread.
    pub depth: usize,
}

impl AttachmentRecord {
    /// Clear the cached handle. Returns it when the bridge is expected to
    /// detach it.
    pub fn take_detachable(&mut self) -> Option<ExecutionHandle> {
        let handle = self.handle.take()?;
        if self.origin == Origin::Runtime || self.closing.load(Ordering::Acquire) {
            return None;
        }
        Some(handle)
    }

    pub fn is_orphaned(&self) -> bool {
        self.owner.strong_count() == 0
    }

    pub fn state(&self) -> ThreadAttachment {
        match self.handle {
            Some(_) => ThreadAttachment::Attached(self.origin),
            None => ThreadAttachment::Detached,
        }
    }
}

impl Drop for AttachmentRecord {
    fn drop(&mut self) {
        let Some(handle) = self.take_detachable() else {
            return;
        };
        match self.runtime.detach_current_thread(handle) {
            Ok(()) => debug!(manager = self.manager, "thread exit: detached"),
            Err(e) => warn!(manager = self.manager, error = %e, "thread exit: detach failed"),
        }
    }
}

thread_local! {
    static RECORDS: RefCell<Vec<AttachmentRecord>> = const { RefCell::new(Vec::new()) };
}

/// Run `f` on this thread's record for `manager`.
///
/// `None` when there is no record, or when thread storage is already being
/// torn down. `f` must not call into the runtime.
pub(crate) fn with_record<R>(manager: u64, f: impl FnOnce(&mut AttachmentRecord) -> R) -> Option<R> {
    RECORDS
        .try_with(|records| {
            let mut records = records.try_borrow_mut().ok()?;
            records.iter_mut().find(|r| r.manager == manager).map(f)
        })
        .ok()
        .flatten()
}

/// Enter a call on a thread with a live cached handle.
pub(crate) fn enter(manager: u64) -> Option<(ExecutionHandle, Origin)> {
    with_record(manager, |record| {
        let handle = record.handle.clone()?;
        record.depth += 1;
        Some((handle, record.origin))
    })
    .flatten()
}

/// Drop this thread's records whose manager no longer exists, detaching
/// what they attached. Returns how many were dropped.
pub(crate) fn prune_orphans() -> usize {
    let orphans: Vec<AttachmentRecord> = RECORDS
        .try_with(|records| {
            let Ok(mut records) = records.try_borrow_mut() else {
                return Vec::new();
            };
            let (orphans, live): (Vec<_>, Vec<_>) = records.drain(..).partition(AttachmentRecord::is_orphaned);
            *records = live;
            orphans
        })
        .unwrap_or_default();
    // Detach outside the borrow.
    let pruned = orphans.len();
    drop(orphans);
    pruned
}

#[cfg(test)]
pub(crate) fn record_count() -> usize {
    RECORDS.with(|records| records.borrow().len())
}

/// Store a new record. Gives it back if thread storage is unavailable.
pub(crate) fn insert(record: AttachmentRecord) -> Result<(), AttachmentRecord> {
    let mut slot = Some(record);
    let _ = RECORDS.try_with(|records| {
        if let Ok(mut records) = records.try_borrow_mut() {
            records.extend(slot.take());
        }
    });
    match slot {
        Some(record) => Err(record),
        None => Ok(()),
    }
}
