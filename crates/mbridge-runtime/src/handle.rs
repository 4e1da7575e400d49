use std::fmt;
use std::marker::PhantomData;
use std::num::NonZeroU64;
use std::ptr::NonNull;
use std::thread::ThreadId;

// ---------------------------------------------------------------------------
// ExecutionHandle
// ---------------------------------------------------------------------------

/// Capability for calling into the managed runtime from the current thread.
///
/// A handle is minted by the runtime when a thread attaches (or when it is
/// found to be attached already) and names the thread it belongs to. The
/// runtime rejects it once the thread detaches. The type is `!Send` and
/// `!Sync`: a handle cannot leave the thread that obtained it.
#[derive(Clone, PartialEq, Eq)]
pub struct ExecutionHandle {
    thread: ThreadId,
    token: u64,
    _not_send: PhantomData<*const ()>,
}

impl ExecutionHandle {
    /// Mint a handle. Only runtime implementations should call this.
    pub fn new(thread: ThreadId, token: u64) -> Self {
        Self {
            thread,
            token,
            _not_send: PhantomData,
        }
    }

    /// The thread this handle was issued to.
    pub fn thread(&self) -> ThreadId {
        self.thread
    }

    /// Runtime-specific attachment token; changes on every attach.
    pub fn token(&self) -> u64 {
        self.token
    }
}

impl fmt::Debug for ExecutionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionHandle")
            .field("thread", &self.thread)
            .field("token", &self.token)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Opaque identifiers
// ---------------------------------------------------------------------------

/// Opaque reference to a managed object.
///
/// Whether it is a local, global or weak reference is known to the runtime,
/// not to the holder; the holder is responsible for deleting it with the
/// matching `delete_*` call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjRef(NonZeroU64);

impl ObjRef {
    /// Wrap a raw runtime reference value. Returns `None` for zero.
    pub fn from_raw(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Self)
    }

    /// The raw value, suitable for storing in a managed `long` field.
    pub fn into_raw(self) -> u64 {
        self.0.get()
    }
}

/// Resolved method identifier. Valid for the lifetime of the runtime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MethodId(pub u32);

/// Resolved field identifier. Valid for the lifetime of the runtime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FieldId(pub u32);

// ---------------------------------------------------------------------------
// Value
// ---------------------------------------------------------------------------

/// An argument to, or the result of, a managed method call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Value {
    Void,
    Bool(bool),
    /// An object reference; `None` is the managed null.
    Object(Option<ObjRef>),
}

impl Value {
    /// The managed null.
    pub fn null() -> Self {
        Self::Object(None)
    }

    pub fn object(obj: ObjRef) -> Self {
        Self::Object(Some(obj))
    }

    /// The referenced object, if this is a non-null object value.
    pub fn as_object(&self) -> Option<ObjRef> {
        match self {
            Self::Object(obj) => *obj,
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Object(None))
    }
}

impl From<Option<ObjRef>> for Value {
    fn from(obj: Option<ObjRef>) -> Self {
        Self::Object(obj)
    }
}

// ---------------------------------------------------------------------------
// NativeView
// ---------------------------------------------------------------------------

/// A read-only window over native memory, handed to the runtime to back a
/// zero-copy managed buffer.
///
/// The view does not own or borrow-check the memory. Whoever creates it
/// promises that the memory stays valid until the managed buffer built from
/// it has been released (its local reference deleted); runtimes must refuse
/// reads after that point.
#[derive(Clone, Copy)]
pub struct NativeView {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the view is a read-only pointer/length pair. Reads happen only
// while the creator keeps the memory alive (see `NativeView::new`).
unsafe impl Send for NativeView {}
// SAFETY: as above; no interior mutation happens through the pointer.
unsafe impl Sync for NativeView {}

impl NativeView {
    /// Create a view over `bytes`.
    ///
    /// # Safety
    ///
    /// `bytes` must outlive every read made through the view. In practice
    /// the caller must delete the managed buffer built from this view before
    /// `bytes` is dropped or mutated.
    pub unsafe fn new(bytes: &[u8]) -> Self {
        let ptr = NonNull::new(bytes.as_ptr() as *mut u8).unwrap_or(NonNull::dangling());
        Self {
            ptr,
            len: bytes.len(),
        }
    }

    /// Capacity of the view in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Address of the first byte.
    pub fn address(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Borrow the viewed bytes.
    ///
    /// # Safety
    ///
    /// The memory the view was created over must still be alive and
    /// unmodified.
    pub unsafe fn as_slice(&self) -> &[u8] {
        if self.len == 0 {
            return &[];
        }
        std::slice::from_raw_parts(self.ptr.as_ptr(), self.len)
    }
}

impl fmt::Debug for NativeView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeView")
            .field("address", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}
