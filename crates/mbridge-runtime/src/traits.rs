use crate::error::RuntimeResult;
use crate::handle::{ExecutionHandle, FieldId, MethodId, NativeView, ObjRef, Value};

/// The embedding interface of a managed (garbage-collected) runtime.
///
/// All implementations must satisfy these invariants:
/// - Every method taking an [`ExecutionHandle`] rejects a handle that was
///   detached or that is presented on a thread other than its own, with
///   `RuntimeError::InvalidHandle`.
/// - Local references belong to the thread that created them and die with
///   its attachment; global references live until deleted; weak references
///   do not keep their object alive.
/// - A managed exception never surfaces as an `Err`. It stays pending on the
///   thread until cleared, and while it is pending `call_method` refuses to
///   run.
/// - Thread attach and detach are expensive; callers are expected to cache
///   handles.
pub trait ManagedRuntime: Send + Sync {
    /// Interface version this runtime speaks.
    fn interface_version(&self) -> u32;

    // -- thread control ----------------------------------------------------

    /// Handle for the current thread if it is already attached.
    ///
    /// Returns `Ok(None)` when the thread is detached and
    /// `Err(VersionUnsupported)` when the runtime cannot serve this interface.
    fn current_env(&self) -> RuntimeResult<Option<ExecutionHandle>>;

    /// Attach the current thread. Attaching an already attached thread
    /// returns its existing handle.
    fn attach_current_thread(&self) -> RuntimeResult<ExecutionHandle>;

    /// Detach the current thread, invalidating `env` and every local
    /// reference the thread still holds.
    fn detach_current_thread(&self, env: ExecutionHandle) -> RuntimeResult<()>;

    // -- resolution ----------------------------------------------------------

    /// Local reference to the type named `name`.
    fn find_class(&self, env: &ExecutionHandle, name: &str) -> RuntimeResult<ObjRef>;

    /// Resolve a method declared on `class` or one of its supertypes.
    fn method_id(
        &self,
        env: &ExecutionHandle,
        class: ObjRef,
        name: &str,
        signature: &str,
    ) -> RuntimeResult<MethodId>;

    /// Resolve a field declared on `class` or one of its supertypes.
    fn field_id(
        &self,
        env: &ExecutionHandle,
        class: ObjRef,
        name: &str,
        signature: &str,
    ) -> RuntimeResult<FieldId>;

    // -- references ------------------------------------------------------------

    fn new_global_ref(&self, env: &ExecutionHandle, obj: ObjRef) -> RuntimeResult<ObjRef>;
    fn delete_global_ref(&self, env: &ExecutionHandle, obj: ObjRef) -> RuntimeResult<()>;
    fn new_weak_ref(&self, env: &ExecutionHandle, obj: ObjRef) -> RuntimeResult<ObjRef>;
    fn delete_weak_ref(&self, env: &ExecutionHandle, obj: ObjRef) -> RuntimeResult<()>;

    /// Local reference to the object behind `weak`, or `None` once collected.
    fn upgrade_weak_ref(&self, env: &ExecutionHandle, weak: ObjRef) -> RuntimeResult<Option<ObjRef>>;

    /// Local reference to whatever `obj` (of any kind) points at.
    fn new_local_ref(&self, env: &ExecutionHandle, obj: ObjRef) -> RuntimeResult<ObjRef>;
    fn delete_local_ref(&self, env: &ExecutionHandle, obj: ObjRef) -> RuntimeResult<()>;

    // -- objects ---------------------------------------------------------------

    /// Instantiate `class` through the constructor `ctor`.
    fn new_object(&self, env: &ExecutionHandle, class: ObjRef, ctor: MethodId) -> RuntimeResult<ObjRef>;

    /// New managed byte array holding a copy of `bytes`.
    fn new_byte_array(&self, env: &ExecutionHandle, bytes: &[u8]) -> RuntimeResult<ObjRef>;

    /// New managed buffer that reads `view` in place.
    ///
    /// The buffer is revoked when the returned local reference is deleted.
    fn new_direct_buffer(&self, env: &ExecutionHandle, view: NativeView) -> RuntimeResult<ObjRef>;

    /// New managed array of `element_class` holding `elements` in order.
    fn new_object_array(
        &self,
        env: &ExecutionHandle,
        element_class: ObjRef,
        elements: &[ObjRef],
    ) -> RuntimeResult<ObjRef>;

    /// Copy the contents of a managed byte array into native memory.
    fn read_byte_array(&self, env: &ExecutionHandle, array: ObjRef) -> RuntimeResult<Vec<u8>>;

    /// Copy `capacity` bytes starting at the address of a direct buffer.
    fn read_direct_buffer(&self, env: &ExecutionHandle, buffer: ObjRef) -> RuntimeResult<Vec<u8>>;

    /// Read a managed string as UTF-8.
    fn read_string(&self, env: &ExecutionHandle, string: ObjRef) -> RuntimeResult<String>;

    fn get_boolean_field(&self, env: &ExecutionHandle, obj: ObjRef, field: FieldId) -> RuntimeResult<bool>;

    // -- invocation --------------------------------------------------------------

    /// Invoke `method` on `target` with virtual dispatch.
    ///
    /// If managed code raises, the exception is left pending and a null or
    /// default value is returned.
    fn call_method(
        &self,
        env: &ExecutionHandle,
        target: ObjRef,
        method: MethodId,
        args: &[Value],
    ) -> RuntimeResult<Value>;

    // -- exceptions ----------------------------------------------------------------

    /// Local reference to the pending exception, if any. Does not clear it.
    fn exception_occurred(&self, env: &ExecutionHandle) -> RuntimeResult<Option<ObjRef>>;
    fn exception_clear(&self, env: &ExecutionHandle) -> RuntimeResult<()>;

    /// Make `throwable` the pending exception of the current thread.
    fn throw(&self, env: &ExecutionHandle, throwable: ObjRef) -> RuntimeResult<()>;

    /// Raise a new exception of type `class_name` carrying `message`.
    fn throw_new(&self, env: &ExecutionHandle, class_name: &str, message: &str) -> RuntimeResult<()>;

    /// Human-readable `Type: message` rendering of a throwable.
    fn describe_exception(&self, env: &ExecutionHandle, throwable: ObjRef) -> RuntimeResult<String>;
}
