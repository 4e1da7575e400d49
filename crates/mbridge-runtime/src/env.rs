use std::fmt;

use crate::error::RuntimeResult;
use crate::handle::{ExecutionHandle, FieldId, MethodId, NativeView, ObjRef, Value};
use crate::names;
use crate::traits::ManagedRuntime;

/// A runtime bound to the execution handle of the current thread.
///
/// `Env` is what loader hooks and the marshaller work with. It is `Copy`,
/// borrows both halves, and cannot leave the thread because the handle
/// cannot.
#[derive(Clone, Copy)]
pub struct Env<'a> {
    runtime: &'a dyn ManagedRuntime,
    handle: &'a ExecutionHandle,
}

impl<'a> Env<'a> {
    pub fn new(runtime: &'a dyn ManagedRuntime, handle: &'a ExecutionHandle) -> Self {
        Self { runtime, handle }
    }

    pub fn runtime(&self) -> &'a dyn ManagedRuntime {
        self.runtime
    }

    pub fn handle(&self) -> &'a ExecutionHandle {
        self.handle
    }

    pub fn find_class(&self, name: &str) -> RuntimeResult<ObjRef> {
        self.runtime.find_class(self.handle, name)
    }

    pub fn method_id(&self, class: ObjRef, name: &str, signature: &str) -> RuntimeResult<MethodId> {
        self.runtime.method_id(self.handle, class, name, signature)
    }

    pub fn field_id(&self, class: ObjRef, name: &str, signature: &str) -> RuntimeResult<FieldId> {
        self.runtime.field_id(self.handle, class, name, signature)
    }

    pub fn new_global_ref(&self, obj: ObjRef) -> RuntimeResult<ObjRef> {
        self.runtime.new_global_ref(self.handle, obj)
    }

    pub fn delete_global_ref(&self, obj: ObjRef) -> RuntimeResult<()> {
        self.runtime.delete_global_ref(self.handle, obj)
    }

    pub fn new_weak_ref(&self, obj: ObjRef) -> RuntimeResult<ObjRef> {
        self.runtime.new_weak_ref(self.handle, obj)
    }

    pub fn delete_weak_ref(&self, obj: ObjRef) -> RuntimeResult<()> {
        self.runtime.delete_weak_ref(self.handle, obj)
    }

    pub fn upgrade_weak_ref(&self, weak: ObjRef) -> RuntimeResult<Option<ObjRef>> {
        self.runtime.upgrade_weak_ref(self.handle, weak)
    }

    pub fn new_local_ref(&self, obj: ObjRef) -> RuntimeResult<ObjRef> {
        self.runtime.new_local_ref(self.handle, obj)
    }

    pub fn delete_local_ref(&self, obj: ObjRef) -> RuntimeResult<()> {
        self.runtime.delete_local_ref(self.handle, obj)
    }

    pub fn new_object(&self, class: ObjRef, ctor: MethodId) -> RuntimeResult<ObjRef> {
        self.runtime.new_object(self.handle, class, ctor)
    }

    pub fn new_byte_array(&self, bytes: &[u8]) -> RuntimeResult<ObjRef> {
        self.runtime.new_byte_array(self.handle, bytes)
    }

    pub fn new_direct_buffer(&self, view: NativeView) -> RuntimeResult<ObjRef> {
        self.runtime.new_direct_buffer(self.handle, view)
    }

    pub fn new_object_array(&self, element_class: ObjRef, elements: &[ObjRef]) -> RuntimeResult<ObjRef> {
        self.runtime.new_object_array(self.handle, element_class, elements)
    }

    pub fn read_byte_array(&self, array: ObjRef) -> RuntimeResult<Vec<u8>> {
        self.runtime.read_byte_array(self.handle, array)
    }

    pub fn read_direct_buffer(&self, buffer: ObjRef) -> RuntimeResult<Vec<u8>> {
        self.runtime.read_direct_buffer(self.handle, buffer)
    }

    pub fn read_string(&self, string: ObjRef) -> RuntimeResult<String> {
        self.runtime.read_string(self.handle, string)
    }

    pub fn get_boolean_field(&self, obj: ObjRef, field: FieldId) -> RuntimeResult<bool> {
        self.runtime.get_boolean_field(self.handle, obj, field)
    }

    pub fn call_method(&self, target: ObjRef, method: MethodId, args: &[Value]) -> RuntimeResult<Value> {
        self.runtime.call_method(self.handle, target, method, args)
    }

    pub fn exception_occurred(&self) -> RuntimeResult<Option<ObjRef>> {
        self.runtime.exception_occurred(self.handle)
    }

    pub fn exception_clear(&self) -> RuntimeResult<()> {
        self.runtime.exception_clear(self.handle)
    }

    pub fn throw(&self, throwable: ObjRef) -> RuntimeResult<()> {
        self.runtime.throw(self.handle, throwable)
    }

    pub fn throw_new(&self, class_name: &str, message: &str) -> RuntimeResult<()> {
        self.runtime.throw_new(self.handle, class_name, message)
    }

    pub fn describe_exception(&self, throwable: ObjRef) -> RuntimeResult<String> {
        self.runtime.describe_exception(self.handle, throwable)
    }

    /// Raise the runtime's generic fatal error type with `message`.
    pub fn throw_error(&self, message: &str) -> RuntimeResult<()> {
        self.throw_new(names::ERROR, message)
    }

    /// Log and clear any pending exception. Returns its description.
    pub fn catch_and_log(&self) -> Option<String> {
        let throwable = match self.exception_occurred() {
            Ok(Some(t)) => t,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(error = %e, "failed to query pending exception");
                return None;
            }
        };
        let description = self
            .describe_exception(throwable)
            .unwrap_or_else(|e| format!("<undescribable: {e}>"));
        tracing::warn!(exception = %description, "clearing pending managed exception");
        if let Err(e) = self.exception_clear() {
            tracing::warn!(error = %e, "failed to clear pending exception");
        }
        if let Err(e) = self.delete_local_ref(throwable) {
            tracing::warn!(error = %e, "failed to release exception reference");
        }
        Some(description)
    }
}

impl fmt::Debug for Env<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Env").field("handle", self.handle).finish()
    }
}
