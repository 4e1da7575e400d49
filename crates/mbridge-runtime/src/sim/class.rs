use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::thread::ThreadId;

use crate::error::RuntimeError;
use crate::handle::{ObjRef, Value};
use crate::names;

use super::heap::{HeapObject, RefKind};
use super::SimRuntime;

/// Body of a managed method hosted by [`SimRuntime`].
///
/// Receives the call frame and the arguments in declaration order. Objects
/// it allocates through the frame are released when the call returns;
/// returning one of them (or an argument, or `this`) hands a fresh local
/// reference back to the caller.
pub type MethodImpl = Arc<dyn Fn(&mut ManagedCall<'_>, &[Value]) -> Result<Value, Raise> + Send + Sync>;

// ---------------------------------------------------------------------------
// Raise
// ---------------------------------------------------------------------------

/// A managed exception thrown by a [`MethodImpl`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Raise {
    pub class: String,
    pub message: String,
}

impl Raise {
    pub fn new(class: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            message: message.into(),
        }
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::new(names::RUNTIME_EXCEPTION, message)
    }

    pub fn null_pointer(what: &str) -> Self {
        Self::new(names::NULL_POINTER_EXCEPTION, format!("{what} is null"))
    }
}

impl From<RuntimeError> for Raise {
    fn from(e: RuntimeError) -> Self {
        Self::new(names::ERROR, e.to_string())
    }
}

impl fmt::Display for Raise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.class.replace('/', "."), self.message)
    }
}

// ---------------------------------------------------------------------------
// ClassDef
// ---------------------------------------------------------------------------

/// Declaration of a managed type for [`SimRuntime::define_class`].
///
/// Every class gets a no-argument constructor. Fields are boolean.
pub struct ClassDef {
    pub(crate) name: String,
    pub(crate) parent: Option<String>,
    pub(crate) methods: Vec<(String, String, Option<MethodImpl>)>,
    pub(crate) fields: Vec<(String, bool)>,
}

impl ClassDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parent: None,
            methods: Vec::new(),
            fields: Vec::new(),
        }
    }

    /// Superclass; defaults to the root object type.
    pub fn extends(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn method<F>(mut self, name: impl Into<String>, signature: impl Into<String>, body: F) -> Self
    where
        F: Fn(&mut ManagedCall<'_>, &[Value]) -> Result<Value, Raise> + Send + Sync + 'static,
    {
        self.methods.push((name.into(), signature.into(), Some(Arc::new(body))));
        self
    }

    /// Declare a method without a body; subclasses provide it.
    pub fn abstract_method(mut self, name: impl Into<String>, signature: impl Into<String>) -> Self {
        self.methods.push((name.into(), signature.into(), None));
        self
    }

    pub fn bool_field(mut self, name: impl Into<String>, default: bool) -> Self {
        self.fields.push((name.into(), default));
        self
    }
}

impl fmt::Debug for ClassDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassDef")
            .field("name", &self.name)
            .field("parent", &self.parent)
            .field("methods", &self.methods.len())
            .field("fields", &self.fields)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// ManagedCall
// ---------------------------------------------------------------------------

/// The frame of a managed method running inside [`SimRuntime`].
pub struct ManagedCall<'r> {
    runtime: &'r SimRuntime,
    thread: ThreadId,
    this: ObjRef,
    frame: Vec<u64>,
}

impl<'r> ManagedCall<'r> {
    pub(crate) fn new(runtime: &'r SimRuntime, thread: ThreadId, this: ObjRef) -> Self {
        Self {
            runtime,
            thread,
            this,
            frame: Vec::new(),
        }
    }

    pub(crate) fn into_frame(self) -> Vec<u64> {
        self.frame
    }

    /// The receiver.
    pub fn this(&self) -> Value {
        Value::object(self.this)
    }

    /// Contents of a byte array or direct buffer argument; `None` for null.
    pub fn bytes(&self, value: &Value) -> Result<Option<Vec<u8>>, Raise> {
        let Some(r) = value.as_object() else {
            return Ok(None);
        };
        let state = self.runtime.lock();
        let id = state.resolve(self.thread, r)?;
        read_bytes(state.object(id)?).map(Some)
    }

    /// Whether the argument is a buffer over native memory.
    pub fn is_direct(&self, value: &Value) -> Result<bool, Raise> {
        let Some(r) = value.as_object() else {
            return Ok(false);
        };
        let state = self.runtime.lock();
        let id = state.resolve(self.thread, r)?;
        Ok(matches!(state.object(id)?, HeapObject::DirectBuffer { .. }))
    }

    /// Elements of an array of byte arrays.
    pub fn operands(&self, value: &Value) -> Result<Vec<Vec<u8>>, Raise> {
        let r = value.as_object().ok_or_else(|| Raise::null_pointer("operand list"))?;
        let state = self.runtime.lock();
        let id = state.resolve(self.thread, r)?;
        match state.object(id)? {
            HeapObject::ObjectArray { elements } => elements
                .iter()
                .map(|element| read_bytes(state.object(*element)?))
                .collect(),
            other => Err(RuntimeError::WrongKind {
                expected: "object array",
                found: other.kind_name(),
            }
            .into()),
        }
    }

    pub fn new_byte_array(&mut self, bytes: &[u8]) -> Value {
        self.alloc(HeapObject::ByteArray(bytes.to_vec()))
    }

    pub fn new_string(&mut self, s: &str) -> Value {
        self.alloc(HeapObject::Str(s.to_string()))
    }

    /// Instantiate `class_name` with its default field values.
    pub fn new_instance(&mut self, class_name: &str) -> Result<Value, Raise> {
        let class = self.runtime.lock().class_named(class_name)?;
        Ok(self.alloc(HeapObject::Instance {
            class,
            fields: HashMap::new(),
        }))
    }

    pub fn set_bool_field(&mut self, target: &Value, name: &str, value: bool) -> Result<(), Raise> {
        let r = target.as_object().ok_or_else(|| Raise::null_pointer(name))?;
        let mut state = self.runtime.lock();
        let id = state.resolve(self.thread, r)?;
        let class = state.runtime_class(id).ok_or(RuntimeError::NullReference)?;
        let field = state
            .find_field(class, name)
            .ok_or_else(|| RuntimeError::FieldNotFound {
                class: state.classes[class].name.clone(),
                name: name.to_string(),
                signature: "Z".to_string(),
            })?;
        match state.object_mut(id)? {
            HeapObject::Instance { fields, .. } => {
                fields.insert(field as u32, value);
                Ok(())
            }
            other => Err(RuntimeError::WrongKind {
                expected: "instance",
                found: other.kind_name(),
            }
            .into()),
        }
    }

    fn alloc(&mut self, object: HeapObject) -> Value {
        let mut state = self.runtime.lock();
        let id = state.alloc(object);
        let r = state.new_ref(id, RefKind::Frame(self.thread));
        self.frame.push(r.into_raw());
        Value::object(r)
    }
}

fn read_bytes(object: &HeapObject) -> Result<Vec<u8>, Raise> {
    match object {
        HeapObject::ByteArray(bytes) => Ok(bytes.clone()),
        HeapObject::DirectBuffer { revoked: true, .. } => Err(RuntimeError::RevokedView.into()),
        // SAFETY: the buffer is not revoked, so the native memory is alive.
        HeapObject::DirectBuffer { view, .. } => Ok(unsafe { view.as_slice() }.to_vec()),
        other => Err(RuntimeError::WrongKind {
            expected: "byte array",
            found: other.kind_name(),
        }
        .into()),
    }
}
