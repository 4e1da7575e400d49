//! In-process reference runtime.
//!
//! `SimRuntime` implements [`ManagedRuntime`] without a virtual machine:
//! classes are declared with [`ClassDef`], methods are Rust closures, and
//! objects live in a heap owned by the runtime. It keeps the bookkeeping a
//! real runtime hides (attach counts per thread, live references by kind,
//! invocation counts per method name) so callers can assert on it.

mod class;
mod heap;

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::thread::ThreadId;

use tracing::{debug, trace};

use crate::env::Env;
use crate::error::{RuntimeError, RuntimeResult};
use crate::handle::{ExecutionHandle, FieldId, MethodId, NativeView, ObjRef, Value};
use crate::names;
use crate::traits::ManagedRuntime;

pub use class::{ClassDef, ManagedCall, MethodImpl, Raise};

use heap::{descriptor_arity, descriptor_return, ClassEntry, FieldEntry, HeapObject, MethodEntry, RefKind, SimState};

/// Interface version served by [`SimRuntime`].
pub const SIM_INTERFACE_VERSION: u32 = 0x000a_0000;

/// Managed runtime hosted in the current process.
pub struct SimRuntime {
    state: Mutex<SimState>,
}

impl SimRuntime {
    /// A runtime with the core types defined (object, string, throwables,
    /// byte arrays and byte buffers).
    pub fn new() -> Self {
        let runtime = Self {
            state: Mutex::new(SimState::new()),
        };
        let core = [
            (names::OBJECT, None),
            (names::STRING, Some(names::OBJECT)),
            (names::BYTE_ARRAY, Some(names::OBJECT)),
            (names::BYTE_BUFFER, Some(names::OBJECT)),
            (names::THROWABLE, Some(names::OBJECT)),
            (names::ERROR, Some(names::THROWABLE)),
            (names::RUNTIME_EXCEPTION, Some(names::THROWABLE)),
            (names::NULL_POINTER_EXCEPTION, Some(names::RUNTIME_EXCEPTION)),
        ];
        {
            let mut state = runtime.lock();
            for (name, parent) in core {
                let parent = parent.and_then(|p| state.class_index.get(p).copied());
                insert_class(&mut state, name, parent);
            }
        }
        runtime
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().expect("sim runtime lock poisoned")
    }

    /// Declare a managed type.
    pub fn define_class(&self, def: ClassDef) -> RuntimeResult<()> {
        let mut state = self.lock();
        if state.class_index.contains_key(&def.name) {
            return Err(RuntimeError::DuplicateClass(def.name));
        }
        let parent = state.class_named(def.parent.as_deref().unwrap_or(names::OBJECT))?;
        let index = insert_class(&mut state, &def.name, Some(parent));
        for (name, signature, body) in def.methods {
            state.methods.push(MethodEntry {
                class: index,
                name,
                signature,
                body,
            });
        }
        for (name, default) in def.fields {
            state.fields.push(FieldEntry {
                class: index,
                name,
                signature: "Z".to_string(),
                default,
            });
        }
        debug!(class = %def.name, "class defined");
        Ok(())
    }

    /// Instantiate `class_name` through its no-argument constructor and
    /// return a local reference.
    pub fn instantiate(&self, env: &Env<'_>, class_name: &str) -> RuntimeResult<ObjRef> {
        let class = env.find_class(class_name)?;
        let result = env
            .method_id(class, names::CONSTRUCTOR, names::DEFAULT_CONSTRUCTOR_SIG)
            .and_then(|ctor| env.new_object(class, ctor));
        env.delete_local_ref(class)?;
        result
    }

    // -- switches ----------------------------------------------------------

    /// Make every subsequent attach fail with `reason`, or succeed again with `None`.
    pub fn set_refuse_attach(&self, reason: Option<&str>) {
        self.lock().refuse_attach = reason.map(str::to_string);
    }

    /// Toggle whether `current_env` accepts the interface version.
    pub fn set_version_supported(&self, supported: bool) {
        self.lock().version_supported = supported;
    }

    // -- accounting --------------------------------------------------------

    /// Number of times `thread` was attached by an explicit attach call.
    pub fn attach_count(&self, thread: ThreadId) -> u64 {
        self.lock().threads.get(&thread).map_or(0, |t| t.attaches)
    }

    pub fn detach_count(&self, thread: ThreadId) -> u64 {
        self.lock().threads.get(&thread).map_or(0, |t| t.detaches)
    }

    pub fn total_attaches(&self) -> u64 {
        self.lock().total_attaches
    }

    pub fn total_detaches(&self) -> u64 {
        self.lock().total_detaches
    }

    pub fn is_attached(&self, thread: ThreadId) -> bool {
        self.lock().threads.get(&thread).is_some_and(|t| t.token.is_some())
    }

    /// Local references reclaimed because their thread detached while
    /// still holding them.
    pub fn reclaimed_on_detach(&self) -> u64 {
        self.lock().reclaimed_on_detach
    }

    pub fn live_local_refs(&self) -> usize {
        self.lock()
            .count_refs(|k| matches!(k, RefKind::Local(_) | RefKind::Frame(_)))
    }

    pub fn live_local_refs_on(&self, thread: ThreadId) -> usize {
        self.lock()
            .count_refs(|k| matches!(k, RefKind::Local(t) | RefKind::Frame(t) if *t == thread))
    }

    pub fn live_global_refs(&self) -> usize {
        self.lock().count_refs(|k| matches!(k, RefKind::Global))
    }

    pub fn live_weak_refs(&self) -> usize {
        self.lock().count_refs(|k| matches!(k, RefKind::Weak))
    }

    /// Heap objects currently allocated, class objects included.
    pub fn live_objects(&self) -> usize {
        self.lock().objects.len()
    }

    /// Times a method named `name` has been invoked, across all classes.
    pub fn call_count(&self, name: &str) -> u64 {
        self.lock().call_counts.get(name).copied().unwrap_or(0)
    }

    /// Run the collector. Returns the number of objects freed.
    pub fn collect_garbage(&self) -> usize {
        let freed = self.lock().collect();
        debug!(freed, "garbage collected");
        freed
    }

    /// Description of the exception pending on `thread`, if any.
    pub fn pending_exception(&self, thread: ThreadId) -> Option<String> {
        let state = self.lock();
        let id = state.threads.get(&thread)?.pending?;
        describe(&state, id).ok()
    }

    /// Clear and describe the exception pending on `thread`.
    pub fn take_pending_exception(&self, thread: ThreadId) -> Option<String> {
        let mut state = self.lock();
        let id = state.threads.get_mut(&thread)?.pending.take()?;
        describe(&state, id).ok()
    }

    fn local(&self, state: &mut SimState, env: &ExecutionHandle, object: u64) -> ObjRef {
        state.new_ref(object, RefKind::Local(env.thread()))
    }
}

impl Default for SimRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SimRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("SimRuntime")
            .field("classes", &state.classes.len())
            .field("objects", &state.objects.len())
            .field("refs", &state.refs.len())
            .finish()
    }
}

fn insert_class(state: &mut SimState, name: &str, parent: Option<usize>) -> usize {
    let index = state.classes.len();
    let object = state.alloc(HeapObject::Class(index));
    state.classes.push(ClassEntry {
        name: name.to_string(),
        parent,
        object,
    });
    state.class_index.insert(name.to_string(), index);
    state.methods.push(MethodEntry {
        class: index,
        name: names::CONSTRUCTOR.to_string(),
        signature: names::DEFAULT_CONSTRUCTOR_SIG.to_string(),
        body: None,
    });
    index
}

fn describe(state: &SimState, id: u64) -> RuntimeResult<String> {
    match state.object(id)? {
        HeapObject::Throwable { class, message } => Ok(format!(
            "{}: {}",
            state.classes[*class].name.replace('/', "."),
            message
        )),
        other => Err(RuntimeError::WrongKind {
            expected: "throwable",
            found: other.kind_name(),
        }),
    }
}

fn throwable_class(state: &SimState, class: usize) -> bool {
    state
        .class_index
        .get(names::THROWABLE)
        .is_some_and(|t| state.is_subclass(class, *t))
}

impl ManagedRuntime for SimRuntime {
    fn interface_version(&self) -> u32 {
        SIM_INTERFACE_VERSION
    }

    fn current_env(&self) -> RuntimeResult<Option<ExecutionHandle>> {
        let thread = std::thread::current().id();
        let state = self.lock();
        if !state.version_supported {
            return Err(RuntimeError::VersionUnsupported {
                requested: SIM_INTERFACE_VERSION,
            });
        }
        Ok(state
            .threads
            .get(&thread)
            .and_then(|t| t.token)
            .map(|token| ExecutionHandle::new(thread, token)))
    }

    fn attach_current_thread(&self) -> RuntimeResult<ExecutionHandle> {
        let thread = std::thread::current().id();
        let mut state = self.lock();
        if let Some(reason) = &state.refuse_attach {
            return Err(RuntimeError::AttachRefused(reason.clone()));
        }
        if let Some(token) = state.threads.get(&thread).and_then(|t| t.token) {
            return Ok(ExecutionHandle::new(thread, token));
        }
        let token = state.next_token;
        state.next_token += 1;
        state.total_attaches += 1;
        let entry = state.thread_mut(thread);
        entry.token = Some(token);
        entry.attaches += 1;
        trace!(?thread, token, "thread attached");
        Ok(ExecutionHandle::new(thread, token))
    }

    fn detach_current_thread(&self, env: ExecutionHandle) -> RuntimeResult<()> {
        // Runs from thread-exit destructors, where the current thread can no
        // longer be queried; the handle names its own thread.
        let mut state = self.lock();
        let thread = env.thread();
        if state.threads.get(&thread).and_then(|t| t.token) != Some(env.token()) {
            return Err(RuntimeError::InvalidHandle);
        }
        let reclaimed = state.release_thread_locals(thread);
        state.reclaimed_on_detach += reclaimed as u64;
        state.total_detaches += 1;
        let entry = state.thread_mut(thread);
        entry.token = None;
        entry.pending = None;
        entry.detaches += 1;
        trace!(?thread, reclaimed, "thread detached");
        Ok(())
    }

    fn find_class(&self, env: &ExecutionHandle, name: &str) -> RuntimeResult<ObjRef> {
        let mut state = self.lock();
        state.check_env(env)?;
        let class = state.class_named(name)?;
        let object = state.classes[class].object;
        Ok(self.local(&mut state, env, object))
    }

    fn method_id(
        &self,
        env: &ExecutionHandle,
        class: ObjRef,
        name: &str,
        signature: &str,
    ) -> RuntimeResult<MethodId> {
        let state = self.lock();
        state.check_env(env)?;
        let class = state.class_of_ref(env.thread(), class)?;
        state
            .find_method(class, name, signature)
            .map(|index| MethodId(index as u32))
            .ok_or_else(|| RuntimeError::MethodNotFound {
                class: state.classes[class].name.clone(),
                name: name.to_string(),
                signature: signature.to_string(),
            })
    }

    fn field_id(
        &self,
        env: &ExecutionHandle,
        class: ObjRef,
        name: &str,
        signature: &str,
    ) -> RuntimeResult<FieldId> {
        let state = self.lock();
        state.check_env(env)?;
        let class = state.class_of_ref(env.thread(), class)?;
        state
            .find_field(class, name)
            .filter(|index| state.fields[*index].signature == signature)
            .map(|index| FieldId(index as u32))
            .ok_or_else(|| RuntimeError::FieldNotFound {
                class: state.classes[class].name.clone(),
                name: name.to_string(),
                signature: signature.to_string(),
            })
    }

    fn new_global_ref(&self, env: &ExecutionHandle, obj: ObjRef) -> RuntimeResult<ObjRef> {
        let mut state = self.lock();
        state.check_env(env)?;
        let id = state.resolve(env.thread(), obj)?;
        Ok(state.new_ref(id, RefKind::Global))
    }

    fn delete_global_ref(&self, env: &ExecutionHandle, obj: ObjRef) -> RuntimeResult<()> {
        let mut state = self.lock();
        state.check_env(env)?;
        match state.ref_entry(obj)?.kind {
            RefKind::Global => {
                state.drop_ref(obj.into_raw());
                Ok(())
            }
            _ => Err(RuntimeError::InvalidReference(obj)),
        }
    }

    fn new_weak_ref(&self, env: &ExecutionHandle, obj: ObjRef) -> RuntimeResult<ObjRef> {
        let mut state = self.lock();
        state.check_env(env)?;
        let id = state.resolve(env.thread(), obj)?;
        Ok(state.new_ref(id, RefKind::Weak))
    }

    fn delete_weak_ref(&self, env: &ExecutionHandle, obj: ObjRef) -> RuntimeResult<()> {
        let mut state = self.lock();
        state.check_env(env)?;
        match state.ref_entry(obj)?.kind {
            RefKind::Weak => {
                state.drop_ref(obj.into_raw());
                Ok(())
            }
            _ => Err(RuntimeError::InvalidReference(obj)),
        }
    }

    fn upgrade_weak_ref(&self, env: &ExecutionHandle, weak: ObjRef) -> RuntimeResult<Option<ObjRef>> {
        let mut state = self.lock();
        state.check_env(env)?;
        let entry = state.ref_entry(weak)?;
        if !matches!(entry.kind, RefKind::Weak) {
            return Err(RuntimeError::InvalidReference(weak));
        }
        if !state.objects.contains_key(&entry.object) {
            return Ok(None);
        }
        Ok(Some(self.local(&mut state, env, entry.object)))
    }

    fn new_local_ref(&self, env: &ExecutionHandle, obj: ObjRef) -> RuntimeResult<ObjRef> {
        let mut state = self.lock();
        state.check_env(env)?;
        let id = state.resolve(env.thread(), obj)?;
        Ok(self.local(&mut state, env, id))
    }

    fn delete_local_ref(&self, env: &ExecutionHandle, obj: ObjRef) -> RuntimeResult<()> {
        let mut state = self.lock();
        state.check_env(env)?;
        match state.ref_entry(obj)?.kind {
            RefKind::Local(owner) if owner == env.thread() => {
                state.drop_ref(obj.into_raw());
                Ok(())
            }
            _ => Err(RuntimeError::InvalidReference(obj)),
        }
    }

    fn new_object(&self, env: &ExecutionHandle, class: ObjRef, ctor: MethodId) -> RuntimeResult<ObjRef> {
        let mut state = self.lock();
        state.check_env(env)?;
        let class = state.class_of_ref(env.thread(), class)?;
        let valid = state
            .methods
            .get(ctor.0 as usize)
            .is_some_and(|m| m.class == class && m.name == names::CONSTRUCTOR);
        if !valid {
            return Err(RuntimeError::MethodNotFound {
                class: state.classes[class].name.clone(),
                name: names::CONSTRUCTOR.to_string(),
                signature: names::DEFAULT_CONSTRUCTOR_SIG.to_string(),
            });
        }
        let id = state.alloc(HeapObject::Instance {
            class,
            fields: HashMap::new(),
        });
        Ok(self.local(&mut state, env, id))
    }

    fn new_byte_array(&self, env: &ExecutionHandle, bytes: &[u8]) -> RuntimeResult<ObjRef> {
        let mut state = self.lock();
        state.check_env(env)?;
        let id = state.alloc(HeapObject::ByteArray(bytes.to_vec()));
        Ok(self.local(&mut state, env, id))
    }

    fn new_direct_buffer(&self, env: &ExecutionHandle, view: NativeView) -> RuntimeResult<ObjRef> {
        let mut state = self.lock();
        state.check_env(env)?;
        // The origin is patched once the local reference exists.
        let id = state.alloc(HeapObject::DirectBuffer {
            view,
            origin: 0,
            revoked: false,
        });
        let r = self.local(&mut state, env, id);
        if let HeapObject::DirectBuffer { origin, .. } = state.object_mut(id)? {
            *origin = r.into_raw();
        }
        Ok(r)
    }

    fn new_object_array(
        &self,
        env: &ExecutionHandle,
        element_class: ObjRef,
        elements: &[ObjRef],
    ) -> RuntimeResult<ObjRef> {
        let mut state = self.lock();
        state.check_env(env)?;
        state.class_of_ref(env.thread(), element_class)?;
        let ids = elements
            .iter()
            .map(|e| state.resolve(env.thread(), *e))
            .collect::<RuntimeResult<Vec<_>>>()?;
        let id = state.alloc(HeapObject::ObjectArray { elements: ids });
        Ok(self.local(&mut state, env, id))
    }

    fn read_byte_array(&self, env: &ExecutionHandle, array: ObjRef) -> RuntimeResult<Vec<u8>> {
        let state = self.lock();
        state.check_env(env)?;
        let id = state.resolve(env.thread(), array)?;
        match state.object(id)? {
            HeapObject::ByteArray(bytes) => Ok(bytes.clone()),
            other => Err(RuntimeError::WrongKind {
                expected: "byte array",
                found: other.kind_name(),
            }),
        }
    }

    fn read_direct_buffer(&self, env: &ExecutionHandle, buffer: ObjRef) -> RuntimeResult<Vec<u8>> {
        let state = self.lock();
        state.check_env(env)?;
        let id = state.resolve(env.thread(), buffer)?;
        match state.object(id)? {
            HeapObject::DirectBuffer { revoked: true, .. } => Err(RuntimeError::RevokedView),
            // SAFETY: not revoked, so the creator still keeps the memory alive.
            HeapObject::DirectBuffer { view, .. } => Ok(unsafe { view.as_slice() }.to_vec()),
            other => Err(RuntimeError::WrongKind {
                expected: "direct buffer",
                found: other.kind_name(),
            }),
        }
    }

    fn read_string(&self, env: &ExecutionHandle, string: ObjRef) -> RuntimeResult<String> {
        let state = self.lock();
        state.check_env(env)?;
        let id = state.resolve(env.thread(), string)?;
        match state.object(id)? {
            HeapObject::Str(s) => Ok(s.clone()),
            other => Err(RuntimeError::WrongKind {
                expected: "string",
                found: other.kind_name(),
            }),
        }
    }

    fn get_boolean_field(&self, env: &ExecutionHandle, obj: ObjRef, field: FieldId) -> RuntimeResult<bool> {
        let state = self.lock();
        state.check_env(env)?;
        let id = state.resolve(env.thread(), obj)?;
        let entry = state.fields.get(field.0 as usize).ok_or(RuntimeError::NullReference)?;
        match state.object(id)? {
            HeapObject::Instance { class, fields } if state.is_subclass(*class, entry.class) => {
                Ok(fields.get(&field.0).copied().unwrap_or(entry.default))
            }
            other => Err(RuntimeError::WrongKind {
                expected: "instance declaring the field",
                found: other.kind_name(),
            }),
        }
    }

    fn call_method(
        &self,
        env: &ExecutionHandle,
        target: ObjRef,
        method: MethodId,
        args: &[Value],
    ) -> RuntimeResult<Value> {
        let thread = env.thread();
        let (body, signature) = {
            let mut state = self.lock();
            state.check_env(env)?;
            if state.threads.get(&thread).is_some_and(|t| t.pending.is_some()) {
                return Err(RuntimeError::ExceptionPending);
            }
            let target_id = state.resolve(thread, target)?;
            let entry = state.methods.get(method.0 as usize).ok_or_else(|| RuntimeError::MethodNotFound {
                class: "?".to_string(),
                name: format!("#{}", method.0),
                signature: String::new(),
            })?;
            let (name, signature) = (entry.name.clone(), entry.signature.clone());
            let expected = descriptor_arity(&signature);
            if expected != args.len() {
                return Err(RuntimeError::ArityMismatch {
                    method: name,
                    expected,
                    found: args.len(),
                });
            }
            for arg in args {
                if let Some(r) = arg.as_object() {
                    state.resolve(thread, r)?;
                }
            }
            let class = state.runtime_class(target_id).ok_or(RuntimeError::NullReference)?;
            let body = state
                .find_body(class, &name, &signature)
                .ok_or_else(|| RuntimeError::AbstractMethod(format!("{}.{name}", state.classes[class].name)))?;
            *state.call_counts.entry(name).or_default() += 1;
            (body, signature)
        };

        let mut call = ManagedCall::new(self, thread, target);
        let outcome = body(&mut call, args);
        let frame = call.into_frame();

        let mut state = self.lock();
        let result = match outcome {
            Ok(Value::Object(Some(r))) => state
                .resolve(thread, r)
                .map(|id| Value::object(state.new_ref(id, RefKind::Local(thread)))),
            Ok(value) => Ok(value),
            Err(raise) => {
                let class = state
                    .class_index
                    .get(&raise.class)
                    .copied()
                    .filter(|c| throwable_class(&state, *c))
                    .or_else(|| state.class_index.get(names::ERROR).copied());
                if let Some(class) = class {
                    let id = state.alloc(HeapObject::Throwable {
                        class,
                        message: raise.message,
                    });
                    state.thread_mut(thread).pending = Some(id);
                }
                Ok(match descriptor_return(&signature) {
                    'V' => Value::Void,
                    'Z' => Value::Bool(false),
                    _ => Value::null(),
                })
            }
        };
        for raw in frame {
            state.drop_ref(raw);
        }
        result
    }

    fn exception_occurred(&self, env: &ExecutionHandle) -> RuntimeResult<Option<ObjRef>> {
        let mut state = self.lock();
        state.check_env(env)?;
        let pending = state.threads.get(&env.thread()).and_then(|t| t.pending);
        Ok(pending.map(|id| self.local(&mut state, env, id)))
    }

    fn exception_clear(&self, env: &ExecutionHandle) -> RuntimeResult<()> {
        let mut state = self.lock();
        state.check_env(env)?;
        state.thread_mut(env.thread()).pending = None;
        Ok(())
    }

    fn throw(&self, env: &ExecutionHandle, throwable: ObjRef) -> RuntimeResult<()> {
        let mut state = self.lock();
        state.check_env(env)?;
        let id = state.resolve(env.thread(), throwable)?;
        if !matches!(state.object(id)?, HeapObject::Throwable { .. }) {
            return Err(RuntimeError::WrongKind {
                expected: "throwable",
                found: state.object(id)?.kind_name(),
            });
        }
        state.thread_mut(env.thread()).pending = Some(id);
        Ok(())
    }

    fn throw_new(&self, env: &ExecutionHandle, class_name: &str, message: &str) -> RuntimeResult<()> {
        let mut state = self.lock();
        state.check_env(env)?;
        let class = state.class_named(class_name)?;
        if !throwable_class(&state, class) {
            return Err(RuntimeError::WrongKind {
                expected: "throwable",
                found: "class",
            });
        }
        let id = state.alloc(HeapObject::Throwable {
            class,
            message: message.to_string(),
        });
        state.thread_mut(env.thread()).pending = Some(id);
        Ok(())
    }

    fn describe_exception(&self, env: &ExecutionHandle, throwable: ObjRef) -> RuntimeResult<String> {
        let state = self.lock();
        state.check_env(env)?;
        let id = state.resolve(env.thread(), throwable)?;
        describe(&state, id)
    }
}
