use std::collections::{HashMap, HashSet};
use std::thread::ThreadId;

use crate::error::{RuntimeError, RuntimeResult};
use crate::handle::{ExecutionHandle, NativeView, ObjRef};
use crate::names;

use super::class::MethodImpl;

// ---------------------------------------------------------------------------
// Heap objects and references
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RefKind {
    /// Created by native code on the given thread.
    Local(ThreadId),
    /// Created by managed code during a call; freed when the call returns.
    Frame(ThreadId),
    Global,
    Weak,
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct RefEntry {
    pub object: u64,
    pub kind: RefKind,
}

pub(crate) enum HeapObject {
    Class(usize),
    Instance {
        class: usize,
        fields: HashMap<u32, bool>,
    },
    Str(String),
    ByteArray(Vec<u8>),
    DirectBuffer {
        view: NativeView,
        origin: u64,
        revoked: bool,
    },
    ObjectArray {
        elements: Vec<u64>,
    },
    Throwable {
        class: usize,
        message: String,
    },
}

impl HeapObject {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Class(_) => "class",
            Self::Instance { .. } => "instance",
            Self::Str(_) => "string",
            Self::ByteArray(_) => "byte array",
            Self::DirectBuffer { .. } => "direct buffer",
            Self::ObjectArray { .. } => "object array",
            Self::Throwable { .. } => "throwable",
        }
    }
}

// ---------------------------------------------------------------------------
// Class table
// ---------------------------------------------------------------------------

pub(crate) struct ClassEntry {
    pub name: String,
    pub parent: Option<usize>,
    pub object: u64,
}

pub(crate) struct MethodEntry {
    pub class: usize,
    pub name: String,
    pub signature: String,
    pub body: Option<MethodImpl>,
}

pub(crate) struct FieldEntry {
    pub class: usize,
    pub name: String,
    pub signature: String,
    pub default: bool,
}

// ---------------------------------------------------------------------------
// Threads
// ---------------------------------------------------------------------------

#[derive(Default)]
pub(crate) struct ThreadState {
    /// Attachment token while attached.
    pub token: Option<u64>,
    pub pending: Option<u64>,
    pub attaches: u64,
    pub detaches: u64,
}

// ---------------------------------------------------------------------------
// SimState
// ---------------------------------------------------------------------------

pub(crate) struct SimState {
    pub classes: Vec<ClassEntry>,
    pub class_index: HashMap<String, usize>,
    pub methods: Vec<MethodEntry>,
    pub fields: Vec<FieldEntry>,
    pub objects: HashMap<u64, HeapObject>,
    next_object: u64,
    pub refs: HashMap<u64, RefEntry>,
    next_ref: u64,
    pub threads: HashMap<ThreadId, ThreadState>,
    pub next_token: u64,
    pub call_counts: HashMap<String, u64>,
    pub refuse_attach: Option<String>,
    pub version_supported: bool,
    pub total_attaches: u64,
    pub total_detaches: u64,
    pub reclaimed_on_detach: u64,
}

impl SimState {
    pub fn new() -> Self {
        Self {
            classes: Vec::new(),
            class_index: HashMap::new(),
            methods: Vec::new(),
            fields: Vec::new(),
            objects: HashMap::new(),
            next_object: 1,
            refs: HashMap::new(),
            next_ref: 1,
            threads: HashMap::new(),
            next_token: 1,
            call_counts: HashMap::new(),
            refuse_attach: None,
            version_supported: true,
            total_attaches: 0,
            total_detaches: 0,
            reclaimed_on_detach: 0,
        }
    }

    pub fn alloc(&mut self, object: HeapObject) -> u64 {
        let id = self.next_object;
        self.next_object += 1;
        self.objects.insert(id, object);
        id
    }

    pub fn new_ref(&mut self, object: u64, kind: RefKind) -> ObjRef {
        let raw = self.next_ref;
        self.next_ref += 1;
        self.refs.insert(raw, RefEntry { object, kind });
        // `next_ref` starts at 1 and only grows.
        ObjRef::from_raw(raw).unwrap_or_else(|| unreachable!("reference ids start at 1"))
    }

    /// Validate that `env` is the live handle of the calling thread.
    pub fn check_env(&self, env: &ExecutionHandle) -> RuntimeResult<()> {
        if env.thread() != std::thread::current().id() {
            return Err(RuntimeError::InvalidHandle);
        }
        match self.threads.get(&env.thread()).and_then(|t| t.token) {
            Some(token) if token == env.token() => Ok(()),
            _ => Err(RuntimeError::InvalidHandle),
        }
    }

    pub fn thread_mut(&mut self, thread: ThreadId) -> &mut ThreadState {
        self.threads.entry(thread).or_default()
    }

    pub fn ref_entry(&self, r: ObjRef) -> RuntimeResult<RefEntry> {
        self.refs
            .get(&r.into_raw())
            .copied()
            .ok_or(RuntimeError::InvalidReference(r))
    }

    /// Object id behind `r`, as seen from `thread`.
    pub fn resolve(&self, thread: ThreadId, r: ObjRef) -> RuntimeResult<u64> {
        let entry = self.ref_entry(r)?;
        match entry.kind {
            RefKind::Local(owner) | RefKind::Frame(owner) if owner != thread => {
                Err(RuntimeError::InvalidReference(r))
            }
            RefKind::Weak if !self.objects.contains_key(&entry.object) => {
                Err(RuntimeError::NullReference)
            }
            _ => Ok(entry.object),
        }
    }

    pub fn object(&self, id: u64) -> RuntimeResult<&HeapObject> {
        self.objects.get(&id).ok_or(RuntimeError::NullReference)
    }

    pub fn object_mut(&mut self, id: u64) -> RuntimeResult<&mut HeapObject> {
        self.objects.get_mut(&id).ok_or(RuntimeError::NullReference)
    }

    pub fn class_named(&self, name: &str) -> RuntimeResult<usize> {
        self.class_index
            .get(name)
            .copied()
            .ok_or_else(|| RuntimeError::ClassNotFound(name.to_string()))
    }

    /// Class index behind a reference to a class object.
    pub fn class_of_ref(&self, thread: ThreadId, class: ObjRef) -> RuntimeResult<usize> {
        let id = self.resolve(thread, class)?;
        match self.object(id)? {
            HeapObject::Class(index) => Ok(*index),
            other => Err(RuntimeError::WrongKind {
                expected: "class",
                found: other.kind_name(),
            }),
        }
    }

    /// Runtime type of an object, used for dispatch.
    pub fn runtime_class(&self, id: u64) -> Option<usize> {
        match self.objects.get(&id)? {
            HeapObject::Instance { class, .. } | HeapObject::Throwable { class, .. } => Some(*class),
            HeapObject::Str(_) => self.class_index.get(names::STRING).copied(),
            HeapObject::ByteArray(_) => self.class_index.get(names::BYTE_ARRAY).copied(),
            HeapObject::DirectBuffer { .. } => self.class_index.get(names::BYTE_BUFFER).copied(),
            HeapObject::Class(_) | HeapObject::ObjectArray { .. } => {
                self.class_index.get(names::OBJECT).copied()
            }
        }
    }

    pub fn is_subclass(&self, class: usize, ancestor: usize) -> bool {
        let mut current = Some(class);
        while let Some(c) = current {
            if c == ancestor {
                return true;
            }
            current = self.classes[c].parent;
        }
        false
    }

    /// Method declared on `class` or an ancestor, abstract or not.
    pub fn find_method(&self, class: usize, name: &str, signature: &str) -> Option<usize> {
        let mut current = Some(class);
        while let Some(c) = current {
            let found = self
                .methods
                .iter()
                .position(|m| m.class == c && m.name == name && m.signature == signature);
            if found.is_some() {
                return found;
            }
            current = self.classes[c].parent;
        }
        None
    }

    /// Most derived implementation of `name`/`signature` for a receiver of `class`.
    pub fn find_body(&self, class: usize, name: &str, signature: &str) -> Option<MethodImpl> {
        let mut current = Some(class);
        while let Some(c) = current {
            let body = self
                .methods
                .iter()
                .find(|m| m.class == c && m.name == name && m.signature == signature)
                .and_then(|m| m.body.clone());
            if body.is_some() {
                return body;
            }
            current = self.classes[c].parent;
        }
        None
    }

    pub fn find_field(&self, class: usize, name: &str) -> Option<usize> {
        let mut current = Some(class);
        while let Some(c) = current {
            let found = self.fields.iter().position(|f| f.class == c && f.name == name);
            if found.is_some() {
                return found;
            }
            current = self.classes[c].parent;
        }
        None
    }

    /// Remove a reference, revoking any direct buffer it created.
    pub fn drop_ref(&mut self, raw: u64) -> Option<RefEntry> {
        let entry = self.refs.remove(&raw)?;
        if let Some(HeapObject::DirectBuffer { origin, revoked, .. }) = self.objects.get_mut(&entry.object) {
            if *origin == raw {
                *revoked = true;
            }
        }
        Some(entry)
    }

    /// Drop every local reference owned by `thread`. Returns how many.
    pub fn release_thread_locals(&mut self, thread: ThreadId) -> usize {
        let owned: Vec<u64> = self
            .refs
            .iter()
            .filter(|(_, e)| matches!(e.kind, RefKind::Local(t) | RefKind::Frame(t) if t == thread))
            .map(|(raw, _)| *raw)
            .collect();
        for raw in &owned {
            self.drop_ref(*raw);
        }
        owned.len()
    }

    pub fn count_refs(&self, pred: impl Fn(&RefKind) -> bool) -> usize {
        self.refs.values().filter(|e| pred(&e.kind)).count()
    }

    // -----------------------------------------------------------------------
    // Collection
    // -----------------------------------------------------------------------

    /// Mark and sweep. Roots are strong references, pending exceptions and
    /// class objects. Returns the number of objects freed.
    pub fn collect(&mut self) -> usize {
        let mut marked: HashSet<u64> = HashSet::new();
        let mut stack: Vec<u64> = Vec::new();

        stack.extend(
            self.refs
                .values()
                .filter(|e| !matches!(e.kind, RefKind::Weak))
                .map(|e| e.object),
        );
        stack.extend(self.threads.values().filter_map(|t| t.pending));
        stack.extend(self.classes.iter().map(|c| c.object));

        while let Some(id) = stack.pop() {
            if !marked.insert(id) {
                continue;
            }
            if let Some(HeapObject::ObjectArray { elements }) = self.objects.get(&id) {
                stack.extend(elements.iter().copied());
            }
        }

        let before = self.objects.len();
        self.objects.retain(|id, _| marked.contains(id));
        before - self.objects.len()
    }
}

/// Number of parameters in a method descriptor such as `([B[[BZ)V`.
pub(crate) fn descriptor_arity(signature: &str) -> usize {
    let params = signature
        .strip_prefix('(')
        .and_then(|s| s.split(')').next())
        .unwrap_or("");
    let mut count = 0;
    let mut chars = params.chars();
    while let Some(c) = chars.next() {
        match c {
            '[' => continue,
            'L' => {
                for inner in chars.by_ref() {
                    if inner == ';' {
                        break;
                    }
                }
                count += 1;
            }
            _ => count += 1,
        }
    }
    count
}

/// Return-type character of a descriptor (`V`, `Z`, `L`, `[` ...).
pub(crate) fn descriptor_return(signature: &str) -> char {
    signature
        .rsplit(')')
        .next()
        .and_then(|r| r.chars().next())
        .unwrap_or('V')
}
