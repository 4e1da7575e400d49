use mbridge_hooks::{MethodBinding, ReturnEnvelopeBinding};
use mbridge_runtime::{Env, NativeView, ObjRef, RuntimeError, RuntimeResult, Value};
use tracing::{debug, trace, warn};

use crate::error::{ManagedError, MarshalError, MarshalResult};
use crate::scope::LocalScope;

// ---------------------------------------------------------------------------
// Call description
// ---------------------------------------------------------------------------

/// How native byte ranges are handed to managed code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferMode {
    /// Each argument is copied into a fresh managed byte array.
    Copy,
    /// Each argument is exposed in place as a direct buffer, valid only for
    /// the duration of the call.
    View,
}

/// What to do with a managed exception after it has been captured.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExceptionRouting {
    /// Leave it pending so the managed caller further up the stack sees it.
    Rethrow,
    /// Log and clear it; there is no managed caller to receive it.
    LogAndClear,
}

/// One positional argument of a callback.
#[derive(Clone, Copy, Debug)]
pub enum Argument<'a> {
    /// A byte sequence, or managed null.
    Bytes(Option<&'a [u8]>),
    /// An array of byte sequences.
    Operands(&'a [&'a [u8]]),
}

/// Everything the marshaller needs to know about the method being called.
#[derive(Clone, Copy, Debug)]
pub struct CallSpec<'b> {
    pub method: &'b MethodBinding,
    /// When present, a fresh envelope is passed as the last argument and its
    /// reference flag is read after the call.
    pub envelope: Option<&'b ReturnEnvelopeBinding>,
    /// Element type for operand arrays (byte array in copy mode, byte
    /// buffer in view mode).
    pub operand_class: Option<ObjRef>,
    pub mode: BufferMode,
    pub exceptions: ExceptionRouting,
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// Call a byte-returning callback and copy its result into native memory.
///
/// If the envelope says the result is a reference to an argument and the
/// arguments are views, the bytes are read straight from the view;
/// otherwise the result is a managed byte array and is copied. Every
/// transient reference is released before this returns.
pub fn invoke(env: &Env<'_>, target: ObjRef, spec: &CallSpec<'_>, args: &[Argument<'_>]) -> MarshalResult<Vec<u8>> {
    let mut scope = LocalScope::new(*env);
    let (result, envelope) = call(env, &mut scope, target, spec, args)?;

    let result = match result {
        Value::Object(Some(r)) => scope.push(r),
        Value::Object(None) => {
            trace!(method = %spec.method, "callback returned null");
            return Err(MarshalError::NullResult {
                method: spec.method.to_string(),
            });
        }
        other => return Err(result_kind(spec, "object", format!("{other:?}"))),
    };

    let is_reference = match (spec.envelope, envelope) {
        (Some(binding), Some(obj)) => binding.is_reference(env, obj)?,
        _ => false,
    };
    let bytes = if is_reference && spec.mode == BufferMode::View {
        env.read_direct_buffer(result)
    } else {
        env.read_byte_array(result)
    };
    let bytes = bytes.map_err(|e| match e {
        RuntimeError::WrongKind { found, .. } => result_kind(spec, "byte sequence", found.to_string()),
        other => MarshalError::Runtime(other),
    })?;
    trace!(method = %spec.method, is_reference, len = bytes.len(), "callback result decoded");
    Ok(bytes)
}

/// Call a boolean-returning callback.
pub fn invoke_predicate(
    env: &Env<'_>,
    target: ObjRef,
    spec: &CallSpec<'_>,
    args: &[Argument<'_>],
) -> MarshalResult<bool> {
    let mut scope = LocalScope::new(*env);
    let (result, _) = call(env, &mut scope, target, spec, args)?;
    result
        .as_bool()
        .ok_or_else(|| result_kind(spec, "boolean", format!("{result:?}")))
}

// ---------------------------------------------------------------------------
// Internals
// ---------------------------------------------------------------------------

fn call(
    env: &Env<'_>,
    scope: &mut LocalScope<'_>,
    target: ObjRef,
    spec: &CallSpec<'_>,
    args: &[Argument<'_>],
) -> MarshalResult<(Value, Option<ObjRef>)> {
    let mut values = Vec::with_capacity(args.len() + 1);
    for arg in args {
        let value = match arg {
            Argument::Bytes(None) => Value::null(),
            Argument::Bytes(Some(bytes)) => Value::object(scope.push(transient(env, spec.mode, bytes)?)),
            Argument::Operands(list) => {
                let class = spec.operand_class.ok_or(MarshalError::MissingOperandClass)?;
                let mut elements = Vec::with_capacity(list.len());
                for bytes in list.iter() {
                    elements.push(scope.push(transient(env, spec.mode, bytes)?));
                }
                Value::object(scope.push(env.new_object_array(class, &elements)?))
            }
        };
        values.push(value);
    }

    let envelope = match spec.envelope {
        Some(binding) => {
            let obj = scope.push(binding.instantiate(env)?);
            values.push(Value::object(obj));
            Some(obj)
        }
        None => None,
    };

    let result = env.call_method(target, spec.method.id, &values)?;
    if let Some(throwable) = env.exception_occurred()? {
        return Err(raised(env, scope, spec, throwable).into());
    }
    Ok((result, envelope))
}

fn transient(env: &Env<'_>, mode: BufferMode, bytes: &[u8]) -> RuntimeResult<ObjRef> {
    match mode {
        BufferMode::Copy => env.new_byte_array(bytes),
        // SAFETY: the buffer's only local reference is owned by the call's
        // LocalScope, which is dropped before `bytes` goes out of scope.
        BufferMode::View => env.new_direct_buffer(unsafe { NativeView::new(bytes) }),
    }
}

/// Capture, clear, release, then route the exception.
fn raised(env: &Env<'_>, scope: &mut LocalScope<'_>, spec: &CallSpec<'_>, throwable: ObjRef) -> ManagedError {
    let description = env
        .describe_exception(throwable)
        .unwrap_or_else(|e| format!("<undescribable: {e}>"));
    if let Err(e) = env.exception_clear() {
        warn!(method = %spec.method, error = %e, "failed to clear managed exception");
    }
    scope.release_all();

    let rethrown = match spec.exceptions {
        ExceptionRouting::Rethrow => match env.throw(throwable) {
            Ok(()) => true,
            Err(e) => {
                warn!(method = %spec.method, error = %e, "failed to re-raise managed exception");
                false
            }
        },
        ExceptionRouting::LogAndClear => {
            warn!(method = %spec.method, exception = %description, "managed exception on worker thread cleared");
            false
        }
    };
    if let Err(e) = env.delete_local_ref(throwable) {
        warn!(method = %spec.method, error = %e, "failed to release exception reference");
    }
    debug!(method = %spec.method, exception = %description, rethrown, "managed exception captured");

    ManagedError {
        method: spec.method.to_string(),
        description,
        rethrown,
    }
}

fn result_kind(spec: &CallSpec<'_>, expected: &'static str, found: String) -> MarshalError {
    MarshalError::ResultKind {
        method: spec.method.to_string(),
        expected,
        found,
    }
}
