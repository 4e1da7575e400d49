//! Well-known managed type names and descriptors.
//!
//! Names use the slash-separated binary form and descriptors use the
//! `(args)ret` method descriptor grammar (`Z` boolean, `V` void, `[B` byte
//! array, `Lpkg/Type;` object).

pub const OBJECT: &str = "java/lang/Object";
pub const STRING: &str = "java/lang/String";
pub const THROWABLE: &str = "java/lang/Throwable";
pub const ERROR: &str = "java/lang/Error";
pub const RUNTIME_EXCEPTION: &str = "java/lang/RuntimeException";
pub const NULL_POINTER_EXCEPTION: &str = "java/lang/NullPointerException";
pub const BYTE_ARRAY: &str = "[B";
pub const BYTE_BUFFER: &str = "java/nio/ByteBuffer";

/// Name of every constructor.
pub const CONSTRUCTOR: &str = "<init>";
/// Descriptor of a no-argument constructor.
pub const DEFAULT_CONSTRUCTOR_SIG: &str = "()V";

/// Descriptor for a reference to `class` (`Lclass;`), or the name itself for
/// array types.
pub fn object_descriptor(class: &str) -> String {
    if class.starts_with('[') {
        class.to_string()
    } else {
        format!("L{class};")
    }
}
