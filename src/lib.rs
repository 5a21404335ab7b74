//! Host reference bridge for an embedded script engine
//!
//! Host closures and objects are handed to scripts as engine values that
//! carry an opaque key. A process-wide, lock-guarded table maps each key to
//! its host reference until the engine collector finalizes the value.
//!
//! The usual entry point is [`VM::eval_with_suite`]: evaluate a source that
//! yields a function, then call it with an object whose methods dispatch to
//! host callables.

pub mod bridge;
pub mod compiler;
pub mod runtime;
pub mod stdlib;
pub mod vm;

pub use bridge::{
    Bridge, BridgeError, BridgedFunction, HostFn, HostRef, KeyAllocator, MallocKeys, MethodSuite,
    OpaqueKey, ReferenceTable, get_host_object, get_host_object_as, host_ref_key,
    push_host_function, push_host_object,
};
pub use runtime::{EngineError, ErrorKind, ExecStatus, HeapConfig};
pub use vm::VM;
pub use vm::value::{JsValue, NativeFn, Type, VARARGS};

#[cfg(test)]
mod tests;
