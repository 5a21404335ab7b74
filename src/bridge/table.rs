//! Table from opaque key to host reference
//!
//! Every operation takes the lock for exactly one map operation. No engine
//! call and no host destructor runs while it is held.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use log::trace;
use parking_lot::Mutex;

use crate::bridge::key::OpaqueKey;
use crate::vm::VM;

/// Host callable signature: reads arguments and pushes results through the
/// stack API, then returns the result count or a negative error code.
pub type HostFn = dyn Fn(&mut VM) -> i32 + Send + Sync;

/// A host callable wrapped for dispatch from the call trampoline.
pub struct BridgedFunction {
    f: Arc<HostFn>,
}

impl BridgedFunction {
    pub fn new(f: impl Fn(&mut VM) -> i32 + Send + Sync + 'static) -> Self {
        Self { f: Arc::new(f) }
    }

    pub(crate) fn from_shared(f: Arc<HostFn>) -> Self {
        Self { f }
    }

    pub fn call(&self, vm: &mut VM) -> i32 {
        (self.f)(vm)
    }
}

impl fmt::Debug for BridgedFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BridgedFunction")
    }
}

/// What a key refers to on the host side.
#[derive(Clone)]
pub enum HostRef {
    Function(Arc<BridgedFunction>),
    Object(Arc<dyn Any + Send + Sync>),
}

impl HostRef {
    /// Whether both refer to the same host allocation.
    pub fn ptr_eq(&self, other: &HostRef) -> bool {
        match (self, other) {
            (HostRef::Function(a), HostRef::Function(b)) => Arc::ptr_eq(a, b),
            (HostRef::Object(a), HostRef::Object(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for HostRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostRef::Function(func) => write!(f, "Function({:p})", Arc::as_ptr(func)),
            HostRef::Object(obj) => write!(f, "Object({:p})", Arc::as_ptr(obj)),
        }
    }
}

#[derive(Default)]
pub struct ReferenceTable {
    entries: Mutex<HashMap<OpaqueKey, HostRef>>,
}

impl ReferenceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry. The key must not be present.
    pub fn insert(&self, key: OpaqueKey, host: HostRef) {
        let previous = self.entries.lock().insert(key, host);
        debug_assert!(previous.is_none(), "{:?} inserted twice", key);
    }

    pub fn lookup(&self, key: OpaqueKey) -> Option<HostRef> {
        let found = self.entries.lock().get(&key).cloned();
        trace!("lookup {:?}: {}", key, if found.is_some() { "hit" } else { "miss" });
        found
    }

    /// Delete the entry if present. The removed reference is handed back so
    /// it is dropped after the lock is released.
    pub fn remove(&self, key: OpaqueKey) -> Option<HostRef> {
        self.entries.lock().remove(&key)
    }

    pub fn contains(&self, key: OpaqueKey) -> bool {
        self.entries.lock().contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the keys currently present.
    pub fn keys(&self) -> Vec<OpaqueKey> {
        self.entries.lock().keys().copied().collect()
    }
}

impl fmt::Debug for ReferenceTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReferenceTable")
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::ffi::c_void;
    use std::ptr::NonNull;

    use super::*;

    fn key(addr: usize) -> OpaqueKey {
        OpaqueKey::from_raw(NonNull::new(addr as *mut c_void).unwrap())
    }

    #[test]
    fn test_lookup_returns_inserted_reference() {
        let table = ReferenceTable::new();
        let host = HostRef::Object(Arc::new(7u32));
        table.insert(key(0x10), host.clone());
        let found = table.lookup(key(0x10)).unwrap();
        assert!(found.ptr_eq(&host));
        assert!(table.lookup(key(0x20)).is_none());
    }

    #[test]
    fn test_remove_is_idempotent() {
        let table = ReferenceTable::new();
        table.insert(key(0x10), HostRef::Function(Arc::new(BridgedFunction::new(|_| 0))));
        assert!(table.remove(key(0x10)).is_some());
        assert!(table.remove(key(0x10)).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn test_removed_reference_outlives_entry() {
        let table = ReferenceTable::new();
        let value = Arc::new(String::from("host"));
        table.insert(key(0x30), HostRef::Object(value.clone()));
        assert_eq!(Arc::strong_count(&value), 2);
        let removed = table.remove(key(0x30));
        assert_eq!(Arc::strong_count(&value), 2);
        drop(removed);
        assert_eq!(Arc::strong_count(&value), 1);
    }
}
