//! Host reference bridge
//!
//! Host values are exposed to scripts through engine objects carrying an
//! opaque key in an internal property. The key resolves through a shared
//! [`ReferenceTable`] to the host value. Each bridged engine object gets a
//! finalizer, so the entry lives exactly as long as the engine keeps the
//! object reachable:
//!
//! 1. push: allocate key, insert entry, expose engine object
//! 2. call: engine invokes the call trampoline, which resolves the key
//! 3. finalize: engine collector invokes the finalize trampoline, which
//!    removes the entry and then releases the key

mod handle;
mod key;
mod suite;
mod table;
mod trampoline;

use std::sync::Arc;

use log::{debug, warn};
use once_cell::sync::OnceCell;
use thiserror::Error;

use crate::vm::VM;

pub use handle::{
    get_host_object, get_host_object_as, host_ref_key, push_host_function, push_host_object,
};
pub use key::{KeyAllocator, MallocKeys, OpaqueKey};
pub use suite::MethodSuite;
pub use table::{BridgedFunction, HostFn, HostRef, ReferenceTable};

#[cfg(test)]
pub(crate) use key::testing;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    #[error("opaque key allocation failed")]
    KeyExhausted,

    /// The engine already holds references registered with another bridge.
    #[error("engine is bound to another bridge")]
    AlreadyBound,
}

static GLOBAL: OnceCell<Arc<Bridge>> = OnceCell::new();

/// Reference table plus the allocator minting its keys.
///
/// One process-wide instance is available through [`Bridge::global`];
/// engines use it unless another bridge is [installed](Bridge::install).
pub struct Bridge {
    table: ReferenceTable,
    keys: Arc<dyn KeyAllocator>,
}

impl Default for Bridge {
    fn default() -> Self {
        Self::new()
    }
}

impl Bridge {
    pub fn new() -> Self {
        Self::with_allocator(Arc::new(MallocKeys))
    }

    pub fn with_allocator(keys: Arc<dyn KeyAllocator>) -> Self {
        Self {
            table: ReferenceTable::new(),
            keys,
        }
    }

    pub fn global() -> &'static Arc<Bridge> {
        GLOBAL.get_or_init(|| Arc::new(Bridge::new()))
    }

    pub fn table(&self) -> &ReferenceTable {
        &self.table
    }

    /// Route the bridge traffic of `vm` through this bridge.
    ///
    /// Fails once `vm` has registered a reference with a different bridge:
    /// its pending finalizers must reach the table holding their entries.
    pub fn install(self: &Arc<Self>, vm: &mut VM) -> Result<(), BridgeError> {
        if let Some(current) = &vm.bridge
            && vm.bridge_pinned
            && !Arc::ptr_eq(current, self)
        {
            return Err(BridgeError::AlreadyBound);
        }
        vm.bridge = Some(self.clone());
        Ok(())
    }

    /// Mint a key for `host` and record it.
    pub fn register(&self, host: HostRef) -> Result<OpaqueKey, BridgeError> {
        let key = self.keys.allocate()?;
        debug!("new host ref {:?} = {:?}", key, host);
        self.table.insert(key, host);
        Ok(key)
    }

    /// Drop the entry for `key`, then release the key itself.
    ///
    /// Unknown keys are left alone so a key is never released twice.
    pub(crate) fn unregister(&self, key: OpaqueKey) -> bool {
        let Some(removed) = self.table.remove(key) else {
            warn!("finalize: {:?} is not registered", key);
            return false;
        };
        debug!("finalize: {:?}", key);
        // SAFETY: the key was minted by this allocator in `register`, and
        // the removal above succeeds at most once per key.
        unsafe { self.keys.release(key) };
        drop(removed);
        true
    }
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge").field("table", &self.table).finish()
    }
}

impl VM {
    /// Engine whose host references go through `bridge`.
    pub fn with_bridge(bridge: Arc<Bridge>) -> Self {
        let mut vm = VM::new();
        vm.bridge = Some(bridge);
        vm
    }
}

/// Bridge serving `vm`: the installed one, else the process-wide one.
pub fn bridge_of(vm: &VM) -> Arc<Bridge> {
    vm.bridge
        .clone()
        .unwrap_or_else(|| Bridge::global().clone())
}

/// Bridge that will own a reference about to be registered by `vm`. The
/// choice is fixed from here on.
pub(crate) fn pin_bridge(vm: &mut VM) -> Arc<Bridge> {
    vm.bridge_pinned = true;
    vm.bridge
        .get_or_insert_with(|| Bridge::global().clone())
        .clone()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::testing::CountingKeys;
    use super::*;

    #[test]
    fn test_register_then_unregister() {
        let keys = Arc::new(CountingKeys::default());
        let bridge = Bridge::with_allocator(keys.clone());
        let key = bridge.register(HostRef::Object(Arc::new(1u8))).unwrap();
        assert!(bridge.table().contains(key));
        assert!(bridge.unregister(key));
        assert!(!bridge.table().contains(key));
        assert!(!bridge.unregister(key));
        assert_eq!(keys.released.load(Ordering::SeqCst), 1);
        assert_eq!(keys.double_releases.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_exhausted_allocator_leaves_table_untouched() {
        let bridge = Bridge::with_allocator(Arc::new(CountingKeys::with_limit(0)));
        let err = bridge.register(HostRef::Object(Arc::new(()))).unwrap_err();
        assert_eq!(err, BridgeError::KeyExhausted);
        assert!(bridge.table().is_empty());
    }

    #[test]
    fn test_bridge_of_prefers_installed_bridge() {
        let bridge = Arc::new(Bridge::new());
        let mut vm = VM::new();
        assert!(Arc::ptr_eq(&bridge_of(&vm), Bridge::global()));
        bridge.install(&mut vm).unwrap();
        assert!(Arc::ptr_eq(&bridge_of(&vm), &bridge));
    }

    #[test]
    fn test_install_is_refused_once_references_exist() {
        let first = Arc::new(Bridge::with_allocator(Arc::new(CountingKeys::default())));
        let second = Arc::new(Bridge::with_allocator(Arc::new(CountingKeys::default())));
        let mut vm = VM::new();
        second.install(&mut vm).unwrap();
        first.install(&mut vm).unwrap();

        push_host_object(&mut vm, Arc::new(0u8)).unwrap();
        assert_eq!(second.install(&mut vm), Err(BridgeError::AlreadyBound));
        assert!(first.install(&mut vm).is_ok());
        assert!(Arc::ptr_eq(&bridge_of(&vm), &first));
    }
}
