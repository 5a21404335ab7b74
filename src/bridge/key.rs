//! Opaque keys: addresses of one-byte foreign-heap allocations used purely
//! as identity tokens. A key is never dereferenced, only compared and
//! hashed, and stays unique among live keys until it is released.

use std::ffi::c_void;
use std::fmt;
use std::ptr::NonNull;

use crate::bridge::BridgeError;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpaqueKey(NonNull<c_void>);

// The address is only used as a token; nothing reads through it.
unsafe impl Send for OpaqueKey {}
unsafe impl Sync for OpaqueKey {}

impl OpaqueKey {
    /// Rebuild a key from a pointer value stored in the engine.
    pub fn from_raw(ptr: NonNull<c_void>) -> Self {
        Self(ptr)
    }

    pub fn as_ptr(self) -> *mut c_void {
        self.0.as_ptr()
    }

    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }
}

impl fmt::Debug for OpaqueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OpaqueKey({:#x})", self.addr())
    }
}

/// Source of opaque keys.
pub trait KeyAllocator: Send + Sync {
    /// Mint a key distinct from every currently live key.
    fn allocate(&self) -> Result<OpaqueKey, BridgeError>;

    /// Give a key back.
    ///
    /// # Safety
    ///
    /// `key` must come from [`allocate`](Self::allocate) on this allocator
    /// and must not have been released before.
    unsafe fn release(&self, key: OpaqueKey);
}

/// Keys backed by `malloc(1)`. The C heap guarantees the address is unique
/// until it is freed.
#[derive(Debug, Default, Clone, Copy)]
pub struct MallocKeys;

impl KeyAllocator for MallocKeys {
    fn allocate(&self) -> Result<OpaqueKey, BridgeError> {
        let ptr = unsafe { libc::malloc(1) };
        NonNull::new(ptr)
            .map(OpaqueKey)
            .ok_or(BridgeError::KeyExhausted)
    }

    unsafe fn release(&self, key: OpaqueKey) {
        unsafe { libc::free(key.as_ptr()) }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malloc_keys_are_distinct_while_live() {
        let keys = MallocKeys;
        let a = keys.allocate().unwrap();
        let b = keys.allocate().unwrap();
        assert_ne!(a, b);
        unsafe {
            keys.release(a);
            keys.release(b);
        }
    }

    #[test]
    fn test_counting_keys_detect_double_release() {
        use std::sync::atomic::Ordering;

        let keys = testing::CountingKeys::default();
        let key = keys.allocate().unwrap();
        assert!(keys.is_live(key));
        unsafe {
            keys.release(key);
            keys.release(key);
        }
        assert_eq!(keys.released.load(Ordering::SeqCst), 1);
        assert_eq!(keys.double_releases.load(Ordering::SeqCst), 1);
        assert_eq!(keys.live(), 0);
    }

    #[test]
    fn test_debug_shows_address() {
        let ptr = NonNull::new(0x40 as *mut c_void).unwrap();
        assert_eq!(format!("{:?}", OpaqueKey::from_raw(ptr)), "OpaqueKey(0x40)");
    }
}
