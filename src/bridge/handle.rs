//! Exposing host values as engine objects
//!
//! A bridged object carries its key twice: once in the property that the
//! call path reads, once on the finalizer function attached to it. The
//! finalizer only ever sees itself, so it needs its own copy.

use std::any::Any;
use std::sync::Arc;

use crate::bridge::trampoline::{call_trampoline, finalize_trampoline};
use crate::bridge::{BridgeError, BridgedFunction, HostRef, OpaqueKey, bridge_of, pin_bridge};
use crate::vm::VM;
use crate::vm::value::VARARGS;

/// Internal property holding the key of a bridged function, and of every
/// finalizer installed by the bridge.
pub(crate) const FUNC_KEY_PROP: &str = "hostFuncData";
/// Internal property holding the key of a bridged plain object.
pub(crate) const OBJ_KEY_PROP: &str = "hostObjData";

/// Register `host` and tie its lifetime to the object on top of the stack.
///
/// Leaves the stack as it found it. On failure nothing was attached and the
/// table is unchanged.
fn put_host_ref(vm: &mut VM, host: HostRef, prop: &str) -> Result<OpaqueKey, BridgeError> {
    let key = pin_bridge(vm).register(host)?;

    vm.push_native_function(finalize_trampoline, 1);
    vm.push_pointer(key.as_ptr());
    vm.put_internal_prop_string(-2, FUNC_KEY_PROP);
    vm.set_finalizer(-2);

    vm.push_pointer(key.as_ptr());
    vm.put_internal_prop_string(-2, prop);
    Ok(key)
}

/// Push a plain object standing for `value`; returns its stack index.
pub fn push_host_object(
    vm: &mut VM,
    value: Arc<dyn Any + Send + Sync>,
) -> Result<i32, BridgeError> {
    let idx = vm.push_object();
    if let Err(err) = put_host_ref(vm, HostRef::Object(value), OBJ_KEY_PROP) {
        vm.pop();
        return Err(err);
    }
    Ok(idx)
}

/// Push a script-callable function dispatching to `f`; returns its stack index.
///
/// `f` sees the call arguments at indices `0..get_top()` and follows the
/// native calling convention.
pub fn push_host_function(
    vm: &mut VM,
    f: impl Fn(&mut VM) -> i32 + Send + Sync + 'static,
) -> Result<i32, BridgeError> {
    push_bridged_function(vm, Arc::new(BridgedFunction::new(f)))
}

pub(crate) fn push_bridged_function(
    vm: &mut VM,
    func: Arc<BridgedFunction>,
) -> Result<i32, BridgeError> {
    let idx = vm.push_native_function(call_trampoline, VARARGS);
    if let Err(err) = put_host_ref(vm, HostRef::Function(func), FUNC_KEY_PROP) {
        vm.pop();
        return Err(err);
    }
    Ok(idx)
}

/// Key stored on the bridged value at `idx`.
pub fn host_ref_key(vm: &mut VM, idx: i32) -> Option<OpaqueKey> {
    [OBJ_KEY_PROP, FUNC_KEY_PROP].into_iter().find_map(|prop| {
        vm.get_internal_prop_string(idx, prop);
        let key = vm.get_pointer(-1).map(OpaqueKey::from_raw);
        vm.pop();
        key
    })
}

/// Host value behind the bridged object at `idx`, if it is still registered.
pub fn get_host_object(vm: &mut VM, idx: i32) -> Option<Arc<dyn Any + Send + Sync>> {
    vm.get_internal_prop_string(idx, OBJ_KEY_PROP);
    let key = vm.get_pointer(-1).map(OpaqueKey::from_raw);
    vm.pop();
    match bridge_of(vm).table().lookup(key?)? {
        HostRef::Object(value) => Some(value),
        HostRef::Function(_) => None,
    }
}

pub fn get_host_object_as<T: Any + Send + Sync>(vm: &mut VM, idx: i32) -> Option<Arc<T>> {
    get_host_object(vm, idx)?.downcast::<T>().ok()
}

#[cfg(test)]
mod tests {
    use crate::bridge::Bridge;
    use crate::bridge::testing::CountingKeys;
    use crate::vm::value::Type;

    use super::*;

    fn setup(keys: Arc<CountingKeys>) -> (VM, Arc<Bridge>) {
        let bridge = Arc::new(Bridge::with_allocator(keys));
        let mut vm = VM::new();
        bridge.install(&mut vm).unwrap();
        (vm, bridge)
    }

    #[test]
    fn test_host_object_round_trip() {
        let (mut vm, bridge) = setup(Arc::new(CountingKeys::default()));
        let value = Arc::new(vec![1u8, 2, 3]);
        let idx = push_host_object(&mut vm, value.clone()).unwrap();
        assert_eq!(vm.get_type(idx), Type::Object);
        assert_eq!(bridge.table().len(), 1);

        let back = get_host_object_as::<Vec<u8>>(&mut vm, -1).unwrap();
        assert!(Arc::ptr_eq(&back, &value));
        assert!(get_host_object_as::<String>(&mut vm, -1).is_none());
        assert_eq!(vm.get_top(), 1);
    }

    #[test]
    fn test_key_is_stored_on_object_and_finalizer() {
        let (mut vm, bridge) = setup(Arc::new(CountingKeys::default()));
        push_host_function(&mut vm, |_| 0).unwrap();
        let key = host_ref_key(&mut vm, -1).unwrap();
        assert!(bridge.table().contains(key));
        assert!(matches!(bridge.table().lookup(key), Some(HostRef::Function(_))));
        assert!(vm.is_callable(-1));
    }

    #[test]
    fn test_failed_registration_leaves_stack_and_table() {
        let (mut vm, bridge) = setup(Arc::new(CountingKeys::with_limit(0)));
        let err = push_host_object(&mut vm, Arc::new(())).unwrap_err();
        assert_eq!(err, BridgeError::KeyExhausted);
        assert_eq!(vm.get_top(), 0);
        assert!(bridge.table().is_empty());
    }

    #[test]
    fn test_plain_object_has_no_key() {
        let (mut vm, _bridge) = setup(Arc::new(CountingKeys::default()));
        vm.push_object();
        assert!(host_ref_key(&mut vm, -1).is_none());
        assert!(get_host_object(&mut vm, -1).is_none());
    }
}
