//! Native entry points shared by every bridged function and finalizer.
//!
//! Both recover their key from the function object the engine is currently
//! running, so a single pair of functions serves all host references.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};

use log::{debug, error};

use crate::bridge::handle::FUNC_KEY_PROP;
use crate::bridge::{HostRef, OpaqueKey, bridge_of};
use crate::runtime::error::{ErrorKind, RET_TYPE_ERROR};
use crate::vm::VM;

/// Key stored on the running native function, leaving the stack unchanged.
fn current_key(vm: &mut VM) -> Option<OpaqueKey> {
    vm.push_current_function();
    vm.get_internal_prop_string(-1, FUNC_KEY_PROP);
    let key = vm.get_pointer(-1).map(OpaqueKey::from_raw);
    vm.pop_n(2);
    key
}

/// Finalizer of every bridged object: drops its table entry, then its key.
pub(crate) fn finalize_trampoline(vm: &mut VM) -> i32 {
    let Some(key) = current_key(vm) else {
        error!("finalize: finalizer carries no host key");
        return RET_TYPE_ERROR;
    };
    bridge_of(vm).unregister(key);
    0
}

/// Body of every bridged function: resolves the key and runs the host
/// callable with the engine's arguments in place.
pub(crate) fn call_trampoline(vm: &mut VM) -> i32 {
    let Some(key) = current_key(vm) else {
        error!("call: function carries no host key");
        return RET_TYPE_ERROR;
    };
    let func = match bridge_of(vm).table().lookup(key) {
        Some(HostRef::Function(func)) => func,
        Some(HostRef::Object(_)) => {
            return vm.throw_error(ErrorKind::Type, "host reference is not callable");
        }
        None => {
            debug!("call: {:?} is not registered", key);
            return vm.throw_error(ErrorKind::Error, "bridged function has been finalized");
        }
    };

    let mark = vm.unwind_mark();
    match catch_unwind(AssertUnwindSafe(|| func.call(vm))) {
        Ok(rc) => rc,
        Err(payload) => {
            vm.unwind_to(mark);
            let message = panic_message(payload.as_ref());
            error!("call: host function {:?} panicked: {}", key, message);
            vm.throw_error(
                ErrorKind::Error,
                &format!("host function panicked: {}", message),
            )
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::Ordering;

    use crate::bridge::testing::CountingKeys;
    use crate::bridge::{Bridge, host_ref_key, push_host_function, push_host_object};
    use crate::runtime::error::RET_ERROR;
    use crate::vm::value::VARARGS;

    use super::*;

    fn setup() -> (VM, Arc<Bridge>, Arc<CountingKeys>) {
        let keys = Arc::new(CountingKeys::default());
        let bridge = Arc::new(Bridge::with_allocator(keys.clone()));
        let mut vm = VM::new();
        bridge.install(&mut vm).unwrap();
        (vm, bridge, keys)
    }

    #[test]
    fn test_call_sees_arguments() {
        let (mut vm, _bridge, _keys) = setup();
        push_host_function(&mut vm, |vm| {
            let sum = (0..vm.get_top()).map(|i| vm.get_number(i)).sum();
            vm.push_number(sum);
            1
        })
        .unwrap();
        vm.push_number(1.0);
        vm.push_number(2.0);
        vm.push_number(4.0);
        assert!(vm.pcall(3).is_success());
        assert_eq!(vm.get_number(-1), 7.0);
    }

    #[test]
    fn test_stale_function_throws() {
        let (mut vm, bridge, _keys) = setup();
        push_host_function(&mut vm, |_| 0).unwrap();
        let key = host_ref_key(&mut vm, -1).unwrap();
        bridge.table().remove(key);
        assert!(vm.pcall(0).is_error());
        assert_eq!(
            vm.safe_to_string(-1),
            "Error: bridged function has been finalized"
        );
    }

    #[test]
    fn test_function_without_key_is_type_error() {
        let (mut vm, bridge, _keys) = setup();
        push_host_object(&mut vm, Arc::new(())).unwrap();
        vm.pop();
        vm.push_native_function(call_trampoline, VARARGS);
        assert!(vm.pcall(0).is_error());
        assert!(vm.safe_to_string(-1).starts_with("TypeError"));
        assert_eq!(bridge.table().len(), 1);
    }

    #[test]
    fn test_object_key_is_not_callable() {
        let (mut vm, bridge, _keys) = setup();
        let key = bridge
            .register(HostRef::Object(Arc::new(String::from("data"))))
            .unwrap();
        vm.push_native_function(call_trampoline, VARARGS);
        vm.push_pointer(key.as_ptr());
        vm.put_internal_prop_string(-2, FUNC_KEY_PROP);
        assert!(vm.pcall(0).is_error());
        assert_eq!(
            vm.safe_to_string(-1),
            "TypeError: host reference is not callable"
        );
        assert!(bridge.table().contains(key));
        assert_eq!(bridge.table().len(), 1);
    }

    #[test]
    fn test_panic_becomes_script_error() {
        let (mut vm, _bridge, _keys) = setup();
        push_host_function(&mut vm, |vm| {
            vm.push_string("scratch");
            panic!("boom")
        })
        .unwrap();
        assert!(vm.pcall(0).is_error());
        assert_eq!(vm.safe_to_string(-1), "Error: host function panicked: boom");
        assert_eq!(vm.get_top(), 1);
        assert!(vm.native_frames.is_empty());
    }

    #[test]
    fn test_host_return_code_is_honoured() {
        let (mut vm, _bridge, _keys) = setup();
        push_host_function(&mut vm, |_| RET_ERROR).unwrap();
        assert!(vm.pcall(0).is_error());
        assert!(vm.safe_to_string(-1).starts_with("Error:"));
    }

    #[test]
    fn test_collected_object_is_finalized_once() {
        let (mut vm, bridge, keys) = setup();
        push_host_object(&mut vm, Arc::new(5u64)).unwrap();
        assert_eq!(bridge.table().len(), 1);
        vm.pop();

        let stats = vm.gc();
        assert_eq!(stats.finalizable, 1);
        assert!(bridge.table().is_empty());
        vm.gc();
        drop(vm);
        assert_eq!(keys.released.load(Ordering::SeqCst), 1);
        assert_eq!(keys.double_releases.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_finalizer_without_key_leaves_table() {
        let (mut vm, bridge, keys) = setup();
        push_host_object(&mut vm, Arc::new(())).unwrap();
        vm.push_native_function(finalize_trampoline, 1);
        vm.push_object();
        assert!(vm.pcall(1).is_error());
        assert_eq!(bridge.table().len(), 1);
        assert_eq!(keys.released.load(Ordering::SeqCst), 0);
    }
}
