use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Barrier, mpsc};
use std::thread;

use crate::bridge::testing::CountingKeys;
use crate::bridge::{
    Bridge, BridgeError, MethodSuite, get_host_object_as, host_ref_key, push_host_function,
    push_host_object,
};
use crate::runtime::error::{EngineError, RET_ERROR};
use crate::runtime::heap::HeapConfig;
use crate::vm::VM;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn private_bridge() -> (Arc<Bridge>, Arc<CountingKeys>) {
    let keys = Arc::new(CountingKeys::default());
    (Arc::new(Bridge::with_allocator(keys.clone())), keys)
}

fn add(vm: &mut VM) -> i32 {
    let sum = vm.get_number(0) + vm.get_number(1);
    vm.push_number(sum);
    1
}

#[test]
fn test_suite_add_leaves_result_on_stack() {
    init_logger();
    let (bridge, _keys) = private_bridge();
    let mut vm = VM::with_bridge(bridge);
    let suite = MethodSuite::new().with("add", add);

    let result = vm.eval_with_suite("function(api){ return api.add(2,3); }", &suite);
    assert_eq!(result, Ok(()));
    assert_eq!(vm.get_number(-1), 5.0);
}

#[test]
fn test_syntax_error_reports_evaluation_failure() {
    init_logger();
    let (bridge, keys) = private_bridge();
    let mut vm = VM::with_bridge(bridge.clone());
    let suite = MethodSuite::new().with("add", add);

    let err = vm
        .eval_with_suite("not valid syntax (((", &suite)
        .unwrap_err();
    match err {
        EngineError::Evaluation(message) => assert!(!message.is_empty()),
        other => panic!("expected evaluation error, got {:?}", other),
    }
    assert!(bridge.table().is_empty());
    assert_eq!(keys.allocated.load(Ordering::SeqCst), 0);
}

#[test]
fn test_host_panic_is_catchable_by_script() {
    init_logger();
    let (bridge, _keys) = private_bridge();
    let mut vm = VM::with_bridge(bridge.clone());
    let suite = MethodSuite::new()
        .with("add", add)
        .with("explode", |_vm: &mut VM| -> i32 { panic!("host exploded") });

    let src = "function(api) {
        try {
            api.explode();
            return 'unreachable';
        } catch (e) {
            return e.message + ' / ' + api.add(1, 1);
        }
    }";
    vm.eval_with_suite(src, &suite).unwrap();
    assert_eq!(
        vm.safe_to_string(-1),
        "host function panicked: host exploded / 2"
    );
    assert_eq!(bridge.table().len(), 2);
}

#[test]
fn test_host_error_code_propagates_to_script() {
    init_logger();
    let (bridge, _keys) = private_bridge();
    let mut vm = VM::with_bridge(bridge);
    let suite = MethodSuite::new().with("fail", |_vm: &mut VM| RET_ERROR);

    let err = vm
        .eval_with_suite("function(api) { api.fail(); }", &suite)
        .unwrap_err();
    assert!(matches!(err, EngineError::Call(ref message) if message.starts_with("Error:")));
}

#[test]
fn test_stale_function_call_throws_in_script() {
    init_logger();
    let (bridge, _keys) = private_bridge();
    let mut vm = VM::with_bridge(bridge.clone());

    push_host_function(&mut vm, add).unwrap();
    let key = host_ref_key(&mut vm, -1).unwrap();
    vm.put_global_string("hostAdd");

    assert!(vm.peval_string("hostAdd(1, 2)").is_success());
    assert_eq!(vm.get_number(-1), 3.0);
    vm.pop();

    assert!(bridge.table().remove(key).is_some());
    assert!(vm
        .peval_string("var r; try { hostAdd(1, 2); } catch (e) { r = e.message; } r")
        .is_success());
    assert_eq!(
        vm.get_string(-1).as_deref(),
        Some("bridged function has been finalized")
    );
}

#[test]
fn test_host_object_round_trip() {
    init_logger();
    let (bridge, _keys) = private_bridge();
    let mut vm = VM::with_bridge(bridge.clone());

    let config = Arc::new(HeapConfig::default());
    push_host_object(&mut vm, config.clone()).unwrap();
    let back = get_host_object_as::<HeapConfig>(&mut vm, -1).unwrap();
    assert!(Arc::ptr_eq(&back, &config));

    let key = host_ref_key(&mut vm, -1).unwrap();
    let entry = bridge.table().lookup(key).unwrap();
    assert!(matches!(entry, crate::bridge::HostRef::Object(_)));
}

#[test]
fn test_suite_methods_are_finalized_exactly_once() {
    init_logger();
    let (bridge, keys) = private_bridge();
    let mut vm = VM::with_bridge(bridge.clone());
    let suite = MethodSuite::new()
        .with("add", add)
        .with("noop", |_vm: &mut VM| 0);

    vm.eval_with_suite("function(api) { return api.add(1, 2); }", &suite)
        .unwrap();
    assert_eq!(bridge.table().len(), 2);
    vm.pop();

    vm.gc();
    assert!(bridge.table().is_empty());
    vm.gc();
    drop(vm);

    assert_eq!(keys.allocated.load(Ordering::SeqCst), 2);
    assert_eq!(keys.released.load(Ordering::SeqCst), 2);
    assert_eq!(keys.double_releases.load(Ordering::SeqCst), 0);
    assert_eq!(keys.live(), 0);
}

#[test]
fn test_heap_teardown_finalizes_live_references() {
    init_logger();
    let (bridge, keys) = private_bridge();
    let mut vm = VM::with_bridge(bridge.clone());
    push_host_object(&mut vm, Arc::new(1u32)).unwrap();
    vm.put_global_string("held");
    vm.gc();
    assert_eq!(bridge.table().len(), 1);

    drop(vm);
    assert!(bridge.table().is_empty());
    assert_eq!(keys.released.load(Ordering::SeqCst), 1);
}

#[test]
fn test_keys_stay_distinct_after_finalization() {
    init_logger();
    let (bridge, _keys) = private_bridge();
    let mut vm = VM::with_bridge(bridge.clone());

    push_host_object(&mut vm, Arc::new("first")).unwrap();
    let first = host_ref_key(&mut vm, -1).unwrap();
    vm.pop();
    vm.gc();
    assert!(!bridge.table().contains(first));

    push_host_object(&mut vm, Arc::new("second")).unwrap();
    let second = host_ref_key(&mut vm, -1).unwrap();
    assert_ne!(first, second);
    assert!(bridge.table().contains(second));
}

#[test]
fn test_malloc_keys_stay_distinct_while_live() {
    init_logger();
    let bridge = Arc::new(Bridge::new());
    let mut vm = VM::with_bridge(bridge.clone());

    let mut seen = HashSet::new();
    for i in 0..64u32 {
        push_host_object(&mut vm, Arc::new(i)).unwrap();
        assert!(seen.insert(host_ref_key(&mut vm, -1).unwrap()));
    }
    assert_eq!(bridge.table().len(), 64);
    drop(vm);
    assert!(bridge.table().is_empty());
}

#[test]
fn test_concurrent_heaps_share_one_table() {
    init_logger();
    const THREADS: usize = 8;
    const REFS: usize = 50;

    let (bridge, keys) = private_bridge();
    let checked = Arc::new(Barrier::new(THREADS + 1));
    let (tx, rx) = mpsc::channel();

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let bridge = bridge.clone();
            let checked = checked.clone();
            let tx = tx.clone();
            thread::spawn(move || {
                let mut vm = VM::with_bridge(bridge);
                let mut kept = Vec::new();
                for i in 0..REFS {
                    push_host_object(&mut vm, Arc::new((t, i))).unwrap();
                    if fastrand::bool() {
                        kept.push(host_ref_key(&mut vm, -1).unwrap());
                        vm.put_global_string(&format!("ref{}", i));
                    } else {
                        vm.pop();
                    }
                }
                vm.gc();
                tx.send(kept).unwrap();
                checked.wait();
            })
        })
        .collect();
    drop(tx);

    let live: Vec<_> = rx.iter().take(THREADS).flatten().collect();
    assert_eq!(bridge.table().len(), live.len());
    for key in &live {
        assert!(bridge.table().contains(*key));
    }
    checked.wait();

    for handle in handles {
        handle.join().unwrap();
    }
    assert!(bridge.table().is_empty());
    assert_eq!(
        keys.released.load(Ordering::SeqCst),
        THREADS * REFS
    );
    assert_eq!(keys.double_releases.load(Ordering::SeqCst), 0);
}

#[test]
fn test_internal_properties_stay_hidden_from_scripts() {
    init_logger();
    let (bridge, _keys) = private_bridge();
    let mut vm = VM::with_bridge(bridge);
    let suite = MethodSuite::new().with("add", add);

    let src = "function(api) {
        var names = Object.keys(api);
        return names.length + ':' + names[0] + ':' + typeof api.add.hostFuncData;
    }";
    vm.eval_with_suite(src, &suite).unwrap();
    assert_eq!(vm.get_string(-1).as_deref(), Some("1:add:undefined"));
}

#[test]
fn test_host_function_can_call_back_into_script() {
    init_logger();
    let (bridge, _keys) = private_bridge();
    let mut vm = VM::with_bridge(bridge);
    let suite = MethodSuite::new().with("apply", |vm: &mut VM| {
        vm.dup(0);
        vm.dup(1);
        if vm.pcall(1).is_error() {
            return RET_ERROR;
        }
        1
    });

    let src = "function(api) { return api.apply(function(x) { return x * 2; }, 21); }";
    vm.eval_with_suite(src, &suite).unwrap();
    assert_eq!(vm.get_number(-1), 42.0);
}

#[test]
fn test_suite_object_survives_collection_during_script() {
    init_logger();
    let (bridge, keys) = private_bridge();
    let mut vm = VM::with_config(HeapConfig {
        gc_threshold: 64,
        ..HeapConfig::default()
    });
    bridge.install(&mut vm).unwrap();
    let suite = MethodSuite::new().with("add", add);

    let src = "function(api) {
        var total = 0;
        for (var i = 0; i < 2000; i++) {
            var garbage = { index: i, list: [i, i] };
            total = api.add(total, 1);
        }
        return total;
    }";
    vm.eval_with_suite(src, &suite).unwrap();
    assert_eq!(vm.get_number(-1), 2000.0);
    assert_eq!(keys.double_releases.load(Ordering::SeqCst), 0);
}

#[test]
fn test_default_engine_uses_global_bridge() {
    init_logger();
    let mut vm = VM::new();
    push_host_object(&mut vm, Arc::new(String::from("global"))).unwrap();
    let key = host_ref_key(&mut vm, -1).unwrap();
    assert!(Bridge::global().table().contains(key));

    vm.pop();
    vm.gc();
    assert!(!Bridge::global().table().contains(key));
}

#[test]
fn test_embedder_data_does_not_redirect_finalizers() {
    init_logger();
    let (bridge, keys) = private_bridge();
    let mut vm = VM::with_bridge(bridge.clone());
    push_host_object(&mut vm, Arc::new(7u8)).unwrap();
    vm.pop();

    vm.set_host_data(Arc::new(String::from("embedder state")));
    vm.gc();
    assert!(bridge.table().is_empty());
    assert_eq!(keys.released.load(Ordering::SeqCst), 1);
}

#[test]
fn test_rebinding_after_registration_is_refused() {
    init_logger();
    let (first, first_keys) = private_bridge();
    let (second, second_keys) = private_bridge();
    let mut vm = VM::with_bridge(first.clone());
    push_host_object(&mut vm, Arc::new(7u8)).unwrap();

    assert_eq!(second.install(&mut vm), Err(BridgeError::AlreadyBound));
    vm.pop();
    vm.gc();
    drop(vm);

    assert!(first.table().is_empty());
    assert_eq!(first_keys.released.load(Ordering::SeqCst), 1);
    assert_eq!(first_keys.double_releases.load(Ordering::SeqCst), 0);
    assert_eq!(second_keys.allocated.load(Ordering::SeqCst), 0);
}
