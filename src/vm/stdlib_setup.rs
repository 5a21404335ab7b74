//! Minimal standard library setup for the script VM
//!
//! Sets up only the globals scripts driving host bridges rely on:
//! - console (log)
//! - Error constructors
//! - Object.keys

use crate::stdlib::{
    native_error, native_eval_error, native_log, native_object_keys, native_range_error,
    native_reference_error, native_syntax_error, native_type_error,
};
use crate::vm::VM;
use crate::vm::value::{NativeFn, VARARGS};

pub fn setup_stdlib(vm: &mut VM) {
    setup_console(vm);
    setup_errors(vm);
    setup_object(vm);
}

/// Build a global object whose properties are native functions.
fn install_namespace(vm: &mut VM, name: &str, methods: &[(&str, NativeFn, i32)]) {
    let obj = vm.push_object();
    for &(method, func, nargs) in methods {
        vm.push_native_function(func, nargs);
        vm.put_prop_string(obj, method);
    }
    vm.put_global_string(name);
}

fn setup_console(vm: &mut VM) {
    install_namespace(vm, "console", &[("log", native_log, VARARGS)]);
}

fn setup_errors(vm: &mut VM) {
    let constructors: [(&str, NativeFn); 6] = [
        ("Error", native_error),
        ("TypeError", native_type_error),
        ("RangeError", native_range_error),
        ("SyntaxError", native_syntax_error),
        ("ReferenceError", native_reference_error),
        ("EvalError", native_eval_error),
    ];
    for (name, func) in constructors {
        vm.push_native_function(func, 1);
        vm.put_global_string(name);
    }
}

fn setup_object(vm: &mut VM) {
    install_namespace(vm, "Object", &[("keys", native_object_keys, 1)]);
}
