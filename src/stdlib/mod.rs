//! Standard Library - Native functions for the script VM
//!
//! Every native follows the engine calling convention: arguments are read
//! from the stack API, results are pushed, and the return value is the
//! result count or a negative error code.

use crate::runtime::error::ErrorKind;
use crate::vm::VM;
use crate::vm::value::{HeapData, JsValue};

/// console.log: scripts write to the host logger
pub fn native_log(vm: &mut VM) -> i32 {
    let parts: Vec<String> = (0..vm.get_top()).map(|i| vm.safe_to_string(i)).collect();
    log::info!(target: "script", "{}", parts.join(" "));
    0
}

// ============================================================================
// Error constructors
// ============================================================================

/// Shared body of the error constructors; works with or without `new`.
fn construct_error(vm: &mut VM, kind: ErrorKind) -> i32 {
    let message = match vm.get_type(0) {
        t if t.is_undefined() || t.is_none() => String::new(),
        _ => vm.safe_to_string(0),
    };
    let err = vm.make_error(kind, &message);
    vm.stack.push(err);
    1
}

pub fn native_error(vm: &mut VM) -> i32 {
    construct_error(vm, ErrorKind::Error)
}

pub fn native_type_error(vm: &mut VM) -> i32 {
    construct_error(vm, ErrorKind::Type)
}

pub fn native_range_error(vm: &mut VM) -> i32 {
    construct_error(vm, ErrorKind::Range)
}

pub fn native_syntax_error(vm: &mut VM) -> i32 {
    construct_error(vm, ErrorKind::Syntax)
}

pub fn native_reference_error(vm: &mut VM) -> i32 {
    construct_error(vm, ErrorKind::Reference)
}

pub fn native_eval_error(vm: &mut VM) -> i32 {
    construct_error(vm, ErrorKind::Eval)
}

// ============================================================================
// Object
// ============================================================================

/// Object.keys: script-visible own keys, array indices first
pub fn native_object_keys(vm: &mut VM) -> i32 {
    let Some(JsValue::Object(ptr)) = vm.stack.last().cloned() else {
        return vm.throw_error(ErrorKind::Type, "Object.keys called on non-object");
    };
    let keys: Vec<JsValue> = match vm.heap.get(ptr) {
        Some(obj) => {
            let indices = match &obj.data {
                HeapData::Array(elements) => elements.len(),
                _ => 0,
            };
            (0..indices)
                .map(|i| i.to_string())
                .chain(obj.props.keys().map(str::to_string))
                .map(JsValue::String)
                .collect()
        }
        None => Vec::new(),
    };
    let array = vm.heap.alloc_data(HeapData::Array(keys));
    vm.stack.push(JsValue::Object(array));
    1
}

#[cfg(test)]
mod tests {
    use crate::vm::VM;

    #[test]
    fn test_error_constructors() {
        let mut vm = VM::new();
        assert!(vm.peval_string("new RangeError('too far')").is_success());
        assert_eq!(vm.safe_to_string(-1), "RangeError: too far");
        assert!(vm.peval_string("Error().message").is_success());
        assert_eq!(vm.safe_to_string(-1), "");
        assert!(vm.peval_string("var e = new TypeError('x'); e.name").is_success());
        assert_eq!(vm.safe_to_string(-1), "TypeError");
    }

    #[test]
    fn test_object_keys() {
        let mut vm = VM::new();
        assert!(vm.peval_string("var k = Object.keys({ b: 1, a: 2 }); k[0] + k[1] + k.length").is_success());
        assert_eq!(vm.safe_to_string(-1), "ba2");
        assert!(vm.peval_string("Object.keys(3)").is_error());
    }
}
