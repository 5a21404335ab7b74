//! Value-stack API for native functions and embedders
//!
//! Indices address the current native activation: `0` is its first
//! argument and negative indices count down from the top. Outside any
//! native call the whole stack is addressable.

use std::ffi::c_void;
use std::ptr::NonNull;

use crate::runtime::error::{ErrorKind, ExecStatus};
use crate::runtime::heap::CollectStats;
use crate::vm::VM;
use crate::vm::value::{
    FINALIZER_PROP, HeapData, INTERNAL_PREFIX, JsValue, NativeFn, Type,
};

impl VM {
    fn frame_base(&self) -> usize {
        self.native_frames.last().map_or(0, |frame| frame.base)
    }

    /// Absolute stack position of `idx`, if it names a value.
    fn normalize_index(&self, idx: i32) -> Option<usize> {
        let base = self.frame_base();
        let top = self.stack.len();
        let abs = if idx < 0 {
            top.checked_sub(idx.unsigned_abs() as usize)?
        } else {
            base + idx as usize
        };
        (abs >= base && abs < top).then_some(abs)
    }

    fn value_at(&self, idx: i32) -> Option<&JsValue> {
        self.normalize_index(idx).map(|abs| &self.stack[abs])
    }

    fn object_at(&self, idx: i32) -> Option<usize> {
        self.value_at(idx).and_then(JsValue::as_object)
    }

    /// Pop the top value, never reaching below the current activation.
    fn take_top(&mut self) -> Option<JsValue> {
        if self.stack.len() > self.frame_base() {
            self.stack.pop()
        } else {
            None
        }
    }

    fn push(&mut self, value: JsValue) -> i32 {
        self.stack.push(value);
        self.get_top() - 1
    }

    // =========================================================================
    // Stack manipulation
    // =========================================================================

    /// Number of values in the current activation.
    pub fn get_top(&self) -> i32 {
        (self.stack.len() - self.frame_base()) as i32
    }

    pub fn pop(&mut self) {
        self.take_top();
    }

    pub fn pop_n(&mut self, count: usize) {
        for _ in 0..count {
            self.take_top();
        }
    }

    /// Push a copy of the value at `idx` (undefined when out of range).
    pub fn dup(&mut self, idx: i32) {
        let value = self.value_at(idx).cloned().unwrap_or(JsValue::Undefined);
        self.stack.push(value);
    }

    pub fn get_type(&self, idx: i32) -> Type {
        self.value_at(idx).map_or(Type::None, Type::from)
    }

    pub fn push_undefined(&mut self) {
        self.stack.push(JsValue::Undefined);
    }

    pub fn push_null(&mut self) {
        self.stack.push(JsValue::Null);
    }

    pub fn push_boolean(&mut self, value: bool) {
        self.stack.push(JsValue::Boolean(value));
    }

    pub fn push_number(&mut self, value: f64) {
        self.stack.push(JsValue::Number(value));
    }

    pub fn push_string(&mut self, value: &str) {
        self.stack.push(JsValue::String(value.to_string()));
    }

    /// Push an empty object; returns its index.
    pub fn push_object(&mut self) -> i32 {
        let ptr = self.heap.alloc_data(HeapData::Object);
        self.push(JsValue::Object(ptr))
    }

    pub fn push_array(&mut self) -> i32 {
        let ptr = self.heap.alloc_data(HeapData::Array(Vec::new()));
        self.push(JsValue::Object(ptr))
    }

    /// Push an opaque pointer. The engine never dereferences it.
    pub fn push_pointer(&mut self, ptr: *mut c_void) {
        self.stack.push(JsValue::Pointer(ptr as usize));
    }

    /// Push a function backed by `func`. `nargs` fixes the argument count
    /// seen by the function, or is [`VARARGS`](crate::vm::value::VARARGS).
    pub fn push_native_function(&mut self, func: NativeFn, nargs: i32) -> i32 {
        let ptr = self.heap.alloc_data(HeapData::Native { func, nargs });
        self.push(JsValue::Object(ptr))
    }

    /// Push the function object of the running native call.
    pub fn push_current_function(&mut self) {
        let value = self
            .native_frames
            .last()
            .map_or(JsValue::Undefined, |frame| JsValue::Object(frame.func));
        self.stack.push(value);
    }

    pub fn push_this(&mut self) {
        let value = self
            .native_frames
            .last()
            .map_or(JsValue::Undefined, |frame| frame.this.clone());
        self.stack.push(value);
    }

    // =========================================================================
    // Value access
    // =========================================================================

    /// Number at `idx`, NaN for anything else.
    pub fn get_number(&self, idx: i32) -> f64 {
        match self.value_at(idx) {
            Some(JsValue::Number(n)) => *n,
            _ => f64::NAN,
        }
    }

    pub fn get_boolean(&self, idx: i32) -> bool {
        matches!(self.value_at(idx), Some(JsValue::Boolean(true)))
    }

    pub fn get_string(&self, idx: i32) -> Option<String> {
        match self.value_at(idx) {
            Some(JsValue::String(s)) => Some(s.clone()),
            _ => None,
        }
    }

    pub fn get_pointer(&self, idx: i32) -> Option<NonNull<c_void>> {
        match self.value_at(idx) {
            Some(JsValue::Pointer(addr)) => NonNull::new(*addr as *mut c_void),
            _ => None,
        }
    }

    pub fn is_callable(&self, idx: i32) -> bool {
        self.object_at(idx)
            .and_then(|ptr| self.heap.get(ptr))
            .is_some_and(|obj| obj.is_callable())
    }

    /// Replace the value at `idx` with its string form and return it.
    pub fn safe_to_string(&mut self, idx: i32) -> String {
        let Some(abs) = self.normalize_index(idx) else {
            return "undefined".to_string();
        };
        let rendered = self.to_display_string(&self.stack[abs]);
        self.stack[abs] = JsValue::String(rendered.clone());
        rendered
    }

    // =========================================================================
    // Properties
    // =========================================================================

    /// Pop a value and store it as script-visible property `key` on the
    /// object at `obj_idx`.
    pub fn put_prop_string(&mut self, obj_idx: i32, key: &str) -> bool {
        let target = self.object_at(obj_idx);
        let value = self.take_top().unwrap_or(JsValue::Undefined);
        match target {
            Some(ptr) => self.set_property(&JsValue::Object(ptr), key, value).is_ok(),
            None => false,
        }
    }

    /// Push property `key` of the object at `obj_idx`; returns whether it exists.
    pub fn get_prop_string(&mut self, obj_idx: i32, key: &str) -> bool {
        let found = self
            .object_at(obj_idx)
            .and_then(|ptr| self.heap.get(ptr))
            .and_then(|obj| obj.props.get(key))
            .cloned();
        let exists = found.is_some();
        self.stack.push(found.unwrap_or(JsValue::Undefined));
        exists
    }

    /// Like [`put_prop_string`](Self::put_prop_string), but into the
    /// object's internal map, out of reach of scripts and enumeration.
    pub fn put_internal_prop_string(&mut self, obj_idx: i32, key: &str) -> bool {
        let target = self.object_at(obj_idx);
        let value = self.take_top().unwrap_or(JsValue::Undefined);
        match target.and_then(|ptr| self.heap.get_mut(ptr)) {
            Some(obj) => {
                obj.internal.set(&internal_key(key), value);
                true
            }
            None => false,
        }
    }

    pub fn get_internal_prop_string(&mut self, obj_idx: i32, key: &str) -> bool {
        let found = self
            .object_at(obj_idx)
            .and_then(|ptr| self.heap.get(ptr))
            .and_then(|obj| obj.internal.get(&internal_key(key)))
            .cloned();
        let exists = found.is_some();
        self.stack.push(found.unwrap_or(JsValue::Undefined));
        exists
    }

    /// Script-visible property names of the object at `obj_idx`.
    pub fn own_keys(&self, obj_idx: i32) -> Vec<String> {
        self.object_at(obj_idx)
            .and_then(|ptr| self.heap.get(ptr))
            .map(|obj| obj.props.keys().map(str::to_string).collect())
            .unwrap_or_default()
    }

    /// Pop a function and install it as the finalizer of the object at `obj_idx`.
    pub fn set_finalizer(&mut self, obj_idx: i32) -> bool {
        let target = self.object_at(obj_idx);
        let finalizer = self.take_top().unwrap_or(JsValue::Undefined);
        match target.and_then(|ptr| self.heap.get_mut(ptr)) {
            Some(obj) => {
                obj.internal.set(FINALIZER_PROP, finalizer);
                true
            }
            None => false,
        }
    }

    pub fn put_global_string(&mut self, key: &str) {
        let value = self.take_top().unwrap_or(JsValue::Undefined);
        if let Some(global) = self.heap.get_mut(self.global) {
            global.props.set(key, value);
        }
    }

    pub fn get_global_string(&mut self, key: &str) -> bool {
        let found = self
            .heap
            .get(self.global)
            .and_then(|global| global.props.get(key))
            .cloned();
        let exists = found.is_some();
        self.stack.push(found.unwrap_or(JsValue::Undefined));
        exists
    }

    // =========================================================================
    // Errors and protected execution
    // =========================================================================

    /// Create an error of `kind` to be thrown when the running native
    /// function returns. Use as `return vm.throw_error(..)`.
    pub fn throw_error(&mut self, kind: ErrorKind, message: &str) -> i32 {
        let err = self.make_error(kind, message);
        self.pending_error = Some(err);
        kind.ret_code()
    }

    /// Compile and run `source`, leaving its result or the thrown value on
    /// the stack.
    pub fn peval_string(&mut self, source: &str) -> ExecStatus {
        match self.eval_source(source) {
            Ok(value) => {
                self.stack.push(value);
                ExecStatus::Success
            }
            Err(err) => {
                self.stack.push(err);
                ExecStatus::Error
            }
        }
    }

    /// Call the function below the top `nargs` values, replacing function
    /// and arguments with the result or the thrown value.
    pub fn pcall(&mut self, nargs: usize) -> ExecStatus {
        let available = self.stack.len() - self.frame_base();
        let nargs = nargs.min(available.saturating_sub(1));
        let args = self.stack.split_off(self.stack.len() - nargs);
        let callee = self.take_top().unwrap_or(JsValue::Undefined);
        match self.call_value(callee, JsValue::Undefined, args) {
            Ok(value) => {
                self.stack.push(value);
                ExecStatus::Success
            }
            Err(err) => {
                self.stack.push(err);
                ExecStatus::Error
            }
        }
    }

    /// Force a full collection cycle.
    pub fn gc(&mut self) -> CollectStats {
        self.collect_garbage()
    }
}

fn internal_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 1);
    out.push(INTERNAL_PREFIX);
    out.push_str(key);
    out
}
