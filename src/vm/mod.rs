//! Stack-based bytecode interpreter
//!
//! Compiled units are appended to one flat program. Script calls run inside
//! the dispatch loop; native functions and host entry points re-enter it
//! through [`VM::call_value`], which pushes a frame returning to
//! [`RETURN_TO_HOST`] and runs until that frame returns or throws.
//!
//! The collector only runs at the top of the dispatch loop (or on an
//! explicit [`VM::gc`]), so every object reachable from a Rust local during
//! an instruction is safe until the next instruction starts.

mod api;
pub mod coerce;
pub mod opcodes;
mod stdlib_setup;
pub mod value;

use std::any::Any;
use std::cmp::Ordering;
use std::sync::Arc;

use log::{debug, trace, warn};

use crate::bridge::Bridge;
use crate::compiler;
use crate::runtime::error::ErrorKind;
use crate::runtime::heap::{CollectStats, Heap, HeapConfig};
use crate::vm::coerce::{strict_equals, to_int32, to_number, truthy};
use crate::vm::opcodes::OpCode;
use crate::vm::value::{
    FINALIZER_PROP, HeapData, HeapObject, JsValue, NativeFn, ScriptFunction, VARARGS,
};

/// Return address of a frame entered from the host.
const RETURN_TO_HOST: usize = usize::MAX;

/// Finalizers may attach finalizers to other objects; teardown gives up
/// after this many rounds.
const TEARDOWN_FINALIZER_ROUNDS: usize = 16;

pub struct Frame {
    pub return_address: usize,
    /// Innermost variable scope (the global object at top level).
    pub scope: usize,
    pub this_context: JsValue,
    /// Value stack height when the frame was entered.
    pub stack_base: usize,
    /// Value of the last top-level expression statement.
    pub completion: JsValue,
    /// Object under construction when called through `new`.
    pub constructing: Option<usize>,
}

/// Activation of a native function.
pub(crate) struct NativeFrame {
    pub func: usize,
    pub this: JsValue,
    /// Index of the first argument on the value stack.
    pub base: usize,
}

/// Exception handler entry for try/catch blocks
#[derive(Clone)]
pub struct ExceptionHandler {
    pub catch_addr: usize,
    /// Stack depth when the try block was entered
    pub stack_depth: usize,
    /// Call stack depth when the try block was entered
    pub call_stack_depth: usize,
}

pub struct VM {
    pub stack: Vec<JsValue>,
    pub call_stack: Vec<Frame>,
    pub heap: Heap,
    pub program: Vec<OpCode>,
    /// Offset of every unit still loaded in `program`, ascending.
    unit_starts: Vec<usize>,
    pub ip: usize,
    pub exception_handlers: Vec<ExceptionHandler>,
    pub(crate) native_frames: Vec<NativeFrame>,
    pub(crate) global: usize,
    /// Error raised by `throw_error`, delivered when the native returns.
    pub(crate) pending_error: Option<JsValue>,
    config: HeapConfig,
    gc_running: bool,
    host_data: Option<Arc<dyn Any + Send + Sync>>,
    /// Bridge owning this engine's host references.
    pub(crate) bridge: Option<Arc<Bridge>>,
    /// Set once a host reference was registered through `bridge`; from then
    /// on the bridge can no longer be swapped.
    pub(crate) bridge_pinned: bool,
}

impl Default for VM {
    fn default() -> Self {
        Self::new()
    }
}

impl VM {
    pub fn new() -> Self {
        Self::with_config(HeapConfig::default())
    }

    pub fn with_config(config: HeapConfig) -> Self {
        let mut heap = Heap::new();
        let global = heap.alloc_data(HeapData::Object);
        let mut vm = Self {
            stack: Vec::new(),
            call_stack: Vec::new(),
            heap,
            program: Vec::new(),
            unit_starts: Vec::new(),
            ip: 0,
            exception_handlers: Vec::new(),
            native_frames: Vec::new(),
            global,
            pending_error: None,
            config,
            gc_running: false,
            host_data: None,
            bridge: None,
            bridge_pinned: false,
        };
        vm.setup_stdlib();
        vm
    }

    pub fn setup_stdlib(&mut self) {
        stdlib_setup::setup_stdlib(self);
    }

    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    /// Attach embedder state, retrievable from inside native functions.
    pub fn set_host_data(&mut self, data: Arc<dyn Any + Send + Sync>) {
        self.host_data = Some(data);
    }

    pub fn host_data(&self) -> Option<&Arc<dyn Any + Send + Sync>> {
        self.host_data.as_ref()
    }

    /// Append bytecode to the existing program and return the starting offset.
    /// Every address-carrying instruction is rebased onto the combined program.
    pub fn append_program(&mut self, bytecode: Vec<OpCode>) -> usize {
        let start_offset = self.program.len();
        self.program
            .extend(bytecode.into_iter().map(|op| op.rebase(start_offset)));
        self.unit_starts.push(start_offset);
        start_offset
    }

    /// Drop trailing units that no live function points into.
    ///
    /// Only done while no code is running, so the sole remaining references
    /// into the program are the entry addresses of script functions.
    /// Units are only dropped from the end, which keeps every surviving
    /// address valid.
    fn trim_program(&mut self) {
        if !self.call_stack.is_empty()
            || !self.native_frames.is_empty()
            || !self.exception_handlers.is_empty()
        {
            return;
        }
        let highest = self
            .heap
            .objects()
            .filter_map(|obj| match &obj.data {
                HeapData::Function(func) => Some(func.address),
                _ => None,
            })
            .max();
        let keep = self
            .unit_starts
            .iter()
            .position(|&start| highest.is_none_or(|addr| start > addr))
            .unwrap_or(self.unit_starts.len());
        let Some(&end) = self.unit_starts.get(keep) else {
            return;
        };
        trace!(
            "program: dropping {} unit(s), {} instructions",
            self.unit_starts.len() - keep,
            self.program.len() - end
        );
        self.unit_starts.truncate(keep);
        self.program.truncate(end);
    }

    /// Compile and run `source` at top level.
    ///
    /// The result is the completion value of the last expression statement.
    pub(crate) fn eval_source(&mut self, source: &str) -> Result<JsValue, JsValue> {
        let code = match compiler::compile(source) {
            Ok(code) => code,
            Err(err) => return Err(self.make_error(ErrorKind::Syntax, &err.to_string())),
        };
        self.trim_program();
        let entry = self.append_program(code);
        self.check_call_depth()?;
        self.call_stack.push(Frame {
            return_address: RETURN_TO_HOST,
            scope: self.global,
            this_context: JsValue::Object(self.global),
            stack_base: self.stack.len(),
            completion: JsValue::Undefined,
            constructing: None,
        });
        self.enter(entry)
    }

    /// Call a function value from native code or the host.
    pub(crate) fn call_value(
        &mut self,
        callee: JsValue,
        this: JsValue,
        args: Vec<JsValue>,
    ) -> Result<JsValue, JsValue> {
        let ptr = self.callable(&callee)?;
        self.check_call_depth()?;
        match self.heap.get(ptr).map(|obj| obj.data.clone()) {
            Some(HeapData::Function(func)) => {
                self.push_script_frame(&func, this, args, RETURN_TO_HOST, None);
                self.enter(func.address)
            }
            Some(HeapData::Native { func, nargs }) => self.call_native(ptr, func, nargs, this, args),
            _ => Err(self.make_error(ErrorKind::Type, "not a function")),
        }
    }

    /// Run from `address` until the frame on top of the call stack returns.
    fn enter(&mut self, address: usize) -> Result<JsValue, JsValue> {
        let saved_ip = self.ip;
        self.ip = address;
        let result = self.run_until_return_sentinel();
        self.ip = saved_ip;
        result
    }

    fn run_until_return_sentinel(&mut self) -> Result<JsValue, JsValue> {
        let entry_depth = self.call_stack.len();
        let handler_floor = self.exception_handlers.len();
        loop {
            if !self.gc_running && self.heap.should_collect(self.config.gc_threshold) {
                self.collect_garbage();
            }
            match self.exec_one() {
                Ok(ExecResult::Continue) => self.ip += 1,
                Ok(ExecResult::ContinueNoIpInc) => {}
                Ok(ExecResult::Stop) => return Ok(self.pop_value()),
                Err(exception) => {
                    // Handlers below the floor belong to an outer run.
                    if self.exception_handlers.len() > handler_floor
                        && let Some(handler) = self.exception_handlers.pop()
                    {
                        self.call_stack.truncate(handler.call_stack_depth);
                        self.stack.truncate(handler.stack_depth);
                        self.stack.push(exception);
                        self.ip = handler.catch_addr;
                        continue;
                    }
                    let base = self
                        .call_stack
                        .get(entry_depth.saturating_sub(1))
                        .map_or(0, |frame| frame.stack_base);
                    self.call_stack.truncate(entry_depth.saturating_sub(1));
                    self.stack.truncate(base);
                    return Err(exception);
                }
            }
        }
    }

    fn exec_one(&mut self) -> Result<ExecResult, JsValue> {
        let Some(op) = self.program.get(self.ip).cloned() else {
            return Err(self.make_error(ErrorKind::Error, "instruction pointer out of range"));
        };
        match op {
            OpCode::Push(value) => self.stack.push(value),
            OpCode::Pop => {
                self.stack.pop();
            }
            OpCode::Dup => {
                let top = self.stack.last().cloned().unwrap_or(JsValue::Undefined);
                self.stack.push(top);
            }
            OpCode::Dup2 => {
                let len = self.stack.len();
                if len >= 2 {
                    self.stack.extend_from_within(len - 2..);
                }
            }
            OpCode::LoadThis => {
                let this = self
                    .call_stack
                    .last()
                    .map_or(JsValue::Undefined, |frame| frame.this_context.clone());
                self.stack.push(this);
            }

            OpCode::Declare(name) => {
                let value = self.pop_value();
                let scope = self.current_scope();
                if let Some(obj) = self.heap.get_mut(scope) {
                    obj.props.set(&name, value);
                }
            }
            OpCode::Store(name) => {
                let value = self.pop_value();
                let scope = self.resolve(&name).unwrap_or(self.global);
                if let Some(obj) = self.heap.get_mut(scope) {
                    obj.props.set(&name, value);
                }
            }
            OpCode::Load(name) => {
                let value = self.lookup(&name)?;
                self.stack.push(value);
            }
            OpCode::TypeOfName(name) => {
                let kind = match self.resolve(&name) {
                    Some(scope) => {
                        let value = self.binding(scope, &name);
                        self.type_of(&value)
                    }
                    None => "undefined",
                };
                self.stack.push(JsValue::String(kind.to_string()));
            }
            OpCode::Completion => {
                let value = self.pop_value();
                if let Some(frame) = self.call_stack.last_mut() {
                    frame.completion = value;
                }
            }
            OpCode::LoadCompletion => {
                let value = self
                    .call_stack
                    .last()
                    .map_or(JsValue::Undefined, |frame| frame.completion.clone());
                self.stack.push(value);
            }

            OpCode::NewObject => {
                let ptr = self.heap.alloc_data(HeapData::Object);
                self.stack.push(JsValue::Object(ptr));
            }
            OpCode::NewArray => {
                let ptr = self.heap.alloc_data(HeapData::Array(Vec::new()));
                self.stack.push(JsValue::Object(ptr));
            }
            OpCode::SetProp(name) => {
                let value = self.pop_value();
                let target = self.pop_value();
                self.set_property(&target, &name, value.clone())?;
                self.stack.push(value);
            }
            OpCode::GetProp(name) => {
                let target = self.pop_value();
                let value = self.get_property(&target, &name)?;
                self.stack.push(value);
            }
            OpCode::SetPropComputed => {
                let value = self.pop_value();
                let key = self.pop_value();
                let target = self.pop_value();
                let key = self.to_display_string(&key);
                self.set_property(&target, &key, value.clone())?;
                self.stack.push(value);
            }
            OpCode::GetPropComputed => {
                let key = self.pop_value();
                let target = self.pop_value();
                let key = self.to_display_string(&key);
                let value = self.get_property(&target, &key)?;
                self.stack.push(value);
            }
            OpCode::ArrayPush => {
                let value = self.pop_value();
                if let Some(JsValue::Object(ptr)) = self.stack.last()
                    && let Some(HeapObject {
                        data: HeapData::Array(elements),
                        ..
                    }) = self.heap.get_mut(*ptr)
                {
                    elements.push(value);
                }
            }
            OpCode::MakeFunction {
                address,
                params,
                name,
                arrow,
            } => {
                let bound_this = if arrow {
                    Some(
                        self.call_stack
                            .last()
                            .map_or(JsValue::Undefined, |frame| frame.this_context.clone()),
                    )
                } else {
                    None
                };
                let func = ScriptFunction {
                    address,
                    params,
                    scope: self.current_scope(),
                    name,
                    bound_this,
                };
                let ptr = self.heap.alloc_data(HeapData::Function(func));
                self.stack.push(JsValue::Object(ptr));
            }

            OpCode::Call(arg_count) => {
                let args = self.pop_args(arg_count);
                let callee = self.pop_value();
                let this = self.pop_value();
                return self.invoke(callee, this, args);
            }
            OpCode::Construct(arg_count) => {
                let args = self.pop_args(arg_count);
                let callee = self.pop_value();
                return self.construct(callee, args);
            }
            OpCode::Return => {
                let mut result = self.pop_value();
                let Some(frame) = self.call_stack.pop() else {
                    self.stack.push(result);
                    return Ok(ExecResult::Stop);
                };
                let depth = self.call_stack.len();
                while self
                    .exception_handlers
                    .last()
                    .is_some_and(|handler| handler.call_stack_depth > depth)
                {
                    self.exception_handlers.pop();
                }
                self.stack.truncate(frame.stack_base);
                if let Some(obj) = frame.constructing
                    && !matches!(result, JsValue::Object(_))
                {
                    result = JsValue::Object(obj);
                }
                self.stack.push(result);
                if frame.return_address == RETURN_TO_HOST {
                    return Ok(ExecResult::Stop);
                }
                self.ip = frame.return_address;
                return Ok(ExecResult::ContinueNoIpInc);
            }

            OpCode::Jump(addr) => {
                self.ip = addr;
                return Ok(ExecResult::ContinueNoIpInc);
            }
            OpCode::JumpIfFalse(addr) => {
                if !truthy(&self.pop_value()) {
                    self.ip = addr;
                    return Ok(ExecResult::ContinueNoIpInc);
                }
            }
            OpCode::JumpIfTrue(addr) => {
                if truthy(&self.pop_value()) {
                    self.ip = addr;
                    return Ok(ExecResult::ContinueNoIpInc);
                }
            }

            OpCode::Add => {
                let (a, b) = self.pop_pair();
                let result = match (&a, &b) {
                    (JsValue::String(_) | JsValue::Object(_), _)
                    | (_, JsValue::String(_) | JsValue::Object(_)) => JsValue::String(format!(
                        "{}{}",
                        self.to_display_string(&a),
                        self.to_display_string(&b)
                    )),
                    _ => JsValue::Number(to_number(&a) + to_number(&b)),
                };
                self.stack.push(result);
            }
            OpCode::Sub => self.numeric_binary(|a, b| a - b),
            OpCode::Mul => self.numeric_binary(|a, b| a * b),
            OpCode::Div => self.numeric_binary(|a, b| a / b),
            OpCode::Mod => self.numeric_binary(|a, b| a % b),
            OpCode::Pow => self.numeric_binary(f64::powf),
            OpCode::Neg => {
                let value = self.pop_value();
                self.stack.push(JsValue::Number(-to_number(&value)));
            }
            OpCode::Plus => {
                let value = self.pop_value();
                self.stack.push(JsValue::Number(to_number(&value)));
            }
            OpCode::Not => {
                let value = self.pop_value();
                self.stack.push(JsValue::Boolean(!truthy(&value)));
            }
            OpCode::BitNot => {
                let value = self.pop_value();
                self.stack
                    .push(JsValue::Number(f64::from(!to_int32(to_number(&value)))));
            }
            OpCode::TypeOf => {
                let value = self.pop_value();
                let kind = self.type_of(&value);
                self.stack.push(JsValue::String(kind.to_string()));
            }
            OpCode::Eq => {
                let (a, b) = self.pop_pair();
                self.stack.push(JsValue::Boolean(strict_equals(&a, &b)));
            }
            OpCode::Ne => {
                let (a, b) = self.pop_pair();
                self.stack.push(JsValue::Boolean(!strict_equals(&a, &b)));
            }
            OpCode::EqEq => {
                let (a, b) = self.pop_pair();
                let result = self.loose_equals(&a, &b);
                self.stack.push(JsValue::Boolean(result));
            }
            OpCode::NeEq => {
                let (a, b) = self.pop_pair();
                let result = !self.loose_equals(&a, &b);
                self.stack.push(JsValue::Boolean(result));
            }
            OpCode::Lt => self.relational(|ord| ord == Ordering::Less),
            OpCode::LtEq => self.relational(|ord| ord != Ordering::Greater),
            OpCode::Gt => self.relational(|ord| ord == Ordering::Greater),
            OpCode::GtEq => self.relational(|ord| ord != Ordering::Less),
            OpCode::BitAnd => self.int32_binary(|a, b| f64::from(a & b)),
            OpCode::BitOr => self.int32_binary(|a, b| f64::from(a | b)),
            OpCode::Xor => self.int32_binary(|a, b| f64::from(a ^ b)),
            OpCode::ShiftLeft => self.int32_binary(|a, b| f64::from(a.wrapping_shl(b as u32 & 31))),
            OpCode::ShiftRight => {
                self.int32_binary(|a, b| f64::from(a.wrapping_shr(b as u32 & 31)))
            }
            OpCode::ShiftRightUnsigned => {
                self.int32_binary(|a, b| f64::from((a as u32).wrapping_shr(b as u32 & 31)))
            }

            // === Exception handling ===
            OpCode::Throw => return Err(self.pop_value()),
            OpCode::SetupTry { catch_addr } => {
                self.exception_handlers.push(ExceptionHandler {
                    catch_addr,
                    stack_depth: self.stack.len(),
                    call_stack_depth: self.call_stack.len(),
                });
            }
            OpCode::PopTry => {
                self.exception_handlers.pop();
            }
        }
        Ok(ExecResult::Continue)
    }

    // =========================================================================
    // Calls
    // =========================================================================

    fn invoke(
        &mut self,
        callee: JsValue,
        this: JsValue,
        args: Vec<JsValue>,
    ) -> Result<ExecResult, JsValue> {
        let ptr = self.callable(&callee)?;
        self.check_call_depth()?;
        match self.heap.get(ptr).map(|obj| obj.data.clone()) {
            Some(HeapData::Function(func)) => {
                self.push_script_frame(&func, this, args, self.ip + 1, None);
                self.ip = func.address;
                Ok(ExecResult::ContinueNoIpInc)
            }
            Some(HeapData::Native { func, nargs }) => {
                let result = self.call_native(ptr, func, nargs, this, args)?;
                self.stack.push(result);
                Ok(ExecResult::Continue)
            }
            _ => Err(self.make_error(ErrorKind::Type, "not a function")),
        }
    }

    fn construct(&mut self, callee: JsValue, args: Vec<JsValue>) -> Result<ExecResult, JsValue> {
        let ptr = self.callable(&callee)?;
        self.check_call_depth()?;
        match self.heap.get(ptr).map(|obj| obj.data.clone()) {
            Some(HeapData::Function(func)) if func.bound_this.is_none() => {
                let obj = self.heap.alloc_data(HeapData::Object);
                self.push_script_frame(&func, JsValue::Object(obj), args, self.ip + 1, Some(obj));
                self.ip = func.address;
                Ok(ExecResult::ContinueNoIpInc)
            }
            Some(HeapData::Native { func, nargs }) => {
                let obj = self.heap.alloc_data(HeapData::Object);
                let result = self.call_native(ptr, func, nargs, JsValue::Object(obj), args)?;
                let result = match result {
                    JsValue::Object(_) => result,
                    _ => JsValue::Object(obj),
                };
                self.stack.push(result);
                Ok(ExecResult::Continue)
            }
            _ => Err(self.make_error(ErrorKind::Type, "not a constructor")),
        }
    }

    fn push_script_frame(
        &mut self,
        func: &ScriptFunction,
        this: JsValue,
        args: Vec<JsValue>,
        return_address: usize,
        constructing: Option<usize>,
    ) {
        let mut scope = HeapObject::new(HeapData::Scope {
            parent: Some(func.scope),
        });
        let mut args = args.into_iter();
        for param in &func.params {
            scope
                .props
                .set(param, args.next().unwrap_or(JsValue::Undefined));
        }
        let scope = self.heap.alloc(scope);
        self.call_stack.push(Frame {
            return_address,
            scope,
            this_context: func.bound_this.clone().unwrap_or(this),
            stack_base: self.stack.len(),
            completion: JsValue::Undefined,
            constructing,
        });
    }

    /// Run a native function under the engine calling convention.
    fn call_native(
        &mut self,
        ptr: usize,
        func: NativeFn,
        nargs: i32,
        this: JsValue,
        mut args: Vec<JsValue>,
    ) -> Result<JsValue, JsValue> {
        if nargs != VARARGS {
            args.resize(usize::try_from(nargs).unwrap_or(0), JsValue::Undefined);
        }
        let base = self.stack.len();
        self.stack.extend(args);
        self.native_frames.push(NativeFrame {
            func: ptr,
            this,
            base,
        });
        let rc = func(self);
        self.native_frames.pop();

        let pending = self.pending_error.take();
        let result = match rc {
            rc if rc > 0 => Ok(if self.stack.len() > base {
                self.stack.last().cloned().unwrap_or(JsValue::Undefined)
            } else {
                JsValue::Undefined
            }),
            0 => Ok(JsValue::Undefined),
            rc => Err(match pending {
                Some(err) => err,
                None => {
                    let kind = ErrorKind::from_ret_code(rc);
                    self.make_error(kind, &format!("native function failed ({})", rc))
                }
            }),
        };
        self.stack.truncate(base);
        result
    }

    fn callable(&mut self, value: &JsValue) -> Result<usize, JsValue> {
        if let JsValue::Object(ptr) = value
            && self.heap.get(*ptr).is_some_and(HeapObject::is_callable)
        {
            return Ok(*ptr);
        }
        let kind = self.type_of(value);
        Err(self.make_error(ErrorKind::Type, &format!("{} is not a function", kind)))
    }

    fn check_call_depth(&mut self) -> Result<(), JsValue> {
        if self.call_stack.len() + self.native_frames.len() >= self.config.max_call_depth {
            return Err(self.make_error(ErrorKind::Range, "call stack size exceeded"));
        }
        Ok(())
    }

    /// Allocate an error object of the given class.
    pub(crate) fn make_error(&mut self, kind: ErrorKind, message: &str) -> JsValue {
        let mut obj = HeapObject::new(HeapData::Error(kind));
        obj.props
            .set("name", JsValue::String(kind.name().to_string()));
        obj.props
            .set("message", JsValue::String(message.to_string()));
        JsValue::Object(self.heap.alloc(obj))
    }

    // =========================================================================
    // Variables and properties
    // =========================================================================

    fn current_scope(&self) -> usize {
        self.call_stack
            .last()
            .map_or(self.global, |frame| frame.scope)
    }

    /// Scope object holding the binding for `name`, innermost first.
    fn resolve(&self, name: &str) -> Option<usize> {
        let mut current = self.current_scope();
        loop {
            let obj = self.heap.get(current)?;
            if obj.props.contains(name) {
                return Some(current);
            }
            match obj.data {
                HeapData::Scope {
                    parent: Some(parent),
                } => current = parent,
                _ => return None,
            }
        }
    }

    fn binding(&self, scope: usize, name: &str) -> JsValue {
        self.heap
            .get(scope)
            .and_then(|obj| obj.props.get(name))
            .cloned()
            .unwrap_or(JsValue::Undefined)
    }

    fn lookup(&mut self, name: &str) -> Result<JsValue, JsValue> {
        match self.resolve(name) {
            Some(scope) => Ok(self.binding(scope, name)),
            None => Err(self.make_error(
                ErrorKind::Reference,
                &format!("{} is not defined", name),
            )),
        }
    }

    pub(crate) fn get_property(&mut self, target: &JsValue, key: &str) -> Result<JsValue, JsValue> {
        match target {
            JsValue::Object(ptr) => Ok(self.object_property(*ptr, key)),
            JsValue::String(s) => Ok(match key {
                "length" => JsValue::Number(s.chars().count() as f64),
                _ => key
                    .parse::<usize>()
                    .ok()
                    .and_then(|i| s.chars().nth(i))
                    .map_or(JsValue::Undefined, |c| JsValue::String(c.to_string())),
            }),
            JsValue::Undefined | JsValue::Null => {
                let msg = format!(
                    "cannot read property '{}' of {}",
                    key,
                    self.to_display_string(target)
                );
                Err(self.make_error(ErrorKind::Type, &msg))
            }
            _ => Ok(JsValue::Undefined),
        }
    }

    fn object_property(&self, ptr: usize, key: &str) -> JsValue {
        let Some(obj) = self.heap.get(ptr) else {
            return JsValue::Undefined;
        };
        if let HeapData::Array(elements) = &obj.data {
            if key == "length" {
                return JsValue::Number(elements.len() as f64);
            }
            if let Ok(index) = key.parse::<usize>() {
                return elements.get(index).cloned().unwrap_or(JsValue::Undefined);
            }
        }
        obj.props.get(key).cloned().unwrap_or(JsValue::Undefined)
    }

    pub(crate) fn set_property(
        &mut self,
        target: &JsValue,
        key: &str,
        value: JsValue,
    ) -> Result<(), JsValue> {
        match target {
            JsValue::Object(ptr) => {
                let Some(obj) = self.heap.get_mut(*ptr) else {
                    return Ok(());
                };
                if let HeapData::Array(elements) = &mut obj.data {
                    if let Ok(index) = key.parse::<usize>() {
                        if index >= elements.len() {
                            elements.resize(index + 1, JsValue::Undefined);
                        }
                        elements[index] = value;
                        return Ok(());
                    }
                    if key == "length" {
                        let len = to_number(&value);
                        if len >= 0.0 && len.fract() == 0.0 {
                            elements.resize(len as usize, JsValue::Undefined);
                            return Ok(());
                        }
                        return Err(self.make_error(ErrorKind::Range, "invalid array length"));
                    }
                }
                obj.props.set(key, value);
                Ok(())
            }
            JsValue::Undefined | JsValue::Null => {
                let msg = format!(
                    "cannot set property '{}' of {}",
                    key,
                    self.to_display_string(target)
                );
                Err(self.make_error(ErrorKind::Type, &msg))
            }
            _ => Ok(()),
        }
    }

    // =========================================================================
    // Garbage collection
    // =========================================================================

    fn roots(&self) -> Vec<usize> {
        let mut roots = vec![self.global];
        roots.extend(self.stack.iter().filter_map(JsValue::as_object));
        for frame in &self.call_stack {
            roots.push(frame.scope);
            roots.extend(frame.this_context.as_object());
            roots.extend(frame.completion.as_object());
            roots.extend(frame.constructing);
        }
        for frame in &self.native_frames {
            roots.push(frame.func);
            roots.extend(frame.this.as_object());
        }
        roots.extend(self.pending_error.as_ref().and_then(JsValue::as_object));
        roots
    }

    /// Run one full collection cycle, including queued finalizers.
    pub(crate) fn collect_garbage(&mut self) -> CollectStats {
        if self.gc_running {
            return CollectStats::default();
        }
        self.gc_running = true;

        let roots = self.roots();
        self.heap.mark(roots);
        let finalizable = self.heap.unmarked_finalizable();
        // Keep them and everything they reference alive until their
        // finalizers have run.
        self.heap.mark(finalizable.clone());
        let freed = self.heap.sweep();
        for &ptr in &finalizable {
            self.run_finalizer(ptr);
        }

        self.gc_running = false;
        self.trim_program();
        debug!(
            "gc: freed {} objects, finalized {}, {} live",
            freed,
            finalizable.len(),
            self.heap.live_count()
        );
        CollectStats {
            freed,
            finalizable: finalizable.len(),
        }
    }

    fn run_finalizer(&mut self, ptr: usize) {
        let finalizer = self
            .heap
            .get(ptr)
            .and_then(|obj| obj.internal.get(FINALIZER_PROP))
            .cloned();
        self.heap.set_finalized(ptr);
        let Some(finalizer) = finalizer else {
            return;
        };
        trace!("running finalizer for object {}", ptr);
        if let Err(err) = self.call_value(finalizer, JsValue::Undefined, vec![JsValue::Object(ptr)])
        {
            warn!("finalizer failed: {}", self.to_display_string(&err));
        }
    }

    /// Record the interpreter state so a native function can recover after
    /// host code unwound through nested engine runs.
    pub(crate) fn unwind_mark(&self) -> UnwindMark {
        UnwindMark {
            stack: self.stack.len(),
            call_stack: self.call_stack.len(),
            native_frames: self.native_frames.len(),
            handlers: self.exception_handlers.len(),
            ip: self.ip,
            gc_running: self.gc_running,
        }
    }

    pub(crate) fn unwind_to(&mut self, mark: UnwindMark) {
        self.stack.truncate(mark.stack);
        self.call_stack.truncate(mark.call_stack);
        self.native_frames.truncate(mark.native_frames);
        self.exception_handlers.truncate(mark.handlers);
        self.ip = mark.ip;
        self.gc_running = mark.gc_running;
        self.pending_error = None;
    }

    // =========================================================================
    // Stack helpers
    // =========================================================================

    fn pop_value(&mut self) -> JsValue {
        self.stack.pop().unwrap_or(JsValue::Undefined)
    }

    fn pop_pair(&mut self) -> (JsValue, JsValue) {
        let b = self.pop_value();
        let a = self.pop_value();
        (a, b)
    }

    fn pop_args(&mut self, count: usize) -> Vec<JsValue> {
        let at = self.stack.len().saturating_sub(count);
        self.stack.split_off(at)
    }

    fn numeric_binary(&mut self, op: impl Fn(f64, f64) -> f64) {
        let (a, b) = self.pop_pair();
        self.stack
            .push(JsValue::Number(op(to_number(&a), to_number(&b))));
    }

    fn int32_binary(&mut self, op: impl Fn(i32, i32) -> f64) {
        let (a, b) = self.pop_pair();
        let result = op(to_int32(to_number(&a)), to_int32(to_number(&b)));
        self.stack.push(JsValue::Number(result));
    }

    fn relational(&mut self, test: impl Fn(Ordering) -> bool) {
        let (a, b) = self.pop_pair();
        let result = self.compare(&a, &b).is_some_and(test);
        self.stack.push(JsValue::Boolean(result));
    }
}

impl Drop for VM {
    /// Heap teardown: every finalizer that has not run yet runs now.
    fn drop(&mut self) {
        self.gc_running = true;
        for _ in 0..TEARDOWN_FINALIZER_ROUNDS {
            let pending = self.heap.all_finalizable();
            if pending.is_empty() {
                return;
            }
            for ptr in pending {
                self.run_finalizer(ptr);
            }
        }
        warn!("heap destroyed with finalizers still pending");
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct UnwindMark {
    stack: usize,
    call_stack: usize,
    native_frames: usize,
    handlers: usize,
    ip: usize,
    gc_running: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExecResult {
    Continue,
    ContinueNoIpInc,
    Stop,
}
