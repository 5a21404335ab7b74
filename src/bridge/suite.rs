use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::bridge::handle::push_bridged_function;
use crate::bridge::{BridgedFunction, HostFn};
use crate::runtime::error::EngineError;
use crate::vm::VM;

/// Named host callables handed to a script as the methods of one object.
#[derive(Clone, Default)]
pub struct MethodSuite {
    methods: BTreeMap<String, Arc<HostFn>>,
}

impl MethodSuite {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`insert`](Self::insert).
    pub fn with(
        mut self,
        name: impl Into<String>,
        f: impl Fn(&mut VM) -> i32 + Send + Sync + 'static,
    ) -> Self {
        self.insert(name, f);
        self
    }

    pub fn insert(
        &mut self,
        name: impl Into<String>,
        f: impl Fn(&mut VM) -> i32 + Send + Sync + 'static,
    ) {
        self.methods.insert(name.into(), Arc::new(f));
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }
}

impl fmt::Debug for MethodSuite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.names()).finish()
    }
}

impl VM {
    /// Evaluate `source` and call the resulting function with one object
    /// whose properties are the suite's methods.
    ///
    /// On success the call's return value is left on top of the stack.
    /// Each method is bridged afresh for this call and released once the
    /// collector finds the object unreachable.
    pub fn eval_with_suite(
        &mut self,
        source: &str,
        suite: &MethodSuite,
    ) -> Result<(), EngineError> {
        if self.peval_string(source).is_error() {
            let message = self.safe_to_string(-1);
            return Err(EngineError::Evaluation(message));
        }

        self.push_object();
        for (name, f) in &suite.methods {
            let func = Arc::new(BridgedFunction::from_shared(f.clone()));
            if let Err(err) = push_bridged_function(self, func) {
                self.pop_n(2);
                return Err(err.into());
            }
            self.put_prop_string(-2, name);
        }

        if self.pcall(1).is_error() {
            let message = self.safe_to_string(-1);
            return Err(EngineError::Call(message));
        }
        Ok(())
    }
}
