// Memory representation. Primitives are stored inline; everything with
// identity lives in a heap slot and is referenced by its index.
use crate::runtime::error::ErrorKind;
use crate::vm::VM;

/// Native function: reads its arguments and pushes results through the
/// stack API, then returns a result count or a negative `RET_*` code.
pub type NativeFn = fn(&mut VM) -> i32;

/// `nargs` value for native functions that take any number of arguments.
pub const VARARGS: i32 = -1;

/// First character of every internal property key. Keys carrying it are
/// kept apart from script-visible properties.
pub const INTERNAL_PREFIX: char = '\u{ff}';

/// Internal property holding an object's finalizer.
pub(crate) const FINALIZER_PROP: &str = "\u{ff}Finalizer";

#[derive(Debug, Clone, PartialEq)]
pub enum JsValue {
    Undefined,
    Null,
    Boolean(bool),
    Number(f64),
    String(String),
    /// Heap slot index.
    Object(usize),
    /// Opaque address. The engine stores and compares it, never reads through it.
    Pointer(usize),
}

impl JsValue {
    pub fn as_object(&self) -> Option<usize> {
        match self {
            JsValue::Object(ptr) => Some(*ptr),
            _ => None,
        }
    }
}

/// Type tag reported by [`VM::get_type`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Type {
    /// No value at the requested index.
    None,
    Undefined,
    Null,
    Boolean,
    Number,
    String,
    Object,
    Pointer,
}

impl Type {
    pub fn is_none(self) -> bool {
        self == Type::None
    }
    pub fn is_undefined(self) -> bool {
        self == Type::Undefined
    }
    pub fn is_null(self) -> bool {
        self == Type::Null
    }
    pub fn is_bool(self) -> bool {
        self == Type::Boolean
    }
    pub fn is_number(self) -> bool {
        self == Type::Number
    }
    pub fn is_string(self) -> bool {
        self == Type::String
    }
    pub fn is_object(self) -> bool {
        self == Type::Object
    }
    pub fn is_pointer(self) -> bool {
        self == Type::Pointer
    }
}

impl From<&JsValue> for Type {
    fn from(value: &JsValue) -> Self {
        match value {
            JsValue::Undefined => Type::Undefined,
            JsValue::Null => Type::Null,
            JsValue::Boolean(_) => Type::Boolean,
            JsValue::Number(_) => Type::Number,
            JsValue::String(_) => Type::String,
            JsValue::Object(_) => Type::Object,
            JsValue::Pointer(_) => Type::Pointer,
        }
    }
}

/// Insertion-ordered property storage. Objects are small, so a linear scan
/// beats hashing here.
#[derive(Debug, Clone, Default)]
pub struct PropertyMap {
    entries: Vec<(String, JsValue)>,
}

impl PropertyMap {
    pub fn get(&self, key: &str) -> Option<&JsValue> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    pub fn set(&mut self, key: &str, value: JsValue) {
        match self.entries.iter_mut().find(|(k, _)| k == key) {
            Some((_, slot)) => *slot = value,
            None => self.entries.push((key.to_string(), value)),
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<JsValue> {
        let pos = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(pos).1)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn values(&self) -> impl Iterator<Item = &JsValue> {
        self.entries.iter().map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A compiled script function closed over the scope it was created in.
#[derive(Debug, Clone)]
pub struct ScriptFunction {
    pub address: usize,
    pub params: Vec<String>,
    pub scope: usize,
    pub name: String,
    /// `this` captured at creation; set for arrow functions only.
    pub bound_this: Option<JsValue>,
}

#[derive(Debug, Clone)]
pub enum HeapData {
    Object,
    Array(Vec<JsValue>),
    Function(ScriptFunction),
    Native { func: NativeFn, nargs: i32 },
    Error(ErrorKind),
    /// Variable bindings of one activation; `parent` is the enclosing scope.
    Scope { parent: Option<usize> },
}

#[derive(Debug, Clone)]
pub struct HeapObject {
    pub data: HeapData,
    /// Script-visible properties.
    pub props: PropertyMap,
    /// Internal properties, keyed with [`INTERNAL_PREFIX`].
    pub internal: PropertyMap,
    pub(crate) marked: bool,
    pub(crate) finalized: bool,
}

impl HeapObject {
    pub fn new(data: HeapData) -> Self {
        Self {
            data,
            props: PropertyMap::default(),
            internal: PropertyMap::default(),
            marked: false,
            finalized: false,
        }
    }

    pub fn is_callable(&self) -> bool {
        matches!(self.data, HeapData::Function(_) | HeapData::Native { .. })
    }

    pub fn has_finalizer(&self) -> bool {
        self.internal.contains(FINALIZER_PROP)
    }

    /// Heap slots directly reachable from this object.
    pub(crate) fn children(&self) -> Vec<usize> {
        let mut out: Vec<usize> = self
            .props
            .values()
            .chain(self.internal.values())
            .filter_map(JsValue::as_object)
            .collect();
        match &self.data {
            HeapData::Array(elements) => out.extend(elements.iter().filter_map(JsValue::as_object)),
            HeapData::Function(func) => {
                out.push(func.scope);
                out.extend(func.bound_this.as_ref().and_then(JsValue::as_object));
            }
            HeapData::Scope { parent: Some(parent) } => out.push(*parent),
            _ => {}
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_property_map_keeps_insertion_order() {
        let mut props = PropertyMap::default();
        props.set("b", JsValue::Number(1.0));
        props.set("a", JsValue::Number(2.0));
        props.set("b", JsValue::Number(3.0));
        assert_eq!(props.keys().collect::<Vec<_>>(), vec!["b", "a"]);
        assert_eq!(props.get("b"), Some(&JsValue::Number(3.0)));
        assert_eq!(props.remove("b"), Some(JsValue::Number(3.0)));
        assert_eq!(props.len(), 1);
    }

    #[test]
    fn test_children_cover_internal_slots() {
        let mut obj = HeapObject::new(HeapData::Array(vec![JsValue::Object(4)]));
        obj.props.set("x", JsValue::Object(1));
        obj.internal.set(FINALIZER_PROP, JsValue::Object(2));
        obj.internal.set("\u{ff}key", JsValue::Pointer(0x10));
        let mut children = obj.children();
        children.sort();
        assert_eq!(children, vec![1, 2, 4]);
        assert!(obj.has_finalizer());
    }
}
