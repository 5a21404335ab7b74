//! Value coercions: ToNumber, ToString, ToBoolean and the equality and
//! ordering rules the interpreter applies to operands.

use std::cmp::Ordering;

use crate::vm::VM;
use crate::vm::value::{HeapData, JsValue};

/// Nesting limit when rendering arrays that contain arrays.
const MAX_RENDER_DEPTH: usize = 8;

pub fn to_number(value: &JsValue) -> f64 {
    match value {
        JsValue::Undefined => f64::NAN,
        JsValue::Null => 0.0,
        JsValue::Boolean(b) => f64::from(u8::from(*b)),
        JsValue::Number(n) => *n,
        JsValue::String(s) => string_to_number(s),
        JsValue::Object(_) | JsValue::Pointer(_) => f64::NAN,
    }
}

fn string_to_number(s: &str) -> f64 {
    let s = s.trim();
    if s.is_empty() {
        return 0.0;
    }
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        return i64::from_str_radix(hex, 16).map_or(f64::NAN, |n| n as f64);
    }
    match s {
        "Infinity" | "+Infinity" => f64::INFINITY,
        "-Infinity" => f64::NEG_INFINITY,
        // Rust accepts spellings like "inf" and "nan" that scripts must not
        _ if s.chars().any(|c| c.is_ascii_alphabetic() && c != 'e' && c != 'E') => f64::NAN,
        _ => s.parse().unwrap_or(f64::NAN),
    }
}

/// ToInt32: modulo 2^32, then reinterpreted as signed.
pub fn to_int32(n: f64) -> i32 {
    if !n.is_finite() {
        return 0;
    }
    let wrapped = n.trunc().rem_euclid(4_294_967_296.0);
    wrapped as u32 as i32
}

pub fn number_to_string(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        if n > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else if n == 0.0 {
        "0".to_string()
    } else if n.fract() == 0.0 && n.abs() < 1e21 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

pub fn truthy(value: &JsValue) -> bool {
    match value {
        JsValue::Undefined | JsValue::Null => false,
        JsValue::Boolean(b) => *b,
        JsValue::Number(n) => *n != 0.0 && !n.is_nan(),
        JsValue::String(s) => !s.is_empty(),
        JsValue::Object(_) => true,
        JsValue::Pointer(addr) => *addr != 0,
    }
}

/// `===`
pub fn strict_equals(a: &JsValue, b: &JsValue) -> bool {
    match (a, b) {
        (JsValue::Number(x), JsValue::Number(y)) => x == y,
        _ => a == b,
    }
}

impl VM {
    /// `==`
    pub fn loose_equals(&self, a: &JsValue, b: &JsValue) -> bool {
        match (a, b) {
            (JsValue::Undefined | JsValue::Null, JsValue::Undefined | JsValue::Null) => true,
            (JsValue::Undefined | JsValue::Null, _) | (_, JsValue::Undefined | JsValue::Null) => {
                false
            }
            (JsValue::Number(_), JsValue::String(_))
            | (JsValue::String(_), JsValue::Number(_))
            | (JsValue::Boolean(_), _)
            | (_, JsValue::Boolean(_)) => {
                if matches!(a, JsValue::Object(_)) || matches!(b, JsValue::Object(_)) {
                    self.to_display_string(a) == self.to_display_string(b)
                } else {
                    to_number(a) == to_number(b)
                }
            }
            (JsValue::Object(_), JsValue::String(_) | JsValue::Number(_))
            | (JsValue::String(_) | JsValue::Number(_), JsValue::Object(_)) => {
                let (a, b) = (self.to_display_string(a), self.to_display_string(b));
                a == b
            }
            _ => strict_equals(a, b),
        }
    }

    /// Relational comparison; `None` when either side is NaN.
    pub fn compare(&self, a: &JsValue, b: &JsValue) -> Option<Ordering> {
        if let (JsValue::String(x), JsValue::String(y)) = (a, b) {
            return Some(x.cmp(y));
        }
        let (x, y) = match (a, b) {
            (JsValue::Object(_), _) | (_, JsValue::Object(_)) => (
                to_number(&JsValue::String(self.to_display_string(a))),
                to_number(&JsValue::String(self.to_display_string(b))),
            ),
            _ => (to_number(a), to_number(b)),
        };
        x.partial_cmp(&y)
    }

    pub fn type_of(&self, value: &JsValue) -> &'static str {
        match value {
            JsValue::Undefined => "undefined",
            JsValue::Null => "object",
            JsValue::Boolean(_) => "boolean",
            JsValue::Number(_) => "number",
            JsValue::String(_) => "string",
            JsValue::Pointer(_) => "pointer",
            JsValue::Object(ptr) => match self.heap.get(*ptr) {
                Some(obj) if obj.is_callable() => "function",
                _ => "object",
            },
        }
    }

    /// ToString as seen by scripts. Error objects render as `Name: message`.
    pub fn to_display_string(&self, value: &JsValue) -> String {
        self.render(value, 0)
    }

    fn render(&self, value: &JsValue, depth: usize) -> String {
        match value {
            JsValue::Undefined => "undefined".to_string(),
            JsValue::Null => "null".to_string(),
            JsValue::Boolean(b) => b.to_string(),
            JsValue::Number(n) => number_to_string(*n),
            JsValue::String(s) => s.clone(),
            JsValue::Pointer(addr) => format!("{:#x}", addr),
            JsValue::Object(ptr) => {
                let Some(obj) = self.heap.get(*ptr) else {
                    return "undefined".to_string();
                };
                match &obj.data {
                    HeapData::Error(kind) => {
                        let name = obj
                            .props
                            .get("name")
                            .map_or_else(|| kind.name().to_string(), |v| self.render(v, depth + 1));
                        let message = obj
                            .props
                            .get("message")
                            .map(|v| self.render(v, depth + 1))
                            .unwrap_or_default();
                        if message.is_empty() {
                            name
                        } else {
                            format!("{}: {}", name, message)
                        }
                    }
                    HeapData::Array(elements) if depth < MAX_RENDER_DEPTH => elements
                        .iter()
                        .map(|v| match v {
                            JsValue::Undefined | JsValue::Null => String::new(),
                            other => self.render(other, depth + 1),
                        })
                        .collect::<Vec<_>>()
                        .join(","),
                    HeapData::Array(_) => String::new(),
                    HeapData::Function(func) => {
                        format!("function {}() {{ [bytecode] }}", func.name)
                    }
                    HeapData::Native { .. } => "function () { [native code] }".to_string(),
                    HeapData::Object | HeapData::Scope { .. } => "[object Object]".to_string(),
                }
            }
        }
    }
}
