/*!
 * JSON
 * `JSON.stringify` through serde over script values, `JSON.parse` into charged values
 */

use super::interpreter::{enumerable_keys, Eval, Interpreter};
use super::value::*;
use serde::ser::{Serialize, SerializeMap, SerializeSeq, Serializer};
use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// Nesting accepted by `JSON.stringify`
const MAX_JSON_DEPTH: usize = 512;

/// Integers up to 2^53 serialize without a fractional part
const MAX_EXACT_INTEGER: f64 = 9_007_199_254_740_992.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum JsonFailure {
    Circular,
    TooDeep,
}

/// Values `JSON.stringify` omits from objects (and renders as `null` in arrays)
fn is_unserializable(value: &Value) -> bool {
    match value {
        Value::Undefined | Value::Function(_) | Value::Native(_) => true,
        Value::Host(HostObject::Module(_)) => true,
        Value::Host(host) => host.is_constructor(),
        _ => false,
    }
}

struct JsonWalk<'a> {
    interp: &'a Interpreter,
    value: &'a Value,
    depth: usize,
    seen: &'a RefCell<Vec<usize>>,
    failure: &'a Cell<Option<JsonFailure>>,
}

impl<'a> JsonWalk<'a> {
    fn child(&self, value: &'a Value) -> JsonWalk<'a> {
        JsonWalk {
            interp: self.interp,
            value,
            depth: self.depth + 1,
            seen: self.seen,
            failure: self.failure,
        }
    }

    fn enter<E: serde::ser::Error>(&self, id: usize) -> Result<(), E> {
        if self.depth >= MAX_JSON_DEPTH {
            self.failure.set(Some(JsonFailure::TooDeep));
            return Err(E::custom("maximum nesting depth exceeded"));
        }
        if self.seen.borrow().contains(&id) {
            self.failure.set(Some(JsonFailure::Circular));
            return Err(E::custom("converting circular structure"));
        }
        self.seen.borrow_mut().push(id);
        Ok(())
    }

    fn leave(&self) {
        self.seen.borrow_mut().pop();
    }
}

impl Serialize for JsonWalk<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.value {
            Value::Null => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Number(n) if !n.is_finite() => serializer.serialize_unit(),
            Value::Number(n) if n.fract() == 0.0 && n.abs() < MAX_EXACT_INTEGER => {
                serializer.serialize_i64(*n as i64)
            }
            Value::Number(n) => serializer.serialize_f64(*n),
            Value::Str(s) => serializer.serialize_str(s.as_str()),
            Value::Array(array) => {
                self.enter::<S::Error>(Rc::as_ptr(array) as usize)?;
                let items = array.snapshot();
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in &items {
                    seq.serialize_element(&self.child(item))?;
                }
                self.leave();
                seq.end()
            }
            Value::Object(object) => {
                self.enter::<S::Error>(Rc::as_ptr(object) as usize)?;
                let keys = enumerable_keys(object);
                let mut map = serializer.serialize_map(None)?;
                for key in keys {
                    let Some(item) = object.get(&key) else {
                        continue;
                    };
                    if is_unserializable(&item) {
                        continue;
                    }
                    map.serialize_entry(&*key, &self.child(&item))?;
                }
                self.leave();
                map.end()
            }
            Value::Bytes(bytes) => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry("type", "Buffer")?;
                map.serialize_entry("data", &*bytes.data())?;
                map.end()
            }
            Value::Host(HostObject::Env) => {
                let environment = &self.interp.ctx.environment;
                let mut map = serializer.serialize_map(None)?;
                for name in environment.enumerate() {
                    if let Ok(Some(value)) = environment.get(&name) {
                        map.serialize_entry(&name, &value)?;
                    }
                }
                map.end()
            }
            Value::Host(host) if !host.is_constructor() && !matches!(host, HostObject::Module(_)) => {
                serializer.serialize_map(Some(0))?.end()
            }
            // Only reachable inside arrays, where unserializable items become null
            _ => serializer.serialize_unit(),
        }
    }
}

impl Interpreter {
    /// Serialized text, or `None` for values `JSON.stringify` maps to undefined
    pub(super) fn to_json_text(
        &self,
        value: &Value,
        indent: Option<&str>,
    ) -> Result<Option<String>, JsonFailure> {
        if is_unserializable(value) {
            return Ok(None);
        }
        let seen = RefCell::new(Vec::new());
        let failure = Cell::new(None);
        let walk = JsonWalk {
            interp: self,
            value,
            depth: 0,
            seen: &seen,
            failure: &failure,
        };
        let result = match indent {
            None => serde_json::to_string(&walk),
            Some(indent) => {
                let mut buf = Vec::new();
                let formatter = serde_json::ser::PrettyFormatter::with_indent(indent.as_bytes());
                let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
                walk.serialize(&mut serializer)
                    .map(|_| String::from_utf8_lossy(&buf).into_owned())
            }
        };
        match result {
            Ok(text) => Ok(Some(text)),
            Err(_) => Err(failure.get().unwrap_or(JsonFailure::TooDeep)),
        }
    }

    pub(super) fn json_stringify(&mut self, args: &[Value]) -> Eval<Value> {
        let value = args.first().cloned().unwrap_or(Value::Undefined);
        let indent = match args.get(2) {
            Some(Value::Number(n)) if *n >= 1.0 => Some(" ".repeat(n.min(10.0) as usize)),
            Some(Value::Str(s)) if !s.as_str().is_empty() => {
                Some(s.as_str().chars().take(10).collect())
            }
            _ => None,
        };
        match self.to_json_text(&value, indent.as_deref()) {
            Ok(Some(text)) => self.alloc_str(text),
            Ok(None) => Ok(Value::Undefined),
            Err(JsonFailure::Circular) => {
                Err(self.type_error("Converting circular structure to JSON"))
            }
            Err(JsonFailure::TooDeep) => Err(self.range_error("Maximum call stack size exceeded")),
        }
    }

    pub(super) fn json_parse(&mut self, text: &Value) -> Eval<Value> {
        let source = text.to_display();
        let parsed: serde_json::Value = serde_json::from_str(&source).map_err(|e| {
            self.throw(
                "SyntaxError",
                format!(
                    "Unexpected token in JSON at line {} column {}",
                    e.line(),
                    e.column()
                ),
            )
        })?;
        self.from_json(&parsed)
    }

    fn from_json(&self, value: &serde_json::Value) -> Eval<Value> {
        Ok(match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => self.alloc_str(s.clone())?,
            serde_json::Value::Array(items) => {
                let items = items
                    .iter()
                    .map(|item| self.from_json(item))
                    .collect::<Eval<Vec<Value>>>()?;
                self.alloc_array(items)?
            }
            serde_json::Value::Object(map) => {
                let mut entries = Vec::with_capacity(map.len());
                for (key, item) in map {
                    entries.push((Rc::from(key.as_str()), self.from_json(item)?));
                }
                self.alloc_object(entries)?
            }
        })
    }
}
