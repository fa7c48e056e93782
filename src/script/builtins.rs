/*!
 * Builtins
 * Global functions, host namespaces and methods on primitive and container values
 */

use super::heap::string_bytes;
use super::interpreter::{bound, describe_value, is_primitive, Eval, Interpreter};
use super::value::*;
use crate::core::limits::MAX_NESTING_DEPTH;
use crate::monitoring::probe::resident_set_bytes;
use crate::security::RestrictedModule;
use base64::Engine;
use std::cmp::Ordering;
use std::rc::Rc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Working directory scripts observe
const SANDBOX_CWD: &str = "/sandbox";

const RUNTIME_VERSION: &str = concat!("v", env!("CARGO_PKG_VERSION"), "-sandbox");

const ARRAY_METHODS: &[&str] = &[
    "push", "pop", "shift", "unshift", "slice", "splice", "concat", "join", "reverse", "indexOf",
    "lastIndexOf", "includes", "map", "filter", "forEach", "reduce", "find", "findIndex", "some",
    "every", "sort", "fill", "flat", "flatMap", "at", "toString",
];

const STRING_METHODS: &[&str] = &[
    "charAt", "charCodeAt", "indexOf", "lastIndexOf", "includes", "startsWith", "endsWith",
    "slice", "substring", "substr", "toUpperCase", "toLowerCase", "trim", "trimStart", "trimEnd",
    "split", "replace", "replaceAll", "repeat", "padStart", "padEnd", "concat", "at", "toString",
    "localeCompare",
];

const NUMBER_METHODS: &[&str] = &["toFixed", "toString"];
const OBJECT_METHODS: &[&str] = &["hasOwnProperty", "toString"];
const BYTES_METHODS: &[&str] = &["toString", "slice", "toJSON"];
const FUNCTION_METHODS: &[&str] = &["call", "apply"];

/// Process operations that are capability acquisitions
const PROCESS_CONTROL: &[&str] = &[
    "exit", "kill", "abort", "reallyExit", "binding", "dlopen", "chdir", "setuid", "setgid", "umask",
];

fn host_methods(host: &HostObject) -> &'static [&'static str] {
    match host {
        HostObject::Console => &["log", "info", "debug", "warn", "error"],
        HostObject::Math => &[
            "abs", "floor", "ceil", "round", "trunc", "sign", "sqrt", "cbrt", "pow", "min", "max",
            "random", "log", "log2", "log10", "exp", "sin", "cos", "tan", "atan", "atan2", "hypot",
        ],
        HostObject::Json => &["stringify", "parse"],
        HostObject::Object => &["keys", "values", "entries", "assign", "freeze", "fromEntries"],
        HostObject::Array => &["isArray", "from", "of"],
        HostObject::Number => &[
            "isInteger", "isFinite", "isNaN", "isSafeInteger", "parseFloat", "parseInt",
        ],
        HostObject::String => &["fromCharCode"],
        HostObject::Process => &["memoryUsage", "uptime", "cwd", "nextTick"],
        HostObject::Buffer => &["alloc", "from", "isBuffer", "byteLength"],
        HostObject::Date => &["now"],
        HostObject::Env | HostObject::Module(_) => &[],
    }
}

/// Whether `key` names a method reachable on `receiver`
pub(super) fn is_method_of(receiver: &Value, key: &str) -> bool {
    let table: &[&str] = match receiver {
        Value::Array(_) => ARRAY_METHODS,
        Value::Str(_) => STRING_METHODS,
        Value::Number(_) => NUMBER_METHODS,
        Value::Bool(_) => &["toString"],
        Value::Object(_) => OBJECT_METHODS,
        Value::Bytes(_) => BYTES_METHODS,
        Value::Function(_) | Value::Native(_) => FUNCTION_METHODS,
        _ => &[],
    };
    table.contains(&key)
}

#[inline]
fn arg(args: &[Value], index: usize) -> Value {
    args.get(index).cloned().unwrap_or(Value::Undefined)
}

/// ToIntegerOrInfinity
fn to_integer(value: &Value) -> f64 {
    let n = value.to_number();
    if n.is_nan() {
        0.0
    } else {
        n.trunc()
    }
}

/// Resolve a possibly negative index against `len`
fn relative_index(value: &Value, len: usize, default: usize) -> usize {
    if matches!(value, Value::Undefined) {
        return default;
    }
    let n = to_integer(value);
    let len = len as f64;
    let resolved = if n < 0.0 { (len + n).max(0.0) } else { n.min(len) };
    resolved as usize
}

/// `(start, end)` of `slice(start, end)`
fn slice_range(args: &[Value], len: usize) -> (usize, usize) {
    let start = relative_index(&arg(args, 0), len, 0);
    let end = relative_index(&arg(args, 1), len, len);
    (start, end.max(start))
}

impl Interpreter {
    // =========================================================================
    // Globals
    // =========================================================================

    pub(super) fn call_builtin(&mut self, builtin: Builtin, args: Vec<Value>) -> Eval<Value> {
        match builtin {
            Builtin::ParseInt => Ok(Value::Number(parse_int(
                &arg(&args, 0).to_display(),
                &arg(&args, 1),
            ))),
            Builtin::ParseFloat => Ok(Value::Number(parse_float(&arg(&args, 0).to_display()))),
            Builtin::IsNaN => Ok(Value::Bool(arg(&args, 0).to_number().is_nan())),
            Builtin::IsFinite => Ok(Value::Bool(arg(&args, 0).to_number().is_finite())),
            Builtin::Boolean => Ok(Value::Bool(arg(&args, 0).truthy())),
            Builtin::Error | Builtin::TypeError | Builtin::RangeError => {
                let message = match args.first() {
                    None | Some(Value::Undefined) => String::new(),
                    Some(value) => value.to_display(),
                };
                self.make_error(builtin.name(), &message)
            }
            Builtin::SetTimeout => self.schedule_timer("setTimeout", args, false),
            Builtin::SetInterval => self.schedule_timer("setInterval", args, true),
            Builtin::ClearTimeout | Builtin::ClearInterval => {
                self.clear_timer(&arg(&args, 0));
                Ok(Value::Undefined)
            }
            Builtin::Require => self.require(&args),
            Builtin::Eval | Builtin::Function => {
                let denial = self.ctx.capabilities.reject_dynamic_code(builtin.name());
                Err(self.denied(denial))
            }
        }
    }

    fn require(&mut self, args: &[Value]) -> Eval<Value> {
        let Some(name) = args.first().and_then(Value::as_str).map(str::to_string) else {
            return Err(self.type_error("The \"id\" argument must be of type string"));
        };
        match self.ctx.capabilities.acquire(&name) {
            Ok(module) => Ok(Value::Host(HostObject::Module(Rc::new(module)))),
            Err(denial) => Err(self.denied(denial)),
        }
    }

    // =========================================================================
    // Method dispatch
    // =========================================================================

    pub(super) fn call_method(&mut self, receiver: &Value, name: &str, args: Vec<Value>) -> Eval<Value> {
        match receiver {
            Value::Array(array) => self.array_method(array, name, args),
            Value::Str(s) => self.string_method(s, name, args),
            Value::Number(n) => self.number_method(*n, name, &args),
            Value::Bool(b) => self.alloc_str(b.to_string()),
            Value::Object(object) => match name {
                "hasOwnProperty" => {
                    let key = self.property_key(&arg(&args, 0));
                    Ok(Value::Bool(object.has(&key)))
                }
                _ => {
                    let text = self.to_text(receiver)?;
                    self.alloc_str(text)
                }
            },
            Value::Bytes(bytes) => self.bytes_method(bytes, name, &args),
            Value::Function(_) | Value::Native(_) => self.function_method(receiver, name, args),
            Value::Host(host) => {
                let host = host.clone();
                self.host_method(&host, name, args)
            }
            other => Err(self.type_error(format!(
                "{}.{} is not a function",
                describe_value(other),
                name
            ))),
        }
    }

    fn function_method(&mut self, function: &Value, name: &str, mut args: Vec<Value>) -> Eval<Value> {
        let this = if args.is_empty() {
            Value::Undefined
        } else {
            args.remove(0)
        };
        match name {
            "call" => self.call_value(function, this, args),
            "apply" => {
                let list = match args.first() {
                    None | Some(Value::Undefined) | Some(Value::Null) => Vec::new(),
                    Some(list) => self.iterate(list)?,
                };
                self.call_value(function, this, list)
            }
            _ => Err(self.type_error(format!("{} is not a function", name))),
        }
    }

    // =========================================================================
    // Arrays
    // =========================================================================

    /// Append `items` to `out`, descending `depth` levels into nested arrays
    ///
    /// `path` holds the arrays being flattened. Going deeper than
    /// `MAX_NESTING_DEPTH` is a RangeError, raised early for a cycle whose
    /// remaining depth would run into it anyway.
    fn flatten_into(
        &mut self,
        items: &[Value],
        depth: f64,
        out: &ArrayCell,
        path: &mut Vec<*const ArrayCell>,
    ) -> Eval<()> {
        self.tick()?;
        for item in items {
            match item {
                Value::Array(inner) if depth >= 1.0 => {
                    let ptr = Rc::as_ptr(inner);
                    let endless = depth >= MAX_NESTING_DEPTH as f64 && path.contains(&ptr);
                    if endless || path.len() >= MAX_NESTING_DEPTH {
                        return Err(self.range_error("Maximum call stack size exceeded"));
                    }
                    path.push(ptr);
                    self.flatten_into(&inner.snapshot(), depth - 1.0, out, path)?;
                    path.pop();
                }
                other => out.push(other.clone())?,
            }
        }
        Ok(())
    }

    fn array_method(&mut self, array: &Rc<ArrayCell>, name: &str, args: Vec<Value>) -> Eval<Value> {
        let this = Value::Array(array.clone());
        match name {
            "push" => {
                for value in args {
                    array.push(value)?;
                }
                Ok(Value::Number(array.len() as f64))
            }
            "pop" => Ok(array.pop()),
            "shift" => {
                let mut items = array.snapshot();
                if items.is_empty() {
                    return Ok(Value::Undefined);
                }
                let first = items.remove(0);
                array.replace(items)?;
                Ok(first)
            }
            "unshift" => {
                let mut items = args;
                items.extend(array.snapshot());
                let len = items.len();
                array.replace(items)?;
                Ok(Value::Number(len as f64))
            }
            "slice" => {
                let (start, end) = slice_range(&args, array.len());
                let items = array.items()[start..end].to_vec();
                self.alloc_array(items)
            }
            "splice" => {
                let mut items = array.snapshot();
                let len = items.len();
                let start = relative_index(&arg(&args, 0), len, 0);
                let delete = match args.get(1) {
                    None => len - start,
                    Some(count) => to_integer(count).clamp(0.0, (len - start) as f64) as usize,
                };
                let removed: Vec<Value> = items
                    .splice(start..start + delete, args.into_iter().skip(2))
                    .collect();
                array.replace(items)?;
                self.alloc_array(removed)
            }
            "concat" => {
                let mut items = array.snapshot();
                for value in args {
                    match value {
                        Value::Array(other) => items.extend(other.snapshot()),
                        other => items.push(other),
                    }
                }
                self.alloc_array(items)
            }
            "join" => {
                let separator = match args.first() {
                    None | Some(Value::Undefined) => ",".to_string(),
                    Some(value) => value.to_display(),
                };
                let parts = array
                    .snapshot()
                    .iter()
                    .map(|item| if item.is_nullish() { Ok(String::new()) } else { self.to_text(item) })
                    .collect::<Eval<Vec<String>>>()?;
                let len = parts.iter().map(String::len).sum::<usize>()
                    + separator.len() * parts.len().saturating_sub(1);
                self.alloc_str_sized(len, || parts.join(&separator))
            }
            "reverse" => {
                let mut items = array.snapshot();
                items.reverse();
                array.replace(items)?;
                Ok(this)
            }
            "indexOf" | "lastIndexOf" | "includes" => {
                let target = arg(&args, 0);
                let items = array.items();
                let found = match name {
                    "indexOf" => items.iter().position(|item| item.strict_equals(&target)),
                    "lastIndexOf" => items.iter().rposition(|item| item.strict_equals(&target)),
                    _ => {
                        let present = items.iter().any(|item| item.same_value_zero(&target));
                        return Ok(Value::Bool(present));
                    }
                };
                Ok(Value::Number(found.map_or(-1.0, |i| i as f64)))
            }
            "map" | "filter" | "forEach" | "find" | "findIndex" | "some" | "every" | "flatMap" => {
                self.array_iteration(array, name, &args)
            }
            "reduce" => self.array_reduce(array, &args),
            "sort" => {
                let comparator = args.first().filter(|f| f.is_callable()).cloned();
                let (defined, undefined): (Vec<Value>, Vec<Value>) = array
                    .snapshot()
                    .into_iter()
                    .partition(|item| !matches!(item, Value::Undefined));
                let mut sorted = self.merge_sort(defined, comparator.as_ref())?;
                sorted.extend(undefined);
                array.replace(sorted)?;
                Ok(this)
            }
            "fill" => {
                let value = arg(&args, 0);
                let len = array.len();
                let (start, end) = slice_range(args.get(1..).unwrap_or(&[]), len);
                for index in start..end {
                    array.set(index, value.clone())?;
                }
                Ok(this)
            }
            "flat" => {
                let depth = match args.first() {
                    None | Some(Value::Undefined) => 1.0,
                    Some(depth) => to_integer(depth),
                };
                let flat = self.new_array(Vec::new())?;
                self.flatten_into(&array.snapshot(), depth, &flat, &mut vec![Rc::as_ptr(array)])?;
                Ok(Value::Array(flat))
            }
            "at" => {
                let len = array.len();
                let n = to_integer(&arg(&args, 0));
                let index = if n < 0.0 { len as f64 + n } else { n };
                if index < 0.0 || index >= len as f64 {
                    return Ok(Value::Undefined);
                }
                Ok(array.get(index as usize))
            }
            "toString" => {
                let text = self.to_text(&this)?;
                self.alloc_str(text)
            }
            _ => Err(self.type_error(format!("array.{} is not a function", name))),
        }
    }

    fn array_iteration(&mut self, array: &Rc<ArrayCell>, name: &str, args: &[Value]) -> Eval<Value> {
        let callback = arg(args, 0);
        if !callback.is_callable() {
            return Err(self.type_error(format!("{} is not a function", describe_value(&callback))));
        }
        let this = Value::Array(array.clone());
        let mut collected = Vec::new();
        for index in 0..array.len() {
            if index >= array.len() {
                break;
            }
            let item = array.get(index);
            let result = self.call_value(
                &callback,
                Value::Undefined,
                vec![item.clone(), Value::Number(index as f64), this.clone()],
            )?;
            match name {
                "map" => collected.push(result),
                "filter" if result.truthy() => collected.push(item),
                "flatMap" => match result {
                    Value::Array(inner) => collected.extend(inner.snapshot()),
                    other => collected.push(other),
                },
                "find" if result.truthy() => return Ok(item),
                "findIndex" if result.truthy() => return Ok(Value::Number(index as f64)),
                "some" if result.truthy() => return Ok(Value::Bool(true)),
                "every" if !result.truthy() => return Ok(Value::Bool(false)),
                _ => {}
            }
        }
        match name {
            "map" | "filter" | "flatMap" => self.alloc_array(collected),
            "findIndex" => Ok(Value::Number(-1.0)),
            "some" => Ok(Value::Bool(false)),
            "every" => Ok(Value::Bool(true)),
            _ => Ok(Value::Undefined),
        }
    }

    fn array_reduce(&mut self, array: &Rc<ArrayCell>, args: &[Value]) -> Eval<Value> {
        let callback = arg(args, 0);
        if !callback.is_callable() {
            return Err(self.type_error(format!("{} is not a function", describe_value(&callback))));
        }
        let this = Value::Array(array.clone());
        let len = array.len();
        let mut index = 0;
        let mut accumulator = if args.len() >= 2 {
            args[1].clone()
        } else if len == 0 {
            return Err(self.type_error("Reduce of empty array with no initial value"));
        } else {
            index = 1;
            array.get(0)
        };
        while index < len.min(array.len()) {
            let item = array.get(index);
            accumulator = self.call_value(
                &callback,
                Value::Undefined,
                vec![accumulator, item, Value::Number(index as f64), this.clone()],
            )?;
            index += 1;
        }
        Ok(accumulator)
    }

    /// Stable merge sort; comparators are script code and may be
    /// inconsistent, so no ordering invariant is assumed
    fn merge_sort(&mut self, mut items: Vec<Value>, comparator: Option<&Value>) -> Eval<Vec<Value>> {
        if items.len() <= 1 {
            return Ok(items);
        }
        let right = items.split_off(items.len() / 2);
        let left = self.merge_sort(items, comparator)?;
        let right = self.merge_sort(right, comparator)?;

        let mut merged = Vec::with_capacity(left.len() + right.len());
        let mut left = left.into_iter().peekable();
        let mut right = right.into_iter().peekable();
        loop {
            let order = match (left.peek(), right.peek()) {
                (Some(a), Some(b)) => self.sort_order(a, b, comparator)?,
                _ => break,
            };
            let next = if order == Ordering::Greater {
                right.next()
            } else {
                left.next()
            };
            merged.extend(next);
        }
        merged.extend(left);
        merged.extend(right);
        Ok(merged)
    }

    fn sort_order(&mut self, a: &Value, b: &Value, comparator: Option<&Value>) -> Eval<Ordering> {
        match comparator {
            Some(compare) => {
                let result = self
                    .call_value(compare, Value::Undefined, vec![a.clone(), b.clone()])?
                    .to_number();
                Ok(if result > 0.0 {
                    Ordering::Greater
                } else if result < 0.0 {
                    Ordering::Less
                } else {
                    Ordering::Equal
                })
            }
            None => Ok(a.to_display().cmp(&b.to_display())),
        }
    }

    // =========================================================================
    // Strings and numbers
    // =========================================================================

    fn string_method(&mut self, s: &Rc<StrCell>, name: &str, args: Vec<Value>) -> Eval<Value> {
        let text = s.as_str();
        match name {
            "charAt" | "at" => {
                let len = s.char_len();
                let n = to_integer(&arg(&args, 0));
                let index = if name == "at" && n < 0.0 { len as f64 + n } else { n };
                match (index >= 0.0).then(|| text.chars().nth(index as usize)).flatten() {
                    Some(c) => self.alloc_str(c.to_string()),
                    None if name == "at" => Ok(Value::Undefined),
                    None => self.alloc_str(String::new()),
                }
            }
            "charCodeAt" => {
                let index = to_integer(&arg(&args, 0));
                let code = (index >= 0.0)
                    .then(|| text.chars().nth(index as usize))
                    .flatten()
                    .map_or(f64::NAN, |c| f64::from(u32::from(c)));
                Ok(Value::Number(code))
            }
            "indexOf" | "lastIndexOf" => {
                let needle = arg(&args, 0).to_display();
                let found = if name == "indexOf" {
                    text.find(&needle)
                } else {
                    text.rfind(&needle)
                };
                Ok(Value::Number(
                    found.map_or(-1.0, |byte| text[..byte].chars().count() as f64),
                ))
            }
            "includes" => Ok(Value::Bool(text.contains(&arg(&args, 0).to_display()))),
            "startsWith" => Ok(Value::Bool(text.starts_with(&arg(&args, 0).to_display()))),
            "endsWith" => Ok(Value::Bool(text.ends_with(&arg(&args, 0).to_display()))),
            "slice" | "substring" | "substr" => {
                let chars: Vec<char> = text.chars().collect();
                let len = chars.len();
                let (start, end) = match name {
                    "slice" => slice_range(&args, len),
                    "substring" => {
                        let clamp = |v: &Value, default: usize| match v {
                            Value::Undefined => default,
                            other => to_integer(other).clamp(0.0, len as f64) as usize,
                        };
                        let a = clamp(&arg(&args, 0), 0);
                        let b = clamp(&arg(&args, 1), len);
                        (a.min(b), a.max(b))
                    }
                    _ => {
                        let start = relative_index(&arg(&args, 0), len, 0);
                        let count = match arg(&args, 1) {
                            Value::Undefined => len - start,
                            other => to_integer(&other).clamp(0.0, (len - start) as f64) as usize,
                        };
                        (start, start + count)
                    }
                };
                self.alloc_str(chars[start..end].iter().collect())
            }
            "toUpperCase" => self.alloc_str(text.to_uppercase()),
            "toLowerCase" => self.alloc_str(text.to_lowercase()),
            "trim" => self.alloc_str(text.trim().to_string()),
            "trimStart" => self.alloc_str(text.trim_start().to_string()),
            "trimEnd" => self.alloc_str(text.trim_end().to_string()),
            "split" => {
                let limit = match arg(&args, 1) {
                    Value::Undefined => usize::MAX,
                    other => to_integer(&other).max(0.0) as usize,
                };
                let parts: Vec<String> = match arg(&args, 0) {
                    Value::Undefined => vec![text.to_string()],
                    separator => {
                        let separator = separator.to_display();
                        if separator.is_empty() {
                            text.chars().map(String::from).collect()
                        } else {
                            text.split(separator.as_str()).map(str::to_string).collect()
                        }
                    }
                };
                let items = parts
                    .into_iter()
                    .take(limit)
                    .map(|part| self.alloc_str(part))
                    .collect::<Eval<Vec<Value>>>()?;
                self.alloc_array(items)
            }
            "replace" | "replaceAll" => {
                let pattern = arg(&args, 0).to_display();
                let replacement = arg(&args, 1);
                let limit = if name == "replace" { 1 } else { usize::MAX };
                let mut out = String::with_capacity(text.len());
                let mut rest = text;
                let mut replaced = 0;
                while replaced < limit {
                    let Some(at) = rest.find(&pattern) else {
                        break;
                    };
                    out.push_str(&rest[..at]);
                    if replacement.is_callable() {
                        let matched = self.alloc_str(pattern.clone())?;
                        let produced = self.call_value(&replacement, Value::Undefined, vec![matched])?;
                        out.push_str(&produced.to_display());
                    } else {
                        out.push_str(&replacement.to_display());
                    }
                    rest = &rest[at + pattern.len()..];
                    replaced += 1;
                    if pattern.is_empty() {
                        // An empty pattern matches between every character
                        let mut chars = rest.chars();
                        match chars.next() {
                            Some(c) => out.push(c),
                            None => break,
                        }
                        rest = chars.as_str();
                    }
                }
                out.push_str(rest);
                self.alloc_str(out)
            }
            "repeat" => {
                let count = arg(&args, 0).to_number();
                if !(0.0..=f64::from(u32::MAX)).contains(&count) {
                    return Err(self.range_error(format!(
                        "Invalid count value: {}",
                        format_number(count)
                    )));
                }
                let count = count as usize;
                let len = text.len().saturating_mul(count);
                if string_bytes(len) > self.meter.hard_limit() {
                    return Err(self.range_error("Invalid string length"));
                }
                self.alloc_str_sized(len, || text.repeat(count))
            }
            "padStart" | "padEnd" => {
                let target = to_integer(&arg(&args, 0)).max(0.0) as usize;
                let filler = match arg(&args, 1) {
                    Value::Undefined => " ".to_string(),
                    other => other.to_display(),
                };
                let len = s.char_len();
                if target <= len || filler.is_empty() {
                    return Ok(Value::Str(s.clone()));
                }
                if string_bytes(target) > self.meter.hard_limit() {
                    return Err(self.range_error("Invalid string length"));
                }
                self.alloc_str_sized(target + text.len(), || {
                    let pad: String = filler.chars().cycle().take(target - len).collect();
                    if name == "padStart" {
                        pad + text
                    } else {
                        format!("{}{}", text, pad)
                    }
                })
            }
            "concat" => {
                let mut out = text.to_string();
                for value in &args {
                    out.push_str(&value.to_display());
                }
                self.alloc_str(out)
            }
            "toString" => Ok(Value::Str(s.clone())),
            "localeCompare" => {
                let other = arg(&args, 0).to_display();
                Ok(Value::Number(match text.cmp(other.as_str()) {
                    Ordering::Less => -1.0,
                    Ordering::Equal => 0.0,
                    Ordering::Greater => 1.0,
                }))
            }
            _ => Err(self.type_error(format!("string.{} is not a function", name))),
        }
    }

    fn number_method(&mut self, n: f64, name: &str, args: &[Value]) -> Eval<Value> {
        match name {
            "toFixed" => {
                let digits = to_integer(&arg(args, 0));
                if !(0.0..=100.0).contains(&digits) {
                    return Err(self.range_error("toFixed() digits argument must be between 0 and 100"));
                }
                if !n.is_finite() || n.abs() >= 1e21 {
                    return self.alloc_str(format_number(n));
                }
                self.alloc_str(format!("{:.*}", digits as usize, n))
            }
            _ => {
                let radix = match arg(args, 0) {
                    Value::Undefined => 10.0,
                    other => to_integer(&other),
                };
                if !(2.0..=36.0).contains(&radix) {
                    return Err(self.range_error("toString() radix must be between 2 and 36"));
                }
                if radix == 10.0 || !n.is_finite() {
                    return self.alloc_str(format_number(n));
                }
                self.alloc_str(integer_to_radix(n.trunc(), radix as u32))
            }
        }
    }

    // =========================================================================
    // Buffers
    // =========================================================================

    fn bytes_method(&mut self, bytes: &Rc<BytesCell>, name: &str, args: &[Value]) -> Eval<Value> {
        match name {
            "slice" => {
                let (start, end) = slice_range(args, bytes.len());
                let data = bytes.data()[start..end].to_vec();
                self.alloc_bytes(data)
            }
            "toJSON" => {
                let data: Vec<Value> = bytes
                    .data()
                    .iter()
                    .map(|&b| Value::Number(f64::from(b)))
                    .collect();
                let entries = vec![
                    (Rc::from("type"), self.alloc_str("Buffer".to_string())?),
                    (Rc::from("data"), self.alloc_array(data)?),
                ];
                self.alloc_object(entries)
            }
            _ => {
                let encoding = match arg(args, 0) {
                    Value::Undefined => "utf8".to_string(),
                    other => other.to_display().to_ascii_lowercase(),
                };
                let data = bytes.data();
                let text = match encoding.as_str() {
                    "utf8" | "utf-8" => String::from_utf8_lossy(&data).into_owned(),
                    "hex" => data.iter().map(|b| format!("{:02x}", b)).collect(),
                    "base64" => base64::engine::general_purpose::STANDARD.encode(&*data),
                    "latin1" | "binary" | "ascii" => data.iter().map(|&b| char::from(b)).collect(),
                    other => {
                        return Err(self.type_error(format!("Unknown encoding: {}", other)));
                    }
                };
                drop(data);
                self.alloc_str(text)
            }
        }
    }

    fn buffer_from(&mut self, source: &Value, encoding: &Value) -> Eval<Value> {
        match source {
            Value::Str(s) => {
                let encoding = match encoding {
                    Value::Undefined => "utf8".to_string(),
                    other => other.to_display().to_ascii_lowercase(),
                };
                let data = match encoding.as_str() {
                    "utf8" | "utf-8" => s.as_str().as_bytes().to_vec(),
                    "hex" => decode_hex(s.as_str()),
                    "base64" => base64::engine::general_purpose::STANDARD
                        .decode(s.as_str().trim())
                        .map_err(|e| self.type_error(format!("Invalid base64 input: {}", e)))?,
                    "latin1" | "binary" | "ascii" => s.as_str().chars().map(|c| c as u8).collect(),
                    other => return Err(self.type_error(format!("Unknown encoding: {}", other))),
                };
                self.alloc_bytes(data)
            }
            Value::Array(items) => {
                let data = items
                    .items()
                    .iter()
                    .map(|v| super::interpreter::to_uint32(v.to_number()) as u8)
                    .collect();
                self.alloc_bytes(data)
            }
            Value::Bytes(bytes) => {
                let data = bytes.data().clone();
                self.alloc_bytes(data)
            }
            other => Err(self.type_error(format!(
                "The first argument must be of type string, Buffer or Array. Received {}",
                describe_value(other)
            ))),
        }
    }

    fn buffer_alloc(&mut self, size: &Value, fill: &Value) -> Eval<Value> {
        let Some(len) = number_index(size.to_number()) else {
            return Err(self.range_error(format!(
                "The \"size\" argument is out of range. Received {}",
                size.to_display()
            )));
        };
        let buffer = self.alloc_bytes_zeroed(len)?;
        if let (Value::Bytes(bytes), Value::Number(n)) = (&buffer, fill) {
            let byte = super::interpreter::to_uint32(*n) as u8;
            for index in 0..len {
                bytes.set(index, byte);
            }
        }
        Ok(buffer)
    }

    // =========================================================================
    // Host namespaces
    // =========================================================================

    pub(super) fn host_property(&mut self, host: &HostObject, key: &str) -> Eval<Value> {
        match host {
            HostObject::Env => return self.env_get(key),
            HostObject::Module(_) => return Ok(bound(&Value::Host(host.clone()), key)),
            HostObject::Math => {
                if let Some(constant) = math_constant(key) {
                    return Ok(Value::Number(constant));
                }
            }
            HostObject::Number => {
                if let Some(constant) = number_constant(key) {
                    return Ok(Value::Number(constant));
                }
            }
            HostObject::Process => match key {
                "env" => return Ok(Value::Host(HostObject::Env)),
                "platform" => return self.alloc_str(std::env::consts::OS.to_string()),
                "version" => return self.alloc_str(RUNTIME_VERSION.to_string()),
                "argv" => {
                    let argv = vec![
                        self.alloc_str("node".to_string())?,
                        self.alloc_str("script".to_string())?,
                    ];
                    return self.alloc_array(argv);
                }
                _ if PROCESS_CONTROL.contains(&key) => {
                    return Ok(bound(&Value::Host(host.clone()), key));
                }
                _ => {}
            },
            _ => {}
        }
        if host_methods(host).contains(&key) {
            return Ok(bound(&Value::Host(host.clone()), key));
        }
        Ok(Value::Undefined)
    }

    fn host_method(&mut self, host: &HostObject, name: &str, args: Vec<Value>) -> Eval<Value> {
        match host {
            HostObject::Console => {
                let line = self.format_args(&args);
                match name {
                    "warn" | "error" => self.ctx.output.stderr(line),
                    _ => self.ctx.output.stdout(line),
                }
                Ok(Value::Undefined)
            }
            HostObject::Math => self.math(name, &args),
            HostObject::Json => match name {
                "stringify" => self.json_stringify(&args),
                _ => self.json_parse(&arg(&args, 0)),
            },
            HostObject::Object => self.object_static(name, &args),
            HostObject::Array => match name {
                "isArray" => Ok(Value::Bool(matches!(arg(&args, 0), Value::Array(_)))),
                "of" => self.alloc_array(args),
                _ => self.array_from(&arg(&args, 0), &arg(&args, 1)),
            },
            HostObject::Number => {
                let value = arg(&args, 0);
                let n = match value {
                    Value::Number(n) => Some(n),
                    _ => None,
                };
                Ok(match name {
                    "isInteger" => Value::Bool(n.is_some_and(|n| n.is_finite() && n.fract() == 0.0)),
                    "isSafeInteger" => Value::Bool(n.is_some_and(|n| {
                        n.fract() == 0.0 && n.abs() <= 9_007_199_254_740_991.0
                    })),
                    "isFinite" => Value::Bool(n.is_some_and(f64::is_finite)),
                    "isNaN" => Value::Bool(n.is_some_and(f64::is_nan)),
                    "parseFloat" => Value::Number(parse_float(&value.to_display())),
                    _ => Value::Number(parse_int(&value.to_display(), &arg(&args, 1))),
                })
            }
            HostObject::String => {
                let text: String = args
                    .iter()
                    .filter_map(|v| char::from_u32(super::interpreter::to_uint32(v.to_number()) & 0xffff))
                    .collect();
                self.alloc_str(text)
            }
            HostObject::Process => self.process_method(name, args),
            HostObject::Buffer => match name {
                "alloc" => self.buffer_alloc(&arg(&args, 0), &arg(&args, 1)),
                "isBuffer" => Ok(Value::Bool(matches!(arg(&args, 0), Value::Bytes(_)))),
                "byteLength" => Ok(Value::Number(match arg(&args, 0) {
                    Value::Bytes(b) => b.len() as f64,
                    other => other.to_display().len() as f64,
                })),
                _ => self.buffer_from(&arg(&args, 0), &arg(&args, 1)),
            },
            HostObject::Date => {
                let now = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_millis() as f64)
                    .unwrap_or(0.0);
                Ok(Value::Number(now))
            }
            HostObject::Module(module) => self.module_call(module, name, &args),
            HostObject::Env => Err(self.type_error(format!("process.env.{} is not a function", name))),
        }
    }

    pub(super) fn call_host_constructor(
        &mut self,
        host: &HostObject,
        args: Vec<Value>,
        constructing: bool,
    ) -> Eval<Value> {
        let first = arg(&args, 0);
        match host {
            HostObject::Object => {
                if is_primitive(&first) {
                    self.alloc_object(Vec::new())
                } else {
                    Ok(first)
                }
            }
            HostObject::Array => match (&first, args.len()) {
                (Value::Number(n), 1) => match number_index(*n) {
                    Some(len) => self.alloc_array_len(len),
                    None => Err(self.range_error("Invalid array length")),
                },
                _ => self.alloc_array(args),
            },
            HostObject::Number => Ok(Value::Number(if args.is_empty() {
                0.0
            } else {
                first.to_number()
            })),
            HostObject::String => {
                let text = if args.is_empty() { String::new() } else { self.to_text(&first)? };
                self.alloc_str(text)
            }
            HostObject::Buffer => match first {
                Value::Number(_) => self.buffer_alloc(&first, &Value::Undefined),
                _ => self.buffer_from(&first, &arg(&args, 1)),
            },
            HostObject::Date if constructing => Err(self.type_error(
                "Date objects are not available in the sandbox; use Date.now()",
            )),
            HostObject::Date => {
                let now = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs())
                    .unwrap_or(0);
                self.alloc_str(format!("@{}", now))
            }
            other => Err(self.type_error(format!("{} is not a constructor", other.name()))),
        }
    }

    fn math(&mut self, name: &str, args: &[Value]) -> Eval<Value> {
        let x = arg(args, 0).to_number();
        let y = arg(args, 1).to_number();
        let result = match name {
            "abs" => x.abs(),
            "floor" => x.floor(),
            "ceil" => x.ceil(),
            "round" => (x + 0.5).floor(),
            "trunc" => x.trunc(),
            "sign" => {
                if x == 0.0 || x.is_nan() {
                    x
                } else {
                    x.signum()
                }
            }
            "sqrt" => x.sqrt(),
            "cbrt" => x.cbrt(),
            "pow" => {
                if y.is_nan() {
                    f64::NAN
                } else {
                    x.powf(y)
                }
            }
            "min" | "max" => {
                let mut acc = if name == "min" { f64::INFINITY } else { f64::NEG_INFINITY };
                for value in args {
                    let n = value.to_number();
                    if n.is_nan() {
                        return Ok(Value::Number(f64::NAN));
                    }
                    acc = if name == "min" { acc.min(n) } else { acc.max(n) };
                }
                acc
            }
            "random" => self.next_random(),
            "log" => x.ln(),
            "log2" => x.log2(),
            "log10" => x.log10(),
            "exp" => x.exp(),
            "sin" => x.sin(),
            "cos" => x.cos(),
            "tan" => x.tan(),
            "atan" => x.atan(),
            "atan2" => x.atan2(y),
            "hypot" => args
                .iter()
                .map(|v| v.to_number().powi(2))
                .sum::<f64>()
                .sqrt(),
            _ => return Err(self.type_error(format!("Math.{} is not a function", name))),
        };
        Ok(Value::Number(result))
    }

    /// xorshift64*; scripts get no cryptographic randomness from Math
    fn next_random(&mut self) -> f64 {
        let mut x = self.rng;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.rng = x;
        let bits = x.wrapping_mul(0x2545_f491_4f6c_dd1d) >> 11;
        bits as f64 / (1u64 << 53) as f64
    }

    fn object_static(&mut self, name: &str, args: &[Value]) -> Eval<Value> {
        let target = arg(args, 0);
        match name {
            "keys" => {
                let keys = self.enumerate_keys(&target)?;
                let keys = keys
                    .into_iter()
                    .map(|k| self.alloc_str(k.to_string()))
                    .collect::<Eval<Vec<Value>>>()?;
                self.alloc_array(keys)
            }
            "values" => {
                let values = self.own_entries(&target)?.into_iter().map(|(_, v)| v).collect();
                self.alloc_array(values)
            }
            "entries" => {
                let mut pairs = Vec::new();
                for (key, value) in self.own_entries(&target)? {
                    let key = self.alloc_str(key.to_string())?;
                    pairs.push(self.alloc_array(vec![key, value])?);
                }
                self.alloc_array(pairs)
            }
            "assign" => {
                for source in args.iter().skip(1) {
                    for (key, value) in self.own_entries(source)? {
                        self.set_property(&target, &key, value)?;
                    }
                }
                Ok(target)
            }
            "fromEntries" => {
                let object = self.new_object(Vec::new(), ObjectTag::Plain)?;
                for entry in self.iterate(&target)? {
                    let pair = self.iterate(&entry)?;
                    let key = self.property_key(pair.first().unwrap_or(&Value::Undefined));
                    object.set(&key, pair.get(1).cloned().unwrap_or(Value::Undefined))?;
                }
                Ok(Value::Object(object))
            }
            // Immutability is not modelled; the value is returned unchanged
            _ => Ok(target),
        }
    }

    fn array_from(&mut self, source: &Value, map: &Value) -> Eval<Value> {
        let items = match source {
            Value::Object(object) => {
                let len = object.get("length").map_or(0.0, |v| to_integer(&v));
                match number_index(len) {
                    Some(len) => {
                        let mut items = Vec::new();
                        for index in 0..len {
                            self.tick()?;
                            items.push(object.get(&index.to_string()).unwrap_or(Value::Undefined));
                        }
                        items
                    }
                    None => return Err(self.range_error("Invalid array length")),
                }
            }
            Value::Undefined | Value::Null => {
                return Err(self.type_error(format!(
                    "{} is not iterable",
                    source.to_display()
                )))
            }
            other if is_primitive(other) && !matches!(other, Value::Str(_)) => Vec::new(),
            other => self.iterate(other)?,
        };
        if !map.is_callable() {
            return self.alloc_array(items);
        }
        let mut mapped = Vec::with_capacity(items.len());
        for (index, item) in items.into_iter().enumerate() {
            mapped.push(self.call_value(
                map,
                Value::Undefined,
                vec![item, Value::Number(index as f64)],
            )?);
        }
        self.alloc_array(mapped)
    }

    fn process_method(&mut self, name: &str, mut args: Vec<Value>) -> Eval<Value> {
        match name {
            "memoryUsage" => {
                let snapshot = self.meter.snapshot();
                let number = |n: u64| Value::Number(n as f64);
                self.alloc_object(vec![
                    (Rc::from("rss"), number(resident_set_bytes())),
                    (Rc::from("heapTotal"), number(self.meter.soft_limit())),
                    (Rc::from("heapUsed"), number(snapshot.used)),
                    (Rc::from("external"), number(snapshot.external)),
                    (Rc::from("arrayBuffers"), number(snapshot.external)),
                ])
            }
            "uptime" => Ok(Value::Number(self.started.elapsed().as_secs_f64())),
            "cwd" => self.alloc_str(SANDBOX_CWD.to_string()),
            "nextTick" => {
                let callback = if args.is_empty() {
                    Value::Undefined
                } else {
                    args.remove(0)
                };
                self.queue_immediate(callback, args)?;
                Ok(Value::Undefined)
            }
            control => match self.ctx.capabilities.acquire(&format!("process.{}", control)) {
                Ok(_) => Ok(Value::Undefined),
                Err(denial) => Err(self.denied(denial)),
            },
        }
    }

    fn module_call(&mut self, module: &Rc<RestrictedModule>, operation: &str, args: &[Value]) -> Eval<Value> {
        if let Err(denial) = self.ctx.capabilities.check_operation(module, operation) {
            return Err(self.denied(denial));
        }
        let text = |index: usize| arg(args, index).to_display();
        match (module.name(), operation) {
            ("path", "join") => {
                let parts: Vec<String> = args.iter().map(Value::to_display).collect();
                self.alloc_str(path_join(&parts))
            }
            ("path", "normalize") => self.alloc_str(normalize_path(&text(0))),
            ("path", "basename") => {
                let ext = args.get(1).map(Value::to_display);
                self.alloc_str(basename(&text(0), ext.as_deref()).to_string())
            }
            ("path", "dirname") => self.alloc_str(dirname(&text(0)).to_string()),
            ("path", "extname") => self.alloc_str(extname(&text(0)).to_string()),
            ("path", "isAbsolute") => Ok(Value::Bool(text(0).starts_with('/'))),
            ("util", "format") => {
                let line = self.format_args(args);
                self.alloc_str(line)
            }
            ("util", "inspect") => {
                let rendered = self.inspect(&arg(args, 0));
                self.alloc_str(rendered)
            }
            ("crypto", "randomUUID") => self.alloc_str(uuid::Uuid::new_v4().to_string()),
            (module, operation) => Err(self.type_error(format!(
                "{}.{} is not available in the sandbox",
                module, operation
            ))),
        }
    }
}

// =============================================================================
// HELPERS
// =============================================================================

fn math_constant(key: &str) -> Option<f64> {
    use std::f64::consts;
    Some(match key {
        "PI" => consts::PI,
        "E" => consts::E,
        "LN2" => consts::LN_2,
        "LN10" => consts::LN_10,
        "LOG2E" => consts::LOG2_E,
        "LOG10E" => consts::LOG10_E,
        "SQRT2" => consts::SQRT_2,
        "SQRT1_2" => consts::FRAC_1_SQRT_2,
        _ => return None,
    })
}

fn number_constant(key: &str) -> Option<f64> {
    Some(match key {
        "MAX_SAFE_INTEGER" => 9_007_199_254_740_991.0,
        "MIN_SAFE_INTEGER" => -9_007_199_254_740_991.0,
        "EPSILON" => f64::EPSILON,
        "MAX_VALUE" => f64::MAX,
        "MIN_VALUE" => 5e-324,
        "POSITIVE_INFINITY" => f64::INFINITY,
        "NEGATIVE_INFINITY" => f64::NEG_INFINITY,
        "NaN" => f64::NAN,
        _ => return None,
    })
}

/// `parseInt(text, radix)`: longest valid digit prefix
pub(super) fn parse_int(text: &str, radix: &Value) -> f64 {
    let text = text.trim_start();
    let (sign, mut body) = match text.as_bytes().first() {
        Some(b'-') => (-1.0, &text[1..]),
        Some(b'+') => (1.0, &text[1..]),
        _ => (1.0, text),
    };
    let mut radix = match radix {
        Value::Undefined => 0,
        other => super::interpreter::to_int32(other.to_number()),
    };
    if radix == 0 || radix == 16 {
        if let Some(hex) = body.strip_prefix("0x").or_else(|| body.strip_prefix("0X")) {
            body = hex;
            radix = 16;
        }
    }
    if radix == 0 {
        radix = 10;
    }
    if !(2..=36).contains(&radix) {
        return f64::NAN;
    }
    let mut value = 0.0;
    let mut any = false;
    for c in body.chars() {
        let Some(digit) = c.to_digit(radix as u32) else {
            break;
        };
        value = value * f64::from(radix) + f64::from(digit);
        any = true;
    }
    if any {
        sign * value
    } else {
        f64::NAN
    }
}

/// `parseFloat(text)`: longest decimal literal prefix
pub(super) fn parse_float(text: &str) -> f64 {
    let text = text.trim_start();
    let bytes = text.as_bytes();
    let mut end = 0;
    if matches!(bytes.first(), Some(b'-' | b'+')) {
        end = 1;
    }
    if text[end..].starts_with("Infinity") {
        return if text.starts_with('-') { f64::NEG_INFINITY } else { f64::INFINITY };
    }
    let digits_start = end;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }
    if end < bytes.len() && bytes[end] == b'.' {
        end += 1;
        while end < bytes.len() && bytes[end].is_ascii_digit() {
            end += 1;
        }
    }
    if end == digits_start || &text[digits_start..end] == "." {
        return f64::NAN;
    }
    if end < bytes.len() && matches!(bytes[end], b'e' | b'E') {
        let mut exp_end = end + 1;
        if exp_end < bytes.len() && matches!(bytes[exp_end], b'-' | b'+') {
            exp_end += 1;
        }
        let exp_digits = exp_end;
        while exp_end < bytes.len() && bytes[exp_end].is_ascii_digit() {
            exp_end += 1;
        }
        if exp_end > exp_digits {
            end = exp_end;
        }
    }
    text[..end].parse().unwrap_or(f64::NAN)
}

fn integer_to_radix(n: f64, radix: u32) -> String {
    let negative = n < 0.0;
    let mut magnitude = n.abs();
    if magnitude < 1.0 {
        return "0".to_string();
    }
    let mut digits = Vec::new();
    while magnitude >= 1.0 {
        let digit = (magnitude % f64::from(radix)) as u32;
        digits.push(std::char::from_digit(digit, radix).unwrap_or('0'));
        magnitude = (magnitude / f64::from(radix)).floor();
    }
    if negative {
        digits.push('-');
    }
    digits.iter().rev().collect()
}

fn decode_hex(text: &str) -> Vec<u8> {
    text.as_bytes()
        .chunks_exact(2)
        .map_while(|pair| {
            let pair = std::str::from_utf8(pair).ok()?;
            u8::from_str_radix(pair, 16).ok()
        })
        .collect()
}

/// POSIX path normalization (`a//b/../c/` -> `a/c/`)
pub(super) fn normalize_path(path: &str) -> String {
    if path.is_empty() {
        return ".".to_string();
    }
    let absolute = path.starts_with('/');
    let trailing = path.ends_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if parts.last().is_some_and(|last| *last != "..") {
                    parts.pop();
                } else if !absolute {
                    parts.push("..");
                }
            }
            segment => parts.push(segment),
        }
    }
    let mut out = parts.join("/");
    if absolute {
        out.insert(0, '/');
    }
    if out.is_empty() {
        return ".".to_string();
    }
    if trailing && !out.ends_with('/') {
        out.push('/');
    }
    out
}

pub(super) fn path_join(parts: &[String]) -> String {
    let joined: Vec<&str> = parts
        .iter()
        .map(String::as_str)
        .filter(|p| !p.is_empty())
        .collect();
    if joined.is_empty() {
        return ".".to_string();
    }
    normalize_path(&joined.join("/"))
}

pub(super) fn basename<'a>(path: &'a str, ext: Option<&str>) -> &'a str {
    let trimmed = path.trim_end_matches('/');
    let base = trimmed.rsplit('/').next().unwrap_or("");
    match ext {
        Some(ext) if !ext.is_empty() && base != ext => base.strip_suffix(ext).unwrap_or(base),
        _ => base,
    }
}

pub(super) fn dirname(path: &str) -> &str {
    if path.is_empty() {
        return ".";
    }
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return "/";
    }
    match trimmed.rfind('/') {
        None => ".",
        Some(0) => "/",
        Some(index) => {
            let parent = trimmed[..index].trim_end_matches('/');
            if parent.is_empty() {
                "/"
            } else {
                parent
            }
        }
    }
}

pub(super) fn extname(path: &str) -> &str {
    let base = basename(path, None);
    match base.rfind('.') {
        Some(index) if index > 0 => &base[index..],
        _ => "",
    }
}
