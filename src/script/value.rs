/*!
 * Script Values
 *
 * Primitive values are stored inline; strings, arrays, objects, buffers and
 * closures are reference counted cells that carry their heap charge.
 */

use super::ast::{FunctionDef, Ident};
use super::heap::{array_bytes, object_bytes, object_entry_bytes, Charge, HeapExhausted};
use crate::core::limits::MAX_NESTING_DEPTH;
use crate::security::capability::RestrictedModule;
use std::cell::{Cell, Ref, RefCell};
use std::fmt;
use std::rc::Rc;

// =============================================================================
// CELLS
// =============================================================================

pub struct StrCell {
    text: Box<str>,
    ascii: bool,
    _charge: Charge,
}

impl StrCell {
    pub(super) fn new(text: String, charge: Charge) -> Self {
        let ascii = text.is_ascii();
        Self {
            text: text.into_boxed_str(),
            ascii,
            _charge: charge,
        }
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Length in characters
    pub fn char_len(&self) -> usize {
        if self.ascii {
            self.text.len()
        } else {
            self.text.chars().count()
        }
    }

    #[inline]
    pub fn is_ascii(&self) -> bool {
        self.ascii
    }
}

pub struct ArrayCell {
    items: RefCell<Vec<Value>>,
    charge: Charge,
}

impl ArrayCell {
    pub(super) fn new(items: Vec<Value>, charge: Charge) -> Self {
        Self {
            items: RefCell::new(items),
            charge,
        }
    }

    #[inline]
    pub fn items(&self) -> Ref<'_, Vec<Value>> {
        self.items.borrow()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.items.borrow().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.items.borrow().is_empty()
    }

    pub fn get(&self, index: usize) -> Value {
        self.items.borrow().get(index).cloned().unwrap_or(Value::Undefined)
    }

    pub fn push(&self, value: Value) -> Result<(), HeapExhausted> {
        let len = self.items.borrow().len();
        self.charge.resize(array_bytes(len + 1))?;
        self.items.borrow_mut().push(value);
        Ok(())
    }

    pub fn pop(&self) -> Value {
        let popped = self.items.borrow_mut().pop().unwrap_or(Value::Undefined);
        let len = self.items.borrow().len();
        let _ = self.charge.resize(array_bytes(len));
        popped
    }

    /// Store at `index`, growing with holes when needed
    pub fn set(&self, index: usize, value: Value) -> Result<(), HeapExhausted> {
        let len = self.items.borrow().len();
        if index >= len {
            self.charge.resize(array_bytes(index + 1))?;
            self.items.borrow_mut().resize(index + 1, Value::Undefined);
        }
        self.items.borrow_mut()[index] = value;
        Ok(())
    }

    /// Replace the whole contents
    pub fn replace(&self, items: Vec<Value>) -> Result<(), HeapExhausted> {
        self.charge.resize(array_bytes(items.len()))?;
        // The old contents drop after the borrow ends
        let old = std::mem::replace(&mut *self.items.borrow_mut(), items);
        drop(old);
        Ok(())
    }

    pub fn truncate(&self, len: usize) {
        let tail = {
            let mut items = self.items.borrow_mut();
            if len >= items.len() {
                return;
            }
            items.split_off(len)
        };
        drop(tail);
        let _ = self.charge.resize(array_bytes(len));
    }

    pub fn snapshot(&self) -> Vec<Value> {
        self.items.borrow().clone()
    }

    pub(super) fn clear(&self) {
        let items = std::mem::take(&mut *self.items.borrow_mut());
        drop(items);
    }
}

impl Drop for ArrayCell {
    fn drop(&mut self) {
        release(std::mem::take(self.items.get_mut()));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectTag {
    Plain,
    Error,
}

pub struct ObjectCell {
    entries: RefCell<Vec<(Rc<str>, Value)>>,
    tag: ObjectTag,
    charge: Charge,
}

impl ObjectCell {
    pub(super) fn new(entries: Vec<(Rc<str>, Value)>, tag: ObjectTag, charge: Charge) -> Self {
        Self {
            entries: RefCell::new(entries),
            tag,
            charge,
        }
    }

    #[inline]
    pub fn tag(&self) -> ObjectTag {
        self.tag
    }

    #[inline]
    pub fn entries(&self) -> Ref<'_, Vec<(Rc<str>, Value)>> {
        self.entries.borrow()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.entries
            .borrow()
            .iter()
            .find(|(k, _)| &**k == key)
            .map(|(_, v)| v.clone())
    }

    pub fn has(&self, key: &str) -> bool {
        self.entries.borrow().iter().any(|(k, _)| &**k == key)
    }

    pub fn set(&self, key: &str, value: Value) -> Result<(), HeapExhausted> {
        let old = {
            let mut entries = self.entries.borrow_mut();
            match entries.iter_mut().find(|(k, _)| &**k == key) {
                Some((_, slot)) => Some(std::mem::replace(slot, value)),
                None => {
                    self.charge
                        .resize(self.charge.bytes() + object_entry_bytes(key))?;
                    entries.push((Rc::from(key), value));
                    None
                }
            }
        };
        drop(old);
        Ok(())
    }

    pub fn remove(&self, key: &str) -> bool {
        let removed = {
            let mut entries = self.entries.borrow_mut();
            let Some(index) = entries.iter().position(|(k, _)| &**k == key) else {
                return false;
            };
            entries.remove(index)
        };
        let bytes = object_bytes(&self.entries.borrow());
        let _ = self.charge.resize(bytes);
        drop(removed);
        true
    }

    pub fn keys(&self) -> Vec<Rc<str>> {
        self.entries.borrow().iter().map(|(k, _)| k.clone()).collect()
    }

    pub(super) fn clear(&self) {
        let entries = std::mem::take(&mut *self.entries.borrow_mut());
        drop(entries);
    }
}

impl Drop for ObjectCell {
    fn drop(&mut self) {
        let entries = std::mem::take(self.entries.get_mut());
        release(entries.into_iter().map(|(_, value)| value).collect());
    }
}

pub struct BytesCell {
    data: RefCell<Vec<u8>>,
    _charge: Charge,
}

impl BytesCell {
    pub(super) fn new(data: Vec<u8>, charge: Charge) -> Self {
        Self {
            data: RefCell::new(data),
            _charge: charge,
        }
    }

    pub fn data(&self) -> Ref<'_, Vec<u8>> {
        self.data.borrow()
    }

    pub fn len(&self) -> usize {
        self.data.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.borrow().is_empty()
    }

    pub fn set(&self, index: usize, byte: u8) {
        if let Some(slot) = self.data.borrow_mut().get_mut(index) {
            *slot = byte;
        }
    }
}

pub struct Closure {
    pub def: Rc<FunctionDef>,
    env: RefCell<Option<Rc<Scope>>>,
    _charge: Charge,
}

impl Closure {
    pub(super) fn new(def: Rc<FunctionDef>, env: Rc<Scope>, charge: Charge) -> Self {
        Self {
            def,
            env: RefCell::new(Some(env)),
            _charge: charge,
        }
    }

    pub fn env(&self) -> Option<Rc<Scope>> {
        self.env.borrow().clone()
    }

    pub fn name(&self) -> Option<&str> {
        self.def.name.as_deref()
    }

    pub(super) fn detach(&self) {
        let env = self.env.borrow_mut().take();
        drop(env);
    }
}

// =============================================================================
// RELEASE
// =============================================================================

thread_local! {
    static RELEASE_QUEUE: RefCell<Vec<Value>> = const { RefCell::new(Vec::new()) };
    static RELEASING: Cell<bool> = const { Cell::new(false) };
}

/// Drop the contents of a dying container
///
/// Contents go on a per-thread worklist that only the outermost call drains.
/// A container dropped while draining queues its own contents instead of
/// dropping them in place, so a chain of any depth releases on a flat stack.
fn release(values: Vec<Value>) {
    if values.is_empty() {
        return;
    }
    // During thread teardown the worklist may be gone; drop in place then
    let queued = RELEASE_QUEUE.try_with(move |queue| queue.borrow_mut().extend(values));
    if queued.is_err() || RELEASING.try_with(|flag| flag.replace(true)).unwrap_or(true) {
        return;
    }
    while let Some(value) = RELEASE_QUEUE
        .try_with(|queue| queue.borrow_mut().pop())
        .ok()
        .flatten()
    {
        drop(value);
    }
    let _ = RELEASING.try_with(|flag| flag.set(false));
}

// =============================================================================
// SCOPES
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignFailure {
    Undeclared,
    Constant,
}

struct Binding {
    name: Ident,
    value: Value,
    mutable: bool,
}

/// Lexical environment record
pub struct Scope {
    bindings: RefCell<Vec<Binding>>,
    parent: Option<Rc<Scope>>,
    function_boundary: bool,
}

impl Drop for Scope {
    fn drop(&mut self) {
        let bindings = std::mem::take(self.bindings.get_mut());
        release(bindings.into_iter().map(|binding| binding.value).collect());
    }
}

impl Scope {
    pub fn new(parent: Option<Rc<Scope>>, function_boundary: bool) -> Rc<Self> {
        Rc::new(Self {
            bindings: RefCell::new(Vec::new()),
            parent,
            function_boundary,
        })
    }

    #[inline]
    pub fn parent(&self) -> Option<&Rc<Scope>> {
        self.parent.as_ref()
    }

    /// Declare in this scope, replacing an existing binding of the same name
    pub fn declare(&self, name: Ident, value: Value, mutable: bool) {
        let old = {
            let mut bindings = self.bindings.borrow_mut();
            match bindings.iter_mut().find(|b| b.name == name) {
                Some(binding) => {
                    binding.mutable = mutable;
                    Some(std::mem::replace(&mut binding.value, value))
                }
                None => {
                    bindings.push(Binding {
                        name,
                        value,
                        mutable,
                    });
                    None
                }
            }
        };
        drop(old);
    }

    /// Declare a `var` in the nearest function scope
    pub fn declare_var(self: &Rc<Self>, name: Ident, value: Value) {
        let mut scope = self.clone();
        while !scope.function_boundary {
            match scope.parent.clone() {
                Some(parent) => scope = parent,
                None => break,
            }
        }
        scope.declare(name, value, true);
    }

    pub fn lookup(&self, name: &str) -> Option<Value> {
        let mut scope = self;
        loop {
            if let Some(binding) = scope.bindings.borrow().iter().find(|b| &*b.name == name) {
                return Some(binding.value.clone());
            }
            scope = scope.parent.as_deref()?;
        }
    }

    pub fn assign(&self, name: &str, value: Value) -> Result<(), AssignFailure> {
        let mut scope = self;
        loop {
            let old = {
                let mut bindings = scope.bindings.borrow_mut();
                match bindings.iter_mut().find(|b| &*b.name == name) {
                    Some(binding) if !binding.mutable => return Err(AssignFailure::Constant),
                    Some(binding) => Some(std::mem::replace(&mut binding.value, value.clone())),
                    None => None,
                }
            };
            if let Some(old) = old {
                drop(old);
                return Ok(());
            }
            scope = scope.parent.as_deref().ok_or(AssignFailure::Undeclared)?;
        }
    }

    pub fn has_own(&self, name: &str) -> bool {
        self.bindings.borrow().iter().any(|b| &*b.name == name)
    }

    /// Names and values declared directly in this scope
    pub fn own_bindings(&self) -> Vec<(Ident, Value, bool)> {
        self.bindings
            .borrow()
            .iter()
            .map(|b| (b.name.clone(), b.value.clone(), b.mutable))
            .collect()
    }
}

// =============================================================================
// VALUES
// =============================================================================

/// Global functions implemented natively
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    ParseInt,
    ParseFloat,
    IsNaN,
    IsFinite,
    Boolean,
    Error,
    TypeError,
    RangeError,
    SetTimeout,
    SetInterval,
    ClearTimeout,
    ClearInterval,
    Require,
    Eval,
    Function,
}

impl Builtin {
    pub fn name(self) -> &'static str {
        match self {
            Builtin::ParseInt => "parseInt",
            Builtin::ParseFloat => "parseFloat",
            Builtin::IsNaN => "isNaN",
            Builtin::IsFinite => "isFinite",
            Builtin::Boolean => "Boolean",
            Builtin::Error => "Error",
            Builtin::TypeError => "TypeError",
            Builtin::RangeError => "RangeError",
            Builtin::SetTimeout => "setTimeout",
            Builtin::SetInterval => "setInterval",
            Builtin::ClearTimeout => "clearTimeout",
            Builtin::ClearInterval => "clearInterval",
            Builtin::Require => "require",
            Builtin::Eval => "eval",
            Builtin::Function => "Function",
        }
    }
}

/// A method detached from its receiver (`const log = console.log`)
pub struct BoundMethod {
    pub receiver: Value,
    pub name: Rc<str>,
}

#[derive(Clone)]
pub enum Native {
    Builtin(Builtin),
    Bound(Rc<BoundMethod>),
}

/// Namespaces and capability proxies provided by the host
#[derive(Clone)]
pub enum HostObject {
    Console,
    Math,
    Json,
    Object,
    Array,
    Number,
    String,
    Process,
    Env,
    Buffer,
    Date,
    Module(Rc<RestrictedModule>),
}

impl HostObject {
    pub fn name(&self) -> &str {
        match self {
            HostObject::Console => "console",
            HostObject::Math => "Math",
            HostObject::Json => "JSON",
            HostObject::Object => "Object",
            HostObject::Array => "Array",
            HostObject::Number => "Number",
            HostObject::String => "String",
            HostObject::Process => "process",
            HostObject::Env => "process.env",
            HostObject::Buffer => "Buffer",
            HostObject::Date => "Date",
            HostObject::Module(module) => module.name(),
        }
    }

    /// Whether the namespace is also callable
    pub fn is_constructor(&self) -> bool {
        matches!(
            self,
            HostObject::Object
                | HostObject::Array
                | HostObject::Number
                | HostObject::String
                | HostObject::Buffer
                | HostObject::Date
        )
    }

    fn same(&self, other: &HostObject) -> bool {
        match (self, other) {
            (HostObject::Module(a), HostObject::Module(b)) => Rc::ptr_eq(a, b),
            (a, b) => std::mem::discriminant(a) == std::mem::discriminant(b),
        }
    }
}

#[derive(Clone)]
pub enum Value {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    Str(Rc<StrCell>),
    Array(Rc<ArrayCell>),
    Object(Rc<ObjectCell>),
    Bytes(Rc<BytesCell>),
    Function(Rc<Closure>),
    Native(Native),
    Host(HostObject),
}

impl Value {
    pub fn type_of(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null => "object",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::Str(_) => "string",
            Value::Array(_) | Value::Object(_) | Value::Bytes(_) => "object",
            Value::Function(_) | Value::Native(_) => "function",
            Value::Host(host) if host.is_constructor() => "function",
            Value::Host(_) => "object",
        }
    }

    #[inline]
    pub fn is_nullish(&self) -> bool {
        matches!(self, Value::Undefined | Value::Null)
    }

    pub fn is_callable(&self) -> bool {
        self.type_of() == "function"
    }

    pub fn truthy(&self) -> bool {
        match self {
            Value::Undefined | Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0 && !n.is_nan(),
            Value::Str(s) => !s.as_str().is_empty(),
            _ => true,
        }
    }

    /// Numeric conversion of primitives; containers go through their string form
    pub fn to_number(&self) -> f64 {
        match self {
            Value::Undefined => f64::NAN,
            Value::Null => 0.0,
            Value::Bool(b) => f64::from(u8::from(*b)),
            Value::Number(n) => *n,
            Value::Str(s) => parse_number(s.as_str()),
            Value::Array(a) => match a.len() {
                0 => 0.0,
                1 => parse_number(&self.to_display()),
                _ => f64::NAN,
            },
            _ => f64::NAN,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// `String(value)` for everything except objects with user methods
    ///
    /// Levels nested deeper than `MAX_NESTING_DEPTH` are left out; callers
    /// that must report them use [`Value::try_display`].
    pub fn to_display(&self) -> String {
        match self {
            Value::Undefined => "undefined".to_string(),
            Value::Null => "null".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => format_number(*n),
            Value::Str(s) => s.as_str().to_string(),
            Value::Array(_) | Value::Object(_) => {
                let mut out = String::new();
                let _ = self.display_into(&mut out, &mut Vec::new());
                out
            }
            Value::Bytes(b) => String::from_utf8_lossy(&b.data()).into_owned(),
            Value::Function(f) => format!("function {}() {{ [code] }}", f.name().unwrap_or("")),
            Value::Native(Native::Builtin(b)) => {
                format!("function {}() {{ [native code] }}", b.name())
            }
            Value::Native(Native::Bound(m)) => {
                format!("function {}() {{ [native code] }}", m.name)
            }
            Value::Host(host) if host.is_constructor() => {
                format!("function {}() {{ [native code] }}", host.name())
            }
            Value::Host(host) => format!("[object {}]", host.name()),
        }
    }

    pub fn try_display(&self) -> Result<String, NestingTooDeep> {
        let mut out = String::new();
        self.display_into(&mut out, &mut Vec::new())?;
        Ok(out)
    }

    fn display_into(&self, out: &mut String, seen: &mut Vec<*const ()>) -> Result<(), NestingTooDeep> {
        match self {
            Value::Array(a) => enter(Rc::as_ptr(a).cast(), seen, |seen| join_array(a, out, seen)),
            Value::Object(o) if o.tag() == ObjectTag::Error => {
                enter(Rc::as_ptr(o).cast(), seen, |seen| display_error(o, out, seen))
            }
            Value::Object(_) => {
                out.push_str("[object Object]");
                Ok(())
            }
            other => {
                out.push_str(&other.to_display());
                Ok(())
            }
        }
    }

    pub fn strict_equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a.as_str() == b.as_str(),
            (Value::Array(a), Value::Array(b)) => Rc::ptr_eq(a, b),
            (Value::Object(a), Value::Object(b)) => Rc::ptr_eq(a, b),
            (Value::Bytes(a), Value::Bytes(b)) => Rc::ptr_eq(a, b),
            (Value::Function(a), Value::Function(b)) => Rc::ptr_eq(a, b),
            (Value::Native(Native::Builtin(a)), Value::Native(Native::Builtin(b))) => a == b,
            (Value::Native(Native::Bound(a)), Value::Native(Native::Bound(b))) => Rc::ptr_eq(a, b),
            (Value::Host(a), Value::Host(b)) => a.same(b),
            _ => false,
        }
    }

    pub fn loose_equals(&self, other: &Value) -> bool {
        match (self, other) {
            (a, b) if a.is_nullish() && b.is_nullish() => true,
            (a, b) if a.is_nullish() || b.is_nullish() => false,
            (Value::Number(_), Value::Str(_))
            | (Value::Str(_), Value::Number(_))
            | (Value::Bool(_), _)
            | (_, Value::Bool(_)) => self.to_number() == other.to_number(),
            (Value::Array(_) | Value::Object(_), Value::Str(s))
            | (Value::Str(s), Value::Array(_) | Value::Object(_)) => {
                let container = if matches!(self, Value::Str(_)) { other } else { self };
                container.to_display() == s.as_str()
            }
            _ => self.strict_equals(other),
        }
    }

    /// Equality used by `includes` (NaN equals NaN)
    pub fn same_value_zero(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Number(a), Value::Number(b)) if a.is_nan() && b.is_nan() => true,
            _ => self.strict_equals(other),
        }
    }
}

/// Container nested past `MAX_NESTING_DEPTH`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NestingTooDeep;

/// Run `render` one level down; a container already on the path renders empty
fn enter(
    ptr: *const (),
    seen: &mut Vec<*const ()>,
    render: impl FnOnce(&mut Vec<*const ()>) -> Result<(), NestingTooDeep>,
) -> Result<(), NestingTooDeep> {
    if seen.contains(&ptr) {
        return Ok(());
    }
    if seen.len() >= MAX_NESTING_DEPTH {
        return Err(NestingTooDeep);
    }
    seen.push(ptr);
    let rendered = render(seen);
    seen.pop();
    rendered
}

/// `Array.prototype.join(",")` with nested arrays flattened
fn join_array(array: &ArrayCell, out: &mut String, seen: &mut Vec<*const ()>) -> Result<(), NestingTooDeep> {
    for (i, item) in array.snapshot().iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        if !item.is_nullish() {
            item.display_into(out, seen)?;
        }
    }
    Ok(())
}

fn display_error(error: &ObjectCell, out: &mut String, seen: &mut Vec<*const ()>) -> Result<(), NestingTooDeep> {
    match error.get("name") {
        Some(name) => name.display_into(out, seen)?,
        None => out.push_str("Error"),
    }
    if let Some(message) = error.get("message") {
        let mut text = String::new();
        message.display_into(&mut text, seen)?;
        if !text.is_empty() {
            out.push_str(": ");
            out.push_str(&text);
        }
    }
    Ok(())
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Str(s) => write!(f, "{:?}", s.as_str()),
            other => write!(f, "{}", other.to_display()),
        }
    }
}

/// Number to string the way scripts expect (`1`, `0.5`, `1e+21`, `NaN`)
pub fn format_number(n: f64) -> String {
    if n.is_nan() {
        return "NaN".to_string();
    }
    if n.is_infinite() {
        return if n > 0.0 { "Infinity" } else { "-Infinity" }.to_string();
    }
    if n == 0.0 {
        return "0".to_string();
    }
    let magnitude = n.abs();
    if magnitude >= 1e21 || magnitude < 1e-6 {
        let formatted = format!("{:e}", n);
        return match formatted.split_once('e') {
            Some((mantissa, exp)) if !exp.starts_with('-') => format!("{}e+{}", mantissa, exp),
            _ => formatted,
        };
    }
    if n.fract() == 0.0 && magnitude < 9_007_199_254_740_992.0 {
        return format!("{}", n as i64);
    }
    format!("{}", n)
}

/// String to number conversion (`Number("  12 ")`)
pub fn parse_number(text: &str) -> f64 {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return 0.0;
    }
    let (sign, body) = match trimmed.as_bytes()[0] {
        b'-' => (-1.0, &trimmed[1..]),
        b'+' => (1.0, &trimmed[1..]),
        _ => (1.0, trimmed),
    };
    if body == "Infinity" {
        return sign * f64::INFINITY;
    }
    for (prefix, radix) in [("0x", 16), ("0X", 16), ("0b", 2), ("0B", 2), ("0o", 8), ("0O", 8)] {
        if let Some(digits) = trimmed.strip_prefix(prefix) {
            return u64::from_str_radix(digits, radix)
                .map(|v| v as f64)
                .unwrap_or(f64::NAN);
        }
    }
    if !body
        .bytes()
        .all(|b| b.is_ascii_digit() || matches!(b, b'.' | b'e' | b'E' | b'+' | b'-'))
    {
        return f64::NAN;
    }
    trimmed.parse::<f64>().unwrap_or(f64::NAN)
}

/// Canonical array index for a property key
pub fn array_index(key: &str) -> Option<usize> {
    if key.is_empty() || (key.len() > 1 && key.starts_with('0')) {
        return None;
    }
    if !key.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    key.parse().ok()
}

/// Integer index from a numeric value
pub fn number_index(n: f64) -> Option<usize> {
    if n >= 0.0 && n.fract() == 0.0 && n < 4_294_967_295.0 {
        Some(n as usize)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::heap::HeapMeter;
    use std::sync::Arc;

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(4.0), "4");
        assert_eq!(format_number(-0.0), "0");
        assert_eq!(format_number(0.1 + 0.2), "0.30000000000000004");
        assert_eq!(format_number(1e21), "1e+21");
        assert_eq!(format_number(1.5e-7), "1.5e-7");
        assert_eq!(format_number(f64::NAN), "NaN");
        assert_eq!(format_number(f64::NEG_INFINITY), "-Infinity");
    }

    #[test]
    fn test_parse_number() {
        assert_eq!(parse_number(" 42 "), 42.0);
        assert_eq!(parse_number(""), 0.0);
        assert_eq!(parse_number("0x10"), 16.0);
        assert_eq!(parse_number("-Infinity"), f64::NEG_INFINITY);
        assert!(parse_number("inf").is_nan());
        assert!(parse_number("12px").is_nan());
    }

    #[test]
    fn test_array_index() {
        assert_eq!(array_index("0"), Some(0));
        assert_eq!(array_index("17"), Some(17));
        assert_eq!(array_index("01"), None);
        assert_eq!(array_index("length"), None);
    }

    #[test]
    fn test_primitive_equality() {
        assert!(Value::Null.loose_equals(&Value::Undefined));
        assert!(!Value::Null.strict_equals(&Value::Undefined));
        assert!(Value::Bool(true).loose_equals(&Value::Number(1.0)));
        assert!(!Value::Number(f64::NAN).strict_equals(&Value::Number(f64::NAN)));
        assert!(Value::Number(f64::NAN).same_value_zero(&Value::Number(f64::NAN)));
    }

    #[test]
    fn test_truthiness_and_typeof() {
        assert!(!Value::Number(0.0).truthy());
        assert!(!Value::Number(f64::NAN).truthy());
        assert!(Value::Host(HostObject::Math).truthy());
        assert_eq!(Value::Null.type_of(), "object");
        assert_eq!(Value::Host(HostObject::Array).type_of(), "function");
        assert_eq!(Value::Native(Native::Builtin(Builtin::Eval)).type_of(), "function");
    }

    fn meter() -> Arc<HeapMeter> {
        Arc::new(HeapMeter::new(1 << 40, 1 << 40))
    }

    fn nested_arrays(meter: &Arc<HeapMeter>, depth: usize) -> Value {
        let mut value = Value::Array(Rc::new(ArrayCell::new(
            Vec::new(),
            Charge::heap(meter, array_bytes(0)).unwrap(),
        )));
        for _ in 0..depth {
            let charge = Charge::heap(meter, array_bytes(1)).unwrap();
            value = Value::Array(Rc::new(ArrayCell::new(vec![value], charge)));
        }
        value
    }

    #[test]
    fn test_deep_array_chain_releases() {
        let meter = meter();
        let chain = nested_arrays(&meter, 1_000_000);
        assert!(meter.used() > 0);
        drop(chain);
        assert_eq!(meter.used(), 0);
    }

    #[test]
    fn test_deep_object_chain_releases() {
        let meter = meter();
        let mut value = Value::Null;
        for _ in 0..1_000_000 {
            let entries = vec![(Rc::from("next"), value)];
            let charge = Charge::heap(&meter, object_bytes(&entries)).unwrap();
            value = Value::Object(Rc::new(ObjectCell::new(entries, ObjectTag::Plain, charge)));
        }
        drop(value);
        assert_eq!(meter.used(), 0);
    }

    #[test]
    fn test_display_nesting_limit() {
        // Room for MAX_NESTING_DEPTH native frames on any build profile
        std::thread::Builder::new()
            .stack_size(32 * 1024 * 1024)
            .spawn(|| {
                let meter = meter();
                let shallow = nested_arrays(&meter, 8);
                assert_eq!(shallow.try_display(), Ok(String::new()));

                let deep = nested_arrays(&meter, MAX_NESTING_DEPTH + 8);
                assert_eq!(deep.try_display(), Err(NestingTooDeep));
                assert_eq!(deep.to_display(), "");
            })
            .unwrap()
            .join()
            .unwrap();
    }

    #[test]
    fn test_display_cycles_render_empty() {
        let meter = meter();
        let inner = Rc::new(ArrayCell::new(
            vec![Value::Number(1.0)],
            Charge::heap(&meter, array_bytes(1)).unwrap(),
        ));
        inner.push(Value::Array(inner.clone())).unwrap();
        assert_eq!(Value::Array(inner.clone()).try_display(), Ok("1,".to_string()));

        let error = Rc::new(ObjectCell::new(
            Vec::new(),
            ObjectTag::Error,
            Charge::heap(&meter, object_bytes(&[])).unwrap(),
        ));
        error.set("name", Value::Object(error.clone())).unwrap();
        assert_eq!(Value::Object(error.clone()).try_display(), Ok(String::new()));

        inner.clear();
        error.clear();
        drop((inner, error));
        assert_eq!(meter.used(), 0);
    }
}
