/*!
 * Value Formatting
 * Console rendering: `util.inspect` style output and printf placeholders
 */

use super::interpreter::Interpreter;
use super::json::JsonFailure;
use super::value::*;
use std::rc::Rc;

/// Containers nested deeper than this render as `[Array]` / `[Object]`
const INSPECT_DEPTH: usize = 2;

/// Array items shown before eliding the rest
const INSPECT_ARRAY_ITEMS: usize = 100;

/// Buffer bytes shown before eliding the rest
const INSPECT_BUFFER_BYTES: usize = 50;

/// Width above which containers break onto multiple lines
const BREAK_WIDTH: usize = 72;

impl Interpreter {
    /// Render a value the way `console.log` shows a non-string argument
    pub(super) fn inspect(&self, value: &Value) -> String {
        self.inspect_at(value, 0, &mut Vec::new(), false)
    }

    /// Join `console.log` arguments, expanding a leading format string
    pub(super) fn format_args(&self, args: &[Value]) -> String {
        let mut parts = Vec::with_capacity(args.len());
        let rest = match args.split_first() {
            Some((Value::Str(format), rest)) if format.as_str().contains('%') => {
                let (formatted, used) = self.apply_placeholders(format.as_str(), rest);
                parts.push(formatted);
                &rest[used..]
            }
            _ => args,
        };
        for value in rest {
            parts.push(match value {
                Value::Str(s) => s.as_str().to_string(),
                other => self.inspect(other),
            });
        }
        parts.join(" ")
    }

    fn apply_placeholders(&self, format: &str, args: &[Value]) -> (String, usize) {
        let mut out = String::with_capacity(format.len());
        let mut used = 0;
        let mut chars = format.chars().peekable();
        while let Some(c) = chars.next() {
            if c != '%' {
                out.push(c);
                continue;
            }
            let spec = match chars.peek() {
                Some('%') => {
                    chars.next();
                    out.push('%');
                    continue;
                }
                Some(&spec @ ('s' | 'd' | 'i' | 'f' | 'j' | 'o' | 'O' | 'c')) => spec,
                _ => {
                    out.push('%');
                    continue;
                }
            };
            chars.next();
            let Some(value) = args.get(used) else {
                out.push('%');
                out.push(spec);
                continue;
            };
            used += 1;
            match spec {
                's' => match value {
                    Value::Str(s) => out.push_str(s.as_str()),
                    Value::Array(_) | Value::Object(_) => out.push_str(&self.inspect(value)),
                    other => out.push_str(&other.to_display()),
                },
                'd' => out.push_str(&format_number(value.to_number())),
                'i' => out.push_str(&format_number(value.to_number().trunc())),
                'f' => out.push_str(&format_number(value.to_number())),
                'j' => match self.to_json_text(value, None) {
                    Ok(Some(text)) => out.push_str(&text),
                    Ok(None) => out.push_str("undefined"),
                    Err(JsonFailure::Circular) => out.push_str("[Circular]"),
                    Err(JsonFailure::TooDeep) => out.push_str("[Too deep]"),
                },
                // CSS styling has no meaning off a browser console
                'c' => {}
                _ => out.push_str(&self.inspect_at(value, 0, &mut Vec::new(), true)),
            }
        }
        (out, used)
    }

    fn inspect_at(&self, value: &Value, depth: usize, seen: &mut Vec<usize>, nested: bool) -> String {
        match value {
            Value::Str(s) if nested => quote(s.as_str()),
            Value::Number(n) if *n == 0.0 && n.is_sign_negative() => "-0".to_string(),
            Value::Array(array) => {
                let id = Rc::as_ptr(array) as usize;
                if seen.contains(&id) {
                    return "[Circular *1]".to_string();
                }
                let items = array.snapshot();
                if items.is_empty() {
                    return "[]".to_string();
                }
                if depth > INSPECT_DEPTH {
                    return "[Array]".to_string();
                }
                seen.push(id);
                let mut parts: Vec<String> = items
                    .iter()
                    .take(INSPECT_ARRAY_ITEMS)
                    .map(|item| self.inspect_at(item, depth + 1, seen, true))
                    .collect();
                seen.pop();
                if items.len() > INSPECT_ARRAY_ITEMS {
                    let more = items.len() - INSPECT_ARRAY_ITEMS;
                    parts.push(format!("... {} more item{}", more, plural(more)));
                }
                wrap("[", "]", &parts, depth)
            }
            Value::Object(object) if object.tag() == ObjectTag::Error => {
                match object.get("stack") {
                    Some(Value::Str(stack)) => stack.as_str().to_string(),
                    _ => value.to_display(),
                }
            }
            Value::Object(object) => {
                let id = Rc::as_ptr(object) as usize;
                if seen.contains(&id) {
                    return "[Circular *1]".to_string();
                }
                let entries = object.entries().clone();
                if entries.is_empty() {
                    return "{}".to_string();
                }
                if depth > INSPECT_DEPTH {
                    return "[Object]".to_string();
                }
                seen.push(id);
                let parts: Vec<String> = entries
                    .iter()
                    .map(|(key, item)| {
                        format!("{}: {}", format_key(key), self.inspect_at(item, depth + 1, seen, true))
                    })
                    .collect();
                seen.pop();
                wrap("{", "}", &parts, depth)
            }
            Value::Bytes(bytes) => {
                let data = bytes.data();
                let mut out = String::from("<Buffer");
                for byte in data.iter().take(INSPECT_BUFFER_BYTES) {
                    out.push_str(&format!(" {:02x}", byte));
                }
                if data.len() > INSPECT_BUFFER_BYTES {
                    let more = data.len() - INSPECT_BUFFER_BYTES;
                    out.push_str(&format!(" ... {} more byte{}", more, plural(more)));
                }
                out.push('>');
                out
            }
            Value::Function(closure) => match closure.name() {
                Some(name) if !name.is_empty() => format!("[Function: {}]", name),
                _ => "[Function (anonymous)]".to_string(),
            },
            Value::Native(Native::Builtin(builtin)) => format!("[Function: {}]", builtin.name()),
            Value::Native(Native::Bound(method)) => format!("[Function: {}]", method.name),
            Value::Host(HostObject::Env) => {
                let parts: Vec<String> = self
                    .ctx
                    .environment
                    .enumerate()
                    .into_iter()
                    .filter_map(|name| {
                        let value = self.ctx.environment.get(&name).ok().flatten()?;
                        Some(format!("{}: {}", format_key(&name), quote(&value)))
                    })
                    .collect();
                if parts.is_empty() {
                    return "{}".to_string();
                }
                wrap("{", "}", &parts, depth)
            }
            Value::Host(HostObject::Module(module)) => {
                let parts: Vec<String> = module
                    .operations()
                    .map(|op| format!("{}: [Function: {}]", op, op))
                    .collect();
                wrap("{", "}", &parts, depth)
            }
            Value::Host(host) if host.is_constructor() => format!("[Function: {}]", host.name()),
            Value::Host(host) => format!("Object [{}] {{}}", host.name()),
            other => other.to_display(),
        }
    }
}

fn wrap(open: &str, close: &str, parts: &[String], depth: usize) -> String {
    let single = format!("{} {} {}", open, parts.join(", "), close);
    if single.len() + depth * 2 <= BREAK_WIDTH && !single.contains('\n') {
        return single;
    }
    let indent = "  ".repeat(depth + 1);
    format!(
        "{}\n{}{}\n{}{}",
        open,
        indent,
        parts.join(&format!(",\n{}", indent)),
        "  ".repeat(depth),
        close
    )
}

fn plural(n: usize) -> &'static str {
    if n == 1 {
        ""
    } else {
        "s"
    }
}

/// Single-quoted string literal
fn quote(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('\'');
    for c in text.chars() {
        match c {
            '\'' => out.push_str("\\'"),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out.push('\'');
    out
}

fn format_key(key: &str) -> String {
    let mut chars = key.chars();
    let identifier = chars
        .next()
        .is_some_and(|c| c.is_alphabetic() || c == '_' || c == '$')
        && chars.all(|c| c.is_alphanumeric() || c == '_' || c == '$');
    if identifier {
        key.to_string()
    } else {
        quote(key)
    }
}
