/*!
 * Script Runtime
 * Lexer, parser and metered tree-walking interpreter for the sandboxed script subset
 */

pub mod ast;
mod builtins;
mod format;
pub mod heap;
pub mod interpreter;
mod json;
pub mod lexer;
pub mod parser;
pub mod value;

// Re-export for convenience
pub use heap::{Charge, Collector, HeapExhausted, HeapMeter, HeapSnapshot};
pub use interpreter::{Interpreter, RuntimeError};
pub use lexer::SyntaxError;
pub use parser::parse;
pub use value::Value;
