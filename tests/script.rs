/*!
 * Script runtime tests entry point
 */

#[path = "script/language_test.rs"]
mod language_test;

#[path = "script/builtins_test.rs"]
mod builtins_test;

#[path = "script/gates_test.rs"]
mod gates_test;

#[path = "script/nesting_test.rs"]
mod nesting_test;
