/*!
 * Nesting Tests
 * Deep and cyclic structures built by scripts end in a RangeError, never a crash
 */

use pretty_assertions::assert_eq;
use script_sandbox::{Coordinator, CoordinatorBuilder, ExecutionRequest, ExecutionResult};
use std::collections::HashMap;

fn coordinator() -> Coordinator {
    CoordinatorBuilder::new()
        .with_strict_mode(false)
        .with_environment(HashMap::new())
        .build()
        .unwrap()
}

async fn run(source: &str) -> ExecutionResult {
    coordinator()
        .execute_securely(ExecutionRequest::javascript(source).with_timeout_ms(60_000))
        .await
}

async fn output(source: &str) -> String {
    let result = run(source).await;
    assert!(result.success, "errors: {:?}", result.errors);
    result.output
}

fn range_error(result: &ExecutionResult) -> bool {
    !result.success && result.errors.iter().any(|e| e.contains("RangeError"))
}

#[tokio::test]
async fn test_deep_array_chain_is_released() {
    let out = output(
        "let o = [];\nfor (let i = 0; i < 600000; i++) { o = [o]; }\no = null;\nconsole.log('released');",
    )
    .await;
    assert_eq!(out, "released");
}

#[tokio::test]
async fn test_deep_object_chain_is_released() {
    let out = output(
        "let o = {};\nfor (let i = 0; i < 300000; i++) { o = { next: o }; }\no = undefined;\nconsole.log('released');",
    )
    .await;
    assert_eq!(out, "released");
}

#[tokio::test]
async fn test_deep_chain_left_live_is_torn_down() {
    let out = output("const keep = [];\nlet o = keep;\nfor (let i = 0; i < 300000; i++) { const next = []; o.push(next); o = next; }\nconsole.log('built');").await;
    assert_eq!(out, "built");
}

#[tokio::test]
async fn test_string_conversion_of_deep_nesting_is_a_range_error() {
    let result = run(
        "let o = [];\nfor (let i = 0; i < 300000; i++) { o = [o]; }\nconsole.log(String(o).length);",
    )
    .await;
    assert!(range_error(&result), "errors: {:?}", result.errors);
    assert!(result.output.is_empty());
}

#[tokio::test]
async fn test_every_string_conversion_reports_deep_nesting() {
    let out = output(
        "let o = [];\nfor (let i = 0; i < 1000; i++) { o = [o]; }\n\
         const forms = [() => String(o), () => o.join(','), () => o.toString(), () => `${o}`, () => '' + o];\n\
         for (const form of forms) { try { form(); console.log('rendered'); } catch (e) { console.log(e.name); } }",
    )
    .await;
    assert_eq!(out, vec!["RangeError"; 5].join("\n"));
}

#[tokio::test]
async fn test_moderate_nesting_still_renders() {
    let out = output("console.log(String([[1, [2, [3]]], 4]));\nconst a = [1];\na.push(a);\nconsole.log(String(a));").await;
    assert_eq!(out, "1,2,3,4\n1,");
}

#[tokio::test]
async fn test_flat_infinity_on_cycle_is_a_range_error() {
    let result = run("const a = [1];\na.push(a);\nconsole.log(a.flat(Infinity).length);").await;
    assert!(range_error(&result), "errors: {:?}", result.errors);
}

#[tokio::test]
async fn test_flat_finite_depth_on_cycle() {
    let out = output("const a = [1];\na.push(a);\nconsole.log(a.flat(1).length, a.flat(3).length);").await;
    assert_eq!(out, "3 5");
}

#[tokio::test]
async fn test_flat_of_deep_nesting_is_a_range_error() {
    let out = output(
        "let o = [1];\nfor (let i = 0; i < 1000; i++) { o = [o]; }\n\
         console.log(o.flat(10).length);\n\
         try { o.flat(Infinity); } catch (e) { console.log(e.name); }",
    )
    .await;
    assert_eq!(out, "1\nRangeError");
}

#[tokio::test]
async fn test_spread_and_assign_of_deep_structures() {
    let out = output(
        "let a = [];\nlet o = {};\nfor (let i = 0; i < 100000; i++) { a = [a]; o = { next: o }; }\n\
         const copy = [...a];\nconst merged = Object.assign({}, o, { a: a });\n\
         console.log(copy.length, Object.keys(merged).join());",
    )
    .await;
    assert_eq!(out, "1 next,a");
}

#[tokio::test]
async fn test_json_stringify_of_deep_nesting_is_a_range_error() {
    let out = output(
        "let o = {};\nfor (let i = 0; i < 1000; i++) { o = { next: o }; }\n\
         try { JSON.stringify(o); } catch (e) { console.log(e.name); }",
    )
    .await;
    assert_eq!(out, "RangeError");
}

#[tokio::test]
async fn test_comparisons_and_logging_of_deep_nesting_complete() {
    let out = output(
        "let o = [];\nfor (let i = 0; i < 100000; i++) { o = [o]; }\n\
         console.log(typeof (o == ''));\nconsole.log(o);",
    )
    .await;
    assert!(out.starts_with("boolean\n"), "output: {}", out);
}
