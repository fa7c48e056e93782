/*!
 * Script Language Tests
 * Statements, expressions and scoping as seen through a full execution
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
        .execute_securely(ExecutionRequest::javascript(source))
        .await
}

async fn output(source: &str) -> String {
    let result = run(source).await;
    assert!(result.success, "errors: {:?}", result.errors);
    result.output
}

#[tokio::test]
async fn test_arithmetic_and_number_formatting() {
    let out = output(
        "console.log(7 / 2);\nconsole.log(0.1 + 0.2);\nconsole.log(2 ** 10);\nconsole.log(-7 % 3);\nconsole.log(1 / 0);\nconsole.log(1e21);",
    )
    .await;
    assert_eq!(out, "3.5\n0.30000000000000004\n1024\n-1\nInfinity\n1e+21");
}

#[tokio::test]
async fn test_string_concatenation_and_coercion() {
    let out = output("console.log('a' + 1 + 2);\nconsole.log(1 + 2 + 'a');\nconsole.log('3' * '4');").await;
    assert_eq!(out, "a12\n3a\n12");
}

#[tokio::test]
async fn test_equality_rules() {
    let out = output(
        "console.log(1 == '1', 1 === '1', null == undefined, null === undefined, NaN === NaN);",
    )
    .await;
    assert_eq!(out, "true false true false false");
}

#[tokio::test]
async fn test_block_scoping_and_closures() {
    let out = output(
        r#"
        const counters = [];
        for (let i = 0; i < 3; i++) {
            counters.push(() => i);
        }
        console.log(counters.map(f => f()).join(','));

        function makeCounter() {
            let count = 0;
            return { next: () => ++count };
        }
        const c = makeCounter();
        c.next();
        console.log(c.next());
        "#,
    )
    .await;
    assert_eq!(out, "0,1,2\n2");
}

#[tokio::test]
async fn test_function_hoisting_and_recursion() {
    let out = output(
        "console.log(fib(15));\nfunction fib(n) { return n < 2 ? n : fib(n - 1) + fib(n - 2); }",
    )
    .await;
    assert_eq!(out, "610");
}

#[tokio::test]
async fn test_template_literals() {
    let out = output("const name = 'sandbox';\nconsole.log(`hello ${name}, ${1 + 1} times`);").await;
    assert_eq!(out, "hello sandbox, 2 times");
}

#[tokio::test]
async fn test_destructuring_and_spread() {
    let out = output(
        r#"
        const [first, , third] = [1, 2, 3];
        const { a, b: renamed } = { a: 'x', b: 'y' };
        const merged = { ...{ p: 1 }, q: 2 };
        const joined = [...[1, 2], ...[3]];
        function sum(...values) { return values.reduce((s, v) => s + v, 0); }
        console.log(first, third, a, renamed);
        console.log(JSON.stringify(merged), joined.length, sum(...joined));
        "#,
    )
    .await;
    assert_eq!(out, "1 3 x y\n{\"p\":1,\"q\":2} 3 6");
}

#[tokio::test]
async fn test_default_parameters() {
    let out = output("function greet(who = 'world') { return 'hi ' + who; }\nconsole.log(greet(), greet('you'));").await;
    assert_eq!(out, "hi world hi you");
}

#[tokio::test]
async fn test_loops_and_control_flow() {
    let out = output(
        r#"
        let evens = [];
        for (const n of [1, 2, 3, 4, 5, 6]) {
            if (n === 5) break;
            if (n % 2) continue;
            evens.push(n);
        }
        let keys = [];
        for (const k in { x: 1, y: 2 }) keys.push(k);
        let i = 0;
        do { i += 3; } while (i < 10);
        let w = 0;
        while (w < 4) w++;
        console.log(evens.join(' '), keys.join(''), i, w);
        "#,
    )
    .await;
    assert_eq!(out, "2 4 xy 12 4");
}

#[tokio::test]
async fn test_switch_fallthrough() {
    let out = output(
        r#"
        function label(n) {
            switch (n) {
                case 1:
                case 2:
                    return 'small';
                case 3:
                    return 'three';
                default:
                    return 'big';
            }
        }
        console.log([1, 2, 3, 9].map(label).join(','));
        "#,
    )
    .await;
    assert_eq!(out, "small,small,three,big");
}

#[tokio::test]
async fn test_try_catch_finally() {
    let out = output(
        r#"
        const log = [];
        try {
            log.push('try');
            null.boom;
        } catch (e) {
            log.push(e instanceof TypeError ? 'type' : 'other');
        } finally {
            log.push('finally');
        }
        try { throw new Error('custom'); } catch ({ message }) { log.push(message); }
        console.log(log.join(' '));
        "#,
    )
    .await;
    assert_eq!(out, "try type finally custom");
}

#[tokio::test]
async fn test_optional_chaining_and_nullish() {
    let out = output(
        "const o = { inner: null, zero: 0 };\nconsole.log(o.inner?.deep.value, o.zero ?? 5, o.missing ?? 'fallback', o.zero || 5);",
    )
    .await;
    assert_eq!(out, "undefined 0 fallback 5");
}

#[tokio::test]
async fn test_logical_assignment() {
    let out = output("let a = null; a ??= 3; let b = 1; b &&= 7; let c = 0; c ||= 9;\nconsole.log(a, b, c);").await;
    assert_eq!(out, "3 7 9");
}

#[tokio::test]
async fn test_typeof_and_undeclared_access() {
    let out = output("console.log(typeof undeclaredThing, typeof 1, typeof 'x', typeof {}, typeof null, typeof (() => 1));").await;
    assert_eq!(out, "undefined number string object object function");
}

#[tokio::test]
async fn test_methods_bind_this() {
    let out = output(
        "const account = { balance: 10, deposit(n) { this.balance += n; return this; } };\nconsole.log(account.deposit(5).deposit(1).balance);",
    )
    .await;
    assert_eq!(out, "16");
}

#[tokio::test]
async fn test_const_reassignment_throws() {
    let result = run("const fixed = 1;\nfixed = 2;").await;
    assert!(!result.success);
    assert!(result.errors.iter().any(|e| e.contains("TypeError")));
}

#[tokio::test]
async fn test_undeclared_assignment_throws() {
    let result = run("leaked = 1;").await;
    assert!(!result.success);
    assert!(result.errors.iter().any(|e| e.contains("ReferenceError")));
}

#[tokio::test]
async fn test_syntax_error_is_reported() {
    let result = run("function (").await;
    assert!(!result.success);
    assert!(result.report.safe);
    assert!(result.output.is_empty());
    assert_eq!(result.errors.len(), 1);
}

#[tokio::test]
async fn test_unbounded_recursion_is_a_range_error() {
    let result = run("function down(n) { return down(n + 1); }\ndown(0);").await;
    assert!(!result.success);
    assert!(result.errors.iter().any(|e| e.contains("RangeError")));
}

#[tokio::test]
async fn test_timers_run_after_main_script() {
    let out = output(
        "setTimeout(() => console.log('later'), 20);\nsetTimeout(() => console.log('sooner'), 0);\nconsole.log('now');",
    )
    .await;
    assert_eq!(out, "now\nsooner\nlater");
}

#[tokio::test]
async fn test_cleared_interval_stops() {
    let out = output(
        "let ticks = 0;\nconst id = setInterval(() => { ticks++; if (ticks === 3) clearInterval(id); }, 1);\nsetTimeout(() => console.log(ticks), 50);",
    )
    .await;
    assert_eq!(out, "3");
}
