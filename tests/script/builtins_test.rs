/*!
 * Builtin Library Tests
 * Console rendering, strings, arrays, JSON, Math and Buffer
 */

use pretty_assertions::assert_eq;
use script_sandbox::{CoordinatorBuilder, ExecutionRequest, ExecutionResult};
use std::collections::HashMap;

async fn run(source: &str) -> ExecutionResult {
    CoordinatorBuilder::new()
        .with_strict_mode(false)
        .with_environment(HashMap::new())
        .build()
        .unwrap()
        .execute_securely(ExecutionRequest::javascript(source))
        .await
}

async fn output(source: &str) -> String {
    let result = run(source).await;
    assert!(result.success, "errors: {:?}", result.errors);
    result.output
}

#[tokio::test]
async fn test_console_renders_containers() {
    let out = output(
        "console.log([1, 'two', [3]]);\nconsole.log({ a: 1, 'b-c': 'x', nested: { deep: true } });\nconsole.log([], {});",
    )
    .await;
    assert_eq!(
        out,
        "[ 1, 'two', [ 3 ] ]\n{ a: 1, 'b-c': 'x', nested: { deep: true } }\n[] {}"
    );
}

#[tokio::test]
async fn test_console_placeholders() {
    let out = output("console.log('%s has %d items (%i%%)', 'cart', 3, 42.9);").await;
    assert_eq!(out, "cart has 3 items (42%)");
}

#[tokio::test]
async fn test_console_error_goes_to_errors() {
    let result = run("console.error('bad thing');\nconsole.warn('careful');\nconsole.info('fine');").await;
    assert!(result.success);
    assert_eq!(result.output, "fine");
    assert_eq!(result.errors, vec!["bad thing".to_string(), "careful".to_string()]);
}

#[tokio::test]
async fn test_string_methods() {
    let out = output(
        r#"
        const s = '  Sandbox Runtime  ';
        console.log(s.trim().toUpperCase());
        console.log('a,b,,c'.split(','));
        console.log('abc'.padStart(5, '*'), 'abc'.at(-1), 'banana'.replaceAll('a', 'o'));
        console.log('hello'.slice(1, 3), 'hello'.indexOf('l'), 'hello'.includes('ell'));
        "#,
    )
    .await;
    assert_eq!(
        out,
        "SANDBOX RUNTIME\n[ 'a', 'b', '', 'c' ]\n**abc c bonono\nel 2 true"
    );
}

#[tokio::test]
async fn test_array_methods() {
    let out = output(
        r#"
        const xs = [5, 1, 4, 2, 3];
        console.log(xs.slice().sort((a, b) => a - b).join(''));
        console.log(xs.filter(x => x > 2).map(x => x * 10));
        console.log(xs.find(x => x > 3), xs.findIndex(x => x === 2), xs.some(x => x > 4), xs.every(x => x > 0));
        console.log([[1, [2]], [3]].flat(), [1, 2].flatMap(x => [x, x]));
        const spliced = [1, 2, 3, 4];
        const removed = spliced.splice(1, 2, 'x');
        console.log(spliced, removed);
        console.log([10, 9, 1].sort());
        "#,
    )
    .await;
    assert_eq!(
        out,
        "12345\n[ 50, 40, 30 ]\n5 3 true true\n[ 1, [ 2 ], 3 ] [ 1, 1, 2, 2 ]\n[ 1, 'x', 4 ] [ 2, 3 ]\n[ 1, 10, 9 ]"
    );
}

#[tokio::test]
async fn test_object_helpers() {
    let out = output(
        r#"
        const o = { b: 2, a: 1 };
        console.log(Object.keys(o).join(), Object.values(o).join());
        console.log(JSON.stringify(Object.entries(o)));
        console.log(JSON.stringify(Object.assign({}, o, { c: 3 })));
        console.log(JSON.stringify(Object.fromEntries([['k', 'v']])));
        console.log(o.hasOwnProperty('a'), 'z' in o);
        "#,
    )
    .await;
    assert_eq!(
        out,
        "b,a 2,1\n[[\"b\",2],[\"a\",1]]\n{\"b\":2,\"a\":1,\"c\":3}\n{\"k\":\"v\"}\ntrue false"
    );
}

#[tokio::test]
async fn test_json_round_trip() {
    let out = output(
        r#"
        const parsed = JSON.parse('{"name":"unit","tags":["a","b"],"n":1.5,"ok":null}');
        console.log(parsed.name, parsed.tags.length, parsed.n, parsed.ok);
        console.log(JSON.stringify({ skip: undefined, f: () => 1, keep: [undefined] }));
        console.log(JSON.stringify({ a: [1] }, null, 2));
        "#,
    )
    .await;
    assert_eq!(
        out,
        "unit 2 1.5 null\n{\"keep\":[null]}\n{\n  \"a\": [\n    1\n  ]\n}"
    );
}

#[tokio::test]
async fn test_json_parse_failure_is_catchable() {
    let out = output("try { JSON.parse('{oops'); } catch (e) { console.log(e.name); }").await;
    assert_eq!(out, "SyntaxError");
}

#[tokio::test]
async fn test_circular_stringify_throws_type_error() {
    let out = output("const a = {}; a.self = a;\ntry { JSON.stringify(a); } catch (e) { console.log(e instanceof TypeError); }").await;
    assert_eq!(out, "true");
}

#[tokio::test]
async fn test_math_and_number_helpers() {
    let out = output(
        r#"
        console.log(Math.max(1, 9, 3), Math.min(), Math.round(2.5), Math.floor(-1.5), Math.abs(-4));
        console.log((3.14159).toFixed(2), (255).toString(16), parseInt('42px'), parseFloat('3.5e1'));
        console.log(Number.isInteger(5), Number.isNaN('x'), isNaN('x'), Number('  12 '));
        const r = Math.random();
        console.log(r >= 0 && r < 1);
        "#,
    )
    .await;
    assert_eq!(
        out,
        "9 Infinity 3 -2 4\n3.14 ff 42 35\ntrue false true 12\ntrue"
    );
}

#[tokio::test]
async fn test_buffer_encodings() {
    let out = output(
        r#"
        const b = Buffer.from('hi!');
        console.log(b.toString('hex'), b.toString('base64'), b.length);
        console.log(Buffer.from('aGkh', 'base64').toString());
        console.log(Buffer.from('6869', 'hex'));
        console.log(Buffer.isBuffer(b), Buffer.byteLength('héllo'));
        "#,
    )
    .await;
    assert_eq!(out, "686921 aGkh 3\nhi!\n<Buffer 68 69>\ntrue 6");
}

#[tokio::test]
async fn test_allowed_module_proxy() {
    let out = output(
        "const path = require('path');\nconsole.log(path.join('/srv', 'app/../data', 'x.json'), path.extname('x.json'));",
    )
    .await;
    assert_eq!(out, "/srv/data/x.json .json");
}

#[tokio::test]
async fn test_process_surface() {
    let out = output(
        "console.log(process.cwd(), typeof process.uptime(), typeof process.memoryUsage().heapUsed);",
    )
    .await;
    assert_eq!(out, "/sandbox number number");
}

#[tokio::test]
async fn test_output_is_truncated_at_the_limit() {
    let result = run("for (let i = 0; i < 200000; i++) console.log('line ' + i);").await;
    assert!(result.success, "errors: {:?}", result.errors);
    assert!(result.output.starts_with("line 0\nline 1\n"));
    assert!(!result.output.contains("line 199999"));
    assert_eq!(
        result.errors,
        vec![script_sandbox::process::TRUNCATION_MARKER.to_string()]
    );
}
