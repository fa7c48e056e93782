/*!
 * Gate Enforcement Tests
 * Capability and environment checks as scripts hit them at runtime
 */

use pretty_assertions::assert_eq;
use script_sandbox::{
    CapabilityPolicy, CoordinatorBuilder, ExecutionRequest, ExecutionResult, Severity,
    TerminationReason, ViolationKind, ViolationSource,
};
use std::collections::HashMap;

async fn run_with(policy: CapabilityPolicy, source: &str) -> ExecutionResult {
    CoordinatorBuilder::new()
        .with_strict_mode(false)
        .with_capability_policy(policy)
        .with_environment(HashMap::from([
            ("NODE_ENV".to_string(), "test".to_string()),
            ("SESSION_ID".to_string(), "abc".to_string()),
        ]))
        .build()
        .unwrap()
        .execute_securely(ExecutionRequest::javascript(source))
        .await
}

async fn run(source: &str) -> ExecutionResult {
    run_with(CapabilityPolicy::default(), source).await
}

fn runtime_kinds(result: &ExecutionResult) -> Vec<(ViolationKind, Severity)> {
    result
        .report
        .violations
        .iter()
        .filter(|v| v.source != ViolationSource::StaticAnalyzer)
        .map(|v| (v.kind, v.severity))
        .collect()
}

#[tokio::test]
async fn test_process_exit_halts_the_unit() {
    let result = run("console.log('before');\nprocess.exit(0);\nconsole.log('after');").await;
    assert!(!result.success);
    assert_eq!(result.output, "before");
    assert_eq!(
        runtime_kinds(&result),
        vec![(ViolationKind::CapabilityDenied, Severity::Critical)]
    );
    let expected = format!("Execution terminated: {}", TerminationReason::PolicyViolation);
    assert!(result.errors.contains(&expected));
}

#[tokio::test]
async fn test_unlisted_module_throws_catchable_error() {
    let result = run("try { require('left-pad'); } catch (e) { console.log(e.message); }\nconsole.log('continued');").await;
    assert!(!result.success);
    assert_eq!(
        result.output,
        "Capability 'left-pad' is not allow-listed\ncontinued"
    );
    assert_eq!(
        runtime_kinds(&result),
        vec![(ViolationKind::CapabilityDenied, Severity::High)]
    );
}

#[tokio::test]
async fn test_hidden_operation_is_medium() {
    let result = run(
        "const path = require('path');\ntry { path.resolve('x'); } catch (e) { console.log('hidden'); }\nconsole.log(path.basename('/a/b.txt'));",
    )
    .await;
    assert!(result.success, "errors: {:?}", result.errors);
    assert_eq!(result.output, "hidden\nb.txt");
    assert_eq!(
        runtime_kinds(&result),
        vec![(ViolationKind::CapabilityDenied, Severity::Medium)]
    );
    assert_eq!(result.report.score, 90);
}

#[tokio::test]
async fn test_import_declarations_go_through_the_gate() {
    let result = run("import { join } from 'path';\nconsole.log(join('a', 'b'));").await;
    assert!(result.success, "errors: {:?}", result.errors);
    assert_eq!(result.output, "a/b");

    let denied = run("import { execSync } from 'child_process';\nconsole.log('unreachable');").await;
    assert!(!denied.success);
    assert!(denied.output.is_empty());
}

#[tokio::test]
async fn test_custom_policy_allows_extra_module() {
    let policy = CapabilityPolicy::default().allow("util", &["format"]);
    let result = run_with(policy, "const util = require('util');\nconsole.log(util.format('%d-%s', 7, 'x'));").await;
    assert!(result.success, "errors: {:?}", result.errors);
    assert_eq!(result.output, "7-x");
}

#[tokio::test]
async fn test_dynamic_code_is_refused() {
    let result = run(
        "try { eval('1 + 1'); } catch (e) { console.log('no eval'); }\ntry { new Function('return 1'); } catch (e) { console.log('no Function'); }",
    )
    .await;
    assert!(!result.success);
    assert_eq!(result.output, "no eval\nno Function");
    let runtime = runtime_kinds(&result);
    assert_eq!(runtime.len(), 2);
    assert!(runtime
        .iter()
        .all(|(kind, severity)| *kind == ViolationKind::CapabilityDenied && *severity == Severity::High));
}

#[tokio::test]
async fn test_string_timer_is_refused() {
    let result = run("try { setTimeout('console.log(1)', 0); } catch (e) { console.log('refused'); }").await;
    assert_eq!(result.output, "refused");
    assert!(result.report.has_kind(ViolationKind::CapabilityDenied));
}

#[tokio::test]
async fn test_environment_write_is_refused() {
    let result = run(
        "try { process.env.NODE_ENV = 'dev'; } catch (e) { console.log(e.name); }\nconsole.log(process.env.NODE_ENV);",
    )
    .await;
    assert!(!result.success);
    assert_eq!(result.output, "TypeError\ntest");
    assert_eq!(
        runtime_kinds(&result),
        vec![(ViolationKind::EnvironmentDenied, Severity::High)]
    );
}

#[tokio::test]
async fn test_sensitive_marker_read_halts() {
    let result = run("console.log('start');\nconst id = process.env['SESSION_ID'];\nconsole.log(id);").await;
    assert!(!result.success);
    assert_eq!(result.output, "start");
    assert_eq!(
        runtime_kinds(&result),
        vec![(ViolationKind::EnvironmentDenied, Severity::Critical)]
    );
}

#[tokio::test]
async fn test_environment_spread_and_stringify_are_filtered() {
    let result = run("console.log(JSON.stringify({ ...process.env }));").await;
    assert_eq!(result.output, r#"{"NODE_ENV":"test"}"#);
    assert!(result.report.has_kind(ViolationKind::EnvironmentEnumeration));
    assert!(!result.output.contains("SESSION_ID"));
}
