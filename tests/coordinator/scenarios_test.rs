/*!
 * End-to-end Scenarios
 * Benign, denied, runaway, memory-hungry and snooping scripts
 */

use pretty_assertions::assert_eq;
use script_sandbox::{
    Coordinator, CoordinatorBuilder, ExecutionRequest, RiskLevel, SandboxConfig, Severity,
    ViolationKind, ViolationSource,
};
use std::collections::HashMap;
use std::time::Instant;

fn environment() -> HashMap<String, String> {
    HashMap::from([
        ("NODE_ENV".to_string(), "production".to_string()),
        ("TZ".to_string(), "UTC".to_string()),
        ("AWS_SECRET_ACCESS_KEY".to_string(), "hunter2".to_string()),
        ("HOME".to_string(), "/root".to_string()),
        ("BUILD_NUMBER".to_string(), "42".to_string()),
    ])
}

fn coordinator(strict: bool) -> Coordinator {
    CoordinatorBuilder::new()
        .with_strict_mode(strict)
        .with_environment(environment())
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_scenario_benign_arithmetic() {
    let coordinator = coordinator(true);
    let result = coordinator
        .execute_securely(ExecutionRequest::javascript("console.log(2+2)"))
        .await;

    assert!(result.success, "errors: {:?}", result.errors);
    assert!(result.output.contains('4'));
    assert_eq!(result.report.risk_level, RiskLevel::Low);
    assert_eq!(result.report.score, 100);
    assert!(result.report.safe);
    assert!(!result.timed_out);
    assert!(result.errors.is_empty());
}

#[tokio::test]
async fn test_scenario_denied_filesystem_static() {
    let coordinator = coordinator(true);
    let before = coordinator.status().units_spawned;
    let result = coordinator
        .execute_securely(ExecutionRequest::javascript(
            "const fs = require('fs');\nconsole.log(fs.readFileSync('/etc/passwd', 'utf8'));",
        ))
        .await;

    assert!(!result.success);
    assert!(result.report.static_rejection);
    assert!(result.report.score <= 50);
    assert_eq!(result.report.risk_level, RiskLevel::Critical);
    let critical = result
        .report
        .violations
        .iter()
        .find(|v| v.severity == Severity::Critical)
        .expect("critical finding");
    assert_eq!(critical.kind, ViolationKind::CapabilityDenied);
    assert_eq!(critical.source, ViolationSource::StaticAnalyzer);
    assert_eq!(critical.subject.as_deref(), Some("fs"));
    assert_eq!(critical.line, Some(1));
    assert_eq!(coordinator.status().units_spawned, before);
}

#[tokio::test]
async fn test_scenario_denied_filesystem_at_runtime() {
    let coordinator = coordinator(false);
    let result = coordinator
        .execute_securely(ExecutionRequest::javascript(
            "let fs;\ntry { fs = require('node:fs'); } catch (e) { console.log('recovered'); }\nconsole.log('after');",
        ))
        .await;

    assert!(!result.success);
    assert!(!result.report.static_rejection);
    assert!(result.report.score <= 50);
    assert!(result.report.violations.iter().any(|v| {
        v.kind == ViolationKind::CapabilityDenied
            && v.severity == Severity::Critical
            && v.source == ViolationSource::CapabilityGate
    }));
    // A deny-listed acquisition halts the unit; script code cannot catch it
    assert!(!result.output.contains("recovered"));
    assert!(!result.output.contains("after"));
    assert_eq!(coordinator.status().units_spawned, 1);
}

#[tokio::test]
async fn test_scenario_infinite_loop_times_out() {
    let coordinator = coordinator(true);
    let started = Instant::now();
    let result = coordinator
        .execute_securely(ExecutionRequest::javascript("while(true){}").with_timeout_ms(1000))
        .await;
    let elapsed = started.elapsed().as_millis();

    assert!(!result.success);
    assert!(result.timed_out);
    assert!(result.report.timed_out);
    assert!(result.report.has_kind(ViolationKind::Timeout));
    assert!(elapsed >= 1000, "stopped early after {} ms", elapsed);
    assert!(elapsed < 2500, "took {} ms to stop", elapsed);
    assert!(result.errors.iter().any(|e| e.contains("terminated")));
}

#[tokio::test]
async fn test_scenario_unbounded_allocation_is_aborted() {
    let coordinator = coordinator(true);
    let result = coordinator
        .execute_securely(
            ExecutionRequest::javascript(
                "const hoard = [];\nwhile (true) { hoard.push(new Array(10000).fill(7)); }",
            )
            .with_memory_limit_bytes(16 * 1024 * 1024)
            .with_timeout_ms(20_000),
        )
        .await;

    assert!(!result.success);
    assert!(!result.timed_out);
    assert!(!result.report.memory_usage.safe);
    assert!(result.report.violations.iter().any(|v| {
        v.kind == ViolationKind::MemoryExceeded && v.severity == Severity::Critical
    }));
    assert!(result.report.memory_usage.peak_heap_bytes > 16 * 1024 * 1024);
    // The hard stop sits at twice the ceiling
    assert!(result.report.memory_usage.peak_heap_bytes <= 32 * 1024 * 1024);
}

#[tokio::test]
async fn test_scenario_environment_enumeration() {
    let coordinator = coordinator(true);
    let result = coordinator
        .execute_securely(ExecutionRequest::javascript(
            "console.log(JSON.stringify(Object.keys(process.env)));",
        ))
        .await;

    assert!(!result.success);
    assert_eq!(result.output, r#"["NODE_ENV","TZ"]"#);
    let enumerations = result
        .report
        .violations
        .iter()
        .filter(|v| v.kind == ViolationKind::EnvironmentEnumeration)
        .count();
    assert_eq!(enumerations, 1);
    assert!(!result.output.contains("hunter2"));
    assert!(!result.output.contains("BUILD_NUMBER"));
}

#[tokio::test]
async fn test_sensitive_read_halts() {
    let coordinator = coordinator(true);
    let result = coordinator
        .execute_securely(ExecutionRequest::javascript(
            "try { console.log(process.env.AWS_SECRET_ACCESS_KEY); } catch (e) { console.log('caught'); }",
        ))
        .await;

    assert!(!result.success);
    assert!(result.output.is_empty());
    assert!(result.report.violations.iter().any(|v| {
        v.kind == ViolationKind::EnvironmentDenied && v.severity == Severity::Critical
    }));
}

#[tokio::test]
async fn test_unknown_variable_reads_as_undefined() {
    let coordinator = coordinator(true);
    let result = coordinator
        .execute_securely(ExecutionRequest::javascript("console.log(process.env.BUILD_NUMBER)"))
        .await;

    assert!(!result.success);
    assert_eq!(result.output, "undefined");
    assert_eq!(result.report.risk_level, RiskLevel::Medium);
}

#[tokio::test]
async fn test_uncaught_exception_is_reported() {
    let coordinator = coordinator(true);
    let result = coordinator
        .execute_securely(ExecutionRequest::javascript(
            "console.log('before');\nthrow new RangeError('out of range');",
        ))
        .await;

    assert!(!result.success);
    assert_eq!(result.output, "before");
    assert!(result.report.safe);
    assert!(result.errors.iter().any(|e| e.contains("RangeError: out of range")));
}

#[tokio::test]
async fn test_lenient_mode_keeps_static_findings() {
    let config = SandboxConfig {
        strict_mode: false,
        ..SandboxConfig::default()
    };
    let coordinator = CoordinatorBuilder::new()
        .with_config(config)
        .with_environment(HashMap::new())
        .build()
        .unwrap();
    let result = coordinator
        .execute_securely(ExecutionRequest::javascript(
            "const o = {}; o.__proto__; console.log('ran');",
        ))
        .await;

    assert!(result.success, "errors: {:?}", result.errors);
    assert_eq!(result.output, "ran");
    assert!(result.report.has_kind(ViolationKind::PatternDetected));
    assert_eq!(result.report.score, 90);
}
