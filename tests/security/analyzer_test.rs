/*!
 * Static Analyzer Tests
 */

use pretty_assertions::assert_eq;
use proptest::prelude::*;
use script_sandbox::security::{
    CapabilityPolicy, Severity, StaticAnalyzer, ViolationKind, ViolationSource,
};
use std::sync::Arc;

fn analyzer() -> StaticAnalyzer {
    StaticAnalyzer::new(Arc::new(CapabilityPolicy::default()), 64 * 1024)
}

#[test]
fn test_clean_source_has_no_findings() {
    let findings = analyzer().scan("const total = [1, 2, 3].reduce((a, b) => a + b, 0);\nconsole.log(total);");
    assert!(findings.is_empty());
    assert!(!StaticAnalyzer::is_blocking(&findings));
}

#[test]
fn test_import_forms_are_detected() {
    let source = "import fs from 'fs';\nimport 'net';\nconst cp = await import(\"node:child_process\");";
    let findings = analyzer().scan(source);

    let subjects: Vec<_> = findings.iter().filter_map(|f| f.subject.as_deref()).collect();
    assert_eq!(subjects, vec!["fs", "net", "child_process"]);
    assert!(findings.iter().all(|f| f.severity == Severity::Critical));
    assert!(findings.iter().all(|f| f.source == ViolationSource::StaticAnalyzer));
    assert!(findings.iter().all(|f| f.kind == ViolationKind::CapabilityDenied));
}

#[test]
fn test_submodule_of_denied_module() {
    let findings = analyzer().scan("require('fs/promises')");
    assert_eq!(findings.len(), 1);
    assert_eq!(findings[0].severity, Severity::Critical);
}

#[test]
fn test_allowed_module_is_not_flagged() {
    assert!(analyzer().scan("const path = require('path');").is_empty());
}

#[test]
fn test_findings_are_ordered_by_position() {
    let source = "x.__proto__ = null;\neval('2');\nprocess.exit(1);";
    let findings = analyzer().scan(source);
    let lines: Vec<u32> = findings.iter().filter_map(|f| f.line).collect();
    assert_eq!(lines, vec![1, 2, 3]);
    assert_eq!(findings[0].severity, Severity::Medium);
    assert!(StaticAnalyzer::is_blocking(&findings));
}

#[test]
fn test_custom_policy_changes_deny_list() {
    let policy = CapabilityPolicy::empty().deny("left-pad");
    let analyzer = StaticAnalyzer::new(Arc::new(policy), 1024);

    assert!(analyzer.scan("require('fs')").is_empty());
    let findings = analyzer.scan("require('left-pad')");
    assert_eq!(findings[0].subject.as_deref(), Some("left-pad"));
}

#[test]
fn test_oversized_source_is_flagged_not_blocking() {
    let analyzer = StaticAnalyzer::new(Arc::new(CapabilityPolicy::default()), 16);
    let findings = analyzer.scan("console.log('this is longer than sixteen bytes')");
    assert_eq!(findings.len(), 1);
    assert_eq!(findings[0].severity, Severity::Medium);
    assert!(!StaticAnalyzer::is_blocking(&findings));
}

proptest! {
    #[test]
    fn scan_never_panics(source in "\\PC{0,200}") {
        let findings = analyzer().scan(&source);
        prop_assert!(findings.iter().all(|f| f.source == ViolationSource::StaticAnalyzer));
    }

    #[test]
    fn identifiers_alone_are_clean(name in "[a-z][a-z0-9_]{0,12}") {
        prop_assume!(name != "eval");
        let source = format!("let {} = 1;", name);
        prop_assert!(analyzer().scan(&source).is_empty());
    }
}
