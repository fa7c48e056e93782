/*!
 * Environment Gate Tests
 */

use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use script_sandbox::security::{
    EnvironmentDenied, EnvironmentGate, EnvironmentPolicy, Severity, Violation, ViolationKind,
};
use script_sandbox::ExecutionId;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

fn snapshot() -> HashMap<String, String> {
    [
        ("NODE_ENV", "staging"),
        ("LANG", "en_US.UTF-8"),
        ("GITHUB_TOKEN", "ghp_x"),
        ("SHELL", "/bin/zsh"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

fn gate(policy: EnvironmentPolicy) -> (EnvironmentGate, Arc<Mutex<Vec<Violation>>>) {
    let sink = Arc::new(Mutex::new(Vec::new()));
    let gate = EnvironmentGate::new(
        ExecutionId::from("env"),
        Arc::new(policy),
        &snapshot(),
        sink.clone(),
    );
    (gate, sink)
}

#[test]
fn test_allow_listed_reads() {
    let (gate, sink) = gate(EnvironmentPolicy::default());
    assert_eq!(gate.get("NODE_ENV").unwrap().as_deref(), Some("staging"));
    assert_eq!(gate.get("LANG").unwrap().as_deref(), Some("en_US.UTF-8"));
    assert_eq!(gate.get("TZ").unwrap(), None);
    assert!(sink.lock().is_empty());
}

#[test]
fn test_sensitive_marker_match_is_case_insensitive() {
    let (gate, sink) = gate(EnvironmentPolicy::default());
    assert_eq!(
        gate.get("github_token").unwrap_err(),
        EnvironmentDenied::Sensitive("github_token".to_string())
    );
    assert_eq!(sink.lock()[0].severity, Severity::Critical);
}

#[test]
fn test_sensitive_name_stays_denied_even_if_allow_listed() {
    let mut policy = EnvironmentPolicy::default();
    policy.allowed.insert("GITHUB_TOKEN".to_string());
    let (gate, _) = gate(policy);
    assert!(gate.get("GITHUB_TOKEN").is_err());
    assert!(!gate.create_safe_subset().contains_key("GITHUB_TOKEN"));
}

#[test]
fn test_each_enumeration_is_recorded() {
    let (gate, sink) = gate(EnvironmentPolicy::default());
    assert_eq!(gate.enumerate(), vec!["LANG".to_string(), "NODE_ENV".to_string()]);
    gate.enumerate();

    let recorded = sink.lock();
    assert_eq!(recorded.len(), 2);
    assert!(recorded
        .iter()
        .all(|v| v.kind == ViolationKind::EnvironmentEnumeration && v.severity == Severity::High));
}

#[test]
fn test_writes_never_land() {
    let (gate, sink) = gate(EnvironmentPolicy::default());
    assert_eq!(
        gate.set("NODE_ENV", "development").unwrap_err(),
        EnvironmentDenied::ReadOnly("NODE_ENV".to_string())
    );
    assert_eq!(gate.get("NODE_ENV").unwrap().as_deref(), Some("staging"));
    assert_eq!(sink.lock().len(), 1);
}

#[test]
fn test_empty_allow_list_hides_everything() {
    let policy = EnvironmentPolicy {
        allowed: BTreeSet::new(),
        ..EnvironmentPolicy::default()
    };
    let (gate, sink) = gate(policy);
    assert!(gate.create_safe_subset().is_empty());
    assert_eq!(gate.get("NODE_ENV").unwrap(), None);
    assert_eq!(sink.lock()[0].severity, Severity::High);
}

#[test]
fn test_policy_filter_matches_gate_view() {
    let policy = EnvironmentPolicy::default();
    let filtered = policy.filter(&snapshot());
    let (gate, _) = gate(policy);
    assert_eq!(filtered, gate.create_safe_subset());
}
