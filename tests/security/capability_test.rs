/*!
 * Capability Gate Tests
 */

use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use script_sandbox::security::{
    CapabilityDenied, CapabilityGate, CapabilityPolicy, Severity, Violation, ViolationKind,
};
use script_sandbox::ExecutionId;
use std::sync::Arc;

struct Fixture {
    gate: CapabilityGate,
    sink: Arc<Mutex<Vec<Violation>>>,
}

fn fixture(policy: CapabilityPolicy) -> Fixture {
    let sink = Arc::new(Mutex::new(Vec::new()));
    let mut gate = CapabilityGate::new(ExecutionId::from("cap"), Arc::new(policy), sink.clone());
    assert!(gate.install());
    Fixture { gate, sink }
}

#[test]
fn test_every_default_denied_module_is_critical() {
    let Fixture { gate, sink } = fixture(CapabilityPolicy::default());
    let denied: Vec<String> = CapabilityPolicy::default()
        .denied_modules()
        .map(String::from)
        .collect();

    for name in &denied {
        let err = gate.acquire(name).unwrap_err();
        assert_eq!(err, CapabilityDenied::DenyListed(name.clone()));
    }
    let recorded = sink.lock();
    assert_eq!(recorded.len(), denied.len());
    assert!(recorded.iter().all(|v| v.severity == Severity::Critical));
}

#[test]
fn test_node_prefix_is_normalized() {
    let Fixture { gate, sink } = fixture(CapabilityPolicy::default());
    assert_eq!(
        gate.acquire("node:net").unwrap_err(),
        CapabilityDenied::DenyListed("net".to_string())
    );
    assert_eq!(sink.lock()[0].subject.as_deref(), Some("net"));
}

#[test]
fn test_unlisted_module_is_refused_by_default() {
    let Fixture { gate, sink } = fixture(CapabilityPolicy::default());
    let err = gate.acquire("lodash").unwrap_err();
    assert_eq!(err.severity(), Severity::High);
    assert_eq!(sink.lock()[0].kind, ViolationKind::CapabilityDenied);
}

#[test]
fn test_allowed_module_exposes_configured_subset() {
    let policy = CapabilityPolicy::empty().allow("path", &["join"]);
    let Fixture { gate, sink } = fixture(policy);

    let path = gate.acquire("path").unwrap();
    assert!(gate.check_operation(&path, "join").is_ok());
    let hidden = gate.check_operation(&path, "resolve").unwrap_err();
    assert_eq!(hidden.severity(), Severity::Medium);

    let recorded = sink.lock();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].subject.as_deref(), Some("path.resolve"));
}

#[test]
fn test_deny_wins_over_allow() {
    let policy = CapabilityPolicy::empty().allow("os", &["platform"]).deny("os");
    let Fixture { gate, .. } = fixture(policy);
    assert!(matches!(gate.acquire("os"), Err(CapabilityDenied::DenyListed(_))));
}

#[test]
fn test_gate_refuses_before_install() {
    let sink = Arc::new(Mutex::new(Vec::new()));
    let gate = CapabilityGate::new(
        ExecutionId::from("cold"),
        Arc::new(CapabilityPolicy::default()),
        sink.clone(),
    );
    assert_eq!(gate.acquire("path").unwrap_err(), CapabilityDenied::NotInstalled);
    assert_eq!(sink.lock().len(), 1);
}

#[test]
fn test_policy_round_trips_through_json() {
    let policy = CapabilityPolicy::default();
    let json = serde_json::to_string(&policy).unwrap();
    let restored: CapabilityPolicy = serde_json::from_str(&json).unwrap();
    assert_eq!(restored, policy);

    let partial: CapabilityPolicy = serde_json::from_str(r#"{"denied":["fs"]}"#).unwrap();
    assert!(partial.is_denied("node:fs"));
    assert!(!partial.is_denied("net"));
    // Missing fields fall back to the defaults
    assert!(partial.allowed.contains_key("path"));
}
