/*!
 * Supervisor Event Tests
 */

use pretty_assertions::assert_eq;
use script_sandbox::monitoring::EventBroadcaster;
use script_sandbox::{
    CoordinatorBuilder, ExecutionId, ExecutionRequest, Severity, SupervisorEvent,
    TerminationReason, ViolationKind,
};
use serde_json::json;
use std::collections::HashMap;
use tokio::sync::broadcast::error::TryRecvError;

#[test]
fn test_event_wire_shape() {
    let event = SupervisorEvent::Terminated {
        execution_id: ExecutionId::from("wire"),
        reason: TerminationReason::CpuTimeout,
        elapsed_ms: 120,
        cpu_time_ms: 100,
    };
    assert_eq!(
        serde_json::to_value(&event).unwrap(),
        json!({
            "event": "terminated",
            "execution_id": "wire",
            "reason": "cpu_timeout",
            "elapsed_ms": 120,
            "cpu_time_ms": 100
        })
    );
}

#[test]
fn test_every_subscriber_gets_a_copy() {
    let events = EventBroadcaster::new(4);
    let mut first = events.subscribe();
    let mut second = events.subscribe();
    assert_eq!(events.subscriber_count(), 2);

    events.emit(SupervisorEvent::MemoryBreach {
        execution_id: ExecutionId::from("fan"),
        kind: ViolationKind::MemoryExceeded,
        severity: Severity::Critical,
        observed_bytes: 10,
        limit_bytes: 5,
    });
    assert_eq!(first.try_recv().unwrap().execution_id().as_str(), "fan");
    assert_eq!(second.try_recv().unwrap().execution_id().as_str(), "fan");
}

#[test]
fn test_slow_subscriber_lags_instead_of_blocking() {
    let events = EventBroadcaster::new(1);
    let mut slow = events.subscribe();
    for i in 0..3 {
        events.emit(SupervisorEvent::Terminated {
            execution_id: ExecutionId::from(format!("lag-{}", i)),
            reason: TerminationReason::Timeout,
            elapsed_ms: i,
            cpu_time_ms: i,
        });
    }
    assert!(matches!(slow.try_recv(), Err(TryRecvError::Lagged(_))));
    assert_eq!(slow.try_recv().unwrap().execution_id().as_str(), "lag-2");
}

#[tokio::test]
async fn test_memory_breach_reaches_coordinator_subscribers() {
    let coordinator = CoordinatorBuilder::new()
        .with_environment(HashMap::new())
        .with_event_capacity(64)
        .build()
        .unwrap();
    let mut events = coordinator.subscribe();

    let result = coordinator
        .execute_securely(
            ExecutionRequest::javascript("const a = []; while (true) { a.push([1, 2, 3, 4]); }")
                .with_id("breach")
                .with_memory_limit_bytes(8 * 1024 * 1024),
        )
        .await;
    assert!(!result.success);

    let mut breaches = Vec::new();
    while let Ok(event) = events.try_recv() {
        assert_eq!(event.execution_id().as_str(), "breach");
        if let SupervisorEvent::MemoryBreach {
            kind,
            observed_bytes,
            limit_bytes,
            ..
        } = event
        {
            breaches.push((kind, observed_bytes, limit_bytes));
        }
    }
    let (kind, observed, limit) = breaches
        .into_iter()
        .find(|(kind, _, _)| *kind == ViolationKind::MemoryExceeded)
        .expect("memory breach event");
    assert_eq!(kind, ViolationKind::MemoryExceeded);
    assert!(observed > limit);
}
