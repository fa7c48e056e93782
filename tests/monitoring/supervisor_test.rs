/*!
 * Supervisor Integration Tests
 * Timeout and memory supervisors watching a real execution unit
 */

use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use script_sandbox::monitoring::{
    EventBroadcaster, MemorySupervisor, TimeoutHandle, TimeoutRegistry, TimeoutState,
    TimeoutSupervisor,
};
use script_sandbox::process::{
    ExecutionUnit, TerminationReason, UnitControl, UnitExit, UnitGates, UnitMessage,
};
use script_sandbox::script::HeapMeter;
use script_sandbox::security::{
    CapabilityGate, CapabilityPolicy, EnvironmentGate, EnvironmentPolicy, Violation,
    ViolationKind,
};
use script_sandbox::{ExecutionId, ResourceLimits};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

const MIB: u64 = 1024 * 1024;

struct Harness {
    control: Arc<UnitControl>,
    handle: TimeoutHandle,
    timeout: TimeoutSupervisor,
    memory: MemorySupervisor,
    unit: ExecutionUnit,
    messages: flume::Receiver<UnitMessage>,
}

fn launch(id: &str, source: &str, limits: ResourceLimits) -> Harness {
    let id = ExecutionId::from(id);
    let meter = Arc::new(HeapMeter::new(limits.max_heap_bytes, limits.max_buffer_bytes));
    let control = Arc::new(UnitControl::new(meter));
    let events = EventBroadcaster::new(16);

    let mut timeout = TimeoutSupervisor::new(id.clone(), limits, control.clone(), events.clone());
    let mut memory = MemorySupervisor::new(id.clone(), limits, control.clone(), events);
    let handle = timeout.start().unwrap();
    memory.start().unwrap();

    let sink = Arc::new(Mutex::new(Vec::<Violation>::new()));
    let gates = UnitGates {
        capabilities: CapabilityGate::new(
            id.clone(),
            Arc::new(CapabilityPolicy::default()),
            sink.clone(),
        ),
        environment: EnvironmentGate::new(
            id.clone(),
            Arc::new(EnvironmentPolicy::default()),
            &HashMap::new(),
            sink,
        ),
    };
    let (tx, messages) = flume::unbounded();
    let unit =
        ExecutionUnit::spawn(id, Arc::from(source), gates, control.clone(), 4096, tx).unwrap();

    Harness {
        control,
        handle,
        timeout,
        memory,
        unit,
        messages,
    }
}

fn limits(timeout_ms: u64, max_heap: u64) -> ResourceLimits {
    ResourceLimits {
        max_execution_time_ms: timeout_ms,
        max_cpu_time_ms: timeout_ms,
        max_heap_bytes: max_heap,
        max_buffer_bytes: max_heap,
        // Process-wide reading; parallel tests would trip it
        max_rss_bytes: u64::MAX,
        ..ResourceLimits::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_timeout_wins_over_idle_memory_supervisor() {
    let mut harness = launch("spin", "let n = 0; while (true) { n++; }", limits(400, 64 * MIB));

    let started = Instant::now();
    let exit = harness.unit.join().await;
    assert_eq!(exit, UnitExit::Halted(TerminationReason::Timeout));
    assert!(started.elapsed() < Duration::from_secs(2));

    let metrics = harness.timeout.stop().await.unwrap();
    let outcome = harness.memory.stop().await.unwrap();
    assert!(metrics.timed_out);
    assert_eq!(metrics.final_state, TimeoutState::TimedOut);
    assert_eq!(metrics.violations.len(), 1);
    assert!(!outcome.aborted);
    assert!(outcome.violations.is_empty());
    assert_eq!(harness.control.halt_reason(), Some(TerminationReason::Timeout));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_memory_abort_is_not_blamed_on_the_clock() {
    let mut harness = launch(
        "hoard",
        "const keep = []; while (true) { keep.push('x'.repeat(4096)); }",
        limits(10_000, 4 * MIB),
    );

    let exit = harness.unit.join().await;
    assert_eq!(exit.halt_reason(), Some(TerminationReason::MemoryExceeded));

    let metrics = harness.timeout.stop().await.unwrap();
    let outcome = harness.memory.stop().await.unwrap();
    assert!(!metrics.timed_out);
    assert!(metrics.violations.is_empty());
    assert!(outcome.peak_heap > 4 * MIB);

    let from_unit: Vec<Violation> = harness
        .messages
        .try_iter()
        .filter_map(|message| match message {
            UnitMessage::Violation(violation) => Some(violation),
            _ => None,
        })
        .collect();
    assert!(outcome
        .violations
        .iter()
        .chain(&from_unit)
        .any(|v| v.kind == ViolationKind::MemoryExceeded));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_registry_reaches_running_supervisors() {
    let registry = TimeoutRegistry::new();
    let mut harnesses = Vec::new();
    for i in 0..3 {
        let id = format!("reg-{}", i);
        let harness = launch(&id, "while (true) {}", limits(30_000, 64 * MIB));
        registry.register(ExecutionId::from(id), harness.handle.clone());
        harnesses.push(harness);
    }

    assert_eq!(registry.terminate_all(TerminationReason::Shutdown), 3);
    for mut harness in harnesses {
        let exit = harness.unit.join().await;
        assert_eq!(exit, UnitExit::Halted(TerminationReason::Shutdown));
        let metrics = harness.timeout.stop().await.unwrap();
        assert_eq!(metrics.violations[0].subject.as_deref(), Some("shutdown"));
    }
}
