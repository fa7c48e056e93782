/*!
 * Coordinator Lifecycle
 * Status snapshots, in-flight ids, events and shutdown
 */

use pretty_assertions::assert_eq;
use script_sandbox::{
    CoordinatorBuilder, ExecutionRequest, HealthState, SubsystemHealth, SupervisorEvent,
    TerminationReason,
};
use std::collections::HashMap;
use std::time::{Duration, Instant};

fn builder() -> CoordinatorBuilder {
    CoordinatorBuilder::new().with_environment(HashMap::new())
}

#[tokio::test]
async fn test_status_is_read_only() {
    let coordinator = builder().build().unwrap();
    let first = coordinator.status();
    let second = coordinator.status();

    assert_eq!(first, second);
    assert!(first.initialized);
    assert!(!first.shutting_down);
    assert_eq!(first.active_execution_count, 0);
    assert_eq!(first.units_spawned, 0);
    assert_ne!(first.subsystem_health.static_analyzer, HealthState::Stopped);
}

#[tokio::test]
async fn test_counters_track_outcomes() {
    let coordinator = builder().build().unwrap();
    coordinator
        .execute_securely(ExecutionRequest::javascript("console.log('a')"))
        .await;
    coordinator
        .execute_securely(ExecutionRequest::javascript("eval('1')"))
        .await;

    let status = coordinator.status();
    assert_eq!(status.units_spawned, 1);
    assert_eq!(status.executions_completed, 1);
    assert_eq!(status.static_rejections, 1);
    assert_eq!(status.active_execution_count, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_duplicate_in_flight_id_is_rejected() {
    let coordinator = builder().build().unwrap();
    let running = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            coordinator
                .execute_securely(
                    ExecutionRequest::javascript("while(true){}")
                        .with_id("shared-id")
                        .with_timeout_ms(1500),
                )
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(coordinator.status().active_execution_count, 1);

    let duplicate = coordinator
        .execute_securely(ExecutionRequest::javascript("console.log(1)").with_id("shared-id"))
        .await;
    assert!(!duplicate.success);
    assert!(duplicate.errors[0].contains("already active"));

    let first = running.await.unwrap();
    assert!(first.timed_out);

    // The id is free again once the first execution finished
    let reused = coordinator
        .execute_securely(ExecutionRequest::javascript("console.log(1)").with_id("shared-id"))
        .await;
    assert!(reused.success, "errors: {:?}", reused.errors);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_terminates_in_flight_work() {
    let coordinator = builder().build().unwrap();
    let running = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            coordinator
                .execute_securely(ExecutionRequest::javascript("while(true){}").with_timeout_ms(30_000))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(300)).await;

    let started = Instant::now();
    coordinator.shutdown().await;
    assert!(started.elapsed() < Duration::from_secs(5));

    let result = running.await.unwrap();
    assert!(!result.success);
    assert!(result
        .errors
        .iter()
        .any(|e| e.contains(&TerminationReason::Shutdown.to_string())));

    let status = coordinator.status();
    assert!(status.shutting_down);
    assert_eq!(status.active_execution_count, 0);
    assert_eq!(status.subsystem_health, SubsystemHealth::all(HealthState::Stopped));

    let refused = coordinator
        .execute_securely(ExecutionRequest::javascript("console.log(1)"))
        .await;
    assert!(!refused.success);
    assert!(refused.errors[0].contains("shutting down"));
}

#[tokio::test]
async fn test_shutdown_without_work_returns_immediately() {
    let coordinator = builder().build().unwrap();
    let started = Instant::now();
    coordinator.shutdown().await;
    coordinator.shutdown().await;
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn test_subscribers_see_terminations() {
    let coordinator = builder().build().unwrap();
    let mut events = coordinator.subscribe();

    let result = coordinator
        .execute_securely(
            ExecutionRequest::javascript("for(;;){}")
                .with_id("watched")
                .with_timeout_ms(500),
        )
        .await;
    assert!(result.timed_out);

    let event = events.try_recv().expect("termination event");
    match event {
        SupervisorEvent::Terminated {
            execution_id,
            reason,
            elapsed_ms,
            ..
        } => {
            assert_eq!(execution_id.as_str(), "watched");
            assert_eq!(reason, TerminationReason::Timeout);
            assert!(elapsed_ms >= 500);
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test]
async fn test_clean_run_emits_no_events() {
    let coordinator = builder().build().unwrap();
    let mut events = coordinator.subscribe();
    coordinator
        .execute_securely(ExecutionRequest::javascript("let total = 0; for (let i = 0; i < 10; i++) total += i;"))
        .await;
    assert!(events.try_recv().is_err());
}
