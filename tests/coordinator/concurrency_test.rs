/*!
 * Concurrent Executions
 * Isolation of outputs, violations and reports across parallel units
 */

use futures::future::join_all;
use script_sandbox::{CoordinatorBuilder, ExecutionRequest, ViolationKind};
use std::collections::HashMap;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_executions_stay_isolated() {
    let coordinator = CoordinatorBuilder::new()
        .with_strict_mode(false)
        .with_environment(HashMap::from([("NODE_ENV".to_string(), "ci".to_string())]))
        .build()
        .unwrap();

    let requests = (0..8).map(|i| {
        let source = if i % 2 == 0 {
            format!("console.log('clean-{}')", i)
        } else {
            format!("console.log('noisy-{}'); Object.keys(process.env);", i)
        };
        let coordinator = coordinator.clone();
        async move {
            let request = ExecutionRequest::javascript(source).with_id(format!("run-{}", i));
            (i, coordinator.execute_securely(request).await)
        }
    });

    for (i, result) in join_all(requests).await {
        assert_eq!(result.execution_id.as_str(), format!("run-{}", i));
        assert_eq!(result.report.execution_id, result.execution_id);
        if i % 2 == 0 {
            assert_eq!(result.output, format!("clean-{}", i));
            assert!(result.success, "errors: {:?}", result.errors);
            assert!(result.report.violations.is_empty());
        } else {
            assert_eq!(result.output, format!("noisy-{}", i));
            assert!(!result.success);
            assert_eq!(result.report.violations.len(), 1);
            assert!(result.report.has_kind(ViolationKind::EnvironmentEnumeration));
        }
    }

    let status = coordinator.status();
    assert_eq!(status.units_spawned, 8);
    assert_eq!(status.executions_completed, 8);
    assert_eq!(status.active_execution_count, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_runaway_unit_does_not_stall_neighbours() {
    let coordinator = CoordinatorBuilder::new()
        .with_environment(HashMap::new())
        .build()
        .unwrap();

    let runaway = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            coordinator
                .execute_securely(ExecutionRequest::javascript("while(true){}").with_timeout_ms(2000))
                .await
        })
    };

    let quick = coordinator
        .execute_securely(ExecutionRequest::javascript("console.log([1, 2, 3].map(x => x * 2).join(','))"))
        .await;
    assert!(quick.success, "errors: {:?}", quick.errors);
    assert_eq!(quick.output, "2,4,6");
    assert!(!quick.timed_out);

    let runaway = runaway.await.unwrap();
    assert!(runaway.timed_out);
    assert!(!quick.report.has_kind(ViolationKind::Timeout));
}
