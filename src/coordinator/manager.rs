/*!
 * Coordinator
 * Runs one execution end to end: analyze, spawn, supervise, report
 */

use super::reservation::ActiveExecutions;
use super::status::{CoordinatorStatus, HealthState, SubsystemHealth};
use crate::core::config::SandboxConfig;
use crate::core::errors::SandboxError;
use crate::core::limits::SHUTDOWN_DRAIN_TIMEOUT_MS;
use crate::core::types::{ExecutionId, ExecutionRequest, Language, ResourceLimits};
use crate::monitoring::{
    resident_set_bytes, EventBroadcaster, MemoryOutcome, MemorySupervisor, SupervisorEvent,
    TimeoutMetrics, TimeoutRegistry, TimeoutState, TimeoutSupervisor,
};
use crate::process::{
    ChannelSink, ExecutionUnit, TerminationReason, UnitControl, UnitExit, UnitGates, UnitMessage,
};
use crate::script::HeapMeter;
use crate::security::{
    CapabilityGate, CapabilityPolicy, EnvironmentGate, EnvironmentPolicy, ExecutionResult,
    MemoryUsage, ReportBuilder, StaticAnalyzer, Violation,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument, warn};

/// Execution coordinator
///
/// Cheap to clone; clones share the same in-flight set, registry and
/// counters.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

struct Inner {
    config: SandboxConfig,
    analyzer: StaticAnalyzer,
    capabilities: Arc<CapabilityPolicy>,
    environment: Arc<EnvironmentPolicy>,
    /// Allow-listed subset of the injected snapshot
    visible_env: HashMap<String, String>,
    active: ActiveExecutions,
    registry: TimeoutRegistry,
    events: EventBroadcaster,
    shutting_down: AtomicBool,
    units_spawned: AtomicU64,
    static_rejections: AtomicU64,
    executions_completed: AtomicU64,
}

/// Everything drained from one finished unit
struct Collected {
    stdout: Vec<String>,
    stderr: Vec<String>,
    violations: Vec<Violation>,
}

impl Coordinator {
    /// Coordinator with `config` over the process environment
    pub fn new(config: SandboxConfig) -> crate::core::errors::SandboxResult<Self> {
        super::builder::CoordinatorBuilder::new()
            .with_config(config)
            .build()
    }

    pub(super) fn from_parts(
        config: SandboxConfig,
        environment: HashMap<String, String>,
        event_capacity: usize,
    ) -> Self {
        let capabilities = Arc::new(config.capabilities.clone());
        let env_policy = Arc::new(config.environment.clone());
        let visible_env = env_policy.filter(&environment);
        let analyzer = StaticAnalyzer::new(capabilities.clone(), config.max_source_bytes);

        info!(
            strict_mode = config.strict_mode,
            max_execution_ms = config.limits.max_execution_time_ms,
            max_heap_bytes = config.limits.max_heap_bytes,
            visible_env = visible_env.len(),
            "Coordinator initialized"
        );

        Self {
            inner: Arc::new(Inner {
                analyzer,
                capabilities,
                environment: env_policy,
                visible_env,
                active: ActiveExecutions::default(),
                registry: TimeoutRegistry::new(),
                events: EventBroadcaster::new(event_capacity),
                shutting_down: AtomicBool::new(false),
                units_spawned: AtomicU64::new(0),
                static_rejections: AtomicU64::new(0),
                executions_completed: AtomicU64::new(0),
                config,
            }),
        }
    }

    #[inline]
    pub fn config(&self) -> &SandboxConfig {
        &self.inner.config
    }

    /// Termination and memory-breach events
    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.inner.events.subscribe()
    }

    /// Run one request; never fails outward
    #[instrument(
        name = "execution",
        skip_all,
        fields(execution_id = %request.id(), language = request.language_tag())
    )]
    pub async fn execute_securely(&self, request: ExecutionRequest) -> ExecutionResult {
        let id = request.id().clone();

        if self.is_shutting_down() {
            return ExecutionResult::rejected(id, SandboxError::ShuttingDown.to_string());
        }
        if let Err(err) = Language::from_tag(request.language_tag()) {
            warn!(error = %err, "Rejected request");
            return ExecutionResult::rejected(id, err.to_string());
        }

        let inner = &self.inner;
        let findings = inner.analyzer.scan(request.source_code());
        if inner.config.strict_mode && StaticAnalyzer::is_blocking(&findings) {
            return self.reject_statically(id, findings);
        }

        let _reservation = match inner.active.reserve(&id) {
            Ok(reservation) => reservation,
            Err(err) => {
                warn!(error = %err, "Rejected request");
                return ExecutionResult::rejected(id, err.to_string());
            }
        };

        let limits = inner.config.limits.resolve(&request, &inner.config.ceilings);
        debug!(limits = ?limits, findings = findings.len(), "Resolved limits");
        let result = self.supervise(&request, limits, findings).await;
        inner.registry.unregister(&id);
        result
    }

    fn reject_statically(&self, id: ExecutionId, findings: Vec<Violation>) -> ExecutionResult {
        self.inner.static_rejections.fetch_add(1, Ordering::Relaxed);
        let reason = findings
            .iter()
            .filter(|v| v.severity.is_severe())
            .max_by_key(|v| v.severity)
            .map(|v| v.description.clone())
            .unwrap_or_default();
        warn!(findings = findings.len(), reason = %reason, "Rejected by static analysis");

        let report = ReportBuilder::new(id.clone())
            .violations(findings)
            .static_rejection()
            .build();
        ExecutionResult {
            execution_id: id,
            success: false,
            output: String::new(),
            errors: vec![format!("Static analysis rejected the submission: {}", reason)],
            timed_out: false,
            report,
        }
    }

    /// Spawn the unit under both supervisors and assemble the result
    async fn supervise(
        &self,
        request: &ExecutionRequest,
        limits: ResourceLimits,
        findings: Vec<Violation>,
    ) -> ExecutionResult {
        let inner = &self.inner;
        let id = request.id().clone();
        let started = Instant::now();

        let meter = Arc::new(HeapMeter::new(limits.max_heap_bytes, limits.max_buffer_bytes));
        let control = Arc::new(UnitControl::new(meter));

        let mut timeout = TimeoutSupervisor::new(
            id.clone(),
            limits,
            control.clone(),
            inner.events.clone(),
        );
        let mut memory = MemorySupervisor::new(
            id.clone(),
            limits,
            control.clone(),
            inner.events.clone(),
        );

        let handle = match timeout.start() {
            Ok(handle) => handle,
            Err(err) => {
                error!(error = %err, "Timeout supervisor failed to start");
                return ExecutionResult::rejected(id, SandboxError::from(err).to_string());
            }
        };
        inner.registry.register(id.clone(), handle.clone());
        // A shutdown that began before registration would have missed us
        if self.is_shutting_down() {
            handle.terminate(TerminationReason::Shutdown);
        }
        if let Err(err) = memory.start() {
            error!(error = %err, "Memory supervisor failed to start");
            return ExecutionResult::rejected(id, SandboxError::from(err).to_string());
        }

        let (tx, rx) = flume::unbounded();
        let sink = Arc::new(ChannelSink::new(tx.clone()));
        let gates = UnitGates {
            capabilities: CapabilityGate::new(id.clone(), inner.capabilities.clone(), sink.clone()),
            environment: EnvironmentGate::new(
                id.clone(),
                inner.environment.clone(),
                &inner.visible_env,
                sink,
            ),
        };

        let unit = match ExecutionUnit::spawn(
            id.clone(),
            request.source_code().clone(),
            gates,
            control.clone(),
            inner.config.max_output_bytes,
            tx,
        ) {
            Ok(unit) => unit,
            Err(err) => {
                error!(error = %err, "Execution unit failed to start");
                return ExecutionResult::rejected(id, err.to_string());
            }
        };
        inner.units_spawned.fetch_add(1, Ordering::Relaxed);

        let exit = unit.join().await;
        let execution_time_ms = started.elapsed().as_millis() as u64;

        let mut errors = Vec::new();
        let timing = match timeout.stop().await {
            Ok(metrics) => metrics,
            Err(err) => {
                error!(error = %err, "Timeout supervisor failed");
                errors.push(err.to_string());
                TimeoutMetrics {
                    elapsed_ms: execution_time_ms,
                    cpu_time_ms: control.cpu_time().as_millis() as u64,
                    timed_out: false,
                    final_state: TimeoutState::Idle,
                    violations: Vec::new(),
                }
            }
        };
        let sampled = match memory.stop().await {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(error = %err, "Memory supervisor failed");
                errors.push(err.to_string());
                let snapshot = control.heap().snapshot();
                MemoryOutcome {
                    samples: 0,
                    peak_heap: snapshot.peak,
                    peak_rss: 0,
                    peak_external: snapshot.peak_external,
                    violations: Vec::new(),
                    aborted: false,
                    history: Vec::new(),
                }
            }
        };
        inner.executions_completed.fetch_add(1, Ordering::Relaxed);

        let collected = drain(&rx);
        let mut result_errors = collected.stderr;
        match &exit {
            UnitExit::Completed => {}
            UnitExit::Faulted(message) => result_errors.push(message.clone()),
            UnitExit::Halted(reason) => {
                result_errors.push(format!("Execution terminated: {}", reason))
            }
        }
        result_errors.extend(errors);

        let mut violations = findings;
        violations.extend(collected.violations);
        violations.extend(timing.violations);
        violations.extend(sampled.violations);

        let report = ReportBuilder::new(id.clone())
            .violations(violations)
            .timing(
                execution_time_ms,
                control.cpu_time().as_millis() as u64,
                timing.timed_out,
            )
            .memory(MemoryUsage {
                peak_heap_bytes: sampled.peak_heap,
                peak_rss_bytes: sampled.peak_rss,
                peak_buffer_bytes: sampled.peak_external,
                samples: sampled.samples,
                safe: !sampled.aborted,
            })
            .build();

        let success = exit.is_completed() && report.safe;
        info!(
            success,
            exit = ?exit,
            risk_level = %report.risk_level,
            score = report.score,
            execution_time_ms,
            "Execution finished"
        );

        ExecutionResult {
            execution_id: id,
            success,
            output: collected.stdout.join("\n"),
            errors: result_errors,
            timed_out: timing.timed_out,
            report,
        }
    }

    #[inline]
    fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::Acquire)
    }

    /// Read-only diagnostic snapshot
    pub fn status(&self) -> CoordinatorStatus {
        let inner = &self.inner;
        let shutting_down = self.is_shutting_down();
        let subsystem_health = if shutting_down {
            SubsystemHealth::all(HealthState::Stopped)
        } else {
            let mut health = SubsystemHealth::all(HealthState::Healthy);
            if resident_set_bytes() == 0 {
                health.memory_supervisor = HealthState::Degraded;
            }
            health
        };

        CoordinatorStatus {
            initialized: true,
            shutting_down,
            active_execution_count: inner.active.len(),
            units_spawned: inner.units_spawned.load(Ordering::Relaxed),
            static_rejections: inner.static_rejections.load(Ordering::Relaxed),
            executions_completed: inner.executions_completed.load(Ordering::Relaxed),
            subsystem_health,
        }
    }

    /// Stop accepting work, terminate in-flight executions and wait for them
    ///
    /// Idempotent; later calls only wait for the drain.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if !inner.shutting_down.swap(true, Ordering::AcqRel) {
            let signalled = inner.registry.terminate_all(TerminationReason::Shutdown);
            info!(in_flight = inner.active.len(), signalled, "Coordinator shutting down");
        }

        let drain_timeout = Duration::from_millis(SHUTDOWN_DRAIN_TIMEOUT_MS);
        if tokio::time::timeout(drain_timeout, inner.active.wait_drained())
            .await
            .is_err()
        {
            warn!(
                remaining = inner.active.len(),
                "Shutdown drain timed out with executions still in flight"
            );
        }
    }
}

fn drain(rx: &flume::Receiver<UnitMessage>) -> Collected {
    let mut collected = Collected {
        stdout: Vec::new(),
        stderr: Vec::new(),
        violations: Vec::new(),
    };
    for message in rx.try_iter() {
        match message {
            UnitMessage::Stdout(line) => collected.stdout.push(line),
            UnitMessage::Stderr(line) => collected.stderr.push(line),
            UnitMessage::Violation(violation) => collected.violations.push(violation),
        }
    }
    collected
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::types::ViolationKind;

    fn coordinator() -> Coordinator {
        super::super::CoordinatorBuilder::new()
            .with_environment(HashMap::from([("NODE_ENV".to_string(), "test".to_string())]))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_simple_execution() {
        let coordinator = coordinator();
        let result = coordinator
            .execute_securely(ExecutionRequest::javascript("console.log(2 + 2)"))
            .await;
        assert!(result.success, "errors: {:?}", result.errors);
        assert_eq!(result.output, "4");
        assert_eq!(result.report.score, 100);
        assert_eq!(coordinator.status().units_spawned, 1);
    }

    #[tokio::test]
    async fn test_unsupported_language() {
        let result = coordinator()
            .execute_securely(ExecutionRequest::new("print(1)", "python"))
            .await;
        assert!(!result.success);
        assert!(result.errors[0].contains("Unsupported language"));
    }

    #[tokio::test]
    async fn test_static_rejection_skips_spawn() {
        let coordinator = coordinator();
        let result = coordinator
            .execute_securely(ExecutionRequest::javascript("require('child_process')"))
            .await;
        assert!(!result.success);
        assert!(result.report.static_rejection);
        assert!(result.report.has_kind(ViolationKind::CapabilityDenied));
        let status = coordinator.status();
        assert_eq!(status.units_spawned, 0);
        assert_eq!(status.static_rejections, 1);
    }

    #[tokio::test]
    async fn test_environment_reads_allow_listed_value() {
        let result = coordinator()
            .execute_securely(ExecutionRequest::javascript("console.log(process.env.NODE_ENV)"))
            .await;
        assert!(result.success, "errors: {:?}", result.errors);
        assert_eq!(result.output, "test");
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_work() {
        let coordinator = coordinator();
        coordinator.shutdown().await;
        coordinator.shutdown().await;
        let result = coordinator
            .execute_securely(ExecutionRequest::javascript("1"))
            .await;
        assert!(!result.success);
        assert!(coordinator.status().shutting_down);
        assert_eq!(
            coordinator.status().subsystem_health,
            SubsystemHealth::all(HealthState::Stopped)
        );
    }
}
