/*!
 * Memory Supervisor
 * Per-execution heap, resident-set and buffer sampling with ceiling checks
 *
 * Samples on a fixed period and whenever the unit's heap meter crosses its
 * soft limit. Each rule fires at most once per execution. A critical breach
 * asks the unit to reclaim and then halts it.
 */

use super::anomaly::GrowthDetector;
use super::events::{EventBroadcaster, SupervisorEvent};
use super::probe::resident_set_bytes;
use crate::core::errors::SupervisorError;
use crate::core::limits::MEMORY_SAMPLE_HISTORY;
use crate::core::types::{ExecutionId, ResourceLimits};
use crate::process::{TerminationReason, UnitControl};
use crate::security::types::{Severity, Violation, ViolationKind, ViolationSource};
use ringbuf::{traits::*, HeapRb};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, warn};

/// One memory reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemorySample {
    /// Offset from supervisor start
    pub at_ms: u64,
    pub heap_used: u64,
    /// High-water mark of the heap
    pub heap_total: u64,
    pub rss: u64,
    pub external: u64,
}

/// What a stopped memory supervisor reports
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryOutcome {
    pub samples: usize,
    pub peak_heap: u64,
    pub peak_rss: u64,
    pub peak_external: u64,
    pub violations: Vec<Violation>,
    /// A critical breach halted the unit
    pub aborted: bool,
    /// Most recent samples, oldest first
    pub history: Vec<MemorySample>,
}

/// Memory watchdog for one execution
///
/// Dropping a running supervisor aborts its task.
pub struct MemorySupervisor {
    execution_id: ExecutionId,
    limits: ResourceLimits,
    control: Arc<UnitControl>,
    events: EventBroadcaster,
    latest_safe: Arc<AtomicBool>,
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<MemoryOutcome>>,
}

impl MemorySupervisor {
    pub fn new(
        execution_id: ExecutionId,
        limits: ResourceLimits,
        control: Arc<UnitControl>,
        events: EventBroadcaster,
    ) -> Self {
        Self {
            execution_id,
            limits,
            control,
            events,
            latest_safe: Arc::new(AtomicBool::new(true)),
            stop: None,
            task: None,
        }
    }

    pub fn start(&mut self) -> Result<(), SupervisorError> {
        if self.task.is_some() {
            return Err(SupervisorError::AlreadyStarted);
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| SupervisorError::NoRuntime)?;

        let (stop_tx, stop_rx) = oneshot::channel();
        let sampler = Sampler {
            execution_id: self.execution_id.clone(),
            limits: self.limits,
            control: self.control.clone(),
            events: self.events.clone(),
            latest_safe: self.latest_safe.clone(),
            started: Instant::now(),
            history: HeapRb::new(MEMORY_SAMPLE_HISTORY),
            growth: GrowthDetector::new(
                self.limits.growth_threshold_bytes,
                self.limits.growth_window(),
            ),
            latched: Latches::default(),
            samples: 0,
            peak_rss: 0,
            violations: Vec::new(),
            aborted: false,
        };
        self.task = Some(runtime.spawn(sampler.run(stop_rx)));
        self.stop = Some(stop_tx);

        debug!(
            execution_id = %self.execution_id,
            interval_ms = self.limits.sample_interval_ms,
            max_heap = self.limits.max_heap_bytes,
            "Memory supervisor started"
        );
        Ok(())
    }

    /// Whether the latest sample was within every ceiling
    #[inline]
    pub fn is_safe(&self) -> bool {
        self.latest_safe.load(Ordering::Acquire)
    }

    /// Take a final sample and collect the outcome
    pub async fn stop(&mut self) -> Result<MemoryOutcome, SupervisorError> {
        let task = self.task.take().ok_or(SupervisorError::NotStarted)?;
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        let outcome = task
            .await
            .map_err(|e| SupervisorError::TaskFailed(e.to_string()))?;
        debug!(
            execution_id = %self.execution_id,
            samples = outcome.samples,
            peak_heap = outcome.peak_heap,
            aborted = outcome.aborted,
            "Memory supervisor stopped"
        );
        Ok(outcome)
    }
}

impl Drop for MemorySupervisor {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[derive(Default)]
struct Latches {
    heap: bool,
    rss: bool,
    external: bool,
    growth: bool,
}

/// State owned by the sampling task
struct Sampler {
    execution_id: ExecutionId,
    limits: ResourceLimits,
    control: Arc<UnitControl>,
    events: EventBroadcaster,
    latest_safe: Arc<AtomicBool>,
    started: Instant,
    history: HeapRb<MemorySample>,
    growth: GrowthDetector,
    latched: Latches,
    samples: usize,
    peak_rss: u64,
    violations: Vec<Violation>,
    aborted: bool,
}

impl Sampler {
    async fn run(mut self, mut stop: oneshot::Receiver<()>) -> MemoryOutcome {
        let meter = self.control.heap().clone();
        let mut ticker = time::interval(self.limits.memory_sample_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = &mut stop => break,
                _ = ticker.tick() => self.sample(),
                _ = meter.crossed() => {
                    debug!(execution_id = %self.execution_id, "Heap meter crossed its ceiling");
                    self.sample();
                }
            }
        }
        self.sample();

        let snapshot = meter.snapshot();
        MemoryOutcome {
            samples: self.samples,
            peak_heap: snapshot.peak,
            peak_rss: self.peak_rss,
            peak_external: snapshot.peak_external,
            violations: self.violations,
            aborted: self.aborted,
            history: self.history.iter().copied().collect(),
        }
    }

    fn sample(&mut self) {
        let at = Instant::now().saturating_duration_since(self.started);
        let snapshot = self.control.heap().snapshot();
        let sample = MemorySample {
            at_ms: at.as_millis() as u64,
            heap_used: snapshot.used,
            heap_total: snapshot.peak,
            rss: resident_set_bytes(),
            external: snapshot.external,
        };
        self.samples += 1;
        self.peak_rss = self.peak_rss.max(sample.rss);
        self.history.push_overwrite(sample);

        let l = self.limits;
        // The high-water marks catch spikes that were freed between samples
        let heap = snapshot.used.max(snapshot.peak);
        let external = snapshot.external.max(snapshot.peak_external);
        self.latest_safe.store(
            sample.heap_used <= l.max_heap_bytes
                && sample.rss <= l.max_rss_bytes
                && sample.external <= l.max_buffer_bytes,
            Ordering::Release,
        );

        if heap > l.max_heap_bytes && !self.latched.heap {
            self.latched.heap = true;
            self.breach(
                ViolationKind::MemoryExceeded,
                Severity::Critical,
                "heap",
                heap,
                l.max_heap_bytes,
            );
        }
        if sample.rss > l.max_rss_bytes && !self.latched.rss {
            self.latched.rss = true;
            self.breach(
                ViolationKind::MemoryExceeded,
                Severity::Critical,
                "rss",
                sample.rss,
                l.max_rss_bytes,
            );
        }
        if external > l.max_buffer_bytes && !self.latched.external {
            self.latched.external = true;
            self.breach(
                ViolationKind::MemoryExceeded,
                Severity::High,
                "external",
                external,
                l.max_buffer_bytes,
            );
        }
        if !self.latched.growth {
            if let Some(anomaly) = self.growth.observe(at, sample.heap_used) {
                self.latched.growth = true;
                warn!(
                    execution_id = %self.execution_id,
                    grown_bytes = anomaly.grown_bytes,
                    over_ms = anomaly.over.as_millis() as u64,
                    "Heap growth anomaly"
                );
                self.violations.push(
                    Violation::new(
                        ViolationKind::GrowthAnomaly,
                        Severity::High,
                        ViolationSource::MemorySupervisor,
                        format!(
                            "Heap grew by {} bytes in {} ms (threshold {} bytes in {} ms)",
                            anomaly.grown_bytes,
                            anomaly.over.as_millis(),
                            l.growth_threshold_bytes,
                            l.growth_window_ms
                        ),
                    )
                    .with_subject("heap"),
                );
                self.events.emit(SupervisorEvent::MemoryBreach {
                    execution_id: self.execution_id.clone(),
                    kind: ViolationKind::GrowthAnomaly,
                    severity: Severity::High,
                    observed_bytes: anomaly.grown_bytes,
                    limit_bytes: l.growth_threshold_bytes,
                });
            }
        }
    }

    fn breach(
        &mut self,
        kind: ViolationKind,
        severity: Severity,
        subject: &str,
        observed: u64,
        limit: u64,
    ) {
        warn!(
            execution_id = %self.execution_id,
            subject,
            observed,
            limit,
            severity = %severity,
            "Memory ceiling exceeded"
        );
        self.violations.push(
            Violation::new(
                kind,
                severity,
                ViolationSource::MemorySupervisor,
                format!("{} usage {} bytes exceeded limit of {} bytes", subject, observed, limit),
            )
            .with_subject(subject),
        );
        self.events.emit(SupervisorEvent::MemoryBreach {
            execution_id: self.execution_id.clone(),
            kind,
            severity,
            observed_bytes: observed,
            limit_bytes: limit,
        });

        if severity == Severity::Critical {
            self.control.request_reclaim();
            if self.control.halt(TerminationReason::MemoryExceeded) {
                self.aborted = true;
            }
        }
    }
}
