/*!
 * Timeout Supervisor
 * Per-execution wall-clock and CPU-time watchdog with forced termination
 *
 * Each supervisor owns a tokio task holding a deadline timer and a periodic
 * sampler. The task owns its violations and hands them back through its
 * join handle when stopped; nothing is shared with other executions.
 */

use super::events::{EventBroadcaster, SupervisorEvent};
use crate::core::errors::SupervisorError;
use crate::core::types::{ExecutionId, ResourceLimits};
use crate::process::{TerminationReason, UnitControl};
use crate::security::types::{Severity, Violation, ViolationKind, ViolationSource};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Supervisor lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum TimeoutState {
    Idle = 0,
    Running = 1,
    Completed = 2,
    TimedOut = 3,
}

impl TimeoutState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Running,
            2 => Self::Completed,
            3 => Self::TimedOut,
            _ => Self::Idle,
        }
    }
}

/// What a stopped supervisor reports
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutMetrics {
    pub elapsed_ms: u64,
    pub cpu_time_ms: u64,
    pub timed_out: bool,
    pub final_state: TimeoutState,
    pub violations: Vec<Violation>,
}

#[derive(Debug)]
enum TimeoutCommand {
    Stop,
    Terminate(TerminationReason),
}

/// Cloneable way to force a running supervisor's execution to time out
#[derive(Debug, Clone)]
pub struct TimeoutHandle {
    commands: mpsc::UnboundedSender<TimeoutCommand>,
}

impl TimeoutHandle {
    /// Returns false if the supervisor has already stopped
    pub fn terminate(&self, reason: TerminationReason) -> bool {
        self.commands
            .send(TimeoutCommand::Terminate(reason))
            .is_ok()
    }
}

/// Watchdog for one execution
///
/// Dropping a running supervisor aborts its task.
pub struct TimeoutSupervisor {
    execution_id: ExecutionId,
    limits: ResourceLimits,
    control: Arc<UnitControl>,
    events: EventBroadcaster,
    state: Arc<AtomicU8>,
    commands: Option<mpsc::UnboundedSender<TimeoutCommand>>,
    task: Option<JoinHandle<TimeoutMetrics>>,
}

impl TimeoutSupervisor {
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
            state: Arc::new(AtomicU8::new(TimeoutState::Idle as u8)),
            commands: None,
            task: None,
        }
    }

    #[inline]
    pub fn state(&self) -> TimeoutState {
        TimeoutState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Arm the deadline and the sampler
    pub fn start(&mut self) -> Result<TimeoutHandle, SupervisorError> {
        if self.task.is_some() {
            return Err(SupervisorError::AlreadyStarted);
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| SupervisorError::NoRuntime)?;

        let (tx, rx) = mpsc::unbounded_channel();
        self.state.store(TimeoutState::Running as u8, Ordering::Release);

        let watch = Watch {
            execution_id: self.execution_id.clone(),
            limits: self.limits,
            control: self.control.clone(),
            events: self.events.clone(),
            state: self.state.clone(),
            started: Instant::now(),
            violations: Vec::new(),
        };
        self.task = Some(runtime.spawn(watch.run(rx)));
        self.commands = Some(tx.clone());

        debug!(
            execution_id = %self.execution_id,
            max_execution_ms = self.limits.max_execution_time_ms,
            max_cpu_ms = self.limits.max_cpu_time_ms,
            "Timeout supervisor started"
        );
        Ok(TimeoutHandle { commands: tx })
    }

    /// Cancel both timers and collect what the task saw
    pub async fn stop(&mut self) -> Result<TimeoutMetrics, SupervisorError> {
        let task = self.task.take().ok_or(SupervisorError::NotStarted)?;
        if let Some(commands) = self.commands.take() {
            let _ = commands.send(TimeoutCommand::Stop);
        }
        let metrics = task
            .await
            .map_err(|e| SupervisorError::TaskFailed(e.to_string()))?;
        self.state.store(TimeoutState::Idle as u8, Ordering::Release);
        debug!(
            execution_id = %self.execution_id,
            elapsed_ms = metrics.elapsed_ms,
            timed_out = metrics.timed_out,
            "Timeout supervisor stopped"
        );
        Ok(metrics)
    }
}

impl Drop for TimeoutSupervisor {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// State owned by the supervisor task
struct Watch {
    execution_id: ExecutionId,
    limits: ResourceLimits,
    control: Arc<UnitControl>,
    events: EventBroadcaster,
    state: Arc<AtomicU8>,
    started: Instant,
    violations: Vec<Violation>,
}

impl Watch {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<TimeoutCommand>) -> TimeoutMetrics {
        let deadline = time::sleep_until(self.started + self.limits.execution_timeout());
        tokio::pin!(deadline);

        let mut sampler = time::interval(self.limits.timeout_sample_interval());
        sampler.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut armed = true;
        loop {
            tokio::select! {
                _ = &mut deadline, if armed => {
                    self.breach(TerminationReason::Timeout);
                    armed = false;
                }
                _ = sampler.tick(), if armed => {
                    if let Some(reason) = self.sample() {
                        self.breach(reason);
                        armed = false;
                    }
                }
                command = commands.recv() => match command {
                    Some(TimeoutCommand::Terminate(reason)) => {
                        if armed {
                            self.breach(reason);
                            armed = false;
                        }
                    }
                    Some(TimeoutCommand::Stop) | None => break,
                },
            }
        }

        let timed_out = self.state() == TimeoutState::TimedOut;
        if !timed_out {
            self.state.store(TimeoutState::Completed as u8, Ordering::Release);
        }
        TimeoutMetrics {
            elapsed_ms: self.elapsed().as_millis() as u64,
            cpu_time_ms: self.control.cpu_time().as_millis() as u64,
            timed_out,
            final_state: self.state(),
            violations: self.violations,
        }
    }

    fn state(&self) -> TimeoutState {
        TimeoutState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn elapsed(&self) -> Duration {
        Instant::now().saturating_duration_since(self.started)
    }

    /// Which limit, if any, the latest readings breach
    fn sample(&self) -> Option<TerminationReason> {
        if self.elapsed() >= self.limits.execution_timeout() {
            Some(TerminationReason::Timeout)
        } else if self.control.cpu_time() >= self.limits.cpu_timeout() {
            Some(TerminationReason::CpuTimeout)
        } else {
            None
        }
    }

    /// Force-terminate the unit
    ///
    /// A unit already halted for another reason is left alone and no
    /// timeout is recorded for it.
    fn breach(&mut self, reason: TerminationReason) {
        if !self.control.halt(reason) {
            debug!(
                execution_id = %self.execution_id,
                existing = ?self.control.halt_reason(),
                "Unit already halted, timeout not recorded"
            );
            return;
        }

        let elapsed_ms = self.elapsed().as_millis() as u64;
        let cpu_time_ms = self.control.cpu_time().as_millis() as u64;
        let (description, subject) = match reason {
            TerminationReason::CpuTimeout => (
                format!(
                    "CPU time {} ms exceeded limit of {} ms",
                    cpu_time_ms, self.limits.max_cpu_time_ms
                ),
                "cpu_time",
            ),
            TerminationReason::Shutdown => (
                format!("Terminated by coordinator shutdown after {} ms", elapsed_ms),
                "shutdown",
            ),
            _ => (
                format!(
                    "Execution time {} ms exceeded limit of {} ms",
                    elapsed_ms, self.limits.max_execution_time_ms
                ),
                "wall_time",
            ),
        };

        warn!(
            execution_id = %self.execution_id,
            reason = %reason,
            elapsed_ms,
            cpu_time_ms,
            "Execution force-terminated"
        );
        self.state.store(TimeoutState::TimedOut as u8, Ordering::Release);
        self.violations.push(
            Violation::new(
                ViolationKind::Timeout,
                Severity::Critical,
                ViolationSource::TimeoutSupervisor,
                description,
            )
            .with_subject(subject),
        );
        self.events.emit(SupervisorEvent::Terminated {
            execution_id: self.execution_id.clone(),
            reason,
            elapsed_ms,
            cpu_time_ms,
        });
    }
}

/// Live timeout supervisors, keyed by execution
///
/// Holds only command handles; violations stay with each supervisor task.
#[derive(Default)]
pub struct TimeoutRegistry {
    entries: DashMap<ExecutionId, TimeoutHandle, ahash::RandomState>,
}

impl TimeoutRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, execution_id: ExecutionId, handle: TimeoutHandle) {
        self.entries.insert(execution_id, handle);
    }

    pub fn unregister(&self, execution_id: &ExecutionId) {
        self.entries.remove(execution_id);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Force every registered execution to time out; returns how many were signalled
    pub fn terminate_all(&self, reason: TerminationReason) -> usize {
        let signalled = self
            .entries
            .iter()
            .filter(|entry| entry.value().terminate(reason))
            .count();
        info!(signalled, reason = %reason, "Terminating all supervised executions");
        signalled
    }
}
