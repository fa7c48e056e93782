/*!
 * Execution Unit
 * Runs one script on a dedicated worker thread and reports how it ended
 */

use super::context::UnitContext;
use super::control::{TerminationReason, UnitControl};
use super::messages::{OutputSink, UnitMessage};
use crate::core::errors::{SandboxError, SandboxResult};
use crate::core::limits::UNIT_STACK_BYTES;
use crate::core::types::ExecutionId;
use crate::script::{parse, Interpreter, RuntimeError};
use crate::security::types::{Severity, Violation, ViolationKind, ViolationSource};
use crate::security::{CapabilityGate, EnvironmentGate};
use serde::{Deserialize, Serialize};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// How a unit's worker thread finished
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "exit", content = "detail", rename_all = "snake_case")]
pub enum UnitExit {
    /// Script ran to the end, timers included
    Completed,
    /// Uncaught exception, syntax error or panic
    Faulted(String),
    /// Stopped through the control block
    Halted(TerminationReason),
}

impl UnitExit {
    #[inline]
    pub fn is_completed(&self) -> bool {
        matches!(self, UnitExit::Completed)
    }

    pub fn halt_reason(&self) -> Option<TerminationReason> {
        match self {
            UnitExit::Halted(reason) => Some(*reason),
            _ => None,
        }
    }
}

/// Gates injected into one unit
pub struct UnitGates {
    pub capabilities: CapabilityGate,
    pub environment: EnvironmentGate,
}

/// Handle to a running unit
///
/// Owned by the coordinator call frame. Dropping it does not stop the
/// thread; halting goes through the shared [`UnitControl`].
pub struct ExecutionUnit {
    id: ExecutionId,
    control: Arc<UnitControl>,
    exit: oneshot::Receiver<UnitExit>,
}

impl ExecutionUnit {
    /// Start `source` on a new worker thread
    ///
    /// Everything the script says outward goes through `outbound`: output
    /// (capped at `max_output_bytes`) and violations raised on the thread.
    pub fn spawn(
        id: ExecutionId,
        source: Arc<str>,
        mut gates: UnitGates,
        control: Arc<UnitControl>,
        max_output_bytes: usize,
        outbound: flume::Sender<UnitMessage>,
    ) -> SandboxResult<Self> {
        gates.capabilities.install();

        let (exit_tx, exit_rx) = oneshot::channel();
        let context = UnitContext {
            execution_id: id.clone(),
            capabilities: gates.capabilities,
            environment: gates.environment,
            control: control.clone(),
            output: OutputSink::new(outbound.clone(), max_output_bytes),
        };

        thread::Builder::new()
            .name(format!("unit-{}", id))
            .stack_size(UNIT_STACK_BYTES)
            .spawn(move || {
                let exit = run_unit(context, &source, &outbound);
                // The coordinator may have given up waiting already
                let _ = exit_tx.send(exit);
            })
            .map_err(|e| SandboxError::UnitSpawn(e.to_string()))?;

        info!(execution_id = %id, "Execution unit spawned");
        Ok(Self {
            id,
            control,
            exit: exit_rx,
        })
    }

    #[inline]
    pub fn id(&self) -> &ExecutionId {
        &self.id
    }

    #[inline]
    pub fn control(&self) -> &Arc<UnitControl> {
        &self.control
    }

    /// Wait for the worker thread to finish
    pub async fn join(self) -> UnitExit {
        match self.exit.await {
            Ok(exit) => exit,
            Err(_) => {
                error!(execution_id = %self.id, "Execution unit vanished without reporting");
                UnitExit::Faulted("execution unit terminated unexpectedly".to_string())
            }
        }
    }
}

fn run_unit(context: UnitContext, source: &str, outbound: &flume::Sender<UnitMessage>) -> UnitExit {
    let id = context.execution_id.clone();
    let control = context.control.clone();

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        let program = match parse(source) {
            Ok(program) => program,
            Err(err) => {
                debug!(execution_id = %id, error = %err, "Script rejected by parser");
                return UnitExit::Faulted(err.to_string());
            }
        };
        let mut interpreter = Interpreter::new(context);
        let result = interpreter.run(&program);
        let exit = match result {
            Ok(()) => UnitExit::Completed,
            Err(RuntimeError::Thrown(value)) => {
                UnitExit::Faulted(interpreter.describe_uncaught(&value))
            }
            Err(RuntimeError::Halted(reason)) => UnitExit::Halted(reason),
            Err(RuntimeError::HeapExhausted(err)) => {
                warn!(execution_id = %id, error = %err, "Heap hard stop reached");
                control.halt(TerminationReason::MemoryExceeded);
                let violation = Violation::new(
                    ViolationKind::MemoryExceeded,
                    Severity::Critical,
                    ViolationSource::ExecutionUnit,
                    format!("Heap allocation refused: {}", err),
                )
                .with_subject("heap");
                let _ = outbound.send(UnitMessage::Violation(violation));
                // A supervisor may have halted first; report whichever reason won
                UnitExit::Halted(
                    control
                        .halt_reason()
                        .unwrap_or(TerminationReason::MemoryExceeded),
                )
            }
        };
        interpreter.teardown();
        exit
    }));

    match outcome {
        Ok(exit) => {
            debug!(execution_id = %id, exit = ?exit, "Execution unit finished");
            exit
        }
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(execution_id = %id, panic = %message, "Execution unit panicked");
            UnitExit::Faulted(format!("Internal error: {}", message))
        }
    }
}
