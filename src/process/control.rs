/*!
 * Unit Control Block
 * State shared between an execution unit and the supervisors watching it
 */

use crate::script::heap::HeapMeter;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Why a unit was stopped before finishing on its own
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum TerminationReason {
    Timeout = 1,
    CpuTimeout = 2,
    MemoryExceeded = 3,
    PolicyViolation = 4,
    Shutdown = 5,
}

impl TerminationReason {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Timeout),
            2 => Some(Self::CpuTimeout),
            3 => Some(Self::MemoryExceeded),
            4 => Some(Self::PolicyViolation),
            5 => Some(Self::Shutdown),
            _ => None,
        }
    }

    /// Whether the timeout supervisor is the one that fired
    #[inline]
    pub fn is_timeout(self) -> bool {
        matches!(self, Self::Timeout | Self::CpuTimeout | Self::Shutdown)
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "wall-clock timeout"),
            Self::CpuTimeout => write!(f, "cpu-time timeout"),
            Self::MemoryExceeded => write!(f, "memory ceiling exceeded"),
            Self::PolicyViolation => write!(f, "critical policy violation"),
            Self::Shutdown => write!(f, "coordinator shutdown"),
        }
    }
}

const RUNNING: u8 = 0;

/// Control block for one execution unit
///
/// The halt flag is written once: the first reason to arrive wins and later
/// halts are ignored. The unit polls it on every interpreter step.
#[derive(Debug)]
pub struct UnitControl {
    halt: AtomicU8,
    cpu_micros: AtomicU64,
    reclaim_requested: AtomicBool,
    heap: Arc<HeapMeter>,
}

impl UnitControl {
    pub fn new(heap: Arc<HeapMeter>) -> Self {
        Self {
            halt: AtomicU8::new(RUNNING),
            cpu_micros: AtomicU64::new(0),
            reclaim_requested: AtomicBool::new(false),
            heap,
        }
    }

    /// Request termination; returns false if the unit was already halted
    pub fn halt(&self, reason: TerminationReason) -> bool {
        self.halt
            .compare_exchange(RUNNING, reason as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    #[inline]
    pub fn halt_reason(&self) -> Option<TerminationReason> {
        TerminationReason::from_u8(self.halt.load(Ordering::Acquire))
    }

    #[inline]
    pub fn is_halted(&self) -> bool {
        self.halt.load(Ordering::Acquire) != RUNNING
    }

    /// Called by the unit with its thread CPU clock
    #[inline]
    pub fn publish_cpu_time(&self, cpu: Duration) {
        self.cpu_micros
            .store(cpu.as_micros().min(u64::MAX as u128) as u64, Ordering::Release);
    }

    #[inline]
    pub fn cpu_time(&self) -> Duration {
        Duration::from_micros(self.cpu_micros.load(Ordering::Acquire))
    }

    #[inline]
    pub fn heap(&self) -> &Arc<HeapMeter> {
        &self.heap
    }

    /// Ask the unit to compact its allocator bookkeeping at the next step
    pub fn request_reclaim(&self) {
        self.reclaim_requested.store(true, Ordering::Release);
    }

    pub fn take_reclaim_request(&self) -> bool {
        self.reclaim_requested.swap(false, Ordering::AcqRel)
    }
}
