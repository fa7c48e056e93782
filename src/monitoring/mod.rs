/*!
 * Monitoring
 * Timeout and memory supervision, resource probes and tracing
 */

pub mod anomaly;
pub mod events;
pub mod memory;
pub mod probe;
pub mod timeout;
mod tracer;

pub use anomaly::{GrowthAnomaly, GrowthDetector};
pub use events::{EventBroadcaster, SupervisorEvent};
pub use memory::{MemoryOutcome, MemorySample, MemorySupervisor};
pub use probe::{resident_set_bytes, ThreadCpuClock};
pub use timeout::{TimeoutHandle, TimeoutMetrics, TimeoutRegistry, TimeoutState, TimeoutSupervisor};
pub use tracer::init_tracing;
