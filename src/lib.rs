/*!
 * Script Sandbox Library
 * Policy enforcement for untrusted script execution
 */

pub mod coordinator;
pub mod core;
pub mod monitoring;
pub mod process;
pub mod script;
pub mod security;

// Re-exports
pub use coordinator::{Coordinator, CoordinatorBuilder, CoordinatorStatus, HealthState, SubsystemHealth};
pub use crate::core::{
    ExecutionId, ExecutionRequest, Language, LimitCeilings, ResourceLimits, SandboxConfig,
    SandboxError, SandboxResult, SupervisorError,
};
pub use monitoring::{init_tracing, SupervisorEvent};
pub use process::{TerminationReason, UnitExit};
pub use security::{
    CapabilityPolicy, EnvironmentPolicy, ExecutionResult, MemoryUsage, RiskLevel, SecurityReport,
    Severity, StaticAnalyzer, Violation, ViolationKind, ViolationSource,
};
