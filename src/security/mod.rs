/*!
 * Security Module
 * Static analysis, capability and environment gating, violation reporting
 */

pub mod analyzer;
pub mod capability;
pub mod environment;
pub mod report;
pub mod traits;
pub mod types;

// Re-export for convenience
pub use analyzer::StaticAnalyzer;
pub use capability::{CapabilityDenied, CapabilityGate, CapabilityPolicy, RestrictedModule};
pub use environment::{EnvironmentDenied, EnvironmentGate, EnvironmentPolicy};
pub use report::{ExecutionResult, MemoryUsage, ReportBuilder, SecurityReport};
pub use traits::*;
pub use types::*;
