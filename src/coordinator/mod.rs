/*!
 * Coordinator Module
 * Per-request orchestration of analysis, execution and supervision
 */

mod builder;
mod manager;
mod reservation;
mod status;

// Re-export for convenience
pub use builder::CoordinatorBuilder;
pub use manager::Coordinator;
pub use status::{CoordinatorStatus, HealthState, SubsystemHealth};
