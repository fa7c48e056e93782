/*!
 * Process Module
 * Execution units, their control block and outbound messages
 */

pub mod context;
pub mod control;
pub mod messages;
pub mod unit;

// Re-export for convenience
pub use context::UnitContext;
pub use control::{TerminationReason, UnitControl};
pub use messages::{ChannelSink, OutputSink, UnitMessage, TRUNCATION_MARKER};
pub use unit::{ExecutionUnit, UnitExit, UnitGates};
