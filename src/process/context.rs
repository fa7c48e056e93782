/*!
 * Unit Context
 * The explicit capability set handed to one execution unit
 */

use super::control::UnitControl;
use super::messages::OutputSink;
use crate::core::types::ExecutionId;
use crate::security::{CapabilityGate, EnvironmentGate};
use std::sync::Arc;

/// Everything a running script may reach outside its own heap
///
/// Built per unit and moved onto the unit thread; nothing here is shared
/// with another execution except the read-only policies behind the gates.
pub struct UnitContext {
    pub execution_id: ExecutionId,
    pub capabilities: CapabilityGate,
    pub environment: EnvironmentGate,
    pub control: Arc<UnitControl>,
    pub output: OutputSink,
}
