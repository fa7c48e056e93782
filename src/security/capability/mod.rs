/*!
 * Capability Gating
 *
 * - Static allow/deny policy shared read-only across executions
 * - Per-unit gate with default-deny semantics
 * - Restricted proxies exposing a named operation subset
 */

pub mod gate;
pub mod policy;
pub mod proxy;

pub use gate::{CapabilityDenied, CapabilityGate, GateState};
pub use policy::{CapabilityDecision, CapabilityPolicy};
pub use proxy::RestrictedModule;
