/*!
 * Security Traits
 * Seams between gates and whoever collects their violations
 */

use super::types::Violation;
use parking_lot::Mutex;

/// Destination for violations raised while an execution runs
///
/// Gates only ever append; a sink is scoped to one execution.
pub trait ViolationSink: Send + Sync {
    /// Record a violation
    fn record(&self, violation: Violation);
}

/// In-memory sink, used by supervisors' callers and tests
impl ViolationSink for Mutex<Vec<Violation>> {
    fn record(&self, violation: Violation) {
        self.lock().push(violation);
    }
}
