/*!
 * Coordinator Status
 * Read-only diagnostic snapshot
 */

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    /// Running with a fallback (e.g. a probe that reads zero)
    Degraded,
    Stopped,
}

/// Per-subsystem health
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubsystemHealth {
    pub static_analyzer: HealthState,
    pub capability_gate: HealthState,
    pub environment_gate: HealthState,
    pub timeout_supervisor: HealthState,
    pub memory_supervisor: HealthState,
}

impl SubsystemHealth {
    pub fn all(state: HealthState) -> Self {
        Self {
            static_analyzer: state,
            capability_gate: state,
            environment_gate: state,
            timeout_supervisor: state,
            memory_supervisor: state,
        }
    }

    pub fn is_healthy(&self) -> bool {
        [
            self.static_analyzer,
            self.capability_gate,
            self.environment_gate,
            self.timeout_supervisor,
            self.memory_supervisor,
        ]
        .iter()
        .all(|state| *state == HealthState::Healthy)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorStatus {
    pub initialized: bool,
    pub shutting_down: bool,
    pub active_execution_count: usize,
    pub units_spawned: u64,
    pub static_rejections: u64,
    pub executions_completed: u64,
    pub subsystem_health: SubsystemHealth,
}
