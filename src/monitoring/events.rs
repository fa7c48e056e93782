/*!
 * Supervisor Events
 * Termination and memory-breach notifications for telemetry sinks
 */

use crate::core::types::ExecutionId;
use crate::process::TerminationReason;
use crate::security::types::{Severity, ViolationKind};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Something a supervisor did to an execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SupervisorEvent {
    /// A unit was force-terminated
    Terminated {
        execution_id: ExecutionId,
        reason: TerminationReason,
        elapsed_ms: u64,
        cpu_time_ms: u64,
    },
    /// A memory rule fired
    MemoryBreach {
        execution_id: ExecutionId,
        kind: ViolationKind,
        severity: Severity,
        observed_bytes: u64,
        limit_bytes: u64,
    },
}

impl SupervisorEvent {
    pub fn execution_id(&self) -> &ExecutionId {
        match self {
            SupervisorEvent::Terminated { execution_id, .. } => execution_id,
            SupervisorEvent::MemoryBreach { execution_id, .. } => execution_id,
        }
    }
}

/// Fan-out of supervisor events
///
/// Cloned into every supervisor; emitting with no subscribers is a no-op.
#[derive(Clone)]
pub struct EventBroadcaster {
    sender: Arc<broadcast::Sender<SupervisorEvent>>,
}

impl EventBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: SupervisorEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new(crate::core::limits::EVENT_CHANNEL_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn terminated(id: &str) -> SupervisorEvent {
        SupervisorEvent::Terminated {
            execution_id: ExecutionId::from(id),
            reason: TerminationReason::Timeout,
            elapsed_ms: 10,
            cpu_time_ms: 5,
        }
    }

    #[tokio::test]
    async fn test_every_subscriber_receives() {
        let events = EventBroadcaster::new(8);
        let mut rx1 = events.subscribe();
        let mut rx2 = events.subscribe();
        events.emit(terminated("a"));

        let first = rx1.recv().await.unwrap();
        assert_eq!(first, rx2.recv().await.unwrap());
        assert_eq!(first.execution_id().as_str(), "a");
    }

    #[tokio::test]
    async fn test_late_subscriber_misses_events() {
        let events = EventBroadcaster::new(8);
        events.emit(terminated("early"));
        let mut rx = events.subscribe();
        let result = tokio::time::timeout(Duration::from_millis(30), rx.recv()).await;
        assert!(result.is_err());
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let json = serde_json::to_value(terminated("x")).unwrap();
        assert_eq!(json["event"], "terminated");
        assert_eq!(json["reason"], "timeout");
    }
}
