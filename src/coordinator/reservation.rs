/*!
 * Execution Reservations
 * At most one active execution per request id
 */

use crate::core::errors::{SandboxError, SandboxResult};
use crate::core::types::ExecutionId;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::time::Instant;
use tokio::sync::Notify;

/// Ids of executions currently in flight
#[derive(Default)]
pub(crate) struct ActiveExecutions {
    entries: DashMap<ExecutionId, Instant, ahash::RandomState>,
    drained: Notify,
}

impl ActiveExecutions {
    /// Claim `id`; the claim is released when the guard drops
    pub(crate) fn reserve(&self, id: &ExecutionId) -> SandboxResult<Reservation<'_>> {
        match self.entries.entry(id.clone()) {
            Entry::Occupied(_) => Err(SandboxError::DuplicateExecution(id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(Instant::now());
                Ok(Reservation {
                    owner: self,
                    id: id.clone(),
                })
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolve once no execution is in flight
    pub(crate) async fn wait_drained(&self) {
        loop {
            // Registered before the check so a release in between is not missed
            let notified = self.drained.notified();
            if self.is_empty() {
                return;
            }
            notified.await;
        }
    }
}

/// RAII claim on an execution id
pub(crate) struct Reservation<'a> {
    owner: &'a ActiveExecutions,
    id: ExecutionId,
}

impl Reservation<'_> {
    pub(crate) fn id(&self) -> &ExecutionId {
        &self.id
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.owner.entries.remove(&self.id);
        if self.owner.entries.is_empty() {
            self.owner.drained.notify_waiters();
        }
    }
}
