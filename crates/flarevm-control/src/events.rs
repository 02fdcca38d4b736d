//! VM status change notifications.

use chrono::{DateTime, Utc};
use flarevm_core::VmId;
use flarevm_store::VmStatus;
use serde::Serialize;
use tokio::sync::broadcast;

/// A VM's status changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VmEvent {
    /// The VM.
    pub vm_id: VmId,
    /// New status; `None` once the VM is deleted.
    pub status: Option<VmStatus>,
    /// When the change was committed.
    pub at: DateTime<Utc>,
}

/// Broadcast channel of status changes.
///
/// Slow subscribers lag and lose events rather than block the publisher.
#[derive(Debug, Clone)]
pub struct StatusEvents {
    tx: broadcast::Sender<VmEvent>,
}

impl StatusEvents {
    /// Create a channel buffering up to `capacity` events per subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish a status change.
    pub fn publish(&self, vm_id: VmId, status: Option<VmStatus>) {
        // No subscribers is fine
        let _ = self.tx.send(VmEvent {
            vm_id,
            status,
            at: Utc::now(),
        });
    }

    /// Subscribe to future status changes.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<VmEvent> {
        self.tx.subscribe()
    }
}
