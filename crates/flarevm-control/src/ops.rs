//! Per-VM operation exclusion.
//!
//! At most one lifecycle operation runs per VM. The guard travels with the
//! background task that finishes the operation and releases the VM on drop.

use std::collections::HashSet;
use std::sync::Arc;

use flarevm_core::VmId;
use parking_lot::Mutex;

/// Set of VMs with an operation in flight.
#[derive(Debug, Clone, Default)]
pub struct OperationLocks {
    busy: Arc<Mutex<HashSet<VmId>>>,
}

impl OperationLocks {
    /// Create an empty lock set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `vm_id`, or `None` if an operation is already in flight.
    #[must_use]
    pub fn try_acquire(&self, vm_id: VmId) -> Option<OperationGuard> {
        if self.busy.lock().insert(vm_id) {
            Some(OperationGuard {
                busy: Arc::clone(&self.busy),
                vm_id,
            })
        } else {
            None
        }
    }

    /// Returns true if an operation is in flight for `vm_id`.
    #[must_use]
    pub fn is_locked(&self, vm_id: &VmId) -> bool {
        self.busy.lock().contains(vm_id)
    }
}

/// Releases its VM when dropped.
#[derive(Debug)]
pub struct OperationGuard {
    busy: Arc<Mutex<HashSet<VmId>>>,
    vm_id: VmId,
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        self.busy.lock().remove(&self.vm_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_until_release() {
        let locks = OperationLocks::new();
        let vm_id = VmId::generate();

        let guard = locks.try_acquire(vm_id).unwrap();
        assert!(locks.is_locked(&vm_id));
        assert!(locks.try_acquire(vm_id).is_none());

        drop(guard);
        assert!(!locks.is_locked(&vm_id));
        assert!(locks.try_acquire(vm_id).is_some());
    }

    #[test]
    fn locks_are_per_vm() {
        let locks = OperationLocks::new();
        let _a = locks.try_acquire(VmId::generate()).unwrap();
        assert!(locks.try_acquire(VmId::generate()).is_some());
    }

    #[test]
    fn clones_share_state() {
        let locks = OperationLocks::new();
        let other = locks.clone();
        let vm_id = VmId::generate();

        let _guard = locks.try_acquire(vm_id).unwrap();
        assert!(other.try_acquire(vm_id).is_none());
    }
}
