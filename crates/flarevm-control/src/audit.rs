//! Audit log writer.
//!
//! Lifecycle actions are audited after the fact. A failed audit write never
//! undoes the action it describes; it is logged and counted instead.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use flarevm_core::UserId;
use flarevm_store::{
    HistoricEntry, HistoryAction, HistoryPage, HistoryQuery, HistoryStatus, NewHistoricEntry,
    Store, Vm,
};

use crate::error::Result;

/// Appends audit entries to the store.
pub struct AuditLog<S: Store> {
    store: Arc<S>,
    failures: AtomicU64,
}

impl<S: Store> AuditLog<S> {
    /// Create an audit log over `store`.
    #[must_use]
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            failures: AtomicU64::new(0),
        }
    }

    /// Record an action on `vm`.
    ///
    /// Returns the written entry, or `None` if the write failed.
    pub fn record(
        &self,
        vm: &Vm,
        actor_id: Option<UserId>,
        action: HistoryAction,
        status: HistoryStatus,
        details: impl Into<String>,
    ) -> Option<HistoricEntry> {
        let entry = NewHistoricEntry {
            virtual_machine_id: vm.vm_id,
            vm_name: vm.name.clone(),
            user_id: vm.user_id,
            actor_id,
            action,
            status,
            details: details.into(),
        };

        match self.store.append_history(entry) {
            Ok(entry) => Some(entry),
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    vm_id = %vm.vm_id,
                    action = action.as_str(),
                    error = %e,
                    "Failed to write audit entry"
                );
                None
            }
        }
    }

    /// Query the audit history, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn query(&self, query: &HistoryQuery) -> Result<HistoryPage> {
        Ok(self.store.query_history(query)?)
    }

    /// Number of audit writes that failed since startup.
    #[must_use]
    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flarevm_store::RocksStore;
    use tempfile::TempDir;

    fn vm(user_id: UserId) -> Vm {
        use chrono::Utc;
        use flarevm_core::{ImageId, OfferId, VmId};
        use flarevm_store::{NetworkIdentity, VmResources, VmStatus};
        use std::net::Ipv4Addr;

        Vm {
            vm_id: VmId::generate(),
            user_id,
            name: "web-1".to_string(),
            status: VmStatus::Running,
            resources: VmResources {
                vcpu_count: 1,
                memory_size_mib: 512,
                disk_size_gb: 5,
            },
            system_image_id: ImageId::generate(),
            vm_offer_id: OfferId::generate(),
            network: NetworkIdentity {
                slot: 0,
                ip_address: Ipv4Addr::new(172, 16, 0, 2),
                mac_address: "06:00:ac:10:00:02".to_string(),
                tap_device_name: "fctap0".to_string(),
                tap_ip: Ipv4Addr::new(172, 16, 0, 1),
                network_namespace: "flarevm".to_string(),
            },
            created_at: Utc::now(),
            updated_at: Utc::now(),
            started_at: None,
            stopped_at: None,
            error_message: None,
        }
    }

    #[test]
    fn record_and_query() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(RocksStore::open(dir.path()).unwrap());
        let audit = AuditLog::new(store);
        let user_id = UserId::new(42);
        let vm = vm(user_id);

        let first = audit
            .record(&vm, Some(user_id), HistoryAction::Stop, HistoryStatus::Success, "VM stopped")
            .unwrap();
        let second = audit
            .record(&vm, None, HistoryAction::Start, HistoryStatus::Error, "boot failed")
            .unwrap();
        assert!(second.id > first.id);

        let page = audit
            .query(&HistoryQuery {
                user_id: Some(user_id),
                page: 1,
                per_page: 10,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(page.entries[0].id, second.id);
        assert_eq!(audit.failure_count(), 0);
    }
}
