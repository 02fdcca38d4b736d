//! Admin dashboard aggregation.

use std::collections::BTreeMap;

use flarevm_store::{HistoryQuery, Store, VmStatus};

use crate::error::Result;
use crate::types::{AllocatedResources, CurrentUsage, Dashboard, RecentUser};

/// Users listed on the dashboard.
const RECENT_USERS: usize = 5;
/// Audit entries listed on the dashboard.
const RECENT_ACTIVITY: u32 = 10;

/// Build dashboard statistics from the registry.
///
/// # Errors
///
/// Returns an error if the database operation fails.
pub fn build<S: Store>(store: &S, audit_failures: u64) -> Result<Dashboard> {
    let vms = store.list_all_vms()?;
    let mut users = store.list_users()?;

    let mut vms_by_status: BTreeMap<String, u64> = VmStatus::ALL
        .iter()
        .map(|status| (status.as_str().to_string(), 0))
        .collect();
    let mut allocated = AllocatedResources::default();
    let mut usage = CurrentUsage::default();

    for vm in &vms {
        *vms_by_status.entry(vm.status.as_str().to_string()).or_default() += 1;

        allocated.vcpu_count += u64::from(vm.resources.vcpu_count);
        allocated.memory_size_mib += u64::from(vm.resources.memory_size_mib);
        allocated.disk_size_gb += u64::from(vm.resources.disk_size_gb);

        if vm.status == VmStatus::Running {
            if let Some(metrics) = store.get_metrics(&vm.vm_id)? {
                usage.cpu_usage_percent += metrics.cpu_usage_percent;
                usage.memory_usage_mib += metrics.memory_usage_mib;
            }
        }
    }

    let total_users = users.len() as u64;
    users.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    let recent_users = users
        .into_iter()
        .take(RECENT_USERS)
        .map(|user| RecentUser {
            user_id: user.user_id,
            username: user.username,
            email: user.email,
            created_at: user.created_at,
        })
        .collect();

    let recent_activity = store
        .query_history(&HistoryQuery {
            page: 1,
            per_page: RECENT_ACTIVITY,
            ..HistoryQuery::default()
        })?
        .entries;

    Ok(Dashboard {
        total_users,
        total_vms: vms.len() as u64,
        vms_by_status,
        allocated,
        usage,
        recent_users,
        recent_activity,
        audit_failures,
    })
}
