//! Periodic metrics collection.
//!
//! Every interval the collector samples all running VMs concurrently, each
//! under its own deadline, so one slow VM never delays the others. CPU usage
//! is derived from the change in cumulative CPU time since the previous
//! sample of the same VM.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use flarevm_core::VmId;
use flarevm_store::{MetricsSnapshot, Store, Vm, VmStatus};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::hypervisor::{Hypervisor, VmCounters};
use crate::types::MetricsConfig;

/// Outcome of one sampling round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SampleReport {
    /// Samples written.
    pub recorded: usize,
    /// VMs that left `running` before their sample could be written.
    pub skipped: usize,
    /// VMs that could not be sampled.
    pub failed: usize,
}

enum Outcome {
    Recorded,
    Skipped,
    Failed,
}

/// Samples running VMs into the registry.
pub struct MetricsCollector<S: Store, H: Hypervisor> {
    store: Arc<S>,
    hypervisor: Arc<H>,
    config: MetricsConfig,
    previous: Mutex<HashMap<VmId, (u64, Instant)>>,
}

impl<S: Store + 'static, H: Hypervisor + 'static> MetricsCollector<S, H> {
    /// Create a collector.
    #[must_use]
    pub fn new(store: Arc<S>, hypervisor: Arc<H>, config: MetricsConfig) -> Self {
        Self {
            store,
            hypervisor,
            config,
            previous: Mutex::new(HashMap::new()),
        }
    }

    /// Sample every running VM once.
    pub async fn sample_once(&self) -> SampleReport {
        let vms = match self.store.list_vms_by_status(VmStatus::Running) {
            Ok(vms) => vms,
            Err(e) => {
                tracing::error!(error = %e, "Failed to list running VMs for sampling");
                return SampleReport::default();
            }
        };

        // Counters of VMs that stopped are stale once they boot again
        let running: HashSet<VmId> = vms.iter().map(|vm| vm.vm_id).collect();
        self.previous.lock().retain(|vm_id, _| running.contains(vm_id));

        let outcomes = futures::future::join_all(vms.iter().map(|vm| self.sample_vm(vm))).await;

        let mut report = SampleReport::default();
        for outcome in outcomes {
            match outcome {
                Outcome::Recorded => report.recorded += 1,
                Outcome::Skipped => report.skipped += 1,
                Outcome::Failed => report.failed += 1,
            }
        }
        report
    }

    async fn sample_vm(&self, vm: &Vm) -> Outcome {
        let counters = match tokio::time::timeout(
            self.config.sample_timeout,
            self.hypervisor.read_counters(&vm.vm_id),
        )
        .await
        {
            Ok(Ok(counters)) => counters,
            Ok(Err(e)) => {
                tracing::warn!(vm_id = %vm.vm_id, error = %e, "Failed to read VM counters");
                return Outcome::Failed;
            }
            Err(_) => {
                tracing::warn!(
                    vm_id = %vm.vm_id,
                    timeout = ?self.config.sample_timeout,
                    "Timed out reading VM counters"
                );
                return Outcome::Failed;
            }
        };

        let now = Instant::now();
        let cpu = {
            let mut previous = self.previous.lock();
            let cpu = previous
                .get(&vm.vm_id)
                .map_or(0.0, |&(prev_cpu_us, prev_at)| {
                    let wall_us = u64::try_from(now.duration_since(prev_at).as_micros())
                        .unwrap_or(u64::MAX);
                    cpu_usage_percent(
                        counters.cpu_time_us.saturating_sub(prev_cpu_us),
                        wall_us,
                        vm.resources.vcpu_count,
                    )
                });
            previous.insert(vm.vm_id, (counters.cpu_time_us, now));
            cpu
        };

        let snapshot = snapshot_from(&counters, cpu);
        match self
            .store
            .record_metrics(&vm.vm_id, &snapshot, self.config.history_limit)
        {
            Ok(true) => Outcome::Recorded,
            Ok(false) => {
                tracing::debug!(vm_id = %vm.vm_id, "VM left running, dropping sample");
                Outcome::Skipped
            }
            Err(e) => {
                tracing::warn!(vm_id = %vm.vm_id, error = %e, "Failed to record metrics");
                Outcome::Failed
            }
        }
    }

    /// Spawn the sampling loop.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            tracing::info!(interval = ?self.config.interval, "Metrics collector started");

            loop {
                ticker.tick().await;
                let report = self.sample_once().await;
                tracing::debug!(
                    recorded = report.recorded,
                    skipped = report.skipped,
                    failed = report.failed,
                    "Metrics sampling round complete"
                );
            }
        })
    }
}

fn snapshot_from(counters: &VmCounters, cpu_usage_percent: f64) -> MetricsSnapshot {
    MetricsSnapshot {
        cpu_usage_percent,
        memory_usage_mib: counters.memory_usage_mib,
        network_rx_bytes: counters.network_rx_bytes,
        network_tx_bytes: counters.network_tx_bytes,
        disk_read_bytes: counters.disk_read_bytes,
        disk_write_bytes: counters.disk_write_bytes,
        sampled_at: Some(Utc::now()),
    }
}

/// CPU usage across `vcpus` over a wall-clock window, clamped to 0-100.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn cpu_usage_percent(cpu_delta_us: u64, wall_delta_us: u64, vcpus: u32) -> f64 {
    if wall_delta_us == 0 || vcpus == 0 {
        return 0.0;
    }
    let capacity = wall_delta_us as f64 * f64::from(vcpus);
    (cpu_delta_us as f64 / capacity * 100.0).clamp(0.0, 100.0)
}
