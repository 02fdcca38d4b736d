//! Request and response types for control plane operations.
//!
//! These types define the API contracts for VM, catalog and account
//! management, plus the service configuration.

use std::net::Ipv4Addr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use flarevm_core::{Role, SshKeyId, UserId, VmId};
use serde::{Deserialize, Serialize};

/// Request to create a new VM.
///
/// `offer` and `image` accept either an ID or a name. An image name may
/// carry its version (`ubuntu-22.04`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateVmRequest {
    /// Name for the VM, unique per owner.
    pub name: String,
    /// Offer ID or name.
    #[serde(alias = "vm_offer_id", alias = "offer_id")]
    pub offer: String,
    /// System image ID or reference.
    #[serde(alias = "system_image_id", alias = "image_id")]
    pub image: String,
}

impl CreateVmRequest {
    /// Create a new request.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        offer: impl Into<String>,
        image: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            offer: offer.into(),
            image: image.into(),
        }
    }
}

/// Request to update a VM.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateVmRequest {
    /// New name.
    #[serde(default)]
    pub name: Option<String>,
    /// New offer ID or name. Only allowed while the VM is stopped.
    #[serde(default, alias = "offer")]
    pub vm_offer_id: Option<String>,
}

/// Request to create a user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateUserRequest {
    /// Display name.
    pub username: String,
    /// Email address.
    pub email: String,
    /// Account role.
    #[serde(default)]
    pub role: Role,
}

/// Request to update a user.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateUserRequest {
    /// New display name.
    #[serde(default)]
    pub username: Option<String>,
    /// New email address.
    #[serde(default)]
    pub email: Option<String>,
    /// New role. Admin only.
    #[serde(default)]
    pub role: Option<Role>,
}

/// Request to register a system image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateImageRequest {
    /// Image name.
    pub name: String,
    /// Image version.
    pub version: String,
    /// Guest kernel version.
    pub kernel_version: String,
    /// CPU architecture.
    pub architecture: String,
    /// Root filesystem checksum.
    #[serde(default)]
    pub checksum: String,
    /// Root filesystem size in bytes.
    #[serde(alias = "size")]
    pub size_bytes: u64,
    /// Host path of the guest kernel.
    pub kernel_image_path: String,
    /// Host path of the root filesystem.
    pub rootfs_path: String,
}

/// Request to update a system image.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateImageRequest {
    /// New name.
    #[serde(default)]
    pub name: Option<String>,
    /// New version.
    #[serde(default)]
    pub version: Option<String>,
    /// New kernel version.
    #[serde(default)]
    pub kernel_version: Option<String>,
    /// New architecture.
    #[serde(default)]
    pub architecture: Option<String>,
    /// New checksum.
    #[serde(default)]
    pub checksum: Option<String>,
    /// New size in bytes.
    #[serde(default, alias = "size")]
    pub size_bytes: Option<u64>,
    /// New kernel path.
    #[serde(default)]
    pub kernel_image_path: Option<String>,
    /// New root filesystem path.
    #[serde(default)]
    pub rootfs_path: Option<String>,
}

/// Request to create a VM offer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateOfferRequest {
    /// Offer name.
    pub name: String,
    /// Marketing description.
    #[serde(default)]
    pub description: String,
    /// Number of virtual CPUs.
    pub vcpu_count: u32,
    /// Guest memory in MiB.
    #[serde(alias = "memory_size")]
    pub memory_size_mib: u32,
    /// Root disk size in GB.
    pub disk_size_gb: u32,
    /// Hourly price.
    #[serde(default)]
    pub price_per_hour: f64,
    /// Whether new VMs may use this offer.
    #[serde(default = "default_true")]
    pub is_active: bool,
}

const fn default_true() -> bool {
    true
}

/// Request to update a VM offer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateOfferRequest {
    /// New name.
    #[serde(default)]
    pub name: Option<String>,
    /// New description.
    #[serde(default)]
    pub description: Option<String>,
    /// New vCPU count.
    #[serde(default)]
    pub vcpu_count: Option<u32>,
    /// New memory size in MiB.
    #[serde(default, alias = "memory_size")]
    pub memory_size_mib: Option<u32>,
    /// New disk size in GB.
    #[serde(default)]
    pub disk_size_gb: Option<u32>,
    /// New hourly price.
    #[serde(default)]
    pub price_per_hour: Option<f64>,
    /// Activate or retire the offer.
    #[serde(default)]
    pub is_active: Option<bool>,
}

/// Request to register an SSH key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSshKeyRequest {
    /// Label for the key.
    pub name: String,
    /// OpenSSH public key line.
    pub public_key: String,
}

/// Request to rename an SSH key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateSshKeyRequest {
    /// New label.
    pub name: String,
}

/// SSH authentication check from the in-VM auth hook.
///
/// Either `fingerprint` or `public_key` identifies the presented key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SshAuthRequest {
    /// `SHA256:` fingerprint of the presented key.
    #[serde(default)]
    pub fingerprint: Option<String>,
    /// The presented OpenSSH public key line.
    #[serde(default)]
    pub public_key: Option<String>,
    /// VM the key is logging into; when set, the key owner must have access.
    #[serde(default)]
    pub vm_id: Option<VmId>,
}

/// Result of a successful SSH authentication check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshAuthResponse {
    /// Owner of the key.
    pub user_id: UserId,
    /// The matching key.
    pub key_id: SshKeyId,
    /// Its fingerprint.
    pub fingerprint: String,
}

/// Resources allocated across all VMs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocatedResources {
    /// Sum of vCPUs.
    pub vcpu_count: u64,
    /// Sum of guest memory in MiB.
    pub memory_size_mib: u64,
    /// Sum of disk sizes in GB.
    pub disk_size_gb: u64,
}

/// Live usage summed over running VMs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CurrentUsage {
    /// Sum of CPU usage percentages.
    pub cpu_usage_percent: f64,
    /// Sum of memory in use, MiB.
    pub memory_usage_mib: u64,
}

/// A recently created user, as shown on the admin dashboard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecentUser {
    /// User ID.
    pub user_id: UserId,
    /// Display name.
    pub username: String,
    /// Email address.
    pub email: String,
    /// When the account was created.
    pub created_at: DateTime<Utc>,
}

/// Admin dashboard statistics.
#[derive(Debug, Clone, Serialize)]
pub struct Dashboard {
    /// Number of users.
    pub total_users: u64,
    /// Number of VMs.
    pub total_vms: u64,
    /// VM count per status, every status present.
    pub vms_by_status: std::collections::BTreeMap<String, u64>,
    /// Resources allocated across all VMs.
    pub allocated: AllocatedResources,
    /// Usage summed over running VMs.
    pub usage: CurrentUsage,
    /// Most recently created users.
    pub recent_users: Vec<RecentUser>,
    /// Most recent audit entries.
    pub recent_activity: Vec<flarevm_store::HistoricEntry>,
    /// Audit entries that could not be written since startup.
    pub audit_failures: u64,
}

/// Network pool configuration.
///
/// Slot `n` owns the `/30` block at `subnet + 4n`: the tap device takes the
/// first host address and the guest the second.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Network namespace the tap devices live in.
    pub namespace: String,
    /// Base address of the pool.
    pub subnet: Ipv4Addr,
    /// Number of slots in the pool.
    pub capacity: u32,
    /// Tap device name prefix.
    pub tap_prefix: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            namespace: "flarevm".to_string(),
            subnet: Ipv4Addr::new(172, 16, 0, 0),
            capacity: 1024,
            tap_prefix: "fctap".to_string(),
        }
    }
}

/// Metrics collector configuration.
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// Time between sampling rounds.
    pub interval: Duration,
    /// Per-VM sampling deadline.
    pub sample_timeout: Duration,
    /// Samples kept per VM.
    pub history_limit: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            sample_timeout: Duration::from_secs(2),
            // One hour at the default interval
            history_limit: 720,
        }
    }
}

/// Bounded exponential backoff for transient hypervisor failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_backoff: Duration,
    /// Upper bound on the delay.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(2),
        }
    }
}

/// Configuration for the control plane service.
#[derive(Debug, Clone)]
pub struct ControlConfig {
    /// Maximum number of VMs per user.
    pub max_vms_per_user: u32,
    /// Architecture of the host; images must match it.
    pub host_architecture: String,
    /// Deadline for one hypervisor call.
    pub hypervisor_timeout: Duration,
    /// Retry policy for hypervisor calls.
    pub retry: RetryPolicy,
    /// Network pool.
    pub network: NetworkConfig,
    /// Metrics collector.
    pub metrics: MetricsConfig,
    /// Capacity of the status event channel.
    pub event_capacity: usize,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            max_vms_per_user: 10,
            host_architecture: std::env::consts::ARCH.to_string(),
            hypervisor_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            network: NetworkConfig::default(),
            metrics: MetricsConfig::default(),
            event_capacity: 256,
        }
    }
}
