//! Domain types stored in the database.
//!
//! These types represent the persisted state of virtual machines, catalog
//! entries, accounts, metrics and the audit history.

use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use flarevm_core::{ImageId, OfferId, Role, SshKeyId, UserId, VmId};
use serde::{Deserialize, Serialize};

/// A virtual machine record.
///
/// Metrics are kept in a separate record (see [`MetricsSnapshot`]) so that the
/// lifecycle controller and the metrics collector never write the same value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vm {
    /// Unique identifier for the VM.
    pub vm_id: VmId,
    /// Owner user ID.
    pub user_id: UserId,
    /// Name chosen by the owner, unique per owner.
    pub name: String,
    /// Current lifecycle status.
    pub status: VmStatus,
    /// Allocated resources.
    pub resources: VmResources,
    /// Image the VM was provisioned from.
    pub system_image_id: ImageId,
    /// Offer that defines the resource ceiling.
    pub vm_offer_id: OfferId,
    /// Network identity assigned at creation.
    pub network: NetworkIdentity,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last modification timestamp.
    pub updated_at: DateTime<Utc>,
    /// When the VM last reached `running`.
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    /// When the VM last reached `stopped`.
    #[serde(default)]
    pub stopped_at: Option<DateTime<Utc>>,
    /// Error message when the VM is in the `error` status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Resources allocated to a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmResources {
    /// Number of virtual CPUs.
    pub vcpu_count: u32,
    /// Guest memory in MiB.
    pub memory_size_mib: u32,
    /// Root disk size in GB.
    pub disk_size_gb: u32,
}

/// Network identity of a VM inside a network namespace.
///
/// Every field derives from `slot`; the registry leases slots so no two live
/// VMs share an address or tap device within a namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkIdentity {
    /// Leased slot within the namespace pool.
    pub slot: u32,
    /// Guest IP address.
    pub ip_address: Ipv4Addr,
    /// Guest MAC address.
    pub mac_address: String,
    /// Host tap device name.
    pub tap_device_name: String,
    /// Host-side IP address of the tap device.
    pub tap_ip: Ipv4Addr,
    /// Network namespace the tap device lives in.
    pub network_namespace: String,
}

/// Lifecycle status of a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum VmStatus {
    /// Provisioning in progress.
    Creating = 1,
    /// Booted and serving.
    Running = 2,
    /// Shut down, resources retained.
    Stopped = 3,
    /// Pause requested, hypervisor call in flight.
    Pausing = 4,
    /// vCPUs paused, memory retained.
    Paused = 5,
    /// Shutdown in progress.
    Stopping = 6,
    /// Boot in progress.
    Starting = 7,
    /// Provisioning or hypervisor failure.
    Error = 8,
}

impl VmStatus {
    /// All statuses, in discriminant order.
    pub const ALL: [Self; 8] = [
        Self::Creating,
        Self::Running,
        Self::Stopped,
        Self::Pausing,
        Self::Paused,
        Self::Stopping,
        Self::Starting,
        Self::Error,
    ];

    /// Convert the status to its numeric representation.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Try to convert a numeric value to a `VmStatus`.
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Creating),
            2 => Some(Self::Running),
            3 => Some(Self::Stopped),
            4 => Some(Self::Pausing),
            5 => Some(Self::Paused),
            6 => Some(Self::Stopping),
            7 => Some(Self::Starting),
            8 => Some(Self::Error),
            _ => None,
        }
    }

    /// The wire name of the status.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Pausing => "pausing",
            Self::Paused => "paused",
            Self::Stopping => "stopping",
            Self::Starting => "starting",
            Self::Error => "error",
        }
    }
}

/// A system image catalog entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemImage {
    /// Unique identifier.
    pub image_id: ImageId,
    /// Image name (e.g. `ubuntu`).
    pub name: String,
    /// Image version (e.g. `22.04`).
    pub version: String,
    /// Guest kernel version.
    pub kernel_version: String,
    /// CPU architecture (e.g. `x86_64`).
    pub architecture: String,
    /// Checksum of the root filesystem.
    pub checksum: String,
    /// Root filesystem size in bytes.
    pub size_bytes: u64,
    /// Host path of the guest kernel.
    pub kernel_image_path: String,
    /// Host path of the root filesystem.
    pub rootfs_path: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl SystemImage {
    /// Returns true if `reference` names this image, either as `name` or
    /// as `name-version`.
    #[must_use]
    pub fn matches_reference(&self, reference: &str) -> bool {
        reference == self.name
            || reference
                .strip_prefix(self.name.as_str())
                .and_then(|rest| rest.strip_prefix('-'))
                .is_some_and(|version| version == self.version)
    }
}

/// A resource tier VMs are provisioned from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmOffer {
    /// Unique identifier.
    pub offer_id: OfferId,
    /// Offer name (e.g. `standard`).
    pub name: String,
    /// Marketing description.
    #[serde(default)]
    pub description: String,
    /// Number of virtual CPUs.
    pub vcpu_count: u32,
    /// Guest memory in MiB.
    pub memory_size_mib: u32,
    /// Root disk size in GB.
    pub disk_size_gb: u32,
    /// Hourly price.
    pub price_per_hour: f64,
    /// Whether new VMs may use this offer.
    pub is_active: bool,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last modification timestamp.
    pub updated_at: DateTime<Utc>,
}

impl VmOffer {
    /// The resources a VM on this offer receives.
    #[must_use]
    pub const fn resources(&self) -> VmResources {
        VmResources {
            vcpu_count: self.vcpu_count,
            memory_size_mib: self.memory_size_mib,
            disk_size_gb: self.disk_size_gb,
        }
    }
}

/// A user account record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Unique identifier for the user.
    pub user_id: UserId,
    /// Display name.
    pub username: String,
    /// Email address, unique across users.
    pub email: String,
    /// Account role.
    pub role: Role,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last modification timestamp.
    pub updated_at: DateTime<Utc>,
}

/// Fields for a user that has not been assigned an ID yet.
#[derive(Debug, Clone)]
pub struct NewUser {
    /// Display name.
    pub username: String,
    /// Email address.
    pub email: String,
    /// Account role.
    pub role: Role,
}

/// A registered SSH public key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshKey {
    /// Unique identifier.
    pub key_id: SshKeyId,
    /// Owning user.
    pub user_id: UserId,
    /// Label chosen by the owner.
    pub name: String,
    /// The OpenSSH public key line.
    pub public_key: String,
    /// `SHA256:` fingerprint of the key blob, unique across keys.
    pub fingerprint: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last successful authentication with this key.
    #[serde(default)]
    pub last_used_at: Option<DateTime<Utc>>,
}

/// A sampled metrics snapshot for one VM.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// CPU usage across all vCPUs, 0-100.
    pub cpu_usage_percent: f64,
    /// Guest memory in use, MiB.
    pub memory_usage_mib: u64,
    /// Bytes received on the VM interface.
    pub network_rx_bytes: u64,
    /// Bytes transmitted on the VM interface.
    pub network_tx_bytes: u64,
    /// Bytes read from the VM disks.
    pub disk_read_bytes: u64,
    /// Bytes written to the VM disks.
    pub disk_write_bytes: u64,
    /// When the sample was taken; `None` for a VM that was never sampled.
    #[serde(default)]
    pub sampled_at: Option<DateTime<Utc>>,
}

/// A lifecycle log line for one VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmLogLine {
    /// When the line was written.
    pub timestamp: DateTime<Utc>,
    /// Severity.
    pub level: LogLevel,
    /// Message text.
    pub message: String,
}

/// Severity of a VM log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    /// Informational.
    Info,
    /// Something degraded but the action continued.
    Warn,
    /// The action failed.
    Error,
}

/// A lifecycle action recorded in the audit history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryAction {
    /// VM provisioning.
    Create,
    /// VM boot from `stopped`.
    Start,
    /// VM shutdown.
    Stop,
    /// VM pause.
    Pause,
    /// VM resume from `paused`.
    Resume,
    /// Rename or offer reassignment.
    Update,
    /// Hard delete.
    Delete,
}

impl HistoryAction {
    /// The wire name of the action.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

/// Outcome of an audited action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryStatus {
    /// The action completed.
    Success,
    /// The action failed.
    Error,
    /// The action was rejected without side effects.
    Warning,
}

/// An immutable audit record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoricEntry {
    /// Monotonic sequence number; also the primary key.
    pub id: u64,
    /// VM the action targeted.
    pub virtual_machine_id: VmId,
    /// Name of the VM at the time of the action.
    pub vm_name: String,
    /// VM owner.
    pub user_id: UserId,
    /// Who issued the action (owner, admin, or the service itself).
    #[serde(default)]
    pub actor_id: Option<UserId>,
    /// Action performed.
    pub action: HistoryAction,
    /// Outcome.
    pub status: HistoryStatus,
    /// Human-readable details.
    pub details: String,
    /// When the entry was written.
    pub created_at: DateTime<Utc>,
}

/// An audit record before the store assigns its sequence number.
#[derive(Debug, Clone)]
pub struct NewHistoricEntry {
    /// VM the action targeted.
    pub virtual_machine_id: VmId,
    /// Name of the VM at the time of the action.
    pub vm_name: String,
    /// VM owner.
    pub user_id: UserId,
    /// Who issued the action.
    pub actor_id: Option<UserId>,
    /// Action performed.
    pub action: HistoryAction,
    /// Outcome.
    pub status: HistoryStatus,
    /// Human-readable details.
    pub details: String,
}

/// Filters for an audit history query.
#[derive(Debug, Clone, Default)]
pub struct HistoryQuery {
    /// Only entries for VMs owned by this user.
    pub user_id: Option<UserId>,
    /// Only entries for this VM.
    pub vm_id: Option<VmId>,
    /// Only entries for this action.
    pub action: Option<HistoryAction>,
    /// Only entries with this outcome.
    pub status: Option<HistoryStatus>,
    /// Case-insensitive substring over details and VM name.
    pub search: Option<String>,
    /// 1-based page number.
    pub page: u32,
    /// Entries per page.
    pub per_page: u32,
}

impl HistoryQuery {
    /// Returns true if `entry` passes every filter.
    #[must_use]
    pub fn matches(&self, entry: &HistoricEntry) -> bool {
        if self.user_id.is_some_and(|u| u != entry.user_id) {
            return false;
        }
        if self.vm_id.is_some_and(|v| v != entry.virtual_machine_id) {
            return false;
        }
        if self.action.is_some_and(|a| a != entry.action) {
            return false;
        }
        if self.status.is_some_and(|s| s != entry.status) {
            return false;
        }
        match self.search.as_deref().map(str::trim) {
            Some(needle) if !needle.is_empty() => {
                let needle = needle.to_lowercase();
                entry.details.to_lowercase().contains(&needle)
                    || entry.vm_name.to_lowercase().contains(&needle)
            }
            _ => true,
        }
    }
}

/// One page of audit history, newest first.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryPage {
    /// Entries on this page.
    pub entries: Vec<HistoricEntry>,
    /// Total number of matching entries.
    pub total: u64,
    /// 1-based page number.
    pub page: u32,
    /// Entries per page.
    pub per_page: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_roundtrip_through_u8() {
        for status in VmStatus::ALL {
            assert_eq!(VmStatus::from_u8(status.as_u8()), Some(status));
        }
        assert_eq!(VmStatus::from_u8(0), None);
    }

    #[test]
    fn image_reference_matching() {
        let image = SystemImage {
            image_id: ImageId::generate(),
            name: "ubuntu".to_string(),
            version: "22.04".to_string(),
            kernel_version: "6.1".to_string(),
            architecture: "x86_64".to_string(),
            checksum: "sha256:00".to_string(),
            size_bytes: 1 << 30,
            kernel_image_path: "/images/vmlinux".to_string(),
            rootfs_path: "/images/ubuntu.ext4".to_string(),
            created_at: Utc::now(),
        };

        assert!(image.matches_reference("ubuntu"));
        assert!(image.matches_reference("ubuntu-22.04"));
        assert!(!image.matches_reference("ubuntu-20.04"));
        assert!(!image.matches_reference("debian"));
    }

    #[test]
    fn history_search_is_case_insensitive() {
        let entry = HistoricEntry {
            id: 1,
            virtual_machine_id: VmId::generate(),
            vm_name: "Web-1".to_string(),
            user_id: UserId::new(42),
            actor_id: None,
            action: HistoryAction::Delete,
            status: HistoryStatus::Success,
            details: "VM deleted".to_string(),
            created_at: Utc::now(),
        };

        let query = HistoryQuery {
            search: Some("web".to_string()),
            ..Default::default()
        };
        assert!(query.matches(&entry));

        let query = HistoryQuery {
            user_id: Some(UserId::new(42)),
            action: Some(HistoryAction::Stop),
            ..Default::default()
        };
        assert!(!query.matches(&entry));
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&VmStatus::Pausing).unwrap();
        assert_eq!(json, "\"pausing\"");
    }
}
