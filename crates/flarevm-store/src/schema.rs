//! Database schema definitions and column families.
//!
//! This module defines the column families used in `RocksDB` storage.

/// Column family names for the `RocksDB` database.
pub mod cf {
    /// Primary VM records, keyed by `vm_id`.
    pub const VMS: &str = "vms";

    /// Index: VMs by owner, keyed by `user_id || vm_id`.
    pub const VMS_BY_USER: &str = "vms_by_user";

    /// Index: VMs by status, keyed by `status || vm_id`.
    pub const VMS_BY_STATUS: &str = "vms_by_status";

    /// Unique index: VM names per owner, keyed by `user_id || name`, value `vm_id`.
    pub const VM_NAMES: &str = "vm_names";

    /// Network slot leases, keyed by `namespace || 0x00 || slot`, value `vm_id`.
    pub const NETWORK_LEASES: &str = "network_leases";

    /// Latest metrics snapshot per VM, keyed by `vm_id`.
    pub const VM_METRICS: &str = "vm_metrics";

    /// Metrics history, keyed by `vm_id || sampled_at_millis`.
    pub const VM_METRICS_HISTORY: &str = "vm_metrics_history";

    /// Lifecycle log lines, keyed by `vm_id || seq`.
    pub const VM_LOGS: &str = "vm_logs";

    /// Audit history, keyed by `seq`.
    pub const HISTORY: &str = "history";

    /// Index: audit history by VM, keyed by `vm_id || seq`.
    pub const HISTORY_BY_VM: &str = "history_by_vm";

    /// Index: audit history by owner, keyed by `user_id || seq`.
    pub const HISTORY_BY_USER: &str = "history_by_user";

    /// User records, keyed by `user_id`.
    pub const USERS: &str = "users";

    /// Unique index: users by lowercase email, value `user_id`.
    pub const USERS_BY_EMAIL: &str = "users_by_email";

    /// System image catalog, keyed by `image_id`.
    pub const SYSTEM_IMAGES: &str = "system_images";

    /// VM offer catalog, keyed by `offer_id`.
    pub const VM_OFFERS: &str = "vm_offers";

    /// SSH keys, keyed by `key_id`.
    pub const SSH_KEYS: &str = "ssh_keys";

    /// Index: SSH keys by owner, keyed by `user_id || key_id`.
    pub const SSH_KEYS_BY_USER: &str = "ssh_keys_by_user";

    /// Unique index: SSH keys by fingerprint, value `key_id`.
    pub const SSH_KEY_FINGERPRINTS: &str = "ssh_key_fingerprints";
}

/// Returns all column family names for database initialization.
#[must_use]
pub fn all_column_families() -> Vec<&'static str> {
    vec![
        cf::VMS,
        cf::VMS_BY_USER,
        cf::VMS_BY_STATUS,
        cf::VM_NAMES,
        cf::NETWORK_LEASES,
        cf::VM_METRICS,
        cf::VM_METRICS_HISTORY,
        cf::VM_LOGS,
        cf::HISTORY,
        cf::HISTORY_BY_VM,
        cf::HISTORY_BY_USER,
        cf::USERS,
        cf::USERS_BY_EMAIL,
        cf::SYSTEM_IMAGES,
        cf::VM_OFFERS,
        cf::SSH_KEYS,
        cf::SSH_KEYS_BY_USER,
        cf::SSH_KEY_FINGERPRINTS,
    ]
}
