//! `RocksDB` storage layer for flarevm.
//!
//! This crate is the VM registry: the single durable record of virtual
//! machines, their network leases, metrics, lifecycle logs, the audit history
//! and the account and catalog entities, stored in `RocksDB` with column
//! families for efficient indexing.
//!
//! # Architecture
//!
//! The storage uses the following column families:
//!
//! - `vms`: Primary VM records, keyed by `vm_id`
//! - `vms_by_user` / `vms_by_status`: Indexes for listing VMs
//! - `vm_names`: Unique index of VM names per owner
//! - `network_leases`: Network slot leases per namespace
//! - `vm_metrics` / `vm_metrics_history`: Metrics, written apart from the VM record
//! - `vm_logs`: Per-VM lifecycle log lines
//! - `history`, `history_by_vm`, `history_by_user`: Append-only audit history
//! - `users`, `users_by_email`: Accounts
//! - `system_images`, `vm_offers`: Catalog
//! - `ssh_keys`, `ssh_keys_by_user`, `ssh_key_fingerprints`: SSH keys
//!
//! Writes that check a precondition (uniqueness, status, lease ownership) run
//! under a store-wide write lock and commit in a single `WriteBatch`.
//!
//! # Example
//!
//! ```no_run
//! use flarevm_store::{RocksStore, Store};
//! use flarevm_core::UserId;
//!
//! let store = RocksStore::open("/tmp/flarevm-db").unwrap();
//!
//! // List VMs for a user
//! let vms = store.list_vms_by_user(UserId::new(42)).unwrap();
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod keys;
pub mod rocks;
pub mod schema;
pub mod types;

pub use error::{Result, StoreError};
pub use rocks::RocksStore;
pub use types::{
    HistoricEntry, HistoryAction, HistoryPage, HistoryQuery, HistoryStatus, LogLevel,
    MetricsSnapshot, NetworkIdentity, NewHistoricEntry, NewUser, SshKey, SystemImage, User, Vm,
    VmLogLine, VmOffer, VmResources, VmStatus,
};

use flarevm_core::{ImageId, OfferId, SshKeyId, UserId, VmId};

/// The storage trait defining all database operations.
///
/// This trait abstracts the storage layer, allowing for different implementations
/// (e.g., `RocksDB`, in-memory for testing).
pub trait Store: Send + Sync {
    // =========================================================================
    // Network Leases
    // =========================================================================

    /// Atomically lease the lowest free slot in `namespace` for `vm_id`.
    ///
    /// Returns `None` when all `capacity` slots are leased.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn claim_network_slot(&self, namespace: &str, capacity: u32, vm_id: &VmId)
        -> Result<Option<u32>>;

    /// Release a slot lease, but only if it is still held by `vm_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn release_network_slot(&self, namespace: &str, slot: u32, vm_id: &VmId) -> Result<()>;

    // =========================================================================
    // VM Operations
    // =========================================================================

    /// Insert a new VM record.
    ///
    /// The VM's network slot must already be leased to it.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Conflict` if the ID exists, the name is taken by
    /// another VM of the same owner, or the network lease is not held.
    fn insert_vm(&self, vm: &Vm) -> Result<()>;

    /// Apply `update` to a VM if its current status is one of `expected`.
    ///
    /// The check and the write happen under the store write lock, so a
    /// concurrent writer can never interleave. Name and status indexes follow
    /// the updated record. `updated_at` is refreshed.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the VM doesn't exist and
    /// `StoreError::Conflict` if the status doesn't match, the new name is
    /// taken, or `update` changed the VM's identity or owner.
    fn compare_and_update_vm(
        &self,
        vm_id: &VmId,
        expected: &[VmStatus],
        update: &dyn Fn(&mut Vm),
    ) -> Result<Vm>;

    /// Get a VM by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_vm(&self, vm_id: &VmId) -> Result<Option<Vm>>;

    /// Delete a VM and everything that hangs off it.
    ///
    /// Removes the record and its indexes, releases its network lease, and
    /// purges its metrics, metrics history and log lines in one batch. Only
    /// succeeds while the status is one of `expected`. The audit history is
    /// kept.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the VM doesn't exist and
    /// `StoreError::Conflict` if the status doesn't match.
    fn delete_vm(&self, vm_id: &VmId, expected: &[VmStatus]) -> Result<Vm>;

    /// List all VMs belonging to a user.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_vms_by_user(&self, user_id: UserId) -> Result<Vec<Vm>>;

    /// Count VMs belonging to a user.
    ///
    /// This is more efficient than listing when you only need the count.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn count_vms_by_user(&self, user_id: UserId) -> Result<u32>;

    /// List all VMs with a given status.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_vms_by_status(&self, status: VmStatus) -> Result<Vec<Vm>>;

    /// List all VMs in the database.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_all_vms(&self) -> Result<Vec<Vm>>;

    // =========================================================================
    // Metrics Operations
    // =========================================================================

    /// Record a metrics sample, but only if the VM is `running` right now.
    ///
    /// The status check and the write happen under the store write lock.
    /// History beyond `history_limit` samples is trimmed, oldest first.
    /// Returns whether the sample was recorded.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn record_metrics(
        &self,
        vm_id: &VmId,
        snapshot: &MetricsSnapshot,
        history_limit: usize,
    ) -> Result<bool>;

    /// Get the latest metrics sample for a VM.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_metrics(&self, vm_id: &VmId) -> Result<Option<MetricsSnapshot>>;

    /// List up to `limit` most recent samples, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_metrics_history(&self, vm_id: &VmId, limit: usize) -> Result<Vec<MetricsSnapshot>>;

    // =========================================================================
    // VM Log Operations
    // =========================================================================

    /// Append a lifecycle log line for a VM.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn append_vm_log(&self, vm_id: &VmId, line: &VmLogLine) -> Result<()>;

    /// List log lines for a VM in write order, optionally only the last `tail`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_vm_logs(&self, vm_id: &VmId, tail: Option<usize>) -> Result<Vec<VmLogLine>>;

    // =========================================================================
    // Audit History Operations
    // =========================================================================

    /// Append an audit entry, assigning the next sequence number.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn append_history(&self, entry: NewHistoricEntry) -> Result<HistoricEntry>;

    /// Query the audit history, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn query_history(&self, query: &HistoryQuery) -> Result<HistoryPage>;

    // =========================================================================
    // User Operations
    // =========================================================================

    /// Create a user, assigning the next numeric ID.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Conflict` if the email is already registered.
    fn create_user(&self, user: NewUser) -> Result<User>;

    /// Replace a user record.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the user doesn't exist and
    /// `StoreError::Conflict` if the new email is already registered.
    fn update_user(&self, user: &User) -> Result<()>;

    /// Get a user by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_user(&self, user_id: UserId) -> Result<Option<User>>;

    /// Delete a user by ID.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the user doesn't exist.
    fn delete_user(&self, user_id: UserId) -> Result<()>;

    /// List all users, ordered by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_users(&self) -> Result<Vec<User>>;

    // =========================================================================
    // Catalog Operations
    // =========================================================================

    /// Insert or replace a system image.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Conflict` if another image has the same
    /// `(name, version)`.
    fn put_image(&self, image: &SystemImage) -> Result<()>;

    /// Get a system image by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_image(&self, image_id: &ImageId) -> Result<Option<SystemImage>>;

    /// Delete a system image by ID.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the image doesn't exist.
    fn delete_image(&self, image_id: &ImageId) -> Result<()>;

    /// List all system images.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_images(&self) -> Result<Vec<SystemImage>>;

    /// Insert or replace a VM offer.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Conflict` if another offer has the same name.
    fn put_offer(&self, offer: &VmOffer) -> Result<()>;

    /// Get a VM offer by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_offer(&self, offer_id: &OfferId) -> Result<Option<VmOffer>>;

    /// Delete a VM offer by ID.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the offer doesn't exist.
    fn delete_offer(&self, offer_id: &OfferId) -> Result<()>;

    /// List all VM offers.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_offers(&self) -> Result<Vec<VmOffer>>;

    // =========================================================================
    // SSH Key Operations
    // =========================================================================

    /// Insert or replace an SSH key.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Conflict` if another key has the same fingerprint.
    fn put_ssh_key(&self, key: &SshKey) -> Result<()>;

    /// Get an SSH key by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_ssh_key(&self, key_id: &SshKeyId) -> Result<Option<SshKey>>;

    /// Look up an SSH key by fingerprint.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_ssh_key_by_fingerprint(&self, fingerprint: &str) -> Result<Option<SshKey>>;

    /// Delete an SSH key by ID.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the key doesn't exist.
    fn delete_ssh_key(&self, key_id: &SshKeyId) -> Result<()>;

    /// List all SSH keys belonging to a user.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_ssh_keys_by_user(&self, user_id: UserId) -> Result<Vec<SshKey>>;
}
