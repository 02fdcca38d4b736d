//! `RocksDB` storage implementation.
//!
//! This module provides the `RocksStore` implementation of the `Store` trait.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use flarevm_core::{ImageId, OfferId, SshKeyId, UserId, VmId};
use parking_lot::Mutex;
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, Direction, IteratorMode,
    MultiThreaded, Options, WriteBatch,
};

use crate::error::{Result, StoreError};
use crate::keys;
use crate::schema::{all_column_families, cf};
use crate::types::{
    HistoricEntry, HistoryPage, HistoryQuery, MetricsSnapshot, NewHistoricEntry, NewUser, SshKey,
    SystemImage, User, Vm, VmLogLine, VmOffer, VmStatus,
};
use crate::Store;

type Db = DBWithThreadMode<MultiThreaded>;
type KeyValue = (Box<[u8]>, Box<[u8]>);

/// RocksDB-backed storage implementation.
pub struct RocksStore {
    db: Arc<Db>,
    /// Serializes read-check-write operations.
    write_lock: Mutex<()>,
    /// Last assigned audit sequence number.
    history_seq: AtomicU64,
    /// Next user ID to assign.
    next_user_id: AtomicU64,
    /// Tie-breaker for log lines written in the same microsecond.
    log_seq: AtomicU64,
    /// Tie-breaker for metrics samples taken in the same millisecond.
    metrics_seq: AtomicU64,
}

impl RocksStore {
    /// Open or create a `RocksDB` database at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or created.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_descriptors: Vec<_> = all_column_families()
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()))
            .collect();

        let db = DBWithThreadMode::open_cf_descriptors(&opts, path, cf_descriptors)?;

        let history_seq = Self::last_seq(&db, cf::HISTORY)?;
        let last_user_id = Self::last_seq(&db, cf::USERS)?;

        tracing::debug!(history_seq, last_user_id, "Opened store");

        Ok(Self {
            db: Arc::new(db),
            write_lock: Mutex::new(()),
            history_seq: AtomicU64::new(history_seq),
            next_user_id: AtomicU64::new(last_user_id + 1),
            log_seq: AtomicU64::new(0),
            metrics_seq: AtomicU64::new(0),
        })
    }

    /// Read the numeric value of the last key in a sequence-keyed column family.
    fn last_seq(db: &Db, name: &str) -> Result<u64> {
        let cf = db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family not found: {name}")))?;
        let last = db.iterator_cf(&cf, IteratorMode::End).next().transpose()?;
        Ok(last.and_then(|(key, _)| keys::decode_seq(&key)).unwrap_or(0))
    }

    /// Get a column family handle.
    fn cf(&self, name: &str) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family not found: {name}")))
    }

    /// Serialize a value using CBOR.
    fn serialize<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(value, &mut buf)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(buf)
    }

    /// Deserialize a value from CBOR.
    fn deserialize<T: serde::de::DeserializeOwned>(data: &[u8]) -> Result<T> {
        ciborium::from_reader(data).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    /// Get and deserialize a single value.
    fn get_value<T: serde::de::DeserializeOwned>(
        &self,
        name: &str,
        key: &[u8],
    ) -> Result<Option<T>> {
        let cf = self.cf(name)?;
        self.db
            .get_cf(&cf, key)?
            .map(|data| Self::deserialize(&data))
            .transpose()
    }

    /// Deserialize every value in a column family, in key order.
    fn list_values<T: serde::de::DeserializeOwned>(&self, name: &str) -> Result<Vec<T>> {
        let cf = self.cf(name)?;
        let mut values = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_, value) = item?;
            values.push(Self::deserialize(&value)?);
        }
        Ok(values)
    }

    /// Collect every entry whose key starts with `prefix`, in key order.
    fn scan_prefix(&self, name: &str, prefix: &[u8]) -> Result<Vec<KeyValue>> {
        let cf = self.cf(name)?;
        let mut entries = Vec::new();
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(prefix, Direction::Forward));

        for item in iter {
            let (key, value) = item?;

            // Stop if we're past the prefix
            if !key.starts_with(prefix) {
                break;
            }

            entries.push((key, value));
        }

        Ok(entries)
    }

    /// Collect up to `limit` entries whose key starts with `prefix`, in
    /// reverse key order.
    fn scan_prefix_rev(
        &self,
        name: &str,
        prefix: &[u8],
        limit: Option<usize>,
    ) -> Result<Vec<KeyValue>> {
        let cf = self.cf(name)?;
        let bound = keys::prefix_upper_bound(prefix);
        let mode = match &bound {
            Some(bound) => IteratorMode::From(bound, Direction::Reverse),
            None => IteratorMode::End,
        };

        let mut entries = Vec::new();
        for item in self.db.iterator_cf(&cf, mode) {
            if limit.is_some_and(|limit| entries.len() >= limit) {
                break;
            }

            let (key, value) = item?;

            // The seek lands on the bound itself if such a key exists.
            if bound.as_deref().is_some_and(|b| &key[..] >= b) {
                continue;
            }
            if !key.starts_with(prefix) {
                break;
            }

            entries.push((key, value));
        }

        Ok(entries)
    }

    /// Load VMs referenced by the trailing IDs of index keys.
    fn load_vms<I>(&self, ids: I) -> Result<Vec<Vm>>
    where
        I: IntoIterator<Item = VmId>,
    {
        let mut vms = Vec::new();
        for vm_id in ids {
            if let Some(vm) = self.get_vm(&vm_id)? {
                vms.push(vm);
            }
        }
        Ok(vms)
    }

    /// Load audit entries referenced by the trailing sequence of index keys.
    fn load_history(&self, index: Vec<KeyValue>) -> Result<Vec<HistoricEntry>> {
        let mut entries = Vec::new();
        for (key, _) in index {
            let Some(seq) = keys::extract_trailing_seq(&key) else {
                continue;
            };
            if let Some(entry) = self.get_value(cf::HISTORY, &keys::seq_key(seq))? {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    /// Queue deletion of every key under `prefix` into `batch`.
    fn delete_prefix(&self, batch: &mut WriteBatch, name: &str, prefix: &[u8]) -> Result<usize> {
        let cf = self.cf(name)?;
        let entries = self.scan_prefix(name, prefix)?;
        for (key, _) in &entries {
            batch.delete_cf(&cf, key);
        }
        Ok(entries.len())
    }

    fn check_status(vm: &Vm, expected: &[VmStatus]) -> Result<()> {
        if expected.contains(&vm.status) {
            Ok(())
        } else {
            Err(StoreError::Conflict(format!(
                "VM {} is {}",
                vm.vm_id,
                vm.status.as_str()
            )))
        }
    }
}

impl Store for RocksStore {
    // =========================================================================
    // Network Leases
    // =========================================================================

    fn claim_network_slot(
        &self,
        namespace: &str,
        capacity: u32,
        vm_id: &VmId,
    ) -> Result<Option<u32>> {
        let _guard = self.write_lock.lock();
        let cf_leases = self.cf(cf::NETWORK_LEASES)?;
        let prefix = keys::lease_prefix(namespace);

        let leased: BTreeSet<u32> = self
            .scan_prefix(cf::NETWORK_LEASES, &prefix)?
            .iter()
            .filter_map(|(key, _)| keys::extract_slot(key, prefix.len()))
            .collect();

        let Some(slot) = (0..capacity).find(|slot| !leased.contains(slot)) else {
            tracing::warn!(namespace, capacity, "Network pool exhausted");
            return Ok(None);
        };

        self.db
            .put_cf(&cf_leases, keys::lease_key(namespace, slot), vm_id.as_bytes())?;

        tracing::debug!(namespace, slot, %vm_id, "Leased network slot");
        Ok(Some(slot))
    }

    fn release_network_slot(&self, namespace: &str, slot: u32, vm_id: &VmId) -> Result<()> {
        let _guard = self.write_lock.lock();
        let cf_leases = self.cf(cf::NETWORK_LEASES)?;
        let key = keys::lease_key(namespace, slot);

        let holder = self.db.get_cf(&cf_leases, &key)?;
        if holder.as_deref() == Some(vm_id.as_bytes().as_slice()) {
            self.db.delete_cf(&cf_leases, &key)?;
            tracing::debug!(namespace, slot, %vm_id, "Released network slot");
        }

        Ok(())
    }

    // =========================================================================
    // VM Operations
    // =========================================================================

    fn insert_vm(&self, vm: &Vm) -> Result<()> {
        let _guard = self.write_lock.lock();
        let cf_vms = self.cf(cf::VMS)?;
        let cf_by_user = self.cf(cf::VMS_BY_USER)?;
        let cf_by_status = self.cf(cf::VMS_BY_STATUS)?;
        let cf_names = self.cf(cf::VM_NAMES)?;
        let cf_leases = self.cf(cf::NETWORK_LEASES)?;

        let vm_key = keys::id_key(&vm.vm_id);
        let name_key = keys::vm_name_key(vm.user_id, &vm.name);
        let lease_key = keys::lease_key(&vm.network.network_namespace, vm.network.slot);

        if self.db.get_cf(&cf_vms, &vm_key)?.is_some() {
            return Err(StoreError::Conflict(format!("VM {} already exists", vm.vm_id)));
        }
        if self.db.get_cf(&cf_names, &name_key)?.is_some() {
            return Err(StoreError::Conflict(format!(
                "VM name '{}' is already in use",
                vm.name
            )));
        }
        let holder = self.db.get_cf(&cf_leases, &lease_key)?;
        if holder.as_deref() != Some(vm.vm_id.as_bytes().as_slice()) {
            return Err(StoreError::Conflict(format!(
                "network slot {} is not leased to VM {}",
                vm.network.slot, vm.vm_id
            )));
        }

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_vms, &vm_key, Self::serialize(vm)?);
        batch.put_cf(
            &cf_by_user,
            keys::user_scoped_key(vm.user_id, vm.vm_id.as_bytes()),
            [],
        );
        batch.put_cf(
            &cf_by_status,
            keys::status_vm_key(vm.status.as_u8(), &vm.vm_id),
            [],
        );
        batch.put_cf(&cf_names, &name_key, vm.vm_id.as_bytes());

        self.db.write(batch)?;

        Ok(())
    }

    fn compare_and_update_vm(
        &self,
        vm_id: &VmId,
        expected: &[VmStatus],
        update: &dyn Fn(&mut Vm),
    ) -> Result<Vm> {
        let _guard = self.write_lock.lock();
        let cf_vms = self.cf(cf::VMS)?;
        let cf_by_status = self.cf(cf::VMS_BY_STATUS)?;
        let cf_names = self.cf(cf::VM_NAMES)?;

        let before = self.get_vm(vm_id)?.ok_or(StoreError::NotFound)?;
        Self::check_status(&before, expected)?;

        let mut vm = before.clone();
        update(&mut vm);
        if vm.vm_id != before.vm_id || vm.user_id != before.user_id {
            return Err(StoreError::Conflict(
                "VM identity and owner are immutable".to_string(),
            ));
        }
        vm.updated_at = Utc::now();

        let mut batch = WriteBatch::default();

        // Update main record
        batch.put_cf(&cf_vms, keys::id_key(vm_id), Self::serialize(&vm)?);

        // Update status index if status changed
        if vm.status != before.status {
            batch.delete_cf(&cf_by_status, keys::status_vm_key(before.status.as_u8(), vm_id));
            batch.put_cf(&cf_by_status, keys::status_vm_key(vm.status.as_u8(), vm_id), []);
        }

        // Update name index if renamed
        if vm.name != before.name {
            let new_key = keys::vm_name_key(vm.user_id, &vm.name);
            if self.db.get_cf(&cf_names, &new_key)?.is_some() {
                return Err(StoreError::Conflict(format!(
                    "VM name '{}' is already in use",
                    vm.name
                )));
            }
            batch.delete_cf(&cf_names, keys::vm_name_key(before.user_id, &before.name));
            batch.put_cf(&cf_names, new_key, vm_id.as_bytes());
        }

        self.db.write(batch)?;

        Ok(vm)
    }

    fn get_vm(&self, vm_id: &VmId) -> Result<Option<Vm>> {
        self.get_value(cf::VMS, &keys::id_key(vm_id))
    }

    fn delete_vm(&self, vm_id: &VmId, expected: &[VmStatus]) -> Result<Vm> {
        let _guard = self.write_lock.lock();
        let cf_vms = self.cf(cf::VMS)?;
        let cf_by_user = self.cf(cf::VMS_BY_USER)?;
        let cf_by_status = self.cf(cf::VMS_BY_STATUS)?;
        let cf_names = self.cf(cf::VM_NAMES)?;
        let cf_leases = self.cf(cf::NETWORK_LEASES)?;
        let cf_metrics = self.cf(cf::VM_METRICS)?;

        let vm = self.get_vm(vm_id)?.ok_or(StoreError::NotFound)?;
        Self::check_status(&vm, expected)?;

        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf_vms, keys::id_key(vm_id));
        batch.delete_cf(&cf_by_user, keys::user_scoped_key(vm.user_id, vm_id.as_bytes()));
        batch.delete_cf(&cf_by_status, keys::status_vm_key(vm.status.as_u8(), vm_id));
        batch.delete_cf(&cf_names, keys::vm_name_key(vm.user_id, &vm.name));
        batch.delete_cf(&cf_metrics, keys::id_key(vm_id));

        let lease_key = keys::lease_key(&vm.network.network_namespace, vm.network.slot);
        if self.db.get_cf(&cf_leases, &lease_key)?.as_deref() == Some(vm_id.as_bytes().as_slice()) {
            batch.delete_cf(&cf_leases, &lease_key);
        }

        let prefix = keys::vm_prefix(vm_id);
        let samples = self.delete_prefix(&mut batch, cf::VM_METRICS_HISTORY, &prefix)?;
        let lines = self.delete_prefix(&mut batch, cf::VM_LOGS, &prefix)?;

        self.db.write(batch)?;

        tracing::debug!(%vm_id, samples, lines, "Deleted VM record");
        Ok(vm)
    }

    fn list_vms_by_user(&self, user_id: UserId) -> Result<Vec<Vm>> {
        let prefix = keys::user_prefix(user_id);
        let ids = self
            .scan_prefix(cf::VMS_BY_USER, &prefix)?
            .into_iter()
            .filter_map(|(key, _)| keys::extract_uuid_after_user(&key))
            .map(VmId::from_bytes);
        self.load_vms(ids)
    }

    fn count_vms_by_user(&self, user_id: UserId) -> Result<u32> {
        let prefix = keys::user_prefix(user_id);
        let count = self.scan_prefix(cf::VMS_BY_USER, &prefix)?.len();
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    fn list_vms_by_status(&self, status: VmStatus) -> Result<Vec<Vm>> {
        let prefix = keys::status_prefix(status.as_u8());
        let ids = self
            .scan_prefix(cf::VMS_BY_STATUS, &prefix)?
            .into_iter()
            .filter_map(|(key, _)| keys::extract_vm_id_from_status_key(&key));
        self.load_vms(ids)
    }

    fn list_all_vms(&self) -> Result<Vec<Vm>> {
        self.list_values(cf::VMS)
    }

    // =========================================================================
    // Metrics Operations
    // =========================================================================

    fn record_metrics(
        &self,
        vm_id: &VmId,
        snapshot: &MetricsSnapshot,
        history_limit: usize,
    ) -> Result<bool> {
        let _guard = self.write_lock.lock();
        let cf_metrics = self.cf(cf::VM_METRICS)?;
        let cf_history = self.cf(cf::VM_METRICS_HISTORY)?;

        let running = self
            .get_vm(vm_id)?
            .is_some_and(|vm| vm.status == VmStatus::Running);
        if !running {
            return Ok(false);
        }

        let value = Self::serialize(snapshot)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_metrics, keys::id_key(vm_id), &value);

        if history_limit > 0 {
            let sampled_at = snapshot.sampled_at.unwrap_or_else(Utc::now);
            let millis = u64::try_from(sampled_at.timestamp_millis()).unwrap_or_default();
            let mut suffix = keys::seq_key(millis);
            suffix.extend_from_slice(&keys::seq_key(
                self.metrics_seq.fetch_add(1, Ordering::Relaxed),
            ));
            let history_key = keys::vm_scoped_key(vm_id, &suffix);

            let existing = self.scan_prefix(cf::VM_METRICS_HISTORY, &keys::vm_prefix(vm_id))?;
            let excess = (existing.len() + 1).saturating_sub(history_limit);
            for (key, _) in existing.iter().take(excess) {
                batch.delete_cf(&cf_history, key);
            }
            batch.put_cf(&cf_history, history_key, &value);
        }

        self.db.write(batch)?;

        Ok(true)
    }

    fn get_metrics(&self, vm_id: &VmId) -> Result<Option<MetricsSnapshot>> {
        self.get_value(cf::VM_METRICS, &keys::id_key(vm_id))
    }

    fn list_metrics_history(&self, vm_id: &VmId, limit: usize) -> Result<Vec<MetricsSnapshot>> {
        let prefix = keys::vm_prefix(vm_id);
        let mut samples = self
            .scan_prefix_rev(cf::VM_METRICS_HISTORY, &prefix, Some(limit))?
            .into_iter()
            .map(|(_, value)| Self::deserialize(&value))
            .collect::<Result<Vec<MetricsSnapshot>>>()?;
        samples.reverse();
        Ok(samples)
    }

    // =========================================================================
    // VM Log Operations
    // =========================================================================

    fn append_vm_log(&self, vm_id: &VmId, line: &VmLogLine) -> Result<()> {
        let cf_logs = self.cf(cf::VM_LOGS)?;

        let micros = u64::try_from(line.timestamp.timestamp_micros()).unwrap_or_default();
        let mut suffix = keys::seq_key(micros);
        suffix.extend_from_slice(&keys::seq_key(self.log_seq.fetch_add(1, Ordering::Relaxed)));

        self.db
            .put_cf(&cf_logs, keys::vm_scoped_key(vm_id, &suffix), Self::serialize(line)?)?;

        Ok(())
    }

    fn list_vm_logs(&self, vm_id: &VmId, tail: Option<usize>) -> Result<Vec<VmLogLine>> {
        let prefix = keys::vm_prefix(vm_id);
        let entries = match tail {
            Some(tail) => {
                let mut entries = self.scan_prefix_rev(cf::VM_LOGS, &prefix, Some(tail))?;
                entries.reverse();
                entries
            }
            None => self.scan_prefix(cf::VM_LOGS, &prefix)?,
        };

        entries
            .into_iter()
            .map(|(_, value)| Self::deserialize(&value))
            .collect()
    }

    // =========================================================================
    // Audit History Operations
    // =========================================================================

    fn append_history(&self, entry: NewHistoricEntry) -> Result<HistoricEntry> {
        let cf_history = self.cf(cf::HISTORY)?;
        let cf_by_vm = self.cf(cf::HISTORY_BY_VM)?;
        let cf_by_user = self.cf(cf::HISTORY_BY_USER)?;

        let seq = self.history_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let entry = HistoricEntry {
            id: seq,
            virtual_machine_id: entry.virtual_machine_id,
            vm_name: entry.vm_name,
            user_id: entry.user_id,
            actor_id: entry.actor_id,
            action: entry.action,
            status: entry.status,
            details: entry.details,
            created_at: Utc::now(),
        };

        let seq_key = keys::seq_key(seq);
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_history, &seq_key, Self::serialize(&entry)?);
        batch.put_cf(
            &cf_by_vm,
            keys::vm_scoped_key(&entry.virtual_machine_id, &seq_key),
            [],
        );
        batch.put_cf(&cf_by_user, keys::user_scoped_key(entry.user_id, &seq_key), []);

        self.db.write(batch)?;

        Ok(entry)
    }

    fn query_history(&self, query: &HistoryQuery) -> Result<HistoryPage> {
        let page = query.page.max(1);
        let per_page = query.per_page.max(1);

        // Narrowest index first; every source yields newest first.
        let candidates = if let Some(vm_id) = &query.vm_id {
            let index = self.scan_prefix_rev(cf::HISTORY_BY_VM, &keys::vm_prefix(vm_id), None)?;
            self.load_history(index)?
        } else if let Some(user_id) = query.user_id {
            let index =
                self.scan_prefix_rev(cf::HISTORY_BY_USER, &keys::user_prefix(user_id), None)?;
            self.load_history(index)?
        } else {
            let mut entries: Vec<HistoricEntry> = self.list_values(cf::HISTORY)?;
            entries.reverse();
            entries
        };

        let matching: Vec<HistoricEntry> = candidates
            .into_iter()
            .filter(|entry| query.matches(entry))
            .collect();

        let total = matching.len() as u64;
        let skip = (page as usize - 1).saturating_mul(per_page as usize);
        let entries = matching
            .into_iter()
            .skip(skip)
            .take(per_page as usize)
            .collect();

        Ok(HistoryPage {
            entries,
            total,
            page,
            per_page,
        })
    }

    // =========================================================================
    // User Operations
    // =========================================================================

    fn create_user(&self, user: NewUser) -> Result<User> {
        let _guard = self.write_lock.lock();
        let cf_users = self.cf(cf::USERS)?;
        let cf_by_email = self.cf(cf::USERS_BY_EMAIL)?;

        let email_key = user.email.to_lowercase().into_bytes();
        if self.db.get_cf(&cf_by_email, &email_key)?.is_some() {
            return Err(StoreError::Conflict(format!(
                "email '{}' is already registered",
                user.email
            )));
        }

        let now = Utc::now();
        let user = User {
            user_id: UserId::new(self.next_user_id.fetch_add(1, Ordering::SeqCst)),
            username: user.username,
            email: user.email,
            role: user.role,
            created_at: now,
            updated_at: now,
        };

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_users, keys::user_key(user.user_id), Self::serialize(&user)?);
        batch.put_cf(&cf_by_email, &email_key, user.user_id.to_be_bytes());
        self.db.write(batch)?;

        Ok(user)
    }

    fn update_user(&self, user: &User) -> Result<()> {
        let _guard = self.write_lock.lock();
        let cf_users = self.cf(cf::USERS)?;
        let cf_by_email = self.cf(cf::USERS_BY_EMAIL)?;

        let existing = self.get_user(user.user_id)?.ok_or(StoreError::NotFound)?;

        let mut batch = WriteBatch::default();
        let old_email = existing.email.to_lowercase();
        let new_email = user.email.to_lowercase();
        if old_email != new_email {
            if self.db.get_cf(&cf_by_email, new_email.as_bytes())?.is_some() {
                return Err(StoreError::Conflict(format!(
                    "email '{}' is already registered",
                    user.email
                )));
            }
            batch.delete_cf(&cf_by_email, old_email.as_bytes());
            batch.put_cf(&cf_by_email, new_email.as_bytes(), user.user_id.to_be_bytes());
        }
        batch.put_cf(&cf_users, keys::user_key(user.user_id), Self::serialize(user)?);

        self.db.write(batch)?;

        Ok(())
    }

    fn get_user(&self, user_id: UserId) -> Result<Option<User>> {
        self.get_value(cf::USERS, &keys::user_key(user_id))
    }

    fn delete_user(&self, user_id: UserId) -> Result<()> {
        let _guard = self.write_lock.lock();
        let cf_users = self.cf(cf::USERS)?;
        let cf_by_email = self.cf(cf::USERS_BY_EMAIL)?;

        let user = self.get_user(user_id)?.ok_or(StoreError::NotFound)?;

        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf_users, keys::user_key(user_id));
        batch.delete_cf(&cf_by_email, user.email.to_lowercase().as_bytes());
        self.db.write(batch)?;

        Ok(())
    }

    fn list_users(&self) -> Result<Vec<User>> {
        self.list_values(cf::USERS)
    }

    // =========================================================================
    // Catalog Operations
    // =========================================================================

    fn put_image(&self, image: &SystemImage) -> Result<()> {
        let _guard = self.write_lock.lock();
        let cf = self.cf(cf::SYSTEM_IMAGES)?;

        let images: Vec<SystemImage> = self.list_values(cf::SYSTEM_IMAGES)?;
        let duplicate = images.iter().any(|other| {
            other.image_id != image.image_id
                && other.name == image.name
                && other.version == image.version
        });
        if duplicate {
            return Err(StoreError::Conflict(format!(
                "image {}-{} already exists",
                image.name, image.version
            )));
        }

        self.db
            .put_cf(&cf, keys::id_key(&image.image_id), Self::serialize(image)?)?;

        Ok(())
    }

    fn get_image(&self, image_id: &ImageId) -> Result<Option<SystemImage>> {
        self.get_value(cf::SYSTEM_IMAGES, &keys::id_key(image_id))
    }

    fn delete_image(&self, image_id: &ImageId) -> Result<()> {
        let _guard = self.write_lock.lock();
        let cf = self.cf(cf::SYSTEM_IMAGES)?;
        let key = keys::id_key(image_id);

        if self.db.get_cf(&cf, &key)?.is_none() {
            return Err(StoreError::NotFound);
        }
        self.db.delete_cf(&cf, &key)?;

        Ok(())
    }

    fn list_images(&self) -> Result<Vec<SystemImage>> {
        self.list_values(cf::SYSTEM_IMAGES)
    }

    fn put_offer(&self, offer: &VmOffer) -> Result<()> {
        let _guard = self.write_lock.lock();
        let cf = self.cf(cf::VM_OFFERS)?;

        let offers: Vec<VmOffer> = self.list_values(cf::VM_OFFERS)?;
        let duplicate = offers
            .iter()
            .any(|other| other.offer_id != offer.offer_id && other.name == offer.name);
        if duplicate {
            return Err(StoreError::Conflict(format!(
                "offer '{}' already exists",
                offer.name
            )));
        }

        self.db
            .put_cf(&cf, keys::id_key(&offer.offer_id), Self::serialize(offer)?)?;

        Ok(())
    }

    fn get_offer(&self, offer_id: &OfferId) -> Result<Option<VmOffer>> {
        self.get_value(cf::VM_OFFERS, &keys::id_key(offer_id))
    }

    fn delete_offer(&self, offer_id: &OfferId) -> Result<()> {
        let _guard = self.write_lock.lock();
        let cf = self.cf(cf::VM_OFFERS)?;
        let key = keys::id_key(offer_id);

        if self.db.get_cf(&cf, &key)?.is_none() {
            return Err(StoreError::NotFound);
        }
        self.db.delete_cf(&cf, &key)?;

        Ok(())
    }

    fn list_offers(&self) -> Result<Vec<VmOffer>> {
        self.list_values(cf::VM_OFFERS)
    }

    // =========================================================================
    // SSH Key Operations
    // =========================================================================

    fn put_ssh_key(&self, key: &SshKey) -> Result<()> {
        let _guard = self.write_lock.lock();
        let cf_keys = self.cf(cf::SSH_KEYS)?;
        let cf_by_user = self.cf(cf::SSH_KEYS_BY_USER)?;
        let cf_fingerprints = self.cf(cf::SSH_KEY_FINGERPRINTS)?;

        let holder = self.db.get_cf(&cf_fingerprints, key.fingerprint.as_bytes())?;
        if holder.is_some_and(|id| id.as_slice() != key.key_id.as_bytes().as_slice()) {
            return Err(StoreError::Conflict(format!(
                "SSH key {} is already registered",
                key.fingerprint
            )));
        }

        let mut batch = WriteBatch::default();
        if let Some(existing) = self.get_ssh_key(&key.key_id)? {
            if existing.fingerprint != key.fingerprint {
                batch.delete_cf(&cf_fingerprints, existing.fingerprint.as_bytes());
            }
        }
        batch.put_cf(&cf_keys, keys::id_key(&key.key_id), Self::serialize(key)?);
        batch.put_cf(
            &cf_by_user,
            keys::user_scoped_key(key.user_id, key.key_id.as_bytes()),
            [],
        );
        batch.put_cf(&cf_fingerprints, key.fingerprint.as_bytes(), key.key_id.as_bytes());

        self.db.write(batch)?;

        Ok(())
    }

    fn get_ssh_key(&self, key_id: &SshKeyId) -> Result<Option<SshKey>> {
        self.get_value(cf::SSH_KEYS, &keys::id_key(key_id))
    }

    fn get_ssh_key_by_fingerprint(&self, fingerprint: &str) -> Result<Option<SshKey>> {
        let cf = self.cf(cf::SSH_KEY_FINGERPRINTS)?;
        let Some(id) = self.db.get_cf(&cf, fingerprint.as_bytes())? else {
            return Ok(None);
        };
        let Ok(bytes) = <[u8; 16]>::try_from(id.as_slice()) else {
            return Err(StoreError::Database(format!(
                "malformed fingerprint index entry for {fingerprint}"
            )));
        };
        self.get_ssh_key(&SshKeyId::from_bytes(bytes))
    }

    fn delete_ssh_key(&self, key_id: &SshKeyId) -> Result<()> {
        let _guard = self.write_lock.lock();
        let cf_keys = self.cf(cf::SSH_KEYS)?;
        let cf_by_user = self.cf(cf::SSH_KEYS_BY_USER)?;
        let cf_fingerprints = self.cf(cf::SSH_KEY_FINGERPRINTS)?;

        let key = self.get_ssh_key(key_id)?.ok_or(StoreError::NotFound)?;

        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf_keys, keys::id_key(key_id));
        batch.delete_cf(&cf_by_user, keys::user_scoped_key(key.user_id, key_id.as_bytes()));
        batch.delete_cf(&cf_fingerprints, key.fingerprint.as_bytes());
        self.db.write(batch)?;

        Ok(())
    }

    fn list_ssh_keys_by_user(&self, user_id: UserId) -> Result<Vec<SshKey>> {
        let prefix = keys::user_prefix(user_id);
        let mut ssh_keys = Vec::new();
        for (key, _) in self.scan_prefix(cf::SSH_KEYS_BY_USER, &prefix)? {
            let Some(bytes) = keys::extract_uuid_after_user(&key) else {
                continue;
            };
            if let Some(ssh_key) = self.get_ssh_key(&SshKeyId::from_bytes(bytes))? {
                ssh_keys.push(ssh_key);
            }
        }
        Ok(ssh_keys)
    }
}
