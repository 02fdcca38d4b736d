//! Key encoding utilities for `RocksDB`.
//!
//! This module provides functions to encode and decode keys for various indexes.
//! All keys are designed to support efficient prefix scans; integers are
//! big-endian so that byte order matches numeric order.

use flarevm_core::{UserId, VmId};

/// Length of a UUID-backed identifier in key bytes.
pub const UUID_LEN: usize = 16;

/// Length of a numeric identifier or sequence in key bytes.
pub const U64_LEN: usize = 8;

/// Encode a key made of a 16-byte identifier.
#[must_use]
pub fn id_key(id: &impl AsRef<[u8]>) -> Vec<u8> {
    id.as_ref().to_vec()
}

/// Encode a user key.
#[must_use]
pub fn user_key(user_id: UserId) -> Vec<u8> {
    user_id.to_be_bytes().to_vec()
}

/// Encode a sequence key.
#[must_use]
pub fn seq_key(seq: u64) -> Vec<u8> {
    seq.to_be_bytes().to_vec()
}

/// Decode a sequence key.
#[must_use]
pub fn decode_seq(key: &[u8]) -> Option<u64> {
    let bytes: [u8; U64_LEN] = key.get(..U64_LEN)?.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

/// Encode a user-scoped index key: `user_id || id`.
///
/// This allows efficient prefix scans for everything a user owns.
#[must_use]
pub fn user_scoped_key(user_id: UserId, id: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(U64_LEN + id.len());
    key.extend_from_slice(&user_id.to_be_bytes());
    key.extend_from_slice(id);
    key
}

/// Encode a user prefix for scanning user-scoped indexes.
#[must_use]
pub fn user_prefix(user_id: UserId) -> Vec<u8> {
    user_id.to_be_bytes().to_vec()
}

/// Extract the trailing 16-byte identifier from a `user_id || id` key.
#[must_use]
pub fn extract_uuid_after_user(key: &[u8]) -> Option<[u8; UUID_LEN]> {
    key.get(U64_LEN..U64_LEN + UUID_LEN)?.try_into().ok()
}

/// Encode a VM name index key: `user_id || name`.
#[must_use]
pub fn vm_name_key(user_id: UserId, name: &str) -> Vec<u8> {
    user_scoped_key(user_id, name.as_bytes())
}

/// Encode a status-VM index key: `status || vm_id`.
///
/// This allows efficient prefix scans for all VMs with a given status.
#[must_use]
pub fn status_vm_key(status: u8, vm_id: &VmId) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + UUID_LEN);
    key.push(status);
    key.extend_from_slice(vm_id.as_bytes());
    key
}

/// Encode a status prefix for scanning all VMs by status.
#[must_use]
pub fn status_prefix(status: u8) -> Vec<u8> {
    vec![status]
}

/// Extract the VM ID from a status-VM key.
#[must_use]
pub fn extract_vm_id_from_status_key(key: &[u8]) -> Option<VmId> {
    let bytes: [u8; UUID_LEN] = key.get(1..=UUID_LEN)?.try_into().ok()?;
    Some(VmId::from_bytes(bytes))
}

/// Encode a namespace prefix for scanning network leases: `namespace || 0x00`.
#[must_use]
pub fn lease_prefix(namespace: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(namespace.len() + 5);
    key.extend_from_slice(namespace.as_bytes());
    key.push(0);
    key
}

/// Encode a network lease key: `namespace || 0x00 || slot`.
#[must_use]
pub fn lease_key(namespace: &str, slot: u32) -> Vec<u8> {
    let mut key = lease_prefix(namespace);
    key.extend_from_slice(&slot.to_be_bytes());
    key
}

/// Extract the slot from a lease key scanned under `lease_prefix`.
#[must_use]
pub fn extract_slot(key: &[u8], prefix_len: usize) -> Option<u32> {
    let bytes: [u8; 4] = key.get(prefix_len..)?.try_into().ok()?;
    Some(u32::from_be_bytes(bytes))
}

/// Encode a VM-scoped key: `vm_id || suffix`.
///
/// Used by the metrics history, VM log and history-by-VM column families.
#[must_use]
pub fn vm_scoped_key(vm_id: &VmId, suffix: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(UUID_LEN + suffix.len());
    key.extend_from_slice(vm_id.as_bytes());
    key.extend_from_slice(suffix);
    key
}

/// Encode a VM prefix for scanning VM-scoped column families.
#[must_use]
pub fn vm_prefix(vm_id: &VmId) -> Vec<u8> {
    vm_id.as_bytes().to_vec()
}

/// Extract the trailing sequence from a `prefix || seq` key.
#[must_use]
pub fn extract_trailing_seq(key: &[u8]) -> Option<u64> {
    let start = key.len().checked_sub(U64_LEN)?;
    decode_seq(&key[start..])
}

/// Returns the smallest key strictly greater than every key starting with `prefix`.
///
/// Used as the seek target for reverse prefix scans. Returns `None` when the
/// prefix is all `0xff` bytes, in which case the scan starts from the end.
#[must_use]
pub fn prefix_upper_bound(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut bound = prefix.to_vec();
    while let Some(last) = bound.pop() {
        if last < u8::MAX {
            bound.push(last + 1);
            return Some(bound);
        }
    }
    None
}
