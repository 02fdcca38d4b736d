//! Error types for the control plane.
//!
//! This module defines all errors that can occur during VM lifecycle,
//! catalog and account operations.

use flarevm_core::{SshKeyId, UserId, VmId};
use flarevm_store::{HistoryAction, StoreError, VmStatus};
use thiserror::Error;

use crate::hypervisor::HypervisorError;

/// A result type using `ControlError`.
pub type Result<T> = std::result::Result<T, ControlError>;

/// Errors that can occur in control plane operations.
#[derive(Debug, Error)]
pub enum ControlError {
    /// The request payload is invalid or describes an impossible VM.
    #[error("invalid request: {0}")]
    InvalidSpec(String),

    /// The requested action is not valid for the VM's current status.
    #[error("cannot {} VM {vm_id} while it is {}", .action.as_str(), .from.as_str())]
    InvalidStateTransition {
        /// The VM being acted on.
        vm_id: VmId,
        /// The current status.
        from: VmStatus,
        /// The rejected action.
        action: HistoryAction,
    },

    /// No network identity is available.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The requested VM was not found.
    #[error("VM not found: {0}")]
    VmNotFound(VmId),

    /// The requested user was not found.
    #[error("user not found: {0}")]
    UserNotFound(UserId),

    /// The requested system image was not found.
    #[error("system image not found: {0}")]
    ImageNotFound(String),

    /// The requested VM offer was not found.
    #[error("VM offer not found: {0}")]
    OfferNotFound(String),

    /// The requested SSH key was not found.
    #[error("SSH key not found: {0}")]
    SshKeyNotFound(String),

    /// A uniqueness constraint failed or another operation is in flight.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The caller's role does not permit the operation.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// The user is not the owner of the requested VM.
    #[error("user {user_id} is not the owner of VM {vm_id}")]
    NotOwner {
        /// The user making the request.
        user_id: UserId,
        /// The VM being accessed.
        vm_id: VmId,
    },

    /// The user has reached their VM quota limit.
    #[error("VM quota exceeded for user {user_id}: limit is {limit}")]
    QuotaExceeded {
        /// The user who exceeded the quota.
        user_id: UserId,
        /// The maximum number of VMs allowed.
        limit: u32,
    },

    /// The hypervisor rejected or failed the operation.
    #[error("hypervisor error: {0}")]
    Hypervisor(HypervisorError),

    /// The hypervisor did not answer in time.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Storage layer error.
    #[error("storage error: {0}")]
    Store(StoreError),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ControlError {
    /// Returns the appropriate HTTP status code for this error.
    #[must_use]
    pub const fn http_status_code(&self) -> u16 {
        match self {
            Self::InvalidSpec(_) => 400,
            Self::Forbidden(_) | Self::NotOwner { .. } => 403,
            Self::VmNotFound(_)
            | Self::UserNotFound(_)
            | Self::ImageNotFound(_)
            | Self::OfferNotFound(_)
            | Self::SshKeyNotFound(_) => 404,
            Self::InvalidStateTransition { .. } | Self::Conflict(_) => 409,
            Self::QuotaExceeded { .. } => 429,
            Self::Hypervisor(_) => 502,
            Self::Timeout(_) => 504,
            Self::ResourceExhausted(_) => 507,
            Self::Store(_) | Self::Internal(_) => 500,
        }
    }

    /// Machine-readable error code for API responses.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidSpec(_) => "invalid_spec",
            Self::InvalidStateTransition { .. } => "invalid_state_transition",
            Self::ResourceExhausted(_) => "resource_exhausted",
            Self::VmNotFound(_)
            | Self::UserNotFound(_)
            | Self::ImageNotFound(_)
            | Self::OfferNotFound(_)
            | Self::SshKeyNotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::Forbidden(_) | Self::NotOwner { .. } => "forbidden",
            Self::QuotaExceeded { .. } => "quota_exceeded",
            Self::Hypervisor(_) => "hypervisor_error",
            Self::Timeout(_) => "timeout",
            Self::Store(_) | Self::Internal(_) => "internal_error",
        }
    }

    /// Returns true if this error might be resolved by retrying.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::Conflict(_) | Self::Timeout(_) | Self::Store(_) | Self::Internal(_)
        )
    }

    pub(crate) fn ssh_key_not_found(key_id: &SshKeyId) -> Self {
        Self::SshKeyNotFound(key_id.to_string())
    }
}

impl From<StoreError> for ControlError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Conflict(message) => Self::Conflict(message),
            other => Self::Store(other),
        }
    }
}

impl From<HypervisorError> for ControlError {
    fn from(e: HypervisorError) -> Self {
        match e {
            HypervisorError::Timeout(after) => {
                Self::Timeout(format!("hypervisor did not answer within {after:?}"))
            }
            other => Self::Hypervisor(other),
        }
    }
}
