//! VM lifecycle state machine.
//!
//! This module defines the valid status transitions for VMs and maps each
//! user action onto the transition it drives.
//!
//! # State Machine
//!
//! ```text
//!     ┌──────────┐
//!     │ Creating │───────────────────────────────┐
//!     └────┬─────┘                               │
//!          │ (provisioned)                       │
//!          ▼                                     │
//!     ┌──────────┐  (pause)  ┌─────────┐        │
//!  ┌─▶│ Running  │──────────▶│ Pausing │───┐    │
//!  │  └────┬─────┘           └────┬────┘   │    │
//!  │       │ (stop)               ▼        │    │
//!  │       │                 ┌─────────┐   │    │
//!  │◀──────┼─────(resume)────│ Paused  │───┤    │
//!  │       ▼                 └─────────┘   │    │
//!  │  ┌──────────┐                         │    │
//!  │  │ Stopping │─────────────────────────┤    │
//!  │  └────┬─────┘                         │    │
//!  │       ▼                               ▼    ▼
//!  │  ┌──────────┐   (start)  ┌──────────┐ ┌─────────┐
//!  │  │ Stopped  │───────────▶│ Starting │▶│  Error  │
//!  │  └──────────┘            └────┬─────┘ └─────────┘
//!  └───────────────────────────────┘
//! ```
//!
//! Every non-terminal status may fall to `Error` when the hypervisor fails.
//! `Stopped` and `Error` are the only statuses a VM can be deleted from.

use flarevm_core::VmId;
use flarevm_store::{HistoryAction, VmStatus};

use crate::error::{ControlError, Result};

/// The status path an action drives a VM through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// Status the VM must be in for the action to start.
    pub from: VmStatus,
    /// Status held while the hypervisor call is in flight.
    pub transient: VmStatus,
    /// Status reached when the hypervisor call succeeds.
    pub target: VmStatus,
}

/// Validates a status transition and returns the target status if valid.
///
/// # Errors
///
/// Returns `ControlError::Internal` if the transition is not allowed. A
/// rejected transition here means the controller itself is wrong, not the
/// caller.
pub fn validate_transition(vm_id: &VmId, from: VmStatus, to: VmStatus) -> Result<VmStatus> {
    if is_valid_transition(from, to) {
        Ok(to)
    } else {
        Err(ControlError::Internal(format!(
            "illegal status transition for VM {vm_id}: {} -> {}",
            from.as_str(),
            to.as_str()
        )))
    }
}

/// Check if a status transition is valid according to the state machine.
#[must_use]
pub const fn is_valid_transition(from: VmStatus, to: VmStatus) -> bool {
    use VmStatus::{Creating, Error, Paused, Pausing, Running, Starting, Stopped, Stopping};

    matches!(
        (from, to),
        // Provisioning and boot both end in Running
        (Creating | Starting | Paused, Running)
            // Any non-terminal status can fail
            | (Creating | Running | Starting | Stopping | Pausing | Paused, Error)
            | (Running, Stopping | Pausing)
            | (Stopping, Stopped)
            | (Stopped, Starting)
            | (Pausing, Paused)
    )
}

/// The transition `action` drives from `from`, if the action is allowed there.
///
/// `Create`, `Update` and `Delete` don't move a VM through a transient
/// status and have no transition.
#[must_use]
pub const fn transition_for(action: HistoryAction, from: VmStatus) -> Option<Transition> {
    use VmStatus::{Paused, Pausing, Running, Starting, Stopped, Stopping};

    let (transient, target) = match (action, from) {
        (HistoryAction::Start, Stopped) => (Starting, Running),
        (HistoryAction::Stop, Running) => (Stopping, Stopped),
        (HistoryAction::Pause, Running) => (Pausing, Paused),
        // Resume has no transient status; the VM stays paused until the
        // hypervisor confirms.
        (HistoryAction::Resume, Paused) => (Paused, Running),
        _ => return None,
    };

    Some(Transition {
        from,
        transient,
        target,
    })
}

/// Validates that `action` may run on a VM in `from`.
///
/// # Errors
///
/// Returns `ControlError::InvalidStateTransition` if it may not.
pub fn validate_action(vm_id: &VmId, from: VmStatus, action: HistoryAction) -> Result<Transition> {
    transition_for(action, from).ok_or(ControlError::InvalidStateTransition {
        vm_id: *vm_id,
        from,
        action,
    })
}

/// The transition provisioning drives a new VM through.
#[must_use]
pub const fn provisioning() -> Transition {
    Transition {
        from: VmStatus::Creating,
        transient: VmStatus::Creating,
        target: VmStatus::Running,
    }
}

/// Returns true if a stop request is already satisfied.
#[must_use]
pub const fn is_stop_noop(status: VmStatus) -> bool {
    matches!(status, VmStatus::Stopped | VmStatus::Stopping)
}

/// Returns true if the VM can be deleted.
#[must_use]
pub const fn can_delete(status: VmStatus) -> bool {
    matches!(status, VmStatus::Stopped | VmStatus::Error)
}

/// The action that was in flight when a VM was left in a transient status.
#[must_use]
pub const fn interrupted_action(status: VmStatus) -> Option<HistoryAction> {
    match status {
        VmStatus::Creating => Some(HistoryAction::Create),
        VmStatus::Starting => Some(HistoryAction::Start),
        VmStatus::Stopping => Some(HistoryAction::Stop),
        VmStatus::Pausing => Some(HistoryAction::Pause),
        _ => None,
    }
}
