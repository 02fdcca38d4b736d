//! Control plane for flarevm virtual machine lifecycle management.
//!
//! This crate provides the core business logic for managing Firecracker VMs:
//! the lifecycle state machine, network leases, the catalog of images and
//! offers, accounts and SSH keys, the audit history and metrics sampling.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Gateway (HTTP/WS)                       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    ControlPlaneService                      │
//! │  ┌─────────────┐ ┌─────────────┐ ┌─────────────────────┐    │
//! │  │  VM CRUD    │ │  Catalog &  │ │    Lifecycle        │    │
//! │  │  + Audit    │ │  Accounts   │ │    State Machine    │    │
//! │  └─────────────┘ └─────────────┘ └─────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!               ┌──────────────┼──────────────┐
//!               ▼              ▼              ▼
//!        ┌──────────┐   ┌──────────┐   ┌────────────┐
//!        │  Store   │   │ Metrics  │   │ Hypervisor │
//!        │ (RocksDB)│   │ Sampler  │   │   (HTTP)   │
//!        └──────────┘   └──────────┘   └────────────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use flarevm_control::{Actor, ControlPlane, ControlPlaneService, CreateVmRequest, NoopHypervisor};
//! use flarevm_store::RocksStore;
//! use flarevm_core::UserId;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(RocksStore::open("/tmp/flarevm")?);
//! let control = ControlPlaneService::with_defaults(store, Arc::new(NoopHypervisor::new()));
//!
//! let actor = Actor::user(UserId::new(42));
//! let request = CreateVmRequest::new("web-1", "standard", "ubuntu-22.04");
//! let vm = control.create_vm(&actor, request).await?;
//!
//! println!("Created VM: {} ({})", vm.vm_id, vm.network.ip_address);
//! # Ok(())
//! # }
//! ```
//!
//! # State Machine
//!
//! VMs follow a strict state machine:
//!
//! - `Creating` → `Running` or `Error`
//! - `Running` → `Stopping` or `Pausing`
//! - `Stopping` → `Stopped`; `Stopped` → `Starting` → `Running`
//! - `Pausing` → `Paused`; `Paused` → `Running` (resume)
//! - any transient status → `Error`
//!
//! Only `Stopped` and `Error` VMs can be deleted. See the [`lifecycle`]
//! module for transition validation helpers.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod accounts;
pub mod audit;
pub mod catalog;
pub mod console;
pub mod dashboard;
pub mod error;
pub mod events;
pub mod hypervisor;
pub mod lifecycle;
pub mod metrics;
pub mod network;
pub mod ops;
pub mod retry;
pub mod service;
pub mod types;

pub use audit::AuditLog;
pub use console::{ConsoleChannel, ConsoleConnector, ConsoleError, ConsoleInput, WsConsoleConnector};
pub use error::{ControlError, Result};
pub use events::{StatusEvents, VmEvent};
pub use hypervisor::{
    HttpHypervisorClient, Hypervisor, HypervisorError, MachineSpec, NoopHypervisor, VmCounters,
};
pub use metrics::{MetricsCollector, SampleReport};
pub use service::{ControlPlane, ControlPlaneService};
pub use types::{
    ControlConfig, CreateImageRequest, CreateOfferRequest, CreateSshKeyRequest, CreateUserRequest,
    CreateVmRequest, Dashboard, MetricsConfig, NetworkConfig, RetryPolicy, SshAuthRequest,
    SshAuthResponse, UpdateImageRequest, UpdateOfferRequest, UpdateSshKeyRequest,
    UpdateUserRequest, UpdateVmRequest,
};

// Re-export commonly used types from dependencies for convenience
pub use flarevm_core::{Actor, ImageId, OfferId, Role, SshKeyId, UserId, VmId};
pub use flarevm_store::{
    HistoricEntry, HistoryAction, HistoryPage, HistoryQuery, HistoryStatus, LogLevel,
    MetricsSnapshot, SshKey, SystemImage, User, Vm, VmLogLine, VmOffer, VmStatus,
};
