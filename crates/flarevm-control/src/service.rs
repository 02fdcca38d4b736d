//! Control plane service implementation.
//!
//! This module provides the `ControlPlane` trait and `ControlPlaneService`
//! implementation that coordinates VM lifecycles, the catalog, accounts and
//! the audit history.
//!
//! Lifecycle actions are validated and moved into their transient status on
//! the request path; the hypervisor call and the final transition run in a
//! spawned task that owns the VM's operation lock.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use flarevm_core::{Actor, ImageId, OfferId, SshKeyId, UserId, VmId};
use flarevm_store::{
    HistoryAction, HistoryPage, HistoryQuery, HistoryStatus, LogLevel, MetricsSnapshot,
    SshKey, Store, StoreError, SystemImage, User, Vm, VmLogLine, VmOffer, VmStatus,
};
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::accounts;
use crate::audit::AuditLog;
use crate::catalog;
use crate::dashboard;
use crate::error::{ControlError, Result};
use crate::events::{StatusEvents, VmEvent};
use crate::hypervisor::{Hypervisor, HypervisorError, MachineSpec};
use crate::lifecycle::{self, Transition};
use crate::metrics::MetricsCollector;
use crate::network;
use crate::ops::{OperationGuard, OperationLocks};
use crate::retry::with_retry;
use crate::types::{
    ControlConfig, CreateImageRequest, CreateOfferRequest, CreateSshKeyRequest, CreateUserRequest,
    CreateVmRequest, Dashboard, SshAuthRequest, SshAuthResponse, UpdateImageRequest,
    UpdateOfferRequest, UpdateSshKeyRequest, UpdateUserRequest, UpdateVmRequest,
};

/// Longest accepted VM name.
const MAX_NAME_LEN: usize = 63;

/// Trait defining the control plane operations.
///
/// Every operation takes the authenticated [`Actor`]; admins may act on any
/// VM, users only on their own.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    // =========================================================================
    // VM Operations
    // =========================================================================

    /// Create a VM and start provisioning it.
    ///
    /// Returns the VM in `creating`; provisioning continues in the
    /// background and ends in `running` or `error`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidSpec`, `OfferNotFound`/`ImageNotFound`,
    /// `QuotaExceeded`, `ResourceExhausted` or `Conflict` (duplicate name).
    async fn create_vm(&self, actor: &Actor, request: CreateVmRequest) -> Result<Vm>;

    /// Get a VM by ID, verifying access.
    ///
    /// # Errors
    ///
    /// Returns `VmNotFound` or `NotOwner`.
    async fn get_vm(&self, actor: &Actor, vm_id: &VmId) -> Result<Vm>;

    /// List the caller's VMs, or every VM for admins.
    async fn list_vms(&self, actor: &Actor) -> Result<Vec<Vm>>;

    /// Rename a VM or move a stopped VM to another offer.
    ///
    /// # Errors
    ///
    /// Returns `InvalidStateTransition` for an offer change outside
    /// `stopped`, `InvalidSpec` for an incompatible offer, or `Conflict`.
    async fn update_vm(&self, actor: &Actor, vm_id: &VmId, request: UpdateVmRequest) -> Result<Vm>;

    /// Destroy a stopped or failed VM and everything it holds.
    ///
    /// # Errors
    ///
    /// Returns `InvalidStateTransition` unless the VM is `stopped` or `error`.
    async fn delete_vm(&self, actor: &Actor, vm_id: &VmId) -> Result<Vm>;

    // =========================================================================
    // Lifecycle Operations
    // =========================================================================

    /// Boot a stopped VM. Returns the VM in `starting`.
    async fn start_vm(&self, actor: &Actor, vm_id: &VmId) -> Result<Vm>;

    /// Shut a running VM down. Returns the VM in `stopping`, or unchanged if
    /// it is already stopped or stopping.
    async fn stop_vm(&self, actor: &Actor, vm_id: &VmId) -> Result<Vm>;

    /// Pause a running VM. Returns the VM in `pausing`.
    async fn pause_vm(&self, actor: &Actor, vm_id: &VmId) -> Result<Vm>;

    /// Resume a paused VM. Returns the VM still `paused`; it becomes
    /// `running` once the hypervisor confirms.
    async fn resume_vm(&self, actor: &Actor, vm_id: &VmId) -> Result<Vm>;

    /// Lifecycle log lines of a VM, optionally only the last `tail`.
    async fn vm_logs(&self, actor: &Actor, vm_id: &VmId, tail: Option<usize>)
        -> Result<Vec<VmLogLine>>;

    /// Latest metrics of a VM; zeroed if never sampled.
    async fn vm_metrics(&self, actor: &Actor, vm_id: &VmId) -> Result<MetricsSnapshot>;

    /// Up to `limit` recent metrics samples, oldest first.
    async fn vm_metrics_history(
        &self,
        actor: &Actor,
        vm_id: &VmId,
        limit: usize,
    ) -> Result<Vec<MetricsSnapshot>>;

    /// Subscribe to VM status changes.
    fn subscribe(&self) -> broadcast::Receiver<VmEvent>;

    /// Move VMs left in a transient status by a previous process to `error`.
    ///
    /// Returns the number of VMs repaired.
    async fn reconcile(&self) -> Result<usize>;

    // =========================================================================
    // Users
    // =========================================================================

    /// List users (admin).
    async fn list_users(&self, actor: &Actor) -> Result<Vec<User>>;

    /// Get a user (admin or self).
    async fn get_user(&self, actor: &Actor, user_id: UserId) -> Result<User>;

    /// Create a user (admin).
    async fn create_user(&self, actor: &Actor, request: CreateUserRequest) -> Result<User>;

    /// Update a user (admin or self; role changes admin only).
    async fn update_user(
        &self,
        actor: &Actor,
        user_id: UserId,
        request: UpdateUserRequest,
    ) -> Result<User>;

    /// Delete a user who owns no VMs (admin).
    async fn delete_user(&self, actor: &Actor, user_id: UserId) -> Result<()>;

    // =========================================================================
    // Catalog
    // =========================================================================

    /// List system images.
    async fn list_images(&self, actor: &Actor) -> Result<Vec<SystemImage>>;

    /// Get a system image by ID or reference.
    async fn get_image(&self, actor: &Actor, reference: &str) -> Result<SystemImage>;

    /// Register a system image (admin).
    async fn create_image(&self, actor: &Actor, request: CreateImageRequest) -> Result<SystemImage>;

    /// Update an unreferenced system image (admin).
    async fn update_image(
        &self,
        actor: &Actor,
        image_id: &ImageId,
        request: UpdateImageRequest,
    ) -> Result<SystemImage>;

    /// Delete an unreferenced system image (admin).
    async fn delete_image(&self, actor: &Actor, image_id: &ImageId) -> Result<()>;

    /// List offers; non-admins only see active ones.
    async fn list_offers(&self, actor: &Actor) -> Result<Vec<VmOffer>>;

    /// Get an offer by ID or name.
    async fn get_offer(&self, actor: &Actor, reference: &str) -> Result<VmOffer>;

    /// Create an offer (admin).
    async fn create_offer(&self, actor: &Actor, request: CreateOfferRequest) -> Result<VmOffer>;

    /// Update an offer (admin).
    async fn update_offer(
        &self,
        actor: &Actor,
        offer_id: &OfferId,
        request: UpdateOfferRequest,
    ) -> Result<VmOffer>;

    /// Delete an unreferenced offer (admin).
    async fn delete_offer(&self, actor: &Actor, offer_id: &OfferId) -> Result<()>;

    // =========================================================================
    // SSH Keys
    // =========================================================================

    /// List the caller's SSH keys.
    async fn list_ssh_keys(&self, actor: &Actor) -> Result<Vec<SshKey>>;

    /// Get an SSH key.
    async fn get_ssh_key(&self, actor: &Actor, key_id: &SshKeyId) -> Result<SshKey>;

    /// Register an SSH key for the caller.
    async fn create_ssh_key(&self, actor: &Actor, request: CreateSshKeyRequest) -> Result<SshKey>;

    /// Rename an SSH key.
    async fn update_ssh_key(
        &self,
        actor: &Actor,
        key_id: &SshKeyId,
        request: UpdateSshKeyRequest,
    ) -> Result<SshKey>;

    /// Delete an SSH key.
    async fn delete_ssh_key(&self, actor: &Actor, key_id: &SshKeyId) -> Result<()>;

    /// Check a key presented to a VM's SSH daemon.
    async fn authenticate_ssh_key(&self, request: SshAuthRequest) -> Result<SshAuthResponse>;

    // =========================================================================
    // Admin
    // =========================================================================

    /// Query the audit history (admin).
    async fn query_history(&self, actor: &Actor, query: HistoryQuery) -> Result<HistoryPage>;

    /// Dashboard statistics (admin).
    async fn dashboard(&self, actor: &Actor) -> Result<Dashboard>;
}

/// A hypervisor call driven by a lifecycle action.
enum HypervisorCall {
    Provision(Box<MachineSpec>),
    Start,
    Stop,
    Pause,
    Resume,
}

impl HypervisorCall {
    const fn action(&self) -> HistoryAction {
        match self {
            Self::Provision(_) => HistoryAction::Create,
            Self::Start => HistoryAction::Start,
            Self::Stop => HistoryAction::Stop,
            Self::Pause => HistoryAction::Pause,
            Self::Resume => HistoryAction::Resume,
        }
    }

    const fn completed(&self) -> &'static str {
        match self {
            Self::Provision(_) => "VM provisioned",
            Self::Start => "VM started",
            Self::Stop => "VM stopped",
            Self::Pause => "VM paused",
            Self::Resume => "VM resumed",
        }
    }

    const fn accepted(&self) -> &'static str {
        match self {
            Self::Provision(_) => "Provisioning VM",
            Self::Start => "Starting VM",
            Self::Stop => "Stopping VM",
            Self::Pause => "Pausing VM",
            Self::Resume => "Resuming VM",
        }
    }
}

/// Check a VM name: 1-63 characters of `[A-Za-z0-9._-]`, starting with a
/// letter or digit.
fn validate_vm_name(name: &str) -> Result<String> {
    let name = name.trim();
    let valid = !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name.starts_with(|c: char| c.is_ascii_alphanumeric())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));

    if valid {
        Ok(name.to_string())
    } else {
        Err(ControlError::InvalidSpec(format!(
            "invalid VM name {name:?}: use 1-{MAX_NAME_LEN} letters, digits, '.', '_' or '-'"
        )))
    }
}

/// The main control plane service implementation.
pub struct ControlPlaneService<S: Store, H: Hypervisor> {
    store: Arc<S>,
    hypervisor: Arc<H>,
    config: Arc<ControlConfig>,
    locks: OperationLocks,
    audit: Arc<AuditLog<S>>,
    events: StatusEvents,
    create_lock: Arc<Mutex<()>>,
}

impl<S: Store, H: Hypervisor> Clone for ControlPlaneService<S, H> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            hypervisor: Arc::clone(&self.hypervisor),
            config: Arc::clone(&self.config),
            locks: self.locks.clone(),
            audit: Arc::clone(&self.audit),
            events: self.events.clone(),
            create_lock: Arc::clone(&self.create_lock),
        }
    }
}

impl<S: Store + 'static, H: Hypervisor + 'static> ControlPlaneService<S, H> {
    /// Create a new control plane service.
    #[must_use]
    pub fn new(store: Arc<S>, hypervisor: Arc<H>, config: ControlConfig) -> Self {
        let events = StatusEvents::new(config.event_capacity);
        Self {
            audit: Arc::new(AuditLog::new(Arc::clone(&store))),
            store,
            hypervisor,
            config: Arc::new(config),
            locks: OperationLocks::new(),
            events,
            create_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Create with default configuration.
    #[must_use]
    pub fn with_defaults(store: Arc<S>, hypervisor: Arc<H>) -> Self {
        Self::new(store, hypervisor, ControlConfig::default())
    }

    /// Get a reference to the store.
    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Get a reference to the hypervisor.
    #[must_use]
    pub fn hypervisor(&self) -> &H {
        &self.hypervisor
    }

    /// Get the configuration.
    #[must_use]
    pub fn config(&self) -> &ControlConfig {
        &self.config
    }

    /// Get the audit log.
    #[must_use]
    pub fn audit(&self) -> &AuditLog<S> {
        &self.audit
    }

    /// Build a metrics collector sharing this service's store and hypervisor.
    #[must_use]
    pub fn metrics_collector(&self) -> MetricsCollector<S, H> {
        MetricsCollector::new(
            Arc::clone(&self.store),
            Arc::clone(&self.hypervisor),
            self.config.metrics.clone(),
        )
    }

    /// Verify that the actor may act on the given VM.
    fn verify_access(actor: &Actor, vm: &Vm) -> Result<()> {
        if !actor.can_access(vm.user_id) {
            return Err(ControlError::NotOwner {
                user_id: actor.user_id,
                vm_id: vm.vm_id,
            });
        }
        Ok(())
    }

    /// Get a VM and verify access.
    fn get_and_verify(&self, actor: &Actor, vm_id: &VmId) -> Result<Vm> {
        let vm = self
            .store
            .get_vm(vm_id)?
            .ok_or(ControlError::VmNotFound(*vm_id))?;

        Self::verify_access(actor, &vm)?;
        Ok(vm)
    }

    fn busy(vm_id: &VmId) -> ControlError {
        ControlError::Conflict(format!("another operation is in progress for VM {vm_id}"))
    }

    fn log_vm(&self, vm_id: &VmId, level: LogLevel, message: impl Into<String>) {
        let line = VmLogLine {
            timestamp: Utc::now(),
            level,
            message: message.into(),
        };
        if let Err(e) = self.store.append_vm_log(vm_id, &line) {
            tracing::warn!(vm_id = %vm_id, error = %e, "Failed to append VM log line");
        }
    }

    /// Destroy a VM's hypervisor resources, then remove its record.
    async fn destroy_and_remove(
        self,
        vm: Vm,
        actor_id: UserId,
        _guard: OperationGuard,
    ) -> Result<Vm> {
        let vm_id = vm.vm_id;
        let id = &vm_id;
        let hv = &*self.hypervisor;
        let destroyed = with_retry(
            &self.config.retry,
            self.config.hypervisor_timeout,
            id,
            "destroy",
            move || hv.destroy(id),
        )
        .await;

        if let Err(e) = destroyed {
            let error = ControlError::from(e);
            let details = format!("delete failed: {error}");
            tracing::warn!(vm_id = %vm_id, error = %error, "Failed to destroy VM");
            self.log_vm(&vm_id, LogLevel::Error, details.as_str());
            self.audit.record(
                &vm,
                Some(actor_id),
                HistoryAction::Delete,
                HistoryStatus::Error,
                details,
            );
            return Err(error);
        }

        let deleted = match self
            .store
            .delete_vm(&vm_id, &[VmStatus::Stopped, VmStatus::Error])
        {
            Ok(vm) => vm,
            Err(StoreError::NotFound) => return Err(ControlError::VmNotFound(vm_id)),
            Err(e) => return Err(e.into()),
        };

        tracing::info!(vm_id = %vm_id, actor_id = %actor_id, "Deleted VM");
        self.audit.record(
            &deleted,
            Some(actor_id),
            HistoryAction::Delete,
            HistoryStatus::Success,
            "VM deleted",
        );
        self.events.publish(vm_id, None);

        Ok(deleted)
    }

    /// Audit a request rejected for the VM's current status.
    fn rejected(&self, actor: &Actor, vm: &Vm, action: HistoryAction) -> ControlError {
        let error = ControlError::InvalidStateTransition {
            vm_id: vm.vm_id,
            from: vm.status,
            action,
        };
        tracing::warn!(
            vm_id = %vm.vm_id,
            action = action.as_str(),
            status = vm.status.as_str(),
            "Rejected lifecycle action"
        );
        self.audit.record(
            vm,
            Some(actor.user_id),
            action,
            HistoryStatus::Warning,
            error.to_string(),
        );
        error
    }

    /// Validate an action, move the VM into its transient status and hand
    /// the hypervisor call to a background task.
    fn begin(&self, actor: &Actor, vm_id: &VmId, call: HypervisorCall) -> Result<Vm> {
        let action = call.action();
        let vm = self.get_and_verify(actor, vm_id)?;

        if action == HistoryAction::Stop && lifecycle::is_stop_noop(vm.status) {
            return Ok(vm);
        }

        let Ok(transition) = lifecycle::validate_action(vm_id, vm.status, action) else {
            return Err(self.rejected(actor, &vm, action));
        };

        let guard = self.locks.try_acquire(*vm_id).ok_or_else(|| Self::busy(vm_id))?;

        let transient = transition.transient;
        let vm = match self.store.compare_and_update_vm(
            vm_id,
            &[transition.from],
            &|vm: &mut Vm| vm.status = transient,
        ) {
            Ok(vm) => vm,
            Err(StoreError::NotFound) => return Err(ControlError::VmNotFound(*vm_id)),
            Err(StoreError::Conflict(_)) => {
                // Status moved between the read and the lock
                let current = self.get_and_verify(actor, vm_id)?;
                if action == HistoryAction::Stop && lifecycle::is_stop_noop(current.status) {
                    return Ok(current);
                }
                return Err(self.rejected(actor, &current, action));
            }
            Err(e) => return Err(e.into()),
        };

        tracing::info!(
            vm_id = %vm_id,
            actor_id = %actor.user_id,
            action = action.as_str(),
            status = vm.status.as_str(),
            "Accepted lifecycle action"
        );
        self.log_vm(vm_id, LogLevel::Info, call.accepted());
        if transition.transient != transition.from {
            self.events.publish(*vm_id, Some(transition.transient));
        }

        self.spawn_completion(vm.clone(), transition, call, Some(actor.user_id), guard);
        Ok(vm)
    }

    fn spawn_completion(
        &self,
        vm: Vm,
        transition: Transition,
        call: HypervisorCall,
        actor_id: Option<UserId>,
        guard: OperationGuard,
    ) {
        let this = self.clone();
        tokio::spawn(async move {
            this.complete(vm, transition, call, actor_id, guard).await;
        });
    }

    async fn run_call(
        &self,
        vm_id: &VmId,
        call: &HypervisorCall,
    ) -> std::result::Result<(), HypervisorError> {
        let policy = &self.config.retry;
        let deadline = self.config.hypervisor_timeout;
        let hv = &*self.hypervisor;

        match call {
            HypervisorCall::Provision(spec) => {
                let spec = &**spec;
                with_retry(policy, deadline, vm_id, "provision", move || hv.provision(spec)).await
            }
            HypervisorCall::Start => {
                with_retry(policy, deadline, vm_id, "start", move || hv.start(vm_id)).await
            }
            HypervisorCall::Stop => {
                with_retry(policy, deadline, vm_id, "stop", move || hv.stop(vm_id)).await
            }
            HypervisorCall::Pause => {
                with_retry(policy, deadline, vm_id, "pause", move || hv.pause(vm_id)).await
            }
            HypervisorCall::Resume => {
                with_retry(policy, deadline, vm_id, "resume", move || hv.resume(vm_id)).await
            }
        }
    }

    /// Finish a lifecycle action once the hypervisor answers.
    async fn complete(
        self,
        vm: Vm,
        transition: Transition,
        call: HypervisorCall,
        actor_id: Option<UserId>,
        _guard: OperationGuard,
    ) {
        let action = call.action();
        let vm_id = vm.vm_id;

        if let Err(e) = self.run_call(&vm_id, &call).await {
            let reason = ControlError::from(e).to_string();
            self.fail(&vm_id, transition.transient, action, actor_id, &reason);
            return;
        }

        let target = transition.target;
        if let Err(e) = lifecycle::validate_transition(&vm_id, transition.transient, target) {
            tracing::error!(vm_id = %vm_id, error = %e, "Refusing illegal transition");
            return;
        }

        let now = Utc::now();
        let result = self.store.compare_and_update_vm(
            &vm_id,
            &[transition.transient],
            &|vm: &mut Vm| {
                vm.status = target;
                vm.error_message = None;
                match target {
                    VmStatus::Running => vm.started_at = Some(now),
                    VmStatus::Stopped => vm.stopped_at = Some(now),
                    _ => {}
                }
            },
        );

        match result {
            Ok(updated) => {
                tracing::info!(
                    vm_id = %vm_id,
                    action = action.as_str(),
                    status = target.as_str(),
                    "Lifecycle action completed"
                );
                self.log_vm(&vm_id, LogLevel::Info, call.completed());
                self.audit.record(
                    &updated,
                    actor_id,
                    action,
                    HistoryStatus::Success,
                    call.completed(),
                );
                self.events.publish(vm_id, Some(target));
            }
            Err(e) => {
                tracing::error!(
                    vm_id = %vm_id,
                    action = action.as_str(),
                    error = %e,
                    "VM changed while its operation was in flight"
                );
            }
        }
    }

    /// Move a VM from `from` to `error`, recording why.
    fn fail(
        &self,
        vm_id: &VmId,
        from: VmStatus,
        action: HistoryAction,
        actor_id: Option<UserId>,
        reason: &str,
    ) -> bool {
        if lifecycle::validate_transition(vm_id, from, VmStatus::Error).is_err() {
            return false;
        }

        let message = format!("{} failed: {reason}", action.as_str());
        let result = self.store.compare_and_update_vm(vm_id, &[from], &|vm: &mut Vm| {
            vm.status = VmStatus::Error;
            vm.error_message = Some(message.clone());
        });

        match result {
            Ok(updated) => {
                tracing::warn!(
                    vm_id = %vm_id,
                    action = action.as_str(),
                    reason,
                    "Lifecycle action failed"
                );
                self.log_vm(vm_id, LogLevel::Error, message.as_str());
                self.audit
                    .record(&updated, actor_id, action, HistoryStatus::Error, message.as_str());
                self.events.publish(*vm_id, Some(VmStatus::Error));
                true
            }
            Err(e) => {
                tracing::error!(vm_id = %vm_id, error = %e, "Failed to record VM failure");
                false
            }
        }
    }

    fn release_slot(&self, slot: u32, vm_id: &VmId) {
        let namespace = &self.config.network.namespace;
        if let Err(e) = self.store.release_network_slot(namespace, slot, vm_id) {
            tracing::error!(vm_id = %vm_id, slot, error = %e, "Failed to release network slot");
        }
    }

    /// Persist a new VM in `creating`, holding a fresh network lease.
    fn register_vm(
        &self,
        actor: &Actor,
        name: String,
        offer: &VmOffer,
        image: &SystemImage,
    ) -> Result<(Vm, OperationGuard)> {
        // Quota check and insert must not interleave with another create
        let _creating = self.create_lock.lock();

        let count = self.store.count_vms_by_user(actor.user_id)?;
        if count >= self.config.max_vms_per_user {
            return Err(ControlError::QuotaExceeded {
                user_id: actor.user_id,
                limit: self.config.max_vms_per_user,
            });
        }

        let vm_id = VmId::generate();
        let guard = self
            .locks
            .try_acquire(vm_id)
            .ok_or_else(|| Self::busy(&vm_id))?;

        let net = &self.config.network;
        let slot = self
            .store
            .claim_network_slot(&net.namespace, net.capacity, &vm_id)?
            .ok_or_else(|| {
                ControlError::ResourceExhausted(format!(
                    "no free network slot in namespace {}",
                    net.namespace
                ))
            })?;

        let network = match network::identity_for_slot(net, slot) {
            Ok(network) => network,
            Err(e) => {
                self.release_slot(slot, &vm_id);
                return Err(e);
            }
        };

        let now = Utc::now();
        let vm = Vm {
            vm_id,
            user_id: actor.user_id,
            name,
            status: VmStatus::Creating,
            resources: offer.resources(),
            system_image_id: image.image_id,
            vm_offer_id: offer.offer_id,
            network,
            created_at: now,
            updated_at: now,
            started_at: None,
            stopped_at: None,
            error_message: None,
        };

        if let Err(e) = self.store.insert_vm(&vm) {
            self.release_slot(slot, &vm_id);
            return Err(e.into());
        }

        Ok((vm, guard))
    }
}

#[async_trait]
impl<S: Store + 'static, H: Hypervisor + 'static> ControlPlane for ControlPlaneService<S, H> {
    // =========================================================================
    // VM Operations
    // =========================================================================

    async fn create_vm(&self, actor: &Actor, request: CreateVmRequest) -> Result<Vm> {
        let name = validate_vm_name(&request.name)?;
        let offer = catalog::resolve_offer(&*self.store, request.offer.trim())?;
        let image = catalog::resolve_image(&*self.store, request.image.trim())?;
        catalog::check_compatibility(&image, &offer, &self.config.host_architecture)?;

        let (vm, guard) = self.register_vm(actor, name, &offer, &image)?;

        tracing::info!(
            vm_id = %vm.vm_id,
            user_id = %vm.user_id,
            name = %vm.name,
            offer = %offer.name,
            image = %image.name,
            ip = %vm.network.ip_address,
            "Created VM"
        );

        let spec = MachineSpec {
            vm_id: vm.vm_id,
            vcpu_count: vm.resources.vcpu_count,
            memory_size_mib: vm.resources.memory_size_mib,
            disk_size_gb: vm.resources.disk_size_gb,
            kernel_image_path: image.kernel_image_path.clone(),
            rootfs_path: image.rootfs_path.clone(),
            network: vm.network.clone(),
        };
        let call = HypervisorCall::Provision(Box::new(spec));

        self.log_vm(
            &vm.vm_id,
            LogLevel::Info,
            format!(
                "VM created from {}-{} on offer {}",
                image.name, image.version, offer.name
            ),
        );
        self.log_vm(&vm.vm_id, LogLevel::Info, call.accepted());
        self.events.publish(vm.vm_id, Some(VmStatus::Creating));

        self.spawn_completion(
            vm.clone(),
            lifecycle::provisioning(),
            call,
            Some(actor.user_id),
            guard,
        );

        Ok(vm)
    }

    async fn get_vm(&self, actor: &Actor, vm_id: &VmId) -> Result<Vm> {
        self.get_and_verify(actor, vm_id)
    }

    async fn list_vms(&self, actor: &Actor) -> Result<Vec<Vm>> {
        let mut vms = if actor.is_admin() {
            self.store.list_all_vms()?
        } else {
            self.store.list_vms_by_user(actor.user_id)?
        };
        vms.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(vms)
    }

    async fn update_vm(&self, actor: &Actor, vm_id: &VmId, request: UpdateVmRequest) -> Result<Vm> {
        let vm = self.get_and_verify(actor, vm_id)?;

        if request.name.is_none() && request.vm_offer_id.is_none() {
            return Err(ControlError::InvalidSpec("nothing to update".into()));
        }
        let name = request.name.as_deref().map(validate_vm_name).transpose()?;

        // Offer changes reshape the machine and need the VM to itself
        let (offer, _guard) = match request.vm_offer_id.as_deref() {
            Some(reference) => {
                if vm.status != VmStatus::Stopped {
                    return Err(self.rejected(actor, &vm, HistoryAction::Update));
                }
                let guard = self.locks.try_acquire(*vm_id).ok_or_else(|| Self::busy(vm_id))?;

                let offer = catalog::resolve_offer(&*self.store, reference.trim())?;
                let image = catalog::get_image(&*self.store, &vm.system_image_id)?;
                catalog::check_compatibility(&image, &offer, &self.config.host_architecture)?;
                if offer.disk_size_gb < vm.resources.disk_size_gb {
                    return Err(ControlError::InvalidSpec(format!(
                        "offer {} would shrink the disk from {} GB to {} GB",
                        offer.name, vm.resources.disk_size_gb, offer.disk_size_gb
                    )));
                }
                (Some(offer), Some(guard))
            }
            None => (None, None),
        };

        let expected: &[VmStatus] = if offer.is_some() {
            &[VmStatus::Stopped]
        } else {
            &VmStatus::ALL
        };

        let updated = match self.store.compare_and_update_vm(vm_id, expected, &|vm: &mut Vm| {
            if let Some(name) = &name {
                vm.name.clone_from(name);
            }
            if let Some(offer) = &offer {
                vm.vm_offer_id = offer.offer_id;
                vm.resources = offer.resources();
            }
        }) {
            Ok(vm) => vm,
            Err(StoreError::NotFound) => return Err(ControlError::VmNotFound(*vm_id)),
            Err(StoreError::Conflict(message)) if offer.is_some() => {
                let current = self.get_and_verify(actor, vm_id)?;
                if current.status == VmStatus::Stopped {
                    return Err(ControlError::Conflict(message));
                }
                return Err(self.rejected(actor, &current, HistoryAction::Update));
            }
            Err(e) => return Err(e.into()),
        };

        let mut changes = Vec::new();
        if updated.name != vm.name {
            changes.push(format!("renamed {} to {}", vm.name, updated.name));
        }
        if let Some(offer) = &offer {
            changes.push(format!("moved to offer {}", offer.name));
        }
        let details = if changes.is_empty() {
            "VM updated".to_string()
        } else {
            changes.join("; ")
        };

        tracing::info!(vm_id = %vm_id, details = %details, "Updated VM");
        self.log_vm(vm_id, LogLevel::Info, details.as_str());
        self.audit.record(
            &updated,
            Some(actor.user_id),
            HistoryAction::Update,
            HistoryStatus::Success,
            details,
        );

        Ok(updated)
    }

    async fn delete_vm(&self, actor: &Actor, vm_id: &VmId) -> Result<Vm> {
        let vm = self.get_and_verify(actor, vm_id)?;

        if !lifecycle::can_delete(vm.status) {
            return Err(self.rejected(actor, &vm, HistoryAction::Delete));
        }

        let guard = self.locks.try_acquire(*vm_id).ok_or_else(|| Self::busy(vm_id))?;

        // An operation may have finished between the read and the lock
        let vm = self.get_and_verify(actor, vm_id)?;
        if !lifecycle::can_delete(vm.status) {
            return Err(self.rejected(actor, &vm, HistoryAction::Delete));
        }

        // Owned by a task so a dropped request cannot stop halfway
        let this = self.clone();
        let actor_id = actor.user_id;
        tokio::spawn(async move { this.destroy_and_remove(vm, actor_id, guard).await })
            .await
            .map_err(|e| ControlError::Internal(format!("delete task failed: {e}")))?
    }

    // =========================================================================
    // Lifecycle Operations
    // =========================================================================

    async fn start_vm(&self, actor: &Actor, vm_id: &VmId) -> Result<Vm> {
        self.begin(actor, vm_id, HypervisorCall::Start)
    }

    async fn stop_vm(&self, actor: &Actor, vm_id: &VmId) -> Result<Vm> {
        self.begin(actor, vm_id, HypervisorCall::Stop)
    }

    async fn pause_vm(&self, actor: &Actor, vm_id: &VmId) -> Result<Vm> {
        self.begin(actor, vm_id, HypervisorCall::Pause)
    }

    async fn resume_vm(&self, actor: &Actor, vm_id: &VmId) -> Result<Vm> {
        self.begin(actor, vm_id, HypervisorCall::Resume)
    }

    async fn vm_logs(
        &self,
        actor: &Actor,
        vm_id: &VmId,
        tail: Option<usize>,
    ) -> Result<Vec<VmLogLine>> {
        self.get_and_verify(actor, vm_id)?;
        Ok(self.store.list_vm_logs(vm_id, tail)?)
    }

    async fn vm_metrics(&self, actor: &Actor, vm_id: &VmId) -> Result<MetricsSnapshot> {
        self.get_and_verify(actor, vm_id)?;
        Ok(self.store.get_metrics(vm_id)?.unwrap_or_default())
    }

    async fn vm_metrics_history(
        &self,
        actor: &Actor,
        vm_id: &VmId,
        limit: usize,
    ) -> Result<Vec<MetricsSnapshot>> {
        self.get_and_verify(actor, vm_id)?;
        Ok(self.store.list_metrics_history(vm_id, limit)?)
    }

    fn subscribe(&self) -> broadcast::Receiver<VmEvent> {
        self.events.subscribe()
    }

    async fn reconcile(&self) -> Result<usize> {
        let mut repaired = 0;

        for status in VmStatus::ALL {
            let Some(action) = lifecycle::interrupted_action(status) else {
                continue;
            };
            for vm in self.store.list_vms_by_status(status)? {
                // Operations started by this process are still running
                if self.locks.is_locked(&vm.vm_id) {
                    continue;
                }
                if self.fail(&vm.vm_id, status, action, None, "interrupted by a service restart") {
                    repaired += 1;
                }
            }
        }

        if repaired > 0 {
            tracing::warn!(repaired, "Moved interrupted VMs to error");
        }
        Ok(repaired)
    }

    // =========================================================================
    // Users
    // =========================================================================

    async fn list_users(&self, actor: &Actor) -> Result<Vec<User>> {
        accounts::list_users(&*self.store, actor)
    }

    async fn get_user(&self, actor: &Actor, user_id: UserId) -> Result<User> {
        accounts::get_user(&*self.store, actor, user_id)
    }

    async fn create_user(&self, actor: &Actor, request: CreateUserRequest) -> Result<User> {
        accounts::create_user(&*self.store, actor, request)
    }

    async fn update_user(
        &self,
        actor: &Actor,
        user_id: UserId,
        request: UpdateUserRequest,
    ) -> Result<User> {
        accounts::update_user(&*self.store, actor, user_id, request)
    }

    async fn delete_user(&self, actor: &Actor, user_id: UserId) -> Result<()> {
        accounts::delete_user(&*self.store, actor, user_id)
    }

    // =========================================================================
    // Catalog
    // =========================================================================

    async fn list_images(&self, _actor: &Actor) -> Result<Vec<SystemImage>> {
        Ok(self.store.list_images()?)
    }

    async fn get_image(&self, _actor: &Actor, reference: &str) -> Result<SystemImage> {
        catalog::resolve_image(&*self.store, reference)
    }

    async fn create_image(
        &self,
        actor: &Actor,
        request: CreateImageRequest,
    ) -> Result<SystemImage> {
        catalog::create_image(&*self.store, actor, request)
    }

    async fn update_image(
        &self,
        actor: &Actor,
        image_id: &ImageId,
        request: UpdateImageRequest,
    ) -> Result<SystemImage> {
        catalog::update_image(&*self.store, actor, image_id, request)
    }

    async fn delete_image(&self, actor: &Actor, image_id: &ImageId) -> Result<()> {
        catalog::delete_image(&*self.store, actor, image_id)
    }

    async fn list_offers(&self, actor: &Actor) -> Result<Vec<VmOffer>> {
        let mut offers = self.store.list_offers()?;
        if !actor.is_admin() {
            offers.retain(|offer| offer.is_active);
        }
        Ok(offers)
    }

    async fn get_offer(&self, _actor: &Actor, reference: &str) -> Result<VmOffer> {
        catalog::resolve_offer(&*self.store, reference)
    }

    async fn create_offer(&self, actor: &Actor, request: CreateOfferRequest) -> Result<VmOffer> {
        catalog::create_offer(&*self.store, actor, request)
    }

    async fn update_offer(
        &self,
        actor: &Actor,
        offer_id: &OfferId,
        request: UpdateOfferRequest,
    ) -> Result<VmOffer> {
        catalog::update_offer(&*self.store, actor, offer_id, request)
    }

    async fn delete_offer(&self, actor: &Actor, offer_id: &OfferId) -> Result<()> {
        catalog::delete_offer(&*self.store, actor, offer_id)
    }

    // =========================================================================
    // SSH Keys
    // =========================================================================

    async fn list_ssh_keys(&self, actor: &Actor) -> Result<Vec<SshKey>> {
        accounts::list_ssh_keys(&*self.store, actor)
    }

    async fn get_ssh_key(&self, actor: &Actor, key_id: &SshKeyId) -> Result<SshKey> {
        accounts::get_ssh_key(&*self.store, actor, key_id)
    }

    async fn create_ssh_key(&self, actor: &Actor, request: CreateSshKeyRequest) -> Result<SshKey> {
        accounts::create_ssh_key(&*self.store, actor, request)
    }

    async fn update_ssh_key(
        &self,
        actor: &Actor,
        key_id: &SshKeyId,
        request: UpdateSshKeyRequest,
    ) -> Result<SshKey> {
        accounts::update_ssh_key(&*self.store, actor, key_id, request)
    }

    async fn delete_ssh_key(&self, actor: &Actor, key_id: &SshKeyId) -> Result<()> {
        accounts::delete_ssh_key(&*self.store, actor, key_id)
    }

    async fn authenticate_ssh_key(&self, request: SshAuthRequest) -> Result<SshAuthResponse> {
        accounts::authenticate_ssh_key(&*self.store, &request)
    }

    // =========================================================================
    // Admin
    // =========================================================================

    async fn query_history(&self, actor: &Actor, query: HistoryQuery) -> Result<HistoryPage> {
        catalog::require_admin(actor, "reading the audit history")?;
        self.audit.query(&query)
    }

    async fn dashboard(&self, actor: &Actor) -> Result<Dashboard> {
        catalog::require_admin(actor, "the dashboard")?;
        dashboard::build(&*self.store, self.audit.failure_count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypervisor::mock::{MockHypervisor, MockOp};
    use crate::types::RetryPolicy;
    use flarevm_core::Role;
    use flarevm_store::{NewUser, RocksStore};
    use std::collections::HashSet;
    use std::time::Duration;
    use tempfile::TempDir;

    type Service = ControlPlaneService<RocksStore, MockHypervisor>;

    struct Fixture {
        service: Service,
        hv: Arc<MockHypervisor>,
        admin: Actor,
        user: Actor,
        _dir: TempDir,
    }

    fn setup_with(config: ControlConfig) -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(RocksStore::open(dir.path()).unwrap());
        let hv = Arc::new(MockHypervisor::new());

        let admin = store
            .create_user(NewUser {
                username: "root".to_string(),
                email: "root@example.com".to_string(),
                role: Role::Admin,
            })
            .unwrap();
        let admin = Actor::admin(admin.user_id);
        let user = Actor::user(UserId::new(42));

        seed_catalog(&*store, &admin, &config.host_architecture);

        let service = ControlPlaneService::new(store, Arc::clone(&hv), config);
        Fixture {
            service,
            hv,
            admin,
            user,
            _dir: dir,
        }
    }

    fn seed_catalog<S: Store>(store: &S, admin: &Actor, architecture: &str) {
        catalog::create_offer(
            store,
            admin,
            CreateOfferRequest {
                name: "standard".to_string(),
                description: String::new(),
                vcpu_count: 2,
                memory_size_mib: 2048,
                disk_size_gb: 20,
                price_per_hour: 0.05,
                is_active: true,
            },
        )
        .unwrap();
        catalog::create_offer(
            store,
            admin,
            CreateOfferRequest {
                name: "large".to_string(),
                description: String::new(),
                vcpu_count: 4,
                memory_size_mib: 8192,
                disk_size_gb: 40,
                price_per_hour: 0.2,
                is_active: true,
            },
        )
        .unwrap();
        catalog::create_image(
            store,
            admin,
            CreateImageRequest {
                name: "ubuntu".to_string(),
                version: "22.04".to_string(),
                kernel_version: "6.1".to_string(),
                architecture: architecture.to_string(),
                checksum: "sha256:00".to_string(),
                size_bytes: 2 * 1024 * 1024 * 1024,
                kernel_image_path: "/images/vmlinux".to_string(),
                rootfs_path: "/images/ubuntu-22.04.ext4".to_string(),
            },
        )
        .unwrap();
    }

    fn test_config() -> ControlConfig {
        ControlConfig {
            max_vms_per_user: 3,
            hypervisor_timeout: Duration::from_millis(500),
            retry: RetryPolicy {
                max_attempts: 3,
                initial_backoff: Duration::from_millis(5),
                max_backoff: Duration::from_millis(10),
            },
            ..ControlConfig::default()
        }
    }

    fn setup() -> Fixture {
        setup_with(test_config())
    }

    fn web(name: &str) -> CreateVmRequest {
        CreateVmRequest::new(name, "standard", "ubuntu-22.04")
    }

    async fn wait_for(service: &Service, vm_id: &VmId, status: VmStatus) -> Vm {
        for _ in 0..200 {
            let vm = service.store().get_vm(vm_id).unwrap().unwrap();
            if vm.status == status && !service.locks.is_locked(vm_id) {
                return vm;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("VM {vm_id} never reached {status:?}");
    }

    async fn running_vm(f: &Fixture, name: &str) -> Vm {
        let vm = f.service.create_vm(&f.user, web(name)).await.unwrap();
        wait_for(&f.service, &vm.vm_id, VmStatus::Running).await
    }

    fn history(service: &Service, vm_id: &VmId) -> Vec<flarevm_store::HistoricEntry> {
        service
            .audit()
            .query(&HistoryQuery {
                vm_id: Some(*vm_id),
                page: 1,
                per_page: 100,
                ..Default::default()
            })
            .unwrap()
            .entries
    }

    #[tokio::test]
    async fn web1_scenario() {
        let f = setup();

        let vm = f.service.create_vm(&f.user, web("web-1")).await.unwrap();
        assert_eq!(vm.status, VmStatus::Creating);
        assert_eq!(vm.resources.vcpu_count, 2);
        assert_eq!(vm.resources.memory_size_mib, 2048);

        let vm = wait_for(&f.service, &vm.vm_id, VmStatus::Running).await;
        assert!(vm.started_at.is_some());

        let stopping = f.service.stop_vm(&f.user, &vm.vm_id).await.unwrap();
        assert_eq!(stopping.status, VmStatus::Stopping);
        let stopped = wait_for(&f.service, &vm.vm_id, VmStatus::Stopped).await;
        assert!(stopped.stopped_at.is_some());

        let deleted = f.service.delete_vm(&f.user, &vm.vm_id).await.unwrap();
        assert_eq!(deleted.vm_id, vm.vm_id);

        assert!(matches!(
            f.service.get_vm(&f.user, &vm.vm_id).await,
            Err(ControlError::VmNotFound(_))
        ));

        // create, stop, delete; newest first
        let actions: Vec<_> = history(&f.service, &vm.vm_id)
            .iter()
            .map(|e| (e.action, e.status))
            .collect();
        assert_eq!(
            actions,
            vec![
                (HistoryAction::Delete, HistoryStatus::Success),
                (HistoryAction::Stop, HistoryStatus::Success),
                (HistoryAction::Create, HistoryStatus::Success),
            ]
        );

        assert_eq!(f.hv.call_count(MockOp::Provision), 1);
        assert_eq!(f.hv.call_count(MockOp::Destroy), 1);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let f = setup();
        let vm = running_vm(&f, "web-1").await;

        f.service.stop_vm(&f.user, &vm.vm_id).await.unwrap();
        wait_for(&f.service, &vm.vm_id, VmStatus::Stopped).await;

        let again = f.service.stop_vm(&f.user, &vm.vm_id).await.unwrap();
        assert_eq!(again.status, VmStatus::Stopped);
        assert_eq!(f.hv.call_count(MockOp::Stop), 1);

        let stops = history(&f.service, &vm.vm_id)
            .into_iter()
            .filter(|e| e.action == HistoryAction::Stop)
            .count();
        assert_eq!(stops, 1);
    }

    #[tokio::test]
    async fn stop_during_create_is_rejected() {
        let f = setup();
        f.hv.set_delay(MockOp::Provision, Duration::from_millis(200));

        let vm = f.service.create_vm(&f.user, web("web-1")).await.unwrap();
        let result = f.service.stop_vm(&f.user, &vm.vm_id).await;
        assert!(matches!(
            result,
            Err(ControlError::InvalidStateTransition {
                from: VmStatus::Creating,
                action: HistoryAction::Stop,
                ..
            })
        ));

        let vm = wait_for(&f.service, &vm.vm_id, VmStatus::Running).await;
        let entries = history(&f.service, &vm.vm_id);
        assert!(entries
            .iter()
            .any(|e| e.action == HistoryAction::Stop && e.status == HistoryStatus::Warning));
    }

    #[tokio::test]
    async fn delete_running_is_rejected() {
        let f = setup();
        let vm = running_vm(&f, "web-1").await;

        let result = f.service.delete_vm(&f.user, &vm.vm_id).await;
        assert!(matches!(
            result,
            Err(ControlError::InvalidStateTransition {
                from: VmStatus::Running,
                action: HistoryAction::Delete,
                ..
            })
        ));
        assert_eq!(f.hv.call_count(MockOp::Destroy), 0);
        assert_eq!(
            f.service.get_vm(&f.user, &vm.vm_id).await.unwrap().status,
            VmStatus::Running
        );
    }

    #[tokio::test]
    async fn delete_completes_after_the_caller_gives_up() {
        let f = setup();
        let vm = running_vm(&f, "web-1").await;
        f.service.stop_vm(&f.user, &vm.vm_id).await.unwrap();
        wait_for(&f.service, &vm.vm_id, VmStatus::Stopped).await;

        f.hv.set_delay(MockOp::Destroy, Duration::from_millis(100));
        let abandoned = tokio::time::timeout(
            Duration::from_millis(10),
            f.service.delete_vm(&f.user, &vm.vm_id),
        )
        .await;
        assert!(abandoned.is_err());

        let deleted = |entries: &[flarevm_store::HistoricEntry]| {
            entries
                .iter()
                .filter(|e| {
                    e.action == HistoryAction::Delete && e.status == HistoryStatus::Success
                })
                .count()
        };
        for _ in 0..100 {
            if deleted(&history(&f.service, &vm.vm_id)) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(deleted(&history(&f.service, &vm.vm_id)), 1);
        assert!(f.service.store().get_vm(&vm.vm_id).unwrap().is_none());
        assert_eq!(f.hv.call_count(MockOp::Destroy), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn delete_racing_start_never_destroys_a_live_vm() {
        let f = setup_with(ControlConfig {
            max_vms_per_user: 50,
            ..test_config()
        });

        for i in 0..10 {
            let vm = running_vm(&f, &format!("race-{i}")).await;
            f.service.stop_vm(&f.user, &vm.vm_id).await.unwrap();
            wait_for(&f.service, &vm.vm_id, VmStatus::Stopped).await;

            let (starter, deleter) = (f.service.clone(), f.service.clone());
            let (user, vm_id) = (f.user, vm.vm_id);
            let start = tokio::spawn(async move { starter.start_vm(&user, &vm_id).await });
            let delete = tokio::spawn(async move { deleter.delete_vm(&user, &vm_id).await });
            let started = start.await.unwrap().is_ok();
            let deleted = delete.await.unwrap().is_ok();

            assert!(!(started && deleted), "start and delete both succeeded");
            let destroys = f
                .hv
                .calls()
                .iter()
                .filter(|(op, id)| *op == MockOp::Destroy && *id == vm_id)
                .count();
            if deleted {
                assert!(f.service.store().get_vm(&vm_id).unwrap().is_none());
            } else {
                assert_eq!(destroys, 0);
                assert!(f.service.store().get_vm(&vm_id).unwrap().is_some());
            }
        }
    }

    #[tokio::test]
    async fn concurrent_creates_get_distinct_networks() {
        let f = setup_with(ControlConfig {
            max_vms_per_user: 50,
            ..test_config()
        });

        let mut handles = Vec::new();
        for i in 0..20 {
            let service = f.service.clone();
            let user = f.user;
            handles.push(tokio::spawn(async move {
                service.create_vm(&user, web(&format!("vm-{i}"))).await
            }));
        }

        let mut ips = HashSet::new();
        let mut taps = HashSet::new();
        for handle in handles {
            let vm = handle.await.unwrap().unwrap();
            assert!(ips.insert(vm.network.ip_address));
            assert!(taps.insert(vm.network.tap_device_name));
        }
        assert_eq!(ips.len(), 20);
    }

    #[tokio::test]
    async fn network_pool_exhaustion() {
        let mut config = test_config();
        config.network.capacity = 1;
        let f = setup_with(config);

        f.service.create_vm(&f.user, web("a")).await.unwrap();
        let result = f.service.create_vm(&f.user, web("b")).await;
        assert!(matches!(result, Err(ControlError::ResourceExhausted(_))));
        assert_eq!(result.unwrap_err().http_status_code(), 507);
    }

    #[tokio::test]
    async fn delete_releases_network_slot() {
        let mut config = test_config();
        config.network.capacity = 1;
        let f = setup_with(config);

        let vm = running_vm(&f, "a").await;
        f.service.stop_vm(&f.user, &vm.vm_id).await.unwrap();
        wait_for(&f.service, &vm.vm_id, VmStatus::Stopped).await;
        f.service.delete_vm(&f.user, &vm.vm_id).await.unwrap();

        let next = f.service.create_vm(&f.user, web("b")).await.unwrap();
        assert_eq!(next.network.ip_address, vm.network.ip_address);
    }

    #[tokio::test]
    async fn create_validation() {
        let f = setup();

        assert!(matches!(
            f.service.create_vm(&f.user, web("")).await,
            Err(ControlError::InvalidSpec(_))
        ));
        assert!(matches!(
            f.service.create_vm(&f.user, web("bad name!")).await,
            Err(ControlError::InvalidSpec(_))
        ));
        assert!(matches!(
            f.service
                .create_vm(&f.user, CreateVmRequest::new("a", "huge", "ubuntu"))
                .await,
            Err(ControlError::OfferNotFound(_))
        ));
        assert!(matches!(
            f.service
                .create_vm(&f.user, CreateVmRequest::new("a", "standard", "debian"))
                .await,
            Err(ControlError::ImageNotFound(_))
        ));

        // Validation failures never touch the registry
        assert!(f.service.list_vms(&f.user).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn retired_offer_is_rejected() {
        let f = setup();
        let offer = catalog::resolve_offer(f.service.store(), "standard").unwrap();
        f.service
            .update_offer(
                &f.admin,
                &offer.offer_id,
                UpdateOfferRequest {
                    is_active: Some(false),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert!(matches!(
            f.service.create_vm(&f.user, web("a")).await,
            Err(ControlError::InvalidSpec(_))
        ));
        assert_eq!(f.service.list_offers(&f.user).await.unwrap().len(), 1);
        assert_eq!(f.service.list_offers(&f.admin).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn duplicate_name_conflicts() {
        let f = setup();
        f.service.create_vm(&f.user, web("web-1")).await.unwrap();
        let result = f.service.create_vm(&f.user, web("web-1")).await;
        assert!(matches!(result, Err(ControlError::Conflict(_))));

        // Another user may use the same name
        let other = Actor::user(UserId::new(7));
        assert!(f.service.create_vm(&other, web("web-1")).await.is_ok());
    }

    #[tokio::test]
    async fn quota_exceeded() {
        let f = setup();
        for i in 0..3 {
            f.service
                .create_vm(&f.user, web(&format!("vm-{i}")))
                .await
                .unwrap();
        }

        let result = f.service.create_vm(&f.user, web("overflow")).await;
        assert!(matches!(
            result,
            Err(ControlError::QuotaExceeded { limit: 3, .. })
        ));
    }

    #[tokio::test]
    async fn other_users_cannot_touch_vm() {
        let f = setup();
        let vm = f.service.create_vm(&f.user, web("web-1")).await.unwrap();
        let mallory = Actor::user(UserId::new(666));

        assert!(matches!(
            f.service.get_vm(&mallory, &vm.vm_id).await,
            Err(ControlError::NotOwner { .. })
        ));
        assert!(f.service.stop_vm(&mallory, &vm.vm_id).await.is_err());

        // Admins can
        assert!(f.service.get_vm(&f.admin, &vm.vm_id).await.is_ok());
        assert_eq!(f.service.list_vms(&f.admin).await.unwrap().len(), 1);
        assert!(f.service.list_vms(&mallory).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn provisioning_failure_moves_to_error() {
        let f = setup();
        f.hv.fail_next(MockOp::Provision, 1, false);

        let vm = f.service.create_vm(&f.user, web("web-1")).await.unwrap();
        let vm = wait_for(&f.service, &vm.vm_id, VmStatus::Error).await;
        assert!(vm
            .error_message
            .as_deref()
            .is_some_and(|m| m.contains("create failed")));

        let entries = history(&f.service, &vm.vm_id);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, HistoryStatus::Error);

        let logs = f.service.vm_logs(&f.user, &vm.vm_id, None).await.unwrap();
        assert_eq!(logs.last().unwrap().level, LogLevel::Error);

        // Error VMs can only be deleted
        assert!(f.service.start_vm(&f.user, &vm.vm_id).await.is_err());
        f.service.delete_vm(&f.user, &vm.vm_id).await.unwrap();
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let f = setup();
        f.hv.fail_next(MockOp::Provision, 2, true);

        let vm = f.service.create_vm(&f.user, web("web-1")).await.unwrap();
        wait_for(&f.service, &vm.vm_id, VmStatus::Running).await;
        assert_eq!(f.hv.call_count(MockOp::Provision), 3);
    }

    #[tokio::test]
    async fn hypervisor_timeout_moves_to_error() {
        let f = setup();
        let vm = running_vm(&f, "web-1").await;
        f.hv.set_delay(MockOp::Stop, Duration::from_secs(5));

        f.service.stop_vm(&f.user, &vm.vm_id).await.unwrap();
        let vm = wait_for(&f.service, &vm.vm_id, VmStatus::Error).await;
        assert!(vm.error_message.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn concurrent_operation_conflicts() {
        let f = setup();
        let vm = running_vm(&f, "web-1").await;
        f.hv.set_delay(MockOp::Pause, Duration::from_millis(200));

        let pausing = f.service.pause_vm(&f.user, &vm.vm_id).await.unwrap();
        assert_eq!(pausing.status, VmStatus::Pausing);

        // Pausing is not a valid source for pause
        assert!(matches!(
            f.service.pause_vm(&f.user, &vm.vm_id).await,
            Err(ControlError::InvalidStateTransition { .. })
        ));
        // Rename still works while the operation runs
        let renamed = f
            .service
            .update_vm(
                &f.user,
                &vm.vm_id,
                UpdateVmRequest {
                    name: Some("web-2".to_string()),
                    vm_offer_id: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(renamed.name, "web-2");

        let paused = wait_for(&f.service, &vm.vm_id, VmStatus::Paused).await;
        assert_eq!(paused.name, "web-2");
    }

    #[tokio::test]
    async fn pause_and_resume() {
        let f = setup();
        let vm = running_vm(&f, "web-1").await;

        f.service.pause_vm(&f.user, &vm.vm_id).await.unwrap();
        wait_for(&f.service, &vm.vm_id, VmStatus::Paused).await;

        let resuming = f.service.resume_vm(&f.user, &vm.vm_id).await.unwrap();
        assert_eq!(resuming.status, VmStatus::Paused);
        wait_for(&f.service, &vm.vm_id, VmStatus::Running).await;

        assert_eq!(f.hv.call_count(MockOp::Pause), 1);
        assert_eq!(f.hv.call_count(MockOp::Resume), 1);
    }

    #[tokio::test]
    async fn start_from_stopped() {
        let f = setup();
        let vm = running_vm(&f, "web-1").await;

        assert!(matches!(
            f.service.start_vm(&f.user, &vm.vm_id).await,
            Err(ControlError::InvalidStateTransition { .. })
        ));

        f.service.stop_vm(&f.user, &vm.vm_id).await.unwrap();
        wait_for(&f.service, &vm.vm_id, VmStatus::Stopped).await;

        let starting = f.service.start_vm(&f.user, &vm.vm_id).await.unwrap();
        assert_eq!(starting.status, VmStatus::Starting);
        wait_for(&f.service, &vm.vm_id, VmStatus::Running).await;
    }

    #[tokio::test]
    async fn offer_change_requires_stopped() {
        let f = setup();
        let vm = running_vm(&f, "web-1").await;

        let result = f
            .service
            .update_vm(
                &f.user,
                &vm.vm_id,
                UpdateVmRequest {
                    name: None,
                    vm_offer_id: Some("large".to_string()),
                },
            )
            .await;
        assert!(matches!(
            result,
            Err(ControlError::InvalidStateTransition {
                action: HistoryAction::Update,
                ..
            })
        ));

        f.service.stop_vm(&f.user, &vm.vm_id).await.unwrap();
        wait_for(&f.service, &vm.vm_id, VmStatus::Stopped).await;

        let updated = f
            .service
            .update_vm(
                &f.user,
                &vm.vm_id,
                UpdateVmRequest {
                    name: None,
                    vm_offer_id: Some("large".to_string()),
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.resources.vcpu_count, 4);
        assert_eq!(updated.resources.disk_size_gb, 40);

        // Going back would shrink the disk
        let result = f
            .service
            .update_vm(
                &f.user,
                &vm.vm_id,
                UpdateVmRequest {
                    name: None,
                    vm_offer_id: Some("standard".to_string()),
                },
            )
            .await;
        assert!(matches!(result, Err(ControlError::InvalidSpec(_))));
    }

    #[tokio::test]
    async fn metrics_zeroed_then_retained_after_stop() {
        let f = setup();
        let vm = running_vm(&f, "web-1").await;

        let zero = f.service.vm_metrics(&f.user, &vm.vm_id).await.unwrap();
        assert_eq!(zero, MetricsSnapshot::default());

        f.hv.set_counters(
            vm.vm_id,
            crate::hypervisor::VmCounters {
                memory_usage_mib: 300,
                ..Default::default()
            },
        );
        let collector = f.service.metrics_collector();
        assert_eq!(collector.sample_once().await.recorded, 1);

        f.service.stop_vm(&f.user, &vm.vm_id).await.unwrap();
        wait_for(&f.service, &vm.vm_id, VmStatus::Stopped).await;
        f.hv.set_counters(
            vm.vm_id,
            crate::hypervisor::VmCounters {
                memory_usage_mib: 999,
                ..Default::default()
            },
        );
        assert_eq!(collector.sample_once().await.recorded, 0);

        let latest = f.service.vm_metrics(&f.user, &vm.vm_id).await.unwrap();
        assert_eq!(latest.memory_usage_mib, 300);
        assert_eq!(
            f.service
                .vm_metrics_history(&f.user, &vm.vm_id, 10)
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn reconcile_repairs_interrupted_vms() {
        let f = setup();
        f.hv.set_delay(MockOp::Provision, Duration::from_millis(100));
        let vm = f.service.create_vm(&f.user, web("web-1")).await.unwrap();

        // In-flight operations of this process are left alone
        assert_eq!(f.service.reconcile().await.unwrap(), 0);
        wait_for(&f.service, &vm.vm_id, VmStatus::Running).await;

        // Simulate a crash mid-stop
        f.service
            .store()
            .compare_and_update_vm(&vm.vm_id, &[VmStatus::Running], &|vm: &mut Vm| {
                vm.status = VmStatus::Stopping;
            })
            .unwrap();

        assert_eq!(f.service.reconcile().await.unwrap(), 1);
        let vm = f.service.get_vm(&f.user, &vm.vm_id).await.unwrap();
        assert_eq!(vm.status, VmStatus::Error);
        assert_eq!(history(&f.service, &vm.vm_id)[0].action, HistoryAction::Stop);
    }

    #[tokio::test]
    async fn events_follow_transitions() {
        let f = setup();
        let mut events = f.service.subscribe();

        let vm = running_vm(&f, "web-1").await;
        assert_eq!(events.recv().await.unwrap().status, Some(VmStatus::Creating));
        assert_eq!(events.recv().await.unwrap().status, Some(VmStatus::Running));

        f.service.stop_vm(&f.user, &vm.vm_id).await.unwrap();
        wait_for(&f.service, &vm.vm_id, VmStatus::Stopped).await;
        f.service.delete_vm(&f.user, &vm.vm_id).await.unwrap();

        assert_eq!(events.recv().await.unwrap().status, Some(VmStatus::Stopping));
        assert_eq!(events.recv().await.unwrap().status, Some(VmStatus::Stopped));
        assert_eq!(events.recv().await.unwrap().status, None);
    }

    #[tokio::test]
    async fn history_filter_newest_first() {
        let f = setup();
        let owner = Actor::user(UserId::new(42));

        for name in ["a", "b"] {
            let vm = running_vm(&f, name).await;
            f.service.stop_vm(&owner, &vm.vm_id).await.unwrap();
            wait_for(&f.service, &vm.vm_id, VmStatus::Stopped).await;
            f.service.delete_vm(&owner, &vm.vm_id).await.unwrap();
        }

        let page = f
            .service
            .query_history(
                &f.admin,
                HistoryQuery {
                    user_id: Some(UserId::new(42)),
                    action: Some(HistoryAction::Delete),
                    page: 1,
                    per_page: 10,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(page.total, 2);
        assert_eq!(page.entries[0].vm_name, "b");
        assert_eq!(page.entries[1].vm_name, "a");
        assert!(page.entries[0].id > page.entries[1].id);

        assert!(matches!(
            f.service.query_history(&f.user, HistoryQuery::default()).await,
            Err(ControlError::Forbidden(_))
        ));
    }

    /// A store whose audit history is unwritable.
    struct NoHistoryStore(RocksStore);

    impl Store for NoHistoryStore {
        fn claim_network_slot(
            &self,
            namespace: &str,
            capacity: u32,
            vm_id: &VmId,
        ) -> flarevm_store::Result<Option<u32>> {
            self.0.claim_network_slot(namespace, capacity, vm_id)
        }
        fn release_network_slot(
            &self,
            namespace: &str,
            slot: u32,
            vm_id: &VmId,
        ) -> flarevm_store::Result<()> {
            self.0.release_network_slot(namespace, slot, vm_id)
        }
        fn insert_vm(&self, vm: &Vm) -> flarevm_store::Result<()> {
            self.0.insert_vm(vm)
        }
        fn compare_and_update_vm(
            &self,
            vm_id: &VmId,
            expected: &[VmStatus],
            update: &dyn Fn(&mut Vm),
        ) -> flarevm_store::Result<Vm> {
            self.0.compare_and_update_vm(vm_id, expected, update)
        }
        fn get_vm(&self, vm_id: &VmId) -> flarevm_store::Result<Option<Vm>> {
            self.0.get_vm(vm_id)
        }
        fn delete_vm(&self, vm_id: &VmId, expected: &[VmStatus]) -> flarevm_store::Result<Vm> {
            self.0.delete_vm(vm_id, expected)
        }
        fn list_vms_by_user(&self, user_id: UserId) -> flarevm_store::Result<Vec<Vm>> {
            self.0.list_vms_by_user(user_id)
        }
        fn count_vms_by_user(&self, user_id: UserId) -> flarevm_store::Result<u32> {
            self.0.count_vms_by_user(user_id)
        }
        fn list_vms_by_status(&self, status: VmStatus) -> flarevm_store::Result<Vec<Vm>> {
            self.0.list_vms_by_status(status)
        }
        fn list_all_vms(&self) -> flarevm_store::Result<Vec<Vm>> {
            self.0.list_all_vms()
        }
        fn record_metrics(
            &self,
            vm_id: &VmId,
            snapshot: &MetricsSnapshot,
            history_limit: usize,
        ) -> flarevm_store::Result<bool> {
            self.0.record_metrics(vm_id, snapshot, history_limit)
        }
        fn get_metrics(&self, vm_id: &VmId) -> flarevm_store::Result<Option<MetricsSnapshot>> {
            self.0.get_metrics(vm_id)
        }
        fn list_metrics_history(
            &self,
            vm_id: &VmId,
            limit: usize,
        ) -> flarevm_store::Result<Vec<MetricsSnapshot>> {
            self.0.list_metrics_history(vm_id, limit)
        }
        fn append_vm_log(&self, vm_id: &VmId, line: &VmLogLine) -> flarevm_store::Result<()> {
            self.0.append_vm_log(vm_id, line)
        }
        fn list_vm_logs(
            &self,
            vm_id: &VmId,
            tail: Option<usize>,
        ) -> flarevm_store::Result<Vec<VmLogLine>> {
            self.0.list_vm_logs(vm_id, tail)
        }
        fn append_history(
            &self,
            _entry: flarevm_store::NewHistoricEntry,
        ) -> flarevm_store::Result<flarevm_store::HistoricEntry> {
            Err(StoreError::Database("history is read-only".to_string()))
        }
        fn query_history(&self, query: &HistoryQuery) -> flarevm_store::Result<HistoryPage> {
            self.0.query_history(query)
        }
        fn create_user(&self, user: NewUser) -> flarevm_store::Result<User> {
            self.0.create_user(user)
        }
        fn update_user(&self, user: &User) -> flarevm_store::Result<()> {
            self.0.update_user(user)
        }
        fn get_user(&self, user_id: UserId) -> flarevm_store::Result<Option<User>> {
            self.0.get_user(user_id)
        }
        fn delete_user(&self, user_id: UserId) -> flarevm_store::Result<()> {
            self.0.delete_user(user_id)
        }
        fn list_users(&self) -> flarevm_store::Result<Vec<User>> {
            self.0.list_users()
        }
        fn put_image(&self, image: &SystemImage) -> flarevm_store::Result<()> {
            self.0.put_image(image)
        }
        fn get_image(&self, image_id: &ImageId) -> flarevm_store::Result<Option<SystemImage>> {
            self.0.get_image(image_id)
        }
        fn delete_image(&self, image_id: &ImageId) -> flarevm_store::Result<()> {
            self.0.delete_image(image_id)
        }
        fn list_images(&self) -> flarevm_store::Result<Vec<SystemImage>> {
            self.0.list_images()
        }
        fn put_offer(&self, offer: &VmOffer) -> flarevm_store::Result<()> {
            self.0.put_offer(offer)
        }
        fn get_offer(&self, offer_id: &OfferId) -> flarevm_store::Result<Option<VmOffer>> {
            self.0.get_offer(offer_id)
        }
        fn delete_offer(&self, offer_id: &OfferId) -> flarevm_store::Result<()> {
            self.0.delete_offer(offer_id)
        }
        fn list_offers(&self) -> flarevm_store::Result<Vec<VmOffer>> {
            self.0.list_offers()
        }
        fn put_ssh_key(&self, key: &SshKey) -> flarevm_store::Result<()> {
            self.0.put_ssh_key(key)
        }
        fn get_ssh_key(&self, key_id: &SshKeyId) -> flarevm_store::Result<Option<SshKey>> {
            self.0.get_ssh_key(key_id)
        }
        fn get_ssh_key_by_fingerprint(
            &self,
            fingerprint: &str,
        ) -> flarevm_store::Result<Option<SshKey>> {
            self.0.get_ssh_key_by_fingerprint(fingerprint)
        }
        fn delete_ssh_key(&self, key_id: &SshKeyId) -> flarevm_store::Result<()> {
            self.0.delete_ssh_key(key_id)
        }
        fn list_ssh_keys_by_user(&self, user_id: UserId) -> flarevm_store::Result<Vec<SshKey>> {
            self.0.list_ssh_keys_by_user(user_id)
        }
    }

    #[tokio::test]
    async fn audit_failures_do_not_block_lifecycle() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(NoHistoryStore(RocksStore::open(dir.path()).unwrap()));
        let admin = Actor::admin(UserId::new(1));
        let user = Actor::user(UserId::new(42));
        let config = test_config();
        seed_catalog(&*store, &admin, &config.host_architecture);

        let service = ControlPlaneService::new(store, Arc::new(MockHypervisor::new()), config);
        let vm = service.create_vm(&user, web("web-1")).await.unwrap();

        let mut status = vm.status;
        for _ in 0..200 {
            status = service.get_vm(&user, &vm.vm_id).await.unwrap().status;
            if status == VmStatus::Running && !service.locks.is_locked(&vm.vm_id) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(status, VmStatus::Running);

        // A rejected delete is audited too, and fails the same way
        assert!(service.delete_vm(&user, &vm.vm_id).await.is_err());

        assert_eq!(service.audit().failure_count(), 2);
        let dashboard = service.dashboard(&admin).await.unwrap();
        assert_eq!(dashboard.audit_failures, 2);
        assert_eq!(dashboard.total_vms, 1);
    }

    #[tokio::test]
    async fn dashboard_aggregates() {
        let f = setup();
        running_vm(&f, "a").await;
        let failed = {
            f.hv.fail_next(MockOp::Provision, 1, false);
            let vm = f.service.create_vm(&f.user, web("b")).await.unwrap();
            wait_for(&f.service, &vm.vm_id, VmStatus::Error).await
        };

        let dashboard = f.service.dashboard(&f.admin).await.unwrap();
        assert_eq!(dashboard.total_vms, 2);
        assert_eq!(dashboard.total_users, 1);
        assert_eq!(dashboard.vms_by_status["running"], 1);
        assert_eq!(dashboard.vms_by_status["error"], 1);
        assert_eq!(dashboard.vms_by_status["paused"], 0);
        assert_eq!(dashboard.allocated.vcpu_count, 4);
        assert_eq!(dashboard.allocated.memory_size_mib, 4096);
        assert_eq!(dashboard.audit_failures, 0);
        assert!(dashboard
            .recent_activity
            .iter()
            .any(|e| e.virtual_machine_id == failed.vm_id));

        assert!(f.service.dashboard(&f.user).await.is_err());
    }

    #[tokio::test]
    async fn catalog_in_use_conflicts() {
        let f = setup();
        let vm = f.service.create_vm(&f.user, web("web-1")).await.unwrap();

        assert!(matches!(
            f.service
                .delete_image(&f.admin, &vm.system_image_id)
                .await,
            Err(ControlError::Conflict(_))
        ));
        assert!(matches!(
            f.service.delete_offer(&f.admin, &vm.vm_offer_id).await,
            Err(ControlError::Conflict(_))
        ));
        assert!(matches!(
            f.service.delete_user(&f.admin, f.user.user_id).await,
            Err(ControlError::UserNotFound(_))
        ));
    }
}
