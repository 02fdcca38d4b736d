//! VM management endpoints.
//!
//! This module provides handlers for VM CRUD operations, lifecycle actions,
//! logs, metrics and the status event stream.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::Json;
use chrono::{DateTime, Utc};
use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::RecvError};

use flarevm_auth::JwtValidator;
use flarevm_control::{
    Actor, ControlError, ControlPlane, CreateVmRequest, MetricsSnapshot, UpdateVmRequest, Vm,
    VmEvent, VmLogLine, VmStatus,
};
use flarevm_core::{ImageId, OfferId, UserId, VmId};

use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::state::GatewayState;

/// Samples returned by the metrics history endpoint when no limit is given.
const DEFAULT_HISTORY_LIMIT: usize = 60;

// =============================================================================
// Request/Response Types
// =============================================================================

/// Response for a single VM.
#[derive(Debug, Serialize)]
pub struct VmResponse {
    /// VM ID.
    pub id: VmId,
    /// Owner.
    pub user_id: UserId,
    /// Name.
    pub name: String,
    /// Current status.
    pub status: VmStatus,
    /// Number of vCPUs.
    pub vcpu_count: u32,
    /// Guest memory in MiB.
    pub memory_size_mib: u32,
    /// Root disk size in GB.
    pub disk_size_gb: u32,
    /// Image the VM was provisioned from.
    pub system_image_id: ImageId,
    /// Offer the VM runs on.
    pub vm_offer_id: OfferId,
    /// Guest IP address.
    pub ip_address: String,
    /// Guest MAC address.
    pub mac_address: String,
    /// Host tap device.
    pub tap_device_name: String,
    /// Network namespace.
    pub network_namespace: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last update timestamp.
    pub updated_at: DateTime<Utc>,
    /// When the VM last reached `running`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the VM last reached `stopped`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<DateTime<Utc>>,
    /// Error message if the last action failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl From<Vm> for VmResponse {
    fn from(vm: Vm) -> Self {
        Self {
            id: vm.vm_id,
            user_id: vm.user_id,
            name: vm.name,
            status: vm.status,
            vcpu_count: vm.resources.vcpu_count,
            memory_size_mib: vm.resources.memory_size_mib,
            disk_size_gb: vm.resources.disk_size_gb,
            system_image_id: vm.system_image_id,
            vm_offer_id: vm.vm_offer_id,
            ip_address: vm.network.ip_address.to_string(),
            mac_address: vm.network.mac_address,
            tap_device_name: vm.network.tap_device_name,
            network_namespace: vm.network.network_namespace,
            created_at: vm.created_at,
            updated_at: vm.updated_at,
            started_at: vm.started_at,
            stopped_at: vm.stopped_at,
            error_message: vm.error_message,
        }
    }
}

/// Response for VM list.
#[derive(Debug, Serialize)]
pub struct ListVmsResponse {
    /// List of VMs.
    pub vms: Vec<VmResponse>,
}

/// Response for lifecycle operations (start, stop, etc.).
#[derive(Debug, Serialize)]
pub struct LifecycleResponse {
    /// VM ID.
    pub id: VmId,
    /// Status after the request was accepted.
    pub status: VmStatus,
}

impl From<Vm> for LifecycleResponse {
    fn from(vm: Vm) -> Self {
        Self {
            id: vm.vm_id,
            status: vm.status,
        }
    }
}

/// Query parameters for log retrieval.
#[derive(Debug, Deserialize)]
pub struct LogQuery {
    /// Only the last `tail` lines.
    #[serde(default)]
    pub tail: Option<usize>,
}

/// Response for VM logs.
#[derive(Debug, Serialize)]
pub struct LogsResponse {
    /// Log lines, oldest first.
    pub logs: Vec<VmLogLine>,
}

/// Query parameters for metrics history.
#[derive(Debug, Deserialize)]
pub struct HistoryLimit {
    /// Maximum number of samples.
    #[serde(default)]
    pub limit: Option<usize>,
}

/// Response for metrics history.
#[derive(Debug, Serialize)]
pub struct MetricsHistoryResponse {
    /// Samples, oldest first.
    pub samples: Vec<MetricsSnapshot>,
}

// =============================================================================
// Handlers
// =============================================================================

/// List the caller's VMs (every VM for admins).
///
/// # Errors
///
/// Returns an error if the control plane operation fails.
pub async fn list_vms<C, V>(
    State(state): State<Arc<GatewayState<C, V>>>,
    user: AuthUser,
) -> Result<impl IntoResponse, ApiError>
where
    C: ControlPlane + 'static,
    V: JwtValidator + 'static,
{
    let vms = state.control.list_vms(&user.actor()).await?;

    Ok(Json(ListVmsResponse {
        vms: vms.into_iter().map(VmResponse::from).collect(),
    }))
}

/// Create a VM. Responds `201` with the VM in `creating`.
///
/// # Errors
///
/// Returns an error if the request is invalid, the quota or network pool is
/// exhausted, or the name is taken.
pub async fn create_vm<C, V>(
    State(state): State<Arc<GatewayState<C, V>>>,
    user: AuthUser,
    Json(body): Json<CreateVmRequest>,
) -> Result<impl IntoResponse, ApiError>
where
    C: ControlPlane + 'static,
    V: JwtValidator + 'static,
{
    let vm = state.control.create_vm(&user.actor(), body).await?;

    Ok((StatusCode::CREATED, Json(VmResponse::from(vm))))
}

/// Get a single VM by ID.
///
/// # Errors
///
/// Returns an error if the VM is not found or the user doesn't own it.
pub async fn get_vm<C, V>(
    State(state): State<Arc<GatewayState<C, V>>>,
    user: AuthUser,
    Path(vm_id): Path<String>,
) -> Result<impl IntoResponse, ApiError>
where
    C: ControlPlane + 'static,
    V: JwtValidator + 'static,
{
    let vm_id = parse_vm_id(&vm_id)?;
    let vm = state.control.get_vm(&user.actor(), &vm_id).await?;

    Ok(Json(VmResponse::from(vm)))
}

/// Rename a VM or move a stopped VM to another offer.
///
/// # Errors
///
/// Returns an error if the VM is not found, the user doesn't own it, or the
/// update is not allowed in the current status.
pub async fn update_vm<C, V>(
    State(state): State<Arc<GatewayState<C, V>>>,
    user: AuthUser,
    Path(vm_id): Path<String>,
    Json(body): Json<UpdateVmRequest>,
) -> Result<impl IntoResponse, ApiError>
where
    C: ControlPlane + 'static,
    V: JwtValidator + 'static,
{
    let vm_id = parse_vm_id(&vm_id)?;
    let vm = state.control.update_vm(&user.actor(), &vm_id, body).await?;

    Ok(Json(VmResponse::from(vm)))
}

/// Delete a stopped or failed VM.
///
/// # Errors
///
/// Returns an error if the VM is not found, the user doesn't own it, or the
/// VM is not `stopped` or `error`.
pub async fn delete_vm<C, V>(
    State(state): State<Arc<GatewayState<C, V>>>,
    user: AuthUser,
    Path(vm_id): Path<String>,
) -> Result<impl IntoResponse, ApiError>
where
    C: ControlPlane + 'static,
    V: JwtValidator + 'static,
{
    let vm_id = parse_vm_id(&vm_id)?;
    state.control.delete_vm(&user.actor(), &vm_id).await?;

    Ok(StatusCode::NO_CONTENT)
}

/// Start a stopped VM.
///
/// # Errors
///
/// Returns an error if the VM is not found, the user doesn't own it,
/// or the state transition is invalid.
pub async fn start_vm<C, V>(
    State(state): State<Arc<GatewayState<C, V>>>,
    user: AuthUser,
    Path(vm_id): Path<String>,
) -> Result<impl IntoResponse, ApiError>
where
    C: ControlPlane + 'static,
    V: JwtValidator + 'static,
{
    let vm_id = parse_vm_id(&vm_id)?;
    let vm = state.control.start_vm(&user.actor(), &vm_id).await?;

    Ok((StatusCode::ACCEPTED, Json(LifecycleResponse::from(vm))))
}

/// Stop a running VM. Stopping a stopped VM succeeds without side effects.
///
/// # Errors
///
/// Returns an error if the VM is not found, the user doesn't own it,
/// or the state transition is invalid.
pub async fn stop_vm<C, V>(
    State(state): State<Arc<GatewayState<C, V>>>,
    user: AuthUser,
    Path(vm_id): Path<String>,
) -> Result<impl IntoResponse, ApiError>
where
    C: ControlPlane + 'static,
    V: JwtValidator + 'static,
{
    let vm_id = parse_vm_id(&vm_id)?;
    let vm = state.control.stop_vm(&user.actor(), &vm_id).await?;

    Ok((StatusCode::ACCEPTED, Json(LifecycleResponse::from(vm))))
}

/// Pause a running VM.
///
/// # Errors
///
/// Returns an error if the VM is not found, the user doesn't own it,
/// or the state transition is invalid.
pub async fn pause_vm<C, V>(
    State(state): State<Arc<GatewayState<C, V>>>,
    user: AuthUser,
    Path(vm_id): Path<String>,
) -> Result<impl IntoResponse, ApiError>
where
    C: ControlPlane + 'static,
    V: JwtValidator + 'static,
{
    let vm_id = parse_vm_id(&vm_id)?;
    let vm = state.control.pause_vm(&user.actor(), &vm_id).await?;

    Ok((StatusCode::ACCEPTED, Json(LifecycleResponse::from(vm))))
}

/// Resume a paused VM.
///
/// # Errors
///
/// Returns an error if the VM is not found, the user doesn't own it,
/// or the state transition is invalid.
pub async fn resume_vm<C, V>(
    State(state): State<Arc<GatewayState<C, V>>>,
    user: AuthUser,
    Path(vm_id): Path<String>,
) -> Result<impl IntoResponse, ApiError>
where
    C: ControlPlane + 'static,
    V: JwtValidator + 'static,
{
    let vm_id = parse_vm_id(&vm_id)?;
    let vm = state.control.resume_vm(&user.actor(), &vm_id).await?;

    Ok((StatusCode::ACCEPTED, Json(LifecycleResponse::from(vm))))
}

/// Get VM lifecycle logs.
///
/// # Errors
///
/// Returns an error if the VM is not found or the user doesn't own it.
pub async fn get_logs<C, V>(
    State(state): State<Arc<GatewayState<C, V>>>,
    user: AuthUser,
    Path(vm_id): Path<String>,
    Query(query): Query<LogQuery>,
) -> Result<impl IntoResponse, ApiError>
where
    C: ControlPlane + 'static,
    V: JwtValidator + 'static,
{
    let vm_id = parse_vm_id(&vm_id)?;
    let logs = state
        .control
        .vm_logs(&user.actor(), &vm_id, query.tail)
        .await?;

    Ok(Json(LogsResponse { logs }))
}

/// Get the latest metrics sample; zeroed if the VM was never sampled.
///
/// # Errors
///
/// Returns an error if the VM is not found or the user doesn't own it.
pub async fn get_metrics<C, V>(
    State(state): State<Arc<GatewayState<C, V>>>,
    user: AuthUser,
    Path(vm_id): Path<String>,
) -> Result<impl IntoResponse, ApiError>
where
    C: ControlPlane + 'static,
    V: JwtValidator + 'static,
{
    let vm_id = parse_vm_id(&vm_id)?;
    let metrics = state.control.vm_metrics(&user.actor(), &vm_id).await?;

    Ok(Json(metrics))
}

/// Get recent metrics samples.
///
/// # Errors
///
/// Returns an error if the VM is not found or the user doesn't own it.
pub async fn get_metrics_history<C, V>(
    State(state): State<Arc<GatewayState<C, V>>>,
    user: AuthUser,
    Path(vm_id): Path<String>,
    Query(query): Query<HistoryLimit>,
) -> Result<impl IntoResponse, ApiError>
where
    C: ControlPlane + 'static,
    V: JwtValidator + 'static,
{
    let vm_id = parse_vm_id(&vm_id)?;
    let limit = query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
    let samples = state
        .control
        .vm_metrics_history(&user.actor(), &vm_id, limit)
        .await?;

    Ok(Json(MetricsHistoryResponse { samples }))
}

/// Stream status changes of a VM as server-sent events.
///
/// The first event carries the current status. The stream ends after the
/// VM is deleted.
///
/// # Errors
///
/// Returns an error if the VM is not found or the user doesn't own it.
pub async fn vm_events<C, V>(
    State(state): State<Arc<GatewayState<C, V>>>,
    user: AuthUser,
    Path(vm_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError>
where
    C: ControlPlane + 'static,
    V: JwtValidator + 'static,
{
    let vm_id = parse_vm_id(&vm_id)?;

    // Subscribe before reading so no change falls between the two
    let rx = state.control.subscribe();
    let vm = state.control.get_vm(&user.actor(), &vm_id).await?;

    tracing::debug!(vm_id = %vm_id, user_id = %user.user_id, "Status stream opened");

    let current = VmEvent {
        vm_id,
        status: Some(vm.status),
        at: vm.updated_at,
    };

    let control = Arc::clone(&state.control);
    let actor = user.actor();
    let changes = stream::unfold(Some(rx), move |rx| {
        let control = Arc::clone(&control);
        async move {
            let mut rx = rx?;
            let event = next_status(&mut rx, &*control, &actor, vm_id).await?;
            let deleted = event.status.is_none();
            Some((event, if deleted { None } else { Some(rx) }))
        }
    });

    let events = stream::once(async move { current })
        .chain(changes)
        .map(|event| Ok::<_, Infallible>(status_event(&event)));

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

/// Wait for the next status change of `vm_id`.
///
/// If the receiver fell behind, the skipped events are replaced by a fresh
/// read of the VM. Returns `None` once no further status can be reported.
pub(crate) async fn next_status<C: ControlPlane>(
    rx: &mut broadcast::Receiver<VmEvent>,
    control: &C,
    actor: &Actor,
    vm_id: VmId,
) -> Option<VmEvent> {
    loop {
        match rx.recv().await {
            Ok(event) if event.vm_id == vm_id => return Some(event),
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                tracing::debug!(vm_id = %vm_id, skipped, "Status feed lagged, resyncing");
                return match current_status(control, actor, vm_id).await {
                    Ok(event) => Some(event),
                    Err(e) => {
                        tracing::warn!(vm_id = %vm_id, error = %e, "Status resync failed");
                        None
                    }
                };
            }
            Err(RecvError::Closed) => return None,
        }
    }
}

/// Re-read a VM's status. A deleted VM yields an event with no status.
///
/// # Errors
///
/// Returns an error if the VM cannot be read for any reason other than
/// being gone.
async fn current_status<C: ControlPlane>(
    control: &C,
    actor: &Actor,
    vm_id: VmId,
) -> Result<VmEvent, ControlError> {
    match control.get_vm(actor, &vm_id).await {
        Ok(vm) => Ok(VmEvent {
            vm_id,
            status: Some(vm.status),
            at: vm.updated_at,
        }),
        Err(ControlError::VmNotFound(_)) => Ok(VmEvent {
            vm_id,
            status: None,
            at: Utc::now(),
        }),
        Err(e) => Err(e),
    }
}

fn status_event(event: &VmEvent) -> Event {
    let name = if event.status.is_some() { "status" } else { "deleted" };
    Event::default()
        .event(name)
        .json_data(event)
        .unwrap_or_else(|_| Event::default().event(name))
}

// =============================================================================
// Helpers
// =============================================================================

/// Parse a VM ID from a string.
pub(crate) fn parse_vm_id(s: &str) -> Result<VmId, ApiError> {
    s.parse()
        .map_err(|_| ApiError::BadRequest(format!("invalid VM ID: {s}")))
}
