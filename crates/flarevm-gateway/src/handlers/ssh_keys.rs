//! SSH key endpoints. Keys are always scoped to the caller.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;

use flarevm_auth::JwtValidator;
use flarevm_control::{ControlPlane, CreateSshKeyRequest, SshKey, UpdateSshKeyRequest};
use flarevm_core::SshKeyId;

use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::state::GatewayState;

/// Response for SSH key list.
#[derive(Debug, Serialize)]
pub struct ListSshKeysResponse {
    /// The caller's keys.
    pub ssh_keys: Vec<SshKey>,
}

/// List the caller's SSH keys.
///
/// # Errors
///
/// Returns an error if the control plane operation fails.
pub async fn list_ssh_keys<C, V>(
    State(state): State<Arc<GatewayState<C, V>>>,
    user: AuthUser,
) -> Result<impl IntoResponse, ApiError>
where
    C: ControlPlane + 'static,
    V: JwtValidator + 'static,
{
    let ssh_keys = state.control.list_ssh_keys(&user.actor()).await?;
    Ok(Json(ListSshKeysResponse { ssh_keys }))
}

/// Register an SSH public key.
///
/// # Errors
///
/// Returns an error if the key does not parse or is already registered.
pub async fn create_ssh_key<C, V>(
    State(state): State<Arc<GatewayState<C, V>>>,
    user: AuthUser,
    Json(body): Json<CreateSshKeyRequest>,
) -> Result<impl IntoResponse, ApiError>
where
    C: ControlPlane + 'static,
    V: JwtValidator + 'static,
{
    let key = state.control.create_ssh_key(&user.actor(), body).await?;
    Ok((StatusCode::CREATED, Json(key)))
}

/// Get an SSH key.
///
/// # Errors
///
/// Returns an error if the key is not found.
pub async fn get_ssh_key<C, V>(
    State(state): State<Arc<GatewayState<C, V>>>,
    user: AuthUser,
    Path(key_id): Path<String>,
) -> Result<impl IntoResponse, ApiError>
where
    C: ControlPlane + 'static,
    V: JwtValidator + 'static,
{
    let key_id = parse_key_id(&key_id)?;
    let key = state.control.get_ssh_key(&user.actor(), &key_id).await?;
    Ok(Json(key))
}

/// Rename an SSH key.
///
/// # Errors
///
/// Returns an error if the key is not found.
pub async fn update_ssh_key<C, V>(
    State(state): State<Arc<GatewayState<C, V>>>,
    user: AuthUser,
    Path(key_id): Path<String>,
    Json(body): Json<UpdateSshKeyRequest>,
) -> Result<impl IntoResponse, ApiError>
where
    C: ControlPlane + 'static,
    V: JwtValidator + 'static,
{
    let key_id = parse_key_id(&key_id)?;
    let key = state
        .control
        .update_ssh_key(&user.actor(), &key_id, body)
        .await?;
    Ok(Json(key))
}

/// Delete an SSH key.
///
/// # Errors
///
/// Returns an error if the key is not found.
pub async fn delete_ssh_key<C, V>(
    State(state): State<Arc<GatewayState<C, V>>>,
    user: AuthUser,
    Path(key_id): Path<String>,
) -> Result<impl IntoResponse, ApiError>
where
    C: ControlPlane + 'static,
    V: JwtValidator + 'static,
{
    let key_id = parse_key_id(&key_id)?;
    state.control.delete_ssh_key(&user.actor(), &key_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

fn parse_key_id(s: &str) -> Result<SshKeyId, ApiError> {
    s.parse()
        .map_err(|_| ApiError::BadRequest(format!("invalid SSH key ID: {s}")))
}
