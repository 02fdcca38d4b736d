//! User management endpoints.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;

use flarevm_auth::JwtValidator;
use flarevm_control::{ControlPlane, CreateUserRequest, UpdateUserRequest, User};
use flarevm_core::UserId;

use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::state::GatewayState;

/// Response for user list.
#[derive(Debug, Serialize)]
pub struct ListUsersResponse {
    /// List of users.
    pub users: Vec<User>,
}

/// List users (admin).
///
/// # Errors
///
/// Returns an error if the caller is not an admin.
pub async fn list_users<C, V>(
    State(state): State<Arc<GatewayState<C, V>>>,
    user: AuthUser,
) -> Result<impl IntoResponse, ApiError>
where
    C: ControlPlane + 'static,
    V: JwtValidator + 'static,
{
    let users = state.control.list_users(&user.actor()).await?;
    Ok(Json(ListUsersResponse { users }))
}

/// Create a user (admin).
///
/// # Errors
///
/// Returns an error if the caller is not an admin or the email is taken.
pub async fn create_user<C, V>(
    State(state): State<Arc<GatewayState<C, V>>>,
    user: AuthUser,
    Json(body): Json<CreateUserRequest>,
) -> Result<impl IntoResponse, ApiError>
where
    C: ControlPlane + 'static,
    V: JwtValidator + 'static,
{
    let created = state.control.create_user(&user.actor(), body).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// Get a user (admin or self).
///
/// # Errors
///
/// Returns an error if the user is not found or not visible to the caller.
pub async fn get_user<C, V>(
    State(state): State<Arc<GatewayState<C, V>>>,
    user: AuthUser,
    Path(user_id): Path<String>,
) -> Result<impl IntoResponse, ApiError>
where
    C: ControlPlane + 'static,
    V: JwtValidator + 'static,
{
    let user_id = parse_user_id(&user_id)?;
    let found = state.control.get_user(&user.actor(), user_id).await?;
    Ok(Json(found))
}

/// Update a user (admin or self).
///
/// # Errors
///
/// Returns an error if the user is not found or the change is not allowed.
pub async fn update_user<C, V>(
    State(state): State<Arc<GatewayState<C, V>>>,
    user: AuthUser,
    Path(user_id): Path<String>,
    Json(body): Json<UpdateUserRequest>,
) -> Result<impl IntoResponse, ApiError>
where
    C: ControlPlane + 'static,
    V: JwtValidator + 'static,
{
    let user_id = parse_user_id(&user_id)?;
    let updated = state
        .control
        .update_user(&user.actor(), user_id, body)
        .await?;
    Ok(Json(updated))
}

/// Delete a user who owns no VMs (admin).
///
/// # Errors
///
/// Returns an error if the user is not found or still owns VMs.
pub async fn delete_user<C, V>(
    State(state): State<Arc<GatewayState<C, V>>>,
    user: AuthUser,
    Path(user_id): Path<String>,
) -> Result<impl IntoResponse, ApiError>
where
    C: ControlPlane + 'static,
    V: JwtValidator + 'static,
{
    let user_id = parse_user_id(&user_id)?;
    state.control.delete_user(&user.actor(), user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

fn parse_user_id(s: &str) -> Result<UserId, ApiError> {
    s.parse()
        .map_err(|_| ApiError::BadRequest(format!("invalid user ID: {s}")))
}
