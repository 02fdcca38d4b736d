//! Internal API endpoints.
//!
//! These endpoints are called by agents inside the VMs. They are NOT exposed
//! externally and don't require JWT authentication.
//!
//! # Security
//!
//! Internal endpoints should only be reachable from the VM network.

use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;

use flarevm_auth::JwtValidator;
use flarevm_control::{ControlPlane, SshAuthRequest};

use crate::error::ApiError;
use crate::state::GatewayState;

/// Check an SSH key presented to a VM's SSH daemon.
///
/// Called by the in-VM authorized-keys hook with the key's fingerprint (or
/// the key itself) and the VM being logged into. Records `last_used_at` on
/// success.
///
/// # Errors
///
/// Returns `404` for an unknown key and `403` if the key's owner may not
/// access the VM.
pub async fn ssh_auth<C, V>(
    State(state): State<Arc<GatewayState<C, V>>>,
    Json(body): Json<SshAuthRequest>,
) -> Result<impl IntoResponse, ApiError>
where
    C: ControlPlane + 'static,
    V: JwtValidator + 'static,
{
    match state.control.authenticate_ssh_key(body).await {
        Ok(response) => {
            tracing::info!(
                user_id = %response.user_id,
                key_id = %response.key_id,
                "SSH key accepted"
            );
            Ok(Json(response))
        }
        Err(e) => {
            tracing::warn!(error = %e, "SSH key rejected");
            Err(e.into())
        }
    }
}
