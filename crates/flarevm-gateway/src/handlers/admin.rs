//! Admin endpoints: audit history and dashboard.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;

use flarevm_auth::JwtValidator;
use flarevm_control::{ControlPlane, HistoryAction, HistoryQuery, HistoryStatus};

use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::state::GatewayState;

const DEFAULT_PER_PAGE: u32 = 20;
const MAX_PER_PAGE: u32 = 100;

/// Query parameters of `GET /admin/vm-history`.
///
/// Values are taken as strings so that malformed filters produce the
/// standard error body.
#[derive(Debug, Default, Deserialize)]
pub struct VmHistoryParams {
    /// Owner user ID.
    #[serde(default)]
    pub user: Option<String>,
    /// VM ID.
    #[serde(default)]
    pub vm: Option<String>,
    /// Action name (`create`, `stop`, ...).
    #[serde(default)]
    pub action: Option<String>,
    /// Outcome (`success`, `error`, `warning`).
    #[serde(default)]
    pub status: Option<String>,
    /// Free-text search over details and VM name.
    #[serde(default)]
    pub search: Option<String>,
    /// 1-based page.
    #[serde(default)]
    pub page: Option<u32>,
    /// Entries per page.
    #[serde(default)]
    pub per_page: Option<u32>,
}

impl VmHistoryParams {
    /// Convert the parameters into a store query.
    ///
    /// # Errors
    ///
    /// Returns `BadRequest` for an unparseable filter.
    pub fn into_query(self) -> Result<HistoryQuery, ApiError> {
        let present = |value: Option<String>| value.filter(|v| !v.trim().is_empty());

        let user_id = present(self.user)
            .map(|v| {
                v.trim()
                    .parse()
                    .map_err(|_| ApiError::BadRequest(format!("invalid user filter: {v}")))
            })
            .transpose()?;
        let vm_id = present(self.vm)
            .map(|v| {
                v.trim()
                    .parse()
                    .map_err(|_| ApiError::BadRequest(format!("invalid VM filter: {v}")))
            })
            .transpose()?;
        let action = present(self.action)
            .map(|v| parse_enum::<HistoryAction>(&v, "action"))
            .transpose()?;
        let status = present(self.status)
            .map(|v| parse_enum::<HistoryStatus>(&v, "status"))
            .transpose()?;

        Ok(HistoryQuery {
            user_id,
            vm_id,
            action,
            status,
            search: present(self.search),
            page: self.page.unwrap_or(1).max(1),
            per_page: self
                .per_page
                .unwrap_or(DEFAULT_PER_PAGE)
                .clamp(1, MAX_PER_PAGE),
        })
    }
}

/// Parse a snake_case enum name through its serde representation.
fn parse_enum<T: serde::de::DeserializeOwned>(value: &str, what: &str) -> Result<T, ApiError> {
    serde_json::from_value(serde_json::Value::String(value.trim().to_lowercase()))
        .map_err(|_| ApiError::BadRequest(format!("invalid {what} filter: {value}")))
}

/// Query the audit history, newest first (admin).
///
/// # Errors
///
/// Returns an error if the caller is not an admin or a filter is malformed.
pub async fn vm_history<C, V>(
    State(state): State<Arc<GatewayState<C, V>>>,
    user: AuthUser,
    Query(params): Query<VmHistoryParams>,
) -> Result<impl IntoResponse, ApiError>
where
    C: ControlPlane + 'static,
    V: JwtValidator + 'static,
{
    let query = params.into_query()?;
    let page = state.control.query_history(&user.actor(), query).await?;
    Ok(Json(page))
}

/// Dashboard statistics (admin).
///
/// # Errors
///
/// Returns an error if the caller is not an admin.
pub async fn dashboard<C, V>(
    State(state): State<Arc<GatewayState<C, V>>>,
    user: AuthUser,
) -> Result<impl IntoResponse, ApiError>
where
    C: ControlPlane + 'static,
    V: JwtValidator + 'static,
{
    let dashboard = state.control.dashboard(&user.actor()).await?;
    Ok(Json(dashboard))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flarevm_core::UserId;

    #[test]
    fn history_params() {
        let query = VmHistoryParams {
            user: Some("42".into()),
            action: Some("delete".into()),
            ..Default::default()
        }
        .into_query()
        .unwrap();

        assert_eq!(query.user_id, Some(UserId::new(42)));
        assert_eq!(query.action, Some(HistoryAction::Delete));
        assert_eq!(query.page, 1);
        assert_eq!(query.per_page, DEFAULT_PER_PAGE);
    }

    #[test]
    fn history_params_clamp_and_ignore_blank() {
        let query = VmHistoryParams {
            status: Some("Error".into()),
            search: Some(String::new()),
            page: Some(0),
            per_page: Some(10_000),
            ..Default::default()
        }
        .into_query()
        .unwrap();

        assert_eq!(query.status, Some(HistoryStatus::Error));
        assert!(query.search.is_none());
        assert_eq!(query.page, 1);
        assert_eq!(query.per_page, MAX_PER_PAGE);
    }

    #[test]
    fn history_params_reject_garbage() {
        let bad_action = VmHistoryParams {
            action: Some("reboot".into()),
            ..Default::default()
        };
        assert!(bad_action.into_query().is_err());

        let bad_vm = VmHistoryParams {
            vm: Some("not-a-uuid".into()),
            ..Default::default()
        };
        assert!(bad_vm.into_query().is_err());
    }
}
