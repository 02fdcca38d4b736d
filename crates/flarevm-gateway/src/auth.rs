//! Authentication middleware and extractors.
//!
//! This module provides the `AuthUser` extractor that validates JWT tokens
//! and extracts the caller's identity from requests.

use std::sync::Arc;

use axum::extract::{FromRequestParts, Query};
use axum::http::request::Parts;
use serde::Deserialize;

use flarevm_auth::{AuthError, JwtValidator, ValidatedClaims};
use flarevm_control::ControlPlane;
use flarevm_core::{Actor, Role, UserId};

use crate::error::ApiError;
use crate::state::GatewayState;

/// An authenticated user extracted from a JWT token.
///
/// The token is read from the `Authorization: Bearer <token>` header, or
/// from a `token` query parameter for WebSocket upgrades, where browsers
/// cannot set headers.
#[derive(Debug, Clone, Copy)]
pub struct AuthUser {
    /// The user ID from the `sub` claim.
    pub user_id: UserId,
    /// The account role.
    pub role: Role,
}

impl AuthUser {
    /// Create an `AuthUser` from validated claims.
    #[must_use]
    pub const fn from_claims(claims: &ValidatedClaims) -> Self {
        Self {
            user_id: claims.user_id,
            role: claims.role,
        }
    }

    /// The actor for control plane calls.
    #[must_use]
    pub const fn actor(&self) -> Actor {
        Actor {
            user_id: self.user_id,
            role: self.role,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

/// Find the bearer token of a request.
fn bearer_token(parts: &Parts) -> Option<String> {
    let from_header = parts
        .headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty());

    if let Some(token) = from_header {
        return Some(token.to_string());
    }

    Query::<TokenQuery>::try_from_uri(&parts.uri)
        .ok()
        .and_then(|Query(query)| query.token)
        .filter(|t| !t.is_empty())
}

impl<C, V> FromRequestParts<Arc<GatewayState<C, V>>> for AuthUser
where
    C: ControlPlane + 'static,
    V: JwtValidator + 'static,
{
    type Rejection = ApiError;

    fn from_request_parts<'life0, 'life1, 'async_trait>(
        parts: &'life0 mut Parts,
        state: &'life1 Arc<GatewayState<C, V>>,
    ) -> ::core::pin::Pin<
        Box<
            dyn ::core::future::Future<Output = Result<Self, Self::Rejection>>
                + ::core::marker::Send
                + 'async_trait,
        >,
    >
    where
        'life0: 'async_trait,
        'life1: 'async_trait,
        Self: 'async_trait,
    {
        Box::pin(async move {
            let token = bearer_token(parts).ok_or(AuthError::MissingToken)?;

            let claims = state.jwt_validator.validate(&token).await?;

            Ok(AuthUser::from_claims(&claims))
        })
    }
}
