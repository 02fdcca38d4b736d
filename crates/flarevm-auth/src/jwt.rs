//! JWT validation and claims extraction.
//!
//! This module provides the core JWT validation logic, including signature
//! verification and claims validation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;

use flarevm_core::{Actor, Role, UserId};

use crate::error::{AuthError, Result};
use crate::AuthConfig;

/// Validated claims extracted from a JWT.
#[derive(Debug, Clone)]
pub struct ValidatedClaims {
    /// The user ID extracted from the `sub` claim.
    pub user_id: UserId,
    /// The account role.
    pub role: Role,
    /// When the token expires.
    pub expires_at: DateTime<Utc>,
}

impl ValidatedClaims {
    /// The actor these claims authenticate.
    #[must_use]
    pub const fn actor(&self) -> Actor {
        Actor {
            user_id: self.user_id,
            role: self.role,
        }
    }
}

/// Trait for validating JWTs.
#[async_trait]
pub trait JwtValidator: Send + Sync {
    /// Validate a JWT and extract claims.
    ///
    /// # Errors
    ///
    /// Returns an error if the token is invalid, expired, or cannot be validated.
    async fn validate(&self, token: &str) -> Result<ValidatedClaims>;
}

/// Raw claims from a JWT before validation.
#[derive(Debug, Deserialize)]
struct RawClaims {
    /// Subject (numeric user ID, as a string or a number)
    sub: Subject,
    /// Account role; absent means a regular user
    #[serde(default)]
    role: Option<String>,
    /// Expiration timestamp
    exp: u64,
}

/// Subject claim that can be either a string or a number.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Subject {
    Text(String),
    Number(u64),
}

impl Subject {
    fn user_id(&self) -> Result<UserId> {
        match self {
            Self::Text(s) => s.parse().map_err(|_| AuthError::InvalidUserId),
            Self::Number(n) => Ok(UserId::new(*n)),
        }
    }
}

fn parse_role(role: Option<&str>) -> Result<Role> {
    match role {
        None => Ok(Role::User),
        Some(role) => Role::parse(role).ok_or_else(|| AuthError::InvalidRole(role.to_string())),
    }
}

/// HMAC-SHA256 JWT validator.
///
/// Validates tokens signed by the authentication service with a shared
/// secret, checking expiry, issuer and audience.
pub struct Hs256Validator {
    key: DecodingKey,
    validation: Validation,
}

impl Hs256Validator {
    /// Create a new validator from the shared configuration.
    #[must_use]
    pub fn new(config: &AuthConfig) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[config.issuer.as_str()]);
        validation.set_audience(&[config.audience.as_str()]);
        validation.validate_exp = true;

        Self {
            key: DecodingKey::from_secret(config.secret.as_bytes()),
            validation,
        }
    }
}

#[async_trait]
impl JwtValidator for Hs256Validator {
    async fn validate(&self, token: &str) -> Result<ValidatedClaims> {
        let token_data =
            decode::<RawClaims>(token, &self.key, &self.validation).map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                jsonwebtoken::errors::ErrorKind::InvalidIssuer => AuthError::InvalidIssuer,
                jsonwebtoken::errors::ErrorKind::InvalidAudience => AuthError::InvalidAudience,
                jsonwebtoken::errors::ErrorKind::InvalidSignature => AuthError::InvalidSignature,
                _ => AuthError::InvalidToken(e.to_string()),
            })?;

        let claims = token_data.claims;
        let user_id = claims.sub.user_id()?;
        let role = parse_role(claims.role.as_deref())?;

        // Convert expiration timestamp
        let exp_secs = i64::try_from(claims.exp).unwrap_or(i64::MAX);
        let expires_at = DateTime::from_timestamp(exp_secs, 0)
            .ok_or_else(|| AuthError::InvalidToken("invalid exp timestamp".to_string()))?;

        tracing::trace!(%user_id, role = role.as_str(), "Validated token");

        Ok(ValidatedClaims {
            user_id,
            role,
            expires_at,
        })
    }
}

/// A mock JWT validator for testing.
///
/// This validator accepts any token in the format `test-token:<user_id>:<role>`
/// and extracts the identity from it.
#[cfg(any(test, feature = "test-utils"))]
#[derive(Debug, Default)]
pub struct MockJwtValidator;

#[cfg(any(test, feature = "test-utils"))]
#[async_trait]
impl JwtValidator for MockJwtValidator {
    async fn validate(&self, token: &str) -> Result<ValidatedClaims> {
        // Expected format: test-token:<user_id>:<role>
        let rest = token.strip_prefix("test-token:").ok_or_else(|| {
            AuthError::InvalidToken("expected test-token:<user_id>:<role>".to_string())
        })?;

        let Some((user_id, role)) = rest.split_once(':') else {
            return Err(AuthError::InvalidToken(
                "expected test-token:<user_id>:<role>".to_string(),
            ));
        };

        let user_id = user_id.parse().map_err(|_| AuthError::InvalidUserId)?;
        let role = parse_role(Some(role))?;

        Ok(ValidatedClaims {
            user_id,
            role,
            expires_at: Utc::now() + chrono::Duration::hours(1),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const SECRET: &str = "test-secret";

    fn config() -> AuthConfig {
        AuthConfig {
            secret: SECRET.to_string(),
            issuer: "flarevm-auth".to_string(),
            audience: "flarevm".to_string(),
        }
    }

    fn sign(claims: &serde_json::Value, secret: &str) -> String {
        encode(
            &Header::new(Algorithm::HS256),
            claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn future_exp() -> i64 {
        (Utc::now() + chrono::Duration::hours(1)).timestamp()
    }

    #[tokio::test]
    async fn hs256_accepts_valid_token() {
        let validator = Hs256Validator::new(&config());
        let token = sign(
            &serde_json::json!({
                "sub": "42",
                "role": "admin",
                "iss": "flarevm-auth",
                "aud": "flarevm",
                "exp": future_exp(),
            }),
            SECRET,
        );

        let claims = validator.validate(&token).await.unwrap();
        assert_eq!(claims.user_id, UserId::new(42));
        assert_eq!(claims.role, Role::Admin);
        assert!(claims.actor().is_admin());
    }

    #[tokio::test]
    async fn hs256_accepts_numeric_subject_and_defaults_role() {
        let validator = Hs256Validator::new(&config());
        let token = sign(
            &serde_json::json!({
                "sub": 7,
                "iss": "flarevm-auth",
                "aud": ["flarevm", "other"],
                "exp": future_exp(),
            }),
            SECRET,
        );

        let claims = validator.validate(&token).await.unwrap();
        assert_eq!(claims.user_id, UserId::new(7));
        assert_eq!(claims.role, Role::User);
    }

    #[tokio::test]
    async fn hs256_rejects_wrong_secret() {
        let validator = Hs256Validator::new(&config());
        let token = sign(
            &serde_json::json!({
                "sub": "42",
                "iss": "flarevm-auth",
                "aud": "flarevm",
                "exp": future_exp(),
            }),
            "other-secret",
        );

        let result = validator.validate(&token).await;
        assert!(matches!(result, Err(AuthError::InvalidSignature)));
    }

    #[tokio::test]
    async fn hs256_rejects_expired() {
        let validator = Hs256Validator::new(&config());
        let token = sign(
            &serde_json::json!({
                "sub": "42",
                "iss": "flarevm-auth",
                "aud": "flarevm",
                "exp": (Utc::now() - chrono::Duration::hours(1)).timestamp(),
            }),
            SECRET,
        );

        let result = validator.validate(&token).await;
        assert!(matches!(result, Err(AuthError::TokenExpired)));
    }

    #[tokio::test]
    async fn hs256_rejects_wrong_audience_and_issuer() {
        let validator = Hs256Validator::new(&config());

        let token = sign(
            &serde_json::json!({
                "sub": "42",
                "iss": "flarevm-auth",
                "aud": "someone-else",
                "exp": future_exp(),
            }),
            SECRET,
        );
        assert!(matches!(
            validator.validate(&token).await,
            Err(AuthError::InvalidAudience)
        ));

        let token = sign(
            &serde_json::json!({
                "sub": "42",
                "iss": "mallory",
                "aud": "flarevm",
                "exp": future_exp(),
            }),
            SECRET,
        );
        assert!(matches!(
            validator.validate(&token).await,
            Err(AuthError::InvalidIssuer)
        ));
    }

    #[tokio::test]
    async fn hs256_rejects_bad_subject_and_role() {
        let validator = Hs256Validator::new(&config());

        let token = sign(
            &serde_json::json!({
                "sub": "alice",
                "iss": "flarevm-auth",
                "aud": "flarevm",
                "exp": future_exp(),
            }),
            SECRET,
        );
        assert!(matches!(
            validator.validate(&token).await,
            Err(AuthError::InvalidUserId)
        ));

        let token = sign(
            &serde_json::json!({
                "sub": "42",
                "role": "root",
                "iss": "flarevm-auth",
                "aud": "flarevm",
                "exp": future_exp(),
            }),
            SECRET,
        );
        assert!(matches!(
            validator.validate(&token).await,
            Err(AuthError::InvalidRole(_))
        ));
    }

    #[tokio::test]
    async fn mock_validator_works() {
        let validator = MockJwtValidator;

        let claims = validator.validate("test-token:42:user").await.unwrap();
        assert_eq!(claims.user_id, UserId::new(42));
        assert_eq!(claims.role, Role::User);

        let claims = validator.validate("test-token:1:admin").await.unwrap();
        assert!(claims.actor().is_admin());
    }

    #[tokio::test]
    async fn mock_validator_rejects_invalid() {
        let validator = MockJwtValidator;

        assert!(validator.validate("invalid-token").await.is_err());
        assert!(validator.validate("test-token:42").await.is_err());
        assert!(validator.validate("test-token:abc:user").await.is_err());
    }
}
