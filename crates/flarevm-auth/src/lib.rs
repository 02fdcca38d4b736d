//! JWT authentication for flarevm.
//!
//! Sessions are issued by an external authentication service. This crate
//! only validates the propagated identity: an HS256-signed JWT whose `sub`
//! claim is the numeric user ID and whose `role` claim is `user` or `admin`.
//!
//! # Example
//!
//! ```no_run
//! use flarevm_auth::{AuthConfig, Hs256Validator, JwtValidator};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AuthConfig {
//!     secret: "change-me".to_string(),
//!     issuer: "flarevm-auth".to_string(),
//!     audience: "flarevm".to_string(),
//! };
//!
//! let validator = Hs256Validator::new(&config);
//!
//! // In a request handler:
//! let token = "eyJhbGciOiJIUzI1NiIsInR5cCI6IkpXVCJ9...";
//! let claims = validator.validate(token).await?;
//!
//! println!("User ID: {}", claims.user_id);
//! println!("Admin: {}", claims.actor().is_admin());
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod jwt;

pub use error::{AuthError, Result};
pub use jwt::{Hs256Validator, JwtValidator, ValidatedClaims};

#[cfg(any(test, feature = "test-utils"))]
pub use jwt::MockJwtValidator;

/// Configuration for validating tokens from the authentication service.
#[derive(Clone)]
pub struct AuthConfig {
    /// Shared HMAC secret.
    pub secret: String,
    /// Expected JWT issuer (`iss` claim).
    pub issuer: String,
    /// Expected JWT audience (`aud` claim).
    pub audience: String,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("secret", &"<redacted>")
            .field("issuer", &self.issuer)
            .field("audience", &self.audience)
            .finish()
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            issuer: "flarevm-auth".to_string(),
            audience: "flarevm".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = AuthConfig::default();
        assert_eq!(config.issuer, "flarevm-auth");
        assert_eq!(config.audience, "flarevm");
    }

    #[test]
    fn debug_redacts_secret() {
        let config = AuthConfig {
            secret: "hunter2".to_string(),
            ..AuthConfig::default()
        };
        assert!(!format!("{config:?}").contains("hunter2"));
    }

    #[test]
    fn auth_error_status_codes() {
        assert_eq!(AuthError::MissingToken.http_status_code(), 401);
        assert_eq!(AuthError::TokenExpired.http_status_code(), 401);
        assert_eq!(AuthError::InvalidSignature.http_status_code(), 401);
        assert_eq!(AuthError::InvalidRole("root".into()).http_status_code(), 403);
        assert_eq!(AuthError::Internal("test".into()).http_status_code(), 500);
    }

    #[test]
    fn auth_error_retriable() {
        assert!(AuthError::TokenExpired.is_retriable());
        assert!(!AuthError::InvalidSignature.is_retriable());
        assert!(!AuthError::MissingToken.is_retriable());
    }
}
