//! Gateway application state.
//!
//! This module defines the shared state that is available to all request handlers.

use std::sync::Arc;

use flarevm_auth::JwtValidator;
use flarevm_control::{ConsoleConnector, ControlPlane};

use crate::config::GatewayConfig;

/// Shared application state for the gateway.
///
/// This struct holds references to all services needed by the HTTP handlers.
pub struct GatewayState<C, V>
where
    C: ControlPlane,
    V: JwtValidator,
{
    /// The control plane for VM lifecycle operations.
    pub control: Arc<C>,
    /// The JWT validator for authentication.
    pub jwt_validator: Arc<V>,
    /// Opens serial console sessions for the terminal proxy.
    pub console: Arc<dyn ConsoleConnector>,
    /// Gateway configuration.
    pub config: GatewayConfig,
}

impl<C, V> GatewayState<C, V>
where
    C: ControlPlane,
    V: JwtValidator,
{
    /// Create a new gateway state.
    #[must_use]
    pub fn new(
        control: Arc<C>,
        jwt_validator: Arc<V>,
        console: Arc<dyn ConsoleConnector>,
        config: GatewayConfig,
    ) -> Self {
        Self {
            control,
            jwt_validator,
            console,
            config,
        }
    }
}

impl<C, V> Clone for GatewayState<C, V>
where
    C: ControlPlane,
    V: JwtValidator,
{
    fn clone(&self) -> Self {
        Self {
            control: Arc::clone(&self.control),
            jwt_validator: Arc::clone(&self.jwt_validator),
            console: Arc::clone(&self.console),
            config: self.config.clone(),
        }
    }
}
