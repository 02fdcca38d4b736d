//! HTTP and WebSocket gateway for the flarevm Firecracker VM service.
//!
//! This crate provides the public-facing API for managing microVMs and the
//! catalog they are built from. It handles:
//!
//! - JWT authentication (HS256, or a mock validator in dev mode)
//! - REST endpoints for VMs, users, system images, offers and SSH keys
//! - Server-sent VM status events
//! - WebSocket relaying to VM serial consoles
//! - Admin audit history and dashboard
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Clients                              │
//! │              (HTTP / SSE / WebSocket terminal)              │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     flarevm-gateway                         │
//! │  ┌─────────────┐ ┌─────────────┐ ┌─────────────────────┐    │
//! │  │   Auth      │ │   Router    │ │    Terminal         │    │
//! │  │  Extractor  │ │  + Handlers │ │    Relay            │    │
//! │  └─────────────┘ └─────────────┘ └─────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!               ┌──────────────┼──────────────┐
//!               ▼              ▼              ▼
//!        ┌──────────┐   ┌──────────┐   ┌──────────┐
//!        │ Control  │   │  Auth    │   │   VM     │
//!        │ Plane    │   │ (JWT)    │   │ Consoles │
//!        └──────────┘   └──────────┘   └──────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use flarevm_gateway::{GatewayConfig, GatewayState, create_router};
//! use flarevm_control::{ControlPlaneService, NoopHypervisor, WsConsoleConnector};
//! use flarevm_auth::Hs256Validator;
//! use flarevm_store::RocksStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = GatewayConfig::from_env()?;
//!
//! // Initialize dependencies
//! let store = Arc::new(RocksStore::open(&config.data_dir)?);
//! let hypervisor = Arc::new(NoopHypervisor::new());
//! let control = Arc::new(ControlPlaneService::new(store, hypervisor, config.control_config()));
//! let jwt_validator = Arc::new(Hs256Validator::new(&config.auth_config()));
//! let console = Arc::new(WsConsoleConnector::new(config.console_port));
//!
//! // Create gateway state and router
//! let listen_addr = config.listen_addr.clone();
//! let state = GatewayState::new(control, jwt_validator, console, config);
//! let app = create_router(state);
//!
//! // Run server
//! let listener = tokio::net::TcpListener::bind(listen_addr).await?;
//! axum::serve(listener, app).await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod auth;
pub mod config;
pub mod error;
pub mod handlers;
pub mod routes;
pub mod state;

pub use config::{ConfigError, GatewayConfig};
pub use error::ApiError;
pub use routes::create_router;
pub use state::GatewayState;

// Re-export key types for convenience
pub use auth::AuthUser;
