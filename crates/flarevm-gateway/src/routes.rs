//! Router configuration.
//!
//! This module sets up the Axum router with all routes and middleware.

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use flarevm_auth::JwtValidator;
use flarevm_control::ControlPlane;

use crate::handlers::{admin, catalog, health, internal, ssh_keys, terminal, users, vms};
use crate::state::GatewayState;

/// Create the gateway router with all routes and middleware.
///
/// # Routes
///
/// ## Public
/// - `GET /health` - Health check
///
/// ## VMs (authenticated)
/// - `GET /vms`, `POST /vms`
/// - `GET /vms/:id`, `PUT /vms/:id`, `DELETE /vms/:id`
/// - `POST /vms/:id/start|stop|pause|resume`
/// - `GET /vms/:id/logs?tail=`
/// - `GET /vms/:id/metrics`, `GET /vms/:id/metrics/history?limit=`
/// - `GET /vms/:id/events` - Server-sent status events
///
/// ## Accounts and catalog (authenticated)
/// - `GET|POST /users`, `GET|PUT|DELETE /users/:id`
/// - `GET|POST /system-images`, `GET|PUT|DELETE /system-images/:id`
/// - `GET|POST /vm-offers`, `GET|PUT|DELETE /vm-offers/:id`
/// - `GET|POST /ssh-keys`, `GET|PUT|DELETE /ssh-keys/:id`
///
/// ## Admin
/// - `GET /admin/vm-history`
/// - `GET /admin/dashboard`
///
/// ## Internal (unauthenticated, VM network only)
/// - `POST /internal/ssh-auth`
///
/// ## WebSocket
/// - `GET /api/terminal/:id` - Serial console relay
pub fn create_router<C, V>(state: GatewayState<C, V>) -> Router
where
    C: ControlPlane + 'static,
    V: JwtValidator + 'static,
{
    // Extract config values before moving state
    let cors = build_cors_layer(&state.config.cors_origins);
    let max_body_bytes = state.config.max_body_bytes;
    let request_timeout = state.config.request_timeout();

    let state = Arc::new(state);

    Router::new()
        // Health (public)
        .route("/health", get(health::health))
        // VMs
        .route(
            "/vms",
            get(vms::list_vms::<C, V>).post(vms::create_vm::<C, V>),
        )
        .route(
            "/vms/:id",
            get(vms::get_vm::<C, V>)
                .put(vms::update_vm::<C, V>)
                .delete(vms::delete_vm::<C, V>),
        )
        .route("/vms/:id/start", post(vms::start_vm::<C, V>))
        .route("/vms/:id/stop", post(vms::stop_vm::<C, V>))
        .route("/vms/:id/pause", post(vms::pause_vm::<C, V>))
        .route("/vms/:id/resume", post(vms::resume_vm::<C, V>))
        .route("/vms/:id/logs", get(vms::get_logs::<C, V>))
        .route("/vms/:id/metrics", get(vms::get_metrics::<C, V>))
        .route(
            "/vms/:id/metrics/history",
            get(vms::get_metrics_history::<C, V>),
        )
        .route("/vms/:id/events", get(vms::vm_events::<C, V>))
        // Users
        .route(
            "/users",
            get(users::list_users::<C, V>).post(users::create_user::<C, V>),
        )
        .route(
            "/users/:id",
            get(users::get_user::<C, V>)
                .put(users::update_user::<C, V>)
                .delete(users::delete_user::<C, V>),
        )
        // Catalog
        .route(
            "/system-images",
            get(catalog::list_images::<C, V>).post(catalog::create_image::<C, V>),
        )
        .route(
            "/system-images/:id",
            get(catalog::get_image::<C, V>)
                .put(catalog::update_image::<C, V>)
                .delete(catalog::delete_image::<C, V>),
        )
        .route(
            "/vm-offers",
            get(catalog::list_offers::<C, V>).post(catalog::create_offer::<C, V>),
        )
        .route(
            "/vm-offers/:id",
            get(catalog::get_offer::<C, V>)
                .put(catalog::update_offer::<C, V>)
                .delete(catalog::delete_offer::<C, V>),
        )
        // SSH keys
        .route(
            "/ssh-keys",
            get(ssh_keys::list_ssh_keys::<C, V>).post(ssh_keys::create_ssh_key::<C, V>),
        )
        .route(
            "/ssh-keys/:id",
            get(ssh_keys::get_ssh_key::<C, V>)
                .put(ssh_keys::update_ssh_key::<C, V>)
                .delete(ssh_keys::delete_ssh_key::<C, V>),
        )
        // Admin
        .route("/admin/vm-history", get(admin::vm_history::<C, V>))
        .route("/admin/dashboard", get(admin::dashboard::<C, V>))
        // Internal
        .route("/internal/ssh-auth", post(internal::ssh_auth::<C, V>))
        // WebSocket
        .route(
            "/api/terminal/:id",
            get(terminal::terminal_handler::<C, V>),
        )
        // Middleware
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors)
                .layer(RequestBodyLimitLayer::new(max_body_bytes))
                .layer(TimeoutLayer::new(request_timeout)),
        )
        .with_state(state)
}

/// Build the CORS layer from configured origins.
fn build_cors_layer(origins: &[String]) -> CorsLayer {
    if origins.iter().any(|o| o == "*") {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<_> = origins.iter().filter_map(|o| o.parse().ok()).collect();

        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}
