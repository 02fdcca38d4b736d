//! flarevm gateway - HTTP/WebSocket API for Firecracker VMs
//!
//! This is the main entry point for the gateway service. The control plane,
//! metrics collector and audit log run embedded in this process.
//!
//! # Dev Mode
//!
//! Build with `--features dev-mode` to use a mock JWT validator that needs
//! no signing secret. Use tokens in format: `test-token:<user_id>:<role>`
//!
//! # Hypervisor
//!
//! Set `HYPERVISOR_URL` to the host agent driving Firecracker. If not set,
//! the gateway runs against a no-op hypervisor (API-only mode).

use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[cfg(not(feature = "dev-mode"))]
use flarevm_auth::Hs256Validator;
#[cfg(feature = "dev-mode")]
use flarevm_auth::MockJwtValidator;
use flarevm_control::{
    ControlPlane, ControlPlaneService, HttpHypervisorClient, Hypervisor, NoopHypervisor,
    WsConsoleConnector,
};
use flarevm_gateway::{create_router, GatewayConfig, GatewayState};
use flarevm_store::RocksStore;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,flarevm=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting flarevm gateway");

    let config = GatewayConfig::from_env()?;

    tracing::info!(
        listen_addr = %config.listen_addr,
        data_dir = %config.data_dir,
        hypervisor_url = ?config.hypervisor_url,
        network_namespace = %config.network_namespace,
        network_subnet = %config.network_subnet,
        network_capacity = config.network_capacity,
        "Gateway configuration loaded"
    );

    // Initialize RocksDB store
    tracing::info!(path = %config.data_dir, "Opening RocksDB store");
    let store = Arc::new(RocksStore::open(&config.data_dir)?);

    match config.hypervisor_url.clone() {
        Some(url) => {
            tracing::info!(hypervisor_url = %url, "Hypervisor integration enabled");
            let hypervisor = Arc::new(HttpHypervisorClient::new(url)?);
            run(config, store, hypervisor).await
        }
        None => {
            tracing::warn!("No HYPERVISOR_URL set - VMs will not actually boot");
            run(config, store, Arc::new(NoopHypervisor::new())).await
        }
    }
}

async fn run<H: Hypervisor + 'static>(
    config: GatewayConfig,
    store: Arc<RocksStore>,
    hypervisor: Arc<H>,
) -> Result<(), Box<dyn std::error::Error>> {
    let control = Arc::new(ControlPlaneService::new(
        store,
        hypervisor,
        config.control_config(),
    ));

    // Repair VMs left mid-transition by a previous run
    let repaired = control.reconcile().await?;
    tracing::info!(repaired, "Control plane initialized");

    let collector = Arc::new(control.metrics_collector()).spawn();
    tracing::info!(
        interval_seconds = config.metrics_interval_seconds,
        "Metrics collector started"
    );

    let console = Arc::new(WsConsoleConnector::new(config.console_port));

    // Initialize JWT validator
    #[cfg(feature = "dev-mode")]
    let jwt_validator = {
        tracing::warn!("DEV MODE ENABLED - using mock JWT validator");
        tracing::warn!("Use tokens in format: test-token:<user_id>:<role>");
        Arc::new(MockJwtValidator)
    };

    #[cfg(not(feature = "dev-mode"))]
    let jwt_validator = Arc::new(Hs256Validator::new(&config.auth_config()));
    tracing::info!("JWT validator initialized");

    let listen_addr = config.listen_addr.clone();
    let state = GatewayState::new(control, jwt_validator, console, config);
    let app = create_router(state);
    tracing::info!("Router configured with all API endpoints");

    // Start HTTP server
    tracing::info!(listen_addr = %listen_addr, "Starting HTTP server");
    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    axum::serve(listener, app).await?;

    collector.abort();
    Ok(())
}
