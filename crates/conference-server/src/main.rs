//! Conference Server
//!
//! Signaling and orchestration server for multi-party conferences.
//!
//! # Servers
//!
//! The conference server runs two listeners:
//! - HTTP + WebSocket server for rooms, participant sockets and engine
//!   sockets (default: 0.0.0.0:8080)
//! - HTTP server for health endpoints and metrics (default: 0.0.0.0:8081)
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize tracing (JSON when `CONF_LOG_JSON=true`)
//! 3. Initialize Prometheus metrics recorder
//! 4. Initialize actor system (`RoomRegistryHandle`) over the `EngineHub`
//! 5. Start health HTTP server (liveness, readiness, metrics)
//! 6. Start the signaling server and mark ready
//! 7. Wait for shutdown signal

#![warn(clippy::pedantic)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use conference_server::actors::{ActorMetrics, RegistryConfig, RoomRegistryHandle};
use conference_server::config::Config;
use conference_server::engine::EngineHub;
use conference_server::observability::metrics::init_metrics_recorder;
use conference_server::observability::{health_router, HealthState};
use conference_server::routes::{build_routes, AppState};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Grace period for in-flight requests and sockets after the shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Configuration first: it decides the log format
    let config = Config::from_env()?;
    init_tracing(config.log_json);

    info!("Starting Conference Server");
    info!(
        server_id = %config.server_id,
        bind_address = %config.bind_address,
        health_bind_address = %config.health_bind_address,
        max_rooms = config.max_rooms,
        default_max_members = ?config.default_max_members,
        default_max_empty_minutes = config.default_max_empty_minutes,
        negotiation_timeout_ms = config.negotiation.timeout.as_millis(),
        negotiation_jitter_ms = config.negotiation.jitter.as_millis(),
        "Configuration loaded successfully"
    );

    // Must happen before any metrics are recorded
    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        e
    })?;
    info!("Prometheus metrics recorder initialized");

    let health_state = Arc::new(HealthState::new(config.server_id.clone()));

    // Actor system
    let actor_metrics = ActorMetrics::new();
    let engines = Arc::new(EngineHub::new(config.engine_token.clone()));
    let registry = RoomRegistryHandle::new(
        RegistryConfig::from(&config),
        engines.clone(),
        Arc::clone(&actor_metrics),
    );
    info!("Actor system initialized");

    let shutdown_token = CancellationToken::new();

    // Health server (MUST succeed - fail startup if it doesn't)
    let health_addr: SocketAddr = config.health_bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.health_bind_address, "Invalid health bind address");
        format!("Invalid health bind address: {e}")
    })?;
    let health_app = health_router(Arc::clone(&health_state), Some(prometheus_handle));

    // Bind listeners BEFORE spawning to fail fast on bind errors
    let health_listener = tokio::net::TcpListener::bind(health_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %health_addr, "Failed to bind health server");
            format!("Failed to bind health server to {health_addr}: {e}")
        })?;

    let health_shutdown_token = shutdown_token.child_token();
    let health_task = tokio::spawn(async move {
        info!(addr = %health_addr, "Health server starting");
        let server = axum::serve(health_listener, health_app).with_graceful_shutdown(async move {
            health_shutdown_token.cancelled().await;
            info!("Health server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "Health server failed");
        }
    });

    // Signaling server
    let bind_addr: SocketAddr = config.bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.bind_address, "Invalid bind address");
        format!("Invalid bind address: {e}")
    })?;
    let listener = tokio::net::TcpListener::bind(bind_addr).await.map_err(|e| {
        error!(error = %e, addr = %bind_addr, "Failed to bind signaling server");
        format!("Failed to bind signaling server to {bind_addr}: {e}")
    })?;

    let state = Arc::new(AppState {
        registry: registry.clone(),
        engines,
        config: config.clone(),
    });
    let app = build_routes(state);

    let server_shutdown_token = shutdown_token.child_token();
    let server_task = tokio::spawn(async move {
        info!(addr = %bind_addr, "Signaling server starting");
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            server_shutdown_token.cancelled().await;
            info!("Signaling server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "Signaling server failed");
        }
    });

    health_state.set_ready();
    info!("Conference Server running - press Ctrl+C to shutdown");
    shutdown_signal().await;

    info!("Shutdown signal received, initiating graceful shutdown...");

    // Mark as not ready immediately so load balancers stop sending traffic
    health_state.set_not_ready();

    // Closing every room drops the member and engine channels, which ends the
    // open sockets and lets the signaling server finish draining
    registry.cancel();
    shutdown_token.cancel();

    if tokio::time::timeout(SHUTDOWN_GRACE, server_task).await.is_err() {
        info!("Signaling server did not drain within the grace period");
    }
    let _ = tokio::time::timeout(SHUTDOWN_GRACE, health_task).await;

    info!(
        rooms_open = actor_metrics.room_count(),
        "Conference Server shutdown complete"
    );
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "conference_server=debug,tower_http=debug".into());

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
