// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Server wiring: tracing setup, router, and the serve loop. Shared by
//! `main` and the integration specs.

use std::sync::{Arc, Once};
use std::time::Instant;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{middleware, Json, Router};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::auth;
use crate::config::Config;
use crate::control::{FixedContainer, Hooks, HttpControlPlane};
use crate::gateway;
use crate::registry::HostRegistry;

static CRYPTO_INIT: Once = Once::new();

/// Install the ring crypto provider for reqwest/rustls.
/// Safe to call multiple times; only the first call has effect.
pub fn ensure_crypto() {
    CRYPTO_INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Shared application state for the HTTP layer.
pub struct App {
    pub registry: Arc<HostRegistry>,
    pub auth_token: Option<String>,
    pub ping_interval: std::time::Duration,
    pub pong_timeout: std::time::Duration,
    pub started_at: Instant,
}

/// Initialize tracing/logging from config.
///
/// Uses `try_init` so it's safe to call multiple times (e.g. from tests).
pub fn init_tracing(config: &Config) {
    use tracing_subscriber::fmt;

    // Priority: --log-level / PERCH_LOG_LEVEL > RUST_LOG > default ("info").
    let filter = if std::env::var("PERCH_LOG_LEVEL").is_err() && config.log_level == "info" {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level))
    } else {
        EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let result = match config.log_format.as_str() {
        "json" => fmt::fmt().with_env_filter(filter).json().try_init(),
        _ => fmt::fmt().with_env_filter(filter).try_init(),
    };
    drop(result);
}

/// Build the axum `Router` with the HTTP and WebSocket routes.
pub fn build_router(app: Arc<App>) -> Router {
    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/status", get(status))
        .route("/ws", get(gateway::ws_handler))
        .layer(middleware::from_fn_with_state(Arc::clone(&app), auth::auth_layer))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(app)
}

async fn health(State(app): State<Arc<App>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "running",
        "uptime_secs": app.started_at.elapsed().as_secs(),
        "hosts": app.registry.host_count(),
        "viewers": app.registry.viewer_count(),
    }))
}

async fn status(State(app): State<Arc<App>>) -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "hosts": app.registry.snapshot() })))
}

/// Build the collaborator hook bundle from configuration.
pub fn build_hooks(config: &Config) -> Hooks {
    let mut hooks = Hooks::default();
    if !config.control_plane_url.is_empty() {
        hooks.control_plane = Arc::new(HttpControlPlane::new(
            config.control_plane_url.clone(),
            config.control_plane_token.clone(),
        ));
    }
    hooks.containers = Arc::new(FixedContainer(config.container.clone()));
    hooks
}

/// Run the server to completion (first SIGTERM/SIGINT drains, second forces
/// exit).
pub async fn run(config: Config) -> anyhow::Result<()> {
    init_tracing(&config);
    ensure_crypto();
    config.validate()?;

    let shutdown = CancellationToken::new();
    let hooks = build_hooks(&config);
    let registry = HostRegistry::new(config.host_options()?, hooks);

    let app = Arc::new(App {
        registry: Arc::clone(&registry),
        auth_token: config.auth_token.clone(),
        ping_interval: config.ping_interval(),
        pong_timeout: config.pong_timeout(),
        started_at: Instant::now(),
    });

    let router = build_router(Arc::clone(&app));
    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("HTTP listening on {}", listener.local_addr()?);

    spawn_signal_handler(shutdown.clone());

    let serve = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned());
    let result = serve.await;

    registry.stop_all().await;
    if let Err(e) = result {
        error!("HTTP server error: {e}");
        return Err(e.into());
    }
    Ok(())
}

fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).ok();
        let mut sigint =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt()).ok();

        // First signal: graceful shutdown
        tokio::select! {
            _ = async {
                if let Some(ref mut s) = sigterm { s.recv().await } else { std::future::pending().await }
            } => {
                info!("received SIGTERM");
            }
            _ = async {
                if let Some(ref mut s) = sigint { s.recv().await } else { std::future::pending().await }
            } => {
                info!("received SIGINT");
            }
        }
        shutdown.cancel();

        // Second signal: force exit
        tokio::select! {
            _ = async {
                if let Some(ref mut s) = sigterm { s.recv().await } else { std::future::pending().await }
            } => {
                info!("received SIGTERM again, forcing exit");
            }
            _ = async {
                if let Some(ref mut s) = sigint { s.recv().await } else { std::future::pending().await }
            } => {
                info!("received SIGINT again, forcing exit");
            }
        }
        std::process::exit(130);
    });
}
