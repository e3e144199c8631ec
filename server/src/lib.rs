//! View counter write-back cache.
//!
//! Page views are counted in Redis at request speed and folded into Postgres rollups by a
//! scheduled flush.
//!
//!
//!
//! # General Infrastructure
//! - Content handlers `INCRBY` a Redis counter per view and mark the key dirty
//! - An external scheduler calls `/api/views/flush` every few minutes with a bearer secret
//! - The flush drains every dirty counter with `GETDEL` and adds the delta to Postgres
//! - Lifetime totals go to `view_totals`, per-day counts to `view_daily`
//!
//!
//!
//! # Notes
//!
//! ## Redis + Postgres
//! Writing every view straight to Postgres means one row lock per page hit on the hottest rows.
//! Redis gives atomic increments without that contention, Postgres keeps the numbers once Redis
//! is restarted or evicts.
//!
//! We accept the sync lag. Counts in Postgres are eventually consistent, trailing Redis by at most
//! one flush interval.
//!
//! ## Exactly Once
//! No locks anywhere. `GETDEL` hands each unit of delta to exactly one flush, and the rollups are
//! only ever incremented, so racing flushes sum instead of overwriting each other.
//!
//!
//!
//! # Setup
//!
//! Run the server.
//! ```sh
//! CRON_SECRET=dev APP_ENV=development cargo run -- serve
//! ```
//!
//! Trigger a flush by hand.
//! ```sh
//! curl -H "Authorization: Bearer dev" http://localhost:1111/api/views/flush
//! ```
//!
//! Flush once without the HTTP surface, e.g. from a host cron.
//! ```sh
//! cargo run -- flush
//! ```
use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use axum::{
    Router,
    http::{Method, header::AUTHORIZATION},
    routing::get,
};

use signal::{
    ctrl_c,
    unix::{SignalKind, signal},
};
use tokio::{net::TcpListener, signal};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};

pub mod auth;
pub mod config;
pub mod database;
pub mod error;
pub mod flush;
pub mod keys;
pub mod rollup;
pub mod routes;
pub mod state;

use config::Config;
use flush::FlushReport;
use routes::{flush_handler, health_handler};
use state::State;

pub const FLUSH_ROUTE: &str = "/api/views/flush";

pub fn init_tracing() {
    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

pub fn build_router(state: Arc<State>) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([AUTHORIZATION])
        .max_age(Duration::from_secs(60 * 60));

    Router::new()
        .route(FLUSH_ROUTE, get(flush_handler).post(flush_handler))
        .route("/health", get(health_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn start_server() -> Result<()> {
    init_tracing();

    info!("Loading config...");
    let config = Config::load().context("failed to load configuration")?;

    info!("Initializing state...");
    let state = State::new(config).await?;

    info!("Starting server...");
    let address = state.config.address();
    let app = build_router(state);

    info!("Binding to {address}");
    let listener = TcpListener::bind(&address)
        .await
        .with_context(|| format!("failed to bind to {address}"))?;
    info!("Server running on {address}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("Server shut down");
    Ok(())
}

/// One flush cycle straight against the stores, skipping HTTP and the guard.
pub async fn flush_once() -> Result<FlushReport> {
    init_tracing();

    let config = Config::load().context("failed to load configuration")?;
    let state = State::new(config).await?;

    state.flusher.flush().await.context("flush cycle failed")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }

        info!("Received Ctrl+C, shutting down");
    };

    #[cfg(unix)]
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
                info!("Received terminate signal, shutting down");
            }
            Err(e) => {
                error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
