mod app_error;
mod handlers;
mod ingest_body;

use anyhow::{Context, Result};
use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::{
    catch_panic::CatchPanicLayer,
    cors::{Any, CorsLayer},
    services::ServeDir,
    trace::TraceLayer,
};
use tracing::{info, warn};

use crate::{
    access_guard::AccessGuard,
    config::Config,
    server::handlers::{get_history, get_latest, healthz, ingest, ingest_csv},
    storage::{InMemoryStorage, SqliteStorage, Storage},
};

/// Shared application state.
struct AppState {
    store: Arc<dyn Storage + Send + Sync + 'static>,
    guard: AccessGuard,
}

/// Creates the API router over the given store. Used for testing, too.
pub fn make_server(store: Arc<dyn Storage + Send + Sync + 'static>, guard: AccessGuard) -> Router {
    let shared_state = Arc::new(AppState { store, guard });
    Router::new()
        .route("/ingest", post(ingest))
        .route("/ingest-csv", post(ingest_csv))
        .route("/api/history", get(get_history))
        .route("/api/latest", get(get_latest))
        .route("/healthz", get(healthz))
        .with_state(shared_state)
        .layer(CatchPanicLayer::custom(app_error::handle_panic))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

/// Picks the backend once at startup.
///
/// A configured database that cannot be opened degrades to the in-memory
/// backend instead of refusing to start.
fn open_store(
    config: &Config,
    shutdown: watch::Receiver<bool>,
) -> Arc<dyn Storage + Send + Sync + 'static> {
    match config.database_url() {
        Some(url) => match SqliteStorage::open(url, config.sqlite_options()) {
            Ok(store) => {
                let store = Arc::new(store);
                if store.retention().is_none() {
                    warn!("Retention disabled, durable history grows without bound");
                }
                store.spawn_retention_sweep(config.sweep_interval(), shutdown);
                info!("Using SQLite store");
                return store;
            }
            Err(error) => warn!(%error, "Could not open database. Using in-memory store."),
        },
        None => warn!("DATABASE_URL not set. Using in-memory store."),
    }
    Arc::new(InMemoryStorage::new(
        config.max_readings,
        config.query_limits(),
    ))
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        warn!(%error, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}

/// Starts the server on the configured port.
pub async fn serve(config: Config) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let store = open_store(&config, shutdown_rx);
    let guard = AccessGuard::new(config.api_key.clone());
    if !guard.is_enabled() {
        warn!("API_KEY is empty, ingest is open to anyone");
    }

    let mut app = make_server(store, guard);
    if config.static_dir.is_dir() {
        info!("Serving dashboard from {}", config.static_dir.display());
        app = app.fallback_service(ServeDir::new(&config.static_dir));
    }

    info!("Listening on http://localhost:{}", config.port);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("Failed to bind to port {}", config.port))?;

    let result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .with_context(|| "Failed to start server");
    // Stops the retention sweep, if one is running.
    let _ = shutdown_tx.send(true);
    result
}
