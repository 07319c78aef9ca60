//! Fleet Control Plane Server
//!
//! Brokers streaming sessions between operators and the remote agents that
//! manage Docker instances: terminal exec over WebSocket, stats and log tails
//! and image pulls over SSE, with asciinema recording of terminal sessions.
//!
//! Uses SQLite (embedded) for the fleet inventory and recording metadata.

mod config;
mod extractors;
mod handlers;
mod metrics;
mod services;
mod storage;
#[cfg(test)]
mod testing;

use anyhow::{Context, Result};
use axum::{
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use config::ServerConfig;
use metrics::StreamMetrics;
use services::{AuthService, ConnectionManager, Recorder, SessionRegistry, TaskDispatcher};
use storage::Database;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Database>,
    pub registry: Arc<SessionRegistry>,
    pub connections: ConnectionManager,
    pub recorder: Arc<Recorder>,
    pub auth_service: Arc<AuthService>,
    pub metrics: Arc<StreamMetrics>,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    pub fn new(config: ServerConfig, db: Arc<Database>) -> Self {
        let metrics = Arc::new(StreamMetrics::new());
        let connections = ConnectionManager::new();
        let dispatcher = Arc::new(TaskDispatcher::new(db.clone(), connections.clone()));
        let registry = Arc::new(SessionRegistry::new(
            dispatcher,
            config.sessions.clone(),
            metrics.clone(),
        ));
        let recorder = Arc::new(Recorder::new(
            db.clone(),
            config.recordings_dir(),
            config.recording.enabled,
            config.recording.max_buffer_bytes,
            metrics.clone(),
        ));
        let auth_service = Arc::new(AuthService::new(config.jwt_secret.clone()));

        Self {
            db,
            registry,
            connections,
            recorder,
            auth_service,
            metrics,
            config: Arc::new(config),
        }
    }
}

#[tokio::main]
async fn main() {
    // Set up panic hook to log crashes
    std::panic::set_hook(Box::new(|info| {
        let location = info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()));
        let payload = if let Some(s) = info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "Unknown panic".to_string()
        };
        eprintln!("[PANIC] at {:?}: {}", location, payload);
        tracing::error!("PANIC at {:?}: {}", location, payload);
    }));

    let config = match config::load_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("[FATAL] {:#}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = init_tracing(&config.log_format) {
        eprintln!("[FATAL] Failed to initialize logging: {}", e);
        std::process::exit(1);
    }

    info!(
        "Starting Fleet Control Plane v{}",
        env!("CARGO_PKG_VERSION")
    );
    info!("PID: {}", std::process::id());

    if let Err(e) = run_server(config).await {
        error!("Server failed: {:#}", e);
        std::process::exit(1);
    }
}

/// `RUST_LOG` wins over the default `info` level
fn init_tracing(format: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = if format.eq_ignore_ascii_case("json") {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|e| anyhow::anyhow!("{}", e))
}

async fn run_server(config: ServerConfig) -> Result<()> {
    info!(
        "Config loaded: bind={}, data_dir={}",
        config.bind_address,
        config.data_dir.display()
    );

    tokio::fs::create_dir_all(&config.data_dir)
        .await
        .with_context(|| {
            format!(
                "Failed to create data directory {}",
                config.data_dir.display()
            )
        })?;
    tokio::fs::create_dir_all(config.recordings_dir())
        .await
        .context("Failed to create recordings directory")?;

    let database_path = config.database_path();
    info!("Initializing SQLite database...");
    let db = Arc::new(
        Database::new(&database_path)
            .await
            .context("Failed to initialize database")?,
    );
    info!("SQLite database initialized at: {}", database_path.display());

    let seeded = db
        .seed_inventory(&config.inventory)
        .await
        .context("Failed to seed inventory")?;
    if seeded > 0 {
        info!("Inventory seeded with {} row(s)", seeded);
    }

    let bind_address = config.bind_address.clone();
    let sweep_interval = config.sessions.sweep_interval();
    let state = AppState::new(config, db);

    let shutdown = CancellationToken::new();
    let sweeper = services::sweeper::spawn_sweeper(
        state.registry.clone(),
        state.recorder.clone(),
        sweep_interval,
        shutdown.clone(),
    );
    info!("Session sweeper running every {:?}", sweep_interval);

    let app = build_router(state.clone());

    let addr: SocketAddr = bind_address
        .parse()
        .context("Failed to parse bind address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;
    info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Shutting down");
    shutdown.cancel();
    let _ = sweeper.await;

    if !state.registry.is_empty() {
        info!(
            "{} session(s) still open at shutdown",
            state.registry.len()
        );
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        // Agent-facing WebSockets
        .route("/agent/connect", get(handlers::agent::connect))
        .route("/agent/stream/:session_id", get(handlers::agent::stream))
        .nest("/api/v1", api_routes())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/metrics", get(handlers::metrics))
        .route(
            "/instances/:instance_id/containers/:container_id/exec",
            post(handlers::streams::create_exec),
        )
        .route(
            "/instances/:instance_id/containers/:container_id/stats",
            get(handlers::streams::stats),
        )
        .route(
            "/instances/:instance_id/containers/:container_id/logs",
            get(handlers::streams::logs),
        )
        .route(
            "/instances/:instance_id/images/pull",
            post(handlers::streams::pull_image),
        )
        .route(
            "/sessions/:session_id",
            get(handlers::sessions::get).delete(handlers::sessions::delete),
        )
        .route("/recordings", get(handlers::recordings::list))
        .route("/recordings/:id", get(handlers::recordings::get))
        .route(
            "/recordings/:id/download",
            get(handlers::recordings::download),
        )
        .route("/terminal/:session_id/ws", get(handlers::terminal::handler))
}
