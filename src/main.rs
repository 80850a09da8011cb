//! relay-gateway
//!
//! Reverse proxy that pools authenticated accounts in front of a single
//! upstream AI chat completion API, load-balancing requests across the pool
//! to keep each account under its own provider-side rate limit.

use axum::{
    extract::State,
    routing::{any, delete, get, post},
    Router,
};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info};

mod admin;
mod balancer;
mod classifier;
mod config;
mod error;
mod forwarder;
mod logging;
mod models;
mod orchestrator;
mod provider;
mod store;
mod tee;
mod token;
mod writer;

use config::Config;
use logging::LoggingHandle;
use orchestrator::Orchestrator;
use store::Store;
use token::TokenManager;
use writer::Writer;

/// Shared application state. Cloned per request by axum's `State`
/// extractor — everything inside is already behind an `Arc`.
#[derive(Clone)]
pub struct AppState {
    pub(crate) store: Arc<Store>,
    pub(crate) orchestrator: Arc<Orchestrator>,
    pub(crate) logging: Arc<LoggingHandle>,
}

/// Matches the exit-code contract: 0 clean shutdown, 1 config error, 2 DB
/// migration failure. Argument parsing (64) isn't applicable — this binary
/// takes no CLI flags, only env vars and a config file.
enum StartupFailure {
    Config(anyhow::Error),
    Migration(anyhow::Error),
    Other(anyhow::Error),
}

#[tokio::main]
async fn main() -> ExitCode {
    let config = match Config::load() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("relay-gateway: configuration error: {err:#}");
            return ExitCode::from(1);
        }
    };

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(StartupFailure::Config(err)) => {
            eprintln!("relay-gateway: configuration error: {err:#}");
            ExitCode::from(1)
        }
        Err(StartupFailure::Migration(err)) => {
            eprintln!("relay-gateway: database migration failed: {err:#}");
            ExitCode::from(2)
        }
        Err(StartupFailure::Other(err)) => {
            eprintln!("relay-gateway: fatal error: {err:#}");
            ExitCode::from(1)
        }
    }
}

async fn run(config: Config) -> Result<(), StartupFailure> {
    let logging = Arc::new(
        logging::init(&config.log_dir, &config.log_level).map_err(StartupFailure::Config)?,
    );

    info!("starting relay-gateway");

    let store = Arc::new(
        Store::connect(&config.database_path)
            .await
            .map_err(StartupFailure::Other)?,
    );
    store.migrate().await.map_err(StartupFailure::Migration)?;
    info!(path = %config.database_path.display(), "database ready");

    let writer_handle = Writer::spawn(
        store.clone(),
        config.writer_queue_capacity,
        config.writer_batch_size,
        config.flush_interval(),
    );

    let http_client = reqwest::Client::builder()
        .connect_timeout(config.forward_connect_timeout())
        .build()
        .map_err(|err| StartupFailure::Other(err.into()))?;
    let token_manager = Arc::new(TokenManager::new(
        http_client,
        config.oauth_token_url.clone(),
        config.oauth_client_id.clone(),
        writer_handle.clone(),
    ));

    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        &config,
        token_manager,
        writer_handle.clone(),
    ));

    let state = AppState {
        store,
        orchestrator,
        logging,
    };

    let app = Router::new()
        .route("/health", get(admin::health))
        .route("/api/accounts", get(admin::list_accounts))
        .route("/api/accounts/direct", post(admin::create_direct_account))
        .route("/api/accounts/:id/pause", post(admin::pause_account))
        .route("/api/accounts/:id/resume", post(admin::resume_account))
        .route("/api/accounts/:id/tier", post(admin::set_tier))
        .route(
            "/api/accounts/:id/rate-limit",
            post(admin::set_rate_limit_override),
        )
        .route("/api/accounts/:name", delete(admin::delete_account))
        .route("/api/requests", get(admin::list_requests))
        .route("/api/logs/stream", get(admin::logs_stream))
        .route("/api/oauth/init", post(admin::oauth_init))
        .route("/api/oauth/complete", post(admin::oauth_complete))
        .fallback(any(proxy))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    let listener = TcpListener::bind(&config.server_address)
        .await
        .map_err(|err| StartupFailure::Other(err.into()))?;
    info!(address = %config.server_address, "listening");

    let shutdown_grace = config.writer_shutdown_grace();
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| StartupFailure::Other(err.into()))?;

    info!("shutting down, draining write queue");
    match tokio::time::timeout(shutdown_grace, writer_handle.shutdown()).await {
        Ok(()) => info!("write queue drained cleanly"),
        Err(_) => error!("write queue drain exceeded grace period, exiting anyway"),
    }

    Ok(())
}

/// Any request not matched by an admin route is the proxy's job.
async fn proxy(
    State(state): State<AppState>,
    req: axum::extract::Request,
) -> axum::response::Response {
    state.orchestrator.handle(req).await
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
