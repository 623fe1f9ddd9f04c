#![deny(
    asm_sub_register,
    deprecated,
    missing_abi,
    unsafe_code,
    unused_macros,
    unused_must_use,
    unused_unsafe
)]
#![deny(clippy::from_str_radix_10, clippy::too_many_arguments)]

//! The Arrears server.
//!
//! Accepts portfolio exports through resumable chunked uploads, turns them
//! into reports in the background and serves the results page by page.

pub mod api;
pub mod chunk_store;
pub mod chunked_session;
pub mod config;
pub mod error;
pub mod middleware;
pub mod pagination;
pub mod processing;
pub mod progress;
pub mod results;

use std::any::Any;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use axum::{extract::Extension, response::Response, routing::get, Router};
use axum::response::IntoResponse;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::compression::predicate::{DefaultPredicate, Predicate, SizeAbove};
use tower_http::compression::CompressionLayer;
use tower_http::trace::TraceLayer;

use chunked_session::UploadSessionManager;
use config::Config;
use error::ServerError;
use pagination::Paginator;
use processing::ProcessingCoordinator;
use progress::ProgressTracker;
use results::ResultStore;

pub type State = Arc<StateInner>;

/// Responses smaller than this many bytes are sent uncompressed.
const MIN_COMPRESSED_SIZE: u16 = 500;

/// Global server state.
#[derive(Debug)]
pub struct StateInner {
    /// The Arrears server config.
    pub config: Config,

    /// Chunked upload sessions.
    pub uploads: UploadSessionManager,

    /// Progress of running and recently finished operations.
    pub progress: Arc<ProgressTracker>,

    /// Results of finished operations.
    pub results: Arc<ResultStore>,

    /// Launches report processing.
    pub coordinator: ProcessingCoordinator,

    pub paginator: Paginator,
}

impl StateInner {
    pub async fn new(config: Config) -> Result<State> {
        let store = chunk_store::from_config(&config.chunked_upload.storage)
            .await
            .map_err(|e| anyhow!("Failed to set up chunk storage: {}", e))?;

        let uploads = UploadSessionManager::new(config.chunked_upload.clone(), store);
        let progress = Arc::new(ProgressTracker::new(config.progress.retention()));
        let results = Arc::new(ResultStore::new(config.results.retention()));
        let coordinator = ProcessingCoordinator::new(progress.clone(), results.clone());
        let paginator = Paginator::new(&config.pagination);

        Ok(Arc::new(Self {
            config,
            uploads,
            progress,
            results,
            coordinator,
            paginator,
        }))
    }
}

/// Builds the API router.
pub fn router(state: State) -> Router {
    api::v1::get_router(&state.config)
        .route("/health", get(api::health))
        .layer(Extension(state))
        .layer(CompressionLayer::new().compress_when(
            DefaultPredicate::new().and(SizeAbove::new(MIN_COMPRESSED_SIZE)),
        ))
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(axum::middleware::from_fn(middleware::assign_correlation_id))
        .layer(TraceLayer::new_for_http())
}

fn handle_panic(_panic: Box<dyn Any + Send + 'static>) -> Response {
    ServerError::internal_error(anyhow!("A request handler panicked")).into_response()
}

/// Spawns the session reaper and the retention sweeper.
pub fn spawn_background_tasks(state: &State) -> Vec<JoinHandle<()>> {
    let reaper = {
        let state = state.clone();
        tokio::spawn(async move {
            let mut interval = time::interval(state.config.chunked_upload.reaper_interval());
            interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

            loop {
                interval.tick().await;
                state.uploads.reap_expired().await;
            }
        })
    };

    let sweeper = {
        let state = state.clone();
        tokio::spawn(async move {
            let mut interval = time::interval(state.config.progress.sweep_interval());
            interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

            loop {
                interval.tick().await;
                state.progress.evict_expired();
                state.results.evict_expired();
            }
        })
    };

    vec![reaper, sweeper]
}

/// Runs the API server until it is interrupted.
pub async fn run_api_server(cli_listen: Option<SocketAddr>, config: Config) -> Result<()> {
    eprintln!("Starting API server...");

    let listen = cli_listen.unwrap_or(config.listen);
    let state = StateInner::new(config).await?;

    let background = spawn_background_tasks(&state);
    let app = router(state);

    eprintln!("Listening on {:?}...", listen);

    let listener = TcpListener::bind(&listen).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    for task in background {
        task.abort();
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for the shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }

    tracing::info!("Shutting down");
}
