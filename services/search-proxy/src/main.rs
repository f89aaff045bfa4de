//! Reverse image search proxy
//!
//! Single-binary service that:
//! 1. Pools SEARCH and PROXY provider keys in a JSON key store
//! 2. Answers `POST /search` by leasing one key of each kind, calling the
//!    search provider through the scraping proxy, and accounting the outcome
//! 3. Puts exhausted and suspended keys back into rotation via the sweeper
//! 4. Serves key management on a separate admin listener

mod admin;
mod config;
mod error;
mod format;
mod metrics;
mod orchestrator;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use key_pool::{KeyPool, LockTable, QuotaLedger, Sweeper, spawn_sweep_task};
use key_store::{FileKeyStore, KeyStore};
use metrics_exporter_prometheus::PrometheusHandle;
use provider::ProxiedSearchBackend;
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::admin::{AdminState, build_admin_router};
use crate::config::Config;
use crate::error::SearchError;
use crate::metrics::ServiceMetrics;
use crate::orchestrator::{Orchestrator, SearchRequest};

/// How long in-flight requests get to finish after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared application state accessible from all public handlers
#[derive(Clone)]
struct AppState {
    orchestrator: Arc<Orchestrator>,
    pool: Arc<KeyPool>,
    metrics: ServiceMetrics,
    prometheus: PrometheusHandle,
}

/// Build the public router. The concurrency limit caps in-flight requests at
/// `max_connections`.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/search", post(search_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting reverse-search-proxy");

    // Install before any pool operation can emit a metric
    let prometheus_handle =
        metrics::install_recorder().context("failed to install Prometheus recorder")?;

    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    let policy = config.quota_policy()?;

    info!(
        listen_addr = %config.server.listen_addr,
        admin_addr = %config.server.admin_addr,
        store = %config.store.path.display(),
        max_attempts = config.search.max_attempts,
        daily_limit = config.users.daily_limit,
        "configuration loaded"
    );

    let file_store = FileKeyStore::load(config.store.path.clone())
        .await
        .with_context(|| format!("failed to open key store {}", config.store.path.display()))?
        .with_usage_retention(config.usage_retention()?);
    info!(
        keys = file_store.len().await,
        usage_archive = %file_store.archive_path().display(),
        "key store loaded"
    );
    let store: Arc<dyn KeyStore> = Arc::new(file_store);

    let locks = Arc::new(LockTable::new());
    let pool = Arc::new(KeyPool::new(store.clone(), locks.clone(), policy.clone()));
    let ledger = Arc::new(QuotaLedger::new(store.clone(), locks.clone(), policy.clone()));
    let sweeper = Arc::new(Sweeper::new(store, locks, policy));

    let backend = Arc::new(ProxiedSearchBackend::new(
        reqwest::Client::new(),
        config.provider.search_endpoint.clone(),
        config.provider.proxy_endpoint.clone(),
        config.provider_timeout(),
        config.provider.results,
    ));
    let orchestrator = Arc::new(Orchestrator::new(
        pool.clone(),
        ledger,
        backend,
        config.search.max_attempts,
        config.users.daily_limit,
    ));

    let sweep_task = config.sweep_interval().map(|interval| {
        info!(interval_secs = interval.as_secs(), "in-process sweep enabled");
        spawn_sweep_task(sweeper.clone(), interval)
    });
    if sweep_task.is_none() {
        info!("in-process sweep disabled, expecting POST /admin/sweep from a scheduler");
    }

    let service_metrics = ServiceMetrics::new();
    let app_state = AppState {
        orchestrator,
        pool: pool.clone(),
        metrics: service_metrics.clone(),
        prometheus: prometheus_handle,
    };
    let app = build_router(app_state, config.server.max_connections);
    let admin_app = build_admin_router(AdminState::new(pool, sweeper));

    let listen_addr = config.server.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    let admin_addr = config.server.admin_addr;
    let admin_listener = TcpListener::bind(admin_addr)
        .await
        .with_context(|| format!("failed to bind admin listener to {admin_addr}"))?;

    info!(addr = %listen_addr, admin_addr = %admin_addr, "accepting requests");

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let (admin_shutdown_tx, admin_shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });
    let admin_handle = tokio::spawn(async move {
        axum::serve(admin_listener, admin_app)
            .with_graceful_shutdown(async {
                let _ = admin_shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;

    if let Some(task) = sweep_task {
        task.abort();
    }
    let _ = shutdown_tx.send(());
    let _ = admin_shutdown_tx.send(());

    // The drain timeout starts at signal receipt, not at server start
    tokio::join!(
        drain("public", server_handle),
        drain("admin", admin_handle),
    );

    info!(
        requests_served = service_metrics.requests_total.load(Ordering::Relaxed),
        "shutdown complete"
    );
    Ok(())
}

/// Wait up to DRAIN_TIMEOUT for a listener task to finish its in-flight requests.
async fn drain(
    listener: &'static str,
    handle: tokio::task::JoinHandle<std::io::Result<()>>,
) {
    match tokio::time::timeout(DRAIN_TIMEOUT, handle).await {
        Ok(Ok(Ok(()))) => info!(listener, "in-flight requests drained"),
        Ok(Ok(Err(e))) => error!(listener, error = %e, "server error during shutdown"),
        Ok(Err(e)) => error!(listener, error = %e, "server task panicked"),
        Err(_) => warn!(
            listener,
            drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
            "drain timeout exceeded, forcing shutdown"
        ),
    }
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response {
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

#[derive(Deserialize)]
struct SearchBody {
    image_url: String,
    user_id: String,
}

/// POST /search: look up an already-hosted image.
///
/// 200 with the rendered result (match or explicit no-match), 400 for a bad
/// image URL or missing user, 429 once an ordinary user's daily limit is
/// used up, 503 when a key pool is exhausted, 502 when every attempt failed,
/// 500 on store inconsistencies.
async fn search_handler(
    State(state): State<AppState>,
    axum::Json(body): axum::Json<SearchBody>,
) -> Response {
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    state.metrics.requests_total.fetch_add(1, Ordering::Relaxed);

    let image_url = body.image_url.trim();
    if !(image_url.starts_with("http://") || image_url.starts_with("https://")) {
        state.metrics.errors_total.fetch_add(1, Ordering::Relaxed);
        return json_response(
            StatusCode::BAD_REQUEST,
            serde_json::json!({
                "request_id": request_id,
                "error": "invalid_request",
                "message": "image_url must be an http(s) URL",
            }),
        );
    }

    let request = SearchRequest {
        request_id,
        user_id: body.user_id.trim().to_string(),
        image_url: image_url.to_string(),
    };
    info!(request_id = %request.request_id, user_id = %request.user_id, "search requested");

    match state.orchestrator.search(&request).await {
        Ok(outcome) => json_response(
            StatusCode::OK,
            serde_json::json!({
                "request_id": request.request_id,
                "outcome": outcome.label(),
                "remaining": outcome.remaining(),
                "text": format::render(&outcome, state.pool.policy().search_quota),
            }),
        ),
        Err(err) => {
            state.metrics.errors_total.fetch_add(1, Ordering::Relaxed);
            let status = match &err {
                SearchError::PoolExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
                SearchError::AllAttemptsExhausted { .. } => StatusCode::BAD_GATEWAY,
                SearchError::DailyLimitReached { .. } => StatusCode::TOO_MANY_REQUESTS,
                SearchError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
                SearchError::KeyNotFound(_) | SearchError::Store(_) => {
                    error!(request_id = %request.request_id, error = %err, "search failed on store");
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            };
            let mut body = serde_json::json!({
                "request_id": request.request_id,
                "error": err.label(),
                "message": err.to_string(),
            });
            match err {
                SearchError::PoolExhausted(kind) => body["kind"] = serde_json::json!(kind),
                SearchError::DailyLimitReached { limit } => {
                    body["daily_limit"] = serde_json::json!(limit)
                }
                _ => {}
            }
            json_response(status, body)
        }
    }
}

/// GET /health: pool summary per kind; 503 when any kind has no usable key.
async fn health_handler(State(state): State<AppState>) -> Response {
    let uptime = state.metrics.started_at.elapsed().as_secs();
    let requests = state.metrics.requests_total.load(Ordering::Relaxed);
    let errors = state.metrics.errors_total.load(Ordering::Relaxed);

    match state.pool.health().await {
        Ok(mut body) => {
            let status_code = if body["status"] == "unhealthy" {
                StatusCode::SERVICE_UNAVAILABLE
            } else {
                StatusCode::OK
            };
            body["uptime_seconds"] = serde_json::json!(uptime);
            body["requests_served"] = serde_json::json!(requests);
            body["errors_total"] = serde_json::json!(errors);
            json_response(status_code, body)
        }
        Err(e) => {
            error!(error = %e, "health check could not read the key store");
            json_response(
                StatusCode::SERVICE_UNAVAILABLE,
                serde_json::json!({
                    "status": "unhealthy",
                    "error": e.to_string(),
                    "uptime_seconds": uptime,
                }),
            )
        }
    }
}

/// Prometheus metrics endpoint: text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
