//! HTTP server
//!
//! Fixed informational routes plus a fallback that forwards everything else
//! to the detected provider.

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Query, State},
    http::HeaderValue,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::gateway::proxy_handler;
use crate::config::{Config, ServerConfig, SessionConfig};
use crate::error::{ProxyError, Result};
use crate::memory::{LocalMemoryEngine, MemoryEngine};
use crate::metrics::MetricsAggregator;
use crate::provider::{ProviderDetector, ProviderRegistry};
use crate::session::SessionRegistry;

/// Largest request body accepted for forwarding
const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

/// Number of sessions returned by `/metrics/sessions` by default
const DEFAULT_TOP_SESSIONS: usize = 5;

/// Shared application state for all handlers
pub struct AppState {
    /// Validated configuration
    pub config: Config,
    /// HTTP client for upstream requests
    pub client: reqwest::Client,
    /// Provider detection and target URLs
    pub detector: ProviderDetector,
    /// Live sessions keyed by credential digest
    pub sessions: Arc<SessionRegistry>,
    /// Savings tracker; `None` when `metrics.track_savings` is off
    pub metrics: Option<Arc<MetricsAggregator>>,
}

impl AppState {
    /// Build the state with the default local memory engine
    pub fn from_config(config: Config) -> Result<Self> {
        let engine: Arc<dyn MemoryEngine> = Arc::new(LocalMemoryEngine::new(&config.memory));
        Self::with_engine(config, engine)
    }

    /// Build the state around a specific memory engine
    pub fn with_engine(config: Config, engine: Arc<dyn MemoryEngine>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.proxy.timeout_secs))
            .build()
            .map_err(|e| ProxyError::Config(format!("Failed to create HTTP client: {e}")))?;

        let registry = Arc::new(ProviderRegistry::from_config(&config.providers)?);
        let detector = ProviderDetector::new(registry);
        let sessions = Arc::new(SessionRegistry::from_config(&config.session, engine));
        let metrics = config
            .metrics
            .track_savings
            .then(|| Arc::new(MetricsAggregator::new(&config.metrics)));

        Ok(Self {
            config,
            client,
            detector,
            sessions,
            metrics,
        })
    }
}

/// The main proxy server
pub struct ProxyServer {
    state: Arc<AppState>,
}

impl ProxyServer {
    pub fn new(state: AppState) -> Self {
        Self {
            state: Arc::new(state),
        }
    }

    /// Listen until Ctrl+C or SIGTERM, then persist sessions and log a
    /// metrics summary
    pub async fn serve(&self) -> Result<()> {
        let config = &self.state.config;
        let addr: SocketAddr = config
            .listen_addr()
            .parse()
            .map_err(|e| ProxyError::Config(format!("Invalid listen address: {e}")))?;

        tracing::info!("Starting proxy server on {addr}");
        tracing::info!(
            "Providers: {}",
            self.state.detector.registry().known_providers().join(", ")
        );

        let cleanup = self.state.sessions.spawn_cleanup_task(
            Duration::from_secs(config.session.cleanup_interval_secs.max(1)),
            idle_timeout(&config.session),
        );

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ProxyError::Config(format!("Failed to bind to {addr}: {e}")))?;

        let app = create_router(Arc::clone(&self.state));
        let served = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await;

        cleanup.abort();
        let persisted = self.state.sessions.persist_all().await;
        tracing::info!(persisted, "Sessions persisted");
        if let Some(metrics) = &self.state.metrics {
            metrics.log_summary();
        }

        served?;
        tracing::info!("Proxy server shut down gracefully");
        Ok(())
    }
}

/// How long a session may sit idle before the cleanup task evicts it
fn idle_timeout(session: &SessionConfig) -> Duration {
    Duration::from_secs(session.timeout_minutes.saturating_mul(60))
}

/// Create the router with all routes configured
pub fn create_router(state: Arc<AppState>) -> Router {
    let router = Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/metrics/sessions", get(top_sessions_handler))
        .fallback(proxy_handler)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http());

    let router = if state.config.server.cors_enabled {
        router.layer(cors_layer(&state.config.server))
    } else {
        router
    };

    router.with_state(state)
}

fn cors_layer(server: &ServerConfig) -> CorsLayer {
    let origins = if server.allowed_origins.iter().any(|o| o == "*") {
        AllowOrigin::from(Any)
    } else {
        AllowOrigin::list(
            server
                .allowed_origins
                .iter()
                .filter_map(|o| HeaderValue::from_str(o).ok()),
        )
    };

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods(Any)
        .allow_headers(Any)
}

/// Service identity
async fn root_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({
        "service": "memproxy",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
        "providers": state.detector.registry().known_providers(),
        "health": "/health",
        "metrics": "/metrics",
    }))
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let stats = state.sessions.stats().await;
    Json(json!({
        "status": "healthy",
        "service": "memproxy",
        "version": env!("CARGO_PKG_VERSION"),
        "sessions": stats.active_sessions,
        "persisted_sessions": stats.persisted_sessions,
    }))
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    match &state.metrics {
        Some(metrics) => Json(metrics.get_global_metrics()).into_response(),
        None => Json(json!({"error": "Metrics tracker not initialized"})).into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct TopSessionsQuery {
    limit: Option<usize>,
}

/// Sessions with the largest savings
async fn top_sessions_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TopSessionsQuery>,
) -> Response {
    let Some(metrics) = &state.metrics else {
        return Json(json!({"error": "Metrics tracker not initialized"})).into_response();
    };

    let sessions: Vec<serde_json::Value> = metrics
        .get_top_sessions(query.limit.unwrap_or(DEFAULT_TOP_SESSIONS))
        .into_iter()
        .map(|m| {
            json!({
                "session_key": m.session_key,
                "requests": m.requests,
                "original_tokens": m.original_tokens,
                "compressed_tokens": m.compressed_tokens,
                "tokens_saved": m.tokens_saved,
                "reduction_percentage": m.reduction_percentage(),
                "cost_saved": m.cost_saved,
                "avg_time_ms": m.avg_time_ms(),
                "created_at": m.created_at,
                "last_request": m.last_request,
            })
        })
        .collect();

    Json(json!({ "sessions": sessions })).into_response()
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown");
        },
    }
}
