use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use atelier_common::protocol::ServerLimits;
use axum::{
    body::Body,
    http::{header::HeaderValue, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::{error, info};
use uuid::Uuid;

use atelier_server::auth::{IdentityVerifier, StaticTokenVerifier};
use atelier_server::broadcast::BroadcastFanout;
use atelier_server::config::ServerConfig;
use atelier_server::engine::{AnalysisEngine, HeuristicEngine};
use atelier_server::plugin::PluginRegistry;
use atelier_server::registry::ConnectionRegistry;
use atelier_server::scheduler::{AnalysisScheduler, DebounceConfig, SchedulerConfig};
use atelier_server::workspace::WorkspaceStore;
use atelier_server::ws::{self, SessionRouterState};

const REQUEST_ID_HEADER: &str = "x-request-id";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_filter)),
        )
        .init();

    let registry = ConnectionRegistry::new();
    let store = WorkspaceStore::new(config.max_history_entries);
    let fanout = BroadcastFanout::new(Arc::clone(&store), Arc::clone(&registry));
    let engine: Arc<dyn AnalysisEngine> = Arc::new(HeuristicEngine);
    let scheduler = AnalysisScheduler::spawn(
        SchedulerConfig {
            debounce: DebounceConfig::with_millis(config.debounce_window.as_millis() as u64),
            max_running: config.max_running_jobs,
            engine_timeout: config.engine_timeout,
        },
        Arc::clone(&engine),
        Arc::clone(&registry),
        Arc::clone(&fanout),
    );
    let plugins = PluginRegistry::with_builtins(Arc::clone(&engine));
    let verifier: Arc<dyn IdentityVerifier> =
        Arc::new(StaticTokenVerifier::from_spec(config.auth_tokens.as_deref()));

    let state = SessionRouterState {
        registry,
        store,
        fanout,
        scheduler,
        plugins,
        verifier,
        limits: ServerLimits {
            max_frame_bytes: ws::MAX_FRAME_BYTES,
            debounce_window_ms: config.debounce_window.as_millis() as u64,
            max_running_jobs: config.max_running_jobs,
            max_history_entries: config.max_history_entries,
        },
    };

    let app = build_router(state);

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind listener on {}", config.listen_addr))?;

    info!(listen_addr = %config.listen_addr, "starting atelier server");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server exited unexpectedly")
}

fn build_router(state: SessionRouterState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .merge(ws::router(state))
        .layer(CorsLayer::permissive())
        .layer(middleware::from_fn(request_context_middleware))
        .layer(middleware::from_fn(panic_handler))
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
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
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}

async fn panic_handler(request: Request<Body>, next: Next) -> Response {
    match tokio::spawn(async move { next.run(request).await }).await {
        Ok(response) => response,
        Err(join_error) => {
            error!(?join_error, "request handling panicked");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn request_context_middleware(request: Request<Body>, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let started_at = Instant::now();

    let mut response = next.run(request).await;

    if let Ok(request_id_header) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, request_id_header);
    }

    info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        latency_ms = started_at.elapsed().as_millis() as u64,
        "request completed"
    );

    response
}
