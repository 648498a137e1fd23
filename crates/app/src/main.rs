use std::time::Instant;

use anyhow::Context;
use app::config::AppConfig;
use app::websocket::python_socket;
use app::{AppState, build_engine};
use engine::ExecutionStatus;
use axum::Json;
use axum::Router;
use axum::extract::{Request, State};
use axum::http::{HeaderValue, Method, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use serde_json::json;
use tower::ServiceBuilder;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::cors::{AllowHeaders, AllowOrigin, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tracing_subscriber::EnvFilter;

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

async fn root() -> Json<serde_json::Value> {
    Json(json!({ "message": "Python Sandbox API is running" }))
}

async fn healthcheck() -> Response {
    let mut response = Json(json!({ "status": "healthy" })).into_response();
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}

/// Counts only: identifiers are what a websocket `stop` is keyed on.
async fn active_executions(State(state): State<AppState>) -> Json<serde_json::Value> {
    let executions = state.engine.active_executions();
    let running = executions
        .iter()
        .filter(|execution| execution.status == ExecutionStatus::Running)
        .count();
    Json(json!({
        "active": executions.len(),
        "running": running,
        "pending": executions.len() - running,
    }))
}

async fn log_request_response(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let start = Instant::now();
    tracing::debug!(%method, %uri, "request");
    let response = next.run(request).await;
    tracing::info!(
        %method,
        %uri,
        status = response.status().as_u16(),
        latency_ms = start.elapsed().as_millis() as u64,
        "response"
    );
    response
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(err) => {
                tracing::warn!(%origin, error = %err, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true)
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AppConfig::from_env().context("invalid configuration")?;
    let addr = config.addr();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    rt.block_on(async move {
        let engine = build_engine(&config)
            .await
            .map_err(anyhow::Error::msg)
            .context("failed to initialize execution engine")?;
        let state = AppState {
            engine,
            max_code_length: config.max_code_length,
        };

        let app = Router::new()
            .route("/", get(root))
            .route("/health", get(healthcheck))
            .route("/executions", get(active_executions))
            .layer(TimeoutLayer::with_status_code(
                StatusCode::REQUEST_TIMEOUT,
                config.request_timeout,
            ))
            .route("/ws/python", get(python_socket))
            .layer(
                ServiceBuilder::new()
                    .layer(middleware::from_fn(log_request_response))
                    .layer(cors_layer(&config.allowed_origins))
                    .layer(ConcurrencyLimitLayer::new(config.max_inflight)),
            )
            .with_state(state);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        tracing::info!(%addr, "listening");
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;
        Ok::<(), anyhow::Error>(())
    })
}
