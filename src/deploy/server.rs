use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use super::models::PullRequestEvent;
use super::orchestrator::PullRequestOrchestrator;
use super::webhook::parse_event;
use crate::errors::DeployError;

/// How long shutdown waits for in-flight deployments to observe cancellation.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

pub const GITHUB_EVENT_HEADER: &str = "x-github-event";

/// Configuration for the webhook server.
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

pub struct AppState {
    pub orchestrator: Arc<PullRequestOrchestrator>,
    /// Background orchestration tasks, one per accepted delivery.
    pub tasks: TaskTracker,
}

pub type SharedState = Arc<AppState>;

pub enum ApiError {
    BadRequest(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

pub fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/api/v1/ping", get(ping))
        .route("/api/v1/github/webhook", post(github_webhook))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn ping() -> Json<Value> {
    Json(json!({ "message": "pong" }))
}

async fn github_webhook(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let payload: Value = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("Invalid JSON payload: {}", e)))?;
    let event_name = headers
        .get(GITHUB_EVENT_HEADER)
        .and_then(|v| v.to_str().ok());

    let event = parse_event(event_name, &payload).map_err(|e| {
        warn!(error = %e, "rejecting webhook delivery");
        ApiError::BadRequest(e.to_string())
    })?;

    let Some(event) = event else {
        return Ok((
            StatusCode::ACCEPTED,
            Json(json!({ "message": "accepted, not handled" })),
        ));
    };

    info!(pr_id = event.pr_id, kind = %event.kind, "webhook accepted");
    let orchestrator = state.orchestrator.clone();
    state.tasks.spawn(dispatch(orchestrator, event));

    Ok((StatusCode::ACCEPTED, Json(json!({ "message": "accepted" }))))
}

/// Run one event to completion. Failures end here: they are logged, never
/// propagated to the server.
async fn dispatch(orchestrator: Arc<PullRequestOrchestrator>, event: PullRequestEvent) {
    match orchestrator.handle(&event).await {
        Ok(action) => info!(pr_id = event.pr_id, kind = %event.kind, ?action, "event handled"),
        Err(DeployError::NotDeployed { pr_id }) => {
            info!(pr_id, "pull request has no deployment to remove")
        }
        Err(e) => error!(pr_id = event.pr_id, kind = %event.kind, error = %e, "event handling failed"),
    }
}

/// Serve until Ctrl+C or until `shutdown` is cancelled, then cancel every
/// in-flight command and wait for the background tasks.
pub async fn start_server(
    config: ServerConfig,
    orchestrator: Arc<PullRequestOrchestrator>,
    shutdown: CancellationToken,
) -> Result<()> {
    let tasks = TaskTracker::new();
    let state = Arc::new(AppState {
        orchestrator,
        tasks: tasks.clone(),
    });
    let app = build_router(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    let local_addr = listener.local_addr()?;
    info!("prdeploy listening on http://{}", local_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await
        .context("Server error")?;

    tasks.close();
    if !tasks.is_empty() {
        info!(in_flight = tasks.len(), "waiting for in-flight deployments");
    }
    if tokio::time::timeout(SHUTDOWN_GRACE, tasks.wait()).await.is_err() {
        warn!("in-flight deployments did not finish before the shutdown deadline");
    }
    info!("server shut down gracefully");
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => info!("Ctrl+C received, shutting down"),
            Err(e) => {
                error!(error = %e, "failed to install Ctrl+C handler");
                shutdown.cancelled().await;
            }
        },
        _ = shutdown.cancelled() => {}
    }
    shutdown.cancel();
}
