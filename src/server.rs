// HTTP surface of the agent
//
// Extension port: action descriptors, the four lifecycle calls and discovery.
// Health port: liveness, readiness and the Prometheus /metrics endpoint.

use anyhow::{Context, Result};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::action::{ActionRouter, ActionStateRequestBody, PrepareActionRequestBody};
use crate::discovery::HostDiscovery;
use crate::metrics;

#[derive(Clone)]
pub struct AppState {
    pub actions: ActionRouter,
    pub discovery: Arc<HostDiscovery>,
}

/// Error reply with a JSON `{title, detail}` body
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    title: String,
    detail: Option<String>,
}

impl ApiError {
    fn not_found(title: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            title: title.into(),
            detail: None,
        }
    }

    fn bad_request(title: impl Into<String>, detail: impl std::fmt::Display) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            title: title.into(),
            detail: Some(detail.to_string()),
        }
    }

    fn internal(e: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            title: "internal error".to_string(),
            detail: Some(format!("{:#}", e)),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(title = %self.title, detail = ?self.detail, "Request failed");
        }
        let body = json!({ "title": self.title, "detail": self.detail });
        (self.status, Json(body)).into_response()
    }
}

fn to_json<T: Serialize>(value: T) -> Result<Json<Value>, ApiError> {
    serde_json::to_value(value)
        .map(Json)
        .map_err(|e| ApiError::internal(e.into()))
}

/// Router of the extension port
pub fn extension_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/actions/{id}", get(describe_action))
        .route("/actions/{id}/{phase}", post(action_phase))
        .route("/discovery/host", get(describe_discovery))
        .route("/discovery/host/targets", get(discovered_targets))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Router of the health port; readiness flips once the agent is serving
pub fn health_router(ready: Arc<AtomicBool>) -> Router {
    Router::new()
        .route("/health/liveness", get(liveness))
        .route("/health/readiness", get(readiness))
        .route("/metrics", get(metrics_handler))
        .with_state(ready)
}

async fn index(State(state): State<AppState>) -> Json<Value> {
    let actions: Vec<Value> = state
        .actions
        .ids()
        .into_iter()
        .map(|id| json!({ "method": "GET", "path": format!("/actions/{}", id) }))
        .collect();
    Json(json!({
        "actions": actions,
        "discoveries": [{ "method": "GET", "path": "/discovery/host" }],
    }))
}

async fn describe_action(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let action = state
        .actions
        .get(&id)
        .ok_or_else(|| ApiError::not_found(format!("unknown action {}", id)))?;
    to_json(action.describe())
}

async fn action_phase(
    State(state): State<AppState>,
    Path((id, phase)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let action = state
        .actions
        .get(&id)
        .ok_or_else(|| ApiError::not_found(format!("unknown action {}", id)))?;

    if phase == "prepare" {
        let request: PrepareActionRequestBody = serde_json::from_value(body)
            .map_err(|e| ApiError::bad_request("invalid prepare request", e))?;
        return to_json(action.prepare(request).await.map_err(ApiError::internal)?);
    }

    let request: ActionStateRequestBody = serde_json::from_value(body)
        .map_err(|e| ApiError::bad_request(format!("invalid {} request", phase), e))?;
    match phase.as_str() {
        "start" => to_json(action.start(request).await.map_err(ApiError::internal)?),
        "status" => to_json(action.status(request).await.map_err(ApiError::internal)?),
        "stop" => to_json(action.stop(request).await.map_err(ApiError::internal)?),
        other => Err(ApiError::not_found(format!("unknown phase {}", other))),
    }
}

async fn describe_discovery(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    to_json(state.discovery.describe())
}

async fn discovered_targets(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    to_json(state.discovery.targets().await)
}

async fn liveness() -> impl IntoResponse {
    StatusCode::OK
}

async fn readiness(State(ready): State<Arc<AtomicBool>>) -> impl IntoResponse {
    if ready.load(Ordering::SeqCst) {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Metrics endpoint handler
async fn metrics_handler() -> Response {
    match metrics::gather_metrics() {
        Ok(metrics_text) => (StatusCode::OK, metrics_text).into_response(),
        Err(e) => {
            error!("Failed to gather metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Error gathering metrics: {}", e),
            )
                .into_response()
        }
    }
}

/// Serve `router` on `port` until `token` is cancelled
pub async fn serve(router: Router, port: u16, token: CancellationToken) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Listening on {}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(token.cancelled_owned())
        .await
        .with_context(|| format!("Server on {} failed", addr))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_readiness_follows_flag() {
        let ready = Arc::new(AtomicBool::new(false));
        let app = health_router(ready.clone());

        let request = || Request::get("/health/readiness").body(Body::empty()).unwrap();
        let response = app.clone().oneshot(request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        ready.store(true, Ordering::SeqCst);
        let response = app.oneshot(request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        metrics::init().unwrap();
        let app = health_router(Arc::new(AtomicBool::new(true)));
        let response = app
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_api_error_body() {
        let response = ApiError::not_found("unknown action x").into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["title"], "unknown action x");
    }
}
