//! HTTP management surface for the session registry.
//!
//! Served with axum next to the WebSocket listener. Errors are returned as
//! `{"error": {"code": ..., "message": ...}}`.

use crate::session::{SessionRegistry, SessionStatus};
use axum::extract::rejection::QueryRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get};
use axum::Router;
use serde::Deserialize;
use std::future::Future;
use std::sync::Arc;
use termrelay_core::{RelayError, RelayResult};
use tokio::net::TcpListener;
use tracing::{info, warn};

/// An error response.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),
}

impl ApiError {
    fn code(&self) -> &'static str {
        match self {
            ApiError::SessionNotFound(_) => "session_not_found",
            ApiError::BadRequest(_) => "bad_request",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            ApiError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": {
                "code": self.code(),
                "message": self.to_string(),
            }
        });
        (self.status(), Json(body)).into_response()
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct KillParams {
    #[serde(default)]
    pub force: bool,
}

/// Build the management router.
pub fn router(registry: Arc<SessionRegistry>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/sessions", get(list_sessions))
        .route("/sessions/{key}/status", get(session_status))
        .route("/sessions/{key}", delete(kill_session))
        .with_state(registry)
}

/// Serve the management API until `shutdown` resolves.
pub async fn serve<F>(
    listener: TcpListener,
    registry: Arc<SessionRegistry>,
    shutdown: F,
) -> RelayResult<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!(addr = %addr, "management API listening");
    }
    axum::serve(listener, router(registry))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| RelayError::Transport(format!("management API failed: {e}")))
}

async fn health(State(registry): State<Arc<SessionRegistry>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "sessions": registry.count().await,
    }))
}

async fn list_sessions(State(registry): State<Arc<SessionRegistry>>) -> Json<Vec<SessionStatus>> {
    Json(registry.list().await)
}

async fn session_status(
    State(registry): State<Arc<SessionRegistry>>,
    Path(key): Path<String>,
) -> Result<Json<SessionStatus>, ApiError> {
    validate_key(&key)?;
    let status = registry.status_key(&key).await;
    if !status.exists {
        return Err(ApiError::SessionNotFound(key));
    }
    Ok(Json(status))
}

async fn kill_session(
    State(registry): State<Arc<SessionRegistry>>,
    Path(key): Path<String>,
    params: Result<Query<KillParams>, QueryRejection>,
) -> Result<impl IntoResponse, ApiError> {
    validate_key(&key)?;
    let Query(params) = params.map_err(|e| {
        warn!(key = %key, error = %e, "rejected kill request");
        ApiError::BadRequest(e.body_text())
    })?;
    info!(key = %key, force = params.force, "kill requested over HTTP");
    let killed = registry.kill_key(&key, params.force).await;
    Ok(Json(serde_json::json!({ "killed": killed })))
}

/// Keys are 32 lowercase hex characters.
fn validate_key(key: &str) -> Result<(), ApiError> {
    let well_formed =
        key.len() == 32 && key.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
    if well_formed {
        Ok(())
    } else {
        Err(ApiError::BadRequest(format!("malformed session key {key:?}")))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::session::registry::tests::test_registry;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn call(
        registry: &Arc<SessionRegistry>,
        method: &str,
        uri: &str,
    ) -> (StatusCode, serde_json::Value) {
        let response = router(registry.clone())
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn health_reports_session_count() {
        let registry = Arc::new(test_registry());
        let (status, body) = call(&registry, "GET", "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["sessions"], 0);
    }

    #[tokio::test]
    async fn list_and_status_of_live_session() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(test_registry());
        let (created, _) = registry.get_or_create(dir.path(), None, 100, 30).await.unwrap();

        let (status, body) = call(&registry, "GET", "/sessions").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().map(Vec::len), Some(1));
        assert_eq!(body[0]["key"], created.key.as_str());

        let (status, body) =
            call(&registry, "GET", &format!("/sessions/{}/status", created.key)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["exists"], true);
        assert_eq!(body["bound"], false);
        assert_eq!(body["cols"], 100);
        assert_eq!(body["processId"], created.process_id.unwrap());
        assert!(body["bufferLength"].is_u64());

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_session_is_404_with_error_payload() {
        let registry = Arc::new(test_registry());
        let key = "0".repeat(32);
        let (status, body) = call(&registry, "GET", &format!("/sessions/{key}/status")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "session_not_found");
    }

    #[tokio::test]
    async fn malformed_requests_are_400() {
        let registry = Arc::new(test_registry());
        let (status, body) = call(&registry, "GET", "/sessions/not-a-key/status").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "bad_request");

        let key = "0".repeat(32);
        let (status, _) =
            call(&registry, "DELETE", &format!("/sessions/{key}?force=maybe")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn delete_kills_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(test_registry());
        let (created, _) = registry.get_or_create(dir.path(), None, 80, 24).await.unwrap();
        let uri = format!("/sessions/{}?force=true", created.key);

        let (status, body) = call(&registry, "DELETE", &uri).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["killed"], true);
        assert_eq!(registry.count().await, 0);

        let (status, body) = call(&registry, "DELETE", &uri).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["killed"], false);
    }
}
