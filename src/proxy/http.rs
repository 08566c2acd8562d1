//! HTTP surface of the executor queue proxy.
//!
//! All job endpoints are `POST /queue/{name}/<operation>` with a JSON body
//! and `Authorization: Bearer <token>`. Failures come back as
//! `{"error": code, "message": text}`, including bodies axum cannot parse.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::ExecutorProxy;
use crate::error::{Error, Result};
use crate::model::{Lease, RecordId};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DequeueRequest {
    pub executor_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub executor_name: String,
    pub jobs: Vec<Lease>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub known_ids: Vec<RecordId>,
    pub cancel_ids: Vec<RecordId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkCompleteRequest {
    pub executor_name: String,
    pub job: Lease,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkFailureRequest {
    pub executor_name: String,
    pub job: Lease,
    pub error_message: String,
}

/// Build the proxy routes.
pub fn router(proxy: Arc<ExecutorProxy>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/queue/{name}/dequeue", post(dequeue))
        .route("/queue/{name}/heartbeat", post(heartbeat))
        .route("/queue/{name}/markComplete", post(mark_complete))
        .route("/queue/{name}/markErrored", post(mark_errored))
        .route("/queue/{name}/markFailed", post(mark_failed))
        .with_state(proxy)
}

/// Serve the proxy on `listener` until `shutdown` fires.
pub async fn serve(
    listener: TcpListener,
    proxy: Arc<ExecutorProxy>,
    shutdown: CancellationToken,
) -> Result<()> {
    info!(addr = ?listener.local_addr().ok(), "executor proxy listening");
    axum::serve(listener, router(proxy))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

/// The token from `Authorization: Bearer <token>`, or empty.
fn bearer_token(headers: &HeaderMap) -> &str {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .unwrap_or("")
}

/// A JSON body, or the rejection turned into our error shape.
type Body<T> = std::result::Result<Json<T>, JsonRejection>;

async fn healthz() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

async fn dequeue(
    State(proxy): State<Arc<ExecutorProxy>>,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: Body<DequeueRequest>,
) -> Result<Response> {
    let Json(req) = body?;
    let job = proxy
        .dequeue(&name, bearer_token(&headers), &req.executor_name)
        .await?;
    Ok(match job {
        Some(job) => Json(job).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    })
}

async fn heartbeat(
    State(proxy): State<Arc<ExecutorProxy>>,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: Body<HeartbeatRequest>,
) -> Result<Json<HeartbeatResponse>> {
    let Json(req) = body?;
    let report = proxy
        .heartbeat(&name, bearer_token(&headers), &req.executor_name, &req.jobs)
        .await?;
    Ok(Json(HeartbeatResponse {
        known_ids: report.known,
        cancel_ids: report.canceled,
    }))
}

async fn mark_complete(
    State(proxy): State<Arc<ExecutorProxy>>,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: Body<MarkCompleteRequest>,
) -> Result<StatusCode> {
    let Json(req) = body?;
    proxy
        .mark_complete(&name, bearer_token(&headers), &req.executor_name, &req.job)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn mark_errored(
    State(proxy): State<Arc<ExecutorProxy>>,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: Body<MarkFailureRequest>,
) -> Result<StatusCode> {
    let Json(req) = body?;
    proxy
        .mark_errored(
            &name,
            bearer_token(&headers),
            &req.executor_name,
            &req.job,
            &req.error_message,
        )
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn mark_failed(
    State(proxy): State<Arc<ExecutorProxy>>,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: Body<MarkFailureRequest>,
) -> Result<StatusCode> {
    let Json(req) = body?;
    proxy
        .mark_failed(
            &name,
            bearer_token(&headers),
            &req.executor_name,
            &req.job,
            &req.error_message,
        )
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

impl From<JsonRejection> for Error {
    fn from(rejection: JsonRejection) -> Self {
        Error::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            Error::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized"),
            Error::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            Error::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            Error::OwnershipLost { .. } => (StatusCode::CONFLICT, "ownership_lost"),
            Error::InvalidTransition { .. } => (StatusCode::CONFLICT, "invalid_transition"),
            e if e.is_transient() => (StatusCode::SERVICE_UNAVAILABLE, "store_unavailable"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        if status.is_server_error() {
            error!("executor proxy request failed: {self}");
        }
        (
            status,
            Json(json!({
                "error": code,
                "message": self.to_string(),
            })),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn bearer_token_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), "");

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        assert_eq!(bearer_token(&headers), "abc");

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer_token(&headers), "");
    }

    #[test]
    fn errors_map_to_status_codes() {
        let status = |e: Error| e.into_response().status();
        assert_eq!(status(Error::Unauthorized), StatusCode::UNAUTHORIZED);
        assert_eq!(status(Error::BadRequest("x".into())), StatusCode::BAD_REQUEST);
        assert_eq!(status(Error::NotFound("queue x".into())), StatusCode::NOT_FOUND);
        assert_eq!(
            status(Error::OwnershipLost { id: RecordId(1) }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status(Error::Other("boom".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
