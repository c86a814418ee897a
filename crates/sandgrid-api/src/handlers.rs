//! Task Store API handlers.
//!
//! Each handler authorizes the caller, reads/writes via `StateStore` and
//! answers `{"status":"OK", ...}` or `{"status":"FAIL","error":...}`.

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tracing::{debug, warn};

use sandgrid_core::{DequeueRequest, DequeueResponse, Submitted, Task, TaskResult, Uploaded};
use sandgrid_state::StateError;

use crate::ApiState;
use crate::auth::bearer_token;

/// Response wrapper for consistent API format.
#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    status: &'static str,
    #[serde(flatten)]
    data: T,
}

#[derive(Serialize)]
struct Empty {}

fn ok<T: Serialize>(status: StatusCode, data: T) -> Response {
    (status, Json(ApiResponse { status: "OK", data })).into_response()
}

fn error_response(msg: &str, status: StatusCode) -> Response {
    (
        status,
        Json(serde_json::json!({ "status": "FAIL", "error": msg })),
    )
        .into_response()
}

fn state_error(e: StateError) -> Response {
    let status = match &e {
        StateError::NotFound(_) => StatusCode::NOT_FOUND,
        StateError::Invalid(_) => StatusCode::BAD_REQUEST,
        StateError::Forbidden(_) => StatusCode::FORBIDDEN,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        warn!(error = %e, "task store failure");
    }
    error_response(&e.to_string(), status)
}

fn authorize(state: &ApiState, headers: &HeaderMap) -> Result<String, Response> {
    state
        .authorizer
        .principal(bearer_token(headers))
        .ok_or_else(|| error_response("unauthorized", StatusCode::UNAUTHORIZED))
}

// ── Tasks ──────────────────────────────────────────────────────

/// POST /task/
pub async fn submit_task(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: String,
) -> Response {
    if let Err(resp) = authorize(&state, &headers) {
        return resp;
    }
    let task = match Task::from_json_str(&body) {
        Ok(task) => task,
        Err(e) => return error_response(&e.to_string(), StatusCode::BAD_REQUEST),
    };
    match state.store.put_task(task) {
        Ok(id) => ok(StatusCode::CREATED, Submitted { id }),
        Err(e) => state_error(e),
    }
}

/// GET /task/{id}/
pub async fn get_task(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(resp) = authorize(&state, &headers) {
        return resp;
    }
    match state.store.get_task(&id) {
        Ok(Some(task)) => ok(StatusCode::OK, task),
        Ok(None) => error_response("task not found", StatusCode::NOT_FOUND),
        Err(e) => state_error(e),
    }
}

/// DELETE /task/{id}/
pub async fn delete_task(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(resp) = authorize(&state, &headers) {
        return resp;
    }
    match state.store.delete_task(&id) {
        Ok(true) => ok(StatusCode::OK, Empty {}),
        Ok(false) => error_response("task not found", StatusCode::NOT_FOUND),
        Err(e) => state_error(e),
    }
}

// ── Queue ──────────────────────────────────────────────────────

/// POST /queue/dequeue/
pub async fn dequeue(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let principal = match authorize(&state, &headers) {
        Ok(principal) => principal,
        Err(resp) => return resp,
    };
    let mut req: DequeueRequest = match serde_json::from_str(&body) {
        Ok(req) => req,
        Err(e) => return error_response(&e.to_string(), StatusCode::BAD_REQUEST),
    };
    req.limits.normalize();
    match state
        .store
        .dequeue(&principal, req.concurrency, &req.limits, &req.tags)
    {
        Ok(tasks) => {
            debug!(%principal, count = tasks.len(), "dequeue served");
            ok(StatusCode::OK, DequeueResponse { tasks })
        }
        Err(e) => state_error(e),
    }
}

/// GET /queue/stats/
pub async fn queue_stats(State(state): State<ApiState>, headers: HeaderMap) -> Response {
    if let Err(resp) = authorize(&state, &headers) {
        return resp;
    }
    match state.store.queue_stats() {
        Ok(stats) => ok(StatusCode::OK, stats),
        Err(e) => state_error(e),
    }
}

// ── Results ────────────────────────────────────────────────────

/// POST /result/{id}/
pub async fn put_result(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let principal = match authorize(&state, &headers) {
        Ok(principal) => principal,
        Err(resp) => return resp,
    };
    let result = match TaskResult::from_json_str(&body) {
        Ok(result) => result,
        Err(e) => return error_response(&e.to_string(), StatusCode::BAD_REQUEST),
    };
    match state.store.put_result(&id, &result, &principal) {
        Ok(()) => ok(StatusCode::OK, Empty {}),
        Err(e) => state_error(e),
    }
}

/// GET /result/{id}/
pub async fn get_result(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(resp) = authorize(&state, &headers) {
        return resp;
    }
    match state.store.get_result(&id) {
        Ok(Some(result)) => ok(StatusCode::OK, result),
        Ok(None) => error_response("result not found", StatusCode::NOT_FOUND),
        Err(e) => state_error(e),
    }
}

// ── Blobs ──────────────────────────────────────────────────────

/// POST /blob/
pub async fn upload_blob(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(resp) = authorize(&state, &headers) {
        return resp;
    }
    match state.store.put_blob(&body) {
        Ok(reference) => ok(StatusCode::CREATED, Uploaded { reference }),
        Err(e) => state_error(e),
    }
}

/// GET /blob/{reference}/
pub async fn download_blob(
    State(state): State<ApiState>,
    Path(reference): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(resp) = authorize(&state, &headers) {
        return resp;
    }
    match state.store.get_blob(&reference) {
        Ok(Some(bytes)) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/octet-stream")],
            bytes,
        )
            .into_response(),
        Ok(None) => error_response("blob not found", StatusCode::NOT_FOUND),
        Err(e) => state_error(e),
    }
}
