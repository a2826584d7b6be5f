//! Acquisition HTTP front door.
//!
//! Thin layer over the scheduler: parses credentials and ids, maps domain
//! errors to status codes, never holds scheduling state of its own.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::acquisition::{AcquisitionError, Credentials, RequestScheduler, RequestState};

#[derive(Clone)]
pub struct ServerState {
    pub scheduler: Arc<RequestScheduler>,
}

#[derive(Debug, Serialize)]
struct RequestStateResponse {
    id: String,
    state: RequestState,
    #[serde(skip_serializing_if = "Option::is_none")]
    title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_query: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
struct ArtifactPathResponse {
    id: String,
    path: PathBuf,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

fn error_json(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
        .into_response()
}

fn map_error(err: AcquisitionError) -> Response {
    match &err {
        AcquisitionError::InvalidIdentifier(_) => {
            error_json(StatusCode::UNPROCESSABLE_ENTITY, err.to_string())
        }
        AcquisitionError::RequestNotFound(_) => error_json(StatusCode::NOT_FOUND, err.to_string()),
        AcquisitionError::InvalidState { .. } => error_json(StatusCode::CONFLICT, err.to_string()),
        AcquisitionError::Internal(e) => {
            warn!("Internal error serving acquisition request: {:#}", e);
            error_json(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

/// Extract provider credentials from a Basic Authorization header.
fn parse_basic_auth(headers: &HeaderMap) -> Option<Credentials> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some(Credentials::new(username, password))
}

async fn create_request(
    State(state): State<ServerState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let Some(credentials) = parse_basic_auth(&headers) else {
        return error_json(
            StatusCode::UNAUTHORIZED,
            "provider credentials required (Basic auth)",
        );
    };
    debug!("Acquisition requested for {}", id);

    match state.scheduler.request(&id, &credentials).await {
        Ok(RequestState::Invalid) => map_error(AcquisitionError::InvalidIdentifier(id)),
        Ok(request_state) => {
            let record = state.scheduler.get_request(&id);
            (
                StatusCode::OK,
                Json(RequestStateResponse {
                    id,
                    state: request_state,
                    title: record.as_ref().map(|r| r.title.clone()),
                    last_query: record.and_then(|r| r.last_query),
                }),
            )
                .into_response()
        }
        Err(err) => map_error(err),
    }
}

async fn get_request(State(state): State<ServerState>, Path(id): Path<String>) -> Response {
    match state.scheduler.get_request(&id) {
        Some(record) => (
            StatusCode::OK,
            Json(RequestStateResponse {
                id: record.id,
                state: record.state,
                title: Some(record.title),
                last_query: record.last_query,
            }),
        )
            .into_response(),
        None => map_error(AcquisitionError::RequestNotFound(id)),
    }
}

async fn get_raw_artifact(State(state): State<ServerState>, Path(id): Path<String>) -> Response {
    match state.scheduler.raw_artifact_path(&id) {
        Ok(path) => (StatusCode::OK, Json(ArtifactPathResponse { id, path })).into_response(),
        Err(err) => map_error(err),
    }
}

async fn process_request(State(state): State<ServerState>, Path(id): Path<String>) -> Response {
    match state.scheduler.process_available(&id).await {
        Ok(path) => (StatusCode::OK, Json(ArtifactPathResponse { id, path })).into_response(),
        Err(err) => map_error(err),
    }
}

async fn delete_request(State(state): State<ServerState>, Path(id): Path<String>) -> Response {
    match state.scheduler.remove_request(&id) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => map_error(err),
    }
}

pub fn make_router(state: ServerState) -> Router {
    Router::new()
        .route("/requests/{id}", post(create_request))
        .route("/requests/{id}", get(get_request).delete(delete_request))
        .route("/requests/{id}/raw", get(get_raw_artifact))
        .route("/requests/{id}/process", post(process_request))
        .with_state(state)
}

pub async fn run_server(port: u16, state: ServerState, shutdown: CancellationToken) -> Result<()> {
    let app = make_router(state);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("Failed to bind port {port}"))?;
    info!("Acquisition server listening on port {}", port);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("Server error")?;
    Ok(())
}
