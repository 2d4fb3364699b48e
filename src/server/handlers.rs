//! HTTP request handlers

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::errors::StagerError;
use crate::models::staging::{StagingTaskAnnotation, TaskCallbackResponse};
use crate::server::state::ServerState;
use crate::utils::version_info;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

/// Health check handler
pub async fn health_handler() -> impl IntoResponse {
    let version = version_info();
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "stager".to_string(),
        version: version.version,
    })
}

/// Task completion callback handler.
///
/// The annotation embedded in the task selects the backend that built the
/// recipe; its response is forwarded to the Cloud Controller before the
/// scheduler gets its acknowledgement, so an undelivered response keeps
/// the callback eligible for redelivery.
pub async fn staging_complete_handler(
    State(state): State<Arc<ServerState>>,
    Path(staging_guid): Path<String>,
    Json(callback): Json<TaskCallbackResponse>,
) -> Result<StatusCode, StatusCode> {
    let _permit = state
        .cc_permits
        .acquire()
        .await
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;

    debug!("Staging task callback received for {}", staging_guid);

    let annotation: StagingTaskAnnotation = serde_json::from_str(&callback.annotation)
        .map_err(|e| {
            warn!("Malformed annotation on callback for {}: {}", staging_guid, e);
            StatusCode::BAD_REQUEST
        })?;

    let backend = state
        .backends
        .get(annotation.lifecycle.as_str())
        .ok_or_else(|| {
            warn!(
                "Callback for {} names unknown lifecycle '{}'",
                staging_guid, annotation.lifecycle
            );
            StatusCode::BAD_REQUEST
        })?;

    let response = backend.build_staging_response(&callback).map_err(|e| {
        warn!("Malformed callback for {}: {}", staging_guid, e);
        StatusCode::BAD_REQUEST
    })?;

    match state.cc_client.staging_complete(&staging_guid, &response).await {
        Ok(()) => {
            info!("Staging response delivered for {}", staging_guid);
            Ok(StatusCode::OK)
        }
        Err(e) => {
            error!("Failed to deliver staging response for {}: {}", staging_guid, e);
            Err(StatusCode::BAD_GATEWAY)
        }
    }
}

/// Staging stop handler: the Cloud Controller cancels an in-flight
/// staging task.
pub async fn staging_stop_handler(
    State(state): State<Arc<ServerState>>,
    Path(staging_guid): Path<String>,
) -> Result<StatusCode, StatusCode> {
    info!("Stop requested for staging task {}", staging_guid);

    match state.task_client.cancel_task(&staging_guid).await {
        Ok(()) => Ok(StatusCode::ACCEPTED),
        Err(StagerError::TaskNotFound) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            error!("Failed to cancel staging task {}: {}", staging_guid, e);
            Err(StatusCode::BAD_GATEWAY)
        }
    }
}
