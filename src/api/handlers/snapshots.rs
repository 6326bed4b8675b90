//! Snapshot handlers.

use axum::{
    extract::{Path, State},
    Json,
};
use std::sync::Arc;

use crate::api::error::ApiError;
use crate::api::handlers::blocking;
use crate::api::types::{
    ApiErrorResponse, ListSnapshotsResponse, MessageResponse, SaveSnapshotResponse,
    StartFromSnapshotRequest, StartResponse,
};
use crate::vm::VmService;

/// Save the running VM's state.
#[utoipa::path(
    post,
    path = "/api/vm/snapshot/save",
    tag = "Snapshots",
    responses(
        (status = 200, description = "Snapshot saved", body = SaveSnapshotResponse),
        (status = 408, description = "Emulator did not answer", body = ApiErrorResponse),
        (status = 409, description = "VM is not running", body = ApiErrorResponse),
        (status = 500, description = "Migration failed", body = ApiErrorResponse)
    )
)]
pub async fn save_snapshot(
    State(service): State<Arc<VmService>>,
) -> Result<Json<SaveSnapshotResponse>, ApiError> {
    let saved = service.save_snapshot().await?;
    Ok(Json(SaveSnapshotResponse {
        name: saved.name,
        path: saved.path.display().to_string(),
    }))
}

/// List snapshots, newest first.
#[utoipa::path(
    get,
    path = "/api/vm/snapshots",
    tag = "Snapshots",
    responses(
        (status = 200, description = "List of snapshots", body = ListSnapshotsResponse)
    )
)]
pub async fn list_snapshots(
    State(service): State<Arc<VmService>>,
) -> Result<Json<ListSnapshotsResponse>, ApiError> {
    let snapshots = blocking(&service, |service| Ok(service.list_snapshots())).await?;
    Ok(Json(ListSnapshotsResponse {
        snapshots: snapshots.into_iter().map(Into::into).collect(),
    }))
}

/// Delete a snapshot.
#[utoipa::path(
    delete,
    path = "/api/vm/snapshot/{name}",
    tag = "Snapshots",
    params(
        ("name" = String, Path, description = "Snapshot name")
    ),
    responses(
        (status = 200, description = "Snapshot deleted", body = MessageResponse),
        (status = 404, description = "Snapshot not found", body = ApiErrorResponse)
    )
)]
pub async fn delete_snapshot(
    State(service): State<Arc<VmService>>,
    Path(name): Path<String>,
) -> Result<Json<MessageResponse>, ApiError> {
    blocking(&service, move |service| service.delete_snapshot(&name)).await?;
    Ok(Json(MessageResponse::new("Snapshot deleted")))
}

/// Boot the configured image from a snapshot.
#[utoipa::path(
    post,
    path = "/api/vm/start-from-snapshot",
    tag = "Snapshots",
    request_body = StartFromSnapshotRequest,
    responses(
        (status = 200, description = "VM started and resumed", body = StartResponse),
        (status = 400, description = "No image configured", body = ApiErrorResponse),
        (status = 404, description = "Snapshot not found", body = ApiErrorResponse),
        (status = 409, description = "VM already running", body = ApiErrorResponse),
        (status = 500, description = "VM could not be resumed", body = ApiErrorResponse)
    )
)]
pub async fn start_from_snapshot(
    State(service): State<Arc<VmService>>,
    Json(req): Json<StartFromSnapshotRequest>,
) -> Result<Json<StartResponse>, ApiError> {
    if req.snapshot_name.is_empty() {
        return Err(ApiError::BadRequest("snapshot name required".into()));
    }

    let pid = service.start_from_snapshot(&req.snapshot_name).await?;
    Ok(Json(StartResponse {
        pid,
        message: format!("VM started from {}", req.snapshot_name),
    }))
}
