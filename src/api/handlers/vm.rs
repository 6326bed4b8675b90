//! VM lifecycle handlers.

use axum::{extract::State, Json};
use std::path::PathBuf;
use std::sync::Arc;

use crate::api::error::ApiError;
use crate::api::handlers::blocking;
use crate::api::types::{
    ApiErrorResponse, MessageResponse, SetImageRequest, StartResponse, UpdateSettingsRequest,
    VmInfo,
};
use crate::vm::VmService;

fn vm_info(service: &VmService) -> crate::Result<VmInfo> {
    let record = service.status()?;
    Ok(VmInfo::from_record(record, service.pid()))
}

/// Get VM status.
#[utoipa::path(
    get,
    path = "/api/vm",
    tag = "VM",
    responses(
        (status = 200, description = "VM status", body = VmInfo),
        (status = 500, description = "Record store failure", body = ApiErrorResponse)
    )
)]
pub async fn get_vm(State(service): State<Arc<VmService>>) -> Result<Json<VmInfo>, ApiError> {
    Ok(Json(blocking(&service, vm_info).await?))
}

/// Set the disk image to boot.
#[utoipa::path(
    post,
    path = "/api/vm/image",
    tag = "VM",
    request_body = SetImageRequest,
    responses(
        (status = 200, description = "Image recorded", body = VmInfo),
        (status = 400, description = "Image not found", body = ApiErrorResponse),
        (status = 409, description = "VM is running", body = ApiErrorResponse)
    )
)]
pub async fn set_image(
    State(service): State<Arc<VmService>>,
    Json(req): Json<SetImageRequest>,
) -> Result<Json<VmInfo>, ApiError> {
    if req.path.is_empty() {
        return Err(ApiError::BadRequest("image path cannot be empty".into()));
    }

    let info = blocking(&service, move |service| {
        service.set_image(&PathBuf::from(&req.path), req.filename)?;
        vm_info(service)
    })
    .await?;
    Ok(Json(info))
}

/// Start the VM.
#[utoipa::path(
    post,
    path = "/api/vm/start",
    tag = "VM",
    responses(
        (status = 200, description = "VM started", body = StartResponse),
        (status = 400, description = "No image configured", body = ApiErrorResponse),
        (status = 409, description = "VM already running", body = ApiErrorResponse),
        (status = 500, description = "Emulator failed to spawn", body = ApiErrorResponse)
    )
)]
pub async fn start_vm(
    State(service): State<Arc<VmService>>,
) -> Result<Json<StartResponse>, ApiError> {
    let pid = blocking(&service, |service| service.start()).await?;
    Ok(Json(StartResponse {
        pid,
        message: "VM started".into(),
    }))
}

/// Stop the VM.
#[utoipa::path(
    post,
    path = "/api/vm/stop",
    tag = "VM",
    responses(
        (status = 200, description = "VM stopped", body = MessageResponse)
    )
)]
pub async fn stop_vm(
    State(service): State<Arc<VmService>>,
) -> Result<Json<MessageResponse>, ApiError> {
    service.stop().await?;
    Ok(Json(MessageResponse::new("VM stopped")))
}

/// Change memory sizes.
#[utoipa::path(
    patch,
    path = "/api/vm/settings",
    tag = "VM",
    request_body = UpdateSettingsRequest,
    responses(
        (status = 200, description = "Settings updated", body = VmInfo),
        (status = 400, description = "Invalid settings", body = ApiErrorResponse),
        (status = 409, description = "Stop the VM before changing settings", body = ApiErrorResponse)
    )
)]
pub async fn update_settings(
    State(service): State<Arc<VmService>>,
    Json(req): Json<UpdateSettingsRequest>,
) -> Result<Json<VmInfo>, ApiError> {
    let info = blocking(&service, move |service| {
        service.update_settings(req.ram_mb, req.vram_mb)?;
        vm_info(service)
    })
    .await?;
    Ok(Json(info))
}
