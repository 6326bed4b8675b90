//! Display relay over WebSocket.

use axum::{
    extract::{ws::WebSocketUpgrade, State},
    response::Response,
};
use std::sync::Arc;

use crate::vm::VmService;

/// Relay the VM display to a WebSocket viewer (noVNC).
#[utoipa::path(
    get,
    path = "/websockify",
    tag = "Display",
    responses(
        (status = 101, description = "Switching to the display relay")
    )
)]
pub async fn websockify(State(service): State<Arc<VmService>>, ws: WebSocketUpgrade) -> Response {
    let relay = service.relay().clone();
    ws.protocols(["binary"]).on_upgrade(move |socket| async move {
        if let Err(e) = relay.relay_websocket(socket).await {
            tracing::warn!(error = %e, "websocket display relay failed");
        }
    })
}
