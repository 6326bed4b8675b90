//! HTTP API server for qvmd.
//!
//! This module exposes the single VM, its snapshots and its display over HTTP.
//!
//! # Example
//!
//! ```bash
//! # Start the server
//! qvmd serve --listen 127.0.0.1:8080
//!
//! # Point the VM at an image and boot it
//! curl -X POST http://localhost:8080/api/vm/image \
//!   -H "Content-Type: application/json" \
//!   -d '{"path": "/srv/images/flex.bin"}'
//! curl -X POST http://localhost:8080/api/vm/start
//! ```

pub mod error;
pub mod handlers;
pub mod types;

use axum::{
    routing::{delete, get, patch, post},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tower_http::{cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer};
use utoipa::OpenApi;

use crate::error::{Error, Result};
use crate::vm::VmService;

/// OpenAPI documentation for the qvmd API.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "qvmd API",
        version = "0.1.0",
        description = "Single-VM QEMU supervisor: lifecycle, snapshots and display relay."
    ),
    tags(
        (name = "Health", description = "Health check endpoints"),
        (name = "VM", description = "VM lifecycle and settings"),
        (name = "Snapshots", description = "Snapshot save, restore and management"),
        (name = "Display", description = "VNC display relay")
    ),
    paths(
        handlers::health::health,
        handlers::vm::get_vm,
        handlers::vm::set_image,
        handlers::vm::start_vm,
        handlers::vm::stop_vm,
        handlers::vm::update_settings,
        handlers::snapshots::save_snapshot,
        handlers::snapshots::list_snapshots,
        handlers::snapshots::delete_snapshot,
        handlers::snapshots::start_from_snapshot,
        handlers::display::websockify,
    ),
    components(schemas(
        types::VmInfo,
        types::SetImageRequest,
        types::UpdateSettingsRequest,
        types::StartResponse,
        types::MessageResponse,
        types::SnapshotInfo,
        types::ListSnapshotsResponse,
        types::SaveSnapshotResponse,
        types::StartFromSnapshotRequest,
        types::HealthResponse,
        types::ApiErrorResponse,
    ))
)]
pub struct ApiDoc;

/// Encoding of the exported OpenAPI document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum DocFormat {
    /// Pretty-printed JSON.
    #[default]
    Json,
    /// YAML.
    Yaml,
}

/// Render the qvmd OpenAPI document.
pub fn render_openapi(format: DocFormat) -> Result<String> {
    let doc = ApiDoc::openapi();
    match format {
        DocFormat::Json => doc
            .to_pretty_json()
            .map_err(|e| Error::config(format!("openapi document as json: {}", e))),
        DocFormat::Yaml => serde_yaml::to_string(&doc)
            .map_err(|e| Error::config(format!("openapi document as yaml: {}", e))),
    }
}

/// Timeout for VM and snapshot requests. Restores wait for the engine to
/// load the snapshot, so this is generous.
const API_TIMEOUT: Duration = Duration::from_secs(120);

/// Create the API router with all endpoints.
pub fn create_router(service: Arc<VmService>) -> Router {
    let health_route = Router::new().route("/health", get(handlers::health::health));

    // Display relay runs for the life of the viewer, so no timeout
    let display_route = Router::new().route("/websockify", get(handlers::display::websockify));

    let vm_routes = Router::new()
        .route("/", get(handlers::vm::get_vm))
        .route("/image", post(handlers::vm::set_image))
        .route("/start", post(handlers::vm::start_vm))
        .route("/stop", post(handlers::vm::stop_vm))
        .route("/settings", patch(handlers::vm::update_settings))
        .route("/snapshot/save", post(handlers::snapshots::save_snapshot))
        .route("/snapshots", get(handlers::snapshots::list_snapshots))
        .route(
            "/snapshot/:name",
            delete(handlers::snapshots::delete_snapshot),
        )
        .route(
            "/start-from-snapshot",
            post(handlers::snapshots::start_from_snapshot),
        )
        .layer(TimeoutLayer::new(API_TIMEOUT));

    // CORS: localhost origins only
    let cors = CorsLayer::new()
        .allow_origin([
            axum::http::HeaderValue::from_static("http://localhost:8080"),
            axum::http::HeaderValue::from_static("http://127.0.0.1:8080"),
            axum::http::HeaderValue::from_static("http://localhost:5173"),
            axum::http::HeaderValue::from_static("http://127.0.0.1:5173"),
        ])
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::PATCH,
            axum::http::Method::DELETE,
        ])
        .allow_headers([axum::http::header::CONTENT_TYPE]);

    Router::new()
        .merge(health_route)
        .merge(display_route)
        .nest("/api/vm", vm_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(service)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QvmdConfig;
    use crate::db::MemoryStore;
    use crate::supervisor::EmulatorLauncher;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::Value;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn router(dir: &TempDir) -> Router {
        let config = QvmdConfig {
            data_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let service = VmService::new(
            config,
            Arc::new(MemoryStore::default()),
            Arc::new(EmulatorLauncher::new("/nonexistent/qemu")),
        )
        .unwrap();
        create_router(Arc::new(service))
    }

    async fn send(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(json) => request
                .header("content-type", "application/json")
                .body(Body::from(json.to_string())),
            None => request.body(Body::empty()),
        }
        .unwrap();

        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    #[tokio::test]
    async fn test_health() {
        let dir = TempDir::new().unwrap();
        let (status, body) = send(&router(&dir), "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_get_vm_defaults() {
        let dir = TempDir::new().unwrap();
        let (status, body) = send(&router(&dir), "GET", "/api/vm", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "stopped");
        assert_eq!(body["running"], false);
        assert_eq!(body["ramMb"], 512);
        assert_eq!(body["vramMb"], 16);
        assert!(body["imagePath"].is_null());
    }

    #[tokio::test]
    async fn test_start_without_image_is_bad_request() {
        let dir = TempDir::new().unwrap();
        let (status, body) = send(&router(&dir), "POST", "/api/vm/start", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "BAD_REQUEST");
    }

    #[tokio::test]
    async fn test_spawn_failure_is_internal_error() {
        let dir = TempDir::new().unwrap();
        let image = dir.path().join("flex.bin");
        std::fs::write(&image, b"\0").unwrap();
        let router = router(&dir);

        let (status, _) = send(
            &router,
            "POST",
            "/api/vm/image",
            Some(serde_json::json!({ "path": image.display().to_string() })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(&router, "POST", "/api/vm/start", None).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["error"].as_str().unwrap().contains("/nonexistent/qemu"));

        let (_, body) = send(&router, "GET", "/api/vm", None).await;
        assert_eq!(body["running"], false);
    }

    #[tokio::test]
    async fn test_settings_update_and_validation() {
        let dir = TempDir::new().unwrap();
        let router = router(&dir);

        let (status, body) = send(
            &router,
            "PATCH",
            "/api/vm/settings",
            Some(serde_json::json!({ "ramMb": 2048 })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ramMb"], 2048);
        assert_eq!(body["vramMb"], 16);

        let (status, _) = send(
            &router,
            "PATCH",
            "/api/vm/settings",
            Some(serde_json::json!({ "vramMb": 0 })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_snapshot_routes_when_stopped() {
        let dir = TempDir::new().unwrap();
        let router = router(&dir);

        let (status, body) = send(&router, "GET", "/api/vm/snapshots", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["snapshots"], serde_json::json!([]));

        let (status, _) = send(&router, "POST", "/api/vm/snapshot/save", None).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = send(&router, "DELETE", "/api/vm/snapshot/missing", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(&router, "DELETE", "/api/vm/snapshot/bad.name", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(&router, "POST", "/api/vm/stop", None).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[test]
    fn test_openapi_lists_routes() {
        let doc = ApiDoc::openapi();
        for path in [
            "/health",
            "/api/vm",
            "/api/vm/start",
            "/api/vm/snapshot/{name}",
            "/api/vm/start-from-snapshot",
            "/websockify",
        ] {
            assert!(doc.paths.paths.contains_key(path), "missing {}", path);
        }
    }

    #[test]
    fn test_render_openapi_formats() {
        let json: Value = serde_json::from_str(&render_openapi(DocFormat::Json).unwrap()).unwrap();
        assert_eq!(json["info"]["title"], "qvmd API");
        assert!(json["paths"]["/api/vm/snapshot/save"]["post"].is_object());

        let yaml = render_openapi(DocFormat::Yaml).unwrap();
        assert!(yaml.contains("/api/vm/start-from-snapshot:"));
        assert!(yaml.contains("VmInfo:"));
    }
}
