//! JSON request and response types for the API.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::config::{RecordState, VmRecord};
use crate::snapshot::Snapshot;

// ============================================================================
// VM Types
// ============================================================================

/// VM status.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct VmInfo {
    /// Display name.
    #[schema(example = "Default VM")]
    pub name: String,
    /// Persisted lifecycle state.
    #[schema(value_type = String, example = "stopped")]
    pub status: RecordState,
    /// Whether the emulator process exists right now.
    pub running: bool,
    /// Emulator process ID (if running).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Configured disk image.
    pub image_path: Option<String>,
    /// Original file name of the image.
    pub image_filename: Option<String>,
    /// Guest memory in MiB.
    #[schema(example = 512)]
    pub ram_mb: u32,
    /// Video memory in MiB.
    #[schema(example = 16)]
    pub vram_mb: u32,
    /// Creation timestamp (RFC 3339).
    pub created_at: String,
}

impl VmInfo {
    /// Build from the persisted record and live process state.
    pub fn from_record(record: VmRecord, pid: Option<u32>) -> Self {
        Self {
            name: record.name,
            status: record.status,
            running: pid.is_some(),
            pid,
            image_path: record.image_path.map(|p| p.display().to_string()),
            image_filename: record.image_filename,
            ram_mb: record.ram_mb,
            vram_mb: record.vram_mb,
            created_at: record.created_at,
        }
    }
}

/// Request to set the disk image.
#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SetImageRequest {
    /// Path of an image file on the host.
    #[schema(example = "/var/lib/qvmd/images/win98.iso")]
    pub path: String,
    /// Original file name, used to pick the boot path.
    #[serde(default)]
    pub filename: Option<String>,
}

/// Request to change VM settings.
#[derive(Debug, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpdateSettingsRequest {
    /// Guest memory in MiB.
    #[serde(default)]
    pub ram_mb: Option<u32>,
    /// Video memory in MiB.
    #[serde(default)]
    pub vram_mb: Option<u32>,
}

/// Start response.
#[derive(Debug, Serialize, ToSchema)]
pub struct StartResponse {
    /// Emulator process ID.
    pub pid: u32,
    /// Human-readable result.
    #[schema(example = "VM started")]
    pub message: String,
}

/// Generic acknowledgement.
#[derive(Debug, Serialize, ToSchema)]
pub struct MessageResponse {
    /// Human-readable result.
    #[schema(example = "VM stopped")]
    pub message: String,
}

impl MessageResponse {
    /// Create a response with `message`.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

// ============================================================================
// Snapshot Types
// ============================================================================

/// Snapshot information.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotInfo {
    /// Snapshot name.
    #[schema(example = "snapshot_1700000000000")]
    pub name: String,
    /// Modification time (RFC 3339).
    pub created_at: String,
    /// Blob size in bytes.
    pub size_bytes: u64,
}

impl From<Snapshot> for SnapshotInfo {
    fn from(snapshot: Snapshot) -> Self {
        Self {
            name: snapshot.name,
            created_at: snapshot.created_at,
            size_bytes: snapshot.size_bytes,
        }
    }
}

/// List snapshots response.
#[derive(Debug, Serialize, ToSchema)]
pub struct ListSnapshotsResponse {
    /// Snapshots, newest first.
    pub snapshots: Vec<SnapshotInfo>,
}

/// Save snapshot response.
#[derive(Debug, Serialize, ToSchema)]
pub struct SaveSnapshotResponse {
    /// Generated snapshot name.
    #[schema(example = "snapshot_1700000000000")]
    pub name: String,
    /// Path of the written blob.
    pub path: String,
}

/// Request to boot from a snapshot.
#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StartFromSnapshotRequest {
    /// Snapshot name.
    #[schema(example = "snapshot_1700000000000")]
    pub snapshot_name: String,
}

// ============================================================================
// Health Types
// ============================================================================

/// Health check response.
#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    /// Health status (e.g., "ok").
    #[schema(example = "ok")]
    pub status: &'static str,
    /// Server version.
    #[schema(example = "0.1.0")]
    pub version: &'static str,
}

// ============================================================================
// Error Types
// ============================================================================

/// API error response.
#[derive(Debug, Serialize, ToSchema)]
pub struct ApiErrorResponse {
    /// Error message.
    #[schema(example = "vm is not running")]
    pub error: String,
    /// Error code.
    #[schema(example = "CONFLICT")]
    pub code: String,
}
