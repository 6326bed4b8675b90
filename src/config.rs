//! qvmd configuration.
//!
//! This module holds two kinds of configuration:
//! - [`VmRecord`]: the persisted VM record (image, memory sizes, status)
//! - [`QvmdConfig`]: service settings loaded from a TOML file

use crate::error::{Error, Result};
use qvmd_protocol::ports;
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application name for config and data directories.
const APP_NAME: &str = "qvmd";

/// Config file name inside the config directory.
const CONFIG_FILE: &str = "config.toml";

/// Default guest memory in MiB.
pub const DEFAULT_RAM_MB: u32 = 512;

/// Default video memory in MiB.
pub const DEFAULT_VRAM_MB: u32 = 16;

/// VM lifecycle state as persisted in the record store.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RecordState {
    /// No emulator process.
    #[default]
    Stopped,
    /// Emulator process is alive.
    Running,
    /// Last operation left the VM in an error state.
    Error,
}

impl std::fmt::Display for RecordState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordState::Stopped => write!(f, "stopped"),
            RecordState::Running => write!(f, "running"),
            RecordState::Error => write!(f, "error"),
        }
    }
}

/// How a disk image is attached, derived from its file extension.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ImageKind {
    /// Raw block device (`.bin`, `.img`, `.raw`).
    Disk,
    /// Read-only removable media (`.iso`).
    Optical,
    /// Anything else. Attached like a disk.
    Unknown,
}

impl ImageKind {
    /// Classify a file name by its extension (case-insensitive).
    pub fn from_filename(name: &str) -> Self {
        let ext = Path::new(name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());

        match ext.as_deref() {
            Some("iso") => ImageKind::Optical,
            Some("bin") | Some("img") | Some("raw") => ImageKind::Disk,
            _ => ImageKind::Unknown,
        }
    }
}

/// The single persisted VM record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VmRecord {
    /// Display name.
    pub name: String,

    /// VM lifecycle state.
    #[serde(default)]
    pub status: RecordState,

    /// Path of the configured disk image.
    #[serde(default)]
    pub image_path: Option<PathBuf>,

    /// Original file name of the image (used to detect its kind).
    #[serde(default)]
    pub image_filename: Option<String>,

    /// Guest memory in MiB.
    pub ram_mb: u32,

    /// Video memory in MiB.
    pub vram_mb: u32,

    /// Creation timestamp (RFC 3339).
    pub created_at: String,
}

impl Default for VmRecord {
    fn default() -> Self {
        Self {
            name: "Default VM".to_string(),
            status: RecordState::Stopped,
            image_path: None,
            image_filename: None,
            ram_mb: DEFAULT_RAM_MB,
            vram_mb: DEFAULT_VRAM_MB,
            created_at: humantime::format_rfc3339_seconds(std::time::SystemTime::now())
                .to_string(),
        }
    }
}

impl VmRecord {
    /// Kind of the configured image.
    ///
    /// The original file name wins over the stored path, since uploads may be
    /// stored under a sanitized name.
    pub fn image_kind(&self) -> ImageKind {
        if let Some(name) = &self.image_filename {
            return ImageKind::from_filename(name);
        }
        self.image_path
            .as_deref()
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str())
            .map(ImageKind::from_filename)
            .unwrap_or(ImageKind::Unknown)
    }
}

/// What to do when a restored VM cannot be resumed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ResumePolicy {
    /// Log the failure and leave the emulator running (paused).
    #[default]
    KeepRunning,
    /// Stop the emulator and report the failure.
    Stop,
}

/// Service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QvmdConfig {
    /// Emulator executable.
    pub emulator: PathBuf,

    /// Root directory for the record database and snapshots.
    pub data_dir: PathBuf,

    /// Snapshot directory (defaults to `<data_dir>/snapshots`).
    pub snapshot_dir: Option<PathBuf>,

    /// QMP port on the loopback interface.
    pub qmp_port: u16,

    /// VNC display number; the display endpoint listens on `5900 + display`.
    pub vnc_display: u16,

    /// Idle timeout of a single control session.
    #[serde(with = "humantime_duration")]
    pub qmp_timeout: Duration,

    /// Settle delay after starting a migration when progress cannot be queried.
    #[serde(with = "humantime_duration")]
    pub migrate_settle: Duration,

    /// Delay before resuming a VM started from a snapshot.
    #[serde(with = "humantime_duration")]
    pub resume_delay: Duration,

    /// Grace period between SIGTERM and SIGKILL on stop.
    #[serde(with = "humantime_duration")]
    pub stop_grace: Duration,

    /// Behavior when a restored VM fails to resume.
    pub resume_policy: ResumePolicy,

    /// Attach a user-mode NIC.
    pub network: bool,
}

impl Default for QvmdConfig {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .or_else(dirs::data_dir)
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(APP_NAME);

        Self {
            emulator: PathBuf::from("qemu-system-x86_64"),
            data_dir,
            snapshot_dir: None,
            qmp_port: ports::QMP,
            vnc_display: 0,
            qmp_timeout: Duration::from_secs(10),
            migrate_settle: Duration::from_secs(2),
            resume_delay: Duration::from_secs(1),
            stop_grace: Duration::from_secs(5),
            resume_policy: ResumePolicy::KeepRunning,
            network: true,
        }
    }
}

impl QvmdConfig {
    /// Load configuration.
    ///
    /// Reads `path` if given, otherwise the default config file. A missing
    /// file yields the default configuration.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => match Self::default_path() {
                Some(p) => p,
                None => return Ok(Self::default()),
            },
        };

        match std::fs::read_to_string(&path) {
            Ok(text) => Self::from_toml(&text)
                .map_err(|e| Error::config(format!("{}: {}", path.display(), e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "config file not found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(Error::config(format!(
                "failed to read {}: {}",
                path.display(),
                e
            ))),
        }
    }

    /// Parse configuration from TOML text.
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| Error::config(e.to_string()))?;
        config.display_addr()?;
        Ok(config)
    }

    /// Default config file path (`<config_dir>/qvmd/config.toml`).
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Directory holding snapshot blobs.
    pub fn snapshot_dir(&self) -> PathBuf {
        self.snapshot_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("snapshots"))
    }

    /// Path of the record database.
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("qvmd.redb")
    }

    /// Address of the QMP listener.
    pub fn qmp_addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, self.qmp_port))
    }

    /// Address of the VNC display endpoint.
    pub fn display_addr(&self) -> Result<SocketAddr> {
        let port = ports::vnc(self.vnc_display).ok_or_else(|| {
            Error::config(format!(
                "vnc_display {} is past the last port (max {})",
                self.vnc_display,
                u16::MAX - ports::VNC_BASE
            ))
        })?;
        Ok(SocketAddr::from((Ipv4Addr::LOCALHOST, port)))
    }
}

/// Durations in humantime notation (`"10s"`, `"1500ms"`).
mod humantime_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        humantime::parse_duration(&text).map_err(serde::de::Error::custom)
    }
}
