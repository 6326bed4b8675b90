//! Snapshot storage and the save/restore coordinator.
//!
//! A snapshot is a migration stream written to `<dir>/<name>.state`. Saving
//! streams the running VM's state into that file through an `exec:` migration
//! target; restoring starts a fresh emulator with `-incoming` reading it back
//! and resumes execution once loading is done.

use crate::config::ResumePolicy;
use crate::error::{Error, Result};
use crate::qemu::{outgoing_uri, LaunchSpec, QmpClient};
use crate::supervisor::Supervisor;
use qvmd_protocol::{Command, MigrationInfo, StatusInfo};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// File extension of snapshot blobs.
pub const SNAPSHOT_EXT: &str = "state";

/// Prefix of generated snapshot names.
const NAME_PREFIX: &str = "snapshot_";

/// Interval between status queries while waiting on the emulator.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Polling is bounded by this multiple of the settle delay.
const POLL_BOUND_FACTOR: u32 = 5;

/// A persisted snapshot blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    /// Snapshot name (file stem).
    pub name: String,
    /// Full path of the blob.
    pub path: PathBuf,
    /// Modification time, RFC 3339.
    pub created_at: String,
    /// Blob size in bytes.
    pub size_bytes: u64,
    #[serde(skip)]
    modified: SystemTime,
}

/// Directory of snapshot blobs.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    /// Use `dir` as the snapshot directory. Nothing is created yet.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Snapshot directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create the directory if it doesn't exist.
    pub fn ensure_dir(&self) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        Ok(())
    }

    /// Blob path for `name`. The name is validated before any path is built.
    pub fn path_for(&self, name: &str) -> Result<PathBuf> {
        validate_name(name)?;
        Ok(self.dir.join(format!("{}.{}", name, SNAPSHOT_EXT)))
    }

    /// Whether a blob exists for `name`.
    pub fn exists(&self, name: &str) -> bool {
        self.path_for(name).map(|p| p.is_file()).unwrap_or(false)
    }

    /// Generate a fresh `snapshot_<unix-millis>` name.
    ///
    /// A numeric suffix is added if a blob with that name already exists.
    pub fn generate_name(&self) -> String {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        let base = format!("{}{}", NAME_PREFIX, millis);

        let mut candidate = base.clone();
        let mut suffix = 1u32;
        while self.exists(&candidate) {
            candidate = format!("{}_{}", base, suffix);
            suffix += 1;
        }
        candidate
    }

    /// Enumerate snapshots, newest first.
    ///
    /// Only `*.state` files with a valid name are listed. An unreadable or
    /// missing directory yields an empty list.
    pub fn list(&self) -> Vec<Snapshot> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::debug!(dir = %self.dir.display(), error = %e, "snapshot directory unreadable");
                return Vec::new();
            }
        };

        let mut snapshots: Vec<Snapshot> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some(SNAPSHOT_EXT) {
                    return None;
                }
                let name = path.file_stem()?.to_str()?.to_string();
                validate_name(&name).ok()?;

                let metadata = entry.metadata().ok()?;
                if !metadata.is_file() {
                    return None;
                }
                let modified = metadata.modified().unwrap_or(UNIX_EPOCH);

                Some(Snapshot {
                    name,
                    created_at: humantime::format_rfc3339_millis(modified).to_string(),
                    size_bytes: metadata.len(),
                    path,
                    modified,
                })
            })
            .collect();

        snapshots.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| b.name.cmp(&a.name)));
        snapshots
    }

    /// Delete a snapshot blob.
    pub fn delete(&self, name: &str) -> Result<()> {
        let path = self.path_for(name)?;
        match std::fs::remove_file(&path) {
            Ok(()) => {
                tracing::info!(snapshot = %name, "snapshot deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::snapshot_not_found(name))
            }
            Err(e) => Err(Error::Io(e)),
        }
    }
}

/// Snapshot names are restricted to `[A-Za-z0-9_-]+`.
pub fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidSnapshotName(name.to_string()))
    }
}

/// Save and restore of VM state through migration-to-file.
#[derive(Debug, Clone)]
pub struct SnapshotCoordinator {
    store: SnapshotStore,
    qmp: QmpClient,
    settle: Duration,
    resume_delay: Duration,
    resume_policy: ResumePolicy,
}

impl SnapshotCoordinator {
    /// Create a coordinator with the default delays (2s settle, 1s resume).
    pub fn new(store: SnapshotStore, qmp: QmpClient) -> Self {
        Self {
            store,
            qmp,
            settle: Duration::from_secs(2),
            resume_delay: Duration::from_secs(1),
            resume_policy: ResumePolicy::default(),
        }
    }

    /// Set the migration settle delay.
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// Set the delay between an inbound start and the first resume attempt.
    pub fn with_resume_delay(mut self, delay: Duration) -> Self {
        self.resume_delay = delay;
        self
    }

    /// Set what happens to the emulator when resuming fails.
    pub fn with_resume_policy(mut self, policy: ResumePolicy) -> Self {
        self.resume_policy = policy;
        self
    }

    /// Snapshot storage.
    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    /// Save the running VM's state under `name`.
    ///
    /// Returns once the engine reports the migration complete. If the engine
    /// can't report progress, returns after the settle delay instead.
    ///
    /// A completed migration leaves the guest paused, so `cont` is sent
    /// afterwards. A guest that won't resume is logged; the snapshot is kept.
    pub async fn save(&self, supervisor: &Supervisor, name: &str) -> Result<PathBuf> {
        let path = self.store.path_for(name)?;
        if !supervisor.is_running() {
            return Err(Error::NotRunning);
        }
        self.store.ensure_dir()?;

        tracing::info!(snapshot = %name, path = %path.display(), "saving snapshot");
        self.qmp
            .execute(&Command::migrate(outgoing_uri(&path)))
            .await?;
        self.await_migration().await?;

        if let Err(e) = self.qmp.execute(&Command::cont()).await {
            tracing::warn!(snapshot = %name, error = %e, "failed to resume vm after save");
        }

        tracing::info!(snapshot = %name, "snapshot saved");
        Ok(path)
    }

    async fn await_migration(&self) -> Result<()> {
        let deadline = Instant::now() + self.settle * POLL_BOUND_FACTOR;

        loop {
            match self.qmp.execute(&Command::query_migrate()).await {
                Ok(payload) => {
                    let info: MigrationInfo = serde_json::from_value(payload).unwrap_or_default();
                    if info.is_completed() {
                        return Ok(());
                    }
                    if info.is_failed() {
                        return Err(Error::protocol(format!(
                            "migration {}",
                            info.status.as_deref().unwrap_or("failed")
                        )));
                    }
                    tracing::debug!(status = ?info.status, "migration in progress");
                }
                Err(Error::Protocol(desc)) => {
                    tracing::debug!(error = %desc, "migration progress unavailable, waiting settle delay");
                    tokio::time::sleep(self.settle).await;
                    return Ok(());
                }
                Err(e) => return Err(e),
            }

            if Instant::now() >= deadline {
                tracing::warn!("migration did not complete in time");
                return Err(Error::Timeout);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Start a new emulator that loads `name`, then resume it.
    ///
    /// Resume failures are logged and reported as [`Error::ResumeFailed`].
    /// The emulator is left running under [`ResumePolicy::KeepRunning`] and
    /// stopped under [`ResumePolicy::Stop`].
    pub async fn start_from_snapshot(
        &self,
        supervisor: &Supervisor,
        spec: LaunchSpec,
        name: &str,
    ) -> Result<u32> {
        if supervisor.is_running() {
            return Err(Error::AlreadyRunning);
        }
        let path = self.store.path_for(name)?;
        if !path.is_file() {
            return Err(Error::snapshot_not_found(name));
        }

        tracing::info!(snapshot = %name, "starting from snapshot");
        let pid = supervisor.start(&spec.with_incoming(&path))?;

        tokio::time::sleep(self.resume_delay).await;

        match self.resume(supervisor).await {
            Ok(()) => {
                tracing::info!(snapshot = %name, pid, "vm resumed");
                Ok(pid)
            }
            Err(e) => {
                tracing::warn!(snapshot = %name, pid, error = %e, policy = ?self.resume_policy, "failed to resume vm");
                if self.resume_policy == ResumePolicy::Stop {
                    supervisor.stop().await?;
                }
                Err(Error::ResumeFailed(e.to_string()))
            }
        }
    }

    /// Wait until the inbound stream is loaded, then send `cont`.
    async fn resume(&self, supervisor: &Supervisor) -> Result<()> {
        let deadline = Instant::now() + self.settle * POLL_BOUND_FACTOR;

        loop {
            if !supervisor.is_running() {
                return Err(Error::NotRunning);
            }

            match self.qmp.execute(&Command::query_status()).await {
                Ok(payload) => {
                    let info: StatusInfo = serde_json::from_value(payload).unwrap_or_default();
                    if !info.is_loading() {
                        break;
                    }
                    tracing::debug!(status = %info.status, "snapshot still loading");
                }
                Err(e) if e.is_connection_refused() => {
                    tracing::debug!("control listener not ready yet");
                }
                // No status query available; go straight to cont
                Err(Error::Protocol(_)) => break,
                Err(e) => return Err(e),
            }

            if Instant::now() >= deadline {
                return Err(Error::Timeout);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }

        self.qmp.execute(&Command::cont()).await?;
        Ok(())
    }
}
