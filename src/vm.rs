//! The VM service.
//!
//! [`VmService`] is the single owned aggregate behind every external
//! operation: it combines the record store, the process supervisor, the
//! snapshot coordinator and the display relay for the one VM.

use crate::config::{QvmdConfig, RecordState, VmRecord};
use crate::db::{QvmdDb, RecordStore};
use crate::error::{Error, Result};
use crate::qemu::{kvm_available, LaunchSpec, QmpClient};
use crate::relay::DisplayRelay;
use crate::snapshot::{Snapshot, SnapshotCoordinator, SnapshotStore};
use crate::supervisor::{EmulatorLauncher, Launcher, Supervisor};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Result of a snapshot save.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedSnapshot {
    /// Generated snapshot name.
    pub name: String,
    /// Path of the written blob.
    pub path: PathBuf,
}

/// Reset a stale `running` status left behind by a previous daemon.
///
/// No process can be running before the service has started one, so a
/// persisted `running` is rewritten to `stopped`. Returns whether the record
/// was changed.
pub fn reconcile(store: &dyn RecordStore) -> Result<bool> {
    let record = store.get()?;
    if record.status != RecordState::Running {
        return Ok(false);
    }

    store.set_status(RecordState::Stopped)?;
    tracing::info!(previous = %record.status, "reconciled stale vm status to stopped");
    Ok(true)
}

/// A name that can't be valid names no snapshot either.
fn invalid_as_missing(err: Error, name: &str) -> Error {
    match err {
        Error::InvalidSnapshotName(_) => Error::snapshot_not_found(name),
        other => other,
    }
}

/// Single-VM service.
pub struct VmService {
    config: QvmdConfig,
    store: Arc<dyn RecordStore>,
    supervisor: Supervisor,
    snapshots: SnapshotCoordinator,
    relay: DisplayRelay,
    acceleration: bool,
}

impl VmService {
    /// Open the service with the redb record store and the configured emulator.
    pub fn open(config: QvmdConfig) -> Result<Self> {
        let db = QvmdDb::open_at(&config.database_path())?;
        tracing::debug!(path = %db.path().display(), "opened record database");
        let launcher = EmulatorLauncher::new(config.emulator.clone());
        Self::new(config, Arc::new(db), Arc::new(launcher))
    }

    /// Build the service from its collaborators.
    ///
    /// Reconciles the persisted status before returning, so no operation can
    /// observe a stale `running`.
    pub fn new(
        config: QvmdConfig,
        store: Arc<dyn RecordStore>,
        launcher: Arc<dyn Launcher>,
    ) -> Result<Self> {
        reconcile(store.as_ref())?;

        let supervisor =
            Supervisor::new(launcher, store.clone()).with_stop_grace(config.stop_grace);

        let qmp = QmpClient::new(config.qmp_addr()).with_timeout(config.qmp_timeout);
        let snapshots = SnapshotCoordinator::new(SnapshotStore::new(config.snapshot_dir()), qmp)
            .with_settle(config.migrate_settle)
            .with_resume_delay(config.resume_delay)
            .with_resume_policy(config.resume_policy);

        let relay = DisplayRelay::new(config.display_addr()?);
        let acceleration = kvm_available();
        if !acceleration {
            tracing::info!("kvm not available, using software emulation");
        }

        Ok(Self {
            config,
            store,
            supervisor,
            snapshots,
            relay,
            acceleration,
        })
    }

    /// Service configuration.
    pub fn config(&self) -> &QvmdConfig {
        &self.config
    }

    /// Display relay to the VM's VNC endpoint.
    pub fn relay(&self) -> &DisplayRelay {
        &self.relay
    }

    /// Current VM record.
    pub fn status(&self) -> Result<VmRecord> {
        self.store.get()
    }

    /// Whether the emulator process exists.
    pub fn is_running(&self) -> bool {
        self.supervisor.is_running()
    }

    /// PID of the emulator, if running.
    pub fn pid(&self) -> Option<u32> {
        self.supervisor.pid()
    }

    /// Boot the configured image.
    pub fn start(&self) -> Result<u32> {
        let record = self.store.get()?;
        let spec = self.launch_spec(&record)?;
        self.supervisor.start(&spec)
    }

    /// Stop the VM. Succeeds when nothing is running.
    pub async fn stop(&self) -> Result<()> {
        self.supervisor.stop().await
    }

    /// Change memory sizes. Rejected while running.
    pub fn update_settings(&self, ram_mb: Option<u32>, vram_mb: Option<u32>) -> Result<VmRecord> {
        if self.supervisor.is_running() {
            return Err(Error::AlreadyRunning);
        }
        if ram_mb == Some(0) {
            return Err(Error::InvalidSettings("ram_mb must be greater than 0".into()));
        }
        if vram_mb == Some(0) {
            return Err(Error::InvalidSettings("vram_mb must be greater than 0".into()));
        }

        let record = self.store.update(&mut |record| {
            if let Some(ram) = ram_mb {
                record.ram_mb = ram;
            }
            if let Some(vram) = vram_mb {
                record.vram_mb = vram;
            }
        })?;
        tracing::info!(ram_mb = record.ram_mb, vram_mb = record.vram_mb, "vm settings updated");
        Ok(record)
    }

    /// Record the disk image to boot. Rejected while running.
    ///
    /// `filename` is the image's original name and decides the boot path;
    /// without it the stored path's name is used.
    pub fn set_image(&self, path: &Path, filename: Option<String>) -> Result<VmRecord> {
        if self.supervisor.is_running() {
            return Err(Error::AlreadyRunning);
        }
        if !path.is_file() {
            return Err(Error::ImageNotFound {
                path: path.to_path_buf(),
            });
        }

        let record = self.store.update(&mut |record| {
            record.image_path = Some(path.to_path_buf());
            record.image_filename = filename.clone();
            record.status = RecordState::Stopped;
        })?;
        tracing::info!(image = %path.display(), kind = ?record.image_kind(), "vm image set");
        Ok(record)
    }

    /// Save the running VM's state under a generated name.
    pub async fn save_snapshot(&self) -> Result<SavedSnapshot> {
        if !self.supervisor.is_running() {
            return Err(Error::NotRunning);
        }
        let name = self.snapshots.store().generate_name();
        let path = self.snapshots.save(&self.supervisor, &name).await?;
        Ok(SavedSnapshot { name, path })
    }

    /// Snapshots, newest first.
    pub fn list_snapshots(&self) -> Vec<Snapshot> {
        self.snapshots.store().list()
    }

    /// Delete a snapshot.
    pub fn delete_snapshot(&self, name: &str) -> Result<()> {
        self.snapshots
            .store()
            .delete(name)
            .map_err(|e| invalid_as_missing(e, name))
    }

    /// Boot the configured image from a saved snapshot.
    pub async fn start_from_snapshot(&self, name: &str) -> Result<u32> {
        if self.supervisor.is_running() {
            return Err(Error::AlreadyRunning);
        }
        let record = self.store.get()?;
        let spec = self.launch_spec(&record)?;
        self.snapshots
            .start_from_snapshot(&self.supervisor, spec, name)
            .await
            .map_err(|e| invalid_as_missing(e, name))
    }

    fn launch_spec(&self, record: &VmRecord) -> Result<LaunchSpec> {
        let image = record
            .image_path
            .as_ref()
            .ok_or(Error::NoImageConfigured)?;

        Ok(
            LaunchSpec::new(image, record.image_kind(), record.ram_mb, record.vram_mb)
                .with_config(&self.config)
                .with_acceleration(self.acceleration),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use std::process::Stdio;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::process::{Child, Command};

    struct Sleeper;

    impl Launcher for Sleeper {
        fn spawn(&self, _args: &[String]) -> std::io::Result<Child> {
            Command::new("sleep")
                .arg("30")
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .spawn()
        }

        fn program(&self) -> &Path {
            Path::new("sleep")
        }
    }

    fn service(dir: &TempDir, record: VmRecord) -> (VmService, Arc<MemoryStore>) {
        let config = QvmdConfig {
            data_dir: dir.path().to_path_buf(),
            stop_grace: Duration::from_secs(1),
            ..Default::default()
        };
        let store = Arc::new(MemoryStore::new(record));
        let service = VmService::new(config, store.clone(), Arc::new(Sleeper)).unwrap();
        (service, store)
    }

    fn image(dir: &TempDir, name: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, b"\0").unwrap();
        path
    }

    #[test]
    fn test_reconcile_rewrites_running() {
        let store = MemoryStore::new(VmRecord {
            status: RecordState::Running,
            ..Default::default()
        });
        assert!(reconcile(&store).unwrap());
        assert_eq!(store.get().unwrap().status, RecordState::Stopped);
        assert!(!reconcile(&store).unwrap());
    }

    #[test]
    fn test_new_service_reconciles_before_use() {
        let dir = TempDir::new().unwrap();
        let (service, _) = service(
            &dir,
            VmRecord {
                status: RecordState::Running,
                ..Default::default()
            },
        );
        assert_eq!(service.status().unwrap().status, RecordState::Stopped);
        assert!(!service.is_running());
    }

    #[tokio::test]
    async fn test_start_without_image() {
        let dir = TempDir::new().unwrap();
        let (service, _) = service(&dir, VmRecord::default());

        assert!(matches!(service.start(), Err(Error::NoImageConfigured)));
        assert!(!service.is_running());
        assert!(matches!(
            service.start_from_snapshot("snapshot_1").await,
            Err(Error::NoImageConfigured)
        ));
    }

    #[tokio::test]
    async fn test_settings_rejected_while_running() {
        let dir = TempDir::new().unwrap();
        let path = image(&dir, "flex.bin");
        let (service, _) = service(&dir, VmRecord::default());
        service.set_image(&path, None).unwrap();

        service.start().unwrap();
        assert!(matches!(
            service.update_settings(Some(1024), None),
            Err(Error::AlreadyRunning)
        ));
        assert!(matches!(
            service.set_image(&path, None),
            Err(Error::AlreadyRunning)
        ));
        service.stop().await.unwrap();

        let record = service.update_settings(Some(1024), Some(32)).unwrap();
        assert_eq!((record.ram_mb, record.vram_mb), (1024, 32));
    }

    #[test]
    fn test_settings_validation() {
        let dir = TempDir::new().unwrap();
        let (service, store) = service(&dir, VmRecord::default());

        assert!(matches!(
            service.update_settings(Some(0), None),
            Err(Error::InvalidSettings(_))
        ));
        assert!(matches!(
            service.update_settings(None, Some(0)),
            Err(Error::InvalidSettings(_))
        ));

        let record = service.update_settings(None, Some(64)).unwrap();
        assert_eq!(record.ram_mb, crate::config::DEFAULT_RAM_MB);
        assert_eq!(store.get().unwrap().vram_mb, 64);
    }

    #[test]
    fn test_large_vram_boots_with_adapter_default() {
        let dir = TempDir::new().unwrap();
        let path = image(&dir, "flex.bin");
        let (service, _) = service(&dir, VmRecord::default());
        service.set_image(&path, None).unwrap();

        let record = service.update_settings(None, Some(64)).unwrap();
        let args = crate::qemu::build_args(&service.launch_spec(&record).unwrap());
        assert!(!args.iter().any(|a| a.starts_with("cirrus-vga.vgamem_mb")));

        let record = service.update_settings(None, Some(8)).unwrap();
        let args = crate::qemu::build_args(&service.launch_spec(&record).unwrap());
        assert!(args.iter().any(|a| a == "cirrus-vga.vgamem_mb=8"));
    }

    #[test]
    fn test_set_image() {
        let dir = TempDir::new().unwrap();
        let path = image(&dir, "upload_1");
        let (service, _) = service(&dir, VmRecord::default());

        let missing = dir.path().join("absent.iso");
        assert!(matches!(
            service.set_image(&missing, None),
            Err(Error::ImageNotFound { .. })
        ));

        let record = service
            .set_image(&path, Some("win98.iso".to_string()))
            .unwrap();
        assert_eq!(record.image_path.as_deref(), Some(path.as_path()));
        assert_eq!(record.image_kind(), crate::config::ImageKind::Optical);
    }

    #[tokio::test]
    async fn test_save_snapshot_requires_running() {
        let dir = TempDir::new().unwrap();
        let (service, _) = service(&dir, VmRecord::default());

        assert!(matches!(service.save_snapshot().await, Err(Error::NotRunning)));
        assert!(service.list_snapshots().is_empty());
    }

    #[tokio::test]
    async fn test_unusable_snapshot_names_are_not_found() {
        let dir = TempDir::new().unwrap();
        let path = image(&dir, "flex.bin");
        let (service, _) = service(&dir, VmRecord::default());
        service.set_image(&path, None).unwrap();

        for name in ["bad.name", "../qvmd", ""] {
            assert!(matches!(
                service.delete_snapshot(name),
                Err(Error::SnapshotNotFound { .. })
            ));
            assert!(matches!(
                service.start_from_snapshot(name).await,
                Err(Error::SnapshotNotFound { .. })
            ));
        }
        assert!(!service.is_running());
    }

    #[tokio::test]
    async fn test_start_from_snapshot_while_running() {
        let dir = TempDir::new().unwrap();
        let path = image(&dir, "flex.bin");
        let (service, _) = service(&dir, VmRecord::default());
        service.set_image(&path, None).unwrap();

        service.start().unwrap();
        assert!(matches!(
            service.start_from_snapshot("snapshot_1").await,
            Err(Error::AlreadyRunning)
        ));
        service.stop().await.unwrap();
    }
}
