//! qvmd - single-VM QEMU supervisor
//!
//! qvmd runs one QEMU guest at a time and exposes its control surface and
//! display to a remote client.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │  qvmd CLI / HTTP API                             │
//! ├──────────────────────────────────────────────────┤
//! │  VmService (record store, reconciler)            │
//! ├───────────────┬──────────────────┬───────────────┤
//! │  Supervisor   │  Snapshots       │  DisplayRelay │
//! │  (process)    │  (QMP migrate)   │  (VNC bytes)  │
//! ├───────────────┴──────────────────┴───────────────┤
//! │  qemu-system-x86_64  (QMP :4444, VNC :5900)      │
//! └──────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use qvmd::{QvmdConfig, VmService};
//!
//! # async fn run() -> qvmd::Result<()> {
//! let service = VmService::open(QvmdConfig::load(None)?)?;
//! service.set_image(std::path::Path::new("/srv/images/flex.bin"), None)?;
//! service.start()?;
//!
//! let saved = service.save_snapshot().await?;
//! service.stop().await?;
//! service.start_from_snapshot(&saved.name).await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod qemu;
pub mod relay;
pub mod snapshot;
pub mod supervisor;
pub mod vm;

// Re-export main types for convenience
pub use api::ApiDoc;
pub use config::{ImageKind, QvmdConfig, RecordState, ResumePolicy, VmRecord};
pub use db::{MemoryStore, QvmdDb, RecordStore};
pub use error::{Error, Result};
pub use qemu::{LaunchSpec, QmpClient};
pub use relay::DisplayRelay;
pub use snapshot::{Snapshot, SnapshotCoordinator, SnapshotStore};
pub use supervisor::{EmulatorLauncher, Launcher, Supervisor};
pub use vm::{SavedSnapshot, VmService};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
