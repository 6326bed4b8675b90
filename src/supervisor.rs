//! Emulator process supervision.
//!
//! The [`Supervisor`] owns at most one [`ProcessHandle`]. Each handle has a
//! dedicated watcher task that owns the child process, waits for it to exit
//! (or for a kill request), and reconciles the persisted status when the
//! process dies on its own.

use crate::config::RecordState;
use crate::db::RecordStore;
use crate::error::{Error, Result};
use crate::qemu::{build_args, LaunchSpec};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};

/// Default SIGTERM grace period before SIGKILL.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(5);

/// Extra time `stop()` waits for the watcher beyond the grace period.
const STOP_WAIT_SLACK: Duration = Duration::from_secs(5);

/// Spawns emulator processes.
pub trait Launcher: Send + Sync {
    /// Spawn the emulator with the given arguments.
    fn spawn(&self, args: &[String]) -> std::io::Result<Child>;

    /// Name used in logs and errors.
    fn program(&self) -> &Path;
}

/// Launcher that runs the configured emulator binary.
#[derive(Debug, Clone)]
pub struct EmulatorLauncher {
    program: PathBuf,
}

impl EmulatorLauncher {
    /// Create a launcher for the given executable.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Launcher for EmulatorLauncher {
    fn spawn(&self, args: &[String]) -> std::io::Result<Child> {
        Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
    }

    fn program(&self) -> &Path {
        &self.program
    }
}

/// Exclusive handle to the running emulator.
#[derive(Debug)]
pub struct ProcessHandle {
    pid: u32,
    args: Vec<String>,
    generation: u64,
    kill_tx: Option<oneshot::Sender<()>>,
    exited: watch::Receiver<bool>,
}

impl ProcessHandle {
    /// OS process ID.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Arguments the process was started with.
    pub fn args(&self) -> &[String] {
        &self.args
    }
}

struct SupervisorInner {
    handle: Option<ProcessHandle>,
    next_generation: u64,
}

/// Owner of the emulator process.
pub struct Supervisor {
    launcher: Arc<dyn Launcher>,
    store: Arc<dyn RecordStore>,
    inner: Arc<Mutex<SupervisorInner>>,
    stop_grace: Duration,
}

impl Supervisor {
    /// Create a supervisor with no running process.
    pub fn new(launcher: Arc<dyn Launcher>, store: Arc<dyn RecordStore>) -> Self {
        Self {
            launcher,
            store,
            inner: Arc::new(Mutex::new(SupervisorInner {
                handle: None,
                next_generation: 0,
            })),
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }

    /// Set the SIGTERM grace period used by [`Supervisor::stop`].
    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    /// Start the emulator.
    ///
    /// Must be called from within a Tokio runtime. Fails with
    /// [`Error::AlreadyRunning`] if a handle exists; the existing handle is
    /// left untouched.
    pub fn start(&self, spec: &LaunchSpec) -> Result<u32> {
        let args = build_args(spec);
        let mut inner = self.inner.lock();

        if let Some(existing) = &inner.handle {
            tracing::debug!(pid = existing.pid, "start rejected, emulator already running");
            return Err(Error::AlreadyRunning);
        }

        tracing::info!(
            program = %self.launcher.program().display(),
            image = %spec.image_path.display(),
            kind = ?spec.image_kind,
            ram_mb = spec.ram_mb,
            vram_mb = spec.vram_mb,
            kvm = spec.acceleration,
            restore = spec.incoming.is_some(),
            "starting emulator"
        );

        let mut child = self.launcher.spawn(&args).map_err(|e| {
            Error::spawn_failed(format!("{}: {}", self.launcher.program().display(), e))
        })?;

        let pid = child
            .id()
            .ok_or_else(|| Error::spawn_failed("process exited before it could be tracked"))?;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(stdout, pid, "stdout"));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(stderr, pid, "stderr"));
        }

        let generation = inner.next_generation;
        inner.next_generation += 1;

        let (kill_tx, kill_rx) = oneshot::channel();
        let (exit_tx, exited) = watch::channel(false);

        inner.handle = Some(ProcessHandle {
            pid,
            args,
            generation,
            kill_tx: Some(kill_tx),
            exited,
        });

        // Written under the lock so the watcher's "stopped" cannot land first
        if let Err(e) = self.store.set_status(RecordState::Running) {
            tracing::warn!(error = %e, "failed to persist running status");
        }

        tokio::spawn(watch_process(
            child,
            generation,
            kill_rx,
            exit_tx,
            self.inner.clone(),
            self.store.clone(),
            self.stop_grace,
        ));

        tracing::info!(pid, "emulator started");
        Ok(pid)
    }

    /// Stop the emulator.
    ///
    /// Idempotent: succeeds whether or not a process exists. Sends SIGTERM,
    /// escalates to SIGKILL after the grace period, and waits for the
    /// watcher to observe the exit.
    pub async fn stop(&self) -> Result<()> {
        let handle = self.inner.lock().handle.take();

        if let Some(mut handle) = handle {
            tracing::info!(pid = handle.pid, "stopping emulator");

            if let Some(kill_tx) = handle.kill_tx.take() {
                let _ = kill_tx.send(());
            }

            let wait = handle.exited.wait_for(|exited| *exited);
            match tokio::time::timeout(self.stop_grace + STOP_WAIT_SLACK, wait).await {
                Ok(_) => tracing::info!(pid = handle.pid, "emulator stopped"),
                Err(_) => tracing::warn!(pid = handle.pid, "timed out waiting for emulator exit"),
            }
        }

        if let Err(e) = self.store.set_status(RecordState::Stopped) {
            tracing::warn!(error = %e, "failed to persist stopped status");
        }

        Ok(())
    }

    /// Whether a process handle exists right now.
    pub fn is_running(&self) -> bool {
        self.inner.lock().handle.is_some()
    }

    /// PID of the running emulator.
    pub fn pid(&self) -> Option<u32> {
        self.inner.lock().handle.as_ref().map(|h| h.pid)
    }

    /// Arguments of the running emulator.
    pub fn args(&self) -> Option<Vec<String>> {
        self.inner.lock().handle.as_ref().map(|h| h.args.clone())
    }
}

/// Own the child until it exits, then publish the exit.
async fn watch_process(
    mut child: Child,
    generation: u64,
    mut kill_rx: oneshot::Receiver<()>,
    exit_tx: watch::Sender<bool>,
    inner: Arc<Mutex<SupervisorInner>>,
    store: Arc<dyn RecordStore>,
    grace: Duration,
) {
    let pid = child.id();

    // A dropped sender (supervisor gone) counts as a kill request
    let status = tokio::select! {
        status = child.wait() => status,
        _ = &mut kill_rx => terminate(&mut child, grace).await,
    };

    match &status {
        Ok(status) => log_exit(pid, status),
        Err(e) => tracing::warn!(pid, error = %e, "failed to wait for emulator"),
    }

    let _ = exit_tx.send(true);

    // The status write stays under the lock so a concurrent start() can't be
    // overwritten; the commit blocks, so it runs on the blocking pool
    let cleared =
        tokio::task::spawn_blocking(move || clear_exited(&inner, store.as_ref(), generation));
    match cleared.await {
        Ok(true) => tracing::info!(pid, "emulator exited, status reset to stopped"),
        Ok(false) => {}
        Err(e) => tracing::warn!(pid, error = %e, "exit bookkeeping task failed"),
    }
}

/// Drop the handle of `generation` and persist `stopped`.
///
/// Returns false when stop() already took the handle or a newer process
/// replaced it.
fn clear_exited(
    inner: &Mutex<SupervisorInner>,
    store: &dyn RecordStore,
    generation: u64,
) -> bool {
    let mut inner = inner.lock();
    let current = inner.handle.as_ref().map(|h| h.generation);
    if current != Some(generation) {
        return false;
    }

    inner.handle = None;
    if let Err(e) = store.set_status(RecordState::Stopped) {
        tracing::warn!(error = %e, "failed to persist stopped status after exit");
    }
    true
}

/// SIGTERM, then SIGKILL after `grace`.
async fn terminate(child: &mut Child, grace: Duration) -> std::io::Result<ExitStatus> {
    if let Some(pid) = child.id() {
        // SAFETY: signalling a child we still own and have not reaped
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }

        match tokio::time::timeout(grace, child.wait()).await {
            Ok(status) => return status,
            Err(_) => tracing::warn!(pid, "emulator ignored SIGTERM, sending SIGKILL"),
        }
    }

    child.kill().await?;
    child.wait().await
}

fn log_exit(pid: Option<u32>, status: &ExitStatus) {
    use std::os::unix::process::ExitStatusExt;

    match (status.code(), status.signal()) {
        (Some(code), _) => tracing::info!(pid, code, "emulator exited"),
        (None, Some(signal)) => tracing::info!(pid, signal, "emulator killed by signal"),
        _ => tracing::info!(pid, "emulator exited"),
    }
}

/// Forward emulator output to the log, one line per event.
async fn forward_output<R>(reader: R, pid: u32, stream: &'static str)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                tracing::info!(target: "qvmd::emulator", pid, stream, "{}", line);
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(pid, stream, error = %e, "emulator output closed");
                break;
            }
        }
    }
}
