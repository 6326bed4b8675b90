//! Shared fixtures: a stand-in emulator and a scripted QMP server.

#![allow(dead_code)]

use parking_lot::Mutex;
use qvmd::{Launcher, QvmdConfig};
use serde_json::Value;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::process::{Child, Command};

/// Launcher that runs `sleep` in place of the emulator and records the
/// argument vectors it was asked to start with.
pub struct FakeLauncher {
    program: PathBuf,
    program_args: Vec<String>,
    pub launches: Mutex<Vec<Vec<String>>>,
}

impl FakeLauncher {
    pub fn sleeper() -> Arc<Self> {
        Arc::new(Self {
            program: PathBuf::from("sleep"),
            program_args: vec!["30".into()],
            launches: Mutex::new(Vec::new()),
        })
    }

    pub fn short_lived() -> Arc<Self> {
        Arc::new(Self {
            program: PathBuf::from("true"),
            program_args: vec![],
            launches: Mutex::new(Vec::new()),
        })
    }

    pub fn last_args(&self) -> Vec<String> {
        self.launches.lock().last().cloned().unwrap_or_default()
    }
}

impl Launcher for FakeLauncher {
    fn spawn(&self, args: &[String]) -> std::io::Result<Child> {
        self.launches.lock().push(args.to_vec());
        Command::new(&self.program)
            .args(&self.program_args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
    }

    fn program(&self) -> &Path {
        &self.program
    }
}

/// QMP server that behaves like an emulator saving to and loading from
/// `exec:cat` migration targets.
pub struct FakeQmp {
    pub addr: SocketAddr,
    pub commands: Arc<Mutex<Vec<String>>>,
}

impl FakeQmp {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let commands = Arc::new(Mutex::new(Vec::new()));
        let log = commands.clone();

        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let log = log.clone();
                tokio::spawn(async move {
                    let (read, mut write) = socket.into_split();
                    let mut lines = BufReader::new(read).lines();
                    let greeting = "{\"QMP\": {\"version\": {\"qemu\": {\"major\": 8}}, \"capabilities\": []}}\n";
                    let _ = write.write_all(greeting.as_bytes()).await;

                    while let Ok(Some(line)) = lines.next_line().await {
                        let command: Value = match serde_json::from_str(&line) {
                            Ok(v) => v,
                            Err(_) => continue,
                        };
                        let name = command["execute"].as_str().unwrap_or_default().to_string();
                        if name != "qmp_capabilities" {
                            log.lock().push(name.clone());
                        }
                        let response = respond(&name, &command);
                        let _ = write.write_all(format!("{}\n", response).as_bytes()).await;
                    }
                });
            }
        });

        Self { addr, commands }
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().clone()
    }
}

fn respond(name: &str, command: &Value) -> String {
    match name {
        "migrate" => {
            let uri = command["arguments"]["uri"].as_str().unwrap_or_default();
            if let Some(path) = uri.strip_prefix("exec:cat > ") {
                let path = path.trim_matches('\'');
                let _ = std::fs::write(path, b"QEVM\0\0\0\x03fake-machine-state");
            }
            "{\"return\": {}}".to_string()
        }
        "query-migrate" => "{\"return\": {\"status\": \"completed\"}}".to_string(),
        "query-status" => "{\"return\": {\"running\": false, \"status\": \"paused\"}}".to_string(),
        _ => "{\"return\": {}}".to_string(),
    }
}

/// Config pointing at the fake QMP server with short delays.
pub fn test_config(data_dir: &Path, qmp: SocketAddr) -> QvmdConfig {
    QvmdConfig {
        data_dir: data_dir.to_path_buf(),
        qmp_port: qmp.port(),
        qmp_timeout: Duration::from_secs(2),
        migrate_settle: Duration::from_millis(200),
        resume_delay: Duration::from_millis(20),
        stop_grace: Duration::from_secs(1),
        ..Default::default()
    }
}

/// Poll `f` until it holds or five seconds pass.
pub async fn eventually<F: Fn() -> bool>(f: F) -> bool {
    for _ in 0..250 {
        if f() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
