//! HTTP API server command.

use clap::Parser;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use qvmd::{QvmdConfig, Result, VmService};

/// Start the HTTP API server and supervise the VM.
#[derive(Parser, Debug)]
#[command(about = "Start the HTTP API server and supervise the VM")]
#[command(after_long_help = "\
The VM never outlives the server: shutting the server down stops the VM.

API ENDPOINTS:
  GET    /health                       Health check
  GET    /api/vm                       VM status
  POST   /api/vm/image                 Set disk image
  POST   /api/vm/start                 Start VM
  POST   /api/vm/stop                  Stop VM
  PATCH  /api/vm/settings              Change RAM/VRAM
  POST   /api/vm/snapshot/save         Save snapshot
  GET    /api/vm/snapshots             List snapshots
  DELETE /api/vm/snapshot/:name        Delete snapshot
  POST   /api/vm/start-from-snapshot   Start from snapshot
  GET    /websockify                   Display relay (WebSocket)

EXAMPLES:
  qvmd serve                           Listen on 127.0.0.1:8080 (default)
  qvmd serve -l 0.0.0.0:9000           Listen on all interfaces, port 9000
  qvmd serve -d 127.0.0.1:5999         Also relay raw VNC on port 5999")]
pub struct ServeCmd {
    /// Address and port to listen on
    #[arg(
        short,
        long,
        default_value = "127.0.0.1:8080",
        value_name = "ADDR:PORT"
    )]
    listen: String,

    /// Also relay the display over raw TCP on this address
    #[arg(short, long, value_name = "ADDR:PORT")]
    display_listen: Option<String>,
}

impl ServeCmd {
    /// Run the serve command.
    pub fn run(self, config_path: Option<&Path>) -> Result<()> {
        let addr = parse_addr(&self.listen)?;
        let display_addr = self.display_listen.as_deref().map(parse_addr).transpose()?;

        let config = QvmdConfig::load(config_path)?;

        // Create the runtime with signal handling enabled
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(qvmd::Error::Io)?;

        runtime.block_on(async move { run_server(config, addr, display_addr).await })
    }
}

fn parse_addr(s: &str) -> Result<SocketAddr> {
    s.parse()
        .map_err(|e| qvmd::Error::config(format!("invalid listen address '{}': {}", s, e)))
}

async fn run_server(
    config: QvmdConfig,
    addr: SocketAddr,
    display_addr: Option<SocketAddr>,
) -> Result<()> {
    // Security warning if binding to all interfaces
    if addr.ip().is_unspecified() {
        eprintln!(
            "WARNING: Server is listening on all interfaces ({}).",
            addr.ip()
        );
        eprintln!("         The API has no authentication - any network client can control the VM.");
        eprintln!("         Consider using --listen 127.0.0.1:8080 for local-only access.");
    }

    // Reconciles a stale running status before any request is accepted
    let service = Arc::new(VmService::open(config)?);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let relay_handle = match display_addr {
        Some(display_addr) => {
            let listener = tokio::net::TcpListener::bind(display_addr).await?;
            let relay = service.relay().clone();
            Some(tokio::spawn(async move {
                relay.serve(listener, shutdown_rx).await
            }))
        }
        None => None,
    };

    let app = qvmd::api::create_router(service.clone());

    let listener = tokio::net::TcpListener::bind(addr).await?;

    tracing::info!(address = %addr, "starting HTTP API server");
    println!("qvmd API server listening on http://{}", addr);

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    // Stop accepting display viewers
    let _ = shutdown_tx.send(true);
    if let Some(handle) = relay_handle {
        let _ = tokio::time::timeout(std::time::Duration::from_secs(5), handle).await;
    }

    // The VM never outlives the server
    if let Err(e) = service.stop().await {
        tracing::warn!(error = %e, "failed to stop vm on shutdown");
    }

    served.map_err(qvmd::Error::Io)
}

/// Wait for Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received");
    eprintln!("\nShutting down server and stopping the VM...");
}
