//! Display relay.
//!
//! Each viewer connection gets its own outbound connection to the VM's
//! local VNC endpoint. Bytes are copied unmodified in both directions until
//! either side closes, which tears down the pair.

use crate::error::Result;
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

/// Read buffer for the display-to-viewer direction.
const RELAY_BUF_SIZE: usize = 16 * 1024;

/// Relays viewer connections to the display endpoint.
#[derive(Debug, Clone)]
pub struct DisplayRelay {
    target: SocketAddr,
}

impl DisplayRelay {
    /// Create a relay to `target`.
    pub fn new(target: SocketAddr) -> Self {
        Self { target }
    }

    /// Display endpoint address.
    pub fn target(&self) -> SocketAddr {
        self.target
    }

    /// Relay one raw TCP viewer connection until either side closes.
    pub async fn relay_stream(&self, viewer: TcpStream) -> Result<()> {
        let display = TcpStream::connect(self.target).await?;
        let peer = viewer.peer_addr().ok();
        tracing::debug!(?peer, target = %self.target, "display relay opened");

        pipe(viewer, display).await;

        tracing::debug!(?peer, "display relay closed");
        Ok(())
    }

    /// Accept viewers on `listener` until `shutdown` flips to true.
    ///
    /// Every session runs on its own task; a failing session does not affect
    /// the others.
    pub async fn serve(&self, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        if let Ok(addr) = listener.local_addr() {
            tracing::info!(%addr, target = %self.target, "display relay listening");
        }

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((viewer, _)) => {
                        let relay = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = relay.relay_stream(viewer).await {
                                tracing::warn!(error = %e, "display relay failed");
                            }
                        });
                    }
                    Err(e) => tracing::warn!(error = %e, "failed to accept viewer"),
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("display relay stopped");
    }

    /// Relay one WebSocket viewer.
    ///
    /// Binary and text frames are forwarded as raw bytes; display bytes are
    /// sent back as binary frames.
    pub async fn relay_websocket(&self, socket: WebSocket) -> Result<()> {
        let display = match TcpStream::connect(self.target).await {
            Ok(stream) => stream,
            Err(e) => {
                let mut socket = socket;
                let _ = socket.send(Message::Close(None)).await;
                return Err(e.into());
            }
        };
        tracing::debug!(target = %self.target, "websocket display relay opened");

        let (mut display_read, mut display_write) = display.into_split();
        let (mut sink, mut stream) = socket.split();

        let viewer_to_display = async {
            while let Some(Ok(message)) = stream.next().await {
                let data = match message {
                    Message::Binary(data) => data,
                    Message::Text(text) => text.into_bytes(),
                    Message::Close(_) => break,
                    Message::Ping(_) | Message::Pong(_) => continue,
                };
                if display_write.write_all(&data).await.is_err() {
                    break;
                }
            }
        };

        let display_to_viewer = async {
            let mut buf = vec![0u8; RELAY_BUF_SIZE];
            loop {
                match display_read.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if sink.send(Message::Binary(buf[..n].to_vec())).await.is_err() {
                            break;
                        }
                    }
                }
            }
        };

        tokio::select! {
            _ = viewer_to_display => {}
            _ = display_to_viewer => {}
        }

        let _ = sink.send(Message::Close(None)).await;
        tracing::debug!("websocket display relay closed");
        Ok(())
    }
}

/// Copy bytes both ways until either direction finishes.
async fn pipe<A, B>(a: A, b: B)
where
    A: AsyncRead + AsyncWrite,
    B: AsyncRead + AsyncWrite,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let a_to_b = tokio::io::copy(&mut a_read, &mut b_write);
    let b_to_a = tokio::io::copy(&mut b_read, &mut a_write);

    tokio::select! {
        r = a_to_b => { let _ = r; }
        r = b_to_a => { let _ = r; }
    }
}
