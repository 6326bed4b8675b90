//! QMP control-session client.
//!
//! Every call opens a fresh connection, waits for the greeting, negotiates
//! capabilities, sends exactly one command and resolves with its `return`
//! payload. Sessions are never pooled.

use crate::error::{Error, Result};
use qvmd_protocol::{encode_command, Command, LineBuffer, Message};
use serde_json::Value;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

/// Default idle timeout from connect to final response.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Read buffer size for a control session.
const READ_BUF_SIZE: usize = 8192;

/// Client for the emulator's QMP listener.
#[derive(Debug, Clone)]
pub struct QmpClient {
    addr: SocketAddr,
    timeout: Duration,
}

impl QmpClient {
    /// Create a client for the given QMP address.
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Set the per-session timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// QMP address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Per-session timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Execute one command in a fresh session.
    ///
    /// On timeout the connection is dropped, which closes the socket.
    pub async fn execute(&self, command: &Command) -> Result<Value> {
        let session = async {
            let stream = TcpStream::connect(self.addr).await?;
            tracing::debug!(addr = %self.addr, command = %command.execute, "qmp session opened");
            ControlSession::new(stream).call(command).await
        };

        match tokio::time::timeout(self.timeout, session).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(addr = %self.addr, command = %command.execute, "qmp session timed out");
                Err(Error::Timeout)
            }
        }
    }
}

/// Where a session is in the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Waiting for the `{"QMP": ...}` greeting.
    Greeting,
    /// `qmp_capabilities` sent, waiting for its `return`.
    Negotiating,
    /// Caller's command sent, waiting for its `return`.
    Pending,
}

/// One request/response exchange over a connected stream.
pub struct ControlSession<S> {
    stream: S,
    lines: LineBuffer,
    phase: Phase,
}

impl<S> ControlSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap a connected stream.
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            lines: LineBuffer::new(),
            phase: Phase::Greeting,
        }
    }

    /// Drive the handshake, send `command`, and return its payload.
    ///
    /// The stream is shut down when this returns, whatever the outcome.
    pub async fn call(mut self, command: &Command) -> Result<Value> {
        let result = self.run(command).await;
        let _ = self.stream.shutdown().await;
        result
    }

    async fn run(&mut self, command: &Command) -> Result<Value> {
        let mut buf = vec![0u8; READ_BUF_SIZE];

        loop {
            let n = self.stream.read(&mut buf).await?;
            if n == 0 {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "qmp connection closed before response",
                )));
            }

            let lines = self
                .lines
                .push(&buf[..n])
                .map_err(|e| Error::protocol(e.to_string()))?;

            for line in lines {
                let Some(message) = Message::parse(&line) else {
                    continue;
                };

                match (self.phase, message) {
                    (_, Message::Error(info)) => {
                        return Err(Error::protocol(info.description()));
                    }
                    (Phase::Greeting, Message::Greeting(_)) => {
                        self.send(&Command::capabilities()).await?;
                        self.phase = Phase::Negotiating;
                    }
                    (Phase::Negotiating, Message::Return(_)) => {
                        self.send(command).await?;
                        self.phase = Phase::Pending;
                    }
                    (Phase::Pending, Message::Return(payload)) => {
                        tracing::debug!(command = %command.execute, "qmp command completed");
                        return Ok(payload);
                    }
                    (phase, other) => {
                        tracing::trace!(?phase, message = ?other, "ignoring qmp message");
                    }
                }
            }
        }
    }

    async fn send(&mut self, command: &Command) -> Result<()> {
        let data = encode_command(command).map_err(|e| Error::protocol(e.to_string()))?;
        self.stream.write_all(&data).await?;
        self.stream.flush().await?;
        Ok(())
    }
}
