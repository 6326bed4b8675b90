//! Wire types for the QEMU Machine Protocol (QMP).
//!
//! This crate defines the control-protocol messages exchanged between qvmd
//! and the emulator's QMP listener. It performs no I/O.
//!
//! # Protocol Overview
//!
//! QMP is newline-delimited JSON over a stream socket. Every message is a
//! single JSON object terminated by `\n`.
//!
//! ```text
//! server: {"QMP": {"version": {...}, "capabilities": [...]}}
//! client: {"execute": "qmp_capabilities"}
//! server: {"return": {}}
//! client: {"execute": "cont"}
//! server: {"return": {}}
//! ```
//!
//! The server may interleave asynchronous `{"event": ...}` objects at any
//! point. Failures are reported as `{"error": {"class": ..., "desc": ...}}`.

#![deny(missing_docs)]

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Maximum length of a single buffered line (16 MB).
pub const MAX_LINE_SIZE: usize = 16 * 1024 * 1024;

/// Well-known local ports used by the emulator.
pub mod ports {
    /// QMP control listener.
    pub const QMP: u16 = 4444;
    /// Base port of the VNC display listener (display `:0`).
    pub const VNC_BASE: u16 = 5900;

    /// TCP port of a VNC display number, if it fits in a port.
    pub fn vnc(display: u16) -> Option<u16> {
        VNC_BASE.checked_add(display)
    }
}

/// Command names issued by qvmd.
pub mod commands {
    /// Capabilities negotiation, required before any other command.
    pub const CAPABILITIES: &str = "qmp_capabilities";
    /// Start an outgoing migration.
    pub const MIGRATE: &str = "migrate";
    /// Query the state of the current migration.
    pub const QUERY_MIGRATE: &str = "query-migrate";
    /// Query the run state of the guest.
    pub const QUERY_STATUS: &str = "query-status";
    /// Resume guest execution.
    pub const CONT: &str = "cont";
}

// ============================================================================
// Outgoing Commands
// ============================================================================

/// A command object sent to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Command name.
    pub execute: String,
    /// Command arguments (omitted when empty).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
}

impl Command {
    /// Create a command with no arguments.
    pub fn new(execute: impl Into<String>) -> Self {
        Self {
            execute: execute.into(),
            arguments: None,
        }
    }

    /// Attach arguments to the command.
    pub fn with_arguments(mut self, arguments: Value) -> Self {
        self.arguments = Some(arguments);
        self
    }

    /// `qmp_capabilities`.
    pub fn capabilities() -> Self {
        Self::new(commands::CAPABILITIES)
    }

    /// `migrate` to the given URI.
    pub fn migrate(uri: impl Into<String>) -> Self {
        Self::new(commands::MIGRATE).with_arguments(serde_json::json!({ "uri": uri.into() }))
    }

    /// `query-migrate`.
    pub fn query_migrate() -> Self {
        Self::new(commands::QUERY_MIGRATE)
    }

    /// `query-status`.
    pub fn query_status() -> Self {
        Self::new(commands::QUERY_STATUS)
    }

    /// `cont`.
    pub fn cont() -> Self {
        Self::new(commands::CONT)
    }
}

/// Encode a command to wire format (JSON followed by `\n`).
pub fn encode_command(command: &Command) -> Result<Vec<u8>, serde_json::Error> {
    let mut buf = serde_json::to_vec(command)?;
    buf.push(b'\n');
    Ok(buf)
}

// ============================================================================
// Incoming Messages
// ============================================================================

/// Error object reported by the server.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Error class (e.g., `GenericError`, `CommandNotFound`).
    #[serde(default)]
    pub class: String,
    /// Human-readable description.
    #[serde(default)]
    pub desc: String,
}

impl ErrorInfo {
    /// Description suitable for surfacing to callers.
    pub fn description(&self) -> &str {
        if self.desc.is_empty() {
            "QMP error"
        } else {
            &self.desc
        }
    }
}

/// A classified message received from the server.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Greeting sent once on connect (`{"QMP": ...}`).
    Greeting(Value),
    /// Successful response (`{"return": ...}`).
    Return(Value),
    /// Failed response (`{"error": ...}`).
    Error(ErrorInfo),
    /// Asynchronous event or any other object.
    Event(Value),
}

impl Message {
    /// Parse one line into a message.
    ///
    /// Returns `None` for blank lines, non-JSON text, and JSON values that
    /// are not objects.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        let value: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                tracing::trace!(error = %e, "ignoring malformed QMP line");
                return None;
            }
        };

        let mut object = match value {
            Value::Object(map) => map,
            _ => return None,
        };

        if let Some(error) = object.remove("error") {
            let info = match error {
                Value::Object(_) => serde_json::from_value(error).unwrap_or_default(),
                Value::String(desc) => ErrorInfo {
                    class: String::new(),
                    desc,
                },
                other => ErrorInfo {
                    class: String::new(),
                    desc: other.to_string(),
                },
            };
            return Some(Message::Error(info));
        }
        if let Some(greeting) = object.remove("QMP") {
            return Some(Message::Greeting(greeting));
        }
        if let Some(ret) = object.remove("return") {
            return Some(Message::Return(ret));
        }
        Some(Message::Event(Value::Object(object)))
    }
}

/// Payload of a `query-migrate` response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationInfo {
    /// Migration status (`active`, `completed`, `failed`, ...). Absent when
    /// no migration has been started.
    #[serde(default)]
    pub status: Option<String>,
}

impl MigrationInfo {
    /// Migration finished successfully.
    pub fn is_completed(&self) -> bool {
        self.status.as_deref() == Some("completed")
    }

    /// Migration ended without producing a complete stream.
    pub fn is_failed(&self) -> bool {
        matches!(self.status.as_deref(), Some("failed") | Some("cancelled"))
    }
}

/// Payload of a `query-status` response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusInfo {
    /// Whether guest vCPUs are running.
    #[serde(default)]
    pub running: bool,
    /// Run state (`running`, `paused`, `inmigrate`, ...).
    #[serde(default)]
    pub status: String,
}

impl StatusInfo {
    /// The emulator is still loading an inbound migration stream.
    pub fn is_loading(&self) -> bool {
        self.status == "inmigrate"
    }
}

// ============================================================================
// Line Framing
// ============================================================================

/// Accumulates raw bytes and yields complete `\n`-terminated lines.
///
/// The trailing incomplete fragment is retained until a later push
/// completes it.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes and drain every complete line.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<String>, FrameError> {
        self.buf.extend_from_slice(data);

        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }

        if self.buf.len() > MAX_LINE_SIZE {
            let len = self.buf.len();
            self.buf.clear();
            return Err(FrameError::TooLarge(len));
        }

        Ok(lines)
    }

    /// Number of buffered bytes not yet terminated by `\n`.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

/// Error framing incoming bytes.
#[derive(Debug)]
pub enum FrameError {
    /// Unterminated line exceeds [`MAX_LINE_SIZE`].
    TooLarge(usize),
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::TooLarge(size) => write!(f, "line too large: {} bytes", size),
        }
    }
}

impl std::error::Error for FrameError {}
