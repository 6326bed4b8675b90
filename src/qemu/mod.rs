//! Emulator integration: command-line construction and the QMP client.

pub mod args;
pub mod qmp;

pub use args::{build_args, incoming_uri, kvm_available, outgoing_uri, LaunchSpec};
pub use qmp::{ControlSession, QmpClient};
