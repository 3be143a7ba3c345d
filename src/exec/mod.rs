//! Host Tool Execution
//!
//! All external binaries (`tc`, `ip`, `iptables`, `nft`, `dig`, `stress-ng`,
//! `shutdown`, ...) go through one typed wrapper.
//!
//! # Guarantees
//!
//! - **Allow-list**: only the known host tools can be spawned
//! - **List invocation**: argv is passed as a list, never through a shell
//! - **Deadlines**: every run has a timeout, children are killed on expiry
//! - **Clean env**: the child sees a fixed `PATH` and `LC_ALL=C`
//!
//! # Layout
//!
//! - `command.rs`: [`SysCommand`], [`CommandRunner`] and the real [`HostRunner`]
//! - `launcher.rs`: host-namespace entry via `nsenter`
//! - `timeout.rs`: named deadline ceilings
//! - `validator.rs`: allow-list checks
//! - `recording.rs`: scripted runner for tests

mod command;
mod launcher;
mod recording;
mod timeout;
mod validator;

pub use command::{CommandError, CommandOutput, CommandRunner, HostRunner, SysCommand, HOST_PATH};
pub use launcher::HostLauncher;
pub use recording::{RecordingRunner, Scripted};
pub use timeout::{
    Elapsed, ExecutionTimeout, DIG_TIMEOUT, DISCOVERY_TIMEOUT, PROBE_TIMEOUT, TOOL_TIMEOUT,
};
pub use validator::{CommandValidationError, CommandValidator, DEFAULT_TOOLS};
