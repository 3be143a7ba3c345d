//! Host namespace launcher
//!
//! When the agent runs in a container without the host PID namespace, tools
//! are started through `nsenter` targeting PID 1 so they see the host's
//! process tree, mounts and network stack.

use std::path::{Path, PathBuf};
use tokio::process::Command as TokioCommand;
use tracing::info;

use super::command::{apply_discipline, SysCommand};

/// Arguments placed before the wrapped program
pub const NSENTER_ARGS: &[&str] = &[
    "--target", "1", "--pid", "--mount", "--uts", "--ipc", "--net", "--",
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostLauncher {
    enter_host: bool,
}

impl HostLauncher {
    /// Decide from `/proc` whether commands must enter the host namespaces
    pub fn detect() -> Self {
        let launcher = Self::detect_in(Path::new("/proc"));
        info!(
            enter_host = launcher.enter_host,
            "Host namespace launcher configured"
        );
        launcher
    }

    /// Compare the PID namespace of this process with the one of PID 1
    pub fn detect_in(proc_root: &Path) -> Self {
        let own = std::fs::read_link(proc_root.join("self/ns/pid"));
        let init = std::fs::read_link(proc_root.join("1/ns/pid"));
        let enter_host = match (own, init) {
            (Ok(own), Ok(init)) => own != init,
            _ => false,
        };
        Self { enter_host }
    }

    /// Launcher that runs everything as-is
    pub fn direct() -> Self {
        Self { enter_host: false }
    }

    /// Launcher that always wraps with `nsenter`
    pub fn entering_host() -> Self {
        Self { enter_host: true }
    }

    pub fn enters_host(&self) -> bool {
        self.enter_host
    }

    /// Where a host filesystem path is visible from the agent
    pub fn host_path(&self, path: &Path) -> PathBuf {
        if self.enter_host {
            let relative = path.strip_prefix("/").unwrap_or(path);
            Path::new("/proc/1/root").join(relative)
        } else {
            path.to_path_buf()
        }
    }

    /// Final program and argv for a command
    pub fn argv(&self, command: &SysCommand) -> (String, Vec<String>) {
        if self.enter_host && command.host_namespace {
            let mut args: Vec<String> = NSENTER_ARGS.iter().map(|s| s.to_string()).collect();
            args.push(command.program.clone());
            args.extend(command.args.iter().cloned());
            ("nsenter".to_string(), args)
        } else {
            (command.program.clone(), command.args.clone())
        }
    }

    /// Build the tokio command with env and credential discipline applied
    pub fn command(&self, command: &SysCommand) -> TokioCommand {
        let (program, args) = self.argv(command);
        let mut process = TokioCommand::new(program);
        process.args(args);
        apply_discipline(&mut process, command);
        process
    }
}
