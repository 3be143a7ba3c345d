//! shutdown
//!
//! Reboots or powers off the host. The strategy is chosen at prepare and the
//! trigger runs detached after a short delay so the start reply reaches the
//! orchestrator before the host goes down.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::action::params::{self, Parameter};
use crate::action::*;
use crate::exec::{CommandRunner, HostLauncher, SysCommand};
use crate::sysfs::{SysRq, SysRqKey};

/// Directories searched for the `shutdown` binary
pub const SHUTDOWN_SEARCH_PATH: &[&str] = &["/usr/sbin", "/sbin", "/usr/bin", "/bin"];

const TRIGGER_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShutdownStrategy {
    /// `shutdown -r now` / `shutdown -h now`
    Command,
    /// `reboot(2)`
    Syscall,
    /// `/proc/sysrq-trigger`
    SysRq,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ShutdownConfig {
    #[serde(default = "default_reboot")]
    reboot: bool,
}

fn default_reboot() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShutdownState {
    pub reboot: bool,
    pub strategy: ShutdownStrategy,
}

pub struct ShutdownAction {
    runner: Arc<dyn CommandRunner>,
    launcher: HostLauncher,
    proc_root: PathBuf,
    search_path: Vec<PathBuf>,
    allow_syscall: bool,
    delay: Duration,
}

impl ShutdownAction {
    pub fn new(runner: Arc<dyn CommandRunner>, launcher: HostLauncher, proc_root: PathBuf) -> Self {
        Self {
            runner,
            launcher,
            proc_root,
            search_path: SHUTDOWN_SEARCH_PATH.iter().map(PathBuf::from).collect(),
            allow_syscall: true,
            delay: TRIGGER_DELAY,
        }
    }

    pub fn with_search_path(mut self, search_path: Vec<PathBuf>) -> Self {
        self.search_path = search_path;
        self
    }

    /// Never pick `reboot(2)`, even when it would be usable
    pub fn without_syscall(mut self) -> Self {
        self.allow_syscall = false;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn shutdown_binary(&self) -> Option<PathBuf> {
        self.search_path
            .iter()
            .map(|dir| self.launcher.host_path(&dir.join("shutdown")))
            .find(|path| is_executable(path))
    }

    /// Schedule and immediately cancel a shutdown to prove the command works
    async fn probe_command(&self) -> bool {
        let schedule = SysCommand::new("shutdown").args(["-k", "--no-wall", "now"]);
        if let Err(e) = self.runner.run(&schedule).await {
            debug!("shutdown command probe failed: {}", e);
            return false;
        }
        if let Err(e) = self.runner.run(&SysCommand::new("shutdown").arg("-c")).await {
            warn!("Cancelling the probe shutdown failed: {}", e);
        }
        true
    }

    fn syscall_usable(&self) -> bool {
        self.allow_syscall && nix::unistd::geteuid().is_root() && !self.launcher.enters_host()
    }

    async fn detect(&self) -> Option<ShutdownStrategy> {
        if self.shutdown_binary().is_some() && self.probe_command().await {
            return Some(ShutdownStrategy::Command);
        }
        if self.syscall_usable() {
            return Some(ShutdownStrategy::Syscall);
        }
        if SysRq::new(&self.proc_root).available() {
            return Some(ShutdownStrategy::SysRq);
        }
        None
    }
}

fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

async fn trigger(
    strategy: ShutdownStrategy,
    reboot: bool,
    runner: Arc<dyn CommandRunner>,
    proc_root: PathBuf,
) -> anyhow::Result<()> {
    match strategy {
        ShutdownStrategy::Command => {
            let flag = if reboot { "-r" } else { "-h" };
            runner
                .run(&SysCommand::new("shutdown").args([flag, "now"]))
                .await?;
        }
        ShutdownStrategy::Syscall => reboot_syscall(reboot)?,
        ShutdownStrategy::SysRq => {
            let sysrq = SysRq::new(&proc_root);
            sysrq.enable()?;
            sysrq.trigger(SysRqKey::Sync)?;
            sysrq.trigger(if reboot {
                SysRqKey::Reboot
            } else {
                SysRqKey::PowerOff
            })?;
        }
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn reboot_syscall(reboot: bool) -> anyhow::Result<()> {
    use nix::sys::reboot::{reboot as sys_reboot, RebootMode};
    nix::unistd::sync();
    let mode = if reboot {
        RebootMode::RB_AUTOBOOT
    } else {
        RebootMode::RB_POWER_OFF
    };
    sys_reboot(mode)?;
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn reboot_syscall(_reboot: bool) -> anyhow::Result<()> {
    anyhow::bail!("reboot(2) is only supported on Linux")
}

#[async_trait]
impl Action for ShutdownAction {
    type State = ShutdownState;

    fn describe(&self) -> ActionDescription {
        ActionDescription::attack(
            "shutdown",
            "Shutdown Host",
            "Reboots or powers off the host",
            "state",
            TimeControl::Instantaneous,
        )
        .with_parameters(vec![Parameter::boolean("reboot", "Reboot", true)
            .describe("Reboot instead of powering off")])
    }

    async fn prepare(&self, request: &PrepareActionRequestBody) -> ActionResult<ShutdownState> {
        let config: ShutdownConfig = params::parse_config(&request.config)?;
        let strategy = self.detect().await.ok_or_else(|| {
            UserError::errored("no way to shut down this host")
                .with_detail("no usable shutdown command, reboot(2) or sysrq-trigger")
        })?;
        debug!(?strategy, reboot = config.reboot, "Shutdown strategy selected");
        Ok(ShutdownState {
            reboot: config.reboot,
            strategy,
        })
    }

    async fn start(&self, state: &mut ShutdownState) -> ActionResult<StartResult> {
        let (strategy, reboot, delay) = (state.strategy, state.reboot, self.delay);
        let runner = self.runner.clone();
        let proc_root = self.proc_root.clone();
        info!(?strategy, reboot, "Host shutdown scheduled");
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = trigger(strategy, reboot, runner, proc_root).await {
                error!(?strategy, "Host shutdown failed: {:#}", e);
            }
        });
        Ok(StartResult::default())
    }

    async fn stop(&self, _state: &mut ShutdownState) -> ActionResult<StopResult> {
        Ok(StopResult::default())
    }
}
