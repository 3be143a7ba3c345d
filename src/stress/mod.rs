//! Resource stress via stress-ng
//!
//! Builds the stress-ng argv for CPU, memory and IO load and supervises the
//! child in the host PID namespace. The duration is enforced by stress-ng's
//! own `--timeout`; the agent only watches for the exit.

pub mod actions;
pub mod supervisor;

pub use actions::{StressAction, StressKind};
pub use supervisor::{exit_status, ChildExit, SupervisedChild, OOM_KILLED};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::action::{ActionError, ActionResult};
use crate::exec::{CommandRunner, SysCommand, PROBE_TIMEOUT};

pub const STRESS_NG: &str = "stress-ng";

/// What the IO stressor exercises
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IoMode {
    #[default]
    ReadWriteAndFlush,
    ReadWrite,
    Flush,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum StressSpec {
    Cpu {
        workers: u32,
        load: u8,
    },
    Memory {
        vm_bytes_kb: u64,
    },
    Io {
        workers: u32,
        mode: IoMode,
        path: PathBuf,
        mbytes_per_worker: u64,
    },
}

/// A fully validated stress-ng invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StressOpts {
    pub spec: StressSpec,
    pub timeout_secs: u64,
}

impl StressOpts {
    pub fn argv(&self) -> Vec<String> {
        let mut argv = vec!["--timeout".to_string(), self.timeout_secs.to_string()];
        match &self.spec {
            StressSpec::Cpu { workers, load } => {
                argv.extend([
                    "--cpu".to_string(),
                    workers.to_string(),
                    "--cpu-load".to_string(),
                    load.to_string(),
                ]);
            }
            StressSpec::Memory { vm_bytes_kb } => {
                argv.extend([
                    "--vm".to_string(),
                    "1".to_string(),
                    "--vm-bytes".to_string(),
                    format!("{}k", vm_bytes_kb),
                    "--vm-hang".to_string(),
                    "0".to_string(),
                ]);
            }
            StressSpec::Io {
                workers,
                mode,
                path,
                mbytes_per_worker,
            } => {
                if matches!(mode, IoMode::ReadWriteAndFlush | IoMode::ReadWrite) {
                    argv.extend([
                        "--hdd".to_string(),
                        workers.to_string(),
                        "--hdd-bytes".to_string(),
                        format!("{}m", mbytes_per_worker),
                    ]);
                }
                if matches!(mode, IoMode::ReadWriteAndFlush | IoMode::Flush) {
                    argv.extend(["--io".to_string(), workers.to_string()]);
                }
                argv.extend([
                    "--temp-path".to_string(),
                    path.display().to_string(),
                ]);
            }
        }
        argv.push("-v".to_string());
        argv
    }

    pub fn command(&self) -> SysCommand {
        SysCommand::new(STRESS_NG).args(self.argv())
    }
}

/// Fail prepare unless `stress-ng -V` answers within the probe budget
pub async fn probe(runner: &dyn CommandRunner) -> ActionResult<()> {
    let command = SysCommand::new(STRESS_NG).arg("-V").timeout(PROBE_TIMEOUT);
    runner
        .run(&command)
        .await
        .map(|_| ())
        .map_err(|e| ActionError::errored_with("stress-ng not installed", e))
}
