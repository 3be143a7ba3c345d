//! fill-disk
//!
//! Writes one file into the target volume until the requested fill level is
//! reached, either at once with `fallocate` or gradually with `dd`. When the
//! volume already satisfies the target the execution is a noop and stop
//! leaves the filesystem untouched.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::action::params::{self, lenient, Parameter};
use crate::action::*;
use crate::exec::{CommandRunner, HostLauncher, SysCommand};
use crate::stress::{exit_status, SupervisedChild};

const MB: u64 = 1024 * 1024;
const MIN_BLOCK_MB: u64 = 1;
const MAX_BLOCK_MB: u64 = 1024;
const DISK_FULL: &str = "No space left on device";

/// What `size` means
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FillMode {
    /// Fill the volume up to `size` percent
    Percentage,
    /// Write `size` megabytes
    #[serde(rename = "MBToFill")]
    MbToFill,
    /// Leave `size` megabytes free
    #[serde(rename = "MBLeft")]
    MbLeft,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FillMethod {
    #[default]
    AtOnce,
    OverTime,
}

/// Size and free space of a volume, in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeUsage {
    pub total: u64,
    pub available: u64,
}

impl VolumeUsage {
    #[cfg(unix)]
    pub fn of(path: &Path) -> std::io::Result<Self> {
        let stat = nix::sys::statvfs::statvfs(path).map_err(std::io::Error::from)?;
        let fragment = stat.fragment_size() as u64;
        Ok(Self {
            total: stat.blocks() as u64 * fragment,
            available: stat.blocks_available() as u64 * fragment,
        })
    }

    pub fn used(&self) -> u64 {
        self.total.saturating_sub(self.available)
    }

    /// Bytes to write to reach the target; zero when already satisfied
    pub fn bytes_to_fill(&self, mode: FillMode, size: u64) -> u64 {
        match mode {
            FillMode::Percentage => {
                let target = (self.total as u128 * size.min(100) as u128 / 100) as u64;
                target.saturating_sub(self.used())
            }
            FillMode::MbToFill => size.saturating_mul(MB).min(self.available),
            FillMode::MbLeft => self.available.saturating_sub(size.saturating_mul(MB)),
        }
    }
}

/// dd block size in MB, clamped to 1..=1024 and to the fill size
pub fn block_size_mb(requested: u64, fill_bytes: u64) -> u64 {
    let fill_mb = fill_bytes.div_ceil(MB).max(MIN_BLOCK_MB);
    requested.clamp(MIN_BLOCK_MB, MAX_BLOCK_MB).min(fill_mb)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DiskFillConfig {
    #[serde(deserialize_with = "lenient::u64")]
    duration: u64,
    mode: FillMode,
    #[serde(deserialize_with = "lenient::u64")]
    size: u64,
    #[serde(default = "default_path")]
    path: PathBuf,
    #[serde(default)]
    method: FillMethod,
    #[serde(default = "default_block_size", deserialize_with = "lenient::u64")]
    block_size: u64,
}

fn default_path() -> PathBuf {
    PathBuf::from("/tmp")
}

fn default_block_size() -> u64 {
    5
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskFillState {
    pub file: PathBuf,
    pub method: FillMethod,
    pub fill_bytes: u64,
    pub block_size_mb: u64,
    pub noop: bool,
    pub applied: bool,
    #[serde(skip)]
    writer: Option<SupervisedChild>,
}

impl DiskFillState {
    fn command(&self) -> SysCommand {
        let file = self.file.display().to_string();
        match self.method {
            FillMethod::AtOnce => SysCommand::new("fallocate").args([
                "-l".to_string(),
                self.fill_bytes.to_string(),
                file,
            ]),
            FillMethod::OverTime => {
                let count = self.fill_bytes.div_ceil(self.block_size_mb * MB);
                SysCommand::new("dd").args([
                    "if=/dev/zero".to_string(),
                    format!("of={}", file),
                    format!("bs={}M", self.block_size_mb),
                    format!("count={}", count),
                    "oflag=direct".to_string(),
                ])
            }
        }
    }
}

pub struct DiskFillAction {
    runner: Arc<dyn CommandRunner>,
    launcher: HostLauncher,
}

impl DiskFillAction {
    pub fn new(runner: Arc<dyn CommandRunner>, launcher: HostLauncher) -> Self {
        Self { runner, launcher }
    }

    async fn remove_file(&self, file: &Path) -> Result<(), std::io::Error> {
        match tokio::fs::remove_file(self.launcher.host_path(file)).await {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(file = %file.display(), "Fill file already gone");
                Ok(())
            }
            other => other,
        }
    }
}

#[async_trait]
impl Action for DiskFillAction {
    type State = DiskFillState;

    fn describe(&self) -> ActionDescription {
        ActionDescription::attack(
            "fill-disk",
            "Fill Disk",
            "Fills a volume to the requested level",
            "resource",
            TimeControl::External,
        )
        .with_parameters(vec![
            Parameter::duration("duration", "Duration", 30_000),
            Parameter::string("mode", "Mode")
                .default_str("Percentage")
                .option("fill to a percentage of the volume", "Percentage")
                .option("write megabytes", "MBToFill")
                .option("leave megabytes free", "MBLeft")
                .required(),
            Parameter::integer("size", "Fill Value", 80)
                .describe("Percent or megabytes depending on the mode")
                .range(1, i64::MAX),
            Parameter::string("path", "Path")
                .default_str("/tmp")
                .describe("Directory on the volume to fill"),
            Parameter::string("method", "Method")
                .default_str("AtOnce")
                .option("at once (fallocate)", "AtOnce")
                .option("over time (dd)", "OverTime")
                .advanced(),
            Parameter::integer("blockSize", "Block Size (MB)", 5)
                .describe("Block size of dd when filling over time")
                .range(MIN_BLOCK_MB as i64, MAX_BLOCK_MB as i64)
                .advanced(),
        ])
    }

    async fn prepare(&self, request: &PrepareActionRequestBody) -> ActionResult<DiskFillState> {
        let config: DiskFillConfig = params::parse_config(&request.config)?;
        params::duration_at_least_1s(config.duration)?;
        if !config.path.is_absolute() {
            return Err(ActionError::errored(format!(
                "path {:?} must be absolute",
                config.path
            )));
        }
        if config.mode == FillMode::Percentage && config.size > 100 {
            return Err(ActionError::errored(format!(
                "percentage {} must be within 0-100",
                config.size
            )));
        }

        let usage = VolumeUsage::of(&self.launcher.host_path(&config.path)).map_err(|e| {
            ActionError::errored_with(format!("cannot inspect volume of {:?}", config.path), e)
        })?;
        let fill_bytes = usage.bytes_to_fill(config.mode, config.size);
        let noop = fill_bytes == 0;
        if noop {
            info!(path = %config.path.display(), "Volume already at the requested level");
        }

        Ok(DiskFillState {
            file: config.path.join(format!("disk-fill-{}", request.execution_id)),
            method: config.method,
            fill_bytes,
            block_size_mb: block_size_mb(config.block_size, fill_bytes),
            noop,
            applied: false,
            writer: None,
        })
    }

    async fn start(&self, state: &mut DiskFillState) -> ActionResult<StartResult> {
        if state.noop {
            return Ok(StartResult {
                messages: vec![Message::info(
                    "volume already at the requested level, nothing to fill",
                )],
                ..Default::default()
            });
        }

        let command = state.command();
        match state.method {
            FillMethod::AtOnce => {
                if let Err(e) = self.runner.run(&command).await {
                    if let Err(cleanup) = self.remove_file(&state.file).await {
                        warn!(file = %state.file.display(), "Cleanup after failed fill: {}", cleanup);
                    }
                    return Err(ActionError::failed_with("failed to fill disk", e));
                }
            }
            FillMethod::OverTime => {
                let writer = SupervisedChild::spawn(self.runner.as_ref(), &command)
                    .map_err(|e| ActionError::failed_with("failed to start dd", e))?;
                state.writer = Some(writer);
            }
        }
        state.applied = true;
        info!(file = %state.file.display(), bytes = state.fill_bytes, "Disk fill started");
        Ok(StartResult::default())
    }

    async fn status(&self, state: &mut DiskFillState) -> ActionResult<StatusResult> {
        let Some(writer) = state.writer.as_mut() else {
            return Ok(StatusResult::running());
        };
        let exit = writer
            .poll()
            .await
            .map_err(|e| ActionError::failed_with("failed to observe dd", e))?;
        match exit {
            Some(exit) if !exit.success() => {
                let stderr = writer.stderr();
                if stderr.contains(DISK_FULL) {
                    let mut result = StatusResult::running();
                    result.messages.push(Message::warn("volume is full"));
                    state.writer = None;
                    return Ok(result);
                }
                Ok(exit_status("dd", exit, &stderr, &[]))
            }
            _ => Ok(StatusResult::running()),
        }
    }

    async fn stop(&self, state: &mut DiskFillState) -> ActionResult<StopResult> {
        if !state.applied {
            return Ok(StopResult::default());
        }
        if let Some(mut writer) = state.writer.take() {
            writer.kill().await;
        }
        state.applied = false;
        match self.remove_file(&state.file).await {
            Ok(()) => {
                info!(file = %state.file.display(), "Disk fill reverted");
                Ok(StopResult::default())
            }
            Err(e) => Ok(StopResult {
                error: None,
                messages: vec![Message::warn(format!(
                    "failed to remove {}: {}",
                    state.file.display(),
                    e
                ))],
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::RecordingRunner;
    use serde_json::json;
    use uuid::Uuid;

    const GB: u64 = 1024 * MB;

    fn usage() -> VolumeUsage {
        VolumeUsage {
            total: 100 * GB,
            available: 40 * GB,
        }
    }

    fn request(config: serde_json::Value) -> PrepareActionRequestBody {
        serde_json::from_value(json!({
            "executionId": Uuid::new_v4(),
            "target": {"attributes": {}},
            "config": config,
        }))
        .unwrap()
    }

    #[test]
    fn test_bytes_to_fill() {
        assert_eq!(usage().bytes_to_fill(FillMode::Percentage, 80), 20 * GB);
        assert_eq!(usage().bytes_to_fill(FillMode::Percentage, 50), 0);
        assert_eq!(usage().bytes_to_fill(FillMode::MbToFill, 1024), GB);
        assert_eq!(usage().bytes_to_fill(FillMode::MbToFill, 100 * 1024), 40 * GB);
        assert_eq!(usage().bytes_to_fill(FillMode::MbLeft, 1024), 39 * GB);
        assert_eq!(usage().bytes_to_fill(FillMode::MbLeft, 50 * 1024), 0);
    }

    #[test]
    fn test_block_size_clamped() {
        assert_eq!(block_size_mb(0, 10 * GB), 1);
        assert_eq!(block_size_mb(4096, 10 * GB), 1024);
        assert_eq!(block_size_mb(5, 3 * MB), 3);
        assert_eq!(block_size_mb(5, 1), 1);
    }

    #[test]
    fn test_dd_command() {
        let state = DiskFillState {
            file: PathBuf::from("/tmp/disk-fill-1"),
            method: FillMethod::OverTime,
            fill_bytes: 12 * MB,
            block_size_mb: 5,
            noop: false,
            applied: false,
            writer: None,
        };
        assert_eq!(
            state.command().command_line(),
            "dd if=/dev/zero of=/tmp/disk-fill-1 bs=5M count=3 oflag=direct"
        );
    }

    #[tokio::test]
    async fn test_at_once_fill_and_revert() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(RecordingRunner::new());
        let action = DiskFillAction::new(runner.clone(), HostLauncher::direct());
        let mut state = action
            .prepare(&request(json!({
                "duration": 5000, "mode": "MBToFill", "size": 1,
                "path": dir.path().to_str().unwrap()
            })))
            .await
            .unwrap();
        assert!(!state.noop);
        assert_eq!(state.fill_bytes, MB);

        action.start(&mut state).await.unwrap();
        let line = runner.lines()[0].clone();
        assert!(line.starts_with(&format!("fallocate -l {} ", MB)));

        // The recording runner does not create the file; stand in for fallocate
        std::fs::write(&state.file, b"x").unwrap();
        action.stop(&mut state).await.unwrap();
        assert!(!state.file.exists());
    }

    #[tokio::test]
    async fn test_noop_leaves_filesystem_alone() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(RecordingRunner::new());
        let action = DiskFillAction::new(runner.clone(), HostLauncher::direct());
        let mut state = action
            .prepare(&request(json!({
                "duration": 5000, "mode": "Percentage", "size": 0,
                "path": dir.path().to_str().unwrap()
            })))
            .await
            .unwrap();
        assert!(state.noop);

        let result = action.start(&mut state).await.unwrap();
        assert_eq!(result.messages.len(), 1);
        action.stop(&mut state).await.unwrap();
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_mode_rejected() {
        let action = DiskFillAction::new(Arc::new(RecordingRunner::new()), HostLauncher::direct());
        let result = action
            .prepare(&request(json!({"duration": 5000, "mode": "Everything", "size": 1})))
            .await;
        assert!(matches!(result, Err(ActionError::User(_))));
    }
}
