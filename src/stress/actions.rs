//! stress-cpu, stress-mem and stress-io

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

use super::{exit_status, probe, IoMode, StressOpts, StressSpec, SupervisedChild, OOM_KILLED};
use crate::action::params::{self, lenient, Parameter};
use crate::action::*;
use crate::exec::CommandRunner;
use crate::sysfs::MemInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StressKind {
    Cpu,
    Memory,
    Io,
}

impl StressKind {
    pub const ALL: [StressKind; 3] = [StressKind::Cpu, StressKind::Memory, StressKind::Io];

    pub fn name(self) -> &'static str {
        match self {
            StressKind::Cpu => "stress-cpu",
            StressKind::Memory => "stress-mem",
            StressKind::Io => "stress-io",
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StressConfig {
    #[serde(deserialize_with = "lenient::u64")]
    duration: u64,
    #[serde(default, deserialize_with = "lenient::u64")]
    workers: u64,
    #[serde(default = "default_cpu_load", deserialize_with = "lenient::u64")]
    cpu_load: u64,
    #[serde(default = "default_memory", deserialize_with = "lenient::u64")]
    percentage: u64,
    #[serde(default = "default_path")]
    path: PathBuf,
    #[serde(default)]
    mode: IoMode,
    #[serde(default = "default_mbytes", deserialize_with = "lenient::u64")]
    mbytes_per_worker: u64,
    #[serde(default)]
    fail_on_oom_kill: bool,
}

fn default_cpu_load() -> u64 {
    100
}

fn default_memory() -> u64 {
    80
}

fn default_path() -> PathBuf {
    PathBuf::from("/tmp")
}

fn default_mbytes() -> u64 {
    1024
}

fn bounded(name: &str, value: u64, min: u64, max: u64) -> ActionResult<u64> {
    if value < min || value > max {
        return Err(ActionError::errored(format!(
            "{} must be within {}-{}, got {}",
            name, min, max, value
        )));
    }
    Ok(value)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StressState {
    pub opts: StressOpts,
    pub fail_on_oom_kill: bool,
    #[serde(skip)]
    child: Option<SupervisedChild>,
}

impl StressState {
    fn ignored_exit_codes(&self) -> Vec<i32> {
        if self.fail_on_oom_kill {
            Vec::new()
        } else {
            vec![OOM_KILLED]
        }
    }
}

pub struct StressAction {
    kind: StressKind,
    runner: Arc<dyn CommandRunner>,
    proc_root: PathBuf,
}

impl StressAction {
    pub fn new(kind: StressKind, runner: Arc<dyn CommandRunner>, proc_root: PathBuf) -> Self {
        Self {
            kind,
            runner,
            proc_root,
        }
    }

    fn spec(&self, config: &StressConfig) -> ActionResult<StressSpec> {
        let workers = u32::try_from(config.workers)
            .map_err(|_| ActionError::errored("workers out of range"))?;
        match self.kind {
            StressKind::Cpu => Ok(StressSpec::Cpu {
                workers,
                load: bounded("cpuLoad", config.cpu_load, 1, 100)? as u8,
            }),
            StressKind::Memory => {
                let percentage = bounded("percentage", config.percentage, 1, 100)?;
                let meminfo = MemInfo::read(&self.proc_root)
                    .map_err(|e| ActionError::errored_with("cannot read memory size", e))?;
                Ok(StressSpec::Memory {
                    vm_bytes_kb: meminfo.total_kb * percentage / 100,
                })
            }
            StressKind::Io => {
                if !config.path.is_absolute() {
                    return Err(ActionError::errored(format!(
                        "path {:?} must be absolute",
                        config.path
                    )));
                }
                Ok(StressSpec::Io {
                    workers,
                    mode: config.mode,
                    path: config.path.clone(),
                    mbytes_per_worker: bounded(
                        "mbytesPerWorker",
                        config.mbytes_per_worker,
                        1,
                        u64::MAX,
                    )?,
                })
            }
        }
    }
}

#[async_trait]
impl Action for StressAction {
    type State = StressState;

    fn describe(&self) -> ActionDescription {
        let duration = Parameter::duration("duration", "Duration", 30_000)
            .describe("How long stress-ng runs");
        let workers = Parameter::integer("workers", "Workers", 0)
            .describe("Number of workers, 0 for one per CPU")
            .range(0, 1024);
        let (label, description, parameters) = match self.kind {
            StressKind::Cpu => (
                "Stress CPU",
                "Generates CPU load for one or more cores",
                vec![
                    Parameter::percentage("cpuLoad", "Host CPU Load", 100)
                        .describe("Load per worker"),
                    workers,
                    duration,
                ],
            ),
            StressKind::Memory => (
                "Stress Memory",
                "Allocates a share of the host memory",
                vec![
                    duration,
                    Parameter::percentage("percentage", "Load on Host Memory", 80)
                        .describe("Share of total memory to allocate"),
                    Parameter::boolean("failOnOomKill", "Fail on OOM Kill", false).advanced(),
                ],
            ),
            StressKind::Io => (
                "Stress IO",
                "Generates read/write and flush load on a filesystem",
                vec![
                    Parameter::string("mode", "Mode")
                        .default_str("read_write_and_flush")
                        .option("read/write and flush", "read_write_and_flush")
                        .option("read/write only", "read_write")
                        .option("flush only", "flush"),
                    workers,
                    Parameter::string("path", "Path")
                        .default_str("/tmp")
                        .describe("Directory the workers write to"),
                    Parameter::integer("mbytesPerWorker", "MBytes to write", 1024)
                        .describe("Bytes each read/write worker writes")
                        .range(1, i64::MAX),
                    duration,
                ],
            ),
        };
        ActionDescription::attack(
            self.kind.name(),
            label,
            description,
            "resource",
            TimeControl::Internal,
        )
        .with_parameters(parameters)
    }

    async fn prepare(&self, request: &PrepareActionRequestBody) -> ActionResult<StressState> {
        let config: StressConfig = params::parse_config(&request.config)?;
        let duration = params::duration_at_least_1s(config.duration)?;
        let spec = self.spec(&config)?;
        probe(self.runner.as_ref()).await?;
        Ok(StressState {
            opts: StressOpts {
                spec,
                timeout_secs: duration.as_secs(),
            },
            fail_on_oom_kill: config.fail_on_oom_kill,
            child: None,
        })
    }

    async fn start(&self, state: &mut StressState) -> ActionResult<StartResult> {
        let child = SupervisedChild::spawn(self.runner.as_ref(), &state.opts.command())
            .map_err(|e| ActionError::failed_with("failed to start stress-ng", e))?;
        info!(action = self.kind.name(), pid = ?child.pid(), "stress-ng started");
        state.child = Some(child);
        Ok(StartResult::default())
    }

    async fn status(&self, state: &mut StressState) -> ActionResult<StatusResult> {
        let ignore = state.ignored_exit_codes();
        let Some(child) = state.child.as_mut() else {
            return Ok(StatusResult::completed());
        };
        for line in child.drain_lines() {
            debug!(action = self.kind.name(), "{}", line);
        }
        let exit = child
            .poll()
            .await
            .map_err(|e| ActionError::failed_with("failed to observe stress-ng", e))?;
        match exit {
            None => Ok(StatusResult::running()),
            Some(exit) => {
                info!(action = self.kind.name(), code = exit.exit_code(), "stress-ng exited");
                Ok(exit_status(child.name(), exit, &child.stderr(), &ignore))
            }
        }
    }

    async fn stop(&self, state: &mut StressState) -> ActionResult<StopResult> {
        if let Some(mut child) = state.child.take() {
            child.kill().await;
            info!(action = self.kind.name(), "stress-ng stopped");
        }
        Ok(StopResult::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::{RecordingRunner, Scripted};
    use serde_json::json;
    use std::time::Duration;
    use uuid::Uuid;

    fn request(config: serde_json::Value) -> PrepareActionRequestBody {
        serde_json::from_value(json!({
            "executionId": Uuid::new_v4(),
            "target": {"attributes": {"host.hostname": ["node-1"]}},
            "config": config,
        }))
        .unwrap()
    }

    fn action(kind: StressKind, proc_root: PathBuf) -> (StressAction, Arc<RecordingRunner>) {
        let runner = Arc::new(RecordingRunner::new());
        runner.stdout("stress-ng -V", "stress-ng, version 0.17.06\n");
        (StressAction::new(kind, runner.clone(), proc_root), runner)
    }

    async fn wait_completed(action: &StressAction, state: &mut StressState) -> StatusResult {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let status = action.status(state).await.unwrap();
                if status.completed {
                    return status;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_cpu_prepare_argv() {
        let (action, _) = action(StressKind::Cpu, PathBuf::from("/proc"));
        let state = action
            .prepare(&request(json!({"duration": 1000, "workers": 1, "cpuLoad": 50})))
            .await
            .unwrap();
        assert_eq!(
            state.opts.argv(),
            vec!["--timeout", "1", "--cpu", "1", "--cpu-load", "50", "-v"]
        );
    }

    #[tokio::test]
    async fn test_short_duration_rejected() {
        let (action, _) = action(StressKind::Cpu, PathBuf::from("/proc"));
        match action.prepare(&request(json!({"duration": 500, "workers": 1}))).await {
            Err(ActionError::User(e)) => {
                assert_eq!(e.title, "duration must be greater / equal than 1s")
            }
            other => panic!("unexpected {:?}", other.map(|s| s.opts)),
        }
    }

    #[tokio::test]
    async fn test_io_flush_prepare() {
        let (action, _) = action(StressKind::Io, PathBuf::from("/proc"));
        let state = action
            .prepare(&request(json!({"duration": 1000, "workers": 1, "path": "/tmp", "mode": "flush"})))
            .await
            .unwrap();
        assert_eq!(
            state.opts.argv(),
            vec!["--timeout", "1", "--io", "1", "--temp-path", "/tmp", "-v"]
        );
    }

    #[tokio::test]
    async fn test_unknown_mode_rejected() {
        let (action, _) = action(StressKind::Io, PathBuf::from("/proc"));
        let result = action
            .prepare(&request(json!({"duration": 1000, "mode": "sideways"})))
            .await;
        assert!(matches!(result, Err(ActionError::User(_))));
    }

    #[tokio::test]
    async fn test_memory_sized_from_meminfo() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("meminfo"),
            "MemTotal:        8000000 kB\nMemFree:  1 kB\nMemAvailable:    4000000 kB\n",
        )
        .unwrap();
        let (action, _) = action(StressKind::Memory, dir.path().to_path_buf());
        let state = action
            .prepare(&request(json!({"duration": 2000, "percentage": 50})))
            .await
            .unwrap();
        assert_eq!(state.opts.spec, StressSpec::Memory { vm_bytes_kb: 4_000_000 });
    }

    #[tokio::test]
    async fn test_missing_stress_ng() {
        let (action, runner) = action(StressKind::Cpu, PathBuf::from("/proc"));
        runner.respond("stress-ng -V", Scripted::Fail { code: 127, stderr: "not found".into() });
        match action.prepare(&request(json!({"duration": 1000}))).await {
            Err(ActionError::User(e)) => assert_eq!(e.title, "stress-ng not installed"),
            other => panic!("unexpected {:?}", other.map(|s| s.opts)),
        }
    }

    #[tokio::test]
    async fn test_status_reports_failure_with_stderr() {
        let (action, runner) = action(StressKind::Cpu, PathBuf::from("/proc"));
        runner.child_script("stress-ng --timeout", "echo 'stress-ng: invalid cpu-load' >&2; exit 1");
        let mut state = action
            .prepare(&request(json!({"duration": 1000})))
            .await
            .unwrap();
        action.start(&mut state).await.unwrap();

        let status = wait_completed(&action, &mut state).await;
        let error = status.error.unwrap();
        assert_eq!(error.status, ErrorStatus::Failed);
        assert!(error.detail.unwrap().contains("invalid cpu-load"));
        action.stop(&mut state).await.unwrap();
    }

    #[tokio::test]
    async fn test_oom_kill_is_warning_unless_requested() {
        let (action, runner) = action(StressKind::Memory, PathBuf::from("/proc"));
        runner.child_script("stress-ng --timeout", "kill -9 $$");
        let mut state = StressState {
            opts: StressOpts {
                spec: StressSpec::Memory { vm_bytes_kb: 1024 },
                timeout_secs: 1,
            },
            fail_on_oom_kill: false,
            child: None,
        };
        action.start(&mut state).await.unwrap();
        let status = wait_completed(&action, &mut state).await;
        assert!(status.error.is_none());
        assert_eq!(status.messages[0].level, MessageLevel::Warn);

        state.fail_on_oom_kill = true;
        action.start(&mut state).await.unwrap();
        let status = wait_completed(&action, &mut state).await;
        assert!(status.error.is_some());
    }

    #[tokio::test]
    async fn test_stop_kills_running_child() {
        let (action, runner) = action(StressKind::Cpu, PathBuf::from("/proc"));
        runner.child_script("stress-ng --timeout", "sleep 30");
        let mut state = action
            .prepare(&request(json!({"duration": 30000})))
            .await
            .unwrap();
        action.start(&mut state).await.unwrap();
        assert!(!action.status(&mut state).await.unwrap().completed);

        action.stop(&mut state).await.unwrap();
        assert!(state.child.is_none());
        assert!(action.status(&mut state).await.unwrap().completed);
    }
}
