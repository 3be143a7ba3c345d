//! fill-mem
//!
//! Re-executes the agent binary as the `memfill` allocator so the memory is
//! charged to a separate process the OOM killer can pick without taking the
//! agent down.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use super::allocator::{MemFillMode, MemUnit};
use crate::action::params::{self, lenient, Parameter};
use crate::action::*;
use crate::exec::{CommandRunner, SysCommand};
use crate::stress::{exit_status, SupervisedChild, OOM_KILLED};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MemFillConfig {
    #[serde(deserialize_with = "lenient::u64")]
    duration: u64,
    mode: MemFillMode,
    unit: MemUnit,
    #[serde(deserialize_with = "lenient::u64")]
    size: u64,
    #[serde(default)]
    fail_on_oom_kill: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemFillState {
    pub mode: MemFillMode,
    pub unit: MemUnit,
    pub size: u64,
    pub duration_secs: u64,
    pub fail_on_oom_kill: bool,
    #[serde(skip)]
    child: Option<SupervisedChild>,
}

impl MemFillState {
    fn command(&self, agent: &str) -> SysCommand {
        SysCommand::new(agent)
            .args([
                "memfill".to_string(),
                "--mode".to_string(),
                self.mode.as_str().to_string(),
                "--unit".to_string(),
                self.unit.as_str().to_string(),
                "--size".to_string(),
                self.size.to_string(),
                "--duration".to_string(),
                self.duration_secs.to_string(),
            ])
            .local()
    }
}

pub struct MemFillAction {
    runner: Arc<dyn CommandRunner>,
    agent_binary: PathBuf,
}

impl MemFillAction {
    /// `agent_binary` is the executable providing the `memfill` subcommand
    pub fn new(runner: Arc<dyn CommandRunner>, agent_binary: PathBuf) -> Self {
        Self {
            runner,
            agent_binary,
        }
    }
}

#[async_trait]
impl Action for MemFillAction {
    type State = MemFillState;

    fn describe(&self) -> ActionDescription {
        ActionDescription::attack(
            "fill-mem",
            "Fill Memory",
            "Allocates memory until the requested usage is reached",
            "resource",
            TimeControl::External,
        )
        .with_parameters(vec![
            Parameter::duration("duration", "Duration", 30_000),
            Parameter::string("mode", "Mode")
                .default_str("usage")
                .option("keep host usage at the target", "usage")
                .option("allocate a fixed amount", "absolute")
                .required(),
            Parameter::integer("size", "Size", 80)
                .describe("Megabytes or percent of total memory")
                .range(1, i64::MAX)
                .required(),
            Parameter::string("unit", "Unit")
                .default_str("percent")
                .option("%", "percent")
                .option("MB", "megabyte")
                .required(),
            Parameter::boolean("failOnOomKill", "Fail on OOM Kill", false).advanced(),
        ])
    }

    async fn prepare(&self, request: &PrepareActionRequestBody) -> ActionResult<MemFillState> {
        let config: MemFillConfig = params::parse_config(&request.config)?;
        let duration = params::duration_at_least_1s(config.duration)?;
        if config.size == 0 {
            return Err(ActionError::errored("size must be greater than 0"));
        }
        if config.unit == MemUnit::Percent && config.size > 100 {
            return Err(ActionError::errored(format!(
                "percentage {} must be within 0-100",
                config.size
            )));
        }
        Ok(MemFillState {
            mode: config.mode,
            unit: config.unit,
            size: config.size,
            duration_secs: duration.as_secs(),
            fail_on_oom_kill: config.fail_on_oom_kill,
            child: None,
        })
    }

    async fn start(&self, state: &mut MemFillState) -> ActionResult<StartResult> {
        let command = state.command(&self.agent_binary.display().to_string());
        let child = SupervisedChild::spawn(self.runner.as_ref(), &command)
            .map_err(|e| ActionError::failed_with("failed to start memory allocator", e))?;
        info!(pid = ?child.pid(), mode = state.mode.as_str(), "Memory fill started");
        state.child = Some(child);
        Ok(StartResult::default())
    }

    async fn status(&self, state: &mut MemFillState) -> ActionResult<StatusResult> {
        let ignore = if state.fail_on_oom_kill {
            Vec::new()
        } else {
            vec![OOM_KILLED]
        };
        let Some(child) = state.child.as_mut() else {
            return Ok(StatusResult::running());
        };
        let exit = child
            .poll()
            .await
            .map_err(|e| ActionError::failed_with("failed to observe memory allocator", e))?;
        match exit {
            None => Ok(StatusResult::running()),
            Some(exit) => {
                info!(code = exit.exit_code(), "Memory allocator exited");
                Ok(exit_status("memory allocator", exit, &child.stderr(), &ignore))
            }
        }
    }

    async fn stop(&self, state: &mut MemFillState) -> ActionResult<StopResult> {
        if let Some(mut child) = state.child.take() {
            child.kill().await;
            info!("Memory fill stopped");
        }
        Ok(StopResult::default())
    }
}
