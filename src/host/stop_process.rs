//! stop-process
//!
//! Repeatedly signals every process matching a filter until the duration
//! ends. A numeric filter is a PID; anything else matches process names by
//! substring. The agent never signals itself.

use async_trait::async_trait;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{ProcessesToUpdate, System};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::action::params::{self, lenient, Parameter};
use crate::action::*;

/// Target selection for the stopper
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessFilter {
    Pid(u32),
    Name(String),
}

impl ProcessFilter {
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        match raw.parse::<u32>() {
            Ok(pid) if pid > 0 => Some(ProcessFilter::Pid(pid)),
            _ => Some(ProcessFilter::Name(raw.to_string())),
        }
    }

    pub fn matches_name(&self, name: &str) -> bool {
        match self {
            ProcessFilter::Pid(_) => false,
            ProcessFilter::Name(filter) => name.contains(filter.as_str()),
        }
    }

    /// PIDs to signal right now, excluding the agent itself
    pub fn resolve(&self, system: &mut System) -> Vec<u32> {
        let own = std::process::id();
        let mut pids = match self {
            ProcessFilter::Pid(pid) => vec![*pid],
            ProcessFilter::Name(_) => {
                system.refresh_processes(ProcessesToUpdate::All, true);
                system
                    .processes()
                    .iter()
                    .filter(|(_, process)| self.matches_name(&process.name().to_string_lossy()))
                    .map(|(pid, _)| pid.as_u32())
                    .collect()
            }
        };
        pids.retain(|pid| *pid != own);
        pids.sort_unstable();
        pids
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StopProcessConfig {
    #[serde(deserialize_with = "lenient::u64")]
    duration: u64,
    #[serde(default)]
    process: String,
    #[serde(default = "default_graceful")]
    graceful: bool,
    #[serde(default = "default_delay", deserialize_with = "lenient::u64")]
    delay: u64,
}

fn default_graceful() -> bool {
    true
}

fn default_delay() -> u64 {
    5_000
}

#[derive(Debug)]
struct StopLoop {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StopProcessState {
    pub process: String,
    pub graceful: bool,
    pub delay_ms: u64,
    pub duration_ms: u64,
    #[serde(skip)]
    signalled: Arc<AtomicUsize>,
    #[serde(skip)]
    reported: usize,
    #[serde(skip)]
    task: Option<StopLoop>,
}

fn signal(pid: u32, graceful: bool) -> nix::Result<()> {
    let signal = if graceful {
        Signal::SIGTERM
    } else {
        Signal::SIGKILL
    };
    kill(Pid::from_raw(pid as i32), signal)
}

async fn stop_loop(
    filter: ProcessFilter,
    graceful: bool,
    delay: Duration,
    deadline: Instant,
    token: CancellationToken,
    signalled: Arc<AtomicUsize>,
) {
    let mut system = System::new();
    loop {
        for pid in filter.resolve(&mut system) {
            match signal(pid, graceful) {
                Ok(()) => {
                    signalled.fetch_add(1, Ordering::Relaxed);
                    debug!(pid, graceful, "Process signalled");
                }
                Err(nix::errno::Errno::ESRCH) => debug!(pid, "Process already gone"),
                Err(e) => warn!(pid, "Failed to signal process: {}", e),
            }
        }

        let next = (Instant::now() + delay).min(deadline);
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep_until(next) => {}
        }
        if Instant::now() >= deadline {
            break;
        }
    }
    info!(signalled = signalled.load(Ordering::Relaxed), "Process stopper finished");
}

#[derive(Debug, Default)]
pub struct StopProcessAction;

impl StopProcessAction {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Action for StopProcessAction {
    type State = StopProcessState;

    fn describe(&self) -> ActionDescription {
        ActionDescription::attack(
            "stop-process",
            "Stop Processes",
            "Repeatedly stops processes matching a PID or name",
            "state",
            TimeControl::External,
        )
        .with_parameters(vec![
            Parameter::string("process", "Process")
                .describe("PID or part of the process name")
                .required(),
            Parameter::boolean("graceful", "Graceful", true)
                .describe("Send SIGTERM instead of SIGKILL"),
            Parameter::duration("duration", "Duration", 30_000),
            Parameter::duration("delay", "Delay", 5_000)
                .describe("Time between two rounds")
                .advanced(),
        ])
    }

    async fn prepare(&self, request: &PrepareActionRequestBody) -> ActionResult<StopProcessState> {
        let config: StopProcessConfig = params::parse_config(&request.config)?;
        params::duration_at_least_1s(config.duration)?;
        if ProcessFilter::parse(&config.process).is_none() {
            return Err(ActionError::errored("process must not be empty"));
        }
        if config.delay == 0 {
            return Err(ActionError::errored("delay must be greater than 0"));
        }
        Ok(StopProcessState {
            process: config.process.trim().to_string(),
            graceful: config.graceful,
            delay_ms: config.delay,
            duration_ms: config.duration,
            signalled: Arc::new(AtomicUsize::new(0)),
            reported: 0,
            task: None,
        })
    }

    async fn start(&self, state: &mut StopProcessState) -> ActionResult<StartResult> {
        let filter = ProcessFilter::parse(&state.process)
            .ok_or_else(|| ActionError::failed("process must not be empty"))?;
        let token = CancellationToken::new();
        let handle = tokio::spawn(stop_loop(
            filter,
            state.graceful,
            Duration::from_millis(state.delay_ms),
            Instant::now() + Duration::from_millis(state.duration_ms),
            token.clone(),
            state.signalled.clone(),
        ));
        state.task = Some(StopLoop { token, handle });
        info!(process = %state.process, graceful = state.graceful, "Process stopper started");
        Ok(StartResult::default())
    }

    async fn status(&self, state: &mut StopProcessState) -> ActionResult<StatusResult> {
        let mut result = StatusResult::running();
        let total = state.signalled.load(Ordering::Relaxed);
        if total > state.reported {
            result.messages.push(Message::info(format!(
                "signalled {} processes matching '{}'",
                total - state.reported,
                state.process
            )));
            state.reported = total;
        }
        Ok(result)
    }

    async fn stop(&self, state: &mut StopProcessState) -> ActionResult<StopResult> {
        if let Some(task) = state.task.take() {
            task.token.cancel();
            if let Err(e) = task.handle.await {
                warn!("Process stopper ended abnormally: {}", e);
            }
        }
        Ok(StopResult::default())
    }
}
