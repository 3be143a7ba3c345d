//! Host Command Runner
//!
//! Typed wrapper around the external tools the injectors drive. Every
//! invocation carries its program, argv, optional stdin batch, deadline and
//! credentials; the child environment is cleared and rebuilt so the tools
//! behave the same regardless of the agent's own environment.

use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command as TokioCommand};
use tracing::{debug, warn};

use super::launcher::HostLauncher;
use super::timeout::{ExecutionTimeout, TOOL_TIMEOUT};
use super::validator::{CommandValidationError, CommandValidator};

/// `PATH` handed to every child
pub const HOST_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Maximum captured bytes per stream
const MAX_OUTPUT_SIZE: usize = 1024 * 1024;

/// One invocation of a host tool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SysCommand {
    pub program: String,
    pub args: Vec<String>,
    pub stdin: Option<String>,
    pub timeout: Duration,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub env: Vec<(String, String)>,
    /// Run inside the host namespaces when the agent does not share them
    pub host_namespace: bool,
}

impl SysCommand {
    /// Command running as root in the host namespaces with the generic deadline
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
            timeout: TOOL_TIMEOUT,
            uid: Some(0),
            gid: Some(0),
            env: Vec::new(),
            host_namespace: true,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn as_user(mut self, uid: u32, gid: u32) -> Self {
        self.uid = Some(uid);
        self.gid = Some(gid);
        self
    }

    /// Keep the agent's own namespaces (for the agent's own binary)
    pub fn local(mut self) -> Self {
        self.host_namespace = false;
        self
    }

    /// Program and arguments joined by single spaces
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Captured output of a finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub code: Option<i32>,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            code: Some(0),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error(transparent)]
    NotAllowed(#[from] CommandValidationError),

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} timed out after {timeout:?}")]
    Timeout { program: String, timeout: Duration },

    #[error("{program} {}: {}", exit_label(.code), .stderr.trim())]
    Failed {
        program: String,
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exited with code {}", code),
        None => "was killed by a signal".to_string(),
    }
}

impl CommandError {
    /// Captured stderr, when the tool ran at all
    pub fn stderr(&self) -> Option<&str> {
        match self {
            CommandError::Failed { stderr, .. } => Some(stderr),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, CommandError::Timeout { .. })
    }
}

/// Executes host tools
///
/// Implemented by [`HostRunner`] for real hosts and by
/// [`RecordingRunner`](super::RecordingRunner) for tests.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion; a non-zero exit is [`CommandError::Failed`]
    async fn run(&self, command: &SysCommand) -> Result<CommandOutput, CommandError>;

    /// Start a supervised child whose lifetime the caller owns
    fn spawn(&self, command: &SysCommand) -> Result<Child, CommandError>;
}

/// Runs tools on the local host, entering the host namespaces if needed
#[derive(Debug, Clone, Default)]
pub struct HostRunner {
    validator: CommandValidator,
    launcher: HostLauncher,
}

impl HostRunner {
    pub fn new(launcher: HostLauncher) -> Self {
        Self {
            validator: CommandValidator::default(),
            launcher,
        }
    }

    pub fn with_validator(mut self, validator: CommandValidator) -> Self {
        self.validator = validator;
        self
    }

    pub fn launcher(&self) -> &HostLauncher {
        &self.launcher
    }

    fn prepare(&self, command: &SysCommand) -> Result<TokioCommand, CommandError> {
        if command.host_namespace {
            self.validator.validate(&command.program, &command.args)?;
        } else if !is_current_exe(&command.program) {
            return Err(CommandValidationError::NotAllowed(command.program.clone()).into());
        }
        Ok(self.launcher.command(command))
    }
}

fn is_current_exe(program: &str) -> bool {
    std::env::current_exe()
        .map(|exe| exe.as_os_str() == program)
        .unwrap_or(false)
}

/// Apply the env and credential discipline to a child command
pub(crate) fn apply_discipline(process: &mut TokioCommand, command: &SysCommand) {
    process.env_clear();
    process.env("PATH", HOST_PATH);
    process.env("LC_ALL", "C");
    for (key, value) in &command.env {
        process.env(key, value);
    }

    #[cfg(unix)]
    {
        if nix::unistd::geteuid().is_root() {
            if let Some(uid) = command.uid {
                process.uid(uid);
            }
            if let Some(gid) = command.gid {
                process.gid(gid);
            }
        } else if command.uid.is_some() || command.gid.is_some() {
            debug!(
                program = %command.program,
                "Agent is not root, running without credential switch"
            );
        }
    }
}

fn truncate(bytes: &[u8]) -> String {
    let mut text = String::from_utf8_lossy(bytes).into_owned();
    if text.len() > MAX_OUTPUT_SIZE {
        let mut cut = MAX_OUTPUT_SIZE;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
    }
    text
}

#[async_trait]
impl CommandRunner for HostRunner {
    async fn run(&self, command: &SysCommand) -> Result<CommandOutput, CommandError> {
        let mut process = self.prepare(command)?;
        process
            .stdin(if command.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(command = %command.command_line(), "Executing");
        let mut child = process.spawn().map_err(|source| CommandError::Spawn {
            program: command.program.clone(),
            source,
        })?;

        let pipe = child.stdin.take();
        let input = command.stdin.clone();
        let feed = async move {
            if let (Some(mut pipe), Some(input)) = (pipe, input) {
                pipe.write_all(input.as_bytes()).await?;
                pipe.shutdown().await?;
            }
            Ok::<(), std::io::Error>(())
        };

        let waited = ExecutionTimeout::new(command.timeout)
            .run(async { tokio::join!(feed, child.wait_with_output()) })
            .await;
        let (fed, output) = waited.map_err(|_| CommandError::Timeout {
            program: command.program.clone(),
            timeout: command.timeout,
        })?;

        if let Err(e) = fed {
            // The tool may exit before reading all of stdin; its status decides
            debug!(program = %command.program, "Writing stdin failed: {}", e);
        }

        let output = output.map_err(|source| CommandError::Spawn {
            program: command.program.clone(),
            source,
        })?;

        let result = CommandOutput {
            stdout: truncate(&output.stdout),
            stderr: truncate(&output.stderr),
            code: output.status.code(),
        };

        if output.status.success() {
            Ok(result)
        } else {
            warn!(
                command = %command.command_line(),
                code = ?result.code,
                "Command failed: {}",
                result.stderr.trim()
            );
            Err(CommandError::Failed {
                program: command.program.clone(),
                code: result.code,
                stdout: result.stdout,
                stderr: result.stderr,
            })
        }
    }

    fn spawn(&self, command: &SysCommand) -> Result<Child, CommandError> {
        let mut process = self.prepare(command)?;
        process
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(command = %command.command_line(), "Spawning supervised child");
        process.spawn().map_err(|source| CommandError::Spawn {
            program: command.program.clone(),
            source,
        })
    }
}
