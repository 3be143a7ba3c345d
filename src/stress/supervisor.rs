//! Supervised child processes
//!
//! A long-running tool (stress-ng, dd, the memory allocator) spawned through
//! the command runner. Output is captured in the background; status polls the
//! exit without blocking and stop kills the child.

use std::process::ExitStatus;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::action::{Message, StatusResult, UserError};
use crate::exec::{CommandError, CommandRunner, SysCommand};

/// Exit code of a child killed with SIGKILL, usually by the OOM killer
pub const OOM_KILLED: i32 = 137;

/// Captured stderr is cut to this many bytes
const STDERR_LIMIT: usize = 16 * 1024;

const KILL_GRACE: Duration = Duration::from_secs(5);

const NSDELEGATE_HINT: &str = "cgroup2 nsdelegate";

/// How a supervised child ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ChildExit {
    pub fn from_status(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
        }
    }

    pub fn success(self) -> bool {
        self.code == Some(0)
    }

    /// Shell-style exit code: signal deaths map to 128 + signal
    pub fn exit_code(self) -> i32 {
        match (self.code, self.signal) {
            (Some(code), _) => code,
            (None, Some(signal)) => 128 + signal,
            (None, None) => -1,
        }
    }
}

/// Turn a child exit into the status envelope
///
/// Exit codes listed in `ignore` complete with a warning instead of an error.
pub fn exit_status(name: &str, exit: ChildExit, stderr: &str, ignore: &[i32]) -> StatusResult {
    if exit.success() {
        return StatusResult::completed();
    }
    let code = exit.exit_code();
    if ignore.contains(&code) {
        let mut result = StatusResult::completed();
        result.messages.push(Message::warn(format!(
            "{} was killed with exit code {} (likely OOM), ignored",
            name, code
        )));
        return result;
    }

    let stderr = stderr.trim();
    let error = if stderr.contains(NSDELEGATE_HINT) {
        UserError::failed(format!("{} failed: {}", name, stderr)).with_detail(
            "the cgroup2 filesystem is mounted with nsdelegate; remount with \
             `mount -o remount,rw,nosuid,nodev,noexec,relatime -t cgroup2 none /sys/fs/cgroup`",
        )
    } else if stderr.is_empty() {
        UserError::failed(format!("{} exited with code {}", name, code))
    } else {
        UserError::failed(format!("{} exited with code {}", name, code)).with_detail(stderr)
    };
    StatusResult {
        completed: true,
        error: Some(error),
        messages: Vec::new(),
        metrics: Vec::new(),
    }
}

#[derive(Debug, Default)]
struct Captured {
    stderr: String,
    lines: Vec<String>,
}

/// Handle to a spawned child and its captured output
#[derive(Debug)]
pub struct SupervisedChild {
    name: String,
    child: Child,
    captured: Arc<Mutex<Captured>>,
    readers: Vec<JoinHandle<()>>,
    exit: Option<ChildExit>,
}

impl SupervisedChild {
    pub fn spawn(runner: &dyn CommandRunner, command: &SysCommand) -> Result<Self, CommandError> {
        let mut child = runner.spawn(command)?;
        let captured = Arc::new(Mutex::new(Captured::default()));
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(capture(stdout, captured.clone(), false)));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(capture(stderr, captured.clone(), true)));
        }
        debug!(program = %command.program, pid = ?child.id(), "Child started");
        Ok(Self {
            name: command.program.clone(),
            child,
            captured,
            readers,
            exit: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Exit of the child, or `None` while it runs
    pub async fn poll(&mut self) -> std::io::Result<Option<ChildExit>> {
        if let Some(exit) = self.exit {
            return Ok(Some(exit));
        }
        match self.child.try_wait()? {
            Some(status) => {
                self.finish_readers().await;
                let exit = ChildExit::from_status(status);
                self.exit = Some(exit);
                Ok(Some(exit))
            }
            None => Ok(None),
        }
    }

    /// Output lines captured since the last call
    pub fn drain_lines(&self) -> Vec<String> {
        self.captured
            .lock()
            .map(|mut c| std::mem::take(&mut c.lines))
            .unwrap_or_default()
    }

    pub fn stderr(&self) -> String {
        self.captured
            .lock()
            .map(|c| c.stderr.clone())
            .unwrap_or_default()
    }

    /// Kill the child if still running and reap it
    pub async fn kill(&mut self) {
        if self.exit.is_some() {
            return;
        }
        if let Err(e) = self.child.start_kill() {
            debug!(program = %self.name, "Kill failed, child probably gone: {}", e);
        }
        match tokio::time::timeout(KILL_GRACE, self.child.wait()).await {
            Ok(Ok(status)) => self.exit = Some(ChildExit::from_status(status)),
            Ok(Err(e)) => warn!(program = %self.name, "Failed to reap child: {}", e),
            Err(_) => warn!(program = %self.name, "Child did not exit after kill"),
        }
        self.finish_readers().await;
    }

    async fn finish_readers(&mut self) {
        for reader in self.readers.drain(..) {
            if tokio::time::timeout(Duration::from_secs(1), reader).await.is_err() {
                debug!(program = %self.name, "Output reader still busy, dropping it");
            }
        }
    }
}

async fn capture<R>(stream: R, captured: Arc<Mutex<Captured>>, is_stderr: bool)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let Ok(mut captured) = captured.lock() else {
            return;
        };
        if is_stderr && captured.stderr.len() < STDERR_LIMIT {
            captured.stderr.push_str(&line);
            captured.stderr.push('\n');
        }
        captured.lines.push(line);
    }
}
