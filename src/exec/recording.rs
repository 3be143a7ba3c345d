//! Recording command runner
//!
//! Captures every invocation so tests can assert exact argv and stdin of the
//! host tools without root. Responses are scripted by command-line prefix;
//! unmatched commands succeed with empty output.

use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;
use tokio::process::{Child, Command as TokioCommand};

use super::command::{CommandError, CommandOutput, CommandRunner, SysCommand};

#[derive(Debug, Clone)]
pub enum Scripted {
    Output(String),
    Fail { code: i32, stderr: String },
    Timeout,
}

#[derive(Debug, Default)]
pub struct RecordingRunner {
    calls: Mutex<Vec<SysCommand>>,
    responses: Mutex<Vec<(String, Option<String>, Scripted)>>,
    children: Mutex<Vec<(String, String)>>,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer commands whose command line starts with `prefix`
    pub fn respond(&self, prefix: &str, response: Scripted) -> &Self {
        if let Ok(mut responses) = self.responses.lock() {
            responses.push((prefix.to_string(), None, response));
        }
        self
    }

    /// Answer commands starting with `prefix` whose stdin contains `needle`
    pub fn respond_to_stdin(&self, prefix: &str, needle: &str, response: Scripted) -> &Self {
        if let Ok(mut responses) = self.responses.lock() {
            responses.push((prefix.to_string(), Some(needle.to_string()), response));
        }
        self
    }

    pub fn stdout(&self, prefix: &str, stdout: &str) -> &Self {
        self.respond(prefix, Scripted::Output(stdout.to_string()))
    }

    pub fn fail(&self, prefix: &str, code: i32, stderr: &str) -> &Self {
        self.respond(
            prefix,
            Scripted::Fail {
                code,
                stderr: stderr.to_string(),
            },
        )
    }

    /// Spawned children matching `prefix` run `sh -c script`
    pub fn child_script(&self, prefix: &str, script: &str) -> &Self {
        if let Ok(mut children) = self.children.lock() {
            children.push((prefix.to_string(), script.to_string()));
        }
        self
    }

    pub fn calls(&self) -> Vec<SysCommand> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Command lines of every call, in order
    pub fn lines(&self) -> Vec<String> {
        self.calls().iter().map(SysCommand::command_line).collect()
    }

    /// Stdin batches of calls whose command line starts with `prefix`
    pub fn stdin_of(&self, prefix: &str) -> Vec<String> {
        self.calls()
            .iter()
            .filter(|c| c.command_line().starts_with(prefix))
            .filter_map(|c| c.stdin.clone())
            .collect()
    }

    pub fn clear(&self) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.clear();
        }
    }

    fn record(&self, command: &SysCommand) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(command.clone());
        }
    }

    fn scripted(&self, command: &SysCommand) -> Option<Scripted> {
        let line = command.command_line();
        let stdin = command.stdin.as_deref().unwrap_or_default();
        let responses = self.responses.lock().ok()?;
        responses
            .iter()
            .rev()
            .find(|(prefix, needle, _)| {
                line.starts_with(prefix.as_str())
                    && needle.as_deref().map_or(true, |needle| stdin.contains(needle))
            })
            .map(|(_, _, response)| response.clone())
    }
}

#[async_trait]
impl CommandRunner for RecordingRunner {
    async fn run(&self, command: &SysCommand) -> Result<CommandOutput, CommandError> {
        self.record(command);
        match self.scripted(command) {
            None => Ok(CommandOutput::default()),
            Some(Scripted::Output(stdout)) => Ok(CommandOutput::ok(stdout)),
            Some(Scripted::Fail { code, stderr }) => Err(CommandError::Failed {
                program: command.program.clone(),
                code: Some(code),
                stdout: String::new(),
                stderr,
            }),
            Some(Scripted::Timeout) => Err(CommandError::Timeout {
                program: command.program.clone(),
                timeout: Duration::from_secs(0),
            }),
        }
    }

    fn spawn(&self, command: &SysCommand) -> Result<Child, CommandError> {
        self.record(command);
        let line = command.command_line();
        let script = self
            .children
            .lock()
            .ok()
            .and_then(|children| {
                children
                    .iter()
                    .rev()
                    .find(|(prefix, _)| line.starts_with(prefix.as_str()))
                    .map(|(_, script)| script.clone())
            })
            .unwrap_or_else(|| "exit 0".to_string());

        TokioCommand::new("sh")
            .args(["-c", &script])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| CommandError::Spawn {
                program: command.program.clone(),
                source,
            })
    }
}
