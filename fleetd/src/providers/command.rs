//! Command runner seam
//!
//! Concrete providers drive the `docker`, `aws`, `gcloud` and `az` CLIs
//! through [`CommandRunner`], so tests can script CLI responses.

use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::errors::FleetError;

/// A CLI invocation
#[derive(Debug)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    /// Piped to the process; used for secret values so they stay out of argv
    pub stdin: Option<SecretString>,
}

impl CommandSpec {
    pub fn new<I, S>(program: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.to_string(),
            args: args.into_iter().map(Into::into).collect(),
            env: Vec::new(),
            stdin: None,
        }
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.push((key.to_string(), value.to_string()));
        self
    }

    pub fn stdin(mut self, input: SecretString) -> Self {
        self.stdin = Some(input);
        self
    }

    /// Program and arguments joined for logs
    pub fn display(&self) -> String {
        format!("{} {}", self.program, self.args.join(" "))
    }
}

/// Captured process result
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            status: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(status: i32, stderr: impl Into<String>) -> Self {
        Self {
            status,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.status == 0
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, FleetError> {
        Ok(serde_json::from_str(self.stdout.trim())?)
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion. A non-zero exit is an `Ok` output; only failing to
    /// launch the program is an error.
    async fn run(&self, spec: CommandSpec) -> Result<CommandOutput, FleetError>;
}

/// Runs commands as child processes
pub struct ProcessRunner {
    timeout: Duration,
}

impl ProcessRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new(Duration::from_secs(600))
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, spec: CommandSpec) -> Result<CommandOutput, FleetError> {
        debug!("Running: {}", spec.display());

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .kill_on_drop(true);

        let mut child = command.spawn()?;
        if let (Some(input), Some(mut stdin)) = (&spec.stdin, child.stdin.take()) {
            stdin.write_all(input.expose_secret().as_bytes()).await?;
            // Closing stdin signals EOF to the CLI
            drop(stdin);
        }

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                FleetError::Internal(format!(
                    "{} timed out after {}s",
                    spec.program,
                    self.timeout.as_secs()
                ))
            })??;

        Ok(CommandOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// A recorded invocation of [`ScriptedRunner`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub program: String,
    pub args: Vec<String>,
    pub stdin: Option<String>,
}

impl RecordedCall {
    pub fn line(&self) -> String {
        format!("{} {}", self.program, self.args.join(" "))
    }
}

/// Runner that answers from a script instead of launching processes.
///
/// Responses are matched by the first rule whose pattern is a substring of
/// `program args...`; one-shot rules are consumed, the fallback answers
/// everything else.
pub struct ScriptedRunner {
    rules: Mutex<VecDeque<(String, CommandOutput, bool)>>,
    fallback: CommandOutput,
    calls: Mutex<Vec<RecordedCall>>,
    yielding: bool,
}

impl Default for ScriptedRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self {
            rules: Mutex::new(VecDeque::new()),
            fallback: CommandOutput::ok(""),
            calls: Mutex::new(Vec::new()),
            yielding: false,
        }
    }

    pub fn with_fallback(mut self, output: CommandOutput) -> Self {
        self.fallback = output;
        self
    }

    /// Yield to the scheduler before answering, like a real process would
    pub fn yielding(mut self) -> Self {
        self.yielding = true;
        self
    }

    /// Answer every matching call
    pub fn on(self, pattern: &str, output: CommandOutput) -> Self {
        self.push(pattern, output, false);
        self
    }

    /// Answer the next matching call only
    pub fn once(self, pattern: &str, output: CommandOutput) -> Self {
        self.push(pattern, output, true);
        self
    }

    fn push(&self, pattern: &str, output: CommandOutput, once: bool) {
        self.rules
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back((pattern.to_string(), output, once));
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Calls whose command line contains `pattern`
    pub fn calls_matching(&self, pattern: &str) -> Vec<RecordedCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.line().contains(pattern))
            .collect()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, spec: CommandSpec) -> Result<CommandOutput, FleetError> {
        let line = spec.display();
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(RecordedCall {
                program: spec.program.clone(),
                args: spec.args.clone(),
                stdin: spec.stdin.as_ref().map(|s| s.expose_secret().to_string()),
            });
        if self.yielding {
            tokio::task::yield_now().await;
        }

        let mut rules = self.rules.lock().unwrap_or_else(|e| e.into_inner());
        let position = rules.iter().position(|(pattern, _, _)| line.contains(pattern.as_str()));
        let output = match position {
            Some(index) if rules[index].2 => rules.remove(index).map(|(_, out, _)| out),
            Some(index) => Some(rules[index].1.clone()),
            None => None,
        };
        Ok(output.unwrap_or_else(|| self.fallback.clone()))
    }
}
