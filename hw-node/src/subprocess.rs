use std::{
    ffi::OsString,
    fmt::{self, Display},
    process::Stdio,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use common::clap::REDACTED_VALUE;
use serde::Serialize;
use thiserror::Error;
use tokio::{io::AsyncReadExt, sync::Mutex, task::JoinHandle};

/// A single argv token. Secret tokens are passed to the process unchanged but are
/// replaced with a placeholder whenever the command is logged or displayed.
#[derive(Clone, PartialEq, Eq)]
pub struct CommandArg {
    value: String,
    secret: bool,
}

impl CommandArg {
    pub fn plain(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            secret: false,
        }
    }

    pub fn secret(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            secret: true,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }
}

impl fmt::Debug for CommandArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.secret {
            f.write_str(REDACTED_VALUE)
        } else {
            fmt::Debug::fmt(&self.value, f)
        }
    }
}

/// An external command described as a program and its argv, never as a shell string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    program: String,
    args: Vec<CommandArg>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(CommandArg::plain(arg));
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(CommandArg::plain));
        self
    }

    pub fn secret_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(CommandArg::secret(arg));
        self
    }

    /// Swaps the program while keeping the argv, used for dry runs where the real tool
    /// is replaced with `echo`.
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn arg_values(&self) -> impl Iterator<Item = &str> {
        self.args.iter().map(CommandArg::as_str)
    }

    /// The full argv including the program, secrets included.
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.program.clone())
            .chain(self.arg_values().map(str::to_owned))
            .collect()
    }

    /// Space joined command line with secrets in clear, as the tool sees it.
    pub fn command_line(&self) -> String {
        self.argv().join(" ")
    }

    /// Replaces every secret argument that appears in `text`, for output of tools like
    /// `echo` that print their own argv.
    pub fn redact_output(&self, text: &str) -> String {
        self.args
            .iter()
            .filter(|arg| arg.secret && !arg.value.is_empty())
            .fold(text.to_owned(), |text, arg| {
                text.replace(&arg.value, REDACTED_VALUE)
            })
    }

    fn to_tokio(&self) -> tokio::process::Command {
        let mut command = tokio::process::Command::new(&self.program);
        command.args(self.args.iter().map(|a| OsString::from(&a.value)));
        command
    }
}

/// Space joined command line with secrets redacted, for logs and error messages.
impl Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            f.write_str(" ")?;
            if arg.secret {
                f.write_str(REDACTED_VALUE)?;
            } else {
                f.write_str(&arg.value)?;
            }
        }
        Ok(())
    }
}

/// Captured result of a process that ran to completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandOutput {
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("Failed to start execution of [{command}]: {err}")]
    ExecutionStart {
        command: String,
        err: std::io::Error,
    },
    #[error("Command [{command}] did not finish within {timeout:?} and was killed")]
    TimedOut { command: String, timeout: Duration },
}

/// Anything that can run an external command to completion.
///
/// Components only ever talk to this trait so tests can substitute a recording fake
/// for the real process spawner.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, command: &CommandSpec) -> Result<CommandOutput, ExecutionError>;
}

/// Spawns real processes with tokio, capturing stdout and stderr.
///
/// The process is killed if it outlives `timeout` or if the future is dropped.
#[derive(Debug, Clone)]
pub struct SystemCommandRunner {
    timeout: Duration,
}

impl SystemCommandRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn run(&self, command: &CommandSpec) -> Result<CommandOutput, ExecutionError> {
        tracing::debug!("Running command: {}", command);

        let child = command
            .to_tokio()
            .kill_on_drop(true)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| ExecutionError::ExecutionStart {
                command: command.to_string(),
                err,
            })?;

        if let Some(pid) = child.id() {
            tracing::debug!("{} started with process id {}", command.program(), pid);
        }

        // Dropping the `wait_with_output` future on timeout drops the child, which kills it
        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(output) => output.map_err(|err| ExecutionError::ExecutionStart {
                command: command.to_string(),
                err,
            })?,
            Err(_) => {
                return Err(ExecutionError::TimedOut {
                    command: command.to_string(),
                    timeout: self.timeout,
                })
            }
        };

        let output = CommandOutput {
            exit_code: output.status.code(),
            stdout: command.redact_output(&String::from_utf8_lossy(&output.stdout)),
            stderr: command.redact_output(&String::from_utf8_lossy(&output.stderr)),
        };

        for line in output.stdout.lines() {
            tracing::debug!("{} stdout: {}", command.program(), line);
        }
        for line in output.stderr.lines() {
            tracing::debug!("{} stderr: {}", command.program(), line);
        }

        Ok(output)
    }
}

#[derive(Debug, Default)]
struct TailBuffer {
    bytes: Vec<u8>,
    truncated: bool,
}

/// The most recent output of a long running process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TailSnapshot {
    pub text: String,
    /// Older output was dropped to stay within the byte limit.
    pub truncated: bool,
}

/// A long running process whose stdout is collected in the background, keeping only the
/// last `max_bytes`. The process stays attached until the tail is dropped, at which point
/// it is killed.
#[derive(Debug)]
pub struct OutputTail {
    command: CommandSpec,
    buffer: Arc<Mutex<TailBuffer>>,
    pump: JoinHandle<()>,
}

impl OutputTail {
    /// Spawns `command` with stdin held open, since interactive clients such as conman
    /// disconnect when they see EOF.
    pub fn spawn(command: &CommandSpec, max_bytes: usize) -> Result<Self, ExecutionError> {
        tracing::debug!("Attaching to command: {}", command);

        let start_error = |err| ExecutionError::ExecutionStart {
            command: command.to_string(),
            err,
        };

        let mut child = command
            .to_tokio()
            .kill_on_drop(true)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(start_error)?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| start_error(std::io::Error::other("stdout was not captured")))?;

        let buffer = Arc::new(Mutex::new(TailBuffer::default()));
        let max_bytes = max_bytes.max(1);

        let pump = tokio::spawn({
            let buffer = buffer.clone();
            let name = command.to_string();
            async move {
                let mut chunk = [0u8; 4096];
                loop {
                    match stdout.read(&mut chunk).await {
                        Ok(0) => break,
                        Ok(n) => {
                            let mut buffer = buffer.lock().await;
                            buffer.bytes.extend_from_slice(&chunk[..n]);
                            if buffer.bytes.len() > max_bytes {
                                let excess = buffer.bytes.len() - max_bytes;
                                buffer.bytes.drain(..excess);
                                buffer.truncated = true;
                            }
                        }
                        Err(e) => {
                            tracing::warn!("Reading output of [{}] failed: {}", name, e);
                            break;
                        }
                    }
                }

                // `child` is owned by this task so aborting the task kills the process
                match child.wait().await {
                    Ok(status) => tracing::debug!("[{}] exited with {}", name, status),
                    Err(e) => tracing::warn!("Waiting for [{}] failed: {}", name, e),
                }
            }
        });

        Ok(Self {
            command: command.clone(),
            buffer,
            pump,
        })
    }

    /// The process has closed its output and exited.
    pub fn is_finished(&self) -> bool {
        self.pump.is_finished()
    }

    pub async fn snapshot(&self) -> TailSnapshot {
        let buffer = self.buffer.lock().await;
        TailSnapshot {
            text: self
                .command
                .redact_output(&String::from_utf8_lossy(&buffer.bytes)),
            truncated: buffer.truncated,
        }
    }
}

impl Drop for OutputTail {
    fn drop(&mut self) {
        self.pump.abort();
    }
}
