//! Subprocess execution.
//!
//! Every CLI collaborator (`kind`, `kubectl`, `helm`, `cilium`, `eksctl`,
//! `git`) is invoked through [`CommandRunner`] so callers can swap in a
//! scripted runner under test. Invocations are stateless and never retried
//! here; callers that need retries wrap them explicitly.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::providers::ProviderError;

/// A subprocess invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    /// Program name or path.
    pub program: String,
    /// Arguments.
    pub args: Vec<String>,
    /// Extra environment variables.
    pub env: Vec<(String, String)>,
    /// Data written to stdin.
    pub stdin: Option<String>,
    /// Working directory.
    pub current_dir: Option<PathBuf>,
}

impl CommandSpec {
    /// Start a new invocation of `program`.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    /// Append one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set an environment variable.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Pipe `input` to stdin.
    #[must_use]
    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Run in `dir`.
    #[must_use]
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Human-readable command line.
    #[must_use]
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Captured result of a subprocess.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when killed by a signal.
    pub code: Option<i32>,
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
}

impl CommandOutput {
    /// Successful output with `stdout`.
    #[must_use]
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Failed output with `stderr`.
    #[must_use]
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Whether the process exited with status zero.
    #[must_use]
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Runs subprocesses.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion and capture output. A non-zero exit is not an error.
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ProviderError>;

    /// Whether `program` is available on this machine.
    async fn exists(&self, program: &str) -> bool;
}

/// Run `spec` and fail on a non-zero exit, returning stdout.
///
/// # Errors
///
/// Returns [`ProviderError::Command`] when the process exits unsuccessfully.
pub async fn run_checked(
    runner: &dyn CommandRunner,
    spec: &CommandSpec,
) -> Result<String, ProviderError> {
    let output = runner.run(spec).await?;
    if output.success() {
        Ok(output.stdout)
    } else {
        Err(ProviderError::Command {
            program: spec.program.clone(),
            code: output.code,
            stderr: output.stderr.trim().to_string(),
        })
    }
}

/// [`CommandRunner`] backed by real processes.
///
/// Children are killed when the returned future is dropped, so racing a run
/// against cancellation stops the subprocess too.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ProviderError> {
        debug!(command = %spec.display(), "Running command");

        let mut command = tokio::process::Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &spec.env {
            command.env(key, value);
        }
        if let Some(dir) = &spec.current_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ProviderError::Config(format!("{} is not installed or not on PATH", spec.program))
            } else {
                ProviderError::Io(e)
            }
        })?;

        if let (Some(input), Some(mut stdin)) = (&spec.stdin, child.stdin.take()) {
            stdin.write_all(input.as_bytes()).await?;
            // Close stdin so the child sees EOF
            drop(stdin);
        }

        let output = child.wait_with_output().await?;
        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    async fn exists(&self, program: &str) -> bool {
        which::which(program).is_ok()
    }
}
