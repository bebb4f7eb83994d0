//! External command invocation.
//!
//! Every artifact a stage derives comes from exactly one external command.
//! [`ShellCommand`] assembles the argument list, applies the environment
//! and an optional timeout, runs the subprocess, and turns a non-zero exit
//! into a [`TaskError::CommandFailed`] carrying the exit code and stderr.
//! External tools are assumed deterministic, so there is no retry here:
//! a failure is fatal for the invoking stage.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use crate::core::environment::Environment;
use crate::core::task::TaskError;

/// Captured result of a finished command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
    /// Exit code (0 on success).
    pub code: i32,
}

/// An external command under construction.
///
/// # Example
///
/// ```ignore
/// let output = ShellCommand::new("mrconvert")
///     .arg(&source)
///     .arg(&target)
///     .args(["-quiet", "-force"])
///     .timeout(Duration::from_secs(3600))
///     .run()
///     .await?;
/// ```
#[derive(Debug, Clone)]
pub struct ShellCommand {
    program: String,
    args: Vec<String>,
    environment: Environment,
    current_dir: Option<PathBuf>,
    timeout: Option<Duration>,
}

impl ShellCommand {
    /// Create a new command for the given program.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            environment: Environment::default(),
            current_dir: None,
            timeout: None,
        }
    }

    /// The program being executed.
    pub fn program(&self) -> &str {
        &self.program
    }

    /// The argument list assembled so far.
    pub fn args_ref(&self) -> &[String] {
        &self.args
    }

    /// The environment assembled so far.
    pub fn environment(&self) -> &Environment {
        &self.environment
    }

    /// Add a single argument. Paths are rendered lossily, which is fine for
    /// the UTF-8 names this pipeline generates.
    pub fn arg(mut self, arg: impl AsRef<str>) -> Self {
        self.args.push(arg.as_ref().to_string());
        self
    }

    /// Add a path argument.
    pub fn arg_path(mut self, path: &Path) -> Self {
        self.args.push(path.display().to_string());
        self
    }

    /// Add multiple arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_string()));
        self
    }

    /// Add a single environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.set(key, value);
        self
    }

    /// Set the working directory.
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Bound the command's execution time. Expiry is fatal for the stage.
    pub fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }

    /// Run the command to completion.
    pub async fn run(self) -> Result<CommandOutput, TaskError> {
        debug!(program = %self.program, args = ?self.args, "launching external command");

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        for (key, value) in self.environment.iter() {
            cmd.env(key, value);
        }
        if let Some(ref dir) = self.current_dir {
            cmd.current_dir(dir);
        }
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let output = match self.timeout {
            Some(duration) => timeout(duration, cmd.output())
                .await
                .map_err(|_| TaskError::CommandTimeout {
                    program: self.program.clone(),
                    timeout: duration,
                })?,
            None => cmd.output().await,
        }
        .map_err(|source| TaskError::CommandLaunch {
            program: self.program.clone(),
            source,
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let code = output.status.code().unwrap_or(-1);

        if output.status.success() {
            Ok(CommandOutput {
                stdout,
                stderr,
                code,
            })
        } else {
            Err(TaskError::CommandFailed {
                program: self.program,
                code,
                stderr: stderr.trim().to_string(),
            })
        }
    }
}
