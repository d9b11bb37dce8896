//! # Command Execution Abstraction Layer
//!
//! Every privileged operation the pipeline performs on the host (`virsh`,
//! `qemu-img`, `vzctl`, `vzlist`, external checksum tools) goes through a
//! [`CommandExecutor`]. Adapters and probes hold an `Arc<dyn CommandExecutor>`
//! so the same code runs against the real host or against a scripted fake.
//!
//! ## Core Components
//!
//! - **[`CommandExecutor`]**: async trait implemented by every executor
//! - **[`HostExecutor`]**: direct host process execution via `tokio::process`
//! - **[`ScriptedExecutor`]**: records calls and answers from scripted rules
//! - **[`ExecutionCommand`]**: program, arguments, environment, stdin and timeout
//! - **[`ExecutionResult`]**: stdout, stderr, exit code and duration
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use vmtpl::executor::{CommandExecutor, ExecutionCommand, HostExecutor};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let executor = HostExecutor::new();
//!
//!     let command = ExecutionCommand::new("virsh", vec!["list".into(), "--all".into()]);
//!     let result = executor.run(command).await?;
//!     println!("{}", result.stdout);
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

/// Host-based command execution.
pub mod host;

/// Scripted executor for tests and dry runs.
pub mod scripted;

pub use host::HostExecutor;
pub use scripted::ScriptedExecutor;

/// Result of command execution
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Standard output from the command
    pub stdout: String,
    /// Standard error from the command
    pub stderr: String,
    /// Exit code (0 = success, non-zero = failure)
    pub exit_code: i32,
    /// Duration of command execution
    pub duration: Duration,
}

impl ExecutionResult {
    /// Successful result carrying the given stdout
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            ..Default::default()
        }
    }

    /// Failed result with the given exit code and stderr
    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            stderr: stderr.into(),
            exit_code,
            ..Default::default()
        }
    }

    /// Check if the command executed successfully (exit code 0)
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Command to execute
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionCommand {
    /// Program name or path to execute
    pub program: String,
    /// Command line arguments
    pub args: Vec<String>,
    /// Working directory for command execution
    pub working_dir: Option<PathBuf>,
    /// Environment variables to set
    pub env: HashMap<String, String>,
    /// Standard input to provide to the command
    pub stdin: Option<String>,
    /// Maximum execution time (None = no timeout)
    pub timeout: Option<Duration>,
}

impl ExecutionCommand {
    /// Create a new command with just program and args
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            working_dir: None,
            env: HashMap::new(),
            stdin: None,
            timeout: None,
        }
    }

    /// Create a command from string slices
    pub fn from_parts(program: impl Into<String>, args: &[&str]) -> Self {
        Self::new(program, args.iter().map(|a| a.to_string()).collect())
    }

    /// Set the working directory
    pub fn with_working_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = Some(dir);
        self
    }

    /// Add an environment variable
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set standard input
    pub fn with_stdin(mut self, stdin: impl Into<String>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }

    /// Set execution timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Program followed by arguments
    pub fn argv(&self) -> Vec<&str> {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect()
    }

    /// Shell-escaped command line, for logs and error messages
    pub fn display(&self) -> String {
        self.argv()
            .into_iter()
            .map(|part| shell_escape::escape(part.into()).into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Errors during command execution
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// Command could not be spawned or failed before producing a status
    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    /// Command ran but exited with a non-zero status
    #[error("`{command}` exited with status {exit_code}: {stderr}")]
    NonZeroExit {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    /// Command execution timed out
    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    /// Required tool is not installed
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    /// I/O error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Runs commands on behalf of adapters and probes.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Execute a command and return the result, whatever its exit status
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails to spawn or times out.
    async fn execute(&self, command: ExecutionCommand) -> Result<ExecutionResult, ExecutorError>;

    /// Get executor type name for logging
    fn executor_type(&self) -> &'static str;

    /// Execute a command and require a zero exit status
    ///
    /// # Errors
    ///
    /// Returns [`ExecutorError::NonZeroExit`] when the command fails.
    async fn run(&self, command: ExecutionCommand) -> Result<ExecutionResult, ExecutorError> {
        let shown = command.display();
        let result = self.execute(command).await?;
        if result.success() {
            Ok(result)
        } else {
            debug!(
                "{} executor: `{}` exited with {}",
                self.executor_type(),
                shown,
                result.exit_code
            );
            Err(ExecutorError::NonZeroExit {
                command: shown,
                exit_code: result.exit_code,
                stderr: result.stderr.trim().to_string(),
            })
        }
    }
}
