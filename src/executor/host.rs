//! Native host command execution.
//!
//! Executes commands directly on the host system using `tokio::process::Command`.

use super::{CommandExecutor, ExecutionCommand, ExecutionResult, ExecutorError};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Executes commands directly on the host system
#[derive(Debug, Clone)]
pub struct HostExecutor;

impl HostExecutor {
    /// Create a new host executor
    pub fn new() -> Self {
        Self
    }
}

impl Default for HostExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommandExecutor for HostExecutor {
    async fn execute(&self, cmd: ExecutionCommand) -> Result<ExecutionResult, ExecutorError> {
        debug!("Executing command on host: {}", cmd.display());

        let start = Instant::now();

        let mut command = Command::new(&cmd.program);
        command
            .args(&cmd.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if cmd.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .kill_on_drop(true);

        if let Some(ref dir) = cmd.working_dir {
            command.current_dir(dir);
        }

        for (key, value) in &cmd.env {
            command.env(key, value);
        }

        let mut child = command.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ExecutorError::ToolNotFound(cmd.program.clone())
            } else {
                ExecutorError::IoError(e)
            }
        })?;

        if let Some(input) = cmd.stdin.as_deref() {
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(input.as_bytes()).await?;
            }
        }

        // Execute command with optional timeout
        let output = if let Some(timeout) = cmd.timeout {
            match tokio::time::timeout(timeout, child.wait_with_output()).await {
                Ok(result) => result?,
                Err(_) => {
                    return Err(ExecutorError::Timeout(timeout));
                }
            }
        } else {
            child.wait_with_output().await?
        };

        let duration = start.elapsed();

        Ok(ExecutionResult {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(-1),
            duration,
        })
    }

    fn executor_type(&self) -> &'static str {
        "host"
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[tokio::test]
    async fn test_host_executor_simple_command() {
        let executor = HostExecutor::new();

        let cmd = ExecutionCommand::new("echo", vec!["hello".to_string()]);

        let result = executor.execute(cmd).await.unwrap();
        assert_eq!(result.exit_code, 0);
        assert!(result.stdout.contains("hello"));
        assert!(result.success());
    }

    #[tokio::test]
    async fn test_host_executor_working_directory() {
        let executor = HostExecutor::new();

        let cmd = ExecutionCommand::new("pwd", vec![]).with_working_dir(PathBuf::from("/tmp"));

        let result = executor.execute(cmd).await.unwrap();
        assert_eq!(result.exit_code, 0);
        assert!(result.stdout.contains("/tmp") || result.stdout.contains("/private/tmp"));
    }

    #[tokio::test]
    async fn test_host_executor_stdin() {
        let executor = HostExecutor::new();

        let cmd = ExecutionCommand::new("cat", vec![]).with_stdin("piped through");

        let result = executor.execute(cmd).await.unwrap();
        assert_eq!(result.stdout, "piped through");
    }

    #[tokio::test]
    async fn test_host_executor_timeout() {
        let executor = HostExecutor::new();

        let cmd = ExecutionCommand::new("sleep", vec!["2".to_string()])
            .with_timeout(std::time::Duration::from_millis(100));

        let result = executor.execute(cmd).await;
        assert!(matches!(result.unwrap_err(), ExecutorError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_host_executor_missing_tool() {
        let executor = HostExecutor::new();

        let cmd = ExecutionCommand::new("definitely-not-a-real-tool-vmtpl", vec![]);

        let result = executor.execute(cmd).await;
        assert!(matches!(result.unwrap_err(), ExecutorError::ToolNotFound(_)));
    }

    #[test]
    fn test_host_executor_type() {
        let executor = HostExecutor::new();
        assert_eq!(executor.executor_type(), "host");
    }
}
