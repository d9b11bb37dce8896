//! Scripted command execution.
//!
//! [`ScriptedExecutor`] never touches the host. Each call is matched against
//! rules keyed by an argv prefix; the first matching rule produces the
//! result. Unmatched commands succeed with empty output. Every call is
//! recorded so callers can assert on what would have been run.

use super::{CommandExecutor, ExecutionCommand, ExecutionResult, ExecutorError};
use async_trait::async_trait;
use std::sync::Mutex;

type Responder = Box<dyn Fn(&ExecutionCommand) -> ExecutionResult + Send + Sync>;

struct Rule {
    prefix: Vec<String>,
    responder: Responder,
}

/// Executor answering from scripted rules
#[derive(Default)]
pub struct ScriptedExecutor {
    rules: Vec<Rule>,
    calls: Mutex<Vec<ExecutionCommand>>,
}

impl std::fmt::Debug for ScriptedExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedExecutor")
            .field("rules", &self.rules.len())
            .field("calls", &self.calls().len())
            .finish()
    }
}

impl ScriptedExecutor {
    /// Create an executor with no rules
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer commands starting with `prefix` with the given stdout
    pub fn on(self, prefix: &[&str], stdout: impl Into<String>) -> Self {
        let stdout = stdout.into();
        self.on_with(prefix, move |_| ExecutionResult::ok(stdout.clone()))
    }

    /// Fail commands starting with `prefix`
    pub fn fail(self, prefix: &[&str], exit_code: i32, stderr: impl Into<String>) -> Self {
        let stderr = stderr.into();
        self.on_with(prefix, move |_| {
            ExecutionResult::failed(exit_code, stderr.clone())
        })
    }

    /// Answer commands starting with `prefix` with a closure
    ///
    /// The closure may have side effects (for example creating the output
    /// file a conversion tool would write).
    pub fn on_with<F>(mut self, prefix: &[&str], responder: F) -> Self
    where
        F: Fn(&ExecutionCommand) -> ExecutionResult + Send + Sync + 'static,
    {
        self.rules.push(Rule {
            prefix: prefix.iter().map(|p| p.to_string()).collect(),
            responder: Box::new(responder),
        });
        self
    }

    /// All commands executed so far
    pub fn calls(&self) -> Vec<ExecutionCommand> {
        self.calls
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }

    /// Commands executed so far whose argv starts with `prefix`
    pub fn calls_matching(&self, prefix: &[&str]) -> Vec<ExecutionCommand> {
        self.calls()
            .into_iter()
            .filter(|call| starts_with(call, prefix))
            .collect()
    }
}

fn starts_with<S: AsRef<str>>(command: &ExecutionCommand, prefix: &[S]) -> bool {
    let argv = command.argv();
    argv.len() >= prefix.len()
        && argv
            .iter()
            .zip(prefix.iter())
            .all(|(arg, expected)| *arg == expected.as_ref())
}

#[async_trait]
impl CommandExecutor for ScriptedExecutor {
    async fn execute(&self, command: ExecutionCommand) -> Result<ExecutionResult, ExecutorError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(command.clone());
        }

        let result = self
            .rules
            .iter()
            .find(|rule| starts_with(&command, &rule.prefix))
            .map(|rule| (rule.responder)(&command))
            .unwrap_or_default();

        Ok(result)
    }

    fn executor_type(&self) -> &'static str {
        "scripted"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_matching_rule_wins() {
        let executor = ScriptedExecutor::new()
            .on(&["virsh", "list"], "web\ndb\n")
            .on(&["virsh"], "fallback");

        let listed = executor
            .execute(ExecutionCommand::from_parts("virsh", &["list", "--all"]))
            .await
            .unwrap();
        assert_eq!(listed.stdout, "web\ndb\n");

        let other = executor
            .execute(ExecutionCommand::from_parts("virsh", &["dumpxml", "web"]))
            .await
            .unwrap();
        assert_eq!(other.stdout, "fallback");
    }

    #[tokio::test]
    async fn test_unmatched_commands_succeed_and_are_recorded() {
        let executor = ScriptedExecutor::new();

        let result = executor
            .execute(ExecutionCommand::from_parts("vzctl", &["start", "101"]))
            .await
            .unwrap();

        assert!(result.success());
        assert_eq!(executor.calls().len(), 1);
        assert_eq!(executor.calls_matching(&["vzctl", "start"]).len(), 1);
        assert!(executor.calls_matching(&["vzctl", "stop"]).is_empty());
    }
}
