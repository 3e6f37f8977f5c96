//! The agent executor seam.
//!
//! The scheduler knows nothing about what an agent actually does; it hands a
//! claimed task to an [`AgentExecutor`] together with a cancellation token that
//! fires when the dispatch deadline passes or the loop shuts down.

use crate::types::Task;
use arcana_core::{ArcanaError, ArcanaResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What an agent reported back for one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
}

impl ExecutionOutcome {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: Some(error.into()),
        }
    }
}

/// Runs a task on behalf of its agent.
///
/// Implementations should stop work promptly once `cancel` fires; the
/// scheduler has already recorded the attempt as failed by then.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    async fn execute(&self, task: &Task, cancel: CancellationToken)
        -> ArcanaResult<ExecutionOutcome>;
}

/// Executes each agent as a shell command.
///
/// The command receives the task as JSON on stdin and `ARCANA_TASK_ID` /
/// `ARCANA_AGENT` in its environment. Exit status 0 with stdout is success;
/// anything else is a failure carrying stderr.
pub struct CommandExecutor {
    commands: HashMap<String, String>,
    fallback: Option<String>,
}

impl CommandExecutor {
    pub fn new(commands: HashMap<String, String>) -> Self {
        Self {
            commands,
            fallback: None,
        }
    }

    /// Command used for agents without their own entry.
    pub fn with_fallback(mut self, command: impl Into<String>) -> Self {
        self.fallback = Some(command.into());
        self
    }

    fn command_for(&self, agent: &str) -> Option<&str> {
        self.commands
            .get(agent)
            .or(self.fallback.as_ref())
            .map(String::as_str)
    }
}

#[async_trait]
impl AgentExecutor for CommandExecutor {
    async fn execute(
        &self,
        task: &Task,
        cancel: CancellationToken,
    ) -> ArcanaResult<ExecutionOutcome> {
        let Some(command) = self.command_for(&task.agent) else {
            return Ok(ExecutionOutcome::failure(format!(
                "no command configured for agent '{}'",
                task.agent
            )));
        };
        info!(agent = %task.agent, task_id = %task.id, command = %command, "Executing agent command");

        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .env("ARCANA_TASK_ID", task.id.to_string())
            .env("ARCANA_AGENT", &task.agent)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ArcanaError::AgentExecution(format!("failed to spawn: {e}")))?;

        // Written concurrently with reading stdout, so a command that echoes
        // more than a pipe buffer before draining stdin cannot stall.
        let payload = serde_json::to_vec(task)?;
        let task_id = task.id;
        let writer = child.stdin.take().map(|mut stdin| {
            tokio::spawn(async move {
                // The command may exit without reading its input.
                if let Err(e) = stdin.write_all(&payload).await {
                    debug!(task_id = %task_id, error = %e, "Agent command closed stdin early");
                }
            })
        });

        let result = tokio::select! {
            output = child.wait_with_output() => {
                let output = output?;
                let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
                let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                if output.status.success() {
                    Ok(ExecutionOutcome::success(stdout))
                } else {
                    let code = output.status.code().unwrap_or(-1);
                    let detail = if stderr.is_empty() { stdout } else { stderr };
                    Ok(ExecutionOutcome::failure(format!("exit code {code}: {detail}")))
                }
            }
            _ = cancel.cancelled() => {
                warn!(task_id = %task.id, "Agent command cancelled");
                Err(ArcanaError::AgentExecution("cancelled".into()))
            }
        };
        if let Some(writer) = writer {
            writer.abort();
        }
        result
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::task_store::{StoreOptions, TaskStore};
    use crate::types::NewTask;
    use std::time::Duration;

    async fn sample_task(agent: &str) -> Task {
        let store = TaskStore::in_memory(StoreOptions::default());
        let id = store
            .add_task(NewTask::new("Calculate planetary positions", agent))
            .await;
        store.get(id).await.unwrap()
    }

    #[tokio::test]
    async fn test_task_json_on_stdin() {
        let executor = CommandExecutor::new(HashMap::from([(
            "AstroCalculus".to_string(),
            "cat".to_string(),
        )]));
        let task = sample_task("AstroCalculus").await;
        let outcome = executor
            .execute(&task, CancellationToken::new())
            .await
            .unwrap();
        assert!(outcome.success);
        let echoed: Task = serde_json::from_str(&outcome.output).unwrap();
        assert_eq!(echoed.id, task.id);
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_failure() {
        let executor =
            CommandExecutor::new(HashMap::new()).with_fallback("echo broken >&2; exit 3");
        let task = sample_task("Anyone").await;
        let outcome = executor
            .execute(&task, CancellationToken::new())
            .await
            .unwrap();
        assert!(!outcome.success);
        let error = outcome.error.unwrap();
        assert!(error.contains("exit code 3"));
        assert!(error.contains("broken"));
    }

    #[tokio::test]
    async fn test_unknown_agent() {
        let executor = CommandExecutor::new(HashMap::new());
        let task = sample_task("Ghost").await;
        let outcome = executor
            .execute(&task, CancellationToken::new())
            .await
            .unwrap();
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("Ghost"));
    }

    #[tokio::test]
    async fn test_large_payload_echoed_without_stalling() {
        let executor = CommandExecutor::new(HashMap::new()).with_fallback("cat");
        let store = TaskStore::in_memory(StoreOptions::default());
        let description = "retrograde ".repeat(30_000);
        let id = store
            .add_task(NewTask::new(description.clone(), "ContentAlchemist"))
            .await;
        let task = store.get(id).await.unwrap();

        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            executor.execute(&task, CancellationToken::new()),
        )
        .await
        .expect("command stalled on a full pipe")
        .unwrap();
        assert!(outcome.success);
        let echoed: Task = serde_json::from_str(&outcome.output).unwrap();
        assert_eq!(echoed.description, description);
    }

    #[tokio::test]
    async fn test_cancellation_stops_command() {
        let executor = CommandExecutor::new(HashMap::new()).with_fallback("sleep 30");
        let task = sample_task("Sleepy").await;
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let err = executor.execute(&task, cancel).await.unwrap_err();
        assert!(matches!(err, ArcanaError::AgentExecution(_)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
