use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use uuid::Uuid;

/// Default retry budget for a task before it escalates.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default expected-output text attached to new tasks.
pub const DEFAULT_EXPECTED_OUTPUT: &str = "Task completed successfully";

/// Tag carried by every task the watcher or the maintenance catalogue creates.
pub const TAG_AUTO_GENERATED: &str = "auto_generated";
/// Tag carried by collaboration tasks.
pub const TAG_COLLABORATION: &str = "collaboration";
/// Tag carried by escalation tasks.
pub const TAG_ESCALATION: &str = "escalation";

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Blocked,
    Completed,
    /// Retries exhausted with no escalation target.
    Failed,
    Escalated,
}

impl TaskStatus {
    /// Completed, Failed and Escalated never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Escalated
        )
    }

    /// Pending or InProgress.
    pub fn is_active(self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::InProgress)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Escalated => "escalated",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Dispatch precedence. Higher values are dispatched first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Background = 1,
    Low = 2,
    #[default]
    Medium = 3,
    High = 4,
    Critical = 5,
}

impl TaskPriority {
    pub fn value(self) -> u8 {
        self as u8
    }
}

impl std::fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskPriority::Background => write!(f, "background"),
            TaskPriority::Low => write!(f, "low"),
            TaskPriority::Medium => write!(f, "medium"),
            TaskPriority::High => write!(f, "high"),
            TaskPriority::Critical => write!(f, "critical"),
        }
    }
}

impl FromStr for TaskPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "background" | "1" => Ok(TaskPriority::Background),
            "low" | "2" => Ok(TaskPriority::Low),
            "medium" | "3" => Ok(TaskPriority::Medium),
            "high" | "4" => Ok(TaskPriority::High),
            "critical" | "5" => Ok(TaskPriority::Critical),
            other => Err(format!("unknown priority '{other}'")),
        }
    }
}

/// A unit of work in the persistent pool.
///
/// The `agent` field is fixed at creation. Re-routing creates a new task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub description: String,
    pub agent: String,
    pub status: TaskStatus,
    pub priority: TaskPriority,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default = "default_expected_output")]
    pub expected_output: String,
    #[serde(default)]
    pub context: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub dependencies: Vec<Uuid>,
    #[serde(default)]
    pub assigned_to: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub failure_count: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub escalation_agent: Option<String>,
    #[serde(default)]
    pub output_file: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Estimated duration in minutes.
    #[serde(default)]
    pub estimated_duration: Option<u32>,
}

fn default_expected_output() -> String {
    DEFAULT_EXPECTED_OUTPUT.to_string()
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

impl Task {
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    pub fn has_any_tag(&self, tags: &[String]) -> bool {
        tags.iter().any(|t| self.has_tag(t))
    }

    /// Created by the observation watcher or the maintenance catalogue.
    pub fn is_auto_generated(&self) -> bool {
        self.has_tag(TAG_AUTO_GENERATED)
            || self
                .context
                .get(TAG_AUTO_GENERATED)
                .and_then(serde_json::Value::as_bool)
                .unwrap_or(false)
    }

    /// Errors accumulated in the context by failed attempts.
    pub fn errors(&self) -> Vec<TaskError> {
        self.context
            .get("errors")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }

    /// The output recorded on completion.
    pub fn output(&self) -> Option<&str> {
        self.context.get("output").and_then(serde_json::Value::as_str)
    }
}

/// Input to [`crate::TaskStore::add_task`].
///
/// Everything except description and agent is optional; the store assigns
/// the id, the timestamps and the initial `Pending` status.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewTask {
    pub description: String,
    pub agent: String,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub expected_output: Option<String>,
    #[serde(default)]
    pub context: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub dependencies: Vec<Uuid>,
    #[serde(default)]
    pub escalation_agent: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Falls back to the store's configured default when unset.
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub output_file: Option<String>,
    #[serde(default)]
    pub estimated_duration: Option<u32>,
}

impl NewTask {
    pub fn new(description: impl Into<String>, agent: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            agent: agent.into(),
            ..Self::default()
        }
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_expected_output(mut self, expected: impl Into<String>) -> Self {
        self.expected_output = Some(expected.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    pub fn with_dependencies(mut self, deps: Vec<Uuid>) -> Self {
        self.dependencies = deps;
        self
    }

    pub fn with_escalation_agent(mut self, agent: impl Into<String>) -> Self {
        self.escalation_agent = Some(agent.into());
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_output_file(mut self, path: impl Into<String>) -> Self {
        self.output_file = Some(path.into());
        self
    }

    pub fn with_estimated_duration(mut self, minutes: u32) -> Self {
        self.estimated_duration = Some(minutes);
        self
    }
}

/// One failed attempt, appended to `context["errors"]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskError {
    pub timestamp: DateTime<Utc>,
    pub error: String,
    #[serde(default = "default_error_kind")]
    pub kind: String,
}

fn default_error_kind() -> String {
    "error".to_string()
}

/// Why a dispatch failed, as recorded against the task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    pub message: String,
    pub kind: String,
}

impl TaskFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: default_error_kind(),
        }
    }
}

impl From<&arcana_core::ArcanaError> for TaskFailure {
    fn from(err: &arcana_core::ArcanaError) -> Self {
        Self {
            message: err.to_string(),
            kind: err.kind().to_string(),
        }
    }
}

/// Audit entry appended whenever one agent asks another for help.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollaborationRecord {
    pub timestamp: DateTime<Utc>,
    pub requesting_agent: String,
    pub helper_agent: String,
    pub task_id: Uuid,
    pub description: String,
}

/// Persisted per-agent aggregate counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentStats {
    pub completed: u64,
    pub failed: u64,
    pub total_time_minutes: f64,
}

/// Derived per-agent workload, computed on demand from the task collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentWorkload {
    pub agent: String,
    pub pending_tasks: usize,
    pub in_progress_tasks: usize,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    pub total_time_minutes: f64,
    pub average_task_time: f64,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(TaskPriority::Critical > TaskPriority::High);
        assert!(TaskPriority::High > TaskPriority::Medium);
        assert!(TaskPriority::Low > TaskPriority::Background);
        assert_eq!(TaskPriority::High.value(), 4);
    }

    #[test]
    fn test_priority_parse() {
        assert_eq!("HIGH".parse::<TaskPriority>().unwrap(), TaskPriority::High);
        assert_eq!("1".parse::<TaskPriority>().unwrap(), TaskPriority::Background);
        assert!("urgent".parse::<TaskPriority>().is_err());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Escalated.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Blocked.is_terminal());
        assert!(TaskStatus::InProgress.is_active());
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&TaskStatus::InProgress).unwrap();
        assert_eq!(json, "\"in_progress\"");
        let parsed: TaskStatus = serde_json::from_str("\"escalated\"").unwrap();
        assert_eq!(parsed, TaskStatus::Escalated);
    }

    #[test]
    fn test_task_defaults_on_sparse_record() {
        let raw = serde_json::json!({
            "id": Uuid::new_v4(),
            "description": "Fix card rotation bug",
            "agent": "UIEnchanter",
            "status": "pending",
            "priority": "medium",
            "created_at": Utc::now(),
            "updated_at": Utc::now(),
        });
        let task: Task = serde_json::from_value(raw).unwrap();
        assert_eq!(task.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(task.expected_output, DEFAULT_EXPECTED_OUTPUT);
        assert!(task.dependencies.is_empty());
        assert!(task.errors().is_empty());
    }

    #[test]
    fn test_new_task_builder() {
        let spec = NewTask::new("Generate daily content", "ContentAlchemist")
            .with_priority(TaskPriority::High)
            .with_tags(["daily"])
            .with_escalation_agent("QualityGuardian")
            .with_max_retries(5);
        assert_eq!(spec.priority, TaskPriority::High);
        assert_eq!(spec.tags, vec!["daily".to_string()]);
        assert_eq!(spec.max_retries, Some(5));
    }

    #[test]
    fn test_failure_from_error_carries_kind() {
        let failure = TaskFailure::from(&arcana_core::ArcanaError::DispatchTimeout(30));
        assert_eq!(failure.kind, "dispatch_timeout");
        assert!(failure.message.contains("30s"));
    }
}
