//! Threshold-based retry and escalation.

use crate::types::{NewTask, Task, TaskPriority, TAG_ESCALATION};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What happens to a task after a failed attempt has been counted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureDecision {
    /// Back to `Pending` for another attempt.
    Retry,
    /// Terminal `Escalated`; a child task goes to `target`.
    Escalate { target: String },
    /// Terminal `Failed`; retries are exhausted and there is nobody to hand it to.
    GiveUp,
}

/// Decide the next state from the (already incremented) failure counter.
///
/// With `escalate == false` the task always goes back to the pool.
pub fn decide(
    failure_count: u32,
    max_retries: u32,
    escalate: bool,
    escalation_agent: Option<&str>,
) -> FailureDecision {
    if !escalate || failure_count < max_retries {
        return FailureDecision::Retry;
    }
    match escalation_agent {
        Some(target) if !target.trim().is_empty() => FailureDecision::Escalate {
            target: target.to_string(),
        },
        _ => FailureDecision::GiveUp,
    }
}

/// Result of [`crate::TaskStore::mark_failed`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FailureOutcome {
    /// Returned to the pool.
    Retrying { attempt: u32, max_retries: u32 },
    /// Escalated; `escalation_task` is the child created for the target agent.
    Escalated { escalation_task: Uuid },
    /// Terminal failure without escalation target.
    Failed,
    /// The task was already terminal; nothing changed.
    Ignored,
}

/// Build the child task handed to the escalation target.
///
/// It references the original id and carries every accumulated error.
pub fn escalation_task(original: &Task, target: &str) -> NewTask {
    let errors = original.errors();
    let error_lines: Vec<String> = errors
        .iter()
        .map(|e| format!("- [{}] {}", e.kind, e.error))
        .collect();
    let description = format!(
        "ESCALATED: {}\n\nOriginal task failed {} times.\nErrors:\n{}",
        original.description,
        original.failure_count,
        error_lines.join("\n")
    );

    NewTask::new(description, target)
        .with_priority(TaskPriority::High.max(original.priority))
        .with_context("original_task_id", serde_json::json!(original.id))
        .with_context("original_agent", serde_json::json!(original.agent))
        .with_context("escalation", serde_json::json!(true))
        .with_context(
            "errors",
            serde_json::to_value(&errors).unwrap_or(serde_json::Value::Null),
        )
        .with_tags([TAG_ESCALATION])
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_below_threshold() {
        assert_eq!(decide(1, 3, true, Some("Boss")), FailureDecision::Retry);
        assert_eq!(decide(2, 3, true, Some("Boss")), FailureDecision::Retry);
    }

    #[test]
    fn test_escalate_at_threshold() {
        assert_eq!(
            decide(3, 3, true, Some("Boss")),
            FailureDecision::Escalate {
                target: "Boss".into()
            }
        );
    }

    #[test]
    fn test_give_up_without_target() {
        assert_eq!(decide(3, 3, true, None), FailureDecision::GiveUp);
        assert_eq!(decide(4, 3, true, Some("  ")), FailureDecision::GiveUp);
    }

    #[test]
    fn test_no_escalate_always_retries() {
        assert_eq!(decide(10, 3, false, Some("Boss")), FailureDecision::Retry);
    }

    #[test]
    fn test_outcome_serialization() {
        let json = serde_json::to_value(FailureOutcome::Retrying {
            attempt: 1,
            max_retries: 3,
        })
        .unwrap();
        assert_eq!(json["outcome"], "retrying");
        assert_eq!(json["attempt"], 1);
    }
}
