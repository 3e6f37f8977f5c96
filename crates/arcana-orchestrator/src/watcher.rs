//! Turns free-text observations into tasks through a rule table.

use crate::journal::EventJournal;
use crate::task_store::TaskStore;
use crate::types::{NewTask, TaskPriority, TAG_AUTO_GENERATED};
use arcana_core::extract_observations;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

const ACTOR: &str = "observation_watcher";

/// A rule's target: a single agent or several.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AgentTargets {
    One(String),
    Many(Vec<String>),
}

impl AgentTargets {
    pub fn as_slice(&self) -> &[String] {
        match self {
            AgentTargets::One(agent) => std::slice::from_ref(agent),
            AgentTargets::Many(agents) => agents,
        }
    }
}

/// Maps observations containing any of `patterns` to a task for each target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchRule {
    pub name: String,
    /// Case-insensitive substrings.
    pub patterns: Vec<String>,
    #[serde(alias = "agent")]
    pub agents: AgentTargets,
    #[serde(default)]
    pub priority: TaskPriority,
    /// Task description; `{observation}` is replaced by the observation text.
    pub template: String,
}

impl WatchRule {
    /// `lowered` must already be lower-cased.
    pub fn matches(&self, lowered: &str) -> bool {
        self.patterns
            .iter()
            .any(|p| !p.is_empty() && lowered.contains(&p.to_lowercase()))
    }

    pub fn render(&self, observation: &str) -> String {
        self.template.replace("{observation}", observation)
    }
}

/// Entry of the self-improvement catalogue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaintenanceTask {
    pub description: String,
    pub agent: String,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WatcherStats {
    pub events_processed: u64,
    pub observations_processed: u64,
    pub tasks_generated: u64,
    pub last_activity: Option<DateTime<Utc>>,
    pub rules_loaded: usize,
}

/// Matches observations against an ordered rule table and queues the
/// resulting work, skipping anything an agent already has queued.
pub struct ObservationWatcher {
    store: Arc<TaskStore>,
    rules: RwLock<Vec<WatchRule>>,
    maintenance: Vec<MaintenanceTask>,
    stats: Mutex<WatcherStats>,
    journal: Option<Arc<EventJournal>>,
}

impl ObservationWatcher {
    pub fn new(store: Arc<TaskStore>, rules: Vec<WatchRule>) -> Self {
        Self {
            store,
            rules: RwLock::new(rules),
            maintenance: Vec::new(),
            stats: Mutex::new(WatcherStats::default()),
            journal: None,
        }
    }

    /// Catalogue used by [`Self::inject_self_improvement_tasks`].
    pub fn with_maintenance(mut self, tasks: Vec<MaintenanceTask>) -> Self {
        self.maintenance = tasks;
        self
    }

    pub fn with_journal(mut self, journal: Arc<EventJournal>) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Add a rule at the end of the table, or replace the rule with the same
    /// name in place.
    pub fn add_rule(&self, rule: WatchRule) {
        let mut rules = self.rules.write();
        info!(rule = %rule.name, "Added watch rule");
        match rules.iter_mut().find(|r| r.name == rule.name) {
            Some(existing) => *existing = rule,
            None => rules.push(rule),
        }
    }

    pub fn rules(&self) -> Vec<WatchRule> {
        self.rules.read().clone()
    }

    /// Generate tasks for one observation. Returns the ids created.
    ///
    /// Only the first matching rule fires.
    pub async fn process_observation(&self, text: &str) -> Vec<Uuid> {
        let text = text.trim();
        if text.is_empty() {
            return Vec::new();
        }
        self.touch(|s| s.observations_processed += 1);

        let lowered = text.to_lowercase();
        let Some(rule) = self
            .rules
            .read()
            .iter()
            .find(|r| r.matches(&lowered))
            .cloned()
        else {
            debug!(observation = %text, "No rule matched observation");
            return Vec::new();
        };

        let description = rule.render(text);
        let mut created = Vec::new();
        for agent in rule.agents.as_slice() {
            let spec = NewTask::new(description.clone(), agent.clone())
                .with_priority(rule.priority)
                .with_context("source", serde_json::json!(ACTOR))
                .with_context("observation", serde_json::json!(text))
                .with_context("rule", serde_json::json!(rule.name))
                .with_context(TAG_AUTO_GENERATED, serde_json::json!(true))
                .with_tags([TAG_AUTO_GENERATED, rule.name.as_str()]);
            match self.store.add_task_if_new(spec).await {
                Some(id) => {
                    info!(task_id = %id, agent = %agent, rule = %rule.name, "Generated task from observation");
                    created.push(id);
                }
                None => debug!(agent = %agent, rule = %rule.name, "Skipped duplicate observation task"),
            }
        }

        self.touch(|s| s.tasks_generated += created.len() as u64);
        if let Some(journal) = &self.journal {
            journal.record(
                "observation_processed",
                ACTOR,
                serde_json::json!({"rule": rule.name, "tasks_created": created}),
            );
        }
        created
    }

    /// Process every observation carried by an ingestion event.
    pub async fn process_event(&self, event: &serde_json::Value) -> Vec<Uuid> {
        self.touch(|s| s.events_processed += 1);
        let mut created = Vec::new();
        for observation in extract_observations(event) {
            created.extend(self.process_observation(&observation).await);
        }
        created
    }

    /// Queue every catalogue entry that has no similar active task yet.
    /// Returns how many were created.
    pub async fn inject_self_improvement_tasks(&self) -> usize {
        let mut created = 0;
        for entry in &self.maintenance {
            let spec = NewTask::new(entry.description.clone(), entry.agent.clone())
                .with_priority(entry.priority)
                .with_context("source", serde_json::json!("self_improvement"))
                .with_context(TAG_AUTO_GENERATED, serde_json::json!(true))
                .with_tags(entry.tags.iter().map(String::as_str));
            if self.store.add_task_if_new(spec).await.is_some() {
                created += 1;
            }
        }

        self.touch(|s| s.tasks_generated += created as u64);
        info!(created, "Injected self-improvement tasks");
        if let Some(journal) = &self.journal {
            journal.record(
                "self_improvement_injected",
                ACTOR,
                serde_json::json!({"created": created}),
            );
        }
        created
    }

    pub fn stats(&self) -> WatcherStats {
        let mut stats = self.stats.lock().clone();
        stats.rules_loaded = self.rules.read().len();
        stats
    }

    fn touch(&self, update: impl FnOnce(&mut WatcherStats)) {
        let mut stats = self.stats.lock();
        update(&mut stats);
        stats.last_activity = Some(Utc::now());
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::catalog;
    use crate::task_store::StoreOptions;
    use crate::types::TaskStatus;

    fn watcher() -> (Arc<TaskStore>, ObservationWatcher) {
        let store = Arc::new(TaskStore::in_memory(StoreOptions::default()));
        let watcher = ObservationWatcher::new(store.clone(), catalog::default_rules())
            .with_maintenance(catalog::default_maintenance());
        (store, watcher)
    }

    #[tokio::test]
    async fn test_first_matching_rule_only() {
        let (store, watcher) = watcher();
        // matches ui_issues ("layout broken") and performance ("slow")
        let ids = watcher
            .process_observation("Layout broken and slow on the reading page")
            .await;
        assert_eq!(ids.len(), 1);

        let task = store.get(ids[0]).await.unwrap();
        assert_eq!(task.agent, "UIEnchanter");
        assert_eq!(task.priority, TaskPriority::High);
        assert_eq!(
            task.description,
            "Fix UI issue: Layout broken and slow on the reading page"
        );
        assert!(task.has_tag(TAG_AUTO_GENERATED));
        assert!(task.has_tag("ui_issues"));
        assert_eq!(task.context["rule"], "ui_issues");
        assert_eq!(task.context["source"], ACTOR);
    }

    #[tokio::test]
    async fn test_multi_agent_rule() {
        let (store, watcher) = watcher();
        let ids = watcher
            .process_observation("User in spiritual crisis asking for help")
            .await;
        assert_eq!(ids.len(), 3);
        let mut agents: Vec<String> = Vec::new();
        for id in ids {
            agents.push(store.get(id).await.unwrap().agent);
        }
        agents.sort();
        assert_eq!(agents, vec!["Luna", "Sol", "Sophia"]);
    }

    #[tokio::test]
    async fn test_duplicate_observation_skipped() {
        let (store, watcher) = watcher();
        assert_eq!(
            watcher
                .process_observation("database error on checkout")
                .await
                .len(),
            1
        );
        assert!(watcher
            .process_observation("Database error on checkout")
            .await
            .is_empty());
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_finished_task_does_not_block_new_one() {
        let (store, watcher) = watcher();
        let first = watcher.process_observation("database error on checkout").await[0];
        store.next_task_for_agent("DataOracle", &[]).await.unwrap();
        store.mark_completed(first, Some("fixed"), None).await.unwrap();
        assert_eq!(
            watcher
                .process_observation("database error on checkout")
                .await
                .len(),
            1
        );
        let statuses: Vec<TaskStatus> = store.tasks().await.iter().map(|t| t.status).collect();
        assert_eq!(statuses, vec![TaskStatus::Completed, TaskStatus::Pending]);
    }

    #[tokio::test]
    async fn test_no_match() {
        let (store, watcher) = watcher();
        assert!(watcher
            .process_observation("everything is fine today")
            .await
            .is_empty());
        assert!(watcher.process_observation("   ").await.is_empty());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_add_rule_at_runtime() {
        let (store, watcher) = watcher();
        watcher.add_rule(WatchRule {
            name: "billing".into(),
            patterns: vec!["refund".into()],
            agents: AgentTargets::One("QualityGuardian".into()),
            priority: TaskPriority::Critical,
            template: "Handle billing: {observation}".into(),
        });
        let ids = watcher.process_observation("Refund request stuck").await;
        let task = store.get(ids[0]).await.unwrap();
        assert_eq!(task.priority, TaskPriority::Critical);
        assert_eq!(watcher.stats().rules_loaded, 10);
    }

    #[tokio::test]
    async fn test_batched_event() {
        let (store, watcher) = watcher();
        let event = serde_json::json!([
            {"observation_content": "layout broken on mobile"},
            {"payload": {"error": "database error while saving"}},
            {"payload": {"observation": "nothing actionable"}},
        ]);
        let ids = watcher.process_event(&event).await;
        assert_eq!(ids.len(), 2);
        assert_eq!(store.len().await, 2);

        let stats = watcher.stats();
        assert_eq!(stats.events_processed, 1);
        assert_eq!(stats.observations_processed, 3);
        assert_eq!(stats.tasks_generated, 2);
        assert!(stats.last_activity.is_some());
    }

    #[tokio::test]
    async fn test_self_improvement_injection_is_deduplicated() {
        let (store, watcher) = watcher();
        assert_eq!(watcher.inject_self_improvement_tasks().await, 5);
        assert_eq!(watcher.inject_self_improvement_tasks().await, 0);
        assert_eq!(store.len().await, 5);
        assert!(store.tasks().await.iter().all(|t| t.is_auto_generated()));
    }

    #[test]
    fn test_rule_accepts_single_agent_key() {
        let rule: WatchRule = toml::from_str(
            r#"
            name = "ops"
            patterns = ["disk full"]
            agent = "QualityGuardian"
            priority = "high"
            template = "Free disk: {observation}"
            "#,
        )
        .unwrap();
        assert_eq!(rule.agents.as_slice(), ["QualityGuardian".to_string()]);
    }
}
