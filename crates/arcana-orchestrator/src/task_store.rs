use crate::journal::EventJournal;
use crate::retry::{self, FailureDecision, FailureOutcome};
use crate::selection;
use crate::similarity;
use crate::types::{
    AgentStats, AgentWorkload, CollaborationRecord, NewTask, Task, TaskError, TaskFailure,
    TaskPriority, TaskStatus, DEFAULT_EXPECTED_OUTPUT, DEFAULT_MAX_RETRIES, TAG_COLLABORATION,
};
use arcana_core::{ArcanaError, ArcanaResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Format version written into new pool files.
pub const POOL_VERSION: &str = "1.0";

const REQUIRED_KEYS: [&str; 4] = ["tasks", "metadata", "agent_stats", "collaboration_history"];
const ACTOR: &str = "task_store";

/// Pool-level bookkeeping persisted next to the tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolMetadata {
    pub created_at: DateTime<Utc>,
    pub version: String,
    #[serde(default)]
    pub total_tasks_created: u64,
    #[serde(default)]
    pub total_tasks_completed: u64,
    #[serde(default)]
    pub last_cleanup: Option<DateTime<Utc>>,
}

impl Default for PoolMetadata {
    fn default() -> Self {
        Self {
            created_at: Utc::now(),
            version: POOL_VERSION.to_string(),
            total_tasks_created: 0,
            total_tasks_completed: 0,
            last_cleanup: None,
        }
    }
}

/// The whole persisted pool: tasks, metadata, agent counters and the
/// collaboration log.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolDocument {
    pub tasks: BTreeMap<Uuid, Task>,
    pub metadata: PoolMetadata,
    pub agent_stats: BTreeMap<String, AgentStats>,
    pub collaboration_history: Vec<CollaborationRecord>,
}

impl PoolDocument {
    /// Parse and validate a pool file.
    ///
    /// A missing top-level key or unparsable JSON is `StoreCorrupted`.
    /// Malformed individual entries are dropped; their count is returned.
    pub fn from_json(raw: &str) -> ArcanaResult<(Self, usize)> {
        let value: serde_json::Value = serde_json::from_str(raw)
            .map_err(|e| ArcanaError::StoreCorrupted(format!("invalid JSON: {e}")))?;
        let root = value
            .as_object()
            .ok_or_else(|| ArcanaError::StoreCorrupted("pool root is not an object".into()))?;

        if let Some(missing) = REQUIRED_KEYS.iter().find(|k| !root.contains_key(**k)) {
            return Err(ArcanaError::StoreCorrupted(format!(
                "missing required key '{missing}'"
            )));
        }

        let mut dropped = 0;
        let mut doc = PoolDocument::default();

        match &root["tasks"] {
            serde_json::Value::Object(entries) => {
                for (key, entry) in entries {
                    match serde_json::from_value::<Task>(entry.clone()) {
                        Ok(task) => {
                            doc.tasks.insert(task.id, task);
                        }
                        Err(e) => {
                            warn!(task_id = %key, error = %e, "Dropping malformed task entry");
                            dropped += 1;
                        }
                    }
                }
            }
            _ => return Err(ArcanaError::StoreCorrupted("'tasks' is not an object".into())),
        }

        match serde_json::from_value::<PoolMetadata>(root["metadata"].clone()) {
            Ok(metadata) => doc.metadata = metadata,
            Err(e) => warn!(error = %e, "Malformed pool metadata, resetting"),
        }

        if let serde_json::Value::Object(entries) = &root["agent_stats"] {
            for (agent, stats) in entries {
                match serde_json::from_value::<AgentStats>(stats.clone()) {
                    Ok(stats) => {
                        doc.agent_stats.insert(agent.clone(), stats);
                    }
                    Err(_) => dropped += 1,
                }
            }
        }

        if let serde_json::Value::Array(records) = &root["collaboration_history"] {
            for record in records {
                match serde_json::from_value::<CollaborationRecord>(record.clone()) {
                    Ok(record) => doc.collaboration_history.push(record),
                    Err(_) => dropped += 1,
                }
            }
        }

        Ok((doc, dropped))
    }

    fn workload(&self, agent: &str) -> AgentWorkload {
        let mut pending = 0;
        let mut in_progress = 0;
        for task in self.tasks.values().filter(|t| t.agent == agent) {
            match task.status {
                TaskStatus::Pending => pending += 1,
                TaskStatus::InProgress => in_progress += 1,
                _ => {}
            }
        }
        let stats = self.agent_stats.get(agent).cloned().unwrap_or_default();
        AgentWorkload {
            agent: agent.to_string(),
            pending_tasks: pending,
            in_progress_tasks: in_progress,
            completed_tasks: stats.completed,
            failed_tasks: stats.failed,
            total_time_minutes: stats.total_time_minutes,
            average_task_time: stats.total_time_minutes / stats.completed.max(1) as f64,
        }
    }
}

/// Tunables for a file-backed store.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Minimum time between two automatic backups.
    pub backup_interval: Duration,
    /// Number of backup files kept on disk.
    pub max_backups: usize,
    /// Retry budget for tasks that do not set their own.
    pub default_max_retries: u32,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            backup_interval: Duration::from_secs(3600),
            max_backups: 5,
            default_max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

/// Persistence health, surfaced to the scheduler's health check.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreHealth {
    pub healthy: bool,
    pub last_error: Option<String>,
    pub last_persisted_at: Option<DateTime<Utc>>,
    pub last_backup_at: Option<DateTime<Utc>>,
}

/// Read-only snapshot for dashboards and the CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemStatus {
    pub total_tasks: usize,
    pub status_breakdown: BTreeMap<String, usize>,
    pub agent_workloads: BTreeMap<String, AgentWorkload>,
    pub collaboration_requests: usize,
    pub last_cleanup: Option<DateTime<Utc>>,
    pub pool_file_size: u64,
    pub total_tasks_created: u64,
    pub total_tasks_completed: u64,
}

/// What the pool file held the last time this store read or wrote it.
///
/// Counters are kept so changes made by another process can be folded in as
/// deltas instead of overwriting ours.
#[derive(Default)]
struct DiskBase {
    digest: Option<u64>,
    ids: HashSet<Uuid>,
    tasks_created: u64,
    tasks_completed: u64,
    agent_stats: BTreeMap<String, AgentStats>,
}

impl DiskBase {
    fn capture(pool: &PoolDocument, digest: u64) -> Self {
        Self {
            digest: Some(digest),
            ids: pool.tasks.keys().copied().collect(),
            tasks_created: pool.metadata.total_tasks_created,
            tasks_completed: pool.metadata.total_tasks_completed,
            agent_stats: pool.agent_stats.clone(),
        }
    }
}

struct StoreState {
    pool: PoolDocument,
    health: StoreHealth,
    last_backup: Instant,
    last_stamp: Option<DateTime<Utc>>,
    base: DiskBase,
}

impl StoreState {
    fn new(pool: PoolDocument) -> Self {
        let last_stamp = pool.tasks.values().map(|t| t.created_at).max();
        Self {
            pool,
            health: StoreHealth {
                healthy: true,
                ..StoreHealth::default()
            },
            last_backup: Instant::now(),
            last_stamp,
            base: DiskBase::default(),
        }
    }

    /// Fold another writer's version of the pool into ours.
    ///
    /// Tasks present on both sides keep the most recently updated copy. A task
    /// missing on one side was deleted there if the last shared version had
    /// it, and is new otherwise. Counters add the other writer's increments.
    /// Returns the number of tasks taken from `disk`.
    fn merge_external(&mut self, disk: PoolDocument, digest: u64) -> usize {
        let next_base = DiskBase::capture(&disk, digest);
        let StoreState {
            pool, base, last_stamp, ..
        } = self;
        let mut taken = 0;

        pool.tasks
            .retain(|id, _| !base.ids.contains(id) || disk.tasks.contains_key(id));
        for (id, theirs) in disk.tasks {
            let adopt = match pool.tasks.get(&id) {
                Some(ours) => theirs.updated_at > ours.updated_at,
                None => !base.ids.contains(&id),
            };
            if adopt {
                if last_stamp.map_or(true, |last| theirs.created_at > last) {
                    *last_stamp = Some(theirs.created_at);
                }
                pool.tasks.insert(id, theirs);
                taken += 1;
            }
        }

        let metadata = &mut pool.metadata;
        metadata.total_tasks_created += disk
            .metadata
            .total_tasks_created
            .saturating_sub(base.tasks_created);
        metadata.total_tasks_completed += disk
            .metadata
            .total_tasks_completed
            .saturating_sub(base.tasks_completed);
        metadata.last_cleanup = metadata.last_cleanup.max(disk.metadata.last_cleanup);

        for (agent, theirs) in disk.agent_stats {
            let seen = base.agent_stats.get(&agent).cloned().unwrap_or_default();
            let ours = pool.agent_stats.entry(agent).or_default();
            ours.completed += theirs.completed.saturating_sub(seen.completed);
            ours.failed += theirs.failed.saturating_sub(seen.failed);
            ours.total_time_minutes +=
                (theirs.total_time_minutes - seen.total_time_minutes).max(0.0);
        }

        let known: HashSet<Uuid> = pool
            .collaboration_history
            .iter()
            .map(|r| r.task_id)
            .collect();
        pool.collaboration_history.extend(
            disk.collaboration_history
                .into_iter()
                .filter(|r| !known.contains(&r.task_id)),
        );
        pool.collaboration_history.sort_by_key(|r| r.timestamp);

        *base = next_base;
        taken
    }

    /// Strictly increasing creation stamp so age ordering never ties.
    fn next_stamp(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let stamp = match self.last_stamp {
            Some(last) if now <= last => last + chrono::Duration::microseconds(1),
            _ => now,
        };
        self.last_stamp = Some(stamp);
        stamp
    }

    fn insert(&mut self, spec: NewTask, default_max_retries: u32) -> Uuid {
        let now = self.next_stamp();
        let task = Task {
            id: Uuid::new_v4(),
            description: spec.description,
            agent: spec.agent,
            status: TaskStatus::Pending,
            priority: spec.priority,
            created_at: now,
            updated_at: now,
            expected_output: spec
                .expected_output
                .unwrap_or_else(|| DEFAULT_EXPECTED_OUTPUT.to_string()),
            context: spec.context,
            dependencies: spec.dependencies,
            assigned_to: None,
            started_at: None,
            completed_at: None,
            failure_count: 0,
            max_retries: spec.max_retries.unwrap_or(default_max_retries),
            escalation_agent: spec.escalation_agent,
            output_file: spec.output_file,
            tags: spec.tags,
            estimated_duration: spec.estimated_duration,
        };
        let id = task.id;
        info!(
            task_id = %id,
            agent = %task.agent,
            priority = %task.priority,
            description = %similarity::truncate_chars(&task.description, 100),
            "Added task"
        );
        self.pool.tasks.insert(id, task);
        self.pool.metadata.total_tasks_created += 1;
        id
    }

    fn stats_mut(&mut self, agent: &str) -> &mut AgentStats {
        self.pool.agent_stats.entry(agent.to_string()).or_default()
    }
}

/// Durable, single-writer task pool.
///
/// Every mutation takes the write lock, applies the change, and persists the
/// whole pool before releasing it, so claims are exclusive and writes are
/// ordered. Reads share the lock. When a write cannot be persisted the change
/// stays in memory, health turns degraded, and the next write retries.
///
/// Other processes (the CLI next to a running scheduler) may write the same
/// file. Each mutation first re-reads it and merges anything new, so their
/// tasks survive our next write. Two processes mutating within the same few
/// milliseconds can still race; only one of them should claim tasks.
pub struct TaskStore {
    path: Option<PathBuf>,
    options: StoreOptions,
    state: RwLock<StoreState>,
    journal: Option<Arc<EventJournal>>,
}

impl TaskStore {
    /// Open (or create) the pool file at `path`.
    ///
    /// A corrupted file is moved aside and replaced by an empty pool.
    pub async fn open(path: impl Into<PathBuf>, options: StoreOptions) -> ArcanaResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let (pool, read_digest) = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => match PoolDocument::from_json(&raw) {
                Ok((pool, dropped)) => {
                    if dropped > 0 {
                        warn!(dropped, path = %path.display(), "Repaired task pool");
                    }
                    (pool, Some(content_digest(raw.as_bytes())))
                }
                Err(e) => {
                    warn!(error = %e, path = %path.display(), "Task pool corrupted, reinitializing");
                    quarantine(&path).await;
                    (PoolDocument::default(), None)
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "Initialized task pool");
                (PoolDocument::default(), None)
            }
            Err(e) => return Err(e.into()),
        };

        let mut state = StoreState::new(pool);
        if let Some(read_digest) = read_digest {
            state.base = DiskBase::capture(&state.pool, read_digest);
        }
        let store = Self {
            path: Some(path),
            options,
            state: RwLock::new(state),
            journal: None,
        };
        store.flush().await?;
        Ok(store)
    }

    /// A store that never touches disk.
    pub fn in_memory(options: StoreOptions) -> Self {
        Self {
            path: None,
            options,
            state: RwLock::new(StoreState::new(PoolDocument::default())),
            journal: None,
        }
    }

    /// Record every mutation in `journal`.
    pub fn with_journal(mut self, journal: Arc<EventJournal>) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    // --- Mutations ---

    /// Add a new `Pending` task and return its fresh id.
    pub async fn add_task(&self, spec: NewTask) -> Uuid {
        let mut state = self.state.write().await;
        self.sync(&mut state).await;
        let id = state.insert(spec, self.options.default_max_retries);
        let summary = state.pool.tasks.get(&id).map(task_summary);
        self.persist(&mut state).await;
        drop(state);

        self.journal("task_added", summary.unwrap_or_default());
        id
    }

    /// Add `spec` unless its agent already has an active auto-generated task
    /// with a near-duplicate description. Returns `None` when skipped.
    ///
    /// The check and the insert share one write lock.
    pub async fn add_task_if_new(&self, spec: NewTask) -> Option<Uuid> {
        let mut state = self.state.write().await;
        self.sync(&mut state).await;
        if let Some(existing) = find_similar_auto(&state.pool, &spec.agent, &spec.description) {
            debug!(task_id = %existing, agent = %spec.agent, "Similar task already queued");
            return None;
        }
        let id = state.insert(spec, self.options.default_max_retries);
        let summary = state.pool.tasks.get(&id).map(task_summary);
        self.persist(&mut state).await;
        drop(state);

        self.journal("task_added", summary.unwrap_or_default());
        Some(id)
    }

    /// Claim the best eligible task for `agent`, moving it to `InProgress`.
    ///
    /// Selection and transition happen under one write lock, so a task is
    /// claimed by at most one caller.
    pub async fn next_task_for_agent(&self, agent: &str, exclude_tags: &[String]) -> Option<Task> {
        let mut state = self.state.write().await;
        self.sync(&mut state).await;
        let id = selection::select_next(&state.pool.tasks, agent, exclude_tags)?.id;

        let now = Utc::now();
        let task = state.pool.tasks.get_mut(&id)?;
        task.status = TaskStatus::InProgress;
        task.assigned_to = Some(agent.to_string());
        task.started_at = Some(now);
        task.updated_at = now;
        let claimed = task.clone();

        self.persist(&mut state).await;
        drop(state);

        info!(task_id = %id, agent = %agent, "Assigned task");
        self.journal("task_claimed", task_summary(&claimed));
        Some(claimed)
    }

    /// Mark a task `Completed`, storing its output.
    ///
    /// Returns `Ok(false)` without touching counters when the task is already
    /// terminal, so repeated calls never double count.
    pub async fn mark_completed(
        &self,
        id: Uuid,
        output: Option<&str>,
        output_file: Option<&str>,
    ) -> ArcanaResult<bool> {
        let mut state = self.state.write().await;
        self.sync(&mut state).await;
        let now = Utc::now();

        let task = state
            .pool
            .tasks
            .get_mut(&id)
            .ok_or(ArcanaError::TaskNotFound(id))?;
        if task.status.is_terminal() {
            debug!(task_id = %id, status = %task.status, "Completion ignored, task already terminal");
            return Ok(false);
        }

        task.status = TaskStatus::Completed;
        task.completed_at = Some(now);
        task.updated_at = now;
        if let Some(output) = output {
            task.context
                .insert("output".to_string(), serde_json::json!(output));
        }
        if let Some(path) = output_file {
            task.output_file = Some(path.to_string());
        }
        let minutes = task
            .started_at
            .map(|start| (now - start).num_milliseconds().max(0) as f64 / 60_000.0)
            .unwrap_or(0.0);
        let agent = task.agent.clone();
        let summary = task_summary(task);

        state.pool.metadata.total_tasks_completed += 1;
        let stats = state.stats_mut(&agent);
        stats.completed += 1;
        stats.total_time_minutes += minutes;

        self.persist(&mut state).await;
        drop(state);

        info!(task_id = %id, agent = %agent, duration_minutes = minutes, "Task completed");
        self.journal("task_completed", summary);
        Ok(true)
    }

    /// Count a failed attempt and apply the retry/escalation policy.
    ///
    /// Every error is appended to `context["errors"]`; nothing is overwritten.
    pub async fn mark_failed(
        &self,
        id: Uuid,
        failure: TaskFailure,
        escalate: bool,
    ) -> ArcanaResult<FailureOutcome> {
        let mut state = self.state.write().await;
        self.sync(&mut state).await;
        let now = Utc::now();

        let (decision, snapshot) = {
            let task = state
                .pool
                .tasks
                .get_mut(&id)
                .ok_or(ArcanaError::TaskNotFound(id))?;
            if task.status.is_terminal() {
                debug!(task_id = %id, status = %task.status, "Failure ignored, task already terminal");
                return Ok(FailureOutcome::Ignored);
            }

            task.failure_count += 1;
            task.updated_at = now;
            push_error(
                &mut task.context,
                TaskError {
                    timestamp: now,
                    error: failure.message.clone(),
                    kind: failure.kind.clone(),
                },
            );

            let decision = retry::decide(
                task.failure_count,
                task.max_retries,
                escalate,
                task.escalation_agent.as_deref(),
            );
            match decision {
                FailureDecision::Retry => {
                    task.status = TaskStatus::Pending;
                    task.assigned_to = None;
                    task.started_at = None;
                }
                FailureDecision::Escalate { .. } => {
                    task.status = TaskStatus::Escalated;
                    task.completed_at = Some(now);
                }
                FailureDecision::GiveUp => {
                    task.status = TaskStatus::Failed;
                    task.completed_at = Some(now);
                }
            }
            (decision, task.clone())
        };

        state.stats_mut(&snapshot.agent).failed += 1;

        let mut escalation_summary = None;
        let outcome = match decision {
            FailureDecision::Retry => {
                warn!(
                    task_id = %id,
                    attempt = snapshot.failure_count,
                    max_retries = snapshot.max_retries,
                    kind = %failure.kind,
                    "Task failed, returned to pool"
                );
                FailureOutcome::Retrying {
                    attempt: snapshot.failure_count,
                    max_retries: snapshot.max_retries,
                }
            }
            FailureDecision::Escalate { target } => {
                let child = state.insert(
                    retry::escalation_task(&snapshot, &target),
                    self.options.default_max_retries,
                );
                escalation_summary = state.pool.tasks.get(&child).map(task_summary);
                warn!(task_id = %id, escalation_task = %child, target = %target, "Task escalated");
                FailureOutcome::Escalated {
                    escalation_task: child,
                }
            }
            FailureDecision::GiveUp => {
                warn!(task_id = %id, attempts = snapshot.failure_count, "Task failed permanently");
                FailureOutcome::Failed
            }
        };

        self.persist(&mut state).await;
        drop(state);

        let mut payload = task_summary(&snapshot);
        payload["error"] = serde_json::json!(failure.message);
        payload["kind"] = serde_json::json!(failure.kind);
        payload["result"] = serde_json::to_value(&outcome).unwrap_or_default();
        self.journal("task_failed", payload);
        if let Some(summary) = escalation_summary {
            self.journal("task_added", summary);
        }
        Ok(outcome)
    }

    /// Ask `helper` for help on behalf of `requesting`.
    ///
    /// If an earlier request to the same helper is still active and its text is
    /// a near-duplicate of `description`, that task's id is returned and
    /// nothing new is recorded.
    pub async fn request_collaboration(
        &self,
        requesting: &str,
        helper: &str,
        description: &str,
        context: HashMap<String, serde_json::Value>,
    ) -> Uuid {
        let full_description = format!("COLLABORATION REQUEST from {requesting}: {description}");
        let mut state = self.state.write().await;
        self.sync(&mut state).await;

        let pool = &state.pool;
        if let Some(existing) = pool.collaboration_history.iter().find(|r| {
            r.helper_agent == helper
                && pool.tasks.get(&r.task_id).is_some_and(|t| {
                    t.status.is_active() && t.has_tag(TAG_COLLABORATION)
                })
                && similarity::is_similar(&r.description, description)
        }) {
            debug!(task_id = %existing.task_id, helper = %helper, "Duplicate collaboration request");
            return existing.task_id;
        }

        let spec = NewTask::new(full_description, helper)
            .with_priority(TaskPriority::High)
            .with_context("collaboration", serde_json::json!(true))
            .with_context("requesting_agent", serde_json::json!(requesting))
            .with_context(
                "original_context",
                serde_json::Value::Object(context.into_iter().collect()),
            )
            .with_tags([TAG_COLLABORATION]);
        let id = state.insert(spec, self.options.default_max_retries);
        let record = CollaborationRecord {
            timestamp: Utc::now(),
            requesting_agent: requesting.to_string(),
            helper_agent: helper.to_string(),
            task_id: id,
            description: description.to_string(),
        };
        state.pool.collaboration_history.push(record.clone());

        self.persist(&mut state).await;
        drop(state);

        info!(from = %requesting, to = %helper, task_id = %id, "Collaboration requested");
        self.journal(
            "collaboration_requested",
            serde_json::to_value(&record).unwrap_or_default(),
        );
        id
    }

    /// Delete terminal tasks finished more than `days` ago.
    ///
    /// Pending, in-progress and blocked tasks are never touched, and a terminal
    /// task stays while a live task still depends on it.
    pub async fn cleanup_older_than(&self, days: u32) -> usize {
        let mut state = self.state.write().await;
        self.sync(&mut state).await;
        let now = Utc::now();
        let cutoff = now - chrono::Duration::days(i64::from(days));

        let referenced: HashSet<Uuid> = state
            .pool
            .tasks
            .values()
            .filter(|t| !t.status.is_terminal())
            .flat_map(|t| t.dependencies.iter().copied())
            .collect();
        let doomed: Vec<Uuid> = state
            .pool
            .tasks
            .values()
            .filter(|t| {
                t.status.is_terminal()
                    && t.completed_at.unwrap_or(t.updated_at) < cutoff
                    && !referenced.contains(&t.id)
            })
            .map(|t| t.id)
            .collect();

        for id in &doomed {
            state.pool.tasks.remove(id);
        }
        state.pool.metadata.last_cleanup = Some(now);

        self.persist(&mut state).await;
        drop(state);

        info!(removed = doomed.len(), days, "Cleaned up old tasks");
        self.journal(
            "tasks_cleaned",
            serde_json::json!({"removed": doomed.len(), "days": days}),
        );
        doomed.len()
    }

    /// Return every `InProgress` task to `Pending`, recording an
    /// `interrupted` error and a failed attempt on each.
    ///
    /// Only the process that claims tasks may call this: at startup every
    /// claim left behind belongs to a dispatch that no longer exists.
    pub async fn recover_interrupted(&self, reason: &str) -> usize {
        let mut state = self.state.write().await;
        self.sync(&mut state).await;
        let now = Utc::now();
        let failure = TaskFailure::from(&ArcanaError::Interrupted(reason.to_string()));

        let mut recovered = Vec::new();
        for task in state
            .pool
            .tasks
            .values_mut()
            .filter(|t| t.status == TaskStatus::InProgress)
        {
            task.status = TaskStatus::Pending;
            task.assigned_to = None;
            task.started_at = None;
            task.failure_count += 1;
            task.updated_at = now;
            push_error(
                &mut task.context,
                TaskError {
                    timestamp: now,
                    error: failure.message.clone(),
                    kind: failure.kind.clone(),
                },
            );
            recovered.push(task.clone());
        }
        if recovered.is_empty() {
            return 0;
        }
        for task in &recovered {
            state.stats_mut(&task.agent).failed += 1;
        }

        self.persist(&mut state).await;
        drop(state);

        warn!(recovered = recovered.len(), reason = %reason, "Returned interrupted tasks to the pool");
        for task in &recovered {
            let mut payload = task_summary(task);
            payload["kind"] = serde_json::json!(failure.kind);
            self.journal("task_interrupted", payload);
        }
        recovered.len()
    }

    // --- Queries ---

    pub async fn get(&self, id: Uuid) -> Option<Task> {
        self.state.read().await.pool.tasks.get(&id).cloned()
    }

    /// All tasks, oldest first.
    pub async fn tasks(&self) -> Vec<Task> {
        let state = self.state.read().await;
        let mut tasks: Vec<Task> = state.pool.tasks.values().cloned().collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.pool.tasks.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn agent_workload(&self, agent: &str) -> AgentWorkload {
        self.state.read().await.pool.workload(agent)
    }

    pub async fn collaboration_history(&self) -> Vec<CollaborationRecord> {
        self.state.read().await.pool.collaboration_history.clone()
    }

    /// Id of an active task for `agent` whose description is a near-duplicate
    /// of `description`, restricted to auto-generated tasks.
    pub async fn similar_auto_task(&self, agent: &str, description: &str) -> Option<Uuid> {
        find_similar_auto(&self.state.read().await.pool, agent, description)
    }

    /// Whether the dependency graph contains a cycle.
    pub async fn has_cycle(&self) -> bool {
        selection::has_cycle(&self.state.read().await.pool.tasks)
    }

    /// Number of pending tasks waiting on unmet dependencies.
    pub async fn blocked_count(&self) -> usize {
        selection::blocked_tasks(&self.state.read().await.pool.tasks).len()
    }

    pub async fn health(&self) -> StoreHealth {
        self.state.read().await.health.clone()
    }

    pub async fn system_status(&self) -> SystemStatus {
        let status = {
            let state = self.state.read().await;
            let pool = &state.pool;

            let mut status_breakdown = BTreeMap::new();
            for task in pool.tasks.values() {
                *status_breakdown
                    .entry(task.status.as_str().to_string())
                    .or_insert(0) += 1;
            }

            let agents: BTreeSet<&str> = pool
                .tasks
                .values()
                .map(|t| t.agent.as_str())
                .chain(pool.agent_stats.keys().map(String::as_str))
                .collect();
            let agent_workloads = agents
                .into_iter()
                .map(|agent| (agent.to_string(), pool.workload(agent)))
                .collect();

            SystemStatus {
                total_tasks: pool.tasks.len(),
                status_breakdown,
                agent_workloads,
                collaboration_requests: pool.collaboration_history.len(),
                last_cleanup: pool.metadata.last_cleanup,
                pool_file_size: 0,
                total_tasks_created: pool.metadata.total_tasks_created,
                total_tasks_completed: pool.metadata.total_tasks_completed,
            }
        };

        let pool_file_size = match &self.path {
            Some(path) => tokio::fs::metadata(path)
                .await
                .map(|m| m.len())
                .unwrap_or(0),
            None => 0,
        };
        SystemStatus {
            pool_file_size,
            ..status
        }
    }

    // --- Persistence ---

    /// Persist the pool now, returning the error instead of only recording it.
    pub async fn flush(&self) -> ArcanaResult<()> {
        let mut state = self.state.write().await;
        self.sync(&mut state).await;
        self.persist(&mut state).await;
        match &state.health.last_error {
            Some(e) if !state.health.healthy => Err(ArcanaError::Store(e.clone())),
            _ => Ok(()),
        }
    }

    /// Copy the current pool file to a timestamped backup right away.
    pub async fn backup_now(&self) -> ArcanaResult<Option<PathBuf>> {
        let mut state = self.state.write().await;
        let backup = self.write_backup().await?;
        if backup.is_some() {
            state.last_backup = Instant::now();
            state.health.last_backup_at = Some(Utc::now());
        }
        Ok(backup)
    }

    /// Pick up whatever another process wrote to the pool file since this
    /// store last read or wrote it. Runs under the write lock, before the
    /// mutation it guards.
    async fn sync(&self, state: &mut StoreState) {
        let Some(path) = &self.path else {
            return;
        };
        let raw = match tokio::fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to re-read task pool");
                return;
            }
        };
        let digest = content_digest(raw.as_bytes());
        if state.base.digest == Some(digest) {
            return;
        }
        match PoolDocument::from_json(&raw) {
            Ok((disk, _)) => {
                let taken = state.merge_external(disk, digest);
                debug!(taken, "Merged external pool changes");
            }
            Err(e) => warn!(error = %e, "Ignoring unreadable pool file, keeping in-memory pool"),
        }
    }

    async fn persist(&self, state: &mut StoreState) {
        let Some(path) = &self.path else {
            return;
        };

        if state.last_backup.elapsed() >= self.options.backup_interval {
            match self.write_backup().await {
                Ok(_) => {
                    state.last_backup = Instant::now();
                    state.health.last_backup_at = Some(Utc::now());
                }
                Err(e) => warn!(error = %e, "Failed to create pool backup"),
            }
        }

        match write_atomic(path, &state.pool).await {
            Ok(digest) => {
                state.base = DiskBase::capture(&state.pool, digest);
                state.health.healthy = true;
                state.health.last_error = None;
                state.health.last_persisted_at = Some(Utc::now());
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to persist task pool");
                state.health.healthy = false;
                state.health.last_error = Some(e.to_string());
            }
        }
    }

    async fn write_backup(&self) -> ArcanaResult<Option<PathBuf>> {
        let Some(path) = &self.path else {
            return Ok(None);
        };
        if tokio::fs::metadata(path).await.is_err() {
            return Ok(None);
        }
        let backup = sibling(path, "backup");
        tokio::fs::copy(path, &backup).await?;
        info!(backup = %backup.display(), "Created pool backup");
        prune_backups(path, self.options.max_backups).await;
        Ok(Some(backup))
    }

    fn journal(&self, event_type: &str, payload: serde_json::Value) {
        if let Some(journal) = &self.journal {
            journal.record(event_type, ACTOR, payload);
        }
    }
}

fn task_summary(task: &Task) -> serde_json::Value {
    serde_json::json!({
        "task_id": task.id,
        "agent": task.agent,
        "status": task.status,
        "priority": task.priority,
        "description": similarity::truncate_chars(&task.description, 100),
    })
}

fn find_similar_auto(pool: &PoolDocument, agent: &str, description: &str) -> Option<Uuid> {
    pool.tasks
        .values()
        .find(|t| {
            t.agent == agent
                && t.status.is_active()
                && t.is_auto_generated()
                && similarity::is_similar(&t.description, description)
        })
        .map(|t| t.id)
}

fn push_error(context: &mut HashMap<String, serde_json::Value>, error: TaskError) {
    let entry = serde_json::to_value(&error).unwrap_or_default();
    match context.get_mut("errors") {
        Some(serde_json::Value::Array(errors)) => errors.push(entry),
        Some(other) => {
            let previous = other.take();
            *other = serde_json::Value::Array(vec![previous, entry]);
        }
        None => {
            context.insert("errors".to_string(), serde_json::Value::Array(vec![entry]));
        }
    }
}

/// `<dir>/<stem>.<label>_<unix millis>.json`
fn sibling(path: &Path, label: &str) -> PathBuf {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("task_pool");
    path.with_file_name(format!(
        "{stem}.{label}_{}.json",
        Utc::now().timestamp_millis()
    ))
}

/// Write `pool` through a temp file and rename, returning the digest of the
/// bytes written.
async fn write_atomic(path: &Path, pool: &PoolDocument) -> ArcanaResult<u64> {
    let json = serde_json::to_vec_pretty(pool)?;
    let digest = content_digest(&json);
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, json).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(digest)
}

fn content_digest(bytes: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    hasher.finish()
}

async fn quarantine(path: &Path) {
    let target = sibling(path, "corrupt");
    match tokio::fs::rename(path, &target).await {
        Ok(()) => warn!(moved_to = %target.display(), "Quarantined corrupted pool file"),
        Err(e) => warn!(error = %e, "Failed to quarantine corrupted pool file"),
    }
}

/// Backup files of `path`, oldest first.
pub async fn list_backups(path: &Path) -> Vec<PathBuf> {
    let (Some(dir), Some(stem)) = (path.parent(), path.file_stem().and_then(|s| s.to_str()))
    else {
        return Vec::new();
    };
    let dir = if dir.as_os_str().is_empty() {
        Path::new(".")
    } else {
        dir
    };
    let prefix = format!("{stem}.backup_");

    let mut backups = Vec::new();
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return backups;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with(&prefix) && n.ends_with(".json"))
        {
            backups.push(path);
        }
    }
    backups.sort();
    backups
}

async fn prune_backups(path: &Path, keep: usize) {
    let backups = list_backups(path).await;
    if backups.len() <= keep {
        return;
    }
    for old in &backups[..backups.len() - keep] {
        if let Err(e) = tokio::fs::remove_file(old).await {
            warn!(path = %old.display(), error = %e, "Failed to prune backup");
        }
    }
}
