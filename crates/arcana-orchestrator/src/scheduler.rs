use crate::collaboration::CollaborationRouter;
use crate::config::{CadenceConfig, OrchestratorConfig};
use crate::executor::{AgentExecutor, ExecutionOutcome};
use crate::journal::EventJournal;
use crate::load_balancer::{AgentSlot, LoadBalancer, SlotGuard};
use crate::retry::FailureOutcome;
use crate::similarity::truncate_chars;
use crate::task_store::{StoreHealth, SystemStatus, TaskStore};
use crate::types::{Task, TaskFailure};
use crate::watcher::{ObservationWatcher, WatcherStats};
use arcana_core::{ArcanaError, ArcanaResult};
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const ACTOR: &str = "scheduler";

/// Knobs of the scheduler loop.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// Agents considered for dispatch, in order.
    pub agents: Vec<String>,
    pub worker_pool_size: usize,
    pub task_timeout: Duration,
    pub shutdown_grace: Duration,
    /// Characters of executor output stored on a completed task.
    pub output_limit: usize,
    pub retention_days: u32,
    pub exclude_tags: Vec<String>,
    pub cadences: CadenceConfig,
}

impl SchedulerSettings {
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            agents: config.agents.clone(),
            worker_pool_size: config.dispatch.worker_pool_size,
            task_timeout: Duration::from_secs(config.dispatch.task_timeout_secs),
            shutdown_grace: Duration::from_secs(config.dispatch.shutdown_grace_secs),
            output_limit: config.tasks.output_limit,
            retention_days: config.tasks.retention_days,
            exclude_tags: config.dispatch.exclude_tags.clone(),
            cadences: config.cadence.clone(),
        }
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self::from_config(&OrchestratorConfig::default())
    }
}

/// Counters kept for the lifetime of the loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub startup_time: DateTime<Utc>,
    pub last_activity: Option<DateTime<Utc>>,
    pub dispatch_cycles: u64,
    pub tasks_executed: u64,
    pub tasks_failed: u64,
    pub collaborations_requested: u64,
}

impl Default for SchedulerStats {
    fn default() -> Self {
        Self {
            startup_time: Utc::now(),
            last_activity: None,
            dispatch_cycles: 0,
            tasks_executed: 0,
            tasks_failed: 0,
            collaborations_requested: 0,
        }
    }
}

/// What one dispatch cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleReport {
    pub dispatched: usize,
    pub completed: usize,
    pub failed: usize,
    pub collaborations: usize,
}

/// Point-in-time view of the whole system, logged and journaled by the
/// health cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub timestamp: DateTime<Utc>,
    pub healthy: bool,
    pub stats: SchedulerStats,
    pub in_flight: usize,
    pub load: BTreeMap<String, AgentSlot>,
    pub store: SystemStatus,
    pub store_health: StoreHealth,
    pub blocked_tasks: usize,
    pub dependency_cycle: bool,
    pub watcher: Option<WatcherStats>,
}

/// The independently timed jobs of the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Job {
    Dispatch,
    Health,
    SelfImprovement,
    Cleanup,
}

impl std::fmt::Display for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Job::Dispatch => "dispatch",
            Job::Health => "health",
            Job::SelfImprovement => "self_improvement",
            Job::Cleanup => "cleanup",
        })
    }
}

enum DispatchResult {
    Completed { collaboration: bool },
    Failed,
}

/// Drives dispatch and maintenance on their own cadences.
///
/// Each dispatch cycle claims work for every agent with spare capacity, runs
/// the claims concurrently on a bounded worker pool, and commits every result
/// through the store. A failing or panicking executor only affects its own
/// task.
pub struct SchedulerLoop {
    store: Arc<TaskStore>,
    balancer: Arc<LoadBalancer>,
    executor: Arc<dyn AgentExecutor>,
    router: Arc<CollaborationRouter>,
    watcher: Option<Arc<ObservationWatcher>>,
    journal: Option<Arc<EventJournal>>,
    settings: SchedulerSettings,
    workers: Arc<Semaphore>,
    stats: Mutex<SchedulerStats>,
    cancel: CancellationToken,
}

impl SchedulerLoop {
    pub fn new(
        store: Arc<TaskStore>,
        balancer: Arc<LoadBalancer>,
        executor: Arc<dyn AgentExecutor>,
        router: Arc<CollaborationRouter>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            store,
            balancer,
            executor,
            router,
            watcher: None,
            journal: None,
            workers: Arc::new(Semaphore::new(settings.worker_pool_size.max(1))),
            settings,
            stats: Mutex::new(SchedulerStats::default()),
            cancel: CancellationToken::new(),
        }
    }

    /// Source of the self-improvement catalogue.
    pub fn with_watcher(mut self, watcher: Arc<ObservationWatcher>) -> Self {
        self.watcher = Some(watcher);
        self
    }

    pub fn with_journal(mut self, journal: Arc<EventJournal>) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn store(&self) -> &Arc<TaskStore> {
        &self.store
    }

    pub fn balancer(&self) -> &Arc<LoadBalancer> {
        &self.balancer
    }

    pub fn stats(&self) -> SchedulerStats {
        self.stats.lock().clone()
    }

    /// Run all cadences until `shutdown` turns true (or its sender is dropped).
    ///
    /// Claims left `InProgress` by a previous run are returned to the pool
    /// first. A job that is already running when shutdown arrives finishes
    /// first. After `shutdown_grace` in-flight executions are cancelled and
    /// recorded as failed attempts; any that ignore cancellation are aborted
    /// and their tasks returned to the pool as interrupted.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> ArcanaResult<()> {
        let cadences = [
            (Job::Dispatch, &self.settings.cadences.dispatch),
            (Job::Health, &self.settings.cadences.health),
            (Job::SelfImprovement, &self.settings.cadences.self_improvement),
            (Job::Cleanup, &self.settings.cadences.cleanup),
        ];

        let mut timers = Vec::with_capacity(cadences.len());
        for (job, cadence) in cadences {
            let timer = cadence
                .timer()
                .map_err(|e| ArcanaError::Scheduler(format!("{job} cadence: {e}")))?;
            info!(job = %job, cadence = %cadence, "Scheduled job");
            timers.push((job, timer));
        }

        self.store.recover_interrupted("left in progress by a previous run").await;
        info!(agents = self.settings.agents.len(), "Scheduler started");
        self.journal(
            "scheduler_started",
            serde_json::json!({"agents": self.settings.agents}),
        );

        let mut loops = JoinSet::new();
        for (job, mut timer) in timers {
            let this = Arc::clone(&self);
            let mut stop = shutdown.clone();
            loops.spawn(async move {
                loop {
                    tokio::select! {
                        _ = timer.tick() => this.run_job(job).await,
                        _ = stop.changed() => break,
                    }
                }
                debug!(job = %job, "Job loop stopped");
            });
        }

        while !*shutdown.borrow_and_update() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }
        info!("Shutdown requested, draining in-flight work");

        let grace = self.settings.shutdown_grace;
        if tokio::time::timeout(grace, drain(&mut loops)).await.is_err() {
            warn!(grace_secs = grace.as_secs(), "Grace period elapsed, cancelling in-flight dispatches");
            self.cancel.cancel();
            if tokio::time::timeout(grace, drain(&mut loops)).await.is_err() {
                error!("Dispatches ignored cancellation, aborting");
                loops.shutdown().await;
                self.store.recover_interrupted("aborted during shutdown").await;
            }
        }

        let flushed = self.store.flush().await;
        let stats = self.stats();
        info!(
            tasks_executed = stats.tasks_executed,
            tasks_failed = stats.tasks_failed,
            "Scheduler stopped"
        );
        self.journal(
            "scheduler_stopped",
            serde_json::to_value(&stats).unwrap_or_default(),
        );
        if let Some(journal) = &self.journal {
            journal.flush().await;
        }
        flushed
    }

    async fn run_job(self: &Arc<Self>, job: Job) {
        match job {
            Job::Dispatch => {
                self.dispatch_cycle().await;
            }
            Job::Health => {
                self.health_check().await;
            }
            Job::SelfImprovement => {
                self.inject_self_improvement().await;
            }
            Job::Cleanup => {
                self.cleanup().await;
            }
        }
    }

    /// One dispatch cycle: claim and run work for every agent with spare
    /// capacity, then wait for all of it to finish or time out.
    pub async fn dispatch_cycle(self: &Arc<Self>) -> CycleReport {
        let mut jobs = JoinSet::new();
        // Claim everything before running anything, so a task that fails and
        // returns to Pending is not picked up again in the same cycle.
        for agent in &self.settings.agents {
            for _ in 0..self.balancer.available_slots(agent) {
                let Some(mut slot) = self.balancer.acquire(agent) else {
                    break;
                };
                let Some(task) = self
                    .store
                    .next_task_for_agent(agent, &self.settings.exclude_tags)
                    .await
                else {
                    break;
                };
                slot.bind(task.id);
                let this = Arc::clone(self);
                jobs.spawn(async move { this.dispatch_one(slot, task).await });
            }
        }

        let mut report = CycleReport::default();
        while let Some(joined) = jobs.join_next().await {
            match joined {
                Ok(DispatchResult::Completed { collaboration }) => {
                    report.dispatched += 1;
                    report.completed += 1;
                    report.collaborations += usize::from(collaboration);
                }
                Ok(DispatchResult::Failed) => {
                    report.dispatched += 1;
                    report.failed += 1;
                }
                Err(e) => error!(error = %e, "Dispatch worker crashed"),
            }
        }

        {
            let mut stats = self.stats.lock();
            stats.dispatch_cycles += 1;
            if report.dispatched > 0 {
                stats.last_activity = Some(Utc::now());
            }
        }
        if report.dispatched > 0 {
            info!(
                dispatched = report.dispatched,
                completed = report.completed,
                failed = report.failed,
                "Dispatch cycle finished"
            );
            self.journal(
                "dispatch_cycle",
                serde_json::to_value(&report).unwrap_or_default(),
            );
        } else {
            debug!("Dispatch cycle found no work");
        }
        report
    }

    /// Run a claimed task on a worker and commit the result. The slot is
    /// released when `_slot` drops, on every path.
    async fn dispatch_one(&self, _slot: SlotGuard, task: Task) -> DispatchResult {
        let _permit = self.workers.acquire().await;
        let started = Instant::now();
        match self.execute(&task).await {
            Ok(outcome) => {
                let collaboration = self.commit_success(&task, &outcome).await;
                debug!(task_id = %task.id, elapsed_ms = started.elapsed().as_millis() as u64, "Dispatch done");
                DispatchResult::Completed { collaboration }
            }
            Err(failure) => {
                self.commit_failure(&task, failure).await;
                DispatchResult::Failed
            }
        }
    }

    /// Run the executor under the dispatch deadline. Panics and timeouts come
    /// back as failures.
    async fn execute(&self, task: &Task) -> Result<ExecutionOutcome, TaskFailure> {
        let cancel = self.cancel.child_token();
        let call = AssertUnwindSafe(self.executor.execute(task, cancel.clone())).catch_unwind();

        match tokio::time::timeout(self.settings.task_timeout, call).await {
            Ok(Ok(Ok(outcome))) if outcome.success => Ok(outcome),
            Ok(Ok(Ok(outcome))) => Err(TaskFailure::new(
                outcome
                    .error
                    .unwrap_or_else(|| "agent reported failure".to_string()),
            )),
            Ok(Ok(Err(e))) => Err(TaskFailure::from(&e)),
            Ok(Err(panic)) => Err(TaskFailure::new(format!(
                "executor panicked: {}",
                panic_message(panic.as_ref())
            ))),
            Err(_) => {
                cancel.cancel();
                let secs = self.settings.task_timeout.as_secs();
                warn!(task_id = %task.id, agent = %task.agent, timeout_secs = secs, "Dispatch timed out");
                Err(TaskFailure::from(&ArcanaError::DispatchTimeout(secs)))
            }
        }
    }

    async fn commit_success(&self, task: &Task, outcome: &ExecutionOutcome) -> bool {
        let output = truncate_chars(&outcome.output, self.settings.output_limit);
        if let Err(e) = self
            .store
            .mark_completed(task.id, Some(output), task.output_file.as_deref())
            .await
        {
            warn!(task_id = %task.id, error = %e, "Could not record completion");
        }
        self.stats.lock().tasks_executed += 1;

        let collaboration = self
            .router
            .route(&self.store, &self.balancer, &task.agent, &outcome.output)
            .await
            .is_some();
        if collaboration {
            self.stats.lock().collaborations_requested += 1;
        }
        collaboration
    }

    async fn commit_failure(&self, task: &Task, failure: TaskFailure) {
        warn!(task_id = %task.id, agent = %task.agent, kind = %failure.kind, error = %failure.message, "Task execution failed");
        match self.store.mark_failed(task.id, failure, true).await {
            Ok(FailureOutcome::Escalated { escalation_task }) => {
                info!(task_id = %task.id, escalation_task = %escalation_task, "Escalation created");
            }
            Ok(_) => {}
            Err(e) => warn!(task_id = %task.id, error = %e, "Could not record failure"),
        }
        self.stats.lock().tasks_failed += 1;
    }

    /// Collect, log and journal a [`HealthSnapshot`].
    pub async fn health_check(&self) -> HealthSnapshot {
        let store_health = self.store.health().await;
        let dependency_cycle = self.store.has_cycle().await;
        let snapshot = HealthSnapshot {
            timestamp: Utc::now(),
            healthy: store_health.healthy && !dependency_cycle,
            stats: self.stats(),
            in_flight: self.balancer.in_flight(),
            load: self.balancer.snapshot(),
            store: self.store.system_status().await,
            blocked_tasks: self.store.blocked_count().await,
            dependency_cycle,
            store_health,
            watcher: self.watcher.as_ref().map(|w| w.stats()),
        };

        if snapshot.healthy {
            info!(
                total_tasks = snapshot.store.total_tasks,
                in_flight = snapshot.in_flight,
                blocked = snapshot.blocked_tasks,
                "Health check"
            );
        } else {
            warn!(
                store_error = ?snapshot.store_health.last_error,
                dependency_cycle,
                "Health check: degraded"
            );
        }
        self.journal(
            "health_snapshot",
            serde_json::to_value(&snapshot).unwrap_or_default(),
        );
        snapshot
    }

    /// Queue the maintenance catalogue. Returns how many tasks were created.
    pub async fn inject_self_improvement(&self) -> usize {
        match &self.watcher {
            Some(watcher) => watcher.inject_self_improvement_tasks().await,
            None => 0,
        }
    }

    /// Delete terminal tasks past the retention window.
    pub async fn cleanup(&self) -> usize {
        self.store
            .cleanup_older_than(self.settings.retention_days)
            .await
    }

    fn journal(&self, event_type: &str, payload: serde_json::Value) {
        if let Some(journal) = &self.journal {
            journal.record(event_type, ACTOR, payload);
        }
    }
}

async fn drain(loops: &mut JoinSet<()>) {
    while let Some(joined) = loops.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "Job loop crashed");
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::cadence::Cadence;
    use crate::catalog;
    use crate::task_store::StoreOptions;
    use crate::types::{NewTask, TaskStatus};
    use async_trait::async_trait;

    struct Echo;

    #[async_trait]
    impl AgentExecutor for Echo {
        async fn execute(
            &self,
            task: &Task,
            _cancel: CancellationToken,
        ) -> ArcanaResult<ExecutionOutcome> {
            Ok(ExecutionOutcome::success(format!("done: {}", task.description)))
        }
    }

    fn scheduler(executor: Arc<dyn AgentExecutor>, settings: SchedulerSettings) -> Arc<SchedulerLoop> {
        let store = Arc::new(TaskStore::in_memory(StoreOptions::default()));
        let balancer = Arc::new(LoadBalancer::new(2));
        let router = Arc::new(CollaborationRouter::new(
            catalog::default_triggers(),
            catalog::default_specializations(),
            settings.agents.clone(),
        ));
        Arc::new(SchedulerLoop::new(store, balancer, executor, router, settings))
    }

    fn settings(agents: &[&str]) -> SchedulerSettings {
        SchedulerSettings {
            agents: agents.iter().map(ToString::to_string).collect(),
            task_timeout: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(1),
            ..SchedulerSettings::default()
        }
    }

    #[tokio::test]
    async fn test_empty_cycle() {
        let s = scheduler(Arc::new(Echo), settings(&["A"]));
        assert_eq!(s.dispatch_cycle().await, CycleReport::default());
        assert_eq!(s.stats().dispatch_cycles, 1);
    }

    #[tokio::test]
    async fn test_cycle_respects_concurrency_limit() {
        let s = scheduler(Arc::new(Echo), settings(&["A"]));
        for i in 0..5 {
            s.store().add_task(NewTask::new(format!("job {i}"), "A")).await;
        }
        let report = s.dispatch_cycle().await;
        assert_eq!(report.completed, 2);
        assert_eq!(s.balancer().in_flight(), 0);

        let status = s.store().system_status().await;
        assert_eq!(status.status_breakdown["completed"], 2);
        assert_eq!(status.status_breakdown["pending"], 3);
    }

    #[tokio::test]
    async fn test_output_is_truncated() {
        struct Verbose;
        #[async_trait]
        impl AgentExecutor for Verbose {
            async fn execute(
                &self,
                _task: &Task,
                _cancel: CancellationToken,
            ) -> ArcanaResult<ExecutionOutcome> {
                Ok(ExecutionOutcome::success("y".repeat(5000)))
            }
        }

        let s = scheduler(Arc::new(Verbose), settings(&["A"]));
        let id = s.store().add_task(NewTask::new("talk a lot", "A")).await;
        s.dispatch_cycle().await;
        let task = s.store().get(id).await.unwrap();
        assert_eq!(task.output().unwrap().len(), 1000);
    }

    #[tokio::test]
    async fn test_health_snapshot() {
        let s = scheduler(Arc::new(Echo), settings(&["A"]));
        s.store().add_task(NewTask::new("x", "A")).await;
        let snapshot = s.health_check().await;
        assert!(snapshot.healthy);
        assert_eq!(snapshot.store.total_tasks, 1);
        assert!(!snapshot.dependency_cycle);
        assert!(snapshot.watcher.is_none());
    }

    #[tokio::test]
    async fn test_invalid_cadence_fails_fast() {
        let mut settings = settings(&["A"]);
        settings.cadences.health = Cadence::every(0);
        let s = scheduler(Arc::new(Echo), settings);
        let (_tx, rx) = watch::channel(false);
        let err = s.run(rx).await.unwrap_err();
        assert!(matches!(err, ArcanaError::Scheduler(_)));
    }

    #[tokio::test]
    async fn test_run_until_shutdown() {
        let mut settings = settings(&["A"]);
        settings.cadences.dispatch = Cadence::every(1);
        let s = scheduler(Arc::new(Echo), settings);
        let id = s.store().add_task(NewTask::new("first", "A")).await;

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(Arc::clone(&s).run(rx));

        for _ in 0..50 {
            if s.store().get(id).await.unwrap().status == TaskStatus::Completed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();

        assert_eq!(
            s.store().get(id).await.unwrap().status,
            TaskStatus::Completed
        );
        assert!(s.stats().tasks_executed >= 1);
    }
}
