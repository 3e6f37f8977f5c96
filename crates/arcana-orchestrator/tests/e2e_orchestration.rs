//! End-to-end scheduling tests.
//!
//! Drives the dispatch loop against scripted executors and checks what ends up
//! in the store: completions, retries, escalations, timeouts, panics and
//! collaboration routing.

use arcana_core::ArcanaResult;
use arcana_orchestrator::*;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Scripted executor: one behaviour per agent
// ---------------------------------------------------------------------------

#[derive(Clone)]
enum Behaviour {
    Succeed(String),
    Fail(String),
    Panic,
    /// Block until cancelled.
    Hang,
    /// Sleep, ignoring cancellation, then succeed.
    Slow(Duration),
}

#[derive(Default)]
struct ScriptedExecutor {
    behaviours: HashMap<String, Behaviour>,
    calls: AtomicUsize,
    running: AtomicUsize,
    max_running: AtomicUsize,
    tokens: Mutex<Vec<CancellationToken>>,
}

impl ScriptedExecutor {
    fn new(behaviours: &[(&str, Behaviour)]) -> Self {
        Self {
            behaviours: behaviours
                .iter()
                .map(|(agent, b)| (agent.to_string(), b.clone()))
                .collect(),
            ..Self::default()
        }
    }
}

#[async_trait]
impl AgentExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        task: &Task,
        cancel: CancellationToken,
    ) -> ArcanaResult<ExecutionOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);

        let behaviour = self
            .behaviours
            .get(&task.agent)
            .cloned()
            .unwrap_or_else(|| Behaviour::Succeed("ok".into()));
        let result = match behaviour {
            Behaviour::Succeed(output) => {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(ExecutionOutcome::success(output))
            }
            Behaviour::Fail(error) => Ok(ExecutionOutcome::failure(error)),
            Behaviour::Panic => {
                self.running.fetch_sub(1, Ordering::SeqCst);
                panic!("agent {} exploded", task.agent);
            }
            Behaviour::Hang => {
                self.tokens.lock().unwrap().push(cancel.clone());
                cancel.cancelled().await;
                Ok(ExecutionOutcome::failure("cancelled"))
            }
            Behaviour::Slow(delay) => {
                tokio::time::sleep(delay).await;
                Ok(ExecutionOutcome::success("slow but done"))
            }
        };
        self.running.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

struct Harness {
    scheduler: Arc<SchedulerLoop>,
    store: Arc<TaskStore>,
    executor: Arc<ScriptedExecutor>,
}

fn harness(
    agents: &[&str],
    executor: ScriptedExecutor,
    tweak: impl FnOnce(&mut SchedulerSettings),
) -> Harness {
    let store = Arc::new(TaskStore::in_memory(StoreOptions::default()));
    let balancer = Arc::new(LoadBalancer::new(2));
    let agents: Vec<String> = agents.iter().map(ToString::to_string).collect();
    let router = Arc::new(CollaborationRouter::new(
        catalog::default_triggers(),
        catalog::default_specializations(),
        agents.clone(),
    ));
    let mut settings = SchedulerSettings {
        agents,
        task_timeout: Duration::from_secs(1),
        shutdown_grace: Duration::from_secs(2),
        ..SchedulerSettings::default()
    };
    tweak(&mut settings);

    let executor = Arc::new(executor);
    let scheduler = Arc::new(SchedulerLoop::new(
        store.clone(),
        balancer,
        executor.clone(),
        router,
        settings,
    ));
    Harness {
        scheduler,
        store,
        executor,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_end_to_end_status() {
    let h = harness(&["A", "B"], ScriptedExecutor::default(), |_| {});
    let content = h
        .store
        .add_task(NewTask::new("gen content", "A").with_priority(TaskPriority::High))
        .await;
    h.store
        .add_task(NewTask::new("fix bug", "B").with_priority(TaskPriority::Medium))
        .await;

    let claimed = h.store.next_task_for_agent("A", &[]).await.unwrap();
    assert_eq!(claimed.id, content);
    h.store.mark_completed(content, Some("done"), None).await.unwrap();

    let status = h.store.system_status().await;
    assert_eq!(status.total_tasks, 2);
    assert_eq!(status.status_breakdown["completed"], 1);
    let a = &status.agent_workloads["A"];
    assert_eq!(a.completed_tasks, 1);
    assert_eq!(a.pending_tasks, 0);
    assert_eq!(a.in_progress_tasks, 0);
}

#[tokio::test]
async fn test_cycle_dispatches_every_agent() {
    let h = harness(&["A", "B"], ScriptedExecutor::default(), |_| {});
    let a = h.store.add_task(NewTask::new("write", "A")).await;
    let b = h.store.add_task(NewTask::new("check", "B")).await;

    let report = h.scheduler.dispatch_cycle().await;
    assert_eq!(report.dispatched, 2);
    assert_eq!(report.completed, 2);

    for id in [a, b] {
        let task = h.store.get(id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.output(), Some("ok"));
    }
    assert_eq!(h.scheduler.balancer().in_flight(), 0);
    assert_eq!(h.scheduler.stats().tasks_executed, 2);
}

#[tokio::test]
async fn test_dependency_gating_across_cycles() {
    let h = harness(&["X", "F"], ScriptedExecutor::default(), |_| {});
    let f = h.store.add_task(NewTask::new("prerequisite", "F")).await;
    let e = h
        .store
        .add_task(
            NewTask::new("gated", "X")
                .with_priority(TaskPriority::Critical)
                .with_dependencies(vec![f]),
        )
        .await;

    h.scheduler.dispatch_cycle().await;
    assert_eq!(h.store.get(f).await.unwrap().status, TaskStatus::Completed);
    assert_eq!(h.store.get(e).await.unwrap().status, TaskStatus::Pending);

    h.scheduler.dispatch_cycle().await;
    assert_eq!(h.store.get(e).await.unwrap().status, TaskStatus::Completed);
}

#[tokio::test]
async fn test_repeated_failure_escalates_once() {
    let executor = ScriptedExecutor::new(&[("X", Behaviour::Fail("model refused".into()))]);
    let h = harness(&["X", "Boss"], executor, |_| {});
    let id = h
        .store
        .add_task(NewTask::new("fragile job", "X").with_escalation_agent("Boss"))
        .await;

    for attempt in 1..=2u32 {
        let report = h.scheduler.dispatch_cycle().await;
        assert_eq!(report.failed, 1);
        let task = h.store.get(id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.failure_count, attempt);
    }

    // third failure escalates; Boss's new task is picked up next cycle
    h.scheduler.dispatch_cycle().await;
    let original = h.store.get(id).await.unwrap();
    assert_eq!(original.status, TaskStatus::Escalated);
    assert_eq!(original.errors().len(), 3);
    assert!(original.errors().iter().all(|e| e.error == "model refused"));

    let boss: Vec<Task> = h
        .store
        .tasks()
        .await
        .into_iter()
        .filter(|t| t.agent == "Boss")
        .collect();
    assert_eq!(boss.len(), 1);
    assert_eq!(boss[0].priority, TaskPriority::High);
    assert!(boss[0].has_tag("escalation"));

    h.scheduler.dispatch_cycle().await;
    assert_eq!(
        h.store.get(boss[0].id).await.unwrap().status,
        TaskStatus::Completed
    );
    assert_eq!(h.executor.calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_timeout_counts_as_failed_attempt() {
    let executor = ScriptedExecutor::new(&[("Slowpoke", Behaviour::Hang)]);
    let h = harness(&["Slowpoke"], executor, |s| {
        s.task_timeout = Duration::from_millis(200);
    });
    let id = h.store.add_task(NewTask::new("never finishes", "Slowpoke")).await;

    let report = h.scheduler.dispatch_cycle().await;
    assert_eq!(report.failed, 1);

    let task = h.store.get(id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.failure_count, 1);
    assert_eq!(task.errors()[0].kind, "dispatch_timeout");
    assert_eq!(h.scheduler.balancer().in_flight(), 0);

    let tokens = h.executor.tokens.lock().unwrap();
    assert_eq!(tokens.len(), 1);
    assert!(tokens[0].is_cancelled());
}

#[tokio::test]
async fn test_panicking_agent_does_not_stop_others() {
    let executor = ScriptedExecutor::new(&[("Broken", Behaviour::Panic)]);
    let h = harness(&["Broken", "Fine"], executor, |_| {});
    let broken = h.store.add_task(NewTask::new("explode", "Broken")).await;
    let fine = h.store.add_task(NewTask::new("behave", "Fine")).await;

    let report = h.scheduler.dispatch_cycle().await;
    assert_eq!(report.completed, 1);
    assert_eq!(report.failed, 1);

    assert_eq!(
        h.store.get(fine).await.unwrap().status,
        TaskStatus::Completed
    );
    let broken = h.store.get(broken).await.unwrap();
    assert_eq!(broken.status, TaskStatus::Pending);
    assert!(broken.errors()[0].error.contains("panicked"));
    assert_eq!(h.scheduler.balancer().in_flight(), 0);
}

#[tokio::test]
async fn test_worker_pool_bounds_parallelism() {
    let executor = ScriptedExecutor::default();
    let h = harness(&["A", "B", "C"], executor, |s| s.worker_pool_size = 1);
    for agent in ["A", "B", "C"] {
        for i in 0..2 {
            h.store
                .add_task(NewTask::new(format!("{agent} job {i}"), agent))
                .await;
        }
    }

    let report = h.scheduler.dispatch_cycle().await;
    assert_eq!(report.completed, 6);
    assert_eq!(h.executor.max_running.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_help_request_routes_to_specialist() {
    let executor = ScriptedExecutor::new(&[(
        "ContentAlchemist",
        Behaviour::Succeed("Draft written. I need help checking the database records.".into()),
    )]);
    let h = harness(&["ContentAlchemist", "DataOracle"], executor, |_| {});
    h.store
        .add_task(NewTask::new("write horoscope", "ContentAlchemist"))
        .await;

    let report = h.scheduler.dispatch_cycle().await;
    assert_eq!(report.collaborations, 1);
    assert_eq!(h.scheduler.stats().collaborations_requested, 1);

    let history = h.store.collaboration_history().await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].requesting_agent, "ContentAlchemist");
    assert_eq!(history[0].helper_agent, "DataOracle");

    let request = h.store.get(history[0].task_id).await.unwrap();
    assert_eq!(request.agent, "DataOracle");
    assert_eq!(request.status, TaskStatus::Pending);

    h.scheduler.dispatch_cycle().await;
    assert_eq!(
        h.store.get(request.id).await.unwrap().status,
        TaskStatus::Completed
    );
}

#[tokio::test]
async fn test_watcher_feeds_scheduler() {
    let h = harness(&["UIEnchanter"], ScriptedExecutor::default(), |_| {});
    let watcher = ObservationWatcher::new(h.store.clone(), catalog::default_rules());
    let ids = watcher
        .process_event(&serde_json::json!({"observationContent": "hover effect missing on cards"}))
        .await;
    assert_eq!(ids.len(), 1);

    h.scheduler.dispatch_cycle().await;
    assert_eq!(
        h.store.get(ids[0]).await.unwrap().status,
        TaskStatus::Completed
    );
}

#[tokio::test]
async fn test_shutdown_drains_in_flight_work() {
    let executor = ScriptedExecutor::new(&[("A", Behaviour::Slow(Duration::from_millis(300)))]);
    let h = harness(&["A"], executor, |s| {
        s.cadences.dispatch = Cadence::every(3600);
    });
    let id = h.store.add_task(NewTask::new("long job", "A")).await;

    let (tx, rx) = watch::channel(false);
    let run = tokio::spawn(Arc::clone(&h.scheduler).run(rx));

    for _ in 0..100 {
        if h.store.get(id).await.unwrap().status == TaskStatus::InProgress {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(h.store.get(id).await.unwrap().status, TaskStatus::InProgress);
    tx.send(true).unwrap();
    run.await.unwrap().unwrap();

    assert_eq!(h.store.get(id).await.unwrap().status, TaskStatus::Completed);
    assert_eq!(h.scheduler.balancer().in_flight(), 0);
}

#[tokio::test]
async fn test_aborted_dispatch_returns_task_to_pool() {
    let executor = ScriptedExecutor::new(&[("A", Behaviour::Slow(Duration::from_secs(3600)))]);
    let h = harness(&["A"], executor, |s| {
        s.cadences.dispatch = Cadence::every(3600);
        s.task_timeout = Duration::from_secs(3600);
        s.shutdown_grace = Duration::from_millis(100);
    });
    let id = h.store.add_task(NewTask::new("stubborn job", "A")).await;

    let (tx, rx) = watch::channel(false);
    let run = tokio::spawn(Arc::clone(&h.scheduler).run(rx));
    for _ in 0..100 {
        if h.executor.calls.load(Ordering::SeqCst) > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(h.store.get(id).await.unwrap().status, TaskStatus::InProgress);

    tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("shutdown hung on a stubborn executor")
        .unwrap()
        .unwrap();

    let task = h.store.get(id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert!(task.assigned_to.is_none());
    assert_eq!(task.failure_count, 1);
    assert_eq!(task.errors()[0].kind, "interrupted");
}

#[tokio::test]
async fn test_leftover_claim_is_dispatched_after_restart() {
    let executor = ScriptedExecutor::new(&[]);
    let h = harness(&["A"], executor, |s| {
        s.cadences.dispatch = Cadence::every(3600);
    });
    let id = h.store.add_task(NewTask::new("claimed before a crash", "A")).await;
    // claimed by a process that never came back
    h.store.next_task_for_agent("A", &[]).await.unwrap();

    let (tx, rx) = watch::channel(false);
    let run = tokio::spawn(Arc::clone(&h.scheduler).run(rx));
    for _ in 0..200 {
        if h.store.get(id).await.unwrap().status == TaskStatus::Completed {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    tx.send(true).unwrap();
    run.await.unwrap().unwrap();

    let task = h.store.get(id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.errors()[0].kind, "interrupted");
    assert_eq!(h.executor.calls.load(Ordering::SeqCst), 1);
}
