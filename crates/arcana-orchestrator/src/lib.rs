//! Task scheduling and multi-agent orchestration core.
//!
//! A persistent, priority-ordered task pool shared by many named agents.
//! Tasks are claimed exclusively, gated on their dependencies, retried and
//! escalated on failure, and routed to helper agents when their output asks
//! for collaboration. A rule-driven watcher turns free-text observations into
//! new tasks, and a supervising loop runs dispatch and maintenance on
//! independent cadences.
//!
//! # Main types
//!
//! - [`TaskStore`]: durable single-writer task pool.
//! - [`LoadBalancer`]: per-agent in-flight accounting.
//! - [`ObservationWatcher`]: observation rules and self-improvement catalogue.
//! - [`CollaborationRouter`]: trigger detection and helper selection.
//! - [`SchedulerLoop`]: the cadence-driven dispatch loop.
//! - [`AgentExecutor`]: the seam to whatever actually performs a task.

/// Cadence definitions (fixed period or cron) and their timers.
pub mod cadence;
/// Built-in agents, rules, maintenance tasks and routing tables.
pub mod catalog;
/// Collaboration trigger detection and helper routing.
pub mod collaboration;
/// TOML configuration with defaults and environment overrides.
pub mod config;
/// Agent executor contract and the shell command executor.
pub mod executor;
/// Append-only JSON-lines event journal.
pub mod journal;
/// Per-agent concurrency limits.
pub mod load_balancer;
/// Retry and escalation policy.
pub mod retry;
/// The supervising scheduler loop.
pub mod scheduler;
/// Eligibility and ordering of pending tasks.
pub mod selection;
/// Word-set similarity used for duplicate detection.
pub mod similarity;
/// Persistent task pool.
pub mod task_store;
/// Shared task types.
pub mod types;
/// Observation rules and task generation.
pub mod watcher;

pub use cadence::{Cadence, CadenceTimer};
pub use collaboration::{CollaborationRouter, Specialization};
pub use config::OrchestratorConfig;
pub use executor::{AgentExecutor, CommandExecutor, ExecutionOutcome};
pub use journal::{EventJournal, JournalEntry};
pub use load_balancer::{AgentSlot, LoadBalancer, SlotGuard};
pub use retry::{FailureDecision, FailureOutcome};
pub use scheduler::{CycleReport, HealthSnapshot, SchedulerLoop, SchedulerSettings, SchedulerStats};
pub use task_store::{PoolDocument, StoreHealth, StoreOptions, SystemStatus, TaskStore};
pub use types::{
    AgentStats, AgentWorkload, CollaborationRecord, NewTask, Task, TaskError, TaskFailure,
    TaskPriority, TaskStatus,
};
pub use watcher::{AgentTargets, MaintenanceTask, ObservationWatcher, WatchRule, WatcherStats};
