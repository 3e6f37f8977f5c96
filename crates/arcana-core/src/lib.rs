//! Core types and error definitions for the Arcana scheduler.
//!
//! This crate provides the foundational types shared across all Arcana crates:
//! the unified error enum and the observation ingestion contract.
//!
//! # Main types
//!
//! - [`ArcanaError`] — Unified error enum for all Arcana subsystems.
//! - [`ArcanaResult`] — Convenience alias for `Result<T, ArcanaError>`.
//! - [`extract_observations`] — Pulls free-text observations out of an ingestion event.

/// Observation ingestion contract.
pub mod observation;

pub use observation::{extract_observations, observation_from_entry};

use uuid::Uuid;

// --- Error types ---

/// Top-level error type for the Arcana scheduler.
///
/// Per-task failures (`AgentExecution`, `DispatchTimeout`) are absorbed into the
/// task record by the scheduler; they exist as variants so executors and the
/// dispatch path can describe what went wrong.
#[derive(Debug, thiserror::Error)]
pub enum ArcanaError {
    /// An operation referenced a task id the store does not know about.
    #[error("Task not found: {0}")]
    TaskNotFound(Uuid),

    /// The persisted pool failed validation on load.
    #[error("Store corrupted: {0}")]
    StoreCorrupted(String),

    /// The store could not be read or persisted.
    #[error("Store error: {0}")]
    Store(String),

    /// The agent executor reported a failure.
    #[error("Agent execution failed: {0}")]
    AgentExecution(String),

    /// A dispatch exceeded its deadline.
    #[error("Dispatch timed out after {0}s")]
    DispatchTimeout(u64),

    /// The process stopped while the task was still in progress.
    #[error("Dispatch interrupted: {0}")]
    Interrupted(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// An error from the scheduler loop or one of its cadences.
    #[error("Scheduler error: {0}")]
    Scheduler(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ArcanaError {
    /// Short machine-readable tag recorded in a task's error context.
    pub fn kind(&self) -> &'static str {
        match self {
            ArcanaError::TaskNotFound(_) => "task_not_found",
            ArcanaError::StoreCorrupted(_) => "store_corrupted",
            ArcanaError::Store(_) => "store",
            ArcanaError::AgentExecution(_) => "execution_failure",
            ArcanaError::DispatchTimeout(_) => "dispatch_timeout",
            ArcanaError::Interrupted(_) => "interrupted",
            ArcanaError::Config(_) => "config",
            ArcanaError::Scheduler(_) => "scheduler",
            ArcanaError::Json(_) => "json",
            ArcanaError::Io(_) => "io",
        }
    }
}

/// A convenience `Result` alias using [`ArcanaError`].
pub type ArcanaResult<T> = Result<T, ArcanaError>;
