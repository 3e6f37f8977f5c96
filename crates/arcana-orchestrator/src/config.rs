use crate::cadence::Cadence;
use crate::catalog;
use crate::collaboration::Specialization;
use crate::task_store::StoreOptions;
use crate::watcher::{MaintenanceTask, WatchRule};
use arcana_core::{ArcanaError, ArcanaResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// File name of the task pool inside `data_dir`.
pub const POOL_FILE: &str = "task_pool.json";
/// Directory of the event journal inside `data_dir`.
pub const JOURNAL_DIR: &str = "events";

/// Top-level configuration, usually read from `arcana.toml`.
///
/// Every section is optional; a missing section takes its defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub tasks: TasksConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub cadence: CadenceConfig,
    #[serde(default = "catalog::default_agents")]
    pub agents: Vec<String>,
    #[serde(default = "catalog::default_rules")]
    pub rules: Vec<WatchRule>,
    #[serde(default = "catalog::default_maintenance")]
    pub maintenance: Vec<MaintenanceTask>,
    #[serde(default)]
    pub collaboration: CollaborationConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_backup_interval")]
    pub backup_interval_secs: u64,
    #[serde(default = "default_max_backups")]
    pub max_backups: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TasksConfig {
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    /// Characters of executor output stored on the task.
    #[serde(default = "default_output_limit")]
    pub output_limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_max_concurrent")]
    pub default_max_concurrent_tasks: usize,
    /// Per-agent overrides of `default_max_concurrent_tasks`.
    #[serde(default)]
    pub max_concurrent_tasks: HashMap<String, usize>,
    #[serde(default = "default_worker_pool")]
    pub worker_pool_size: usize,
    #[serde(default = "default_task_timeout")]
    pub task_timeout_secs: u64,
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
    /// Tasks carrying any of these tags are never dispatched.
    #[serde(default)]
    pub exclude_tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CadenceConfig {
    #[serde(default = "default_dispatch_cadence")]
    pub dispatch: Cadence,
    #[serde(default = "default_health_cadence")]
    pub health: Cadence,
    #[serde(default = "default_self_improvement_cadence")]
    pub self_improvement: Cadence,
    #[serde(default = "default_cleanup_cadence")]
    pub cleanup: Cadence,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollaborationConfig {
    #[serde(default = "catalog::default_triggers")]
    pub triggers: Vec<String>,
    #[serde(default = "catalog::default_specializations")]
    pub specializations: Vec<Specialization>,
}

/// Shell commands for the bundled command executor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default)]
    pub commands: HashMap<String, String>,
    /// Command for agents without an entry in `commands`.
    #[serde(default)]
    pub fallback: Option<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            store: StoreConfig::default(),
            tasks: TasksConfig::default(),
            dispatch: DispatchConfig::default(),
            cadence: CadenceConfig::default(),
            agents: catalog::default_agents(),
            rules: catalog::default_rules(),
            maintenance: catalog::default_maintenance(),
            collaboration: CollaborationConfig::default(),
            executor: ExecutorConfig::default(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backup_interval_secs: default_backup_interval(),
            max_backups: default_max_backups(),
        }
    }
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            default_max_retries: default_max_retries(),
            retention_days: default_retention_days(),
            output_limit: default_output_limit(),
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            default_max_concurrent_tasks: default_max_concurrent(),
            max_concurrent_tasks: HashMap::new(),
            worker_pool_size: default_worker_pool(),
            task_timeout_secs: default_task_timeout(),
            shutdown_grace_secs: default_shutdown_grace(),
            exclude_tags: Vec::new(),
        }
    }
}

impl Default for CadenceConfig {
    fn default() -> Self {
        Self {
            dispatch: default_dispatch_cadence(),
            health: default_health_cadence(),
            self_improvement: default_self_improvement_cadence(),
            cleanup: default_cleanup_cadence(),
        }
    }
}

impl Default for CollaborationConfig {
    fn default() -> Self {
        Self {
            triggers: catalog::default_triggers(),
            specializations: catalog::default_specializations(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn default_backup_interval() -> u64 {
    3600
}
fn default_max_backups() -> usize {
    5
}
fn default_max_retries() -> u32 {
    crate::types::DEFAULT_MAX_RETRIES
}
fn default_retention_days() -> u32 {
    7
}
fn default_output_limit() -> usize {
    1000
}
fn default_max_concurrent() -> usize {
    2
}
fn default_worker_pool() -> usize {
    8
}
fn default_task_timeout() -> u64 {
    30
}
fn default_shutdown_grace() -> u64 {
    30
}
fn default_dispatch_cadence() -> Cadence {
    Cadence::every(60)
}
fn default_health_cadence() -> Cadence {
    Cadence::every(300)
}
fn default_self_improvement_cadence() -> Cadence {
    Cadence::every(3600)
}
fn default_cleanup_cadence() -> Cadence {
    Cadence::every(86_400)
}

impl OrchestratorConfig {
    pub fn from_toml(raw: &str) -> ArcanaResult<Self> {
        toml::from_str(raw).map_err(|e| ArcanaError::Config(e.to_string()))
    }

    /// Read `path`, falling back to defaults when the file does not exist.
    pub async fn load_or_default(path: &Path) -> ArcanaResult<Self> {
        match tokio::fs::read_to_string(path).await {
            Ok(raw) => Self::from_toml(&raw),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "No config file, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(ArcanaError::Config(format!(
                "Failed to read config file '{}': {e}",
                path.display()
            ))),
        }
    }

    /// Apply `ARCANA_DATA_DIR` and `ARCANA_MAX_RETRIES` from the process
    /// environment.
    pub fn apply_env(&mut self) -> ArcanaResult<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup`, which maps variable names to values.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> ArcanaResult<()> {
        if let Some(dir) = lookup("ARCANA_DATA_DIR").filter(|d| !d.trim().is_empty()) {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(raw) = lookup("ARCANA_MAX_RETRIES") {
            self.tasks.default_max_retries = raw.trim().parse().map_err(|_| {
                ArcanaError::Config(format!("ARCANA_MAX_RETRIES must be a number, got '{raw}'"))
            })?;
        }
        Ok(())
    }

    /// Check the values serde cannot.
    pub fn validate(&self) -> ArcanaResult<()> {
        for (name, cadence) in [
            ("dispatch", &self.cadence.dispatch),
            ("health", &self.cadence.health),
            ("self_improvement", &self.cadence.self_improvement),
            ("cleanup", &self.cadence.cleanup),
        ] {
            cadence
                .validate()
                .map_err(|e| ArcanaError::Config(format!("cadence.{name}: {e}")))?;
        }
        if self.dispatch.worker_pool_size == 0 {
            return Err(ArcanaError::Config(
                "dispatch.worker_pool_size must be at least 1".into(),
            ));
        }
        if self.dispatch.task_timeout_secs == 0 {
            return Err(ArcanaError::Config(
                "dispatch.task_timeout_secs must be at least 1".into(),
            ));
        }
        if let Some(rule) = self
            .rules
            .iter()
            .find(|r| r.name.trim().is_empty() || r.agents.as_slice().is_empty())
        {
            return Err(ArcanaError::Config(format!(
                "rule '{}' needs a name and at least one agent",
                rule.name
            )));
        }
        Ok(())
    }

    pub fn pool_path(&self) -> PathBuf {
        self.data_dir.join(POOL_FILE)
    }

    pub fn journal_dir(&self) -> PathBuf {
        self.data_dir.join(JOURNAL_DIR)
    }

    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            backup_interval: Duration::from_secs(self.store.backup_interval_secs),
            max_backups: self.store.max_backups,
            default_max_retries: self.tasks.default_max_retries,
        }
    }
}
