//! Directory-watching observation feed.
//!
//! Watches a directory for `*.json` event files and hands every parsed event
//! to the [`ObservationWatcher`]. Repeated writes to the same file within the
//! debounce window are processed once.

use arcana_core::{ArcanaError, ArcanaResult};
use arcana_orchestrator::ObservationWatcher;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::mpsc;

/// Per-file debounce window.
pub const DEBOUNCE: Duration = Duration::from_secs(5);

/// Files younger than this are processed when the feed starts.
pub const CATCH_UP_WINDOW: Duration = Duration::from_secs(3600);

/// Remembers when each file was last processed.
pub struct Debouncer {
    window: Duration,
    last_seen: HashMap<PathBuf, Instant>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_seen: HashMap::new(),
        }
    }

    /// True when `path` has not been processed within the window; records
    /// `now` as its processing time in that case.
    pub fn should_process(&mut self, path: &Path, now: Instant) -> bool {
        match self.last_seen.get(path) {
            Some(last) if now.saturating_duration_since(*last) < self.window => false,
            _ => {
                self.last_seen.insert(path.to_path_buf(), now);
                true
            }
        }
    }
}

pub fn is_observation_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("json"))
}

/// Parse one event file and process every observation in it.
/// Returns the number of tasks created.
pub async fn ingest_file(watcher: &ObservationWatcher, path: &Path) -> ArcanaResult<usize> {
    let raw = tokio::fs::read_to_string(path).await?;
    let event: serde_json::Value = serde_json::from_str(&raw)?;
    let created = watcher.process_event(&event).await;
    if !created.is_empty() {
        tracing::info!(path = %path.display(), tasks = created.len(), "Observation file processed");
    }
    Ok(created.len())
}

/// Process event files in `dir` modified within `max_age`.
pub async fn catch_up(watcher: &ObservationWatcher, dir: &Path, max_age: Duration) -> usize {
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return 0;
    };
    let cutoff = SystemTime::now()
        .checked_sub(max_age)
        .unwrap_or(SystemTime::UNIX_EPOCH);

    let mut recent = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if !is_observation_file(&path) {
            continue;
        }
        let modified = entry.metadata().await.and_then(|m| m.modified());
        if matches!(modified, Ok(at) if at >= cutoff) {
            recent.push(path);
        }
    }
    recent.sort();

    let mut created = 0;
    for path in recent {
        match ingest_file(watcher, &path).await {
            Ok(n) => created += n,
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "Skipping observation file"),
        }
    }
    created
}

/// Keeps the file-system watch alive; dropping it stops the feed.
pub struct ObservationFeed {
    _watcher: RecommendedWatcher,
    worker: tokio::task::JoinHandle<()>,
}

impl ObservationFeed {
    /// Start watching `dir`. Must be called inside a tokio runtime.
    pub fn start(
        dir: PathBuf,
        watcher: Arc<ObservationWatcher>,
        debounce: Duration,
    ) -> ArcanaResult<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<PathBuf>();

        let mut fs_watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            if let Ok(event) = res {
                if matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                    for path in event.paths.into_iter().filter(|p| is_observation_file(p)) {
                        let _ = tx.send(path);
                    }
                }
            }
        })
        .map_err(|e| ArcanaError::Config(format!("Failed to create file watcher: {e}")))?;

        fs_watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|e| {
                ArcanaError::Config(format!(
                    "Failed to watch observation directory '{}': {e}",
                    dir.display()
                ))
            })?;

        let worker = tokio::spawn(async move {
            let mut debouncer = Debouncer::new(debounce);
            while let Some(path) = rx.recv().await {
                if !debouncer.should_process(&path, Instant::now()) {
                    continue;
                }
                if let Err(e) = ingest_file(&watcher, &path).await {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to ingest observation file");
                }
            }
            tracing::debug!("Observation feed exiting");
        });

        tracing::info!(dir = %dir.display(), "Observation feed started");
        Ok(Self {
            _watcher: fs_watcher,
            worker,
        })
    }
}

impl Drop for ObservationFeed {
    fn drop(&mut self) {
        self.worker.abort();
    }
}
