use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// One line of the event journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub actor: String,
    pub payload: serde_json::Value,
}

enum JournalMessage {
    Entry(JournalEntry),
    Flush(oneshot::Sender<()>),
}

/// Append-only event journal, one JSON line per event in a daily file.
///
/// Writes happen on a background task; [`EventJournal::record`] never blocks.
pub struct EventJournal {
    tx: mpsc::UnboundedSender<JournalMessage>,
    dir: PathBuf,
}

impl EventJournal {
    /// Create a journal under `dir`. Spawns the writer task, so this must be
    /// called inside a tokio runtime.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let (tx, mut rx) = mpsc::unbounded_channel::<JournalMessage>();
        let log_dir = dir.clone();

        tokio::spawn(async move {
            if let Err(e) = tokio::fs::create_dir_all(&log_dir).await {
                warn!(dir = %log_dir.display(), error = %e, "Journal directory unavailable");
            }

            while let Some(message) = rx.recv().await {
                match message {
                    JournalMessage::Entry(entry) => {
                        if let Err(e) = append(&log_dir, &entry).await {
                            warn!(event_type = %entry.event_type, error = %e, "Journal write failed");
                        }
                    }
                    JournalMessage::Flush(ack) => {
                        let _ = ack.send(());
                    }
                }
            }
            debug!("Journal writer exiting");
        });

        Self { tx, dir }
    }

    /// Directory holding the daily journal files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn record(
        &self,
        event_type: impl Into<String>,
        actor: impl Into<String>,
        payload: serde_json::Value,
    ) {
        let entry = JournalEntry {
            timestamp: Utc::now(),
            event_type: event_type.into(),
            actor: actor.into(),
            payload,
        };
        debug!(event_type = %entry.event_type, actor = %entry.actor, "journal");
        let _ = self.tx.send(JournalMessage::Entry(entry));
    }

    /// Wait until every entry recorded so far has been written.
    pub async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        if self.tx.send(JournalMessage::Flush(ack)).is_ok() {
            let _ = done.await;
        }
    }

    /// Path of the journal file for the given day.
    pub fn file_for(dir: &Path, day: DateTime<Utc>) -> PathBuf {
        dir.join(format!("{}.jsonl", day.format("%Y-%m-%d")))
    }
}

async fn append(dir: &Path, entry: &JournalEntry) -> std::io::Result<()> {
    let line = serde_json::to_string(entry)?;
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(EventJournal::file_for(dir, entry.timestamp))
        .await?;
    file.write_all(format!("{line}\n").as_bytes()).await?;
    file.flush().await
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_entries_are_appended_in_order() {
        let tmp = tempfile::tempdir().unwrap();
        let journal = EventJournal::new(tmp.path().join("events"));

        journal.record("task_added", "task_store", serde_json::json!({"n": 1}));
        journal.record("task_claimed", "task_store", serde_json::json!({"n": 2}));
        journal.flush().await;

        let path = EventJournal::file_for(journal.dir(), Utc::now());
        let content = tokio::fs::read_to_string(path).await.unwrap();
        let lines: Vec<JournalEntry> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].event_type, "task_added");
        assert_eq!(lines[1].payload["n"], 2);
    }
}
