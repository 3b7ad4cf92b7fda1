//! Progress trackers backed by the log and optional JSON-lines files

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::collaborators::{Clock, ProgressTracker, TrackerFactory, TrackerKind};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerMessage {
    pub at: DateTime<Utc>,
    pub kind: TrackerKind,
    pub message: String,
}

/// Tracker for one data file. Messages go to the debug log as they arrive;
/// `persist` appends them to `<dir>/<agent>/<file>.tracker.jsonl` when a
/// directory is configured.
pub struct LogTracker {
    agent_id: String,
    file_name: String,
    target: Option<PathBuf>,
    clock: Arc<dyn Clock>,
    messages: Mutex<Vec<TrackerMessage>>,
}

impl LogTracker {
    pub fn messages(&self) -> Vec<TrackerMessage> {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<TrackerMessage>> {
        self.messages.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl ProgressTracker for LogTracker {
    fn add_message(&self, kind: TrackerKind, message: String) {
        debug!(
            agent_id = %self.agent_id,
            file = %self.file_name,
            kind = kind.as_str(),
            "{}",
            message
        );
        self.lock().push(TrackerMessage {
            at: self.clock.now(),
            kind,
            message,
        });
    }

    async fn persist(&self) -> Result<()> {
        let Some(path) = self.target.as_ref() else {
            return Ok(());
        };

        let data = {
            let messages = self.lock();
            let mut data = String::new();
            for message in messages.iter() {
                data.push_str(&serde_json::to_string(message)?);
                data.push('\n');
            }
            data
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .with_context(|| format!("Failed to open tracker file {}", path.display()))?;
        file.write_all(data.as_bytes()).await?;
        file.flush().await?;

        Ok(())
    }
}

pub struct LogTrackerFactory {
    dir: Option<PathBuf>,
    clock: Arc<dyn Clock>,
}

impl LogTrackerFactory {
    pub fn new(dir: Option<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        Self { dir, clock }
    }

    pub fn tracker(&self, agent_id: &str, file_name: &str) -> LogTracker {
        LogTracker {
            agent_id: agent_id.to_string(),
            file_name: file_name.to_string(),
            target: self
                .dir
                .as_ref()
                .map(|dir| dir.join(agent_id).join(format!("{}.tracker.jsonl", file_name))),
            clock: self.clock.clone(),
            messages: Mutex::new(Vec::new()),
        }
    }
}

impl TrackerFactory for LogTrackerFactory {
    fn create(&self, agent_id: &str, file_name: &str) -> Arc<dyn ProgressTracker> {
        Arc::new(self.tracker(agent_id, file_name))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::collaborators::SystemClock;

    #[tokio::test]
    async fn test_persist_writes_messages_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let factory = LogTrackerFactory::new(Some(dir.path().to_path_buf()), Arc::new(SystemClock));
        let tracker = factory.tracker("agent", "data.tsv");

        tracker.add_message(TrackerKind::DataFileCommand, "first".into());
        tracker.add_message(TrackerKind::DataFileComplete, "second".into());
        tracker.persist().await.unwrap();

        let text = tokio::fs::read_to_string(dir.path().join("agent/data.tsv.tracker.jsonl"))
            .await
            .unwrap();
        let parsed: Vec<TrackerMessage> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(parsed, tracker.messages());
        assert_eq!(parsed[1].kind, TrackerKind::DataFileComplete);
    }

    #[tokio::test]
    async fn test_persist_without_dir_is_noop() {
        let factory = LogTrackerFactory::new(None, Arc::new(SystemClock));
        let tracker = factory.create("agent", "data.tsv");
        tracker.add_message(TrackerKind::GeneralError, "boom".into());
        tracker.persist().await.unwrap();
    }
}
