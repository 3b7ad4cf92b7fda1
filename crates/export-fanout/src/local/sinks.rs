//! Row count table and completion queue backends

use anyhow::{Context, Result};
use async_trait::async_trait;
use export_common::types::{CommandFileState, CompleteDataFile};
use export_common::StorageError;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::info;

use crate::collaborators::{CompletionQueue, RowCountTable};

/// Row count records appended as JSON lines to a single file.
pub struct JsonlRowCountTable {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlRowCountTable {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl RowCountTable for JsonlRowCountTable {
    async fn insert_batch(&self, records: Vec<CommandFileState>) -> Result<()> {
        let mut data = String::new();
        for record in &records {
            data.push_str(&serde_json::to_string(record).map_err(StorageError::from)?);
            data.push('\n');
        }

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(StorageError::from)?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(StorageError::from)
            .with_context(|| format!("Failed to open row count table {}", self.path.display()))?;
        file.write_all(data.as_bytes())
            .await
            .map_err(StorageError::from)?;
        file.flush().await.map_err(StorageError::from)?;

        Ok(())
    }
}

/// Completion records held in memory, in the order they were signaled.
#[derive(Clone, Default)]
pub struct MemoryCompletionQueue {
    records: Arc<Mutex<Vec<CompleteDataFile>>>,
}

impl MemoryCompletionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<CompleteDataFile> {
        self.records.lock().await.clone()
    }
}

#[async_trait]
impl CompletionQueue for MemoryCompletionQueue {
    async fn enqueue(&self, record: CompleteDataFile) -> Result<()> {
        info!(
            agent_id = %record.agent_id,
            file = %record.file_tag,
            manifest = %record.manifest_tag,
            "Data file complete"
        );
        self.records.lock().await.push(record);
        Ok(())
    }
}
