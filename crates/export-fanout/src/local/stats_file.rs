//! Periodic flat-file stats writer
//!
//! Lines are buffered in memory and appended on flush to a file named after
//! the period the flush falls in: `<prefix>_yyyy_MM_dd_HH.tsv` for hourly
//! periods.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use crate::collaborators::{Clock, StatsSink};

pub const FILE_STATS_PREFIX: &str = "FileStats";
pub const COMMAND_STATS_PREFIX: &str = "CommandStats";

pub struct PeriodicFileWriter {
    dir: PathBuf,
    prefix: String,
    period: Duration,
    clock: Arc<dyn Clock>,
    buffer: Mutex<String>,
}

impl PeriodicFileWriter {
    pub fn new(
        dir: impl Into<PathBuf>,
        prefix: impl Into<String>,
        period: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
            period,
            clock,
            buffer: Mutex::new(String::new()),
        }
    }

    /// File that a flush at `now` appends to.
    pub fn path_for(&self, now: DateTime<Utc>) -> PathBuf {
        let period = (self.period.as_secs() as i64).max(1);
        let start = now.timestamp() - now.timestamp().rem_euclid(period);
        let start = DateTime::<Utc>::from_timestamp(start, 0).unwrap_or(now);
        self.dir.join(format!(
            "{}_{}.tsv",
            self.prefix,
            start.format("%Y_%m_%d_%H")
        ))
    }
}

#[async_trait]
impl StatsSink for PeriodicFileWriter {
    async fn queue_write(&self, data: String) -> Result<()> {
        self.buffer.lock().await.push_str(&data);
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        let mut buffer = self.buffer.lock().await;
        if buffer.is_empty() {
            return Ok(());
        }

        let path = self.path_for(self.clock.now());
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create stats dir {}", self.dir.display()))?;

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("Failed to open stats file {}", path.display()))?;
        file.write_all(buffer.as_bytes()).await?;
        file.flush().await?;

        debug!(path = %path.display(), bytes = buffer.len(), "Flushed stats");
        // only drop lines once they are on disk
        buffer.clear();
        Ok(())
    }
}
