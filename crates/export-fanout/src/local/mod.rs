//! Local collaborator backends
//!
//! Data files are read from a directory tree, command output and sinks are
//! written to files, and the queue and locks live in memory. The binary
//! runs on these; tests mix them with their own doubles.

pub mod file_system;
pub mod lock;
pub mod queue;
pub mod sinks;
pub mod stats_file;
pub mod tracker;
pub mod writer;

use anyhow::{Context, Result};
use export_common::types::{FileSizeThresholds, PendingDataFile};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use crate::collaborators::{Clock, PartitionedQueue, SystemClock};
use crate::config::{FileProcessorConfig, LocalConfig, STATS_FILE_PERIOD};
use crate::processor::Collaborators;

use file_system::LocalFileSystem;
use lock::MemoryLockManager;
use queue::MemoryQueue;
use sinks::{JsonlRowCountTable, MemoryCompletionQueue};
use stats_file::{PeriodicFileWriter, COMMAND_STATS_PREFIX, FILE_STATS_PREFIX};
use tracker::LogTrackerFactory;
use writer::LocalWriterFactory;

/// Directory under the data root that holds files waiting to be processed.
pub const INBOX_DIR: &str = "inbox";

/// Collaborators wired to local backends, plus handles to the in-memory
/// ones so the caller can seed and inspect them.
pub struct LocalBackends {
    pub collaborators: Collaborators,
    pub queue: Arc<MemoryQueue>,
    pub locks: Arc<MemoryLockManager>,
    pub completions: Arc<MemoryCompletionQueue>,
}

pub async fn collaborators(
    config: &FileProcessorConfig,
    local: &LocalConfig,
) -> Result<LocalBackends> {
    tokio::fs::create_dir_all(&local.data_root)
        .await
        .with_context(|| format!("Failed to create data root {}", local.data_root.display()))?;
    tokio::fs::create_dir_all(&local.output_dir)
        .await
        .with_context(|| format!("Failed to create output dir {}", local.output_dir.display()))?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let queue = Arc::new(MemoryQueue::new());
    let locks = Arc::new(MemoryLockManager::new());
    let completions = Arc::new(MemoryCompletionQueue::new());

    let collaborators = Collaborators {
        queue: queue.clone(),
        locks: locks.clone(),
        file_system: Arc::new(LocalFileSystem::new(&local.data_root, clock.clone())),
        writers: Arc::new(LocalWriterFactory::new(
            &local.output_dir,
            local.known_commands.iter().cloned(),
        )),
        row_counts: Arc::new(JsonlRowCountTable::new(
            local.output_dir.join("row_counts.jsonl"),
        )),
        completions: completions.clone(),
        file_stats: Arc::new(PeriodicFileWriter::new(
            &config.stats_dir,
            FILE_STATS_PREFIX,
            STATS_FILE_PERIOD,
            clock.clone(),
        )),
        command_stats: Arc::new(PeriodicFileWriter::new(
            &config.stats_dir,
            COMMAND_STATS_PREFIX,
            STATS_FILE_PERIOD,
            clock.clone(),
        )),
        trackers: Arc::new(LogTrackerFactory::new(
            Some(local.output_dir.join("trackers")),
            clock.clone(),
        )),
        clock,
    };

    Ok(LocalBackends {
        collaborators,
        queue,
        locks,
        completions,
    })
}

/// Queue every file found under `<data_root>/inbox/<agent>/` on the tier
/// its size falls in. Returns how many files were queued.
pub async fn seed_inbox(
    data_root: &Path,
    queue: &dyn PartitionedQueue,
    thresholds: &FileSizeThresholds,
) -> Result<usize> {
    let inbox = data_root.join(INBOX_DIR);
    if !tokio::fs::try_exists(&inbox).await.unwrap_or(false) {
        warn!(inbox = %inbox.display(), "Inbox directory not found; nothing to seed");
        return Ok(0);
    }

    let mut queued = 0;
    let mut agents = tokio::fs::read_dir(&inbox)
        .await
        .with_context(|| format!("Failed to read inbox {}", inbox.display()))?;

    while let Some(agent_entry) = agents.next_entry().await? {
        if !agent_entry.file_type().await?.is_dir() {
            continue;
        }
        let agent_id = agent_entry.file_name().to_string_lossy().to_string();

        let mut files = tokio::fs::read_dir(agent_entry.path()).await?;
        while let Some(entry) = files.next_entry().await? {
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }

            let name = entry.file_name().to_string_lossy().to_string();
            let export_file_name = Path::new(&name)
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|| name.clone());
            let tier = thresholds.tier_for(metadata.len());

            let file = PendingDataFile {
                agent_id: agent_id.clone(),
                data_file_path: format!("{}/{}/{}", INBOX_DIR, agent_id, name),
                data_file_tag: format!("local.{}.{}", agent_id, name),
                manifest_tag: format!("local.{}.{}", agent_id, INBOX_DIR),
                export_file_name,
            };
            queue.enqueue(tier, file).await?;
            queued += 1;
        }
    }

    info!(queued, inbox = %inbox.display(), "Seeded queue from inbox");
    Ok(queued)
}
