//! Contracts the file processor depends on
//!
//! Queue, lock, file system, writers, and sinks are all behind these traits
//! so the processing core can run against production storage, the local
//! backends in [`crate::local`], or test doubles.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use export_common::types::{CommandFileState, CompleteDataFile, PendingDataFile};
use export_common::{SizeTier, StorageError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncBufRead;
use tokio_util::sync::CancellationToken;

/// Buffered line source over a data file.
pub type DataReader = Box<dyn AsyncBufRead + Send + Unpin>;

// ============================================================================
// Clock
// ============================================================================

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

// ============================================================================
// Partitioned Queue
// ============================================================================

/// Queue-delivered envelope around a pending data file.
#[async_trait]
pub trait WorkItem: Send + Sync {
    fn data(&self) -> &PendingDataFile;

    /// Number of times this item has been handed out, this delivery included.
    fn dequeue_count(&self) -> u32;

    /// Hide the item from other consumers for `duration` from now.
    async fn renew_lease(&self, duration: Duration) -> Result<bool>;

    /// Remove the item from the queue.
    async fn complete(&self) -> Result<()>;
}

/// A dequeued item together with the tier queue it came from.
pub struct PartitionedItem {
    pub tier: SizeTier,
    pub item: Arc<dyn WorkItem>,
}

#[async_trait]
pub trait PartitionedQueue: Send + Sync {
    /// Dequeue from the first tier in `tiers` that has a visible item.
    async fn dequeue(
        &self,
        tiers: &[SizeTier],
        lease: Duration,
        wait: Duration,
    ) -> Result<Option<PartitionedItem>>;

    async fn enqueue(&self, tier: SizeTier, file: PendingDataFile) -> Result<()>;
}

// ============================================================================
// File Locks
// ============================================================================

#[async_trait]
pub trait FileLease: Send + Sync {
    async fn renew(&self, duration: Duration) -> Result<bool>;

    /// Give up ownership. `completed` tells the manager whether the work the
    /// lock guarded finished.
    async fn release(&self, completed: bool) -> Result<()>;
}

#[async_trait]
pub trait LockManager: Send + Sync {
    /// Try to take the advisory lock `scope/name` for `owner`. Returns
    /// `None` when someone else holds it and `wait_for_lock` is false.
    async fn try_acquire(
        &self,
        scope: &str,
        name: &str,
        owner: &str,
        lease: Duration,
        wait_for_lock: bool,
    ) -> Result<Option<Arc<dyn FileLease>>>;
}

// ============================================================================
// File System
// ============================================================================

#[async_trait]
pub trait DataFile: Send + Sync {
    fn name(&self) -> &str;
    fn path(&self) -> &str;
    fn size(&self) -> u64;
    fn created(&self) -> DateTime<Utc>;

    async fn read_chunk(&self, offset: u64, len: usize) -> Result<Vec<u8>>;

    /// Line reader over the file contents. `None` when the file has no
    /// readable stream.
    async fn data_reader(&self) -> Result<Option<DataReader>>;

    /// Move the file into `relative_dir` (relative to the file system root),
    /// replacing any file of the same name there.
    async fn move_relative(&self, relative_dir: &str) -> Result<()>;

    async fn set_expiry(&self, ttl: Duration) -> Result<()>;
}

#[async_trait]
pub trait FileSystem: Send + Sync {
    async fn open_existing(&self, path: &str) -> Result<Option<Arc<dyn DataFile>>>;
}

// ============================================================================
// Command Writers
// ============================================================================

/// Destination a writer was created for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WriterOrigin {
    BlobStore,
    DeadLetter,
    Discard,
}

impl WriterOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            WriterOrigin::BlobStore => "NormalDataWriter",
            WriterOrigin::DeadLetter => "DeadLetterWriter",
            WriterOrigin::Discard => "AbandonedGeneral",
        }
    }

    /// Bucket used by file stats lines, which group writers by origin.
    pub fn category(&self) -> WriterCategory {
        match self {
            WriterOrigin::BlobStore => WriterCategory::Normal,
            WriterOrigin::DeadLetter => WriterCategory::DeadLetter,
            WriterOrigin::Discard => WriterCategory::Abandoned,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AbandonReason {
    NotApplicable,
    AlreadyComplete,
    NoStorage,
    NoDeadLetter,
    WriteError,
    Test,
    General,
}

impl AbandonReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            AbandonReason::NotApplicable => "AbandonedNotApplicable",
            AbandonReason::AlreadyComplete => "AbandonedAlreadyComplete",
            AbandonReason::NoStorage => "AbandonedNoStorage",
            AbandonReason::NoDeadLetter => "AbandonedNoDeadLetter",
            AbandonReason::WriteError => "AbandonedWriteError",
            AbandonReason::Test => "AbandonedTest",
            AbandonReason::General => "AbandonedGeneral",
        }
    }
}

/// Where a writer's data goes, and why it stopped going there if it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriterStatus {
    pub origin: WriterOrigin,
    pub abandoned: Option<AbandonReason>,
}

/// Reporting bucket for writer counts and stats lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WriterCategory {
    Normal,
    DeadLetter,
    Abandoned,
}

impl WriterStatus {
    pub fn new(origin: WriterOrigin) -> Self {
        Self {
            origin,
            abandoned: None,
        }
    }

    pub fn abandoned(origin: WriterOrigin, reason: AbandonReason) -> Self {
        Self {
            origin,
            abandoned: Some(reason),
        }
    }

    pub fn category(&self) -> WriterCategory {
        match (self.origin, self.abandoned) {
            (_, Some(_)) | (WriterOrigin::Discard, None) => WriterCategory::Abandoned,
            (WriterOrigin::DeadLetter, None) => WriterCategory::DeadLetter,
            (WriterOrigin::BlobStore, None) => WriterCategory::Normal,
        }
    }

    /// Abandon reason column of the command stats line.
    pub fn abandon_label(&self) -> &'static str {
        match (self.origin, self.abandoned) {
            (_, Some(reason)) => reason.as_str(),
            (WriterOrigin::Discard, None) => AbandonReason::General.as_str(),
            _ => "None",
        }
    }
}

/// How the writer treats faults that may or may not clear on retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TransientFailureMode {
    #[default]
    AssumeTransient,
    AssumeNonTransient,
}

/// One output file produced by a writer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriterFileDetail {
    pub file_name: String,
    pub product_id: String,
    pub size: u64,
    pub row_count: u64,
}

/// Per-(file, command) output channel.
///
/// `write` returns the signed change in pending bytes; `flush` returns how
/// many pending bytes it wrote out. After a non-transient fault the writer
/// records `last_error`, drops its pending buffer, and reports itself
/// abandoned.
#[async_trait]
pub trait CommandWriter: Send + Sync {
    fn command_id(&self) -> &str;
    fn size(&self) -> u64;
    fn row_count(&self) -> u64;
    fn pending_size(&self) -> u64;
    fn status(&self) -> WriterStatus;
    fn last_error(&self) -> Option<String>;

    /// Whether the command feed consumes row counts for this writer.
    fn log_for_command_feed(&self) -> bool;
    fn file_details(&self) -> Vec<WriterFileDetail>;
    fn set_transient_failure_mode(&mut self, mode: TransientFailureMode);

    async fn write(
        &mut self,
        product_id: &str,
        payload: &str,
        pending_threshold: u64,
    ) -> std::result::Result<i64, StorageError>;

    async fn flush(&mut self) -> std::result::Result<i64, StorageError>;

    async fn close(&mut self) -> std::result::Result<(), StorageError>;
}

#[async_trait]
pub trait CommandWriterFactory: Send + Sync {
    async fn create(
        &self,
        cancel: &CancellationToken,
        agent_id: &str,
        command_id: &str,
        export_name: &str,
    ) -> Result<Box<dyn CommandWriter>>;
}

// ============================================================================
// Sinks
// ============================================================================

#[async_trait]
pub trait RowCountTable: Send + Sync {
    async fn insert_batch(&self, records: Vec<CommandFileState>) -> Result<()>;
}

#[async_trait]
pub trait CompletionQueue: Send + Sync {
    async fn enqueue(&self, record: CompleteDataFile) -> Result<()>;
}

/// Buffered writer of periodic flat files.
#[async_trait]
pub trait StatsSink: Send + Sync {
    async fn queue_write(&self, data: String) -> Result<()>;
    async fn flush(&self) -> Result<()>;
}

// ============================================================================
// Progress Tracking
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackerKind {
    GeneralError,
    DataFileError,
    DataFileComplete,
    DataFileCommand,
    BatchDataFiles,
}

impl TrackerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackerKind::GeneralError => "GeneralError",
            TrackerKind::DataFileError => "DataFileError",
            TrackerKind::DataFileComplete => "DataFileComplete",
            TrackerKind::DataFileCommand => "DataFileCommand",
            TrackerKind::BatchDataFiles => "BatchDataFiles",
        }
    }
}

/// Per-file activity log, persisted once processing of the file ends.
#[async_trait]
pub trait ProgressTracker: Send + Sync {
    fn add_message(&self, kind: TrackerKind, message: String);
    async fn persist(&self) -> Result<()>;
}

pub trait TrackerFactory: Send + Sync {
    fn create(&self, agent_id: &str, file_name: &str) -> Arc<dyn ProgressTracker>;
}
