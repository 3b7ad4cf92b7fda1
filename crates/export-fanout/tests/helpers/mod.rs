//! Test helpers for file processor integration tests
//!
//! This module provides:
//! - Recording doubles for the tracker, writers and sinks
//! - A capturing tracing layer for asserting on emitted events
//! - A [`Harness`] wiring them, plus the in-memory queue, locks and file
//!   system, into a [`FileProcessor`]
//! - Pending file builders

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use export_common::types::{CommandFileState, PendingDataFile};
use export_common::{SizeTier, StorageError};
use export_fanout::collaborators::{
    Clock, CommandWriter, CommandWriterFactory, ProgressTracker, RowCountTable, StatsSink,
    TrackerFactory, TrackerKind, TransientFailureMode, WriterFileDetail, WriterOrigin,
    WriterStatus,
};
use export_fanout::local::file_system::MemoryFileSystem;
use export_fanout::local::lock::MemoryLockManager;
use export_fanout::local::queue::MemoryQueue;
use export_fanout::local::sinks::MemoryCompletionQueue;
use export_fanout::{Collaborators, FileProcessor, FileProcessorConfig};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

pub const AGENT: &str = "agent1";

/// Install a test subscriber once; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("export_fanout=debug")
        .with_test_writer()
        .try_init();
}

/// One event seen by [`CapturedEvents`].
#[derive(Debug, Clone)]
pub struct CapturedEvent {
    pub level: Level,
    pub fields: BTreeMap<String, String>,
}

impl CapturedEvent {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

struct FieldRecorder<'a>(&'a mut BTreeMap<String, String>);

impl Visit for FieldRecorder<'_> {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.0.insert(field.name().to_string(), value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.0.insert(field.name().to_string(), format!("{:?}", value));
    }
}

/// Layer that keeps every event emitted while installed.
#[derive(Clone, Default)]
pub struct CapturedEvents(Arc<Mutex<Vec<CapturedEvent>>>);

impl CapturedEvents {
    /// Capture events on the current thread until the guard drops.
    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        tracing::subscriber::set_default(tracing_subscriber::registry().with(self.clone()))
    }

    /// Events whose `name` field equals `value`.
    pub fn with_field(&self, name: &str, value: &str) -> Vec<CapturedEvent> {
        self.0
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.field(name) == Some(value))
            .cloned()
            .collect()
    }
}

impl<S: Subscriber> Layer<S> for CapturedEvents {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut fields = BTreeMap::new();
        event.record(&mut FieldRecorder(&mut fields));
        self.0.lock().unwrap().push(CapturedEvent {
            level: *event.metadata().level(),
            fields,
        });
    }
}

pub fn pending(name: &str) -> PendingDataFile {
    PendingDataFile {
        agent_id: AGENT.into(),
        data_file_path: format!("{}/{}", AGENT, name),
        data_file_tag: format!("store.{}.{}", AGENT, name),
        manifest_tag: format!("store.{}.manifest_01", AGENT),
        export_file_name: "export".into(),
    }
}

/// Config for a single instance serving every tier.
pub fn config() -> FileProcessorConfig {
    FileProcessorConfig {
        instance_count: 1,
        dequeue_wait_secs: 0,
        ..Default::default()
    }
}

// ============================================================================
// Clock
// ============================================================================

pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

// ============================================================================
// Tracker
// ============================================================================

#[derive(Default)]
pub struct RecordingTracker {
    pub messages: Mutex<Vec<(TrackerKind, String)>>,
    pub persisted: Mutex<bool>,
}

#[async_trait]
impl ProgressTracker for RecordingTracker {
    fn add_message(&self, kind: TrackerKind, message: String) {
        self.messages.lock().unwrap().push((kind, message));
    }

    async fn persist(&self) -> Result<()> {
        *self.persisted.lock().unwrap() = true;
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingTrackerFactory {
    pub trackers: Mutex<Vec<(String, Arc<RecordingTracker>)>>,
}

impl RecordingTrackerFactory {
    pub fn messages(&self) -> Vec<(TrackerKind, String)> {
        self.trackers
            .lock()
            .unwrap()
            .iter()
            .flat_map(|(_, t)| t.messages.lock().unwrap().clone())
            .collect()
    }

    pub fn messages_of(&self, kind: TrackerKind) -> Vec<String> {
        self.messages()
            .into_iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, m)| m)
            .collect()
    }

    pub fn all_persisted(&self) -> bool {
        self.trackers
            .lock()
            .unwrap()
            .iter()
            .all(|(_, t)| *t.persisted.lock().unwrap())
    }
}

impl TrackerFactory for RecordingTrackerFactory {
    fn create(&self, agent_id: &str, file_name: &str) -> Arc<dyn ProgressTracker> {
        let tracker = Arc::new(RecordingTracker::default());
        self.trackers
            .lock()
            .unwrap()
            .push((format!("{}/{}", agent_id, file_name), tracker.clone()));
        tracker
    }
}

// ============================================================================
// Writers
// ============================================================================

/// What one command's writer saw.
#[derive(Debug, Default, Clone)]
pub struct WriterRecord {
    pub rows: Vec<(String, String)>,
    pub write_calls: usize,
    pub flushes: usize,
    pub closed: bool,
    pub mode: Option<TransientFailureMode>,
}

#[derive(Default)]
pub struct WriterLog {
    pub writers: BTreeMap<String, WriterRecord>,
    pub pending: BTreeMap<String, u64>,
    /// Largest total pending seen across writers at the start of a write
    pub max_pending_before_write: u64,
}

/// Storage fault a writer raises from `close`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseFault {
    NonTransient,
    Transient,
}

/// Writers that keep rows in memory. Commands in `failing` raise a
/// non-transient fault on their second write; commands in `close_faults`
/// fail to close.
#[derive(Clone, Default)]
pub struct MemoryWriterFactory {
    pub log: Arc<Mutex<WriterLog>>,
    pub failing: Arc<HashSet<String>>,
    pub dead_letter: Arc<HashSet<String>>,
    pub close_faults: Arc<BTreeMap<String, CloseFault>>,
}

impl MemoryWriterFactory {
    pub fn failing(commands: &[&str]) -> Self {
        Self {
            failing: Arc::new(commands.iter().map(|c| c.to_string()).collect()),
            ..Default::default()
        }
    }

    pub fn dead_letter(commands: &[&str]) -> Self {
        Self {
            dead_letter: Arc::new(commands.iter().map(|c| c.to_string()).collect()),
            ..Default::default()
        }
    }

    pub fn with_close_fault(mut self, command_id: &str, fault: CloseFault) -> Self {
        Arc::make_mut(&mut self.close_faults).insert(command_id.to_string(), fault);
        self
    }

    pub fn record(&self, command_id: &str) -> Option<WriterRecord> {
        self.log.lock().unwrap().writers.get(command_id).cloned()
    }

    pub fn commands(&self) -> Vec<String> {
        self.log.lock().unwrap().writers.keys().cloned().collect()
    }

    pub fn max_pending_before_write(&self) -> u64 {
        self.log.lock().unwrap().max_pending_before_write
    }
}

#[async_trait]
impl CommandWriterFactory for MemoryWriterFactory {
    async fn create(
        &self,
        _cancel: &CancellationToken,
        _agent_id: &str,
        command_id: &str,
        _export_name: &str,
    ) -> Result<Box<dyn CommandWriter>> {
        self.log
            .lock()
            .unwrap()
            .writers
            .insert(command_id.to_string(), WriterRecord::default());

        let origin = if self.dead_letter.contains(command_id) {
            WriterOrigin::DeadLetter
        } else {
            WriterOrigin::BlobStore
        };

        Ok(Box::new(MemoryWriter {
            command_id: command_id.to_string(),
            origin,
            fail_on_second_write: self.failing.contains(command_id),
            close_fault: self.close_faults.get(command_id).copied(),
            log: self.log.clone(),
            products: BTreeMap::new(),
            size: 0,
            rows: 0,
            pending: 0,
            last_error: None,
        }))
    }
}

pub struct MemoryWriter {
    command_id: String,
    origin: WriterOrigin,
    fail_on_second_write: bool,
    close_fault: Option<CloseFault>,
    log: Arc<Mutex<WriterLog>>,
    products: BTreeMap<String, (u64, u64)>,
    size: u64,
    rows: u64,
    pending: u64,
    last_error: Option<String>,
}

impl MemoryWriter {
    fn set_pending(&mut self, pending: u64) {
        self.pending = pending;
        self.log
            .lock()
            .unwrap()
            .pending
            .insert(self.command_id.clone(), pending);
    }

    fn drain(&mut self) -> u64 {
        let flushed = self.pending;
        self.set_pending(0);
        if let Some(record) = self.log.lock().unwrap().writers.get_mut(&self.command_id) {
            record.flushes += 1;
        }
        flushed
    }
}

#[async_trait]
impl CommandWriter for MemoryWriter {
    fn command_id(&self) -> &str {
        &self.command_id
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn row_count(&self) -> u64 {
        self.rows
    }

    fn pending_size(&self) -> u64 {
        self.pending
    }

    fn status(&self) -> WriterStatus {
        WriterStatus::new(self.origin)
    }

    fn last_error(&self) -> Option<String> {
        self.last_error.clone()
    }

    fn log_for_command_feed(&self) -> bool {
        self.origin == WriterOrigin::BlobStore
    }

    fn file_details(&self) -> Vec<WriterFileDetail> {
        self.products
            .iter()
            .map(|(product_id, (size, rows))| WriterFileDetail {
                file_name: format!("{}/export_{}.tsv", self.command_id, product_id),
                product_id: product_id.clone(),
                size: *size,
                row_count: *rows,
            })
            .collect()
    }

    fn set_transient_failure_mode(&mut self, mode: TransientFailureMode) {
        if let Some(record) = self.log.lock().unwrap().writers.get_mut(&self.command_id) {
            record.mode = Some(mode);
        }
    }

    async fn write(
        &mut self,
        product_id: &str,
        payload: &str,
        pending_threshold: u64,
    ) -> std::result::Result<i64, StorageError> {
        let calls = {
            let mut log = self.log.lock().unwrap();
            let total: u64 = log.pending.values().sum();
            log.max_pending_before_write = log.max_pending_before_write.max(total);
            let record = log.writers.entry(self.command_id.clone()).or_default();
            record.write_calls += 1;
            record.write_calls
        };

        if self.fail_on_second_write && calls >= 2 {
            let err = StorageError::non_transient("ContainerNotFound", "container deleted");
            self.last_error = Some(err.to_string());
            self.set_pending(0);
            return Err(err);
        }

        let added = payload.len() as u64 + 1;
        let product = self.products.entry(product_id.to_string()).or_default();
        product.0 += added;
        product.1 += 1;
        self.size += added;
        self.rows += 1;
        if let Some(record) = self.log.lock().unwrap().writers.get_mut(&self.command_id) {
            record.rows.push((product_id.to_string(), payload.to_string()));
        }

        self.set_pending(self.pending + added);
        if self.pending > pending_threshold {
            let flushed = self.drain();
            return Ok(added as i64 - flushed as i64);
        }
        Ok(added as i64)
    }

    async fn flush(&mut self) -> std::result::Result<i64, StorageError> {
        Ok(self.drain() as i64)
    }

    async fn close(&mut self) -> std::result::Result<(), StorageError> {
        self.drain();
        match self.close_fault {
            Some(CloseFault::NonTransient) => {
                let err = StorageError::non_transient("AuthorizationFailure", "access revoked");
                self.last_error = Some(err.to_string());
                return Err(err);
            },
            Some(CloseFault::Transient) => {
                return Err(StorageError::transient("ServerBusy", "commit timed out"));
            },
            None => {},
        }
        if let Some(record) = self.log.lock().unwrap().writers.get_mut(&self.command_id) {
            record.closed = true;
        }
        Ok(())
    }
}

// ============================================================================
// Sinks
// ============================================================================

#[derive(Default)]
pub struct RecordingStatsSink {
    pub queued: Mutex<Vec<String>>,
    pub flushes: Mutex<usize>,
}

impl RecordingStatsSink {
    pub fn lines(&self) -> Vec<String> {
        self.queued
            .lock()
            .unwrap()
            .iter()
            .flat_map(|d| d.lines().map(str::to_string).collect::<Vec<_>>())
            .collect()
    }
}

#[async_trait]
impl StatsSink for RecordingStatsSink {
    async fn queue_write(&self, data: String) -> Result<()> {
        self.queued.lock().unwrap().push(data);
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        *self.flushes.lock().unwrap() += 1;
        Ok(())
    }
}

/// How [`MemoryRowTable`] rejects inserts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertFault {
    Storage,
    Other,
}

#[derive(Default)]
pub struct MemoryRowTable {
    pub records: Mutex<Vec<CommandFileState>>,
    /// Size of every insert call, accepted or not
    pub batch_sizes: Mutex<Vec<usize>>,
    pub fault: Mutex<Option<InsertFault>>,
}

impl MemoryRowTable {
    pub fn fail_with(&self, fault: InsertFault) {
        *self.fault.lock().unwrap() = Some(fault);
    }

    pub fn sorted_batch_sizes(&self) -> Vec<usize> {
        let mut sizes = self.batch_sizes.lock().unwrap().clone();
        sizes.sort_unstable();
        sizes
    }
}

#[async_trait]
impl RowCountTable for MemoryRowTable {
    async fn insert_batch(&self, records: Vec<CommandFileState>) -> Result<()> {
        self.batch_sizes.lock().unwrap().push(records.len());
        match *self.fault.lock().unwrap() {
            Some(InsertFault::Storage) => {
                return Err(StorageError::transient("TableUnavailable", "table offline").into())
            },
            Some(InsertFault::Other) => anyhow::bail!("row count schema mismatch"),
            None => {},
        }
        self.records.lock().unwrap().extend(records);
        Ok(())
    }
}

// ============================================================================
// Harness
// ============================================================================

pub struct Harness {
    pub processor: Arc<FileProcessor>,
    pub queue: MemoryQueue,
    pub locks: MemoryLockManager,
    pub files: MemoryFileSystem,
    pub writers: MemoryWriterFactory,
    pub trackers: Arc<RecordingTrackerFactory>,
    pub completions: MemoryCompletionQueue,
    pub row_counts: Arc<MemoryRowTable>,
    pub file_stats: Arc<RecordingStatsSink>,
    pub command_stats: Arc<RecordingStatsSink>,
    pub cancel: CancellationToken,
}

impl Harness {
    pub fn new(config: FileProcessorConfig) -> Self {
        Self::with_writers(config, MemoryWriterFactory::default())
    }

    pub fn with_writers(config: FileProcessorConfig, writers: MemoryWriterFactory) -> Self {
        init_tracing();

        let queue = MemoryQueue::new();
        let locks = MemoryLockManager::new();
        let files = MemoryFileSystem::new();
        let trackers = Arc::new(RecordingTrackerFactory::default());
        let completions = MemoryCompletionQueue::new();
        let row_counts = Arc::new(MemoryRowTable::default());
        let file_stats = Arc::new(RecordingStatsSink::default());
        let command_stats = Arc::new(RecordingStatsSink::default());

        let deps = Collaborators {
            queue: Arc::new(queue.clone()),
            locks: Arc::new(locks.clone()),
            file_system: Arc::new(files.clone()),
            writers: Arc::new(writers.clone()),
            row_counts: row_counts.clone(),
            completions: Arc::new(completions.clone()),
            file_stats: file_stats.clone(),
            command_stats: command_stats.clone(),
            trackers: trackers.clone(),
            clock: Arc::new(FixedClock(Utc::now())),
        };

        let processor = Arc::new(FileProcessor::new(config, deps).expect("valid config"));

        Self {
            processor,
            queue,
            locks,
            files,
            writers,
            trackers,
            completions,
            row_counts,
            file_stats,
            command_stats,
            cancel: CancellationToken::new(),
        }
    }

    /// Store `contents` under the pending file's path and queue it.
    pub async fn add_file(&self, tier: SizeTier, file: &PendingDataFile, contents: &str) {
        self.add_bytes(tier, file, contents.as_bytes()).await;
    }

    pub async fn add_bytes(&self, tier: SizeTier, file: &PendingDataFile, contents: &[u8]) {
        use export_fanout::collaborators::PartitionedQueue;

        self.files.insert(&file.data_file_path, contents).await;
        self.queue.enqueue(tier, file.clone()).await.unwrap();
    }

    pub async fn run_once(&self) -> Result<Option<std::time::Duration>> {
        self.processor.run_once(0, &self.cancel).await
    }
}
