//! Export data file processor
//!
//! A fixed pool of worker instances each runs a sequential
//! dequeue / process loop. One file is fully owned, split by command id,
//! closed, and committed before the instance dequeues the next. Two
//! background tasks aggregate instance counters and flush stats files.

pub mod commit;
pub mod counters;
pub mod dispatcher;
pub mod fanout;
pub mod lease;
pub mod partition;
pub mod reclassify;

use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::collaborators::{
    Clock, CommandWriterFactory, CompletionQueue, FileSystem, LockManager, PartitionedQueue,
    RowCountTable, StatsSink, TrackerFactory,
};
use crate::config::{FileProcessorConfig, COUNTER_UPDATE_FREQUENCY, STATS_FLUSH_FREQUENCY};

pub use counters::{GaugeSnapshot, InstanceCounters, TierGauge, WriterCounts};
pub use partition::PartitionAssignment;

/// Outcome of processing one dequeued item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingResult {
    /// Not finished; the item becomes visible again after a cooldown.
    Incomplete,
    /// Needs the normal row fan-out.
    NeedsProcessing,
    /// Processed here; writers closed, completion signaled, file retired.
    CompleteProcessed,
    /// Sent to a different tier queue; nothing processed here.
    CompleteQueued,
}

impl ProcessingResult {
    pub fn is_complete(&self) -> bool {
        matches!(
            self,
            ProcessingResult::CompleteProcessed | ProcessingResult::CompleteQueued
        )
    }
}

/// Everything the processor talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub queue: Arc<dyn PartitionedQueue>,
    pub locks: Arc<dyn LockManager>,
    pub file_system: Arc<dyn FileSystem>,
    pub writers: Arc<dyn CommandWriterFactory>,
    pub row_counts: Arc<dyn RowCountTable>,
    pub completions: Arc<dyn CompletionQueue>,
    pub file_stats: Arc<dyn StatsSink>,
    pub command_stats: Arc<dyn StatsSink>,
    pub trackers: Arc<dyn TrackerFactory>,
    pub clock: Arc<dyn Clock>,
}

pub struct FileProcessor {
    config: FileProcessorConfig,
    deps: Collaborators,
    assignment: PartitionAssignment,
    counters: InstanceCounters,
    gauges: RwLock<GaugeSnapshot>,
    host: String,
}

impl FileProcessor {
    pub fn new(config: FileProcessorConfig, deps: Collaborators) -> anyhow::Result<Self> {
        config.validate()?;

        let assignment = PartitionAssignment::from_config(&config);
        let counters = InstanceCounters::new(assignment.instance_count());

        Ok(Self {
            config,
            deps,
            assignment,
            counters,
            gauges: RwLock::new(GaugeSnapshot::default()),
            host: hostname::get()
                .unwrap_or_else(|_| "unknown".into())
                .to_string_lossy()
                .to_string(),
        })
    }

    pub fn config(&self) -> &FileProcessorConfig {
        &self.config
    }

    pub fn assignment(&self) -> &PartitionAssignment {
        &self.assignment
    }

    pub fn counters(&self) -> &InstanceCounters {
        &self.counters
    }

    /// Gauges as of the last aggregation pass.
    pub async fn gauges(&self) -> GaugeSnapshot {
        self.gauges.read().await.clone()
    }

    fn owner_id(&self, instance: usize) -> String {
        format!("{}-{}", self.host, instance)
    }

    /// Spawn every worker instance and both background tasks. All of them
    /// stop once `cancel` fires.
    pub fn start(self: Arc<Self>, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(self.assignment.instance_count() + 2);

        for instance in 0..self.assignment.instance_count() {
            let processor = self.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                processor.run_instance(instance, cancel).await;
            }));
        }

        let processor = self.clone();
        let counter_cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
            processor.run_counter_task(counter_cancel).await;
        }));

        handles.push(tokio::spawn(async move {
            self.run_stats_flush_task(cancel).await;
        }));

        handles
    }

    async fn run_instance(&self, instance: usize, cancel: CancellationToken) {
        info!(
            instance,
            tiers = ?self.assignment.tiers_for(instance),
            "File processor instance started"
        );

        while !cancel.is_cancelled() {
            let pause = match self.run_once(instance, &cancel).await {
                Ok(pause) => pause,
                Err(_) if cancel.is_cancelled() => break,
                Err(e) => {
                    error!(instance, error = ?e, "File processor cycle failed");
                    Some(self.config.delay_on_exception())
                },
            };

            if let Some(pause) = pause {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sleep(pause) => {},
                }
            }
        }

        info!(instance, "File processor instance stopped");
    }

    /// Refresh the published gauges from the instance slots.
    pub async fn update_periodic_counters(&self) -> GaugeSnapshot {
        let snapshot = self.counters.snapshot();

        debug!(
            in_progress = snapshot.in_progress,
            bytes_per_sec = snapshot.bytes_per_sec,
            rows_per_sec = snapshot.rows_per_sec,
            writers = snapshot.writers.total(),
            blob_store = snapshot.writers.real,
            dead_letter = snapshot.writers.dead_letter,
            abandoned = snapshot.writers.abandoned,
            "File processor counters"
        );

        *self.gauges.write().await = snapshot.clone();
        snapshot
    }

    async fn run_counter_task(&self, cancel: CancellationToken) {
        let mut ticker = interval(COUNTER_UPDATE_FREQUENCY);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.update_periodic_counters().await;
                },
            }
        }
    }

    /// Flush both stats writers.
    pub async fn flush_stats_files(&self) {
        let (files, commands) = tokio::join!(
            self.deps.file_stats.flush(),
            self.deps.command_stats.flush()
        );

        if let Err(e) = files {
            warn!(error = ?e, "Failed to flush file stats");
        }
        if let Err(e) = commands {
            warn!(error = ?e, "Failed to flush command stats");
        }
    }

    async fn run_stats_flush_task(&self, cancel: CancellationToken) {
        let mut ticker = interval(STATS_FLUSH_FREQUENCY);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.flush_stats_files().await,
            }
        }

        // lines queued by the last files processed before shutdown
        self.flush_stats_files().await;
    }
}
