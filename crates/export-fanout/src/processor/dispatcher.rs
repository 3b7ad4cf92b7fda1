//! One dequeue / process cycle of a worker instance

use anyhow::{Context, Result};
use export_common::types::PendingDataFile;
use export_common::SizeTier;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::lease::{FileLockLease, LeaseRenewer, QueueItemLease, Renewable};
use super::{FileProcessor, ProcessingResult};
use crate::collaborators::{PartitionedItem, ProgressTracker, TrackerKind, WorkItem};
use crate::config::EMPTY_QUEUE_PAUSE;
use crate::error::{find_stream_error, StreamError};

impl FileProcessor {
    /// Dequeue and fully handle at most one file.
    ///
    /// Returns the pause the instance should take before its next cycle:
    /// [`EMPTY_QUEUE_PAUSE`] when there was nothing to do, `None` otherwise.
    /// Whatever happens after a successful dequeue, the item is either
    /// completed or made visible again after the incomplete delay.
    pub async fn run_once(
        &self,
        instance: usize,
        cancel: &CancellationToken,
    ) -> Result<Option<Duration>> {
        if cancel.is_cancelled() {
            anyhow::bail!("File processor instance {} cancelled", instance);
        }

        let tiers = self.assignment.tiers_for(instance);
        if tiers.is_empty() {
            return Ok(Some(EMPTY_QUEUE_PAUSE));
        }

        let dequeued = self
            .deps
            .queue
            .dequeue(tiers, self.config.lease_duration(), self.config.dequeue_wait())
            .await
            .context("Failed to dequeue pending data file")?;

        let Some(PartitionedItem { tier, item }) = dequeued else {
            return Ok(Some(EMPTY_QUEUE_PAUSE));
        };

        let file = item.data().clone();
        debug!(instance, tier = %tier, file = %file.data_file_tag, "Dequeued pending data file");

        if item.dequeue_count() > self.config.max_dequeue_count {
            warn!(
                event = "MaxDequeueCountExceeded",
                file = %file.data_file_tag,
                dequeue_count = item.dequeue_count(),
                max_dequeue_count = self.config.max_dequeue_count,
                "Pending data file exceeded the max dequeue count; abandoning until it is enqueued again"
            );
            item.complete()
                .await
                .context("Failed to complete poisoned queue item")?;
            return Ok(None);
        }

        let outcome = self.process_item(instance, tier, &item, &file, cancel).await;
        let complete = matches!(outcome, Ok(true));

        let released = if complete {
            item.complete().await
        } else {
            item.renew_lease(self.config.delay_if_incomplete())
                .await
                .map(|_| ())
        };

        if let Err(e) = outcome {
            if let Err(release_error) = released {
                error!(
                    file = %file.data_file_tag,
                    error = ?release_error,
                    "Failed to release queue item after a processing error"
                );
            }
            return Err(e);
        }

        released.context("Failed to release queue item")?;
        Ok(None)
    }

    /// Lock the file, process it, and clean up. Returns whether the item is
    /// done and can be removed from the queue.
    async fn process_item(
        &self,
        instance: usize,
        tier: SizeTier,
        item: &Arc<dyn WorkItem>,
        file: &PendingDataFile,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        if cancel.is_cancelled() {
            anyhow::bail!("File processor instance {} cancelled", instance);
        }

        let lease = self
            .deps
            .locks
            .try_acquire(
                &file.agent_id,
                &file.data_file_path,
                &self.owner_id(instance),
                self.config.lease_duration(),
                false,
            )
            .await
            .context("Failed to acquire data file lock")?;

        let Some(lease) = lease else {
            debug!(file = %file.data_file_tag, "Data file is locked by another worker; skipping");
            return Ok(false);
        };

        if let Some(slot) = self.counters.slot(instance) {
            slot.set_in_progress(tier);
        }

        let tracker = self.deps.trackers.create(&file.agent_id, file.data_file_name());
        info!(instance, tier = %tier, file = %file.data_file_tag, "Processing pending data file");

        let leases: Vec<Box<dyn Renewable>> = vec![
            Box::new(FileLockLease(lease.clone())),
            Box::new(QueueItemLease(item.clone())),
        ];
        let renewer = LeaseRenewer::new(
            leases,
            self.config.lease_duration(),
            self.config.renew_frequency(),
            file.data_file_tag.clone(),
        );

        let started = Instant::now();
        let result = self
            .process_request(instance, tier, file, tracker.as_ref(), &renewer, cancel)
            .await;

        let complete = match &result {
            Ok((ProcessingResult::CompleteProcessed, _)) => {
                self.counters.record_completed(tier);
                info!(
                    tier = %tier,
                    file = %file.data_file_tag,
                    elapsed_secs = started.elapsed().as_secs(),
                    "Completed processing pending data file"
                );
                true
            },
            Ok((ProcessingResult::CompleteQueued, new_tier)) => {
                info!(
                    file = %file.data_file_tag,
                    tier = %new_tier,
                    "Empty data file found to have data; queued to its size tier"
                );
                true
            },
            Ok((ProcessingResult::Incomplete, _)) => {
                info!(
                    file = %file.data_file_tag,
                    "Empty data file has data but still reports zero size; will retry"
                );
                false
            },
            Ok((ProcessingResult::NeedsProcessing, _)) => false,
            Err(e) => {
                self.report_failure(file, tracker.as_ref(), e);
                false
            },
        };

        if let Some(slot) = self.counters.slot(instance) {
            slot.reset();
        }

        if let Err(e) = lease.release(complete).await {
            error!(file = %file.data_file_tag, error = ?e, "Failed to release data file lock");
        }
        if let Err(e) = tracker.persist().await {
            error!(file = %file.data_file_tag, error = ?e, "Failed to persist progress tracker");
        }

        result.map(|_| complete)
    }

    fn report_failure(&self, file: &PendingDataFile, tracker: &dyn ProgressTracker, err: &anyhow::Error) {
        tracker.add_message(
            TrackerKind::GeneralError,
            format!("Unexpected error ({}) occurred during processing. Will retry later.", err),
        );

        if let Some(StreamError::EarlyStreamEnd {
            file: stream_file,
            offset,
            expected,
        }) = find_stream_error(err)
        {
            error!(
                event = "EarlyStreamEnd",
                agent_id = %file.agent_id,
                file = %stream_file,
                offset,
                expected,
                details = %err,
                "Storage returned a stream shorter than the file size"
            );
        }
    }

    /// Open the file, reclassify it if it came off the Empty tier, and run
    /// the fan-out when it needs processing here.
    async fn process_request(
        &self,
        instance: usize,
        tier: SizeTier,
        file: &PendingDataFile,
        tracker: &dyn ProgressTracker,
        renewer: &LeaseRenewer,
        cancel: &CancellationToken,
    ) -> Result<(ProcessingResult, SizeTier)> {
        let data_file = renewer
            .guard(self.deps.file_system.open_existing(&file.data_file_path))
            .await
            .with_context(|| format!("Failed to open data file {}", file.data_file_path))?;

        let mut result = ProcessingResult::NeedsProcessing;
        let mut new_tier = tier;

        if let (Some(data_file), SizeTier::Empty) = (&data_file, tier) {
            (result, new_tier) = self
                .reclassify_empty(file, data_file.as_ref(), tracker, renewer)
                .await?;
        }

        if result == ProcessingResult::NeedsProcessing {
            if let Some(data_file) = &data_file {
                if new_tier == SizeTier::Oversize {
                    error!(
                        event = "ExcessiveBatchFileSize",
                        agent_id = %file.agent_id,
                        manifest = %file.manifest_tag,
                        file = %data_file.name(),
                        size = data_file.size(),
                        "Data file is in the oversize tier"
                    );
                }
            }

            result = self
                .process_data_file(
                    instance,
                    tier,
                    file,
                    data_file.as_ref(),
                    tracker,
                    renewer,
                    cancel,
                )
                .await?;
        }

        Ok((result, new_tier))
    }
}
