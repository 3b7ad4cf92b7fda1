//! Empty-tier reclassification
//!
//! Files are queued by the size the storage layer reported when their
//! manifest was read. A file queued as Empty may since have reported a real
//! size, or may hold data while still reporting zero. Before an Empty item
//! is processed inline it is re-sized and, when it has data, routed to the
//! tier that fits.

use anyhow::{Context, Result};
use export_common::types::PendingDataFile;
use export_common::SizeTier;
use tracing::info;

use super::lease::LeaseRenewer;
use super::{FileProcessor, ProcessingResult};
use crate::collaborators::{DataFile, ProgressTracker, TrackerKind};

/// Bytes read from the head of a zero-size file to see if it has data.
pub const PROBE_WINDOW: usize = 512;

impl FileProcessor {
    /// Decide what to do with an existing file dequeued from the Empty tier.
    /// Returns the result and the tier the file belongs to now.
    pub(super) async fn reclassify_empty(
        &self,
        file: &PendingDataFile,
        data_file: &dyn DataFile,
        tracker: &dyn ProgressTracker,
        renewer: &LeaseRenewer,
    ) -> Result<(ProcessingResult, SizeTier)> {
        let size = data_file.size();

        if size > 0 {
            let tier = self.config.size_thresholds.tier_for(size);

            tracker.add_message(
                TrackerKind::BatchDataFiles,
                format!(
                    "Storage is reporting size data for file [{}] found at [{}]. File size is {} which classifies \
                     it as '{}'. Sending file to {} data file queue for processing.",
                    file.data_file_tag, file.data_file_path, size, tier, tier
                ),
            );

            info!(
                file = %file.data_file_tag,
                manifest = %file.manifest_tag,
                size,
                tier = %tier,
                "Enqueuing formerly empty data file to its size tier"
            );

            self.deps
                .queue
                .enqueue(tier, file.clone())
                .await
                .with_context(|| format!("Failed to enqueue formerly empty file to {} queue", tier))?;

            return Ok((ProcessingResult::CompleteQueued, tier));
        }

        let probe = renewer
            .guard(data_file.read_chunk(0, PROBE_WINDOW))
            .await
            .with_context(|| format!("Failed to probe zero size file {}", file.data_file_path))?;

        if !probe.is_empty() {
            info!(
                file = %file.data_file_tag,
                path = %file.data_file_path,
                probed = probe.len(),
                "Storage still reports zero size for a file with data; will retry once a real size is reported"
            );

            tracker.add_message(
                TrackerKind::BatchDataFiles,
                format!(
                    "Empty data file {} for manifest {} is still reporting as empty, but has at least {} bytes. \
                     Will retry later to see if storage reports a non-zero size",
                    file.data_file_tag,
                    file.manifest_tag,
                    probe.len()
                ),
            );

            return Ok((ProcessingResult::Incomplete, SizeTier::Empty));
        }

        info!(
            file = %file.data_file_tag,
            manifest = %file.manifest_tag,
            "Processing actually empty data file"
        );

        Ok((ProcessingResult::NeedsProcessing, SizeTier::Empty))
    }
}
