//! Closing writers and committing a processed file
//!
//! Once the row loop ends (normally or not) every writer is closed, the
//! per-command row counts are written for the command feed, and the tracker
//! and stats sinks receive one line per writer output plus one per file.
//! Only then is completion signaled and the source moved to holding.

use anyhow::{Context, Result};
use export_common::error::is_storage_error;
use export_common::types::{CommandFileState, CompleteDataFile, PendingDataFile};
use export_common::{SizeTier, StorageError};
use futures::stream::{self, StreamExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::fanout::{FanOut, WriterEntry};
use super::lease::LeaseRenewer;
use super::{FileProcessor, ProcessingResult};
use crate::collaborators::{
    DataFile, ProgressTracker, RowCountTable, TrackerKind, WriterCategory,
};

/// Writers closed concurrently per wait cycle.
pub const CLOSE_PARALLELISM: usize = 5;

/// Row count records per table insert.
pub const ROW_COUNT_BATCH_SIZE: usize = 99;

/// Row count inserts in flight at once.
pub const ROW_COUNT_PARALLELISM: usize = 10;

/// Writer totals for one category of the file stats line.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct StatsCounts {
    writers: u64,
    rows: u64,
    size: u64,
}

impl StatsCounts {
    fn add(&mut self, entry: &WriterEntry) {
        self.writers += 1;
        self.rows += entry.writer.row_count();
        self.size += entry.writer.size();
    }
}

/// Command stats lines, one per output file of every writer.
pub fn command_stats_lines(file: &PendingDataFile, data_file_name: &str, writers: &[WriterEntry]) -> String {
    let manifest = file.manifest_name();
    let mut data = String::new();

    for entry in writers {
        let status = entry.status();
        for detail in entry.writer.file_details() {
            data.push_str(&format!(
                "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\tv.2\t{}\t{}\n",
                file.agent_id,
                entry.writer.command_id(),
                manifest,
                data_file_name,
                status.origin.as_str(),
                status.abandon_label(),
                detail.size,
                detail.row_count,
                detail.file_name,
                detail.product_id
            ));
        }
    }

    data
}

/// File stats line: totals, then writer/row/byte counts for writers that
/// were created as blob store, dead letter and discard writers.
pub fn file_stats_line(file: &PendingDataFile, data_file_name: &str, writers: &[WriterEntry]) -> String {
    let mut by_origin: BTreeMap<WriterCategory, StatsCounts> = [
        WriterCategory::Normal,
        WriterCategory::DeadLetter,
        WriterCategory::Abandoned,
    ]
    .into_iter()
    .map(|c| (c, StatsCounts::default()))
    .collect();

    let mut rows = 0;
    let mut size = 0;
    for entry in writers {
        by_origin
            .entry(entry.writer.status().origin.category())
            .or_default()
            .add(entry);
        rows += entry.writer.row_count();
        size += entry.writer.size();
    }

    let mut line = format!(
        "{}\t{}\t{}\t{}\t{}\t{}",
        file.agent_id,
        file.manifest_name(),
        data_file_name,
        writers.len(),
        rows,
        size
    );
    for counts in by_origin.values() {
        line.push_str(&format!("\t{}\t{}\t{}", counts.writers, counts.rows, counts.size));
    }
    line.push('\n');
    line
}

async fn close_one(entry: &mut WriterEntry) -> (String, std::result::Result<(), StorageError>) {
    let result = entry.writer.close().await;
    (entry.writer.command_id().to_string(), result)
}

/// Insert one batch, returning the batch's command ids for logging.
async fn insert_row_counts(
    table: Arc<dyn RowCountTable>,
    batch: Vec<CommandFileState>,
) -> (String, Result<()>) {
    let commands = batch
        .iter()
        .map(|r| r.command_id.as_str())
        .collect::<Vec<_>>()
        .join(",");
    (commands, table.insert_batch(batch).await)
}

impl FileProcessor {
    /// Fan the file out, commit whatever was written, signal completion and
    /// retire the source. A missing file skips straight to completion.
    #[allow(clippy::too_many_arguments)]
    pub(super) async fn process_data_file(
        &self,
        instance: usize,
        tier: SizeTier,
        file: &PendingDataFile,
        data_file: Option<&Arc<dyn DataFile>>,
        tracker: &dyn ProgressTracker,
        renewer: &LeaseRenewer,
        cancel: &CancellationToken,
    ) -> Result<ProcessingResult> {
        if let Some(data_file) = data_file {
            let assume_non_transient = data_file
                .created()
                .checked_add_signed(self.config.assume_transient_window())
                .is_some_and(|cutoff| cutoff <= self.deps.clock.now());

            let mut fanout = FanOut::new(
                self,
                instance,
                file,
                tier,
                tracker,
                renewer,
                cancel,
                assume_non_transient,
            );

            let read = self.read_data_file(&mut fanout, data_file.as_ref(), renewer).await;
            if let Err(e) = &read {
                error!(
                    file = %file.data_file_tag,
                    error = ?e,
                    "Error processing data file; committing what was written"
                );
            }

            let writers = fanout.into_writers();
            let committed = self
                .commit_writers(file, data_file.name(), writers, tracker, renewer)
                .await;

            read?;
            committed?;
        }

        debug!(
            file = %file.data_file_tag,
            "Data file processed; enqueuing for file completion"
        );
        self.deps
            .completions
            .enqueue(CompleteDataFile::from(file))
            .await
            .context("Failed to enqueue file completion")?;

        if let Some(data_file) = data_file {
            let holding = format!("{}{}/", self.config.holding_path, file.agent_id);
            renewer
                .guard(data_file.move_relative(&holding))
                .await
                .with_context(|| format!("Failed to move {} to {}", file.data_file_path, holding))?;
            renewer
                .guard(data_file.set_expiry(self.config.holding_expiry()))
                .await
                .context("Failed to set holding expiry")?;
        }

        Ok(ProcessingResult::CompleteProcessed)
    }

    async fn read_data_file(
        &self,
        fanout: &mut FanOut<'_>,
        data_file: &dyn DataFile,
        renewer: &LeaseRenewer,
    ) -> Result<()> {
        let reader = renewer
            .guard(data_file.data_reader())
            .await
            .with_context(|| format!("Failed to open data stream for {}", data_file.path()))?;

        match reader {
            Some(reader) => fanout.run(reader).await,
            None => {
                warn!(file = %data_file.path(), "Data file has no readable stream");
                Ok(())
            },
        }
    }

    async fn commit_writers(
        &self,
        file: &PendingDataFile,
        data_file_name: &str,
        mut writers: Vec<WriterEntry>,
        tracker: &dyn ProgressTracker,
        renewer: &LeaseRenewer,
    ) -> Result<()> {
        self.close_writers(file, &mut writers, renewer).await?;
        self.write_row_counts(file, &writers, renewer).await?;
        self.write_tracker_and_stats(file, data_file_name, &writers, tracker)
            .await
    }

    /// Close every writer. Non-transient faults abandon that command's data
    /// and are swallowed; any other fault fails the commit after all writers
    /// have had their chance to close.
    pub(super) async fn close_writers(
        &self,
        file: &PendingDataFile,
        writers: &mut [WriterEntry],
        renewer: &LeaseRenewer,
    ) -> Result<()> {
        if writers.is_empty() {
            return Ok(());
        }

        let closes = stream::iter(writers.iter_mut())
            .map(close_one)
            .buffer_unordered(CLOSE_PARALLELISM)
            .collect::<Vec<_>>();

        let results = renewer.wait_and_renew(file, closes).await;

        let mut first_error = None;
        for (command_id, result) in results {
            match result {
                Ok(()) => {},
                Err(e) if e.is_non_transient() => {
                    warn!(
                        command_id = %command_id,
                        file = %file.data_file_tag,
                        code = e.code().unwrap_or_default(),
                        error = %e,
                        "Non-transient storage error closing writer; command data abandoned"
                    );
                },
                Err(e) => {
                    error!(
                        command_id = %command_id,
                        file = %file.data_file_tag,
                        error = %e,
                        "Failed to close command writer"
                    );
                    if first_error.is_none() {
                        first_error = Some(anyhow::Error::new(e).context(format!(
                            "Failed to close writer for command {}",
                            command_id
                        )));
                    }
                },
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Persist per-command row counts for writers the command feed consumes.
    /// Storage faults are logged and dropped so a large file is not
    /// reprocessed only for its counts.
    pub(super) async fn write_row_counts(
        &self,
        file: &PendingDataFile,
        writers: &[WriterEntry],
        renewer: &LeaseRenewer,
    ) -> Result<()> {
        let now = self.deps.clock.now();

        let records: Vec<CommandFileState> = writers
            .iter()
            .map(|entry| &entry.writer)
            .filter(|w| w.log_for_command_feed() && (w.last_error().is_some() || w.row_count() > 0))
            .map(|w| {
                let (error_info, byte_count, row_count) = match w.last_error() {
                    Some(e) => (Some(e), 0, 0),
                    None => (None, w.size(), w.row_count()),
                };
                CommandFileState {
                    key: CommandFileState::key_for(w.command_id(), &file.data_file_path),
                    command_id: w.command_id().to_string(),
                    agent_id: file.agent_id.clone(),
                    file_path: file.data_file_path.clone(),
                    non_transient_error_info: error_info,
                    byte_count,
                    row_count,
                    recorded_at: now,
                }
            })
            .collect();

        if records.is_empty() {
            return Ok(());
        }

        let batches: Vec<Vec<CommandFileState>> = records
            .chunks(ROW_COUNT_BATCH_SIZE)
            .map(<[_]>::to_vec)
            .collect();
        let inserts = stream::iter(batches)
            .map(|batch| insert_row_counts(self.deps.row_counts.clone(), batch))
            .buffer_unordered(ROW_COUNT_PARALLELISM)
            .collect::<Vec<_>>();

        for (commands, result) in renewer.wait_and_renew(file, inserts).await {
            if let Err(e) = result {
                error!(
                    commands = %commands,
                    file = %file.data_file_tag,
                    error = ?e,
                    "Failed to write row counts"
                );
                if !is_storage_error(&e) {
                    return Err(e.context(format!("Failed to write row counts for {}", commands)));
                }
            }
        }

        Ok(())
    }

    /// Final per-writer tracker messages plus the command and file stats
    /// lines.
    pub(super) async fn write_tracker_and_stats(
        &self,
        file: &PendingDataFile,
        data_file_name: &str,
        writers: &[WriterEntry],
        tracker: &dyn ProgressTracker,
    ) -> Result<()> {
        for entry in writers {
            let w = &entry.writer;
            let message = if entry.category() == WriterCategory::Normal {
                format!(
                    "Command {}: wrote {} bytes from {} rows to blob store",
                    w.command_id(),
                    w.size(),
                    w.row_count()
                )
            } else {
                format!(
                    "Command {}: processed {} bytes from {} rows. {}",
                    w.command_id(),
                    w.size(),
                    w.row_count(),
                    entry.describe()
                )
            };
            tracker.add_message(TrackerKind::DataFileCommand, message);
        }

        self.deps
            .command_stats
            .queue_write(command_stats_lines(file, data_file_name, writers))
            .await
            .context("Failed to queue command stats")?;

        self.deps
            .file_stats
            .queue_write(file_stats_line(file, data_file_name, writers))
            .await
            .context("Failed to queue file stats")?;

        info!(
            file = %file.data_file_tag,
            writers = writers.len(),
            "Committed data file"
        );

        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::collaborators::{
        AbandonReason, CommandWriter, TransientFailureMode, WriterFileDetail, WriterOrigin,
        WriterStatus,
    };
    use async_trait::async_trait;

    struct StaticWriter {
        command_id: String,
        status: WriterStatus,
        rows: u64,
        size: u64,
    }

    #[async_trait]
    impl CommandWriter for StaticWriter {
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
            0
        }
        fn status(&self) -> WriterStatus {
            self.status
        }
        fn last_error(&self) -> Option<String> {
            None
        }
        fn log_for_command_feed(&self) -> bool {
            true
        }
        fn file_details(&self) -> Vec<WriterFileDetail> {
            vec![WriterFileDetail {
                file_name: format!("{}/export.json", self.command_id),
                product_id: "7".into(),
                size: self.size,
                row_count: self.rows,
            }]
        }
        fn set_transient_failure_mode(&mut self, _mode: TransientFailureMode) {}

        async fn write(
            &mut self,
            _product_id: &str,
            _payload: &str,
            _pending_threshold: u64,
        ) -> std::result::Result<i64, StorageError> {
            Ok(0)
        }
        async fn flush(&mut self) -> std::result::Result<i64, StorageError> {
            Ok(0)
        }
        async fn close(&mut self) -> std::result::Result<(), StorageError> {
            Ok(())
        }
    }

    fn entry(command_id: &str, status: WriterStatus, rows: u64, size: u64) -> WriterEntry {
        WriterEntry {
            writer: Box::new(StaticWriter {
                command_id: command_id.into(),
                status,
                rows,
                size,
            }),
            discarding: false,
        }
    }

    fn pending() -> PendingDataFile {
        PendingDataFile {
            agent_id: "agent1".into(),
            data_file_path: "agent1/data_01.tsv".into(),
            data_file_tag: "s.agent1.data_01.tsv".into(),
            manifest_tag: "s.agent1.manifest_01".into(),
            export_file_name: "export".into(),
        }
    }

    #[test]
    fn test_command_stats_line_format() {
        let writers = vec![entry("c1", WriterStatus::new(WriterOrigin::BlobStore), 2, 30)];
        let data = command_stats_lines(&pending(), "data_01.tsv", &writers);
        assert_eq!(
            data,
            "agent1\tc1\tmanifest_01\tdata_01.tsv\tNormalDataWriter\tNone\t30\t2\tv.2\tc1/export.json\t7\n"
        );
    }

    #[test]
    fn test_file_stats_groups_by_origin() {
        let writers = vec![
            entry("c1", WriterStatus::new(WriterOrigin::BlobStore), 2, 30),
            entry(
                "c2",
                WriterStatus::abandoned(WriterOrigin::BlobStore, AbandonReason::NoStorage),
                1,
                5,
            ),
            entry("c3", WriterStatus::new(WriterOrigin::DeadLetter), 4, 40),
        ];
        let line = file_stats_line(&pending(), "data_01.tsv", &writers);
        assert_eq!(
            line,
            "agent1\tmanifest_01\tdata_01.tsv\t3\t7\t75\t2\t3\t35\t1\t4\t40\t0\t0\t0\n"
        );
    }

    #[test]
    fn test_discarding_entry_reports_write_error() {
        let mut e = entry("c1", WriterStatus::new(WriterOrigin::BlobStore), 1, 10);
        e.discarding = true;
        assert_eq!(e.category(), WriterCategory::Abandoned);
        assert_eq!(e.status().abandon_label(), "AbandonedWriteError");

        let data = command_stats_lines(&pending(), "data_01.tsv", std::slice::from_ref(&e));
        assert!(data.contains("\tNormalDataWriter\tAbandonedWriteError\t"));
    }
}
