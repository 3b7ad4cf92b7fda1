//! Row fan-out
//!
//! Streams a data file line by line. Each line is `command\tproduct\tpayload`;
//! rows are routed to a per-command writer created on first use. The sum of
//! pending bytes across writers is capped: past the overall threshold the
//! most loaded writers are flushed until the total is back under half of it.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use export_common::types::{canonicalize_command_id, PendingDataFile, DEFAULT_PRODUCT_ID};
use export_common::SizeTier;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::io::AsyncBufReadExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::counters::WriterCounts;
use super::lease::LeaseRenewer;
use super::FileProcessor;
use crate::collaborators::{
    AbandonReason, CommandWriter, DataReader, ProgressTracker, TrackerKind, TransientFailureMode,
    WriterCategory, WriterStatus,
};

/// Rows between heartbeat checks.
pub const HEARTBEAT_ROW_INTERVAL: u64 = 25;

const EXPECTED_COLUMNS: usize = 3;

/// A command's writer plus whether rows for it are being dropped.
pub struct WriterEntry {
    pub writer: Box<dyn CommandWriter>,
    /// Set after a non-transient write fault; later rows are discarded.
    pub discarding: bool,
}

impl WriterEntry {
    /// Writer status, with rows dropped after a write fault counted as
    /// abandoned even if the writer itself did not say so.
    pub fn status(&self) -> WriterStatus {
        let status = self.writer.status();
        if self.discarding && status.abandoned.is_none() {
            WriterStatus::abandoned(status.origin, AbandonReason::WriteError)
        } else {
            status
        }
    }

    pub fn category(&self) -> WriterCategory {
        self.status().category()
    }

    /// Tracker text explaining where a non-normal writer's data went.
    pub fn describe(&self) -> String {
        let status = self.status();
        let mut text = match status.category() {
            WriterCategory::Normal => String::new(),
            WriterCategory::DeadLetter => {
                "Command is unknown; data held in the missing command holding store.".to_string()
            },
            WriterCategory::Abandoned => format!("Data discarded ({}).", status.abandon_label()),
        };
        if let Some(e) = self.writer.last_error() {
            text.push_str(&format!(" Last error: {}", e));
        }
        text
    }
}

/// Per-category writer totals for a file.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WriterSummary {
    pub counts: WriterCounts,
    pub real_bytes: u64,
    pub dead_letter_bytes: u64,
    pub abandoned_bytes: u64,
}

impl WriterSummary {
    pub fn of<'a>(entries: impl IntoIterator<Item = &'a WriterEntry>) -> Self {
        let mut summary = Self::default();
        for entry in entries {
            let size = entry.writer.size();
            match entry.category() {
                WriterCategory::Normal => {
                    summary.counts.real += 1;
                    summary.real_bytes += size;
                },
                WriterCategory::DeadLetter => {
                    summary.counts.dead_letter += 1;
                    summary.dead_letter_bytes += size;
                },
                WriterCategory::Abandoned => {
                    summary.counts.abandoned += 1;
                    summary.abandoned_bytes += size;
                },
            }
        }
        summary
    }

    /// Tracker text describing where the file's data went.
    pub fn describe(&self) -> String {
        let mut text = String::new();
        if self.counts.real > 0 {
            text.push_str(&format!(
                " wrote {} bytes for {} commands to blob store;",
                self.real_bytes, self.counts.real
            ));
        }
        if self.counts.dead_letter > 0 {
            text.push_str(&format!(
                " wrote {} bytes for {} commands to the missing command holding store;",
                self.dead_letter_bytes, self.counts.dead_letter
            ));
        }
        if self.counts.abandoned > 0 {
            text.push_str(&format!(
                " discarded {} bytes for {} commands",
                self.abandoned_bytes, self.counts.abandoned
            ));
        }
        if self.counts.total() == 0 {
            text.push_str(" no writers wrote any data (data file is empty or has no valid data rows)");
        }
        text
    }
}

/// `d.hh:mm:ss`
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!(
        "{}.{:02}:{:02}:{:02}",
        secs / 86_400,
        (secs / 3600) % 24,
        (secs / 60) % 60,
        secs % 60
    )
}

fn rate(amount: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        amount as f64 / secs
    } else {
        0.0
    }
}

/// State of one pass over one data file.
pub struct FanOut<'a> {
    processor: &'a FileProcessor,
    instance: usize,
    file: &'a PendingDataFile,
    tier: SizeTier,
    tracker: &'a dyn ProgressTracker,
    renewer: &'a LeaseRenewer,
    cancel: &'a CancellationToken,
    failure_mode: TransientFailureMode,

    writers: BTreeMap<String, WriterEntry>,
    pending_bytes: i64,
    row: u64,
    bytes_read: u64,
    payload_bytes: u64,
    next_heartbeat: Option<DateTime<Utc>>,
}

impl<'a> FanOut<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        processor: &'a FileProcessor,
        instance: usize,
        file: &'a PendingDataFile,
        tier: SizeTier,
        tracker: &'a dyn ProgressTracker,
        renewer: &'a LeaseRenewer,
        cancel: &'a CancellationToken,
        assume_non_transient: bool,
    ) -> Self {
        Self {
            processor,
            instance,
            file,
            tier,
            tracker,
            renewer,
            cancel,
            failure_mode: if assume_non_transient {
                TransientFailureMode::AssumeNonTransient
            } else {
                TransientFailureMode::AssumeTransient
            },
            writers: BTreeMap::new(),
            pending_bytes: 0,
            row: 0,
            bytes_read: 0,
            payload_bytes: 0,
            next_heartbeat: None,
        }
    }

    /// Writers in command id order, for the close/commit phase.
    pub fn into_writers(self) -> Vec<WriterEntry> {
        self.writers.into_values().collect()
    }

    fn ensure_not_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            anyhow::bail!(
                "processing of {} cancelled at row {}",
                self.file.data_file_path,
                self.row
            );
        }
        Ok(())
    }

    /// Read the whole stream, routing every valid row.
    pub async fn run(&mut self, mut reader: DataReader) -> Result<()> {
        let started = Instant::now();
        let mut buf = Vec::new();

        loop {
            self.ensure_not_cancelled()?;

            buf.clear();
            let read = self
                .renewer
                .guard(reader.read_until(b'\n', &mut buf))
                .await
                .with_context(|| {
                    format!(
                        "Failed to read row {} of {}",
                        self.row + 1,
                        self.file.data_file_path
                    )
                })?;
            if read == 0 {
                break;
            }

            self.row += 1;
            self.bytes_read += read as u64;

            // invalid UTF-8 sequences become U+FFFD; the row is still routed
            let line = String::from_utf8_lossy(&buf);
            self.process_line(line.trim_end_matches(['\n', '\r'])).await?;

            if self.pending_bytes > self.processor.config.overall_pending_byte_threshold as i64 {
                self.relieve_backpressure().await?;
            }

            if self.row % HEARTBEAT_ROW_INTERVAL == 0 {
                self.heartbeat(started);
            }
        }

        self.finish(started);
        Ok(())
    }

    /// Validate one line and hand it to its command's writer.
    pub async fn process_line(&mut self, line: &str) -> Result<()> {
        let columns: Vec<&str> = line.splitn(EXPECTED_COLUMNS, '\t').collect();
        let &[raw_command, product_id, payload] = columns.as_slice() else {
            error!(
                file = %self.file.data_file_tag,
                row = self.row,
                columns = columns.len(),
                "Unexpected column count"
            );
            self.tracker.add_message(
                TrackerKind::DataFileError,
                format!(
                    "On {} of data file, found {} columns instead of the expected {}. Skipping row.",
                    self.row,
                    columns.len(),
                    EXPECTED_COLUMNS
                ),
            );
            return Ok(());
        };

        let command_id = canonicalize_command_id(raw_command);

        // an empty payload makes the command id irrelevant, so check it first
        if payload.trim().is_empty() {
            info!(
                file = %self.file.data_file_tag,
                row = self.row,
                command_id = %command_id,
                "Empty payload column, skipping"
            );
            self.tracker.add_message(
                TrackerKind::DataFileError,
                format!("On {} of data file, found empty payload. Skipping row.", self.row),
            );
            return Ok(());
        }

        if command_id.trim().is_empty() {
            error!(
                file = %self.file.data_file_tag,
                row = self.row,
                "Missing or invalid command id"
            );
            self.tracker.add_message(
                TrackerKind::DataFileError,
                format!("On {} of data file, found empty command id. Skipping row.", self.row),
            );
            return Ok(());
        }

        let product_id = if product_id.trim().is_empty() {
            self.tracker.add_message(
                TrackerKind::DataFileError,
                format!(
                    "On {} of data file, found empty export product id. Using default.",
                    self.row
                ),
            );
            DEFAULT_PRODUCT_ID
        } else {
            product_id
        };

        self.payload_bytes += payload.len() as u64;
        let delta = self.process_single_row(&command_id, product_id, payload).await?;
        self.pending_bytes += delta;

        Ok(())
    }

    /// Write one row to its command's writer, creating the writer on first
    /// use. Returns the change in pending bytes.
    pub async fn process_single_row(
        &mut self,
        command_id: &str,
        product_id: &str,
        payload: &str,
    ) -> Result<i64> {
        if !self.writers.contains_key(command_id) {
            let mut writer = self
                .renewer
                .guard(self.processor.deps.writers.create(
                    self.cancel,
                    &self.file.agent_id,
                    command_id,
                    &self.file.export_file_name,
                ))
                .await
                .with_context(|| format!("Failed to create writer for command {}", command_id))?;

            writer.set_transient_failure_mode(self.failure_mode);

            debug!(
                command_id,
                file = %self.file.data_file_tag,
                row = self.row,
                origin = writer.status().origin.as_str(),
                "Opened command writer"
            );

            self.writers.insert(
                command_id.to_string(),
                WriterEntry {
                    writer,
                    discarding: false,
                },
            );
        }

        let Some(entry) = self.writers.get_mut(command_id) else {
            return Ok(0);
        };

        if entry.discarding {
            return Ok(0);
        }

        let current_pending = entry.writer.pending_size() as i64;
        let threshold = self.processor.config.command_pending_byte_threshold;

        match self
            .renewer
            .guard(entry.writer.write(product_id, payload, threshold))
            .await
        {
            Ok(delta) => Ok(delta),
            Err(e) if e.is_non_transient() => {
                warn!(
                    command_id,
                    file = %self.file.data_file_tag,
                    code = e.code().unwrap_or_default(),
                    error = %e,
                    "Non-transient storage error writing command data; discarding further rows"
                );
                entry.discarding = true;
                // the writer's pending bytes are gone with it
                Ok(-current_pending)
            },
            Err(e) => Err(anyhow::Error::new(e).context(format!(
                "Failed to write row {} for command {}",
                self.row, command_id
            ))),
        }
    }

    /// Flush the most loaded writers until total pending bytes are at most
    /// half the overall threshold or nothing is left pending.
    pub async fn relieve_backpressure(&mut self) -> Result<()> {
        let limit = (self.processor.config.overall_pending_byte_threshold / 2) as i64;

        let mut loaded: Vec<(String, u64)> = self
            .writers
            .iter()
            .map(|(id, entry)| (id.clone(), entry.writer.pending_size()))
            .filter(|(_, pending)| *pending > 0)
            .collect();
        loaded.sort_by(|a, b| b.1.cmp(&a.1));

        for (command_id, _) in loaded {
            if self.pending_bytes <= limit {
                break;
            }
            self.ensure_not_cancelled()?;

            let Some(entry) = self.writers.get_mut(&command_id) else {
                continue;
            };
            let pending = entry.writer.pending_size() as i64;

            match self.renewer.guard(entry.writer.flush()).await {
                Ok(flushed) => self.pending_bytes -= flushed,
                Err(e) if e.is_non_transient() => {
                    warn!(
                        command_id = %command_id,
                        file = %self.file.data_file_tag,
                        code = e.code().unwrap_or_default(),
                        error = %e,
                        "Non-transient storage error flushing command data; pending data abandoned"
                    );
                    self.pending_bytes -= pending;
                },
                Err(e) => {
                    return Err(anyhow::Error::new(e)
                        .context(format!("Failed to flush writer for command {}", command_id)))
                },
            }
        }

        Ok(())
    }

    fn heartbeat(&mut self, started: Instant) {
        let now = self.processor.deps.clock.now();
        if self.next_heartbeat.is_some_and(|next| now <= next) {
            return;
        }

        let elapsed = started.elapsed();
        let counts = WriterSummary::of(self.writers.values()).counts;

        if let Some(slot) = self.processor.counters.slot(self.instance) {
            slot.update(elapsed, self.payload_bytes, self.row, counts);
        }

        info!(
            event = "FileProcessorHeartbeat",
            elapsed = %format_elapsed(elapsed),
            bytes_read = self.bytes_read,
            rows = self.row,
            rows_per_sec = rate(self.row, elapsed),
            bytes_per_sec = rate(self.payload_bytes, elapsed),
            file = %self.file.data_file_tag,
            manifest = %self.file.manifest_tag,
            tier = %self.tier,
            real = counts.real,
            dead_letter = counts.dead_letter,
            abandoned = counts.abandoned,
            "Heartbeat"
        );

        self.next_heartbeat = Some(
            now.checked_add_signed(self.processor.config.progress_update())
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        );
    }

    fn finish(&mut self, started: Instant) {
        let elapsed = started.elapsed();
        let summary = WriterSummary::of(self.writers.values());

        if let Some(slot) = self.processor.counters.slot(self.instance) {
            slot.update(elapsed, self.payload_bytes, self.row, summary.counts);
        }

        info!(
            elapsed = %format_elapsed(elapsed),
            bytes_read = self.bytes_read,
            rows = self.row,
            rows_per_sec = rate(self.row, elapsed),
            bytes_per_sec = rate(self.payload_bytes, elapsed),
            file = %self.file.data_file_tag,
            manifest = %self.file.manifest_tag,
            real = summary.counts.real,
            real_bytes = summary.real_bytes,
            dead_letter = summary.counts.dead_letter,
            dead_letter_bytes = summary.dead_letter_bytes,
            abandoned = summary.counts.abandoned,
            abandoned_bytes = summary.abandoned_bytes,
            "Heartbeat final"
        );

        self.tracker.add_message(
            TrackerKind::DataFileComplete,
            format!(
                "Completed reading data file after {} duration, {} bytes and {} rows processed. Command data summary:{}",
                format_elapsed(elapsed),
                self.bytes_read,
                self.row,
                summary.describe()
            ),
        );
    }
}
