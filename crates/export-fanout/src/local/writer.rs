//! File-backed command writers
//!
//! Each command gets a directory under either the blob store root or the
//! dead-letter root, depending on whether the command is known. Rows are
//! buffered per product and written to `<export>_<product>.tsv` in that
//! directory. Output files are truncated when first opened in an attempt,
//! so a reprocessed file replaces what an earlier attempt wrote.

use anyhow::Result;
use async_trait::async_trait;
use export_common::StorageError;
use std::collections::{BTreeMap, HashSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::collaborators::{
    AbandonReason, CommandWriter, CommandWriterFactory, TransientFailureMode, WriterFileDetail,
    WriterOrigin, WriterStatus,
};

/// Directory under the output root for known commands.
pub const BLOB_STORE_DIR: &str = "blob";

/// Directory under the output root for unknown commands.
pub const DEAD_LETTER_DIR: &str = "deadletter";

pub struct LocalWriterFactory {
    output_dir: PathBuf,
    known_commands: HashSet<String>,
}

impl LocalWriterFactory {
    /// `known_commands` holds canonical command ids. Empty means every
    /// command is known.
    pub fn new(output_dir: impl Into<PathBuf>, known_commands: impl IntoIterator<Item = String>) -> Self {
        Self {
            output_dir: output_dir.into(),
            known_commands: known_commands.into_iter().collect(),
        }
    }

    fn origin_for(&self, command_id: &str) -> WriterOrigin {
        if self.known_commands.is_empty() || self.known_commands.contains(command_id) {
            WriterOrigin::BlobStore
        } else {
            WriterOrigin::DeadLetter
        }
    }
}

#[async_trait]
impl CommandWriterFactory for LocalWriterFactory {
    async fn create(
        &self,
        cancel: &CancellationToken,
        agent_id: &str,
        command_id: &str,
        export_name: &str,
    ) -> Result<Box<dyn CommandWriter>> {
        if cancel.is_cancelled() {
            anyhow::bail!("Writer creation for command {} cancelled", command_id);
        }

        let origin = self.origin_for(command_id);
        let root = match origin {
            WriterOrigin::DeadLetter => DEAD_LETTER_DIR,
            _ => BLOB_STORE_DIR,
        };
        let dir = self.output_dir.join(root).join(agent_id).join(command_id);

        Ok(Box::new(LocalCommandWriter::new(
            command_id,
            export_name,
            dir,
            origin,
        )))
    }
}

struct ProductOutput {
    file_name: String,
    file: Option<File>,
    /// Output file was created this attempt; stays set after close.
    opened: bool,
    pending: Vec<u8>,
    size: u64,
    rows: u64,
}

pub struct LocalCommandWriter {
    command_id: String,
    export_name: String,
    dir: PathBuf,
    status: WriterStatus,
    mode: TransientFailureMode,
    products: BTreeMap<String, ProductOutput>,
    size: u64,
    rows: u64,
    pending: u64,
    last_error: Option<String>,
}

/// Map an I/O failure onto the storage fault taxonomy.
fn classify(err: std::io::Error, mode: TransientFailureMode) -> StorageError {
    let code = format!("{:?}", err.kind());
    let non_transient = mode == TransientFailureMode::AssumeNonTransient
        || matches!(
            err.kind(),
            ErrorKind::NotFound
                | ErrorKind::PermissionDenied
                | ErrorKind::AlreadyExists
                | ErrorKind::InvalidInput
                | ErrorKind::Unsupported
        );

    if non_transient {
        StorageError::non_transient(code, err.to_string())
    } else {
        StorageError::transient(code, err.to_string())
    }
}

impl LocalCommandWriter {
    pub fn new(command_id: &str, export_name: &str, dir: PathBuf, origin: WriterOrigin) -> Self {
        Self {
            command_id: command_id.to_string(),
            export_name: export_name.to_string(),
            dir,
            status: WriterStatus::new(origin),
            mode: TransientFailureMode::default(),
            products: BTreeMap::new(),
            size: 0,
            rows: 0,
            pending: 0,
            last_error: None,
        }
    }

    fn is_abandoned(&self) -> bool {
        self.status.abandoned.is_some()
    }

    /// Record a fault. Non-transient faults abandon the writer and drop
    /// everything still buffered.
    fn fail(&mut self, err: StorageError) -> StorageError {
        if err.is_non_transient() {
            warn!(
                command_id = %self.command_id,
                error = %err,
                "Non-transient write fault; abandoning command output"
            );
            self.last_error = Some(err.to_string());
            self.status = WriterStatus::abandoned(self.status.origin, AbandonReason::WriteError);
            for product in self.products.values_mut() {
                product.pending.clear();
            }
            self.pending = 0;
        }
        err
    }

    async fn write_out(
        dir: &Path,
        product: &mut ProductOutput,
        mode: TransientFailureMode,
    ) -> std::result::Result<u64, StorageError> {
        if product.pending.is_empty() {
            return Ok(0);
        }

        if product.file.is_none() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| classify(e, mode))?;
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(dir.join(&product.file_name))
                .await
                .map_err(|e| classify(e, mode))?;
            product.file = Some(file);
            product.opened = true;
        }

        let Some(file) = product.file.as_mut() else {
            return Ok(0);
        };
        file.write_all(&product.pending)
            .await
            .map_err(|e| classify(e, mode))?;

        let written = product.pending.len() as u64;
        product.pending.clear();
        Ok(written)
    }

    async fn flush_product(&mut self, product_id: &str) -> std::result::Result<u64, StorageError> {
        let result = match self.products.get_mut(product_id) {
            Some(product) => Self::write_out(&self.dir, product, self.mode).await,
            None => Ok(0),
        };

        match result {
            Ok(written) => {
                self.pending -= written;
                Ok(written)
            },
            Err(e) => Err(self.fail(e)),
        }
    }
}

#[async_trait]
impl CommandWriter for LocalCommandWriter {
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
        self.status
    }

    fn last_error(&self) -> Option<String> {
        self.last_error.clone()
    }

    fn log_for_command_feed(&self) -> bool {
        self.status.origin == WriterOrigin::BlobStore
    }

    fn file_details(&self) -> Vec<WriterFileDetail> {
        self.products
            .iter()
            .filter(|(_, p)| p.opened)
            .map(|(product_id, p)| WriterFileDetail {
                file_name: p.file_name.clone(),
                product_id: product_id.clone(),
                size: p.size,
                row_count: p.rows,
            })
            .collect()
    }

    fn set_transient_failure_mode(&mut self, mode: TransientFailureMode) {
        self.mode = mode;
    }

    async fn write(
        &mut self,
        product_id: &str,
        payload: &str,
        pending_threshold: u64,
    ) -> std::result::Result<i64, StorageError> {
        if self.is_abandoned() {
            return Ok(0);
        }

        let export_name = &self.export_name;
        let product = self
            .products
            .entry(product_id.to_string())
            .or_insert_with(|| ProductOutput {
                file_name: format!("{}_{}.tsv", export_name, product_id),
                file: None,
                opened: false,
                pending: Vec::new(),
                size: 0,
                rows: 0,
            });

        let added = payload.len() as u64 + 1;
        product.pending.extend_from_slice(payload.as_bytes());
        product.pending.push(b'\n');
        product.size += added;
        product.rows += 1;
        let over_threshold = product.pending.len() as u64 > pending_threshold;

        self.size += added;
        self.rows += 1;
        self.pending += added;

        if !over_threshold {
            return Ok(added as i64);
        }

        self.flush_product(product_id)
            .await
            .map(|written| added as i64 - written as i64)
    }

    async fn flush(&mut self) -> std::result::Result<i64, StorageError> {
        if self.is_abandoned() {
            return Ok(0);
        }

        let product_ids: Vec<String> = self
            .products
            .iter()
            .filter(|(_, p)| !p.pending.is_empty())
            .map(|(id, _)| id.clone())
            .collect();

        let mut flushed = 0;
        for product_id in product_ids {
            flushed += self.flush_product(&product_id).await?;
        }
        Ok(flushed as i64)
    }

    async fn close(&mut self) -> std::result::Result<(), StorageError> {
        self.flush().await?;

        let mode = self.mode;
        let mut result = Ok(());
        for product in self.products.values_mut() {
            if let Some(mut file) = product.file.take() {
                if let Err(e) = file.flush().await {
                    result = Err(classify(e, mode));
                }
            }
        }

        match result {
            Ok(()) => {
                debug!(
                    command_id = %self.command_id,
                    size = self.size,
                    rows = self.rows,
                    dir = %self.dir.display(),
                    "Closed command writer"
                );
                Ok(())
            },
            Err(e) => Err(self.fail(e)),
        }
    }
}
