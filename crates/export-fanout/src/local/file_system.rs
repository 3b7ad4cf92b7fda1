//! Data file systems: a local directory tree and an in-memory map
//!
//! Readers handed out by both check the stream against the size the file
//! reported when it was opened and fail with [`StreamError::EarlyStreamEnd`]
//! when the stream runs dry first.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, BufReader, ReadBuf};
use tokio::sync::Mutex;
use tracing::debug;

use crate::collaborators::{Clock, DataFile, DataReader, FileSystem};
use crate::error::StreamError;

/// Suffix of the sidecar file that records a holding expiry.
pub const EXPIRY_SUFFIX: &str = ".expiry";

/// Reader that fails when the stream ends before `expected` bytes.
pub struct LengthCheckedReader<R> {
    inner: R,
    file: String,
    offset: u64,
    expected: u64,
}

impl<R> LengthCheckedReader<R> {
    pub fn new(inner: R, file: impl Into<String>, expected: u64) -> Self {
        Self {
            inner,
            file: file.into(),
            offset: 0,
            expected,
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for LengthCheckedReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();

        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let read = (buf.filled().len() - before) as u64;
                this.offset += read;

                if read == 0 && buf.remaining() > 0 && this.offset < this.expected {
                    return Poll::Ready(Err(StreamError::EarlyStreamEnd {
                        file: this.file.clone(),
                        offset: this.offset,
                        expected: this.expected,
                    }
                    .into_io()));
                }
                Poll::Ready(Ok(()))
            },
            other => other,
        }
    }
}

/// Last `/` separated segment of `path`.
fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

// ============================================================================
// Local directory
// ============================================================================

/// Data files under a root directory, addressed by `/` separated relative
/// paths.
#[derive(Clone)]
pub struct LocalFileSystem {
    root: PathBuf,
    clock: Arc<dyn Clock>,
}

impl LocalFileSystem {
    pub fn new(root: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        Self {
            root: root.into(),
            clock,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl FileSystem for LocalFileSystem {
    async fn open_existing(&self, path: &str) -> Result<Option<Arc<dyn DataFile>>> {
        let full = self.root.join(path);
        let metadata = match tokio::fs::metadata(&full).await {
            Ok(m) if m.is_file() => m,
            Ok(_) => return Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to stat {}", full.display()))
            },
        };

        let created = metadata
            .created()
            .or_else(|_| metadata.modified())
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| self.clock.now());

        Ok(Some(Arc::new(LocalDataFile {
            root: self.root.clone(),
            path: path.to_string(),
            name: file_name(path).to_string(),
            size: metadata.len(),
            created,
            current: Mutex::new(full),
            clock: self.clock.clone(),
        })))
    }
}

pub struct LocalDataFile {
    root: PathBuf,
    path: String,
    name: String,
    size: u64,
    created: DateTime<Utc>,
    /// Where the file is now; changes after a move.
    current: Mutex<PathBuf>,
    clock: Arc<dyn Clock>,
}

#[async_trait]
impl DataFile for LocalDataFile {
    fn name(&self) -> &str {
        &self.name
    }

    fn path(&self) -> &str {
        &self.path
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn created(&self) -> DateTime<Utc> {
        self.created
    }

    async fn read_chunk(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let current = self.current.lock().await.clone();
        let mut file = tokio::fs::File::open(&current)
            .await
            .with_context(|| format!("Failed to open {}", current.display()))?;
        file.seek(SeekFrom::Start(offset)).await?;

        let mut chunk = Vec::with_capacity(len);
        file.take(len as u64).read_to_end(&mut chunk).await?;
        Ok(chunk)
    }

    async fn data_reader(&self) -> Result<Option<DataReader>> {
        let current = self.current.lock().await.clone();
        let file = match tokio::fs::File::open(&current).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to open {}", current.display()))
            },
        };

        let checked = LengthCheckedReader::new(file, self.path.clone(), self.size);
        Ok(Some(Box::new(BufReader::new(checked))))
    }

    async fn move_relative(&self, relative_dir: &str) -> Result<()> {
        let mut current = self.current.lock().await;
        let target_dir = self.root.join(relative_dir);
        tokio::fs::create_dir_all(&target_dir)
            .await
            .with_context(|| format!("Failed to create {}", target_dir.display()))?;

        let target = target_dir.join(&self.name);
        tokio::fs::rename(&*current, &target)
            .await
            .with_context(|| format!("Failed to move {} to {}", current.display(), target.display()))?;

        debug!(from = %current.display(), to = %target.display(), "Moved data file");
        *current = target;
        Ok(())
    }

    async fn set_expiry(&self, ttl: Duration) -> Result<()> {
        let current = self.current.lock().await.clone();
        let expires = self.clock.now()
            + chrono::Duration::from_std(ttl).context("Expiry out of range")?;

        let mut sidecar = current.into_os_string();
        sidecar.push(EXPIRY_SUFFIX);
        tokio::fs::write(&sidecar, expires.to_rfc3339())
            .await
            .context("Failed to write expiry sidecar")?;
        Ok(())
    }
}

// ============================================================================
// In memory
// ============================================================================

#[derive(Clone)]
struct MemoryEntry {
    contents: Arc<Vec<u8>>,
    reported_size: u64,
    created: DateTime<Utc>,
}

#[derive(Default)]
struct MemoryState {
    files: HashMap<String, MemoryEntry>,
    moves: Vec<(String, String)>,
    expiries: Vec<(String, Duration)>,
}

/// In-memory file system. A file's reported size may differ from its
/// contents to model storage metadata that lags the data.
#[derive(Clone, Default)]
pub struct MemoryFileSystem {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, path: &str, contents: impl Into<Vec<u8>>) {
        let contents = contents.into();
        let size = contents.len() as u64;
        self.insert_with(path, contents, size, Utc::now()).await;
    }

    pub async fn insert_with(
        &self,
        path: &str,
        contents: impl Into<Vec<u8>>,
        reported_size: u64,
        created: DateTime<Utc>,
    ) {
        self.state.lock().await.files.insert(
            path.to_string(),
            MemoryEntry {
                contents: Arc::new(contents.into()),
                reported_size,
                created,
            },
        );
    }

    pub async fn exists(&self, path: &str) -> bool {
        self.state.lock().await.files.contains_key(path)
    }

    /// `(from, to)` of every move so far.
    pub async fn moves(&self) -> Vec<(String, String)> {
        self.state.lock().await.moves.clone()
    }

    pub async fn expiries(&self) -> Vec<(String, Duration)> {
        self.state.lock().await.expiries.clone()
    }
}

#[async_trait]
impl FileSystem for MemoryFileSystem {
    async fn open_existing(&self, path: &str) -> Result<Option<Arc<dyn DataFile>>> {
        let state = self.state.lock().await;
        Ok(state.files.get(path).map(|entry| {
            Arc::new(MemoryDataFile {
                state: self.state.clone(),
                path: path.to_string(),
                name: file_name(path).to_string(),
                entry: entry.clone(),
                current: std::sync::Mutex::new(path.to_string()),
            }) as Arc<dyn DataFile>
        }))
    }
}

pub struct MemoryDataFile {
    state: Arc<Mutex<MemoryState>>,
    path: String,
    name: String,
    entry: MemoryEntry,
    current: std::sync::Mutex<String>,
}

impl MemoryDataFile {
    fn current(&self) -> String {
        self.current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl DataFile for MemoryDataFile {
    fn name(&self) -> &str {
        &self.name
    }

    fn path(&self) -> &str {
        &self.path
    }

    fn size(&self) -> u64 {
        self.entry.reported_size
    }

    fn created(&self) -> DateTime<Utc> {
        self.entry.created
    }

    async fn read_chunk(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let contents = &self.entry.contents;
        let start = (offset as usize).min(contents.len());
        let end = start.saturating_add(len).min(contents.len());
        Ok(contents[start..end].to_vec())
    }

    async fn data_reader(&self) -> Result<Option<DataReader>> {
        let cursor = std::io::Cursor::new(self.entry.contents.to_vec());
        let expected = self.entry.reported_size.max(self.entry.contents.len() as u64);
        let checked = LengthCheckedReader::new(cursor, self.path.clone(), expected);
        Ok(Some(Box::new(BufReader::new(checked))))
    }

    async fn move_relative(&self, relative_dir: &str) -> Result<()> {
        let from = self.current();
        let to = format!("{}{}", relative_dir, self.name);

        let mut state = self.state.lock().await;
        let entry = state
            .files
            .remove(&from)
            .with_context(|| format!("{} no longer exists", from))?;
        state.files.insert(to.clone(), entry);
        state.moves.push((from, to.clone()));
        drop(state);

        *self
            .current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = to;
        Ok(())
    }

    async fn set_expiry(&self, ttl: Duration) -> Result<()> {
        let current = self.current();
        self.state.lock().await.expiries.push((current, ttl));
        Ok(())
    }
}
