//! Persistent blob store
//!
//! A private folder of named dataset files with a byte quota. Writes stream
//! into a hidden `.<name>.partial` file and are renamed into place only
//! after the data is flushed, so readers never see a half-written file.
//! A name is owned by at most one writer or deleter at a time.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use ahash::AHashSet;
use parking_lot::Mutex;
use ps_core::settings::StorageSettings;
use ps_core::CancelToken;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::{DataError, Result};

const PARTIAL_PREFIX: &str = ".";
const PARTIAL_SUFFIX: &str = ".partial";
/// ENOSPC
const NO_SPACE_OS_ERROR: i32 = 28;

/// A stored file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobHandle {
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeleteOutcome {
    pub deleted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaInfo {
    pub used: u64,
    pub available: u64,
    pub quota: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOptions {
    /// Stream in fixed-size chunks instead of one buffered write
    pub chunked: bool,
    /// Total payload size, when known, for percentage progress
    pub expected_len: Option<u64>,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            chunked: true,
            expected_len: None,
        }
    }
}

/// Bytes written so far
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteProgress {
    pub written: u64,
    pub total: Option<u64>,
}

impl WriteProgress {
    /// Percentage complete, if the total is known
    pub fn percent(&self) -> Option<u8> {
        self.total.map(|total| {
            if total == 0 {
                100
            } else {
                ((self.written.min(total) * 100) / total) as u8
            }
        })
    }
}

/// Releases a name when dropped
struct NameGuard {
    busy: Arc<Mutex<AHashSet<String>>>,
    name: String,
}

impl Drop for NameGuard {
    fn drop(&mut self) {
        self.busy.lock().remove(&self.name);
    }
}

/// Quota-bounded private file store
#[derive(Clone)]
pub struct BlobStore {
    dir: PathBuf,
    quota: u64,
    chunk_size: usize,
    busy: Arc<Mutex<AHashSet<String>>>,
}

impl BlobStore {
    /// Open the store described by the storage settings
    pub async fn open(settings: &StorageSettings) -> Result<Self> {
        Self::open_dir(settings.dataset_dir(), settings.quota_bytes, settings.chunk_size).await
    }

    /// Open a store rooted at `dir`, creating it if needed, and sweep
    /// partial files left by an interrupted session
    pub async fn open_dir(dir: impl Into<PathBuf>, quota: u64, chunk_size: usize) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| DataError::StorageUnavailable(format!("{}: {}", dir.display(), e)))?;

        let store = Self {
            dir,
            quota,
            chunk_size: chunk_size.max(1),
            busy: Arc::new(Mutex::new(AHashSet::new())),
        };
        let swept = store.sweep_partials().await?;
        if swept > 0 {
            warn!(count = swept, "Removed partial files from an interrupted session");
        }
        info!(dir = %store.dir.display(), quota = store.quota, "Opened blob store");
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Whether `name` is currently being written or deleted
    pub fn is_writing(&self, name: &str) -> bool {
        self.busy.lock().contains(name)
    }

    fn path_of(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    fn partial_path_of(&self, name: &str) -> PathBuf {
        self.dir
            .join(format!("{}{}{}", PARTIAL_PREFIX, name, PARTIAL_SUFFIX))
    }

    fn claim(&self, name: &str) -> Result<NameGuard> {
        validate_name(name)?;
        let mut busy = self.busy.lock();
        if !busy.insert(name.to_string()) {
            return Err(DataError::WriteConflict(name.to_string()));
        }
        Ok(NameGuard {
            busy: self.busy.clone(),
            name: name.to_string(),
        })
    }

    /// Create or replace `name` with the bytes of `source`.
    ///
    /// Cancellation is checked before every chunk; a cancelled or failed
    /// write leaves no file behind and the previous content, if any, intact.
    pub async fn write<R, F>(
        &self,
        name: &str,
        source: R,
        options: WriteOptions,
        progress: F,
        cancel: &CancelToken,
    ) -> Result<BlobHandle>
    where
        R: AsyncRead + Unpin + Send,
        F: FnMut(WriteProgress) + Send,
    {
        let _guard = self.claim(name)?;
        let partial = self.partial_path_of(name);

        let result = self
            .write_partial(name, &partial, source, options, progress, cancel)
            .await;

        match result {
            Ok(size) => {
                let path = self.path_of(name);
                tokio::fs::rename(&partial, &path).await.map_err(storage_error)?;
                info!(file = name, size, "Stored blob");
                Ok(BlobHandle {
                    name: name.to_string(),
                    path,
                    size,
                })
            }
            Err(e) => {
                if let Err(rm) = tokio::fs::remove_file(&partial).await {
                    if rm.kind() != std::io::ErrorKind::NotFound {
                        warn!(file = name, error = %rm, "Failed to remove partial file");
                    }
                }
                if e.is_cancelled() {
                    info!(file = name, "Blob write cancelled");
                } else {
                    warn!(file = name, error = %e, "Blob write failed");
                }
                Err(e)
            }
        }
    }

    async fn write_partial<R, F>(
        &self,
        name: &str,
        partial: &Path,
        mut source: R,
        options: WriteOptions,
        mut progress: F,
        cancel: &CancelToken,
    ) -> Result<u64>
    where
        R: AsyncRead + Unpin + Send,
        F: FnMut(WriteProgress) + Send,
    {
        // an existing file of the same name is replaced, so it does not count
        let replaced = match tokio::fs::metadata(self.path_of(name)).await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };
        let used = self.used_bytes().await?.saturating_sub(replaced);
        let available = self.quota.saturating_sub(used);
        if let Some(expected) = options.expected_len {
            if expected > available {
                return Err(DataError::StorageFull {
                    needed: expected,
                    available,
                });
            }
        }

        let mut file = tokio::fs::File::create(partial).await.map_err(storage_error)?;
        let mut written: u64 = 0;

        if options.chunked {
            let mut buf = vec![0u8; self.chunk_size];
            loop {
                if cancel.is_cancelled() {
                    return Err(DataError::Cancelled);
                }
                let n = read_chunk(&mut source, &mut buf).await?;
                if n == 0 {
                    break;
                }
                if written + n as u64 > available {
                    return Err(DataError::StorageFull {
                        needed: written + n as u64,
                        available,
                    });
                }
                file.write_all(&buf[..n]).await.map_err(storage_error)?;
                written += n as u64;
                debug!(file = name, written, "Wrote chunk");
                progress(WriteProgress {
                    written,
                    total: options.expected_len,
                });
            }
        } else {
            let mut buf = Vec::new();
            source.read_to_end(&mut buf).await?;
            if cancel.is_cancelled() {
                return Err(DataError::Cancelled);
            }
            if buf.len() as u64 > available {
                return Err(DataError::StorageFull {
                    needed: buf.len() as u64,
                    available,
                });
            }
            file.write_all(&buf).await.map_err(storage_error)?;
            written = buf.len() as u64;
            progress(WriteProgress {
                written,
                total: Some(written),
            });
        }

        file.flush().await.map_err(storage_error)?;
        file.sync_all().await.map_err(storage_error)?;
        Ok(written)
    }

    /// Convenience wrapper writing an in-memory payload
    pub async fn write_bytes(&self, name: &str, bytes: &[u8], cancel: &CancelToken) -> Result<BlobHandle> {
        let options = WriteOptions {
            chunked: true,
            expected_len: Some(bytes.len() as u64),
        };
        self.write(name, bytes, options, |_| {}, cancel).await
    }

    /// Handle to a complete file
    pub async fn read(&self, name: &str) -> Result<BlobHandle> {
        validate_name(name)?;
        let path = self.path_of(name);
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(BlobHandle {
                name: name.to_string(),
                path,
                size: meta.len(),
            }),
            Ok(_) => Err(DataError::NotFound(name.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(DataError::NotFound(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn read_bytes(&self, name: &str) -> Result<Vec<u8>> {
        let handle = self.read(name).await?;
        Ok(tokio::fs::read(&handle.path).await?)
    }

    /// Remove `name`. Missing files are not an error.
    pub async fn delete(&self, name: &str) -> Result<DeleteOutcome> {
        let _guard = self.claim(name)?;
        match tokio::fs::remove_file(self.path_of(name)).await {
            Ok(()) => {
                info!(file = name, "Deleted blob");
                Ok(DeleteOutcome { deleted: true })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(file = name, "Delete of missing blob");
                Ok(DeleteOutcome { deleted: false })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Names of complete files, sorted
    pub async fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await.map_err(storage_error)?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if !name.starts_with(PARTIAL_PREFIX) {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    pub async fn quota(&self) -> Result<QuotaInfo> {
        let used = self.used_bytes().await?;
        Ok(QuotaInfo {
            used,
            available: self.quota.saturating_sub(used),
            quota: self.quota,
        })
    }

    /// Bytes held by every file in the folder, partials included
    async fn used_bytes(&self) -> Result<u64> {
        let mut used = 0;
        let mut entries = tokio::fs::read_dir(&self.dir).await.map_err(storage_error)?;
        while let Some(entry) = entries.next_entry().await? {
            let meta = entry.metadata().await?;
            if meta.is_file() {
                used += meta.len();
            }
        }
        Ok(used)
    }

    async fn sweep_partials(&self) -> Result<usize> {
        let mut swept = 0;
        let mut entries = tokio::fs::read_dir(&self.dir).await.map_err(storage_error)?;
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            if name.starts_with(PARTIAL_PREFIX) && name.ends_with(PARTIAL_SUFFIX) {
                tokio::fs::remove_file(entry.path()).await?;
                swept += 1;
            }
        }
        Ok(swept)
    }
}

/// Fill `buf` as far as the source allows; returns 0 only at end of input
async fn read_chunk<R: AsyncRead + Unpin>(source: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = source.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && !name.starts_with(PARTIAL_PREFIX)
        && !name.contains(['/', '\\'])
        && name != "..";
    if valid {
        Ok(())
    } else {
        Err(DataError::Other(format!("Invalid blob name '{}'", name)))
    }
}

fn storage_error(e: std::io::Error) -> DataError {
    if e.raw_os_error() == Some(NO_SPACE_OS_ERROR) {
        DataError::StorageFull {
            needed: 0,
            available: 0,
        }
    } else {
        DataError::Io(e)
    }
}
