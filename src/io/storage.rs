//! Storage adapter: named artifacts in the remote store with a local mirror.
//!
//! Every remote key has a mirror path under the staging directory. A staged
//! file always shadows its remote key; presence of the mirror file is taken
//! as proof the content is current.
//!
//! Key features:
//! - Single-flight staging: concurrent `stage` calls for one key download once
//! - Downloads land in a `.part` file and are renamed into place
//! - Uploads use a single put or a multipart upload, both of which only become
//!   visible at the final key once complete
//! - Transient failures retry with exponential backoff, then surface as
//!   `TransferError`

use crate::config::RetryConfig;
use crate::error::{PipelineError, Result};
use crate::pipeline::Metrics;
use crate::retry::{with_backoff, Exhausted};
use bytes::Bytes;
use dashmap::DashMap;
use futures::{StreamExt, TryStreamExt};
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload, WriteMultipart};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{Mutex, Semaphore};

/// Files above this size are uploaded in parts.
const MULTIPART_THRESHOLD: u64 = 64 * 1024 * 1024;

/// Part size for multipart uploads.
const PART_SIZE: usize = 16 * 1024 * 1024;

/// Parts in flight per multipart upload.
const PART_CONCURRENCY: usize = 4;

/// Failure inside one transfer attempt.
#[derive(Debug)]
enum AttemptError {
    Store(object_store::Error),
    Local(std::io::Error),
}

impl fmt::Display for AttemptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptError::Store(e) => write!(f, "{}", e),
            AttemptError::Local(e) => write!(f, "local I/O: {}", e),
        }
    }
}

impl From<object_store::Error> for AttemptError {
    fn from(e: object_store::Error) -> Self {
        AttemptError::Store(e)
    }
}

impl From<std::io::Error> for AttemptError {
    fn from(e: std::io::Error) -> Self {
        AttemptError::Local(e)
    }
}

impl AttemptError {
    fn is_not_found(&self) -> bool {
        matches!(self, AttemptError::Store(object_store::Error::NotFound { .. }))
    }

    fn is_transient(&self) -> bool {
        match self {
            AttemptError::Store(e) => !matches!(
                e,
                object_store::Error::NotFound { .. }
                    | object_store::Error::InvalidPath { .. }
                    | object_store::Error::NotSupported { .. }
                    | object_store::Error::NotImplemented
                    | object_store::Error::AlreadyExists { .. }
                    | object_store::Error::Precondition { .. }
            ),
            AttemptError::Local(_) => true,
        }
    }
}

/// Uniform get/put/exists over the artifact store.
pub struct Storage {
    /// Remote artifact store
    store: Arc<dyn ObjectStore>,

    /// Root of the local mirror
    staging_dir: PathBuf,

    /// Backoff policy for transient failures
    retry: RetryConfig,

    /// Bounds simultaneous transfers
    transfers: Semaphore,

    /// Per-key locks for single-flight staging
    in_flight: DashMap<String, Arc<Mutex<()>>>,

    /// Optional metrics for transfer accounting
    metrics: Option<Arc<Metrics>>,
}

impl Storage {
    /// Create a storage adapter.
    pub fn new(
        store: Arc<dyn ObjectStore>,
        staging_dir: impl Into<PathBuf>,
        retry: RetryConfig,
        max_concurrent_transfers: usize,
    ) -> Self {
        Self {
            store,
            staging_dir: staging_dir.into(),
            retry,
            transfers: Semaphore::new(max_concurrent_transfers.max(1)),
            in_flight: DashMap::new(),
            metrics: None,
        }
    }

    /// Attach a metrics collector.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Underlying object store.
    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Mirror path for a remote key.
    pub fn local_path(&self, key: &str) -> PathBuf {
        self.staging_dir.join(key.trim_start_matches('/'))
    }

    /// Local path where a producer writes the content of `key` before publishing.
    pub fn scratch_path(&self, key: &str) -> PathBuf {
        let mirror = self.local_path(key);
        let mut name = mirror.file_name().unwrap_or_default().to_os_string();
        name.push(".work");
        mirror.with_file_name(name)
    }

    /// Remove a scratch file once its content is published.
    pub async fn remove_scratch(&self, key: &str) -> Result<()> {
        match tokio::fs::remove_file(self.scratch_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Whether the key's mirror file is present.
    pub async fn is_staged(&self, key: &str) -> bool {
        tokio::fs::try_exists(self.local_path(key))
            .await
            .unwrap_or(false)
    }

    /// Make the key available locally and return its mirror path.
    ///
    /// An existing mirror file is returned as-is without contacting the store.
    pub async fn stage(&self, key: &str) -> Result<PathBuf> {
        let local = self.local_path(key);
        if self.is_staged(key).await {
            return Ok(local);
        }

        let lock = self
            .in_flight
            .entry(key.to_string())
            .or_default()
            .value()
            .clone();
        let _guard = lock.lock().await;

        // Another task may have finished staging while we waited
        if self.is_staged(key).await {
            return Ok(local);
        }

        self.download(key, &local).await?;
        // Only a staged key may drop its lock. After a failure the entry stays
        // so queued and later callers keep serializing on the same lock.
        self.in_flight.remove_if(key, |_, current| Arc::ptr_eq(current, &lock));
        Ok(local)
    }

    async fn download(&self, key: &str, local: &Path) -> Result<()> {
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let part = part_path(local);
        let path = ObjectPath::from(key);

        let _permit = self
            .transfers
            .acquire()
            .await
            .map_err(|e| self.closed_error(key, e))?;

        let label = format!("Stage {}", key);
        let bytes = with_backoff(&self.retry, &label, AttemptError::is_transient, || {
            let store = self.store.clone();
            let path = path.clone();
            let part = part.clone();
            async move {
                let mut stream = store.get(&path).await?.into_stream();
                let mut file = tokio::fs::File::create(&part).await?;
                let mut written = 0u64;
                while let Some(chunk) = stream.next().await {
                    let chunk = chunk?;
                    file.write_all(&chunk).await?;
                    written += chunk.len() as u64;
                }
                file.flush().await?;
                file.sync_all().await?;
                Ok::<u64, AttemptError>(written)
            }
        })
        .await
        .map_err(|e| self.transfer_error(key, e))?;

        tokio::fs::rename(&part, local).await?;
        if let Some(ref m) = self.metrics {
            m.add_bytes_staged(bytes);
        }
        tracing::debug!("Staged {} ({} bytes) to {}", key, bytes, local.display());
        Ok(())
    }

    /// Upload a local file to `key`. Safe to repeat; the last writer wins and
    /// readers never observe a partial object.
    pub async fn publish(&self, local: &Path, key: &str) -> Result<()> {
        let mirror = self.local_path(key);
        if local != mirror {
            if let Some(parent) = mirror.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let part = part_path(&mirror);
            tokio::fs::copy(local, &part).await?;
            tokio::fs::rename(&part, &mirror).await?;
        }

        let size = tokio::fs::metadata(&mirror).await?.len();
        let path = ObjectPath::from(key);

        let _permit = self
            .transfers
            .acquire()
            .await
            .map_err(|e| self.closed_error(key, e))?;

        let label = format!("Publish {}", key);
        with_backoff(&self.retry, &label, AttemptError::is_transient, || {
            let store = self.store.clone();
            let path = path.clone();
            let mirror = mirror.clone();
            async move {
                if size <= MULTIPART_THRESHOLD {
                    let data = Bytes::from(tokio::fs::read(&mirror).await?);
                    store.put(&path, PutPayload::from(data)).await?;
                } else {
                    upload_multipart(store.as_ref(), &path, &mirror).await?;
                }
                Ok::<(), AttemptError>(())
            }
        })
        .await
        .map_err(|e| self.transfer_error(key, e))?;

        if let Some(ref m) = self.metrics {
            m.add_bytes_published(size);
        }
        tracing::debug!("Published {} ({} bytes)", key, size);
        Ok(())
    }

    /// Whether the key exists in the remote store.
    pub async fn exists(&self, key: &str) -> Result<bool> {
        let path = ObjectPath::from(key);
        let label = format!("Head {}", key);
        let result = with_backoff(&self.retry, &label, AttemptError::is_transient, || {
            let store = self.store.clone();
            let path = path.clone();
            async move { Ok::<_, AttemptError>(store.head(&path).await?) }
        })
        .await;

        match result {
            Ok(_) => Ok(true),
            Err(e) if e.error.is_not_found() => Ok(false),
            Err(e) => Err(self.transfer_error(key, e)),
        }
    }

    /// Remove the key remotely and from the mirror. Missing objects are fine.
    pub async fn delete(&self, key: &str) -> Result<()> {
        let path = ObjectPath::from(key);
        let label = format!("Delete {}", key);
        let result = with_backoff(&self.retry, &label, AttemptError::is_transient, || {
            let store = self.store.clone();
            let path = path.clone();
            async move { Ok::<_, AttemptError>(store.delete(&path).await?) }
        })
        .await;

        match result {
            Ok(()) => {}
            Err(e) if e.error.is_not_found() => {}
            Err(e) => return Err(self.transfer_error(key, e)),
        }
        self.remove_local(key).await
    }

    /// Remove only the mirror copy of a key.
    pub async fn remove_local(&self, key: &str) -> Result<()> {
        match tokio::fs::remove_file(self.local_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// List keys under a prefix, sorted.
    pub async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let path = ObjectPath::from(prefix);
        let label = format!("List {}", prefix);
        let metas = with_backoff(&self.retry, &label, AttemptError::is_transient, || {
            let store = self.store.clone();
            let path = path.clone();
            async move {
                let metas: Vec<_> = store.list(Some(&path)).try_collect().await?;
                Ok::<_, AttemptError>(metas)
            }
        })
        .await;

        let metas = match metas {
            Ok(metas) => metas,
            Err(e) if e.error.is_not_found() => Vec::new(),
            Err(e) => return Err(self.transfer_error(prefix, e)),
        };

        let mut keys: Vec<String> = metas.into_iter().map(|m| m.location.to_string()).collect();
        keys.sort();
        Ok(keys)
    }

    fn transfer_error(&self, key: &str, exhausted: Exhausted<AttemptError>) -> PipelineError {
        if exhausted.error.is_not_found() {
            return PipelineError::not_found(key.to_string());
        }
        if let Some(ref m) = self.metrics {
            m.add_transfer_failure();
        }
        PipelineError::Transfer {
            key: key.to_string(),
            attempts: exhausted.attempts,
            reason: exhausted.error.to_string(),
        }
    }

    fn closed_error(&self, key: &str, e: tokio::sync::AcquireError) -> PipelineError {
        PipelineError::Transfer {
            key: key.to_string(),
            attempts: 0,
            reason: e.to_string(),
        }
    }
}

fn part_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    path.with_file_name(name)
}

async fn upload_multipart(
    store: &dyn ObjectStore,
    path: &ObjectPath,
    local: &Path,
) -> std::result::Result<(), AttemptError> {
    let upload = store.put_multipart(path).await?;
    let mut writer = WriteMultipart::new_with_chunk_size(upload, PART_SIZE);
    let mut file = tokio::fs::File::open(local).await?;
    let mut buf = vec![0u8; PART_SIZE];

    loop {
        let n = match file.read(&mut buf).await {
            Ok(n) => n,
            Err(e) => {
                let _ = writer.abort().await;
                return Err(e.into());
            }
        };
        if n == 0 {
            break;
        }
        writer.wait_for_capacity(PART_CONCURRENCY).await?;
        writer.write(&buf[..n]);
    }

    writer.finish().await?;
    Ok(())
}
