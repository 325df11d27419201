//! Batch ingestion: staging, detection, aggregation, upload and persistence.
//!
//! Items run on a bounded pool. Each item walks
//! `Received -> Detecting -> Aggregated -> Uploading -> Persisting -> Cleaned`
//! and every exit path ends in `Cleaned` with its staged bytes released.
//! Item failures are reported in the [`BatchResult`] and never abort siblings.

use std::fmt;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bon::Builder;
use bytes::Bytes;
use futures_concurrency::{concurrent_stream::IntoConcurrentStream, prelude::ConcurrentStream};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::sync::watch;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::constants::{DEFAULT_FOLDER, DEFAULT_MAX_ITEM_BYTES};
use crate::paths::normalize_folder;
use crate::pipeline::{BatchResult, ItemErrorKind, ItemOutcome, aggregate};
use crate::services::blob_store::{BlobError, ByteStream};
use crate::services::detect::{DetectTarget, Detector, detect_all};
use crate::services::records::{MetadataWriter, NewRecord};
use crate::services::staging::{StagedFile, TempStager};
use crate::services::uploader::BlobUploader;

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";
const READ_CHUNK_BYTES: usize = 64 * 1024;

/// One file submitted for ingestion.
pub struct UploadItem {
    pub original_name: String,
    pub content_type: String,
    pub body: ByteStream,
    /// Already-hosted copy remote analyzers may fetch instead of inline bytes.
    pub source_url: Option<String>,
}

impl fmt::Debug for UploadItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadItem")
            .field("original_name", &self.original_name)
            .field("content_type", &self.content_type)
            .field("source_url", &self.source_url)
            .finish_non_exhaustive()
    }
}

impl UploadItem {
    pub fn from_bytes(
        original_name: impl Into<String>,
        content_type: impl Into<String>,
        data: impl Into<Bytes>,
    ) -> Self {
        let data = data.into();
        Self {
            original_name: original_name.into(),
            content_type: content_type.into(),
            body: Box::pin(futures::stream::once(async move { Ok(data) })),
            source_url: None,
        }
    }

    /// Stream a local file; the content type is guessed from its extension.
    pub async fn from_path(path: &Path) -> std::io::Result<Self> {
        let file = tokio::fs::File::open(path).await?;
        let original_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let content_type = content_type_for(path).to_string();

        let body = async_stream::try_stream! {
            let mut file = file;
            let mut buf = vec![0u8; READ_CHUNK_BYTES];
            loop {
                let n = file
                    .read(&mut buf)
                    .await
                    .map_err(|e| BlobError::Io(format!("read upload: {}", e)))?;
                if n == 0 {
                    break;
                }
                yield Bytes::copy_from_slice(&buf[..n]);
            }
        };

        Ok(Self {
            original_name,
            content_type,
            body: Box::pin(body),
            source_url: None,
        })
    }

    pub fn with_source_url(mut self, url: impl Into<String>) -> Self {
        self.source_url = Some(url.into());
        self
    }
}

fn content_type_for(path: &Path) -> &'static str {
    image::ImageFormat::from_path(path)
        .map(|format| format.to_mime_type())
        .unwrap_or(DEFAULT_CONTENT_TYPE)
}

/// Ordered items from one owner, ingested in a single call.
#[derive(Debug)]
pub struct UploadBatch {
    pub owner_id: String,
    pub items: Vec<UploadItem>,
}

impl UploadBatch {
    pub fn new(owner_id: impl Into<String>, items: Vec<UploadItem>) -> Self {
        Self {
            owner_id: owner_id.into(),
            items,
        }
    }
}

/// Read side of a batch cancellation flag.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    receiver: watch::Receiver<bool>,
}

/// Write side; dropping it without cancelling leaves the batch running.
#[derive(Debug)]
pub struct CancelHandle {
    sender: watch::Sender<bool>,
}

impl CancelSignal {
    pub fn new() -> (CancelHandle, CancelSignal) {
        let (sender, receiver) = watch::channel(false);
        (CancelHandle { sender }, CancelSignal { receiver })
    }

    /// A signal that never fires.
    pub fn never() -> Self {
        Self::new().1
    }

    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }
}

#[derive(Debug, Clone, Builder)]
pub struct IngestOptions {
    #[builder(default = NonZeroUsize::new(4).expect("non-zero workers"))]
    pub worker_limit: NonZeroUsize,
    #[builder(default = Duration::from_secs(30))]
    pub detector_timeout: Duration,
    #[builder(into, default = DEFAULT_FOLDER)]
    pub folder: String,
    #[builder(default = 64)]
    pub max_batch_items: usize,
    /// Items whose bytes exceed this fail with `TempResourceError`.
    #[builder(default = DEFAULT_MAX_ITEM_BYTES)]
    pub max_item_bytes: u64,
    /// Check blob store reachability before any item starts.
    #[builder(default = true)]
    pub preflight: bool,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("blob store unavailable; batch not started: {0}")]
    BatchAbort(#[source] BlobError),
    #[error("batch has {items} items; the limit is {limit}")]
    BatchTooLarge { items: usize, limit: usize },
    #[error("invalid folder: {0}")]
    InvalidFolder(String),
}

struct CoordinatorInner {
    stager: TempStager,
    detectors: Vec<Arc<dyn Detector>>,
    uploader: BlobUploader,
    writer: MetadataWriter,
    options: IngestOptions,
}

/// Drives batches through the per-item pipeline.
#[derive(Clone)]
pub struct IngestCoordinator {
    inner: Arc<CoordinatorInner>,
}

type Collected = Arc<Mutex<Vec<(usize, ItemOutcome)>>>;

impl IngestCoordinator {
    pub fn new(
        stager: TempStager,
        detectors: Vec<Arc<dyn Detector>>,
        uploader: BlobUploader,
        writer: MetadataWriter,
        options: IngestOptions,
    ) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                stager,
                detectors,
                uploader,
                writer,
                options,
            }),
        }
    }

    pub fn options(&self) -> &IngestOptions {
        &self.inner.options
    }

    pub fn stager(&self) -> &TempStager {
        &self.inner.stager
    }

    pub async fn ingest(
        &self,
        batch: UploadBatch,
        cancel: CancelSignal,
    ) -> Result<BatchResult, IngestError> {
        let UploadBatch { owner_id, items } = batch;
        if items.is_empty() {
            debug!(owner = %owner_id, "empty batch; nothing to do");
            return Ok(BatchResult::empty());
        }

        let options = &self.inner.options;
        if items.len() > options.max_batch_items {
            return Err(IngestError::BatchTooLarge {
                items: items.len(),
                limit: options.max_batch_items,
            });
        }
        let folder = normalize_folder(&options.folder)
            .map_err(|_| IngestError::InvalidFolder(options.folder.clone()))?;

        if options.preflight {
            self.inner
                .uploader
                .preflight()
                .await
                .map_err(IngestError::BatchAbort)?;
        }

        let started = Instant::now();
        let total = items.len();
        info!(owner = %owner_id, items = total, workers = options.worker_limit.get(), "batch started");

        let owner_id: Arc<str> = Arc::from(owner_id);
        let folder: Arc<str> = Arc::from(folder);
        let collected: Collected = Arc::new(Mutex::new(Vec::with_capacity(total)));

        items
            .into_co_stream()
            .limit(Some(options.worker_limit))
            .enumerate()
            .for_each(|(ordinal, item)| {
                let inner = Arc::clone(&self.inner);
                let owner_id = Arc::clone(&owner_id);
                let folder = Arc::clone(&folder);
                let cancel = cancel.clone();
                let collected = Arc::clone(&collected);
                let span = info_span!("item", ordinal, item = %item.original_name);
                async move {
                    let outcome = inner
                        .process_item(item, &owner_id, &folder, &cancel)
                        .await;
                    let mut guard = collected.lock().expect("outcome collection lock poisoned");
                    guard.push((ordinal, outcome));
                }
                .instrument(span)
            })
            .await;

        let mut guard = collected.lock().expect("outcome collection lock poisoned");
        let mut ordered = std::mem::take(&mut *guard);
        drop(guard);
        ordered.sort_by_key(|(ordinal, _)| *ordinal);

        let result = BatchResult {
            items: ordered.into_iter().map(|(_, outcome)| outcome).collect(),
        };
        info!(
            owner = %owner_id,
            succeeded = result.succeeded(),
            failed = result.failed(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "batch finished"
        );
        Ok(result)
    }
}

impl CoordinatorInner {
    async fn process_item(
        &self,
        item: UploadItem,
        owner_id: &str,
        folder: &str,
        cancel: &CancelSignal,
    ) -> ItemOutcome {
        let UploadItem {
            original_name,
            content_type,
            body,
            source_url,
        } = item;

        if cancel.is_cancelled() {
            debug!(stage = "received", "cancelled before start");
            return ItemOutcome::failed(
                original_name,
                ItemErrorKind::Cancelled,
                "batch cancelled before the item started",
            );
        }

        let staged = match self
            .stager
            .acquire(&original_name, body, self.options.max_item_bytes)
            .await
        {
            Ok(staged) => staged,
            Err(err) => {
                warn!(stage = "received", error = %err, "staging failed");
                return ItemOutcome::failed(
                    original_name,
                    ItemErrorKind::TempResourceError,
                    err.to_string(),
                );
            }
        };

        let outcome = self
            .run_staged(&staged, original_name, content_type, source_url, owner_id, folder, cancel)
            .await;
        staged.release();
        debug!(stage = "cleaned", success = outcome.success, "item finished");
        outcome
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_staged(
        &self,
        staged: &StagedFile,
        original_name: String,
        declared_type: String,
        source_url: Option<String>,
        owner_id: &str,
        folder: &str,
        cancel: &CancelSignal,
    ) -> ItemOutcome {
        let info = staged.inspect().await;
        let content_type = info
            .and_then(|info| info.mime_type)
            .map(str::to_string)
            .unwrap_or(declared_type);

        debug!(stage = "detecting", detectors = self.detectors.len(), "fanning out");
        let target = DetectTarget {
            item: original_name.clone(),
            path: staged.path().to_path_buf(),
            content_type: content_type.clone(),
            remote_url: source_url,
        };
        let results = detect_all(&self.detectors, &target, self.options.detector_timeout).await;
        let auto_tags = aggregate(&results);
        debug!(
            stage = "aggregated",
            completed = results.iter().filter(|r| r.completed).count(),
            tags = auto_tags.len(),
            "detections merged"
        );

        if cancel.is_cancelled() {
            debug!(stage = "aggregated", "cancelled before upload");
            return ItemOutcome::failed(
                original_name,
                ItemErrorKind::Cancelled,
                "batch cancelled before upload",
            );
        }

        debug!(stage = "uploading", folder, "uploading staged bytes");
        let dimensions = info.map(|info| (info.width, info.height));
        let artifact = match self
            .uploader
            .upload(staged, folder, &content_type, dimensions)
            .await
        {
            Ok(artifact) => artifact,
            Err(err) => {
                warn!(stage = "uploading", error = %err, "upload failed");
                return ItemOutcome::failed(
                    original_name,
                    ItemErrorKind::BlobUploadError,
                    err.to_string(),
                );
            }
        };

        // Persist runs even if cancellation fired during upload.
        debug!(stage = "persisting", artifact = %artifact.id, "writing record");
        let orphan_url = artifact.url.clone();
        let orphan_id = artifact.id.clone();
        match self
            .writer
            .persist(NewRecord {
                name: original_name.clone(),
                artifact,
                auto_tags,
                manual_tags: Vec::new(),
                owner_id: owner_id.to_string(),
            })
            .await
        {
            Ok(record) => ItemOutcome::succeeded(original_name, record),
            Err(err) => {
                error!(
                    stage = "persisting",
                    artifact_url = %orphan_url,
                    artifact_id = %orphan_id,
                    error = %err,
                    "record write failed; stored artifact is orphaned"
                );
                ItemOutcome::failed(original_name, ItemErrorKind::PersistenceError, err.to_string())
            }
        }
    }
}
