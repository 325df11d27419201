use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info};

use crate::config::{
    AppConfig, AppConfigError, DetectorsConfig, RemoteDetectorConfig, StorageBackend,
    StorageConfig,
};
use crate::paths::{AppPaths, PathError};
use crate::services::blob_store::{BlobError, BlobStore, FsBlobStore, HttpBlobStore};
use crate::services::detect::{
    Detector, DetectorError, ProcessDetector, RemoteDetector, RemoteDetectorOptions, RemoteKind,
};
use crate::services::ingest::{IngestCoordinator, IngestOptions};
use crate::services::records::{LmdbRecordStore, MetadataWriter, PersistenceError, RecordStore};
use crate::services::staging::{StagingError, TempStager};
use crate::services::uploader::BlobUploader;

/// Everything a command needs, built once from configuration.
pub struct PipelineContext {
    pub paths: AppPaths,
    pub coordinator: IngestCoordinator,
    pub records: Arc<dyn RecordStore>,
}

#[derive(Debug, Error)]
pub enum ContextError {
    #[error(transparent)]
    Config(#[from] AppConfigError),
    #[error(transparent)]
    Path(#[from] PathError),
    #[error(transparent)]
    Staging(#[from] StagingError),
    #[error(transparent)]
    Blob(#[from] BlobError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error("detector `{name}`: {source}")]
    Detector {
        name: &'static str,
        #[source]
        source: DetectorError,
    },
}

pub fn build_pipeline_context(cfg: &AppConfig) -> Result<PipelineContext, ContextError> {
    let paths = AppPaths::new(&cfg.storage.path)?;
    let stager = TempStager::new(paths.staging_dir()?)?;

    let store = build_blob_store(&cfg.storage, &paths, cfg.ingest.upload_timeout())?;
    let uploader = BlobUploader::builder()
        .store(store)
        .request_timeout(cfg.ingest.upload_timeout())
        .max_retries(cfg.ingest.upload_max_retries)
        .build();

    let records: Arc<dyn RecordStore> = Arc::new(LmdbRecordStore::open(&paths)?);
    let writer = MetadataWriter::new(Arc::clone(&records), cfg.ingest.persist_timeout());

    let detectors = build_detectors(&cfg.detectors)?;
    if detectors.is_empty() {
        info!("no detectors configured; images will be stored without auto tags");
    }

    let worker_limit = NonZeroUsize::new(cfg.ingest.workers).ok_or(AppConfigError::Zero {
        field: "ingest.workers",
    })?;
    let options = IngestOptions::builder()
        .worker_limit(worker_limit)
        .detector_timeout(cfg.ingest.detector_timeout())
        .folder(cfg.ingest.folder.clone())
        .max_batch_items(cfg.ingest.max_batch_items)
        .max_item_bytes(cfg.ingest.max_item_bytes)
        .preflight(cfg.ingest.preflight)
        .build();

    let coordinator = IngestCoordinator::new(stager, detectors, uploader, writer, options);
    Ok(PipelineContext {
        paths,
        coordinator,
        records,
    })
}

pub fn build_blob_store(
    cfg: &StorageConfig,
    paths: &AppPaths,
    request_timeout: Duration,
) -> Result<Arc<dyn BlobStore>, ContextError> {
    match cfg.backend {
        StorageBackend::Fs => {
            debug!(root = %paths.data_dir().display(), "using filesystem blob store");
            Ok(Arc::new(
                FsBlobStore::builder()
                    .paths(paths.clone())
                    .durability(cfg.durability)
                    .build(),
            ))
        }
        StorageBackend::Http => {
            let http = cfg.http.as_ref().ok_or(AppConfigError::MissingHttpEndpoint)?;
            debug!(endpoint = %http.endpoint, "using http blob store");
            Ok(Arc::new(HttpBlobStore::new(
                http.endpoint.clone(),
                http.api_token.clone(),
                request_timeout,
            )?))
        }
    }
}

/// Detectors in fixed order: object, OCR, semantic.
pub fn build_detectors(cfg: &DetectorsConfig) -> Result<Vec<Arc<dyn Detector>>, ContextError> {
    let mut detectors: Vec<Arc<dyn Detector>> = Vec::new();

    if let Some(object) = &cfg.object {
        detectors.push(Arc::new(
            ProcessDetector::builder()
                .name("object")
                .program(object.program.clone())
                .args(object.args.clone())
                .output(object.output)
                .build(),
        ));
    }
    if let Some(ocr) = &cfg.ocr {
        detectors.push(remote_detector("ocr", RemoteKind::Ocr, ocr)?);
    }
    if let Some(semantic) = &cfg.semantic {
        detectors.push(remote_detector("semantic", RemoteKind::Semantic, semantic)?);
    }

    debug!(
        detectors = ?detectors.iter().map(|d| d.name().to_string()).collect::<Vec<_>>(),
        "detectors configured"
    );
    Ok(detectors)
}

fn remote_detector(
    name: &'static str,
    kind: RemoteKind,
    cfg: &RemoteDetectorConfig,
) -> Result<Arc<dyn Detector>, ContextError> {
    let options = RemoteDetectorOptions::builder()
        .name(name)
        .kind(kind)
        .endpoint(cfg.endpoint.clone())
        .maybe_api_token(cfg.api_token.clone())
        .request_timeout(Duration::from_secs(cfg.request_timeout_secs))
        .requests_per_second(cfg.requests_per_second()?)
        .max_retries(cfg.max_retries)
        .min_token_chars(cfg.min_token_chars)
        .min_score(cfg.min_score)
        .build();
    let detector =
        RemoteDetector::new(options).map_err(|source| ContextError::Detector { name, source })?;
    Ok(Arc::new(detector))
}
