//! Orchestration layer for IO-bound pipeline services.
//!
//! Modules exposed here talk to external systems (analyzers, object storage,
//! the record store, local disk). Pure transforms belong in `crate::pipeline`
//! so concurrency and resource accounting stay localized here.

pub mod blob_store;
pub mod context;
pub mod detect;
pub mod ingest;
pub mod records;
pub mod staging;
pub mod uploader;

pub use blob_store::{
    BlobError, BlobMeta, BlobStore, ByteStream, Cid, DurableWrite, FsBlobStore, HttpBlobStore,
    PutRequest, blake3_cid, validate_cid,
};
pub use context::{ContextError, PipelineContext, build_pipeline_context};
pub use detect::{
    DetectTarget, Detector, DetectorError, ProcessDetector, ProcessOutputFormat, RemoteDetector,
    RemoteDetectorOptions, RemoteKind, detect_all, run_detector,
};
pub use ingest::{
    CancelHandle, CancelSignal, IngestCoordinator, IngestError, IngestOptions, UploadBatch,
    UploadItem,
};
pub use records::{LmdbRecordStore, MetadataWriter, NewRecord, PersistenceError, RecordStore};
pub use staging::{ImageInfo, StagedFile, StagingError, StagingStats, TempStager};
pub use uploader::BlobUploader;
