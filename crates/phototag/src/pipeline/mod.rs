//! Pure pipeline transformations that operate on ingestion data.
//!
//! Modules under this namespace must remain free of IO and external side effects
//! so they can be reused by the coordinator and test harnesses alike.

pub mod model;
pub mod tags;

pub use model::{
    BatchResult, DetectionFailure, DetectionResult, DetectorFailureKind, ImageRecord, ItemError,
    ItemErrorKind, ItemOutcome, StoredArtifact,
};
pub use tags::{TagSet, aggregate};
