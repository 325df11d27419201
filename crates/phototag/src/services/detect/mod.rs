//! Detector capability and the fan-out/fan-in helpers that drive it.
//!
//! A detector turns one staged image into labels. Backends differ in how they
//! reach their analyzer (child process, HTTP API) but callers only ever see
//! [`Detector::detect`]. Failures never escape as item failures: they are
//! folded into a [`DetectionResult`] with `completed = false`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_concurrency::future::Join;
use thiserror::Error;
use tracing::{debug, warn};

use crate::pipeline::{DetectionResult, DetectorFailureKind};

pub mod process;
pub mod remote;

pub use process::{ProcessDetector, ProcessOutputFormat};
pub use remote::{RemoteDetector, RemoteDetectorOptions, RemoteKind};

/// Everything an adapter may need to locate the image under analysis.
#[derive(Debug, Clone)]
pub struct DetectTarget {
    /// Original file name, for logging only.
    pub item: String,
    pub path: PathBuf,
    pub content_type: String,
    /// Already-hosted copy of the image, when the caller provided one.
    pub remote_url: Option<String>,
}

#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("analyzer unavailable: {0}")]
    Unavailable(String),
    #[error("analyzer did not answer within {0:?}")]
    Timeout(Duration),
    #[error("analyzer output malformed: {0}")]
    MalformedOutput(String),
}

impl DetectorError {
    pub fn kind(&self) -> DetectorFailureKind {
        match self {
            DetectorError::Unavailable(_) => DetectorFailureKind::DetectorUnavailable,
            DetectorError::Timeout(_) => DetectorFailureKind::DetectorTimeout,
            DetectorError::MalformedOutput(_) => DetectorFailureKind::DetectorMalformedOutput,
        }
    }
}

#[async_trait]
pub trait Detector: Send + Sync {
    /// Stable name used in logs and detection results.
    fn name(&self) -> &str;

    /// Produce labels for `target`.
    ///
    /// Implementations must tolerate being dropped mid-call: the caller
    /// enforces timeouts by abandoning the future.
    async fn detect(&self, target: &DetectTarget) -> Result<Vec<String>, DetectorError>;
}

/// Run one detector under `timeout`, folding every failure into the result.
pub async fn run_detector(
    detector: &dyn Detector,
    target: &DetectTarget,
    timeout: Duration,
) -> DetectionResult {
    let name = detector.name();
    let started = Instant::now();
    let outcome = match tokio::time::timeout(timeout, detector.detect(target)).await {
        Ok(result) => result,
        Err(_) => Err(DetectorError::Timeout(timeout)),
    };
    let elapsed_ms = started.elapsed().as_millis() as u64;

    match outcome {
        Ok(labels) => {
            debug!(
                item = %target.item,
                detector = name,
                labels = labels.len(),
                elapsed_ms,
                "detector completed"
            );
            DetectionResult::completed(name, labels)
        }
        Err(err) => {
            warn!(
                item = %target.item,
                detector = name,
                kind = err.kind().as_ref(),
                elapsed_ms,
                error = %err,
                "detector failed; continuing without its labels"
            );
            DetectionResult::failed(name, err.kind(), err.to_string())
        }
    }
}

/// Invoke every detector concurrently and wait for all of them.
///
/// Results are returned in detector order regardless of completion order.
pub async fn detect_all(
    detectors: &[Arc<dyn Detector>],
    target: &DetectTarget,
    timeout: Duration,
) -> Vec<DetectionResult> {
    detectors
        .iter()
        .map(|detector| run_detector(detector.as_ref(), target, timeout))
        .collect::<Vec<_>>()
        .join()
        .await
}
