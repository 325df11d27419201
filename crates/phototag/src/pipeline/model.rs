//! Values produced and consumed by the ingestion pipeline.

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display};

use crate::pipeline::tags::TagSet;

/// Why a detector contributed no labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr, Display)]
pub enum DetectorFailureKind {
    DetectorUnavailable,
    DetectorTimeout,
    DetectorMalformedOutput,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectionFailure {
    pub kind: DetectorFailureKind,
    pub message: String,
}

/// Output of one detector for one item. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectionResult {
    pub detector: String,
    pub labels: Vec<String>,
    pub completed: bool,
    pub failure: Option<DetectionFailure>,
}

impl DetectionResult {
    pub fn completed(detector: impl Into<String>, labels: Vec<String>) -> Self {
        Self {
            detector: detector.into(),
            labels,
            completed: true,
            failure: None,
        }
    }

    pub fn failed(
        detector: impl Into<String>,
        kind: DetectorFailureKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            detector: detector.into(),
            labels: Vec::new(),
            completed: false,
            failure: Some(DetectionFailure {
                kind,
                message: message.into(),
            }),
        }
    }
}

/// Reference to bytes held by the blob store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredArtifact {
    pub url: String,
    pub id: String,
    pub size_bytes: u64,
    pub content_type: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

/// Durable metadata written once per successfully ingested image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub id: String,
    pub name: String,
    pub artifact: StoredArtifact,
    pub auto_tags: TagSet,
    pub manual_tags: Vec<String>,
    pub owner_id: String,
    pub created_at_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr, Display)]
pub enum ItemErrorKind {
    TempResourceError,
    BlobUploadError,
    PersistenceError,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemError {
    pub kind: ItemErrorKind,
    pub message: String,
}

/// Terminal outcome for one submitted item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemOutcome {
    pub original_name: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record: Option<ImageRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ItemError>,
}

impl ItemOutcome {
    pub fn succeeded(original_name: impl Into<String>, record: ImageRecord) -> Self {
        Self {
            original_name: original_name.into(),
            success: true,
            record: Some(record),
            error: None,
        }
    }

    pub fn failed(
        original_name: impl Into<String>,
        kind: ItemErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            original_name: original_name.into(),
            success: false,
            record: None,
            error: Some(ItemError {
                kind,
                message: message.into(),
            }),
        }
    }

    pub fn error_kind(&self) -> Option<ItemErrorKind> {
        self.error.as_ref().map(|err| err.kind)
    }
}

/// Per-item outcomes in submission order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchResult {
    pub items: Vec<ItemOutcome>,
}

impl BatchResult {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn succeeded(&self) -> usize {
        self.items.iter().filter(|item| item.success).count()
    }

    pub fn failed(&self) -> usize {
        self.items.len() - self.succeeded()
    }
}
