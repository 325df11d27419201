//! Application-level error type shared by the binary and services.

use std::path::PathBuf;

use thiserror::Error;

use crate::config;
use crate::paths::PathError;
use crate::services::{ContextError, IngestError, PersistenceError};

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    ConfigLoad(#[from] config::AppConfigError),
    #[error(transparent)]
    Context(#[from] ContextError),
    #[error(transparent)]
    Ingest(#[from] IngestError),
    #[error(transparent)]
    Records(#[from] PersistenceError),
    #[error(transparent)]
    Paths(#[from] PathError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("failed to read input file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write output: {0}")]
    Output(#[source] std::io::Error),
}
