use std::path::PathBuf;

use clap::{Args, ValueHint};

use super::validators::{validate_folder, validate_owner, validate_workers};

/// Ingest local image files for one owner.
#[derive(Debug, Args)]
pub struct IngestArgs {
    /// Owner recorded on every stored image.
    #[arg(long, value_parser = validate_owner)]
    pub owner: String,
    /// Destination folder in the blob store (defaults to `ingest.folder`).
    #[arg(long, value_parser = validate_folder)]
    pub folder: Option<String>,
    /// Concurrent items (defaults to `ingest.workers`).
    #[arg(long, value_parser = validate_workers)]
    pub workers: Option<usize>,
    /// Image files, processed and reported in this order.
    #[arg(required = true, value_hint = ValueHint::FilePath)]
    pub files: Vec<PathBuf>,
}
