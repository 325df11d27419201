//! Cross-cutting application constants.

/// User agent sent to remote analyzers and object storage.
pub const USER_AGENT: &str = concat!("phototag/", env!("CARGO_PKG_VERSION"));

/// Default blob store folder for ingested images.
pub const DEFAULT_FOLDER: &str = "user_images";

/// Per-item upload cap (10 MiB).
pub const DEFAULT_MAX_ITEM_BYTES: u64 = 10 * 1024 * 1024;
