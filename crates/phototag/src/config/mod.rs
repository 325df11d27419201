//! Layered configuration loading.
//!
//! Sources, lowest precedence first:
//! 1. built-in defaults
//! 2. `$PHOTOTAG_ETC_CONFIG_DIR/phototag/settings.toml` (`/etc` when unset)
//! 3. `$XDG_CONFIG_HOME/phototag/settings.toml`
//! 4. `./config/settings.toml`
//! 5. the file named by `$PHOTOTAG_CONFIG_FILE`
//! 6. `PHOTOTAG__SECTION__KEY` environment variables

use std::env;
use std::num::NonZeroU32;
use std::path::PathBuf;
use std::time::Duration;

use config::{Config, Environment, File};
use directories::ProjectDirs;
use serde::Deserialize;
use thiserror::Error;

use crate::constants::{DEFAULT_FOLDER, DEFAULT_MAX_ITEM_BYTES};
use crate::services::blob_store::DurableWrite;
use crate::services::detect::ProcessOutputFormat;

const APP_DIR: &str = "phototag";
const SETTINGS_FILE: &str = "settings.toml";
const LOCAL_CONFIG_FILE: &str = "config/settings";
const ENV_PREFIX: &str = "PHOTOTAG";
pub const ETC_DIR_ENV: &str = "PHOTOTAG_ETC_CONFIG_DIR";
pub const CONFIG_FILE_ENV: &str = "PHOTOTAG_CONFIG_FILE";

#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("unable to resolve project directories")]
    MissingProjectDirs,
    #[error(transparent)]
    Build(#[from] config::ConfigError),
    #[error("storage backend `http` requires `storage.http.endpoint`")]
    MissingHttpEndpoint,
    #[error("`{field}` must be greater than zero")]
    Zero { field: &'static str },
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub storage: StorageConfig,
    pub ingest: IngestConfig,
    #[serde(default)]
    pub detectors: DetectorsConfig,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    Fs,
    Http,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Root for staging, filesystem blobs and the record store.
    pub path: PathBuf,
    pub durability: DurableWrite,
    #[serde(default)]
    pub http: Option<HttpStorageConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HttpStorageConfig {
    pub endpoint: String,
    #[serde(default)]
    pub api_token: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    pub workers: usize,
    pub folder: String,
    pub max_batch_items: usize,
    pub max_item_bytes: u64,
    pub preflight: bool,
    pub detector_timeout_secs: u64,
    pub upload_timeout_secs: u64,
    pub upload_max_retries: usize,
    pub persist_timeout_secs: u64,
}

impl IngestConfig {
    pub fn detector_timeout(&self) -> Duration {
        Duration::from_secs(self.detector_timeout_secs)
    }

    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_timeout_secs)
    }

    pub fn persist_timeout(&self) -> Duration {
        Duration::from_secs(self.persist_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct DetectorsConfig {
    #[serde(default)]
    pub object: Option<ProcessDetectorConfig>,
    #[serde(default)]
    pub ocr: Option<RemoteDetectorConfig>,
    #[serde(default)]
    pub semantic: Option<RemoteDetectorConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProcessDetectorConfig {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub output: ProcessOutputFormat,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RemoteDetectorConfig {
    pub endpoint: String,
    #[serde(default)]
    pub api_token: Option<String>,
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: u32,
    #[serde(default = "default_remote_retries")]
    pub max_retries: usize,
    #[serde(default = "default_remote_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_min_token_chars")]
    pub min_token_chars: usize,
    #[serde(default)]
    pub min_score: f32,
}

impl RemoteDetectorConfig {
    pub fn requests_per_second(&self) -> Result<NonZeroU32, AppConfigError> {
        NonZeroU32::new(self.requests_per_second).ok_or(AppConfigError::Zero {
            field: "detectors.*.requests_per_second",
        })
    }
}

fn default_requests_per_second() -> u32 {
    10
}

fn default_remote_retries() -> usize {
    2
}

fn default_remote_timeout_secs() -> u64 {
    20
}

fn default_min_token_chars() -> usize {
    3
}

pub fn load() -> Result<AppConfig, AppConfigError> {
    let default_storage = project_dirs()?.data_dir().to_path_buf();
    let mut builder = Config::builder()
        .set_default("storage.backend", "fs")?
        .set_default("storage.path", default_storage.to_string_lossy().to_string())?
        .set_default("storage.durability", "file_only")?
        .set_default("ingest.workers", 4)?
        .set_default("ingest.folder", DEFAULT_FOLDER)?
        .set_default("ingest.max_batch_items", 64)?
        .set_default("ingest.max_item_bytes", DEFAULT_MAX_ITEM_BYTES)?
        .set_default("ingest.preflight", true)?
        .set_default("ingest.detector_timeout_secs", 30)?
        .set_default("ingest.upload_timeout_secs", 60)?
        .set_default("ingest.upload_max_retries", 2)?
        .set_default("ingest.persist_timeout_secs", 10)?;

    for path in system_config_files()? {
        builder = builder.add_source(File::from(path).required(false));
    }
    builder = builder.add_source(File::with_name(LOCAL_CONFIG_FILE).required(false));
    if let Some(path) = env::var_os(CONFIG_FILE_ENV) {
        builder = builder.add_source(File::from(PathBuf::from(path)).required(false));
    }
    builder = builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("__")
            .separator("__"),
    );

    let cfg: AppConfig = builder.build()?.try_deserialize()?;
    validate(&cfg)?;
    Ok(cfg)
}

fn validate(cfg: &AppConfig) -> Result<(), AppConfigError> {
    if cfg.storage.backend == StorageBackend::Http && cfg.storage.http.is_none() {
        return Err(AppConfigError::MissingHttpEndpoint);
    }
    if cfg.ingest.workers == 0 {
        return Err(AppConfigError::Zero {
            field: "ingest.workers",
        });
    }
    if cfg.ingest.max_item_bytes == 0 {
        return Err(AppConfigError::Zero {
            field: "ingest.max_item_bytes",
        });
    }
    Ok(())
}

/// `/etc` (or its override) first, then the per-user XDG location.
fn system_config_files() -> Result<Vec<PathBuf>, AppConfigError> {
    let etc_root = env::var_os(ETC_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/etc"));
    Ok(vec![
        etc_root.join(APP_DIR).join(SETTINGS_FILE),
        project_dirs()?.config_dir().join(SETTINGS_FILE),
    ])
}

pub fn project_dirs() -> Result<ProjectDirs, AppConfigError> {
    ProjectDirs::from("dev", APP_DIR, APP_DIR).ok_or(AppConfigError::MissingProjectDirs)
}
