use std::pin::Pin;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::stream::Stream;
use futures_util::StreamExt;
use reqwest::{Client, StatusCode, header};
use serde::Deserialize;
use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::constants::USER_AGENT;
use crate::paths::{AppPaths, normalize_folder};
use crate::pipeline::StoredArtifact;

// Blob storage abstractions.
//
// `BlobStore` is the object-storage seam of the ingestion pipeline. Keys have
// the shape `{folder}/{cid}` where the CID is the BLAKE3 lowercase hex of the
// stored bytes unless the caller supplies its own key.

/// Boxed asynchronous byte stream accepted by the blob store.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, BlobError>> + Send>>;

/// Canonical content identifier (BLAKE3 lowercase hex of exact bytes).
pub type Cid = String;

/// Minimal metadata returned by `head` about a blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobMeta {
    pub key: String,
    pub size_bytes: u64,
}

/// A single upload handed to a backend.
pub struct PutRequest {
    pub folder: String,
    /// Caller-chosen object name; backends derive one from content when absent.
    pub key: Option<String>,
    pub content_type: String,
    pub data: ByteStream,
}

/// Errors emitted by blob storage operations.
#[derive(Debug, Error)]
pub enum BlobError {
    #[error("not found")]
    NotFound,

    #[error("invalid cid: {0}")]
    InvalidCid(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("stream error: {0}")]
    Stream(String),

    #[error("storage request failed: {0}")]
    Request(String),

    #[error("storage returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("failed to decode storage response: {0}")]
    Decode(String),

    #[error("storage call timed out after {0:?}")]
    Timeout(Duration),

    #[error("storage backend unavailable: {0}")]
    Unavailable(String),
}

impl BlobError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            BlobError::Request(_) | BlobError::Timeout(_) | BlobError::Unavailable(_) => true,
            BlobError::Http { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

impl From<std::io::Error> for BlobError {
    fn from(e: std::io::Error) -> Self {
        BlobError::Io(e.to_string())
    }
}

impl From<reqwest::Error> for BlobError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            BlobError::Decode(e.to_string())
        } else {
            BlobError::Request(e.to_string())
        }
    }
}

/// Validate a candidate CID: must be lowercase hex and non-empty.
pub fn validate_cid(cid: &str) -> Result<(), BlobError> {
    // Path sharding needs at least two characters.
    if cid.len() < 2 {
        return Err(BlobError::InvalidCid(cid.to_string()));
    }

    if !cid.chars().all(|c: char| c.is_ascii_digit() || ('a'..='f').contains(&c)) {
        return Err(BlobError::InvalidCid(cid.to_string()));
    }
    Ok(())
}

/// Compute the BLAKE3 CID for a full byte slice.
pub fn blake3_cid(bytes: &[u8]) -> Cid {
    blake3::hash(bytes).to_hex().to_string()
}

/// Compute BLAKE3 cid and size by consuming a `ByteStream`.
/// Returns the cid, total size, and the collected bytes.
pub async fn compute_cid_and_collect(
    mut stream: ByteStream,
) -> Result<(Cid, u64, Bytes), BlobError> {
    let mut hasher = blake3::Hasher::new();
    let mut total: u64 = 0;
    let mut out = BytesMut::new();

    while let Some(chunk_res) = stream.as_mut().next().await {
        let chunk = chunk_res?;
        total = total
            .checked_add(chunk.len() as u64)
            .ok_or_else(|| BlobError::Io("size overflow".to_string()))?;
        hasher.update(&chunk);
        out.extend_from_slice(&chunk);
    }

    let cid = hasher.finalize().to_hex().to_string();
    Ok((cid, total, out.freeze()))
}

/// Split a `{folder}/{name}` key into its parts.
pub fn split_key(key: &str) -> Result<(&str, &str), BlobError> {
    let (folder, name) = key
        .split_once('/')
        .ok_or_else(|| BlobError::InvalidKey(key.to_string()))?;
    if folder.is_empty() || name.is_empty() || name.contains('/') {
        return Err(BlobError::InvalidKey(key.to_string()));
    }
    Ok((folder, name))
}

/// Trait abstracting over blob storage backends.
#[async_trait::async_trait]
pub trait BlobStore: Send + Sync {
    /// Store the provided byte stream under `request.folder` and describe the
    /// stored object. A failed put leaves no artifact the caller can observe.
    async fn put(&self, request: PutRequest) -> Result<StoredArtifact, BlobError>;

    /// Return metadata for `key` if present.
    async fn head(&self, key: &str) -> Result<Option<BlobMeta>, BlobError>;

    /// Delete the blob if present. Returns Ok(true) if deleted, Ok(false) if it
    /// did not exist.
    async fn delete(&self, key: &str) -> Result<bool, BlobError>;

    /// Cheap reachability check run once before a batch starts.
    async fn preflight(&self) -> Result<(), BlobError> {
        Ok(())
    }
}

/// Durability policy for filesystem writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DurableWrite {
    /// No explicit fsync (fastest, least durable).
    None,
    /// Fsync the file only (good for most cases).
    FileOnly,
    /// Fsync file and parent directory (recommended for production).
    FileAndDir,
}

/// Filesystem blob store implementation using AppPaths layout.
///
/// Write strategy:
/// - Temp file in the data dir, finalized atomically (hard link, then rename).
/// - Checksum-on-write: compute BLAKE3 while streaming.
/// - Size verification: compare streamed bytes to file metadata after write.
/// - Idempotency: existing blobs are not replaced.
///
/// Objects are always content addressed; a caller-supplied key is ignored.
#[derive(Debug, Clone, bon::Builder)]
pub struct FsBlobStore {
    paths: AppPaths,
    #[builder(default = DurableWrite::None)]
    durability: DurableWrite,
}

impl FsBlobStore {
    /// Compute the final blob path for a given key without creating directories.
    fn blob_path_unchecked(&self, key: &str) -> Result<std::path::PathBuf, BlobError> {
        let (folder, cid) = split_key(key)?;
        validate_cid(cid)?;
        let mut path = self.paths.data_dir();
        path.push("blobs");
        path.push(folder);
        path.push(&cid[..2]);
        path.push(cid);
        Ok(path)
    }

    /// Fsync a directory by opening and syncing it.
    async fn fsync_dir(&self, dir_path: &std::path::Path) {
        // Directory fsync is best-effort; some platforms don't support it.
        match fs::File::open(dir_path).await {
            Ok(dir_file) => {
                if let Err(e) = dir_file.sync_all().await {
                    tracing::warn!("directory fsync unsupported or failed: {}", e);
                }
            }
            Err(e) => {
                tracing::warn!("failed to open directory for fsync: {}", e);
            }
        }
    }

    /// Try to finalize by hard linking temp to final path. If the final path
    /// already exists another writer won. The temp file is removed when its
    /// guard drops, whichever way this returns.
    async fn finalize_atomic(
        &self,
        temp: NamedTempFile,
        final_path: &std::path::Path,
    ) -> Result<bool, BlobError> {
        const EXDEV: i32 = 18;

        match tokio::task::spawn_blocking({
            let temp_path = temp.path().to_path_buf();
            let final_p = final_path.to_path_buf();
            move || std::fs::hard_link(&temp_path, &final_p)
        })
        .await
        {
            Ok(Ok(())) => return Ok(false),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(true),
            Ok(Err(e)) if e.raw_os_error() == Some(EXDEV) => {
                // Cross-device; fall through to rename.
            }
            Ok(Err(e)) => return Err(BlobError::Io(format!("hard link failed: {}", e))),
            Err(e) => return Err(BlobError::Io(format!("hard link task failed: {}", e))),
        }

        match temp.persist_noclobber(final_path) {
            Ok(_) => Ok(false),
            Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => Ok(true),
            Err(e) => Err(BlobError::Io(format!("rename failed: {}", e.error))),
        }
    }
}

#[async_trait::async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, request: PutRequest) -> Result<StoredArtifact, BlobError> {
        let folder =
            normalize_folder(&request.folder).map_err(|e| BlobError::InvalidKey(e.to_string()))?;
        let mut data = request.data;

        // Dropping the guard removes the temp file, including when this future
        // is cancelled mid-stream.
        let temp_file = NamedTempFile::new_in(self.paths.data_dir())
            .map_err(|e| BlobError::Io(format!("create temp file: {}", e)))?;
        let std_file = temp_file
            .as_file()
            .try_clone()
            .map_err(|e| BlobError::Io(format!("open temp file: {}", e)))?;
        let mut file = fs::File::from_std(std_file);

        let mut hasher = blake3::Hasher::new();
        let mut total_bytes: u64 = 0;

        while let Some(chunk_res) = data.next().await {
            let chunk = chunk_res.map_err(|e| BlobError::Stream(e.to_string()))?;
            total_bytes = total_bytes
                .checked_add(chunk.len() as u64)
                .ok_or_else(|| BlobError::Io("size overflow".to_string()))?;
            hasher.update(&chunk);
            file.write_all(&chunk)
                .await
                .map_err(|e| BlobError::Io(format!("write chunk: {}", e)))?;
        }
        file.flush()
            .await
            .map_err(|e| BlobError::Io(format!("flush: {}", e)))?;
        if matches!(
            self.durability,
            DurableWrite::FileOnly | DurableWrite::FileAndDir
        ) {
            file.sync_all()
                .await
                .map_err(|e| BlobError::Io(format!("fsync file: {}", e)))?;
        }
        drop(file);

        let metadata = fs::metadata(temp_file.path())
            .await
            .map_err(|e| BlobError::Io(format!("stat temp file: {}", e)))?;
        if metadata.len() != total_bytes {
            return Err(BlobError::Io(format!(
                "size mismatch: wrote {} bytes, file is {}",
                total_bytes,
                metadata.len()
            )));
        }

        let cid = hasher.finalize().to_hex().to_string();
        let final_path = self
            .paths
            .blob_path(&folder, &cid)
            .map_err(|e| BlobError::Io(e.to_string()))?;

        let existed = if final_path.exists() {
            true
        } else {
            let existed = self.finalize_atomic(temp_file, &final_path).await?;
            if self.durability == DurableWrite::FileAndDir && !existed {
                if let Some(shard_dir) = final_path.parent() {
                    self.fsync_dir(shard_dir).await;
                }
            }
            existed
        };
        tracing::debug!(folder = %folder, cid = %cid, existed, "stored blob");

        Ok(StoredArtifact {
            url: format!("file://{}", final_path.display()),
            id: format!("{folder}/{cid}"),
            size_bytes: total_bytes,
            content_type: request.content_type,
            width: None,
            height: None,
        })
    }

    async fn head(&self, key: &str) -> Result<Option<BlobMeta>, BlobError> {
        let path = self.blob_path_unchecked(key)?;

        match fs::metadata(&path).await {
            Ok(meta) => Ok(Some(BlobMeta {
                key: key.to_string(),
                size_bytes: meta.len(),
            })),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(BlobError::Io(format!("stat blob: {}", e))),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, BlobError> {
        let path = self.blob_path_unchecked(key)?;

        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(BlobError::Io(format!("delete blob: {}", e))),
        }
    }

    async fn preflight(&self) -> Result<(), BlobError> {
        self.paths
            .blobs_base_dir()
            .map(|_| ())
            .map_err(|e| BlobError::Unavailable(e.to_string()))
    }
}

/// Body returned by an object-storage HTTP API after an upload.
///
/// Cloudinary-style field names are accepted as aliases.
#[derive(Debug, Deserialize)]
struct RemoteUploadResponse {
    #[serde(alias = "secure_url")]
    url: String,
    #[serde(alias = "public_id")]
    id: Option<String>,
    #[serde(alias = "size_bytes")]
    bytes: Option<u64>,
    #[serde(alias = "format")]
    content_type: Option<String>,
}

/// Object storage reached over HTTP: `PUT {endpoint}/{folder}/{key}`.
#[derive(Debug, Clone)]
pub struct HttpBlobStore {
    http: Client,
    endpoint: String,
    api_token: Option<String>,
}

impl HttpBlobStore {
    pub fn new(
        endpoint: impl Into<String>,
        api_token: Option<String>,
        request_timeout: Duration,
    ) -> Result<Self, BlobError> {
        let endpoint = endpoint.into().trim_end_matches('/').to_string();
        if endpoint.is_empty() {
            return Err(BlobError::InvalidKey("empty storage endpoint".to_string()));
        }
        let http = Client::builder()
            .timeout(request_timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(BlobError::from)?;
        Ok(Self {
            http,
            endpoint,
            api_token,
        })
    }

    fn object_url(&self, key: &str) -> Result<String, BlobError> {
        let (folder, name) = split_key(key)?;
        Ok(format!("{}/{}/{}", self.endpoint, folder, name))
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.api_token.as_deref() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait::async_trait]
impl BlobStore for HttpBlobStore {
    async fn put(&self, request: PutRequest) -> Result<StoredArtifact, BlobError> {
        let folder =
            normalize_folder(&request.folder).map_err(|e| BlobError::InvalidKey(e.to_string()))?;
        let (cid, size_bytes, body) = compute_cid_and_collect(request.data).await?;
        let name = request.key.unwrap_or(cid);
        let key = format!("{folder}/{name}");
        let url = self.object_url(&key)?;

        let response = self
            .authorize(self.http.put(&url))
            .header(header::CONTENT_TYPE, request.content_type.as_str())
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BlobError::Http {
                status: status.as_u16(),
                body: truncate(&body, 256),
            });
        }

        let decoded: RemoteUploadResponse = response
            .json()
            .await
            .map_err(|e| BlobError::Decode(e.to_string()))?;

        Ok(StoredArtifact {
            url: decoded.url,
            id: decoded.id.unwrap_or(key),
            size_bytes: decoded.bytes.unwrap_or(size_bytes),
            content_type: decoded
                .content_type
                .map(|format| normalize_content_type(&format))
                .unwrap_or(request.content_type),
            width: None,
            height: None,
        })
    }

    async fn head(&self, key: &str) -> Result<Option<BlobMeta>, BlobError> {
        let url = self.object_url(key)?;
        let response = self.authorize(self.http.head(&url)).send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let size_bytes = response
                    .headers()
                    .get(header::CONTENT_LENGTH)
                    .and_then(|value| value.to_str().ok())
                    .and_then(|value| value.parse::<u64>().ok())
                    .unwrap_or(0);
                Ok(Some(BlobMeta {
                    key: key.to_string(),
                    size_bytes,
                }))
            }
            status => Err(BlobError::Http {
                status: status.as_u16(),
                body: String::new(),
            }),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, BlobError> {
        let url = self.object_url(key)?;
        let response = self.authorize(self.http.delete(&url)).send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            status => Err(BlobError::Http {
                status: status.as_u16(),
                body: String::new(),
            }),
        }
    }

    async fn preflight(&self) -> Result<(), BlobError> {
        let response = self
            .authorize(self.http.head(&self.endpoint))
            .send()
            .await
            .map_err(|e| BlobError::Unavailable(e.to_string()))?;
        if response.status().is_server_error() {
            return Err(BlobError::Unavailable(format!(
                "storage endpoint answered HTTP {}",
                response.status().as_u16()
            )));
        }
        Ok(())
    }
}

/// Bare formats (`png`) become MIME types; full MIME types pass through.
fn normalize_content_type(format: &str) -> String {
    let trimmed = format.trim().to_ascii_lowercase();
    if trimmed.contains('/') {
        trimmed
    } else if trimmed == "jpg" {
        "image/jpeg".to_string()
    } else {
        format!("image/{trimmed}")
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}
