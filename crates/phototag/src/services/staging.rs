//! Scoped staging of upload bytes on local disk.
//!
//! Every [`StagedFile`] is released exactly once: either explicitly through
//! [`StagedFile::release`] or, on any other exit path, when it is dropped.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use futures_util::StreamExt;
use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

use crate::services::blob_store::{BlobError, ByteStream, Cid};

const READ_CHUNK_BYTES: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum StagingError {
    #[error("failed to create staging file in {dir}: {source}")]
    Create {
        dir: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write staging file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("upload stream failed while staging: {0}")]
    Stream(#[source] BlobError),
    #[error("upload exceeds the {limit}-byte item limit")]
    TooLarge { limit: u64 },
}

#[derive(Debug, Default)]
struct StagingCounters {
    acquired: AtomicUsize,
    released: AtomicUsize,
    release_failures: AtomicUsize,
}

/// Point-in-time view of staging activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StagingStats {
    pub acquired: usize,
    pub released: usize,
    pub release_failures: usize,
}

impl StagingStats {
    /// Handles acquired but not yet released.
    pub fn outstanding(&self) -> usize {
        self.acquired.saturating_sub(self.released)
    }
}

/// Header-level facts about a staged image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageInfo {
    pub mime_type: Option<&'static str>,
    pub width: u32,
    pub height: u32,
}

/// Owns the staging directory and hands out scoped handles.
#[derive(Debug, Clone)]
pub struct TempStager {
    dir: PathBuf,
    counters: Arc<StagingCounters>,
}

impl TempStager {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StagingError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|source| StagingError::Create {
            dir: dir.clone(),
            source,
        })?;
        Ok(Self {
            dir,
            counters: Arc::new(StagingCounters::default()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn stats(&self) -> StagingStats {
        StagingStats {
            acquired: self.counters.acquired.load(Ordering::SeqCst),
            released: self.counters.released.load(Ordering::SeqCst),
            release_failures: self.counters.release_failures.load(Ordering::SeqCst),
        }
    }

    /// Stream `data` into a fresh staging file, refusing more than `max_bytes`.
    ///
    /// On failure, or if the future is dropped mid-stream, the partial file is
    /// removed and no handle exists, so nothing is left to release.
    pub async fn acquire(
        &self,
        name: &str,
        mut data: ByteStream,
        max_bytes: u64,
    ) -> Result<StagedFile, StagingError> {
        let temp = tempfile::Builder::new()
            .prefix("stage-")
            .suffix(&staging_suffix(name))
            .tempfile_in(&self.dir)
            .map_err(|source| StagingError::Create {
                dir: self.dir.clone(),
                source,
            })?;
        let write_err = |source| StagingError::Write {
            path: temp.path().to_path_buf(),
            source,
        };
        let mut file = fs::File::from_std(temp.as_file().try_clone().map_err(write_err)?);

        let mut hasher = blake3::Hasher::new();
        let mut size_bytes: u64 = 0;
        while let Some(chunk) = data.next().await {
            let chunk = chunk.map_err(StagingError::Stream)?;
            size_bytes = size_bytes.saturating_add(chunk.len() as u64);
            if size_bytes > max_bytes {
                return Err(StagingError::TooLarge { limit: max_bytes });
            }
            hasher.update(&chunk);
            file.write_all(&chunk).await.map_err(write_err)?;
        }
        file.flush().await.map_err(write_err)?;
        drop(file);

        let path = temp
            .into_temp_path()
            .keep()
            .map_err(|err| StagingError::Create {
                dir: self.dir.clone(),
                source: err.error,
            })?;

        self.counters.acquired.fetch_add(1, Ordering::SeqCst);
        let cid = hasher.finalize().to_hex().to_string();
        debug!(path = %path.display(), size_bytes, cid = %cid, "staged upload");

        Ok(StagedFile {
            path,
            size_bytes,
            cid,
            counters: Arc::clone(&self.counters),
            released: false,
        })
    }
}

/// Exclusive handle to one staged upload.
#[derive(Debug)]
pub struct StagedFile {
    path: PathBuf,
    size_bytes: u64,
    cid: Cid,
    counters: Arc<StagingCounters>,
    released: bool,
}

impl StagedFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    /// BLAKE3 hex digest of the staged bytes.
    pub fn cid(&self) -> &str {
        &self.cid
    }

    pub async fn read_all(&self) -> io::Result<Bytes> {
        fs::read(&self.path).await.map(Bytes::from)
    }

    /// Fresh chunked stream over the staged bytes; may be called repeatedly.
    pub async fn open_stream(&self) -> Result<ByteStream, BlobError> {
        let file = fs::File::open(&self.path)
            .await
            .map_err(|e| BlobError::Io(format!("open staged file: {}", e)))?;

        let stream = async_stream::try_stream! {
            let mut file = file;
            let mut buf = vec![0u8; READ_CHUNK_BYTES];
            loop {
                let n = file.read(&mut buf).await.map_err(|e| BlobError::Io(format!("read: {}", e)))?;
                if n == 0 {
                    break;
                }
                yield Bytes::copy_from_slice(&buf[..n]);
            }
        };

        Ok(Box::pin(stream))
    }

    /// Read the image header; `None` when the bytes are not a recognised image.
    pub async fn inspect(&self) -> Option<ImageInfo> {
        let path = self.path.clone();
        let inspected = tokio::task::spawn_blocking(move || -> image::ImageResult<ImageInfo> {
            let reader = image::ImageReader::open(&path)?.with_guessed_format()?;
            let mime_type = reader.format().map(|format| format.to_mime_type());
            let (width, height) = reader.into_dimensions()?;
            Ok(ImageInfo {
                mime_type,
                width,
                height,
            })
        })
        .await;

        match inspected {
            Ok(Ok(info)) => Some(info),
            Ok(Err(err)) => {
                debug!(path = %self.path.display(), error = %err, "image header unreadable");
                None
            }
            Err(err) => {
                warn!(error = %err, "image inspect task failed");
                None
            }
        }
    }

    /// Delete the staged file. Failures are logged and counted, never returned.
    pub fn release(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.counters.released.fetch_add(1, Ordering::SeqCst);
        if let Err(err) = std::fs::remove_file(&self.path) {
            self.counters.release_failures.fetch_add(1, Ordering::SeqCst);
            warn!(path = %self.path.display(), error = %err, "failed to delete staged file");
        }
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if !self.released {
            debug!(path = %self.path.display(), "releasing staged file on drop");
            self.release_once();
        }
    }
}

/// Keep the original extension so external analyzers can sniff by name.
fn staging_suffix(name: &str) -> String {
    Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .filter(|ext| !ext.is_empty() && ext.len() <= 8 && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(|ext| format!(".{}", ext.to_ascii_lowercase()))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use tempfile::TempDir;

    fn bytes_stream(data: &'static [u8]) -> ByteStream {
        Box::pin(stream::iter(vec![Ok(Bytes::from_static(data))]))
    }

    #[tokio::test]
    async fn acquire_writes_bytes_and_release_deletes() {
        let temp = TempDir::new().expect("temp dir");
        let stager = TempStager::new(temp.path().join("staging")).expect("stager");

        let staged = stager
            .acquire("cat.PNG", bytes_stream(b"meow"), u64::MAX)
            .await
            .expect("acquire");
        let path = staged.path().to_path_buf();
        assert_eq!(staged.size_bytes(), 4);
        assert_eq!(staged.cid(), blake3::hash(b"meow").to_hex().as_str());
        assert_eq!(path.extension().and_then(|e| e.to_str()), Some("png"));
        assert_eq!(staged.read_all().await.expect("read").as_ref(), b"meow");

        staged.release();
        assert!(!path.exists());
        assert_eq!(
            stager.stats(),
            StagingStats {
                acquired: 1,
                released: 1,
                release_failures: 0
            }
        );
    }

    #[tokio::test]
    async fn dropping_handle_releases_once() {
        let temp = TempDir::new().expect("temp dir");
        let stager = TempStager::new(temp.path()).expect("stager");

        let path = {
            let staged = stager
                .acquire("a.jpg", bytes_stream(b"x"), u64::MAX)
                .await
                .expect("acquire");
            staged.path().to_path_buf()
        };
        assert!(!path.exists());
        assert_eq!(stager.stats().released, 1);
        assert_eq!(stager.stats().outstanding(), 0);
    }

    #[tokio::test]
    async fn failed_delete_is_counted_not_raised() {
        let temp = TempDir::new().expect("temp dir");
        let stager = TempStager::new(temp.path()).expect("stager");

        let staged = stager
            .acquire("gone.png", bytes_stream(b"x"), u64::MAX)
            .await
            .expect("acquire");
        std::fs::remove_file(staged.path()).expect("remove behind the handle's back");
        staged.release();

        let stats = stager.stats();
        assert_eq!(stats.released, 1);
        assert_eq!(stats.release_failures, 1);
    }

    #[tokio::test]
    async fn stream_failure_leaves_no_handle_or_file() {
        let temp = TempDir::new().expect("temp dir");
        let stager = TempStager::new(temp.path()).expect("stager");

        let failing: ByteStream = Box::pin(stream::iter(vec![
            Ok(Bytes::from_static(b"half")),
            Err(BlobError::Stream("reset".into())),
        ]));
        let err = stager.acquire("x.png", failing, u64::MAX).await.expect_err("fails");
        assert!(matches!(err, StagingError::Stream(_)));
        assert_eq!(stager.stats(), StagingStats::default());
        assert_eq!(std::fs::read_dir(temp.path()).expect("list").count(), 0);
    }

    #[tokio::test]
    async fn oversized_stream_is_refused_and_removed() {
        let temp = TempDir::new().expect("temp dir");
        let stager = TempStager::new(temp.path()).expect("stager");

        let chunks: ByteStream = Box::pin(stream::iter(vec![
            Ok(Bytes::from_static(b"12345")),
            Ok(Bytes::from_static(b"67890")),
            Ok(Bytes::from_static(b"!")),
        ]));
        let err = stager.acquire("big.png", chunks, 10).await.expect_err("too large");
        assert!(matches!(err, StagingError::TooLarge { limit: 10 }));
        assert_eq!(stager.stats(), StagingStats::default());
        assert_eq!(std::fs::read_dir(temp.path()).expect("list").count(), 0);

        let staged = stager
            .acquire("fits.png", bytes_stream(b"0123456789"), 10)
            .await
            .expect("exactly at the limit");
        assert_eq!(staged.size_bytes(), 10);
    }

    #[tokio::test]
    async fn abandoned_acquire_leaves_no_file() {
        let temp = TempDir::new().expect("temp dir");
        let stager = TempStager::new(temp.path()).expect("stager");

        let stalled: ByteStream = Box::pin(
            stream::iter(vec![Ok(Bytes::from_static(b"partial"))]).chain(stream::pending()),
        );
        let result = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            stager.acquire("stall.png", stalled, u64::MAX),
        )
        .await;
        assert!(result.is_err(), "acquire should still be waiting on the stream");
        assert_eq!(std::fs::read_dir(temp.path()).expect("list").count(), 0);
        assert_eq!(stager.stats(), StagingStats::default());
    }

    #[tokio::test]
    async fn open_stream_replays_staged_bytes() {
        let temp = TempDir::new().expect("temp dir");
        let stager = TempStager::new(temp.path()).expect("stager");
        let staged = stager
            .acquire("a.bin", bytes_stream(b"replay me"), u64::MAX)
            .await
            .expect("acquire");

        for _ in 0..2 {
            let mut stream = staged.open_stream().await.expect("stream");
            let mut collected = Vec::new();
            while let Some(chunk) = stream.next().await {
                collected.extend_from_slice(&chunk.expect("chunk"));
            }
            assert_eq!(collected, b"replay me");
        }
    }

    #[tokio::test]
    async fn inspect_returns_none_for_non_images() {
        let temp = TempDir::new().expect("temp dir");
        let stager = TempStager::new(temp.path()).expect("stager");
        let staged = stager
            .acquire("notes.txt", bytes_stream(b"plain text"), u64::MAX)
            .await
            .expect("acquire");
        assert!(staged.inspect().await.is_none());
    }

    #[test]
    fn suffix_is_sanitized() {
        assert_eq!(staging_suffix("photo.JPEG"), ".jpeg");
        assert_eq!(staging_suffix("noext"), "");
        assert_eq!(staging_suffix("weird.p/ng"), "");
    }
}
