use std::sync::Arc;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use bon::Builder;
use tracing::{debug, warn};

use crate::pipeline::StoredArtifact;
use crate::services::blob_store::{BlobError, BlobStore, PutRequest};
use crate::services::staging::StagedFile;

fn default_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(250))
        .with_max_delay(Duration::from_secs(5))
        .with_jitter()
}

/// Moves staged bytes into the blob store with a per-attempt deadline.
#[derive(Clone, Builder)]
pub struct BlobUploader {
    store: Arc<dyn BlobStore>,
    #[builder(default = Duration::from_secs(60))]
    request_timeout: Duration,
    /// Retries after the first attempt; only transient failures are retried.
    #[builder(default = 2)]
    max_retries: usize,
    #[builder(default = default_backoff())]
    backoff: ExponentialBuilder,
}

impl BlobUploader {
    pub async fn preflight(&self) -> Result<(), BlobError> {
        self.store.preflight().await
    }

    /// Upload `staged` under `folder`.
    ///
    /// Every attempt reopens the staged file, so a retry never sees a
    /// half-consumed stream. `dimensions` fills width/height when the backend
    /// does not report them.
    pub async fn upload(
        &self,
        staged: &StagedFile,
        folder: &str,
        content_type: &str,
        dimensions: Option<(u32, u32)>,
    ) -> Result<StoredArtifact, BlobError> {
        let attempt = || async {
            let data = staged.open_stream().await?;
            let request = PutRequest {
                folder: folder.to_string(),
                key: None,
                content_type: content_type.to_string(),
                data,
            };
            match tokio::time::timeout(self.request_timeout, self.store.put(request)).await {
                Ok(result) => result,
                Err(_) => Err(BlobError::Timeout(self.request_timeout)),
            }
        };

        let mut artifact = attempt
            .retry(self.backoff.with_max_times(self.max_retries))
            .when(BlobError::is_transient)
            .notify(|err: &BlobError, delay: Duration| {
                warn!(
                    path = %staged.path().display(),
                    error = %err,
                    delay_ms = delay.as_millis() as u64,
                    "retrying blob upload"
                );
            })
            .await?;

        if let Some((width, height)) = dimensions {
            artifact.width.get_or_insert(width);
            artifact.height.get_or_insert(height);
        }
        debug!(id = %artifact.id, size_bytes = artifact.size_bytes, "blob stored");
        Ok(artifact)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use bytes::Bytes;
    use futures::stream;
    use tempfile::TempDir;

    use crate::services::blob_store::{BlobMeta, compute_cid_and_collect};
    use crate::services::staging::TempStager;

    /// Fails the first `failures` puts with the given error, then succeeds.
    struct Flaky {
        failures: usize,
        transient: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl BlobStore for Flaky {
        async fn put(&self, request: PutRequest) -> Result<StoredArtifact, BlobError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let (cid, size, _) = compute_cid_and_collect(request.data).await?;
            if call < self.failures {
                return Err(if self.transient {
                    BlobError::Unavailable("busy".into())
                } else {
                    BlobError::InvalidKey("nope".into())
                });
            }
            Ok(StoredArtifact {
                url: format!("mem://{}/{cid}", request.folder),
                id: format!("{}/{cid}", request.folder),
                size_bytes: size,
                content_type: request.content_type,
                width: None,
                height: None,
            })
        }

        async fn head(&self, _key: &str) -> Result<Option<BlobMeta>, BlobError> {
            Ok(None)
        }

        async fn delete(&self, _key: &str) -> Result<bool, BlobError> {
            Ok(false)
        }
    }

    fn fast_backoff() -> ExponentialBuilder {
        ExponentialBuilder::default().with_min_delay(Duration::from_millis(1))
    }

    async fn staged(stager: &TempStager) -> StagedFile {
        stager
            .acquire(
                "a.png",
                Box::pin(stream::iter(vec![Ok(Bytes::from_static(b"pixels"))])),
                u64::MAX,
            )
            .await
            .expect("staged")
    }

    #[tokio::test]
    async fn transient_failures_are_retried_with_fresh_streams() {
        let temp = TempDir::new().expect("temp dir");
        let stager = TempStager::new(temp.path()).expect("stager");
        let store = Arc::new(Flaky {
            failures: 2,
            transient: true,
            calls: AtomicUsize::new(0),
        });
        let uploader = BlobUploader::builder()
            .store(store.clone())
            .backoff(fast_backoff())
            .build();

        let staged = staged(&stager).await;
        let artifact = uploader
            .upload(&staged, "user_images", "image/png", Some((4, 3)))
            .await
            .expect("uploaded");

        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
        assert_eq!(artifact.size_bytes, 6);
        assert_eq!(artifact.width, Some(4));
        assert_eq!(artifact.height, Some(3));
        assert!(artifact.id.starts_with("user_images/"));
    }

    #[tokio::test]
    async fn permanent_failures_are_not_retried() {
        let temp = TempDir::new().expect("temp dir");
        let stager = TempStager::new(temp.path()).expect("stager");
        let store = Arc::new(Flaky {
            failures: 1,
            transient: false,
            calls: AtomicUsize::new(0),
        });
        let uploader = BlobUploader::builder()
            .store(store.clone())
            .backoff(fast_backoff())
            .build();

        let staged = staged(&stager).await;
        let err = uploader
            .upload(&staged, "user_images", "image/png", None)
            .await
            .expect_err("fails");
        assert!(matches!(err, BlobError::InvalidKey(_)));
        assert_eq!(store.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let temp = TempDir::new().expect("temp dir");
        let stager = TempStager::new(temp.path()).expect("stager");
        let store = Arc::new(Flaky {
            failures: usize::MAX,
            transient: true,
            calls: AtomicUsize::new(0),
        });
        let uploader = BlobUploader::builder()
            .store(store.clone())
            .max_retries(1)
            .backoff(fast_backoff())
            .build();

        let staged = staged(&stager).await;
        let err = uploader
            .upload(&staged, "user_images", "image/png", None)
            .await
            .expect_err("fails");
        assert!(err.is_transient());
        assert_eq!(store.calls.load(Ordering::SeqCst), 2);
    }
}
