//! Durable image metadata: the record store and the writer that feeds it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use bincode::config;
use bincode::error::{DecodeError, EncodeError};
use bincode::serde::{decode_from_slice, encode_to_vec};
use chrono::Utc;
use heed::types::{Bytes, Str};
use heed::{Database, Env, EnvOpenOptions};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::paths::{AppPaths, PathError};
use crate::pipeline::{ImageRecord, StoredArtifact, TagSet};

const RECORDS_ENV_MAP_SIZE_BYTES: usize = 1 << 30;
/// Slack past the write deadline before the writer stops waiting on a store.
const COMMIT_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error(transparent)]
    Path(#[from] PathError),
    #[error(transparent)]
    Heed(#[from] heed::Error),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("record store task failed: {0}")]
    Join(String),
    #[error("record write timed out after {0:?}")]
    Timeout(Duration),
    #[error("record `{0}` already exists")]
    Duplicate(String),
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Write `record` unless `deadline` passes first; a write that reports
    /// `Timeout` must not have committed.
    async fn insert(&self, record: &ImageRecord, deadline: Instant)
    -> Result<(), PersistenceError>;

    /// Records for `owner_id`, newest first.
    async fn list_by_owner(
        &self,
        owner_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<ImageRecord>, PersistenceError>;
}

#[derive(Debug)]
struct LmdbInner {
    env: Env,
    records: Database<Str, Bytes>,
}

/// LMDB-backed record store keyed `<owner>/<created_at_ms>/<id>`, with the
/// owner base64url-encoded so any owner id works as a prefix.
#[derive(Debug, Clone)]
pub struct LmdbRecordStore {
    inner: Arc<LmdbInner>,
}

impl LmdbRecordStore {
    pub fn open(paths: &AppPaths) -> Result<Self, PersistenceError> {
        let path = paths.records_lmdb_dir()?;

        let mut options = EnvOpenOptions::new();
        options.max_dbs(4);
        options.map_size(RECORDS_ENV_MAP_SIZE_BYTES);
        let env = unsafe {
            // SAFETY: the environment is opened once per store and never reopened
            // in the same process while this handle is alive.
            options.open(&path)?
        };
        let records = {
            let rtxn = env.read_txn()?;
            let opened = env.open_database::<Str, Bytes>(&rtxn, Some("records"))?;
            drop(rtxn);
            match opened {
                Some(existing) => existing,
                None => {
                    let mut wtxn = env.write_txn()?;
                    let db = env.create_database::<Str, Bytes>(&mut wtxn, Some("records"))?;
                    wtxn.commit()?;
                    db
                }
            }
        };
        Ok(Self {
            inner: Arc::new(LmdbInner { env, records }),
        })
    }
}

/// The encoding alphabet has no `/`, so one owner's prefix never matches another's.
fn owner_prefix(owner_id: &str) -> String {
    format!("{}/", URL_SAFE_NO_PAD.encode(owner_id))
}

/// Zero-padded timestamps keep lexical key order equal to creation order.
fn record_key(record: &ImageRecord) -> String {
    format!(
        "{}{:020}/{}",
        owner_prefix(&record.owner_id),
        record.created_at_ms.max(0),
        record.id
    )
}

impl LmdbInner {
    fn insert(
        &self,
        record: &ImageRecord,
        deadline: Instant,
        budget: Duration,
    ) -> Result<(), PersistenceError> {
        let key = record_key(record);
        let encoded = encode_to_vec(record, config::standard())?;
        let mut wtxn = self.env.write_txn()?;
        if self.records.get(&wtxn, &key)?.is_some() {
            return Err(PersistenceError::Duplicate(record.id.clone()));
        }
        self.records.put(&mut wtxn, &key, encoded.as_slice())?;
        // Dropping the txn aborts it; nothing lands after the caller gave up.
        if Instant::now() >= deadline {
            return Err(PersistenceError::Timeout(budget));
        }
        wtxn.commit()?;
        Ok(())
    }

    fn list_by_owner(
        &self,
        owner_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<ImageRecord>, PersistenceError> {
        let prefix = owner_prefix(owner_id);
        let rtxn = self.env.read_txn()?;
        let mut out = Vec::new();
        for entry in self.records.rev_prefix_iter(&rtxn, &prefix)? {
            if limit.is_some_and(|limit| out.len() >= limit) {
                break;
            }
            let (_, raw) = entry?;
            let (record, _) = decode_from_slice::<ImageRecord, _>(raw, config::standard())?;
            out.push(record);
        }
        Ok(out)
    }
}

#[async_trait]
impl RecordStore for LmdbRecordStore {
    async fn insert(
        &self,
        record: &ImageRecord,
        deadline: Instant,
    ) -> Result<(), PersistenceError> {
        let budget = deadline.saturating_duration_since(Instant::now());
        let inner = Arc::clone(&self.inner);
        let record = record.clone();
        tokio::task::spawn_blocking(move || inner.insert(&record, deadline, budget))
            .await
            .map_err(|err| PersistenceError::Join(err.to_string()))?
    }

    async fn list_by_owner(
        &self,
        owner_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<ImageRecord>, PersistenceError> {
        let inner = Arc::clone(&self.inner);
        let owner_id = owner_id.to_string();
        tokio::task::spawn_blocking(move || inner.list_by_owner(&owner_id, limit))
            .await
            .map_err(|err| PersistenceError::Join(err.to_string()))?
    }
}

/// Fields of a record the caller knows before persistence.
#[derive(Debug, Clone)]
pub struct NewRecord {
    pub name: String,
    pub artifact: StoredArtifact,
    pub auto_tags: TagSet,
    pub manual_tags: Vec<String>,
    pub owner_id: String,
}

/// Assigns identity and creation time, then writes the record once.
#[derive(Clone)]
pub struct MetadataWriter {
    store: Arc<dyn RecordStore>,
    timeout: Duration,
}

impl MetadataWriter {
    pub fn new(store: Arc<dyn RecordStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub async fn persist(&self, new: NewRecord) -> Result<ImageRecord, PersistenceError> {
        let record = ImageRecord {
            id: Uuid::new_v4().to_string(),
            name: new.name,
            artifact: new.artifact,
            auto_tags: new.auto_tags,
            manual_tags: new.manual_tags,
            owner_id: new.owner_id,
            created_at_ms: Utc::now().timestamp_millis(),
        };

        // The store enforces the deadline itself; the outer bound only covers
        // stores that never answer.
        let deadline = Instant::now() + self.timeout;
        tokio::time::timeout(self.timeout + COMMIT_GRACE, self.store.insert(&record, deadline))
            .await
            .map_err(|_| PersistenceError::Timeout(self.timeout))??;

        debug!(id = %record.id, owner = %record.owner_id, tags = record.auto_tags.len(), "record persisted");
        Ok(record)
    }
}
