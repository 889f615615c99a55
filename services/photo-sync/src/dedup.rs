use crate::model::FileRecord;
use crate::storage_client::RecordStore;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum DedupError {
    #[error("hashing worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

/// Outcome of a duplicate check
#[derive(Debug, Clone, PartialEq)]
pub struct DedupCheck {
    /// SHA-256 of the checked bytes, lowercase hex
    pub content_hash: String,
    /// Row already holding the same content in the business scope
    pub existing: Option<FileRecord>,
}

/// Content fingerprinting and lookup of already-stored content.
pub struct HashDeduplicator {
    records: Arc<dyn RecordStore>,
    lookup_timeout: Duration,
}

impl HashDeduplicator {
    pub fn new(records: Arc<dyn RecordStore>, lookup_timeout: Duration) -> Self {
        Self {
            records,
            lookup_timeout,
        }
    }

    /// Look up `content_hash` in the business scope.
    ///
    /// A failed lookup counts as "no match": the uniqueness constraint on the
    /// metadata table still catches the duplicate at insert time.
    async fn lookup(&self, business_id: Uuid, content_hash: &str) -> Option<FileRecord> {
        let lookup = self.records.find_by_hash(business_id, content_hash);
        match tokio::time::timeout(self.lookup_timeout, lookup).await {
            Ok(Ok(existing)) => existing,
            Ok(Err(e)) => {
                warn!(business_id = %business_id, error = %e, "Duplicate lookup failed, continuing");
                None
            }
            Err(_) => {
                warn!(business_id = %business_id, "Duplicate lookup timed out, continuing");
                None
            }
        }
    }

    /// Hash `bytes` on the blocking pool and look the hash up in the
    /// business scope.
    pub async fn check_duplicate(&self, bytes: Bytes, business_id: Uuid) -> Result<DedupCheck, DedupError> {
        let hash = tokio::task::spawn_blocking(move || content_hash(&bytes)).await?;
        let existing = self.lookup(business_id, &hash).await;

        if let Some(ref record) = existing {
            debug!(
                business_id = %business_id,
                record_id = %record.id,
                content_hash = %hash,
                "Content already stored"
            );
        }

        Ok(DedupCheck {
            content_hash: hash,
            existing,
        })
    }
}

/// SHA-256 of `bytes` as lowercase hex.
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}
