//! Boundary to blob storage and the metadata table.
//!
//! A file is stored in two phases: bytes first, then the metadata row. When
//! the row cannot be written the blob is deleted again so no object is left
//! without a row; if that delete fails too the result is a distinct
//! [`StorageError::Compensation`] so the orphan can be cleaned up by hand.

use crate::model::{FileRecord, NewFileRecord, Placement, SourceFile, UploadTarget};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Errors from a blob store backend
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BlobError {
    #[error("blob transfer failed: {0}")]
    Transfer(String),

    #[error("blob store rejected request: {0}")]
    Rejected(String),
}

/// Errors from a metadata store backend
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RecordError {
    /// A row with the same content hash already exists in the business scope
    #[error("content already stored as record {}", .0.id)]
    Conflict(Box<FileRecord>),

    #[error("metadata store error: {0}")]
    Backend(String),
}

/// Errors surfaced by [`StorageClient::store`]
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("transfer failed: {0}")]
    Transfer(String),

    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("cancelled")]
    Cancelled,

    /// Blob written, row not written, and the blob could not be removed
    #[error("orphaned object at {path}: insert failed ({insert_error}), cleanup failed ({cleanup_error})")]
    Compensation {
        path: String,
        insert_error: String,
        cleanup_error: String,
    },
}

impl StorageError {
    /// Transport-shaped failures may be retried. A compensation failure is
    /// left for manual reconciliation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::Transfer(_) | StorageError::Timeout { .. })
    }
}

/// Byte-level progress callback: `(bytes_sent, bytes_total)`.
#[derive(Clone)]
pub struct ProgressReporter {
    callback: Arc<dyn Fn(u64, u64) + Send + Sync>,
}

impl ProgressReporter {
    pub fn new(callback: impl Fn(u64, u64) + Send + Sync + 'static) -> Self {
        Self {
            callback: Arc::new(callback),
        }
    }

    pub fn noop() -> Self {
        Self::new(|_, _| {})
    }

    pub fn report(&self, sent: u64, total: u64) {
        (self.callback)(sent, total)
    }
}

impl fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressReporter").finish_non_exhaustive()
    }
}

/// Object storage that accepts bytes at a path
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(
        &self,
        path: &str,
        bytes: Bytes,
        content_type: &str,
        progress: &ProgressReporter,
    ) -> Result<(), BlobError>;

    async fn delete(&self, path: &str) -> Result<(), BlobError>;

    /// Retrieval URL for a stored object
    fn public_url(&self, path: &str) -> String;
}

/// The metadata table, one row per accepted file
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn find_by_hash(
        &self,
        business_id: Uuid,
        content_hash: &str,
    ) -> Result<Option<FileRecord>, RecordError>;

    /// Insert a row. Must fail with [`RecordError::Conflict`] when the
    /// business already has a row with the same content hash.
    async fn insert(&self, record: NewFileRecord) -> Result<FileRecord, RecordError>;

    async fn list(&self, business_id: Uuid) -> Result<Vec<FileRecord>, RecordError>;

    async fn delete(&self, id: Uuid) -> Result<(), RecordError>;

    /// Cheap connectivity check for readiness
    async fn ping(&self) -> Result<(), RecordError>;
}

/// Result of a successful store call
#[derive(Debug, Clone, PartialEq)]
pub enum StoreOutcome {
    Stored(FileRecord),
    /// Another upload got there first; the existing row is returned
    Duplicate(FileRecord),
}

pub struct StorageClient {
    blobs: Arc<dyn BlobStore>,
    records: Arc<dyn RecordStore>,
    operation_timeout: Duration,
}

impl StorageClient {
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        records: Arc<dyn RecordStore>,
        operation_timeout: Duration,
    ) -> Self {
        Self {
            blobs,
            records,
            operation_timeout,
        }
    }

    pub fn records(&self) -> &Arc<dyn RecordStore> {
        &self.records
    }

    pub fn public_url(&self, path: &str) -> String {
        self.blobs.public_url(path)
    }

    /// Upload `file` and insert its metadata row.
    #[instrument(skip_all, fields(business_id = %target.business_id, filename = %file.filename))]
    pub async fn store(
        &self,
        file: &SourceFile,
        original_filename: &str,
        target: &UploadTarget,
        content_hash: &str,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<StoreOutcome, StorageError> {
        if cancel.is_cancelled() {
            return Err(StorageError::Cancelled);
        }

        let stored_name = stored_filename(Utc::now(), &file.filename);
        let path = build_storage_path(target, &stored_name);

        debug!(storage_path = %path, size_bytes = file.size(), "Uploading blob");

        let put = self.with_timeout("blob upload", async {
            self.blobs
                .put(&path, file.bytes.clone(), &file.mime_type, progress)
                .await
                .map_err(|e| StorageError::Transfer(e.to_string()))
        });

        let put_result = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            r = put => Some(r),
        };

        match put_result {
            None => {
                // The request was dropped mid-flight; remove anything it may have committed
                self.discard_blob(&path).await;
                return Err(StorageError::Cancelled);
            }
            Some(Err(e)) => return Err(e),
            Some(Ok(())) => {}
        }

        if cancel.is_cancelled() {
            self.discard_blob(&path).await;
            return Err(StorageError::Cancelled);
        }

        let row = NewFileRecord {
            business_id: target.business_id,
            filename: stored_name,
            original_filename: original_filename.to_string(),
            content_hash: content_hash.to_string(),
            storage_path: path.clone(),
            size_bytes: file.size() as i64,
            mime_type: file.mime_type.clone(),
            facility: target.facility_association(),
        };

        let inserted = tokio::time::timeout(self.operation_timeout, self.records.insert(row)).await;

        let record = match inserted {
            Ok(Ok(record)) => record,
            Ok(Err(RecordError::Conflict(existing))) => {
                info!(
                    record_id = %existing.id,
                    storage_path = %path,
                    "Content already stored, removing redundant blob"
                );
                self.remove_uploaded_blob(&path, "duplicate content").await?;
                return Ok(StoreOutcome::Duplicate(*existing));
            }
            Ok(Err(e)) => {
                let insert_error = StorageError::Transfer(e.to_string());
                self.remove_uploaded_blob(&path, &insert_error.to_string()).await?;
                warn!(storage_path = %path, error = %insert_error, "Metadata insert failed, blob removed");
                return Err(insert_error);
            }
            Err(_) => match self.resolve_insert_timeout(target, content_hash, &path).await? {
                Some(StoreOutcome::Stored(record)) => record,
                Some(duplicate) => return Ok(duplicate),
                None => {
                    return Err(StorageError::Timeout {
                        operation: "metadata insert",
                        timeout: self.operation_timeout,
                    })
                }
            },
        };

        if cancel.is_cancelled() {
            // Cancelled while the row was being written; undo both phases
            if let Err(e) = self.records.delete(record.id).await {
                // The row is committed and still references the blob
                warn!(
                    record_id = %record.id,
                    error = %e,
                    "Failed to roll back cancelled upload row, keeping the upload"
                );
                return Ok(StoreOutcome::Stored(record));
            }
            self.discard_blob(&path).await;
            return Err(StorageError::Cancelled);
        }

        info!(record_id = %record.id, storage_path = %path, "File stored");
        Ok(StoreOutcome::Stored(record))
    }

    /// A timed-out insert may still have committed. Reads the row back by
    /// content hash before deciding whether the blob at `path` is orphaned.
    ///
    /// Returns `Ok(None)` once the blob has been removed because no row exists.
    async fn resolve_insert_timeout(
        &self,
        target: &UploadTarget,
        content_hash: &str,
        path: &str,
    ) -> Result<Option<StoreOutcome>, StorageError> {
        let lookup = tokio::time::timeout(
            self.operation_timeout,
            self.records.find_by_hash(target.business_id, content_hash),
        )
        .await;

        match lookup {
            Ok(Ok(Some(record))) if record.storage_path == path => {
                info!(record_id = %record.id, storage_path = %path, "Metadata insert committed despite timeout");
                Ok(Some(StoreOutcome::Stored(record)))
            }
            Ok(Ok(Some(existing))) => {
                self.remove_uploaded_blob(path, "duplicate content").await?;
                info!(record_id = %existing.id, storage_path = %path, "Content already stored, removing redundant blob");
                Ok(Some(StoreOutcome::Duplicate(existing)))
            }
            Ok(Ok(None)) => {
                self.remove_uploaded_blob(path, "metadata insert timed out").await?;
                warn!(storage_path = %path, "Metadata insert timed out, blob removed");
                Ok(None)
            }
            Ok(Err(_)) | Err(_) => {
                // Outcome unknown: a row may reference the blob, so it stays
                warn!(
                    storage_path = %path,
                    "Metadata insert timed out and could not be verified, blob kept"
                );
                Ok(None)
            }
        }
    }

    /// Compensating delete of a blob whose row was not written.
    async fn remove_uploaded_blob(&self, path: &str, reason: &str) -> Result<(), StorageError> {
        let deleted = self
            .with_timeout("compensating delete", async {
                self.blobs
                    .delete(path)
                    .await
                    .map_err(|e| StorageError::Transfer(e.to_string()))
            })
            .await;

        match deleted {
            Ok(()) => Ok(()),
            Err(cleanup) => {
                error!(
                    storage_path = %path,
                    insert_error = %reason,
                    cleanup_error = %cleanup,
                    "Orphaned object left in blob storage, manual cleanup required"
                );
                metrics::counter!("photo_sync.compensation.failures").increment(1);
                Err(StorageError::Compensation {
                    path: path.to_string(),
                    insert_error: reason.to_string(),
                    cleanup_error: cleanup.to_string(),
                })
            }
        }
    }

    async fn discard_blob(&self, path: &str) {
        if let Err(e) = self.blobs.delete(path).await {
            debug!(storage_path = %path, error = %e, "Blob cleanup after cancellation failed");
        }
    }

    async fn with_timeout<T, F>(&self, operation: &'static str, fut: F) -> Result<T, StorageError>
    where
        F: Future<Output = Result<T, StorageError>>,
    {
        match tokio::time::timeout(self.operation_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(StorageError::Timeout {
                operation,
                timeout: self.operation_timeout,
            }),
        }
    }
}

/// `{timestamp_ms}_{sanitized filename}`
pub fn stored_filename(now: DateTime<Utc>, filename: &str) -> String {
    format!("{}_{}", now.timestamp_millis(), sanitize_path_component(filename))
}

/// Deterministic object path for a stored file.
///
/// - facility: `{business}/{phase}/{kind}/outlet_{n}/{kind}_{m}/{stored_name}`
/// - category: `{business}/{phase}/basic/{category}/{stored_name}`
pub fn build_storage_path(target: &UploadTarget, stored_name: &str) -> String {
    let phase = target.phase.storage_segment();
    match &target.placement {
        Placement::Facility {
            kind,
            outlet_number,
            facility_number,
        } => {
            let kind = sanitize_path_component(kind);
            format!(
                "{business}/{phase}/{kind}/outlet_{outlet}/{kind}_{number}/{name}",
                business = target.business_id,
                outlet = outlet_number,
                number = facility_number,
                name = stored_name,
            )
        }
        Placement::Category(category) => format!(
            "{business}/{phase}/basic/{category}/{name}",
            business = target.business_id,
            category = sanitize_path_component(category),
            name = stored_name,
        ),
    }
}

/// Sanitize a path component to prevent path traversal
pub fn sanitize_path_component(component: &str) -> String {
    let sanitized: String = component
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => c,
            _ => '_',
        })
        .collect();

    // A component made only of dots would walk up the tree
    if sanitized.chars().all(|c| c == '.') {
        sanitized.replace('.', "_")
    } else {
        sanitized
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryBlobStore, InMemoryRecordStore};
    use crate::model::{FacilityAssociation, Phase};
    use chrono::TimeZone;

    /// Record store whose inserts outlive the operation timeout, optionally
    /// committing first.
    struct StallingInserts {
        inner: InMemoryRecordStore,
        commit: bool,
        stall: Duration,
    }

    #[async_trait]
    impl RecordStore for StallingInserts {
        async fn find_by_hash(
            &self,
            business_id: Uuid,
            content_hash: &str,
        ) -> Result<Option<FileRecord>, RecordError> {
            self.inner.find_by_hash(business_id, content_hash).await
        }

        async fn insert(&self, record: NewFileRecord) -> Result<FileRecord, RecordError> {
            let inserted = if self.commit {
                self.inner.insert(record).await
            } else {
                Err(RecordError::Backend("never committed".to_string()))
            };
            tokio::time::sleep(self.stall).await;
            inserted
        }

        async fn list(&self, business_id: Uuid) -> Result<Vec<FileRecord>, RecordError> {
            self.inner.list(business_id).await
        }

        async fn delete(&self, id: Uuid) -> Result<(), RecordError> {
            self.inner.delete(id).await
        }

        async fn ping(&self) -> Result<(), RecordError> {
            Ok(())
        }
    }

    fn stalling_client(
        blobs: Arc<InMemoryBlobStore>,
        records: Arc<StallingInserts>,
    ) -> StorageClient {
        StorageClient::new(blobs, records, Duration::from_millis(50))
    }

    fn facility_target() -> UploadTarget {
        UploadTarget {
            business_id: Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap(),
            phase: Phase::PreSurvey,
            placement: Placement::Facility {
                kind: "toilet".to_string(),
                outlet_number: 2,
                facility_number: 5,
            },
        }
    }

    fn record_from(row: &NewFileRecord) -> FileRecord {
        FileRecord {
            id: Uuid::new_v4(),
            business_id: row.business_id,
            filename: row.filename.clone(),
            original_filename: row.original_filename.clone(),
            content_hash: row.content_hash.clone(),
            storage_path: row.storage_path.clone(),
            size_bytes: row.size_bytes,
            mime_type: row.mime_type.clone(),
            upload_status: "uploaded".to_string(),
            facility: row.facility.clone(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn client(blobs: MockBlobStore, records: MockRecordStore) -> StorageClient {
        StorageClient::new(Arc::new(blobs), Arc::new(records), Duration::from_secs(5))
    }

    fn photo() -> SourceFile {
        SourceFile::new("stall 1.jpg", "image/jpeg", vec![1u8, 2, 3])
    }

    #[test]
    fn test_facility_storage_path() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 45).unwrap();
        let name = stored_filename(ts, "stall 1.jpg");
        assert_eq!(name, "1705314645000_stall_1.jpg");

        let path = build_storage_path(&facility_target(), &name);
        assert_eq!(
            path,
            "550e8400-e29b-41d4-a716-446655440000/survey/toilet/outlet_2/toilet_5/1705314645000_stall_1.jpg"
        );
    }

    #[test]
    fn test_category_storage_path() {
        let target = UploadTarget {
            placement: Placement::Category("front door".to_string()),
            phase: Phase::Completion,
            ..facility_target()
        };
        let path = build_storage_path(&target, "1_a.jpg");
        assert_eq!(
            path,
            "550e8400-e29b-41d4-a716-446655440000/completion/basic/front_door/1_a.jpg"
        );
    }

    #[test]
    fn test_sanitize_path_component() {
        assert_eq!(sanitize_path_component("photo-001.jpg"), "photo-001.jpg");
        assert_eq!(sanitize_path_component("a/b"), "a_b");
        assert_eq!(sanitize_path_component(".."), "__");
        assert_eq!(sanitize_path_component("hello world"), "hello_world");
    }

    #[tokio::test]
    async fn test_store_uploads_then_inserts() {
        let mut blobs = MockBlobStore::new();
        blobs.expect_put().times(1).returning(|_, _, _, _| Ok(()));
        blobs.expect_delete().never();

        let mut records = MockRecordStore::new();
        records
            .expect_insert()
            .times(1)
            .returning(|row| Ok(record_from(&row)));

        let outcome = client(blobs, records)
            .store(
                &photo(),
                "stall 1.jpg",
                &facility_target(),
                "abc",
                &ProgressReporter::noop(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let StoreOutcome::Stored(record) = outcome else {
            panic!("expected a stored record");
        };
        assert_eq!(record.content_hash, "abc");
        assert_eq!(record.original_filename, "stall 1.jpg");
        assert!(record.storage_path.ends_with("_stall_1.jpg"));
        assert_eq!(
            record.facility,
            FacilityAssociation::Facility {
                kind: "toilet".to_string(),
                outlet_number: 2,
                facility_number: 5,
            }
        );
    }

    #[tokio::test]
    async fn test_failed_insert_deletes_blob() {
        let mut blobs = MockBlobStore::new();
        blobs.expect_put().times(1).returning(|_, _, _, _| Ok(()));
        blobs.expect_delete().times(1).returning(|_| Ok(()));

        let mut records = MockRecordStore::new();
        records
            .expect_insert()
            .times(1)
            .returning(|_| Err(RecordError::Backend("connection reset".to_string())));

        let err = client(blobs, records)
            .store(
                &photo(),
                "stall 1.jpg",
                &facility_target(),
                "abc",
                &ProgressReporter::noop(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, StorageError::Transfer(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_failed_cleanup_is_compensation_failure() {
        let mut blobs = MockBlobStore::new();
        blobs.expect_put().times(1).returning(|_, _, _, _| Ok(()));
        blobs
            .expect_delete()
            .times(1)
            .returning(|_| Err(BlobError::Transfer("bucket unreachable".to_string())));

        let mut records = MockRecordStore::new();
        records
            .expect_insert()
            .times(1)
            .returning(|_| Err(RecordError::Backend("connection reset".to_string())));

        let err = client(blobs, records)
            .store(
                &photo(),
                "stall 1.jpg",
                &facility_target(),
                "abc",
                &ProgressReporter::noop(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        match err {
            StorageError::Compensation { ref path, .. } => {
                assert!(path.starts_with("550e8400-e29b-41d4-a716-446655440000/survey/"));
            }
            other => panic!("expected compensation failure, got {other:?}"),
        }
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_conflict_resolves_as_duplicate() {
        let existing_id = Uuid::new_v4();

        let mut blobs = MockBlobStore::new();
        blobs.expect_put().times(1).returning(|_, _, _, _| Ok(()));
        blobs.expect_delete().times(1).returning(|_| Ok(()));

        let mut records = MockRecordStore::new();
        records.expect_insert().times(1).returning(move |row| {
            let mut existing = record_from(&row);
            existing.id = existing_id;
            Err(RecordError::Conflict(Box::new(existing)))
        });

        let outcome = client(blobs, records)
            .store(
                &photo(),
                "stall 1.jpg",
                &facility_target(),
                "abc",
                &ProgressReporter::noop(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(matches!(outcome, StoreOutcome::Duplicate(r) if r.id == existing_id));
    }

    #[tokio::test]
    async fn test_cancel_before_upload_touches_no_row() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut blobs = MockBlobStore::new();
        blobs.expect_put().never();
        blobs.expect_delete().never();

        let mut records = MockRecordStore::new();
        records.expect_insert().never();

        let err = client(blobs, records)
            .store(
                &photo(),
                "stall 1.jpg",
                &facility_target(),
                "abc",
                &ProgressReporter::noop(),
                &cancel,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, StorageError::Cancelled));
    }

    #[tokio::test]
    async fn test_insert_committed_before_timeout_keeps_blob() {
        let blobs = Arc::new(InMemoryBlobStore::new());
        let records = Arc::new(StallingInserts {
            inner: InMemoryRecordStore::new(),
            commit: true,
            stall: Duration::from_millis(300),
        });

        let outcome = stalling_client(blobs.clone(), records.clone())
            .store(
                &photo(),
                "stall 1.jpg",
                &facility_target(),
                "abc",
                &ProgressReporter::noop(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let StoreOutcome::Stored(record) = outcome else {
            panic!("expected the committed row");
        };
        assert!(blobs.contains(&record.storage_path));
        assert_eq!(blobs.delete_calls(), 0);
        assert_eq!(records.inner.records(), vec![record]);
    }

    #[tokio::test]
    async fn test_insert_timeout_without_row_removes_blob() {
        let blobs = Arc::new(InMemoryBlobStore::new());
        let records = Arc::new(StallingInserts {
            inner: InMemoryRecordStore::new(),
            commit: false,
            stall: Duration::from_millis(300),
        });

        let err = stalling_client(blobs.clone(), records.clone())
            .store(
                &photo(),
                "stall 1.jpg",
                &facility_target(),
                "abc",
                &ProgressReporter::noop(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, StorageError::Timeout { operation: "metadata insert", .. }));
        assert!(err.is_retryable());
        assert_eq!(blobs.object_count(), 0);
        assert!(records.inner.records().is_empty());
    }

    #[tokio::test]
    async fn test_insert_timeout_with_other_row_is_duplicate() {
        let blobs = Arc::new(InMemoryBlobStore::new());
        let inner = InMemoryRecordStore::new();
        let existing = inner
            .insert(NewFileRecord {
                business_id: facility_target().business_id,
                filename: "1_earlier.jpg".to_string(),
                original_filename: "earlier.jpg".to_string(),
                content_hash: "abc".to_string(),
                storage_path: "elsewhere/1_earlier.jpg".to_string(),
                size_bytes: 3,
                mime_type: "image/jpeg".to_string(),
                facility: facility_target().facility_association(),
            })
            .await
            .unwrap();
        let records = Arc::new(StallingInserts {
            inner,
            commit: false,
            stall: Duration::from_millis(300),
        });

        let outcome = stalling_client(blobs.clone(), records)
            .store(
                &photo(),
                "stall 1.jpg",
                &facility_target(),
                "abc",
                &ProgressReporter::noop(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome, StoreOutcome::Duplicate(existing));
        assert_eq!(blobs.object_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_after_insert_rolls_back_both() {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let mut blobs = MockBlobStore::new();
        blobs.expect_put().times(1).returning(|_, _, _, _| Ok(()));
        blobs.expect_delete().times(1).returning(|_| Ok(()));

        let mut records = MockRecordStore::new();
        records.expect_insert().times(1).returning(move |row| {
            token.cancel();
            Ok(record_from(&row))
        });
        records.expect_delete().times(1).returning(|_| Ok(()));

        let err = client(blobs, records)
            .store(
                &photo(),
                "stall 1.jpg",
                &facility_target(),
                "abc",
                &ProgressReporter::noop(),
                &cancel,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, StorageError::Cancelled));
    }

    #[tokio::test]
    async fn test_failed_rollback_keeps_stored_record() {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let mut blobs = MockBlobStore::new();
        blobs.expect_put().times(1).returning(|_, _, _, _| Ok(()));
        blobs.expect_delete().never();

        let mut records = MockRecordStore::new();
        records.expect_insert().times(1).returning(move |row| {
            token.cancel();
            Ok(record_from(&row))
        });
        records
            .expect_delete()
            .times(1)
            .returning(|_| Err(RecordError::Backend("connection reset".to_string())));

        let outcome = client(blobs, records)
            .store(
                &photo(),
                "stall 1.jpg",
                &facility_target(),
                "abc",
                &ProgressReporter::noop(),
                &cancel,
            )
            .await
            .unwrap();

        assert!(matches!(outcome, StoreOutcome::Stored(r) if r.content_hash == "abc"));
    }
}
