//! In-memory blob store, metadata store and change source with fault
//! injection, for tests and local runs without S3/Postgres/Kafka.

use crate::change_feed::{ChangeSource, PayloadStream, SubscriptionError};
use crate::model::{FileRecord, NewFileRecord};
use crate::storage_client::{BlobError, BlobStore, ProgressReporter, RecordError, RecordStore};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

#[derive(Default)]
pub struct InMemoryBlobStore {
    objects: Mutex<HashMap<String, Bytes>>,
    put_delay: Mutex<Duration>,
    failing_puts: AtomicUsize,
    fail_deletes: AtomicBool,
    put_calls: AtomicUsize,
    delete_calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every put take at least `delay`.
    pub fn with_put_delay(self, delay: Duration) -> Self {
        *self.put_delay.lock() = delay;
        self
    }

    /// Fail the next `count` puts with a transfer error.
    pub fn fail_next_puts(&self, count: usize) {
        self.failing_puts.store(count, Ordering::SeqCst);
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    pub fn put_calls(&self) -> usize {
        self.put_calls.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }

    /// Highest number of puts that were running at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().len()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.objects.lock().contains_key(path)
    }
}

struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn put(
        &self,
        path: &str,
        bytes: Bytes,
        _content_type: &str,
        progress: &ProgressReporter,
    ) -> Result<(), BlobError> {
        self.put_calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlightGuard(&self.in_flight);
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let total = bytes.len() as u64;
        let delay = *self.put_delay.lock();
        if !delay.is_zero() {
            for step in 1..=4u64 {
                tokio::time::sleep(delay / 4).await;
                progress.report(total * step / 4, total);
            }
        } else {
            tokio::task::yield_now().await;
            progress.report(total, total);
        }

        let should_fail = self
            .failing_puts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(BlobError::Transfer("injected put failure".to_string()));
        }

        self.objects.lock().insert(path.to_string(), bytes);
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), BlobError> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(BlobError::Transfer("injected delete failure".to_string()));
        }
        self.objects.lock().remove(path);
        Ok(())
    }

    fn public_url(&self, path: &str) -> String {
        format!("memory://{path}")
    }
}

#[derive(Default)]
pub struct InMemoryRecordStore {
    rows: Mutex<Vec<FileRecord>>,
    failing_inserts: AtomicUsize,
    fail_lookups: AtomicBool,
    fail_lists: AtomicBool,
    insert_calls: AtomicUsize,
    list_calls: AtomicUsize,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_inserts(&self, count: usize) {
        self.failing_inserts.store(count, Ordering::SeqCst);
    }

    pub fn fail_lookups(&self, fail: bool) {
        self.fail_lookups.store(fail, Ordering::SeqCst);
    }

    pub fn fail_lists(&self, fail: bool) {
        self.fail_lists.store(fail, Ordering::SeqCst);
    }

    pub fn insert_calls(&self) -> usize {
        self.insert_calls.load(Ordering::SeqCst)
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn records(&self) -> Vec<FileRecord> {
        self.rows.lock().clone()
    }

    /// Seed a row directly, bypassing the uniqueness check.
    pub fn seed(&self, record: FileRecord) {
        self.rows.lock().push(record);
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn find_by_hash(
        &self,
        business_id: Uuid,
        content_hash: &str,
    ) -> Result<Option<FileRecord>, RecordError> {
        if self.fail_lookups.load(Ordering::SeqCst) {
            return Err(RecordError::Backend("injected lookup failure".to_string()));
        }
        Ok(self
            .rows
            .lock()
            .iter()
            .find(|r| r.business_id == business_id && r.content_hash == content_hash)
            .cloned())
    }

    async fn insert(&self, record: NewFileRecord) -> Result<FileRecord, RecordError> {
        self.insert_calls.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;

        let should_fail = self
            .failing_inserts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(RecordError::Backend("injected insert failure".to_string()));
        }

        let mut rows = self.rows.lock();
        if let Some(existing) = rows
            .iter()
            .find(|r| r.business_id == record.business_id && r.content_hash == record.content_hash)
        {
            return Err(RecordError::Conflict(Box::new(existing.clone())));
        }

        let now = Utc::now();
        let stored = FileRecord {
            id: Uuid::new_v4(),
            business_id: record.business_id,
            filename: record.filename,
            original_filename: record.original_filename,
            content_hash: record.content_hash,
            storage_path: record.storage_path,
            size_bytes: record.size_bytes,
            mime_type: record.mime_type,
            upload_status: "uploaded".to_string(),
            facility: record.facility,
            created_at: now,
            updated_at: now,
        };
        rows.push(stored.clone());
        Ok(stored)
    }

    async fn list(&self, business_id: Uuid) -> Result<Vec<FileRecord>, RecordError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_lists.load(Ordering::SeqCst) {
            return Err(RecordError::Backend("injected list failure".to_string()));
        }
        Ok(self
            .rows
            .lock()
            .iter()
            .filter(|r| r.business_id == business_id)
            .cloned()
            .collect())
    }

    async fn delete(&self, id: Uuid) -> Result<(), RecordError> {
        self.rows.lock().retain(|r| r.id != id);
        Ok(())
    }

    async fn ping(&self) -> Result<(), RecordError> {
        Ok(())
    }
}

/// Change source fed by hand. Every open subscribes to the same broadcast;
/// payloads pushed while nobody is connected are lost, like on a real topic.
pub struct InMemoryChangeSource {
    tx: Mutex<Option<broadcast::Sender<Result<Vec<u8>, String>>>>,
    fail_opens: AtomicBool,
    open_calls: AtomicUsize,
}

impl Default for InMemoryChangeSource {
    fn default() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self {
            tx: Mutex::new(Some(tx)),
            fail_opens: AtomicBool::new(false),
            open_calls: AtomicUsize::new(0),
        }
    }
}

impl InMemoryChangeSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver a raw payload to every open stream.
    pub fn push_payload(&self, payload: impl Into<Vec<u8>>) {
        if let Some(tx) = self.tx.lock().as_ref() {
            let _ = tx.send(Ok(payload.into()));
        }
    }

    /// Deliver a transport error to every open stream.
    pub fn push_error(&self, message: impl Into<String>) {
        if let Some(tx) = self.tx.lock().as_ref() {
            let _ = tx.send(Err(message.into()));
        }
    }

    /// End every open stream; later opens fail.
    pub fn close(&self) {
        self.tx.lock().take();
    }

    pub fn fail_opens(&self, fail: bool) {
        self.fail_opens.store(fail, Ordering::SeqCst);
    }

    pub fn open_calls(&self) -> usize {
        self.open_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChangeSource for InMemoryChangeSource {
    async fn open(&self, _business_id: Uuid) -> Result<PayloadStream, SubscriptionError> {
        self.open_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_opens.load(Ordering::SeqCst) {
            return Err(SubscriptionError::Transport("injected open failure".to_string()));
        }
        let rx = self
            .tx
            .lock()
            .as_ref()
            .map(|tx| tx.subscribe())
            .ok_or_else(|| SubscriptionError::Transport("source closed".to_string()))?;

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(Ok(payload)) => return Some((Ok(payload), rx)),
                    Ok(Err(message)) => return Some((Err(SubscriptionError::Transport(message)), rx)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(stream.boxed())
    }
}
