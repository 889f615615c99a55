//! Admission-controlled upload queue.
//!
//! Every file becomes an [`UploadTask`] that runs Compression → Dedup →
//! Storage on its own tokio task. At most `concurrency_limit()` tasks are in
//! an active state at once; the rest wait in FIFO order. Each task ends in
//! exactly one terminal status per attempt, and a failure never touches its
//! siblings.

use crate::compression::CompressionStage;
use crate::config::UploadConfig;
use crate::dedup::HashDeduplicator;
use crate::model::{FileRecord, SourceFile, TargetDescriptor, UploadTarget, ValidationError};
use crate::network::NetworkConditions;
use crate::storage_client::{ProgressReporter, StorageClient, StorageError, StoreOutcome};
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

pub type TaskId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    Queued,
    Compressing,
    Hashing,
    Uploading,
    Uploaded,
    Duplicate,
    Failed,
    Cancelled,
}

impl UploadStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            UploadStatus::Uploaded
                | UploadStatus::Duplicate
                | UploadStatus::Failed
                | UploadStatus::Cancelled
        )
    }

    /// Holding a concurrency slot
    pub fn is_active(self) -> bool {
        matches!(
            self,
            UploadStatus::Compressing | UploadStatus::Hashing | UploadStatus::Uploading
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Transfer,
    Timeout,
    /// Stored object could not be cleaned up after a failed insert
    Compensation,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl From<&StorageError> for TaskFailure {
    fn from(e: &StorageError) -> Self {
        let kind = match e {
            StorageError::Timeout { .. } => FailureKind::Timeout,
            StorageError::Compensation { .. } => FailureKind::Compensation,
            StorageError::Transfer(_) | StorageError::Cancelled => FailureKind::Transfer,
        };
        Self {
            kind,
            message: e.to_string(),
        }
    }
}

/// One file's journey through compression, deduplication and transfer.
#[derive(Debug, Clone, Serialize)]
pub struct UploadTask {
    pub id: TaskId,
    pub filename: String,
    pub size_bytes: usize,
    pub mime_type: String,
    pub target: UploadTarget,
    pub status: UploadStatus,
    /// 0-100, never decreases within an attempt
    pub progress: u8,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub last_error: Option<TaskFailure>,
    /// Record created (or matched, for duplicates) by this task
    pub record_id: Option<Uuid>,
}

/// Queue counters, published after every change
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueueStats {
    pub queued: usize,
    pub active: usize,
    pub uploaded: usize,
    pub duplicates: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub average_duration_ms: Option<u64>,
}

impl QueueStats {
    pub fn is_idle(&self) -> bool {
        self.queued == 0 && self.active == 0
    }
}

/// Notice sent when a task produced or matched a record
#[derive(Debug, Clone)]
pub struct TaskCompletion {
    pub task_id: TaskId,
    pub status: UploadStatus,
    pub record: FileRecord,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TaskActionError {
    #[error("task {0} not found")]
    NotFound(TaskId),

    #[error("task {id} is {status:?}")]
    InvalidState { id: TaskId, status: UploadStatus },
}

enum StageOutcome {
    Uploaded(FileRecord),
    Duplicate(FileRecord),
}

enum StageFailure {
    Cancelled,
    Storage(StorageError),
    Internal(String),
}

struct TaskEntry {
    task: UploadTask,
    source: SourceFile,
    cancel: Option<CancellationToken>,
    attempt: u64,
}

#[derive(Default)]
struct QueueState {
    tasks: HashMap<TaskId, TaskEntry>,
    order: Vec<TaskId>,
    pending: VecDeque<TaskId>,
    active: usize,
    completed_count: u64,
    completed_total_ms: u128,
}

struct SchedulerInner {
    config: UploadConfig,
    compression: Arc<CompressionStage>,
    dedup: HashDeduplicator,
    storage: StorageClient,
    network: watch::Receiver<NetworkConditions>,
    state: Mutex<QueueState>,
    stats_tx: watch::Sender<QueueStats>,
    completions_tx: broadcast::Sender<TaskCompletion>,
    shutdown: CancellationToken,
}

#[derive(Clone)]
pub struct UploadQueueScheduler {
    inner: Arc<SchedulerInner>,
}

impl UploadQueueScheduler {
    pub fn new(
        config: UploadConfig,
        compression: CompressionStage,
        storage: StorageClient,
        network: watch::Receiver<NetworkConditions>,
        shutdown: CancellationToken,
    ) -> Self {
        let dedup = HashDeduplicator::new(storage.records().clone(), config.operation_timeout());
        let (stats_tx, _) = watch::channel(QueueStats::default());
        let (completions_tx, _) = broadcast::channel(config.completion_buffer.max(1));

        Self {
            inner: Arc::new(SchedulerInner {
                config,
                compression: Arc::new(compression),
                dedup,
                storage,
                network,
                state: Mutex::new(QueueState::default()),
                stats_tx,
                completions_tx,
                shutdown,
            }),
        }
    }

    /// Current admission bound: fixed if configured, otherwise adaptive to
    /// network conditions.
    pub fn concurrency_limit(&self) -> usize {
        self.inner
            .config
            .max_concurrency
            .unwrap_or_else(|| self.inner.network.borrow().adaptive_concurrency())
            .max(1)
    }

    pub fn stats(&self) -> watch::Receiver<QueueStats> {
        self.inner.stats_tx.subscribe()
    }

    pub fn completions(&self) -> broadcast::Receiver<TaskCompletion> {
        self.inner.completions_tx.subscribe()
    }

    pub fn public_url(&self, path: &str) -> String {
        self.inner.storage.public_url(path)
    }

    /// All known tasks, in enqueue order.
    pub fn tasks(&self) -> Vec<UploadTask> {
        let state = self.inner.state.lock();
        state
            .order
            .iter()
            .filter_map(|id| state.tasks.get(id))
            .map(|e| e.task.clone())
            .collect()
    }

    pub fn task(&self, id: TaskId) -> Option<UploadTask> {
        self.inner.state.lock().tasks.get(&id).map(|e| e.task.clone())
    }

    /// Queue a batch of files for one target. Must be called from within a
    /// tokio runtime.
    #[instrument(skip(self, files, descriptor), fields(file_count = files.len()))]
    pub fn enqueue(
        &self,
        files: Vec<SourceFile>,
        descriptor: &TargetDescriptor,
    ) -> Result<Vec<TaskId>, ValidationError> {
        let target = descriptor.validate()?;
        if files.is_empty() {
            return Err(ValidationError::EmptyBatch);
        }
        if let Some(empty) = files.iter().find(|f| f.bytes.is_empty()) {
            return Err(ValidationError::EmptyFile(empty.filename.clone()));
        }

        let now = Utc::now();
        let mut ids = Vec::with_capacity(files.len());
        {
            let mut state = self.inner.state.lock();
            for source in files {
                let id = Uuid::new_v4();
                let task = UploadTask {
                    id,
                    filename: source.filename.clone(),
                    size_bytes: source.size(),
                    mime_type: source.mime_type.clone(),
                    target: target.clone(),
                    status: UploadStatus::Queued,
                    progress: 0,
                    retry_count: 0,
                    created_at: now,
                    started_at: None,
                    ended_at: None,
                    last_error: None,
                    record_id: None,
                };
                state.tasks.insert(
                    id,
                    TaskEntry {
                        task,
                        source,
                        cancel: None,
                        attempt: 0,
                    },
                );
                state.order.push(id);
                state.pending.push_back(id);
                ids.push(id);
            }
        }

        info!(
            business_id = %target.business_id,
            task_count = ids.len(),
            "Enqueued upload batch"
        );
        metrics::counter!("photo_sync.tasks.enqueued").increment(ids.len() as u64);

        self.pump();
        Ok(ids)
    }

    /// Cancel a task. Queued tasks are dropped without any network activity;
    /// running tasks are aborted at their next suspension point.
    pub fn cancel(&self, id: TaskId) -> Result<(), TaskActionError> {
        {
            let mut state = self.inner.state.lock();
            let entry = state
                .tasks
                .get_mut(&id)
                .ok_or(TaskActionError::NotFound(id))?;
            Self::cancel_entry(entry)?;
        }
        self.publish_stats();
        Ok(())
    }

    /// Cancel every task that has not finished yet. Returns how many were hit.
    pub fn cancel_all(&self) -> usize {
        let cancelled = {
            let mut state = self.inner.state.lock();
            state
                .tasks
                .values_mut()
                .filter(|e| !e.task.status.is_terminal())
                .filter_map(|e| Self::cancel_entry(e).ok())
                .count()
        };
        info!(cancelled, "Cancelled all pending uploads");
        self.publish_stats();
        cancelled
    }

    fn cancel_entry(entry: &mut TaskEntry) -> Result<(), TaskActionError> {
        match entry.task.status {
            UploadStatus::Queued => {
                // Also covers tasks waiting out a retry delay
                entry.task.status = UploadStatus::Cancelled;
                entry.task.ended_at = Some(Utc::now());
                metrics::counter!("photo_sync.tasks.cancelled").increment(1);
                debug!(task_id = %entry.task.id, "Queued task cancelled");
                Ok(())
            }
            status if status.is_active() => {
                if let Some(token) = &entry.cancel {
                    token.cancel();
                }
                debug!(task_id = %entry.task.id, "Cancellation requested for running task");
                Ok(())
            }
            status => Err(TaskActionError::InvalidState {
                id: entry.task.id,
                status,
            }),
        }
    }

    /// Run a failed or cancelled task again.
    pub fn retry(&self, id: TaskId) -> Result<(), TaskActionError> {
        {
            let mut state = self.inner.state.lock();
            let entry = state
                .tasks
                .get_mut(&id)
                .ok_or(TaskActionError::NotFound(id))?;
            match entry.task.status {
                UploadStatus::Failed | UploadStatus::Cancelled => {
                    entry.task.status = UploadStatus::Queued;
                    entry.task.retry_count += 1;
                    entry.task.progress = 0;
                    entry.task.started_at = None;
                    entry.task.ended_at = None;
                }
                status => return Err(TaskActionError::InvalidState { id, status }),
            }
            state.pending.push_back(id);
        }

        info!(task_id = %id, "Manual retry requested");
        metrics::counter!("photo_sync.tasks.retried").increment(1);
        self.pump();
        Ok(())
    }

    /// Forget finished tasks. Failed tasks stay so they can still be retried.
    pub fn clear_completed(&self) -> usize {
        let removed = {
            let mut state = self.inner.state.lock();
            let before = state.tasks.len();
            state.tasks.retain(|_, e| {
                !matches!(
                    e.task.status,
                    UploadStatus::Uploaded | UploadStatus::Duplicate | UploadStatus::Cancelled
                )
            });
            let QueueState { tasks, order, .. } = &mut *state;
            order.retain(|id| tasks.contains_key(id));
            before - tasks.len()
        };
        self.publish_stats();
        removed
    }

    /// Resolve once nothing is queued or running.
    pub async fn idle(&self) {
        let mut stats = self.stats();
        // The sender lives as long as `self`
        let _ = stats.wait_for(QueueStats::is_idle).await;
    }

    /// Re-evaluate admission whenever network conditions change.
    pub async fn run_network_watcher(self) {
        let mut network = self.inner.network.clone();
        loop {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                changed = network.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    debug!(limit = self.concurrency_limit(), "Concurrency limit re-evaluated");
                    self.pump();
                }
            }
        }
    }

    /// Start queued tasks until the concurrency bound is reached.
    fn pump(&self) {
        let limit = self.concurrency_limit();
        let mut started = Vec::new();
        {
            let mut state = self.inner.state.lock();
            while state.active < limit {
                let Some(id) = state.pending.pop_front() else {
                    break;
                };
                let Some(entry) = state.tasks.get_mut(&id) else {
                    continue;
                };
                // Cancelled while waiting, or already picked up through another path
                if entry.task.status != UploadStatus::Queued {
                    continue;
                }

                let token = self.inner.shutdown.child_token();
                entry.task.status = UploadStatus::Compressing;
                entry.task.started_at = Some(Utc::now());
                entry.cancel = Some(token.clone());
                entry.attempt += 1;

                started.push(TaskRun {
                    id,
                    attempt: entry.attempt,
                    source: entry.source.clone(),
                    original_filename: entry.task.filename.clone(),
                    target: entry.task.target.clone(),
                    cancel: token,
                });
                state.active += 1;
            }
        }

        self.publish_stats();

        for run in started {
            let scheduler = self.clone();
            tokio::spawn(async move { scheduler.run_task(run).await });
        }
    }

    #[instrument(skip_all, fields(task_id = %run.id, attempt = run.attempt))]
    async fn run_task(self, run: TaskRun) {
        let started = Instant::now();
        let result = self.run_pipeline(&run).await;
        self.finish(&run, result, started.elapsed());
    }

    async fn run_pipeline(&self, run: &TaskRun) -> Result<StageOutcome, StageFailure> {
        let TaskRun {
            id,
            attempt,
            cancel,
            target,
            ..
        } = run;
        let (id, attempt) = (*id, *attempt);

        // Compression
        self.set_stage(id, attempt, UploadStatus::Compressing, 5);
        let compression = self.inner.compression.clone();
        let source = run.source.clone();
        let file = match cancellable(cancel, tokio::task::spawn_blocking(move || compression.compress(source))).await? {
            Ok(file) => file,
            Err(e) => {
                warn!(error = %e, "Compression worker failed, uploading original");
                run.source.clone()
            }
        };

        // Hashing and duplicate check
        self.set_stage(id, attempt, UploadStatus::Hashing, 25);
        let check = cancellable(
            cancel,
            self.inner.dedup.check_duplicate(file.bytes.clone(), target.business_id),
        )
        .await?
        .map_err(|e| StageFailure::Internal(e.to_string()))?;
        if let Some(existing) = check.existing {
            return Ok(StageOutcome::Duplicate(existing));
        }
        self.set_stage(id, attempt, UploadStatus::Hashing, 35);
        let hash = check.content_hash;

        // Transfer
        self.set_stage(id, attempt, UploadStatus::Uploading, 40);
        let scheduler = self.clone();
        let progress = ProgressReporter::new(move |sent, total| {
            let fraction = if total == 0 { 1.0 } else { sent as f64 / total as f64 };
            let pct = 40 + (fraction.clamp(0.0, 1.0) * 50.0) as u8;
            scheduler.set_progress(id, attempt, pct);
        });

        match self
            .inner
            .storage
            .store(&file, &run.original_filename, target, &hash, &progress, cancel)
            .await
        {
            Ok(StoreOutcome::Stored(record)) => Ok(StageOutcome::Uploaded(record)),
            Ok(StoreOutcome::Duplicate(record)) => Ok(StageOutcome::Duplicate(record)),
            Err(StorageError::Cancelled) => Err(StageFailure::Cancelled),
            Err(e) => Err(StageFailure::Storage(e)),
        }
    }

    fn set_stage(&self, id: TaskId, attempt: u64, status: UploadStatus, progress: u8) {
        let changed = {
            let mut state = self.inner.state.lock();
            match state.tasks.get_mut(&id) {
                Some(entry) if entry.attempt == attempt && entry.task.status.is_active() => {
                    let changed = entry.task.status != status;
                    entry.task.status = status;
                    entry.task.progress = entry.task.progress.max(progress);
                    changed
                }
                _ => false,
            }
        };
        if changed {
            self.publish_stats();
        }
    }

    fn set_progress(&self, id: TaskId, attempt: u64, progress: u8) {
        let mut state = self.inner.state.lock();
        if let Some(entry) = state.tasks.get_mut(&id) {
            if entry.attempt == attempt && entry.task.status.is_active() {
                entry.task.progress = entry.task.progress.max(progress.min(99));
            }
        }
    }

    fn finish(&self, run: &TaskRun, result: Result<StageOutcome, StageFailure>, elapsed: Duration) {
        let id = run.id;
        let mut completion = None;
        let mut retry_after = None;
        {
            let mut state = self.inner.state.lock();
            state.active = state.active.saturating_sub(1);

            let QueueState {
                tasks,
                completed_count,
                completed_total_ms,
                ..
            } = &mut *state;

            let Some(entry) = tasks.get_mut(&id) else {
                return;
            };
            if entry.attempt != run.attempt {
                return;
            }
            entry.cancel = None;
            let task = &mut entry.task;
            let now = Utc::now();

            match result {
                Ok(outcome) => {
                    let (status, record) = match outcome {
                        StageOutcome::Uploaded(record) => (UploadStatus::Uploaded, record),
                        StageOutcome::Duplicate(record) => (UploadStatus::Duplicate, record),
                    };
                    task.status = status;
                    task.progress = 100;
                    task.ended_at = Some(now);
                    task.record_id = Some(record.id);
                    task.last_error = None;
                    *completed_count += 1;
                    *completed_total_ms += elapsed.as_millis();

                    if status == UploadStatus::Uploaded {
                        metrics::counter!("photo_sync.tasks.uploaded").increment(1);
                        info!(task_id = %id, record_id = %record.id, path = %record.storage_path, "Upload complete");
                    } else {
                        metrics::counter!("photo_sync.tasks.duplicate").increment(1);
                        info!(task_id = %id, record_id = %record.id, "Content already stored, skipped upload");
                    }
                    metrics::histogram!("photo_sync.upload.duration_seconds")
                        .record(elapsed.as_secs_f64());

                    completion = Some(TaskCompletion {
                        task_id: id,
                        status,
                        record,
                    });
                }
                Err(StageFailure::Cancelled) => {
                    task.status = UploadStatus::Cancelled;
                    task.ended_at = Some(now);
                    metrics::counter!("photo_sync.tasks.cancelled").increment(1);
                    info!(task_id = %id, "Upload cancelled");
                }
                Err(StageFailure::Storage(e))
                    if e.is_retryable()
                        && self.inner.config.auto_retry
                        && task.retry_count < self.inner.config.max_retries =>
                {
                    task.retry_count += 1;
                    task.status = UploadStatus::Queued;
                    task.last_error = Some(TaskFailure::from(&e));
                    let delay = self.retry_delay(task.retry_count);
                    warn!(
                        task_id = %id,
                        retry = task.retry_count,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Upload failed, retrying"
                    );
                    metrics::counter!("photo_sync.tasks.retried").increment(1);
                    retry_after = Some(delay);
                }
                Err(StageFailure::Storage(e)) => {
                    task.status = UploadStatus::Failed;
                    task.ended_at = Some(now);
                    task.last_error = Some(TaskFailure::from(&e));
                    metrics::counter!("photo_sync.tasks.failed").increment(1);
                    error!(task_id = %id, error = %e, "Upload failed");
                }
                Err(StageFailure::Internal(message)) => {
                    task.status = UploadStatus::Failed;
                    task.ended_at = Some(now);
                    error!(task_id = %id, error = %message, "Upload failed");
                    task.last_error = Some(TaskFailure {
                        kind: FailureKind::Internal,
                        message,
                    });
                    metrics::counter!("photo_sync.tasks.failed").increment(1);
                }
            }
        }

        self.publish_stats();

        if let Some(completion) = completion {
            // No subscribers is fine
            let _ = self.inner.completions_tx.send(completion);
        }

        if let Some(delay) = retry_after {
            let scheduler = self.clone();
            let attempt = run.attempt;
            tokio::spawn(async move {
                tokio::select! {
                    _ = scheduler.inner.shutdown.cancelled() => {}
                    _ = tokio::time::sleep(delay) => scheduler.requeue(id, attempt),
                }
            });
        }

        self.pump();
    }

    /// Put a task back in line after its retry delay, unless it was
    /// cancelled or restarted meanwhile.
    fn requeue(&self, id: TaskId, attempt: u64) {
        {
            let mut state = self.inner.state.lock();
            let still_waiting = state
                .tasks
                .get(&id)
                .is_some_and(|e| e.attempt == attempt && e.task.status == UploadStatus::Queued);
            if !still_waiting {
                return;
            }
            state.pending.push_back(id);
        }
        self.pump();
    }

    fn retry_delay(&self, retry_count: u32) -> Duration {
        let initial = Duration::from_millis(self.inner.config.retry_base_delay_ms);
        let mut backoff = ExponentialBackoff {
            initial_interval: initial,
            max_interval: Duration::from_millis(self.inner.config.retry_max_delay_ms),
            max_elapsed_time: None,
            ..Default::default()
        };
        backoff.reset();

        let mut delay = initial;
        for _ in 0..retry_count {
            if let Some(next) = backoff.next_backoff() {
                delay = next;
            }
        }
        delay
    }

    fn publish_stats(&self) {
        let stats = {
            let state = self.inner.state.lock();
            let mut stats = QueueStats {
                average_duration_ms: (state.completed_count > 0)
                    .then(|| (state.completed_total_ms / state.completed_count as u128) as u64),
                ..Default::default()
            };
            for entry in state.tasks.values() {
                match entry.task.status {
                    UploadStatus::Queued => stats.queued += 1,
                    UploadStatus::Compressing | UploadStatus::Hashing | UploadStatus::Uploading => {
                        stats.active += 1
                    }
                    UploadStatus::Uploaded => stats.uploaded += 1,
                    UploadStatus::Duplicate => stats.duplicates += 1,
                    UploadStatus::Failed => stats.failed += 1,
                    UploadStatus::Cancelled => stats.cancelled += 1,
                }
            }
            stats
        };

        metrics::gauge!("photo_sync.queue.active").set(stats.active as f64);
        metrics::gauge!("photo_sync.queue.queued").set(stats.queued as f64);
        self.inner.stats_tx.send_if_modified(|current| {
            if *current == stats {
                false
            } else {
                *current = stats;
                true
            }
        });
    }
}

struct TaskRun {
    id: TaskId,
    attempt: u64,
    source: SourceFile,
    original_filename: String,
    target: UploadTarget,
    cancel: CancellationToken,
}

/// Race `fut` against the task's cancellation token.
async fn cancellable<F: Future>(
    token: &CancellationToken,
    fut: F,
) -> Result<F::Output, StageFailure> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(StageFailure::Cancelled),
        out = fut => Ok(out),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompressionConfig;
    use crate::memory::{InMemoryBlobStore, InMemoryRecordStore};
    use crate::network::NetworkMonitor;

    struct Harness {
        scheduler: UploadQueueScheduler,
        blobs: Arc<InMemoryBlobStore>,
        records: Arc<InMemoryRecordStore>,
    }

    fn harness(blobs: InMemoryBlobStore, config: UploadConfig) -> Harness {
        let blobs = Arc::new(blobs);
        let records = Arc::new(InMemoryRecordStore::new());
        let storage = StorageClient::new(blobs.clone(), records.clone(), Duration::from_secs(5));
        let scheduler = UploadQueueScheduler::new(
            config,
            CompressionStage::new(CompressionConfig::default()),
            storage,
            NetworkMonitor::default().subscribe(),
            CancellationToken::new(),
        );
        Harness {
            scheduler,
            blobs,
            records,
        }
    }

    fn config(max_concurrency: usize) -> UploadConfig {
        UploadConfig {
            max_concurrency: Some(max_concurrency),
            retry_base_delay_ms: 10,
            retry_max_delay_ms: 20,
            ..Default::default()
        }
    }

    fn descriptor() -> TargetDescriptor {
        TargetDescriptor {
            business_id: Some(Uuid::new_v4()),
            phase: Some("survey".to_string()),
            category: Some("exterior".to_string()),
            ..Default::default()
        }
    }

    fn file(name: &str, content: &str) -> SourceFile {
        SourceFile::new(name, "image/jpeg", content.as_bytes().to_vec())
    }

    async fn wait_for_status(scheduler: &UploadQueueScheduler, id: TaskId, status: UploadStatus) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while scheduler.task(id).map(|t| t.status) != Some(status) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[test]
    fn test_status_classes() {
        assert!(UploadStatus::Uploading.is_active());
        assert!(!UploadStatus::Queued.is_active());
        assert!(UploadStatus::Duplicate.is_terminal());
        assert!(!UploadStatus::Hashing.is_terminal());
    }

    #[tokio::test]
    async fn test_invalid_target_enqueues_nothing() {
        let h = harness(InMemoryBlobStore::new(), config(2));
        let bad = TargetDescriptor {
            phase: Some("survey".to_string()),
            ..Default::default()
        };

        let err = h.scheduler.enqueue(vec![file("a.jpg", "a")], &bad).unwrap_err();
        assert_eq!(err, ValidationError::MissingField("business_id"));
        assert!(h.scheduler.tasks().is_empty());
    }

    #[tokio::test]
    async fn test_empty_batch_rejected() {
        let h = harness(InMemoryBlobStore::new(), config(2));
        assert_eq!(
            h.scheduler.enqueue(vec![], &descriptor()).unwrap_err(),
            ValidationError::EmptyBatch
        );
        assert_eq!(
            h.scheduler
                .enqueue(vec![SourceFile::new("e.jpg", "image/jpeg", Vec::new())], &descriptor())
                .unwrap_err(),
            ValidationError::EmptyFile("e.jpg".to_string())
        );
    }

    #[tokio::test]
    async fn test_batch_uploads_and_broadcasts_completions() {
        let h = harness(InMemoryBlobStore::new(), config(2));
        let mut completions = h.scheduler.completions();

        let ids = h
            .scheduler
            .enqueue(vec![file("a.jpg", "first"), file("b.jpg", "second")], &descriptor())
            .unwrap();
        h.scheduler.idle().await;

        for id in &ids {
            let task = h.scheduler.task(*id).unwrap();
            assert_eq!(task.status, UploadStatus::Uploaded);
            assert_eq!(task.progress, 100);
            assert!(task.record_id.is_some());
        }
        assert_eq!(h.records.records().len(), 2);
        assert_eq!(h.blobs.object_count(), 2);

        let first = completions.recv().await.unwrap();
        let second = completions.recv().await.unwrap();
        assert_eq!(first.status, UploadStatus::Uploaded);
        assert!(ids.contains(&first.task_id) && ids.contains(&second.task_id));

        let stats = h.scheduler.stats().borrow().clone();
        assert_eq!(stats.uploaded, 2);
        assert!(stats.is_idle());
        assert!(stats.average_duration_ms.is_some());
    }

    #[tokio::test]
    async fn test_cancel_queued_task_makes_no_network_calls() {
        let h = harness(
            InMemoryBlobStore::new().with_put_delay(Duration::from_millis(80)),
            config(1),
        );
        let ids = h
            .scheduler
            .enqueue(vec![file("a.jpg", "first"), file("b.jpg", "second")], &descriptor())
            .unwrap();

        h.scheduler.cancel(ids[1]).unwrap();
        assert_eq!(h.scheduler.task(ids[1]).unwrap().status, UploadStatus::Cancelled);

        h.scheduler.idle().await;
        assert_eq!(h.scheduler.task(ids[0]).unwrap().status, UploadStatus::Uploaded);
        assert_eq!(h.blobs.put_calls(), 1);
        assert_eq!(h.records.records().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_running_task_leaves_no_record() {
        let h = harness(
            InMemoryBlobStore::new().with_put_delay(Duration::from_millis(200)),
            config(1),
        );
        let ids = h.scheduler.enqueue(vec![file("a.jpg", "first")], &descriptor()).unwrap();

        wait_for_status(&h.scheduler, ids[0], UploadStatus::Uploading).await;
        h.scheduler.cancel(ids[0]).unwrap();
        h.scheduler.idle().await;

        assert_eq!(h.scheduler.task(ids[0]).unwrap().status, UploadStatus::Cancelled);
        assert!(h.records.records().is_empty());
        assert_eq!(h.blobs.object_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_terminal_task_is_rejected() {
        let h = harness(InMemoryBlobStore::new(), config(1));
        let ids = h.scheduler.enqueue(vec![file("a.jpg", "first")], &descriptor()).unwrap();
        h.scheduler.idle().await;

        assert_eq!(
            h.scheduler.cancel(ids[0]),
            Err(TaskActionError::InvalidState {
                id: ids[0],
                status: UploadStatus::Uploaded
            })
        );
        let unknown = Uuid::new_v4();
        assert_eq!(h.scheduler.cancel(unknown), Err(TaskActionError::NotFound(unknown)));
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried_automatically() {
        let blobs = InMemoryBlobStore::new();
        blobs.fail_next_puts(1);
        let h = harness(blobs, config(1));

        let ids = h.scheduler.enqueue(vec![file("a.jpg", "first")], &descriptor()).unwrap();
        h.scheduler.idle().await;

        let task = h.scheduler.task(ids[0]).unwrap();
        assert_eq!(task.status, UploadStatus::Uploaded);
        assert_eq!(task.retry_count, 1);
        assert_eq!(h.blobs.put_calls(), 2);
        assert_eq!(h.records.records().len(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_then_manual_retry_succeeds() {
        let blobs = InMemoryBlobStore::new();
        blobs.fail_next_puts(2);
        let h = harness(blobs, config(1));

        let ids = h.scheduler.enqueue(vec![file("a.jpg", "first")], &descriptor()).unwrap();
        h.scheduler.idle().await;

        let failed = h.scheduler.task(ids[0]).unwrap();
        assert_eq!(failed.status, UploadStatus::Failed);
        assert_eq!(failed.last_error.as_ref().unwrap().kind, FailureKind::Transfer);
        assert!(h.records.records().is_empty());

        h.scheduler.retry(ids[0]).unwrap();
        h.scheduler.idle().await;

        let task = h.scheduler.task(ids[0]).unwrap();
        assert_eq!(task.status, UploadStatus::Uploaded);
        assert_eq!(task.retry_count, 2);
        assert!(task.last_error.is_none());
    }

    #[tokio::test]
    async fn test_compensation_failure_is_not_retried() {
        let blobs = InMemoryBlobStore::new();
        blobs.fail_deletes(true);
        let h = harness(blobs, config(1));
        h.records.fail_next_inserts(1);

        let ids = h.scheduler.enqueue(vec![file("a.jpg", "first")], &descriptor()).unwrap();
        h.scheduler.idle().await;

        let task = h.scheduler.task(ids[0]).unwrap();
        assert_eq!(task.status, UploadStatus::Failed);
        assert_eq!(task.retry_count, 0);
        assert_eq!(task.last_error.unwrap().kind, FailureKind::Compensation);
    }

    #[tokio::test]
    async fn test_retry_only_from_failed_or_cancelled() {
        let h = harness(InMemoryBlobStore::new(), config(1));
        let ids = h.scheduler.enqueue(vec![file("a.jpg", "first")], &descriptor()).unwrap();
        h.scheduler.idle().await;

        assert!(matches!(
            h.scheduler.retry(ids[0]),
            Err(TaskActionError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn test_clear_completed_keeps_failed_tasks() {
        let blobs = InMemoryBlobStore::new();
        blobs.fail_next_puts(1);
        let h = harness(
            blobs,
            UploadConfig {
                auto_retry: false,
                ..config(1)
            },
        );

        let ids = h
            .scheduler
            .enqueue(vec![file("a.jpg", "first"), file("b.jpg", "second")], &descriptor())
            .unwrap();
        h.scheduler.idle().await;
        assert_eq!(h.scheduler.task(ids[0]).unwrap().status, UploadStatus::Failed);
        assert_eq!(h.scheduler.task(ids[1]).unwrap().status, UploadStatus::Uploaded);

        assert_eq!(h.scheduler.clear_completed(), 1);
        let remaining: Vec<_> = h.scheduler.tasks().into_iter().map(|t| t.id).collect();
        assert_eq!(remaining, vec![ids[0]]);
    }

    #[tokio::test]
    async fn test_cancel_all_stops_every_pending_task() {
        let h = harness(
            InMemoryBlobStore::new().with_put_delay(Duration::from_millis(100)),
            config(1),
        );
        let files = (0..4).map(|i| file(&format!("{i}.jpg"), &format!("content {i}"))).collect();
        h.scheduler.enqueue(files, &descriptor()).unwrap();

        assert_eq!(h.scheduler.cancel_all(), 4);
        h.scheduler.idle().await;

        assert!(h
            .scheduler
            .tasks()
            .iter()
            .all(|t| t.status == UploadStatus::Cancelled));
        assert!(h.records.records().is_empty());
    }

    #[tokio::test]
    async fn test_adaptive_limit_follows_network() {
        let monitor = NetworkMonitor::default();
        let blobs = Arc::new(InMemoryBlobStore::new());
        let records = Arc::new(InMemoryRecordStore::new());
        let scheduler = UploadQueueScheduler::new(
            UploadConfig::default(),
            CompressionStage::new(CompressionConfig::default()),
            StorageClient::new(blobs, records, Duration::from_secs(5)),
            monitor.subscribe(),
            CancellationToken::new(),
        );

        monitor.report(NetworkConditions::online(
            crate::network::NetworkTier::TwoG,
            crate::network::DeviceClass::Desktop,
        ));
        assert_eq!(scheduler.concurrency_limit(), 2);

        monitor.report(NetworkConditions::online(
            crate::network::NetworkTier::FourG,
            crate::network::DeviceClass::Desktop,
        ));
        assert_eq!(scheduler.concurrency_limit(), 8);
    }

    #[test]
    fn test_retry_delay_grows_and_is_capped() {
        let h = {
            let blobs = Arc::new(InMemoryBlobStore::new());
            let records = Arc::new(InMemoryRecordStore::new());
            UploadQueueScheduler::new(
                UploadConfig {
                    retry_base_delay_ms: 100,
                    retry_max_delay_ms: 400,
                    ..Default::default()
                },
                CompressionStage::new(CompressionConfig::default()),
                StorageClient::new(blobs, records, Duration::from_secs(5)),
                NetworkMonitor::default().subscribe(),
                CancellationToken::new(),
            )
        };

        for retry in 1..6 {
            let delay = h.retry_delay(retry);
            // randomization is +/-50% around the capped interval
            assert!(delay <= Duration::from_millis(600), "retry {retry}: {delay:?}");
            assert!(delay >= Duration::from_millis(50), "retry {retry}: {delay:?}");
        }
    }
}
