//! Merges local confirmations, pushed changes and poll snapshots into one
//! file list per business.
//!
//! Rows are keyed by id and merged last-writer-wins on `updated_at`, so the
//! same input applied twice, or causally consistent inputs applied in a
//! different order, end in the same view. Deletes leave a tombstone so a
//! replayed insert or a stale snapshot cannot bring the row back.
//!
//! Recency is tracked as expiry timestamps and evaluated against the `now`
//! passed in; nothing here runs on a timer.

use crate::bus::SyncEvent;
use crate::config::ReconcileConfig;
use crate::model::{ChangeEvent, FileRecord};
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};
use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
pub struct ReconcileWindows {
    pub recently_added: Duration,
    pub local_protection: Duration,
    pub tombstone_ttl: Duration,
}

/// Longest window honoured; larger settings are clamped so `now + window`
/// stays representable.
const MAX_WINDOW_SECS: u64 = 10 * 365 * 24 * 60 * 60;

fn window(secs: u64) -> Duration {
    Duration::seconds(secs.min(MAX_WINDOW_SECS) as i64)
}

impl From<&ReconcileConfig> for ReconcileWindows {
    fn from(config: &ReconcileConfig) -> Self {
        Self {
            recently_added: window(config.recently_added_secs),
            local_protection: window(config.local_protection_secs),
            tombstone_ttl: window(config.tombstone_ttl_secs),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconciledEntry {
    #[serde(flatten)]
    pub record: FileRecord,
    /// Set while the entry counts as "just added"
    pub recently_added_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconciledView {
    pub business_id: Uuid,
    /// Newest first
    pub entries: Vec<ReconciledEntry>,
}

impl ReconciledView {
    pub fn empty(business_id: Uuid) -> Self {
        Self {
            business_id,
            entries: Vec::new(),
        }
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.entries.iter().any(|e| e.record.id == id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone)]
struct Entry {
    record: FileRecord,
    recently_added_until: Option<DateTime<Utc>>,
    protected_until: Option<DateTime<Utc>>,
}

impl Entry {
    fn is_protected(&self, now: DateTime<Utc>) -> bool {
        self.protected_until.is_some_and(|until| until > now)
    }
}

/// Reconciled state for one business scope.
#[derive(Debug)]
pub struct Reconciler {
    business_id: Uuid,
    windows: ReconcileWindows,
    entries: HashMap<Uuid, Entry>,
    /// Deleted id -> tombstone expiry
    tombstones: HashMap<Uuid, DateTime<Utc>>,
}

impl Reconciler {
    pub fn new(business_id: Uuid, windows: ReconcileWindows) -> Self {
        Self {
            business_id,
            windows,
            entries: HashMap::new(),
            tombstones: HashMap::new(),
        }
    }

    pub fn business_id(&self) -> Uuid {
        self.business_id
    }

    /// Merge one input. Returns whether the visible view changed.
    pub fn apply(&mut self, input: SyncEvent, now: DateTime<Utc>) -> bool {
        self.tombstones.retain(|_, expires| *expires > now);

        match input {
            SyncEvent::LocalConfirmed(record) => self.upsert(record, now, true, true),
            SyncEvent::Remote(ChangeEvent::Insert(record))
            | SyncEvent::Remote(ChangeEvent::Update(record)) => self.upsert(record, now, false, true),
            SyncEvent::Remote(ChangeEvent::Delete { id, business_id }) => {
                if business_id.is_some_and(|b| b != self.business_id) {
                    return false;
                }
                self.tombstones.insert(id, now + self.windows.tombstone_ttl);
                self.entries.remove(&id).is_some()
            }
            SyncEvent::Snapshot(records) => self.merge_snapshot(records, now),
        }
    }

    fn is_tombstoned(&self, id: Uuid, now: DateTime<Utc>) -> bool {
        self.tombstones.get(&id).is_some_and(|expires| *expires > now)
    }

    fn upsert(&mut self, record: FileRecord, now: DateTime<Utc>, recent: bool, protect: bool) -> bool {
        if record.business_id != self.business_id || self.is_tombstoned(record.id, now) {
            return false;
        }

        let recently_added_until = recent.then(|| now + self.windows.recently_added);
        let protected_until = protect.then(|| now + self.windows.local_protection);

        match self.entries.get_mut(&record.id) {
            Some(entry) => {
                if record.updated_at < entry.record.updated_at {
                    return false;
                }
                let mut changed = entry.record != record;
                entry.record = record;
                if recently_added_until.is_some() && recently_added_until > entry.recently_added_until {
                    entry.recently_added_until = recently_added_until;
                    changed = true;
                }
                if protected_until > entry.protected_until {
                    entry.protected_until = protected_until;
                }
                changed
            }
            None => {
                self.entries.insert(
                    record.id,
                    Entry {
                        record,
                        recently_added_until,
                        protected_until,
                    },
                );
                true
            }
        }
    }

    fn merge_snapshot(&mut self, records: Vec<FileRecord>, now: DateTime<Utc>) -> bool {
        let records: Vec<FileRecord> = records
            .into_iter()
            .filter(|r| r.business_id == self.business_id)
            .collect();
        let present: HashSet<Uuid> = records.iter().map(|r| r.id).collect();

        let mut changed = false;
        for record in records {
            changed |= self.upsert(record, now, false, false);
        }

        let before = self.entries.len();
        self.entries
            .retain(|id, entry| present.contains(id) || entry.is_protected(now));
        let removed = before - self.entries.len();
        if removed > 0 {
            debug!(business_id = %self.business_id, removed, "Snapshot removed entries");
        }

        changed || removed > 0
    }

    /// Current view as of `now`, newest first.
    pub fn view(&self, now: DateTime<Utc>) -> ReconciledView {
        let mut entries: Vec<ReconciledEntry> = self
            .entries
            .values()
            .map(|e| ReconciledEntry {
                record: e.record.clone(),
                recently_added_until: e.recently_added_until.filter(|until| *until > now),
            })
            .collect();
        entries.sort_by(|a, b| {
            b.record
                .created_at
                .cmp(&a.record.created_at)
                .then_with(|| a.record.id.cmp(&b.record.id))
        });

        ReconciledView {
            business_id: self.business_id,
            entries,
        }
    }
}

/// Shared owner of one [`Reconciler`], publishing every changed view.
pub struct ReconcilerStore {
    business_id: Uuid,
    state: Mutex<Reconciler>,
    view_tx: watch::Sender<ReconciledView>,
}

impl ReconcilerStore {
    pub fn new(business_id: Uuid, windows: ReconcileWindows) -> Self {
        let (view_tx, _) = watch::channel(ReconciledView::empty(business_id));
        Self {
            business_id,
            state: Mutex::new(Reconciler::new(business_id, windows)),
            view_tx,
        }
    }

    pub fn dispatch(&self, input: SyncEvent) -> bool {
        self.dispatch_at(input, Utc::now())
    }

    pub fn dispatch_at(&self, input: SyncEvent, now: DateTime<Utc>) -> bool {
        let view = {
            let mut state = self.state.lock();
            if !state.apply(input, now) {
                return false;
            }
            state.view(now)
        };
        metrics::counter!("photo_sync.reconcile.changes").increment(1);
        self.view_tx.send_replace(view);
        true
    }

    pub fn subscribe(&self) -> watch::Receiver<ReconciledView> {
        self.view_tx.subscribe()
    }

    /// View with recency markers evaluated against the current time.
    pub fn current(&self) -> ReconciledView {
        self.state.lock().view(Utc::now())
    }

    /// Consume the sync bus until it closes or `shutdown` fires.
    #[instrument(skip_all, fields(business_id = %self.business_id))]
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<SyncEvent>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv() => {
                    let Some(event) = event else { break };
                    let kind = event.kind();
                    if self.dispatch(event) {
                        debug!(kind, "View updated");
                    }
                }
            }
        }
        info!("Reconciler stopped");
    }
}
