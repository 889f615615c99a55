//! Per-business sync sessions: change feed + poller + reconciler, plus the
//! scheduler's completions for that business.

use crate::bus::{EventBus, SyncEvent};
use crate::change_feed::{ChangeFeedSubscriber, ChangeSource, FeedHealth, Subscription};
use crate::config::{PollingConfig, ReconcileConfig};
use crate::network::NetworkMonitor;
use crate::polling::PollingFallback;
use crate::reconciler::{ReconciledView, ReconcilerStore};
use crate::scheduler::UploadQueueScheduler;
use crate::storage_client::RecordStore;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Shared collaborators for every session.
#[derive(Clone)]
pub struct SessionDeps {
    pub source: Arc<dyn ChangeSource>,
    pub records: Arc<dyn RecordStore>,
    pub scheduler: UploadQueueScheduler,
    pub network: NetworkMonitor,
    pub polling: PollingConfig,
    pub reconcile: ReconcileConfig,
    pub handshake_timeout: Duration,
    pub fetch_timeout: Duration,
}

pub struct SyncSession {
    business_id: Uuid,
    store: Arc<ReconcilerStore>,
    subscription: Subscription,
    cancel: CancellationToken,
    last_access: Mutex<Instant>,
}

impl SyncSession {
    /// Spawn the session's tasks. Must be called from within a tokio runtime.
    pub fn start(business_id: Uuid, deps: &SessionDeps, shutdown: &CancellationToken) -> Self {
        let cancel = shutdown.child_token();
        let (bus, events) = EventBus::channel(deps.reconcile.bus_capacity);

        let store = Arc::new(ReconcilerStore::new(business_id, (&deps.reconcile).into()));
        tokio::spawn(store.clone().run(events, cancel.clone()));

        // Subscribe before the feed can produce anything worth reconciling
        let completions = deps.scheduler.completions();
        tokio::spawn(forward_completions(business_id, completions, bus.clone(), cancel.clone()));

        let subscription = ChangeFeedSubscriber::new(deps.handshake_timeout).subscribe(
            business_id,
            deps.source.clone(),
            bus.clone(),
            &cancel,
        );

        let poller = PollingFallback::new(deps.records.clone(), deps.polling.clone(), deps.fetch_timeout);
        let network = deps.network.subscribe();
        let health = subscription.health();
        let poll_cancel = cancel.clone();
        tokio::spawn(async move {
            poller
                .run(business_id, bus, network, health, poll_cancel)
                .await
        });

        info!(business_id = %business_id, "Sync session started");
        metrics::gauge!("photo_sync.sessions.active").increment(1.0);

        Self {
            business_id,
            store,
            subscription,
            cancel,
            last_access: Mutex::new(Instant::now()),
        }
    }

    pub fn business_id(&self) -> Uuid {
        self.business_id
    }

    pub fn view(&self) -> ReconciledView {
        self.store.current()
    }

    pub fn subscribe(&self) -> watch::Receiver<ReconciledView> {
        self.store.subscribe()
    }

    pub fn feed_health(&self) -> watch::Receiver<FeedHealth> {
        self.subscription.health()
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    fn touch(&self) {
        *self.last_access.lock() = Instant::now();
    }

    /// Time since the session was last handed out by its registry.
    pub fn idle_for(&self) -> Duration {
        self.last_access.lock().elapsed()
    }
}

impl Drop for SyncSession {
    fn drop(&mut self) {
        self.cancel.cancel();
        metrics::gauge!("photo_sync.sessions.active").decrement(1.0);
    }
}

async fn forward_completions(
    business_id: Uuid,
    mut completions: broadcast::Receiver<crate::scheduler::TaskCompletion>,
    bus: EventBus,
    cancel: CancellationToken,
) {
    loop {
        let completion = tokio::select! {
            _ = cancel.cancelled() => break,
            completion = completions.recv() => completion,
        };
        match completion {
            Ok(completion) if completion.record.business_id == business_id => {
                if !bus.publish(SyncEvent::LocalConfirmed(completion.record)).await {
                    break;
                }
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                // The next poll picks the missed rows up
                warn!(business_id = %business_id, missed, "Completion notices lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Sessions by business id, started on first use.
pub struct SessionRegistry {
    deps: SessionDeps,
    sessions: Mutex<HashMap<Uuid, Arc<SyncSession>>>,
    shutdown: CancellationToken,
}

impl SessionRegistry {
    pub fn new(deps: SessionDeps, shutdown: CancellationToken) -> Self {
        Self {
            deps,
            sessions: Mutex::new(HashMap::new()),
            shutdown,
        }
    }

    pub fn session(&self, business_id: Uuid) -> Arc<SyncSession> {
        let session = self
            .sessions
            .lock()
            .entry(business_id)
            .or_insert_with(|| Arc::new(SyncSession::start(business_id, &self.deps, &self.shutdown)))
            .clone();
        session.touch();
        session
    }

    pub fn get(&self, business_id: Uuid) -> Option<Arc<SyncSession>> {
        self.sessions.lock().get(&business_id).cloned()
    }

    pub fn stop(&self, business_id: Uuid) -> bool {
        match self.sessions.lock().remove(&business_id) {
            Some(session) => {
                session.stop();
                info!(business_id = %business_id, "Sync session stopped");
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    /// Stop every session idle for at least `idle`. Returns how many were stopped.
    pub fn evict_idle(&self, idle: Duration) -> usize {
        let evicted: Vec<_> = {
            let mut sessions = self.sessions.lock();
            let expired: Vec<Uuid> = sessions
                .iter()
                .filter(|(_, session)| session.idle_for() >= idle)
                .map(|(id, _)| *id)
                .collect();
            expired
                .into_iter()
                .filter_map(|id| sessions.remove(&id))
                .collect()
        };

        for session in &evicted {
            session.stop();
            info!(business_id = %session.business_id(), "Idle sync session stopped");
        }
        evicted.len()
    }

    /// Periodically stop sessions idle longer than `reconcile.session_idle_secs`.
    pub async fn run_reaper(self: Arc<Self>) {
        let idle = self.deps.reconcile.session_idle();
        let every = (idle / 4).clamp(Duration::from_secs(1), Duration::from_secs(60));
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let evicted = self.evict_idle(idle);
                    if evicted > 0 {
                        debug!(evicted, remaining = self.len(), "Session sweep finished");
                    }
                }
            }
        }
    }

    pub fn stop_all(&self) {
        let sessions: Vec<_> = self.sessions.lock().drain().map(|(_, s)| s).collect();
        for session in &sessions {
            session.stop();
        }
        info!(count = sessions.len(), "All sync sessions stopped");
    }
}
