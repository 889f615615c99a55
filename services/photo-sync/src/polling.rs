//! Periodic full refetch of a business's file list.
//!
//! Runs alongside the change feed as a slow backup, and takes over at a
//! short interval whenever the feed is not connected.

use crate::bus::{EventBus, SyncEvent};
use crate::change_feed::FeedHealth;
use crate::config::PollingConfig;
use crate::model::FileRecord;
use crate::network::{DeviceClass, NetworkConditions, NetworkTier};
use crate::storage_client::{RecordError, RecordStore};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum PollError {
    #[error("poll timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Backend(#[from] RecordError),
}

fn tier_factor(tier: NetworkTier) -> f64 {
    match tier {
        NetworkTier::FourG | NetworkTier::Unknown => 1.0,
        NetworkTier::ThreeG => 0.66,
        NetworkTier::TwoG => 0.5,
        NetworkTier::Slow2g => 0.33,
    }
}

fn device_factor(device: DeviceClass) -> f64 {
    match device {
        DeviceClass::Desktop => 1.0,
        DeviceClass::Mobile => 0.5,
    }
}

/// Time between polls under the given conditions.
pub fn compute_interval(
    conditions: &NetworkConditions,
    health: FeedHealth,
    config: &PollingConfig,
) -> Duration {
    let interval = if !conditions.online {
        config.offline_interval()
    } else {
        let base = if health.is_healthy() {
            config.backup_interval()
        } else {
            config.active_interval()
        };
        base.mul_f64(tier_factor(conditions.tier) * device_factor(conditions.device))
    };
    interval.max(config.min_interval())
}

fn is_degradation(previous: FeedHealth, current: FeedHealth) -> bool {
    previous != current
        && (previous.is_healthy() || matches!(current, FeedHealth::Error | FeedHealth::Closed))
        && !current.is_healthy()
}

pub struct PollingFallback {
    records: Arc<dyn RecordStore>,
    config: PollingConfig,
    fetch_timeout: Duration,
}

impl PollingFallback {
    pub fn new(records: Arc<dyn RecordStore>, config: PollingConfig, fetch_timeout: Duration) -> Self {
        Self {
            records,
            config,
            fetch_timeout,
        }
    }

    /// Fetch every record of `business_id`.
    pub async fn poll(&self, business_id: Uuid) -> Result<Vec<FileRecord>, PollError> {
        let records = tokio::time::timeout(self.fetch_timeout, self.records.list(business_id))
            .await
            .map_err(|_| PollError::Timeout(self.fetch_timeout))??;
        Ok(records)
    }

    /// Returns `false` once the bus is closed.
    async fn poll_and_publish(&self, business_id: Uuid, bus: &EventBus) -> bool {
        metrics::counter!("photo_sync.poll.runs").increment(1);
        match self.poll(business_id).await {
            Ok(records) => {
                debug!(record_count = records.len(), "Poll complete");
                bus.publish(SyncEvent::Snapshot(records)).await
            }
            Err(e) => {
                warn!(error = %e, "Poll failed");
                metrics::counter!("photo_sync.poll.failures").increment(1);
                !bus.is_closed()
            }
        }
    }

    /// Poll until `shutdown` fires or the bus closes. The first poll runs
    /// immediately.
    #[instrument(skip_all, fields(business_id = %business_id))]
    pub async fn run(
        &self,
        business_id: Uuid,
        bus: EventBus,
        mut network: watch::Receiver<NetworkConditions>,
        mut health: watch::Receiver<FeedHealth>,
        shutdown: CancellationToken,
    ) {
        let mut conditions = *network.borrow_and_update();
        let mut feed = *health.borrow_and_update();
        let mut network_open = true;
        let mut health_open = true;

        let mut last_poll = Instant::now();
        if !self.poll_and_publish(business_id, &bus).await {
            return;
        }

        loop {
            let interval = compute_interval(&conditions, feed, &self.config);
            let due = last_poll + interval;

            let poll_now = tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep_until(due) => true,
                changed = network.changed(), if network_open => {
                    if changed.is_err() {
                        network_open = false;
                        false
                    } else {
                        let current = *network.borrow_and_update();
                        let came_online = !conditions.online && current.online;
                        conditions = current;
                        came_online
                    }
                }
                changed = health.changed(), if health_open => {
                    let current = if changed.is_err() {
                        health_open = false;
                        FeedHealth::Closed
                    } else {
                        *health.borrow_and_update()
                    };
                    let degraded = is_degradation(feed, current);
                    feed = current;
                    degraded
                }
            };

            if poll_now {
                debug!(
                    interval_ms = compute_interval(&conditions, feed, &self.config).as_millis() as u64,
                    "Polling"
                );
                last_poll = Instant::now();
                if !self.poll_and_publish(business_id, &bus).await {
                    break;
                }
            }
        }

        info!("Polling stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryRecordStore;
    use crate::model::FacilityAssociation;
    use chrono::Utc;

    fn secs(s: f64) -> Duration {
        Duration::from_secs_f64(s)
    }

    #[test]
    fn test_interval_by_feed_health() {
        let config = PollingConfig::default();
        let desktop = NetworkConditions::default();

        let healthy = compute_interval(&desktop, FeedHealth::Connected, &config);
        let failing = compute_interval(&desktop, FeedHealth::Error, &config);
        assert_eq!(healthy, secs(120.0));
        assert_eq!(failing, secs(15.0));
        assert!(failing < healthy);
        assert_eq!(compute_interval(&desktop, FeedHealth::Closed, &config), failing);
        assert_eq!(compute_interval(&desktop, FeedHealth::Connecting, &config), failing);
    }

    #[test]
    fn test_interval_scales_with_tier_and_device() {
        let config = PollingConfig::default();
        let mobile_2g = NetworkConditions::online(NetworkTier::TwoG, DeviceClass::Mobile);
        assert_eq!(
            compute_interval(&mobile_2g, FeedHealth::Error, &config),
            secs(3.75)
        );

        let desktop_3g = NetworkConditions::online(NetworkTier::ThreeG, DeviceClass::Desktop);
        assert_eq!(
            compute_interval(&desktop_3g, FeedHealth::Connected, &config),
            secs(120.0).mul_f64(0.66)
        );
    }

    #[test]
    fn test_interval_floor_and_offline() {
        let config = PollingConfig::default();
        let slowest = NetworkConditions::online(NetworkTier::Slow2g, DeviceClass::Mobile);
        assert_eq!(compute_interval(&slowest, FeedHealth::Error, &config), secs(3.0));

        let offline = NetworkConditions {
            online: false,
            ..NetworkConditions::default()
        };
        assert_eq!(compute_interval(&offline, FeedHealth::Error, &config), secs(300.0));
    }

    #[test]
    fn test_degradation_transitions() {
        assert!(is_degradation(FeedHealth::Connected, FeedHealth::Error));
        assert!(is_degradation(FeedHealth::Connected, FeedHealth::Connecting));
        assert!(is_degradation(FeedHealth::Connecting, FeedHealth::Closed));
        assert!(!is_degradation(FeedHealth::Error, FeedHealth::Error));
        assert!(!is_degradation(FeedHealth::Closed, FeedHealth::Connecting));
        assert!(!is_degradation(FeedHealth::Connecting, FeedHealth::Connected));
    }

    fn seeded_store(business: Uuid) -> Arc<InMemoryRecordStore> {
        let store = Arc::new(InMemoryRecordStore::new());
        let now = Utc::now();
        store.seed(FileRecord {
            id: Uuid::new_v4(),
            business_id: business,
            filename: "1_a.jpg".to_string(),
            original_filename: "a.jpg".to_string(),
            content_hash: "h".to_string(),
            storage_path: "p".to_string(),
            size_bytes: 1,
            mime_type: "image/jpeg".to_string(),
            upload_status: "uploaded".to_string(),
            facility: FacilityAssociation::Category("exterior".to_string()),
            created_at: now,
            updated_at: now,
        });
        store
    }

    async fn wait_for_calls(store: &InMemoryRecordStore, calls: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while store.list_calls() < calls {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_poll_publishes_snapshot_and_reacts_to_feed_errors() {
        let business = Uuid::new_v4();
        let store = seeded_store(business);
        let poller = PollingFallback::new(store.clone(), PollingConfig::default(), Duration::from_secs(1));
        let (bus, mut events) = EventBus::channel(8);
        let network = crate::network::NetworkMonitor::default();
        let (health_tx, health_rx) = watch::channel(FeedHealth::Connected);
        let shutdown = CancellationToken::new();

        let handle = tokio::spawn({
            let shutdown = shutdown.clone();
            let network = network.subscribe();
            async move { poller.run(business, bus, network, health_rx, shutdown).await }
        });

        match events.recv().await {
            Some(SyncEvent::Snapshot(records)) => assert_eq!(records.len(), 1),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(store.list_calls(), 1);

        // Feed failure polls at once instead of waiting out the 120 s backup interval
        health_tx.send_replace(FeedHealth::Error);
        wait_for_calls(&store, 2).await;
        assert!(matches!(events.recv().await, Some(SyncEvent::Snapshot(_))));

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_coming_online_polls_and_failures_keep_loop_alive() {
        let business = Uuid::new_v4();
        let store = seeded_store(business);
        store.fail_lists(true);
        let poller = PollingFallback::new(store.clone(), PollingConfig::default(), Duration::from_secs(1));
        let (bus, mut events) = EventBus::channel(8);
        let network = crate::network::NetworkMonitor::new(NetworkConditions {
            online: false,
            ..NetworkConditions::default()
        });
        let (_health_tx, health_rx) = watch::channel(FeedHealth::Connected);
        let shutdown = CancellationToken::new();

        let handle = tokio::spawn({
            let shutdown = shutdown.clone();
            let network = network.subscribe();
            async move { poller.run(business, bus, network, health_rx, shutdown).await }
        });

        wait_for_calls(&store, 1).await;
        store.fail_lists(false);
        network.report(NetworkConditions::default());
        wait_for_calls(&store, 2).await;

        match events.recv().await {
            Some(SyncEvent::Snapshot(records)) => assert_eq!(records.len(), 1),
            other => panic!("unexpected {other:?}"),
        }

        shutdown.cancel();
        handle.await.unwrap();
    }
}
