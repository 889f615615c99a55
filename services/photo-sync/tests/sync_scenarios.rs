use photo_sync::change_feed::FeedHealth;
use photo_sync::compression::CompressionStage;
use photo_sync::config::{CompressionConfig, PollingConfig, ReconcileConfig, UploadConfig};
use photo_sync::memory::{InMemoryBlobStore, InMemoryChangeSource, InMemoryRecordStore};
use photo_sync::model::{SourceFile, TargetDescriptor};
use photo_sync::network::NetworkMonitor;
use photo_sync::reconciler::ReconciledView;
use photo_sync::scheduler::UploadQueueScheduler;
use photo_sync::session::{SessionDeps, SessionRegistry};
use photo_sync::storage_client::StorageClient;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_test::assert_ok;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

struct World {
    source: Arc<InMemoryChangeSource>,
    records: Arc<InMemoryRecordStore>,
    scheduler: UploadQueueScheduler,
    registry: SessionRegistry,
    shutdown: CancellationToken,
}

fn world() -> World {
    let source = Arc::new(InMemoryChangeSource::new());
    let records = Arc::new(InMemoryRecordStore::new());
    let network = NetworkMonitor::default();
    let shutdown = CancellationToken::new();

    let scheduler = UploadQueueScheduler::new(
        UploadConfig {
            max_concurrency: Some(2),
            ..Default::default()
        },
        CompressionStage::new(CompressionConfig::default()),
        StorageClient::new(
            Arc::new(InMemoryBlobStore::new()),
            records.clone(),
            Duration::from_secs(5),
        ),
        network.subscribe(),
        shutdown.clone(),
    );

    let deps = SessionDeps {
        source: source.clone(),
        records: records.clone(),
        scheduler: scheduler.clone(),
        network,
        polling: PollingConfig::default(),
        reconcile: ReconcileConfig::default(),
        handshake_timeout: Duration::from_secs(1),
        fetch_timeout: Duration::from_secs(1),
    };

    World {
        source,
        records,
        scheduler,
        registry: SessionRegistry::new(deps, shutdown.clone()),
        shutdown,
    }
}

async fn wait_for_view(
    view: &mut watch::Receiver<ReconciledView>,
    predicate: impl FnMut(&ReconciledView) -> bool,
) -> ReconciledView {
    let view = tokio::time::timeout(Duration::from_secs(5), view.wait_for(predicate))
        .await
        .expect("view did not converge")
        .expect("reconciler stopped");
    view.clone()
}

async fn wait_for_health(health: &mut watch::Receiver<FeedHealth>, expected: FeedHealth) {
    let _ = tokio::time::timeout(Duration::from_secs(5), health.wait_for(|h| *h == expected))
        .await
        .expect("feed health did not change")
        .expect("feed task stopped");
}

fn remote_row(id: Uuid, business_id: Uuid) -> String {
    format!(
        r#"{{
            "id": "{id}",
            "business_id": "{business_id}",
            "filename": "1705314645000_counter.jpg",
            "original_filename": "counter.jpg",
            "content_hash": "{hash}",
            "storage_path": "{business_id}/completion/basic/interior/1705314645000_counter.jpg",
            "size_bytes": 4096,
            "mime_type": "image/jpeg",
            "facility": "interior",
            "created_at": "2024-01-15T10:30:45Z",
            "updated_at": "2024-01-15T10:30:45Z"
        }}"#,
        hash = "cd".repeat(32)
    )
}

#[tokio::test]
async fn test_session_merges_local_remote_and_deletes() {
    let world = world();
    let business_id = Uuid::new_v4();

    let session = world.registry.session(business_id);
    let mut health = session.feed_health();
    wait_for_health(&mut health, FeedHealth::Connected).await;
    let mut view = session.subscribe();

    // Local upload shows up as soon as it is confirmed
    let ids = assert_ok!(world.scheduler.enqueue(
        vec![SourceFile::new("stall.jpg", "image/jpeg", b"stall front".to_vec())],
        &TargetDescriptor {
            business_id: Some(business_id),
            phase: Some("survey".to_string()),
            category: Some("exterior".to_string()),
            ..Default::default()
        },
    ));
    let local = wait_for_view(&mut view, |v| {
        v.entries
            .first()
            .is_some_and(|e| e.recently_added_until.is_some())
    })
    .await;
    assert_eq!(local.len(), 1);
    let local_id = local.entries[0].record.id;
    assert_eq!(world.scheduler.task(ids[0]).unwrap().record_id, Some(local_id));

    // Remote insert through the change feed
    let remote_id = Uuid::new_v4();
    world.source.push_payload(format!(
        r#"{{"eventType": "INSERT", "new": {}}}"#,
        remote_row(remote_id, business_id)
    ));
    let merged = wait_for_view(&mut view, |v| v.contains(remote_id)).await;
    assert!(merged.contains(local_id));
    assert_eq!(merged.len(), 2);

    // Changes for another business never reach this view
    world.source.push_payload(format!(
        r#"{{"eventType": "INSERT", "new": {}}}"#,
        remote_row(Uuid::new_v4(), Uuid::new_v4())
    ));

    // Remote delete removes the entry despite its protection window
    world.source.push_payload(format!(
        r#"{{"op": "d", "before": {{"id": "{local_id}", "business_id": "{business_id}"}}}}"#
    ));
    let after_delete = wait_for_view(&mut view, |v| !v.contains(local_id)).await;
    assert!(after_delete.contains(remote_id));
    assert_eq!(after_delete.len(), 1);

    assert_eq!(world.records.records().len(), 1);
    world.shutdown.cancel();
}

#[tokio::test]
async fn test_polling_fills_view_when_feed_is_down() {
    let world = world();
    world.source.fail_opens(true);
    let business_id = Uuid::new_v4();

    // Row that exists before the session starts
    let existing = world.scheduler.enqueue(
        vec![SourceFile::new("sign.jpg", "image/jpeg", b"shop sign".to_vec())],
        &TargetDescriptor {
            business_id: Some(business_id),
            phase: Some("completion".to_string()),
            category: Some("signage".to_string()),
            ..Default::default()
        },
    );
    assert_ok!(existing);
    tokio::time::timeout(Duration::from_secs(5), world.scheduler.idle())
        .await
        .unwrap();
    let record_id = world.records.records()[0].id;

    let session = world.registry.session(business_id);
    let mut health = session.feed_health();
    wait_for_health(&mut health, FeedHealth::Error).await;

    let mut view = session.subscribe();
    let polled = wait_for_view(&mut view, |v| v.contains(record_id)).await;
    assert_eq!(polled.len(), 1);
    // Snapshot rows are not "just added"
    assert!(polled.entries[0].recently_added_until.is_none());

    world.shutdown.cancel();
}

#[tokio::test]
async fn test_registry_reuses_and_stops_sessions() {
    let world = world();
    let business_id = Uuid::new_v4();

    let first = world.registry.session(business_id);
    let second = world.registry.session(business_id);
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(first.business_id(), business_id);
    assert_eq!(world.registry.len(), 1);

    let mut health = first.feed_health();
    wait_for_health(&mut health, FeedHealth::Connected).await;

    assert!(world.registry.stop(business_id));
    assert!(!world.registry.stop(business_id));
    assert!(world.registry.is_empty());
    wait_for_health(&mut health, FeedHealth::Closed).await;

    world.registry.session(Uuid::new_v4());
    world.registry.session(Uuid::new_v4());
    assert_eq!(world.registry.len(), 2);
    world.registry.stop_all();
    assert!(world.registry.is_empty());
}
