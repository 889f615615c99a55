use crate::bus::{EventBus, SyncEvent};
use crate::config::KafkaConfig;
use crate::model::{ChangeEvent, FacilityAssociation, FileRecord};
use anyhow::Context;
use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, StreamExt};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::Message;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Connection state of a change feed subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedHealth {
    Connecting,
    Connected,
    Error,
    /// Handshake timed out, stream ended, or unsubscribed
    Closed,
}

impl FeedHealth {
    pub fn is_healthy(self) -> bool {
        self == FeedHealth::Connected
    }
}

#[derive(Debug, Error)]
pub enum SubscriptionError {
    #[error("subscribe handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    #[error("change feed transport error: {0}")]
    Transport(String),

    #[error("undecodable change payload: {0}")]
    Decode(String),
}

/// Raw change payloads for one business scope.
pub type PayloadStream = BoxStream<'static, Result<Vec<u8>, SubscriptionError>>;

/// Transport behind a change feed subscription
#[async_trait]
pub trait ChangeSource: Send + Sync {
    /// Connect and return the payload stream. Returning means the
    /// handshake completed.
    async fn open(&self, business_id: Uuid) -> Result<PayloadStream, SubscriptionError>;
}

/// Change source reading row notifications from a Kafka topic keyed by
/// business id.
pub struct KafkaChangeSource {
    config: KafkaConfig,
}

impl KafkaChangeSource {
    pub fn new(config: KafkaConfig) -> Self {
        Self { config }
    }

    fn client_config(&self, business_id: Uuid) -> ClientConfig {
        let config = &self.config;
        let mut client_config = ClientConfig::new();

        // Every subscription sees every change for its scope, so each one
        // joins its own group and starts at the head of the topic.
        client_config
            .set("bootstrap.servers", &config.bootstrap_servers)
            .set(
                "group.id",
                format!("{}-{}-{}", config.consumer_group, business_id, Uuid::new_v4()),
            )
            .set("auto.offset.reset", "latest")
            .set("enable.auto.commit", "true")
            .set("session.timeout.ms", config.session_timeout_ms.to_string());

        if config.ssl_enabled {
            client_config.set("security.protocol", "SASL_SSL");
            if let Some(ref ca_location) = config.ssl_ca_location {
                client_config.set("ssl.ca.location", ca_location);
            }
        }

        if let (Some(ref username), Some(ref password)) =
            (&config.sasl_username, &config.sasl_password)
        {
            client_config
                .set("sasl.mechanisms", "PLAIN")
                .set("sasl.username", username)
                .set("sasl.password", password);
        }

        client_config
    }

    fn create_consumer(&self, business_id: Uuid) -> anyhow::Result<StreamConsumer> {
        let consumer: StreamConsumer = self
            .client_config(business_id)
            .create()
            .context("Failed to create Kafka consumer")?;
        consumer
            .subscribe(&[&self.config.change_topic])
            .context("Failed to subscribe to change topic")?;
        Ok(consumer)
    }
}

#[async_trait]
impl ChangeSource for KafkaChangeSource {
    #[instrument(skip(self))]
    async fn open(&self, business_id: Uuid) -> Result<PayloadStream, SubscriptionError> {
        let consumer = Arc::new(
            self.create_consumer(business_id)
                .map_err(|e| SubscriptionError::Transport(format!("{e:#}")))?,
        );

        // Metadata fetch blocks on the broker round trip
        let handshake_timeout = Duration::from_millis(self.config.handshake_timeout_ms);
        let topic = self.config.change_topic.clone();
        let metadata_client = consumer.clone();
        let handshake = tokio::task::spawn_blocking(move || {
            metadata_client
                .fetch_metadata(Some(&topic), handshake_timeout)
                .map(|_| ())
        });
        match tokio::time::timeout(handshake_timeout, handshake).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => return Err(SubscriptionError::Transport(e.to_string())),
            Ok(Err(e)) => return Err(SubscriptionError::Transport(e.to_string())),
            Err(_) => return Err(SubscriptionError::HandshakeTimeout(handshake_timeout)),
        }

        info!(
            topic = %self.config.change_topic,
            business_id = %business_id,
            "Subscribed to change topic"
        );

        let key = business_id.to_string();
        let stream = futures::stream::unfold(consumer, move |consumer| {
            let key = key.clone();
            async move {
                let item = loop {
                    match consumer.recv().await {
                        Ok(message) => {
                            if message.key() != Some(key.as_bytes()) {
                                continue;
                            }
                            match message.payload() {
                                Some(payload) => break Ok(payload.to_vec()),
                                None => continue,
                            }
                        }
                        Err(e) => break Err(SubscriptionError::Transport(e.to_string())),
                    }
                };
                Some((item, consumer))
            }
        });

        Ok(stream.boxed())
    }
}

/// Row as it appears inside a change payload. Deletes usually carry only
/// the key columns.
#[derive(Debug, Default, Deserialize)]
struct RawRow {
    id: Option<Uuid>,
    business_id: Option<Uuid>,
    filename: Option<String>,
    original_filename: Option<String>,
    content_hash: Option<String>,
    storage_path: Option<String>,
    size_bytes: Option<i64>,
    mime_type: Option<String>,
    upload_status: Option<String>,
    facility: Option<FacilityAssociation>,
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
}

impl RawRow {
    fn into_record(self) -> Result<FileRecord, SubscriptionError> {
        fn required<T>(value: Option<T>, field: &str) -> Result<T, SubscriptionError> {
            value.ok_or_else(|| SubscriptionError::Decode(format!("row is missing {field}")))
        }

        let filename = required(self.filename, "filename")?;
        let created_at = required(self.created_at, "created_at")?;
        Ok(FileRecord {
            id: required(self.id, "id")?,
            business_id: required(self.business_id, "business_id")?,
            original_filename: self.original_filename.unwrap_or_else(|| filename.clone()),
            filename,
            content_hash: required(self.content_hash, "content_hash")?,
            storage_path: required(self.storage_path, "storage_path")?,
            size_bytes: self.size_bytes.unwrap_or_default(),
            mime_type: self
                .mime_type
                .unwrap_or_else(|| "application/octet-stream".to_string()),
            upload_status: self.upload_status.unwrap_or_else(|| "uploaded".to_string()),
            facility: required(self.facility, "facility")?,
            created_at,
            updated_at: self.updated_at.unwrap_or(created_at),
        })
    }
}

/// Either payload dialect; unused fields stay `None`.
#[derive(Debug, Deserialize)]
struct RawPayload {
    #[serde(rename = "eventType", alias = "type")]
    event_type: Option<String>,
    #[serde(alias = "record")]
    new: Option<RawRow>,
    #[serde(alias = "old_record")]
    old: Option<RawRow>,
    op: Option<String>,
    after: Option<RawRow>,
    before: Option<RawRow>,
}

fn delete_event(row: Option<RawRow>) -> Result<ChangeEvent, SubscriptionError> {
    let row = row.unwrap_or_default();
    let id = row
        .id
        .ok_or_else(|| SubscriptionError::Decode("delete without id".to_string()))?;
    Ok(ChangeEvent::Delete {
        id,
        business_id: row.business_id,
    })
}

fn row_event(
    row: Option<RawRow>,
    wrap: fn(FileRecord) -> ChangeEvent,
) -> Result<ChangeEvent, SubscriptionError> {
    let row = row.ok_or_else(|| SubscriptionError::Decode("change without row".to_string()))?;
    Ok(wrap(row.into_record()?))
}

/// Decode a provider payload into a [`ChangeEvent`].
///
/// Returns `Ok(None)` for changes that belong to another business scope.
pub fn normalize_payload(
    payload: &[u8],
    business_id: Uuid,
) -> Result<Option<ChangeEvent>, SubscriptionError> {
    let raw: RawPayload =
        serde_json::from_slice(payload).map_err(|e| SubscriptionError::Decode(e.to_string()))?;

    let event = match (raw.event_type.as_deref(), raw.op.as_deref()) {
        (Some(kind), _) => match kind.to_ascii_uppercase().as_str() {
            "INSERT" => row_event(raw.new, ChangeEvent::Insert)?,
            "UPDATE" => row_event(raw.new, ChangeEvent::Update)?,
            "DELETE" => delete_event(raw.old)?,
            other => {
                return Err(SubscriptionError::Decode(format!("unknown event type {other}")));
            }
        },
        (None, Some(op)) => match op {
            "c" | "r" => row_event(raw.after, ChangeEvent::Insert)?,
            "u" => row_event(raw.after, ChangeEvent::Update)?,
            "d" => delete_event(raw.before)?,
            other => return Err(SubscriptionError::Decode(format!("unknown op {other}"))),
        },
        (None, None) => {
            return Err(SubscriptionError::Decode("payload has no event type".to_string()));
        }
    };

    if event.business_id().is_some_and(|b| b != business_id) {
        return Ok(None);
    }
    Ok(Some(event))
}

/// Live subscription for one business scope. Dropping it unsubscribes.
pub struct Subscription {
    business_id: Uuid,
    health: watch::Receiver<FeedHealth>,
    cancel: CancellationToken,
}

impl Subscription {
    pub fn business_id(&self) -> Uuid {
        self.business_id
    }

    pub fn health(&self) -> watch::Receiver<FeedHealth> {
        self.health.clone()
    }

    pub fn unsubscribe(&self) {
        self.cancel.cancel();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[derive(Debug, Clone)]
pub struct ChangeFeedSubscriber {
    handshake_timeout: Duration,
    reconnect_initial: Duration,
    reconnect_max: Duration,
}

impl ChangeFeedSubscriber {
    pub fn new(handshake_timeout: Duration) -> Self {
        Self {
            handshake_timeout,
            reconnect_initial: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(60),
        }
    }

    /// Start receiving changes for `business_id` into `bus`. The feed
    /// reconnects with backoff until unsubscribed or `shutdown` fires.
    pub fn subscribe(
        &self,
        business_id: Uuid,
        source: Arc<dyn ChangeSource>,
        bus: EventBus,
        shutdown: &CancellationToken,
    ) -> Subscription {
        let (health_tx, health) = watch::channel(FeedHealth::Connecting);
        let cancel = shutdown.child_token();

        let feed = FeedTask {
            business_id,
            source,
            bus,
            health: health_tx,
            cancel: cancel.clone(),
            settings: self.clone(),
        };
        tokio::spawn(feed.run());

        Subscription {
            business_id,
            health,
            cancel,
        }
    }
}

struct FeedTask {
    business_id: Uuid,
    source: Arc<dyn ChangeSource>,
    bus: EventBus,
    health: watch::Sender<FeedHealth>,
    cancel: CancellationToken,
    settings: ChangeFeedSubscriber,
}

impl FeedTask {
    fn set_health(&self, health: FeedHealth) {
        let changed = self.health.send_if_modified(|current| {
            let changed = *current != health;
            *current = health;
            changed
        });
        if changed {
            info!(business_id = %self.business_id, health = ?health, "Change feed health changed");
        }
    }

    #[instrument(skip_all, fields(business_id = %self.business_id))]
    async fn run(self) {
        let mut backoff = ExponentialBackoff {
            initial_interval: self.settings.reconnect_initial,
            max_interval: self.settings.reconnect_max,
            max_elapsed_time: None,
            ..Default::default()
        };
        backoff.reset();

        loop {
            let received_any = match self.connect_and_consume().await {
                Some(received_any) => received_any,
                None => break,
            };
            if received_any {
                backoff.reset();
            }

            let delay = backoff.next_backoff().unwrap_or(self.settings.reconnect_max);
            debug!(delay_ms = delay.as_millis() as u64, "Reconnecting change feed");
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
            self.set_health(FeedHealth::Connecting);
        }

        self.set_health(FeedHealth::Closed);
    }

    /// One connection lifetime. `None` means stop for good; otherwise
    /// whether any payload arrived before the connection dropped.
    async fn connect_and_consume(&self) -> Option<bool> {
        let timeout = self.settings.handshake_timeout;
        let opened = tokio::select! {
            _ = self.cancel.cancelled() => return None,
            opened = tokio::time::timeout(timeout, self.source.open(self.business_id)) => opened,
        };

        let mut stream = match opened {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                warn!(error = %e, "Change feed subscribe failed");
                metrics::counter!("photo_sync.feed.errors").increment(1);
                let health = match e {
                    SubscriptionError::HandshakeTimeout(_) => FeedHealth::Closed,
                    _ => FeedHealth::Error,
                };
                self.set_health(health);
                return Some(false);
            }
            Err(_) => {
                warn!(timeout_ms = timeout.as_millis() as u64, "Change feed handshake timed out");
                metrics::counter!("photo_sync.feed.errors").increment(1);
                self.set_health(FeedHealth::Closed);
                return Some(false);
            }
        };

        self.set_health(FeedHealth::Connected);
        let mut received_any = false;

        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => return None,
                next = stream.next() => next,
            };

            match next {
                Some(Ok(payload)) => {
                    received_any = true;
                    self.set_health(FeedHealth::Connected);
                    match normalize_payload(&payload, self.business_id) {
                        Ok(Some(event)) => {
                            debug!(kind = event.kind(), record_id = %event.id(), "Change received");
                            metrics::counter!("photo_sync.feed.events").increment(1);
                            if !self.bus.publish(SyncEvent::Remote(event)).await {
                                return None;
                            }
                        }
                        Ok(None) => {
                            debug!("Change for another business scope ignored");
                        }
                        Err(e) => {
                            warn!(error = %e, "Skipping undecodable change payload");
                            metrics::counter!("photo_sync.feed.decode_errors").increment(1);
                        }
                    }
                }
                Some(Err(e)) => {
                    warn!(error = %e, "Change feed error");
                    metrics::counter!("photo_sync.feed.errors").increment(1);
                    self.set_health(FeedHealth::Error);
                }
                None => {
                    info!("Change feed stream ended");
                    self.set_health(FeedHealth::Closed);
                    return Some(received_any);
                }
            }
        }
    }
}
