//! Typed channel feeding a business scope's reconciler.

use crate::model::{ChangeEvent, FileRecord};
use tokio::sync::mpsc;
use tracing::debug;

/// Everything the reconciler can be told about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// A local upload (or duplicate match) confirmed by the server
    LocalConfirmed(FileRecord),
    /// Pushed by the change feed
    Remote(ChangeEvent),
    /// Full refetch from the poller
    Snapshot(Vec<FileRecord>),
}

impl SyncEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            SyncEvent::LocalConfirmed(_) => "local",
            SyncEvent::Remote(event) => event.kind(),
            SyncEvent::Snapshot(_) => "snapshot",
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: mpsc::Sender<SyncEvent>,
}

impl EventBus {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<SyncEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Returns `false` once the receiving side is gone.
    pub async fn publish(&self, event: SyncEvent) -> bool {
        let kind = event.kind();
        match self.tx.send(event).await {
            Ok(()) => true,
            Err(_) => {
                debug!(kind, "Sync bus closed, dropping event");
                false
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
