//! Client network conditions, shared by the upload queue (concurrency bound)
//! and the polling fallback (interval).

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// Effective connection type as reported by the client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkTier {
    #[serde(rename = "slow-2g")]
    Slow2g,
    #[serde(rename = "2g")]
    TwoG,
    #[serde(rename = "3g")]
    ThreeG,
    #[serde(rename = "4g")]
    FourG,
    #[default]
    #[serde(rename = "unknown")]
    Unknown,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceClass {
    Mobile,
    #[default]
    Desktop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConditions {
    pub online: bool,
    #[serde(default)]
    pub tier: NetworkTier,
    #[serde(default)]
    pub device: DeviceClass,
}

impl NetworkConditions {
    pub fn online(tier: NetworkTier, device: DeviceClass) -> Self {
        Self {
            online: true,
            tier,
            device,
        }
    }

    /// Concurrency bound for uploads under these conditions (2-8).
    pub fn adaptive_concurrency(&self) -> usize {
        if !self.online {
            return 2;
        }
        match (self.tier, self.device) {
            (NetworkTier::Slow2g | NetworkTier::TwoG, _) => 2,
            (NetworkTier::ThreeG, _) => 4,
            (NetworkTier::FourG, DeviceClass::Desktop) => 8,
            (NetworkTier::FourG, DeviceClass::Mobile) => 6,
            (NetworkTier::Unknown, _) => 4,
        }
    }
}

impl Default for NetworkConditions {
    fn default() -> Self {
        Self::online(NetworkTier::Unknown, DeviceClass::Desktop)
    }
}

/// Owner of the current network conditions.
#[derive(Debug, Clone)]
pub struct NetworkMonitor {
    tx: Arc<watch::Sender<NetworkConditions>>,
}

impl NetworkMonitor {
    pub fn new(initial: NetworkConditions) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    pub fn current(&self) -> NetworkConditions {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<NetworkConditions> {
        self.tx.subscribe()
    }

    /// Record new conditions. Watchers are only woken when something changed.
    pub fn report(&self, conditions: NetworkConditions) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == conditions {
                false
            } else {
                *current = conditions;
                true
            }
        });

        if changed {
            info!(
                online = conditions.online,
                tier = ?conditions.tier,
                device = ?conditions.device,
                "Network conditions changed"
            );
        }
    }
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new(NetworkConditions::default())
    }
}
