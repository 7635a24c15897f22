//! Statistics (spec §4.8 item 5). The core owns only the scheduling; the
//! shape of a snapshot is delegated to an injected collaborator, keeping
//! schema concerns out of the worker loop rather than baking a fixed
//! payload shape into it.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};

use crate::ingress::ConnectorCounters;
use crate::registry::DeviceRegistry;

/// Produces the opaque payload published as gateway attributes every
/// `statsSendPeriodInSeconds` and returned by the `gateway_stats` RPC.
#[async_trait]
pub trait StatisticsCollector: Send + Sync {
    async fn snapshot(&self) -> Value;
}

/// The default collector: uptime, per-connector message counts, and
/// registry size, all quantities already tracked elsewhere in the core.
pub struct CoreStatistics<C: Clone + Send + Sync + 'static> {
    started_at: Instant,
    counters: Arc<ConnectorCounters>,
    registry: Arc<DeviceRegistry<C>>,
}

impl<C: Clone + Send + Sync + 'static> CoreStatistics<C> {
    pub fn new(counters: Arc<ConnectorCounters>, registry: Arc<DeviceRegistry<C>>) -> Self {
        CoreStatistics {
            started_at: Instant::now(),
            counters,
            registry,
        }
    }
}

#[async_trait]
impl<C: Clone + Send + Sync + 'static> StatisticsCollector for CoreStatistics<C> {
    async fn snapshot(&self) -> Value {
        json!({
            "generatedAt": Utc::now().to_rfc3339(),
            "uptimeSeconds": self.started_at.elapsed().as_secs(),
            "devicesConnected": self.registry.snapshot().await.len(),
            "messagesReceivedByConnector": self.counters.snapshot().await,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn snapshot_reports_registry_size_and_counters() {
        crate::test_log::init();
        let dir = tempfile::tempdir().unwrap();
        let registry: Arc<DeviceRegistry<u32>> = Arc::new(DeviceRegistry::new(dir.path()));
        registry.add("d1", "c1", 1, "default").await.unwrap();
        let counters = Arc::new(ConnectorCounters::new());

        let stats = CoreStatistics::new(counters, registry);
        let snapshot = stats.snapshot().await;
        assert_eq!(snapshot["devicesConnected"], json!(1));
    }
}
