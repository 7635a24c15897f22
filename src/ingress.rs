//! Ingress Pipeline (C3): the single consumer that drains the ingress queue
//! fed by `Connector::send_to_storage`, validates and normalizes each
//! record, and durably enqueues it to storage (spec §4.3).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, error, warn};
use tokio_util::sync::CancellationToken;

use crate::connector::{Connector, ConnectorHost};
use crate::event::{ConvertedData, StoredEvent};
use crate::queues::IngressItem;
use crate::registry::DeviceRegistry;
use crate::storage::EventStorage;
use crate::utils::{now_ms, SELF_DEVICE_NAME};

/// Per-connector submitted-message counters, read by the statistics
/// component (spec §4.3 step 4).
#[derive(Default)]
pub struct ConnectorCounters {
    counts: tokio::sync::Mutex<HashMap<String, u64>>,
}

impl ConnectorCounters {
    pub fn new() -> Self {
        ConnectorCounters::default()
    }

    async fn increment(&self, connector_name: &str) {
        let mut counts = self.counts.lock().await;
        *counts.entry(connector_name.to_string()).or_insert(0) += 1;
    }

    pub async fn snapshot(&self) -> HashMap<String, u64> {
        self.counts.lock().await.clone()
    }
}

/// Whether the cloud session is currently connected, consulted at ingress
/// step 3 to decide if an unknown device may be auto-registered.
pub trait ConnectionState: Send + Sync {
    fn is_connected(&self) -> bool;
}

pub struct Ingress {
    gateway_name: String,
    registry: Arc<DeviceRegistry<Arc<dyn Connector>>>,
    connectors: Arc<ConnectorHost>,
    storage: Arc<dyn EventStorage>,
    connection: Arc<dyn ConnectionState>,
    counters: Arc<ConnectorCounters>,
    dropped_invalid: AtomicU64,
    dropped_rejected: AtomicU64,
}

impl Ingress {
    pub fn new(
        gateway_name: String,
        registry: Arc<DeviceRegistry<Arc<dyn Connector>>>,
        connectors: Arc<ConnectorHost>,
        storage: Arc<dyn EventStorage>,
        connection: Arc<dyn ConnectionState>,
        counters: Arc<ConnectorCounters>,
    ) -> Self {
        Ingress {
            gateway_name,
            registry,
            connectors,
            storage,
            connection,
            counters,
            dropped_invalid: AtomicU64::new(0),
            dropped_rejected: AtomicU64::new(0),
        }
    }

    pub fn dropped_invalid(&self) -> u64 {
        self.dropped_invalid.load(Ordering::Relaxed)
    }

    pub fn dropped_rejected(&self) -> u64 {
        self.dropped_rejected.load(Ordering::Relaxed)
    }

    /// Drains `receiver` until it is closed or `cancellation` fires,
    /// running steps 1-6 of spec §4.3 for each item.
    pub async fn run(
        &self,
        mut receiver: tokio::sync::mpsc::UnboundedReceiver<IngressItem>,
        cancellation: CancellationToken,
    ) {
        loop {
            let item = tokio::select! {
                item = receiver.recv() => item,
                _ = cancellation.cancelled() => break,
            };
            let Some(item) = item else { break };
            self.process(item).await;
        }
    }

    async fn process(&self, item: IngressItem) {
        let IngressItem {
            connector_name,
            data,
        } = item;

        let mut data: ConvertedData = match serde_json::from_value(data) {
            Ok(data) => data,
            Err(e) => {
                warn!("ingress: malformed payload from '{connector_name}': {e}");
                self.dropped_invalid.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        let is_self = connector_name == self.gateway_name;
        if is_self {
            data.device_name = SELF_DEVICE_NAME.to_string();
        } else if !data.is_valid() {
            warn!(
                "ingress: dropping invalid record from '{connector_name}' (missing deviceName or payload)"
            );
            self.dropped_invalid.fetch_add(1, Ordering::Relaxed);
            return;
        }

        // The gateway's own self-identity bypasses the device registry
        // entirely (spec §3): it is published on the gateway's own session,
        // never as a child device.
        if !is_self
            && !self.registry.contains(&data.device_name).await
            && self.connection.is_connected()
        {
            match self.connectors.by_name(&connector_name) {
                Some(connector) => {
                    match self
                        .registry
                        .add(&data.device_name, &connector_name, connector, &data.device_type)
                        .await
                    {
                        Ok(true) => debug!("ingress: auto-registered device '{}'", data.device_name),
                        Ok(false) => {}
                        Err(e) => warn!("ingress: failed to persist auto-registered device: {e}"),
                    }
                }
                None => warn!(
                    "ingress: cannot auto-register '{}', unknown connector '{connector_name}'",
                    data.device_name
                ),
            }
        }

        self.counters.increment(&connector_name).await;

        let event = StoredEvent::normalize(data, now_ms());
        let bytes = match event.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("ingress: failed to serialize normalized event: {e}");
                self.dropped_invalid.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        match self.storage.put(bytes).await {
            Ok(true) => {}
            Ok(false) => {
                error!(
                    "ingress: storage rejected event for device '{}' (capacity exhausted)",
                    event.device_name
                );
                self.dropped_rejected.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                error!("ingress: storage error for device '{}': {e}", event.device_name);
                self.dropped_rejected.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}
