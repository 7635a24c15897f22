//! Uplink Pipeline (C4): drains storage and publishes to the cloud,
//! flushing per-device accumulators once they approach `maxPayloadSizeBytes`
//! and deferring the storage commit until every publish in the pack has
//! been acknowledged (spec §4.4).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, warn};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::connector::{CloudTransport, QualityOfService};
use crate::event::{StoredEvent, TelemetryEntry};
use crate::queues::{published_events_channel, PublishedEventsSender};
use crate::storage::EventStorage;
use crate::utils::SELF_DEVICE_NAME;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const RPC_YIELD_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Default)]
struct DeviceAccumulator {
    telemetry: Vec<TelemetryEntry>,
    attributes: HashMap<String, Value>,
}

/// Shared with the RPC dispatcher (§4.6) and the attribute/config handler
/// (§4.7): set while a reply is mid-publish or a remote config is being
/// applied, so the uplink backs off rather than racing those publishes.
#[derive(Clone, Default)]
pub struct UplinkGates {
    pub rpc_reply_in_flight: Arc<AtomicBool>,
    pub remote_config_applying: Arc<AtomicBool>,
}

pub struct Uplink {
    storage: Arc<dyn EventStorage>,
    cloud: Arc<dyn CloudTransport>,
    gates: UplinkGates,
    max_payload_size_bytes: usize,
    min_pack_send_delay_ms: u64,
}

impl Uplink {
    pub fn new(
        storage: Arc<dyn EventStorage>,
        cloud: Arc<dyn CloudTransport>,
        gates: UplinkGates,
        max_payload_size_bytes: usize,
        min_pack_send_delay_ms: u64,
    ) -> Self {
        Uplink {
            storage,
            cloud,
            gates,
            max_payload_size_bytes,
            min_pack_send_delay_ms,
        }
    }

    pub async fn run(&self, cancellation: CancellationToken) {
        loop {
            if cancellation.is_cancelled() {
                break;
            }

            if !self.cloud.is_connected() || self.gates.remote_config_applying.load(Ordering::Relaxed)
            {
                tokio::select! {
                    _ = tokio::time::sleep(POLL_INTERVAL) => {}
                    _ = cancellation.cancelled() => break,
                }
                continue;
            }

            while self.gates.rpc_reply_in_flight.load(Ordering::Relaxed) {
                tokio::time::sleep(RPC_YIELD_INTERVAL).await;
            }

            let raw_pack = match self.storage.get_event_pack().await {
                Ok(pack) => pack,
                Err(e) => {
                    error!("uplink: failed to check out event pack: {e}");
                    tokio::time::sleep(POLL_INTERVAL).await;
                    continue;
                }
            };

            if raw_pack.is_empty() {
                tokio::time::sleep(POLL_INTERVAL).await;
                continue;
            }

            let all_acked = self.dispatch_pack(raw_pack).await;
            if all_acked {
                if let Err(e) = self.storage.event_pack_processing_done().await {
                    error!("uplink: failed to commit processed event pack: {e}");
                }
            } else {
                debug!("uplink: pack abandoned, will be re-checked-out");
            }

            tokio::time::sleep(Duration::from_millis(self.min_pack_send_delay_ms)).await;
        }
    }

    /// Folds `raw_pack` into per-device accumulators, flushing via
    /// `send_pack` whenever the running byte total crosses
    /// `maxPayloadSizeBytes`, then drains the resulting completion tokens.
    /// Returns whether every publish in the pack succeeded.
    async fn dispatch_pack(&self, raw_pack: Vec<Vec<u8>>) -> bool {
        let (tx, mut rx) = published_events_channel();
        let mut accumulator: HashMap<String, DeviceAccumulator> = HashMap::new();
        let mut approx_bytes = 0usize;

        for raw in &raw_pack {
            let event = match StoredEvent::from_bytes(raw) {
                Ok(event) => event,
                Err(e) => {
                    warn!("uplink: dropping unparsable stored event: {e}");
                    continue;
                }
            };

            approx_bytes += raw.len();
            let entry = accumulator.entry(event.device_name.clone()).or_default();
            entry.telemetry.extend(event.telemetry);
            entry.attributes.extend(event.attributes);

            if approx_bytes >= self.max_payload_size_bytes {
                self.send_pack(std::mem::take(&mut accumulator), &tx).await;
                approx_bytes = 0;
            }
        }
        if !accumulator.is_empty() {
            self.send_pack(accumulator, &tx).await;
        }
        drop(tx);

        let mut all_acked = true;
        while let Some(token) = rx.recv().await {
            if !self.cloud.is_connected() {
                all_acked = false;
                break;
            }
            if self.cloud.quality_of_service() == QualityOfService::AtLeastOnce {
                if !token.wait().await {
                    all_acked = false;
                    break;
                }
            }
        }
        all_acked
    }

    async fn send_pack(
        &self,
        accumulator: HashMap<String, DeviceAccumulator>,
        tx: &PublishedEventsSender,
    ) {
        for (device_name, bundle) in accumulator {
            let is_self = device_name == SELF_DEVICE_NAME;

            if !bundle.attributes.is_empty() {
                let payload = json!(bundle.attributes);
                let token = if is_self {
                    self.cloud.send_attributes(payload).await
                } else {
                    self.cloud.gw_send_attributes(&device_name, payload).await
                };
                let _ = tx.send(token);
            }

            if !bundle.telemetry.is_empty() {
                let payload = json!(bundle.telemetry);
                let token = if is_self {
                    self.cloud.send_telemetry(payload).await
                } else {
                    self.cloud.gw_send_telemetry(&device_name, payload).await
                };
                let _ = tx.send(token);
            }
        }
    }
}
