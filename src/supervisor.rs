//! Connection Supervisor (C5): maintains the cloud session, re-subscribes
//! and re-announces every registered device on reconnect, and kicks off the
//! one-time post-reconnect shared-attribute fetch (spec §4.5).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{error, info, warn};

use crate::connector::CloudTransport;
use crate::registry::DeviceRegistry;

pub struct ConnectionSupervisor<C: Clone + Send + Sync + 'static> {
    cloud: Arc<dyn CloudTransport>,
    registry: Arc<DeviceRegistry<C>>,
    was_connected: AtomicBool,
    subscribed: AtomicBool,
    shared_attributes_fetched: AtomicBool,
}

impl<C: Clone + Send + Sync + 'static> ConnectionSupervisor<C> {
    pub fn new(cloud: Arc<dyn CloudTransport>, registry: Arc<DeviceRegistry<C>>) -> Self {
        ConnectionSupervisor {
            cloud,
            registry,
            was_connected: AtomicBool::new(false),
            subscribed: AtomicBool::new(false),
            shared_attributes_fetched: AtomicBool::new(false),
        }
    }

    /// Defensive disconnect-then-connect and initial subscription, run once
    /// before the main loop starts (spec §4.5 "At startup").
    pub async fn start(&self) {
        if let Err(e) = self.cloud.disconnect().await {
            warn!("supervisor: defensive disconnect failed: {e}");
        }
        if let Err(e) = self.cloud.connect().await {
            error!("supervisor: initial connect failed: {e}");
            return;
        }
        if let Err(e) = self.cloud.subscribe_service_topics().await {
            error!("supervisor: initial subscribe failed: {e}");
            return;
        }
        self.subscribed.store(true, Ordering::Relaxed);
        self.was_connected
            .store(self.cloud.is_connected(), Ordering::Relaxed);
    }

    /// One reconciliation step of the main loop (spec §4.8 items 1 and 4).
    /// Returns `true` if this tick did any work, so the scheduler can skip
    /// its fallback sleep.
    pub async fn tick(&self) -> bool {
        let connected = self.cloud.is_connected();
        let was_connected = self.was_connected.swap(connected, Ordering::Relaxed);
        let mut did_work = false;

        if was_connected && !connected {
            self.subscribed.store(false, Ordering::Relaxed);
            did_work = true;
        } else if !was_connected && connected {
            self.reannounce_devices().await;
            if let Err(e) = self.cloud.subscribe_service_topics().await {
                error!("supervisor: re-subscribe after reconnect failed: {e}");
            } else {
                self.subscribed.store(true, Ordering::Relaxed);
            }
            did_work = true;
        }

        if connected
            && self.subscribed.load(Ordering::Relaxed)
            && self.cloud.subscriptions_settled()
            && !self.shared_attributes_fetched.load(Ordering::Relaxed)
        {
            match self.cloud.request_attributes().await {
                Ok(()) => self.shared_attributes_fetched.store(true, Ordering::Relaxed),
                Err(e) => warn!("supervisor: shared-attribute fetch failed: {e}"),
            }
            did_work = true;
        }

        did_work
    }

    async fn reannounce_devices(&self) {
        for record in self.registry.all().await {
            self.cloud
                .gw_connect_device(&record.name, &record.device_type)
                .await;
        }
        info!("supervisor: re-announced registry to the cloud after reconnect");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::{ImmediateToken, PublishToken, QualityOfService};
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct FakeCloud {
        connected: AtomicBool,
        settled: AtomicBool,
        announced: Mutex<Vec<String>>,
        subscribe_calls: StdMutex<u32>,
        request_attributes_calls: StdMutex<u32>,
    }

    #[async_trait]
    impl CloudTransport for FakeCloud {
        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::Relaxed)
        }
        fn quality_of_service(&self) -> QualityOfService {
            QualityOfService::AtLeastOnce
        }
        async fn connect(&self) -> anyhow::Result<()> {
            self.connected.store(true, Ordering::Relaxed);
            Ok(())
        }
        async fn disconnect(&self) -> anyhow::Result<()> {
            self.connected.store(false, Ordering::Relaxed);
            Ok(())
        }
        async fn stop(&self) -> anyhow::Result<()> {
            Ok(())
        }
        async fn subscribe_service_topics(&self) -> anyhow::Result<()> {
            *self.subscribe_calls.lock().unwrap() += 1;
            Ok(())
        }
        fn subscriptions_settled(&self) -> bool {
            self.settled.load(Ordering::Relaxed)
        }
        async fn send_telemetry(&self, _payload: Value) -> Box<dyn PublishToken> {
            Box::new(ImmediateToken)
        }
        async fn send_attributes(&self, _payload: Value) -> Box<dyn PublishToken> {
            Box::new(ImmediateToken)
        }
        async fn gw_send_telemetry(&self, _device: &str, _payload: Value) -> Box<dyn PublishToken> {
            Box::new(ImmediateToken)
        }
        async fn gw_send_attributes(&self, _device: &str, _payload: Value) -> Box<dyn PublishToken> {
            Box::new(ImmediateToken)
        }
        async fn gw_connect_device(&self, name: &str, _device_type: &str) {
            self.announced.lock().await.push(name.to_string());
        }
        async fn gw_disconnect_device(&self, _name: &str) {}
        async fn send_rpc_reply(
            &self,
            _request_id: &str,
            _content: Value,
            _qos: QualityOfService,
            _wait_for_publish: bool,
        ) {
        }
        async fn gw_send_rpc_reply(
            &self,
            _device: &str,
            _request_id: &str,
            _content: Value,
            _qos: QualityOfService,
        ) {
        }
        async fn request_attributes(&self) -> anyhow::Result<()> {
            *self.request_attributes_calls.lock().unwrap() += 1;
            Ok(())
        }
    }

    #[tokio::test]
    async fn reconnect_reannounces_every_registered_device_exactly_once() {
        crate::test_log::init();
        let dir = tempfile::tempdir().unwrap();
        let registry: Arc<DeviceRegistry<u32>> = Arc::new(DeviceRegistry::new(dir.path()));
        registry.add("d1", "c1", 1, "default").await.unwrap();
        registry.add("d2", "c1", 1, "default").await.unwrap();

        let cloud = Arc::new(FakeCloud::default());
        let supervisor = ConnectionSupervisor::new(cloud.clone(), registry);

        cloud.connect().await.unwrap();
        supervisor.tick().await;

        let announced = cloud.announced.lock().await.clone();
        assert_eq!(announced.len(), 2);
        assert!(announced.contains(&"d1".to_string()));
        assert!(announced.contains(&"d2".to_string()));

        // A further tick with no state change re-announces nothing more.
        supervisor.tick().await;
        assert_eq!(cloud.announced.lock().await.len(), 2);
    }

    #[tokio::test]
    async fn shared_attributes_are_fetched_once_settled_after_reconnect() {
        let dir = tempfile::tempdir().unwrap();
        let registry: Arc<DeviceRegistry<u32>> = Arc::new(DeviceRegistry::new(dir.path()));
        let cloud = Arc::new(FakeCloud::default());
        let supervisor = ConnectionSupervisor::new(cloud.clone(), registry);

        cloud.connect().await.unwrap();
        cloud.settled.store(true, Ordering::Relaxed);

        supervisor.tick().await;
        supervisor.tick().await;

        assert_eq!(*cloud.request_attributes_calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn disconnect_clears_subscribed_flag() {
        let dir = tempfile::tempdir().unwrap();
        let registry: Arc<DeviceRegistry<u32>> = Arc::new(DeviceRegistry::new(dir.path()));
        let cloud = Arc::new(FakeCloud::default());
        let supervisor = ConnectionSupervisor::new(cloud.clone(), registry);

        cloud.connect().await.unwrap();
        supervisor.tick().await;
        assert!(supervisor.subscribed.load(Ordering::Relaxed));

        cloud.disconnect().await.unwrap();
        supervisor.tick().await;
        assert!(!supervisor.subscribed.load(Ordering::Relaxed));
    }
}
