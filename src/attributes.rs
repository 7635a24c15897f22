//! Attribute & Config Handler (C7): routes cloud-pushed shared/client
//! attribute deliveries either to the owning connector or, for
//! gateway-targeted deliveries, to remote configuration and remote log
//! level handling (spec §4.7).

use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use log::{error, info, warn};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::connector::{CloudTransport, Connector};
use crate::queues::AttributeUpdateItem;
use crate::registry::DeviceRegistry;
use crate::uplink::UplinkGates;

/// Applies a pushed `configuration` shared attribute, the remote-config
/// collaborator named in spec §4.7 and SPEC_FULL §4.6. Applying may trigger
/// a connector reload cycle, which is why the uplink briefly backs off
/// (`UplinkGates::remote_config_applying`) while it runs.
#[async_trait]
pub trait RemoteConfigurator: Send + Sync {
    async fn apply(&self, configuration: Value) -> anyhow::Result<()>;
    async fn current(&self) -> Value;
}

/// Sets the gateway's process-wide log level in response to a pushed
/// `RemoteLoggingLevel` shared attribute.
pub trait RemoteLogHandler: Send + Sync {
    fn set_level(&self, level: &str);
    fn activate(&self);
    fn deactivate(&self);
}

pub struct AttributeHandler {
    registry: Arc<DeviceRegistry<Arc<dyn Connector>>>,
    cloud: Arc<dyn CloudTransport>,
    remote_configurator: Option<Arc<dyn RemoteConfigurator>>,
    log_handler: Option<Arc<dyn RemoteLogHandler>>,
    gates: UplinkGates,
}

impl AttributeHandler {
    pub fn new(
        registry: Arc<DeviceRegistry<Arc<dyn Connector>>>,
        cloud: Arc<dyn CloudTransport>,
        remote_configurator: Option<Arc<dyn RemoteConfigurator>>,
        log_handler: Option<Arc<dyn RemoteLogHandler>>,
        gates: UplinkGates,
    ) -> Self {
        AttributeHandler {
            registry,
            cloud,
            remote_configurator,
            log_handler,
            gates,
        }
    }

    /// Drains cloud-delivered attribute updates until `receiver` closes or
    /// `cancellation` fires, mirroring `ingress::Ingress::run` and
    /// `rpc::RpcDispatcher::run`.
    pub async fn run(
        &self,
        mut receiver: tokio::sync::mpsc::UnboundedReceiver<AttributeUpdateItem>,
        cancellation: CancellationToken,
    ) {
        loop {
            let item = tokio::select! {
                item = receiver.recv() => item,
                _ = cancellation.cancelled() => break,
            };
            let Some(item) = item else { break };
            self.handle(item.content).await;
        }
    }

    pub async fn handle(&self, content: Value) {
        if let Some(device_name) = content.get("device").and_then(Value::as_str) {
            self.forward_to_connector(device_name, content.clone()).await;
            return;
        }

        let shared = content.get("shared").cloned().unwrap_or_else(|| content.clone());

        let configuration = shared
            .get("configuration")
            .or_else(|| content.get("configuration"))
            .cloned();
        if let Some(configuration) = configuration {
            self.apply_configuration(configuration).await;
        }

        if let Some(level) = shared.get("RemoteLoggingLevel").and_then(Value::as_str) {
            self.apply_log_level(level);
        }
    }

    async fn forward_to_connector(&self, device_name: &str, content: Value) {
        match self.registry.get(device_name).await {
            Some(record) => match record.connector {
                Some(connector) => connector.on_attributes_update(content).await,
                None => warn!(
                    "attributes: device '{device_name}' has no live connector (orphaned entry)"
                ),
            },
            None => warn!("attributes: attribute update for unknown device '{device_name}'"),
        }
    }

    async fn apply_configuration(&self, configuration: Value) {
        let Some(configurator) = &self.remote_configurator else {
            warn!("attributes: configuration pushed but no remote configurator is wired up");
            return;
        };

        self.gates.remote_config_applying.store(true, Ordering::Relaxed);
        let result = configurator.apply(configuration).await;
        self.gates.remote_config_applying.store(false, Ordering::Relaxed);

        match result {
            Ok(()) => info!("attributes: remote configuration applied"),
            Err(e) => {
                error!("attributes: remote configuration failed to apply: {e}");
                return;
            }
        }

        let current = configurator.current().await;
        self.cloud
            .send_attributes(serde_json::json!({ "configuration": current }))
            .await;
    }

    fn apply_log_level(&self, level: &str) {
        let Some(handler) = &self.log_handler else {
            warn!("attributes: RemoteLoggingLevel pushed but no log handler is wired up");
            return;
        };

        if level.eq_ignore_ascii_case("NONE") {
            handler.deactivate();
        } else {
            handler.set_level(level);
            handler.activate();
        }
    }
}
