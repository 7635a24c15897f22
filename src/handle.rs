//! The reverse-direction surface a `Connector` calls back into (spec §5:
//! "Connectors may originate calls to `sendToStorage`, `addDevice`,
//! `sendRpcReply`, and `rpcWithReplyProcessing` from arbitrary threads").
//! A `ConnectorLoader` receives one of these at `load_connectors` time and
//! is expected to clone it into whatever connector instances it constructs.

use std::sync::Arc;

use serde_json::Value;

use crate::connector::{CloudTransport, Connector, ConnectorHost};
use crate::queues::IngressItem;
use crate::registry::DeviceRegistry;
use crate::rpc::RpcDispatcher;

#[derive(Clone)]
pub struct GatewayHandle {
    pub(crate) gateway_name: Arc<str>,
    pub(crate) ingress_tx: tokio::sync::mpsc::UnboundedSender<IngressItem>,
    pub(crate) registry: Arc<DeviceRegistry<Arc<dyn Connector>>>,
    pub(crate) connectors: Arc<ConnectorHost>,
    pub(crate) cloud: Arc<dyn CloudTransport>,
    pub(crate) rpc: Arc<RpcDispatcher>,
}

impl GatewayHandle {
    /// The gateway's own random 64-char self-identity (spec §3).
    pub fn gateway_name(&self) -> &str {
        &self.gateway_name
    }

    /// `sendToStorage(connectorName, data)` (spec §4.3): enqueues a raw
    /// connector record for ingress to validate, normalize, and persist.
    /// Non-blocking; the ingress queue is unbounded (spec §5).
    pub fn send_to_storage(&self, connector_name: &str, data: Value) {
        let _ = self.ingress_tx.send(IngressItem {
            connector_name: connector_name.to_string(),
            data,
        });
    }

    /// `addDevice` (spec §3 "Lifecycles"): registers a device against its
    /// owning connector and persists the mutation. Idempotent: a
    /// already-known device is left untouched.
    pub async fn add_device(
        &self,
        device_name: &str,
        connector_name: &str,
        device_type: &str,
    ) -> anyhow::Result<()> {
        let connector = self
            .connectors
            .by_name(connector_name)
            .ok_or_else(|| anyhow::anyhow!("unknown connector '{connector_name}'"))?;
        self.registry
            .add(device_name, connector_name, connector, device_type)
            .await?;
        Ok(())
    }

    /// `delDevice` (spec §3 "Lifecycles"): removes a device from the
    /// registry and sends the cloud disconnect announcement.
    pub async fn del_device(&self, device_name: &str) -> anyhow::Result<()> {
        self.registry.del(device_name).await?;
        self.cloud.gw_disconnect_device(device_name).await;
        Ok(())
    }

    /// `rpcWithReplyProcessing` (spec §4.6): called by a connector that
    /// accepted a server-side RPC asynchronously (returned `None` from
    /// `server_side_rpc_handler`) once it has a result to report.
    pub async fn rpc_with_reply_processing(
        &self,
        request_id: &str,
        device: Option<&str>,
        success: Option<bool>,
        content: Option<Value>,
    ) {
        self.rpc
            .rpc_with_reply_processing(request_id, device, success, content)
            .await;
    }
}
