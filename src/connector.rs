//! External collaborator contracts (spec §6, §9): connectors and the cloud
//! transport are consumed through object-safe `async_trait`s rather than a
//! base class with abstract methods.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

/// A pluggable protocol driver (spec §6 "Connector contract"). Individual
/// connectors (MQTT, Modbus, OPC-UA, ...) are out of scope; this is the
/// surface the core calls into.
#[async_trait]
pub trait Connector: Send + Sync {
    fn name(&self) -> &str;
    fn connector_type(&self) -> &str;
    async fn close(&self);
    /// Returns `None` when this connector does not recognize the RPC, or
    /// `Some(result)` — the caller is responsible for replying.
    async fn server_side_rpc_handler(&self, content: Value) -> Option<Value>;
    async fn on_attributes_update(&self, content: Value);
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum QualityOfService {
    AtMostOnce = 0,
    AtLeastOnce = 1,
}

/// A completion token for a single publish, as returned by the cloud
/// transport's `send*`/`gwSend*` primitives (spec §6). QoS 0 publishes may
/// report success immediately; QoS 1 publishes report once the broker acks.
#[async_trait]
pub trait PublishToken: Send + Sync {
    async fn wait(self: Box<Self>) -> bool;
}

/// A token that is always immediately successful, for QoS-0 transports.
pub struct ImmediateToken;

#[async_trait]
impl PublishToken for ImmediateToken {
    async fn wait(self: Box<Self>) -> bool {
        true
    }
}

/// The cloud transport's publish/subscribe primitives (spec §6). Incoming
/// attribute updates and server-side RPC requests are delivered to the
/// gateway as channels supplied at construction (see `gateway::GatewayBuilder`)
/// rather than via registered callbacks — the idiomatic async-Rust shape of
/// the same "subscribe once, react repeatedly" contract.
#[async_trait]
pub trait CloudTransport: Send + Sync {
    fn is_connected(&self) -> bool;
    fn quality_of_service(&self) -> QualityOfService;

    async fn connect(&self) -> anyhow::Result<()>;
    async fn disconnect(&self) -> anyhow::Result<()>;
    async fn stop(&self) -> anyhow::Result<()>;

    /// (Re-)subscribes to the attribute-update and server-side-RPC service
    /// topics, both for the gateway's own session and the multiplexed child
    /// device channel (spec §4.5).
    async fn subscribe_service_topics(&self) -> anyhow::Result<()>;
    /// Whether the subscriptions requested above have settled, gating the
    /// post-reconnect shared-attribute fetch (spec §4.5, §4.8 item 4).
    fn subscriptions_settled(&self) -> bool;

    async fn send_telemetry(&self, payload: Value) -> Box<dyn PublishToken>;
    async fn send_attributes(&self, payload: Value) -> Box<dyn PublishToken>;
    async fn gw_send_telemetry(&self, device: &str, payload: Value) -> Box<dyn PublishToken>;
    async fn gw_send_attributes(&self, device: &str, payload: Value) -> Box<dyn PublishToken>;

    async fn gw_connect_device(&self, name: &str, device_type: &str);
    async fn gw_disconnect_device(&self, name: &str);

    async fn send_rpc_reply(
        &self,
        request_id: &str,
        content: Value,
        qos: QualityOfService,
        wait_for_publish: bool,
    );
    async fn gw_send_rpc_reply(
        &self,
        device: &str,
        request_id: &str,
        content: Value,
        qos: QualityOfService,
    );

    /// Requests the current shared/client attributes (spec §4.5, seeds
    /// remote configuration and remote log level). The result is delivered
    /// back through the same attribute-update channel used for pushes.
    async fn request_attributes(&self) -> anyhow::Result<()>;
}

/// `handleRpcForConnector` is fully specified by spec §4.6 and implemented
/// directly by `rpc::RpcDispatcher` against the device registry, so it is
/// not part of this injected surface (see DESIGN.md).
pub struct ConnectorHost {
    connectors: std::sync::RwLock<Vec<Arc<dyn Connector>>>,
}

impl ConnectorHost {
    pub fn new(connectors: Vec<Arc<dyn Connector>>) -> Self {
        ConnectorHost {
            connectors: std::sync::RwLock::new(connectors),
        }
    }

    pub fn by_name(&self, name: &str) -> Option<Arc<dyn Connector>> {
        self.connectors
            .read()
            .unwrap()
            .iter()
            .find(|c| c.name() == name)
            .cloned()
    }

    pub fn by_type(&self, connector_type: &str) -> Vec<Arc<dyn Connector>> {
        self.connectors
            .read()
            .unwrap()
            .iter()
            .filter(|c| c.connector_type() == connector_type)
            .cloned()
            .collect()
    }

    pub fn all(&self) -> Vec<Arc<dyn Connector>> {
        self.connectors.read().unwrap().clone()
    }

    pub async fn close_all(&self) {
        let snapshot = self.all();
        for connector in &snapshot {
            connector.close().await;
        }
    }

    /// Swaps in a freshly loaded connector set (spec §4.8 item 6: a
    /// connector-config reload closes all connectors, reloads, reconnects).
    /// Existing `Arc<ConnectorHost>` holders (ingress, the RPC dispatcher)
    /// observe the new set on their next lookup without needing to be
    /// rebuilt themselves.
    pub fn replace(&self, connectors: Vec<Arc<dyn Connector>>) {
        *self.connectors.write().unwrap() = connectors;
    }
}

/// Constructs and reconnects the live connector set from configuration
/// (spec §9 Design Notes, SPEC_FULL §6 "Trait shapes"). The core calls
/// into this to (re)build the connector set; it never reaches into
/// connector configuration itself.
#[async_trait]
pub trait ConnectorLoader: Send + Sync {
    /// Reads connector configuration and constructs the live connector set.
    /// `handle` is cloned into whatever connectors are constructed so they
    /// can later call back into the core (spec §5: `sendToStorage`,
    /// `addDevice`, `sendRpcReply`, `rpcWithReplyProcessing`).
    async fn load_connectors(
        &self,
        handle: &crate::handle::GatewayHandle,
    ) -> anyhow::Result<Vec<Arc<dyn Connector>>>;
    /// Starts each connector talking to its devices/protocol.
    async fn connect_with_connectors(&self, connectors: &[Arc<dyn Connector>]) -> anyhow::Result<()>;
    /// Paths whose mtime is watched for the periodic reload check (spec
    /// §4.8 item 6).
    fn config_file_paths(&self) -> Vec<std::path::PathBuf>;
}
