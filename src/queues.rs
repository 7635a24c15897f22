//! The three unbounded single-consumer queues named in spec §5: ingress,
//! RPC-register, and published-events. Modeled as `tokio::mpsc` channels per
//! Design Note 9 — non-blocking `send` from any number of producer threads,
//! a single owning consumer per queue.

use tokio::sync::mpsc;

use crate::connector::PublishToken;

/// One `(connectorName, data)` submission from `Connector::send_to_storage`.
pub struct IngressItem {
    pub connector_name: String,
    pub data: serde_json::Value,
}

pub fn ingress_channel() -> (mpsc::UnboundedSender<IngressItem>, mpsc::UnboundedReceiver<IngressItem>) {
    mpsc::unbounded_channel()
}

/// A connector-routed RPC awaiting a reply, registered by
/// `registerRpcRequestTimeout` (spec §4.6). `abort` lets a timed-out
/// request be cancelled outright: the connector call is spawned as its
/// own task rather than merely notified (see DESIGN.md).
pub struct RpcRegistration {
    pub topic: String,
    pub content: serde_json::Value,
    pub deadline_ms: i64,
    pub device: Option<String>,
    pub abort: tokio::task::AbortHandle,
}

pub fn rpc_register_channel() -> (
    mpsc::UnboundedSender<RpcRegistration>,
    mpsc::UnboundedReceiver<RpcRegistration>,
) {
    mpsc::unbounded_channel()
}

/// Sent by the dispatch task once a connector call resolves on its own,
/// so W-main (the sole mutator of the in-progress map, spec §5) can drop the
/// corresponding registration instead of letting it time out.
pub fn rpc_complete_channel() -> (
    mpsc::UnboundedSender<String>,
    mpsc::UnboundedReceiver<String>,
) {
    mpsc::unbounded_channel()
}

/// A cloud-originated server-side RPC request delivered to the gateway
/// (spec §6 "Subscription setters ... server-side-RPC").
pub struct RpcRequestItem {
    pub request_id: String,
    pub content: serde_json::Value,
}

pub fn rpc_request_channel() -> (
    mpsc::UnboundedSender<RpcRequestItem>,
    mpsc::UnboundedReceiver<RpcRequestItem>,
) {
    mpsc::unbounded_channel()
}

/// A cloud-originated shared/client attribute delivery (spec §4.7).
pub struct AttributeUpdateItem {
    pub content: serde_json::Value,
}

pub fn attribute_update_channel() -> (
    mpsc::UnboundedSender<AttributeUpdateItem>,
    mpsc::UnboundedReceiver<AttributeUpdateItem>,
) {
    mpsc::unbounded_channel()
}

/// The completion tokens returned by `CloudTransport::gw_send_telemetry`/
/// `gw_send_attributes` while a pack is being published, drained once the
/// whole pack has been dispatched (spec §4.4).
pub type PublishedEventsSender = mpsc::UnboundedSender<Box<dyn PublishToken>>;
pub type PublishedEventsReceiver = mpsc::UnboundedReceiver<Box<dyn PublishToken>>;

pub fn published_events_channel() -> (PublishedEventsSender, PublishedEventsReceiver) {
    mpsc::unbounded_channel()
}
