//! RPC Dispatcher (C6): receives server-side RPCs, routes them to a
//! connector, a broadcast of connectors by type, or a gateway-internal
//! method, enforces timeouts on connector-routed calls, and owns the
//! scheduled-calls list for `restart`/`reboot` (spec §4.6).
//!
//! The in-progress map's only mutator is `reconcile_in_progress`, called
//! once per scheduler tick (spec §5 "W-main is the sole mutator of RPC-in-
//! progress") — `handle_request` only ever pushes onto `register_tx`/
//! `complete_tx`, never touches the map directly.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use log::{info, warn};
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::connector::{CloudTransport, Connector, ConnectorHost, QualityOfService};
use crate::error::RpcError;
use crate::queues::{
    rpc_complete_channel, rpc_register_channel, RpcRegistration, RpcRequestItem,
};
use crate::registry::DeviceRegistry;
use crate::statistics::StatisticsCollector;
use crate::updater::UpdateChecker;
use crate::uplink::UplinkGates;
use crate::utils::now_ms;

const DEFAULT_RPC_TIMEOUT_MS: i64 = 30_000;
/// Reported by a reboot action denied by the host OS (spec §4.6 "Timeouts").
const REBOOT_PERMISSION_DENIED: i32 = 256;

/// The `module_method` suffix actions that are deferred rather than run
/// inline (spec §4.6 "Scheduled actions").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduledAction {
    Restart,
    Reboot,
}

struct ScheduledCall {
    run_at_ms: i64,
    action: ScheduledAction,
}

/// The resolved shape of spec §9's Open Question: one record type instead
/// of a map sometimes read as a tuple and sometimes as a list.
struct InProgress {
    device: Option<String>,
    deadline_ms: i64,
    abort: tokio::task::AbortHandle,
}

/// The process-level effect of a scheduled `restart`/`reboot` (out of scope
/// per spec §1 to actually implement; the core only owns the scheduling).
pub trait ProcessControl: Send + Sync {
    fn restart(&self);
    /// Returns an OS-style result code; `256` is recognized as "permission
    /// denied" (spec §4.6 "Timeouts").
    fn reboot(&self) -> i32;
}

pub struct NoopProcessControl;

impl ProcessControl for NoopProcessControl {
    fn restart(&self) {
        warn!("rpc: scheduled restart fired but no process control is wired up");
    }

    fn reboot(&self) -> i32 {
        warn!("rpc: scheduled reboot fired but no process control is wired up");
        0
    }
}

/// The optional interactive remote shell's command table (spec §1 names the
/// shell out of scope; SPEC_FULL §4.6 keeps only its override-priority
/// dispatch slot). Consulted before the fixed gateway-method table so a
/// shell command of the same name takes priority.
#[async_trait]
pub trait RemoteShellCommands: Send + Sync {
    /// Returns `None` when `method` isn't a recognized shell command.
    async fn handle(&self, method: &str, content: Value) -> Option<Value>;
}

pub struct RpcDispatcher {
    registry: Arc<DeviceRegistry<Arc<dyn Connector>>>,
    connectors: Arc<ConnectorHost>,
    cloud: Arc<dyn CloudTransport>,
    gates: UplinkGates,
    statistics: Arc<dyn StatisticsCollector>,
    updater: Arc<dyn UpdateChecker>,
    remote_shell: Option<Arc<dyn RemoteShellCommands>>,
    process_control: Arc<dyn ProcessControl>,
    timeout_ms: i64,

    register_tx: mpsc::UnboundedSender<RpcRegistration>,
    register_rx: Mutex<mpsc::UnboundedReceiver<RpcRegistration>>,
    complete_tx: mpsc::UnboundedSender<String>,
    complete_rx: Mutex<mpsc::UnboundedReceiver<String>>,

    in_progress: Mutex<HashMap<String, InProgress>>,
    scheduled: Mutex<Vec<ScheduledCall>>,
}

impl RpcDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<DeviceRegistry<Arc<dyn Connector>>>,
        connectors: Arc<ConnectorHost>,
        cloud: Arc<dyn CloudTransport>,
        gates: UplinkGates,
        statistics: Arc<dyn StatisticsCollector>,
        updater: Arc<dyn UpdateChecker>,
        remote_shell: Option<Arc<dyn RemoteShellCommands>>,
        process_control: Arc<dyn ProcessControl>,
    ) -> Self {
        let (register_tx, register_rx) = rpc_register_channel();
        let (complete_tx, complete_rx) = rpc_complete_channel();
        RpcDispatcher {
            registry,
            connectors,
            cloud,
            gates,
            statistics,
            updater,
            remote_shell,
            process_control,
            timeout_ms: DEFAULT_RPC_TIMEOUT_MS,
            register_tx,
            register_rx: Mutex::new(register_rx),
            complete_tx,
            complete_rx: Mutex::new(complete_rx),
            in_progress: Mutex::new(HashMap::new()),
            scheduled: Mutex::new(Vec::new()),
        }
    }

    /// Drains cloud-delivered RPC requests until `receiver` closes or
    /// `cancellation` fires, mirroring `ingress::Ingress::run`.
    pub async fn run(
        &self,
        mut receiver: mpsc::UnboundedReceiver<RpcRequestItem>,
        cancellation: CancellationToken,
    ) {
        loop {
            let item = tokio::select! {
                item = receiver.recv() => item,
                _ = cancellation.cancelled() => break,
            };
            let Some(item) = item else { break };
            self.handle_request(item.request_id, item.content).await;
        }
    }

    /// Entry point for `onRpcRequest` (spec §4.6 "Ingress").
    pub async fn handle_request(&self, request_id: String, content: Value) {
        if let Some(device_name) = content.get("device").and_then(Value::as_str) {
            self.dispatch_to_device(request_id, device_name.to_string(), content)
                .await;
            return;
        }

        let method = content
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let module = method.split('_').next().unwrap_or_default().to_string();

        if let Some(shell) = &self.remote_shell {
            if let Some(result) = shell.handle(&method, content.clone()).await {
                self.reply_self_content(&request_id, result).await;
                return;
            }
        }

        if module == "gateway" {
            self.handle_gateway_method(request_id, &method, content).await;
            return;
        }

        let matching = self.connectors.by_type(&module);
        if !matching.is_empty() {
            self.broadcast_to_type(request_id, matching, content).await;
            return;
        }

        self.reply_self_error(&request_id, RpcError::ConnectorNotFound).await;
    }

    async fn dispatch_to_device(&self, request_id: String, device_name: String, content: Value) {
        let connector = match self.registry.get(&device_name).await.and_then(|r| r.connector) {
            Some(connector) => connector,
            None => {
                self.reply_device_error(&device_name, &request_id, RpcError::ConnectorNotFound)
                    .await;
                return;
            }
        };

        let topic = request_id.clone();
        let deadline_ms = now_ms() + self.timeout_ms;
        let task_content = content.clone();
        let task = tokio::spawn(async move { connector.server_side_rpc_handler(task_content).await });
        let abort = task.abort_handle();

        let _ = self.register_tx.send(RpcRegistration {
            topic: topic.clone(),
            content,
            deadline_ms,
            device: Some(device_name.clone()),
            abort,
        });

        match task.await {
            Ok(Some(result)) => {
                self.complete(&topic);
                self.reply_device_success(&device_name, &request_id, result).await;
            }
            Ok(None) => {
                // The connector will reply later via `rpc_with_reply_processing`.
                self.complete(&topic);
            }
            Err(join_err) if join_err.is_cancelled() => {
                // Timed out: `reconcile_in_progress` already aborted this
                // task and sent the failure reply.
            }
            Err(join_err) => {
                self.complete(&topic);
                self.reply_device_error(
                    &device_name,
                    &request_id,
                    RpcError::Handler(join_err.to_string()),
                )
                .await;
            }
        }
    }

    async fn broadcast_to_type(
        &self,
        request_id: String,
        connectors: Vec<Arc<dyn Connector>>,
        content: Value,
    ) {
        let mut set = JoinSet::new();
        for connector in connectors {
            let content = content.clone();
            set.spawn(async move { connector.server_side_rpc_handler(content).await });
        }

        let mut winner = None;
        while let Some(result) = set.join_next().await {
            if let Ok(Some(value)) = result {
                winner = Some(value);
                break;
            }
        }
        set.abort_all();

        match winner {
            Some(result) => self.reply_self_content(&request_id, result).await,
            None => self.reply_self_error(&request_id, RpcError::MethodNotFound).await,
        }
    }

    async fn handle_gateway_method(&self, request_id: String, method: &str, content: Value) {
        let suffix = method.strip_prefix("gateway_").unwrap_or(method);
        match suffix {
            "ping" => {
                self.reply_self_content(&request_id, json!({"code": 200, "resp": "pong"}))
                    .await;
            }
            "stats" => {
                let snapshot = self.statistics.snapshot().await;
                self.reply_self_content(&request_id, snapshot).await;
            }
            "devices" => {
                let snapshot = self.registry.snapshot().await;
                self.reply_self_content(&request_id, json!(snapshot)).await;
            }
            "update" => match self.updater.apply_update().await {
                Ok(outcome) => {
                    self.reply_self_content(&request_id, json!({"outcome": format!("{outcome:?}")}))
                        .await;
                }
                Err(e) => {
                    self.reply_self_error(&request_id, RpcError::Handler(e.to_string())).await;
                }
            },
            "version" => {
                let current = self.updater.current_version();
                let latest = self
                    .updater
                    .check_latest_version()
                    .await
                    .unwrap_or_else(|_| current.clone());
                self.reply_self_content(
                    &request_id,
                    json!({"current_version": current, "latest_version": latest}),
                )
                .await;
            }
            "restart" => self.schedule_action(request_id, content, ScheduledAction::Restart).await,
            "reboot" => self.schedule_action(request_id, content, ScheduledAction::Reboot).await,
            _ => self.reply_self_error(&request_id, RpcError::MethodNotFound).await,
        }
    }

    /// Resolves spec §9's second Open Question: missing/empty `params` is
    /// treated as zero seconds; a non-numeric value is rejected with 400.
    async fn schedule_action(&self, request_id: String, content: Value, action: ScheduledAction) {
        let seconds = match content.get("params") {
            None | Some(Value::Null) => 0.0,
            Some(Value::String(s)) if s.is_empty() => 0.0,
            Some(value) => match value.as_f64() {
                Some(n) => n,
                None => {
                    self.reply_self_error(
                        &request_id,
                        RpcError::InvalidParams("params must be numeric seconds".to_string()),
                    )
                    .await;
                    return;
                }
            },
        };

        let run_at_ms = now_ms() + (seconds * 1000.0) as i64;
        self.scheduled.lock().await.push(ScheduledCall { run_at_ms, action });
        self.reply_self_content(&request_id, json!({"success": true})).await;
    }

    /// Spec §4.8 item 2: scans the scheduled-calls list each tick and fires
    /// anything due. Returns whether any action fired.
    pub async fn run_scheduled(&self, now_ms: i64) -> bool {
        let mut scheduled = self.scheduled.lock().await;
        let due: Vec<ScheduledCall> = {
            let mut remaining = Vec::with_capacity(scheduled.len());
            let mut due = Vec::new();
            for call in scheduled.drain(..) {
                if call.run_at_ms <= now_ms {
                    due.push(call);
                } else {
                    remaining.push(call);
                }
            }
            *scheduled = remaining;
            due
        };
        drop(scheduled);

        let did_work = !due.is_empty();
        for call in due {
            match call.action {
                ScheduledAction::Restart => {
                    info!("rpc: executing scheduled gateway restart");
                    self.process_control.restart();
                }
                ScheduledAction::Reboot => {
                    let code = self.process_control.reboot();
                    if code == REBOOT_PERMISSION_DENIED {
                        warn!("rpc: scheduled reboot denied (permission denied)");
                    } else {
                        info!("rpc: scheduled reboot issued (code {code})");
                    }
                }
            }
        }
        did_work
    }

    /// Spec §4.8 item 3: drains the register/complete queues into the
    /// in-progress map and cancels anything past its deadline. The sole
    /// mutator of `in_progress` (spec §5).
    pub async fn reconcile_in_progress(&self, now_ms: i64) -> bool {
        let mut did_work = false;
        let mut in_progress = self.in_progress.lock().await;

        {
            let mut complete_rx = self.complete_rx.lock().await;
            while let Ok(topic) = complete_rx.try_recv() {
                in_progress.remove(&topic);
                did_work = true;
            }
        }

        {
            let mut register_rx = self.register_rx.lock().await;
            while let Ok(reg) = register_rx.try_recv() {
                in_progress.insert(
                    reg.topic,
                    InProgress {
                        device: reg.device,
                        deadline_ms: reg.deadline_ms,
                        abort: reg.abort,
                    },
                );
                did_work = true;
            }
        }

        let expired: Vec<String> = in_progress
            .iter()
            .filter(|(_, entry)| now_ms >= entry.deadline_ms)
            .map(|(topic, _)| topic.clone())
            .collect();

        let mut to_cancel = Vec::new();
        for topic in expired {
            if let Some(entry) = in_progress.remove(&topic) {
                to_cancel.push((topic, entry));
            }
            did_work = true;
        }
        drop(in_progress);

        for (topic, entry) in to_cancel {
            entry.abort.abort();
            self.cancel_rpc_request(&topic, entry.device.as_deref()).await;
        }

        did_work
    }

    async fn cancel_rpc_request(&self, request_id: &str, device: Option<&str>) {
        warn!("rpc: request '{request_id}' timed out, canceling");
        match device {
            Some(device) => {
                self.reply_device_error(device, request_id, RpcError::Handler("timed out".to_string()))
                    .await;
            }
            None => {
                self.reply_self_error(request_id, RpcError::Handler("timed out".to_string()))
                    .await;
            }
        }
    }

    /// Called by a connector once it has finished handling an RPC it
    /// accepted asynchronously (spec §4.6 "the connector is responsible for
    /// later calling `rpcWithReplyProcessing`"); selects one of the four
    /// `sendRpcReply` forms from spec §4.6's table.
    pub async fn rpc_with_reply_processing(
        &self,
        request_id: &str,
        device: Option<&str>,
        success: Option<bool>,
        content: Option<Value>,
    ) {
        self.complete(request_id);
        match (device, success, content) {
            (Some(device), Some(success), None) => {
                self.send_reply(Some(device), request_id, json!({"success": success})).await;
            }
            (Some(device), None, Some(content)) => {
                self.send_reply(Some(device), request_id, content).await;
            }
            (None, Some(success), None) => {
                self.send_reply(None, request_id, json!({"success": success})).await;
            }
            (None, None, Some(content)) => {
                self.send_reply(None, request_id, content).await;
            }
            _ => warn!(
                "rpc: invalid rpc_with_reply_processing combination for '{request_id}' (device={device:?})"
            ),
        }
    }

    fn complete(&self, topic: &str) {
        let _ = self.complete_tx.send(topic.to_string());
    }

    async fn reply_self_content(&self, request_id: &str, content: Value) {
        self.send_reply(None, request_id, content).await;
    }

    async fn reply_self_error(&self, request_id: &str, err: RpcError) {
        let code = err.code();
        self.reply_self_content(request_id, json!({"error": err.to_string(), "code": code}))
            .await;
    }

    async fn reply_device_success(&self, device: &str, request_id: &str, content: Value) {
        self.send_reply(Some(device), request_id, content).await;
    }

    async fn reply_device_error(&self, device: &str, request_id: &str, err: RpcError) {
        let code = err.code();
        self.reply_device_success(device, request_id, json!({"error": err.to_string(), "code": code}))
            .await;
    }

    /// Toggles `rpcReplySent` around the publish so the uplink yields
    /// (spec §4.4 "Mutual exclusion with RPC replies", §5).
    async fn send_reply(&self, device: Option<&str>, request_id: &str, content: Value) {
        self.gates.rpc_reply_in_flight.store(true, Ordering::Relaxed);
        let qos = self.cloud.quality_of_service();
        match device {
            Some(device) => {
                self.cloud
                    .gw_send_rpc_reply(device, request_id, content, qos)
                    .await;
            }
            None => {
                self.cloud.send_rpc_reply(request_id, content, qos, true).await;
            }
        }
        self.gates.rpc_reply_in_flight.store(false, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::{ImmediateToken, PublishToken};
    use std::sync::Mutex as StdMutex;
    use tokio::time::{sleep, Duration};

    #[derive(Default)]
    struct FakeCloud {
        replies: StdMutex<Vec<(Option<String>, String, Value)>>,
    }

    #[async_trait]
    impl CloudTransport for FakeCloud {
        fn is_connected(&self) -> bool {
            true
        }
        fn quality_of_service(&self) -> QualityOfService {
            QualityOfService::AtLeastOnce
        }
        async fn connect(&self) -> anyhow::Result<()> {
            Ok(())
        }
        async fn disconnect(&self) -> anyhow::Result<()> {
            Ok(())
        }
        async fn stop(&self) -> anyhow::Result<()> {
            Ok(())
        }
        async fn subscribe_service_topics(&self) -> anyhow::Result<()> {
            Ok(())
        }
        fn subscriptions_settled(&self) -> bool {
            true
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
        async fn gw_connect_device(&self, _name: &str, _device_type: &str) {}
        async fn gw_disconnect_device(&self, _name: &str) {}
        async fn send_rpc_reply(
            &self,
            request_id: &str,
            content: Value,
            _qos: QualityOfService,
            _wait_for_publish: bool,
        ) {
            self.replies.lock().unwrap().push((None, request_id.to_string(), content));
        }
        async fn gw_send_rpc_reply(
            &self,
            device: &str,
            request_id: &str,
            content: Value,
            _qos: QualityOfService,
        ) {
            self.replies
                .lock()
                .unwrap()
                .push((Some(device.to_string()), request_id.to_string(), content));
        }
        async fn request_attributes(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct ImmediateConnector {
        connector_type: String,
        result: Option<Value>,
    }

    #[async_trait]
    impl Connector for ImmediateConnector {
        fn name(&self) -> &str {
            "c1"
        }
        fn connector_type(&self) -> &str {
            &self.connector_type
        }
        async fn close(&self) {}
        async fn server_side_rpc_handler(&self, _content: Value) -> Option<Value> {
            self.result.clone()
        }
        async fn on_attributes_update(&self, _content: Value) {}
    }

    struct SlowConnector;

    #[async_trait]
    impl Connector for SlowConnector {
        fn name(&self) -> &str {
            "slow"
        }
        fn connector_type(&self) -> &str {
            "mqtt"
        }
        async fn close(&self) {}
        async fn server_side_rpc_handler(&self, _content: Value) -> Option<Value> {
            sleep(Duration::from_secs(3600)).await;
            Some(json!({"never": true}))
        }
        async fn on_attributes_update(&self, _content: Value) {}
    }

    fn dispatcher(
        registry: Arc<DeviceRegistry<Arc<dyn Connector>>>,
        connectors: Arc<ConnectorHost>,
        cloud: Arc<FakeCloud>,
    ) -> RpcDispatcher {
        let stats = Arc::new(crate::statistics::CoreStatistics::new(
            Arc::new(crate::ingress::ConnectorCounters::new()),
            registry.clone(),
        ));
        RpcDispatcher::new(
            registry,
            connectors,
            cloud,
            UplinkGates::default(),
            stats,
            Arc::new(crate::updater::NoopUpdateChecker::new("1.0.0")),
            None,
            Arc::new(NoopProcessControl),
        )
    }

    #[tokio::test]
    async fn gateway_ping_replies_pong_on_self_channel() {
        crate::test_log::init();
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(DeviceRegistry::new(dir.path()));
        let cloud = Arc::new(FakeCloud::default());
        let dispatcher = dispatcher(registry, Arc::new(ConnectorHost::new(vec![])), cloud.clone());

        dispatcher
            .handle_request("req-1".to_string(), json!({"method": "gateway_ping"}))
            .await;

        let replies = cloud.replies.lock().unwrap();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].0, None);
        assert_eq!(replies[0].2, json!({"code": 200, "resp": "pong"}));
    }

    #[tokio::test]
    async fn unknown_method_replies_404() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(DeviceRegistry::new(dir.path()));
        let cloud = Arc::new(FakeCloud::default());
        let dispatcher = dispatcher(registry, Arc::new(ConnectorHost::new(vec![])), cloud.clone());

        dispatcher
            .handle_request("req-1".to_string(), json!({"method": "nope_missing"}))
            .await;

        let replies = cloud.replies.lock().unwrap();
        assert_eq!(replies[0].2["code"], json!(404));
    }

    #[tokio::test]
    async fn device_routed_rpc_forwards_to_owning_connector() {
        let dir = tempfile::tempdir().unwrap();
        let registry: Arc<DeviceRegistry<Arc<dyn Connector>>> = Arc::new(DeviceRegistry::new(dir.path()));
        let connector: Arc<dyn Connector> = Arc::new(ImmediateConnector {
            connector_type: "mqtt".to_string(),
            result: Some(json!({"ok": true})),
        });
        registry.add("d1", "c1", connector, "default").await.unwrap();

        let cloud = Arc::new(FakeCloud::default());
        let dispatcher = dispatcher(registry, Arc::new(ConnectorHost::new(vec![])), cloud.clone());

        dispatcher
            .handle_request("req-1".to_string(), json!({"device": "d1", "method": "setState"}))
            .await;

        let replies = cloud.replies.lock().unwrap();
        assert_eq!(replies[0].0.as_deref(), Some("d1"));
        assert_eq!(replies[0].2, json!({"ok": true}));
    }

    #[tokio::test]
    async fn broadcast_by_type_takes_first_non_null_result() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(DeviceRegistry::new(dir.path()));
        let quiet: Arc<dyn Connector> = Arc::new(ImmediateConnector {
            connector_type: "mqtt".to_string(),
            result: None,
        });
        let loud: Arc<dyn Connector> = Arc::new(ImmediateConnector {
            connector_type: "mqtt".to_string(),
            result: Some(json!({"winner": true})),
        });
        let cloud = Arc::new(FakeCloud::default());
        let dispatcher = dispatcher(
            registry,
            Arc::new(ConnectorHost::new(vec![quiet, loud])),
            cloud.clone(),
        );

        dispatcher
            .handle_request("req-1".to_string(), json!({"method": "mqtt_reload"}))
            .await;

        let replies = cloud.replies.lock().unwrap();
        assert_eq!(replies[0].2, json!({"winner": true}));
    }

    #[tokio::test]
    async fn scheduled_restart_replies_immediately_and_fires_on_tick() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(DeviceRegistry::new(dir.path()));
        let cloud = Arc::new(FakeCloud::default());
        let dispatcher = dispatcher(registry, Arc::new(ConnectorHost::new(vec![])), cloud.clone());

        dispatcher
            .handle_request(
                "req-1".to_string(),
                json!({"method": "gateway_restart", "params": 0}),
            )
            .await;

        assert_eq!(cloud.replies.lock().unwrap()[0].2, json!({"success": true}));

        let did_work = dispatcher.run_scheduled(now_ms() + 1).await;
        assert!(did_work);
    }

    #[tokio::test]
    async fn non_numeric_restart_params_is_rejected_with_400() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(DeviceRegistry::new(dir.path()));
        let cloud = Arc::new(FakeCloud::default());
        let dispatcher = dispatcher(registry, Arc::new(ConnectorHost::new(vec![])), cloud.clone());

        dispatcher
            .handle_request(
                "req-1".to_string(),
                json!({"method": "gateway_restart", "params": "soon"}),
            )
            .await;

        assert_eq!(cloud.replies.lock().unwrap()[0].2["code"], json!(400));
    }

    #[tokio::test]
    async fn timed_out_device_rpc_is_canceled_and_replied_on_tick() {
        let dir = tempfile::tempdir().unwrap();
        let registry: Arc<DeviceRegistry<Arc<dyn Connector>>> = Arc::new(DeviceRegistry::new(dir.path()));
        let connector: Arc<dyn Connector> = Arc::new(SlowConnector);
        registry.add("d1", "slow", connector, "default").await.unwrap();

        let cloud = Arc::new(FakeCloud::default());
        let mut dispatcher = dispatcher(registry, Arc::new(ConnectorHost::new(vec![])), cloud.clone());
        dispatcher.timeout_ms = 0;
        let dispatcher = Arc::new(dispatcher);

        let dispatcher_bg = dispatcher.clone();
        let handle = tokio::spawn(async move {
            dispatcher_bg
                .handle_request("req-1".to_string(), json!({"device": "d1", "method": "x"}))
                .await;
        });

        // Give the spawned connector task a moment to register.
        sleep(Duration::from_millis(20)).await;
        let did_work = dispatcher.reconcile_in_progress(now_ms() + 1).await;
        assert!(did_work);

        handle.await.unwrap();

        let replies = cloud.replies.lock().unwrap();
        assert_eq!(replies[0].0.as_deref(), Some("d1"));
        assert_eq!(replies[0].2["code"], json!(500));
    }
}
