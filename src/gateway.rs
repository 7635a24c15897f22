//! `GatewayService` and its `GatewayBuilder` (spec §9 "a dependency-injection
//! struct of function values passed at construction"; SPEC_FULL §6 "Trait
//! shapes"). This is the top of the crate: it owns every component (C1-C8),
//! spawns W-ingress/W-uplink as long-lived tasks under a shared
//! `CancellationToken`, and itself runs the periodic scheduler (C8, §4.8) as
//! W-main.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use log::{debug, error, info, warn};
use serde_json::json;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::attributes::{AttributeHandler, RemoteConfigurator, RemoteLogHandler};
use crate::config::{GatewayConfig, StorageConfig};
use crate::connector::{CloudTransport, Connector, ConnectorHost, ConnectorLoader};
use crate::handle::GatewayHandle;
use crate::ingress::{ConnectorCounters, Ingress};
use crate::queues::{ingress_channel, AttributeUpdateItem, RpcRequestItem};
use crate::registry::DeviceRegistry;
use crate::rpc::{NoopProcessControl, ProcessControl, RemoteShellCommands, RpcDispatcher};
use crate::statistics::{CoreStatistics, StatisticsCollector};
use crate::storage::file::FileStorage;
use crate::storage::memory::MemoryStorage;
use crate::storage::sqlite::SqliteStorage;
use crate::storage::EventStorage;
use crate::supervisor::ConnectionSupervisor;
use crate::updater::{NoopUpdateChecker, UpdateChecker};
use crate::uplink::{Uplink, UplinkGates};
use crate::utils::generate_gateway_name;

const SCHEDULER_FALLBACK_SLEEP: Duration = Duration::from_millis(100);

/// Adapts a `CloudTransport` to the narrower `ConnectionState` view ingress
/// needs (spec §4.3 step 3), so `Ingress` doesn't have to depend on the
/// whole cloud-transport contract just to check connectivity.
struct CloudConnectionState(Arc<dyn CloudTransport>);

impl crate::ingress::ConnectionState for CloudConnectionState {
    fn is_connected(&self) -> bool {
        self.0.is_connected()
    }
}

async fn build_storage(config: &StorageConfig, batch_size: usize) -> anyhow::Result<Arc<dyn EventStorage>> {
    let storage: Arc<dyn EventStorage> = match config {
        StorageConfig::Memory { max_records_count } => {
            Arc::new(MemoryStorage::new(*max_records_count, batch_size))
        }
        StorageConfig::File {
            data_folder_path,
            max_file_count,
            max_records_per_file,
        } => Arc::new(
            FileStorage::new(data_folder_path, *max_file_count, *max_records_per_file, batch_size)
                .await?,
        ),
        StorageConfig::Sqlite {
            data_file_path,
            max_records_count,
        } => Arc::new(SqliteStorage::new(data_file_path, *max_records_count, batch_size).await?),
    };
    Ok(storage)
}

/// Builds a [`GatewayService`] from a `ConnectorLoader` and a `CloudTransport`
/// implementation, with everything else defaulted to a no-op collaborator
/// (spec §9: the core never calls a virtual method except through the
/// injected surface).
pub struct GatewayBuilder {
    config: GatewayConfig,
    config_dir: PathBuf,
    connector_loader: Arc<dyn ConnectorLoader>,
    cloud: Arc<dyn CloudTransport>,
    rpc_request_rx: tokio::sync::mpsc::UnboundedReceiver<RpcRequestItem>,
    attribute_update_rx: tokio::sync::mpsc::UnboundedReceiver<AttributeUpdateItem>,
    remote_configurator: Option<Arc<dyn RemoteConfigurator>>,
    log_handler: Option<Arc<dyn RemoteLogHandler>>,
    remote_shell: Option<Arc<dyn RemoteShellCommands>>,
    update_checker: Arc<dyn UpdateChecker>,
    process_control: Arc<dyn ProcessControl>,
    statistics: Option<Arc<dyn StatisticsCollector>>,
}

impl GatewayBuilder {
    /// `rpc_request_rx` and `attribute_update_rx` are the receiving ends of
    /// channels whose sending ends must already have been handed to `cloud`
    /// at its own construction time (SPEC_FULL §6 "delivered ... as channels
    /// supplied at construction").
    pub fn new(
        config: GatewayConfig,
        config_dir: impl Into<PathBuf>,
        connector_loader: Arc<dyn ConnectorLoader>,
        cloud: Arc<dyn CloudTransport>,
        rpc_request_rx: tokio::sync::mpsc::UnboundedReceiver<RpcRequestItem>,
        attribute_update_rx: tokio::sync::mpsc::UnboundedReceiver<AttributeUpdateItem>,
    ) -> Self {
        GatewayBuilder {
            config,
            config_dir: config_dir.into(),
            connector_loader,
            cloud,
            rpc_request_rx,
            attribute_update_rx,
            remote_configurator: None,
            log_handler: None,
            remote_shell: None,
            update_checker: Arc::new(NoopUpdateChecker::new(env!("CARGO_PKG_VERSION"))),
            process_control: Arc::new(NoopProcessControl),
            statistics: None,
        }
    }

    pub fn with_remote_configurator(mut self, configurator: Arc<dyn RemoteConfigurator>) -> Self {
        self.remote_configurator = Some(configurator);
        self
    }

    pub fn with_log_handler(mut self, handler: Arc<dyn RemoteLogHandler>) -> Self {
        self.log_handler = Some(handler);
        self
    }

    pub fn with_remote_shell(mut self, shell: Arc<dyn RemoteShellCommands>) -> Self {
        self.remote_shell = Some(shell);
        self
    }

    pub fn with_update_checker(mut self, checker: Arc<dyn UpdateChecker>) -> Self {
        self.update_checker = checker;
        self
    }

    pub fn with_process_control(mut self, control: Arc<dyn ProcessControl>) -> Self {
        self.process_control = control;
        self
    }

    pub fn with_statistics_collector(mut self, collector: Arc<dyn StatisticsCollector>) -> Self {
        self.statistics = Some(collector);
        self
    }

    pub async fn build(self) -> anyhow::Result<GatewayService> {
        let gateway_name: Arc<str> = Arc::from(generate_gateway_name());
        let session_id = Uuid::new_v4();
        info!(
            "gateway: starting session {session_id} with self-identity '{}'",
            gateway_name
        );

        let storage = build_storage(&self.config.storage, self.config.batch_size).await?;
        let registry: Arc<DeviceRegistry<Arc<dyn Connector>>> =
            Arc::new(DeviceRegistry::new(&self.config_dir));
        let connectors = Arc::new(ConnectorHost::new(Vec::new()));
        let counters = Arc::new(ConnectorCounters::new());
        let gates = UplinkGates::default();

        let statistics = self
            .statistics
            .unwrap_or_else(|| Arc::new(CoreStatistics::new(counters.clone(), registry.clone())));

        let rpc = Arc::new(RpcDispatcher::new(
            registry.clone(),
            connectors.clone(),
            self.cloud.clone(),
            gates.clone(),
            statistics.clone(),
            self.update_checker.clone(),
            self.remote_shell.clone(),
            self.process_control.clone(),
        ));

        let (ingress_tx, ingress_rx) = ingress_channel();

        let handle = GatewayHandle {
            gateway_name: gateway_name.clone(),
            ingress_tx,
            registry: registry.clone(),
            connectors: connectors.clone(),
            cloud: self.cloud.clone(),
            rpc: rpc.clone(),
        };

        let ingress = Arc::new(Ingress::new(
            gateway_name.to_string(),
            registry.clone(),
            connectors.clone(),
            storage.clone(),
            Arc::new(CloudConnectionState(self.cloud.clone())),
            counters.clone(),
        ));

        let uplink = Arc::new(Uplink::new(
            storage.clone(),
            self.cloud.clone(),
            gates.clone(),
            self.config.thingsboard.max_payload_size_bytes,
            self.config.thingsboard.min_pack_send_delay_ms,
        ));

        let supervisor = Arc::new(ConnectionSupervisor::new(self.cloud.clone(), registry.clone()));

        let attributes = Arc::new(AttributeHandler::new(
            registry.clone(),
            self.cloud.clone(),
            self.remote_configurator,
            self.log_handler,
            gates.clone(),
        ));

        Ok(GatewayService {
            gateway_name,
            session_id,
            config: self.config,
            connector_loader: self.connector_loader,
            registry,
            connectors,
            storage,
            cloud: self.cloud,
            counters,
            handle,
            ingress,
            uplink,
            supervisor,
            rpc,
            attributes,
            statistics,
            updater: self.update_checker,
            ingress_rx: Mutex::new(Some(ingress_rx)),
            rpc_request_rx: Mutex::new(Some(self.rpc_request_rx)),
            attribute_update_rx: Mutex::new(Some(self.attribute_update_rx)),
            connector_config_mtimes: Mutex::new(HashMap::new()),
            stats_last_sent: Mutex::new(None),
            connector_reload_last_checked: Mutex::new(None),
            update_last_checked: Mutex::new(None),
            stopped: AtomicBool::new(false),
        })
    }
}

/// The running gateway. Owns C1-C8 and drives the periodic scheduler
/// (§4.8) as W-main once `run` is called.
pub struct GatewayService {
    gateway_name: Arc<str>,
    session_id: Uuid,
    config: GatewayConfig,
    connector_loader: Arc<dyn ConnectorLoader>,
    registry: Arc<DeviceRegistry<Arc<dyn Connector>>>,
    connectors: Arc<ConnectorHost>,
    storage: Arc<dyn EventStorage>,
    cloud: Arc<dyn CloudTransport>,
    counters: Arc<ConnectorCounters>,
    handle: GatewayHandle,
    ingress: Arc<Ingress>,
    uplink: Arc<Uplink>,
    supervisor: Arc<ConnectionSupervisor<Arc<dyn Connector>>>,
    rpc: Arc<RpcDispatcher>,
    attributes: Arc<AttributeHandler>,
    statistics: Arc<dyn StatisticsCollector>,
    updater: Arc<dyn UpdateChecker>,

    ingress_rx: Mutex<Option<tokio::sync::mpsc::UnboundedReceiver<crate::queues::IngressItem>>>,
    rpc_request_rx: Mutex<Option<tokio::sync::mpsc::UnboundedReceiver<RpcRequestItem>>>,
    attribute_update_rx: Mutex<Option<tokio::sync::mpsc::UnboundedReceiver<AttributeUpdateItem>>>,

    connector_config_mtimes: Mutex<HashMap<PathBuf, SystemTime>>,
    stats_last_sent: Mutex<Option<Instant>>,
    connector_reload_last_checked: Mutex<Option<Instant>>,
    update_last_checked: Mutex<Option<Instant>>,
    stopped: AtomicBool,
}

impl GatewayService {
    pub fn gateway_name(&self) -> &str {
        &self.gateway_name
    }

    /// A clone of the reverse-direction surface handed to the
    /// `ConnectorLoader` (exposed for a downstream binary that wants to
    /// also poke the core directly, e.g. from a CLI or remote shell).
    pub fn handle(&self) -> GatewayHandle {
        self.handle.clone()
    }

    pub fn counters(&self) -> Arc<ConnectorCounters> {
        self.counters.clone()
    }

    /// Runs until `cancellation` fires (e.g. on SIGINT, wired up by the
    /// embedding binary) or an unrecoverable startup error occurs, then
    /// shuts down gracefully (spec §4.8 "Graceful shutdown", §7
    /// "Unhandled exception in main loop").
    pub async fn run(self: &Arc<Self>, cancellation: CancellationToken) -> anyhow::Result<()> {
        if let Err(e) = self.registry.load().await {
            error!("gateway: failed to load device registry, starting empty: {e}");
        }

        let connectors = self.connector_loader.load_connectors(&self.handle).await?;
        self.connectors.replace(connectors.clone());
        for connector in &connectors {
            self.registry.rebind(connector.name(), connector.clone()).await;
        }
        self.remember_connector_config_mtimes().await;

        self.connector_loader.connect_with_connectors(&connectors).await?;
        self.supervisor.start().await;

        let ingress_rx = self
            .ingress_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| anyhow::anyhow!("gateway: run() called more than once"))?;
        let rpc_request_rx = self
            .rpc_request_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| anyhow::anyhow!("gateway: run() called more than once"))?;
        let attribute_update_rx = self
            .attribute_update_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| anyhow::anyhow!("gateway: run() called more than once"))?;

        let ingress_task = {
            let ingress = self.ingress.clone();
            let cancellation = cancellation.clone();
            tokio::spawn(async move { ingress.run(ingress_rx, cancellation).await })
        };
        let uplink_task = {
            let uplink = self.uplink.clone();
            let cancellation = cancellation.clone();
            tokio::spawn(async move { uplink.run(cancellation).await })
        };
        let rpc_task = {
            let rpc = self.rpc.clone();
            let cancellation = cancellation.clone();
            tokio::spawn(async move { rpc.run(rpc_request_rx, cancellation).await })
        };
        let attributes_task = {
            let attributes = self.attributes.clone();
            let cancellation = cancellation.clone();
            tokio::spawn(async move { attributes.run(attribute_update_rx, cancellation).await })
        };

        self.scheduler_loop(cancellation.clone()).await;

        self.stopped.store(true, Ordering::Relaxed);
        info!("gateway: session {} shutting down", self.session_id);

        cancellation.cancel();
        for task in [ingress_task, uplink_task, rpc_task, attributes_task] {
            if let Err(e) = task.await {
                warn!("gateway: worker task panicked during shutdown: {e}");
            }
        }

        self.connectors.close_all().await;
        if let Err(e) = self.storage.stop().await {
            error!("gateway: failed to stop storage cleanly: {e}");
        }
        if let Err(e) = self.cloud.disconnect().await {
            warn!("gateway: failed to disconnect from cloud cleanly: {e}");
        }

        Ok(())
    }

    /// The periodic scheduler (C8, spec §4.8): each tick runs the
    /// reconciliation checks in order, skipping the fallback sleep if any
    /// of them did work (spec §4.8 "if any check fires, the fallback sleep
    /// is skipped").
    async fn scheduler_loop(&self, cancellation: CancellationToken) {
        loop {
            if cancellation.is_cancelled() {
                break;
            }

            let now = crate::utils::now_ms();
            let mut did_work = false;

            did_work |= self.supervisor.tick().await;
            did_work |= self.rpc.run_scheduled(now).await;
            did_work |= self.rpc.reconcile_in_progress(now).await;
            did_work |= self.maybe_emit_statistics().await;
            did_work |= self.maybe_reload_connector_configuration().await;
            did_work |= self.maybe_check_for_updates().await;

            if !did_work {
                tokio::select! {
                    _ = tokio::time::sleep(SCHEDULER_FALLBACK_SLEEP) => {}
                    _ = cancellation.cancelled() => break,
                }
            }
        }
    }

    async fn maybe_emit_statistics(&self) -> bool {
        let period = Duration::from_secs(self.config.thingsboard.stats_send_period_in_seconds);
        let mut last_sent = self.stats_last_sent.lock().await;
        let due = match *last_sent {
            Some(instant) => instant.elapsed() >= period,
            None => true,
        };
        if !due {
            return false;
        }
        *last_sent = Some(Instant::now());
        drop(last_sent);

        let snapshot = self.statistics.snapshot().await;
        debug!("gateway: publishing statistics snapshot: {snapshot}");
        let _ = self
            .cloud
            .send_attributes(json!({ "gatewayStatistics": snapshot }))
            .await;
        true
    }

    /// Spec §4.8 item 6: every `checkConnectorsConfigurationInSeconds`, stat
    /// each connector-config file; if any mtime differs from the
    /// remembered value, close all connectors, reload, reconnect.
    async fn maybe_reload_connector_configuration(&self) -> bool {
        let period = Duration::from_secs(
            self.config
                .thingsboard
                .check_connectors_configuration_in_seconds,
        );
        let mut last_checked = self.connector_reload_last_checked.lock().await;
        let due = match *last_checked {
            Some(instant) => instant.elapsed() >= period,
            None => true,
        };
        if !due {
            return false;
        }
        *last_checked = Some(Instant::now());
        drop(last_checked);

        if !self.connector_config_changed().await {
            return false;
        }

        info!("gateway: connector configuration changed on disk, reloading connectors");
        self.connectors.close_all().await;

        match self.connector_loader.load_connectors(&self.handle).await {
            Ok(connectors) => {
                self.connectors.replace(connectors.clone());
                for connector in &connectors {
                    self.registry.rebind(connector.name(), connector.clone()).await;
                }
                if let Err(e) = self.connector_loader.connect_with_connectors(&connectors).await {
                    error!("gateway: failed to reconnect connectors after reload: {e}");
                }
            }
            Err(e) => error!("gateway: failed to reload connectors: {e}"),
        }

        self.remember_connector_config_mtimes().await;
        true
    }

    async fn connector_config_changed(&self) -> bool {
        let mut mtimes = self.connector_config_mtimes.lock().await;
        let mut changed = false;
        for path in self.connector_loader.config_file_paths() {
            let current = tokio::fs::metadata(&path).await.ok().and_then(|m| m.modified().ok());
            match (mtimes.get(&path), current) {
                (Some(remembered), Some(current)) if *remembered == current => {}
                (None, None) => {}
                _ => changed = true,
            }
        }
        changed
    }

    async fn remember_connector_config_mtimes(&self) {
        let mut mtimes = self.connector_config_mtimes.lock().await;
        mtimes.clear();
        for path in self.connector_loader.config_file_paths() {
            if let Ok(metadata) = tokio::fs::metadata(&path).await {
                if let Ok(modified) = metadata.modified() {
                    mtimes.insert(path, modified);
                }
            }
        }
    }

    /// Spec §4.8 item 7: checks for a newer build every
    /// `updatesCheckPeriodMs`. Does not apply updates automatically — that
    /// is only ever triggered explicitly via the `gateway_update` RPC
    /// (spec §4.6).
    async fn maybe_check_for_updates(&self) -> bool {
        let period = Duration::from_millis(self.config.thingsboard.updates_check_period_ms);
        let mut last_checked = self.update_last_checked.lock().await;
        let due = match *last_checked {
            Some(instant) => instant.elapsed() >= period,
            None => true,
        };
        if !due {
            return false;
        }
        *last_checked = Some(Instant::now());
        drop(last_checked);

        match self.updater.check_latest_version().await {
            Ok(latest) if latest != self.updater.current_version() => {
                info!(
                    "gateway: update available: current={}, latest={latest}",
                    self.updater.current_version()
                );
            }
            Ok(_) => debug!("gateway: no update available"),
            Err(e) => warn!("gateway: update check failed: {e}"),
        }
        true
    }
}
