//! Gateway adapter
//!
//! Owns the upstream session and supervises one child adapter per configured
//! child device. Children publish on their own device topics, unchanged; the
//! gateway's heartbeat probes the upstream, reconciles down children, and
//! publishes a composite status enumerating per-child connectivity. A child
//! stuck in Error never affects its siblings.

use crate::adapter::DeviceAdapter;
use crate::config;
use crate::error::{AdapterError, Result};
use crate::factory;
use crate::gateway::mapping;
use crate::gateway::transport::{GatewayTransport, MockGatewayTransport, TcpProbeTransport};
use crate::session::{AdapterSettings, DeviceSession, SessionState, StopSignal};
use async_trait::async_trait;
use futures_util::future::join_all;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use types::{DeviceRecord, DeviceStatus, GatewayConfig};

struct RunHandle {
    stop: Arc<StopSignal>,
    task: JoinHandle<()>,
}

type ChildMap = HashMap<String, Arc<dyn DeviceAdapter>>;

/// Composite gateway adapter
pub struct GatewayAdapter {
    record: DeviceRecord,
    config: GatewayConfig,
    session: Arc<DeviceSession>,
    transport: Arc<dyn GatewayTransport>,
    settings: AdapterSettings,
    bus: bus::MessageBus,
    children: Arc<tokio::sync::RwLock<ChildMap>>,
    /// Prebuilt children override (tests); config children are used otherwise
    seeded_children: Vec<Arc<dyn DeviceAdapter>>,
    run: tokio::sync::Mutex<Option<RunHandle>>,
}

impl GatewayAdapter {
    pub fn from_record(
        record: &DeviceRecord,
        bus: bus::MessageBus,
        settings: AdapterSettings,
    ) -> Result<Self> {
        let types::ConnectionConfig::Gateway(config) = record.connection.clone() else {
            return Err(AdapterError::Configuration(format!(
                "device {} is not a gateway",
                record.device_id
            )));
        };
        let transport: Arc<dyn GatewayTransport> = if config::mock_enabled(record) {
            Arc::new(MockGatewayTransport::new())
        } else {
            Arc::new(TcpProbeTransport::new(
                record.device_id.clone(),
                config.host.clone(),
                config.port,
            ))
        };
        Ok(Self::with_transport(record, config, bus, settings, transport, Vec::new()))
    }

    /// Full-control constructor; `seeded_children` replaces config-driven
    /// child construction when non-empty.
    pub fn with_transport(
        record: &DeviceRecord,
        config: GatewayConfig,
        bus: bus::MessageBus,
        settings: AdapterSettings,
        transport: Arc<dyn GatewayTransport>,
        seeded_children: Vec<Arc<dyn DeviceAdapter>>,
    ) -> Self {
        let session = Arc::new(DeviceSession::new(
            record.device_id.clone(),
            record.device_type,
            types::ProtocolFamily::Gateway,
            bus.clone(),
        ));
        Self {
            record: record.clone(),
            config,
            session,
            transport,
            settings,
            bus,
            children: Arc::new(tokio::sync::RwLock::new(HashMap::new())),
            seeded_children,
            run: tokio::sync::Mutex::new(None),
        }
    }

    /// Instantiate child adapters (once) and kick off their connects
    async fn spawn_children(&self) -> Result<()> {
        let mut children = self.children.write().await;
        if !children.is_empty() {
            return Ok(());
        }

        if self.seeded_children.is_empty() {
            for spec in &self.config.children {
                let child = mapping::child_record(&self.record, &self.config, spec)?;
                let adapter =
                    factory::build_adapter(&child, self.bus.clone(), self.settings.clone())?;
                children.insert(child.device_id.clone(), adapter);
            }
        } else {
            for adapter in &self.seeded_children {
                children.insert(adapter.device_id().to_string(), Arc::clone(adapter));
            }
        }

        for (device_id, adapter) in children.iter() {
            let adapter = Arc::clone(adapter);
            let device_id = device_id.clone();
            tokio::spawn(async move {
                if let Err(err) = adapter.connect().await {
                    warn!(child = %device_id, error = %err, "child connect failed, supervision will retry");
                }
            });
        }
        info!(
            gateway = %self.session.device_id(),
            children = children.len(),
            "gateway children started"
        );
        Ok(())
    }

    /// Per-child connectivity snapshot
    pub async fn child_status(&self) -> BTreeMap<String, DeviceStatus> {
        let children = self.children.read().await;
        children
            .iter()
            .map(|(id, adapter)| {
                let status = if adapter.is_connected() {
                    DeviceStatus::Online
                } else {
                    DeviceStatus::Offline
                };
                (id.clone(), status)
            })
            .collect()
    }
}

#[async_trait]
impl DeviceAdapter for GatewayAdapter {
    fn session(&self) -> &DeviceSession {
        &self.session
    }

    async fn connect(&self) -> Result<()> {
        {
            let mut run = self.run.lock().await;
            match self.session.state() {
                SessionState::Connected => return Ok(()),
                SessionState::ShuttingDown => return Err(AdapterError::Cancelled),
                SessionState::Connecting => {}
                SessionState::Disconnected | SessionState::Error => {
                    if run.is_none() {
                        self.session.set_state(SessionState::Connecting);
                        let stop = Arc::new(StopSignal::new());
                        let task = tokio::spawn(run_loop(RunContext {
                            session: Arc::clone(&self.session),
                            transport: Arc::clone(&self.transport),
                            children: Arc::clone(&self.children),
                            settings: self.settings.clone(),
                            heartbeat: Duration::from_secs(
                                self.config.heartbeat_interval_secs.max(1),
                            ),
                            stop: Arc::clone(&stop),
                        }));
                        *run = Some(RunHandle { stop, task });
                    }
                }
            }
        }

        let outcome = self.session.wait_while_connecting().await;
        if outcome == SessionState::Connected {
            self.spawn_children().await?;
            Ok(())
        } else {
            Err(AdapterError::ConnectionRefused {
                device: self.session.device_id().to_string(),
                reason: "upstream connect failed".to_string(),
            })
        }
    }

    async fn disconnect(&self) -> Result<()> {
        let handle = self.run.lock().await.take();
        if let Some(RunHandle { stop, task }) = handle {
            stop.trigger();
            if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
                warn!(gateway = %self.session.device_id(), "session task did not stop in time");
            }
        }

        // Children go down with the gateway, each on its own disconnect.
        let children: Vec<_> = self.children.write().await.drain().collect();
        let silenced = self.session.is_silenced();
        let results = join_all(children.into_iter().map(|(device_id, adapter)| async move {
            if silenced {
                adapter.session().set_state(SessionState::ShuttingDown);
            }
            (device_id, adapter.disconnect().await)
        }))
        .await;
        for (device_id, result) in results {
            if let Err(err) = result {
                warn!(child = %device_id, error = %err, "child disconnect failed");
            }
        }

        self.transport.close().await.ok();
        if !self.session.is_silenced() {
            self.session.set_state(SessionState::Disconnected);
            self.session.publish_offline()?;
        }
        Ok(())
    }

    async fn execute_command(&self, command: &str, _parameters: Value) -> Result<Value> {
        match command {
            "getChildStatus" => Ok(serde_json::to_value(self.child_status().await)?),
            other => Err(AdapterError::UnsupportedCommand {
                command: other.to_string(),
            }),
        }
    }
}

struct RunContext {
    session: Arc<DeviceSession>,
    transport: Arc<dyn GatewayTransport>,
    children: Arc<tokio::sync::RwLock<ChildMap>>,
    settings: AdapterSettings,
    heartbeat: Duration,
    stop: Arc<StopSignal>,
}

async fn run_loop(ctx: RunContext) {
    loop {
        if ctx.stop.is_triggered() {
            break;
        }
        ctx.session.set_state(SessionState::Connecting);
        let attempt = ctx.session.record_attempt();

        match ctx.transport.open().await {
            Ok(()) => {
                ctx.session.record_connect_success();
                ctx.session.set_state(SessionState::Connected);
                let _ = ctx.session.publish_online(None);
                info!(gateway = %ctx.session.device_id(), "gateway upstream connected");

                match supervise_phase(&ctx).await {
                    None => break,
                    Some(err) => {
                        warn!(gateway = %ctx.session.device_id(), error = %err, "upstream error");
                        ctx.transport.close().await.ok();
                        ctx.session.set_state(SessionState::Error);
                        let _ = ctx.session.publish_error(err.kind());
                    }
                }
            }
            Err(err) => {
                ctx.session.record_connect_failure(&err);
                ctx.session.set_state(SessionState::Error);
                let _ = ctx.session.publish_error(err.to_string());
                if attempt >= ctx.settings.reconnect.max_attempts {
                    warn!(gateway = %ctx.session.device_id(), attempt, "retrying at capped interval");
                }
            }
        }

        let delay = ctx
            .settings
            .reconnect
            .delay_for_attempt(ctx.session.connection_attempts().max(1));
        debug!(gateway = %ctx.session.device_id(), ?delay, "reconnect scheduled");
        tokio::select! {
            _ = ctx.stop.wait() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
    ctx.transport.close().await.ok();
}

/// Heartbeat supervision: probe upstream, reconcile children, publish the
/// composite status. Returns the upstream error that ended the phase, or
/// None when stopped.
async fn supervise_phase(ctx: &RunContext) -> Option<AdapterError> {
    let mut ticker = tokio::time::interval(ctx.heartbeat);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ctx.stop.wait() => return None,
            _ = ticker.tick() => {
                if let Err(err) = ctx.transport.probe().await {
                    if err.triggers_reconnect() {
                        return Some(err);
                    }
                    warn!(gateway = %ctx.session.device_id(), error = %err, "probe error, continuing");
                }
                ctx.session.mark_seen();

                let mut statuses = BTreeMap::new();
                let children = ctx.children.read().await;
                for (device_id, adapter) in children.iter() {
                    if adapter.is_connected() {
                        statuses.insert(device_id.clone(), DeviceStatus::Online);
                    } else {
                        statuses.insert(device_id.clone(), DeviceStatus::Offline);
                        // Retry the child without holding up its siblings.
                        let adapter = Arc::clone(adapter);
                        let device_id = device_id.clone();
                        tokio::spawn(async move {
                            if let Err(err) = adapter.connect().await {
                                debug!(child = %device_id, error = %err, "child retry failed");
                            }
                        });
                    }
                }
                drop(children);

                let _ = ctx.session.publish_composite_status(DeviceStatus::Online, statuses);
                let _ = ctx.session.publish_event("heartbeat", json!({}));
            }
        }
    }
}
