//! EEBus adapter
//!
//! Push-style: after a SKI-verified handshake the peer streams datapoint
//! updates which the adapter folds into a latest-values map; a 60 s
//! heartbeat publishes the snapshot and refreshes liveness. The wire here is
//! the line-oriented bridge protocol spoken by SHIP gateway appliances;
//! direct SHIP/SPINE termination stays outside this crate.

use crate::adapter::DeviceAdapter;
use crate::config;
use crate::error::{AdapterError, Result};
use crate::session::{AdapterSettings, DeviceSession, SessionState, StopSignal};
use crate::sim::SimProfile;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use types::{telemetry, DataPointSpec, DeviceRecord, EebusConfig};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

/// One pushed measurement
#[derive(Debug, Clone, PartialEq)]
pub struct DatapointUpdate {
    pub name: String,
    pub value: f64,
}

/// EEBus wire operations
#[async_trait]
pub trait EebusTransport: Send + Sync {
    /// Open the session, verifying the peer's SKI
    async fn connect(&self) -> Result<()>;
    async fn close(&self) -> Result<()>;
    fn is_open(&self) -> bool;
    /// Next pushed update; `Ok(None)` is an orderly close
    async fn next_update(&self) -> Result<Option<DatapointUpdate>>;
    /// Write a controllable datapoint
    async fn write(&self, name: &str, value: f64) -> Result<()>;
}

/// Line-oriented SHIP-gateway bridge client
pub struct ShipLineTransport {
    device: String,
    host: String,
    port: u16,
    ski: String,
    stream: Mutex<Option<BufReader<TcpStream>>>,
    open: AtomicBool,
}

impl ShipLineTransport {
    pub fn new(
        device: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        ski: impl Into<String>,
    ) -> Self {
        Self {
            device: device.into(),
            host: host.into(),
            port,
            ski: ski.into(),
            stream: Mutex::new(None),
            open: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl EebusTransport for ShipLineTransport {
    async fn connect(&self) -> Result<()> {
        if self.is_open() {
            return Ok(());
        }
        let connect = TcpStream::connect((self.host.as_str(), self.port));
        let stream = match timeout(CONNECT_TIMEOUT, connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                return Err(AdapterError::ConnectionRefused {
                    device: self.device.clone(),
                    reason: err.to_string(),
                })
            }
            Err(_) => {
                return Err(AdapterError::Timeout {
                    device: self.device.clone(),
                    timeout_ms: CONNECT_TIMEOUT.as_millis() as u64,
                })
            }
        };
        let mut reader = BufReader::new(stream);

        // SKI exchange before anything else flows.
        let hello = json!({ "type": "init", "ski": self.ski }).to_string() + "\n";
        reader.get_mut().write_all(hello.as_bytes()).await?;
        let mut line = String::new();
        timeout(CONNECT_TIMEOUT, reader.read_line(&mut line))
            .await
            .map_err(|_| AdapterError::Timeout {
                device: self.device.clone(),
                timeout_ms: CONNECT_TIMEOUT.as_millis() as u64,
            })??;
        let accept: Value = serde_json::from_str(line.trim())?;
        let peer_ski = accept.get("ski").and_then(Value::as_str).unwrap_or_default();
        if accept.get("type").and_then(Value::as_str) != Some("accept") || peer_ski != self.ski {
            return Err(AdapterError::ProtocolViolation {
                device: self.device.clone(),
                details: format!("SKI mismatch: {}", peer_ski),
            });
        }

        *self.stream.lock().await = Some(reader);
        self.open.store(true, Ordering::Release);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.open.store(false, Ordering::Release);
        if let Some(mut reader) = self.stream.lock().await.take() {
            reader.get_mut().shutdown().await.ok();
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    async fn next_update(&self) -> Result<Option<DatapointUpdate>> {
        let mut guard = self.stream.lock().await;
        let reader = guard.as_mut().ok_or_else(|| AdapterError::ConnectionRefused {
            device: self.device.clone(),
            reason: "Not connected".to_string(),
        })?;
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            self.open.store(false, Ordering::Release);
            return Ok(None);
        }
        let value: Value = serde_json::from_str(line.trim())?;
        let name = value
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| AdapterError::ProtocolViolation {
                device: self.device.clone(),
                details: "update without name".to_string(),
            })?
            .to_string();
        let number = value
            .get("value")
            .and_then(Value::as_f64)
            .ok_or_else(|| AdapterError::ProtocolViolation {
                device: self.device.clone(),
                details: "update without numeric value".to_string(),
            })?;
        Ok(Some(DatapointUpdate {
            name,
            value: number,
        }))
    }

    async fn write(&self, name: &str, value: f64) -> Result<()> {
        let mut guard = self.stream.lock().await;
        let reader = guard.as_mut().ok_or_else(|| AdapterError::ConnectionRefused {
            device: self.device.clone(),
            reason: "Not connected".to_string(),
        })?;
        let line = json!({ "type": "write", "name": name, "value": value }).to_string() + "\n";
        reader.get_mut().write_all(line.as_bytes()).await?;
        Ok(())
    }
}

/// Simulated EEBus peer: cycles through the configured datapoints, one
/// update per `push_period`
pub struct MockEebusTransport {
    profile: SimProfile,
    datapoints: Vec<DataPointSpec>,
    push_period: Duration,
    cursor: AtomicU64,
    open: AtomicBool,
    writes: StdMutex<Vec<(String, f64)>>,
}

impl MockEebusTransport {
    pub fn new(profile: SimProfile, datapoints: Vec<DataPointSpec>, push_period: Duration) -> Self {
        Self {
            profile,
            datapoints,
            push_period,
            cursor: AtomicU64::new(0),
            open: AtomicBool::new(false),
            writes: StdMutex::new(Vec::new()),
        }
    }

    pub fn writes(&self) -> Vec<(String, f64)> {
        self.writes.lock().expect("mock writes poisoned").clone()
    }
}

#[async_trait]
impl EebusTransport for MockEebusTransport {
    async fn connect(&self) -> Result<()> {
        self.open.store(true, Ordering::Release);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.open.store(false, Ordering::Release);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    async fn next_update(&self) -> Result<Option<DatapointUpdate>> {
        if !self.is_open() {
            return Ok(None);
        }
        if self.datapoints.is_empty() {
            tokio::time::sleep(self.push_period).await;
            return Ok(None);
        }
        tokio::time::sleep(self.push_period).await;
        let n = self.cursor.fetch_add(1, Ordering::Relaxed);
        let spec = &self.datapoints[(n % self.datapoints.len() as u64) as usize];
        let tick = n / self.datapoints.len() as u64;
        let channel = spec
            .canonical
            .as_deref()
            .or_else(|| telemetry::canonical_channel(&spec.name))
            .unwrap_or(&spec.name);
        Ok(Some(DatapointUpdate {
            name: spec.name.clone(),
            value: self.profile.value(channel, tick),
        }))
    }

    async fn write(&self, name: &str, value: f64) -> Result<()> {
        self.writes
            .lock()
            .expect("mock writes poisoned")
            .push((name.to_string(), value));
        Ok(())
    }
}

struct RunHandle {
    stop: Arc<StopSignal>,
    task: JoinHandle<()>,
}

/// EEBus device adapter
pub struct EebusAdapter {
    config: EebusConfig,
    session: Arc<DeviceSession>,
    transport: Arc<dyn EebusTransport>,
    settings: AdapterSettings,
    latest: Arc<StdMutex<BTreeMap<String, f64>>>,
    run: tokio::sync::Mutex<Option<RunHandle>>,
}

impl EebusAdapter {
    pub fn from_record(
        record: &DeviceRecord,
        bus: bus::MessageBus,
        settings: AdapterSettings,
    ) -> Result<Self> {
        let types::ConnectionConfig::Eebus(config) = record.connection.clone() else {
            return Err(AdapterError::Configuration(format!(
                "device {} is not an eebus device",
                record.device_id
            )));
        };
        let transport: Arc<dyn EebusTransport> = if config::mock_enabled(record) {
            Arc::new(MockEebusTransport::new(
                SimProfile::new(record.device_type, record.id),
                config.datapoints.clone(),
                Duration::from_secs(5),
            ))
        } else {
            Arc::new(ShipLineTransport::new(
                record.device_id.clone(),
                config.host.clone(),
                config.port,
                config.ski.clone(),
            ))
        };
        Ok(Self::with_transport(record, config, bus, settings, transport))
    }

    pub fn with_transport(
        record: &DeviceRecord,
        config: EebusConfig,
        bus: bus::MessageBus,
        settings: AdapterSettings,
        transport: Arc<dyn EebusTransport>,
    ) -> Self {
        let session = Arc::new(DeviceSession::new(
            record.device_id.clone(),
            record.device_type,
            types::ProtocolFamily::Eebus,
            bus,
        ));
        Self {
            config,
            session,
            transport,
            settings,
            latest: Arc::new(StdMutex::new(BTreeMap::new())),
            run: tokio::sync::Mutex::new(None),
        }
    }

    fn datapoint(&self, name: &str) -> Result<&DataPointSpec> {
        self.config
            .datapoints
            .iter()
            .find(|d| d.name == name)
            .ok_or_else(|| AdapterError::UnknownRegister {
                name: name.to_string(),
            })
    }
}

#[async_trait]
impl DeviceAdapter for EebusAdapter {
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
                            datapoints: self.config.datapoints.clone(),
                            settings: self.settings.clone(),
                            latest: Arc::clone(&self.latest),
                            stop: Arc::clone(&stop),
                        }));
                        *run = Some(RunHandle { stop, task });
                    }
                }
            }
        }
        match self.session.wait_while_connecting().await {
            SessionState::Connected => Ok(()),
            _ => Err(AdapterError::ConnectionRefused {
                device: self.session.device_id().to_string(),
                reason: "connect attempt failed".to_string(),
            }),
        }
    }

    async fn disconnect(&self) -> Result<()> {
        let handle = self.run.lock().await.take();
        if let Some(RunHandle { stop, task }) = handle {
            stop.trigger();
            if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
                warn!(device = %self.session.device_id(), "session task did not stop in time");
            }
        }
        self.transport.close().await.ok();
        if !self.session.is_silenced() {
            self.session.set_state(SessionState::Disconnected);
            self.session.publish_offline()?;
        }
        Ok(())
    }

    // Event-driven: scanning controls are no-ops.

    async fn execute_command(&self, command: &str, parameters: Value) -> Result<Value> {
        match command {
            "readDatapoint" => {
                let name = parameters
                    .get("name")
                    .and_then(Value::as_str)
                    .ok_or_else(|| AdapterError::Configuration("missing datapoint name".into()))?;
                self.datapoint(name)?;
                let latest = self.latest.lock().expect("latest map poisoned");
                let value = latest.get(name).copied();
                Ok(json!({ "name": name, "value": value }))
            }
            "writeDatapoint" => {
                let name = parameters
                    .get("name")
                    .and_then(Value::as_str)
                    .ok_or_else(|| AdapterError::Configuration("missing datapoint name".into()))?;
                let value = parameters
                    .get("value")
                    .and_then(Value::as_f64)
                    .ok_or_else(|| AdapterError::Configuration("missing numeric value".into()))?;
                let spec = self.datapoint(name)?;
                if !matches!(
                    spec.access,
                    types::DataPointAccess::Write | types::DataPointAccess::ReadWrite
                ) {
                    return Err(AdapterError::ReadOnlyRegister {
                        name: name.to_string(),
                    });
                }
                self.transport.write(name, value).await?;
                Ok(json!({ "name": name, "value": value }))
            }
            other => Err(AdapterError::UnsupportedCommand {
                command: other.to_string(),
            }),
        }
    }
}

struct RunContext {
    session: Arc<DeviceSession>,
    transport: Arc<dyn EebusTransport>,
    datapoints: Vec<DataPointSpec>,
    settings: AdapterSettings,
    latest: Arc<StdMutex<BTreeMap<String, f64>>>,
    stop: Arc<StopSignal>,
}

async fn run_loop(ctx: RunContext) {
    loop {
        if ctx.stop.is_triggered() {
            break;
        }
        ctx.session.set_state(SessionState::Connecting);
        let attempt = ctx.session.record_attempt();

        match ctx.transport.connect().await {
            Ok(()) => {
                ctx.session.record_connect_success();
                ctx.session.set_state(SessionState::Connected);
                let _ = ctx.session.publish_online(None);
                info!(device = %ctx.session.device_id(), "eebus session connected");

                match subscribed_phase(&ctx).await {
                    None => break,
                    Some(err) => {
                        warn!(device = %ctx.session.device_id(), error = %err, "eebus wire error");
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
                    warn!(device = %ctx.session.device_id(), attempt, "retrying at capped interval");
                }
            }
        }

        let delay = ctx
            .settings
            .reconnect
            .delay_for_attempt(ctx.session.connection_attempts().max(1));
        debug!(device = %ctx.session.device_id(), ?delay, "reconnect scheduled");
        tokio::select! {
            _ = ctx.stop.wait() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
    ctx.transport.close().await.ok();
}

/// Returns the wire error that ended the phase, or None when stopped
async fn subscribed_phase(ctx: &RunContext) -> Option<AdapterError> {
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    heartbeat.tick().await;

    loop {
        tokio::select! {
            _ = ctx.stop.wait() => return None,

            update = ctx.transport.next_update() => match update {
                Ok(Some(update)) => {
                    ctx.session.mark_seen();
                    apply_update(ctx, update);
                }
                Ok(None) => {
                    return Some(AdapterError::ConnectionRefused {
                        device: ctx.session.device_id().to_string(),
                        reason: "peer closed".to_string(),
                    })
                }
                Err(err) if err.triggers_reconnect() => return Some(err),
                Err(err) => {
                    warn!(device = %ctx.session.device_id(), error = %err, "bad update, continuing");
                }
            },

            _ = heartbeat.tick() => {
                ctx.session.mark_seen();
                publish_snapshot(ctx);
            }
        }
    }
}

fn apply_update(ctx: &RunContext, update: DatapointUpdate) {
    ctx.latest
        .lock()
        .expect("latest map poisoned")
        .insert(update.name.clone(), update.value);
    publish_snapshot(ctx);
}

fn publish_snapshot(ctx: &RunContext) {
    let latest = ctx.latest.lock().expect("latest map poisoned").clone();
    if latest.is_empty() {
        return;
    }
    let mut readings = BTreeMap::new();
    let mut units = BTreeMap::new();
    for (name, value) in latest {
        let spec = ctx.datapoints.iter().find(|d| d.name == name);
        let canonical = spec
            .and_then(|s| s.canonical.as_deref())
            .or_else(|| telemetry::canonical_channel(&name));
        if let Some(channel) = canonical {
            if channel != name {
                readings.insert(channel.to_string(), value);
            }
            let unit = spec
                .and_then(|s| s.unit.clone())
                .or_else(|| telemetry::default_unit(channel).map(String::from));
            if let Some(unit) = unit {
                units.insert(channel.to_string(), unit);
            }
        }
        if let Some(unit) = spec.and_then(|s| s.unit.clone()) {
            units.insert(name.clone(), unit);
        }
        readings.insert(name, value);
    }
    let _ = ctx.session.publish_telemetry(readings, units, None);
}

#[cfg(test)]
mod tests {
    use super::*;
    use types::{ConnectionConfig, DataPointAccess, DeviceType, RegisterDataType};

    fn datapoint(name: &str, access: DataPointAccess) -> DataPointSpec {
        DataPointSpec {
            name: name.to_string(),
            address: 0,
            data_type: RegisterDataType::Float32,
            unit: None,
            scale: 1.0,
            access,
            canonical: None,
        }
    }

    fn record() -> DeviceRecord {
        DeviceRecord {
            id: 5,
            device_id: "hp-5".to_string(),
            site_id: 7,
            device_type: DeviceType::HeatPump,
            connection: ConnectionConfig::Eebus(EebusConfig {
                host: "127.0.0.1".to_string(),
                port: 4711,
                ski: "ab-cd-ef".to_string(),
                datapoints: vec![
                    datapoint("power", DataPointAccess::Read),
                    datapoint("temperature", DataPointAccess::ReadWrite),
                ],
                mock: true,
            }),
        }
    }

    #[tokio::test]
    async fn pushed_updates_become_telemetry() {
        let record = record();
        let bus = bus::MessageBus::new();
        let (_h, mut rx) = bus.subscribe_channel("devices/hp-5/telemetry");
        let types::ConnectionConfig::Eebus(config) = record.connection.clone() else {
            unreachable!();
        };
        let transport = Arc::new(MockEebusTransport::new(
            SimProfile::without_jitter(DeviceType::HeatPump, 5),
            config.datapoints.clone(),
            Duration::from_millis(10),
        ));
        let adapter = EebusAdapter::with_transport(
            &record,
            config,
            bus,
            AdapterSettings::default(),
            transport,
        );
        adapter.connect().await.unwrap();

        let publication = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("telemetry expected")
            .unwrap();
        let types::BusMessage::Telemetry(t) = &*publication.message else {
            panic!("expected telemetry");
        };
        assert!(t.readings.contains_key("power"));
        adapter.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn write_respects_access_declarations() {
        let record = record();
        let types::ConnectionConfig::Eebus(config) = record.connection.clone() else {
            unreachable!();
        };
        let transport = Arc::new(MockEebusTransport::new(
            SimProfile::without_jitter(DeviceType::HeatPump, 5),
            config.datapoints.clone(),
            Duration::from_secs(60),
        ));
        let adapter = EebusAdapter::with_transport(
            &record,
            config,
            bus::MessageBus::new(),
            AdapterSettings::default(),
            Arc::clone(&transport) as Arc<dyn EebusTransport>,
        );
        adapter.transport.connect().await.unwrap();

        let err = adapter
            .execute_command("writeDatapoint", json!({"name": "power", "value": 1.0}))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "ReadOnlyRegister");

        adapter
            .execute_command("writeDatapoint", json!({"name": "temperature", "value": 40.0}))
            .await
            .unwrap();
        assert_eq!(transport.writes(), vec![("temperature".to_string(), 40.0)]);

        let err = adapter
            .execute_command("readDatapoint", json!({"name": "bogus"}))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "UnknownRegister");
    }
}
