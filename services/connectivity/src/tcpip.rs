//! Generic TCP/IP adapter
//!
//! Catch-all for devices speaking a plain TCP line protocol: the adapter
//! polls with a `{"type":"read"}` request and the device answers one
//! newline-delimited JSON object of named numeric readings. The poll loop is
//! the heartbeat, like the Modbus scan.

use crate::adapter::DeviceAdapter;
use crate::config;
use crate::error::{AdapterError, Result};
use crate::session::{AdapterSettings, DeviceSession, SessionState, StopSignal};
use crate::sim::SimProfile;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use types::{telemetry, DeviceRecord, TcpipConfig};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Poll-style reading source
#[async_trait]
pub trait ReadingTransport: Send + Sync {
    async fn open(&self) -> Result<()>;
    async fn close(&self) -> Result<()>;
    fn is_open(&self) -> bool;
    /// Current readings, keyed by channel name
    async fn fetch(&self) -> Result<BTreeMap<String, f64>>;
}

/// Newline-delimited JSON over TCP
pub struct TcpLineTransport {
    device: String,
    host: String,
    port: u16,
    stream: Mutex<Option<BufReader<TcpStream>>>,
    open: AtomicBool,
}

impl TcpLineTransport {
    pub fn new(device: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            device: device.into(),
            host: host.into(),
            port,
            stream: Mutex::new(None),
            open: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl ReadingTransport for TcpLineTransport {
    async fn open(&self) -> Result<()> {
        if self.is_open() {
            return Ok(());
        }
        let connect = TcpStream::connect((self.host.as_str(), self.port));
        match timeout(CONNECT_TIMEOUT, connect).await {
            Ok(Ok(stream)) => {
                *self.stream.lock().await = Some(BufReader::new(stream));
                self.open.store(true, Ordering::Release);
                Ok(())
            }
            Ok(Err(err)) => Err(AdapterError::ConnectionRefused {
                device: self.device.clone(),
                reason: err.to_string(),
            }),
            Err(_) => Err(AdapterError::Timeout {
                device: self.device.clone(),
                timeout_ms: CONNECT_TIMEOUT.as_millis() as u64,
            }),
        }
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

    async fn fetch(&self) -> Result<BTreeMap<String, f64>> {
        let mut guard = self.stream.lock().await;
        let reader = guard.as_mut().ok_or_else(|| AdapterError::ConnectionRefused {
            device: self.device.clone(),
            reason: "Not connected".to_string(),
        })?;

        let io = async {
            reader
                .get_mut()
                .write_all(b"{\"type\":\"read\"}\n")
                .await?;
            let mut line = String::new();
            let n = reader.read_line(&mut line).await?;
            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "peer closed",
                ));
            }
            Ok(line)
        };
        let line = match timeout(RESPONSE_TIMEOUT, io).await {
            Ok(Ok(line)) => line,
            Ok(Err(err)) => {
                *guard = None;
                self.open.store(false, Ordering::Release);
                return Err(err.into());
            }
            Err(_) => {
                *guard = None;
                self.open.store(false, Ordering::Release);
                return Err(AdapterError::Timeout {
                    device: self.device.clone(),
                    timeout_ms: RESPONSE_TIMEOUT.as_millis() as u64,
                });
            }
        };

        let value: Value = serde_json::from_str(line.trim())?;
        let object = value.as_object().ok_or_else(|| AdapterError::ProtocolViolation {
            device: self.device.clone(),
            details: "readings frame is not an object".to_string(),
        })?;
        Ok(object
            .iter()
            .filter_map(|(k, v)| v.as_f64().map(|n| (k.clone(), n)))
            .collect())
    }
}

/// Simulated reading source; tick advances on every fetch
pub struct MockReadingTransport {
    profile: SimProfile,
    channels: Vec<String>,
    tick: AtomicU64,
    open: AtomicBool,
    fail_connects_remaining: AtomicU64,
    fail_fetches: AtomicBool,
}

impl MockReadingTransport {
    pub fn new(profile: SimProfile, channels: Vec<String>) -> Self {
        Self {
            profile,
            channels,
            tick: AtomicU64::new(0),
            open: AtomicBool::new(false),
            fail_connects_remaining: AtomicU64::new(0),
            fail_fetches: AtomicBool::new(false),
        }
    }

    pub fn fail_connects(&self, n: u64) {
        self.fail_connects_remaining.store(n, Ordering::Release);
    }

    pub fn set_fail_fetches(&self, fail: bool) {
        self.fail_fetches.store(fail, Ordering::Release);
    }
}

#[async_trait]
impl ReadingTransport for MockReadingTransport {
    async fn open(&self) -> Result<()> {
        let remaining = self.fail_connects_remaining.load(Ordering::Acquire);
        if remaining > 0 {
            self.fail_connects_remaining.store(remaining - 1, Ordering::Release);
            return Err(AdapterError::ConnectionRefused {
                device: "mock".to_string(),
                reason: "Connection timed out".to_string(),
            });
        }
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

    async fn fetch(&self) -> Result<BTreeMap<String, f64>> {
        if !self.is_open() {
            return Err(AdapterError::ConnectionRefused {
                device: "mock".to_string(),
                reason: "Not connected".to_string(),
            });
        }
        if self.fail_fetches.load(Ordering::Acquire) {
            return Err(AdapterError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "Connection timed out",
            )));
        }
        let tick = self.tick.fetch_add(1, Ordering::Relaxed);
        Ok(self
            .channels
            .iter()
            .map(|c| (c.clone(), self.profile.value(c, tick)))
            .collect())
    }
}

struct RunHandle {
    stop: Arc<StopSignal>,
    task: JoinHandle<()>,
}

/// Generic TCP/IP device adapter
pub struct TcpipAdapter {
    config: TcpipConfig,
    session: Arc<DeviceSession>,
    transport: Arc<dyn ReadingTransport>,
    settings: AdapterSettings,
    scanning: Arc<AtomicBool>,
    run: tokio::sync::Mutex<Option<RunHandle>>,
}

impl TcpipAdapter {
    pub fn from_record(
        record: &DeviceRecord,
        bus: bus::MessageBus,
        settings: AdapterSettings,
    ) -> Result<Self> {
        let types::ConnectionConfig::Tcpip(config) = record.connection.clone() else {
            return Err(AdapterError::Configuration(format!(
                "device {} is not a tcpip device",
                record.device_id
            )));
        };
        let transport: Arc<dyn ReadingTransport> = if config::mock_enabled(record) {
            Arc::new(MockReadingTransport::new(
                SimProfile::new(record.device_type, record.id),
                default_channels(record.device_type),
            ))
        } else {
            Arc::new(TcpLineTransport::new(
                record.device_id.clone(),
                config.host.clone(),
                config.port,
            ))
        };
        Ok(Self::with_transport(record, config, bus, settings, transport))
    }

    pub fn with_transport(
        record: &DeviceRecord,
        config: TcpipConfig,
        bus: bus::MessageBus,
        settings: AdapterSettings,
        transport: Arc<dyn ReadingTransport>,
    ) -> Self {
        let session = Arc::new(DeviceSession::new(
            record.device_id.clone(),
            record.device_type,
            types::ProtocolFamily::Tcpip,
            bus,
        ));
        Self {
            config,
            session,
            transport,
            settings,
            scanning: Arc::new(AtomicBool::new(true)),
            run: tokio::sync::Mutex::new(None),
        }
    }
}

/// Channels a simulated device of this type exposes
fn default_channels(device_type: types::DeviceType) -> Vec<String> {
    use types::telemetry::channel;
    use types::DeviceType;
    let mut channels = vec![channel::POWER.to_string(), channel::ENERGY.to_string()];
    match device_type {
        DeviceType::BatteryStorage => channels.push(channel::STATE_OF_CHARGE.to_string()),
        DeviceType::HeatPump => channels.push(channel::TEMPERATURE.to_string()),
        DeviceType::SmartMeter => {
            channels.push(channel::VOLTAGE.to_string());
            channels.push(channel::FREQUENCY.to_string());
        }
        _ => {}
    }
    channels
}

#[async_trait]
impl DeviceAdapter for TcpipAdapter {
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
                            config: self.config.clone(),
                            settings: self.settings.clone(),
                            scanning: Arc::clone(&self.scanning),
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

    async fn start_scanning(&self) -> Result<()> {
        self.scanning.store(true, Ordering::Release);
        Ok(())
    }

    async fn stop_scanning(&self) -> Result<()> {
        self.scanning.store(false, Ordering::Release);
        Ok(())
    }

    async fn execute_command(&self, command: &str, _parameters: Value) -> Result<Value> {
        match command {
            "read" => {
                let readings = self.transport.fetch().await?;
                Ok(json!(readings))
            }
            other => Err(AdapterError::UnsupportedCommand {
                command: other.to_string(),
            }),
        }
    }
}

struct RunContext {
    session: Arc<DeviceSession>,
    transport: Arc<dyn ReadingTransport>,
    config: TcpipConfig,
    settings: AdapterSettings,
    scanning: Arc<AtomicBool>,
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
                info!(device = %ctx.session.device_id(), "tcpip session connected");

                if let Some(err) = poll_phase(&ctx).await {
                    warn!(device = %ctx.session.device_id(), error = %err, "tcpip wire error");
                    ctx.transport.close().await.ok();
                    ctx.session.set_state(SessionState::Error);
                    let _ = ctx.session.publish_error(err.kind());
                } else {
                    break; // stopped
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
async fn poll_phase(ctx: &RunContext) -> Option<AdapterError> {
    let period = Duration::from_millis(ctx.config.poll_interval_ms.max(1));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ctx.stop.wait() => return None,
            _ = ticker.tick() => {
                if !ctx.scanning.load(Ordering::Acquire) {
                    ctx.session.mark_seen();
                    continue;
                }
                match ctx.transport.fetch().await {
                    Ok(raw) => {
                        ctx.session.mark_seen();
                        let mut readings = BTreeMap::new();
                        let mut units = BTreeMap::new();
                        for (name, value) in raw {
                            if let Some(canonical) = telemetry::canonical_channel(&name) {
                                if canonical != name {
                                    readings.insert(canonical.to_string(), value);
                                }
                                if let Some(unit) = telemetry::default_unit(canonical) {
                                    units.insert(canonical.to_string(), unit.to_string());
                                }
                            }
                            if let Some(unit) = telemetry::default_unit(&name) {
                                units.insert(name.clone(), unit.to_string());
                            }
                            readings.insert(name, value);
                        }
                        let _ = ctx.session.publish_telemetry(readings, units, None);
                    }
                    Err(err) if err.triggers_reconnect() => return Some(err),
                    Err(err) => {
                        warn!(device = %ctx.session.device_id(), error = %err, "poll error, continuing");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use types::{ConnectionConfig, DeviceType};

    fn record() -> DeviceRecord {
        DeviceRecord {
            id: 3,
            device_id: "meter-3".to_string(),
            site_id: 7,
            device_type: DeviceType::SmartMeter,
            connection: ConnectionConfig::Tcpip(TcpipConfig {
                host: "127.0.0.1".to_string(),
                port: 9009,
                poll_interval_ms: 100,
                mock: true,
            }),
        }
    }

    #[tokio::test]
    async fn mock_transport_ticks_deterministically() {
        let transport = MockReadingTransport::new(
            SimProfile::without_jitter(DeviceType::SmartMeter, 3),
            default_channels(DeviceType::SmartMeter),
        );
        transport.open().await.unwrap();
        let first = transport.fetch().await.unwrap();
        let second = transport.fetch().await.unwrap();
        assert!(first.contains_key("power"));
        assert!(first.contains_key("voltage"));
        assert!(second["energy"] > first["energy"]);
    }

    #[tokio::test]
    async fn poll_loop_publishes_telemetry() {
        let record = record();
        let bus = bus::MessageBus::new();
        let (_h, mut rx) = bus.subscribe_channel("devices/meter-3/telemetry");
        let adapter = TcpipAdapter::from_record(&record, bus, AdapterSettings::default()).unwrap();
        adapter.connect().await.unwrap();

        let publication = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("telemetry expected")
            .unwrap();
        let types::BusMessage::Telemetry(t) = &*publication.message else {
            panic!("expected telemetry");
        };
        assert_eq!(t.device_id, "meter-3");
        assert!(t.readings.contains_key("power"));

        adapter.disconnect().await.unwrap();
        assert_eq!(adapter.state(), SessionState::Disconnected);
    }
}
