//! Modbus device adapter
//!
//! One session per device: a scan task polls the configured registers every
//! `scan_interval_ms`, publishes one telemetry message per scan, and doubles
//! as the heartbeat. Wire errors flip the session to Error and arm the
//! reconnect backoff; decode errors skip the register and continue.

use crate::adapter::DeviceAdapter;
use crate::config;
use crate::error::{AdapterError, Result};
use crate::modbus::registers::{self, RegisterValue};
use crate::modbus::transport::{
    Framing, MockModbusTransport, ModbusTransport, SimulatedModbusTransport, TcpTransport,
};
use crate::session::{AdapterSettings, DeviceSession, SessionState, StopSignal};
use crate::sim::SimProfile;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use types::{telemetry, DeviceRecord, ModbusConfig, RegisterSpec};

struct RunHandle {
    stop: Arc<StopSignal>,
    task: JoinHandle<()>,
}

/// Modbus polling adapter
pub struct ModbusAdapter {
    config: ModbusConfig,
    session: Arc<DeviceSession>,
    transport: Arc<dyn ModbusTransport>,
    settings: AdapterSettings,
    scanning: Arc<AtomicBool>,
    run: tokio::sync::Mutex<Option<RunHandle>>,
}

impl ModbusAdapter {
    /// Build from a device record, choosing the transport from the mock
    /// flag / development switch.
    pub fn from_record(
        record: &DeviceRecord,
        bus: bus::MessageBus,
        settings: AdapterSettings,
    ) -> Result<Self> {
        let types::ConnectionConfig::Modbus(config) = record.connection.clone() else {
            return Err(AdapterError::Configuration(format!(
                "device {} is not a modbus device",
                record.device_id
            )));
        };

        let transport: Arc<dyn ModbusTransport> = if config::mock_enabled(record) {
            Arc::new(SimulatedModbusTransport::new(
                config.registers.clone(),
                SimProfile::new(record.device_type, record.id),
                Duration::from_millis(config.scan_interval_ms),
            ))
        } else {
            let framing = if config.serial.is_some() {
                Framing::Rtu
            } else {
                Framing::Tcp
            };
            Arc::new(TcpTransport::with_framing(
                record.device_id.clone(),
                config.host.clone(),
                config.port,
                framing,
            ))
        };

        Ok(Self::with_transport(record, config, bus, settings, transport))
    }

    /// Build with an explicit transport (tests, gateways)
    pub fn with_transport(
        record: &DeviceRecord,
        config: ModbusConfig,
        bus: bus::MessageBus,
        settings: AdapterSettings,
        transport: Arc<dyn ModbusTransport>,
    ) -> Self {
        let session = Arc::new(DeviceSession::new(
            record.device_id.clone(),
            record.device_type,
            types::ProtocolFamily::Modbus,
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

    /// Convenience: adapter over a scripted [`MockModbusTransport`]
    pub fn with_mock(
        record: &DeviceRecord,
        config: ModbusConfig,
        bus: bus::MessageBus,
        settings: AdapterSettings,
        mock: Arc<MockModbusTransport>,
    ) -> Self {
        Self::with_transport(record, config, bus, settings, mock)
    }

    fn find_register(&self, name: &str) -> Result<&RegisterSpec> {
        self.config
            .registers
            .iter()
            .find(|r| r.name == name)
            .ok_or_else(|| AdapterError::UnknownRegister {
                name: name.to_string(),
            })
    }

    async fn write_register(&self, name: &str, value: f64) -> Result<Value> {
        let spec = self.find_register(name)?;
        if !spec.is_writable() {
            return Err(AdapterError::ReadOnlyRegister {
                name: name.to_string(),
            });
        }
        let words = registers::encode_value(spec, value)?;
        self.transport
            .write_words(self.config.unit_id, spec.address, &words)
            .await?;
        info!(device = %self.session.device_id(), register = name, value, "register written");
        Ok(json!({ "name": name, "value": value }))
    }

    async fn read_register(&self, name: &str) -> Result<Value> {
        let spec = self.find_register(name)?;
        let value = read_one(&*self.transport, self.config.unit_id, spec).await?;
        let rendered = match value {
            RegisterValue::Number(n) => json!(n),
            RegisterValue::Bool(b) => json!(b),
            RegisterValue::Bytes(bytes) => json!(hex_string(&bytes)),
        };
        Ok(json!({ "name": name, "value": rendered }))
    }
}

#[async_trait]
impl DeviceAdapter for ModbusAdapter {
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

        // Coalesce with whatever attempt is in flight.
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

    async fn execute_command(&self, command: &str, parameters: Value) -> Result<Value> {
        match command {
            "writeRegister" => {
                let name = parameters
                    .get("name")
                    .and_then(Value::as_str)
                    .ok_or_else(|| AdapterError::Configuration("missing register name".into()))?;
                let value = parameters
                    .get("value")
                    .and_then(Value::as_f64)
                    .ok_or_else(|| AdapterError::Configuration("missing numeric value".into()))?;
                self.write_register(name, value).await
            }
            "readRegister" => {
                let name = parameters
                    .get("name")
                    .and_then(Value::as_str)
                    .ok_or_else(|| AdapterError::Configuration("missing register name".into()))?;
                self.read_register(name).await
            }
            other => Err(AdapterError::UnsupportedCommand {
                command: other.to_string(),
            }),
        }
    }
}

struct RunContext {
    session: Arc<DeviceSession>,
    transport: Arc<dyn ModbusTransport>,
    config: ModbusConfig,
    settings: AdapterSettings,
    scanning: Arc<AtomicBool>,
    stop: Arc<StopSignal>,
}

/// Session driver: connect, scan while Connected, back off while in Error.
/// Exactly one timer is pending at any moment, which one depending on the
/// state the loop is in.
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
                if ctx.session.publish_online(None).is_err() {
                    break;
                }
                info!(device = %ctx.session.device_id(), "modbus session connected");

                match connected_phase(&ctx).await {
                    Exit::Stopped => break,
                    Exit::Wire(err) => {
                        warn!(device = %ctx.session.device_id(), error = %err, "modbus wire error");
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
                    warn!(
                        device = %ctx.session.device_id(),
                        attempt,
                        "reconnect attempts exhausted, retrying at capped interval"
                    );
                }
            }
        }

        // Error state: only the reconnect timer is armed.
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

enum Exit {
    Stopped,
    Wire(AdapterError),
}

/// Connected state: the scan timer is the heartbeat. Ticks start at connect
/// time and fire exactly every scan interval.
async fn connected_phase(ctx: &RunContext) -> Exit {
    let period = Duration::from_millis(ctx.config.scan_interval_ms.max(1));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ctx.stop.wait() => return Exit::Stopped,
            _ = ticker.tick() => {
                let result = if ctx.scanning.load(Ordering::Acquire) {
                    scan_once(ctx).await
                } else {
                    probe_once(ctx).await
                };
                match result {
                    Ok(()) => {}
                    Err(err) if err.triggers_reconnect() => return Exit::Wire(err),
                    Err(err) => {
                        warn!(device = %ctx.session.device_id(), error = %err, "scan error, continuing");
                    }
                }
            }
        }
    }
}

/// Read every configured register; decode failures skip the register, wire
/// failures abort the scan.
async fn scan_once(ctx: &RunContext) -> Result<()> {
    let mut readings: BTreeMap<String, f64> = BTreeMap::new();
    let mut units: BTreeMap<String, String> = BTreeMap::new();
    let mut buffers: BTreeMap<String, String> = BTreeMap::new();

    for spec in &ctx.config.registers {
        match read_one(&*ctx.transport, ctx.config.unit_id, spec).await {
            Ok(RegisterValue::Number(value)) => {
                record_reading(&mut readings, &mut units, spec, value);
            }
            Ok(RegisterValue::Bool(b)) => {
                record_reading(&mut readings, &mut units, spec, if b { 1.0 } else { 0.0 });
            }
            Ok(RegisterValue::Bytes(bytes)) => {
                buffers.insert(spec.name.clone(), hex_string(&bytes));
            }
            Err(err) if err.triggers_reconnect() => return Err(err),
            Err(err) => {
                warn!(
                    device = %ctx.session.device_id(),
                    register = %spec.name,
                    error = %err,
                    "register skipped"
                );
            }
        }
    }

    ctx.session.mark_seen();
    let metadata = if buffers.is_empty() {
        None
    } else {
        Some(serde_json::to_value(buffers)?)
    };
    ctx.session.publish_telemetry(readings, units, metadata)
}

/// Liveness probe while scanning is paused: one register, no telemetry
async fn probe_once(ctx: &RunContext) -> Result<()> {
    if let Some(spec) = ctx.config.registers.first() {
        read_one(&*ctx.transport, ctx.config.unit_id, spec).await?;
    }
    ctx.session.mark_seen();
    Ok(())
}

async fn read_one(
    transport: &dyn ModbusTransport,
    unit: u8,
    spec: &RegisterSpec,
) -> Result<RegisterValue> {
    if spec.kind.is_bit() {
        let bits = transport
            .read_bits(unit, spec.kind, spec.address, spec.word_count())
            .await?;
        registers::decode_bits(spec, &bits)
    } else {
        let words = transport
            .read_words(unit, spec.kind, spec.address, spec.word_count())
            .await?;
        registers::decode_words(spec, &words)
    }
}

/// Record under the register's own name and mirror into its canonical
/// channel where one is declared.
fn record_reading(
    readings: &mut BTreeMap<String, f64>,
    units: &mut BTreeMap<String, String>,
    spec: &RegisterSpec,
    value: f64,
) {
    readings.insert(spec.name.clone(), value);
    if let Some(unit) = &spec.unit {
        units.insert(spec.name.clone(), unit.clone());
    }

    let canonical = spec
        .canonical
        .as_deref()
        .or_else(|| telemetry::canonical_channel(&spec.name));
    if let Some(channel) = canonical {
        if channel != spec.name {
            readings.insert(channel.to_string(), value);
        }
        let unit = spec
            .unit
            .clone()
            .or_else(|| telemetry::default_unit(channel).map(String::from));
        if let Some(unit) = unit {
            units.insert(channel.to_string(), unit);
        }
    }
}

fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use types::{
        ConnectionConfig, DataPointAccess, DeviceType, RegisterDataType, RegisterKind, WordOrder,
    };

    fn register(name: &str, address: u16, data_type: RegisterDataType, scale: f64) -> RegisterSpec {
        RegisterSpec {
            name: name.to_string(),
            kind: RegisterKind::Holding,
            address,
            length: None,
            data_type,
            scale,
            byte_order: WordOrder::Be,
            unit: None,
            bit_offset: None,
            access: DataPointAccess::Read,
            canonical: None,
        }
    }

    fn test_config() -> ModbusConfig {
        ModbusConfig {
            host: "127.0.0.1".to_string(),
            port: 502,
            unit_id: 1,
            serial: None,
            registers: vec![
                register("power", 0, RegisterDataType::Uint16, 1.0),
                register("energy", 2, RegisterDataType::Uint32, 0.1),
            ],
            scan_interval_ms: 1000,
            mock: true,
        }
    }

    fn test_record(config: &ModbusConfig) -> DeviceRecord {
        DeviceRecord {
            id: 1,
            device_id: "inv-1".to_string(),
            site_id: 7,
            device_type: DeviceType::SolarPv,
            connection: ConnectionConfig::Modbus(config.clone()),
        }
    }

    #[test]
    fn unknown_and_read_only_registers_are_rejected() {
        let config = test_config();
        let record = test_record(&config);
        let adapter = ModbusAdapter::with_mock(
            &record,
            config,
            bus::MessageBus::new(),
            AdapterSettings::default(),
            Arc::new(MockModbusTransport::new()),
        );
        assert!(matches!(
            adapter.find_register("bogus"),
            Err(AdapterError::UnknownRegister { .. })
        ));
        let spec = adapter.find_register("power").unwrap();
        assert!(!spec.is_writable());
    }

    #[test]
    fn canonical_mirroring_uses_declared_names() {
        let mut readings = BTreeMap::new();
        let mut units = BTreeMap::new();
        let mut spec = register("active_power", 0, RegisterDataType::Uint16, 1.0);
        spec.unit = Some("kW".to_string());
        record_reading(&mut readings, &mut units, &spec, 3.2);
        assert_eq!(readings["active_power"], 3.2);
        assert_eq!(readings["power"], 3.2);
        assert_eq!(units["power"], "kW");

        // Undeclared vendor name: no mirror
        let mut readings = BTreeMap::new();
        let mut units = BTreeMap::new();
        let spec = register("pv1_watts", 0, RegisterDataType::Uint16, 1.0);
        record_reading(&mut readings, &mut units, &spec, 10.0);
        assert!(!readings.contains_key("power"));

        // Explicit canonical override wins
        let mut readings = BTreeMap::new();
        let mut units = BTreeMap::new();
        let mut spec = register("pv1_watts", 0, RegisterDataType::Uint16, 1.0);
        spec.canonical = Some("power".to_string());
        record_reading(&mut readings, &mut units, &spec, 10.0);
        assert_eq!(readings["power"], 10.0);
        assert_eq!(units["power"], "W");
    }
}
