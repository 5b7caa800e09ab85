//! OCPP charge point adapter
//!
//! Event-driven session: one reader loop owns the stream, timers fire
//! heartbeats and meter-value ticks, and every outgoing call is correlated
//! through the pending table. Connector state and transactions live in one
//! [`ChargePointState`] behind one mutex.

use crate::adapter::DeviceAdapter;
use crate::config;
use crate::error::{AdapterError, Result};
use crate::ocpp::frame::OcppFrame;
use crate::ocpp::pending::{CallOutcome, PendingCalls};
use crate::ocpp::transaction::ChargePointState;
use crate::ocpp::transport::{MockChargePoint, OcppTransport, WsTransport};
use crate::ocpp::types::{
    BootNotificationRequest, BootNotificationResponse, ConnectorStatus, MeterValuesRequest,
    RegistrationStatus, StartTransactionRequest, StatusNotificationRequest, StopTransactionRequest,
};
use crate::session::{AdapterSettings, DeviceSession, SessionState, StopSignal};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use types::{telemetry::channel, DeviceRecord, OcppConfig};
use uuid::Uuid;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

struct RunHandle {
    stop: Arc<StopSignal>,
    task: JoinHandle<()>,
}

/// Correlated-call client shared by the run loop and command handlers
#[derive(Clone)]
struct CallClient {
    device: String,
    transport: Arc<dyn OcppTransport>,
    pending: Arc<PendingCalls>,
    timeout: Duration,
}

impl CallClient {
    async fn call(&self, action: &str, payload: Value) -> Result<Value> {
        let message_id = Uuid::new_v4().to_string();
        let rx = self.pending.register(&message_id);
        if let Err(err) = self
            .transport
            .send(OcppFrame::call(&message_id, action, payload))
            .await
        {
            self.pending.purge(&message_id);
            return Err(err);
        }
        self.pending
            .wait(&self.device, &message_id, rx, self.timeout)
            .await
    }
}

/// OCPP 1.6 / 2.0.1 adapter
pub struct OcppAdapter {
    config: OcppConfig,
    session: Arc<DeviceSession>,
    transport: Arc<dyn OcppTransport>,
    settings: AdapterSettings,
    state: Arc<StdMutex<ChargePointState>>,
    pending: Arc<PendingCalls>,
    run: tokio::sync::Mutex<Option<RunHandle>>,
}

impl OcppAdapter {
    pub fn from_record(
        record: &DeviceRecord,
        bus: bus::MessageBus,
        settings: AdapterSettings,
    ) -> Result<Self> {
        let types::ConnectionConfig::Ocpp(config) = record.connection.clone() else {
            return Err(AdapterError::Configuration(format!(
                "device {} is not an ocpp device",
                record.device_id
            )));
        };

        let transport: Arc<dyn OcppTransport> = if config::mock_enabled(record) {
            Arc::new(MockChargePoint::new(record.device_id.clone()))
        } else {
            Arc::new(WsTransport::new(
                record.device_id.clone(),
                config.endpoint.clone(),
                config.version,
            ))
        };
        Ok(Self::with_transport(record, config, bus, settings, transport))
    }

    pub fn with_transport(
        record: &DeviceRecord,
        config: OcppConfig,
        bus: bus::MessageBus,
        settings: AdapterSettings,
        transport: Arc<dyn OcppTransport>,
    ) -> Self {
        let session = Arc::new(DeviceSession::new(
            record.device_id.clone(),
            record.device_type,
            types::ProtocolFamily::Ocpp,
            bus,
        ));
        let state = Arc::new(StdMutex::new(ChargePointState::new(config.connector_count)));
        Self {
            config,
            session,
            transport,
            settings,
            state,
            pending: Arc::new(PendingCalls::new()),
            run: tokio::sync::Mutex::new(None),
        }
    }

    fn call_client(&self) -> CallClient {
        CallClient {
            device: self.session.device_id().to_string(),
            transport: Arc::clone(&self.transport),
            pending: Arc::clone(&self.pending),
            timeout: self.settings.command_timeout,
        }
    }

    /// Connector snapshot for command results and telemetry
    pub fn connectors(&self) -> BTreeMap<u32, crate::ocpp::transaction::Connector> {
        self.state.lock().expect("charge point state poisoned").connectors()
    }

    async fn start_transaction_local(&self, connector_id: u32, tag_id: &str) -> Result<Value> {
        let transaction = {
            let mut state = self.state.lock().expect("charge point state poisoned");
            state.start_transaction(connector_id, tag_id, 0.0)?
        };
        self.session
            .publish_event("transactionStart", serde_json::to_value(&transaction)?)?;
        info!(
            device = %self.session.device_id(),
            connector = connector_id,
            transaction = transaction.id,
            "transaction started"
        );

        // Tell the peer; local state stays authoritative if it is unreachable.
        let client = self.call_client();
        if let Err(err) = client
            .call(
                "StatusNotification",
                json!({
                    "connectorId": connector_id,
                    "errorCode": "NoError",
                    "status": ConnectorStatus::Charging,
                }),
            )
            .await
        {
            warn!(device = %client.device, error = %err, "status notification not acknowledged");
        }
        Ok(serde_json::to_value(&transaction)?)
    }

    async fn stop_transaction_local(&self, connector_id: u32) -> Result<Value> {
        let transaction = {
            let mut state = self.state.lock().expect("charge point state poisoned");
            state.stop_transaction(connector_id, None)?
        };
        self.session
            .publish_event("transactionStop", serde_json::to_value(&transaction)?)?;
        info!(
            device = %self.session.device_id(),
            connector = connector_id,
            transaction = transaction.id,
            energy_wh = transaction.energy,
            "transaction stopped"
        );

        let client = self.call_client();
        if let Err(err) = client
            .call(
                "StatusNotification",
                json!({
                    "connectorId": connector_id,
                    "errorCode": "NoError",
                    "status": ConnectorStatus::Available,
                }),
            )
            .await
        {
            warn!(device = %client.device, error = %err, "status notification not acknowledged");
        }
        Ok(serde_json::to_value(&transaction)?)
    }
}

#[async_trait]
impl DeviceAdapter for OcppAdapter {
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
                            state: Arc::clone(&self.state),
                            pending: Arc::clone(&self.pending),
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
                reason: "boot handshake failed".to_string(),
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
        self.pending.fail_all("adapter disconnected");
        self.transport.close().await.ok();
        if !self.session.is_silenced() {
            self.session.set_state(SessionState::Disconnected);
            self.session.publish_offline()?;
        }
        Ok(())
    }

    // StartScanning/StopScanning are no-ops: OCPP is event-driven.

    async fn execute_command(&self, command: &str, parameters: Value) -> Result<Value> {
        match command {
            "startTransaction" => {
                let connector_id = parameters
                    .get("connectorId")
                    .and_then(Value::as_u64)
                    .ok_or_else(|| AdapterError::Configuration("missing connectorId".into()))?
                    as u32;
                let tag_id = parameters
                    .get("tagId")
                    .and_then(Value::as_str)
                    .unwrap_or("LOCAL");
                self.start_transaction_local(connector_id, tag_id).await
            }
            "stopTransaction" => {
                let connector_id = parameters
                    .get("connectorId")
                    .and_then(Value::as_u64)
                    .ok_or_else(|| AdapterError::Configuration("missing connectorId".into()))?
                    as u32;
                self.stop_transaction_local(connector_id).await
            }
            "getStatus" => Ok(serde_json::to_value(self.connectors())?),
            other => Err(AdapterError::UnsupportedCommand {
                command: other.to_string(),
            }),
        }
    }
}

struct RunContext {
    session: Arc<DeviceSession>,
    transport: Arc<dyn OcppTransport>,
    config: OcppConfig,
    settings: AdapterSettings,
    state: Arc<StdMutex<ChargePointState>>,
    pending: Arc<PendingCalls>,
    stop: Arc<StopSignal>,
}

enum Exit {
    Stopped,
    Wire(AdapterError),
}

enum InternalEvent {
    HeartbeatOk,
    HeartbeatFailed(AdapterError),
}

async fn run_loop(ctx: RunContext) {
    loop {
        if ctx.stop.is_triggered() {
            break;
        }
        ctx.session.set_state(SessionState::Connecting);
        let attempt = ctx.session.record_attempt();

        match establish(&ctx).await {
            Ok(boot) => {
                ctx.session.record_connect_success();
                ctx.session.set_state(SessionState::Connected);
                let _ = ctx
                    .session
                    .publish_online(Some(ctx.config.version.subprotocol().to_string()));
                info!(
                    device = %ctx.session.device_id(),
                    interval = boot.interval,
                    "ocpp session accepted"
                );

                match connected_phase(&ctx, &boot).await {
                    Exit::Stopped => break,
                    Exit::Wire(err) => {
                        warn!(device = %ctx.session.device_id(), error = %err, "ocpp wire error");
                        ctx.pending.fail_all("wire dropped");
                        ctx.transport.close().await.ok();
                        ctx.session.set_state(SessionState::Error);
                        let _ = ctx.session.publish_error(err.kind());
                    }
                }
            }
            Err(err) => {
                ctx.session.record_connect_failure(&err);
                ctx.transport.close().await.ok();
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
    ctx.pending.fail_all("adapter stopped");
    ctx.transport.close().await.ok();
}

/// Open the stream and run the BootNotification handshake
async fn establish(ctx: &RunContext) -> Result<BootNotificationResponse> {
    ctx.transport.connect().await?;

    let boot_id = Uuid::new_v4().to_string();
    let request = BootNotificationRequest {
        charge_point_vendor: ctx.config.vendor.clone(),
        charge_point_model: ctx.config.model.clone(),
        charge_point_serial_number: ctx.config.serial_number.clone(),
        firmware_version: ctx.config.firmware_version.clone(),
    };
    ctx.transport
        .send(OcppFrame::call(
            &boot_id,
            "BootNotification",
            serde_json::to_value(&request)?,
        ))
        .await?;

    let device = ctx.session.device_id().to_string();
    let response = timeout(HANDSHAKE_TIMEOUT, async {
        loop {
            match ctx.transport.next().await? {
                Some(OcppFrame::CallResult { message_id, payload }) if message_id == boot_id => {
                    return serde_json::from_value::<BootNotificationResponse>(payload)
                        .map_err(AdapterError::from);
                }
                Some(frame) => handle_incoming(ctx, frame).await?,
                None => {
                    return Err(AdapterError::ConnectionRefused {
                        device: device.clone(),
                        reason: "peer closed during handshake".to_string(),
                    })
                }
            }
        }
    })
    .await
    .map_err(|_| AdapterError::Timeout {
        device: ctx.session.device_id().to_string(),
        timeout_ms: HANDSHAKE_TIMEOUT.as_millis() as u64,
    })??;

    if response.status != RegistrationStatus::Accepted {
        return Err(AdapterError::ConnectionRefused {
            device: ctx.session.device_id().to_string(),
            reason: format!("boot notification {:?}", response.status),
        });
    }
    Ok(response)
}

async fn connected_phase(ctx: &RunContext, boot: &BootNotificationResponse) -> Exit {
    let heartbeat_period = if boot.interval > 0 {
        Duration::from_secs(boot.interval)
    } else {
        Duration::from_secs(ctx.config.heartbeat_interval_secs.max(1))
    };
    let meter_period = Duration::from_secs(ctx.config.meter_values_interval_secs.max(1));

    let mut heartbeat = tokio::time::interval(heartbeat_period);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    heartbeat.tick().await; // arm, do not fire immediately
    let mut meter = tokio::time::interval(meter_period);
    meter.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    meter.tick().await;

    let (events_tx, mut events_rx) = mpsc::unbounded_channel::<InternalEvent>();
    let client = CallClient {
        device: ctx.session.device_id().to_string(),
        transport: Arc::clone(&ctx.transport),
        pending: Arc::clone(&ctx.pending),
        timeout: ctx.settings.command_timeout,
    };

    loop {
        tokio::select! {
            _ = ctx.stop.wait() => return Exit::Stopped,

            frame = ctx.transport.next() => match frame {
                Ok(Some(frame)) => {
                    if let Err(err) = handle_incoming(ctx, frame).await {
                        if err.triggers_reconnect() {
                            return Exit::Wire(err);
                        }
                        warn!(device = %ctx.session.device_id(), error = %err, "incoming frame error");
                    }
                }
                Ok(None) => {
                    return Exit::Wire(AdapterError::ConnectionRefused {
                        device: ctx.session.device_id().to_string(),
                        reason: "peer closed".to_string(),
                    })
                }
                Err(err) if err.triggers_reconnect() => return Exit::Wire(err),
                Err(err) => {
                    warn!(device = %ctx.session.device_id(), error = %err, "frame parse error");
                }
            },

            _ = heartbeat.tick() => {
                let client = client.clone();
                let events = events_tx.clone();
                tokio::spawn(async move {
                    match client.call("Heartbeat", json!({})).await {
                        Ok(_) => { let _ = events.send(InternalEvent::HeartbeatOk); }
                        Err(err) => { let _ = events.send(InternalEvent::HeartbeatFailed(err)); }
                    }
                });
            }

            _ = meter.tick() => {
                meter_tick(ctx, &client, meter_period);
            }

            event = events_rx.recv() => match event {
                Some(InternalEvent::HeartbeatOk) => {
                    ctx.session.mark_seen();
                    let _ = ctx.session.publish_event("heartbeat", json!({}));
                    publish_snapshot(ctx);
                }
                Some(InternalEvent::HeartbeatFailed(err)) => return Exit::Wire(err),
                None => return Exit::Stopped,
            },
        }
    }
}

/// Timer-driven transaction advance: integrate power, publish updates, and
/// report meter values upstream.
fn meter_tick(ctx: &RunContext, client: &CallClient, period: Duration) {
    let updates: Vec<_> = {
        let mut state = ctx.state.lock().expect("charge point state poisoned");
        state
            .active_connectors()
            .into_iter()
            .filter_map(|connector| state.tick(connector, period).ok())
            .collect()
    };

    for transaction in updates {
        if let Ok(payload) = serde_json::to_value(&transaction) {
            let _ = ctx.session.publish_event("transactionUpdate", payload);
        }
        let client = client.clone();
        let device = ctx.session.device_id().to_string();
        tokio::spawn(async move {
            let payload = json!({
                "connectorId": transaction.connector_id,
                "transactionId": transaction.id,
                "meterValue": [{
                    "timestamp": chrono::Utc::now(),
                    "sampledValue": [{
                        "value": format!("{:.1}", transaction.meter_start + transaction.energy),
                        "measurand": "Energy.Active.Import.Register",
                        "unit": "Wh"
                    }]
                }]
            });
            if let Err(err) = client.call("MeterValues", payload).await {
                debug!(device = %device, error = %err, "meter values not acknowledged");
            }
        });
    }
    publish_snapshot(ctx);
}

/// Telemetry snapshot across connectors
fn publish_snapshot(ctx: &RunContext) {
    let (readings, units) = {
        let state = ctx.state.lock().expect("charge point state poisoned");
        let mut readings: BTreeMap<String, f64> = BTreeMap::new();
        let mut units: BTreeMap<String, String> = BTreeMap::new();
        let mut total_power = 0.0;
        let mut total_energy = 0.0;
        for (id, _connector) in state.connectors() {
            if let Some(t) = state.active_transaction(id) {
                readings.insert(format!("connector{}_power", id), t.power);
                readings.insert(format!("connector{}_energy", id), t.energy);
                units.insert(format!("connector{}_power", id), "W".to_string());
                units.insert(format!("connector{}_energy", id), "Wh".to_string());
                total_power += t.power;
                total_energy += t.energy;
            }
        }
        readings.insert(channel::POWER.to_string(), total_power);
        readings.insert(channel::ENERGY.to_string(), total_energy);
        units.insert(channel::POWER.to_string(), "W".to_string());
        units.insert(channel::ENERGY.to_string(), "Wh".to_string());
        (readings, units)
    };
    let _ = ctx.session.publish_telemetry(readings, units, None);
}

/// Route one frame from the peer
async fn handle_incoming(ctx: &RunContext, frame: OcppFrame) -> Result<()> {
    match frame {
        OcppFrame::Call {
            message_id,
            action,
            payload,
        } => {
            let reply = dispatch_call(ctx, &action, payload)?;
            ctx.transport
                .send(OcppFrame::call_result(message_id, reply))
                .await
        }
        OcppFrame::CallResult {
            message_id,
            payload,
        } => {
            if !ctx.pending.resolve(&message_id, CallOutcome::Result(payload)) {
                debug!(device = %ctx.session.device_id(), message_id, "unmatched call result");
            }
            Ok(())
        }
        OcppFrame::CallError {
            message_id,
            code,
            description,
            ..
        } => {
            if !ctx
                .pending
                .resolve(&message_id, CallOutcome::Error { code, description })
            {
                debug!(device = %ctx.session.device_id(), message_id, "unmatched call error");
            }
            Ok(())
        }
    }
}

/// Handle a device-originated call, returning the CallResult payload.
/// Unknown actions are acknowledged with an empty result.
fn dispatch_call(ctx: &RunContext, action: &str, payload: Value) -> Result<Value> {
    ctx.session.mark_seen();
    match action {
        "StatusNotification" => {
            let request: StatusNotificationRequest = serde_json::from_value(payload)?;
            let mut state = ctx.state.lock().expect("charge point state poisoned");
            if let Err(err) = state.set_connector_status(request.connector_id, request.status) {
                warn!(device = %ctx.session.device_id(), error = %err, "status for unknown connector");
            }
            Ok(json!({}))
        }
        "MeterValues" => {
            let request: MeterValuesRequest = serde_json::from_value(payload)?;
            let (meter_wh, power_w) = extract_samples(&request);
            let update = {
                let mut state = ctx.state.lock().expect("charge point state poisoned");
                state.record_meter(request.connector_id, meter_wh, power_w).ok()
            };
            if let Some(transaction) = update {
                let _ = ctx
                    .session
                    .publish_event("transactionUpdate", serde_json::to_value(&transaction)?);
            }
            Ok(json!({}))
        }
        "StartTransaction" => {
            let request: StartTransactionRequest = serde_json::from_value(payload)?;
            let started = {
                let mut state = ctx.state.lock().expect("charge point state poisoned");
                state.start_transaction(
                    request.connector_id,
                    &request.id_tag,
                    request.meter_start as f64,
                )
            };
            match started {
                Ok(transaction) => {
                    let _ = ctx
                        .session
                        .publish_event("transactionStart", serde_json::to_value(&transaction)?);
                    Ok(json!({
                        "transactionId": transaction.id,
                        "idTagInfo": { "status": "Accepted" }
                    }))
                }
                Err(err) => {
                    warn!(device = %ctx.session.device_id(), error = %err, "device start rejected");
                    Ok(json!({
                        "transactionId": 0,
                        "idTagInfo": { "status": "Invalid" }
                    }))
                }
            }
        }
        "StopTransaction" => {
            let request: StopTransactionRequest = serde_json::from_value(payload)?;
            let stopped = {
                let mut state = ctx.state.lock().expect("charge point state poisoned");
                state.stop_by_transaction(request.transaction_id, Some(request.meter_stop as f64))
            };
            match stopped {
                Ok(transaction) => {
                    let _ = ctx
                        .session
                        .publish_event("transactionStop", serde_json::to_value(&transaction)?);
                    Ok(json!({ "idTagInfo": { "status": "Accepted" } }))
                }
                Err(err) => {
                    warn!(device = %ctx.session.device_id(), error = %err, "device stop rejected");
                    Ok(json!({}))
                }
            }
        }
        other => {
            debug!(device = %ctx.session.device_id(), action = other, "unknown action acknowledged");
            Ok(json!({}))
        }
    }
}

/// Pull the energy register and power sample out of a MeterValues request
fn extract_samples(request: &MeterValuesRequest) -> (Option<f64>, Option<f64>) {
    let mut meter_wh = None;
    let mut power_w = None;
    for group in &request.meter_value {
        for sample in &group.sampled_value {
            let Ok(value) = sample.value.parse::<f64>() else {
                continue;
            };
            match sample.measurand.as_deref() {
                Some("Energy.Active.Import.Register") | None => meter_wh = Some(value),
                Some("Power.Active.Import") => power_w = Some(value),
                Some(_) => {}
            }
        }
    }
    (meter_wh, power_w)
}
