//! OCPP transports
//!
//! The adapter consumes a frame-level trait; the real implementation is a
//! WebSocket client negotiating the `ocpp1.6`/`ocpp2.0.1` subprotocol, the
//! mock is a simulated charge point that acks calls and streams meter values
//! while a connector is charging.

use crate::error::{AdapterError, Result};
use crate::ocpp::frame::OcppFrame;
use crate::ocpp::types::ConnectorStatus;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;
use types::OcppVersion;
use url::Url;

/// Stream handshake bound, per the OCPP-J recommendation
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

type WsSink = futures_util::stream::SplitSink<
    WebSocketStream<MaybeTlsStream<TcpStream>>,
    Message,
>;
type WsSource = futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Frame-level OCPP wire
#[async_trait]
pub trait OcppTransport: Send + Sync {
    async fn connect(&self) -> Result<()>;
    async fn close(&self) -> Result<()>;
    fn is_open(&self) -> bool;
    async fn send(&self, frame: OcppFrame) -> Result<()>;
    /// Next frame from the peer; `Ok(None)` is an orderly close
    async fn next(&self) -> Result<Option<OcppFrame>>;
}

/// WebSocket client transport
pub struct WsTransport {
    device: String,
    endpoint: String,
    version: OcppVersion,
    sink: Mutex<Option<WsSink>>,
    source: Mutex<Option<WsSource>>,
    open: AtomicBool,
}

impl WsTransport {
    pub fn new(device: impl Into<String>, endpoint: impl Into<String>, version: OcppVersion) -> Self {
        Self {
            device: device.into(),
            endpoint: endpoint.into(),
            version,
            sink: Mutex::new(None),
            source: Mutex::new(None),
            open: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl OcppTransport for WsTransport {
    async fn connect(&self) -> Result<()> {
        if self.is_open() {
            return Ok(());
        }
        Url::parse(&self.endpoint)
            .map_err(|e| AdapterError::Configuration(format!("bad endpoint {}: {}", self.endpoint, e)))?;

        let mut request = self.endpoint.as_str().into_client_request()?;
        request.headers_mut().insert(
            "Sec-WebSocket-Protocol",
            HeaderValue::from_str(self.version.subprotocol())
                .map_err(|e| AdapterError::Configuration(e.to_string()))?,
        );

        debug!(device = %self.device, endpoint = %self.endpoint, version = %self.version, "opening ocpp stream");
        let stream = match timeout(HANDSHAKE_TIMEOUT, connect_async(request)).await {
            Ok(Ok((stream, _response))) => stream,
            Ok(Err(err)) => {
                return Err(AdapterError::ConnectionRefused {
                    device: self.device.clone(),
                    reason: err.to_string(),
                })
            }
            Err(_) => {
                return Err(AdapterError::Timeout {
                    device: self.device.clone(),
                    timeout_ms: HANDSHAKE_TIMEOUT.as_millis() as u64,
                })
            }
        };

        let (sink, source) = stream.split();
        *self.sink.lock().await = Some(sink);
        *self.source.lock().await = Some(source);
        self.open.store(true, Ordering::Release);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.open.store(false, Ordering::Release);
        if let Some(mut sink) = self.sink.lock().await.take() {
            sink.send(Message::Close(None)).await.ok();
        }
        *self.source.lock().await = None;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    async fn send(&self, frame: OcppFrame) -> Result<()> {
        let mut guard = self.sink.lock().await;
        let sink = guard.as_mut().ok_or_else(|| AdapterError::ConnectionRefused {
            device: self.device.clone(),
            reason: "Not connected".to_string(),
        })?;
        sink.send(Message::Text(frame.to_json())).await?;
        Ok(())
    }

    async fn next(&self) -> Result<Option<OcppFrame>> {
        loop {
            let mut guard = self.source.lock().await;
            let source = guard.as_mut().ok_or_else(|| AdapterError::ConnectionRefused {
                device: self.device.clone(),
                reason: "Not connected".to_string(),
            })?;
            match source.next().await {
                Some(Ok(Message::Text(raw))) => {
                    return OcppFrame::parse(&self.device, &raw).map(Some)
                }
                Some(Ok(Message::Close(_))) | None => {
                    self.open.store(false, Ordering::Release);
                    return Ok(None);
                }
                Some(Ok(_other)) => continue,
                Some(Err(err)) => {
                    self.open.store(false, Ordering::Release);
                    return Err(err.into());
                }
            }
        }
    }
}

// ============================================================================
// MOCK CHARGE POINT
// ============================================================================

/// Simulated charge point peer.
///
/// Acks every call; while a connector reports Charging it streams
/// device-originated MeterValues at `meter_period` with a deterministically
/// increasing meter register, so transaction updates are assertable.
pub struct MockChargePoint {
    device: String,
    inbound_tx: mpsc::UnboundedSender<OcppFrame>,
    inbound_rx: Mutex<mpsc::UnboundedReceiver<OcppFrame>>,
    open: AtomicBool,
    closed: Notify,
    reject_boot: AtomicBool,
    fail_connects_remaining: AtomicU64,
    connect_attempts: AtomicU64,
    meter_period: Duration,
    /// Simulated charging power, W
    power_w: f64,
    next_message_id: AtomicU64,
    meter_tasks: StdMutex<HashMap<u32, JoinHandle<()>>>,
    meter_wh: std::sync::Arc<StdMutex<HashMap<u32, f64>>>,
    sent_by_adapter: StdMutex<Vec<OcppFrame>>,
}

impl MockChargePoint {
    pub fn new(device: impl Into<String>) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            device: device.into(),
            inbound_tx,
            inbound_rx: Mutex::new(inbound_rx),
            open: AtomicBool::new(false),
            closed: Notify::new(),
            reject_boot: AtomicBool::new(false),
            fail_connects_remaining: AtomicU64::new(0),
            connect_attempts: AtomicU64::new(0),
            meter_period: Duration::from_secs(60),
            power_w: 7400.0,
            next_message_id: AtomicU64::new(1),
            meter_tasks: StdMutex::new(HashMap::new()),
            meter_wh: std::sync::Arc::new(StdMutex::new(HashMap::new())),
            sent_by_adapter: StdMutex::new(Vec::new()),
        }
    }

    /// Shorten the meter emission period (tests)
    pub fn with_meter_period(mut self, period: Duration) -> Self {
        self.meter_period = period;
        self
    }

    pub fn reject_boot(&self, reject: bool) {
        self.reject_boot.store(reject, Ordering::Release);
    }

    pub fn fail_connects(&self, n: u64) {
        self.fail_connects_remaining.store(n, Ordering::Release);
    }

    pub fn connect_attempts(&self) -> u64 {
        self.connect_attempts.load(Ordering::Acquire)
    }

    /// Everything the adapter has sent, oldest first
    pub fn outgoing(&self) -> Vec<OcppFrame> {
        self.sent_by_adapter.lock().expect("mock log poisoned").clone()
    }

    fn fresh_id(&self) -> String {
        format!("cp-{}", self.next_message_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Push a device-originated call to the adapter
    pub fn push_call(&self, action: &str, payload: serde_json::Value) {
        let frame = OcppFrame::call(self.fresh_id(), action, payload);
        let _ = self.inbound_tx.send(frame);
    }

    /// Device-originated StatusNotification
    pub fn push_status(&self, connector_id: u32, status: ConnectorStatus) {
        self.push_call(
            "StatusNotification",
            json!({
                "connectorId": connector_id,
                "errorCode": "NoError",
                "status": status,
            }),
        );
    }

    fn start_metering(&self, connector_id: u32) {
        let mut tasks = self.meter_tasks.lock().expect("meter tasks poisoned");
        if tasks.contains_key(&connector_id) {
            return;
        }
        let tx = self.inbound_tx.clone();
        let period = self.meter_period;
        let power = self.power_w;
        let meters = std::sync::Arc::clone(&self.meter_wh);
        let id_base = self.fresh_id();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // discard the immediate tick
            let mut seq = 0u64;
            loop {
                ticker.tick().await;
                let meter = {
                    let mut meters = meters.lock().expect("meter map poisoned");
                    let slot = meters.entry(connector_id).or_insert(0.0);
                    *slot += power * period.as_secs_f64() / 3600.0;
                    *slot
                };
                seq += 1;
                let frame = OcppFrame::call(
                    format!("{}-{}", id_base, seq),
                    "MeterValues",
                    json!({
                        "connectorId": connector_id,
                        "meterValue": [{
                            "timestamp": chrono::Utc::now(),
                            "sampledValue": [
                                {"value": format!("{:.1}", meter), "measurand": "Energy.Active.Import.Register", "unit": "Wh"},
                                {"value": format!("{:.1}", power), "measurand": "Power.Active.Import", "unit": "W"}
                            ]
                        }]
                    }),
                );
                if tx.send(frame).is_err() {
                    return;
                }
            }
        });
        tasks.insert(connector_id, task);
    }

    fn stop_metering(&self, connector_id: u32) {
        if let Some(task) = self
            .meter_tasks
            .lock()
            .expect("meter tasks poisoned")
            .remove(&connector_id)
        {
            task.abort();
        }
    }

    fn handle_adapter_call(&self, message_id: &str, action: &str, payload: &serde_json::Value) {
        let reply = match action {
            "BootNotification" => {
                let status = if self.reject_boot.load(Ordering::Acquire) {
                    "Rejected"
                } else {
                    "Accepted"
                };
                json!({
                    "status": status,
                    "currentTime": chrono::Utc::now(),
                    "interval": 300,
                })
            }
            "Heartbeat" => json!({ "currentTime": chrono::Utc::now() }),
            "StatusNotification" => {
                let connector_id = payload
                    .get("connectorId")
                    .and_then(serde_json::Value::as_u64)
                    .unwrap_or(0) as u32;
                match payload.get("status").and_then(serde_json::Value::as_str) {
                    Some("Charging") => self.start_metering(connector_id),
                    Some(_) => self.stop_metering(connector_id),
                    None => {}
                }
                json!({})
            }
            _ => json!({}),
        };
        let _ = self
            .inbound_tx
            .send(OcppFrame::call_result(message_id, reply));
    }
}

#[async_trait]
impl OcppTransport for MockChargePoint {
    async fn connect(&self) -> Result<()> {
        self.connect_attempts.fetch_add(1, Ordering::AcqRel);
        let remaining = self.fail_connects_remaining.load(Ordering::Acquire);
        if remaining > 0 {
            self.fail_connects_remaining.store(remaining - 1, Ordering::Release);
            return Err(AdapterError::ConnectionRefused {
                device: self.device.clone(),
                reason: "Connection timed out".to_string(),
            });
        }
        self.open.store(true, Ordering::Release);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.open.store(false, Ordering::Release);
        let tasks: Vec<_> = self
            .meter_tasks
            .lock()
            .expect("meter tasks poisoned")
            .drain()
            .map(|(_, t)| t)
            .collect();
        for task in tasks {
            task.abort();
        }
        self.closed.notify_waiters();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    async fn send(&self, frame: OcppFrame) -> Result<()> {
        if !self.is_open() {
            return Err(AdapterError::ConnectionRefused {
                device: self.device.clone(),
                reason: "Not connected".to_string(),
            });
        }
        self.sent_by_adapter
            .lock()
            .expect("mock log poisoned")
            .push(frame.clone());
        if let OcppFrame::Call {
            message_id,
            action,
            payload,
        } = &frame
        {
            self.handle_adapter_call(message_id, action, payload);
        }
        Ok(())
    }

    async fn next(&self) -> Result<Option<OcppFrame>> {
        if !self.is_open() {
            return Ok(None);
        }
        let mut rx = self.inbound_rx.lock().await;
        tokio::select! {
            _ = self.closed.notified() => Ok(None),
            frame = rx.recv() => match frame {
                Some(frame) => Ok(Some(frame)),
                None => Ok(None),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_acks_boot_notification() {
        let cp = MockChargePoint::new("cp-1");
        cp.connect().await.unwrap();
        cp.send(OcppFrame::call("1", "BootNotification", json!({"chargePointVendor": "x", "chargePointModel": "y"})))
            .await
            .unwrap();
        let frame = cp.next().await.unwrap().unwrap();
        let OcppFrame::CallResult { message_id, payload } = frame else {
            panic!("expected CallResult");
        };
        assert_eq!(message_id, "1");
        assert_eq!(payload["status"], "Accepted");
    }

    #[tokio::test(start_paused = true)]
    async fn charging_connector_streams_meter_values() {
        let cp = MockChargePoint::new("cp-1").with_meter_period(Duration::from_secs(1));
        cp.connect().await.unwrap();
        cp.send(OcppFrame::call(
            "2",
            "StatusNotification",
            json!({"connectorId": 1, "errorCode": "NoError", "status": "Charging"}),
        ))
        .await
        .unwrap();
        // Ack first
        let ack = cp.next().await.unwrap().unwrap();
        assert!(matches!(ack, OcppFrame::CallResult { .. }));

        // Two meter ticks; energy grows monotonically.
        let mut last = 0.0;
        for _ in 0..2 {
            let frame = loop {
                tokio::time::advance(Duration::from_secs(1)).await;
                tokio::task::yield_now().await;
                match tokio::time::timeout(Duration::from_millis(10), cp.next()).await {
                    Ok(Ok(Some(frame))) => break frame,
                    _ => continue,
                }
            };
            let OcppFrame::Call { action, payload, .. } = frame else {
                panic!("expected Call");
            };
            assert_eq!(action, "MeterValues");
            let value: f64 = payload["meterValue"][0]["sampledValue"][0]["value"]
                .as_str()
                .unwrap()
                .parse()
                .unwrap();
            assert!(value > last);
            last = value;
        }
    }
}
