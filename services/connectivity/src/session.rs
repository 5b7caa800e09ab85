//! Per-device session state
//!
//! Every adapter owns exactly one [`DeviceSession`]: the connectivity state
//! machine, the consecutive-failure counter, the last-seen clock, and the
//! publishing side of the bus. Sessions never reference their manager; the
//! bus is the only way anything observes them.
//!
//! Timer discipline: an adapter's run loop sleeps on its heartbeat interval
//! while Connected and on the reconnect backoff while in Error, never both.
//! The loop structure is the state machine; there is no second timer to
//! leave armed by accident.

use crate::error::{AdapterError, Result};
use bus::MessageBus;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;
use types::{topic, BusMessage, DeviceStatus, DeviceType, ProtocolFamily};

/// Adapter session lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
    ShuttingDown,
}

/// Exponential backoff with jitter for reconnect scheduling.
///
/// After `max_attempts` consecutive failures the session stays in Error but
/// keeps retrying at the capped interval.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    /// Fractional jitter applied to each delay; 0 disables (tests)
    pub jitter: f64,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(5),
            max: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.1,
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt number `attempt` (1-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self.initial.as_secs_f64() * self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let capped = exp.min(self.max.as_secs_f64());
        let jittered = if self.jitter > 0.0 {
            let spread = capped * self.jitter;
            capped + rand::thread_rng().gen_range(-spread..=spread)
        } else {
            capped
        };
        Duration::from_secs_f64(jittered.max(0.0))
    }
}

/// Runtime knobs shared by all adapter families
#[derive(Debug, Clone)]
pub struct AdapterSettings {
    /// Bound on every outgoing protocol call, including ExecuteCommand
    pub command_timeout: Duration,
    pub reconnect: ReconnectPolicy,
}

impl Default for AdapterSettings {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(30),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Cooperative stop flag for one run of an adapter's task. A fresh signal is
/// created per connect so a late trigger can never leak into the next run.
#[derive(Debug, Default)]
pub struct StopSignal {
    flag: AtomicBool,
    notify: Notify,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Resolves once triggered; usable inside `tokio::select!`
    pub async fn wait(&self) {
        loop {
            if self.is_triggered() {
                return;
            }
            self.notify.notified().await;
        }
    }
}

/// Session counters, all monotonic except the current failure streak
#[derive(Debug, Default)]
pub struct SessionMetrics {
    pub messages_published: AtomicU64,
    pub connection_attempts: AtomicU64,
    pub successful_connects: AtomicU64,
    pub failed_connects: AtomicU64,
    last_error: Mutex<Option<String>>,
}

/// Point-in-time health snapshot of one session
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionHealth {
    pub device_id: String,
    pub state: SessionState,
    pub last_seen: Option<DateTime<Utc>>,
    /// Consecutive failed connect attempts since the last success
    pub connection_attempts: u32,
    pub messages_published: u64,
    pub successful_connects: u64,
    pub failed_connects: u64,
    pub last_error: Option<String>,
}

/// Shared per-device session state and bus publishing surface
pub struct DeviceSession {
    device_id: String,
    device_type: DeviceType,
    protocol: ProtocolFamily,
    bus: MessageBus,
    state: RwLock<SessionState>,
    state_changed: Notify,
    /// Consecutive failed connects; reset on success
    attempts: AtomicU32,
    last_seen: Mutex<Option<DateTime<Utc>>>,
    /// Set on shutdown; all further publishes become no-ops
    silenced: AtomicBool,
    pub metrics: SessionMetrics,
}

impl DeviceSession {
    pub fn new(
        device_id: impl Into<String>,
        device_type: DeviceType,
        protocol: ProtocolFamily,
        bus: MessageBus,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            device_type,
            protocol,
            bus,
            state: RwLock::new(SessionState::Disconnected),
            state_changed: Notify::new(),
            attempts: AtomicU32::new(0),
            last_seen: Mutex::new(None),
            silenced: AtomicBool::new(false),
            metrics: SessionMetrics::default(),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn device_type(&self) -> DeviceType {
        self.device_type
    }

    pub fn protocol(&self) -> ProtocolFamily {
        self.protocol
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub fn state(&self) -> SessionState {
        *self.state.read().expect("session state poisoned")
    }

    pub fn set_state(&self, next: SessionState) {
        {
            let mut state = self.state.write().expect("session state poisoned");
            debug!(device = %self.device_id, from = ?*state, to = ?next, "session state change");
            *state = next;
        }
        if next == SessionState::ShuttingDown {
            self.silenced.store(true, Ordering::Release);
        }
        self.state_changed.notify_waiters();
    }

    /// Park until the session leaves Connecting; used to coalesce concurrent
    /// `connect()` calls into one outcome.
    pub async fn wait_while_connecting(&self) -> SessionState {
        loop {
            let notified = self.state_changed.notified();
            let current = self.state();
            if current != SessionState::Connecting {
                return current;
            }
            notified.await;
        }
    }

    /// Refresh the liveness clock
    pub fn mark_seen(&self) {
        *self.last_seen.lock().expect("last_seen poisoned") = Some(Utc::now());
    }

    pub fn last_seen(&self) -> Option<DateTime<Utc>> {
        *self.last_seen.lock().expect("last_seen poisoned")
    }

    /// Record one connect attempt; returns the current streak (1-based)
    pub fn record_attempt(&self) -> u32 {
        self.metrics.connection_attempts.fetch_add(1, Ordering::Relaxed);
        self.attempts.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_connect_success(&self) {
        self.attempts.store(0, Ordering::Relaxed);
        self.metrics.successful_connects.fetch_add(1, Ordering::Relaxed);
        self.mark_seen();
    }

    pub fn record_connect_failure(&self, error: &AdapterError) {
        self.metrics.failed_connects.fetch_add(1, Ordering::Relaxed);
        *self.metrics.last_error.lock().expect("last_error poisoned") = Some(error.to_string());
    }

    /// Current consecutive-failure streak
    pub fn connection_attempts(&self) -> u32 {
        self.attempts.load(Ordering::Relaxed)
    }

    /// True once the session has begun shutting down
    pub fn is_silenced(&self) -> bool {
        self.silenced.load(Ordering::Acquire)
    }

    fn status_topic(&self) -> String {
        if self.device_type == DeviceType::Gateway {
            topic::gateway_status(&self.device_id)
        } else {
            topic::device_status(&self.device_id)
        }
    }

    fn telemetry_topic(&self) -> String {
        if self.device_type == DeviceType::Gateway {
            topic::gateway_telemetry(&self.device_id)
        } else {
            topic::device_telemetry(&self.device_id)
        }
    }

    fn publish(&self, topic: &str, message: BusMessage) -> Result<()> {
        if self.is_silenced() {
            debug!(device = %self.device_id, topic, "publish suppressed during shutdown");
            return Ok(());
        }
        self.bus.publish(topic, message)?;
        self.metrics.messages_published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Publish a status message with full device identity
    pub fn publish_status(&self, status: DeviceStatus, details: Option<String>) -> Result<()> {
        let message = match BusMessage::status(&self.device_id, status, details) {
            BusMessage::Status(mut m) => {
                m.device_type = Some(self.device_type);
                m.protocol = Some(self.protocol);
                BusMessage::Status(m)
            }
            other => other,
        };
        self.publish(&self.status_topic(), message)
    }

    /// Status online, optionally with a protocol version string
    pub fn publish_online(&self, version: Option<String>) -> Result<()> {
        let message = match BusMessage::status(&self.device_id, DeviceStatus::Online, None) {
            BusMessage::Status(mut m) => {
                m.device_type = Some(self.device_type);
                m.protocol = Some(self.protocol);
                m.version = version;
                BusMessage::Status(m)
            }
            other => other,
        };
        self.publish(&self.status_topic(), message)
    }

    pub fn publish_offline(&self) -> Result<()> {
        self.publish_status(DeviceStatus::Offline, None)
    }

    /// Composite status for gateways: overall status plus per-child
    /// connectivity
    pub fn publish_composite_status(
        &self,
        status: DeviceStatus,
        children: BTreeMap<String, DeviceStatus>,
    ) -> Result<()> {
        let message = match BusMessage::status(&self.device_id, status, None) {
            BusMessage::Status(mut m) => {
                m.device_type = Some(self.device_type);
                m.protocol = Some(self.protocol);
                m.children = Some(children);
                BusMessage::Status(m)
            }
            other => other,
        };
        self.publish(&self.status_topic(), message)
    }

    pub fn publish_error(&self, details: impl Into<String>) -> Result<()> {
        self.publish_status(DeviceStatus::Error, Some(details.into()))
    }

    pub fn publish_telemetry(
        &self,
        readings: BTreeMap<String, f64>,
        units: BTreeMap<String, String>,
        metadata: Option<Value>,
    ) -> Result<()> {
        let message = match BusMessage::telemetry(
            &self.device_id,
            self.device_type,
            self.protocol,
            readings,
            units,
        ) {
            BusMessage::Telemetry(mut m) => {
                m.metadata = metadata;
                BusMessage::Telemetry(m)
            }
            other => other,
        };
        self.publish(&self.telemetry_topic(), message)
    }

    pub fn publish_event(&self, event: impl Into<String>, payload: Value) -> Result<()> {
        let message = BusMessage::event(&self.device_id, event, payload);
        self.publish(&topic::device_events(&self.device_id), message)
    }

    pub fn publish_command_response(
        &self,
        command: &str,
        success: bool,
        result: Option<Value>,
        error: Option<String>,
    ) -> Result<()> {
        let message = BusMessage::command_response(&self.device_id, command, success, result, error);
        self.publish(&topic::device_command_response(&self.device_id), message)
    }

    pub fn health(&self) -> SessionHealth {
        SessionHealth {
            device_id: self.device_id.clone(),
            state: self.state(),
            last_seen: self.last_seen(),
            connection_attempts: self.connection_attempts(),
            messages_published: self.metrics.messages_published.load(Ordering::Relaxed),
            successful_connects: self.metrics.successful_connects.load(Ordering::Relaxed),
            failed_connects: self.metrics.failed_connects.load(Ordering::Relaxed),
            last_error: self
                .metrics
                .last_error
                .lock()
                .expect("last_error poisoned")
                .clone(),
        }
    }
}

impl std::fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSession")
            .field("device_id", &self.device_id)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> ReconnectPolicy {
        ReconnectPolicy {
            jitter: 0.0,
            ..ReconnectPolicy::default()
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = no_jitter();
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(10));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(20));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(40));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_secs(60));
        assert_eq!(policy.delay_for_attempt(12), Duration::from_secs(60));
    }

    #[test]
    fn jitter_stays_within_spread() {
        let policy = ReconnectPolicy {
            jitter: 0.1,
            ..ReconnectPolicy::default()
        };
        for _ in 0..50 {
            let d = policy.delay_for_attempt(2).as_secs_f64();
            assert!((9.0..=11.0).contains(&d), "delay {} outside jitter band", d);
        }
    }

    #[tokio::test]
    async fn attempt_counter_resets_on_success() {
        let session = DeviceSession::new(
            "d1",
            DeviceType::SolarPv,
            ProtocolFamily::Modbus,
            MessageBus::new(),
        );
        assert_eq!(session.record_attempt(), 1);
        assert_eq!(session.record_attempt(), 2);
        session.record_connect_success();
        assert_eq!(session.connection_attempts(), 0);
        assert_eq!(session.record_attempt(), 1);
    }

    #[tokio::test]
    async fn silenced_session_suppresses_publishes() {
        let bus = MessageBus::new();
        let (_h, mut rx) = bus.subscribe_channel("devices/#");
        let session =
            DeviceSession::new("d1", DeviceType::SolarPv, ProtocolFamily::Modbus, bus.clone());

        session.set_state(SessionState::ShuttingDown);
        session.publish_online(None).unwrap();

        assert!(
            tokio::time::timeout(Duration::from_millis(50), rx.recv())
                .await
                .is_err(),
            "no publish expected after shutdown"
        );
    }

    #[tokio::test]
    async fn wait_while_connecting_returns_final_state() {
        let session = std::sync::Arc::new(DeviceSession::new(
            "d1",
            DeviceType::SolarPv,
            ProtocolFamily::Modbus,
            MessageBus::new(),
        ));
        session.set_state(SessionState::Connecting);
        let waiter = {
            let session = std::sync::Arc::clone(&session);
            tokio::spawn(async move { session.wait_while_connecting().await })
        };
        tokio::task::yield_now().await;
        session.set_state(SessionState::Connected);
        assert_eq!(waiter.await.unwrap(), SessionState::Connected);
    }
}
