//! Push gateway server
//!
//! One WebSocket endpoint at `/ws`. Fan-out never holds the connection-table
//! lock across a send: targets are collected under the read lock, the lock
//! is released, and each send runs against the connection's own sink. A send
//! failure terminates that connection and nothing else.

use crate::error::Result;
use crate::push::connection::{ClientConnection, Scope};
use crate::push::frames::{ClientFrame, ServerFrame};
use crate::registry::DeviceRegistry;
use bus::Publication;
use chrono::Utc;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use types::{BusMessage, DeviceStatus, SiteId};
use uuid::Uuid;

/// Liveness cadence
#[derive(Debug, Clone)]
pub struct PushSettings {
    pub ping_interval: Duration,
    pub sweep_interval: Duration,
}

impl Default for PushSettings {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// What a bus publication becomes on the client wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameKind {
    DeviceReading,
    EnergyReading,
    DeviceCommand,
    DeviceError,
    Recommendation,
}

struct PushInner {
    registry: Arc<dyn DeviceRegistry>,
    connections: tokio::sync::RwLock<HashMap<String, Arc<ClientConnection>>>,
    settings: PushSettings,
}

/// Real-time push gateway
pub struct PushGateway {
    inner: Arc<PushInner>,
    bus: bus::MessageBus,
    local_addr: SocketAddr,
    tasks: Vec<JoinHandle<()>>,
    subscriptions: Vec<bus::SubscriptionHandle>,
}

impl PushGateway {
    /// Bind the endpoint, subscribe the fan-out topics, start the liveness
    /// tasks.
    pub async fn bind(
        addr: &str,
        bus: bus::MessageBus,
        registry: Arc<dyn DeviceRegistry>,
        settings: PushSettings,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let inner = Arc::new(PushInner {
            registry,
            connections: tokio::sync::RwLock::new(HashMap::new()),
            settings,
        });

        let mut tasks = Vec::new();
        let mut subscriptions = Vec::new();

        // Accept loop
        {
            let inner = Arc::clone(&inner);
            tasks.push(tokio::spawn(async move {
                loop {
                    match listener.accept().await {
                        Ok((stream, peer)) => {
                            debug!(%peer, "push client connecting");
                            let inner = Arc::clone(&inner);
                            tokio::spawn(async move {
                                if let Err(err) = handle_client(inner, stream).await {
                                    debug!(%peer, error = %err, "push client ended");
                                }
                            });
                        }
                        Err(err) => {
                            warn!(error = %err, "accept failed");
                        }
                    }
                }
            }));
        }

        // One bus subscription per emitted frame kind
        for (filter, kind) in [
            ("devices/+/telemetry", FrameKind::DeviceReading),
            ("sites/+/energy/readings", FrameKind::EnergyReading),
            ("devices/+/commands", FrameKind::DeviceCommand),
            ("devices/+/status", FrameKind::DeviceError),
            ("sites/+/energy/recommendations", FrameKind::Recommendation),
        ] {
            let (handle, mut rx) = bus.subscribe_channel(filter);
            subscriptions.push(handle);
            let inner = Arc::clone(&inner);
            tasks.push(tokio::spawn(async move {
                while let Some(publication) = rx.recv().await {
                    dispatch_one(&inner, kind, publication).await;
                }
            }));
        }

        // Ping/pong liveness: a connection that has not answered since the
        // previous ping is terminated, i.e. within two intervals.
        {
            let inner = Arc::clone(&inner);
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(inner.settings.ping_interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let snapshot: Vec<_> =
                        inner.connections.read().await.values().cloned().collect();
                    for connection in snapshot {
                        if !connection.take_responsive() {
                            info!(connection = %connection.id, "unresponsive, terminating");
                            terminate(&inner, &connection.id).await;
                        } else if connection.send_ping().await.is_err() {
                            terminate(&inner, &connection.id).await;
                        }
                    }
                }
            }));
        }

        // Stale-activity sweep
        {
            let inner = Arc::clone(&inner);
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(inner.settings.sweep_interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let cutoff = inner.settings.sweep_interval * 2;
                    let stale: Vec<String> = inner
                        .connections
                        .read()
                        .await
                        .values()
                        .filter(|c| c.last_activity().elapsed() > cutoff)
                        .map(|c| c.id.clone())
                        .collect();
                    for id in stale {
                        info!(connection = %id, "stale, sweeping");
                        terminate(&inner, &id).await;
                    }
                }
            }));
        }

        info!(%local_addr, "push gateway listening");
        Ok(Self {
            inner,
            bus,
            local_addr,
            tasks,
            subscriptions,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.connections.read().await.len()
    }

    /// Stop the listener and liveness tasks and drop every connection
    pub async fn shutdown(self) {
        for handle in &self.subscriptions {
            self.bus.unsubscribe(handle);
        }
        for task in &self.tasks {
            task.abort();
        }
        let drained: Vec<_> = self
            .inner
            .connections
            .write()
            .await
            .drain()
            .map(|(_, c)| c)
            .collect();
        for connection in drained {
            connection.close().await;
        }
    }
}

async fn handle_client(inner: Arc<PushInner>, stream: TcpStream) -> Result<()> {
    // Only /ws is served.
    let check_path = |request: &Request, response: Response| {
        if request.uri().path() == "/ws" {
            Ok(response)
        } else {
            let mut reject = ErrorResponse::new(None);
            *reject.status_mut() = tokio_tungstenite::tungstenite::http::StatusCode::NOT_FOUND;
            Err(reject)
        }
    };
    let websocket = tokio_tungstenite::accept_hdr_async(stream, check_path).await?;
    let (sink, mut source) = websocket.split();

    let connection = Arc::new(ClientConnection::new(Uuid::new_v4().to_string(), sink));
    inner
        .connections
        .write()
        .await
        .insert(connection.id.clone(), Arc::clone(&connection));

    if connection
        .send_frame(&ServerFrame::Connected {
            connection_id: connection.id.clone(),
            timestamp: Utc::now(),
        })
        .await
        .is_err()
    {
        terminate(&inner, &connection.id).await;
        return Ok(());
    }
    info!(connection = %connection.id, "push client connected");

    while let Some(message) = source.next().await {
        match message {
            Ok(Message::Text(raw)) => {
                connection.touch();
                match serde_json::from_str::<ClientFrame>(&raw) {
                    Ok(frame) => {
                        if handle_control_frame(&connection, frame).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        debug!(connection = %connection.id, error = %err, "bad control frame");
                    }
                }
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => connection.touch(),
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    terminate(&inner, &connection.id).await;
    info!(connection = %connection.id, "push client disconnected");
    Ok(())
}

async fn handle_control_frame(connection: &ClientConnection, frame: ClientFrame) -> Result<()> {
    match frame {
        ClientFrame::Subscribe { site_id, device_id } => {
            connection.subscribe(site_id, device_id.clone());
            connection
                .send_frame(&ServerFrame::Subscribed {
                    site_id,
                    device_id,
                    timestamp: Utc::now(),
                })
                .await
        }
        ClientFrame::Unsubscribe { site_id, device_id } => {
            connection.unsubscribe(site_id, device_id.clone());
            connection
                .send_frame(&ServerFrame::Unsubscribed {
                    site_id,
                    device_id,
                    timestamp: Utc::now(),
                })
                .await
        }
        ClientFrame::Ping => {
            connection
                .send_frame(&ServerFrame::Pong {
                    timestamp: Utc::now(),
                })
                .await
        }
    }
}

/// Site id from `sites/<id>/...` topics
fn site_from_topic(topic: &str) -> Option<SiteId> {
    let mut tokens = topic.split('/');
    if tokens.next() != Some("sites") {
        return None;
    }
    tokens.next().and_then(|t| t.parse().ok())
}

fn scope_matches(scope: &Scope, device_id: Option<&str>, site_id: Option<SiteId>) -> bool {
    if let (Some(device), Some(subscribed)) = (device_id, scope.device_id.as_deref()) {
        if device == subscribed {
            return true;
        }
    }
    if let (Some(site), Some(subscribed)) = (site_id, scope.site_id) {
        if site == subscribed {
            return true;
        }
    }
    false
}

async fn dispatch_one(inner: &Arc<PushInner>, kind: FrameKind, publication: Publication) {
    let message = &*publication.message;

    // Status messages only fan out as error envelopes.
    if kind == FrameKind::DeviceError {
        let BusMessage::Status(status) = message else {
            return;
        };
        if status.status != DeviceStatus::Error {
            return;
        }
    }

    let data = match serde_json::to_value(message) {
        Ok(data) => data,
        Err(err) => {
            warn!(error = %err, "unserializable bus message");
            return;
        }
    };
    let timestamp = Utc::now();
    let frame = match kind {
        FrameKind::DeviceReading => ServerFrame::DeviceReading { data, timestamp },
        FrameKind::EnergyReading => ServerFrame::EnergyReading { data, timestamp },
        FrameKind::DeviceCommand => ServerFrame::DeviceCommand { data, timestamp },
        FrameKind::DeviceError => ServerFrame::Error { data, timestamp },
        FrameKind::Recommendation => ServerFrame::OptimizationRecommendation { data, timestamp },
    };

    // Resolve the message's scope once, before iterating connections.
    let (device_id, site_id) = match kind {
        FrameKind::EnergyReading | FrameKind::Recommendation => {
            (None, site_from_topic(&publication.topic))
        }
        _ => {
            let device = message.device_id().to_string();
            let site = inner.registry.site_of(&device).await.ok().flatten();
            (Some(device), site)
        }
    };

    // Release-then-send: collect targets, drop the lock, send one by one.
    let targets: Vec<Arc<ClientConnection>> = {
        let connections = inner.connections.read().await;
        connections
            .values()
            .filter(|c| scope_matches(&c.scope(), device_id.as_deref(), site_id))
            .cloned()
            .collect()
    };

    for connection in targets {
        if let Err(err) = connection.send_frame(&frame).await {
            warn!(connection = %connection.id, error = %err, "send failed, terminating");
            terminate(inner, &connection.id).await;
        }
    }
}

async fn terminate(inner: &Arc<PushInner>, connection_id: &str) {
    let removed = inner.connections.write().await.remove(connection_id);
    if let Some(connection) = removed {
        connection.close().await;
    }
}
