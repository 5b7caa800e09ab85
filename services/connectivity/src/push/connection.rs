//! One push client connection

use crate::error::{AdapterError, Result};
use crate::push::frames::ServerFrame;
use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use types::SiteId;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Subscription scope of one connection. Both fields optional; a message is
/// forwarded when either matches.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Scope {
    pub site_id: Option<SiteId>,
    pub device_id: Option<String>,
}

/// Server-side state of one push client
pub struct ClientConnection {
    pub id: String,
    sink: Mutex<WsSink>,
    scope: StdMutex<Scope>,
    last_activity: StdMutex<Instant>,
    /// Cleared when a ping goes out, set by any client traffic; a
    /// connection still clear at the next ping interval is dead
    responsive: AtomicBool,
    closed: AtomicBool,
}

impl ClientConnection {
    pub fn new(id: String, sink: WsSink) -> Self {
        Self {
            id,
            sink: Mutex::new(sink),
            scope: StdMutex::new(Scope::default()),
            last_activity: StdMutex::new(Instant::now()),
            responsive: AtomicBool::new(true),
            closed: AtomicBool::new(false),
        }
    }

    pub fn scope(&self) -> Scope {
        self.scope.lock().expect("scope poisoned").clone()
    }

    pub fn subscribe(&self, site_id: Option<SiteId>, device_id: Option<String>) {
        let mut scope = self.scope.lock().expect("scope poisoned");
        if site_id.is_some() {
            scope.site_id = site_id;
        }
        if device_id.is_some() {
            scope.device_id = device_id;
        }
    }

    /// Clear the matching scope fields
    pub fn unsubscribe(&self, site_id: Option<SiteId>, device_id: Option<String>) {
        let mut scope = self.scope.lock().expect("scope poisoned");
        if site_id.is_some() && scope.site_id == site_id {
            scope.site_id = None;
        }
        if device_id.is_some() && scope.device_id == device_id {
            scope.device_id = None;
        }
    }

    pub fn touch(&self) {
        *self.last_activity.lock().expect("activity poisoned") = Instant::now();
        self.responsive.store(true, Ordering::Release);
    }

    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock().expect("activity poisoned")
    }

    /// Clear the responsiveness flag, returning its previous value
    pub fn take_responsive(&self) -> bool {
        self.responsive.swap(false, Ordering::AcqRel)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Send one envelope; any failure marks the connection closed so the
    /// caller can terminate exactly this client.
    pub async fn send_frame(&self, frame: &ServerFrame) -> Result<()> {
        self.send_message(Message::Text(frame.to_json())).await
    }

    /// Transport-level ping
    pub async fn send_ping(&self) -> Result<()> {
        self.send_message(Message::Ping(Vec::new())).await
    }

    async fn send_message(&self, message: Message) -> Result<()> {
        if self.is_closed() {
            return Err(AdapterError::ConnectionRefused {
                device: self.id.clone(),
                reason: "connection closed".to_string(),
            });
        }
        let mut sink = self.sink.lock().await;
        if let Err(err) = sink.send(message).await {
            self.closed.store(true, Ordering::Release);
            return Err(err.into());
        }
        Ok(())
    }

    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let mut sink = self.sink.lock().await;
        let _ = sink.send(Message::Close(None)).await;
    }
}
