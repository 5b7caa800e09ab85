//! Upstream gateway transports
//!
//! The gateway's own wire session is a reachability probe; data flows
//! through the child adapters.

use crate::error::{AdapterError, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Upstream session of a composite gateway
#[async_trait]
pub trait GatewayTransport: Send + Sync {
    async fn open(&self) -> Result<()>;
    async fn close(&self) -> Result<()>;
    fn is_open(&self) -> bool;
    /// Lightweight reachability check run on each heartbeat
    async fn probe(&self) -> Result<()>;
}

/// TCP reachability transport: holds a connection to the gateway's base port
pub struct TcpProbeTransport {
    device: String,
    host: String,
    port: u16,
    stream: Mutex<Option<TcpStream>>,
    open: AtomicBool,
}

impl TcpProbeTransport {
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
impl GatewayTransport for TcpProbeTransport {
    async fn open(&self) -> Result<()> {
        if self.is_open() {
            return Ok(());
        }
        match timeout(CONNECT_TIMEOUT, TcpStream::connect((self.host.as_str(), self.port))).await {
            Ok(Ok(stream)) => {
                *self.stream.lock().await = Some(stream);
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
        if let Some(mut stream) = self.stream.lock().await.take() {
            stream.shutdown().await.ok();
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    async fn probe(&self) -> Result<()> {
        let mut guard = self.stream.lock().await;
        let stream = guard.as_mut().ok_or_else(|| AdapterError::ConnectionRefused {
            device: self.device.clone(),
            reason: "Not connected".to_string(),
        })?;
        // A closed peer shows up as a zero-length read; WouldBlock means the
        // socket is idle and healthy.
        let mut scratch = [0u8; 64];
        match stream.try_read(&mut scratch) {
            Ok(0) => {
                *guard = None;
                self.open.store(false, Ordering::Release);
                Err(AdapterError::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    "Port is closed",
                )))
            }
            Ok(_) => Ok(()),
            Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => Ok(()),
            Err(err) => {
                *guard = None;
                self.open.store(false, Ordering::Release);
                Err(err.into())
            }
        }
    }
}

/// Scripted upstream for development and tests
#[derive(Default)]
pub struct MockGatewayTransport {
    open: AtomicBool,
    fail_connects_remaining: AtomicU32,
    fail_probes: AtomicBool,
}

impl MockGatewayTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_connects(&self, n: u32) {
        self.fail_connects_remaining.store(n, Ordering::Release);
    }

    pub fn set_fail_probes(&self, fail: bool) {
        self.fail_probes.store(fail, Ordering::Release);
    }
}

#[async_trait]
impl GatewayTransport for MockGatewayTransport {
    async fn open(&self) -> Result<()> {
        let remaining = self.fail_connects_remaining.load(Ordering::Acquire);
        if remaining > 0 {
            self.fail_connects_remaining.store(remaining - 1, Ordering::Release);
            return Err(AdapterError::ConnectionRefused {
                device: "mock-gateway".to_string(),
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

    async fn probe(&self) -> Result<()> {
        if !self.is_open() {
            return Err(AdapterError::ConnectionRefused {
                device: "mock-gateway".to_string(),
                reason: "Not connected".to_string(),
            });
        }
        if self.fail_probes.load(Ordering::Acquire) {
            return Err(AdapterError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "Connection timed out",
            )));
        }
        Ok(())
    }
}
