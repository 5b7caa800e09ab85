//! Adapter contract
//!
//! Every protocol adapter is one long-lived session owning one device's wire
//! connection. Observable behavior goes through the bus; the trait surface
//! below is what managers (and the composite gateway) drive directly.

use crate::error::{AdapterError, Result};
use crate::session::{DeviceSession, SessionState};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use types::{DeviceType, ProtocolFamily};

/// Core trait implemented by every protocol adapter
///
/// Lifecycle guarantees:
/// - `connect` is idempotent; calls made while Connecting coalesce and
///   return the outcome of the in-flight attempt
/// - `disconnect` is idempotent and safe in any state; it preempts in-flight
///   heartbeat/scan/reconnect waits within a bounded interval
/// - after `disconnect` returns, none of the session's timers fire again
#[async_trait]
pub trait DeviceAdapter: Send + Sync {
    /// Session owned by this adapter
    fn session(&self) -> &DeviceSession;

    /// Establish the wire connection and start the session task
    async fn connect(&self) -> Result<()>;

    /// Tear the session down and release the wire connection
    async fn disconnect(&self) -> Result<()>;

    /// Begin polling. No-op for event-driven adapters.
    async fn start_scanning(&self) -> Result<()> {
        Ok(())
    }

    /// Stop polling. No-op for event-driven adapters.
    async fn stop_scanning(&self) -> Result<()> {
        Ok(())
    }

    /// Execute a protocol-specific command, returning its raw result.
    ///
    /// Callers go through [`run_command`], which enforces the protocol
    /// timeout and publishes the `commands/response` message.
    async fn execute_command(&self, command: &str, parameters: Value) -> Result<Value>;

    fn device_id(&self) -> &str {
        self.session().device_id()
    }

    fn device_type(&self) -> DeviceType {
        self.session().device_type()
    }

    fn protocol(&self) -> ProtocolFamily {
        self.session().protocol()
    }

    fn state(&self) -> SessionState {
        self.session().state()
    }

    fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }
}

impl std::fmt::Debug for dyn DeviceAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceAdapter")
            .field("device_id", &self.device_id())
            .field("protocol", &self.protocol())
            .field("state", &self.state())
            .finish()
    }
}

/// Drive one command through an adapter: bound it by `timeout`, then publish
/// exactly one `commands/response` for it. Timeouts surface as
/// `success=false` with error kind `Timeout`; a shutting-down session yields
/// a synthetic Cancelled without publishing.
pub async fn run_command(
    adapter: &Arc<dyn DeviceAdapter>,
    command: &str,
    parameters: Value,
    timeout: Duration,
) -> Result<()> {
    let session = adapter.session();
    if session.is_silenced() {
        return Err(AdapterError::Cancelled);
    }

    let outcome = tokio::time::timeout(timeout, adapter.execute_command(command, parameters)).await;
    match outcome {
        Ok(Ok(result)) => session.publish_command_response(command, true, Some(result), None),
        Ok(Err(err)) => {
            warn!(device = %adapter.device_id(), command, error = %err, "command failed");
            session.publish_command_response(command, false, None, Some(err.kind().to_string()))
        }
        Err(_elapsed) => {
            let err = AdapterError::Timeout {
                device: adapter.device_id().to_string(),
                timeout_ms: timeout.as_millis() as u64,
            };
            warn!(device = %adapter.device_id(), command, "command timed out");
            session.publish_command_response(command, false, None, Some(err.kind().to_string()))
        }
    }
}
