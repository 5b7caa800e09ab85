//! Outgoing-call correlation
//!
//! Every outgoing call registers its fresh messageId here; the reply path is
//! a lookup-and-resolve. Waiters time out after the protocol timeout and the
//! entry is purged either way, so the table cannot leak.

use crate::error::{AdapterError, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::oneshot;

/// Result of one correlated call
#[derive(Debug)]
pub enum CallOutcome {
    Result(Value),
    Error { code: String, description: String },
}

/// messageId → resolver table
#[derive(Default)]
pub struct PendingCalls {
    inner: Mutex<HashMap<String, oneshot::Sender<CallOutcome>>>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a messageId and obtain its receiver
    pub fn register(&self, message_id: &str) -> oneshot::Receiver<CallOutcome> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .lock()
            .expect("pending table poisoned")
            .insert(message_id.to_string(), tx);
        rx
    }

    /// Resolve a pending call; false when the id is unknown (already purged
    /// or never registered)
    pub fn resolve(&self, message_id: &str, outcome: CallOutcome) -> bool {
        let sender = self
            .inner
            .lock()
            .expect("pending table poisoned")
            .remove(message_id);
        match sender {
            Some(tx) => tx.send(outcome).is_ok(),
            None => false,
        }
    }

    /// Drop a pending entry without resolving it
    pub fn purge(&self, message_id: &str) {
        self.inner
            .lock()
            .expect("pending table poisoned")
            .remove(message_id);
    }

    /// Fail every waiter; used when the wire drops
    pub fn fail_all(&self, description: &str) {
        let drained: Vec<_> = self
            .inner
            .lock()
            .expect("pending table poisoned")
            .drain()
            .collect();
        for (_, tx) in drained {
            let _ = tx.send(CallOutcome::Error {
                code: "InternalError".to_string(),
                description: description.to_string(),
            });
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("pending table poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Await a registered call's outcome, purging the entry on timeout
    pub async fn wait(
        &self,
        device: &str,
        message_id: &str,
        rx: oneshot::Receiver<CallOutcome>,
        timeout: Duration,
    ) -> Result<Value> {
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(CallOutcome::Result(payload))) => Ok(payload),
            Ok(Ok(CallOutcome::Error { code, description })) => {
                Err(AdapterError::ProtocolViolation {
                    device: device.to_string(),
                    details: format!("call error {}: {}", code, description),
                })
            }
            Ok(Err(_closed)) => Err(AdapterError::Cancelled),
            Err(_elapsed) => {
                self.purge(message_id);
                Err(AdapterError::Timeout {
                    device: device.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn resolve_delivers_payload() {
        let pending = PendingCalls::new();
        let rx = pending.register("m1");
        assert_eq!(pending.len(), 1);
        assert!(pending.resolve("m1", CallOutcome::Result(json!({"ok": true}))));
        let payload = pending
            .wait("cp", "m1", rx, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(payload["ok"], true);
        assert!(pending.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_purges_the_entry() {
        let pending = PendingCalls::new();
        let rx = pending.register("m2");
        let err = pending
            .wait("cp", "m2", rx, Duration::from_secs(30))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "Timeout");
        assert!(pending.is_empty());
        // A late reply after the purge is a no-op.
        assert!(!pending.resolve("m2", CallOutcome::Result(json!({}))));
    }

    #[tokio::test]
    async fn fail_all_unblocks_every_waiter() {
        let pending = PendingCalls::new();
        let rx1 = pending.register("a");
        let rx2 = pending.register("b");
        pending.fail_all("wire dropped");
        for rx in [rx1, rx2] {
            let err = pending
                .wait("cp", "x", rx, Duration::from_secs(1))
                .await
                .unwrap_err();
            assert_eq!(err.kind(), "ProtocolViolation");
        }
    }
}
