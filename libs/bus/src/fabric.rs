//! Bus core: subscription table, per-subscriber queues, dispatch

use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tracing::{debug, warn};
use types::BusMessage;

/// Result type alias for bus operations
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors surfaced by the bus
#[derive(Debug, Error)]
pub enum BusError {
    /// The bus has been closed; no further publishes are accepted
    #[error("bus is not connected")]
    NotConnected,
}

/// One delivered message: the concrete topic it was published on plus the
/// shared envelope.
#[derive(Debug, Clone)]
pub struct Publication {
    pub topic: String,
    pub message: Arc<BusMessage>,
}

/// Handle returned by subscribe; pass back to [`MessageBus::unsubscribe`].
#[derive(Debug)]
pub struct SubscriptionHandle {
    id: u64,
}

type Callback = Box<dyn Fn(Publication) + Send + Sync + 'static>;

struct SubscriptionState {
    filter: String,
    queue: Mutex<VecDeque<Publication>>,
    notify: Notify,
    cancelled: AtomicBool,
}

impl SubscriptionState {
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.notify.notify_one();
    }
}

struct BusInner {
    subscriptions: RwLock<HashMap<u64, Arc<SubscriptionState>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
    /// Soft bound of each subscriber queue; overflow sheds the oldest
    /// telemetry entry, never status/command class messages
    queue_capacity: usize,
}

/// In-process publish/subscribe bus. Cheap to clone; all clones share the
/// same subscription table.
///
/// Subscribing spawns a drain task, so a tokio runtime must be running.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBus {
    pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

    pub fn new() -> Self {
        Self::with_queue_capacity(Self::DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_queue_capacity(queue_capacity: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscriptions: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
                queue_capacity,
            }),
        }
    }

    /// Register `callback` for every published topic matching `filter`.
    ///
    /// The callback runs on the subscription's own drain task; a panic inside
    /// it is caught and logged without affecting other subscribers or
    /// subsequent deliveries to this one. Multiple subscriptions on the same
    /// filter are independent.
    pub fn subscribe<F>(&self, filter: &str, callback: F) -> SubscriptionHandle
    where
        F: Fn(Publication) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let state = Arc::new(SubscriptionState {
            filter: filter.to_string(),
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            cancelled: AtomicBool::new(false),
        });

        self.inner
            .subscriptions
            .write()
            .expect("subscription table poisoned")
            .insert(id, Arc::clone(&state));

        let callback: Callback = Box::new(callback);
        tokio::spawn(drain_loop(state, callback));

        debug!(filter = %filter, id, "bus subscription added");
        SubscriptionHandle { id }
    }

    /// Subscribe and receive publications over a channel instead of a
    /// callback. Convenient for async consumers.
    pub fn subscribe_channel(
        &self,
        filter: &str,
    ) -> (SubscriptionHandle, mpsc::UnboundedReceiver<Publication>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = self.subscribe(filter, move |publication| {
            let _ = tx.send(publication);
        });
        (handle, rx)
    }

    /// Remove a subscription. Idempotent; a second call with the same handle
    /// is a no-op.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) {
        let removed = self
            .inner
            .subscriptions
            .write()
            .expect("subscription table poisoned")
            .remove(&handle.id);
        if let Some(state) = removed {
            state.cancel();
            debug!(id = handle.id, "bus subscription removed");
        }
    }

    /// Publish `message` on `topic`. Never blocks on slow subscribers: each
    /// matching subscription gets the message appended to its own queue.
    pub fn publish(&self, topic: &str, message: BusMessage) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(BusError::NotConnected);
        }

        let message = Arc::new(message);
        let subscriptions = self
            .inner
            .subscriptions
            .read()
            .expect("subscription table poisoned");

        for state in subscriptions.values() {
            if crate::topic::matches(&state.filter, topic) {
                enqueue(
                    state,
                    Publication {
                        topic: topic.to_string(),
                        message: Arc::clone(&message),
                    },
                    self.inner.queue_capacity,
                );
            }
        }
        Ok(())
    }

    /// Close the bus: all subscriptions are cancelled and further publishes
    /// fail with [`BusError::NotConnected`].
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let mut subscriptions = self
            .inner
            .subscriptions
            .write()
            .expect("subscription table poisoned");
        for (_, state) in subscriptions.drain() {
            state.cancel();
        }
    }

    /// Number of live subscriptions
    pub fn subscription_count(&self) -> usize {
        self.inner
            .subscriptions
            .read()
            .expect("subscription table poisoned")
            .len()
    }
}

fn enqueue(state: &SubscriptionState, publication: Publication, capacity: usize) {
    let mut queue = state.queue.lock().expect("subscriber queue poisoned");
    if queue.len() >= capacity {
        if let Some(pos) = queue.iter().position(|p| p.message.is_droppable()) {
            let shed_topic = queue.remove(pos).map(|p| p.topic).unwrap_or_default();
            warn!(
                filter = %state.filter,
                topic = %shed_topic,
                "subscriber queue full, shedding oldest telemetry"
            );
        } else if publication.message.is_droppable() {
            // Queue holds only must-deliver messages; the incoming telemetry
            // is the one that yields.
            warn!(filter = %state.filter, topic = %publication.topic,
                "subscriber queue full, shedding incoming telemetry");
            return;
        }
        // Non-droppable overflow grows the queue past its soft bound.
    }
    queue.push_back(publication);
    state.notify.notify_one();
}

async fn drain_loop(state: Arc<SubscriptionState>, callback: Callback) {
    loop {
        if state.cancelled.load(Ordering::Acquire) {
            return;
        }
        let next = state
            .queue
            .lock()
            .expect("subscriber queue poisoned")
            .pop_front();
        match next {
            Some(publication) => {
                let result = catch_unwind(AssertUnwindSafe(|| callback(publication)));
                if result.is_err() {
                    warn!(filter = %state.filter, "subscriber callback panicked; continuing");
                }
            }
            None => state.notify.notified().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::time::Duration;
    use types::{DeviceStatus, DeviceType, ProtocolFamily};

    fn telemetry(device: &str) -> BusMessage {
        BusMessage::telemetry(
            device,
            DeviceType::SolarPv,
            ProtocolFamily::Modbus,
            BTreeMap::new(),
            BTreeMap::new(),
        )
    }

    async fn drain_until(
        rx: &mut mpsc::UnboundedReceiver<Publication>,
        count: usize,
    ) -> Vec<Publication> {
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            let p = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .expect("timed out waiting for publication")
                .expect("channel closed");
            out.push(p);
        }
        out
    }

    #[tokio::test]
    async fn wildcard_subscription_sees_exactly_matching_topics() {
        let bus = MessageBus::new();
        let (_handle, mut rx) = bus.subscribe_channel("devices/+/telemetry");

        bus.publish("devices/42/telemetry", telemetry("42")).unwrap();
        bus.publish("devices/42/status", BusMessage::status("42", DeviceStatus::Online, None))
            .unwrap();
        bus.publish("devices/abc/telemetry", telemetry("abc")).unwrap();
        bus.publish("gateways/1/telemetry", telemetry("gw-1")).unwrap();

        let got = drain_until(&mut rx, 2).await;
        assert_eq!(got[0].topic, "devices/42/telemetry");
        assert_eq!(got[1].topic, "devices/abc/telemetry");
        assert!(
            tokio::time::timeout(Duration::from_millis(50), rx.recv())
                .await
                .is_err(),
            "no further deliveries expected"
        );
    }

    #[tokio::test]
    async fn per_subscriber_order_is_publish_order() {
        let bus = MessageBus::new();
        let (_handle, mut rx) = bus.subscribe_channel("devices/1/telemetry");

        for _ in 0..100 {
            bus.publish("devices/1/telemetry", telemetry("1")).unwrap();
        }
        let got = drain_until(&mut rx, 100).await;
        // Construction order equals delivery order: timestamps are monotone
        // non-decreasing.
        let timestamps: Vec<_> = got.iter().map(|p| p.message.timestamp()).collect();
        let mut sorted = timestamps.clone();
        sorted.sort();
        assert_eq!(timestamps, sorted);
    }

    #[tokio::test]
    async fn panicking_subscriber_does_not_affect_others() {
        let bus = MessageBus::new();
        let _bad = bus.subscribe("devices/#", |_p| panic!("misbehaving subscriber"));
        let (_good, mut rx) = bus.subscribe_channel("devices/#");

        bus.publish("devices/9/telemetry", telemetry("9")).unwrap();
        bus.publish("devices/9/telemetry", telemetry("9")).unwrap();

        let got = drain_until(&mut rx, 2).await;
        assert_eq!(got.len(), 2);
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent_and_stops_delivery() {
        let bus = MessageBus::new();
        let (handle, mut rx) = bus.subscribe_channel("devices/#");
        assert_eq!(bus.subscription_count(), 1);

        bus.unsubscribe(&handle);
        bus.unsubscribe(&handle);
        assert_eq!(bus.subscription_count(), 0);

        bus.publish("devices/1/telemetry", telemetry("1")).unwrap();
        assert!(
            tokio::time::timeout(Duration::from_millis(50), rx.recv())
                .await
                .map(|v| v.is_none())
                .unwrap_or(true),
            "unsubscribed channel must not receive"
        );
    }

    #[tokio::test]
    async fn overflow_sheds_oldest_telemetry_but_keeps_status() {
        let state = Arc::new(SubscriptionState {
            filter: "devices/#".to_string(),
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            cancelled: AtomicBool::new(false),
        });

        for i in 0..4 {
            enqueue(
                &state,
                Publication {
                    topic: format!("devices/{}/telemetry", i),
                    message: Arc::new(telemetry(&i.to_string())),
                },
                4,
            );
        }
        // A status message displaces the oldest telemetry rather than being shed.
        enqueue(
            &state,
            Publication {
                topic: "devices/s/status".to_string(),
                message: Arc::new(BusMessage::status("s", DeviceStatus::Online, None)),
            },
            4,
        );
        let queue = state.queue.lock().unwrap();
        assert_eq!(queue.len(), 4);
        assert_eq!(queue.front().unwrap().topic, "devices/1/telemetry");
        assert_eq!(queue.back().unwrap().topic, "devices/s/status");
    }

    #[tokio::test]
    async fn publish_after_close_fails() {
        let bus = MessageBus::new();
        bus.close();
        let err = bus
            .publish("devices/1/telemetry", telemetry("1"))
            .unwrap_err();
        assert!(matches!(err, BusError::NotConnected));
    }
}
