//! In-memory development broker
//!
//! Wraps a [`MessageBus`] and records every publication, with an external
//! listener API so harnesses can observe traffic without taking a
//! subscription. `inject` feeds messages in as if a remote party had
//! published them, which is how adapter test rigs emulate bus-originated
//! commands.

use crate::fabric::{MessageBus, Publication, Result};
use std::sync::{Arc, Mutex, RwLock};
use types::BusMessage;

type Listener = Box<dyn Fn(&Publication) + Send + Sync + 'static>;

/// Recording broker for development and tests
#[derive(Clone)]
pub struct MockBroker {
    bus: MessageBus,
    published: Arc<Mutex<Vec<Publication>>>,
    listeners: Arc<RwLock<Vec<Listener>>>,
}

impl MockBroker {
    pub fn new(bus: MessageBus) -> Self {
        Self {
            bus,
            published: Arc::new(Mutex::new(Vec::new())),
            listeners: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// The wrapped bus, for wiring into components under test
    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    /// Publish through the broker, recording the publication and notifying
    /// external listeners before normal bus dispatch.
    pub fn publish(&self, topic: &str, message: BusMessage) -> Result<()> {
        let publication = Publication {
            topic: topic.to_string(),
            message: Arc::new(message),
        };
        self.published
            .lock()
            .expect("record log poisoned")
            .push(publication.clone());
        for listener in self.listeners.read().expect("listener set poisoned").iter() {
            listener(&publication);
        }
        self.bus.publish(topic, (*publication.message).clone())
    }

    /// Register an external listener invoked synchronously on every publish
    pub fn on_publish<F>(&self, listener: F)
    where
        F: Fn(&Publication) + Send + Sync + 'static,
    {
        self.listeners
            .write()
            .expect("listener set poisoned")
            .push(Box::new(listener));
    }

    /// Inject a message as if an external party had published it
    pub fn inject(&self, topic: &str, message: BusMessage) -> Result<()> {
        self.publish(topic, message)
    }

    /// Snapshot of everything published so far
    pub fn published(&self) -> Vec<Publication> {
        self.published.lock().expect("record log poisoned").clone()
    }

    /// Publications on topics matching `filter`
    pub fn published_matching(&self, filter: &str) -> Vec<Publication> {
        self.published()
            .into_iter()
            .filter(|p| crate::topic::matches(filter, &p.topic))
            .collect()
    }

    /// Drain the record log
    pub fn take_published(&self) -> Vec<Publication> {
        std::mem::take(&mut *self.published.lock().expect("record log poisoned"))
    }
}
