//! Adapter managers
//!
//! One manager per protocol family owns that family's live adapters. The
//! table is the only structure shared across adapter operations; every
//! access goes through its lock. The manager also wires each adapter's
//! command topic: a `devices/<id>/commands` publication becomes an
//! `execute_command` call and exactly one `commands/response`.

use crate::adapter::{run_command, DeviceAdapter};
use crate::error::{AdapterError, Result};
use crate::factory;
use crate::session::{AdapterSettings, SessionState};
use futures_util::future::join_all;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use types::{topic, BusMessage, DeviceRecord, DeviceType, ProtocolFamily};

/// Adapter constructor used by the manager; swap in tests
pub type AdapterFactory = Arc<
    dyn Fn(&DeviceRecord, bus::MessageBus, AdapterSettings) -> Result<Arc<dyn DeviceAdapter>>
        + Send
        + Sync,
>;

struct ManagedAdapter {
    adapter: Arc<dyn DeviceAdapter>,
    command_subscription: bus::SubscriptionHandle,
    command_task: JoinHandle<()>,
}

/// Owner of one protocol family's live adapter sessions
pub struct AdapterManager {
    family: ProtocolFamily,
    bus: bus::MessageBus,
    settings: AdapterSettings,
    /// Connect adapters as they are added (development); production callers
    /// connect explicitly
    auto_connect: bool,
    factory: AdapterFactory,
    table: tokio::sync::RwLock<HashMap<String, ManagedAdapter>>,
}

impl AdapterManager {
    pub fn new(family: ProtocolFamily, bus: bus::MessageBus, settings: AdapterSettings) -> Self {
        Self::with_factory(family, bus, settings, Arc::new(factory::build_adapter))
    }

    pub fn with_factory(
        family: ProtocolFamily,
        bus: bus::MessageBus,
        settings: AdapterSettings,
        factory: AdapterFactory,
    ) -> Self {
        Self {
            family,
            bus,
            settings,
            auto_connect: crate::config::development_mode(),
            factory,
            table: tokio::sync::RwLock::new(HashMap::new()),
        }
    }

    pub fn auto_connect(mut self, auto_connect: bool) -> Self {
        self.auto_connect = auto_connect;
        self
    }

    pub fn family(&self) -> ProtocolFamily {
        self.family
    }

    /// Create (or replace) the adapter for a device. A replaced adapter is
    /// fully disconnected before the new one is constructed.
    pub async fn add_device(&self, record: DeviceRecord) -> Result<Arc<dyn DeviceAdapter>> {
        if record.protocol() != self.family {
            return Err(AdapterError::Configuration(format!(
                "device {} is {} but this manager owns {}",
                record.device_id,
                record.protocol(),
                self.family
            )));
        }

        let existing = self.table.write().await.remove(&record.device_id);
        if let Some(old) = existing {
            info!(device = %record.device_id, "replacing existing adapter");
            teardown(&self.bus, old).await;
        }

        let adapter = (self.factory)(&record, self.bus.clone(), self.settings.clone())?;
        let command_topic = if record.device_type == DeviceType::Gateway {
            topic::gateway_commands(&record.device_id)
        } else {
            topic::device_commands(&record.device_id)
        };
        let (command_subscription, mut commands) = self.bus.subscribe_channel(&command_topic);
        let command_task = {
            let adapter = Arc::clone(&adapter);
            let timeout = self.settings.command_timeout;
            tokio::spawn(async move {
                while let Some(publication) = commands.recv().await {
                    let BusMessage::Command(command) = &*publication.message else {
                        continue;
                    };
                    let parameters = command.parameters.clone().unwrap_or_else(|| json!({}));
                    if let Err(err) =
                        run_command(&adapter, &command.command, parameters, timeout).await
                    {
                        debug!(
                            device = %adapter.device_id(),
                            command = %command.command,
                            error = %err,
                            "command not dispatched"
                        );
                    }
                }
            })
        };

        self.table.write().await.insert(
            record.device_id.clone(),
            ManagedAdapter {
                adapter: Arc::clone(&adapter),
                command_subscription,
                command_task,
            },
        );
        info!(device = %record.device_id, family = %self.family, "adapter added");

        if self.auto_connect {
            let adapter = Arc::clone(&adapter);
            tokio::spawn(async move {
                if let Err(err) = adapter.connect().await {
                    warn!(device = %adapter.device_id(), error = %err, "auto-connect failed");
                }
            });
        }
        Ok(adapter)
    }

    /// Destroy a device's adapter: timers cancelled, wire released, no
    /// publish after removal.
    pub async fn remove_device(&self, device_id: &str) -> Result<()> {
        let removed = self.table.write().await.remove(device_id);
        match removed {
            Some(managed) => {
                teardown(&self.bus, managed).await;
                info!(device = %device_id, "adapter removed");
                Ok(())
            }
            None => Err(AdapterError::AdapterNotFound {
                device: device_id.to_string(),
            }),
        }
    }

    pub async fn get(&self, device_id: &str) -> Option<Arc<dyn DeviceAdapter>> {
        self.table
            .read()
            .await
            .get(device_id)
            .map(|m| Arc::clone(&m.adapter))
    }

    pub async fn get_all(&self) -> Vec<Arc<dyn DeviceAdapter>> {
        self.table
            .read()
            .await
            .values()
            .map(|m| Arc::clone(&m.adapter))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.table.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.table.read().await.is_empty()
    }

    /// Strictly ordered termination: every adapter is disconnected in
    /// parallel, individual failures logged, the table cleared.
    pub async fn shutdown(&self) {
        let drained: Vec<_> = self.table.write().await.drain().map(|(_, m)| m).collect();
        let count = drained.len();
        join_all(drained.into_iter().map(|managed| teardown(&self.bus, managed))).await;
        info!(family = %self.family, count, "manager shut down");
    }
}

/// Silence the session, stop command dispatch, release the wire
async fn teardown(bus: &bus::MessageBus, managed: ManagedAdapter) {
    let ManagedAdapter {
        adapter,
        command_subscription,
        command_task,
    } = managed;
    bus.unsubscribe(&command_subscription);
    command_task.abort();
    adapter.session().set_state(SessionState::ShuttingDown);
    if let Err(err) = adapter.disconnect().await {
        warn!(device = %adapter.device_id(), error = %err, "disconnect during teardown failed");
    }
}
