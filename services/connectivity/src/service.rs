//! Composition root
//!
//! Explicit collaborators instead of process-wide singletons: one bus, one
//! registry facade, one manager per protocol family, one optional push
//! gateway. Lifecycle is init → use → shutdown; shutdown is ordered (push
//! first, then managers, then the bus).

use crate::error::{AdapterError, Result};
use crate::manager::AdapterManager;
use crate::push::{PushGateway, PushSettings};
use crate::registry::DeviceRegistry;
use crate::session::AdapterSettings;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;
use types::{DeviceRecord, ProtocolFamily};

/// The connectivity plane, assembled
pub struct ConnectivityService {
    bus: bus::MessageBus,
    registry: Arc<dyn DeviceRegistry>,
    managers: HashMap<ProtocolFamily, Arc<AdapterManager>>,
    push: Option<PushGateway>,
}

impl ConnectivityService {
    pub fn new(
        bus: bus::MessageBus,
        registry: Arc<dyn DeviceRegistry>,
        settings: AdapterSettings,
    ) -> Self {
        let managers = [
            ProtocolFamily::Modbus,
            ProtocolFamily::Ocpp,
            ProtocolFamily::Eebus,
            ProtocolFamily::Tcpip,
            ProtocolFamily::Gateway,
        ]
        .into_iter()
        .map(|family| {
            (
                family,
                Arc::new(AdapterManager::new(family, bus.clone(), settings.clone())),
            )
        })
        .collect();

        Self {
            bus,
            registry,
            managers,
            push: None,
        }
    }

    pub fn bus(&self) -> &bus::MessageBus {
        &self.bus
    }

    pub fn registry(&self) -> &Arc<dyn DeviceRegistry> {
        &self.registry
    }

    pub fn manager(&self, family: ProtocolFamily) -> &Arc<AdapterManager> {
        self.managers
            .get(&family)
            .expect("every family has a manager")
    }

    /// Route a device record to its family's manager
    pub async fn add_device(
        &self,
        record: DeviceRecord,
    ) -> Result<Arc<dyn crate::adapter::DeviceAdapter>> {
        self.manager(record.protocol()).add_device(record).await
    }

    /// Remove a device wherever it lives
    pub async fn remove_device(&self, device_id: &str) -> Result<()> {
        for manager in self.managers.values() {
            match manager.remove_device(device_id).await {
                Ok(()) => return Ok(()),
                Err(AdapterError::AdapterNotFound { .. }) => continue,
                Err(err) => return Err(err),
            }
        }
        Err(AdapterError::AdapterNotFound {
            device: device_id.to_string(),
        })
    }

    /// Start the push gateway on `addr`
    pub async fn start_push(&mut self, addr: &str, settings: PushSettings) -> Result<()> {
        let gateway = PushGateway::bind(
            addr,
            self.bus.clone(),
            Arc::clone(&self.registry),
            settings,
        )
        .await?;
        info!(addr = %gateway.local_addr(), "push gateway started");
        self.push = Some(gateway);
        Ok(())
    }

    pub fn push(&self) -> Option<&PushGateway> {
        self.push.as_ref()
    }

    /// Ordered teardown of the whole plane
    pub async fn shutdown(mut self) {
        if let Some(push) = self.push.take() {
            push.shutdown().await;
        }
        for manager in self.managers.values() {
            manager.shutdown().await;
        }
        self.bus.close();
        info!("connectivity service stopped");
    }
}
