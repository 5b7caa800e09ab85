//! Device registry facade
//!
//! Thin read-only window onto the external storage service: device record
//! and device-to-site resolution. The core never writes through this
//! boundary.

use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;
use types::{DeviceRecord, SiteId};

/// Read-only device lookup
#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    /// Full record for a device id, if known
    async fn device(&self, device_id: &str) -> Result<Option<DeviceRecord>>;

    /// Site a device belongs to
    async fn site_of(&self, device_id: &str) -> Result<Option<SiteId>> {
        Ok(self.device(device_id).await?.map(|d| d.site_id))
    }
}

/// In-memory registry for development and tests
#[derive(Default)]
pub struct InMemoryRegistry {
    devices: RwLock<HashMap<String, DeviceRecord>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: DeviceRecord) {
        self.devices
            .write()
            .expect("registry poisoned")
            .insert(record.device_id.clone(), record);
    }

    pub fn remove(&self, device_id: &str) {
        self.devices.write().expect("registry poisoned").remove(device_id);
    }
}

#[async_trait]
impl DeviceRegistry for InMemoryRegistry {
    async fn device(&self, device_id: &str) -> Result<Option<DeviceRecord>> {
        Ok(self
            .devices
            .read()
            .expect("registry poisoned")
            .get(device_id)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use types::{ConnectionConfig, DeviceType, TcpipConfig};

    fn record(device_id: &str, site_id: SiteId) -> DeviceRecord {
        DeviceRecord {
            id: 1,
            device_id: device_id.to_string(),
            site_id,
            device_type: DeviceType::SmartMeter,
            connection: ConnectionConfig::Tcpip(TcpipConfig {
                host: "127.0.0.1".to_string(),
                port: 9000,
                poll_interval_ms: 1000,
                mock: true,
            }),
        }
    }

    #[tokio::test]
    async fn resolves_site_for_known_device() {
        let registry = InMemoryRegistry::new();
        registry.insert(record("meter-1", 7));
        assert_eq!(registry.site_of("meter-1").await.unwrap(), Some(7));
        assert_eq!(registry.site_of("unknown").await.unwrap(), None);
    }
}
