//! Service-level configuration
//!
//! Per-device connection descriptors live in `types::config`; this module
//! covers the environment switches and the TOML service file that seeds
//! devices in development.

use crate::error::{AdapterError, Result};
use serde::Deserialize;
use std::path::Path;
use types::DeviceRecord;

/// `NODE_ENV=development` switches every adapter family to mock transports
/// unless a device descriptor overrides it.
pub fn development_mode() -> bool {
    std::env::var("NODE_ENV")
        .map(|v| v == "development")
        .unwrap_or(false)
}

/// External broker URL, when the deployment bridges the in-process bus to
/// MQTT. Absent means in-process only.
pub fn broker_url() -> Option<String> {
    std::env::var("MQTT_BROKER_URL").ok().filter(|v| !v.is_empty())
}

/// Whether a device should use a simulated transport: its own flag, or the
/// process-wide development switch.
pub fn mock_enabled(record: &DeviceRecord) -> bool {
    record.connection.is_mock() || development_mode()
}

/// TOML service file: a device list plus optional push-gateway bind address
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
    #[serde(default)]
    pub devices: Vec<DeviceRecord>,
    #[serde(default)]
    pub push_listen_addr: Option<String>,
}

impl ServiceConfig {
    pub fn from_toml(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| AdapterError::Configuration(e.to_string()))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml(&raw)
    }
}
