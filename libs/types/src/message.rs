//! Bus message envelopes
//!
//! One tagged union for everything published on the fabric. The envelope
//! header (`messageId`, `timestamp`, `deviceId`) is present on every variant;
//! constructors stamp id and timestamp at build time, which is publish time
//! for a well-behaved adapter. The bus never rewrites either.

use crate::device::{DeviceType, ProtocolFamily};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Connectivity state reported in status messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Online,
    Offline,
    Error,
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceStatus::Online => "online",
            DeviceStatus::Offline => "offline",
            DeviceStatus::Error => "error",
        };
        write!(f, "{}", s)
    }
}

/// Every message published on the bus
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "messageType", rename_all = "snake_case")]
pub enum BusMessage {
    Status(StatusMessage),
    Telemetry(TelemetryMessage),
    Command(CommandMessage),
    CommandResponse(CommandResponseMessage),
    Event(EventMessage),
}

/// Device connectivity announcement
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusMessage {
    pub message_id: String,
    pub timestamp: DateTime<Utc>,
    pub device_id: String,
    pub status: DeviceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_type: Option<DeviceType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<ProtocolFamily>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Per-child connectivity, present on composite gateway status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<BTreeMap<String, DeviceStatus>>,
}

/// Normalized telemetry snapshot. `readings` and `units` are parallel maps
/// keyed by canonical channel names plus device-type extensions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryMessage {
    pub message_id: String,
    pub timestamp: DateTime<Utc>,
    pub device_id: String,
    pub device_type: DeviceType,
    pub protocol: ProtocolFamily,
    pub readings: BTreeMap<String, f64>,
    pub units: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// Command addressed to one device's adapter
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandMessage {
    pub message_id: String,
    pub timestamp: DateTime<Utc>,
    pub device_id: String,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

/// Outcome of one executed command
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResponseMessage {
    pub message_id: String,
    pub timestamp: DateTime<Utc>,
    pub device_id: String,
    pub command: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Protocol-specific event (transaction lifecycle, VPP dispatch, ...)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMessage {
    pub message_id: String,
    pub timestamp: DateTime<Utc>,
    pub device_id: String,
    pub event: String,
    pub payload: Value,
}

impl BusMessage {
    /// Status constructor; id and timestamp are stamped here
    pub fn status(
        device_id: impl Into<String>,
        status: DeviceStatus,
        details: Option<String>,
    ) -> Self {
        BusMessage::Status(StatusMessage {
            message_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            device_id: device_id.into(),
            status,
            details,
            device_type: None,
            protocol: None,
            version: None,
            children: None,
        })
    }

    /// Telemetry constructor
    pub fn telemetry(
        device_id: impl Into<String>,
        device_type: DeviceType,
        protocol: ProtocolFamily,
        readings: BTreeMap<String, f64>,
        units: BTreeMap<String, String>,
    ) -> Self {
        BusMessage::Telemetry(TelemetryMessage {
            message_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            device_id: device_id.into(),
            device_type,
            protocol,
            readings,
            units,
            metadata: None,
        })
    }

    /// Command constructor
    pub fn command(
        device_id: impl Into<String>,
        command: impl Into<String>,
        parameters: Option<Value>,
    ) -> Self {
        BusMessage::Command(CommandMessage {
            message_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            device_id: device_id.into(),
            command: command.into(),
            parameters,
        })
    }

    /// Command-response constructor
    pub fn command_response(
        device_id: impl Into<String>,
        command: impl Into<String>,
        success: bool,
        result: Option<Value>,
        error: Option<String>,
    ) -> Self {
        BusMessage::CommandResponse(CommandResponseMessage {
            message_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            device_id: device_id.into(),
            command: command.into(),
            success,
            result,
            error,
        })
    }

    /// Event constructor
    pub fn event(
        device_id: impl Into<String>,
        event: impl Into<String>,
        payload: Value,
    ) -> Self {
        BusMessage::Event(EventMessage {
            message_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            device_id: device_id.into(),
            event: event.into(),
            payload,
        })
    }

    /// Unique envelope id
    pub fn message_id(&self) -> &str {
        match self {
            BusMessage::Status(m) => &m.message_id,
            BusMessage::Telemetry(m) => &m.message_id,
            BusMessage::Command(m) => &m.message_id,
            BusMessage::CommandResponse(m) => &m.message_id,
            BusMessage::Event(m) => &m.message_id,
        }
    }

    /// Producing device id
    pub fn device_id(&self) -> &str {
        match self {
            BusMessage::Status(m) => &m.device_id,
            BusMessage::Telemetry(m) => &m.device_id,
            BusMessage::Command(m) => &m.device_id,
            BusMessage::CommandResponse(m) => &m.device_id,
            BusMessage::Event(m) => &m.device_id,
        }
    }

    /// Envelope timestamp
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            BusMessage::Status(m) => m.timestamp,
            BusMessage::Telemetry(m) => m.timestamp,
            BusMessage::Command(m) => m.timestamp,
            BusMessage::CommandResponse(m) => m.timestamp,
            BusMessage::Event(m) => m.timestamp,
        }
    }

    /// Telemetry may be shed under backpressure; status, commands, command
    /// responses and events may not.
    pub fn is_droppable(&self) -> bool {
        matches!(self, BusMessage::Telemetry(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_tag_uses_snake_case_message_type() {
        let msg = BusMessage::status("dev-1", DeviceStatus::Online, None);
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["messageType"], "status");
        assert_eq!(json["deviceId"], "dev-1");
        assert!(json["messageId"].as_str().is_some());

        let resp = BusMessage::command_response("dev-1", "writeRegister", true, None, None);
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["messageType"], "command_response");
    }

    #[test]
    fn telemetry_carries_parallel_reading_and_unit_maps() {
        let mut readings = BTreeMap::new();
        readings.insert("power".to_string(), 1500.0);
        let mut units = BTreeMap::new();
        units.insert("power".to_string(), "W".to_string());

        let msg = BusMessage::telemetry(
            "inv-3",
            DeviceType::SolarPv,
            ProtocolFamily::Modbus,
            readings,
            units,
        );
        let json = serde_json::to_string(&msg).unwrap();
        let back: BusMessage = serde_json::from_str(&json).unwrap();
        let BusMessage::Telemetry(t) = back else {
            panic!("wrong variant");
        };
        assert_eq!(t.readings["power"], 1500.0);
        assert_eq!(t.units["power"], "W");
        assert!(BusMessage::Telemetry(t).is_droppable());
    }

    #[test]
    fn message_ids_are_unique() {
        let a = BusMessage::status("d", DeviceStatus::Online, None);
        let b = BusMessage::status("d", DeviceStatus::Online, None);
        assert_ne!(a.message_id(), b.message_id());
    }
}
