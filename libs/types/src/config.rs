//! Per-device connection descriptors
//!
//! One tagged union, one variant per protocol family. Descriptors are what
//! the registry hands to an adapter manager; everything an adapter needs to
//! open its wire session is in here. Every variant carries a `mock` flag that
//! substitutes a simulated transport at construction time.

use crate::device::ProtocolFamily;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Protocol-specific connection configuration for one device
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "snake_case")]
pub enum ConnectionConfig {
    Modbus(ModbusConfig),
    Ocpp(OcppConfig),
    Eebus(EebusConfig),
    Tcpip(TcpipConfig),
    Gateway(GatewayConfig),
}

impl ConnectionConfig {
    /// Protocol family of this descriptor
    pub fn family(&self) -> ProtocolFamily {
        match self {
            ConnectionConfig::Modbus(_) => ProtocolFamily::Modbus,
            ConnectionConfig::Ocpp(_) => ProtocolFamily::Ocpp,
            ConnectionConfig::Eebus(_) => ProtocolFamily::Eebus,
            ConnectionConfig::Tcpip(_) => ProtocolFamily::Tcpip,
            ConnectionConfig::Gateway(_) => ProtocolFamily::Gateway,
        }
    }

    /// Whether this device is configured for a simulated transport
    pub fn is_mock(&self) -> bool {
        match self {
            ConnectionConfig::Modbus(c) => c.mock,
            ConnectionConfig::Ocpp(c) => c.mock,
            ConnectionConfig::Eebus(c) => c.mock,
            ConnectionConfig::Tcpip(c) => c.mock,
            ConnectionConfig::Gateway(c) => c.mock,
        }
    }
}

// ============================================================================
// MODBUS
// ============================================================================

/// Modbus TCP/RTU connection descriptor
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModbusConfig {
    pub host: String,
    #[serde(default = "default_modbus_port")]
    pub port: u16,
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,
    /// Serial line parameters; present when the device is reached over
    /// RTU/ASCII instead of plain TCP
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial: Option<SerialConfig>,
    /// Registers polled each scan
    pub registers: Vec<RegisterSpec>,
    /// Poll period in milliseconds
    #[serde(default = "default_scan_interval_ms")]
    pub scan_interval_ms: u64,
    #[serde(default)]
    pub mock: bool,
}

fn default_modbus_port() -> u16 {
    502
}

fn default_unit_id() -> u8 {
    1
}

fn default_scan_interval_ms() -> u64 {
    5000
}

/// Serial line parameters for Modbus RTU/ASCII
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerialConfig {
    pub baud_rate: u32,
    #[serde(default = "default_parity")]
    pub parity: String,
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
}

fn default_parity() -> String {
    "none".to_string()
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

/// Modbus register table kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterKind {
    Holding,
    Input,
    Coil,
    Discrete,
}

impl RegisterKind {
    /// Coils and discrete inputs are bit tables; holding and input are words
    pub fn is_bit(&self) -> bool {
        matches!(self, RegisterKind::Coil | RegisterKind::Discrete)
    }
}

/// Value encoding of a register block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterDataType {
    Int16,
    Uint16,
    Int32,
    Uint32,
    Float32,
    Bool,
    Buffer,
}

impl RegisterDataType {
    /// Number of 16-bit registers the type spans
    pub fn word_count(&self) -> u16 {
        match self {
            RegisterDataType::Int16 | RegisterDataType::Uint16 | RegisterDataType::Bool => 1,
            RegisterDataType::Int32 | RegisterDataType::Uint32 | RegisterDataType::Float32 => 2,
            RegisterDataType::Buffer => 1,
        }
    }
}

/// Word order within a multi-register value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WordOrder {
    Be,
    Le,
}

impl Default for WordOrder {
    fn default() -> Self {
        WordOrder::Be
    }
}

/// One polled register: where it lives, how to decode it, how to name it
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterSpec {
    pub name: String,
    pub kind: RegisterKind,
    pub address: u16,
    /// Register count; defaults to the data type's natural width
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<u16>,
    pub data_type: RegisterDataType,
    #[serde(default = "default_scale")]
    pub scale: f64,
    #[serde(default)]
    pub byte_order: WordOrder,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    /// Bit position for boolean values packed into a word register
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bit_offset: Option<u8>,
    #[serde(default = "default_access")]
    pub access: DataPointAccess,
    /// Declared canonical channel this register feeds, overriding the
    /// built-in name table
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canonical: Option<String>,
}

fn default_scale() -> f64 {
    1.0
}

fn default_access() -> DataPointAccess {
    DataPointAccess::Read
}

impl RegisterSpec {
    /// Effective register count read per scan
    pub fn word_count(&self) -> u16 {
        self.length.unwrap_or_else(|| self.data_type.word_count())
    }

    pub fn is_writable(&self) -> bool {
        matches!(
            self.access,
            DataPointAccess::Write | DataPointAccess::ReadWrite
        )
    }
}

// ============================================================================
// OCPP
// ============================================================================

/// OCPP protocol revision, selected as the WebSocket subprotocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OcppVersion {
    #[serde(rename = "1.6")]
    V16,
    #[serde(rename = "2.0.1")]
    V201,
}

impl OcppVersion {
    pub fn subprotocol(&self) -> &'static str {
        match self {
            OcppVersion::V16 => "ocpp1.6",
            OcppVersion::V201 => "ocpp2.0.1",
        }
    }
}

impl fmt::Display for OcppVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.subprotocol())
    }
}

/// OCPP charge point connection descriptor
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OcppConfig {
    /// Central-system WebSocket endpoint, e.g. `ws://csms.example/ocpp/CP42`
    pub endpoint: String,
    #[serde(default = "default_ocpp_version")]
    pub version: OcppVersion,
    pub vendor: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware_version: Option<String>,
    #[serde(default = "default_connector_count")]
    pub connector_count: u32,
    #[serde(default = "default_ocpp_heartbeat_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_meter_interval_secs")]
    pub meter_values_interval_secs: u64,
    #[serde(default)]
    pub mock: bool,
}

fn default_ocpp_version() -> OcppVersion {
    OcppVersion::V16
}

fn default_connector_count() -> u32 {
    1
}

fn default_ocpp_heartbeat_secs() -> u64 {
    300
}

fn default_meter_interval_secs() -> u64 {
    60
}

// ============================================================================
// EEBUS / GENERIC TCP
// ============================================================================

/// EEBus peer connection descriptor
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EebusConfig {
    pub host: String,
    pub port: u16,
    /// Subject Key Identifier of the trusted peer
    pub ski: String,
    /// Datapoints subscribed after the handshake
    pub datapoints: Vec<DataPointSpec>,
    #[serde(default)]
    pub mock: bool,
}

/// Generic TCP/IP device descriptor, newline-delimited JSON readings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TcpipConfig {
    pub host: String,
    pub port: u16,
    /// Poll period in milliseconds; 0 means the device pushes unsolicited
    #[serde(default = "default_scan_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub mock: bool,
}

// ============================================================================
// GATEWAY
// ============================================================================

/// Sub-protocol a gateway child is reached over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubProtocol {
    ModbusGateway,
    TcpipGateway,
    MbusGateway,
    MqttGateway,
}

/// Read/write capability of a datapoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DataPointAccess {
    Read,
    Write,
    ReadWrite,
}

/// Protocol-neutral datapoint mapping used by gateway children and EEBus
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataPointSpec {
    pub name: String,
    pub address: u16,
    pub data_type: RegisterDataType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default = "default_scale")]
    pub scale: f64,
    #[serde(default = "default_access")]
    pub access: DataPointAccess,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canonical: Option<String>,
}

/// One device behind a gateway. For Modbus children `address` is the unit
/// id; for TCP children it is a port offset from the gateway's base port.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChildDeviceSpec {
    pub device_id: String,
    pub device_type: crate::device::DeviceType,
    pub sub_protocol: SubProtocol,
    pub address: u16,
    pub datapoints: Vec<DataPointSpec>,
    #[serde(default = "default_scan_interval_ms")]
    pub scan_interval_ms: u64,
}

/// Composite gateway descriptor: an upstream session plus child devices
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    pub children: Vec<ChildDeviceSpec>,
    #[serde(default = "default_gateway_heartbeat_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default)]
    pub mock: bool,
}

fn default_gateway_heartbeat_secs() -> u64 {
    60
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modbus_config_defaults() {
        let json = r#"{
            "protocol": "modbus",
            "host": "10.0.0.12",
            "registers": [
                {"name": "power", "kind": "holding", "address": 0, "dataType": "uint16"}
            ]
        }"#;
        let cfg: ConnectionConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.family(), ProtocolFamily::Modbus);
        let ConnectionConfig::Modbus(m) = cfg else {
            panic!("wrong variant");
        };
        assert_eq!(m.port, 502);
        assert_eq!(m.unit_id, 1);
        assert_eq!(m.scan_interval_ms, 5000);
        assert_eq!(m.registers[0].scale, 1.0);
        assert_eq!(m.registers[0].byte_order, WordOrder::Be);
        assert_eq!(m.registers[0].word_count(), 1);
        assert!(!m.registers[0].is_writable());
    }

    #[test]
    fn ocpp_version_subprotocols() {
        assert_eq!(OcppVersion::V16.subprotocol(), "ocpp1.6");
        assert_eq!(OcppVersion::V201.subprotocol(), "ocpp2.0.1");
        let v: OcppVersion = serde_json::from_str("\"2.0.1\"").unwrap();
        assert_eq!(v, OcppVersion::V201);
    }

    #[test]
    fn thirty_two_bit_types_span_two_registers() {
        assert_eq!(RegisterDataType::Uint32.word_count(), 2);
        assert_eq!(RegisterDataType::Float32.word_count(), 2);
        assert_eq!(RegisterDataType::Int16.word_count(), 1);
    }

    #[test]
    fn gateway_child_round_trips() {
        let spec = ChildDeviceSpec {
            device_id: "meter-7".to_string(),
            device_type: crate::device::DeviceType::SmartMeter,
            sub_protocol: SubProtocol::ModbusGateway,
            address: 3,
            datapoints: vec![DataPointSpec {
                name: "energy".to_string(),
                address: 100,
                data_type: RegisterDataType::Uint32,
                unit: Some("kWh".to_string()),
                scale: 0.1,
                access: DataPointAccess::Read,
                canonical: None,
            }],
            scan_interval_ms: 1000,
        };
        let json = serde_json::to_string(&spec).unwrap();
        let back: ChildDeviceSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(back.address, 3);
        assert_eq!(back.datapoints[0].scale, 0.1);
    }
}
