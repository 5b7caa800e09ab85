//! # GridLink Types - Shared Data Model
//!
//! ## Purpose
//!
//! Unified type system for the GridLink DER connectivity plane. Every message
//! crossing the in-process bus, every device connection descriptor, and the
//! authoritative topic namespace are defined here, so that protocol adapters,
//! managers, and the push gateway all speak one schema.
//!
//! ## Integration Points
//!
//! - **Producers**: protocol adapters (Modbus, OCPP, EEBus, TCP, gateway)
//!   construct [`BusMessage`] envelopes and publish them on bus topics built
//!   with [`topic`] helpers
//! - **Consumers**: the push gateway, optimization engines, and storage
//!   ingesters deserialize the same envelopes
//! - **Configuration**: [`ConnectionConfig`] is the per-device connection
//!   descriptor handed to adapter managers by the device registry
//!
//! ## Architecture Role
//!
//! ```text
//! Field Device → [Protocol Adapter] → BusMessage → Message Bus → Consumers
//!                       ↑                  ↑
//!              ConnectionConfig      topic::device_telemetry(..)
//! ```
//!
//! Envelope timestamps are assigned at construction time by the producing
//! adapter; nothing downstream rewrites them.

#![warn(clippy::all)]

pub mod config;
pub mod device;
pub mod message;
pub mod telemetry;
pub mod topic;

pub use config::{
    ChildDeviceSpec, ConnectionConfig, DataPointAccess, DataPointSpec, EebusConfig, GatewayConfig,
    ModbusConfig, OcppConfig, OcppVersion, RegisterDataType, RegisterKind, RegisterSpec,
    SerialConfig, SubProtocol, TcpipConfig, WordOrder,
};
pub use device::{DeviceRecord, DeviceType, ProtocolFamily, SiteId};
pub use message::{
    BusMessage, CommandMessage, CommandResponseMessage, DeviceStatus, EventMessage, StatusMessage,
    TelemetryMessage,
};
pub use telemetry::{canonical_channel, channel, default_unit};
