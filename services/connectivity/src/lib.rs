//! # GridLink Connectivity - Device Adapter Layer
//!
//! ## Purpose
//!
//! The device connectivity plane of the GridLink energy management system:
//! long-lived per-device adapter sessions for heterogeneous field devices
//! (solar inverters, batteries, EV chargers, smart meters, heat pumps),
//! normalized onto one in-process message fabric, with a WebSocket push
//! gateway fanning matching traffic out to end-user clients.
//!
//! ## Integration Points
//!
//! - **Input sources**: Modbus TCP/RTU devices, OCPP 1.6/2.0.1 charge
//!   points, EEBus peers, generic TCP devices, composite gateways fronting
//!   child fleets
//! - **Output**: normalized status/telemetry/event/command-response
//!   envelopes on the `bus` fabric under the `devices/`, `gateways/` and
//!   `sites/` topic families
//! - **Commands**: `devices/<id>/commands` publications are dispatched to
//!   the owning adapter and answered on `devices/<id>/commands/response`
//! - **Lookups**: the [`registry::DeviceRegistry`] facade is the read-only
//!   window onto external device storage
//!
//! ## Architecture Role
//!
//! ```text
//! Field Device ⇄ [Protocol Adapter] ⇄ Message Bus ⇄ {Push Gateway, Consumers}
//!                       ↑
//!              [Adapter Manager] one per protocol family
//! ```
//!
//! Every adapter session is an independent unit of concurrency with its own
//! timers and its own wire connection: a stuck remote on device A never
//! delays device B, and never delays the bus. Mock transports substitute for
//! wire I/O at construction time (per-device flag or `NODE_ENV=development`),
//! preserving the full state machine and event stream.

#![warn(clippy::all)]

pub mod adapter;
pub mod config;
pub mod eebus;
pub mod error;
pub mod factory;
pub mod gateway;
pub mod manager;
pub mod modbus;
pub mod ocpp;
pub mod push;
pub mod registry;
pub mod service;
pub mod session;
pub mod sim;
pub mod tcpip;

pub use adapter::{run_command, DeviceAdapter};
pub use error::{AdapterError, Result};
pub use factory::build_adapter;
pub use manager::{AdapterFactory, AdapterManager};
pub use push::{PushGateway, PushSettings};
pub use registry::{DeviceRegistry, InMemoryRegistry};
pub use service::ConnectivityService;
pub use session::{AdapterSettings, DeviceSession, ReconnectPolicy, SessionHealth, SessionState};
pub use sim::SimProfile;
