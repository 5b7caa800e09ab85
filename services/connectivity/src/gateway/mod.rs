//! Composite gateway adapter
//!
//! A physical gateway fronts N child devices over sub-protocols. The gateway
//! session supervises one child adapter per configured child; child failure
//! domains are independent, and the gateway heartbeat reconciles them.

pub mod adapter;
pub mod mapping;
pub mod transport;

pub use adapter::GatewayAdapter;
pub use mapping::child_record;
pub use transport::{GatewayTransport, MockGatewayTransport, TcpProbeTransport};
