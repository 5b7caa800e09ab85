//! Real-time push gateway
//!
//! Bridges the message fabric to long-lived WebSocket clients at `/ws`:
//! per-connection subscription scopes, bus fan-out with scope filtering,
//! ping/pong liveness, and a stale-connection sweep.

pub mod connection;
pub mod frames;
pub mod server;

pub use connection::ClientConnection;
pub use frames::{ClientFrame, ServerFrame};
pub use server::{PushGateway, PushSettings};
