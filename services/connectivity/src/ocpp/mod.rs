//! OCPP 1.6 / 2.0.1 adapter family
//!
//! Event-driven: a WebSocket-class stream carries JSON array frames in both
//! directions. The adapter owns the BootNotification handshake, the
//! heartbeat and meter-value timers, the pending-call correlation table, the
//! per-connector state machine, and transaction bookkeeping.

pub mod adapter;
pub mod frame;
pub mod pending;
pub mod transaction;
pub mod transport;
pub mod types;

pub use adapter::OcppAdapter;
pub use frame::OcppFrame;
pub use pending::PendingCalls;
pub use transaction::{ChargePointState, Transaction, TransactionStatus};
pub use transport::{MockChargePoint, OcppTransport, WsTransport};
pub use types::ConnectorStatus;
