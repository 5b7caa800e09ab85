//! Modbus TCP/RTU adapter family
//!
//! Register-oriented polling: a scan loop reads every configured register,
//! decodes it per data type and word order, and emits one normalized
//! telemetry message per scan. The scan doubles as the session heartbeat.

pub mod adapter;
pub mod registers;
pub mod transport;

pub use adapter::ModbusAdapter;
pub use registers::{decode_bits, decode_words, encode_value, RegisterValue};
pub use transport::{MockModbusTransport, ModbusTransport, SimulatedModbusTransport, TcpTransport};
