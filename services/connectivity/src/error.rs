//! Error types for the connectivity layer

use thiserror::Error;

/// Result type alias for adapter operations
pub type Result<T> = std::result::Result<T, AdapterError>;

/// Main error type for adapter operations
#[derive(Debug, Error)]
pub enum AdapterError {
    /// Wire connection actively refused or failed to establish
    #[error("connection refused for device {device}: {reason}")]
    ConnectionRefused {
        /// The device whose connection failed
        device: String,
        /// Reason for the failure
        reason: String,
    },

    /// Operation exceeded the protocol timeout
    #[error("timeout for device {device} after {timeout_ms}ms")]
    Timeout {
        /// The device that timed out
        device: String,
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// Peer sent something the protocol does not allow
    #[error("protocol violation for device {device}: {details}")]
    ProtocolViolation {
        /// The misbehaving device
        device: String,
        /// What was violated
        details: String,
    },

    /// Register name not present in the device's register table
    #[error("unknown register: {name}")]
    UnknownRegister {
        /// The unknown register name
        name: String,
    },

    /// Write attempted on a register declared read-only
    #[error("register {name} is read-only")]
    ReadOnlyRegister {
        /// The register that rejected the write
        name: String,
    },

    /// Connector id outside the charge point's configured range
    #[error("invalid connector {connector_id}")]
    InvalidConnector {
        /// The offending connector id
        connector_id: u32,
    },

    /// Stop/update requested with no transaction running on the connector
    #[error("no active transaction on connector {connector_id}")]
    NoActiveTransaction {
        /// The idle connector
        connector_id: u32,
    },

    /// Start requested while a transaction is already running
    #[error("transaction already active on connector {connector_id}")]
    TransactionAlreadyActive {
        /// The busy connector
        connector_id: u32,
    },

    /// No live adapter for the device id
    #[error("no adapter for device {device}")]
    AdapterNotFound {
        /// The unmanaged device id
        device: String,
    },

    /// Bus rejected the publish
    #[error("bus is not connected")]
    BusNotConnected(#[from] bus::BusError),

    /// Operation aborted because the adapter is shutting down
    #[error("operation cancelled: adapter shutting down")]
    Cancelled,

    /// Command name the adapter does not implement
    #[error("unsupported command: {command}")]
    UnsupportedCommand {
        /// The rejected command
        command: String,
    },

    /// Configuration error in a device descriptor
    #[error("configuration error: {0}")]
    Configuration(String),

    /// I/O error during wire operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// WebSocket transport error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// JSON parse/serialize failure on a wire payload
    #[error("failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),

    /// Generic errors
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AdapterError {
    /// Stable error kind string carried in `command_response.error` and
    /// status details
    pub fn kind(&self) -> &'static str {
        match self {
            AdapterError::ConnectionRefused { .. } => "ConnectionRefused",
            AdapterError::Timeout { .. } => "Timeout",
            AdapterError::ProtocolViolation { .. } => "ProtocolViolation",
            AdapterError::UnknownRegister { .. } => "UnknownRegister",
            AdapterError::ReadOnlyRegister { .. } => "ReadOnlyRegister",
            AdapterError::InvalidConnector { .. } => "InvalidConnector",
            AdapterError::NoActiveTransaction { .. } => "NoActiveTransaction",
            AdapterError::TransactionAlreadyActive { .. } => "TransactionAlreadyActive",
            AdapterError::AdapterNotFound { .. } => "AdapterNotFound",
            AdapterError::BusNotConnected(_) => "BusNotConnected",
            AdapterError::Cancelled => "Cancelled",
            AdapterError::UnsupportedCommand { .. } => "UnsupportedCommand",
            AdapterError::Configuration(_) => "Configuration",
            AdapterError::Io(_) => "Io",
            AdapterError::WebSocket(_) => "WebSocket",
            AdapterError::JsonParse(_) => "JsonParse",
            AdapterError::Other(_) => "Internal",
        }
    }

    /// Transient wire errors recovered by the reconnect loop. Semantic
    /// errors are terminal for the operation but not for the session.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            AdapterError::ConnectionRefused { .. }
                | AdapterError::Timeout { .. }
                | AdapterError::Io(_)
                | AdapterError::WebSocket(_)
        )
    }

    /// Errors that mark the session Error and arm the reconnect timer
    pub fn triggers_reconnect(&self) -> bool {
        self.is_recoverable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable_strings() {
        let err = AdapterError::Timeout {
            device: "d1".to_string(),
            timeout_ms: 30000,
        };
        assert_eq!(err.kind(), "Timeout");
        assert!(err.is_recoverable());

        let err = AdapterError::ReadOnlyRegister {
            name: "serial".to_string(),
        };
        assert_eq!(err.kind(), "ReadOnlyRegister");
        assert!(!err.is_recoverable());
    }

    #[test]
    fn io_errors_trigger_reconnect() {
        let err: AdapterError =
            std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset").into();
        assert!(err.triggers_reconnect());
        assert!(!AdapterError::Cancelled.triggers_reconnect());
    }
}
