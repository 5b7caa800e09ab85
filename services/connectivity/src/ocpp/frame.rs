//! OCPP wire frames
//!
//! JSON arrays: `[2, messageId, action, payload]` for calls,
//! `[3, messageId, payload]` for call results, `[4, messageId, errorCode,
//! errorDescription, details]` for call errors.

use crate::error::{AdapterError, Result};
use serde_json::{json, Value};

pub const MESSAGE_TYPE_CALL: u64 = 2;
pub const MESSAGE_TYPE_CALL_RESULT: u64 = 3;
pub const MESSAGE_TYPE_CALL_ERROR: u64 = 4;

/// One frame in either direction
#[derive(Debug, Clone, PartialEq)]
pub enum OcppFrame {
    Call {
        message_id: String,
        action: String,
        payload: Value,
    },
    CallResult {
        message_id: String,
        payload: Value,
    },
    CallError {
        message_id: String,
        code: String,
        description: String,
        details: Value,
    },
}

impl OcppFrame {
    pub fn call(message_id: impl Into<String>, action: impl Into<String>, payload: Value) -> Self {
        OcppFrame::Call {
            message_id: message_id.into(),
            action: action.into(),
            payload,
        }
    }

    pub fn call_result(message_id: impl Into<String>, payload: Value) -> Self {
        OcppFrame::CallResult {
            message_id: message_id.into(),
            payload,
        }
    }

    pub fn message_id(&self) -> &str {
        match self {
            OcppFrame::Call { message_id, .. }
            | OcppFrame::CallResult { message_id, .. }
            | OcppFrame::CallError { message_id, .. } => message_id,
        }
    }

    /// Serialize to the wire array
    pub fn to_json(&self) -> String {
        let value = match self {
            OcppFrame::Call {
                message_id,
                action,
                payload,
            } => json!([MESSAGE_TYPE_CALL, message_id, action, payload]),
            OcppFrame::CallResult {
                message_id,
                payload,
            } => json!([MESSAGE_TYPE_CALL_RESULT, message_id, payload]),
            OcppFrame::CallError {
                message_id,
                code,
                description,
                details,
            } => json!([
                MESSAGE_TYPE_CALL_ERROR,
                message_id,
                code,
                description,
                details
            ]),
        };
        value.to_string()
    }

    /// Parse a wire array received from the peer
    pub fn parse(device: &str, raw: &str) -> Result<OcppFrame> {
        let value: Value = serde_json::from_str(raw)?;
        let array = value.as_array().ok_or_else(|| AdapterError::ProtocolViolation {
            device: device.to_string(),
            details: "frame is not a JSON array".to_string(),
        })?;

        let message_type = array
            .first()
            .and_then(Value::as_u64)
            .ok_or_else(|| AdapterError::ProtocolViolation {
                device: device.to_string(),
                details: "missing message type".to_string(),
            })?;
        let message_id = array
            .get(1)
            .and_then(Value::as_str)
            .ok_or_else(|| AdapterError::ProtocolViolation {
                device: device.to_string(),
                details: "missing message id".to_string(),
            })?
            .to_string();

        match message_type {
            MESSAGE_TYPE_CALL => {
                let action = array
                    .get(2)
                    .and_then(Value::as_str)
                    .ok_or_else(|| AdapterError::ProtocolViolation {
                        device: device.to_string(),
                        details: "call without action".to_string(),
                    })?
                    .to_string();
                let payload = array.get(3).cloned().unwrap_or_else(|| json!({}));
                Ok(OcppFrame::Call {
                    message_id,
                    action,
                    payload,
                })
            }
            MESSAGE_TYPE_CALL_RESULT => {
                let payload = array.get(2).cloned().unwrap_or_else(|| json!({}));
                Ok(OcppFrame::CallResult {
                    message_id,
                    payload,
                })
            }
            MESSAGE_TYPE_CALL_ERROR => Ok(OcppFrame::CallError {
                message_id,
                code: array
                    .get(2)
                    .and_then(Value::as_str)
                    .unwrap_or("GenericError")
                    .to_string(),
                description: array
                    .get(3)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                details: array.get(4).cloned().unwrap_or_else(|| json!({})),
            }),
            other => Err(AdapterError::ProtocolViolation {
                device: device.to_string(),
                details: format!("unknown message type {}", other),
            }),
        }
    }
}
