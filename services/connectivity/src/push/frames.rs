//! Push client wire frames
//!
//! Small JSON control frames from the client, envelope frames
//! `{type, data, timestamp}` from the server.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use types::SiteId;

/// Client-originated control frames
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientFrame {
    #[serde(rename_all = "camelCase")]
    Subscribe {
        #[serde(default)]
        site_id: Option<SiteId>,
        #[serde(default)]
        device_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Unsubscribe {
        #[serde(default)]
        site_id: Option<SiteId>,
        #[serde(default)]
        device_id: Option<String>,
    },
    Ping,
}

/// Server-originated envelopes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerFrame {
    #[serde(rename_all = "camelCase")]
    Connected {
        connection_id: String,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    Subscribed {
        #[serde(skip_serializing_if = "Option::is_none")]
        site_id: Option<SiteId>,
        #[serde(skip_serializing_if = "Option::is_none")]
        device_id: Option<String>,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    Unsubscribed {
        #[serde(skip_serializing_if = "Option::is_none")]
        site_id: Option<SiteId>,
        #[serde(skip_serializing_if = "Option::is_none")]
        device_id: Option<String>,
        timestamp: DateTime<Utc>,
    },
    EnergyReading {
        data: Value,
        timestamp: DateTime<Utc>,
    },
    DeviceReading {
        data: Value,
        timestamp: DateTime<Utc>,
    },
    OptimizationRecommendation {
        data: Value,
        timestamp: DateTime<Utc>,
    },
    DeviceCommand {
        data: Value,
        timestamp: DateTime<Utc>,
    },
    Error {
        data: Value,
        timestamp: DateTime<Utc>,
    },
    Pong {
        timestamp: DateTime<Utc>,
    },
}

impl ServerFrame {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("server frame serializes")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_frames_parse() {
        let frame: ClientFrame =
            serde_json::from_str(r#"{"type":"subscribe","siteId":7}"#).unwrap();
        assert_eq!(
            frame,
            ClientFrame::Subscribe {
                site_id: Some(7),
                device_id: None
            }
        );
        let frame: ClientFrame = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(frame, ClientFrame::Ping);
        let frame: ClientFrame =
            serde_json::from_str(r#"{"type":"unsubscribe","deviceId":"inv-1"}"#).unwrap();
        assert_eq!(
            frame,
            ClientFrame::Unsubscribe {
                site_id: None,
                device_id: Some("inv-1".to_string())
            }
        );
    }

    #[test]
    fn server_frames_tag_with_camel_case_type() {
        let frame = ServerFrame::Connected {
            connection_id: "c1".to_string(),
            timestamp: Utc::now(),
        };
        let json: Value = serde_json::from_str(&frame.to_json()).unwrap();
        assert_eq!(json["type"], "connected");
        assert_eq!(json["connectionId"], "c1");

        let frame = ServerFrame::DeviceReading {
            data: serde_json::json!({"deviceId": "inv-1"}),
            timestamp: Utc::now(),
        };
        let json: Value = serde_json::from_str(&frame.to_json()).unwrap();
        assert_eq!(json["type"], "deviceReading");

        let frame = ServerFrame::OptimizationRecommendation {
            data: Value::Null,
            timestamp: Utc::now(),
        };
        let json: Value = serde_json::from_str(&frame.to_json()).unwrap();
        assert_eq!(json["type"], "optimizationRecommendation");
    }
}
