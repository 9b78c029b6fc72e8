//! graphql-transport-ws frame types.
//!
//! Only the lifecycle the log subscription needs: `connection_init` →
//! `connection_ack` → `subscribe` → `next | error | complete`, plus
//! `ping`/`pong`. Legacy `data` frames are accepted as `next`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Frames the client sends.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    ConnectionInit {
        payload: Value,
    },
    Subscribe {
        id: String,
        payload: Value,
    },
    Complete {
        id: String,
    },
    Ping {
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    Pong {
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
}

/// Frames the server sends.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    ConnectionAck {
        #[serde(default)]
        payload: Option<Value>,
    },
    Next {
        id: String,
        payload: Value,
    },
    /// Legacy protocol name for `next`.
    Data {
        id: String,
        payload: Value,
    },
    Error {
        id: String,
        payload: Value,
    },
    Complete {
        id: String,
    },
    Ping {
        #[serde(default)]
        payload: Option<Value>,
    },
    Pong {
        #[serde(default)]
        payload: Option<Value>,
    },
    #[serde(other)]
    Unknown,
}

impl ClientFrame {
    /// Serialize for the wire.
    #[must_use]
    pub fn to_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

impl ServerFrame {
    /// Parse a text frame; `None` for unparseable input.
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn connection_init_wire_format() {
        let frame = ClientFrame::ConnectionInit {
            payload: json!({ "Authorization": "Bearer tok" }),
        };
        let text = frame.to_text();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "connection_init");
        assert_eq!(value["payload"]["Authorization"], "Bearer tok");
    }

    #[test]
    fn parses_ack_and_next() {
        let ack = ServerFrame::parse(r#"{"type":"connection_ack"}"#).unwrap();
        assert!(matches!(ack, ServerFrame::ConnectionAck { .. }));

        let next = ServerFrame::parse(
            r#"{"type":"next","id":"1","payload":{"data":{"environmentLogs":[]}}}"#,
        )
        .unwrap();
        assert!(matches!(next, ServerFrame::Next { .. }));
    }

    #[test]
    fn legacy_data_frame_is_accepted() {
        let frame =
            ServerFrame::parse(r#"{"type":"data","id":"1","payload":{"data":{}}}"#).unwrap();
        assert!(matches!(frame, ServerFrame::Data { .. }));
    }

    #[test]
    fn unknown_frame_types_do_not_fail() {
        let frame = ServerFrame::parse(r#"{"type":"ka"}"#).unwrap();
        assert!(matches!(frame, ServerFrame::Unknown));
    }
}
