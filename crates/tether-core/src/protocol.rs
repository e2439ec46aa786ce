//! Frame envelope, control frames and the two synthetic JSON-RPC messages.
//!
//! The bridge never interprets RPC payloads. It only looks at the routing
//! envelope of each frame:
//!
//! - `id` (string or number) to pair requests with responses
//! - `method` to spot `initialize` / `notifications/initialized`
//! - `type` to separate control frames from payload
//!
//! Control frames (`handshake`, `heartbeat`, `heartbeat_response`) are
//! consumed by the peer that receives them and never reach the subprocess or
//! the local caller.

use crate::{Result, TetherError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

pub const JSONRPC_VERSION: &str = "2.0";
pub const METHOD_INITIALIZE: &str = "initialize";
pub const METHOD_INITIALIZED: &str = "notifications/initialized";
pub const METHOD_SERVER_RESTARTED: &str = "$/serverRestarted";
pub const RESTART_REASON_TERMINATED: &str = "process_terminated";

/// Seconds since the Unix epoch, with sub-second precision.
pub fn unix_timestamp() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Which control message a frame carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlType {
    Handshake,
    Heartbeat,
    HeartbeatResponse,
}

impl FromStr for ControlType {
    type Err = TetherError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "handshake" => Ok(ControlType::Handshake),
            "heartbeat" => Ok(ControlType::Heartbeat),
            "heartbeat_response" => Ok(ControlType::HeartbeatResponse),
            other => Err(TetherError::Json {
                message: format!("unknown control type `{}`", other),
                source: None,
            }),
        }
    }
}

fn default_true() -> bool {
    true
}

/// Session-management messages exchanged between client and bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlFrame {
    Handshake {
        #[serde(default)]
        client_version: String,
        #[serde(default = "default_true")]
        supports_heartbeat: bool,
    },
    Heartbeat {
        #[serde(default)]
        timestamp: f64,
    },
    HeartbeatResponse {
        #[serde(default)]
        timestamp: f64,
        #[serde(default = "default_true")]
        mcp_alive: bool,
    },
}

impl ControlFrame {
    pub fn handshake(client_version: impl Into<String>) -> Self {
        ControlFrame::Handshake {
            client_version: client_version.into(),
            supports_heartbeat: true,
        }
    }

    pub fn heartbeat() -> Self {
        ControlFrame::Heartbeat {
            timestamp: unix_timestamp(),
        }
    }

    pub fn heartbeat_response(mcp_alive: bool) -> Self {
        ControlFrame::HeartbeatResponse {
            timestamp: unix_timestamp(),
            mcp_alive,
        }
    }

    pub fn control_type(&self) -> ControlType {
        match self {
            ControlFrame::Handshake { .. } => ControlType::Handshake,
            ControlFrame::Heartbeat { .. } => ControlType::Heartbeat,
            ControlFrame::HeartbeatResponse { .. } => ControlType::HeartbeatResponse,
        }
    }

    pub fn to_value(&self) -> Value {
        // A tagged enum of plain fields always serializes
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// A JSON-RPC id, usable as a map key.
///
/// Numbers keep their textual form so `1` and `1.0` stay distinct, the same
/// way the peer will echo them.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RequestId {
    Number(String),
    String(String),
}

impl RequestId {
    /// Extract an id from a JSON value. `null` and non-scalar ids are ignored.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => Some(RequestId::Number(n.to_string())),
            Value::String(s) => Some(RequestId::String(s.clone())),
            _ => None,
        }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{}", n),
            RequestId::String(s) => write!(f, "\"{}\"", s),
        }
    }
}

/// One decoded frame plus the exact line it came from.
///
/// Forwarding always uses [`Frame::raw`], so payload bytes pass through the
/// bridge unchanged.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    raw: String,
    value: Value,
}

impl Frame {
    /// Decode a line received from a stream.
    pub fn parse(line: impl Into<String>) -> Result<Self> {
        let raw = line.into();
        let value = serde_json::from_str(&raw)?;
        Ok(Self { raw, value })
    }

    /// Build a frame that originates locally.
    pub fn from_value(value: Value) -> Self {
        Self {
            raw: value.to_string(),
            value,
        }
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn id(&self) -> Option<RequestId> {
        self.value.get("id").and_then(RequestId::from_value)
    }

    /// The raw `id` value, for echoing back verbatim.
    pub fn id_value(&self) -> Option<&Value> {
        self.value.get("id").filter(|id| !id.is_null())
    }

    pub fn method(&self) -> Option<&str> {
        self.value.get("method").and_then(Value::as_str)
    }

    pub fn control_type(&self) -> Option<ControlType> {
        self.value
            .get("type")
            .and_then(Value::as_str)
            .and_then(|tag| tag.parse().ok())
    }

    pub fn is_control(&self) -> bool {
        self.control_type().is_some()
    }

    /// Decode the control payload. Missing fields fall back to defaults, so
    /// any frame with a recognised `type` yields a control frame.
    pub fn as_control(&self) -> Option<ControlFrame> {
        self.control_type()?;
        serde_json::from_value(self.value.clone()).ok()
    }
}

impl From<ControlFrame> for Frame {
    fn from(control: ControlFrame) -> Self {
        Frame::from_value(control.to_value())
    }
}

/// JSON-RPC 2.0 notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// JSON-RPC 2.0 error response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcErrorResponse {
    pub jsonrpc: String,
    pub id: Value,
    pub error: RpcError,
}

/// Unsolicited notice sent to the TCP peer after the subprocess restarted.
pub fn restart_notification(reason: &str) -> Frame {
    let notification = RpcNotification {
        jsonrpc: JSONRPC_VERSION.to_string(),
        method: METHOD_SERVER_RESTARTED.to_string(),
        params: Some(serde_json::json!({
            "timestamp": unix_timestamp(),
            "reason": reason,
        })),
    };
    Frame::from_value(serde_json::to_value(notification).unwrap_or(Value::Null))
}

/// Retry hint returned to a local caller whose request was buffered.
pub fn initialization_pending(id: Value) -> Frame {
    let pending = TetherError::InitializationPending;
    let response = RpcErrorResponse {
        jsonrpc: JSONRPC_VERSION.to_string(),
        id,
        error: RpcError {
            code: pending.to_rpc_error_code(),
            message: pending.to_string(),
            data: Some(Value::String(
                "Waiting for initialization to complete".to_string(),
            )),
        },
    };
    Frame::from_value(serde_json::to_value(response).unwrap_or(Value::Null))
}
