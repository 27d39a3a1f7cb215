//! Wire frames
//!
//! JSON text frames exchanged over the gateway socket:
//! `req` (client request), `res` (response) and `event` (server push).

use axum::extract::ws::{CloseFrame, Message};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use super::versions::StateVersion;

pub const PROTOCOL_VERSION: u32 = 3;
pub const MAX_PAYLOAD_BYTES: usize = 512 * 1024;
pub const MAX_BUFFERED_BYTES: usize = (1024 * 1024 * 3) / 2;
pub const TICK_INTERVAL_MS: u64 = 30_000;
pub const HANDSHAKE_TIMEOUT_MS: u64 = 10_000;
pub const MAX_JSON_DEPTH: usize = 32;

/// WebSocket close reasons are limited to 123 bytes of UTF-8.
pub const MAX_CLOSE_REASON_BYTES: usize = 123;

pub const ERROR_INVALID_REQUEST: &str = "INVALID_REQUEST";
pub const ERROR_METHOD_NOT_FOUND: &str = "METHOD_NOT_FOUND";
pub const ERROR_RATE_LIMITED: &str = "RATE_LIMITED";
pub const ERROR_UNAVAILABLE: &str = "UNAVAILABLE";
pub const ERROR_INTERNAL: &str = "INTERNAL";
pub const ERROR_NOT_AUTHORIZED: &str = "NOT_AUTHORIZED";

pub const EVENT_CONNECT_CHALLENGE: &str = "connect.challenge";
pub const EVENT_PRESENCE: &str = "presence";
pub const EVENT_HEALTH: &str = "health";
pub const EVENT_TICK: &str = "tick";
pub const EVENT_SHUTDOWN: &str = "shutdown";
pub const EVENT_NODE: &str = "node.event";

/// Events the gateway itself emits, advertised in `hello-ok`.
pub const GATEWAY_EVENTS: [&str; 6] = [
    EVENT_CONNECT_CHALLENGE,
    EVENT_PRESENCE,
    EVENT_HEALTH,
    EVENT_TICK,
    EVENT_SHUTDOWN,
    EVENT_NODE,
];

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct ErrorShape {
    pub code: &'static str,
    pub message: String,
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

pub fn error_shape(code: &'static str, message: &str, details: Option<Value>) -> ErrorShape {
    ErrorShape {
        code,
        message: message.to_string(),
        retryable: code == ERROR_UNAVAILABLE,
        details,
    }
}

#[derive(Debug, Serialize)]
pub struct ResponseFrame<'a> {
    #[serde(rename = "type")]
    pub frame_type: &'a str,
    pub id: &'a str,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorShape>,
}

#[derive(Debug, Serialize)]
pub struct EventFrame<'a> {
    #[serde(rename = "type")]
    pub frame_type: &'a str,
    pub event: &'a str,
    pub payload: Value,
    /// Gateway-wide broadcast order. Filtered and per-connection events
    /// leave gaps; only `stateVersion` detects missed updates.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "stateVersion")]
    pub state_version: Option<StateVersion>,
}

impl<'a> EventFrame<'a> {
    pub fn new(event: &'a str, payload: Value) -> Self {
        Self {
            frame_type: "event",
            event,
            payload,
            seq: None,
            state_version: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRequest {
    pub id: String,
    pub method: String,
    pub params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FrameError {
    pub id: Option<String>,
    pub error: ErrorShape,
}

fn invalid_frame(id: Option<String>) -> FrameError {
    FrameError {
        id,
        error: error_shape(ERROR_INVALID_REQUEST, "invalid request frame", None),
    }
}

pub fn parse_request_frame(value: &Value) -> Result<ParsedRequest, FrameError> {
    let obj = value.as_object().ok_or_else(|| invalid_frame(None))?;
    let frame_type = obj
        .get("type")
        .and_then(|v| v.as_str())
        .ok_or_else(|| invalid_frame(None))?;
    if frame_type != "req" && frame_type != "request" {
        return Err(invalid_frame(None));
    }
    let id = obj
        .get("id")
        .and_then(|v| v.as_str())
        .filter(|id| !id.trim().is_empty())
        .map(|s| s.to_string())
        .ok_or_else(|| invalid_frame(None))?;
    let Some(method) = obj
        .get("method")
        .and_then(|v| v.as_str())
        .filter(|m| !m.trim().is_empty())
        .map(|s| s.to_string())
    else {
        return Err(invalid_frame(Some(id)));
    };
    let params = obj.get("params").cloned().filter(|p| !p.is_null());
    Ok(ParsedRequest { id, method, params })
}

/// Validates that a JSON value doesn't exceed the maximum nesting depth.
pub fn validate_json_depth(value: &Value, max_depth: usize) -> Result<(), String> {
    check_json_depth(value, 1, max_depth)
}

fn check_json_depth(value: &Value, current_depth: usize, max_depth: usize) -> Result<(), String> {
    if current_depth > max_depth {
        return Err(format!(
            "JSON nesting depth exceeds maximum allowed depth of {max_depth}"
        ));
    }
    match value {
        Value::Array(arr) => {
            for item in arr {
                check_json_depth(item, current_depth + 1, max_depth)?;
            }
        }
        Value::Object(map) => {
            for val in map.values() {
                check_json_depth(val, current_depth + 1, max_depth)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Why an inbound text frame could not be turned into a request.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameRejection {
    /// Unrecoverable; close the connection with this reason.
    Close(String),
    /// Structurally a request with a usable id; answer it with an error.
    Reply { id: String, error: ErrorShape },
}

/// Decode one inbound text frame: size limit, JSON, nesting depth, then
/// request shape.
pub fn decode_text_frame(
    text: &str,
    max_payload: usize,
    max_json_depth: usize,
) -> Result<ParsedRequest, FrameRejection> {
    if text.len() > max_payload {
        return Err(FrameRejection::Close("payload too large".to_string()));
    }
    let parsed: Value = serde_json::from_str(text)
        .map_err(|_| FrameRejection::Close("invalid request frame".to_string()))?;
    validate_json_depth(&parsed, max_json_depth).map_err(FrameRejection::Close)?;
    parse_request_frame(&parsed).map_err(|err| match err.id {
        Some(id) => FrameRejection::Reply {
            id,
            error: err.error,
        },
        None => FrameRejection::Close(err.error.message),
    })
}

/// Classification of a decoded request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// `connect`: the authentication reply.
    Connect,
    /// `events.subscribe`
    Subscribe,
    /// `events.unsubscribe`
    Unsubscribe,
    /// `node.*` control frames
    NodeControl,
    /// Anything else; routed to the method table.
    Rpc,
}

pub const METHOD_CONNECT: &str = "connect";
pub const METHOD_SUBSCRIBE: &str = "events.subscribe";
pub const METHOD_UNSUBSCRIBE: &str = "events.unsubscribe";
pub const METHOD_NODE_EVENT: &str = "node.event";
pub const METHOD_NODE_HEARTBEAT: &str = "node.heartbeat";

pub fn classify(method: &str) -> FrameKind {
    match method {
        METHOD_CONNECT => FrameKind::Connect,
        METHOD_SUBSCRIBE => FrameKind::Subscribe,
        METHOD_UNSUBSCRIBE => FrameKind::Unsubscribe,
        METHOD_NODE_EVENT | METHOD_NODE_HEARTBEAT => FrameKind::NodeControl,
        _ => FrameKind::Rpc,
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    pub min_protocol: u32,
    pub max_protocol: u32,
    pub client: ClientInfo,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub subscriptions: Option<Vec<String>>,
    #[serde(default)]
    pub auth: Option<AuthParams>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub id: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub mode: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub instance_id: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct AuthParams {
    pub challenge_id: String,
    pub response: String,
}

#[derive(Debug, Deserialize)]
pub struct SubscriptionParams {
    pub events: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct NodeEventParams {
    pub event: String,
    #[serde(default)]
    pub payload: Option<Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloOkPayload {
    #[serde(rename = "type")]
    pub payload_type: &'static str,
    pub protocol: u32,
    pub server: ServerInfo,
    pub features: Features,
    pub snapshot: Snapshot,
    pub policy: PolicyInfo,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    pub version: String,
    pub host: String,
    pub conn_id: String,
}

#[derive(Debug, Serialize)]
pub struct Features {
    pub methods: Vec<String>,
    pub events: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub presence: Vec<Value>,
    pub health: Value,
    pub state_version: StateVersion,
    pub uptime_ms: u64,
}

#[derive(Debug, Serialize)]
pub struct PolicyInfo {
    #[serde(rename = "maxPayload")]
    pub max_payload: usize,
    #[serde(rename = "maxBufferedBytes")]
    pub max_buffered_bytes: usize,
    #[serde(rename = "tickIntervalMs")]
    pub tick_interval_ms: u64,
}

pub enum InboundText {
    Text(String),
    Control,
    Close(Option<CloseFrame>),
}

pub fn message_to_text(msg: Message) -> Result<InboundText, &'static str> {
    match msg {
        Message::Text(text) => Ok(InboundText::Text(text.to_string())),
        Message::Binary(_) => Err("binary messages not supported"),
        Message::Close(frame) => Ok(InboundText::Close(frame)),
        Message::Ping(_) | Message::Pong(_) => Ok(InboundText::Control),
    }
}

/// Truncate a close reason to the WebSocket limit on a char boundary.
pub fn truncate_close_reason(reason: &str) -> String {
    if reason.len() <= MAX_CLOSE_REASON_BYTES {
        return reason.to_string();
    }
    let mut end = MAX_CLOSE_REASON_BYTES;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    reason[..end].to_string()
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_millis() as u64
}

pub fn server_version() -> String {
    std::env::var("CLAWGATE_VERSION").unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string())
}

pub fn server_hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string())
}
