use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// ISO-8601 UTC with seconds precision, the only timestamp format on the wire.
pub fn format_iso(tp: &DateTime<Utc>) -> String {
    tp.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

pub fn now_iso() -> String {
    format_iso(&Utc::now())
}

/// Authenticated identity, stable for the lifetime of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthUser {
    pub user_id: i64,
    pub username: String,
}

#[derive(Debug, Clone)]
pub struct AuthSession {
    pub token: String,
    pub user: AuthUser,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionParticipant {
    pub user_id: i64,
    pub username: String,
}

/// One `session.input` command as received over the duplex channel.
#[derive(Debug, Clone)]
pub struct SessionInput {
    pub session_id: String,
    pub user_id: i64,
    pub sequence: u64,
    pub target_tick: i64,
    pub delta: i64,
}

/// Domain rejection carried back to the originator as `{code, message}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorReply {
    pub code: String,
    pub message: String,
}

impl ErrorReply {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CredentialsRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct QueueJoinRequest {
    pub mode: String,
    #[serde(rename = "timeoutSeconds")]
    pub timeout_seconds: Option<u64>,
}

pub fn success_envelope(data: Value) -> Value {
    json!({
        "success": true,
        "data": data,
        "error": null,
        "meta": {"timestamp": now_iso()},
    })
}

pub fn error_envelope(code: &str, message: &str) -> Value {
    json!({
        "success": false,
        "data": null,
        "error": {"code": code, "message": message, "detail": null},
        "meta": {"timestamp": now_iso()},
    })
}

/// One duplex frame. Server-originated frames carry `seq = 0`.
pub fn ws_event_frame(event: &str, seq: u64, payload: Value) -> String {
    json!({"t": "event", "seq": seq, "event": event, "p": payload}).to_string()
}

pub fn ws_error_frame(code: &str, message: &str, seq: u64) -> String {
    json!({
        "t": "error",
        "seq": seq,
        "event": null,
        "p": {"code": code, "message": message},
    })
    .to_string()
}
