//! NDJSON envelope: request validation and response lines.
//!
//! Request:  `{"v":1, "id":<any non-null>, "type":"<op>", ...}`
//! Response: `{"v":1, "id":<echo>, "type":"response", "op":"<op>", "data":{...}}`
//! Error:    `{"v":1, "id":<echo|null>, "type":"error", "error":{"code","message"}}`

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

pub const PROTOCOL_VERSION: u64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    BadRequest,
    NotFound,
    Conflict,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::BadRequest => "BAD_REQUEST",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::Conflict => "CONFLICT",
            ErrorCode::Internal => "INTERNAL",
        }
    }
}

/// Error half of a reply, before the id is attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorReply {
    pub code: ErrorCode,
    pub message: String,
}

impl ErrorReply {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadRequest, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }
}

/// A request that passed envelope validation.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: Value,
    pub op: String,
    pub body: Map<String, Value>,
}

impl Request {
    /// Non-empty string field.
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.body
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    pub fn flag(&self, key: &str) -> bool {
        self.body.get(key).and_then(Value::as_bool).unwrap_or(false)
    }
}

/// Validate one line. On failure the returned id is whatever could be
/// recovered from the line (`null` when it did not parse).
pub fn parse_request(line: &[u8]) -> Result<Request, (Value, ErrorReply)> {
    let malformed = || (Value::Null, ErrorReply::bad_request("Malformed JSON"));

    let text = std::str::from_utf8(line).map_err(|_| malformed())?;
    let body = match serde_json::from_str::<Value>(text.trim_end()) {
        Ok(Value::Object(map)) => map,
        _ => return Err(malformed()),
    };

    let id = body.get("id").cloned().unwrap_or(Value::Null);
    let mut missing = Vec::new();
    if body.get("v").and_then(Value::as_f64) != Some(PROTOCOL_VERSION as f64) {
        missing.push("v");
    }
    if id.is_null() {
        missing.push("id");
    }
    if !body.contains_key("type") {
        missing.push("type");
    }
    if !missing.is_empty() {
        let message = format!("Missing required fields: {}", missing.join(", "));
        return Err((id, ErrorReply::bad_request(message)));
    }

    let op = body
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    Ok(Request { id, op, body })
}

pub fn response_line(id: &Value, op: &str, data: Value) -> String {
    json!({
        "v": PROTOCOL_VERSION,
        "id": id,
        "type": "response",
        "op": op,
        "data": data,
    })
    .to_string()
}

pub fn error_line(id: &Value, err: &ErrorReply) -> String {
    json!({
        "v": PROTOCOL_VERSION,
        "id": id,
        "type": "error",
        "error": { "code": err.code, "message": err.message },
    })
    .to_string()
}

/// Unsolicited push sent to the owner when the IBKR session is lost.
pub fn release_requested_line() -> String {
    response_line(&Value::Null, "release_ibkr", json!({ "status": "release_requested" }))
}
