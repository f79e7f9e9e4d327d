//! JSON-RPC 2.0 envelope: message ids, the three message categories and their validation
//!
//! Category detection is purely structural (which of `method`/`id`/`result`/`error` are
//! present); the method-specific lookup lives in [`crate::mcp::methods`].

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::errors::McpError;

pub const JSONRPC_VERSION: &str = "2.0";
pub const MAX_METHOD_NAME_LENGTH: usize = 64;

// `Absent` renders as JSON `null`
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub enum MessageId {
    #[default]
    Absent,
    String(String),
    Integer(i64),
}

impl MessageId {
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Null => Some(Self::Absent),
            Value::String(id) => Some(Self::String(id.clone())),
            Value::Number(number) => number.as_i64().map(Self::Integer),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Self::Absent => Value::Null,
            Self::String(id) => Value::String(id.clone()),
            Self::Integer(id) => Value::Number((*id).into()),
        }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }

    pub fn task_key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Absent => f.write_str("null"),
            Self::String(id) => f.write_str(id),
            Self::Integer(id) => write!(f, "{id}"),
        }
    }
}

impl From<&str> for MessageId {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<i64> for MessageId {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageCategory {
    Request,
    Response,
    Notification,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: MessageId,
    pub method: String,
    pub params: Map<String, Value>,
    pub progress_token: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Request {
    pub fn new(
        id: impl Into<MessageId>,
        method: impl Into<String>,
        params: Map<String, Value>,
    ) -> Self {
        Self {
            id: id.into(),
            method: method.into(),
            progress_token: progress_token_of(&params),
            params,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Result(Value),
    Error(RpcError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: MessageId,
    pub outcome: Outcome,
    pub created_at: DateTime<Utc>,
}

impl Response {
    pub fn result(id: MessageId, result: Value) -> Self {
        Self {
            id,
            outcome: Outcome::Result(result),
            created_at: Utc::now(),
        }
    }

    pub fn error(id: MessageId, error: RpcError) -> Self {
        Self {
            id,
            outcome: Outcome::Error(error),
            created_at: Utc::now(),
        }
    }

    pub fn from_error(id: MessageId, error: &McpError) -> Self {
        Self::error(id, error.to_rpc_error())
    }

    pub fn is_error(&self) -> bool {
        matches!(self.outcome, Outcome::Error(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: String,
    pub params: Map<String, Value>,
    pub progress_token: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(method: impl Into<String>, params: Map<String, Value>) -> Self {
        Self {
            method: method.into(),
            progress_token: progress_token_of(&params),
            params,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Response(Response),
    Notification(Notification),
}

// `reply` is false for malformed notifications: JSON-RPC never answers those.
#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    pub id: MessageId,
    pub error: McpError,
    pub reply: bool,
}

impl Rejection {
    fn reply(id: MessageId, error: McpError) -> Self {
        Self {
            id,
            error,
            reply: true,
        }
    }

    fn silent(error: McpError) -> Self {
        Self {
            id: MessageId::Absent,
            error,
            reply: false,
        }
    }

    pub fn into_response(self) -> Response {
        Response::from_error(self.id, &self.error)
    }
}

impl Message {
    pub fn category(&self) -> MessageCategory {
        match self {
            Self::Request(_) => MessageCategory::Request,
            Self::Response(_) => MessageCategory::Response,
            Self::Notification(_) => MessageCategory::Notification,
        }
    }

    pub fn progress_token(&self) -> Option<&str> {
        match self {
            Self::Request(request) => request.progress_token.as_deref(),
            Self::Notification(notification) => notification.progress_token.as_deref(),
            Self::Response(_) => None,
        }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        match self {
            Self::Request(request) => request.created_at,
            Self::Response(response) => response.created_at,
            Self::Notification(notification) => notification.created_at,
        }
    }

    pub fn parse(payload: &[u8]) -> Result<Self, Rejection> {
        let value: Value = serde_json::from_slice(payload)
            .map_err(|err| Rejection::reply(MessageId::Absent, McpError::Parse(err.to_string())))?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, Rejection> {
        let mut object = match value {
            Value::Object(object) => object,
            other => {
                let detail = if other.is_array() {
                    "batch requests are not supported"
                } else {
                    "message must be a JSON object"
                };
                return Err(Rejection::reply(
                    MessageId::Absent,
                    McpError::InvalidRequest(detail.to_string()),
                ));
            }
        };

        let recovered_id = object
            .get("id")
            .and_then(MessageId::from_value)
            .unwrap_or_default();
        let envelope = Value::Object(object.clone());

        if !validate_json_rpc(&envelope) {
            return Err(Rejection::reply(
                recovered_id,
                McpError::InvalidRequest("jsonrpc must be \"2.0\"".to_string()),
            ));
        }

        match detect_category(&envelope) {
            Some(MessageCategory::Request) => {
                if !validate_request(&envelope) {
                    return Err(Rejection::reply(
                        recovered_id,
                        McpError::InvalidRequest(
                            "request id must be a string, integer or null".to_string(),
                        ),
                    ));
                }
                let reject = |err| Rejection::reply(recovered_id.clone(), err);
                let method = take_method(&mut object).map_err(reject)?;
                let params = take_params(&mut object).map_err(reject)?;
                Ok(Self::Request(Request {
                    id: recovered_id,
                    method,
                    progress_token: progress_token_of(&params),
                    params,
                    created_at: Utc::now(),
                }))
            }
            Some(MessageCategory::Notification) => {
                let method = take_method(&mut object).map_err(Rejection::silent)?;
                let params = take_params(&mut object).map_err(Rejection::silent)?;
                Ok(Self::Notification(Notification {
                    method,
                    progress_token: progress_token_of(&params),
                    params,
                    created_at: Utc::now(),
                }))
            }
            Some(MessageCategory::Response) => {
                if !validate_response(&envelope) {
                    return Err(Rejection::reply(
                        recovered_id,
                        McpError::InvalidRequest(
                            "response must carry exactly one of result or error".to_string(),
                        ),
                    ));
                }
                let outcome = match (object.remove("result"), object.remove("error")) {
                    (Some(result), _) => Outcome::Result(result),
                    (None, Some(error)) => Outcome::Error(parse_rpc_error(&error)),
                    (None, None) => {
                        return Err(Rejection::reply(
                            recovered_id,
                            McpError::InvalidRequest("response has no outcome".to_string()),
                        ))
                    }
                };
                Ok(Self::Response(Response {
                    id: recovered_id,
                    outcome,
                    created_at: Utc::now(),
                }))
            }
            None => Err(Rejection::reply(
                recovered_id,
                McpError::InvalidRequest("unable to determine message category".to_string()),
            )),
        }
    }

    pub fn to_value(&self) -> Value {
        let mut object = Map::new();
        object.insert("jsonrpc".to_string(), Value::String(JSONRPC_VERSION.to_string()));
        match self {
            Self::Request(request) => {
                object.insert("id".to_string(), request.id.to_value());
                object.insert("method".to_string(), Value::String(request.method.clone()));
                if !request.params.is_empty() {
                    object.insert("params".to_string(), Value::Object(request.params.clone()));
                }
            }
            Self::Response(response) => {
                object.insert("id".to_string(), response.id.to_value());
                match &response.outcome {
                    Outcome::Result(result) => {
                        object.insert("result".to_string(), result.clone());
                    }
                    Outcome::Error(error) => {
                        let error = serde_json::to_value(error).unwrap_or(Value::Null);
                        object.insert("error".to_string(), error);
                    }
                }
            }
            Self::Notification(notification) => {
                object.insert("method".to_string(), Value::String(notification.method.clone()));
                if !notification.params.is_empty() {
                    object.insert("params".to_string(), Value::Object(notification.params.clone()));
                }
            }
        }
        Value::Object(object)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, McpError> {
        serde_json::to_vec(&self.to_value())
            .map_err(|err| McpError::Internal(format!("message serialization failed: {err}")))
    }
}

pub fn validate_json_rpc(value: &Value) -> bool {
    value
        .as_object()
        .and_then(|object| object.get("jsonrpc"))
        .and_then(Value::as_str)
        == Some(JSONRPC_VERSION)
}

pub fn validate_request(value: &Value) -> bool {
    let Some(object) = value.as_object() else {
        return false;
    };
    validate_json_rpc(value)
        && object.get("method").is_some_and(Value::is_string)
        && object
            .get("id")
            .is_some_and(|id| MessageId::from_value(id).is_some())
}

pub fn validate_response(value: &Value) -> bool {
    let Some(object) = value.as_object() else {
        return false;
    };
    validate_json_rpc(value)
        && object.contains_key("id")
        && (object.contains_key("result") != object.contains_key("error"))
}

pub fn validate_notification(value: &Value) -> bool {
    let Some(object) = value.as_object() else {
        return false;
    };
    validate_json_rpc(value)
        && object.get("method").is_some_and(Value::is_string)
        && !object.contains_key("id")
}

pub fn detect_category(value: &Value) -> Option<MessageCategory> {
    let object = value.as_object()?;
    let has_method = object.contains_key("method");
    let has_id = object.contains_key("id");
    let has_outcome = object.contains_key("result") || object.contains_key("error");

    match (has_method, has_id) {
        (true, true) => Some(MessageCategory::Request),
        (true, false) => Some(MessageCategory::Notification),
        (false, true) if has_outcome => Some(MessageCategory::Response),
        _ => None,
    }
}

fn take_method(object: &mut Map<String, Value>) -> Result<String, McpError> {
    let method = match object.remove("method") {
        Some(Value::String(method)) => method,
        _ => return Err(McpError::InvalidRequest("method must be a string".to_string())),
    };

    if method.trim().is_empty() {
        return Err(McpError::InvalidRequest("method must not be empty".to_string()));
    }
    if method.len() > MAX_METHOD_NAME_LENGTH {
        return Err(McpError::InvalidRequest(format!(
            "method exceeds {MAX_METHOD_NAME_LENGTH} bytes"
        )));
    }
    Ok(method)
}

fn take_params(object: &mut Map<String, Value>) -> Result<Map<String, Value>, McpError> {
    match object.remove("params") {
        None | Some(Value::Null) => Ok(Map::new()),
        Some(Value::Object(params)) => Ok(params),
        Some(_) => Err(McpError::InvalidParams("params must be an object".to_string())),
    }
}

fn parse_rpc_error(value: &Value) -> RpcError {
    let code = value
        .get("code")
        .and_then(Value::as_i64)
        .and_then(|code| i32::try_from(code).ok())
        .unwrap_or(crate::errors::codes::INTERNAL_ERROR);
    let message = value
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let data = value.get("data").map(|data| match data {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    });
    RpcError { code, message, data }
}

fn progress_token_of(params: &Map<String, Value>) -> Option<String> {
    match params.get("_meta")?.get("progressToken")? {
        Value::String(token) => Some(token.clone()),
        Value::Number(token) => Some(token.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::errors::codes;

    #[test]
    fn request_is_detected_structurally() {
        let message = Message::from_value(json!({
            "jsonrpc": "2.0",
            "id": "1",
            "method": "anything/at-all",
            "params": {"_meta": {"progressToken": "tok-1"}}
        }))
        .expect("valid request");

        assert_eq!(message.category(), MessageCategory::Request);
        assert_eq!(message.progress_token(), Some("tok-1"));
        let Message::Request(request) = message else {
            panic!("expected request");
        };
        assert_eq!(request.id, MessageId::String("1".to_string()));
    }

    #[test]
    fn notification_must_not_carry_id() {
        let value = json!({"jsonrpc": "2.0", "method": "notifications/initialized"});
        assert!(validate_notification(&value));
        assert!(!validate_request(&value));

        let with_id = json!({"jsonrpc": "2.0", "id": 3, "method": "notifications/initialized"});
        assert!(!validate_notification(&with_id));
        assert_eq!(detect_category(&with_id), Some(MessageCategory::Request));
    }

    #[test]
    fn response_requires_exactly_one_outcome() {
        assert!(validate_response(&json!({"jsonrpc": "2.0", "id": 1, "result": {}})));
        assert!(!validate_response(
            &json!({"jsonrpc": "2.0", "id": 1, "result": {}, "error": {"code": 1, "message": "x"}})
        ));

        let rejection = Message::from_value(
            json!({"jsonrpc": "2.0", "id": 9, "result": {}, "error": {"code": 1, "message": "x"}}),
        )
        .expect_err("ambiguous response");
        assert_eq!(rejection.error.code(), codes::INVALID_REQUEST);
        assert_eq!(rejection.id, MessageId::Integer(9));
    }

    #[test]
    fn missing_jsonrpc_keeps_recovered_id() {
        let rejection = Message::from_value(json!({"id": "7", "method": "ping"}))
            .expect_err("missing jsonrpc");
        assert_eq!(rejection.error.code(), codes::INVALID_REQUEST);
        assert_eq!(rejection.id, MessageId::String("7".to_string()));
        assert!(rejection.reply);
    }

    #[test]
    fn garbage_is_a_parse_error_with_null_id() {
        let rejection = Message::parse(b"{not json").expect_err("garbage");
        assert_eq!(rejection.error.code(), codes::PARSE_ERROR);
        assert!(rejection.id.is_absent());

        let response = rejection.into_response();
        let encoded = Message::Response(response).to_value();
        assert_eq!(encoded["id"], Value::Null);
        assert_eq!(encoded["error"]["code"], json!(-32700));
    }

    #[test]
    fn method_name_length_is_bounded() {
        let long_method = "m".repeat(MAX_METHOD_NAME_LENGTH + 1);
        let rejection =
            Message::from_value(json!({"jsonrpc": "2.0", "id": 1, "method": long_method}))
                .expect_err("method too long");
        assert_eq!(rejection.error.code(), codes::INVALID_REQUEST);

        let rejection = Message::from_value(json!({"jsonrpc": "2.0", "id": 1, "method": " "}))
            .expect_err("empty method");
        assert_eq!(rejection.error.code(), codes::INVALID_REQUEST);
    }

    #[test]
    fn malformed_notification_is_not_answered() {
        let rejection = Message::from_value(json!({"jsonrpc": "2.0", "method": "x", "params": 5}))
            .expect_err("bad params");
        assert!(!rejection.reply);
    }

    #[test]
    fn float_ids_are_rejected() {
        let rejection = Message::from_value(json!({"jsonrpc": "2.0", "id": 1.5, "method": "ping"}))
            .expect_err("float id");
        assert_eq!(rejection.error.code(), codes::INVALID_REQUEST);
        assert!(rejection.id.is_absent());
    }

    #[test]
    fn ids_compare_by_tag_then_value() {
        assert_ne!(MessageId::from("1"), MessageId::from(1));
        assert_eq!(MessageId::from(1), MessageId::Integer(1));
        assert_eq!(MessageId::Absent.to_string(), "null");
    }

    #[test]
    fn error_response_omits_missing_data() {
        let response = Response::from_error(MessageId::from(1), &McpError::NotInitialized);
        let encoded = Message::Response(response).to_value();
        assert_eq!(
            encoded,
            json!({
                "jsonrpc": "2.0",
                "id": 1,
                "error": {"code": -32001, "message": "Server not initialized"}
            })
        );
    }
}
