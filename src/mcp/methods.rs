//! Typed view of the fixed MCP method set
//!
//! A [`Request`]/[`Notification`] is mapped to a closed enum through a lookup table keyed
//! on the method string; each variant carries its own params struct.

use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{Map, Value};

use crate::errors::McpError;
use crate::mcp::rpc::{MessageId, Notification, Request};

pub const METHOD_INITIALIZE: &str = "initialize";
pub const METHOD_TOOLS_LIST: &str = "tools/list";
pub const METHOD_TOOLS_CALL: &str = "tools/call";
pub const METHOD_PING: &str = "ping";
pub const METHOD_INITIALIZED: &str = "notifications/initialized";
pub const METHOD_PROGRESS: &str = "notifications/progress";
pub const METHOD_CANCELLED: &str = "notifications/cancelled";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodKind {
    Initialize,
    ListTools,
    CallTool,
    Ping,
    Initialized,
    Progress,
    Cancelled,
}

const METHOD_TABLE: &[(&str, MethodKind)] = &[
    (METHOD_INITIALIZE, MethodKind::Initialize),
    (METHOD_TOOLS_LIST, MethodKind::ListTools),
    (METHOD_TOOLS_CALL, MethodKind::CallTool),
    (METHOD_PING, MethodKind::Ping),
    (METHOD_INITIALIZED, MethodKind::Initialized),
    // pre-2024 clients still send the bare name
    ("initialized", MethodKind::Initialized),
    (METHOD_PROGRESS, MethodKind::Progress),
    (METHOD_CANCELLED, MethodKind::Cancelled),
];

impl MethodKind {
    pub fn lookup(method: &str) -> Option<Self> {
        METHOD_TABLE
            .iter()
            .find(|(name, _)| *name == method)
            .map(|(_, kind)| *kind)
    }

    pub fn is_notification(self) -> bool {
        matches!(self, Self::Initialized | Self::Progress | Self::Cancelled)
    }

    pub fn requires_active_session(self) -> bool {
        matches!(self, Self::ListTools | Self::CallTool)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    #[serde(default)]
    pub protocol_version: Option<String>,
    #[serde(default)]
    pub client_info: Option<ClientInfo>,
    #[serde(default)]
    pub capabilities: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListToolsParams {
    #[serde(default)]
    pub cursor: Option<String>,
    #[serde(default)]
    pub max_results: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallToolParams {
    pub name: String,
    #[serde(default)]
    pub arguments: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressParams {
    pub progress_token: Value,
    pub progress: f64,
    #[serde(default)]
    pub total: Option<f64>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelledParams {
    pub request_id: Value,
    #[serde(default)]
    pub reason: Option<String>,
}

impl CancelledParams {
    pub fn message_id(&self) -> Result<MessageId, McpError> {
        MessageId::from_value(&self.request_id)
            .filter(|id| !id.is_absent())
            .ok_or_else(|| {
                McpError::InvalidParams("requestId must be a string or integer".to_string())
            })
    }
}

#[derive(Debug, Clone)]
pub enum McpRequest {
    Initialize(InitializeParams),
    ListTools(ListToolsParams),
    CallTool(CallToolParams),
    Ping,
}

impl McpRequest {
    pub fn from_request(request: &Request) -> Result<Self, McpError> {
        match MethodKind::lookup(&request.method) {
            Some(MethodKind::Initialize) => parse_params(&request.params).map(Self::Initialize),
            Some(MethodKind::ListTools) => parse_params(&request.params).map(Self::ListTools),
            Some(MethodKind::CallTool) => parse_params(&request.params).map(Self::CallTool),
            Some(MethodKind::Ping) => Ok(Self::Ping),
            Some(_) | None => Err(McpError::MethodNotFound(request.method.clone())),
        }
    }
}

#[derive(Debug, Clone)]
pub enum McpNotification {
    Initialized,
    Progress(ProgressParams),
    Cancelled(CancelledParams),
    Unknown(String),
}

impl McpNotification {
    pub fn from_notification(notification: &Notification) -> Result<Self, McpError> {
        match MethodKind::lookup(&notification.method) {
            Some(MethodKind::Initialized) => Ok(Self::Initialized),
            Some(MethodKind::Progress) => parse_params(&notification.params)
                .map(Self::Progress)
                .map_err(|err| McpError::InvalidNotification(err.to_string())),
            Some(MethodKind::Cancelled) => parse_params(&notification.params)
                .map(Self::Cancelled)
                .map_err(|err| McpError::InvalidNotification(err.to_string())),
            Some(_) | None => Ok(Self::Unknown(notification.method.clone())),
        }
    }
}

fn parse_params<T: DeserializeOwned>(params: &Map<String, Value>) -> Result<T, McpError> {
    serde_json::from_value(Value::Object(params.clone()))
        .map_err(|err| McpError::InvalidParams(err.to_string()))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::errors::codes;

    fn request(method: &str, params: Value) -> Request {
        let Value::Object(params) = params else {
            panic!("params must be an object");
        };
        Request::new("1", method, params)
    }

    #[test]
    fn lookup_covers_the_fixed_method_set() {
        assert_eq!(MethodKind::lookup("tools/call"), Some(MethodKind::CallTool));
        assert_eq!(MethodKind::lookup("initialized"), Some(MethodKind::Initialized));
        assert_eq!(MethodKind::lookup("resources/list"), None);
        assert!(MethodKind::Cancelled.is_notification());
        assert!(!MethodKind::Ping.is_notification());
        assert!(MethodKind::ListTools.requires_active_session());
        assert!(!MethodKind::Initialize.requires_active_session());
    }

    #[test]
    fn call_tool_requires_name() {
        let error = McpRequest::from_request(&request("tools/call", json!({"arguments": {}})))
            .expect_err("missing name");
        assert_eq!(error.code(), codes::INVALID_PARAMS);

        let parsed = McpRequest::from_request(&request(
            "tools/call",
            json!({"name": "echo", "arguments": {"text": "hi"}}),
        ))
        .expect("valid call");
        let McpRequest::CallTool(params) = parsed else {
            panic!("expected tools/call");
        };
        assert_eq!(params.name, "echo");
        assert_eq!(params.arguments.expect("arguments")["text"], json!("hi"));
    }

    #[test]
    fn notification_names_are_not_requests() {
        let error = McpRequest::from_request(&request("notifications/initialized", json!({})))
            .expect_err("notification used as request");
        assert_eq!(error.code(), codes::METHOD_NOT_FOUND);
    }

    #[test]
    fn cancelled_notification_parses_request_id() {
        let notification = Notification::new(
            METHOD_CANCELLED,
            json!({"requestId": 42, "reason": "user"})
                .as_object()
                .cloned()
                .expect("object"),
        );
        let McpNotification::Cancelled(params) =
            McpNotification::from_notification(&notification).expect("valid cancel")
        else {
            panic!("expected cancelled");
        };
        assert_eq!(params.message_id().expect("id"), MessageId::Integer(42));
        assert_eq!(params.reason.as_deref(), Some("user"));
    }
}
