//! The central Model Context Protocol engine
//!
//! Routes each message popped from a session's queue: requests are gated on the session
//! state, executed, and answered; notifications drive the lifecycle and cancellation;
//! client responses (to keep-alive pings) are only logged. Every request and notification
//! produces one audit log line with secret-looking params redacted.

use rust_mcp_sdk::schema::{InitializeResult, ListToolsResult, ProtocolVersion};
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::domain::tools::ToolInvocation;
use crate::domain::utils::result_value;
use crate::errors::McpError;
use crate::mcp::executor::AsyncTask;
use crate::mcp::methods::{
    CallToolParams, InitializeParams, ListToolsParams, McpNotification, McpRequest, MethodKind,
    METHOD_TOOLS_CALL,
};
use crate::mcp::rpc::{Message, Notification, Outcome, Request, Response};
use crate::mcp::session::{SessionShared, SessionState};

pub const SUPPORTED_PROTOCOL_VERSION: &str = "2024-11-05";
pub const DEFAULT_PAGE_SIZE: usize = 8;

enum Reply {
    Result(Value),
    Deferred,
}

pub(crate) async fn dispatch(session: &SessionShared, message: Message) {
    match message {
        Message::Request(request) => {
            let id = request.id.clone();
            let method = request.method.clone();
            let audit_params = redact_audit_params(&request.params);

            let outcome = match handle_request(session, &request) {
                Ok(Reply::Result(result)) => {
                    session.send_response(Response::result(id.clone(), result)).await;
                    "success"
                }
                Ok(Reply::Deferred) => "deferred",
                Err(err) => {
                    debug!(request_id = %id, method = %method, error = %err, "request failed");
                    session.send_response(Response::from_error(id.clone(), &err)).await;
                    "failure"
                }
            };

            info!(
                request_id = %id,
                method = %method,
                params = %audit_params,
                outcome,
                "mcp action audited"
            );
        }
        Message::Notification(notification) => {
            let audit_params = redact_audit_params(&notification.params);
            let outcome = match handle_notification(session, &notification) {
                Ok(()) => "success",
                Err(err) => {
                    session.record_error();
                    debug!(method = %notification.method, error = %err, "notification ignored");
                    "failure"
                }
            };

            info!(
                method = %notification.method,
                params = %audit_params,
                outcome,
                "mcp action audited"
            );
        }
        Message::Response(response) => match &response.outcome {
            Outcome::Result(_) => debug!(request_id = %response.id, "client response received"),
            Outcome::Error(error) => warn!(
                request_id = %response.id,
                code = error.code,
                message = %error.message,
                "client answered with an error"
            ),
        },
    }
}

fn handle_request(session: &SessionShared, request: &Request) -> Result<Reply, McpError> {
    let kind = MethodKind::lookup(&request.method)
        .filter(|kind| !kind.is_notification())
        .ok_or_else(|| McpError::MethodNotFound(request.method.clone()))?;

    if kind.requires_active_session() && session.state() != SessionState::Active {
        return Err(McpError::NotInitialized);
    }

    match McpRequest::from_request(request)? {
        McpRequest::Initialize(params) => initialize(session, &params).map(Reply::Result),
        McpRequest::ListTools(params) => list_tools(session, &params).map(Reply::Result),
        McpRequest::CallTool(params) => call_tool(session, request, params),
        McpRequest::Ping => Ok(Reply::Result(json!({}))),
    }
}

fn handle_notification(
    session: &SessionShared,
    notification: &Notification,
) -> Result<(), McpError> {
    match McpNotification::from_notification(notification)? {
        McpNotification::Initialized => {
            let initialize_received = session
                .info
                .read()
                .map(|info| info.initialize_received)
                .unwrap_or(false);
            if !initialize_received {
                warn!("initialized notification before initialize request, ignoring");
                return Err(McpError::InvalidNotification(
                    "initialize has not completed".to_string(),
                ));
            }
            match session.state() {
                SessionState::Initialized => session.transition(SessionState::Active),
                SessionState::Active => {
                    debug!("duplicate initialized notification");
                    Ok(())
                }
                state => Err(McpError::InvalidState(format!(
                    "initialized notification in {state}"
                ))),
            }
        }
        McpNotification::Cancelled(params) => {
            let request_id = params.message_id()?;
            if session.executor.cancel(&request_id) {
                info!(
                    request_id = %request_id,
                    reason = params.reason.as_deref().unwrap_or("none"),
                    "task cancelled by client"
                );
                Ok(())
            } else {
                Err(McpError::NotFound(format!("no pending task for {request_id}")))
            }
        }
        McpNotification::Progress(params) => {
            debug!(progress = params.progress, "client progress notification");
            Ok(())
        }
        McpNotification::Unknown(method) => {
            debug!(method = %method, "unknown notification");
            Ok(())
        }
    }
}

fn initialize(session: &SessionShared, params: &InitializeParams) -> Result<Value, McpError> {
    let protocol_version = negotiate_protocol_version(params)?;

    let mut session_info = session
        .info
        .write()
        .map_err(|_| McpError::ResourceLock)?;
    session_info.client_info = params.client_info.clone();
    session_info.initialize_received = true;
    if let Some(client) = &params.client_info {
        info!(client_name = %client.name, client_version = %client.version, "client initializing");
    }

    let initialize_result = InitializeResult {
        server_info: session_info.server_info.clone(),
        capabilities: session_info.capabilities.clone(),
        protocol_version: protocol_version.into(),
        instructions: None,
        meta: None,
    };
    drop(session_info);

    let mut result = serde_json::to_value(initialize_result).map_err(|err| {
        McpError::Internal(format!("initialize result serialization failed: {err}"))
    })?;
    if session.config.enable_progress_reporting {
        // progress notifications are advertised through the logging capability
        if let Some(capabilities) = result.get_mut("capabilities").and_then(Value::as_object_mut) {
            capabilities
                .entry("logging")
                .or_insert_with(|| Value::Object(Map::new()));
        }
    }
    Ok(result)
}

fn list_tools(session: &SessionShared, params: &ListToolsParams) -> Result<Value, McpError> {
    let names = session
        .info
        .read()
        .map(|info| info.tool_names.clone())
        .map_err(|_| McpError::ResourceLock)?;
    let tools = session.registry.descriptors(&names);

    let (tools, next_cursor) = if session.config.enable_tools_pagination {
        let offset = parse_cursor(params.cursor.as_deref())?;
        let page_size = params
            .max_results
            .map(|max| max as usize)
            .filter(|max| *max > 0)
            .unwrap_or(DEFAULT_PAGE_SIZE);
        let end = offset.saturating_add(page_size).min(tools.len());
        let next_cursor = (end < tools.len()).then(|| end.to_string());
        let page = tools.into_iter().skip(offset).take(end.saturating_sub(offset)).collect();
        (page, next_cursor)
    } else {
        (tools, None)
    };

    serde_json::to_value(ListToolsResult {
        meta: None,
        next_cursor,
        tools,
    })
    .map_err(|err| McpError::Internal(format!("tools list serialization failed: {err}")))
}

fn call_tool(
    session: &SessionShared,
    request: &Request,
    params: CallToolParams,
) -> Result<Reply, McpError> {
    let enabled = session
        .info
        .read()
        .map(|info| info.tool_names.iter().any(|name| *name == params.name))
        .unwrap_or(false);
    let handler = session
        .registry
        .get(&params.name)
        .filter(|_| enabled)
        .ok_or_else(|| McpError::ToolNotFound(params.name.clone()))?;

    match handler.invoke(params.arguments.unwrap_or_default())? {
        ToolInvocation::Complete(result) => result_value(result).map(Reply::Result),
        ToolInvocation::Deferred(body) => {
            let progress_token = request
                .progress_token
                .clone()
                .filter(|_| session.config.enable_progress_reporting);
            session.executor.submit(AsyncTask::new(
                request.id.clone(),
                METHOD_TOOLS_CALL,
                progress_token,
                body.timeout().unwrap_or(session.config.task_timeout),
                body,
            ))?;
            Ok(Reply::Deferred)
        }
    }
}

fn parse_cursor(cursor: Option<&str>) -> Result<usize, McpError> {
    let Some(cursor) = cursor.map(str::trim).filter(|cursor| !cursor.is_empty()) else {
        return Ok(0);
    };
    cursor
        .parse::<usize>()
        .map_err(|_| McpError::InvalidParams(format!("invalid cursor '{cursor}'")))
}

pub fn negotiate_protocol_version(params: &InitializeParams) -> Result<ProtocolVersion, McpError> {
    let offered_version = params
        .protocol_version
        .as_deref()
        .map(str::trim)
        .filter(|version| !version.is_empty())
        .ok_or_else(|| {
            McpError::InvalidParams("initialize params.protocolVersion is required".to_string())
        })?;

    if offered_version != SUPPORTED_PROTOCOL_VERSION {
        info!(
            offered = %offered_version,
            supported = SUPPORTED_PROTOCOL_VERSION,
            "answering with the supported protocol version"
        );
    }

    Ok(ProtocolVersion::V2024_11_05)
}

pub fn redact_audit_params(params: &Map<String, Value>) -> Value {
    if params.is_empty() {
        return Value::Null;
    }
    redact_audit_value(&Value::Object(params.clone()))
}

pub fn redact_audit_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, item)| {
                    if is_sensitive_key(key) {
                        (key.clone(), Value::String("[REDACTED]".to_string()))
                    } else {
                        (key.clone(), redact_audit_value(item))
                    }
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(redact_audit_value).collect()),
        _ => value.clone(),
    }
}

pub fn is_sensitive_key(key: &str) -> bool {
    let normalized = key.trim().to_ascii_lowercase();
    // progressToken is a correlation id, not a credential
    if normalized == "progresstoken" {
        return false;
    }
    matches!(
        normalized.as_str(),
        "authorization" | "bearer" | "psk" | "passphrase" | "api_key" | "apikey"
    ) || normalized.contains("token")
        || normalized.contains("secret")
        || normalized.contains("password")
        || normalized.contains("credential")
}
