use std::io;

use thiserror::Error;

use crate::mcp::rpc::RpcError;

// The -32700..-32600 block is reserved by JSON-RPC 2.0, the -32099..-32000 block is
// implementation-defined.
pub mod codes {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;

    pub const NOT_INITIALIZED: i32 = -32001;
    pub const INVALID_NOTIFICATION: i32 = -32002;
    pub const TOOL_ERROR: i32 = -32003;
    pub const CANCELLED: i32 = -32004;
    pub const TIMEOUT: i32 = -32005;
    pub const NO_PROGRESS_TOKEN: i32 = -32006;
    pub const OUT_OF_MEMORY: i32 = -32007;
    pub const INVALID_STATE: i32 = -32008;
    pub const TRANSPORT_FAILED: i32 = -32009;
    pub const TASK_CREATION_FAILED: i32 = -32010;
    pub const RESOURCE_LIMIT: i32 = -32011;
    pub const MESSAGE_TOO_LARGE: i32 = -32012;
    pub const INVALID_OPERATION: i32 = -32013;
    pub const NOT_IMPLEMENTED: i32 = -32014;
    pub const INVALID_MESSAGE: i32 = -32015;
    pub const RESOURCE_LOCK: i32 = -32016;
    pub const NOT_FOUND: i32 = -32017;
    pub const TOOL_NOT_FOUND: i32 = -32018;
    pub const HARDWARE_FAILED: i32 = -32019;
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum McpError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("method not found: {0}")]
    MethodNotFound(String),
    #[error("invalid params: {0}")]
    InvalidParams(String),
    #[error("internal error: {0}")]
    Internal(String),
    #[error("server not initialized")]
    NotInitialized,
    #[error("invalid notification: {0}")]
    InvalidNotification(String),
    #[error("tool execution error: {0}")]
    Tool(String),
    #[error("request cancelled")]
    Cancelled,
    #[error("request timeout")]
    Timeout,
    #[error("no progress token attached to request")]
    NoProgressToken,
    #[error("out of memory")]
    OutOfMemory,
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("transport failed: {0}")]
    TransportFailed(String),
    #[error("task creation failed: {0}")]
    TaskCreationFailed(String),
    #[error("resource limit reached: {0}")]
    ResourceLimit(String),
    #[error("message too large: {size} bytes exceeds {max}")]
    MessageTooLarge { size: usize, max: usize },
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    #[error("not implemented")]
    NotImplemented,
    #[error("invalid message: {0}")]
    InvalidMessage(String),
    #[error("resource lock timed out")]
    ResourceLock,
    #[error("not found: {0}")]
    NotFound(String),
    #[error("tool not found: {0}")]
    ToolNotFound(String),
    #[error("hardware failure: {0}")]
    HardwareFailed(String),
}

impl McpError {
    pub fn code(&self) -> i32 {
        match self {
            Self::Parse(_) => codes::PARSE_ERROR,
            Self::InvalidRequest(_) => codes::INVALID_REQUEST,
            Self::MethodNotFound(_) => codes::METHOD_NOT_FOUND,
            Self::InvalidParams(_) => codes::INVALID_PARAMS,
            Self::Internal(_) => codes::INTERNAL_ERROR,
            Self::NotInitialized => codes::NOT_INITIALIZED,
            Self::InvalidNotification(_) => codes::INVALID_NOTIFICATION,
            Self::Tool(_) => codes::TOOL_ERROR,
            Self::Cancelled => codes::CANCELLED,
            Self::Timeout => codes::TIMEOUT,
            Self::NoProgressToken => codes::NO_PROGRESS_TOKEN,
            Self::OutOfMemory => codes::OUT_OF_MEMORY,
            Self::InvalidState(_) => codes::INVALID_STATE,
            Self::TransportFailed(_) => codes::TRANSPORT_FAILED,
            Self::TaskCreationFailed(_) => codes::TASK_CREATION_FAILED,
            Self::ResourceLimit(_) => codes::RESOURCE_LIMIT,
            Self::MessageTooLarge { .. } => codes::MESSAGE_TOO_LARGE,
            Self::InvalidOperation(_) => codes::INVALID_OPERATION,
            Self::NotImplemented => codes::NOT_IMPLEMENTED,
            Self::InvalidMessage(_) => codes::INVALID_MESSAGE,
            Self::ResourceLock => codes::RESOURCE_LOCK,
            Self::NotFound(_) => codes::NOT_FOUND,
            Self::ToolNotFound(_) => codes::TOOL_NOT_FOUND,
            Self::HardwareFailed(_) => codes::HARDWARE_FAILED,
        }
    }

    pub fn rpc_message(&self) -> &'static str {
        match self {
            Self::Parse(_) => "Parse error",
            Self::InvalidRequest(_) => "Invalid Request",
            Self::MethodNotFound(_) => "Method not found",
            Self::InvalidParams(_) => "Invalid params",
            Self::Internal(_) => "Internal error",
            Self::NotInitialized => "Server not initialized",
            Self::InvalidNotification(_) => "Invalid notification",
            Self::Tool(_) => "Tool execution error",
            Self::Cancelled => "Request cancelled",
            Self::Timeout => "Request timeout",
            Self::NoProgressToken => "No progress token",
            Self::OutOfMemory => "Out of memory",
            Self::InvalidState(_) => "Invalid state",
            Self::TransportFailed(_) => "Transport failed",
            Self::TaskCreationFailed(_) => "Task creation failed",
            Self::ResourceLimit(_) => "Resource limit reached",
            Self::MessageTooLarge { .. } => "Message too large",
            Self::InvalidOperation(_) => "Invalid operation",
            Self::NotImplemented => "Not implemented",
            Self::InvalidMessage(_) => "Invalid message",
            Self::ResourceLock => "Resource lock timeout",
            Self::NotFound(_) => "Not found",
            Self::ToolNotFound(_) => "Tool not found",
            Self::HardwareFailed(_) => "Hardware failure",
        }
    }

    fn detail(&self) -> Option<String> {
        match self {
            Self::Parse(detail)
            | Self::InvalidRequest(detail)
            | Self::MethodNotFound(detail)
            | Self::InvalidParams(detail)
            | Self::Internal(detail)
            | Self::InvalidNotification(detail)
            | Self::Tool(detail)
            | Self::InvalidState(detail)
            | Self::TransportFailed(detail)
            | Self::TaskCreationFailed(detail)
            | Self::ResourceLimit(detail)
            | Self::InvalidOperation(detail)
            | Self::InvalidMessage(detail)
            | Self::NotFound(detail)
            | Self::ToolNotFound(detail)
            | Self::HardwareFailed(detail) => Some(detail.clone()),
            Self::MessageTooLarge { .. } => Some(self.to_string()),
            Self::NotInitialized
            | Self::Cancelled
            | Self::Timeout
            | Self::NoProgressToken
            | Self::OutOfMemory
            | Self::NotImplemented
            | Self::ResourceLock => None,
        }
    }

    pub fn to_rpc_error(&self) -> RpcError {
        RpcError {
            code: self.code(),
            message: self.rpc_message().to_string(),
            data: self.detail().filter(|detail| !detail.is_empty()),
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("receive timed out")]
    Timeout,
    #[error("send timed out mid-frame")]
    WriteTimeout,
    #[error("connection closed")]
    Closed,
    #[error("frame of {size} bytes exceeds limit of {max} bytes")]
    MessageTooLarge { size: usize, max: usize },
    #[error("receive buffer exceeded {limit} bytes without a frame delimiter")]
    BufferOverflow { limit: usize },
    #[error("peer sent an HTTP request on the MCP socket")]
    HttpProbe,
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Closed | Self::WriteTimeout | Self::HttpProbe | Self::Io(_)
        )
    }

    pub(crate) fn from_io(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::WriteZero
            | io::ErrorKind::NotConnected => Self::Closed,
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Self::Timeout,
            _ => Self::Io(err),
        }
    }
}

impl From<TransportError> for McpError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout => Self::Timeout,
            TransportError::MessageTooLarge { size, max } => Self::MessageTooLarge { size, max },
            TransportError::BufferOverflow { limit } => Self::MessageTooLarge {
                size: limit,
                max: limit,
            },
            other => Self::TransportFailed(other.to_string()),
        }
    }
}
