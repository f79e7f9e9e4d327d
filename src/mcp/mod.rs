//! Model Context Protocol (MCP) session engine and JSON-RPC implementations
//!
//! Provides the JSON-RPC envelope, the typed MCP method set, request routing, the
//! per-connection session state machine and the cooperative task executor.

pub mod dispatcher;
pub mod executor;
pub mod methods;
pub mod rpc;
pub mod session;

pub use session::{Session, SessionConfig, SessionState, SessionStats};
