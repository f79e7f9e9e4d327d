//! Device tools exposed over the MCP protocol
//!
//! Provides the tool registry and the built-in echo, GPIO and long-running demo tools.

pub mod tools;
pub mod utils;
