//! Domain-specific argument validation and result formatting

use std::time::Duration;

use rust_mcp_sdk::schema::{CallToolResult, ContentBlock, TextContent};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::errors::McpError;

pub const MAX_GPIO_PIN: u32 = 16;
pub const DEFAULT_TASK_STEPS: u32 = 5;
pub const MAX_TASK_STEPS: u32 = 100;
pub const DEFAULT_SCAN_RESULTS: u32 = 10;
pub const MAX_SCAN_RESULTS: u32 = 50;
pub const DEFAULT_SCAN_TIMEOUT_MS: u32 = 10_000;
pub const MIN_SCAN_TIMEOUT_MS: u32 = 1_000;
pub const MAX_SCAN_TIMEOUT_MS: u32 = 30_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinLevel {
    Low,
    High,
}

impl PinLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::High => "high",
        }
    }
}

pub fn parse_arguments<T: DeserializeOwned>(arguments: Map<String, Value>) -> Result<T, McpError> {
    serde_json::from_value(Value::Object(arguments))
        .map_err(|err| McpError::InvalidParams(format!("invalid tool arguments: {err}")))
}

pub fn text_result(text: impl Into<String>) -> CallToolResult {
    CallToolResult {
        content: vec![ContentBlock::from(TextContent::new(text.into(), None, None))],
        is_error: None,
        meta: None,
        structured_content: None,
    }
}

pub fn structured_result(summary: impl Into<String>, fields: Map<String, Value>) -> CallToolResult {
    CallToolResult {
        structured_content: Some(fields),
        ..text_result(summary)
    }
}

pub fn result_value(result: CallToolResult) -> Result<Value, McpError> {
    serde_json::to_value(result)
        .map_err(|err| McpError::Internal(format!("tool result serialization failed: {err}")))
}

pub fn normalize_gpio_pin(pin: u32) -> Result<usize, McpError> {
    if pin > MAX_GPIO_PIN {
        return Err(McpError::InvalidParams(format!(
            "pin must be between 0 and {MAX_GPIO_PIN}"
        )));
    }
    Ok(pin as usize)
}

pub fn normalize_gpio_state(state: &str) -> Result<PinLevel, McpError> {
    match state.trim().to_ascii_lowercase().as_str() {
        "high" | "on" | "1" => Ok(PinLevel::High),
        "low" | "off" | "0" => Ok(PinLevel::Low),
        _ => Err(McpError::InvalidParams(
            "state must be one of: high, low".to_string(),
        )),
    }
}

pub fn normalize_task_steps(steps: Option<u32>) -> Result<u32, McpError> {
    let steps = steps.unwrap_or(DEFAULT_TASK_STEPS);
    if steps == 0 || steps > MAX_TASK_STEPS {
        return Err(McpError::InvalidParams(format!(
            "steps must be between 1 and {MAX_TASK_STEPS}"
        )));
    }
    Ok(steps)
}

pub fn normalize_scan_results(max_results: Option<u32>) -> Result<usize, McpError> {
    let max_results = max_results.unwrap_or(DEFAULT_SCAN_RESULTS);
    if max_results == 0 || max_results > MAX_SCAN_RESULTS {
        return Err(McpError::InvalidParams(format!(
            "max_results must be between 1 and {MAX_SCAN_RESULTS}"
        )));
    }
    Ok(max_results as usize)
}

pub fn normalize_scan_timeout(timeout_ms: Option<u32>) -> Result<Duration, McpError> {
    let timeout_ms = timeout_ms.unwrap_or(DEFAULT_SCAN_TIMEOUT_MS);
    if !(MIN_SCAN_TIMEOUT_MS..=MAX_SCAN_TIMEOUT_MS).contains(&timeout_ms) {
        return Err(McpError::InvalidParams(format!(
            "timeout_ms must be between {MIN_SCAN_TIMEOUT_MS} and {MAX_SCAN_TIMEOUT_MS}"
        )));
    }
    Ok(Duration::from_millis(u64::from(timeout_ms)))
}
