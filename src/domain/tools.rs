//! Device tools exposed via Model Context Protocol
//!
//! Provides the process-wide [`ToolRegistry`] and the built-in device tools. Tools either
//! answer immediately or hand a [`TaskBody`] to the session's executor.

use std::{
    sync::{Arc, Mutex, RwLock},
    thread,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use rust_mcp_sdk::{
    macros,
    schema::{CallToolResult, Tool},
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::domain::utils::{
    normalize_gpio_pin, normalize_gpio_state, normalize_scan_results, normalize_scan_timeout,
    normalize_task_steps, parse_arguments, result_value, structured_result, text_result,
    PinLevel, MAX_GPIO_PIN,
};
use crate::errors::McpError;
use crate::mcp::executor::{TaskBody, TaskContext, TaskStep};

pub const MAX_TOOLS: usize = 16;
pub const MAX_TOOL_NAME_LENGTH: usize = 64;

pub enum ToolInvocation {
    Complete(CallToolResult),
    Deferred(Box<dyn TaskBody>),
}

pub trait ToolHandler: Send + Sync {
    fn tool(&self) -> Tool;

    fn invoke(&self, arguments: Map<String, Value>) -> Result<ToolInvocation, McpError>;

    fn name(&self) -> String {
        self.tool().name
    }
}

#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<Vec<(String, Arc<dyn ToolHandler>)>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_tools() -> Result<Self, McpError> {
        let registry = Self::new();
        registry.register(Arc::new(EchoHandler))?;
        registry.register(Arc::new(GpioControlHandler::new(Arc::new(GpioBank::default()))))?;
        registry.register(Arc::new(LongRunningHandler))?;
        registry.register(Arc::new(SystemInfoHandler::new()))?;
        registry.register(Arc::new(NetworkScanHandler))?;
        Ok(registry)
    }

    pub fn register(&self, handler: Arc<dyn ToolHandler>) -> Result<(), McpError> {
        let name = handler.name();
        if name.trim().is_empty() || name.len() > MAX_TOOL_NAME_LENGTH {
            return Err(McpError::InvalidParams(format!(
                "tool name must be 1..={MAX_TOOL_NAME_LENGTH} bytes"
            )));
        }

        let mut tools = self
            .tools
            .write()
            .map_err(|_| McpError::Internal("tool registry lock poisoned".to_string()))?;
        if tools.len() >= MAX_TOOLS {
            return Err(McpError::ResourceLimit(format!(
                "at most {MAX_TOOLS} tools can be registered"
            )));
        }
        if tools.iter().any(|(existing, _)| *existing == name) {
            return Err(McpError::InvalidOperation(format!(
                "tool {name} is already registered"
            )));
        }

        info!(tool = %name, "tool registered");
        tools.push((name, handler));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ToolHandler>> {
        let tools = self.tools.read().ok()?;
        tools
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, handler)| Arc::clone(handler))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn names(&self) -> Vec<String> {
        self.tools
            .read()
            .map(|tools| tools.iter().map(|(name, _)| name.clone()).collect())
            .unwrap_or_default()
    }

    pub fn descriptors(&self, names: &[String]) -> Vec<Tool> {
        self.tools
            .read()
            .map(|tools| {
                tools
                    .iter()
                    .filter(|(name, _)| names.contains(name))
                    .map(|(_, handler)| handler.tool())
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[macros::mcp_tool(name = "echo", description = "Echo the given text back to the caller")]
#[derive(Debug, Deserialize, Serialize, macros::JsonSchema)]
pub struct EchoTool {
    pub text: String,
}

#[macros::mcp_tool(
    name = "gpio_control",
    description = "Drive a GPIO output pin (0-16) high or low"
)]
#[derive(Debug, Deserialize, Serialize, macros::JsonSchema)]
pub struct GpioControlTool {
    pub pin: u32,
    pub state: String,
}

#[macros::mcp_tool(
    name = "long_running_task",
    description = "Run a multi-step job with progress notifications (1-100 steps, default 5)"
)]
#[derive(Debug, Deserialize, Serialize, macros::JsonSchema)]
pub struct LongRunningTaskTool {
    pub steps: Option<u32>,
}

#[macros::mcp_tool(
    name = "system_info",
    description = "Report server, runtime and Wi-Fi status"
)]
#[derive(Debug, Deserialize, Serialize, macros::JsonSchema)]
pub struct SystemInfoTool {
    pub include_tasks: Option<bool>,
    pub include_wifi: Option<bool>,
}

#[macros::mcp_tool(
    name = "network_scan",
    description = "Scan for available Wi-Fi networks (async, reports progress)"
)]
#[derive(Debug, Deserialize, Serialize, macros::JsonSchema)]
pub struct NetworkScanTool {
    pub max_results: Option<u32>,
    pub include_rssi: Option<bool>,
    pub include_channel: Option<bool>,
    pub include_bssid: Option<bool>,
    pub timeout_ms: Option<u32>,
}

pub struct EchoHandler;

impl ToolHandler for EchoHandler {
    fn tool(&self) -> Tool {
        EchoTool::tool()
    }

    fn invoke(&self, arguments: Map<String, Value>) -> Result<ToolInvocation, McpError> {
        let params: EchoTool = parse_arguments(arguments)?;
        Ok(ToolInvocation::Complete(text_result(format!(
            "Echo: {}",
            params.text
        ))))
    }
}

// simulated output bank; a board port would write the pin register here
#[derive(Debug, Default)]
pub struct GpioBank {
    levels: Mutex<[Option<PinLevel>; MAX_GPIO_PIN as usize + 1]>,
}

impl GpioBank {
    pub fn set(&self, pin: usize, level: PinLevel) -> Result<(), McpError> {
        let mut levels = self
            .levels
            .lock()
            .map_err(|_| McpError::HardwareFailed("gpio bank lock poisoned".to_string()))?;
        let slot = levels
            .get_mut(pin)
            .ok_or_else(|| McpError::HardwareFailed(format!("pin {pin} is not wired")))?;
        *slot = Some(level);
        Ok(())
    }

    pub fn level(&self, pin: usize) -> Option<PinLevel> {
        self.levels.lock().ok()?.get(pin).copied().flatten()
    }
}

pub struct GpioControlHandler {
    bank: Arc<GpioBank>,
}

impl GpioControlHandler {
    pub fn new(bank: Arc<GpioBank>) -> Self {
        Self { bank }
    }
}

impl ToolHandler for GpioControlHandler {
    fn tool(&self) -> Tool {
        GpioControlTool::tool()
    }

    fn invoke(&self, arguments: Map<String, Value>) -> Result<ToolInvocation, McpError> {
        let params: GpioControlTool = parse_arguments(arguments)?;
        let pin = normalize_gpio_pin(params.pin)?;
        let level = normalize_gpio_state(&params.state)?;

        self.bank.set(pin, level)?;
        debug!(pin, level = level.as_str(), "gpio pin driven");
        Ok(ToolInvocation::Complete(text_result(format!(
            "GPIO pin {pin} set to {}",
            level.as_str()
        ))))
    }
}

pub struct LongRunningHandler;

impl ToolHandler for LongRunningHandler {
    fn tool(&self) -> Tool {
        LongRunningTaskTool::tool()
    }

    fn invoke(&self, arguments: Map<String, Value>) -> Result<ToolInvocation, McpError> {
        let params: LongRunningTaskTool = parse_arguments(arguments)?;
        let steps = normalize_task_steps(params.steps)?;
        Ok(ToolInvocation::Deferred(Box::new(StepJob { done: 0, steps })))
    }
}

pub struct SystemInfoHandler {
    started_at: Instant,
}

impl SystemInfoHandler {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
        }
    }
}

impl Default for SystemInfoHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolHandler for SystemInfoHandler {
    fn tool(&self) -> Tool {
        SystemInfoTool::tool()
    }

    fn invoke(&self, arguments: Map<String, Value>) -> Result<ToolInvocation, McpError> {
        let params: SystemInfoTool = parse_arguments(arguments)?;
        let cpu_cores = thread::available_parallelism().map_or(1, |cores| cores.get());
        let uptime_ms = self.started_at.elapsed().as_millis() as u64;

        let mut fields = Map::new();
        fields.insert(
            "system".to_string(),
            json!({
                "server": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
                "os": std::env::consts::OS,
                "arch": std::env::consts::ARCH,
                "cpu_cores": cpu_cores,
                "uptime_ms": uptime_ms,
            }),
        );
        if params.include_wifi.unwrap_or(true) {
            fields.insert(
                "wifi".to_string(),
                json!({
                    "mode": "station",
                    "radio": "simulated",
                    "visible_networks": SIMULATED_NETWORKS.len(),
                }),
            );
        }
        if params.include_tasks.unwrap_or(true) {
            let runtime_workers = tokio::runtime::Handle::try_current()
                .ok()
                .map(|handle| handle.metrics().num_workers());
            fields.insert(
                "tasks".to_string(),
                json!({ "runtime_workers": runtime_workers }),
            );
        }
        fields.insert(
            "generated_at_utc".to_string(),
            json!(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
        );

        let summary = format!(
            "{} {} up {uptime_ms} ms",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION")
        );
        Ok(ToolInvocation::Complete(structured_result(summary, fields)))
    }
}

struct ScannedNetwork {
    ssid: &'static str,
    rssi: i8,
    channel: u8,
    bssid: [u8; 6],
}

impl ScannedNetwork {
    fn to_value(&self, options: &ScanOptions) -> Value {
        let mut network = Map::new();
        network.insert("ssid".to_string(), json!(self.ssid));
        if options.include_rssi {
            network.insert("rssi".to_string(), json!(self.rssi));
        }
        if options.include_channel {
            network.insert("channel".to_string(), json!(self.channel));
        }
        if options.include_bssid {
            let bssid = self
                .bssid
                .iter()
                .map(|octet| format!("{octet:02x}"))
                .collect::<Vec<_>>()
                .join(":");
            network.insert("bssid".to_string(), json!(bssid));
        }
        Value::Object(network)
    }
}

// stands in for the radio until a board driver is wired up
const SIMULATED_NETWORKS: &[ScannedNetwork] = &[
    ScannedNetwork {
        ssid: "workshop",
        rssi: -42,
        channel: 6,
        bssid: [0x24, 0x0a, 0xc4, 0x11, 0x22, 0x33],
    },
    ScannedNetwork {
        ssid: "lab-iot",
        rssi: -57,
        channel: 1,
        bssid: [0x24, 0x0a, 0xc4, 0x44, 0x55, 0x66],
    },
    ScannedNetwork {
        ssid: "guest",
        rssi: -68,
        channel: 11,
        bssid: [0x60, 0x01, 0x94, 0x0a, 0x0b, 0x0c],
    },
    ScannedNetwork {
        ssid: "warehouse-ap",
        rssi: -74,
        channel: 6,
        bssid: [0x60, 0x01, 0x94, 0x1d, 0x2e, 0x3f],
    },
    ScannedNetwork {
        ssid: "printer-direct",
        rssi: -81,
        channel: 3,
        bssid: [0xa4, 0xcf, 0x12, 0x9a, 0x8b, 0x7c],
    },
];

#[derive(Debug, Clone, Copy)]
struct ScanOptions {
    max_results: usize,
    include_rssi: bool,
    include_channel: bool,
    include_bssid: bool,
    timeout: Duration,
}

pub struct NetworkScanHandler;

impl ToolHandler for NetworkScanHandler {
    fn tool(&self) -> Tool {
        NetworkScanTool::tool()
    }

    fn invoke(&self, arguments: Map<String, Value>) -> Result<ToolInvocation, McpError> {
        let params: NetworkScanTool = parse_arguments(arguments)?;
        let options = ScanOptions {
            max_results: normalize_scan_results(params.max_results)?,
            include_rssi: params.include_rssi.unwrap_or(false),
            include_channel: params.include_channel.unwrap_or(false),
            include_bssid: params.include_bssid.unwrap_or(false),
            timeout: normalize_scan_timeout(params.timeout_ms)?,
        };
        Ok(ToolInvocation::Deferred(Box::new(ScanJob {
            phase: ScanPhase::Starting,
            options,
        })))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanPhase {
    Starting,
    Scanning,
    Collecting,
}

struct ScanJob {
    phase: ScanPhase,
    options: ScanOptions,
}

#[async_trait]
impl TaskBody for ScanJob {
    async fn step(&mut self, ctx: &TaskContext<'_>) -> Result<TaskStep, McpError> {
        match self.phase {
            ScanPhase::Starting => {
                report(ctx, 0, 100, "Starting WiFi scan...").await?;
                self.phase = ScanPhase::Scanning;
                Ok(TaskStep::Pending)
            }
            ScanPhase::Scanning => {
                report(ctx, 50, 100, "Scanning networks...").await?;
                self.phase = ScanPhase::Collecting;
                Ok(TaskStep::Pending)
            }
            ScanPhase::Collecting => {
                let networks: Vec<Value> = SIMULATED_NETWORKS
                    .iter()
                    .take(self.options.max_results)
                    .map(|network| network.to_value(&self.options))
                    .collect();
                let count = networks.len();
                report(ctx, 100, 100, "WiFi scan completed").await?;
                debug!(count, "network scan finished");

                let fields = Map::from_iter([
                    ("networks".to_string(), json!(networks)),
                    ("count".to_string(), json!(count)),
                    (
                        "generated_at_utc".to_string(),
                        json!(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
                    ),
                ]);
                result_value(structured_result(format!("Found {count} networks"), fields))
                    .map(TaskStep::Complete)
            }
        }
    }

    fn timeout(&self) -> Option<Duration> {
        Some(self.options.timeout)
    }
}

// a request without a progress token still runs to completion
async fn report(
    ctx: &TaskContext<'_>,
    current: u64,
    total: u64,
    message: &str,
) -> Result<(), McpError> {
    match ctx.report_progress(current, total, Some(message)).await {
        Ok(()) | Err(McpError::NoProgressToken) => Ok(()),
        Err(err) => Err(err),
    }
}

struct StepJob {
    done: u32,
    steps: u32,
}

#[async_trait]
impl TaskBody for StepJob {
    async fn step(&mut self, ctx: &TaskContext<'_>) -> Result<TaskStep, McpError> {
        self.done += 1;
        let message = format!("Step {} of {}", self.done, self.steps);
        report(ctx, u64::from(self.done), u64::from(self.steps), &message).await?;

        if self.done < self.steps {
            return Ok(TaskStep::Pending);
        }
        result_value(text_result(format!("Completed {} steps", self.steps))).map(TaskStep::Complete)
    }
}
