//! One client connection's protocol lifecycle
//!
//! A [`Session`] owns its transport exclusively. [`Session::initialize`] starts the worker
//! tasks (message processor, task manager, optional keep-alive), [`Session::run`] pumps the
//! receive loop until shutdown is requested or the transport dies, and
//! [`Session::shutdown`] cancels pending tasks and closes the transport.
//!
//! ```text
//! UNINITIALIZED -> INITIALIZING -> INITIALIZED -> ACTIVE -> SHUTTING_DOWN -> SHUTDOWN
//!        \______________\_______________\___________\____________\-> ERROR_STATE -> SHUTDOWN
//! ```

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, RwLock,
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_mcp_sdk::schema::{Implementation, ServerCapabilities, ServerCapabilitiesTools};
use serde_json::{Map, Value};
use tokio::{
    sync::mpsc::{self, error::SendTimeoutError},
    task::JoinHandle,
    time::{timeout, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::domain::tools::ToolRegistry;
use crate::errors::{McpError, TransportError};
use crate::mcp::dispatcher;
use crate::mcp::executor::{AsyncTask, ExecutorStats, MessageSink, TaskExecutor};
use crate::mcp::methods::{ClientInfo, METHOD_PING};
use crate::mcp::rpc::{Message, MessageId, Notification, Request, Response};
use crate::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Uninitialized,
    Initializing,
    Initialized,
    Active,
    ShuttingDown,
    Shutdown,
    ErrorState,
}

impl SessionState {
    pub const ALL: [SessionState; 7] = [
        Self::Uninitialized,
        Self::Initializing,
        Self::Initialized,
        Self::Active,
        Self::ShuttingDown,
        Self::Shutdown,
        Self::ErrorState,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uninitialized => "UNINITIALIZED",
            Self::Initializing => "INITIALIZING",
            Self::Initialized => "INITIALIZED",
            Self::Active => "ACTIVE",
            Self::ShuttingDown => "SHUTTING_DOWN",
            Self::Shutdown => "SHUTDOWN",
            Self::ErrorState => "ERROR_STATE",
        }
    }

    pub fn can_transition_to(self, to: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, to),
            (Uninitialized, Initializing | ErrorState)
                | (Initializing, Initialized | ErrorState)
                | (Initialized, Active | ErrorState)
                | (Active, ShuttingDown | ErrorState)
                | (ShuttingDown, Shutdown | ErrorState)
                | (ErrorState, Shutdown)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub max_pending_tasks: usize,
    pub task_stack_size: usize,
    pub message_queue_depth: usize,
    pub task_timeout: Duration,
    pub session_timeout: Duration,
    pub task_priority: u8,
    pub enable_progress_reporting: bool,
    pub enable_tools_pagination: bool,
    pub task_tick_interval: Duration,
    pub receive_poll: Duration,
    pub queue_send_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub completed_history: usize,
    pub enable_keep_alive: bool,
    pub keep_alive_interval: Duration,
    pub keep_alive_idle: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_pending_tasks: 8,
            task_stack_size: 2048,
            message_queue_depth: 16,
            task_timeout: Duration::from_millis(30_000),
            session_timeout: Duration::from_millis(300_000),
            task_priority: 3,
            enable_progress_reporting: true,
            enable_tools_pagination: false,
            task_tick_interval: Duration::from_millis(50),
            receive_poll: Duration::from_millis(1_000),
            queue_send_timeout: Duration::from_millis(100),
            shutdown_timeout: Duration::from_millis(5_000),
            completed_history: 10,
            enable_keep_alive: true,
            keep_alive_interval: Duration::from_millis(30_000),
            keep_alive_idle: Duration::from_millis(60_000),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStats {
    pub messages_received: u64,
    pub messages_sent: u64,
    pub tasks_created: u64,
    pub tasks_completed: u64,
    pub tasks_cancelled: u64,
    pub errors: u64,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

struct Activity {
    at: DateTime<Utc>,
    instant: Instant,
}

impl Activity {
    fn now() -> Self {
        Self {
            at: Utc::now(),
            instant: Instant::now(),
        }
    }
}

pub(crate) struct SessionInfo {
    pub(crate) server_info: Implementation,
    pub(crate) capabilities: ServerCapabilities,
    pub(crate) tool_names: Vec<String>,
    pub(crate) client_info: Option<ClientInfo>,
    pub(crate) initialize_received: bool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub(crate) struct SessionShared {
    pub(crate) config: SessionConfig,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) registry: Arc<ToolRegistry>,
    pub(crate) executor: TaskExecutor,
    pub(crate) info: RwLock<SessionInfo>,
    state: Mutex<SessionState>,
    messages_received: AtomicU64,
    messages_sent: AtomicU64,
    errors: AtomicU64,
    started_at: DateTime<Utc>,
    activity: Mutex<Activity>,
    keep_alive_seq: AtomicU64,
    cancel: CancellationToken,
}

impl SessionShared {
    pub(crate) fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    pub(crate) fn transition(&self, to: SessionState) -> Result<(), McpError> {
        let mut state = lock(&self.state);
        let from = *state;
        if !from.can_transition_to(to) {
            let peer = self.transport.peer();
            warn!(peer = %peer, from = %from, to = %to, "rejected state transition");
            return Err(McpError::InvalidState(format!("{from} -> {to} is not allowed")));
        }
        *state = to;
        info!(peer = %self.transport.peer(), from = %from, to = %to, "session state changed");
        Ok(())
    }

    pub(crate) fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    fn touch(&self) {
        *lock(&self.activity) = Activity::now();
    }

    fn idle_for(&self) -> Duration {
        lock(&self.activity).instant.elapsed()
    }

    pub(crate) fn stats(&self) -> SessionStats {
        let ExecutorStats {
            created,
            completed,
            failed,
            cancelled,
            ..
        } = self.executor.stats();
        SessionStats {
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            tasks_created: created,
            tasks_completed: completed + failed,
            tasks_cancelled: cancelled,
            errors: self.errors.load(Ordering::Relaxed),
            started_at: self.started_at,
            last_activity: lock(&self.activity).at,
        }
    }

    pub(crate) async fn send_response(&self, response: Response) {
        if response.is_error() {
            self.record_error();
        }
        let id = response.id.clone();
        if let Err(err) = self.send_message(&Message::Response(response)).await {
            let peer = self.transport.peer();
            warn!(peer = %peer, request_id = %id, error = %err, "failed to send response");
        }
    }

    async fn handle_frame(&self, frame: &[u8], queue: &mpsc::Sender<Message>) -> bool {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.touch();

        let message = match Message::parse(frame) {
            Ok(message) => message,
            Err(rejection) => {
                debug!(peer = %self.transport.peer(), error = %rejection.error, "rejected frame");
                if rejection.reply {
                    self.send_response(rejection.into_response()).await;
                } else {
                    self.record_error();
                }
                return true;
            }
        };

        match queue
            .send_timeout(message, self.config.queue_send_timeout)
            .await
        {
            Ok(()) => true,
            Err(SendTimeoutError::Timeout(Message::Request(request))) => {
                let peer = self.transport.peer();
                warn!(peer = %peer, request_id = %request.id, "message queue full");
                let error = McpError::ResourceLimit("message queue is full".to_string());
                self.send_response(Response::from_error(request.id, &error)).await;
                true
            }
            Err(SendTimeoutError::Timeout(_)) => {
                warn!(peer = %self.transport.peer(), "message queue full, dropping message");
                self.record_error();
                true
            }
            Err(SendTimeoutError::Closed(_)) => false,
        }
    }

    async fn send_keep_alive(&self) {
        let seq = self.keep_alive_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let ping = Request::new(
            MessageId::String(format!("keepalive-{seq}")),
            METHOD_PING,
            Map::new(),
        );
        debug!(peer = %self.transport.peer(), seq, "sending keep-alive ping");
        if let Err(err) = self.send_message(&Message::Request(ping)).await {
            warn!(peer = %self.transport.peer(), error = %err, "keep-alive ping failed");
        }
    }
}

#[async_trait]
impl MessageSink for SessionShared {
    async fn send_message(&self, message: &Message) -> Result<(), McpError> {
        let payload = message.to_bytes()?;
        match self.transport.send(&payload).await {
            Ok(()) => {
                self.messages_sent.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(err) => {
                self.record_error();
                if err.is_fatal() {
                    self.cancel.cancel();
                }
                Err(err.into())
            }
        }
    }
}

pub struct Session {
    shared: Arc<SessionShared>,
    queue_tx: mpsc::Sender<Message>,
    queue_rx: Mutex<Option<mpsc::Receiver<Message>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutdown_started: AtomicBool,
}

impl Session {
    pub fn new(
        transport: Arc<dyn Transport>,
        config: SessionConfig,
        registry: Arc<ToolRegistry>,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(config.message_queue_depth.max(1));
        let info = SessionInfo {
            server_info: Implementation {
                name: env!("CARGO_PKG_NAME").to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                title: None,
                description: None,
                icons: vec![],
                website_url: None,
            },
            capabilities: ServerCapabilities {
                tools: Some(ServerCapabilitiesTools {
                    list_changed: Some(false),
                }),
                ..Default::default()
            },
            tool_names: registry.names(),
            client_info: None,
            initialize_received: false,
        };

        let shared = Arc::new(SessionShared {
            executor: TaskExecutor::new(config.max_pending_tasks, config.completed_history),
            config,
            transport,
            registry,
            info: RwLock::new(info),
            state: Mutex::new(SessionState::Uninitialized),
            messages_received: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            started_at: Utc::now(),
            activity: Mutex::new(Activity::now()),
            keep_alive_seq: AtomicU64::new(0),
            cancel: CancellationToken::new(),
        });

        Self {
            shared,
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            workers: Mutex::new(Vec::new()),
            shutdown_started: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn transition(&self, to: SessionState) -> Result<(), McpError> {
        self.shared.transition(to)
    }

    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    pub fn peer(&self) -> &str {
        self.shared.transport.peer()
    }

    pub fn stats(&self) -> SessionStats {
        self.shared.stats()
    }

    pub fn is_terminated(&self) -> bool {
        self.state() == SessionState::Shutdown
    }

    pub fn initialize(&self) -> Result<(), McpError> {
        self.shared.transition(SessionState::Initializing)?;

        let Some(queue_rx) = lock(&self.queue_rx).take() else {
            self.shared.transition(SessionState::ErrorState)?;
            return Err(McpError::TaskCreationFailed(
                "message queue already consumed".to_string(),
            ));
        };

        let config = &self.shared.config;
        info!(
            peer = %self.peer(),
            max_pending_tasks = config.max_pending_tasks,
            queue_depth = config.message_queue_depth,
            task_stack_size = config.task_stack_size,
            task_priority = config.task_priority,
            keep_alive = config.enable_keep_alive,
            "starting session workers"
        );

        let mut workers = lock(&self.workers);
        workers.push(tokio::spawn(process_messages(
            Arc::clone(&self.shared),
            queue_rx,
        )));
        workers.push(tokio::spawn(manage_tasks(Arc::clone(&self.shared))));
        if config.enable_keep_alive {
            workers.push(tokio::spawn(keep_alive(Arc::clone(&self.shared))));
        }
        drop(workers);

        self.shared.transition(SessionState::Initialized)
    }

    pub async fn run(&self) -> Result<(), McpError> {
        let state = self.state();
        if !matches!(state, SessionState::Initialized | SessionState::Active) {
            return Err(McpError::InvalidState(format!("cannot run a session in {state}")));
        }

        let shared = &self.shared;
        let cancel = shared.cancel.clone();
        loop {
            if shared.idle_for() > shared.config.session_timeout {
                warn!(peer = %self.peer(), "session timed out");
                break;
            }

            let received = tokio::select! {
                _ = cancel.cancelled() => break,
                received = shared.transport.receive(shared.config.receive_poll) => received,
            };

            match received {
                Ok(Some(frame)) => {
                    if !shared.handle_frame(&frame, &self.queue_tx).await {
                        break;
                    }
                }
                Ok(None) | Err(TransportError::Timeout) => continue,
                Err(
                    err @ (TransportError::MessageTooLarge { .. }
                    | TransportError::BufferOverflow { .. }
                    | TransportError::InvalidFrame(_)),
                ) => {
                    warn!(peer = %self.peer(), error = %err, "dropped malformed frame");
                    shared.touch();
                    let error = McpError::from(err);
                    shared
                        .send_response(Response::from_error(MessageId::Absent, &error))
                        .await;
                }
                Err(TransportError::HttpProbe) => {
                    warn!(peer = %self.peer(), "HTTP request on MCP socket, closing connection");
                    shared.record_error();
                    break;
                }
                Err(err) => {
                    info!(peer = %self.peer(), error = %err, "transport lost");
                    break;
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    // idempotent; workers still running after shutdown_timeout are aborted
    pub async fn shutdown(&self) {
        if self.shutdown_started.swap(true, Ordering::SeqCst) {
            return;
        }

        let shared = &self.shared;
        match shared.state() {
            SessionState::Active => {
                let _ = shared.transition(SessionState::ShuttingDown);
            }
            SessionState::ShuttingDown | SessionState::ErrorState | SessionState::Shutdown => {}
            _ => {
                let _ = shared.transition(SessionState::ErrorState);
            }
        }

        let cancelled = shared.executor.shutdown();
        shared.cancel.cancel();
        shared.transport.close().await;

        let workers = std::mem::take(&mut *lock(&self.workers));
        let deadline = tokio::time::Instant::now() + shared.config.shutdown_timeout;
        for mut worker in workers {
            if timeout(
                deadline.saturating_duration_since(tokio::time::Instant::now()),
                &mut worker,
            )
            .await
            .is_err()
            {
                error!(peer = %self.peer(), "worker did not stop in time, aborting");
                worker.abort();
            }
        }

        if shared.state() != SessionState::Shutdown {
            let _ = shared.transition(SessionState::Shutdown);
        }
        let stats = shared.stats();
        info!(
            peer = %self.peer(),
            cancelled_tasks = cancelled,
            messages_received = stats.messages_received,
            messages_sent = stats.messages_sent,
            errors = stats.errors,
            "session shut down"
        );
    }

    pub fn set_server_info(&self, name: impl Into<String>, version: impl Into<String>) {
        if let Ok(mut info) = self.shared.info.write() {
            info.server_info.name = name.into();
            info.server_info.version = version.into();
        }
    }

    pub fn set_server_capabilities(&self, capabilities: ServerCapabilities) {
        if let Ok(mut info) = self.shared.info.write() {
            info.capabilities = capabilities;
        }
    }

    pub fn add_tool(&self, name: &str) -> Result<(), McpError> {
        if !self.shared.registry.contains(name) {
            return Err(McpError::ToolNotFound(name.to_string()));
        }
        let mut info = self
            .shared
            .info
            .write()
            .map_err(|_| McpError::ResourceLock)?;
        if info.tool_names.iter().any(|existing| existing == name) {
            return Err(McpError::InvalidOperation(format!(
                "tool {name} already enabled"
            )));
        }
        info.tool_names.push(name.to_string());
        Ok(())
    }

    pub fn remove_tool(&self, name: &str) -> bool {
        let Ok(mut info) = self.shared.info.write() else {
            return false;
        };
        let before = info.tool_names.len();
        info.tool_names.retain(|existing| existing != name);
        before != info.tool_names.len()
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.shared
            .info
            .read()
            .map(|info| info.tool_names.clone())
            .unwrap_or_default()
    }

    pub fn submit_task(&self, task: AsyncTask) -> Result<(), McpError> {
        self.shared.executor.submit(task).map(|_| ())
    }

    pub fn cancel_task(&self, request_id: &MessageId) -> bool {
        self.shared.executor.cancel(request_id)
    }

    pub fn pending_task_count(&self) -> usize {
        self.shared.executor.pending_count()
    }

    pub async fn send_message(&self, message: &Message) -> Result<(), McpError> {
        self.shared.send_message(message).await
    }

    pub async fn send_notification(
        &self,
        method: &str,
        params: Map<String, Value>,
    ) -> Result<(), McpError> {
        self.shared
            .send_message(&Message::Notification(Notification::new(method, params)))
            .await
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
        for worker in lock(&self.workers).drain(..) {
            worker.abort();
        }
    }
}

async fn process_messages(shared: Arc<SessionShared>, mut queue: mpsc::Receiver<Message>) {
    loop {
        let message = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            message = queue.recv() => message,
        };
        match message {
            Some(message) => dispatcher::dispatch(&shared, message).await,
            None => break,
        }
    }
    debug!(peer = %shared.transport.peer(), "message processor stopped");
}

async fn manage_tasks(shared: Arc<SessionShared>) {
    let mut interval = tokio::time::interval(shared.config.task_tick_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            _ = interval.tick() => shared.executor.tick(shared.as_ref()).await,
        }
    }
    debug!(peer = %shared.transport.peer(), "task manager stopped");
}

async fn keep_alive(shared: Arc<SessionShared>) {
    let mut interval = tokio::time::interval(shared.config.keep_alive_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick completes immediately
    interval.tick().await;
    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            _ = interval.tick() => {
                if shared.idle_for() > shared.config.keep_alive_idle {
                    shared.send_keep_alive().await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{duplex, split, DuplexStream};

    use super::*;
    use crate::transport::{Framing, StreamTransport, TransportConfig};

    fn session_with(config: SessionConfig) -> (Session, DuplexStream) {
        let (server, client) = duplex(16 * 1024);
        let (read, write) = split(server);
        let transport_config = TransportConfig::new(Framing::Newline);
        let transport = StreamTransport::new(read, write, "test", transport_config);
        let registry = Arc::new(ToolRegistry::with_default_tools().expect("registry"));
        (Session::new(Arc::new(transport), config, registry), client)
    }

    #[test]
    fn transition_table_is_a_strict_allow_list() {
        use SessionState::*;
        let allowed = [
            (Uninitialized, Initializing),
            (Uninitialized, ErrorState),
            (Initializing, Initialized),
            (Initializing, ErrorState),
            (Initialized, Active),
            (Initialized, ErrorState),
            (Active, ShuttingDown),
            (Active, ErrorState),
            (ShuttingDown, Shutdown),
            (ShuttingDown, ErrorState),
            (ErrorState, Shutdown),
        ];
        for from in SessionState::ALL {
            for to in SessionState::ALL {
                assert_eq!(
                    from.can_transition_to(to),
                    allowed.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[tokio::test]
    async fn rejected_transition_keeps_state() {
        let (session, _client) = session_with(SessionConfig::default());
        let error = session
            .transition(SessionState::Active)
            .expect_err("skip ahead");
        assert!(matches!(error, McpError::InvalidState(_)));
        assert_eq!(session.state(), SessionState::Uninitialized);

        session
            .transition(SessionState::Initializing)
            .expect("allowed");
        assert_eq!(session.state(), SessionState::Initializing);
    }

    #[tokio::test]
    async fn initialize_starts_workers_once() {
        let (session, _client) = session_with(SessionConfig::default());
        session.initialize().expect("initialize");
        assert_eq!(session.state(), SessionState::Initialized);

        assert!(session.initialize().is_err());
        assert_eq!(session.state(), SessionState::Initialized);
        session.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_before_activation_goes_through_error_state() {
        let (session, _client) = session_with(SessionConfig::default());
        session.initialize().expect("initialize");

        session.shutdown().await;
        assert_eq!(session.state(), SessionState::Shutdown);
        session.shutdown().await;
        assert_eq!(session.state(), SessionState::Shutdown);
        assert!(session.is_terminated());
    }

    #[tokio::test]
    async fn add_tool_requires_registry_entry() {
        let (session, _client) = session_with(SessionConfig::default());
        assert!(session.remove_tool("echo"));
        session.add_tool("echo").expect("re-enable");
        assert_eq!(
            session.add_tool("echo").expect_err("duplicate").code(),
            crate::errors::codes::INVALID_OPERATION
        );
        assert_eq!(
            session.add_tool("wifi_scan").expect_err("unknown").code(),
            crate::errors::codes::TOOL_NOT_FOUND
        );
    }

    #[tokio::test]
    async fn run_requires_initialize() {
        let (session, _client) = session_with(SessionConfig::default());
        assert!(matches!(
            session.run().await,
            Err(McpError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn stats_start_empty() {
        let (session, _client) = session_with(SessionConfig::default());
        let stats = session.stats();
        assert_eq!(stats.messages_received, 0);
        assert_eq!(stats.tasks_created, 0);
        assert!(stats.last_activity >= stats.started_at);
    }
}
