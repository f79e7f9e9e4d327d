//! Cooperative executor for tool calls that outlive a single dispatch
//!
//! Tasks sit in a bounded pending table keyed by request id. Every tick the executor
//! retires finished or cancelled tasks into a bounded history, force-cancels tasks past
//! their deadline, and runs one step of every other task. Table mutations happen under a
//! short-lived lock; task steps and outgoing messages run outside it.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::errors::McpError;
use crate::mcp::methods::METHOD_PROGRESS;
use crate::mcp::rpc::{Message, MessageId, Notification, Response};

#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn send_message(&self, message: &Message) -> Result<(), McpError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskStep {
    Pending,
    Complete(Value),
}

// `step` must do a bounded amount of work and return
#[async_trait]
pub trait TaskBody: Send {
    async fn step(&mut self, ctx: &TaskContext<'_>) -> Result<TaskStep, McpError>;

    // overrides the session's task timeout
    fn timeout(&self) -> Option<Duration> {
        None
    }
}

pub struct TaskContext<'a> {
    task: &'a AsyncTask,
    sink: &'a dyn MessageSink,
}

impl TaskContext<'_> {
    pub fn is_cancelled(&self) -> bool {
        self.task.is_cancelled()
    }

    pub async fn report_progress(
        &self,
        current: u64,
        total: u64,
        message: Option<&str>,
    ) -> Result<(), McpError> {
        self.task
            .report_progress(self.sink, current, total, message)
            .await
    }
}

pub struct AsyncTask {
    request_id: MessageId,
    method: String,
    progress_token: Option<String>,
    cancelled: AtomicBool,
    finished: AtomicBool,
    failed: AtomicBool,
    started_at: Instant,
    timeout: Duration,
    body: tokio::sync::Mutex<Box<dyn TaskBody>>,
}

impl std::fmt::Debug for AsyncTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncTask")
            .field("request_id", &self.request_id)
            .field("method", &self.method)
            .field("progress_token", &self.progress_token)
            .field("cancelled", &self.cancelled)
            .field("finished", &self.finished)
            .field("failed", &self.failed)
            .field("started_at", &self.started_at)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl AsyncTask {
    pub fn new(
        request_id: MessageId,
        method: impl Into<String>,
        progress_token: Option<String>,
        timeout: Duration,
        body: Box<dyn TaskBody>,
    ) -> Self {
        Self {
            request_id,
            method: method.into(),
            progress_token,
            cancelled: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            started_at: Instant::now(),
            timeout,
            body: tokio::sync::Mutex::new(body),
        }
    }

    pub fn request_id(&self) -> &MessageId {
        &self.request_id
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn progress_token(&self) -> Option<&str> {
        self.progress_token.as_deref()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn is_timed_out(&self) -> bool {
        self.elapsed() > self.timeout
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub async fn execute(&self, sink: &dyn MessageSink) -> Result<TaskStep, McpError> {
        if self.is_cancelled() {
            return Err(McpError::Cancelled);
        }
        if self.is_finished() {
            return Err(McpError::InvalidOperation("task already finished".to_string()));
        }

        let mut body = self.body.try_lock().map_err(|_| McpError::ResourceLock)?;
        let ctx = TaskContext { task: self, sink };
        let step = body.step(&ctx).await;

        if self.is_cancelled() {
            return Err(McpError::Cancelled);
        }
        match step {
            Ok(TaskStep::Pending) => Ok(TaskStep::Pending),
            Ok(TaskStep::Complete(result)) => {
                self.finished.store(true, Ordering::SeqCst);
                Ok(TaskStep::Complete(result))
            }
            Err(err) => {
                self.failed.store(true, Ordering::SeqCst);
                self.finished.store(true, Ordering::SeqCst);
                Err(err)
            }
        }
    }

    pub async fn report_progress(
        &self,
        sink: &dyn MessageSink,
        current: u64,
        total: u64,
        message: Option<&str>,
    ) -> Result<(), McpError> {
        if self.is_cancelled() || self.is_finished() {
            return Err(McpError::Cancelled);
        }
        let Some(token) = self.progress_token.as_deref() else {
            return Err(McpError::NoProgressToken);
        };

        let mut params = Map::new();
        params.insert("progressToken".to_string(), Value::String(token.to_string()));
        params.insert("progress".to_string(), Value::from(current));
        params.insert("total".to_string(), Value::from(total));
        if let Some(message) = message {
            params.insert("message".to_string(), Value::String(message.to_string()));
        }

        sink.send_message(&Message::Notification(Notification::new(METHOD_PROGRESS, params)))
            .await
    }

    fn outcome(&self) -> TaskOutcome {
        if self.is_cancelled() {
            TaskOutcome::Cancelled
        } else if self.failed.load(Ordering::SeqCst) {
            TaskOutcome::Failed
        } else {
            TaskOutcome::Completed
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedTask {
    pub request_id: MessageId,
    pub method: String,
    pub outcome: TaskOutcome,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutorStats {
    pub created: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub timed_out: u64,
}

#[derive(Default)]
struct TaskTable {
    pending: HashMap<String, Arc<AsyncTask>>,
    completed: VecDeque<CompletedTask>,
    stats: ExecutorStats,
}

impl TaskTable {
    fn retire(&mut self, key: &str, outcome: TaskOutcome, history_limit: usize) {
        let Some(task) = self.pending.remove(key) else {
            return;
        };
        match outcome {
            TaskOutcome::Completed => self.stats.completed += 1,
            TaskOutcome::Failed => self.stats.failed += 1,
            TaskOutcome::Cancelled => self.stats.cancelled += 1,
            TaskOutcome::TimedOut => {
                self.stats.timed_out += 1;
                self.stats.cancelled += 1;
            }
        }

        if history_limit == 0 {
            return;
        }
        while self.completed.len() >= history_limit {
            self.completed.pop_front();
        }
        self.completed.push_back(CompletedTask {
            request_id: task.request_id.clone(),
            method: task.method.clone(),
            outcome,
            elapsed: task.elapsed(),
        });
    }
}

pub struct TaskExecutor {
    table: Mutex<TaskTable>,
    max_pending: usize,
    history_limit: usize,
}

impl TaskExecutor {
    pub fn new(max_pending: usize, history_limit: usize) -> Self {
        Self {
            table: Mutex::new(TaskTable::default()),
            max_pending,
            history_limit,
        }
    }

    fn lock(&self) -> MutexGuard<'_, TaskTable> {
        // a panicked holder cannot leave the table half-mutated: every mutation is a
        // single insert/remove
        self.table
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn submit(&self, task: AsyncTask) -> Result<Arc<AsyncTask>, McpError> {
        let key = task.request_id.task_key();
        let mut table = self.lock();

        if table.pending.len() >= self.max_pending {
            return Err(McpError::ResourceLimit(format!(
                "{} tasks already pending",
                self.max_pending
            )));
        }
        if table.pending.contains_key(&key) {
            return Err(McpError::InvalidOperation(format!(
                "request {key} already has a pending task"
            )));
        }

        let task = Arc::new(task);
        table.pending.insert(key, Arc::clone(&task));
        table.stats.created += 1;
        debug!(
            request_id = %task.request_id,
            method = %task.method,
            pending = table.pending.len(),
            "task submitted"
        );
        Ok(task)
    }

    pub fn cancel(&self, request_id: &MessageId) -> bool {
        let table = self.lock();
        match table.pending.get(&request_id.task_key()) {
            // already answered; it retires as completed on the next tick
            Some(task) if task.is_finished() => false,
            Some(task) => {
                task.cancel();
                true
            }
            None => false,
        }
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn stats(&self) -> ExecutorStats {
        self.lock().stats
    }

    pub fn completed(&self) -> Vec<CompletedTask> {
        self.lock().completed.iter().cloned().collect()
    }

    pub async fn tick(&self, sink: &dyn MessageSink) {
        let (runnable, expired) = {
            let mut table = self.lock();
            let mut runnable = Vec::new();
            let mut expired = Vec::new();
            let keys: Vec<String> = table.pending.keys().cloned().collect();

            for key in keys {
                let Some(task) = table.pending.get(&key).cloned() else {
                    continue;
                };
                if task.is_cancelled() || task.is_finished() {
                    let outcome = task.outcome();
                    table.retire(&key, outcome, self.history_limit);
                } else if task.is_timed_out() {
                    task.cancel();
                    table.retire(&key, TaskOutcome::TimedOut, self.history_limit);
                    expired.push(task);
                } else {
                    runnable.push(task);
                }
            }
            (runnable, expired)
        };

        for task in expired {
            warn!(
                request_id = %task.request_id,
                method = %task.method,
                elapsed_ms = task.elapsed().as_millis() as u64,
                "task timed out"
            );
            let response = Response::from_error(task.request_id.clone(), &McpError::Timeout);
            if let Err(err) = sink.send_message(&Message::Response(response)).await {
                let request_id = &task.request_id;
                warn!(request_id = %request_id, error = %err, "failed to send timeout response");
            }
        }

        for task in runnable {
            let response = match task.execute(sink).await {
                Ok(TaskStep::Pending) => continue,
                Ok(TaskStep::Complete(result)) => {
                    info!(
                        request_id = %task.request_id,
                        method = %task.method,
                        elapsed_ms = task.elapsed().as_millis() as u64,
                        "task completed"
                    );
                    Response::result(task.request_id.clone(), result)
                }
                Err(McpError::Cancelled) => {
                    debug!(request_id = %task.request_id, "task observed cancellation");
                    continue;
                }
                Err(McpError::ResourceLock) => continue,
                Err(err) => {
                    warn!(request_id = %task.request_id, error = %err, "task failed");
                    Response::from_error(task.request_id.clone(), &err)
                }
            };
            if let Err(err) = sink.send_message(&Message::Response(response)).await {
                warn!(request_id = %task.request_id, error = %err, "failed to send task response");
            }
        }
    }

    pub fn shutdown(&self) -> usize {
        let mut table = self.lock();
        let keys: Vec<String> = table.pending.keys().cloned().collect();
        for key in &keys {
            if let Some(task) = table.pending.get(key) {
                task.cancel();
            }
            table.retire(key, TaskOutcome::Cancelled, self.history_limit);
        }
        keys.len()
    }
}
