//! TCP accept loop and the set of live sessions
//!
//! Each accepted stream becomes one [`Session`] driven on its own tokio task. The manager
//! enforces the connection limit, reaps finished sessions and keeps process-wide totals.

use std::{
    io,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::{Duration, Instant},
};

use tokio::{net::TcpListener, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::domain::tools::ToolRegistry;
use crate::errors::McpError;
use crate::logging::log_session_summary;
use crate::mcp::{Session, SessionConfig, SessionStats};
use crate::transport::{StreamTransport, Transport, TransportConfig};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub sessions_created: u64,
    pub sessions_active: usize,
    pub sessions_rejected: u64,
    pub total_messages: u64,
    pub total_tasks: u64,
}

#[derive(Default)]
struct Totals {
    sessions_created: u64,
    sessions_rejected: u64,
    messages: u64,
    tasks: u64,
}

impl Totals {
    fn absorb(&mut self, stats: &SessionStats) {
        self.messages += stats.messages_received + stats.messages_sent;
        self.tasks += stats.tasks_created;
    }
}

struct ManagedSession {
    id: u64,
    session: Arc<Session>,
    handle: JoinHandle<()>,
}

pub struct SessionManager {
    registry: Arc<ToolRegistry>,
    session_config: SessionConfig,
    transport_config: TransportConfig,
    server_name: String,
    max_connections: usize,
    sessions: Mutex<Vec<ManagedSession>>,
    totals: Mutex<Totals>,
    next_id: AtomicU64,
    shutdown: CancellationToken,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SessionManager {
    pub fn new(
        registry: Arc<ToolRegistry>,
        session_config: SessionConfig,
        transport_config: TransportConfig,
        server_name: impl Into<String>,
        max_connections: usize,
    ) -> Self {
        Self {
            registry,
            session_config,
            transport_config,
            server_name: server_name.into(),
            max_connections,
            sessions: Mutex::new(Vec::new()),
            totals: Mutex::new(Totals::default()),
            next_id: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn from_config(config: &Config, registry: Arc<ToolRegistry>) -> Self {
        Self::new(
            registry,
            config.session.clone(),
            config.transport(),
            config.server_name.clone(),
            config.max_connections,
        )
    }

    pub fn transport_config(&self) -> TransportConfig {
        self.transport_config
    }

    pub fn start_session(&self, transport: Arc<dyn Transport>) -> Result<u64, McpError> {
        if self.shutdown.is_cancelled() {
            return Err(McpError::InvalidState("server is shutting down".to_string()));
        }
        self.cleanup_inactive();
        if self.active_sessions() >= self.max_connections {
            lock(&self.totals).sessions_rejected += 1;
            return Err(McpError::ResourceLimit(format!(
                "{} sessions already active",
                self.max_connections
            )));
        }

        let session = Arc::new(Session::new(
            transport,
            self.session_config.clone(),
            Arc::clone(&self.registry),
        ));
        session.set_server_info(self.server_name.clone(), env!("CARGO_PKG_VERSION"));
        session.initialize()?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = tokio::spawn({
            let session = Arc::clone(&session);
            async move {
                let started_at = Instant::now();
                if let Err(err) = session.run().await {
                    error!(session_id = id, error = %err, "session ended with error");
                }
                log_session_summary(session.peer(), &session.stats(), started_at.elapsed());
            }
        });

        info!(session_id = id, peer = %session.peer(), "session started");
        lock(&self.totals).sessions_created += 1;
        lock(&self.sessions).push(ManagedSession {
            id,
            session,
            handle,
        });
        Ok(id)
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> io::Result<()> {
        info!(
            local_addr = %listener.local_addr()?,
            framing = %self.transport_config.framing,
            max_connections = self.max_connections,
            "accepting MCP connections"
        );

        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            let stream = match accepted {
                Ok((stream, addr)) => {
                    debug!(peer = %addr, "connection accepted");
                    stream
                }
                Err(err) => {
                    warn!(error = %err, "accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };

            let transport: Arc<dyn Transport> =
                match StreamTransport::from_tcp(stream, self.transport_config) {
                    Ok(transport) => Arc::new(transport),
                    Err(err) => {
                        warn!(error = %err, "failed to set up connection");
                        continue;
                    }
                };
            if let Err(err) = self.start_session(Arc::clone(&transport)) {
                warn!(peer = %transport.peer(), error = %err, "connection rejected");
                transport.close().await;
            }
        }

        Ok(())
    }

    pub fn cleanup_inactive(&self) -> usize {
        let finished: Vec<ManagedSession> = {
            let mut sessions = lock(&self.sessions);
            let (finished, live) = std::mem::take(&mut *sessions)
                .into_iter()
                .partition(|managed| managed.handle.is_finished());
            *sessions = live;
            finished
        };

        let mut totals = lock(&self.totals);
        for managed in &finished {
            totals.absorb(&managed.session.stats());
            debug!(session_id = managed.id, "session reaped");
        }
        finished.len()
    }

    pub fn active_sessions(&self) -> usize {
        lock(&self.sessions).len()
    }

    pub fn stats(&self) -> ServerStats {
        let sessions = lock(&self.sessions);
        let totals = lock(&self.totals);
        let mut stats = ServerStats {
            sessions_created: totals.sessions_created,
            sessions_active: sessions.len(),
            sessions_rejected: totals.sessions_rejected,
            total_messages: totals.messages,
            total_tasks: totals.tasks,
        };
        for managed in sessions.iter() {
            let session_stats = managed.session.stats();
            stats.total_messages += session_stats.messages_received + session_stats.messages_sent;
            stats.total_tasks += session_stats.tasks_created;
        }
        stats
    }

    pub async fn shutdown_all(&self) {
        self.shutdown.cancel();
        let sessions = std::mem::take(&mut *lock(&self.sessions));
        let count = sessions.len();

        for managed in sessions {
            managed.session.shutdown().await;
            let mut handle = managed.handle;
            if tokio::time::timeout(self.session_config.shutdown_timeout, &mut handle)
                .await
                .is_err()
            {
                warn!(session_id = managed.id, "session task did not finish, aborting");
                handle.abort();
            }
            lock(&self.totals).absorb(&managed.session.stats());
        }
        info!(sessions = count, "all sessions shut down");
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};
    use tokio::io::{duplex, split, AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
    use tokio::net::TcpStream;

    use super::*;
    use crate::errors::codes;
    use crate::mcp::SessionState;
    use crate::transport::Framing;

    fn manager(max_connections: usize) -> Arc<SessionManager> {
        Arc::new(SessionManager::new(
            Arc::new(ToolRegistry::with_default_tools().expect("registry")),
            SessionConfig::default(),
            TransportConfig::new(Framing::Newline),
            "test-device",
            max_connections,
        ))
    }

    fn pipe() -> (Arc<dyn Transport>, DuplexStream) {
        let (server, client) = duplex(16 * 1024);
        let (read, write) = split(server);
        let config = TransportConfig::new(Framing::Newline);
        let transport = StreamTransport::new(read, write, "pipe", config);
        (Arc::new(transport), client)
    }

    #[tokio::test]
    async fn enforces_connection_limit() {
        let manager = manager(1);
        let (first, _first_client) = pipe();
        let (second, _second_client) = pipe();

        manager.start_session(first).expect("first session");
        let error = manager.start_session(second).expect_err("over limit");
        assert_eq!(error.code(), codes::RESOURCE_LIMIT);

        let stats = manager.stats();
        assert_eq!(stats.sessions_created, 1);
        assert_eq!(stats.sessions_rejected, 1);
        manager.shutdown_all().await;
    }

    #[tokio::test]
    async fn reaps_sessions_whose_peer_left() {
        let manager = manager(2);
        let (transport, client) = pipe();
        manager.start_session(transport).expect("session");
        drop(client);

        for _ in 0..50 {
            if manager.cleanup_inactive() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(manager.active_sessions(), 0);
    }

    #[tokio::test]
    async fn shutdown_all_stops_sessions_and_refuses_new_ones() {
        let manager = manager(2);
        let (transport, _client) = pipe();
        manager.start_session(transport).expect("session");
        let session = Arc::clone(&lock(&manager.sessions)[0].session);

        manager.shutdown_all().await;
        assert_eq!(session.state(), SessionState::Shutdown);
        assert_eq!(manager.active_sessions(), 0);

        let (late, _late_client) = pipe();
        assert!(manager.start_session(late).is_err());
    }

    #[tokio::test]
    async fn serves_initialize_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let manager = manager(3);
        let server = tokio::spawn(Arc::clone(&manager).serve(listener));

        let stream = TcpStream::connect(addr).await.expect("connect");
        let (read, mut write) = stream.into_split();
        write
            .write_all(
                concat!(
                    r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":"#,
                    r#"{"protocolVersion":"2024-11-05","clientInfo":{"name":"t","version":"1"}}}"#,
                    "\n",
                )
                .as_bytes(),
            )
            .await
            .expect("write");

        let mut lines = BufReader::new(read).lines();
        let line = tokio::time::timeout(Duration::from_secs(5), lines.next_line())
            .await
            .expect("response in time")
            .expect("read")
            .expect("line");
        let response: Value = serde_json::from_str(&line).expect("json");
        assert_eq!(response["id"], json!(1));
        assert_eq!(response["result"]["serverInfo"]["name"], json!("test-device"));

        manager.shutdown_all().await;
        server.await.expect("join").expect("serve");
    }
}
