use std::time::Duration;

use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use crate::mcp::SessionStats;

pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

pub fn log_session_summary(peer: &str, stats: &SessionStats, elapsed: Duration) {
    info!(
        peer = %peer,
        messages_received = stats.messages_received,
        messages_sent = stats.messages_sent,
        tasks_created = stats.tasks_created,
        tasks_completed = stats.tasks_completed,
        tasks_cancelled = stats.tasks_cancelled,
        errors = stats.errors,
        duration_ms = elapsed.as_millis() as u64,
        "session summary"
    );

    if stats.errors > 0 {
        warn!(peer = %peer, errors = stats.errors, "session ended with protocol errors");
    }
}
