use std::{env, net::SocketAddr, str::FromStr, time::Duration};

use thiserror::Error;

use crate::mcp::SessionConfig;
use crate::transport::{Framing, TransportConfig, HARD_MAX_MESSAGE_SIZE};

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub bind_port: u16,
    pub framing: Framing,
    pub max_message_size: usize,
    pub max_connections: usize,
    pub server_name: String,
    pub session: SessionConfig,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("BIND_PORT must be a valid u16")]
    InvalidPort,
    #[error("invalid bind address or port")]
    InvalidSocket,
    #[error("MCP_FRAMING must be one of: newline, length-prefixed")]
    InvalidFraming,
    #[error("MCP_MAX_MESSAGE_SIZE must be between 1 and {HARD_MAX_MESSAGE_SIZE}")]
    InvalidMessageSize,
    #[error("{0} must be a positive integer")]
    InvalidNumber(&'static str),
    #[error("{0} must be true or false")]
    InvalidFlag(&'static str),
    #[error("MCP_SERVER_NAME must not be empty")]
    EmptyServerName,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let bind_addr = env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0".to_string());
        let bind_port = env::var("BIND_PORT")
            .ok()
            .map(|value| value.trim().parse::<u16>().map_err(|_| ConfigError::InvalidPort))
            .transpose()?
            .unwrap_or(8080);

        let framing = env::var("MCP_FRAMING")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .map(|value| Framing::from_str(&value).map_err(|_| ConfigError::InvalidFraming))
            .transpose()?
            .unwrap_or_default();
        let max_message_size = env_number("MCP_MAX_MESSAGE_SIZE")
            .map_err(|_| ConfigError::InvalidMessageSize)?
            .unwrap_or_else(|| framing.default_max_message_size());
        if max_message_size == 0 || max_message_size > HARD_MAX_MESSAGE_SIZE {
            return Err(ConfigError::InvalidMessageSize);
        }

        let server_name = match env::var("MCP_SERVER_NAME") {
            Ok(value) if value.trim().is_empty() => return Err(ConfigError::EmptyServerName),
            Ok(value) => value.trim().to_string(),
            Err(_) => env!("CARGO_PKG_NAME").to_string(),
        };

        let defaults = SessionConfig::default();
        let session = SessionConfig {
            max_pending_tasks: env_number("MCP_MAX_PENDING_TASKS")?
                .unwrap_or(defaults.max_pending_tasks),
            message_queue_depth: env_number("MCP_MESSAGE_QUEUE_DEPTH")?
                .unwrap_or(defaults.message_queue_depth),
            task_timeout: env_millis("MCP_TASK_TIMEOUT_MS")?.unwrap_or(defaults.task_timeout),
            session_timeout: env_millis("MCP_SESSION_TIMEOUT_MS")?
                .unwrap_or(defaults.session_timeout),
            enable_progress_reporting: env_flag("MCP_ENABLE_PROGRESS")?
                .unwrap_or(defaults.enable_progress_reporting),
            enable_tools_pagination: env_flag("MCP_ENABLE_TOOLS_PAGINATION")?
                .unwrap_or(defaults.enable_tools_pagination),
            ..defaults
        };

        let config = Self {
            bind_addr,
            bind_port,
            framing,
            max_message_size,
            max_connections: env_number("MCP_MAX_CONNECTIONS")?.unwrap_or(3),
            server_name,
            session,
        };

        let _ = config.bind_socket()?;
        Ok(config)
    }

    pub fn bind_socket(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.bind_addr, self.bind_port)
            .parse::<SocketAddr>()
            .map_err(|_| ConfigError::InvalidSocket)
    }

    pub fn transport(&self) -> TransportConfig {
        TransportConfig {
            max_message_size: self.max_message_size,
            ..TransportConfig::new(self.framing)
        }
    }
}

fn env_number(name: &'static str) -> Result<Option<usize>, ConfigError> {
    env::var(name)
        .ok()
        .map(|value| match value.trim().parse::<usize>() {
            Ok(number) if number > 0 => Ok(number),
            _ => Err(ConfigError::InvalidNumber(name)),
        })
        .transpose()
}

fn env_millis(name: &'static str) -> Result<Option<Duration>, ConfigError> {
    env_number(name).map(|value| value.map(|millis| Duration::from_millis(millis as u64)))
}

fn env_flag(name: &'static str) -> Result<Option<bool>, ConfigError> {
    env::var(name)
        .ok()
        .map(|value| match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidFlag(name)),
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    // the process environment is shared between test threads
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const VARS: &[&str] = &[
        "BIND_ADDR",
        "BIND_PORT",
        "MCP_FRAMING",
        "MCP_MAX_MESSAGE_SIZE",
        "MCP_MAX_CONNECTIONS",
        "MCP_MAX_PENDING_TASKS",
        "MCP_MESSAGE_QUEUE_DEPTH",
        "MCP_TASK_TIMEOUT_MS",
        "MCP_SESSION_TIMEOUT_MS",
        "MCP_ENABLE_PROGRESS",
        "MCP_ENABLE_TOOLS_PAGINATION",
        "MCP_SERVER_NAME",
    ];

    fn clear_env() {
        for var in VARS {
            env::remove_var(var);
        }
    }

    #[test]
    fn parse_defaults() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        clear_env();

        let config = Config::from_env().expect("config should parse");
        assert_eq!(config.bind_addr, "0.0.0.0");
        assert_eq!(config.bind_port, 8080);
        assert_eq!(config.framing, Framing::Newline);
        assert_eq!(config.max_message_size, 16 * 1024);
        assert_eq!(config.max_connections, 3);
        assert_eq!(config.server_name, env!("CARGO_PKG_NAME"));
        assert_eq!(config.session.max_pending_tasks, 8);
        assert_eq!(config.session.task_timeout, Duration::from_millis(30_000));
        assert!(!config.session.enable_tools_pagination);
    }

    #[test]
    fn length_prefixed_defaults_to_smaller_frames() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        clear_env();
        env::set_var("MCP_FRAMING", "length-prefixed");
        env::set_var("MCP_ENABLE_TOOLS_PAGINATION", "true");

        let config = Config::from_env().expect("config should parse");
        clear_env();
        assert_eq!(config.framing, Framing::LengthPrefixed);
        assert_eq!(config.transport().max_message_size, 8 * 1024);
        assert!(config.session.enable_tools_pagination);
    }

    #[test]
    fn message_size_above_hard_ceiling_fails() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        clear_env();
        env::set_var("MCP_MAX_MESSAGE_SIZE", "65536");

        let err = Config::from_env().expect_err("expected size error");
        clear_env();
        assert!(matches!(err, ConfigError::InvalidMessageSize));
    }

    #[test]
    fn invalid_values_fail() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        clear_env();
        env::set_var("MCP_MAX_PENDING_TASKS", "zero");
        let err = Config::from_env().expect_err("expected number error");
        assert!(matches!(err, ConfigError::InvalidNumber("MCP_MAX_PENDING_TASKS")));

        clear_env();
        env::set_var("MCP_FRAMING", "http");
        let err = Config::from_env().expect_err("expected framing error");
        assert!(matches!(err, ConfigError::InvalidFraming));

        clear_env();
        env::set_var("BIND_PORT", "99999");
        let err = Config::from_env().expect_err("expected port error");
        clear_env();
        assert!(matches!(err, ConfigError::InvalidPort));
    }
}
