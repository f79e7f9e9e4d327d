//! Byte-stream transport for one connected MCP client

pub mod codec;
pub mod socket;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::errors::TransportError;

pub use codec::{FrameCodec, Framing, HARD_MAX_MESSAGE_SIZE};
pub use socket::StreamTransport;

pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportConfig {
    pub framing: Framing,
    pub max_message_size: usize,
    pub send_timeout: Duration,
}

impl TransportConfig {
    pub fn new(framing: Framing) -> Self {
        Self {
            framing,
            max_message_size: framing.default_max_message_size(),
            send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::new(Framing::default())
    }
}

// receive yields Ok(None) for an empty frame; only fatal errors end a session
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, payload: &[u8]) -> Result<(), TransportError>;

    async fn receive(&self, timeout: Duration) -> Result<Option<Bytes>, TransportError>;

    fn is_connected(&self) -> bool;

    async fn close(&self);

    fn peer(&self) -> &str;

    fn max_message_size(&self) -> usize;
}
