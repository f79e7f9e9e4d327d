//! [`Transport`] over any split async byte stream (TCP in production, duplex pipes in tests)

use std::{
    io,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::Mutex,
    time::{timeout, timeout_at, Instant},
};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, warn};

use crate::errors::TransportError;
use crate::transport::{FrameCodec, Transport, TransportConfig};

const READ_CHUNK: usize = 1024;

struct ReadState<R> {
    stream: R,
    buffer: BytesMut,
    codec: FrameCodec,
}

pub struct StreamTransport<R, W> {
    reader: Mutex<ReadState<R>>,
    writer: Mutex<Option<W>>,
    connected: AtomicBool,
    peer: String,
    config: TransportConfig,
}

impl StreamTransport<OwnedReadHalf, OwnedWriteHalf> {
    pub fn from_tcp(stream: TcpStream, config: TransportConfig) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?.to_string();
        let (read, write) = stream.into_split();
        Ok(Self::new(read, write, peer, config))
    }
}

impl<R, W> StreamTransport<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(read: R, write: W, peer: impl Into<String>, config: TransportConfig) -> Self {
        Self {
            reader: Mutex::new(ReadState {
                stream: read,
                buffer: BytesMut::with_capacity(READ_CHUNK),
                codec: FrameCodec::new(config.framing, config.max_message_size),
            }),
            writer: Mutex::new(Some(write)),
            connected: AtomicBool::new(true),
            peer: peer.into(),
            config,
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    fn fail(&self, err: TransportError) -> TransportError {
        if err.is_fatal() {
            self.connected.store(false, Ordering::SeqCst);
        }
        err
    }
}

#[async_trait]
impl<R, W> Transport for StreamTransport<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn send(&self, payload: &[u8]) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        let mut frame = BytesMut::new();
        FrameCodec::new(self.config.framing, self.config.max_message_size)
            .encode(Bytes::copy_from_slice(payload), &mut frame)?;

        let mut writer = self.writer.lock().await;
        let Some(stream) = writer.as_mut() else {
            return Err(TransportError::Closed);
        };

        let write = async {
            stream.write_all(&frame).await?;
            stream.flush().await?;
            Ok::<_, io::Error>(())
        };
        match timeout(self.config.send_timeout, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(self.fail(TransportError::from_io(err))),
            Err(_) => {
                // part of the frame may already be on the wire
                warn!(peer = %self.peer, bytes = frame.len(), "send timed out");
                Err(self.fail(TransportError::WriteTimeout))
            }
        }
    }

    async fn receive(&self, wait: Duration) -> Result<Option<Bytes>, TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        let deadline = Instant::now() + wait;
        let mut reader = self.reader.lock().await;
        let ReadState {
            stream,
            buffer,
            codec,
        } = &mut *reader;

        loop {
            match codec.decode(buffer) {
                Ok(Some(frame)) if frame.is_empty() => return Ok(None),
                Ok(Some(frame)) => return Ok(Some(frame)),
                Ok(None) => {}
                Err(err) => return Err(self.fail(err)),
            }

            buffer.reserve(READ_CHUNK);
            match timeout_at(deadline, stream.read_buf(buffer)).await {
                Err(_) => return Err(TransportError::Timeout),
                Ok(Ok(0)) => {
                    debug!(peer = %self.peer, pending = buffer.len(), "peer closed the stream");
                    return Err(self.fail(TransportError::Closed));
                }
                Ok(Ok(_)) => {}
                Ok(Err(err)) => return Err(self.fail(TransportError::from_io(err))),
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        let was_connected = self.connected.swap(false, Ordering::SeqCst);
        if let Some(mut stream) = self.writer.lock().await.take() {
            if let Err(err) = stream.shutdown().await {
                debug!(peer = %self.peer, error = %err, "stream shutdown failed");
            }
        }
        if was_connected {
            debug!(peer = %self.peer, "transport closed");
        }
    }

    fn peer(&self) -> &str {
        &self.peer
    }

    fn max_message_size(&self) -> usize {
        self.config.max_message_size
    }
}
