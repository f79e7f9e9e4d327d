//! Wire framing for one JSON-RPC message per frame
//!
//! Two conventions are supported, chosen per transport and never negotiated:
//! newline-delimited lines, or a 4-byte big-endian length header followed by the payload.
//! Both reject input that looks like a plain HTTP request, and both recover from an
//! oversized frame by discarding the remainder of it.

use std::{fmt, str::FromStr};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::errors::TransportError;

pub const LENGTH_HEADER_SIZE: usize = 4;
pub const DEFAULT_NEWLINE_MAX_MESSAGE_SIZE: usize = 16 * 1024;
pub const DEFAULT_LENGTH_PREFIXED_MAX_MESSAGE_SIZE: usize = 8 * 1024;
// no configuration may raise the per-frame limit above this
pub const HARD_MAX_MESSAGE_SIZE: usize = 32 * 1024;

const HTTP_PROBE_PREFIXES: &[&[u8]] = &[
    b"GET ",
    b"POST ",
    b"PUT ",
    b"DELETE ",
    b"HEAD ",
    b"OPTIONS ",
    b"PATCH ",
    b"CONNECT ",
    b"TRACE ",
    b"HTTP/",
    b"Host:",
    b"User-Agent:",
    b"Accept:",
    b"Content-Type:",
    b"Content-Length:",
    b"Connection:",
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Framing {
    #[default]
    Newline,
    LengthPrefixed,
}

impl Framing {
    pub fn default_max_message_size(self) -> usize {
        match self {
            Self::Newline => DEFAULT_NEWLINE_MAX_MESSAGE_SIZE,
            Self::LengthPrefixed => DEFAULT_LENGTH_PREFIXED_MAX_MESSAGE_SIZE,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Newline => "newline",
            Self::LengthPrefixed => "length-prefixed",
        }
    }
}

impl fmt::Display for Framing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Framing {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "newline" | "ndjson" | "line" => Ok(Self::Newline),
            "length-prefixed" | "length_prefixed" | "length" => Ok(Self::LengthPrefixed),
            other => Err(format!("unknown framing '{other}'")),
        }
    }
}

pub fn is_http_probe(data: &[u8]) -> bool {
    HTTP_PROBE_PREFIXES
        .iter()
        .any(|prefix| data.starts_with(prefix))
}

// a 4-byte length header can only hold the start of a prefix
fn is_http_header_start(header: &[u8]) -> bool {
    !header.is_empty()
        && HTTP_PROBE_PREFIXES
            .iter()
            .any(|prefix| prefix.starts_with(header) || header.starts_with(prefix))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Discard {
    Off,
    UntilNewline,
    Remaining(usize),
}

#[derive(Debug, Clone)]
pub struct FrameCodec {
    framing: Framing,
    max_frame: usize,
    discard: Discard,
}

impl FrameCodec {
    pub fn new(framing: Framing, max_frame: usize) -> Self {
        Self {
            framing,
            max_frame: max_frame.clamp(1, HARD_MAX_MESSAGE_SIZE),
            discard: Discard::Off,
        }
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    pub fn max_frame(&self) -> usize {
        self.max_frame
    }

    fn decode_line(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, TransportError> {
        if self.discard == Discard::UntilNewline {
            match src.iter().position(|byte| *byte == b'\n') {
                Some(position) => {
                    src.advance(position + 1);
                    self.discard = Discard::Off;
                }
                None => {
                    src.clear();
                    return Ok(None);
                }
            }
        }

        let Some(position) = src.iter().position(|byte| *byte == b'\n') else {
            if src.len() > self.max_frame {
                let probe = is_http_probe(src);
                src.clear();
                if probe {
                    return Err(TransportError::HttpProbe);
                }
                self.discard = Discard::UntilNewline;
                return Err(TransportError::BufferOverflow {
                    limit: self.max_frame,
                });
            }
            return Ok(None);
        };

        let mut line = src.split_to(position + 1);
        line.truncate(position);
        if line.last() == Some(&b'\r') {
            line.truncate(line.len() - 1);
        }

        if is_http_probe(&line) {
            return Err(TransportError::HttpProbe);
        }
        if line.len() > self.max_frame {
            return Err(TransportError::MessageTooLarge {
                size: line.len(),
                max: self.max_frame,
            });
        }
        Ok(Some(line.freeze()))
    }

    fn decode_length_prefixed(
        &mut self,
        src: &mut BytesMut,
    ) -> Result<Option<Bytes>, TransportError> {
        if let Discard::Remaining(remaining) = self.discard {
            let skipped = remaining.min(src.len());
            src.advance(skipped);
            if skipped < remaining {
                self.discard = Discard::Remaining(remaining - skipped);
                return Ok(None);
            }
            self.discard = Discard::Off;
        }

        // a partial header is never conclusive, HTTP-looking or not
        if src.len() < LENGTH_HEADER_SIZE {
            return Ok(None);
        }

        let header = &src[..LENGTH_HEADER_SIZE];
        if is_http_header_start(header) {
            src.clear();
            return Err(TransportError::HttpProbe);
        }

        let length = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        if length == 0 {
            src.advance(LENGTH_HEADER_SIZE);
            return Ok(Some(Bytes::new()));
        }
        if length > self.max_frame {
            src.advance(LENGTH_HEADER_SIZE);
            let skipped = length.min(src.len());
            src.advance(skipped);
            if skipped < length {
                self.discard = Discard::Remaining(length - skipped);
            }
            return Err(TransportError::MessageTooLarge {
                size: length,
                max: self.max_frame,
            });
        }

        if src.len() < LENGTH_HEADER_SIZE + length {
            src.reserve(LENGTH_HEADER_SIZE + length - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_HEADER_SIZE);
        Ok(Some(src.split_to(length).freeze()))
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.framing {
            Framing::Newline => self.decode_line(src),
            Framing::LengthPrefixed => self.decode_length_prefixed(src),
        }
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = TransportError;

    fn encode(&mut self, payload: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if payload.len() > self.max_frame {
            return Err(TransportError::MessageTooLarge {
                size: payload.len(),
                max: self.max_frame,
            });
        }

        match self.framing {
            Framing::Newline => {
                if payload.contains(&b'\n') {
                    return Err(TransportError::InvalidFrame(
                        "payload contains a raw newline".to_string(),
                    ));
                }
                dst.reserve(payload.len() + 1);
                dst.extend_from_slice(&payload);
                dst.put_u8(b'\n');
            }
            Framing::LengthPrefixed => {
                let length = u32::try_from(payload.len()).map_err(|_| {
                    TransportError::InvalidFrame("payload does not fit a u32 header".to_string())
                })?;
                dst.reserve(LENGTH_HEADER_SIZE + payload.len());
                dst.put_u32(length);
                dst.extend_from_slice(&payload);
            }
        }
        Ok(())
    }
}
