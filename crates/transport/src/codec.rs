//! Content-Length framing.
//!
//! ```text
//! Content-Length: 46\r\n
//! \r\n
//! {"seq":1,"type":"event","event":"initialized"}
//! ```

use std::collections::HashMap;

use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{CodecError, ParseError};
use crate::message::{Message, OutgoingMessage};

const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

const HEADER_END: &[u8] = b"\r\n\r\n";

/// Floor for the unterminated header limit, so tiny body limits still admit
/// an ordinary header.
const MIN_HEADER_LIMIT: usize = 1024;

const CONTENT_LENGTH: &str = "Content-Length";

/// A framed message whose body has not been interpreted yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Header names and values with surrounding whitespace removed.
    pub headers: HashMap<String, String>,
    /// Exactly `Content-Length` bytes of JSON.
    pub body: Bytes,
}

impl Frame {
    /// Header value by name, ignoring ASCII case.
    pub fn header(&self, name: &str) -> Option<&str> {
        lookup(&self.headers, name)
    }

    pub fn message(&self) -> Result<Message, ParseError> {
        Message::parse(&self.body)
    }
}

fn lookup<'a>(headers: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find_map(|(key, value)| key.eq_ignore_ascii_case(name).then_some(value.as_str()))
}

#[derive(Debug, Clone, Default)]
enum DecodeState {
    #[default]
    Head,
    /// Headers consumed, waiting for `length` body bytes.
    Body {
        headers: HashMap<String, String>,
        length: usize,
    },
}

/// Splits a byte stream into [`Frame`]s and writes [`OutgoingMessage`]s.
///
/// Only the framing is checked here. A body that is not a valid message is
/// still a valid frame, so the stream survives it.
#[derive(Debug, Clone)]
pub struct DapCodec {
    max_message_size: usize,
    state: DecodeState,
}

impl DapCodec {
    pub fn new() -> Self {
        Self::with_max_size(DEFAULT_MAX_MESSAGE_SIZE)
    }

    /// Reject bodies longer than `max_message_size` with
    /// [`CodecError::MessageTooLarge`].
    pub fn with_max_size(max_message_size: usize) -> Self {
        Self {
            max_message_size,
            state: DecodeState::Head,
        }
    }

    fn decode_head(&self, src: &mut BytesMut) -> Result<Option<DecodeState>, CodecError> {
        let Some(end) = src.windows(HEADER_END.len()).position(|w| w == HEADER_END) else {
            let max = self.max_message_size.max(MIN_HEADER_LIMIT);
            if src.len() > max {
                return Err(CodecError::HeaderTooLarge {
                    size: src.len(),
                    max,
                });
            }
            return Ok(None);
        };

        let head = src.split_to(end + HEADER_END.len());
        let headers = parse_headers(&head[..end])?;
        let value = lookup(&headers, CONTENT_LENGTH).ok_or(CodecError::MissingContentLength)?;
        let length: usize = value
            .parse()
            .map_err(|_| CodecError::MalformedContentLength(value.to_string()))?;

        if length > self.max_message_size {
            return Err(CodecError::MessageTooLarge {
                size: length,
                max: self.max_message_size,
            });
        }
        Ok(Some(DecodeState::Body { headers, length }))
    }
}

impl Default for DapCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for DapCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        if let DecodeState::Head = self.state {
            match self.decode_head(src)? {
                Some(state) => self.state = state,
                None => return Ok(None),
            }
        }

        let DecodeState::Body { length, .. } = self.state else {
            return Ok(None);
        };
        if src.len() < length {
            src.reserve(length - src.len());
            return Ok(None);
        }

        let body = src.split_to(length).freeze();
        match std::mem::take(&mut self.state) {
            DecodeState::Body { headers, .. } => Ok(Some(Frame { headers, body })),
            DecodeState::Head => Ok(None),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        match self.state {
            DecodeState::Head if src.is_empty() => Ok(None),
            _ => Err(CodecError::UnexpectedEof {
                buffered: src.len(),
            }),
        }
    }
}

impl Encoder<OutgoingMessage> for DapCodec {
    type Error = CodecError;

    fn encode(&mut self, message: OutgoingMessage, dst: &mut BytesMut) -> Result<(), CodecError> {
        write_frame(&message, dst)
    }
}

/// The complete frame for `message`, header included.
pub fn encode(message: &impl Serialize) -> Result<Bytes, CodecError> {
    let mut dst = BytesMut::new();
    write_frame(message, &mut dst)?;
    Ok(dst.freeze())
}

fn write_frame(message: &impl Serialize, dst: &mut BytesMut) -> Result<(), CodecError> {
    let body = serde_json::to_vec(message).map_err(CodecError::JsonSerialize)?;
    let head = format!("{CONTENT_LENGTH}: {}\r\n\r\n", body.len());

    dst.reserve(head.len() + body.len());
    dst.put_slice(head.as_bytes());
    dst.put_slice(&body);
    Ok(())
}

fn parse_headers(head: &[u8]) -> Result<HashMap<String, String>, CodecError> {
    let head = std::str::from_utf8(head).map_err(|_| CodecError::InvalidUtf8)?;

    head.split("\r\n")
        .map(|line| {
            line.split_once(':')
                .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
                .ok_or_else(|| CodecError::MalformedHeader {
                    line: line.to_string(),
                })
        })
        .collect()
}
