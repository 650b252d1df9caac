//! The three kinds of DAP message.
//!
//! The same structs describe both directions: the client mostly sends
//! requests, but answers reverse requests with responses, and test adapters
//! send responses and events.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ParseError;

/// Per-sender message counter, also used to correlate responses.
pub type Seq = i64;

/// A message received from the other side.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Message {
    Response(Response),
    Event(Event),
    /// A reverse request: the adapter asking the client to do something.
    Request(Request),
}

#[derive(Deserialize)]
struct Kind {
    #[serde(rename = "type")]
    kind: String,
}

fn decode<T: DeserializeOwned>(body: &[u8], kind: &'static str) -> Result<T, ParseError> {
    serde_json::from_slice(body).map_err(|source| ParseError::Malformed { kind, source })
}

impl Message {
    /// Classify a body by its `type` field, then decode it as that kind.
    ///
    /// An unrecognised `type` is [`ParseError::UnknownKind`]; nothing about
    /// the stream is wrong in that case and the caller can move on.
    pub fn parse(body: &[u8]) -> Result<Self, ParseError> {
        let Kind { kind } = serde_json::from_slice(body).map_err(ParseError::MissingType)?;

        match kind.as_str() {
            "response" => decode(body, "response").map(Message::Response),
            "event" => decode(body, "event").map(Message::Event),
            "request" => decode(body, "request").map(Message::Request),
            _ => Err(ParseError::UnknownKind(kind)),
        }
    }

    pub fn seq(&self) -> Seq {
        match self {
            Message::Response(Response { seq, .. })
            | Message::Event(Event { seq, .. })
            | Message::Request(Request { seq, .. }) => *seq,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub seq: Seq,
    pub request_seq: Seq,
    pub success: bool,
    pub command: String,
    /// Short failure reason when `success` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(default)]
    pub seq: Seq,
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub seq: Seq,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
}

/// A message to be written to the other side.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OutgoingMessage {
    Request(Request),
    Response(Response),
    Event(Event),
}

impl OutgoingMessage {
    pub fn seq(&self) -> Seq {
        match self {
            OutgoingMessage::Request(Request { seq, .. })
            | OutgoingMessage::Response(Response { seq, .. })
            | OutgoingMessage::Event(Event { seq, .. }) => *seq,
        }
    }

    /// Stamp the sender's sequence number just before sending.
    pub fn set_seq(&mut self, value: Seq) {
        match self {
            OutgoingMessage::Request(Request { seq, .. })
            | OutgoingMessage::Response(Response { seq, .. })
            | OutgoingMessage::Event(Event { seq, .. }) => *seq = value,
        }
    }
}
