//! Error types for the debugger engine.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::time::Duration;

use serde::Deserialize;
use transport::{CodecError, Response};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Coarse classification of [`Error`] for callers deciding whether to retry,
/// report, or give up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// An operation needed a live session and there was none.
    NoSession,
    /// `run` was called while a session was live.
    AlreadyActive,
    /// The adapter answered with `success: false`.
    Adapter,
    /// Starting, reaching, or talking to the adapter failed.
    Transport,
    /// The adapter sent something we could not make sense of.
    Protocol,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no active debug session")]
    NoSession,

    #[error("a debug session is already active")]
    AlreadyActive,

    #[error("debug session was stopped while starting")]
    StartCancelled,

    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("invalid run specification: {0}")]
    InvalidRunSpec(String),

    #[error("spawning debug adapter `{program}`")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("binding dial-back listener")]
    Bind(#[source] io::Error),

    #[error("accepting connection from debug adapter")]
    Accept(#[source] io::Error),

    #[error("debug adapter exited ({status}) before connecting back")]
    AdapterExited { status: String },

    #[error("debug adapter did not connect back within {0:?}")]
    AcceptTimeout(Duration),

    #[error("dialing debug adapter at {address}")]
    Dial {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("writing to debug adapter")]
    Write(#[source] CodecError),

    #[error("encoding `{command}` arguments")]
    EncodeArguments {
        command: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("malformed `{command}` response body")]
    MalformedBody {
        command: String,
        #[source]
        source: serde_json::Error,
    },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NoSession => ErrorKind::NoSession,
            Error::AlreadyActive => ErrorKind::AlreadyActive,
            Error::Adapter(_) => ErrorKind::Adapter,
            Error::EncodeArguments { .. } | Error::MalformedBody { .. } => ErrorKind::Protocol,
            Error::Write(e) if !e.is_closed() => ErrorKind::Protocol,
            Error::ConnectionClosed
            | Error::StartCancelled
            | Error::InvalidRunSpec(_)
            | Error::Spawn { .. }
            | Error::Bind(_)
            | Error::Accept(_)
            | Error::AdapterExited { .. }
            | Error::AcceptTimeout(_)
            | Error::Dial { .. }
            | Error::Write(_) => ErrorKind::Transport,
        }
    }
}

/// A request the adapter rejected.
///
/// Built from the structured `error` in the response body when there is one,
/// with `{name}` placeholders in its format string filled in from its
/// variables. Displayed as `"<id>: <message>"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterError {
    pub command: String,
    pub id: Option<i64>,
    pub message: String,
    pub show_user: bool,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: Option<ErrorMessage>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorMessage {
    id: i64,
    format: String,
    #[serde(default)]
    variables: HashMap<String, String>,
    #[serde(default)]
    show_user: bool,
}

impl AdapterError {
    pub fn from_response(response: &Response) -> Self {
        let structured = response
            .body
            .as_ref()
            .and_then(|body| ErrorBody::deserialize(body).ok())
            .and_then(|body| body.error);

        match structured {
            Some(error) => Self {
                command: response.command.clone(),
                id: Some(error.id),
                message: substitute(&error.format, &error.variables),
                show_user: error.show_user,
            },
            None => Self {
                command: response.command.clone(),
                id: None,
                message: response
                    .message
                    .clone()
                    .unwrap_or_else(|| format!("{} request failed", response.command)),
                show_user: false,
            },
        }
    }
}

fn substitute(format: &str, variables: &HashMap<String, String>) -> String {
    variables
        .iter()
        .fold(format.to_string(), |message, (name, value)| {
            message.replace(&format!("{{{name}}}"), value)
        })
}

impl fmt::Display for AdapterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.id {
            Some(id) => write!(f, "{id}: {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for AdapterError {}
