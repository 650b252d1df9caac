//! Error types for the transport layer.

use std::io;

/// Errors that can occur while framing DAP messages.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// An I/O error occurred while reading or writing.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The stream ended part way through a frame.
    #[error("stream ended with {buffered} bytes of an incomplete message buffered")]
    UnexpectedEof {
        /// Number of bytes left in the read buffer.
        buffered: usize,
    },

    /// The header section contained invalid UTF-8.
    #[error("invalid UTF-8 in header")]
    InvalidUtf8,

    /// A header line was not of the form `key: value`.
    #[error("malformed header line: {line:?}")]
    MalformedHeader {
        /// The offending line.
        line: String,
    },

    /// The Content-Length header value could not be parsed as an integer.
    #[error("malformed Content-Length header value: {0:?}")]
    MalformedContentLength(String),

    /// No Content-Length header was found in the message.
    #[error("missing Content-Length header")]
    MissingContentLength,

    /// The message body exceeds the configured maximum size.
    #[error("message size {size} exceeds maximum allowed {max}")]
    MessageTooLarge {
        /// The actual message size.
        size: usize,
        /// The maximum allowed size.
        max: usize,
    },

    /// No header terminator within the allowed header size.
    #[error("unterminated header of {size} bytes exceeds maximum allowed {max}")]
    HeaderTooLarge {
        /// Bytes buffered without finding the end of the header.
        size: usize,
        /// The maximum allowed size.
        max: usize,
    },

    /// Failed to serialize the outgoing message to JSON.
    #[error("JSON serialization failed: {0}")]
    JsonSerialize(#[source] serde_json::Error),
}

impl CodecError {
    /// Whether this error means the peer went away rather than that it sent
    /// something we could not understand.
    pub fn is_closed(&self) -> bool {
        match self {
            CodecError::UnexpectedEof { .. } => true,
            CodecError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::NotConnected
            ),
            _ => false,
        }
    }
}

/// Errors raised while classifying a frame body into a [`crate::Message`].
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    /// The body was not a JSON object carrying a string `type` field.
    #[error("message has no readable type discriminator: {0}")]
    MissingType(#[source] serde_json::Error),

    /// The `type` field named a message kind we do not know.
    #[error("unrecognized message type {0:?}")]
    UnknownKind(String),

    /// The body had a known `type` but did not match its shape.
    #[error("malformed {kind} message: {source}")]
    Malformed {
        /// The message kind from the `type` field.
        kind: &'static str,
        /// The underlying deserialization error.
        #[source]
        source: serde_json::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eof_style_errors_count_as_closed() {
        assert!(CodecError::UnexpectedEof { buffered: 3 }.is_closed());
        assert!(CodecError::Io(io::Error::from(io::ErrorKind::BrokenPipe)).is_closed());
        assert!(CodecError::Io(io::Error::from(io::ErrorKind::ConnectionReset)).is_closed());
    }

    #[test]
    fn parse_errors_are_protocol_violations() {
        assert!(!CodecError::MissingContentLength.is_closed());
        assert!(
            !CodecError::MalformedHeader {
                line: "nonsense".to_string()
            }
            .is_closed()
        );
        assert!(!CodecError::Io(io::Error::other("boom")).is_closed());
        assert!(!CodecError::HeaderTooLarge { size: 10, max: 5 }.is_closed());
    }
}
