//! In-memory transports for tests.

use tokio::io::{DuplexStream, duplex};

use crate::transport::DapTransport;

/// One end of an in-memory connection.
///
/// Each direction is its own pipe, so dropping one end's writer ends the
/// other end's reader even while the rest of the connection stays open.
pub struct MemoryTransport {
    incoming: DuplexStream,
    outgoing: DuplexStream,
}

impl MemoryTransport {
    /// Two connected ends with 64 KiB of buffering per direction.
    pub fn pair() -> (Self, Self) {
        Self::pair_with_buffer_size(64 * 1024)
    }

    /// Two connected ends with `capacity` bytes of buffering per direction.
    /// A tiny capacity makes readers see messages a few bytes at a time.
    pub fn pair_with_buffer_size(capacity: usize) -> (Self, Self) {
        let (left_tx, right_rx) = duplex(capacity);
        let (right_tx, left_rx) = duplex(capacity);
        (
            Self {
                incoming: left_rx,
                outgoing: left_tx,
            },
            Self {
                incoming: right_rx,
                outgoing: right_tx,
            },
        )
    }
}

impl DapTransport for MemoryTransport {
    type Read = DuplexStream;
    type Write = DuplexStream;

    fn into_split(self) -> (DuplexStream, DuplexStream) {
        (self.incoming, self.outgoing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Message, OutgoingMessage, Request};
    use crate::split;
    use futures::StreamExt;

    #[tokio::test]
    async fn both_directions_carry_messages() {
        let (left, right) = MemoryTransport::pair_with_buffer_size(5);
        let (mut left_rx, mut left_tx) = split(left);
        let (mut right_rx, mut right_tx) = split(right);

        let request = |seq, command: &str| {
            OutgoingMessage::Request(Request {
                seq,
                command: command.to_string(),
                arguments: None,
            })
        };

        let forward = tokio::spawn(async move {
            left_tx.send(request(1, "threads")).await.unwrap();
            left_tx
        });
        let backward = tokio::spawn(async move {
            right_tx.send(request(1, "runInTerminal")).await.unwrap();
            right_tx
        });

        let Message::Request(at_right) = right_rx.next().await.unwrap().unwrap().message().unwrap()
        else {
            panic!("expected a request");
        };
        let Message::Request(at_left) = left_rx.next().await.unwrap().unwrap().message().unwrap()
        else {
            panic!("expected a request");
        };
        assert_eq!(at_right.command, "threads");
        assert_eq!(at_left.command, "runInTerminal");

        forward.await.unwrap();
        backward.await.unwrap();
    }

    #[tokio::test]
    async fn dropping_a_writer_ends_the_peer_reader() {
        let (left, right) = MemoryTransport::pair();
        let (_left_rx, left_tx) = split(left);
        let (mut right_rx, _right_tx) = split(right);

        drop(left_tx);
        assert!(right_rx.next().await.is_none());
    }
}
