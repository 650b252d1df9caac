//! Byte streams a DAP connection can run over.

use std::io;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};

use crate::framed::{DapReader, DapWriter};

/// Anything that comes apart into an independent read half and write half:
/// a socket, a child's stdout and stdin, or an in-memory pipe.
pub trait DapTransport: Send + 'static {
    type Read: AsyncRead + Unpin + Send + 'static;
    type Write: AsyncWrite + Unpin + Send + 'static;

    fn into_split(self) -> (Self::Read, Self::Write);
}

impl DapTransport for TcpStream {
    type Read = OwnedReadHalf;
    type Write = OwnedWriteHalf;

    fn into_split(self) -> (OwnedReadHalf, OwnedWriteHalf) {
        TcpStream::into_split(self)
    }
}

/// Two one-way streams treated as one transport, e.g. a child process's
/// stdout (read) and stdin (write).
pub struct StreamPair<R, W> {
    read: R,
    write: W,
}

impl<R, W> StreamPair<R, W> {
    pub fn new(read: R, write: W) -> Self {
        Self { read, write }
    }
}

impl<R, W> DapTransport for StreamPair<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    type Read = R;
    type Write = W;

    fn into_split(self) -> (R, W) {
        (self.read, self.write)
    }
}

/// Frame both halves of `transport` with the default codec.
pub fn split<T: DapTransport>(transport: T) -> (DapReader<T::Read>, DapWriter<T::Write>) {
    let (read, write) = transport.into_split();
    (DapReader::new(read), DapWriter::new(write))
}

/// Open a TCP connection to an adapter and frame it.
pub async fn connect(
    addr: impl ToSocketAddrs,
) -> io::Result<(DapReader<OwnedReadHalf>, DapWriter<OwnedWriteHalf>)> {
    let stream = TcpStream::connect(addr).await?;
    tracing::debug!(peer = ?stream.peer_addr().ok(), "connected to debug adapter");
    Ok(split(stream))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Event, Message, OutgoingMessage};
    use futures::StreamExt;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn stream_pair_reads_one_stream_and_writes_the_other() {
        let (to_peer, from_us) = tokio::io::duplex(256);
        let (mut to_us, from_peer) = tokio::io::duplex(256);

        let (mut reader, mut writer) = split(StreamPair::new(from_peer, to_peer));

        writer
            .send(OutgoingMessage::Event(Event {
                seq: 1,
                event: "ping".to_string(),
                body: None,
            }))
            .await
            .unwrap();
        let mut peer = DapReader::new(from_us);
        let frame = peer.next().await.unwrap().unwrap();
        assert!(matches!(frame.message().unwrap(), Message::Event(e) if e.event == "ping"));

        let body = br#"{"seq":1,"type":"event","event":"pong"}"#;
        to_us
            .write_all(format!("Content-Length: {}\r\n\r\n", body.len()).as_bytes())
            .await
            .unwrap();
        to_us.write_all(body).await.unwrap();
        let frame = reader.next().await.unwrap().unwrap();
        assert!(matches!(frame.message().unwrap(), Message::Event(e) if e.event == "pong"));
    }

    #[tokio::test]
    async fn connect_frames_a_tcp_stream() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (client, server) = tokio::join!(connect(addr), listener.accept());
        let (_reader, mut writer) = client.unwrap();
        let (server, _) = server.unwrap();

        writer
            .send(OutgoingMessage::Event(Event {
                seq: 4,
                event: "hello".to_string(),
                body: None,
            }))
            .await
            .unwrap();

        let (mut server_reader, _server_writer) = split(server);
        let frame = server_reader.next().await.unwrap().unwrap();
        assert_eq!(frame.message().unwrap().seq(), 4);
    }
}
