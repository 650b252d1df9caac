//! Framed halves of a DAP transport.
//!
//! [`DapReader`] turns an `AsyncRead` into a `Stream` of [`Frame`]s and
//! [`DapWriter`] turns an `AsyncWrite` into a `Sink` of [`OutgoingMessage`]s.
//! Both are thin layers over `tokio_util`'s framed adapters so the rest of the
//! engine never handles raw bytes.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::{Sink, SinkExt, Stream};
use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::codec::{DapCodec, Frame};
use crate::error::CodecError;
use crate::message::OutgoingMessage;

pin_project! {
    /// Incoming half: yields one [`Frame`] per DAP message.
    ///
    /// How the source chunks its bytes does not matter. The stream ends
    /// after a clean end of input between frames, or after the first error
    /// item.
    pub struct DapReader<R> {
        #[pin]
        frames: FramedRead<R, DapCodec>,
    }
}

impl<R: AsyncRead + Unpin> DapReader<R> {
    pub fn new(source: R) -> Self {
        Self::with_codec(source, DapCodec::default())
    }

    /// Read with a codec configured by the caller, e.g. a different body
    /// size limit.
    pub fn with_codec(source: R, codec: DapCodec) -> Self {
        Self {
            frames: FramedRead::new(source, codec),
        }
    }

    /// Bytes received but not yet part of a complete frame.
    pub fn buffered_len(&self) -> usize {
        self.frames.read_buffer().len()
    }

    pub fn into_inner(self) -> R {
        self.frames.into_inner()
    }
}

impl<R: AsyncRead + Unpin> Stream for DapReader<R> {
    type Item = Result<Frame, CodecError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.project().frames.poll_next(cx)
    }
}

pin_project! {
    /// Outgoing half: encodes and flushes one message per send.
    ///
    /// A send never leaves half a frame behind in the buffer, but the writer
    /// is not shared between tasks by itself; put it behind a lock.
    pub struct DapWriter<W> {
        #[pin]
        frames: FramedWrite<W, DapCodec>,
    }
}

impl<W: AsyncWrite + Unpin> DapWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            frames: FramedWrite::new(sink, DapCodec::default()),
        }
    }

    /// Encode `message`, write it and flush.
    pub async fn send(&mut self, message: OutgoingMessage) -> Result<(), CodecError> {
        self.frames.send(message).await
    }

    /// Flush anything pending and shut the destination down.
    pub async fn close(&mut self) -> Result<(), CodecError> {
        SinkExt::close(&mut self.frames).await
    }

    /// The raw destination. Since every send flushes, writing here directly
    /// never interleaves with a partly written frame.
    pub fn get_mut(&mut self) -> &mut W {
        self.frames.get_mut()
    }

    pub fn into_inner(self) -> W {
        self.frames.into_inner()
    }
}

impl<W: AsyncWrite + Unpin> Sink<OutgoingMessage> for DapWriter<W> {
    type Error = CodecError;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), CodecError>> {
        self.project().frames.poll_ready(cx)
    }

    fn start_send(self: Pin<&mut Self>, message: OutgoingMessage) -> Result<(), CodecError> {
        self.project().frames.start_send(message)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), CodecError>> {
        self.project().frames.poll_flush(cx)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), CodecError>> {
        self.project().frames.poll_close(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Event, Message, Request, Response};
    use futures::StreamExt;
    use std::io::Cursor;
    use tokio::io::AsyncWriteExt;

    fn wire(bodies: &[&str]) -> Vec<u8> {
        bodies
            .iter()
            .flat_map(|body| format!("Content-Length: {}\r\n\r\n{body}", body.len()).into_bytes())
            .collect()
    }

    #[tokio::test]
    async fn reader_yields_frames_in_order() {
        let input = wire(&[
            r#"{"seq":1,"type":"event","event":"initialized"}"#,
            r#"{"seq":2,"type":"response","request_seq":1,"success":true,"command":"threads"}"#,
            r#"{"seq":3,"type":"request","command":"runInTerminal"}"#,
        ]);
        let mut reader = DapReader::new(Cursor::new(input));

        let mut kinds = Vec::new();
        while let Some(frame) = reader.next().await {
            kinds.push(match frame.unwrap().message().unwrap() {
                Message::Event(_) => "event",
                Message::Response(_) => "response",
                Message::Request(_) => "request",
            });
        }
        assert_eq!(kinds, ["event", "response", "request"]);
        assert_eq!(reader.buffered_len(), 0);
    }

    #[tokio::test]
    async fn reader_reassembles_dribbled_input() {
        let body = r#"{"seq":9,"type":"event","event":"output","body":{"output":"hi"}}"#;
        let input = wire(&[body, body]);
        let (mut tx, rx) = tokio::io::duplex(2);

        let dribble = tokio::spawn(async move {
            for chunk in input.chunks(3) {
                tx.write_all(chunk).await.unwrap();
            }
        });

        let mut reader = DapReader::new(rx);
        for _ in 0..2 {
            let frame = reader.next().await.unwrap().unwrap();
            assert_eq!(frame.body, body.as_bytes());
        }
        dribble.await.unwrap();
        assert!(reader.next().await.is_none());
    }

    #[tokio::test]
    async fn reader_respects_codec_limit() {
        let body = r#"{"seq":1,"type":"event","event":"a-rather-long-event-name"}"#;
        let mut reader = DapReader::with_codec(Cursor::new(wire(&[body])), DapCodec::with_max_size(16));

        let err = reader.next().await.unwrap().unwrap_err();
        assert!(matches!(err, CodecError::MessageTooLarge { .. }));
    }

    #[tokio::test]
    async fn reader_reports_input_cut_mid_frame() {
        let mut reader = DapReader::new(Cursor::new(b"Content-Length: 40\r\n\r\n{\"se".to_vec()));

        let err = reader.next().await.unwrap().unwrap_err();
        assert!(err.is_closed());
    }

    #[tokio::test]
    async fn writer_frames_every_kind_of_message() {
        let mut writer = DapWriter::new(Cursor::new(Vec::new()));

        writer
            .send(OutgoingMessage::Request(Request {
                seq: 1,
                command: "initialize".to_string(),
                arguments: None,
            }))
            .await
            .unwrap();
        writer
            .send(OutgoingMessage::Response(Response {
                seq: 2,
                request_seq: 7,
                success: true,
                command: "runInTerminal".to_string(),
                message: None,
                body: None,
            }))
            .await
            .unwrap();
        writer
            .send(OutgoingMessage::Event(Event {
                seq: 3,
                event: "output".to_string(),
                body: None,
            }))
            .await
            .unwrap();

        let written = writer.into_inner().into_inner();
        let mut reader = DapReader::new(Cursor::new(written));
        let mut seqs = Vec::new();
        while let Some(frame) = reader.next().await {
            seqs.push(frame.unwrap().message().unwrap().seq());
        }
        assert_eq!(seqs, [1, 2, 3]);
    }

    #[tokio::test]
    async fn raw_writes_follow_sent_frames() {
        let mut writer = DapWriter::new(Cursor::new(Vec::new()));
        writer
            .send(OutgoingMessage::Event(Event {
                seq: 1,
                event: "stopped".to_string(),
                body: None,
            }))
            .await
            .unwrap();
        writer.get_mut().write_all(b"garbage").await.unwrap();

        let written = String::from_utf8(writer.into_inner().into_inner()).unwrap();
        assert!(written.starts_with("Content-Length: "));
        assert!(written.ends_with("}garbage"));
    }
}
