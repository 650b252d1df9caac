//! Testing utilities for the debugger.
//!
//! [`MockAdapter`] plays the adapter side of an in-memory connection so
//! tests can script exactly what the adapter says and check what the client
//! sent.

use std::sync::atomic::{AtomicI64, Ordering};

use eyre::{OptionExt, WrapErr};
use futures::StreamExt;
use serde_json::{Value, json};
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::Mutex;
use tokio::time::{Duration, timeout};
use transport::testing::MemoryTransport;
use transport::{
    DapReader, DapWriter, Event, Message, OutgoingMessage, Request, Response, Seq, split,
};

const DEFAULT_WAIT: Duration = Duration::from_secs(5);

/// A scripted debug adapter.
///
/// Reading and writing are independent, so a test may wait for one request
/// while another task answers a different one.
pub struct MockAdapter {
    reader: Mutex<DapReader<DuplexStream>>,
    writer: Mutex<Option<DapWriter<DuplexStream>>>,
    sequence: AtomicI64,
}

/// A client-side transport and the mock adapter on the other end of it.
pub fn connected() -> (MemoryTransport, MockAdapter) {
    let (client, adapter) = MemoryTransport::pair();
    (client, MockAdapter::new(adapter))
}

impl MockAdapter {
    pub fn new(transport: MemoryTransport) -> Self {
        let (reader, writer) = split(transport);
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(Some(writer)),
            sequence: AtomicI64::new(1),
        }
    }

    fn next_seq(&self) -> Seq {
        self.sequence.fetch_add(1, Ordering::SeqCst)
    }

    /// The next message from the client, or `None` once it hung up.
    pub async fn recv(&self) -> Option<Message> {
        let mut reader = self.reader.lock().await;
        match reader.next().await {
            Some(Ok(frame)) => frame.message().ok(),
            _ => None,
        }
    }

    /// Wait for a request with the given command, skipping anything else.
    pub async fn expect_request(&self, command: &str) -> eyre::Result<Request> {
        timeout(DEFAULT_WAIT, async {
            loop {
                match self.recv().await {
                    Some(Message::Request(request)) if request.command == command => {
                        return Ok(request);
                    }
                    Some(other) => {
                        tracing::debug!(?other, "skipping message while waiting for '{command}'");
                    }
                    None => eyre::bail!("client hung up while waiting for '{command}'"),
                }
            }
        })
        .await
        .wrap_err_with(|| format!("timeout waiting for '{command}' request"))?
    }

    /// Wait for the client's answer to one of our reverse requests.
    pub async fn expect_response(&self, request_seq: Seq) -> eyre::Result<Response> {
        timeout(DEFAULT_WAIT, async {
            loop {
                match self.recv().await {
                    Some(Message::Response(response)) if response.request_seq == request_seq => {
                        return Ok(response);
                    }
                    Some(other) => tracing::debug!(?other, "skipping message"),
                    None => eyre::bail!("client hung up while waiting for response"),
                }
            }
        })
        .await
        .wrap_err("timeout waiting for response")?
    }

    async fn send(&self, message: OutgoingMessage) -> eyre::Result<()> {
        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut().ok_or_eyre("mock adapter already closed")?;
        writer.send(message).await.wrap_err("sending to client")
    }

    /// Answer `request` successfully.
    pub async fn respond(&self, request: &Request, body: Option<Value>) -> eyre::Result<()> {
        self.send(OutgoingMessage::Response(Response {
            seq: self.next_seq(),
            request_seq: request.seq,
            success: true,
            command: request.command.clone(),
            message: None,
            body,
        }))
        .await
    }

    /// Reject `request`, optionally with a structured error body.
    pub async fn respond_error(
        &self,
        request: &Request,
        message: &str,
        body: Option<Value>,
    ) -> eyre::Result<()> {
        self.send(OutgoingMessage::Response(Response {
            seq: self.next_seq(),
            request_seq: request.seq,
            success: false,
            command: request.command.clone(),
            message: Some(message.to_string()),
            body,
        }))
        .await
    }

    pub async fn send_event(&self, event: &str, body: Option<Value>) -> eyre::Result<()> {
        self.send(OutgoingMessage::Event(Event {
            seq: self.next_seq(),
            event: event.to_string(),
            body,
        }))
        .await
    }

    pub async fn send_initialized_event(&self) -> eyre::Result<()> {
        self.send_event("initialized", None).await
    }

    pub async fn send_stopped_event(&self, thread_id: i64, reason: &str) -> eyre::Result<()> {
        self.send_event(
            "stopped",
            Some(json!({
                "reason": reason,
                "threadId": thread_id,
            })),
        )
        .await
    }

    pub async fn send_continued_event(&self, thread_id: i64) -> eyre::Result<()> {
        self.send_event("continued", Some(json!({ "threadId": thread_id })))
            .await
    }

    pub async fn send_terminated_event(&self) -> eyre::Result<()> {
        self.send_event("terminated", None).await
    }

    /// Issue a reverse request and return its sequence number.
    pub async fn send_reverse_request(
        &self,
        command: &str,
        arguments: Option<Value>,
    ) -> eyre::Result<Seq> {
        let seq = self.next_seq();
        self.send(OutgoingMessage::Request(Request {
            seq,
            command: command.to_string(),
            arguments,
        }))
        .await?;
        Ok(seq)
    }

    /// Write bytes to the client as-is.
    pub async fn send_raw(&self, bytes: &[u8]) -> eyre::Result<()> {
        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut().ok_or_eyre("mock adapter already closed")?;
        writer.get_mut().write_all(bytes).await?;
        Ok(())
    }

    /// Answer `initialize` with the given capabilities.
    pub async fn handshake(&self, capabilities: Value) -> eyre::Result<()> {
        let request = self.expect_request("initialize").await?;
        self.respond(&request, Some(capabilities)).await
    }

    /// Hang up the adapter side of the connection.
    pub async fn close(&self) {
        drop(self.writer.lock().await.take());
    }
}
