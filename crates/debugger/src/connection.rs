//! The protocol engine: one live connection to a debug adapter.
//!
//! A [`Connection`] exclusively owns its transport. Requests are correlated
//! with responses by sequence number, events are fanned out to subscribers,
//! and reverse requests are answered through a [`ReverseRequestHandler`].
//! A single read loop task drives all inbound traffic; when it ends, for any
//! reason, the connection tears down and every waiting caller is released.

use std::future::Future;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::StreamExt;
use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Child;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use transport::{
    DapCodec, DapReader, DapTransport, DapWriter, Event, Frame, Message, OutgoingMessage,
    ParseError, Request, Response, Seq,
};

use crate::dispatch::{Dispatcher, EventHandler};
use crate::error::{AdapterError, Error, Result};
use crate::pending_requests::{PendingRequests, ResponseReceiver};

/// Attempts made when dialing a remote adapter, unless configured otherwise.
pub const DEFAULT_DIAL_ATTEMPTS: usize = 6;

type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// How to answer a reverse request from the adapter.
#[derive(Debug, Clone, PartialEq)]
pub enum ReverseReply {
    /// Reply with `success: true` and an optional body.
    Success(Option<Value>),
    /// Reply with `success: false` and this message.
    Failure(String),
    /// Not a command this client knows; log it and send nothing.
    Unhandled,
}

/// Produces replies to adapter-initiated requests such as `runInTerminal`.
///
/// Each request is handled on its own task, so a slow handler never holds up
/// the read loop.
pub trait ReverseRequestHandler: Send + Sync + 'static {
    fn handle(&self, request: Request) -> BoxFuture<'static, ReverseReply>;
}

impl<F, Fut> ReverseRequestHandler for F
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ReverseReply> + Send + 'static,
{
    fn handle(&self, request: Request) -> BoxFuture<'static, ReverseReply> {
        Box::pin(self(request))
    }
}

/// Leaves every reverse request unanswered.
#[derive(Debug, Clone, Copy, Default)]
pub struct IgnoreReverseRequests;

impl ReverseRequestHandler for IgnoreReverseRequests {
    fn handle(&self, _request: Request) -> BoxFuture<'static, ReverseReply> {
        Box::pin(async { ReverseReply::Unhandled })
    }
}

/// Everything a connection needs besides the transport itself.
#[derive(Clone)]
pub struct ConnectionOptions {
    /// Event subscribers, fixed for the lifetime of the connection.
    pub subscribers: Vec<EventHandler>,
    /// Called on the read loop for every event, before any subscriber sees
    /// it. Must return quickly.
    pub observers: Vec<EventHandler>,
    pub reverse_handler: Arc<dyn ReverseRequestHandler>,
    /// How long a dial-back adapter may take to connect. `None` waits until
    /// the adapter connects or exits.
    pub accept_timeout: Option<Duration>,
    /// Connection attempts when dialing a remote adapter.
    pub dial_attempts: usize,
    /// Largest accepted message body. `None` keeps the codec default.
    pub max_message_size: Option<usize>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            subscribers: Vec::new(),
            observers: Vec::new(),
            reverse_handler: Arc::new(IgnoreReverseRequests),
            accept_timeout: None,
            dial_attempts: DEFAULT_DIAL_ATTEMPTS,
            max_message_size: None,
        }
    }
}

impl ConnectionOptions {
    /// Add an event subscriber.
    pub fn subscribe(mut self, handler: impl Fn(Event) + Send + Sync + 'static) -> Self {
        self.subscribers.push(Arc::new(handler));
        self
    }

    pub fn with_reverse_handler(mut self, handler: impl ReverseRequestHandler) -> Self {
        self.reverse_handler = Arc::new(handler);
        self
    }

    pub fn with_accept_timeout(mut self, timeout: Duration) -> Self {
        self.accept_timeout = Some(timeout);
        self
    }

    pub(crate) fn dispatcher(&self) -> Dispatcher {
        Dispatcher::spawn(self.observers.clone(), self.subscribers.clone())
    }

    pub(crate) fn codec(&self) -> DapCodec {
        match self.max_message_size {
            Some(max) => DapCodec::with_max_size(max),
            None => DapCodec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum ProcessState {
    Running,
    Exited(Option<ExitStatus>),
}

struct Shared {
    writer: tokio::sync::Mutex<Option<DapWriter<BoxedWrite>>>,
    sequence: AtomicI64,
    pending: Mutex<PendingRequests>,
    dispatcher: Dispatcher,
    reverse_handler: Arc<dyn ReverseRequestHandler>,
    /// Cancelled when teardown starts.
    cancel: CancellationToken,
    /// Cancelled when teardown has finished.
    done: CancellationToken,
}

/// A live connection to a debug adapter.
pub struct Connection {
    shared: Arc<Shared>,
    process: Option<watch::Receiver<ProcessState>>,
}

impl Connection {
    /// Start a connection over an already-established transport.
    ///
    /// This is useful for testing with in-memory transports, or for adapters
    /// reached by means this crate does not manage. Must be called inside a
    /// tokio runtime; the read loop is running when this returns.
    pub fn with_transport<T: DapTransport>(transport: T, options: &ConnectionOptions) -> Self {
        let (read, write) = transport.into_split();
        Self::start(
            read,
            write,
            options.dispatcher(),
            Arc::clone(&options.reverse_handler),
            None,
            options.codec(),
        )
    }

    pub(crate) fn start<R, W>(
        read: R,
        write: W,
        dispatcher: Dispatcher,
        reverse_handler: Arc<dyn ReverseRequestHandler>,
        child: Option<Child>,
        codec: DapCodec,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let shared = Arc::new(Shared {
            writer: tokio::sync::Mutex::new(Some(DapWriter::new(Box::new(write) as BoxedWrite))),
            sequence: AtomicI64::new(0),
            pending: Mutex::new(PendingRequests::new()),
            dispatcher,
            reverse_handler,
            cancel: cancel.clone(),
            done: CancellationToken::new(),
        });

        let process = child.map(|child| spawn_process_monitor(child, cancel));
        tokio::spawn(read_loop(
            DapReader::with_codec(read, codec),
            Arc::clone(&shared),
        ));

        Self { shared, process }
    }

    /// Send a request and wait for its response.
    ///
    /// A response with `success: false` becomes [`Error::Adapter`]. If the
    /// connection tears down first, the call fails with
    /// [`Error::ConnectionClosed`].
    #[tracing::instrument(skip(self, arguments))]
    pub async fn send_request(&self, command: &str, arguments: Option<Value>) -> Result<Response> {
        let request = OutgoingMessage::Request(Request {
            seq: 0,
            command: command.to_string(),
            arguments,
        });
        let (seq, receiver) = self.shared.transmit(request, true).await?;
        let Some(receiver) = receiver else {
            return Err(Error::ConnectionClosed);
        };

        let response = receiver.await.map_err(|_| Error::ConnectionClosed)??;
        tracing::debug!(seq, success = response.success, "received response");

        if response.success {
            Ok(response)
        } else {
            Err(AdapterError::from_response(&response).into())
        }
    }

    /// Send a request with typed arguments and decode the response body.
    pub async fn request<A, R>(&self, command: &str, arguments: &A) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let arguments =
            serde_json::to_value(arguments).map_err(|source| Error::EncodeArguments {
                command: command.to_string(),
                source,
            })?;
        let arguments = (!arguments.is_null()).then_some(arguments);

        let response = self.send_request(command, arguments).await?;
        decode_body(response)
    }

    /// Write a message without waiting for any reply.
    ///
    /// The connection assigns the message's sequence number, which is
    /// returned.
    pub async fn send_message(&self, message: OutgoingMessage) -> Result<Seq> {
        let (seq, _) = self.shared.transmit(message, false).await?;
        Ok(seq)
    }

    /// Tear the connection down.
    ///
    /// Closes the send stream, stops the read loop, kills the adapter process
    /// if this connection owns one, and fails every pending request. Calling
    /// it again does nothing.
    pub async fn stop(&self) {
        if !self.shared.cancel.is_cancelled() {
            tracing::info!("stopping connection");
        }
        self.shared.teardown().await;
    }

    /// Start teardown without waiting for it to finish.
    pub(crate) fn abort(&self) {
        self.shared.cancel.cancel();
    }

    /// Wait for the owned adapter process to exit.
    ///
    /// Returns `None` straight away for connections without a process, and
    /// when the exit status could not be collected.
    pub async fn wait(&self) -> Option<ExitStatus> {
        let mut process = self.process.clone()?;
        let state = process
            .wait_for(|state| matches!(state, ProcessState::Exited(_)))
            .await
            .ok()
            .map(|state| *state);
        match state {
            Some(ProcessState::Exited(status)) => status,
            _ => None,
        }
    }

    /// Resolves once the connection has torn down, for whatever reason.
    pub async fn closed(&self) {
        self.shared.done.cancelled().await
    }

    pub fn is_closed(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    pub fn has_process(&self) -> bool {
        self.process.is_some()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

impl Shared {
    fn pending(&self) -> MutexGuard<'_, PendingRequests> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stamp `message` with the next sequence number and write it.
    ///
    /// Sequence allocation happens under the write lock, so numbers appear on
    /// the wire in increasing order.
    async fn transmit(
        &self,
        mut message: OutgoingMessage,
        expect_response: bool,
    ) -> Result<(Seq, Option<ResponseReceiver>)> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(Error::ConnectionClosed)?;

        let seq = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        message.set_seq(seq);
        let receiver = if expect_response {
            Some(self.pending().register(seq)?)
        } else {
            None
        };

        tracing::debug!(seq, "writing message");
        let written = tokio::select! {
            written = writer.send(message) => Some(written),
            _ = self.cancel.cancelled() => None,
        };

        let error = match written {
            Some(Ok(())) => return Ok((seq, receiver)),
            Some(Err(e)) => {
                if e.is_closed() {
                    tracing::warn!(error = %e, "debug adapter stopped accepting messages");
                    self.cancel.cancel();
                }
                Error::Write(e)
            }
            None => Error::ConnectionClosed,
        };

        if receiver.is_some() {
            self.pending().cancel(seq);
        }
        Err(error)
    }

    async fn teardown(&self) {
        self.cancel.cancel();

        let released = self.pending().close();
        if released > 0 {
            tracing::debug!(released, "failed pending requests on teardown");
        }

        // dropping the writer closes the send stream
        drop(self.writer.lock().await.take());
        self.done.cancel();
    }

    fn route(self: &Arc<Self>, frame: Frame) {
        match frame.message() {
            Ok(Message::Response(response)) => {
                let request_seq = response.request_seq;
                let command = response.command.clone();
                if !self.pending().resolve(response) {
                    tracing::warn!(request_seq, %command, "dropping response to unknown request");
                }
            }
            Ok(Message::Event(event)) => {
                tracing::debug!(event = %event.event, seq = event.seq, "received event");
                self.dispatcher.dispatch(event);
            }
            Ok(Message::Request(request)) => {
                tracing::debug!(command = %request.command, seq = request.seq, "received reverse request");
                self.answer_reverse_request(request);
            }
            Err(ParseError::UnknownKind(kind)) => {
                tracing::warn!(%kind, "ignoring message of unknown type");
            }
            Err(error) => {
                tracing::warn!(%error, body = %String::from_utf8_lossy(&frame.body), "ignoring unreadable message");
            }
        }
    }

    fn answer_reverse_request(self: &Arc<Self>, request: Request) {
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            let command = request.command.clone();
            let request_seq = request.seq;

            let (success, message, body) = match shared.reverse_handler.handle(request).await {
                ReverseReply::Success(body) => (true, None, body),
                ReverseReply::Failure(message) => (false, Some(message), None),
                ReverseReply::Unhandled => {
                    tracing::warn!(%command, request_seq, "ignoring unrecognized reverse request");
                    return;
                }
            };

            let reply = OutgoingMessage::Response(Response {
                seq: 0,
                request_seq,
                success,
                command: command.clone(),
                message,
                body,
            });
            if let Err(error) = shared.transmit(reply, false).await {
                tracing::warn!(%command, request_seq, %error, "could not answer reverse request");
            }
        });
    }
}

pub(crate) fn decode_body<R: DeserializeOwned>(response: Response) -> Result<R> {
    serde_json::from_value(response.body.unwrap_or(Value::Null)).map_err(|source| {
        Error::MalformedBody {
            command: response.command,
            source,
        }
    })
}

async fn read_loop<R>(mut reader: DapReader<R>, shared: Arc<Shared>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    loop {
        let frame = tokio::select! {
            _ = shared.cancel.cancelled() => {
                tracing::debug!("read loop cancelled");
                break;
            }
            frame = reader.next() => frame,
        };

        match frame {
            Some(Ok(frame)) => shared.route(frame),
            Some(Err(error)) if error.is_closed() => {
                tracing::info!(%error, buffered = reader.buffered_len(), "debug adapter closed the connection");
                break;
            }
            Some(Err(error)) => {
                tracing::error!(%error, "protocol violation, closing connection");
                break;
            }
            None => {
                tracing::info!("debug adapter closed the connection");
                break;
            }
        }
    }

    shared.teardown().await;
}

/// Owns the adapter process: kills it when the connection is cancelled, and
/// cancels the connection when it exits.
fn spawn_process_monitor(
    mut child: Child,
    cancel: CancellationToken,
) -> watch::Receiver<ProcessState> {
    let (tx, rx) = watch::channel(ProcessState::Running);
    let pid = child.id();

    tokio::spawn(async move {
        let exited = tokio::select! {
            status = child.wait() => Some(status),
            _ = cancel.cancelled() => None,
        };

        let status = match exited {
            Some(status) => status,
            None => {
                tracing::debug!(?pid, "killing debug adapter");
                if let Err(error) = child.start_kill() {
                    tracing::debug!(?pid, %error, "could not kill debug adapter");
                }
                child.wait().await
            }
        };

        let status = match status {
            Ok(status) => {
                tracing::info!(?pid, %status, "debug adapter exited");
                Some(status)
            }
            Err(error) => {
                tracing::warn!(?pid, %error, "could not collect debug adapter exit status");
                None
            }
        };

        cancel.cancel();
        let _ = tx.send(ProcessState::Exited(status));
    });

    rx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_body_reports_command() {
        let response = Response {
            seq: 2,
            request_seq: 1,
            success: true,
            command: "threads".to_string(),
            message: None,
            body: Some(serde_json::json!({"threads": "nope"})),
        };

        #[derive(serde::Deserialize)]
        #[allow(dead_code)]
        struct Threads {
            threads: Vec<String>,
        }

        let err = decode_body::<Threads>(response).err().unwrap();
        assert!(matches!(err, Error::MalformedBody { ref command, .. } if command == "threads"));
    }

    #[test]
    fn missing_body_decodes_as_unit() {
        let response = Response {
            seq: 2,
            request_seq: 1,
            success: true,
            command: "continue".to_string(),
            message: None,
            body: None,
        };
        decode_body::<()>(response).unwrap();
    }
}
