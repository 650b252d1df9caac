//! The session orchestrator.
//!
//! A [`Debugger`] is either idle or holds exactly one live [`Connection`].
//! It performs the `initialize` handshake, watches adapter events to keep
//! track of capabilities and where execution stopped, and exposes the
//! high-level operations collaborators use.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde_json::Value;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use transport::{DapTransport, Event};

use crate::acquire::{RunSpec, acquire};
use crate::connection::{Connection, ConnectionOptions};
use crate::dispatch::EventHandler;
use crate::error::{Error, Result};
use crate::types::{
    Breakpoint, Capabilities, CompletionItem, CompletionsArguments, CompletionsResponse,
    DisconnectArguments, EvaluateArguments, EvaluateResponse, InitializeArguments,
    ResumeArguments, SetBreakpointsResponse, SourceBreakpoints, StackFrameId,
    StackTraceArguments, StackTraceResponse, SteppingGranularity, StoppedEventBody,
    StoppedLocation, TerminateArguments, Thread, ThreadId, ThreadsResponse,
};

/// Handle to the debugging session state machine.
///
/// Cloning is cheap; clones share the same session.
#[derive(Clone)]
pub struct Debugger {
    inner: Arc<Inner>,
}

struct Inner {
    session: Mutex<Session>,
    /// Collaborator subscribers and connection settings.
    options: ConnectionOptions,
}

struct Session {
    /// Bumped for every session so stale background work can tell it is stale.
    generation: u64,
    /// Set while the transport is being acquired; cancelled by `stop`.
    starting: Option<CancellationToken>,
    connection: Option<Arc<Connection>>,
    capabilities: Option<Capabilities>,
    stopped: Option<StoppedLocation>,
    last_thread: Option<ThreadId>,
    /// Bumped whenever execution resumes.
    resume_epoch: u64,
    initialized: watch::Sender<bool>,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            generation: 0,
            starting: None,
            connection: None,
            capabilities: None,
            stopped: None,
            last_thread: None,
            resume_epoch: 0,
            initialized: watch::channel(false).0,
        }
    }
}

impl Default for Debugger {
    fn default() -> Self {
        Self::new(ConnectionOptions::default())
    }
}

impl Debugger {
    /// Create an idle debugger.
    ///
    /// The subscribers in `options` receive every adapter event of every
    /// session, after the debugger's own bookkeeping has seen it.
    pub fn new(options: ConnectionOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                session: Mutex::new(Session::default()),
                options,
            }),
        }
    }

    /// Start a session: reach the adapter and perform the `initialize`
    /// handshake.
    ///
    /// Fails with [`Error::AlreadyActive`] while a session is live or still
    /// starting. A `stop` during acquisition abandons it with
    /// [`Error::StartCancelled`]. If the handshake fails the connection is
    /// stopped and the debugger stays idle.
    pub async fn run(&self, spec: &RunSpec) -> Result<Arc<Connection>> {
        self.start(|options| async move { acquire(spec, &options).await })
            .await
    }

    /// Start a session over an already-established transport.
    pub async fn run_with_transport<T: DapTransport>(&self, transport: T) -> Result<Arc<Connection>> {
        self.start(|options| async move { Ok(Connection::with_transport(transport, &options)) })
            .await
    }

    async fn start<F, Fut>(&self, open: F) -> Result<Arc<Connection>>
    where
        F: FnOnce(ConnectionOptions) -> Fut,
        Fut: Future<Output = Result<Connection>>,
    {
        let (generation, cancel) = {
            let mut session = self.inner.session();
            if session.connection.is_some() || session.starting.is_some() {
                return Err(Error::AlreadyActive);
            }
            let generation = session.generation + 1;
            let cancel = CancellationToken::new();
            *session = Session {
                generation,
                starting: Some(cancel.clone()),
                ..Session::default()
            };
            (generation, cancel)
        };

        // dropping `open` on cancellation kills any adapter it spawned
        let opened = tokio::select! {
            opened = open(self.inner.session_options(generation)) => opened,
            _ = cancel.cancelled() => Err(Error::StartCancelled),
        };
        let connection = match opened {
            Ok(connection) => Arc::new(connection),
            Err(error) => {
                self.inner.abandon_start(generation);
                return Err(error);
            }
        };

        if !self.inner.install(generation, &connection) {
            tracing::info!(generation, "session stopped while starting");
            connection.stop().await;
            return Err(Error::StartCancelled);
        }
        self.inner.watch(generation, Arc::clone(&connection));
        tracing::info!(generation, "debug session started");

        match handshake(&connection).await {
            Ok(capabilities) => {
                let mut session = self.inner.session();
                if session.generation == generation {
                    session.capabilities = Some(capabilities);
                }
                Ok(connection)
            }
            Err(error) => {
                tracing::warn!(%error, "initialize handshake failed");
                self.inner.end_session(generation).await;
                Err(error)
            }
        }
    }

    /// End the current session, if any. Calling it when idle does nothing.
    pub async fn stop(&self) {
        let generation = self.inner.session().generation;
        self.inner.end_session(generation).await;
    }

    /// True from the start of `run` until the session ends.
    pub fn is_active(&self) -> bool {
        let session = self.inner.session();
        session.connection.is_some() || session.starting.is_some()
    }

    /// The live connection, if a session is active.
    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.inner.session().connection.clone()
    }

    /// Capabilities reported by the most recent `initialize` handshake.
    pub fn capabilities(&self) -> Option<Capabilities> {
        self.inner.session().capabilities.clone()
    }

    /// Where execution is currently stopped, if known.
    pub fn stopped_location(&self) -> Option<StoppedLocation> {
        self.inner.session().stopped.clone()
    }

    fn live(&self) -> Result<Arc<Connection>> {
        self.connection().ok_or(Error::NoSession)
    }

    pub async fn launch(&self, arguments: Value) -> Result<()> {
        self.live()?.send_request("launch", Some(arguments)).await?;
        Ok(())
    }

    pub async fn attach(&self, arguments: Value) -> Result<()> {
        self.live()?.send_request("attach", Some(arguments)).await?;
        Ok(())
    }

    /// Wait until the adapter has sent its `initialized` event.
    pub async fn wait_initialized(&self) -> Result<()> {
        let (connection, mut initialized) = {
            let session = self.inner.session();
            let connection = session.connection.clone().ok_or(Error::NoSession)?;
            (connection, session.initialized.subscribe())
        };

        tokio::select! {
            seen = initialized.wait_for(|seen| *seen) => {
                seen.map(|_| ()).map_err(|_| Error::ConnectionClosed)
            }
            _ = connection.closed() => Err(Error::ConnectionClosed),
        }
    }

    /// Send breakpoints and finish configuration.
    ///
    /// Waits for the `initialized` event, sends one `setBreakpoints` per
    /// source concurrently, then `configurationDone` if the adapter supports
    /// it. Returns the adapter's view of each source's breakpoints.
    pub async fn configure(&self, sources: &[SourceBreakpoints]) -> Result<Vec<Vec<Breakpoint>>> {
        self.wait_initialized().await?;
        let connection = self.live()?;

        let responses = futures::future::try_join_all(sources.iter().map(|source| {
            connection.request::<_, SetBreakpointsResponse>("setBreakpoints", source)
        }))
        .await?;

        let supports_done = self
            .capabilities()
            .is_some_and(|caps| caps.supports_configuration_done_request);
        if supports_done {
            connection.send_request("configurationDone", None).await?;
        } else {
            tracing::debug!("adapter does not support configurationDone");
        }

        Ok(responses.into_iter().map(|r| r.breakpoints).collect())
    }

    pub async fn continue_(&self) -> Result<()> {
        self.resume("continue", None).await
    }

    pub async fn next(&self, granularity: Option<SteppingGranularity>) -> Result<()> {
        self.resume("next", granularity).await
    }

    pub async fn step_in(&self) -> Result<()> {
        self.resume("stepIn", None).await
    }

    pub async fn step_out(&self) -> Result<()> {
        self.resume("stepOut", None).await
    }

    pub async fn step_back(&self) -> Result<()> {
        self.resume("stepBack", None).await
    }

    async fn resume(&self, command: &str, granularity: Option<SteppingGranularity>) -> Result<()> {
        let connection = self.live()?;
        let thread_id = self.inner.begin_resume();
        let arguments = ResumeArguments {
            thread_id,
            granularity,
        };
        connection.request::<_, Value>(command, &arguments).await?;
        Ok(())
    }

    /// Evaluate an expression, in `frame_id` or else the stopped frame.
    pub async fn evaluate(
        &self,
        expression: &str,
        context: &str,
        frame_id: Option<StackFrameId>,
    ) -> Result<String> {
        let connection = self.live()?;
        let arguments = EvaluateArguments {
            expression: expression.to_string(),
            frame_id: frame_id.or_else(|| self.stopped_frame_id()),
            context: Some(context.to_string()),
        };
        let response: EvaluateResponse = connection.request("evaluate", &arguments).await?;
        Ok(response.result)
    }

    pub async fn threads(&self) -> Result<Vec<Thread>> {
        let response = self.live()?.send_request("threads", None).await?;
        let body: ThreadsResponse = crate::connection::decode_body(response)?;
        Ok(body.threads)
    }

    pub async fn completions(
        &self,
        text: &str,
        column: i64,
        frame_id: Option<StackFrameId>,
        line: Option<i64>,
    ) -> Result<Vec<CompletionItem>> {
        let connection = self.live()?;
        let arguments = CompletionsArguments {
            frame_id: frame_id.or_else(|| self.stopped_frame_id()),
            text: text.to_string(),
            column,
            line,
        };
        let response: CompletionsResponse = connection.request("completions", &arguments).await?;
        Ok(response.targets)
    }

    pub async fn terminate(&self) -> Result<()> {
        self.live()?
            .request::<_, Value>("terminate", &TerminateArguments::default())
            .await?;
        Ok(())
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.live()?
            .request::<_, Value>("disconnect", &DisconnectArguments::default())
            .await?;
        Ok(())
    }

    fn stopped_frame_id(&self) -> Option<StackFrameId> {
        self.inner.session().stopped.as_ref().map(|s| s.frame.id)
    }
}

async fn handshake(connection: &Connection) -> Result<Capabilities> {
    let capabilities: Option<Capabilities> = connection
        .request("initialize", &InitializeArguments::default())
        .await?;
    Ok(capabilities.unwrap_or_default())
}

impl Inner {
    fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Collaborator options plus this session's bookkeeping, which observes
    /// every event on the read loop before any subscriber sees it.
    fn session_options(self: &Arc<Self>, generation: u64) -> ConnectionOptions {
        let weak = Arc::downgrade(self);
        let internal: EventHandler = Arc::new(move |event: Event| {
            if let Some(inner) = weak.upgrade() {
                inner.on_event(generation, event);
            }
        });

        let mut options = self.options.clone();
        options.observers.insert(0, internal);
        options
    }

    /// Move a starting session to active. False if it was stopped meanwhile.
    fn install(&self, generation: u64, connection: &Arc<Connection>) -> bool {
        let mut session = self.session();
        if session.generation != generation || session.starting.take().is_none() {
            return false;
        }
        session.connection = Some(Arc::clone(connection));
        true
    }

    fn abandon_start(&self, generation: u64) {
        let mut session = self.session();
        if session.generation == generation {
            session.starting = None;
        }
    }

    /// Return to idle when the connection goes away on its own.
    fn watch(self: &Arc<Self>, generation: u64, connection: Arc<Connection>) {
        let weak: Weak<Inner> = Arc::downgrade(self);
        tokio::spawn(async move {
            connection.closed().await;
            if let Some(inner) = weak.upgrade() {
                inner.end_session(generation).await;
            }
        });
    }

    async fn end_session(&self, generation: u64) {
        let (starting, connection) = {
            let mut session = self.session();
            if session.generation != generation {
                return;
            }
            session.stopped = None;
            session.last_thread = None;
            (session.starting.take(), session.connection.take())
        };

        if let Some(starting) = starting {
            tracing::info!(generation, "cancelling session start");
            starting.cancel();
        }

        if let Some(connection) = connection {
            tracing::info!(generation, "debug session ended");
            connection.stop().await;
        }
    }

    /// Forget the stopped location and return the thread to resume.
    fn begin_resume(&self) -> Option<ThreadId> {
        let mut session = self.session();
        session.stopped = None;
        session.resume_epoch += 1;
        session.last_thread
    }

    fn on_event(self: &Arc<Self>, generation: u64, event: Event) {
        match event.event.as_str() {
            "initialized" => {
                let session = self.session();
                if session.generation == generation {
                    session.initialized.send_replace(true);
                }
            }
            "continued" => {
                let mut session = self.session();
                if session.generation == generation {
                    session.stopped = None;
                    session.resume_epoch += 1;
                }
            }
            "stopped" => self.on_stopped(generation, event.body),
            "terminated" => {
                tracing::info!(generation, "debug adapter reported termination");
                let inner = Arc::clone(self);
                tokio::spawn(async move { inner.end_session(generation).await });
            }
            _ => {}
        }
    }

    fn on_stopped(self: &Arc<Self>, generation: u64, body: Option<Value>) {
        let body: StoppedEventBody = match serde_json::from_value(body.unwrap_or(Value::Null)) {
            Ok(body) => body,
            Err(error) => {
                tracing::warn!(%error, "ignoring malformed stopped event");
                return;
            }
        };
        let Some(thread_id) = body.thread_id else {
            tracing::debug!(reason = %body.reason, "stopped event names no thread");
            return;
        };

        let (connection, epoch) = {
            let mut session = self.session();
            if session.generation != generation {
                return;
            }
            session.last_thread = Some(thread_id);
            (session.connection.clone(), session.resume_epoch)
        };
        let Some(connection) = connection else {
            return;
        };

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let arguments = StackTraceArguments {
                thread_id,
                start_frame: None,
                levels: Some(1),
            };
            let trace: StackTraceResponse =
                match connection.request("stackTrace", &arguments).await {
                    Ok(trace) => trace,
                    Err(error) => {
                        tracing::warn!(thread_id, %error, "could not fetch stopped location");
                        return;
                    }
                };

            let Some(frame) = trace.stack_frames.into_iter().next() else {
                tracing::debug!(thread_id, "stopped thread has no frames");
                return;
            };

            let mut session = inner.session();
            if session.generation == generation && session.resume_epoch == epoch {
                tracing::debug!(thread_id, frame = frame.id, line = frame.line, "recorded stopped location");
                session.stopped = Some(StoppedLocation { thread_id, frame });
            }
        });
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let mut session = self.session();
        if let Some(starting) = session.starting.take() {
            starting.cancel();
        }
        if let Some(connection) = session.connection.take() {
            connection.abort();
        }
    }
}
