//! Getting a byte stream to a debug adapter.
//!
//! A [`RunSpec`] says how the adapter is reached: spawned with its standard
//! streams as the transport, spawned and left to dial back to a loopback
//! listener, or dialed at a known address. [`acquire`] turns one into a
//! running [`Connection`]. On failure nothing is left behind: spawned
//! adapters are killed and sockets closed.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::process::Stdio;
use std::time::Duration;

use retry::{delay::Exponential, retry};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::process::{Child, Command};
use transport::Event;

use crate::connection::{Connection, ConnectionOptions};
use crate::dispatch::Dispatcher;
use crate::error::{Error, Result};

/// Replaced with the dial-back listener's address in the adapter command.
pub const CLIENT_ADDR_PLACEHOLDER: &str = "${CLIENT_ADDR}";

/// How to reach a debug adapter.
///
/// Deserializes from `{"kind": "subprocess", "command": [...], "dialClient": bool}`
/// or `{"kind": "remote", "address": "host:port"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RunSpec {
    /// Start the adapter as a child process.
    Subprocess {
        command: Vec<String>,
        /// The adapter connects back to us instead of talking over stdio.
        #[serde(rename = "dialClient", default)]
        dial_client: bool,
    },
    /// Dial an adapter that is already running.
    Remote { address: String },
}

/// Establish a connection as described by `spec`.
pub async fn acquire(spec: &RunSpec, options: &ConnectionOptions) -> Result<Connection> {
    match spec {
        RunSpec::Subprocess {
            command,
            dial_client: false,
        } => spawn_stdio(command, options).await,
        RunSpec::Subprocess {
            command,
            dial_client: true,
        } => spawn_dial_back(command, options).await,
        RunSpec::Remote { address } => dial(address, options).await,
    }
}

/// Replace every occurrence of [`CLIENT_ADDR_PLACEHOLDER`] in `command`.
pub fn substitute_client_addr(command: &[String], address: SocketAddr) -> Vec<String> {
    let address = address.to_string();
    command
        .iter()
        .map(|arg| arg.replace(CLIENT_ADDR_PLACEHOLDER, &address))
        .collect()
}

fn adapter_command(argv: &[String]) -> Result<Command> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| Error::InvalidRunSpec("subprocess command is empty".to_string()))?;
    let mut command = Command::new(program);
    command.args(args).kill_on_drop(true);
    Ok(command)
}

fn spawn(mut command: Command, argv: &[String]) -> Result<Child> {
    tracing::info!(command = %argv.join(" "), "starting debug adapter");
    command.spawn().map_err(|source| Error::Spawn {
        program: argv[0].clone(),
        source,
    })
}

fn missing_pipe(argv: &[String], name: &str) -> Error {
    Error::Spawn {
        program: argv[0].clone(),
        source: io::Error::other(format!("{name} was not captured")),
    }
}

async fn spawn_stdio(argv: &[String], options: &ConnectionOptions) -> Result<Connection> {
    let mut command = adapter_command(argv)?;
    command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = spawn(command, argv)?;
    let stdin = child.stdin.take().ok_or_else(|| missing_pipe(argv, "stdin"))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| missing_pipe(argv, "stdout"))?;
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(log_stderr(stderr));
    }

    Ok(Connection::start(
        stdout,
        stdin,
        options.dispatcher(),
        options.reverse_handler.clone(),
        Some(child),
        options.codec(),
    ))
}

async fn log_stderr(stderr: impl AsyncRead + Unpin) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => tracing::info!(%line, "debug adapter stderr"),
            Ok(None) => break,
            Err(error) => {
                tracing::debug!(%error, "stopped reading debug adapter stderr");
                break;
            }
        }
    }
}

async fn spawn_dial_back(argv: &[String], options: &ConnectionOptions) -> Result<Connection> {
    let listener = DialBackListener::bind().await?;
    let argv = substitute_client_addr(argv, listener.address());

    let mut command = adapter_command(&argv)?;
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = spawn(command, &argv)?;

    // the adapter's own output is not protocol traffic here
    let dispatcher = options.dispatcher();
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(broadcast_as_output("stdout", stdout, dispatcher.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(broadcast_as_output("stderr", stderr, dispatcher.clone()));
    }

    let stream = match listener
        .accept_one(Some(&mut child), options.accept_timeout)
        .await
    {
        Ok(stream) => stream,
        Err(error) => {
            if let Err(kill_error) = child.start_kill() {
                tracing::debug!(error = %kill_error, "debug adapter already gone");
            }
            return Err(error);
        }
    };

    let (read, write) = stream.into_split();
    Ok(Connection::start(
        read,
        write,
        dispatcher,
        options.reverse_handler.clone(),
        Some(child),
        options.codec(),
    ))
}

/// Re-emit each line of `stream` as a synthetic `output` event.
async fn broadcast_as_output(
    category: &'static str,
    stream: impl AsyncRead + Unpin,
    dispatcher: Dispatcher,
) {
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        dispatcher.dispatch(output_event(category, &line));
    }
    tracing::debug!(category, "debug adapter output stream ended");
}

pub(crate) fn output_event(category: &str, line: &str) -> Event {
    Event {
        seq: 0,
        event: "output".to_string(),
        body: Some(json!({
            "category": category,
            "output": format!("{line}\n"),
        })),
    }
}

/// A loopback listener that accepts exactly one connection.
pub struct DialBackListener {
    listener: TcpListener,
    address: SocketAddr,
}

impl DialBackListener {
    /// Bind to an ephemeral port on 127.0.0.1.
    pub async fn bind() -> Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .map_err(Error::Bind)?;
        let address = listener.local_addr().map_err(Error::Bind)?;
        tracing::debug!(%address, "waiting for debug adapter to connect back");
        Ok(Self { listener, address })
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Accept the first inbound connection and close the listener.
    ///
    /// Gives up if `child` exits first, or once `timeout` elapses.
    pub async fn accept_one(
        self,
        child: Option<&mut Child>,
        timeout: Option<Duration>,
    ) -> Result<TcpStream> {
        let exited = async {
            match child {
                Some(child) => {
                    let status = match child.wait().await {
                        Ok(status) => status.to_string(),
                        Err(error) => error.to_string(),
                    };
                    Error::AdapterExited { status }
                }
                None => std::future::pending().await,
            }
        };
        let deadline = async {
            match timeout {
                Some(timeout) => {
                    tokio::time::sleep(timeout).await;
                    Error::AcceptTimeout(timeout)
                }
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            accepted = self.listener.accept() => {
                let (stream, peer) = accepted.map_err(Error::Accept)?;
                tracing::info!(%peer, "debug adapter connected back");
                Ok(stream)
            }
            error = exited => Err(error),
            error = deadline => Err(error),
        }
    }
}

async fn dial(address: &str, options: &ConnectionOptions) -> Result<Connection> {
    let stream = connect_with_retry(address, options.dial_attempts).await?;
    tracing::info!(%address, "connected to debug adapter");

    let (read, write) = stream.into_split();
    Ok(Connection::start(
        read,
        write,
        options.dispatcher(),
        options.reverse_handler.clone(),
        None,
        options.codec(),
    ))
}

async fn connect_with_retry(address: &str, attempts: usize) -> Result<TcpStream> {
    let target = address.to_string();
    let retries = attempts.saturating_sub(1);

    let connected = tokio::task::spawn_blocking(move || {
        retry(Exponential::from_millis(200).take(retries), || {
            tracing::debug!(address = %target, "trying to make connection");
            match std::net::TcpStream::connect(&target) {
                Ok(stream) => {
                    tracing::debug!("connection made");
                    Ok(stream)
                }
                Err(e) => {
                    tracing::debug!(error = %e, "error making connection");
                    Err(e)
                }
            }
        })
    })
    .await
    .map_err(|join_error| Error::Dial {
        address: address.to_string(),
        source: io::Error::other(join_error),
    })?;

    let dial_error = |source| Error::Dial {
        address: address.to_string(),
        source,
    };
    let stream = connected.map_err(|e| dial_error(e.error))?;
    stream.set_nonblocking(true).map_err(dial_error)?;
    TcpStream::from_std(stream).map_err(dial_error)
}
