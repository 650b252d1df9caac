use std::io::IsTerminal;
use std::time::Duration;

use debugger::{
    ConnectionOptions, DialBackListener, Error, ErrorKind, Event, Request, ReverseReply, RunSpec,
    acquire,
};
use futures::StreamExt;
use serde_json::json;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;
use transport::{Message, OutgoingMessage, Response};

// test suite "constructor"
#[ctor::ctor]
fn init() {
    let in_ci = std::env::var("CI")
        .map(|val| val == "true")
        .unwrap_or(false);

    if std::io::stderr().is_terminal() || in_ci {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .try_init();
    } else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .json()
            .try_init();
    }

    // error traces
    let _ = color_eyre::install();
}

fn subprocess(command: &[&str], dial_client: bool) -> RunSpec {
    RunSpec::Subprocess {
        command: command.iter().map(|s| s.to_string()).collect(),
        dial_client,
    }
}

/// `cat` sends our own requests straight back, so each one arrives as a
/// reverse request whose answer `cat` echoes back as the response.
#[cfg(unix)]
#[tokio::test]
async fn stdio_subprocess_round_trip() -> eyre::Result<()> {
    let options = ConnectionOptions::default().with_reverse_handler(|request: Request| async move {
        ReverseReply::Success(Some(json!({ "echo": request.command })))
    });

    let connection = acquire(&subprocess(&["cat"], false), &options).await?;
    assert!(connection.has_process());

    let response = connection.send_request("ping", None).await?;
    assert_eq!(response.body, Some(json!({ "echo": "ping" })));

    connection.stop().await;
    let status = tokio::time::timeout(Duration::from_secs(5), connection.wait()).await?;
    assert!(status.is_some());
    assert!(connection.is_closed());
    Ok(())
}

#[cfg(unix)]
#[tokio::test]
async fn process_exit_closes_the_connection() -> eyre::Result<()> {
    let connection = acquire(
        &subprocess(&["sh", "-c", "echo to-stderr >&2; exit 7"], false),
        &ConnectionOptions::default(),
    )
    .await?;

    let status = tokio::time::timeout(Duration::from_secs(5), connection.wait())
        .await?
        .expect("exit status");
    assert_eq!(status.code(), Some(7));

    tokio::time::timeout(Duration::from_secs(5), connection.closed()).await?;
    let late = connection.send_request("threads", None).await;
    assert!(matches!(late, Err(Error::ConnectionClosed)));
    Ok(())
}

#[tokio::test]
async fn missing_program_is_a_transport_error() {
    let error = acquire(
        &subprocess(&["/definitely/not/a/debug-adapter"], false),
        &ConnectionOptions::default(),
    )
    .await
    .err()
    .unwrap();

    assert!(matches!(error, Error::Spawn { .. }));
    assert_eq!(error.kind(), ErrorKind::Transport);
}

#[tokio::test]
async fn dial_back_listener_accepts_once() -> eyre::Result<()> {
    let listener = DialBackListener::bind().await?;
    let address = listener.address();
    assert!(address.ip().is_loopback());

    let dialer = tokio::spawn(async move { tokio::net::TcpStream::connect(address).await });
    let accepted = listener.accept_one(None, None).await?;
    let dialed = dialer.await??;
    assert_eq!(accepted.peer_addr()?, dialed.local_addr()?);

    // the listener is gone after the first accept
    assert!(tokio::net::TcpStream::connect(address).await.is_err());
    Ok(())
}

#[tokio::test]
async fn dial_back_listener_times_out() -> eyre::Result<()> {
    let listener = DialBackListener::bind().await?;
    let error = listener
        .accept_one(None, Some(Duration::from_millis(50)))
        .await
        .err()
        .unwrap();
    assert!(matches!(error, Error::AcceptTimeout(_)));
    Ok(())
}

#[cfg(unix)]
#[tokio::test]
async fn dial_back_adapter_output_becomes_events() -> eyre::Result<()> {
    let (tx, mut events) = mpsc::unbounded_channel::<Event>();
    let options = ConnectionOptions::default().subscribe(move |event| {
        let _ = tx.send(event);
    });

    // the adapter prints where it was told to connect, then exits without connecting
    let error = acquire(
        &subprocess(&["sh", "-c", "echo dialing ${CLIENT_ADDR}; exit 3"], true),
        &options,
    )
    .await
    .err()
    .unwrap();
    assert!(matches!(error, Error::AdapterExited { .. }), "{error:?}");

    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await?
        .expect("output event");
    assert_eq!(event.event, "output");
    let body = event.body.expect("output body");
    assert_eq!(body["category"], "stdout");
    let output = body["output"].as_str().unwrap_or_default();
    assert!(output.starts_with("dialing 127.0.0.1:"), "{output}");
    assert!(output.ends_with('\n'));
    assert!(!output.contains("${CLIENT_ADDR}"));
    Ok(())
}

#[cfg(unix)]
#[tokio::test]
async fn dial_back_adapter_that_never_connects_is_given_up_on() -> eyre::Result<()> {
    let options = ConnectionOptions::default().with_accept_timeout(Duration::from_millis(200));

    let error = acquire(&subprocess(&["sleep", "30"], true), &options)
        .await
        .err()
        .unwrap();
    assert!(matches!(error, Error::AcceptTimeout(_)));
    Ok(())
}

#[tokio::test]
async fn remote_dial() -> eyre::Result<()> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let address = listener.local_addr()?.to_string();

    let adapter = tokio::spawn(async move {
        let (stream, _) = listener.accept().await?;
        let (mut reader, mut writer) = transport::split(stream);
        while let Some(frame) = reader.next().await {
            if let Ok(Message::Request(request)) = frame?.message() {
                writer
                    .send(OutgoingMessage::Response(Response {
                        seq: 100 + request.seq,
                        request_seq: request.seq,
                        success: true,
                        command: request.command,
                        message: None,
                        body: Some(json!({"threads": [{"id": 1, "name": "main"}]})),
                    }))
                    .await?;
            }
        }
        Ok::<_, eyre::Report>(())
    });

    let connection = acquire(&RunSpec::Remote { address }, &ConnectionOptions::default()).await?;
    assert!(!connection.has_process());

    let response = connection.send_request("threads", None).await?;
    assert_eq!(response.body.unwrap()["threads"][0]["name"], "main");

    connection.stop().await;
    assert_eq!(connection.wait().await, None);
    tokio::time::timeout(Duration::from_secs(5), adapter).await???;
    Ok(())
}

#[tokio::test]
async fn remote_dial_failure() -> eyre::Result<()> {
    // find a port nobody is listening on
    let address = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        listener.local_addr()?.to_string()
    };

    let options = ConnectionOptions {
        dial_attempts: 1,
        ..ConnectionOptions::default()
    };
    let error = acquire(
        &RunSpec::Remote {
            address: address.clone(),
        },
        &options,
    )
    .await
    .err()
    .unwrap();

    match error {
        Error::Dial { address: dialed, .. } => assert_eq!(dialed, address),
        other => panic!("expected dial error, got {other:?}"),
    }
    Ok(())
}
