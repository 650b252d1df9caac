//! Debug Adapter Protocol client engine.
//!
//! - [`acquire`] reaches an adapter described by a [`RunSpec`]
//! - [`Connection`] correlates requests with responses and fans out events
//! - [`Debugger`] runs one session at a time on top of a connection
//!
//! # Example
//!
//! ```ignore
//! use debugger::{ConnectionOptions, Debugger, RunSpec};
//!
//! let options = ConnectionOptions::default().subscribe(|event| {
//!     println!("{}: {:?}", event.event, event.body);
//! });
//! let debugger = Debugger::new(options);
//!
//! debugger
//!     .run(&RunSpec::Remote { address: "127.0.0.1:5678".into() })
//!     .await?;
//! debugger.attach(serde_json::json!({})).await?;
//! debugger.configure(&[]).await?;
//! ```
mod acquire;
mod connection;
mod debugger;
mod dispatch;
mod error;
mod pending_requests;
pub mod types;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use acquire::{
    CLIENT_ADDR_PLACEHOLDER, DialBackListener, RunSpec, acquire, substitute_client_addr,
};
pub use connection::{
    Connection, ConnectionOptions, DEFAULT_DIAL_ATTEMPTS, IgnoreReverseRequests, ReverseReply,
    ReverseRequestHandler,
};
pub use debugger::Debugger;
pub use dispatch::EventHandler;
pub use error::{AdapterError, Error, ErrorKind, Result};
pub use transport::{Event, Request, Response};
