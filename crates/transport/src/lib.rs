//! Wire layer of the Debug Adapter Protocol, on tokio.
//!
//! Frames messages over async byte streams. Sessions, request correlation
//! and event fan-out live in the `debugger` crate.
//!
//! Decoding a frame and classifying its body are separate steps: a body that
//! cannot be classified is reported on its own, and the byte stream stays
//! usable for the frames after it.
//!
//! ```ignore
//! use futures::StreamExt;
//! use transport::Message;
//!
//! let (mut reader, mut writer) = transport::connect("127.0.0.1:5678").await?;
//! while let Some(frame) = reader.next().await {
//!     match frame?.message() {
//!         Ok(Message::Response(response)) => { /* hand to the waiting caller */ }
//!         Ok(Message::Event(event)) => { /* fan out */ }
//!         Ok(Message::Request(request)) => { /* answer the reverse request */ }
//!         Err(error) => tracing::warn!(%error, "skipping message"),
//!     }
//! }
//! ```

mod codec;
mod error;
mod framed;
mod message;
mod transport;

pub mod testing;

pub use codec::{DapCodec, Frame, encode};
pub use error::{CodecError, ParseError};
pub use framed::{DapReader, DapWriter};
pub use message::{
    Event, Message, OutgoingMessage, Request, Response, Seq,
};
pub use transport::{DapTransport, StreamPair, connect, split};
