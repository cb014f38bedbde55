//! Connection factory seam
//!
//! The transport state machine only sees a sink of [`Outbound`] messages and
//! a stream of [`Frame`]s. [`Connector`] produces one such pair per
//! connection attempt, which lets tests drive the state machine without a
//! socket.

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::{Sink, Stream};
use std::pin::Pin;

use crate::error::TransportError;
use crate::transport::Frame;

/// Outbound WebSocket message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Binary(Bytes),
    Ping,
    /// Close with a normal-closure code and the given reason
    Close(String),
}

pub type FrameSink = Pin<Box<dyn Sink<Outbound, Error = TransportError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame, TransportError>> + Send>>;

/// Both halves of one live connection
pub struct SessionHandle {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

/// Opens connections to a fixed target
pub trait Connector: Send + Sync + 'static {
    fn connect(&self) -> BoxFuture<'_, Result<SessionHandle, TransportError>>;

    /// Target description for logs
    fn target(&self) -> String;
}
