//! Connection transport
//!
//! One logical WebSocket session to a Sendspin server. Text frames carry
//! JSON control messages, binary frames carry audio. A single driver task
//! per [`Transport`] runs the receive loop and, when the connection drops,
//! the reconnect loop.

pub mod backoff;
pub mod channel;
pub mod client;
pub mod session;
pub mod state;
pub mod websocket;

pub use backoff::ReconnectPolicy;
pub use channel::FrameSubscription;
pub use client::Transport;
pub use session::{Connector, FrameSink, FrameStream, Outbound, SessionHandle};
pub use state::{ConnectionState, Frame};
pub use websocket::WebSocketConnector;
