//! Connection state and inbound frames

use bytes::Bytes;
use std::fmt;

use crate::error::TransportError;

/// Lifecycle of the transport's single logical session
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// Waiting out the backoff before reconnect attempt `attempt` (0-based)
    Reconnecting { attempt: u32 },
    Error(TransportError),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Connecting, connected or reconnecting
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting
                | ConnectionState::Connected
                | ConnectionState::Reconnecting { .. }
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => f.write_str("disconnected"),
            ConnectionState::Connecting => f.write_str("connecting"),
            ConnectionState::Connected => f.write_str("connected"),
            ConnectionState::Reconnecting { attempt } => write!(f, "reconnecting (attempt {})", attempt + 1),
            ConnectionState::Error(e) => write!(f, "error: {e}"),
        }
    }
}

/// One inbound WebSocket message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
    /// Close frame with its reason, if any
    Close(Option<String>),
}
