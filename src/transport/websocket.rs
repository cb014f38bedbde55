//! WebSocket connector over tokio-tungstenite

use bytes::Bytes;
use futures_util::future::{self, BoxFuture};
use futures_util::{SinkExt, StreamExt};
use socket2::{SockRef, TcpKeepalive};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

use crate::error::TransportError;
use crate::transport::{Connector, Frame, Outbound, SessionHandle};

/// TCP keepalive probe idle time
const KEEPALIVE_IDLE: Duration = Duration::from_secs(15);

/// Connects to a Sendspin server over `ws://` or `wss://`
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: String,
    auth_token: Option<String>,
    connect_timeout: Duration,
}

impl WebSocketConnector {
    /// Fails with `InvalidTarget` when `url` is not a WebSocket URL
    pub fn new(
        url: impl Into<String>,
        auth_token: Option<String>,
        connect_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let url = url.into();
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(TransportError::InvalidTarget(url));
        }
        url.as_str().into_client_request()?;

        Ok(Self {
            url,
            auth_token,
            connect_timeout,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn open(&self) -> Result<SessionHandle, TransportError> {
        let mut request = self.url.as_str().into_client_request()?;
        if let Some(token) = &self.auth_token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| TransportError::InvalidTarget(e.to_string()))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let uri = request.uri();
        let host = uri
            .host()
            .ok_or_else(|| TransportError::InvalidTarget(self.url.clone()))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let default_port = if uri.scheme_str() == Some("wss") { 443 } else { 80 };
        let port = uri.port_u16().unwrap_or(default_port);

        let tcp = tokio::time::timeout(self.connect_timeout, TcpStream::connect((host.as_str(), port)))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        configure_socket(&tcp);

        let (ws, _response) = tokio::time::timeout(
            self.connect_timeout,
            tokio_tungstenite::client_async_tls(request, tcp),
        )
        .await
        .map_err(|_| TransportError::Timeout)??;

        tracing::debug!(url = %self.url, "websocket handshake complete");

        let (ws_tx, ws_rx) = ws.split();

        let sink = ws_tx
            .sink_map_err(TransportError::from)
            .with(|outbound: Outbound| future::ready(Ok::<_, TransportError>(to_message(outbound))));

        let stream = ws_rx.filter_map(|message| {
            future::ready(match message {
                Ok(Message::Text(text)) => Some(Ok(Frame::Text(text))),
                Ok(Message::Binary(data)) => Some(Ok(Frame::Binary(Bytes::from(data)))),
                Ok(Message::Close(frame)) => Some(Ok(Frame::Close(
                    frame.map(|f| f.reason.into_owned()),
                ))),
                // Pings are answered by tungstenite; pongs need no action
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => None,
                Err(e) => Some(Err(TransportError::ReceiveFailed(e.to_string()))),
            })
        });

        Ok(SessionHandle {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }
}

impl Connector for WebSocketConnector {
    fn connect(&self) -> BoxFuture<'_, Result<SessionHandle, TransportError>> {
        Box::pin(self.open())
    }

    fn target(&self) -> String {
        self.url.clone()
    }
}

fn to_message(outbound: Outbound) -> Message {
    match outbound {
        Outbound::Text(text) => Message::Text(text),
        Outbound::Binary(data) => Message::Binary(data.to_vec()),
        Outbound::Ping => Message::Ping(Vec::new()),
        Outbound::Close(reason) => Message::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: reason.into(),
        })),
    }
}

/// Low latency and dead-peer detection on the control socket
fn configure_socket(tcp: &TcpStream) {
    let socket = SockRef::from(tcp);
    if let Err(e) = socket.set_nodelay(true) {
        tracing::warn!(error = %e, "failed to set TCP_NODELAY");
    }
    let keepalive = TcpKeepalive::new().with_time(KEEPALIVE_IDLE);
    if let Err(e) = socket.set_tcp_keepalive(&keepalive) {
        tracing::warn!(error = %e, "failed to enable TCP keepalive");
    }
}
