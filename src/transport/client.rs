//! Reconnecting transport state machine

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::TransportConfig;
use crate::constants::{BINARY_CHANNEL_CAPACITY, TEXT_CHANNEL_CAPACITY};
use crate::error::TransportError;
use crate::transport::channel::{FrameChannel, FrameSubscription};
use crate::transport::{ConnectionState, Connector, Frame, FrameSink, FrameStream, Outbound, ReconnectPolicy};

/// Capacity of the state transition channel
const STATE_EVENT_CAPACITY: usize = 64;

/// Why a live session ended
#[derive(Debug)]
enum SessionEnd {
    ServerClosed(Option<String>),
    Failed(TransportError),
}

struct Inner {
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    ping_interval: Duration,
    reconnect_on_server_close: bool,

    state_tx: watch::Sender<ConnectionState>,
    events_tx: broadcast::Sender<ConnectionState>,
    text: FrameChannel<String>,
    binary: FrameChannel<Bytes>,

    /// Outbound half of the live session, if any
    sink: tokio::sync::Mutex<Option<FrameSink>>,
    driver: Mutex<Option<JoinHandle<()>>>,

    explicit_disconnect: AtomicBool,
    attempt: AtomicU32,
    closed: AtomicBool,
    /// Bumped by every connect, disconnect and close. Work started under an
    /// older generation must not publish state or install a session.
    generation: AtomicU64,
}

impl Inner {
    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    /// Publish `state` unless `generation` has been superseded
    fn publish_if(&self, generation: u64, state: ConnectionState) -> bool {
        self.state_tx.send_if_modified(|current| {
            if !self.is_current(generation) {
                return false;
            }
            tracing::debug!(from = %current, to = %state, "connection state");
            *current = state.clone();
            let _ = self.events_tx.send(state);
            true
        })
    }

    fn publish(&self, state: ConnectionState) {
        self.state_tx.send_modify(|current| {
            tracing::debug!(from = %current, to = %state, "connection state");
            *current = state.clone();
            let _ = self.events_tx.send(state);
        });
    }

    fn abort_driver(&self) {
        if let Some(handle) = self.driver.lock().take() {
            handle.abort();
        }
    }
}

/// WebSocket transport with automatic reconnection
pub struct Transport {
    inner: Arc<Inner>,
}

impl Transport {
    pub fn new(connector: Arc<dyn Connector>, config: &TransportConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (events_tx, _) = broadcast::channel(STATE_EVENT_CAPACITY);

        Self {
            inner: Arc::new(Inner {
                connector,
                policy: ReconnectPolicy::new(config.max_attempts),
                ping_interval: config.ping_interval(),
                reconnect_on_server_close: config.reconnect_on_server_close,
                state_tx,
                events_tx,
                text: FrameChannel::new("text", TEXT_CHANNEL_CAPACITY, config.text_replay),
                binary: FrameChannel::new("binary", BINARY_CHANNEL_CAPACITY, config.binary_replay),
                sink: tokio::sync::Mutex::new(None),
                driver: Mutex::new(None),
                explicit_disconnect: AtomicBool::new(false),
                attempt: AtomicU32::new(0),
                closed: AtomicBool::new(false),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Replace the reconnect policy. Only meaningful before `connect`.
    pub fn with_policy(mut self, policy: ReconnectPolicy) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.policy = policy;
        }
        self
    }

    /// Open the session.
    ///
    /// Does nothing when already connected or connecting. A reconnect loop in
    /// progress is abandoned in favour of this attempt.
    pub async fn connect(&self) -> Result<(), TransportError> {
        self.ensure_open()?;
        let inner = &self.inner;

        let mut generation = 0;
        let claimed = inner.state_tx.send_if_modified(|current| {
            if matches!(current, ConnectionState::Connected | ConnectionState::Connecting) {
                return false;
            }
            generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
            *current = ConnectionState::Connecting;
            let _ = inner.events_tx.send(ConnectionState::Connecting);
            true
        });
        if !claimed {
            tracing::warn!(state = %inner.state_tx.borrow().clone(), "connect ignored");
            return Ok(());
        }

        inner.explicit_disconnect.store(false, Ordering::SeqCst);
        inner.attempt.store(0, Ordering::SeqCst);
        {
            // Never two live sessions: drop the previous one first
            let mut sink = inner.sink.lock().await;
            inner.abort_driver();
            sink.take();
        }

        let target = inner.connector.target();
        tracing::info!(target = %target, "connecting");

        let session = match inner.connector.connect().await {
            Ok(session) => session,
            Err(e) => {
                tracing::error!(target = %target, error = %e, "connect failed");
                inner.publish_if(generation, ConnectionState::Error(e.clone()));
                return Err(e);
            }
        };

        let mut sink = inner.sink.lock().await;
        if !inner.is_current(generation) {
            tracing::debug!(target = %target, "connect superseded, dropping session");
            return Err(self.superseded_error());
        }
        *sink = Some(session.sink);
        inner.publish_if(generation, ConnectionState::Connected);
        tracing::info!(target = %target, "connected");

        let handle = tokio::spawn(drive(inner.clone(), session.stream, generation));
        *inner.driver.lock() = Some(handle);
        Ok(())
    }

    /// Send a text frame on the live session
    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), TransportError> {
        self.send(Outbound::Text(text.into())).await
    }

    /// Send a binary frame on the live session
    pub async fn send_binary(&self, data: impl Into<Bytes>) -> Result<(), TransportError> {
        self.send(Outbound::Binary(data.into())).await
    }

    async fn send(&self, message: Outbound) -> Result<(), TransportError> {
        self.ensure_open()?;
        let mut guard = self.inner.sink.lock().await;
        let sink = guard.as_mut().ok_or(TransportError::NotConnected)?;
        sink.send(message).await
    }

    /// Close the session and stop reconnecting until the next `connect`
    pub async fn disconnect(&self) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.shutdown_session().await;
        self.inner.publish(ConnectionState::Disconnected);
        tracing::info!("disconnected");
        Ok(())
    }

    /// Tear the transport down for good. Every later call fails with
    /// [`TransportError::Closed`] and frame subscriptions end.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown_session().await;
        self.inner.publish(ConnectionState::Disconnected);
        self.inner.text.close();
        self.inner.binary.close();
        tracing::info!("transport closed");
    }

    async fn shutdown_session(&self) {
        let inner = &self.inner;
        inner.explicit_disconnect.store(true, Ordering::SeqCst);
        inner.generation.fetch_add(1, Ordering::SeqCst);

        let mut guard = inner.sink.lock().await;
        inner.abort_driver();
        if let Some(mut sink) = guard.take() {
            if let Err(e) = sink.send(Outbound::Close("normal".to_string())).await {
                tracing::debug!(error = %e, "close frame not delivered");
            }
            let _ = sink.close().await;
        }
    }

    /// Latest connection state
    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state_tx.borrow().clone()
    }

    /// Every state transition from now on
    pub fn state_events(&self) -> broadcast::Receiver<ConnectionState> {
        self.inner.events_tx.subscribe()
    }

    pub fn text_messages(&self) -> FrameSubscription<String> {
        self.inner.text.subscribe()
    }

    pub fn binary_messages(&self) -> FrameSubscription<Bytes> {
        self.inner.binary.subscribe()
    }

    pub fn target(&self) -> String {
        self.inner.connector.target()
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }

    fn superseded_error(&self) -> TransportError {
        if self.inner.closed.load(Ordering::SeqCst) {
            TransportError::Closed
        } else {
            TransportError::NotConnected
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        self.inner.abort_driver();
    }
}

/// Session driver: receive until the session ends, then reconnect, until
/// told to stop or out of attempts.
async fn drive(inner: Arc<Inner>, stream: FrameStream, generation: u64) {
    let mut stream = stream;
    loop {
        let end = receive(&inner, &mut stream).await;
        drop(stream);

        {
            let mut sink = inner.sink.lock().await;
            if !inner.is_current(generation) {
                return;
            }
            sink.take();
        }

        if inner.explicit_disconnect.load(Ordering::SeqCst) {
            inner.publish_if(generation, ConnectionState::Disconnected);
            return;
        }

        match end {
            SessionEnd::ServerClosed(reason) => {
                tracing::info!(reason = reason.as_deref().unwrap_or(""), "server closed the connection");
                if !inner.reconnect_on_server_close {
                    inner.publish_if(generation, ConnectionState::Disconnected);
                    return;
                }
            }
            SessionEnd::Failed(e) => {
                tracing::warn!(error = %e, "connection lost");
            }
        }

        stream = match reconnect(&inner, generation).await {
            Some(stream) => stream,
            None => return,
        };
    }
}

/// Dispatch inbound frames and keep the connection alive
async fn receive(inner: &Inner, stream: &mut FrameStream) -> SessionEnd {
    let mut ping = tokio::time::interval_at(Instant::now() + inner.ping_interval, inner.ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Frame::Text(text))) => inner.text.publish(text),
                Some(Ok(Frame::Binary(data))) => inner.binary.publish(data),
                Some(Ok(Frame::Close(reason))) => return SessionEnd::ServerClosed(reason),
                Some(Err(e)) => return SessionEnd::Failed(e),
                None => {
                    return SessionEnd::Failed(TransportError::ReceiveFailed(
                        "connection closed".to_string(),
                    ))
                }
            },
            _ = ping.tick() => {
                let mut guard = inner.sink.lock().await;
                let result = match guard.as_mut() {
                    Some(sink) => sink.send(Outbound::Ping).await,
                    None => Err(TransportError::NotConnected),
                };
                if let Err(e) = result {
                    return SessionEnd::Failed(e);
                }
            }
        }
    }
}

/// Walk the backoff ladder until a new session is up. Returns its stream, or
/// `None` when superseded or out of attempts.
async fn reconnect(inner: &Inner, generation: u64) -> Option<FrameStream> {
    loop {
        let attempt = inner.attempt.load(Ordering::SeqCst);
        if !inner.policy.allows(attempt) {
            let error = TransportError::ReconnectExhausted { attempts: attempt };
            tracing::error!(attempts = attempt, "giving up on reconnecting");
            inner.publish_if(generation, ConnectionState::Error(error));
            return None;
        }

        if !inner.publish_if(generation, ConnectionState::Reconnecting { attempt }) {
            return None;
        }
        let delay = inner.policy.delay(attempt);
        tracing::info!(attempt, delay_ms = delay.as_millis() as u64, "reconnecting");
        tokio::time::sleep(delay).await;

        if inner.explicit_disconnect.load(Ordering::SeqCst) || !inner.is_current(generation) {
            return None;
        }

        match inner.connector.connect().await {
            Ok(session) => {
                let mut sink = inner.sink.lock().await;
                if !inner.is_current(generation) {
                    return None;
                }
                *sink = Some(session.sink);
                inner.attempt.store(0, Ordering::SeqCst);
                inner.publish_if(generation, ConnectionState::Connected);
                tracing::info!(attempt, "reconnected");
                return Some(session.stream);
            }
            Err(e) => {
                tracing::warn!(attempt, error = %e, "reconnect attempt failed");
                inner.attempt.store(attempt + 1, Ordering::SeqCst);
            }
        }
    }
}
