//! Sendspin Player
//!
//! Connects to a Sendspin server and plays the audio it streams.
//!
//! Usage: `sendspin-player [ws://host:port/path] [--headless]`

use anyhow::{Context, Result};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sendspin_client::{
    config::AppConfig,
    discovery::ServiceAdvertiser,
    error::PlaybackError,
    playback::{
        list_output_devices, CpalBackend, NowPlaying, NullBackend, OutputBackend, PlaybackEngine,
        StreamListener,
    },
    protocol::{
        ClientHello, ClientState, ControlMessage, PlayerCommandKind, PlayerState, PlayerSyncState,
    },
    transport::{ConnectionState, Transport, WebSocketConnector},
};

/// How long to wait for a server to show up on the network
const DISCOVERY_WAIT: Duration = Duration::from_secs(30);

/// Pause between retries while the playback buffer is full
const BACKPRESSURE_WAIT: Duration = Duration::from_millis(5);

/// Logs stream readiness and output failures
struct LogListener;

impl StreamListener for LogListener {
    fn on_ready(&self) {
        tracing::info!("Output ready");
    }

    fn on_error(&self, error: &PlaybackError) {
        tracing::error!("Playback failed: {}", error);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Sendspin Player");

    let args: Vec<String> = std::env::args().skip(1).collect();
    let headless = args.iter().any(|a| a == "--headless");
    let url_arg = args.iter().find(|a| !a.starts_with("--")).cloned();

    // Load or create config
    let config_path = AppConfig::default_path()?;
    let mut config = AppConfig::load_or_default(&config_path)
        .with_context(|| format!("load config {}", config_path.display()))?;

    let backend: Arc<dyn OutputBackend> = if headless {
        tracing::info!("Running headless, audio is discarded");
        Arc::new(NullBackend::new())
    } else {
        println!("\n=== Available Output Devices ===");
        for device in list_output_devices() {
            let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
            println!("  {}{}:", device.name, default_marker);
            println!("    Sample rates: {:?}", device.sample_rates);
            println!("    Channels: {:?}", device.channels);
        }
        println!();
        Arc::new(CpalBackend::new(config.playback.device.clone()))
    };

    // Advertise ourselves and look for servers
    let advertiser = ServiceAdvertiser::new(&config.client, &config.discovery);
    let mut discovered = advertiser.incoming_connections();
    if config.discovery.enabled {
        if let Err(e) = advertiser.start().await {
            tracing::warn!("mDNS advertisement failed: {}", e);
        }
    }

    let server_url = match url_arg.or_else(|| config.transport.server_url.clone()) {
        Some(url) => url,
        None => {
            tracing::info!("No server configured, waiting for one to be discovered...");
            let request = tokio::time::timeout(DISCOVERY_WAIT, discovered.recv())
                .await
                .context("no Sendspin server found on the network")?
                .context("discovery stopped")?;
            tracing::info!("Found server {} at {}", request.name, request.url());
            request.url()
        }
    };

    if config.transport.server_url.as_deref() != Some(server_url.as_str()) {
        config.transport.server_url = Some(server_url.clone());
        if let Err(e) = config.save(&config_path) {
            tracing::warn!("Failed to save config: {}", e);
        }
    }

    let connector = WebSocketConnector::new(
        server_url.clone(),
        config.transport.auth_token.clone(),
        config.transport.connect_timeout(),
    )?;
    let transport = Transport::new(Arc::new(connector), &config.transport);

    let engine = Arc::new(PlaybackEngine::new(backend, config.playback.buffer_ms));
    engine.set_volume(config.playback.volume);

    let mut text = transport.text_messages();
    let mut binary = transport.binary_messages();

    transport
        .connect()
        .await
        .with_context(|| format!("connect to {server_url}"))?;

    let buffer_capacity = config.playback.buffer_ms as usize * 48 * 4;
    let hello = ControlMessage::ClientHello(ClientHello::new(
        config.client.client_id,
        config.client.name.clone(),
        buffer_capacity,
    ))
    .to_json()?;
    transport.send_text(hello.clone()).await?;

    // Later transitions only; the first hello is already out
    let mut states = transport.state_events();

    let mut stats_interval = tokio::time::interval(Duration::from_secs(5));

    loop {
        tokio::select! {
            Some(message) = text.recv() => {
                handle_control(&message, &engine, &transport).await;
            }
            Some(frame) = binary.recv() => {
                feed_audio(&engine, frame).await;
            }
            state = states.recv() => match state {
                Ok(ConnectionState::Connected) => {
                    // Every new session starts with a hello
                    if let Err(e) = transport.send_text(hello.clone()).await {
                        tracing::warn!("Failed to send hello: {}", e);
                    }
                }
                Ok(ConnectionState::Error(e)) => {
                    tracing::error!("Connection lost for good: {}", e);
                    break;
                }
                Ok(state) => tracing::info!("Connection {}", state),
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
            _ = stats_interval.tick() => {
                let stats = engine.stats();
                tracing::info!(
                    "Playback stats: {:?}, {} queued, {} written, {} overflows, {:.1}% frame loss",
                    stats.state,
                    stats.queued_bytes,
                    stats.bytes_written,
                    stats.overflow_count,
                    stats.decoder.loss_rate() * 100.0
                );
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down");
                break;
            }
        }
    }

    let _ = transport.disconnect().await;
    transport.close().await;
    engine.release();
    advertiser.stop();
    Ok(())
}

async fn handle_control(message: &str, engine: &Arc<PlaybackEngine>, transport: &Transport) {
    let message = match ControlMessage::parse(message) {
        Ok(message) => message,
        Err(e) => {
            tracing::warn!("Ignoring malformed control message: {}", e);
            return;
        }
    };

    match message {
        ControlMessage::ServerHello(hello) => {
            tracing::info!("Connected to server {} ({})", hello.name, hello.server_id);
        }
        ControlMessage::StreamStart(start) => {
            let Some(player) = start.player else {
                return;
            };
            let prepared = match player.to_format() {
                Ok(format) => {
                    tracing::info!("Stream starting: {}", format);
                    engine.prepare_stream(format, Arc::new(LogListener)).is_ok()
                }
                Err(e) => {
                    tracing::error!("Unusable stream format: {}", e);
                    false
                }
            };
            report_state(engine, transport, prepared).await;
        }
        ControlMessage::StreamClear => {
            if let Err(e) = engine.flush() {
                tracing::debug!("Nothing to clear: {}", e);
            }
        }
        ControlMessage::StreamEnd => engine.stop_raw_pcm_stream(),
        ControlMessage::ServerCommand(command) => {
            match command.player.command {
                PlayerCommandKind::Volume => {
                    if let Some(volume) = command.player.volume {
                        engine.set_volume(volume);
                    }
                }
                PlayerCommandKind::Mute => {
                    if let Some(mute) = command.player.mute {
                        engine.set_muted(mute);
                    }
                }
            }
            report_state(engine, transport, true).await;
        }
        ControlMessage::ServerState(state) => {
            if let Some(metadata) = state.metadata {
                engine.update_now_playing(&NowPlaying::from(&metadata));
            }
        }
        ControlMessage::ClientHello(_) | ControlMessage::ClientState(_) => {
            tracing::debug!("Ignoring client-bound message from server");
        }
        ControlMessage::Unknown(kind) => tracing::debug!("Ignoring message type {}", kind),
    }
}

async fn report_state(engine: &PlaybackEngine, transport: &Transport, healthy: bool) {
    let state = ControlMessage::ClientState(ClientState {
        player: PlayerState {
            state: if healthy {
                PlayerSyncState::Synchronized
            } else {
                PlayerSyncState::Error
            },
            volume: engine.volume(),
            muted: engine.is_muted(),
        },
    });
    match state.to_json() {
        Ok(json) => {
            if let Err(e) = transport.send_text(json).await {
                tracing::warn!("Failed to report state: {}", e);
            }
        }
        Err(e) => tracing::warn!("Failed to encode state: {}", e),
    }
}

/// Decode one audio frame and queue it, waiting while the buffer is full
async fn feed_audio(engine: &PlaybackEngine, frame: Bytes) {
    let pcm = match engine.decode_frame(&frame) {
        Ok(pcm) => pcm,
        Err(PlaybackError::NotPrepared) => return,
        Err(e) => {
            tracing::warn!("Dropping audio frame: {}", e);
            return;
        }
    };

    let mut offset = 0;
    while offset < pcm.len() {
        match engine.write_raw_pcm(&pcm[offset..]) {
            Ok(0) => tokio::time::sleep(BACKPRESSURE_WAIT).await,
            Ok(written) => offset += written,
            Err(e) => {
                tracing::warn!("Dropping audio: {}", e);
                return;
            }
        }
    }
}
