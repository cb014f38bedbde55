//! # Sendspin Client
//!
//! Streaming client core for a Sendspin music server: a reconnecting
//! WebSocket transport and a real-time audio delivery pipeline.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                        CONTROL LANE (tokio)                          │
//! │  ┌──────────────────┐   text frames    ┌──────────────────────────┐  │
//! │  │    Transport     │ ───────────────▶ │  protocol::ControlMessage │  │
//! │  │  (driver task)   │                  └──────────────────────────┘  │
//! │  │  receive loop ⇄  │                                                │
//! │  │  reconnect loop  │ ─────┐                                         │
//! │  └──────────────────┘      │ binary frames                           │
//! └────────────────────────────┼─────────────────────────────────────────┘
//!                              ▼
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                       DECODE LANE (caller task)                      │
//! │        AudioDecoder: PCM passthrough │ Opus │ FLAC  ──▶ PCM bytes     │
//! └────────────────────────────┬─────────────────────────────────────────┘
//!                              ▼ write_raw_pcm (partial accept = backpressure)
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                 PLAYBACK LANE (dedicated RT thread)                  │
//! │   PcmQueue ──▶ OutputDevice (cpal / null) ──▶ hardware               │
//! │                      ▲ OutputGain (volume ⊗ mute, atomic)            │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```

pub mod codec;
pub mod config;
pub mod discovery;
pub mod error;
pub mod playback;
pub mod protocol;
pub mod transport;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    use std::time::Duration;

    /// Default sample rate for audio processing
    pub const DEFAULT_SAMPLE_RATE: u32 = 48000;

    /// Default channel count (stereo)
    pub const DEFAULT_CHANNELS: u16 = 2;

    /// Default PCM bit depth
    pub const DEFAULT_BIT_DEPTH: u16 = 16;

    /// Default Sendspin server port
    pub const DEFAULT_SERVER_PORT: u16 = 8927;

    /// Default WebSocket path on a Sendspin server
    pub const DEFAULT_SERVER_PATH: &str = "/sendspin";

    /// Reconnect attempts before surfacing a terminal error
    pub const MAX_RECONNECT_ATTEMPTS: u32 = 10;

    /// WebSocket keepalive ping interval
    pub const PING_INTERVAL: Duration = Duration::from_secs(5);

    /// TCP connect timeout for a single attempt
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

    /// Largest legal Opus frame: 120ms at 48kHz
    pub const OPUS_MAX_FRAME_SAMPLES: usize = 5760;

    /// Sample rates libopus can decode at
    pub const OPUS_SAMPLE_RATES: [u32; 5] = [8000, 12000, 16000, 24000, 48000];

    /// Decoded audio buffered ahead of the playback lane
    pub const DEFAULT_BUFFER_MS: u32 = 500;

    /// Lock-free queue capacity (in PCM chunks)
    pub const PCM_QUEUE_SLOTS: usize = 256;

    /// Capacity of the inbound text frame channel
    pub const TEXT_CHANNEL_CAPACITY: usize = 256;

    /// Capacity of the inbound binary frame channel
    pub const BINARY_CHANNEL_CAPACITY: usize = 1024;

    /// mDNS service type the client advertises itself under
    pub const CLIENT_SERVICE_TYPE: &str = "_sendspin._tcp.local.";

    /// mDNS service type Sendspin servers advertise
    pub const SERVER_SERVICE_TYPE: &str = "_sendspin-server._tcp.local.";
}
