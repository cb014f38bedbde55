//! Error types for the streaming client

use thiserror::Error;

/// Main error type for the client
#[derive(Error, Debug)]
pub enum Error {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Playback error: {0}")]
    Playback(#[from] PlaybackError),

    #[error("Discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Connection transport errors
///
/// `Clone` so a cause can live inside a published `ConnectionState`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Not connected")]
    NotConnected,

    #[error("Transport has been closed")]
    Closed,

    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection timed out")]
    Timeout,

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Gave up reconnecting after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::ConnectionClosed | WsError::AlreadyClosed => {
                TransportError::ReceiveFailed("connection closed".to_string())
            }
            WsError::Url(e) => TransportError::InvalidTarget(e.to_string()),
            WsError::Io(e) => TransportError::ConnectionFailed(e.to_string()),
            other => TransportError::ConnectionFailed(other.to_string()),
        }
    }
}

/// Codec errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Unsupported channel count: {0}")]
    UnsupportedChannels(u16),

    #[error("Unsupported sample rate: {0}")]
    UnsupportedSampleRate(u32),

    #[error("Unsupported bit depth: {0}")]
    UnsupportedBitDepth(u16),

    #[error("Decoder initialization failed: {0}")]
    DecoderInit(String),

    #[error("Decoder already configured")]
    AlreadyConfigured,

    #[error("Decoder not configured")]
    NotConfigured,

    #[error("Decoder has been released")]
    Released,

    #[error("Codec not implemented on this platform: {0}")]
    NotImplemented(String),
}

/// Playback engine errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlaybackError {
    #[error("Output device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to open output: {0}")]
    OpenFailed(String),

    #[error("Output stream error: {0}")]
    StreamError(String),

    #[error("Unsupported output format: {0}")]
    UnsupportedFormat(String),

    #[error("No stream prepared")]
    NotPrepared,

    #[error("Playback engine has been released")]
    Released,

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

/// Service discovery errors
#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("mDNS daemon failed: {0}")]
    Daemon(String),

    #[error("Service registration failed: {0}")]
    Registration(String),

    #[error("Advertiser already started")]
    AlreadyStarted,
}

impl From<mdns_sd::Error> for DiscoveryError {
    fn from(err: mdns_sd::Error) -> Self {
        DiscoveryError::Daemon(err.to_string())
    }
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("No config directory available on this platform")]
    NoConfigDir,

    #[error("Failed to read config: {0}")]
    Read(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Result type alias for the client
pub type Result<T> = std::result::Result<T, Error>;
