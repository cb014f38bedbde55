//! Sendspin control messages
//!
//! Every text frame is a JSON envelope `{"type": "...", "payload": {...}}`.
//! Types this client does not handle parse as [`ControlMessage::Unknown`].

use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

use crate::codec::{AudioFormatSpec, Codec};
use crate::constants::{DEFAULT_BIT_DEPTH, DEFAULT_CHANNELS, DEFAULT_SAMPLE_RATE};
use crate::error::CodecError;
use crate::playback::NowPlaying;

/// Protocol version sent in `client/hello`
pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload: Option<Value>,
}

/// A decoded control message
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    ClientHello(ClientHello),
    ServerHello(ServerHello),
    StreamStart(StreamStart),
    StreamClear,
    StreamEnd,
    ServerCommand(ServerCommand),
    ClientState(ClientState),
    ServerState(ServerState),
    /// A message type this client does not handle
    Unknown(String),
}

impl ControlMessage {
    pub fn kind(&self) -> &str {
        match self {
            ControlMessage::ClientHello(_) => "client/hello",
            ControlMessage::ServerHello(_) => "server/hello",
            ControlMessage::StreamStart(_) => "stream/start",
            ControlMessage::StreamClear => "stream/clear",
            ControlMessage::StreamEnd => "stream/end",
            ControlMessage::ServerCommand(_) => "server/command",
            ControlMessage::ClientState(_) => "client/state",
            ControlMessage::ServerState(_) => "server/state",
            ControlMessage::Unknown(kind) => kind,
        }
    }

    /// Parse one text frame
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        let envelope: Envelope = serde_json::from_str(text)?;
        let payload = envelope.payload.unwrap_or(Value::Null);

        let message = match envelope.kind.as_str() {
            "client/hello" => ControlMessage::ClientHello(serde_json::from_value(payload)?),
            "server/hello" => ControlMessage::ServerHello(serde_json::from_value(payload)?),
            "stream/start" => ControlMessage::StreamStart(serde_json::from_value(payload)?),
            "stream/clear" => ControlMessage::StreamClear,
            "stream/end" => ControlMessage::StreamEnd,
            "server/command" => ControlMessage::ServerCommand(serde_json::from_value(payload)?),
            "client/state" => ControlMessage::ClientState(serde_json::from_value(payload)?),
            "server/state" => ControlMessage::ServerState(serde_json::from_value(payload)?),
            _ => ControlMessage::Unknown(envelope.kind),
        };
        Ok(message)
    }

    /// Serialize to a text frame
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        let payload = match self {
            ControlMessage::ClientHello(p) => Some(serde_json::to_value(p)?),
            ControlMessage::ServerHello(p) => Some(serde_json::to_value(p)?),
            ControlMessage::StreamStart(p) => Some(serde_json::to_value(p)?),
            ControlMessage::ServerCommand(p) => Some(serde_json::to_value(p)?),
            ControlMessage::ClientState(p) => Some(serde_json::to_value(p)?),
            ControlMessage::ServerState(p) => Some(serde_json::to_value(p)?),
            ControlMessage::StreamClear | ControlMessage::StreamEnd | ControlMessage::Unknown(_) => None,
        };
        serde_json::to_string(&Envelope {
            kind: self.kind().to_string(),
            payload,
        })
    }
}

/// A format the client can play
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupportedFormat {
    pub codec: Codec,
    pub sample_rate: u32,
    pub channels: u16,
    pub bit_depth: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientHello {
    pub client_id: String,
    pub name: String,
    pub version: u32,
    pub supported_formats: Vec<SupportedFormat>,
    /// Bytes of audio the client buffers ahead of playback
    pub buffer_capacity: usize,
}

impl ClientHello {
    pub fn new(client_id: Uuid, name: impl Into<String>, buffer_capacity: usize) -> Self {
        let format = |codec, sample_rate, bit_depth| SupportedFormat {
            codec,
            sample_rate,
            channels: DEFAULT_CHANNELS,
            bit_depth,
        };
        Self {
            client_id: client_id.to_string(),
            name: name.into(),
            version: PROTOCOL_VERSION,
            supported_formats: vec![
                format(Codec::Opus, DEFAULT_SAMPLE_RATE, DEFAULT_BIT_DEPTH),
                format(Codec::Flac, DEFAULT_SAMPLE_RATE, DEFAULT_BIT_DEPTH),
                format(Codec::Flac, 44100, DEFAULT_BIT_DEPTH),
                format(Codec::Pcm, DEFAULT_SAMPLE_RATE, DEFAULT_BIT_DEPTH),
                format(Codec::Pcm, DEFAULT_SAMPLE_RATE, 24),
                format(Codec::Pcm, 44100, DEFAULT_BIT_DEPTH),
            ],
            buffer_capacity,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerHello {
    pub server_id: String,
    pub name: String,
    #[serde(default)]
    pub version: u32,
}

/// Player stream format as sent on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamPlayerFormat {
    pub codec: Codec,
    pub sample_rate: u32,
    pub channels: u16,
    pub bit_depth: u16,
    /// Base64 codec header
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub codec_header: Option<String>,
}

impl StreamPlayerFormat {
    pub fn to_format(&self) -> Result<AudioFormatSpec, CodecError> {
        let format = AudioFormatSpec::new(self.codec, self.sample_rate, self.channels, self.bit_depth);
        match &self.codec_header {
            Some(header) => {
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(header)
                    .map_err(|e| CodecError::DecoderInit(format!("invalid codec header: {e}")))?;
                Ok(format.with_codec_header(bytes))
            }
            None => Ok(format),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamStart {
    /// Absent when the stream carries no audio for players
    #[serde(default)]
    pub player: Option<StreamPlayerFormat>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlayerCommandKind {
    Volume,
    Mute,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerCommand {
    pub command: PlayerCommandKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mute: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerCommand {
    pub player: PlayerCommand,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlayerSyncState {
    Synchronized,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerState {
    pub state: PlayerSyncState,
    pub volume: u8,
    pub muted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientState {
    pub player: PlayerState,
}

/// Track metadata pushed by the server
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Metadata {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub artwork_url: Option<String>,
    /// Track length in milliseconds
    pub track_duration: Option<u64>,
    /// Playback position in milliseconds
    pub track_progress: Option<u64>,
    /// Playback speed in thousandths, 0 while paused
    pub playback_speed: Option<u32>,
}

impl From<&Metadata> for NowPlaying {
    fn from(metadata: &Metadata) -> Self {
        NowPlaying {
            title: metadata.title.clone(),
            artist: metadata.artist.clone(),
            album: metadata.album.clone(),
            artwork_url: metadata.artwork_url.clone(),
            duration: metadata.track_duration.map(Duration::from_millis),
            elapsed: metadata.track_progress.map(Duration::from_millis),
            rate: metadata.playback_speed.map(|s| s as f32 / 1000.0).unwrap_or(1.0),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerState {
    #[serde(default)]
    pub metadata: Option<Metadata>,
}
