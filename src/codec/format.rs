//! Stream format description shared by decoders and the playback engine

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Codecs a Sendspin server may stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    Pcm,
    Opus,
    Flac,
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Codec::Pcm => "pcm",
            Codec::Opus => "opus",
            Codec::Flac => "flac",
        };
        f.write_str(name)
    }
}

/// Format of one audio stream, fixed for the lifetime of a playback session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFormatSpec {
    pub codec: Codec,
    pub sample_rate: u32,
    pub channels: u16,
    pub bit_depth: u16,
    /// Out-of-band codec configuration (Opus head, FLAC STREAMINFO)
    pub codec_header: Option<Bytes>,
}

impl AudioFormatSpec {
    pub fn new(codec: Codec, sample_rate: u32, channels: u16, bit_depth: u16) -> Self {
        Self {
            codec,
            sample_rate,
            channels,
            bit_depth,
            codec_header: None,
        }
    }

    pub fn with_codec_header(mut self, header: impl Into<Bytes>) -> Self {
        self.codec_header = Some(header.into());
        self
    }

    /// Bit depth of the PCM handed to the output. Depths the pipeline
    /// cannot carry collapse to 16.
    pub fn output_bit_depth(&self) -> u16 {
        match self.bit_depth {
            16 | 24 | 32 => self.bit_depth,
            _ => 16,
        }
    }

    /// Bytes per sample in the PCM container
    pub fn bytes_per_sample(&self) -> usize {
        self.output_bit_depth() as usize / 8
    }

    /// Bytes per interleaved frame (one sample for every channel)
    pub fn bytes_per_frame(&self) -> usize {
        self.bytes_per_sample() * self.channels.max(1) as usize
    }

    /// PCM byte count covering `ms` milliseconds, frame aligned
    pub fn bytes_for_duration(&self, ms: u32) -> usize {
        let frames = self.sample_rate as u64 * ms as u64 / 1000;
        frames as usize * self.bytes_per_frame()
    }

    /// Whether an output opened for `other` can play this stream unchanged
    pub fn same_output(&self, other: &AudioFormatSpec) -> bool {
        self.sample_rate == other.sample_rate
            && self.channels == other.channels
            && self.output_bit_depth() == other.output_bit_depth()
    }
}

impl fmt::Display for AudioFormatSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}Hz/{}ch/{}bit",
            self.codec, self.sample_rate, self.channels, self.bit_depth
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_sizes() {
        let format = AudioFormatSpec::new(Codec::Pcm, 48000, 2, 24);
        assert_eq!(format.bytes_per_sample(), 3);
        assert_eq!(format.bytes_per_frame(), 6);
        assert_eq!(format.bytes_for_duration(10), 480 * 6);
    }

    #[test]
    fn test_unknown_depth_collapses_to_16() {
        let format = AudioFormatSpec::new(Codec::Opus, 48000, 2, 20);
        assert_eq!(format.output_bit_depth(), 16);
        assert_eq!(format.bytes_per_frame(), 4);
    }

    #[test]
    fn test_same_output_ignores_codec() {
        let opus = AudioFormatSpec::new(Codec::Opus, 48000, 2, 16);
        let pcm = AudioFormatSpec::new(Codec::Pcm, 48000, 2, 16);
        let flac = AudioFormatSpec::new(Codec::Flac, 44100, 2, 16);
        assert!(opus.same_output(&pcm));
        assert!(!opus.same_output(&flac));
    }
}
