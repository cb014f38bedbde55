//! Audio decoders
//!
//! Every codec implements [`AudioDecoder`]. A decoder is configured exactly
//! once per stream format, decodes one wire frame per call, and fails fast
//! when used before configuration or after release.

pub mod flac;
pub mod format;
pub mod opus;
pub mod pcm;

pub use self::flac::FlacDecoder;
pub use self::format::{AudioFormatSpec, Codec};
pub use self::opus::OpusDecoder;
pub use self::pcm::PcmPassthrough;

use bytes::Bytes;
use crate::error::CodecError;

/// Stateful codec decoder, reusable across frames of one stream
pub trait AudioDecoder: Send {
    /// Validate `format` and allocate decoder state. Must be called once
    /// before any [`decode`](AudioDecoder::decode).
    fn configure(&mut self, format: &AudioFormatSpec) -> Result<(), CodecError>;

    /// Decode one wire frame into interleaved little-endian PCM at the
    /// configured output bit depth.
    ///
    /// A frame that fails to decode yields an empty buffer; only lifecycle
    /// misuse is reported as an error.
    fn decode(&mut self, frame: &[u8]) -> Result<Bytes, CodecError>;

    /// Clear internal codec state after a discontinuity, keeping the
    /// configured decoder.
    fn reset(&mut self) -> Result<(), CodecError>;

    /// Drop decoder state. Safe to call repeatedly.
    fn release(&mut self);

    /// Frame accounting since configuration
    fn stats(&self) -> DecoderStats;
}

/// Build an unconfigured decoder for `codec`
pub fn decoder_for(codec: Codec) -> Box<dyn AudioDecoder> {
    match codec {
        Codec::Pcm => Box::new(PcmPassthrough::new()),
        Codec::Opus => Box::new(OpusDecoder::new()),
        Codec::Flac => Box::new(FlacDecoder::new()),
    }
}

/// Decoder statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecoderStats {
    pub frames_decoded: u64,
    /// Frames that failed to decode and were replaced by silence
    pub frames_dropped: u64,
    pub bytes_produced: u64,
}

impl DecoderStats {
    pub fn loss_rate(&self) -> f32 {
        let total = self.frames_decoded + self.frames_dropped;
        if total == 0 {
            0.0
        } else {
            self.frames_dropped as f32 / total as f32
        }
    }
}

/// Configure-once lifecycle shared by the decoder implementations
#[derive(Debug, Default)]
pub(crate) enum Lifecycle<T> {
    #[default]
    Unconfigured,
    Ready(T),
    Released,
}

impl<T> Lifecycle<T> {
    /// Check that a configure call is legal
    pub(crate) fn ensure_configurable(&self) -> Result<(), CodecError> {
        match self {
            Lifecycle::Unconfigured => Ok(()),
            Lifecycle::Ready(_) => Err(CodecError::AlreadyConfigured),
            Lifecycle::Released => Err(CodecError::Released),
        }
    }

    pub(crate) fn ready_mut(&mut self) -> Result<&mut T, CodecError> {
        match self {
            Lifecycle::Ready(state) => Ok(state),
            Lifecycle::Unconfigured => Err(CodecError::NotConfigured),
            Lifecycle::Released => Err(CodecError::Released),
        }
    }

    pub(crate) fn release(&mut self) {
        *self = Lifecycle::Released;
    }
}

/// Append `sample` (full-scale i32) to `out` as little-endian PCM of
/// `bit_depth` bits.
pub(crate) fn push_sample_i32(out: &mut Vec<u8>, sample: i32, bit_depth: u16) {
    match bit_depth {
        24 => out.extend_from_slice(&(sample >> 8).to_le_bytes()[..3]),
        32 => out.extend_from_slice(&sample.to_le_bytes()),
        _ => out.extend_from_slice(&((sample >> 16) as i16).to_le_bytes()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factory_covers_all_codecs() {
        for codec in [Codec::Pcm, Codec::Opus, Codec::Flac] {
            let mut decoder = decoder_for(codec);
            assert_eq!(decoder.decode(&[0u8; 4]), Err(CodecError::NotConfigured));
        }
    }

    #[test]
    fn test_push_sample_widths() {
        let mut out = Vec::new();
        push_sample_i32(&mut out, 0x1234_5678, 16);
        assert_eq!(out, vec![0x34, 0x12]);

        out.clear();
        push_sample_i32(&mut out, 0x1234_5678, 24);
        assert_eq!(out, vec![0x56, 0x34, 0x12]);

        out.clear();
        push_sample_i32(&mut out, -1, 32);
        assert_eq!(out, vec![0xFF; 4]);
    }

    #[test]
    fn test_loss_rate() {
        let stats = DecoderStats {
            frames_decoded: 3,
            frames_dropped: 1,
            bytes_produced: 0,
        };
        assert!((stats.loss_rate() - 0.25).abs() < f32::EPSILON);
        assert_eq!(DecoderStats::default().loss_rate(), 0.0);
    }
}
